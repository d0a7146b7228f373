use anyhow::bail;
use bytes::{Buf, BufMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Fixed size of every datagram this benchmark sends and expects to receive.
/// The header sits at the start; the rest is unspecified filler.
pub const PAYLOAD_SIZE: usize = 100;

/// Magic tag identifying benchmark traffic.
pub const TOKEN: u16 = 490;

#[derive(Debug, Clone, Copy, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum CmdType {
    Data = 0,
}

/// The packed wire header at the start of every datagram.
///
/// All numbers little-endian, no padding:
/// ```ascii
///  0: token (u16) - magic tag, 490
///  2: cmd (u8) - packet kind
///  3: tag (u8) - reserved, 0
///  4: seq (u64) - per-group monotonically increasing sequence number
/// 12: timestamp (u64) - nanos since epoch at send time
/// ```
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ProtocolHeader {
    pub token: u16,
    pub cmd: CmdType,
    pub tag: u8,
    pub seq: u64,
    pub timestamp: u64,
}

impl ProtocolHeader {
    pub const SERIALIZED_LEN: usize = 20;

    pub fn new(seq: u64, timestamp: u64) -> ProtocolHeader {
        ProtocolHeader {
            token: TOKEN,
            cmd: CmdType::Data,
            tag: 0,
            seq,
            timestamp,
        }
    }

    pub fn ser(&self, mut buf: impl BufMut) {
        buf.put_u16_le(self.token);
        buf.put_u8(self.cmd.into());
        buf.put_u8(self.tag);
        buf.put_u64_le(self.seq);
        buf.put_u64_le(self.timestamp);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<ProtocolHeader> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            bail!("buffer too short for protocol header");
        }

        let token = buf.get_u16_le();
        let cmd = match CmdType::try_from(buf.get_u8()) {
            Ok(cmd) => cmd,
            Err(e) => bail!("invalid cmd type: {}", e),
        };
        let tag = buf.get_u8();
        let seq = buf.get_u64_le();
        let timestamp = buf.get_u64_le();

        Ok(ProtocolHeader {
            token,
            cmd,
            tag,
            seq,
            timestamp,
        })
    }

    /// Overwrite the sequence and timestamp fields of an already serialized
    /// header in place. This is the per-completion fast path on the producer
    /// side - the token/cmd/tag prefix never changes after the initial fill.
    pub fn patch_seq_and_timestamp(buf: &mut [u8], seq: u64, timestamp: u64) {
        buf[4..12].copy_from_slice(&seq.to_le_bytes());
        buf[12..20].copy_from_slice(&timestamp.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[test]
    fn test_wire_layout() {
        let mut buf = Vec::new();
        ProtocolHeader::new(0x0102_0304_0506_0708, 0x1112_1314_1516_1718).ser(&mut buf);

        assert_eq!(buf.len(), ProtocolHeader::SERIALIZED_LEN);
        assert_eq!(&buf[0..2], &490u16.to_le_bytes());
        assert_eq!(buf[2], 0);
        assert_eq!(buf[3], 0);
        assert_eq!(&buf[4..12], &0x0102_0304_0506_0708u64.to_le_bytes());
        assert_eq!(&buf[12..20], &0x1112_1314_1516_1718u64.to_le_bytes());
    }

    #[rstest]
    #[case::zero(0, 0)]
    #[case::simple(17, 1_000_000_007)]
    #[case::max(u64::MAX, u64::MAX)]
    fn test_ser_deser_round_trip(#[case] seq: u64, #[case] timestamp: u64) {
        let header = ProtocolHeader::new(seq, timestamp);

        let mut buf = Vec::new();
        header.ser(&mut buf);

        let deserialized = ProtocolHeader::deser(&mut buf.as_slice()).unwrap();
        assert_eq!(deserialized, header);
    }

    #[test]
    fn test_deser_too_short() {
        let buf = [0u8; ProtocolHeader::SERIALIZED_LEN - 1];
        assert!(ProtocolHeader::deser(&mut &buf[..]).is_err());
    }

    #[test]
    fn test_deser_invalid_cmd() {
        let mut buf = Vec::new();
        ProtocolHeader::new(1, 2).ser(&mut buf);
        buf[2] = 0xff;
        assert!(ProtocolHeader::deser(&mut buf.as_slice()).is_err());
    }

    #[test]
    fn test_patch_seq_and_timestamp() {
        let mut buf = vec![0u8; PAYLOAD_SIZE];
        ProtocolHeader::new(1, 2).ser(&mut &mut buf[..]);

        ProtocolHeader::patch_seq_and_timestamp(&mut buf, 42, 43);

        let patched = ProtocolHeader::deser(&mut &buf[..]).unwrap();
        assert_eq!(patched.token, TOKEN);
        assert_eq!(patched.seq, 42);
        assert_eq!(patched.timestamp, 43);
    }
}
