//! High-rate multicast UDP benchmark with a producer role and a consumer role.
//!
//! Both roles run on the same completion-based session: buffers are allocated
//! once up front into registered regions, I/O requests are posted against
//! fixed buffer descriptors, and a single I/O thread drains completions in
//! batches and recycles each descriptor straight back into the next request.
//! No per-packet allocation happens on the hot path.
//!
//! The producer sends to every configured group round-robin, all groups of a
//! round carrying the same sequence number, and paces itself with a busy-spin
//! per round whose length a closed-loop controller adjusts against the target
//! rate. The consumer keeps a large window of receives posted, tracks
//! per-source sequence numbers to estimate drops and reordering, and reports
//! periodically.
//!
//! Datagrams carry a fixed 100-byte payload starting with a 20-byte header,
//! all fields little-endian: a protocol token (u16), a command type (u8), a
//! tag (u8), the sequence number (u64) and a send timestamp in UNIX
//! nanoseconds (u64).

pub mod config;
pub mod consumer;
pub mod producer;
pub mod session;
pub mod stats;
pub mod util;
pub mod wire;


#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
