use std::net::Ipv4Addr;
use anyhow::{bail, Context};

/// Smallest/largest addresses accepted as multicast groups. The low
/// administrative block starts at 224.0.0.1 (224.0.0.0 is reserved).
pub const MIN_MC_IP: u32 = 0xE000_0001;
pub const MAX_MC_IP: u32 = 0xEFFF_FFFF;

/// Hard ceiling for the aggregate send rate (pps summed over all groups).
pub const MAX_AGGREGATE_RATE: u64 = 1_000_000;

pub const MIN_PORT: u16 = 1024;
pub const MAX_PORT: u16 = 49151;

#[derive(Debug, Clone, Copy, Eq, PartialEq, clap::ValueEnum)]
pub enum Role {
    Producer,
    Consumer,
}

/// Validated, immutable run configuration. Built by the CLI layer; everything
/// past `validate()` can rely on these values being in range.
#[derive(Debug, Clone)]
pub struct BenchConfig {
    pub role: Role,
    /// Multicast groups to produce to / consume from.
    pub groups: Vec<Ipv4Addr>,
    pub port: u16,
    /// IPv4 address of the local interface to join/send on.
    pub interface_addr: Ipv4Addr,
    /// Stop after this many packets in total. 0 = unbounded.
    pub total_packets: u64,
    /// Stop after this many seconds. 0 = unbounded.
    pub run_secs: u64,
    /// Target send rate per group in packets/sec (producer only).
    pub rate_pps: u64,
}

impl BenchConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.groups.is_empty() {
            bail!("at least one multicast group is required");
        }
        for group in &self.groups {
            let raw = u32::from(*group);
            if !(MIN_MC_IP..=MAX_MC_IP).contains(&raw) {
                bail!(
                    "invalid multicast group {}: expected a value between 224.0.0.1 and 239.255.255.255",
                    group
                );
            }
        }
        if !(MIN_PORT..=MAX_PORT).contains(&self.port) {
            bail!(
                "invalid multicast port {}: expected a value between {} and {}",
                self.port, MIN_PORT, MAX_PORT
            );
        }
        if self.role == Role::Producer {
            if self.rate_pps < 1 {
                bail!("invalid packet rate: expected at least 1 pps");
            }
            let aggregate = self.rate_pps.saturating_mul(self.groups.len() as u64);
            if aggregate > MAX_AGGREGATE_RATE {
                bail!(
                    "invalid packet rate: {} pps over {} groups exceeds the {} pps ceiling",
                    self.rate_pps, self.groups.len(), MAX_AGGREGATE_RATE
                );
            }
        }
        Ok(())
    }
}

/// Parse a single multicast address or an inclusive range `a.b.c.d-e.f.g.h`
/// into the list of group addresses.
pub fn parse_group_range(range: &str) -> anyhow::Result<Vec<Ipv4Addr>> {
    let (from, till) = match range.split_once('-') {
        Some((from, till)) => (
            from.trim().parse::<Ipv4Addr>()
                .with_context(|| format!("invalid multicast address '{}'", from))?,
            till.trim().parse::<Ipv4Addr>()
                .with_context(|| format!("invalid multicast address '{}'", till))?,
        ),
        None => {
            let addr = range.trim().parse::<Ipv4Addr>()
                .with_context(|| format!("invalid multicast address '{}'", range))?;
            (addr, addr)
        }
    };

    let (from, till) = (u32::from(from), u32::from(till));
    if from > till {
        bail!("invalid multicast range: start address is above end address");
    }

    Ok((from..=till).map(Ipv4Addr::from).collect())
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    fn consumer_config() -> BenchConfig {
        BenchConfig {
            role: Role::Consumer,
            groups: vec![Ipv4Addr::new(239, 5, 69, 2)],
            port: 10000,
            interface_addr: Ipv4Addr::new(192, 168, 1, 10),
            total_packets: 0,
            run_secs: 0,
            rate_pps: 1,
        }
    }

    #[rstest]
    #[case::single("239.5.69.2", vec![Ipv4Addr::new(239, 5, 69, 2)])]
    #[case::pair("239.5.69.2-239.5.69.3", vec![Ipv4Addr::new(239, 5, 69, 2), Ipv4Addr::new(239, 5, 69, 3)])]
    #[case::degenerate_range("239.5.69.2-239.5.69.2", vec![Ipv4Addr::new(239, 5, 69, 2)])]
    fn test_parse_group_range(#[case] range: &str, #[case] expected: Vec<Ipv4Addr>) {
        assert_eq!(parse_group_range(range).unwrap(), expected);
    }

    #[rstest]
    #[case::garbage("not-an-address")]
    #[case::reversed("239.5.69.3-239.5.69.2")]
    #[case::half_range("239.5.69.2-")]
    fn test_parse_group_range_invalid(#[case] range: &str) {
        assert!(parse_group_range(range).is_err());
    }

    #[test]
    fn test_validate_ok() {
        assert!(consumer_config().validate().is_ok());
    }

    #[rstest]
    #[case::unicast(Ipv4Addr::new(10, 0, 0, 1))]
    #[case::reserved_base(Ipv4Addr::new(224, 0, 0, 0))]
    #[case::above_window(Ipv4Addr::new(240, 0, 0, 1))]
    fn test_validate_rejects_non_multicast(#[case] group: Ipv4Addr) {
        let mut config = consumer_config();
        config.groups = vec![group];
        assert!(config.validate().is_err());
    }

    #[rstest]
    #[case::below(1023)]
    #[case::above(49152)]
    fn test_validate_rejects_bad_port(#[case] port: u16) {
        let mut config = consumer_config();
        config.port = port;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_rate_producer() {
        let mut config = consumer_config();
        config.role = Role::Producer;
        config.rate_pps = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_aggregate_rate_above_ceiling() {
        let mut config = consumer_config();
        config.role = Role::Producer;
        config.groups = parse_group_range("239.5.69.1-239.5.69.4").unwrap();
        config.rate_pps = 300_000;
        assert!(config.validate().is_err());

        config.rate_pps = 250_000;
        assert!(config.validate().is_ok());
    }
}
