use std::time::{Instant, SystemTime};

/// Nanoseconds since the Unix epoch.
///
/// The wire timestamp and the report/tuning schedules all work on this clock.
pub fn now_unix_nanos() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Busy-wait for `nanos` nanoseconds.
///
/// OS sleep granularity is far too coarse for per-round pacing at the target
/// rates, so this is a bounded spin. Durations at or below 1us are not worth
/// spinning for and return immediately.
pub fn spin(nanos: u64) {
    if nanos <= 1_000 {
        return;
    }
    let start = Instant::now();
    loop {
        if start.elapsed().as_nanos() as u64 >= nanos {
            break;
        }
        std::hint::spin_loop();
    }
}

/// Round `value` up to the next multiple of `multiple`.
pub fn round_up(value: usize, multiple: usize) -> usize {
    let down = (value / multiple) * multiple;
    if value % multiple > 0 {
        down + multiple
    } else {
        down
    }
}

/// Format a value with an SI suffix for the report table, e.g. `1.5M`.
pub fn format_si(value: f64) -> String {
    let (scaled, suffix) = if value >= 1e9 {
        (value / 1e9, "G")
    } else if value >= 1e6 {
        (value / 1e6, "M")
    } else if value >= 1e3 {
        (value / 1e3, "K")
    } else {
        (value, "")
    };
    format!("{:.1}{}", scaled, suffix)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::exact(4096, 4096, 4096)]
    #[case::below(4095, 4096, 4096)]
    #[case::above(4097, 4096, 8192)]
    #[case::zero(0, 4096, 0)]
    #[case::small_multiple(10, 4, 12)]
    fn test_round_up(#[case] value: usize, #[case] multiple: usize, #[case] expected: usize) {
        assert_eq!(round_up(value, multiple), expected);
    }

    #[rstest]
    #[case::plain(999.0, "999.0")]
    #[case::kilo(1_500.0, "1.5K")]
    #[case::mega(2_000_000.0, "2.0M")]
    #[case::giga(3_200_000_000.0, "3.2G")]
    fn test_format_si(#[case] value: f64, #[case] expected: &str) {
        assert_eq!(format_si(value), expected);
    }

    #[test]
    fn test_spin_short_circuit() {
        let start = Instant::now();
        spin(500);
        assert!(start.elapsed().as_millis() < 50);
    }

    #[test]
    fn test_spin_waits() {
        let start = Instant::now();
        spin(2_000_000);
        assert!(start.elapsed().as_nanos() >= 2_000_000);
    }
}
