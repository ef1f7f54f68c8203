use std::time::{Duration, SystemTime};
use libc::{clock_gettime, timespec, CLOCK_MONOTONIC};

pub const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Raw CLOCK_MONOTONIC reading in nanoseconds.
///
/// CLOCK_MONOTONIC rather than CLOCK_MONOTONIC_RAW: ppoll() timeouts are
/// measured against it, so deadlines computed here line up with the waits.
pub fn monotonic_ns() -> u64 {
    unsafe {
        let mut ts: timespec = std::mem::zeroed();
        if clock_gettime(CLOCK_MONOTONIC, &mut ts) == 0 {
            (ts.tv_sec as u64) * NANOS_PER_SEC + (ts.tv_nsec as u64)
        } else {
            // fallback
            let now = SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_else(|_| Duration::from_secs(0));
            now.as_secs() * NANOS_PER_SEC + u64::from(now.subsec_nanos())
        }
    }
}

/// Per-run clock. All timestamps handed to the scheduler and the protocol
/// state machines are nanoseconds since the epoch captured in [`Clock::new`].
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    epoch: u64,
}

impl Clock {
    pub fn new() -> Self {
        Self { epoch: monotonic_ns() }
    }

    pub fn now(&self) -> u64 {
        monotonic_ns().saturating_sub(self.epoch)
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/// `1h 02m 03.456s`, as used in progress reports.
pub fn format_elapsed(nanos: u64) -> String {
    let secs = nanos as f64 * 1e-9;
    let h = (secs / 3600.0).floor() as u64;
    let m = ((secs % 3600.0) / 60.0).floor() as u64;
    let s = secs % 60.0;
    format!("{}h {:02}m {:06.3}s", h, m, s)
}

/// Decimal seconds with microsecond precision, as written by the stream adapter.
pub fn format_decimal_seconds(nanos: u64) -> String {
    format!("{:.6}", nanos as f64 * 1e-9)
}

/// Parse a strictly positive decimal number of seconds into nanoseconds.
pub fn parse_decimal_seconds(s: &str) -> anyhow::Result<u64> {
    let secs: f64 = s
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("'{}': invalid number", s))?;
    if !secs.is_finite() || secs <= 0.0 {
        return Err(anyhow::anyhow!("'{}': must be positive", s));
    }
    Ok((secs * 1e9).round() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_is_monotonic_and_starts_near_zero() {
        let clock = Clock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
        assert!(a < NANOS_PER_SEC);
    }

    #[test]
    fn elapsed_formatting() {
        assert_eq!(format_elapsed(0), "0h 00m 00.000s");
        assert_eq!(format_elapsed(3_723_456_000_000), "1h 02m 03.456s");
    }

    #[test]
    fn decimal_seconds() {
        assert_eq!(parse_decimal_seconds("0.1").unwrap(), 100_000_000);
        assert_eq!(parse_decimal_seconds("10").unwrap(), 10 * NANOS_PER_SEC);
        assert!(parse_decimal_seconds("0").is_err());
        assert!(parse_decimal_seconds("-1").is_err());
        assert!(parse_decimal_seconds("abc").is_err());
        assert_eq!(format_decimal_seconds(1_500_000), "0.001500");
    }
}
