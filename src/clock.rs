//! Monotonic millisecond clock used for per-field update timestamps

use nix::time::{clock_gettime, ClockId};

/// Milliseconds since the monotonic epoch, nanoseconds rounded to the
/// nearest millisecond.
pub fn monotonic_ms() -> u64 {
    match clock_gettime(ClockId::CLOCK_MONOTONIC) {
        Ok(ts) => ts.tv_sec() as u64 * 1000 + (ts.tv_nsec() as u64 + 500_000) / 1_000_000,
        Err(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_ms_advances() {
        let a = monotonic_ms();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let b = monotonic_ms();
        assert!(b >= a + 4);
    }
}
