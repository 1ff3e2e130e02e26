use anyhow::{bail, Result};
use nix::time::{clock_gettime, ClockId};

/// Returns the monotonic timestamp in nanoseconds.
pub(crate) fn monotonic_timestamp() -> Result<u64> {
    let monotonic = clock_gettime(ClockId::CLOCK_MONOTONIC)?;

    let ts = monotonic.tv_sec() * 1000000000 + monotonic.tv_nsec();
    if ts < 0 {
        bail!("Monotonic timestamp is negative: {ts}");
    }

    Ok(ts as u64)
}

/// Computes and returns the offset of CLOCK_MONOTONIC to the wall-clock time,
/// in nanoseconds.
pub(crate) fn monotonic_clock_offset() -> Result<i64> {
    let realtime = clock_gettime(ClockId::CLOCK_REALTIME)?;
    let monotonic = clock_gettime(ClockId::CLOCK_MONOTONIC)?;
    let offset = realtime - monotonic;

    Ok(offset.tv_sec() * 1000000000 + offset.tv_nsec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_is_increasing() {
        let first = monotonic_timestamp().unwrap();
        let second = monotonic_timestamp().unwrap();

        assert!(second >= first);
    }
}
