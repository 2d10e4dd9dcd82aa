use std::time::Duration;

use tracing::debug;

/// Slowest capture or publish rate accepted, one frame every ~17 minutes
pub const MIN_RATE_HZ: f64 = 0.001;

/// Period of a rate in Hz, with the rate floored at [`MIN_RATE_HZ`]
pub fn rate_period(rate_hz: f64) -> Duration {
    Duration::from_secs_f64(1.0 / rate_hz.max(MIN_RATE_HZ))
}

/// Currently free physical memory in bytes, if the platform can tell us
#[cfg(target_os = "linux")]
pub fn free_memory_bytes() -> Option<u64> {
    let mut info = std::mem::MaybeUninit::<libc::sysinfo>::zeroed();

    // SAFETY: sysinfo(2) only writes into the struct we hand it
    let rc = unsafe { libc::sysinfo(info.as_mut_ptr()) };
    if rc != 0 {
        debug!("sysinfo failed: {}", std::io::Error::last_os_error());
        return None;
    }

    // SAFETY: zero-initialised and filled in by a successful sysinfo call
    let info = unsafe { info.assume_init() };
    Some(info.freeram as u64 * info.mem_unit.max(1) as u64)
}

#[cfg(not(target_os = "linux"))]
pub fn free_memory_bytes() -> Option<u64> {
    debug!("Free memory query not supported on this platform");
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_period_bounded() {
        assert_eq!(rate_period(4.0), Duration::from_millis(250));
        for rate in [1e-300, -5.0, f64::NAN] {
            let secs = rate_period(rate).as_secs_f64();
            assert!((secs - 1000.0).abs() < 1e-6, "{rate} -> {secs}");
        }
        assert_eq!(rate_period(f64::INFINITY), Duration::ZERO);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_free_memory_reported() {
        let free = free_memory_bytes().unwrap();
        assert!(free > 0);
    }
}
