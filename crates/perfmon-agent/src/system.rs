//! Process and thread probes
//!
//! Every probe degrades to `None` on platforms (or sandboxes) where the
//! underlying source is unavailable; callers report those as zero.

use std::time::Duration;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Current resident set size in bytes
pub fn rss_bytes() -> Option<u64> {
    #[cfg(target_os = "linux")]
    {
        let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
        let rss_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if page_size <= 0 {
            return None;
        }
        Some(rss_pages * page_size as u64)
    }

    #[cfg(target_os = "macos")]
    {
        let output = std::process::Command::new("ps")
            .args(["-o", "rss=", "-p", &std::process::id().to_string()])
            .output()
            .ok()?;
        let rss_kb: u64 = String::from_utf8_lossy(&output.stdout)
            .trim()
            .parse()
            .ok()?;
        Some(rss_kb * 1024)
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

/// Peak resident set size of the process in bytes
pub fn peak_rss_bytes() -> Option<u64> {
    #[cfg(unix)]
    {
        let mut usage = std::mem::MaybeUninit::<libc::rusage>::zeroed();
        let rc = unsafe { libc::getrusage(libc::RUSAGE_SELF, usage.as_mut_ptr()) };
        if rc != 0 {
            return None;
        }
        let max_rss = unsafe { usage.assume_init() }.ru_maxrss;
        if max_rss < 0 {
            return None;
        }
        // ru_maxrss is bytes on macOS, kilobytes elsewhere
        if cfg!(target_os = "macos") {
            Some(max_rss as u64)
        } else {
            Some(max_rss as u64 * 1024)
        }
    }

    #[cfg(not(unix))]
    {
        None
    }
}

/// CPU time consumed by the calling thread
pub fn thread_cpu_time() -> Option<Duration> {
    #[cfg(any(target_os = "linux", target_os = "macos"))]
    {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        let rc = unsafe { libc::clock_gettime(libc::CLOCK_THREAD_CPUTIME_ID, &mut ts) };
        if rc != 0 || ts.tv_sec < 0 || ts.tv_nsec < 0 {
            return None;
        }
        Some(Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32))
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

/// Convert a byte count to megabytes
pub fn megabytes(bytes: u64) -> f64 {
    bytes as f64 / BYTES_PER_MB
}

/// Signed difference between two byte counts, in megabytes
pub fn delta_megabytes(before: u64, after: u64) -> f64 {
    (after as f64 - before as f64) / BYTES_PER_MB
}

/// Short description of the host platform, e.g. `linux x86_64`
pub fn server_info() -> String {
    format!("{} {}", std::env::consts::OS, std::env::consts::ARCH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(any(target_os = "linux", target_os = "macos"))]
    fn test_rss_is_reported() {
        let rss = rss_bytes().unwrap();
        assert!(rss > 0);
    }

    #[test]
    #[cfg(unix)]
    fn test_peak_rss_covers_current() {
        let peak = peak_rss_bytes().unwrap();
        assert!(peak > 0);
    }

    #[test]
    #[cfg(any(target_os = "linux", target_os = "macos"))]
    fn test_thread_cpu_time_advances() {
        let before = thread_cpu_time().unwrap();
        let mut acc = 0u64;
        for i in 0..2_000_000u64 {
            acc = acc.wrapping_add(i * i);
        }
        std::hint::black_box(acc);
        let after = thread_cpu_time().unwrap();
        assert!(after >= before);
    }

    #[test]
    fn test_megabyte_conversions() {
        assert_eq!(megabytes(1024 * 1024), 1.0);
        assert_eq!(delta_megabytes(3 * 1024 * 1024, 1024 * 1024), -2.0);
    }

    #[test]
    fn test_server_info() {
        let info = server_info();
        assert!(info.contains(std::env::consts::OS));
        assert!(info.contains(std::env::consts::ARCH));
    }
}
