//! OS memory readers backing the governor's telemetry traits.
//!
//! - **Linux**: `/proc/<pid>/status` (VmRSS) and `/proc/meminfo`
//! - **macOS**: `ps -o rss=`, `sysctl` and `vm_stat` (safe, no FFI)
//! - **Other**: every reading is empty, so nothing is ever killed

use std::time::{SystemTime, UNIX_EPOCH};

use crate::ids::ProcessId;
use crate::memory_pressure::{MemoryConfig, MemoryTelemetry, ThresholdSource, ThresholdTable};

/// Wall-clock milliseconds since the Unix epoch.
#[must_use]
pub fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .ok()
        .and_then(|d| u64::try_from(d.as_millis()).ok())
        .unwrap_or(0)
}

/// Telemetry read straight from the OS.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcTelemetry;

impl MemoryTelemetry for ProcTelemetry {
    fn process_rss_kb(&self, pid: ProcessId) -> Option<u64> {
        read_process_rss_kb(pid.0)
    }

    fn self_rss_kb(&self) -> Option<u64> {
        read_process_rss_kb(std::process::id())
    }
}

/// Threshold table derived from system-wide memory usage.
#[derive(Debug, Clone)]
pub struct MeminfoThresholds {
    config: MemoryConfig,
}

impl MeminfoThresholds {
    #[must_use]
    pub fn new(config: MemoryConfig) -> Self {
        Self { config }
    }
}

impl ThresholdSource for MeminfoThresholds {
    fn thresholds(&self) -> ThresholdTable {
        let (total_kb, available_kb) = read_memory_info();
        if total_kb == 0 {
            return ThresholdTable::default();
        }
        let used_mb = total_kb.saturating_sub(available_kb) / 1024;
        ThresholdTable::from_usage(used_mb, total_kb / 1024, &self.config)
    }
}

// =============================================================================
// Per-process RSS
// =============================================================================

/// Resident set size of `pid` in KB, or `None` when the process is gone.
#[must_use]
pub fn read_process_rss_kb(pid: u32) -> Option<u64> {
    #[cfg(target_os = "linux")]
    {
        let contents = std::fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
        parse_status_rss_kb(&contents)
    }
    #[cfg(target_os = "macos")]
    {
        let ps = std::process::Command::new("ps")
            .args(["-o", "rss=", "-p", &pid.to_string()])
            .output()
            .ok()?;
        if !ps.status.success() {
            return None;
        }
        String::from_utf8_lossy(&ps.stdout).trim().parse().ok()
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        let _ = pid;
        None
    }
}

/// Extract the VmRSS value (KB) from `/proc/<pid>/status` text.
///
/// Kernel threads have no VmRSS line and yield `None`.
#[must_use]
pub fn parse_status_rss_kb(status: &str) -> Option<u64> {
    status.lines().find_map(|line| {
        let rest = line.strip_prefix("VmRSS:")?;
        rest.split_whitespace().next()?.parse().ok()
    })
}

// =============================================================================
// System memory
// =============================================================================

/// Total and available memory in KB, `(0, 0)` when unknown.
#[must_use]
pub fn read_memory_info() -> (u64, u64) {
    #[cfg(target_os = "linux")]
    {
        std::fs::read_to_string("/proc/meminfo")
            .map(|contents| parse_meminfo(&contents))
            .unwrap_or((0, 0))
    }
    #[cfg(target_os = "macos")]
    {
        (read_macos_total_memory(), read_macos_available_memory())
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        (0, 0)
    }
}

/// Parse `MemTotal` and `MemAvailable` out of `/proc/meminfo` text.
#[must_use]
pub fn parse_meminfo(contents: &str) -> (u64, u64) {
    let mut total_kb = 0u64;
    let mut available_kb = 0u64;

    for line in contents.lines() {
        if let Some(val) = line.strip_prefix("MemTotal:") {
            total_kb = parse_meminfo_value(val);
        } else if let Some(val) = line.strip_prefix("MemAvailable:") {
            available_kb = parse_meminfo_value(val);
        }
    }

    (total_kb, available_kb)
}

fn parse_meminfo_value(s: &str) -> u64 {
    s.trim()
        .trim_end_matches("kB")
        .trim()
        .parse::<u64>()
        .unwrap_or(0)
}

#[cfg(target_os = "macos")]
fn read_macos_total_memory() -> u64 {
    std::process::Command::new("sysctl")
        .args(["-n", "hw.memsize"])
        .output()
        .ok()
        .and_then(|o| String::from_utf8(o.stdout).ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map_or(0, |bytes| bytes / 1024)
}

/// Free + inactive + purgeable pages, in KB.
#[cfg(target_os = "macos")]
fn read_macos_available_memory() -> u64 {
    let Some(output) = std::process::Command::new("vm_stat")
        .output()
        .ok()
        .and_then(|o| String::from_utf8(o.stdout).ok())
    else {
        return 0;
    };

    // "Mach Virtual Memory Statistics: (page size of 16384 bytes)"
    let page_size = output
        .lines()
        .next()
        .and_then(|line| {
            let start = line.find("page size of ")? + 13;
            let end = line[start..].find(' ')? + start;
            line[start..end].parse::<u64>().ok()
        })
        .unwrap_or(16384);

    let mut pages = 0u64;
    for line in output.lines() {
        for prefix in ["Pages free:", "Pages inactive:", "Pages purgeable:"] {
            if let Some(val) = line.strip_prefix(prefix) {
                pages += val.trim().trim_end_matches('.').parse::<u64>().unwrap_or(0);
            }
        }
    }
    (pages * page_size) / 1024
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_vmrss_line() {
        let status = "Name:\tmail\nVmPeak:\t  9000 kB\nVmRSS:\t   81920 kB\nThreads:\t4\n";
        assert_eq!(parse_status_rss_kb(status), Some(81_920));
    }

    #[test]
    fn missing_vmrss_is_none() {
        assert_eq!(parse_status_rss_kb("Name:\tkthreadd\n"), None);
    }

    #[test]
    fn parses_meminfo_fields() {
        let meminfo = "MemTotal:       16384000 kB\nMemFree:  100 kB\nMemAvailable:    8192000 kB\n";
        assert_eq!(parse_meminfo(meminfo), (16_384_000, 8_192_000));
    }

    #[test]
    fn garbage_meminfo_is_zero() {
        assert_eq!(parse_meminfo("MemTotal: lots\n"), (0, 0));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn self_rss_is_readable() {
        let rss = ProcTelemetry.self_rss_kb();
        assert!(rss.is_some_and(|kb| kb > 0));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn meminfo_thresholds_are_ordered() {
        let table = MeminfoThresholds::new(MemoryConfig::default()).thresholds();
        assert!(table.normal.limit_mb <= table.low.limit_mb);
        assert!(table.low.limit_mb <= table.critical.limit_mb);
        assert!(table.critical.limit_mb <= table.reboot.limit_mb);
    }

    #[test]
    fn epoch_ms_is_nonzero() {
        assert!(epoch_ms() > 0);
    }
}
