//! `/proc` readers for the telemetry snapshot.
//!
//! Per-PID CPU time comes from `/proc/<pid>/stat` (user and kernel jiffies,
//! fields 14 and 15), memory from the `VmRSS` line of `/proc/<pid>/status`,
//! identity from the `Uid:` line, the `exe` symlink and `comm`. System memory
//! comes from `/proc/meminfo`. All readers parse leniently: a vanished
//! process mid-scan is normal, not an error worth surfacing.

use std::fs;
use std::io;
use std::time::Duration;

/// Jiffies per second assumed for CPU sampling.
const CLOCK_TICKS: f64 = 100.0;

/// User and kernel mode jiffies of a process.
///
/// # Errors
///
/// Returns an error when `/proc/<pid>/stat` cannot be read, typically because
/// the process exited.
pub fn cpu_time(pid: i32) -> io::Result<(f64, f64)> {
    let data = fs::read_to_string(format!("/proc/{pid}/stat"))?;
    Ok(parse_stat_cpu(&data))
}

/// CPU usage percent of a process, sampled over `gap`.
///
/// Reads the jiffies counters twice with a blocking sleep in between; call
/// this from a blocking-friendly context.
///
/// # Errors
///
/// Returns an error when the first sample cannot be read. A process that
/// vanishes between the samples reports zero usage.
pub fn sample_cpu_percent(pid: i32, gap: Duration) -> io::Result<i64> {
    let (user1, sys1) = cpu_time(pid)?;
    std::thread::sleep(gap);
    let (user2, sys2) = cpu_time(pid).unwrap_or((user1, sys1));

    #[allow(clippy::cast_possible_truncation)]
    Ok((((user2 + sys2) - (user1 + sys1)) / CLOCK_TICKS * 100.0) as i64)
}

/// Resident set size of a process in bytes.
///
/// # Errors
///
/// Returns an error when `/proc/<pid>/status` cannot be read. A missing
/// `VmRSS` line (kernel threads) reports zero.
pub fn memory_usage(pid: i32) -> io::Result<u64> {
    let data = fs::read_to_string(format!("/proc/{pid}/status"))?;
    Ok(parse_status_kb(&data, "VmRSS:").unwrap_or(0) * 1024)
}

/// Real UID of a process.
///
/// # Errors
///
/// Returns an error when the status file cannot be read or carries no `Uid:`
/// line.
pub fn uid(pid: i32) -> io::Result<u32> {
    let data = fs::read_to_string(format!("/proc/{pid}/status"))?;
    parse_status_uid(&data)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, format!("no Uid for pid {pid}")))
}

/// Target of the `/proc/<pid>/exe` symlink, or `-` when unreadable.
#[must_use]
pub fn binary_path(pid: i32) -> String {
    fs::read_link(format!("/proc/{pid}/exe"))
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "-".to_string())
}

/// The `comm` name of a process, or `-` when unreadable.
#[must_use]
pub fn binary_name(pid: i32) -> String {
    fs::read_to_string(format!("/proc/{pid}/comm"))
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "-".to_string())
}

/// Total physical memory in bytes.
///
/// # Errors
///
/// Returns an error when `/proc/meminfo` cannot be read or has no `MemTotal`
/// line.
pub fn memory_total() -> io::Result<u64> {
    let data = fs::read_to_string("/proc/meminfo")?;
    parse_status_kb(&data, "MemTotal:")
        .map(|kb| kb * 1024)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "MemTotal not found"))
}

/// All currently running PIDs, from the numeric entries of `/proc`.
///
/// # Errors
///
/// Returns an error when `/proc` itself cannot be listed.
pub fn list_pids() -> io::Result<Vec<i32>> {
    let mut pids = Vec::new();
    for entry in fs::read_dir("/proc")? {
        let entry = entry?;
        if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }
        if let Ok(pid) = entry.file_name().to_string_lossy().parse::<i32>() {
            pids.push(pid);
        }
    }
    Ok(pids)
}

fn parse_stat_cpu(stat: &str) -> (f64, f64) {
    let fields: Vec<&str> = stat.split_whitespace().collect();
    let utime = fields.get(13).and_then(|f| f.parse().ok()).unwrap_or(0.0);
    let stime = fields.get(14).and_then(|f| f.parse().ok()).unwrap_or(0.0);
    (utime, stime)
}

fn parse_status_kb(status: &str, key: &str) -> Option<u64> {
    status
        .lines()
        .find(|line| line.starts_with(key))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|kb| kb.parse().ok())
}

fn parse_status_uid(status: &str) -> Option<u32> {
    status
        .lines()
        .find(|line| line.starts_with("Uid:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|uid| uid.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    const STAT: &str = "1234 (svc-a) S 1 1234 1234 0 -1 4194560 2648 0 0 0 37 12 0 0 20 0 9 0 12345 \
                        170347520 1936 18446744073709551615 1 1 0 0 0 0 0 4096 0 0 0 0 17 3 0 0 0 0 0";

    const STATUS: &str = "Name:\tsvc-a\nUmask:\t0022\nState:\tS (sleeping)\nPid:\t1234\n\
                          Uid:\t998\t998\t998\t998\nGid:\t997\t997\t997\t997\n\
                          VmPeak:\t  170652 kB\nVmRSS:\t    7744 kB\nThreads:\t9\n";

    #[test]
    fn stat_fields_14_and_15_are_the_jiffies() {
        assert_eq!(parse_stat_cpu(STAT), (37.0, 12.0));
    }

    #[test]
    fn vmrss_is_reported_in_kb() {
        assert_eq!(parse_status_kb(STATUS, "VmRSS:"), Some(7744));
        assert_eq!(parse_status_kb(STATUS, "VmSwap:"), None);
    }

    #[test]
    fn uid_line_carries_the_real_uid_first() {
        assert_eq!(parse_status_uid(STATUS), Some(998));
    }

    #[test]
    fn meminfo_parsing_uses_the_same_shape() {
        let meminfo = "MemTotal:       16284728 kB\nMemFree:         222928 kB\n";
        assert_eq!(parse_status_kb(meminfo, "MemTotal:"), Some(16_284_728));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn live_readers_work_on_the_current_process() {
        let pid = std::process::id() as i32;
        assert!(cpu_time(pid).is_ok());
        assert!(memory_usage(pid).unwrap() > 0);
        assert!(memory_total().unwrap() > 0);
        assert!(list_pids().unwrap().contains(&pid));
    }
}
