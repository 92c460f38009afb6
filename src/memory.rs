//! Resident memory readings for the host and the worker.
//!
//! Linux only; other platforms report `None` and the memory checks are
//! skipped.

#[cfg(target_os = "linux")]
use std::fs;

/// Resident set size of the current (host) process in MiB.
pub fn host_rss_mib() -> Option<u64> {
    read_statm_rss_mib("/proc/self/statm")
}

/// Resident set size of the process `pid` in MiB.
pub fn process_rss_mib(pid: u32) -> Option<u64> {
    read_statm_rss_mib(&format!("/proc/{}/statm", pid))
}

/// Read RSS from a statm file.
///
/// statm has format `size resident shared text lib data dt`, all in pages.
#[cfg(target_os = "linux")]
fn read_statm_rss_mib(path: &str) -> Option<u64> {
    let contents = fs::read_to_string(path).ok()?;
    parse_statm_rss_mib(&contents)
}

#[cfg(not(target_os = "linux"))]
fn read_statm_rss_mib(_path: &str) -> Option<u64> {
    None
}

/// Assumes 4 KiB pages.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_statm_rss_mib(contents: &str) -> Option<u64> {
    let resident_pages: u64 = contents.split_whitespace().nth(1)?.parse().ok()?;
    let page_size_kb = 4;
    Some(resident_pages * page_size_kb / 1024)
}
