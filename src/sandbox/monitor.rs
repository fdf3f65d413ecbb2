//! Process group bookkeeping: resident memory sampling and forced termination.

use std::fs;
use std::io;
use std::sync::OnceLock;

/// Sends SIGKILL to every process in the group. A group that is already gone is not an error.
pub(super) fn kill_group(pgid: i32) {
    if pgid <= 1 {
        log::error!("Refusing to kill process group {pgid}");
        return;
    }
    // SAFETY: killpg only sends a signal; `pgid` is a group created for a sandboxed child
    let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if rc != 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            log::warn!("Failed to kill process group {pgid}: {err}");
        }
    }
}

/// Live members of a process group and their combined usage
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(super) struct GroupUsage {
    pub(super) members: usize,
    pub(super) rss_bytes: u64,
    pub(super) cpu_ms: u64,
}

/// Scans `/proc` for the processes of a group. `None` where `/proc` is not available.
pub(super) fn group_usage(pgid: i32) -> Option<GroupUsage> {
    let entries = fs::read_dir("/proc").ok()?;

    let mut members = 0;
    let mut pages = 0;
    let mut ticks = 0;
    for entry in entries.flatten() {
        let file_name = entry.file_name();
        let Some(pid) = file_name.to_str().filter(|s| s.bytes().all(|b| b.is_ascii_digit())) else {
            continue;
        };
        // Processes may exit between listing and reading
        let Ok(stat) = fs::read_to_string(format!("/proc/{pid}/stat")) else {
            continue;
        };
        if let Some(fields) = parse_stat(&stat)
            && fields.pgrp == pgid
        {
            members += 1;
            pages += fields.rss_pages;
            ticks += fields.cpu_ticks;
        }
    }
    Some(GroupUsage {
        members,
        rss_bytes: pages * page_size(),
        cpu_ms: ticks * 1000 / clock_ticks(),
    })
}

#[derive(Debug, PartialEq, Eq)]
struct StatFields {
    pgrp: i32,
    /// utime + stime
    cpu_ticks: u64,
    rss_pages: u64,
}

/// Extracts the fields we need from the contents of `/proc/<pid>/stat`
fn parse_stat(stat: &str) -> Option<StatFields> {
    // The command name may contain spaces and parentheses, so split after the last ')'
    let rest = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // fields[0] is field 3 (state) of proc(5)
    let pgrp = fields.get(2)?.parse().ok()?;
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    let rss = fields.get(21)?.parse::<i64>().ok()?;
    Some(StatFields {
        pgrp,
        cpu_ticks: utime + stime,
        rss_pages: rss.max(0) as u64,
    })
}

fn page_size() -> u64 {
    static PAGE_SIZE: OnceLock<u64> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        // SAFETY: sysconf has no preconditions
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 { size as u64 } else { 4096 }
    })
}

fn clock_ticks() -> u64 {
    static CLOCK_TICKS: OnceLock<u64> = OnceLock::new();
    *CLOCK_TICKS.get_or_init(|| {
        // SAFETY: sysconf has no preconditions
        let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
        if ticks > 0 { ticks as u64 } else { 100 }
    })
}

pub(super) fn bytes_to_mb_ceil(bytes: u64) -> u64 {
    bytes.div_ceil(1024 * 1024)
}
