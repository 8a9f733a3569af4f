use std::sync::OnceLock;
use std::time::Instant;

use tracing::info;

use thinx_common::RebootReason;

pub fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

/// Free memory in bytes. When the gauge is unreadable the device reports
/// ample headroom rather than tripping the low-memory guards spuriously.
pub fn free_memory() -> u64 {
    read_meminfo_available().unwrap_or(u64::MAX)
}

fn read_meminfo_available() -> Option<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    let line = meminfo
        .lines()
        .find(|line| line.starts_with("MemAvailable:"))?;
    let kib: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kib * 1024)
}

/// A full device restart. On this target the process exits cleanly and the
/// service supervisor brings it back up; persisted identity carries over.
pub fn reboot(reason: RebootReason) -> ! {
    info!(?reason, "rebooting");
    std::process::exit(0)
}
