//! Page-cache sizing from available memory.
//!
//! SQLite interprets a negative `cache_size` as KiB. The cache is scaled to
//! an eighth of available memory and clamped to [16, 256] MB; hosts with
//! less than 160 MiB free fall back to the minimum. Inside containers the
//! cgroup (v1 or v2) memory limit is consulted so the cache is not sized
//! against the host's memory.

use tracing::debug;

/// Upper clamp, in KiB (256 MB).
pub const MAX_PAGE_CACHE_KIB: i64 = 256_000;

/// Lower clamp, in KiB (16 MB).
pub const MIN_PAGE_CACHE_KIB: i64 = 16_000;

/// Below this much free memory the cache drops straight to the minimum.
const LOW_MEMORY_BYTES: u64 = 160 * 1024 * 1024;

/// Fraction of available memory granted to the page cache (1/N).
const MEMORY_FRACTION: u64 = 8;

/// The `PRAGMA cache_size` value for this host: negative KiB.
pub fn page_cache_size() -> i64 {
    let available = available_memory_bytes();
    let kib = cache_kib_for(available);
    debug!(available, cache_kib = kib, "sized page cache from available memory");
    -kib
}

/// Pure sizing rule, separated for testability.
fn cache_kib_for(available_bytes: u64) -> i64 {
    if available_bytes < LOW_MEMORY_BYTES {
        return MIN_PAGE_CACHE_KIB;
    }
    let scaled = (available_bytes / MEMORY_FRACTION / 1024) as i64;
    scaled.clamp(MIN_PAGE_CACHE_KIB, MAX_PAGE_CACHE_KIB)
}

/// Available memory in bytes: the smaller of the host's `MemAvailable` and
/// the cgroup headroom, when a cgroup limit applies.
fn available_memory_bytes() -> u64 {
    let host = proc_available_bytes().unwrap_or(LOW_MEMORY_BYTES);
    match cgroup_headroom_bytes() {
        Some(cgroup) => host.min(cgroup),
        None => host,
    }
}

#[cfg(target_os = "linux")]
fn proc_available_bytes() -> Option<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    for line in meminfo.lines() {
        if let Some(rest) = line.strip_prefix("MemAvailable:") {
            let kib: u64 = rest.trim().trim_end_matches(" kB").trim().parse().ok()?;
            return Some(kib * 1024);
        }
    }
    None
}

/// Remaining memory under the cgroup limit, when one is set.
#[cfg(target_os = "linux")]
fn cgroup_headroom_bytes() -> Option<u64> {
    // cgroup v2: memory.max is "max" when unlimited.
    if let Some(limit) = read_cgroup_number("/sys/fs/cgroup/memory.max") {
        let current = read_cgroup_number("/sys/fs/cgroup/memory.current").unwrap_or(0);
        return Some(limit.saturating_sub(current));
    }
    // cgroup v1: an absent or absurdly large limit_in_bytes means unlimited.
    if let Some(limit) = read_cgroup_number("/sys/fs/cgroup/memory/memory.limit_in_bytes") {
        if limit < (1 << 60) {
            let current =
                read_cgroup_number("/sys/fs/cgroup/memory/memory.usage_in_bytes").unwrap_or(0);
            return Some(limit.saturating_sub(current));
        }
    }
    None
}

#[cfg(target_os = "linux")]
fn read_cgroup_number(path: &str) -> Option<u64> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

#[cfg(not(target_os = "linux"))]
fn proc_available_bytes() -> Option<u64> {
    // Without a portable probe, assume a modest 1 GiB.
    Some(1024 * 1024 * 1024)
}

#[cfg(not(target_os = "linux"))]
fn cgroup_headroom_bytes() -> Option<u64> {
    None
}
