//! Host metric probes. Everything here is best-effort: a probe that fails
//! reports zero rather than aborting the publish.

use chrono::Utc;

use crate::types::MetricsPayload;

pub fn sample() -> MetricsPayload {
    let (mem_used, mem_total) = memory();
    let (disk_used, disk_total) = disk();
    let (net_rx, net_tx) = network();
    MetricsPayload {
        v: 1,
        ts: Utc::now().timestamp_millis(),
        cpu: cpu_load(),
        mem_used,
        mem_total,
        disk_used,
        disk_total,
        net_rx,
        net_tx,
    }
}

pub(crate) fn logical_cores() -> u32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1)
}

/// 1-minute load average normalized by logical cores, clamped to [0, 1].
fn cpu_load() -> f64 {
    let load1 = std::fs::read_to_string("/proc/loadavg")
        .ok()
        .and_then(|s| s.split_whitespace().next().and_then(|v| v.parse::<f64>().ok()))
        .unwrap_or(0.0);
    (load1 / f64::from(logical_cores())).clamp(0.0, 1.0)
}

/// (used, total) bytes, preferring cgroup v2 limits over host-wide meminfo.
fn memory() -> (i64, i64) {
    if let Some(pair) = cgroup_memory() {
        return pair;
    }
    if let Some(pair) = meminfo_memory() {
        return pair;
    }
    (0, 1)
}

fn cgroup_memory() -> Option<(i64, i64)> {
    let current = std::fs::read_to_string("/sys/fs/cgroup/memory.current")
        .ok()?
        .trim()
        .parse::<i64>()
        .ok()?;
    let max_raw = std::fs::read_to_string("/sys/fs/cgroup/memory.max").ok()?;
    let max = max_raw.trim();
    if max == "max" {
        // Unlimited cgroup; the host-wide numbers are more useful.
        return None;
    }
    let total = max.parse::<i64>().ok()?;
    Some((current, total))
}

fn meminfo_memory() -> Option<(i64, i64)> {
    let content = std::fs::read_to_string("/proc/meminfo").ok()?;
    let mut total = None;
    let mut available = None;
    for line in content.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            total = parse_meminfo_kib(rest);
        } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
            available = parse_meminfo_kib(rest);
        }
    }
    let total = total?;
    let available = available?;
    Some(((total - available).max(0), total))
}

fn parse_meminfo_kib(rest: &str) -> Option<i64> {
    rest.split_whitespace()
        .next()?
        .parse::<i64>()
        .ok()
        .map(|kib| kib * 1024)
}

/// (used, total) bytes of the root filesystem.
fn disk() -> (i64, i64) {
    let path = std::ffi::CString::new("/").expect("static path has no NUL");
    let mut stats: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(path.as_ptr(), &mut stats) };
    if rc != 0 {
        return (0, 1);
    }
    let frsize = if stats.f_frsize > 0 {
        stats.f_frsize
    } else {
        stats.f_bsize
    } as i64;
    let total = (stats.f_blocks as i64).saturating_mul(frsize);
    let available = (stats.f_bavail as i64).saturating_mul(frsize);
    ((total - available).max(0), total.max(1))
}

/// Cumulative (rx, tx) bytes summed over non-loopback interfaces.
fn network() -> (i64, i64) {
    let Some(content) = std::fs::read_to_string("/proc/net/dev").ok() else {
        return (0, 0);
    };

    let mut rx = 0i64;
    let mut tx = 0i64;
    for line in content.lines().skip(2) {
        let Some((iface, rest)) = line.split_once(':') else {
            continue;
        };
        if iface.trim() == "lo" {
            continue;
        }
        let fields: Vec<&str> = rest.split_whitespace().collect();
        // receive bytes is the first column, transmit bytes the ninth
        if let (Some(r), Some(t)) = (fields.first(), fields.get(8)) {
            rx = rx.saturating_add(r.parse::<i64>().unwrap_or(0));
            tx = tx.saturating_add(t.parse::<i64>().unwrap_or(0));
        }
    }
    (rx, tx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_is_valid_payload() {
        let sample = sample();
        assert!(sample.validate().is_ok(), "{:?}", sample.validate());
    }

    #[test]
    fn test_logical_cores_is_positive() {
        assert!(logical_cores() >= 1);
    }
}
