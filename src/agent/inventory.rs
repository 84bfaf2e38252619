//! System inventory collection. The payload hash is computed over the
//! canonical stringification from `crate::hash`, which is what the server
//! uses for change detection.

use std::process::Command;

use chrono::Utc;

use super::collect;
use crate::hash::stable_hash;
use crate::types::{GpuInfo, SystemInfoPayload, SystemInventory};

pub fn collect() -> SystemInfoPayload {
    let info = inventory();
    SystemInfoPayload {
        v: 1,
        ts: Utc::now().timestamp_millis(),
        hash: info_hash(&info),
        info,
    }
}

pub fn info_hash(info: &SystemInventory) -> String {
    match serde_json::to_value(info) {
        Ok(value) => stable_hash(&value),
        Err(e) => {
            tracing::warn!("inventory serialization failed: {e}");
            String::new()
        }
    }
}

fn inventory() -> SystemInventory {
    let version = version_info();
    SystemInventory {
        os_platform: std::env::consts::OS.to_string(),
        os_release: read_proc("/proc/sys/kernel/osrelease"),
        os_arch: std::env::consts::ARCH.to_string(),
        hostname: hostname(),
        cpu_model: cpu_model(),
        cpu_cores: collect::logical_cores(),
        mem_total: mem_total(),
        agent_version: version.version,
        agent_commit: version.commit,
        agent_built_at: version.built_at,
        gpus: gpus(),
    }
}

fn read_proc(path: &str) -> String {
    std::fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

fn hostname() -> String {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .map(|s| s.trim().to_string())
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

fn cpu_model() -> String {
    let Ok(content) = std::fs::read_to_string("/proc/cpuinfo") else {
        return "unknown".to_string();
    };
    content
        .lines()
        .find_map(|line| {
            let (key, value) = line.split_once(':')?;
            if key.trim() == "model name" {
                Some(value.trim().to_string())
            } else {
                None
            }
        })
        .unwrap_or_else(|| "unknown".to_string())
}

fn mem_total() -> i64 {
    let Ok(content) = std::fs::read_to_string("/proc/meminfo") else {
        return 1;
    };
    content
        .lines()
        .find_map(|line| {
            let rest = line.strip_prefix("MemTotal:")?;
            rest.split_whitespace().next()?.parse::<i64>().ok()
        })
        .map(|kib| kib * 1024)
        .unwrap_or(1)
}

struct VersionInfo {
    version: Option<String>,
    commit: Option<String>,
    built_at: Option<String>,
}

/// Reads an adjacent `version.json` written at build/package time, falling
/// back to environment variables and the crate version.
fn version_info() -> VersionInfo {
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            if let Ok(content) = std::fs::read_to_string(dir.join("version.json")) {
                if let Ok(value) = serde_json::from_str::<serde_json::Value>(&content) {
                    let field = |name: &str| {
                        value.get(name).and_then(|v| v.as_str()).map(str::to_string)
                    };
                    return VersionInfo {
                        version: field("version"),
                        commit: field("commit"),
                        built_at: field("builtAt"),
                    };
                }
            }
        }
    }

    VersionInfo {
        version: std::env::var("STATIX_AGENT_VERSION")
            .ok()
            .or_else(|| Some(env!("CARGO_PKG_VERSION").to_string())),
        commit: std::env::var("STATIX_AGENT_COMMIT").ok(),
        built_at: std::env::var("STATIX_AGENT_BUILT_AT").ok(),
    }
}

fn gpus() -> Vec<GpuInfo> {
    if let Some(gpus) = nvidia_smi_gpus() {
        return gpus;
    }
    if let Some(gpus) = lspci_gpus() {
        return gpus;
    }
    Vec::new()
}

fn nvidia_smi_gpus() -> Option<Vec<GpuInfo>> {
    let output = Command::new("nvidia-smi")
        .args([
            "--query-gpu=name,memory.total,driver_version",
            "--format=csv,noheader,nounits",
        ])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }

    let text = String::from_utf8(output.stdout).ok()?;
    let gpus: Vec<GpuInfo> = text
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            GpuInfo {
                name: (*fields.first().unwrap_or(&"unknown")).to_string(),
                vendor: Some("NVIDIA".to_string()),
                // memory.total is reported in MiB with nounits
                memory_bytes: fields
                    .get(1)
                    .and_then(|v| v.parse::<i64>().ok())
                    .map(|mib| mib * 1024 * 1024),
                driver_version: fields
                    .get(2)
                    .map(|s| (*s).to_string())
                    .filter(|s| !s.is_empty()),
            }
        })
        .collect();

    if gpus.is_empty() { None } else { Some(gpus) }
}

fn lspci_gpus() -> Option<Vec<GpuInfo>> {
    let output = Command::new("lspci").output().ok()?;
    if !output.status.success() {
        return None;
    }

    let text = String::from_utf8_lossy(&output.stdout);
    let gpus: Vec<GpuInfo> = text
        .lines()
        .filter(|line| {
            let lower = line.to_lowercase();
            lower.contains("vga compatible controller")
                || lower.contains("3d controller")
                || lower.contains("display controller")
        })
        .map(|line| {
            let name = line
                .split_once(": ")
                .map_or(line, |(_, rest)| rest)
                .trim()
                .to_string();
            let vendor = classify_vendor(&name);
            GpuInfo {
                name,
                vendor,
                memory_bytes: None,
                driver_version: None,
            }
        })
        .collect();

    if gpus.is_empty() { None } else { Some(gpus) }
}

fn classify_vendor(name: &str) -> Option<String> {
    let lower = name.to_lowercase();
    for (needle, vendor) in [
        ("nvidia", "NVIDIA"),
        ("advanced micro devices", "AMD"),
        ("amd", "AMD"),
        ("intel", "Intel"),
    ] {
        if lower.contains(needle) {
            return Some(vendor.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_info_hash_matches_stable_hash() {
        let payload = collect();
        assert_eq!(payload.hash, info_hash(&payload.info));
        assert_eq!(payload.hash.len(), 64);
    }

    #[test]
    fn test_info_hash_is_stable_across_collections() {
        // Two collections on the same host hash identically as long as the
        // inventory itself did not change.
        let a = info_hash(&collect().info);
        let b = info_hash(&collect().info);
        assert_eq!(a, b);
    }

    #[test]
    fn test_classify_vendor() {
        assert_eq!(classify_vendor("NVIDIA GeForce RTX 4090").as_deref(), Some("NVIDIA"));
        assert_eq!(
            classify_vendor("Advanced Micro Devices, Inc. Radeon").as_deref(),
            Some("AMD")
        );
        assert_eq!(classify_vendor("Intel UHD Graphics").as_deref(), Some("Intel"));
        assert_eq!(classify_vendor("Matrox G200"), None);
    }
}
