use serde::{Deserialize, Serialize};

/// Wire payload published on `statix/nodes/<nodeId>/metrics`.
///
/// Unknown descriptive keys are ignored by the parser; numeric bounds are
/// checked by [`MetricsPayload::validate`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsPayload {
    pub v: u32,
    pub ts: i64,
    pub cpu: f64,
    pub mem_used: i64,
    pub mem_total: i64,
    pub disk_used: i64,
    pub disk_total: i64,
    pub net_rx: i64,
    pub net_tx: i64,
}

impl MetricsPayload {
    pub fn validate(&self) -> Result<(), String> {
        if self.v != 1 {
            return Err(format!("unsupported metrics version {}", self.v));
        }
        if self.ts <= 0 {
            return Err("ts must be a positive epoch-ms timestamp".into());
        }
        if !(0.0..=1.0).contains(&self.cpu) {
            return Err("cpu must be within [0, 1]".into());
        }
        if self.mem_total <= 0 {
            return Err("mem_total must be positive".into());
        }
        if self.disk_total <= 0 {
            return Err("disk_total must be positive".into());
        }
        if self.mem_used < 0 || self.disk_used < 0 || self.net_rx < 0 || self.net_tx < 0 {
            return Err("counters must be non-negative".into());
        }
        Ok(())
    }
}

/// Wire payload published (retained) on `statix/nodes/<nodeId>/system`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemInfoPayload {
    pub v: u32,
    pub ts: i64,
    /// Agent-computed lowercase hex SHA-256 of the stable stringification of
    /// `info`; the server trusts it for change detection.
    pub hash: String,
    pub info: SystemInventory,
}

impl SystemInfoPayload {
    pub fn validate(&self) -> Result<(), String> {
        if self.v != 1 {
            return Err(format!("unsupported system info version {}", self.v));
        }
        if self.ts <= 0 {
            return Err("ts must be a positive epoch-ms timestamp".into());
        }
        if self.hash.is_empty() || !self.hash.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err("hash must be lowercase hex".into());
        }
        if self.info.cpu_cores == 0 {
            return Err("cpuCores must be positive".into());
        }
        if self.info.mem_total <= 0 {
            return Err("memTotal must be positive".into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemInventory {
    pub os_platform: String,
    pub os_release: String,
    pub os_arch: String,
    pub hostname: String,
    pub cpu_model: String,
    pub cpu_cores: u32,
    pub mem_total: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_commit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_built_at: Option<String>,
    pub gpus: Vec<GpuInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GpuInfo {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vendor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_bytes: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub driver_version: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_metrics() -> MetricsPayload {
        MetricsPayload {
            v: 1,
            ts: 1_700_000_000_000,
            cpu: 0.5,
            mem_used: 1,
            mem_total: 2,
            disk_used: 0,
            disk_total: 1,
            net_rx: 0,
            net_tx: 0,
        }
    }

    #[test]
    fn test_valid_metrics_payload() {
        assert!(sample_metrics().validate().is_ok());
    }

    #[test]
    fn test_metrics_rejects_out_of_range_cpu() {
        let mut p = sample_metrics();
        p.cpu = 1.5;
        assert!(p.validate().is_err());
        p.cpu = -0.1;
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_metrics_rejects_zero_totals() {
        let mut p = sample_metrics();
        p.mem_total = 0;
        assert!(p.validate().is_err());
        let mut p = sample_metrics();
        p.disk_total = 0;
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_metrics_rejects_wrong_version() {
        let mut p = sample_metrics();
        p.v = 2;
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_metrics_ignores_unknown_keys() {
        let raw = r#"{"v":1,"ts":1700000000000,"cpu":0.5,"mem_used":1,"mem_total":2,
            "disk_used":0,"disk_total":1,"net_rx":0,"net_tx":0,"extra":"ok"}"#;
        let p: MetricsPayload = serde_json::from_str(raw).unwrap();
        assert!(p.validate().is_ok());
    }

    #[test]
    fn test_system_info_camel_case_wire_names() {
        let raw = r#"{"v":1,"ts":1700000000000,"hash":"ab12",
            "info":{"osPlatform":"linux","osRelease":"6.1","osArch":"x86_64",
            "hostname":"edge-1","cpuModel":"EPYC","cpuCores":8,"memTotal":1024,
            "gpus":[{"name":"A100","memoryBytes":1000}]}}"#;
        let p: SystemInfoPayload = serde_json::from_str(raw).unwrap();
        assert!(p.validate().is_ok());
        assert_eq!(p.info.cpu_cores, 8);
        assert_eq!(p.info.gpus[0].memory_bytes, Some(1000));
    }

    #[test]
    fn test_system_info_rejects_bad_hash() {
        let raw = r#"{"v":1,"ts":1,"hash":"zz","info":{"osPlatform":"linux",
            "osRelease":"6.1","osArch":"x86_64","hostname":"h","cpuModel":"c",
            "cpuCores":1,"memTotal":1,"gpus":[]}}"#;
        let p: SystemInfoPayload = serde_json::from_str(raw).unwrap();
        assert!(p.validate().is_err());
    }
}
