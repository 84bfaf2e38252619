use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

fn default_api_base_url() -> String {
    "http://127.0.0.1:8080".to_string()
}

fn default_metrics_topic_template() -> String {
    "statix/nodes/{node}/metrics".to_string()
}

fn default_system_topic_template() -> String {
    "statix/nodes/{node}/system".to_string()
}

fn default_publish_interval_ms() -> u64 {
    5_000
}

fn default_system_info_check_interval_ms() -> u64 {
    10 * 60 * 1_000
}

fn default_system_info_republish_interval_ms() -> u64 {
    24 * 60 * 60 * 1_000
}

fn default_exchange_interval_ms() -> u64 {
    15 * 60 * 1_000
}

fn default_reconnect_delay_ms() -> u64 {
    3_000
}

fn default_connect_timeout_ms() -> u64 {
    8_000
}

/// Configuration for the agent process, loadable from TOML file.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub node_id: String,
    #[serde(default)]
    pub node_token: String,
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_metrics_topic_template")]
    pub metrics_topic_template: String,
    #[serde(default = "default_system_topic_template")]
    pub system_topic_template: String,
    #[serde(default = "default_publish_interval_ms")]
    pub publish_interval_ms: u64,
    #[serde(default = "default_system_info_check_interval_ms")]
    pub system_info_check_interval_ms: u64,
    #[serde(default = "default_system_info_republish_interval_ms")]
    pub system_info_republish_interval_ms: u64,
    #[serde(default = "default_exchange_interval_ms")]
    pub exchange_interval_ms: u64,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

/// CLI overrides that can be applied on top of a config file.
#[derive(Debug, Default)]
pub struct AgentConfigOverrides {
    pub node_id: Option<String>,
    pub node_token: Option<String>,
    pub api_base_url: Option<String>,
}

impl AgentConfig {
    const SEARCH_PATHS: &'static [&'static str] = &["./agent.toml", "/etc/statix/agent.toml"];

    /// Credentials are the only fields without a usable default.
    pub fn validate(&self) -> Result<()> {
        if self.node_id.is_empty() {
            return Err(Error::Config("node_id is required".into()));
        }
        if self.node_token.is_empty() {
            return Err(Error::Config("node_token is required".into()));
        }
        Ok(())
    }

    #[must_use]
    pub fn metrics_topic(&self) -> String {
        self.metrics_topic_template.replace("{node}", &self.node_id)
    }

    #[must_use]
    pub fn system_topic(&self) -> String {
        self.system_topic_template.replace("{node}", &self.node_id)
    }

    #[must_use]
    pub fn publish_interval(&self) -> Duration {
        Duration::from_millis(self.publish_interval_ms)
    }

    #[must_use]
    pub fn system_info_check_interval(&self) -> Duration {
        Duration::from_millis(self.system_info_check_interval_ms)
    }

    #[must_use]
    pub fn system_info_republish_interval(&self) -> Duration {
        Duration::from_millis(self.system_info_republish_interval_ms)
    }

    #[must_use]
    pub fn exchange_interval(&self) -> Duration {
        Duration::from_millis(self.exchange_interval_ms)
    }

    #[must_use]
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: AgentConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn load_from_search_paths() -> Option<Self> {
        for path_str in Self::SEARCH_PATHS {
            let path = Path::new(path_str);
            if path.exists() {
                if let Ok(config) = Self::load(path) {
                    return Some(config);
                }
            }
        }
        None
    }

    /// Priority: CLI args > config file > defaults
    pub fn load_with_overrides(
        config_path: Option<&Path>,
        overrides: AgentConfigOverrides,
    ) -> anyhow::Result<Self> {
        let mut config = if let Some(path) = config_path {
            Self::load(path)?
        } else {
            Self::load_from_search_paths().unwrap_or_default()
        };

        if let Some(node_id) = overrides.node_id {
            config.node_id = node_id;
        }
        if let Some(node_token) = overrides.node_token {
            config.node_token = node_token;
        }
        if let Some(api_base_url) = overrides.api_base_url {
            config.api_base_url = api_base_url;
        }

        Ok(config)
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            node_token: String::new(),
            api_base_url: default_api_base_url(),
            metrics_topic_template: default_metrics_topic_template(),
            system_topic_template: default_system_topic_template(),
            publish_interval_ms: default_publish_interval_ms(),
            system_info_check_interval_ms: default_system_info_check_interval_ms(),
            system_info_republish_interval_ms: default_system_info_republish_interval_ms(),
            exchange_interval_ms: default_exchange_interval_ms(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_templates() {
        let mut config = AgentConfig::default();
        config.node_id = "01HX".to_string();
        assert_eq!(config.metrics_topic(), "statix/nodes/01HX/metrics");
        assert_eq!(config.system_topic(), "statix/nodes/01HX/system");
    }

    #[test]
    fn test_validate_requires_credentials() {
        let config = AgentConfig::default();
        assert!(config.validate().is_err());

        let mut config = AgentConfig::default();
        config.node_id = "n".into();
        config.node_token = "t".into();
        assert!(config.validate().is_ok());
    }
}
