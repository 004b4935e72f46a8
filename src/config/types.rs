//! Configuration types for flowguard
//!
//! This module defines the configuration structure that can be loaded from
//! TOML files and/or environment variables.

use serde::Deserialize;

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Identity of this process
    pub app: AppSection,

    /// Remote configuration store
    pub source: SourceConfig,

    /// Inbound HTTP adapter rules
    pub web: WebConfig,

    /// Outbound RPC client rules
    pub rpc: RpcConfig,

    /// Outbound cache client rules
    pub cache: CacheConfig,

    /// Inbound gateway rules
    pub gateway: GatewayConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Dashboard configuration
    pub dashboard: DashboardConfigToml,
}

impl AppConfig {
    /// Rule group for an adapter: its own override, else the app name
    pub fn group_for<'a>(&'a self, group: Option<&'a str>) -> &'a str {
        group.unwrap_or(&self.app.name)
    }
}

/// Application identity
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    /// Application name; default group for rule files and the web consumer
    pub name: String,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: "flowguard".to_string(),
        }
    }
}

/// Remote configuration store (Nacos)
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Server address (e.g., `http://127.0.0.1:8848`)
    pub server_addr: String,

    /// Nacos namespace (tenant); empty means the public namespace
    pub namespace: Option<String>,

    /// Bound on the initial fetch of each rule file
    pub fetch_timeout_ms: u64,

    /// How often subscriptions re-read their file
    pub poll_interval_ms: u64,

    /// Per-request HTTP timeout
    pub request_timeout_secs: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            server_addr: "http://127.0.0.1:8848".to_string(),
            namespace: None,
            fetch_timeout_ms: 5000,
            poll_interval_ms: 3000,
            request_timeout_secs: 10,
        }
    }
}

/// Inbound HTTP adapter
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    pub enabled: bool,

    /// Group override (defaults to `app.name`)
    pub group: Option<String>,

    pub flow_file_id: String,

    pub degrade_file_id: String,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            group: None,
            flow_file_id: "flow-rules.json".to_string(),
            degrade_file_id: "degrade-rules.json".to_string(),
        }
    }
}

/// Outbound RPC client
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    pub enabled: bool,

    pub group: Option<String>,

    pub degrade_file_id: String,

    /// Timeout applied to guarded downstream calls
    pub timeout_secs: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            group: None,
            degrade_file_id: "degrade-rules-feign.json".to_string(),
            timeout_secs: 30,
        }
    }
}

/// Outbound cache client
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,

    pub group: Option<String>,

    pub degrade_file_id: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            group: None,
            degrade_file_id: "degrade-rules-redis.json".to_string(),
        }
    }
}

/// Inbound gateway
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub enabled: bool,

    /// Group override (defaults to `app.name`)
    pub group: Option<String>,

    /// Route ids; each gets `flow-rules-<id>.json` and `degrade-rules-<id>.json`
    pub routes: Vec<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            group: None,
            routes: Vec::new(),
        }
    }
}

/// Dashboard configuration (TOML format)
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DashboardConfigToml {
    /// Enable the dashboard server
    pub enabled: bool,

    /// Dashboard host
    pub host: String,

    /// Dashboard port
    pub port: u16,
}

impl Default for DashboardConfigToml {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 19890,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Output format (pretty, json)
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable output
    #[default]
    Pretty,
    /// JSON structured output
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.app.name, "flowguard");
        assert_eq!(config.source.fetch_timeout_ms, 5000);
        assert_eq!(config.web.flow_file_id, "flow-rules.json");
        assert_eq!(config.rpc.degrade_file_id, "degrade-rules-feign.json");
        assert_eq!(config.cache.degrade_file_id, "degrade-rules-redis.json");
        assert!(config.gateway.routes.is_empty());
    }

    #[test]
    fn test_group_for() {
        let config = AppConfig::default();
        assert_eq!(config.group_for(None), "flowguard");
        assert_eq!(config.group_for(Some("shared")), "shared");
    }

    #[test]
    fn test_deserialize_log_format() {
        let format: LogFormat = serde_json::from_str(r#""json""#).unwrap();
        assert_eq!(format, LogFormat::Json);
    }
}
