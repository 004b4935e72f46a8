//! Configuration loader with layered sources
//!
//! Loads configuration from multiple sources with the following precedence
//! (highest to lowest):
//! 1. `NACOS_SERVER_ADDR` / `NACOS_NAMESPACE`
//! 2. Environment variables (FLOWGUARD__*)
//! 3. Configuration file (TOML)
//! 4. Default values

use crate::config::types::AppConfig;
use crate::error::ConfigError;
use crate::rules::key::SEPARATOR;
use config::{Config, Environment, File, FileFormat};
use std::path::Path;

/// Default configuration file paths to check (in order)
const DEFAULT_CONFIG_PATHS: &[&str] = &[
    "flowguard.toml",
    ".flowguard.toml",
    "~/.config/flowguard/config.toml",
    "/etc/flowguard/config.toml",
];

/// Load configuration from a TOML string (useful for testing)
pub fn load_config_from_str(toml_str: &str) -> Result<AppConfig, ConfigError> {
    let config = Config::builder()
        .add_source(File::from_str(toml_str, FileFormat::Toml))
        .build()
        .map_err(|e| ConfigError::Load(e.to_string()))?;

    let app_config: AppConfig = config
        .try_deserialize()
        .map_err(|e| ConfigError::Load(e.to_string()))?;

    validate_config(&app_config)?;

    Ok(app_config)
}

/// Load configuration from files and environment
pub fn load_config(config_path: Option<&str>) -> Result<AppConfig, ConfigError> {
    let mut builder = Config::builder();

    if let Some(path) = config_path {
        // Explicit path provided - must exist
        if !Path::new(path).exists() {
            return Err(ConfigError::Load(format!(
                "Configuration file not found: {}",
                path
            )));
        }
        builder = builder.add_source(File::new(path, FileFormat::Toml));
    } else {
        // Try default paths (first existing one wins)
        for path in DEFAULT_CONFIG_PATHS {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                builder = builder.add_source(File::new(&expanded, FileFormat::Toml));
                break;
            }
        }
    }

    // e.g., FLOWGUARD__SOURCE__SERVER_ADDR, FLOWGUARD__DASHBOARD__PORT
    // Double underscore (__) maps to nested keys (source.server_addr)
    builder = builder.add_source(
        Environment::with_prefix("FLOWGUARD")
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("gateway.routes"),
    );

    // Conventional Nacos client variables
    if let Ok(addr) = std::env::var("NACOS_SERVER_ADDR") {
        builder = builder
            .set_override("source.server_addr", addr)
            .map_err(|e| ConfigError::Load(e.to_string()))?;
    }
    if let Ok(namespace) = std::env::var("NACOS_NAMESPACE") {
        builder = builder
            .set_override("source.namespace", namespace)
            .map_err(|e| ConfigError::Load(e.to_string()))?;
    }

    let config = builder
        .build()
        .map_err(|e| ConfigError::Load(e.to_string()))?;

    let app_config: AppConfig = config
        .try_deserialize()
        .map_err(|e| ConfigError::Load(e.to_string()))?;

    validate_config(&app_config)?;

    Ok(app_config)
}

/// Validate configuration values
fn validate_config(config: &AppConfig) -> Result<(), ConfigError> {
    if config.app.name.is_empty() {
        return Err(ConfigError::Missing {
            field: "app.name".to_string(),
        });
    }
    validate_component(&config.app.name, "app.name")?;

    let addr = &config.source.server_addr;
    if addr.is_empty() {
        return Err(ConfigError::Missing {
            field: "source.server_addr".to_string(),
        });
    }
    if !addr.starts_with("http://") && !addr.starts_with("https://") {
        return Err(ConfigError::Invalid {
            message: format!(
                "source.server_addr must start with http:// or https://, got: {}",
                addr
            ),
        });
    }

    for (value, field) in [
        (config.source.fetch_timeout_ms, "source.fetch_timeout_ms"),
        (config.source.poll_interval_ms, "source.poll_interval_ms"),
        (config.source.request_timeout_secs, "source.request_timeout_secs"),
        (config.rpc.timeout_secs, "rpc.timeout_secs"),
    ] {
        if value == 0 {
            return Err(ConfigError::Invalid {
                message: format!("{} must be greater than 0", field),
            });
        }
    }

    for (file_id, field) in [
        (&config.web.flow_file_id, "web.flow_file_id"),
        (&config.web.degrade_file_id, "web.degrade_file_id"),
        (&config.rpc.degrade_file_id, "rpc.degrade_file_id"),
        (&config.cache.degrade_file_id, "cache.degrade_file_id"),
    ] {
        if file_id.trim().is_empty() {
            return Err(ConfigError::Missing {
                field: field.to_string(),
            });
        }
    }

    for route in &config.gateway.routes {
        if route.is_empty() {
            return Err(ConfigError::Invalid {
                message: "gateway.routes must not contain empty route ids".to_string(),
            });
        }
        validate_component(route, "gateway.routes")?;
    }

    if config.dashboard.enabled && config.dashboard.port == 0 {
        return Err(ConfigError::Invalid {
            message: "dashboard.port must be greater than 0".to_string(),
        });
    }

    Ok(())
}

/// Values that become key components must not contain the separator
fn validate_component(value: &str, field: &str) -> Result<(), ConfigError> {
    if value.contains(SEPARATOR) {
        return Err(ConfigError::Invalid {
            message: format!("{} must not contain '{}', got: {}", field, SEPARATOR, value),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_config_from_str_basic() {
        let toml = r#"
[app]
name = "ali-user"

[source]
server_addr = "http://nacos.internal:8848"
namespace = "prod"
"#;

        let config = load_config_from_str(toml).unwrap();
        assert_eq!(config.app.name, "ali-user");
        assert_eq!(config.source.server_addr, "http://nacos.internal:8848");
        assert_eq!(config.source.namespace.as_deref(), Some("prod"));
        assert_eq!(config.source.fetch_timeout_ms, 5000);
    }

    #[test]
    fn test_gateway_routes() {
        let toml = r#"
[gateway]
enabled = true
routes = ["ali-user", "ali-order"]
"#;

        let config = load_config_from_str(toml).unwrap();
        assert!(config.gateway.enabled);
        assert_eq!(config.gateway.routes, vec!["ali-user", "ali-order"]);
    }

    #[test]
    fn test_invalid_url_error() {
        let toml = r#"
[source]
server_addr = "nacos:8848"
"#;
        assert!(matches!(
            load_config_from_str(toml),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn test_separator_in_app_name() {
        let toml = r#"
[app]
name = "ali#user"
"#;
        assert!(load_config_from_str(toml).is_err());
    }

    #[test]
    fn test_zero_timeout() {
        let toml = r#"
[source]
fetch_timeout_ms = 0
"#;
        let err = load_config_from_str(toml).unwrap_err();
        assert!(err.to_string().contains("source.fetch_timeout_ms"));
    }

    #[test]
    fn test_empty_file_id() {
        let toml = r#"
[web]
flow_file_id = ""
"#;
        assert!(matches!(
            load_config_from_str(toml),
            Err(ConfigError::Missing { .. })
        ));
    }
}
