//! Configuration module
//!
//! Layered settings for the rule-sync agent: defaults, a TOML file, then
//! `FLOWGUARD__*` and the conventional `NACOS_*` environment variables.
//! Every adapter section names the rule files it subscribes to.

pub mod loader;
pub mod types;

pub use loader::{load_config, load_config_from_str};
pub use types::*;
