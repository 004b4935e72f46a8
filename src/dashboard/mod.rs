//! Dashboard module
//!
//! Admin JSON API for the rule-sync agent: the published rules of each
//! kind, subscription states, and per-resource enforcement counters.

pub mod metrics;
pub mod server;

pub use metrics::{GateMetrics, MetricsSnapshot, ResourceStats};
pub use server::{DEFAULT_DASHBOARD_PORT, DashboardConfig, DashboardState, router, run_dashboard};
