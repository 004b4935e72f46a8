//! flowguard
//!
//! Dynamic flow-control and circuit-breaking rule synchronisation for
//! service adapters.
//!
//! ## Features
//!
//! - **Remote rule files** watched per (file, group) and hot-swapped without
//!   blocking request handling
//! - **One global registry per rule kind**, shared by every adapter and kept
//!   free of duplicate resources
//! - **Namespaced resource keys** so web, gateway, RPC and cache consumers never
//!   collide
//! - **Exact then template resolution** (`/users/{id}`) on the request path
//! - **RAII admission entries** released on every exit path
//!
//! ## Data Flow
//!
//! ```text
//! config source ──push──▶ SubscriptionManager ──diff──▶ GlobalRegistry ◀── admission control
//!                               │                                              ▲
//!                               └──post_refresh──▶ RuleIndex ◀── adapter ──▶ Gate
//! ```
//!
//! ## Example Configuration
//!
//! ```toml
//! [app]
//! name = "ali-user"
//!
//! [source]
//! server_addr = "http://127.0.0.1:8848"
//!
//! [rpc]
//! enabled = true                  # degrade-rules-feign.json
//!
//! [gateway]
//! enabled = true
//! routes = ["ali-user", "ali-order"]
//! ```

pub mod adapters;
pub mod admission;
pub mod config;
pub mod context;
pub mod dashboard;
pub mod error;
pub mod gate;
pub mod rules;
pub mod source;
pub mod subscription;

// Re-export main types
pub use admission::{AdmissionControl, BlockReason, Blocked, Entry, LocalAdmission, Permit};
pub use config::{AppConfig, load_config};
pub use dashboard::{DashboardConfig, GateMetrics};
pub use error::{AppError, GuardError, Result};
pub use gate::{EnforcementOutcome, Gate, Rejection};
pub use rules::{DegradeRule, FlowRule, Registries, RuleKind};
pub use source::{ConfigSource, SharedConfigSource};
pub use subscription::{Scope, SubscriptionManager};
