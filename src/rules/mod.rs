//! Rule model and registries
//!
//! ## Data flow
//!
//! ```text
//! payload ──parse──▶ Vec<Rule> ──scope──▶ keyed rules
//!                                            │
//!                      GlobalRegistry::refresh (diff under kind lock)
//!                                            │
//!                 ┌──────────────────────────┴───────────────┐
//!                 ▼                                          ▼
//!        published snapshot                         RuleIndex (per consumer)
//!        (admission primitive)                      (key resolution)
//! ```
//!
//! Keys look like `namespace#consumer#verb#target`; see [`key`].

pub mod diff;
pub mod index;
pub mod key;
pub mod pattern;
pub mod registry;
pub mod types;

pub use diff::{RuleDiff, apply_diff};
pub use index::{MatchKind, Resolved, RuleIndex, RuleSet};
pub use key::{KeyPrefix, Namespace, RuleKey};
pub use pattern::PathTemplate;
pub use registry::{Applied, GlobalRegistry, Registries, RegistrySnapshot};
pub use types::{DegradeRule, FlowRule, Rule, RuleKind, parse_rules};
