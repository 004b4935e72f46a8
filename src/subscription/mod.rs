//! Rule subscriptions
//!
//! A subscription binds one remote rule file to the shared registries:
//! fetch once, apply, then re-apply on every push until torn down. Each
//! subscription is identified by `(kind, file_id, group)` and contributes its
//! rules to the registry under its own owner id.

pub mod manager;
pub mod scope;

pub use manager::{
    DEFAULT_FETCH_TIMEOUT, SubscriptionInfo, SubscriptionManager, SubscriptionState,
};
pub use scope::Scope;

/// Hooks around each refresh of one subscription
///
/// Both hooks run on the thread delivering the push and must not block.
pub trait RuleListener<R>: Send + Sync {
    /// Inspect or rewrite the scoped rules before they are diffed
    fn prev_refresh(&self, _rules: &mut Vec<R>) {}

    /// Observe the rules as applied; called with `[]` on teardown
    fn post_refresh(&self, _rules: &[R]) {}
}

/// Listener that does nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopListener;

impl<R> RuleListener<R> for NoopListener {}
