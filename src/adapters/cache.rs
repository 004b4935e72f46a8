//! Outbound cache adapter
//!
//! Cache calls are keyed `cache#<family>#<command>#<cache key>`, e.g.
//! `cache#value#get#users:42`. Only calls whose first argument is a cache
//! key go through the guard; the family is a closed set, the command is the
//! client method name. The degrade rule file lists full resources
//! (`value#get#users:{id}`), so templates match on the cache key.

use crate::error::{GuardError, SubscriptionError};
use crate::gate::Gate;
use crate::rules::index::RuleIndex;
use crate::rules::key::{KeyPrefix, Namespace};
use crate::rules::types::DegradeRule;
use crate::subscription::{Scope, SubscriptionManager};
use std::error::Error;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Operation family of a cache call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheOp {
    Value,
    Set,
    ZSet,
    Hash,
    List,
}

impl CacheOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheOp::Value => "value",
            CacheOp::Set => "set",
            CacheOp::ZSet => "zset",
            CacheOp::Hash => "hash",
            CacheOp::List => "list",
        }
    }

    pub fn all() -> &'static [CacheOp] {
        &[
            CacheOp::Value,
            CacheOp::Set,
            CacheOp::ZSet,
            CacheOp::Hash,
            CacheOp::List,
        ]
    }
}

impl fmt::Display for CacheOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Degrade rules over cache operations
pub struct CacheGuard {
    gate: Gate,
    rules: Arc<RuleIndex<DegradeRule>>,
}

impl CacheGuard {
    pub fn new(gate: Gate) -> Self {
        Self {
            gate,
            rules: Arc::new(RuleIndex::new()),
        }
    }

    pub fn rule_index(&self) -> &Arc<RuleIndex<DegradeRule>> {
        &self.rules
    }

    /// Watch the cache degrade rule file
    pub async fn subscribe(
        &self,
        manager: &SubscriptionManager,
        file_id: &str,
        group: &str,
    ) -> Result<Vec<DegradeRule>, SubscriptionError> {
        manager
            .init_rules::<DegradeRule>(
                file_id,
                group,
                Scope::embedded(Namespace::Cache),
                self.rules.clone(),
            )
            .await
    }

    /// Resource key for a call, if any rule covers it
    pub fn resolve(&self, op: CacheOp, command: &str, key: &str) -> Option<String> {
        let prefix = KeyPrefix::new(Namespace::Cache, op.as_str(), command).ok()?;
        self.rules.resolve(&prefix, key)
    }

    /// Run a cache call behind the gate; every error it returns is traced
    pub async fn run<T, E, Fut>(
        &self,
        op: CacheOp,
        command: &str,
        key: &str,
        call: Fut,
    ) -> Result<T, GuardError<E>>
    where
        Fut: Future<Output = Result<T, E>>,
        E: Error + 'static,
    {
        debug!(op = %op, command, key, "cache operation");
        let resource = self.resolve(op, command, key);
        let result = self.gate.guard(resource.as_deref(), call).await;
        match &result {
            Err(GuardError::Blocked(blocked)) => {
                warn!(resource = %blocked.resource, rule = ?blocked.rule, "cache operation blocked")
            }
            Err(GuardError::Downstream(e)) => {
                error!(op = %op, command, key, error = %e, "cache operation failed")
            }
            Ok(_) => {}
        }
        result
    }
}
