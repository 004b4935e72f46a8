//! Consumer scoping of payload rules
//!
//! Payload resources omit the namespace and consumer; a [`Scope`] turns them
//! into registry keys so consumers sharing a registry never collide.

use crate::rules::key::{Namespace, scope_resource};
use crate::rules::types::Rule;
use std::fmt;
use tracing::warn;

/// How payload resources map onto registry keys
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    /// `namespace#consumer#<resource>`
    Consumer {
        namespace: Namespace,
        consumer: String,
    },
    /// `namespace#<limitApp>#<resource>`, one file covering many consumers
    LimitApp { namespace: Namespace },
    /// `namespace#<resource>`, resources already carry the consumer
    Embedded { namespace: Namespace },
}

impl Scope {
    pub fn consumer(namespace: Namespace, consumer: impl Into<String>) -> Self {
        Scope::Consumer {
            namespace,
            consumer: consumer.into(),
        }
    }

    pub fn limit_app(namespace: Namespace) -> Self {
        Scope::LimitApp { namespace }
    }

    pub fn embedded(namespace: Namespace) -> Self {
        Scope::Embedded { namespace }
    }

    pub fn namespace(&self) -> Namespace {
        match self {
            Scope::Consumer { namespace, .. }
            | Scope::LimitApp { namespace }
            | Scope::Embedded { namespace } => *namespace,
        }
    }

    /// Rewrite each rule's resource into its registry key
    ///
    /// Rules whose consumer component contains the key separator are
    /// dropped with a warning.
    pub fn apply<R: Rule>(&self, rules: Vec<R>) -> Vec<R> {
        let namespace = self.namespace();
        rules
            .into_iter()
            .filter_map(|mut rule| {
                let consumer = match self {
                    Scope::Consumer { consumer, .. } => Some(consumer.as_str()),
                    Scope::LimitApp { .. } => Some(rule.limit_app()),
                    Scope::Embedded { .. } => None,
                };
                match scope_resource(namespace, consumer, rule.resource()) {
                    Ok(key) => {
                        rule.set_resource(key);
                        Some(rule)
                    }
                    Err(e) => {
                        warn!(resource = %rule.resource(), error = %e, "dropping unscoped rule");
                        None
                    }
                }
            })
            .collect()
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Consumer {
                namespace,
                consumer,
            } => write!(f, "{namespace}#{consumer}"),
            Scope::LimitApp { namespace } => write!(f, "{namespace}#<limitApp>"),
            Scope::Embedded { namespace } => write!(f, "{namespace}"),
        }
    }
}
