//! Protocol adapters
//!
//! Each adapter turns its own request shape into a key prefix and target,
//! resolves that against the consumer rule sets its subscriptions keep up to
//! date, and runs the call behind the [`Gate`](crate::gate::Gate):
//!
//! - [`web`]: inbound HTTP, axum middleware, key `web#<app>#<METHOD>#<path>`
//! - [`gateway`]: inbound gateway, per-route rules, key `gateway#<route>#<METHOD>#<path>`
//! - [`rpc`]: outbound HTTP client, key `rpc#<downstream app>#<METHOD>#<path>`
//! - [`cache`]: outbound cache calls, key `cache#<family>#<command>#<key>`

pub mod cache;
pub mod gateway;
pub mod rpc;
pub mod web;

pub use cache::{CacheGuard, CacheOp};
pub use gateway::{GatewayGuard, RouteId, RouteSync, route_guard};
pub use rpc::GuardedClient;
pub use web::{WebGuard, web_guard};

use crate::rules::index::RuleIndex;
use crate::rules::key::KeyPrefix;
use crate::rules::types::{DegradeRule, FlowRule};

/// Resolve against a flow and a degrade rule set of the same consumer
///
/// Exact keys in either set win over templates in either set.
pub(crate) fn resolve_pair(
    flow: &RuleIndex<FlowRule>,
    degrade: &RuleIndex<DegradeRule>,
    prefix: &KeyPrefix,
    target: &str,
) -> Option<String> {
    let flow = flow.load();
    let degrade = degrade.load();

    let key = prefix.key(target);
    if let Some(found) = flow.resolve_exact(&key) {
        return Some(found.key.to_string());
    }
    if let Some(found) = degrade.resolve_exact(&key) {
        return Some(found.key.to_string());
    }

    flow.resolve_template(prefix.as_str(), target)
        .map(|r| r.key.to_string())
        .or_else(|| {
            degrade
                .resolve_template(prefix.as_str(), target)
                .map(|r| r.key.to_string())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::key::Namespace;

    #[test]
    fn test_exact_in_degrade_beats_template_in_flow() {
        let flow = RuleIndex::new();
        flow.replace([FlowRule::qps("web#app#GET#/users/{id}", 1.0)]);
        let degrade = RuleIndex::new();
        degrade.replace([DegradeRule::error_count("web#app#GET#/users/7", 1.0, 10)]);

        let prefix = KeyPrefix::new(Namespace::Web, "app", "GET").unwrap();
        assert_eq!(
            resolve_pair(&flow, &degrade, &prefix, "/users/7").as_deref(),
            Some("web#app#GET#/users/7")
        );
        assert_eq!(
            resolve_pair(&flow, &degrade, &prefix, "/users/8").as_deref(),
            Some("web#app#GET#/users/{id}")
        );
        assert_eq!(resolve_pair(&flow, &degrade, &prefix, "/orders"), None);
    }
}
