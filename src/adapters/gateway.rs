//! Inbound gateway adapter
//!
//! Each route has its own flow and degrade rule files, named
//! `flow-rules-<route>.json` and `degrade-rules-<route>.json` in the gateway
//! group, and its own pair of rule sets. [`GatewayGuard::sync_routes`] keeps
//! the subscriptions in line with the configured route list.
//!
//! The routing layer tags requests with a [`RouteId`] extension; the
//! [`route_guard`] middleware enforces the tagged route's rules and lets
//! untagged requests through.

use crate::adapters::resolve_pair;
use crate::error::{SubscriptionError, UnavailableStatus};
use crate::gate::{EnforcementOutcome, Gate, Rejection, is_service_unavailable};
use crate::rules::index::RuleIndex;
use crate::rules::key::{KeyPrefix, Namespace};
use crate::rules::types::{DegradeRule, FlowRule, RuleKind};
use crate::subscription::{Scope, SubscriptionManager};
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

/// Flow rule file of a route
pub fn flow_file_id(route: &str) -> String {
    format!("flow-rules-{route}.json")
}

/// Degrade rule file of a route
pub fn degrade_file_id(route: &str) -> String {
    format!("degrade-rules-{route}.json")
}

/// Route a request was matched to, set by the routing layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteId(pub String);

/// Routes changed by one [`GatewayGuard::sync_routes`] call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RouteSync {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

#[derive(Default)]
struct RouteRules {
    flow: Arc<RuleIndex<FlowRule>>,
    degrade: Arc<RuleIndex<DegradeRule>>,
}

/// Per-route rules of a gateway
pub struct GatewayGuard {
    gate: Gate,
    manager: Arc<SubscriptionManager>,
    group: String,
    routes: RwLock<HashMap<String, Arc<RouteRules>>>,
    // One sync at a time; lookups only take the read lock
    sync: tokio::sync::Mutex<()>,
}

impl GatewayGuard {
    pub fn new(gate: Gate, manager: Arc<SubscriptionManager>, group: impl Into<String>) -> Self {
        Self {
            gate,
            manager,
            group: group.into(),
            routes: RwLock::new(HashMap::new()),
            sync: tokio::sync::Mutex::new(()),
        }
    }

    pub fn gate(&self) -> &Gate {
        &self.gate
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// Route ids currently watched, sorted
    pub fn routes(&self) -> Vec<String> {
        let mut routes: Vec<String> = self.read_routes().keys().cloned().collect();
        routes.sort();
        routes
    }

    fn read_routes(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<RouteRules>>> {
        self.routes.read().unwrap_or_else(|poisoned| {
            warn!("gateway route table lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn write_routes(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<RouteRules>>> {
        self.routes.write().unwrap_or_else(|poisoned| {
            warn!("gateway route table lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Bring route subscriptions in line with `routes`
    ///
    /// Removed routes are torn down first. New routes are watched in the
    /// order given; the first failure stops the sync and is returned, with
    /// routes added before it left in place.
    pub async fn sync_routes(&self, routes: &[String]) -> Result<RouteSync, SubscriptionError> {
        let _sync = self.sync.lock().await;

        let desired: BTreeSet<&str> = routes.iter().map(String::as_str).collect();
        let current: BTreeSet<String> = self.read_routes().keys().cloned().collect();

        let mut result = RouteSync::default();

        for route in current.iter().filter(|r| !desired.contains(r.as_str())) {
            self.write_routes().remove(route);
            self.manager
                .destroy_rules(RuleKind::Flow, &flow_file_id(route), &self.group)
                .await;
            self.manager
                .destroy_rules(RuleKind::Degrade, &degrade_file_id(route), &self.group)
                .await;
            info!(route = %route, "gateway route removed");
            result.removed.push(route.clone());
        }

        for route in desired.into_iter().filter(|r| !current.contains(*r)) {
            let rules = self.watch(route).await?;
            self.write_routes().insert(route.to_string(), rules);
            result.added.push(route.to_string());
        }

        Ok(result)
    }

    async fn watch(&self, route: &str) -> Result<Arc<RouteRules>, SubscriptionError> {
        let rules = Arc::new(RouteRules::default());
        let scope = Scope::consumer(Namespace::Gateway, route);
        let flow_file = flow_file_id(route);

        let flow = self
            .manager
            .init_rules::<FlowRule>(&flow_file, &self.group, scope.clone(), rules.flow.clone())
            .await?;

        let degrade = match self
            .manager
            .init_rules::<DegradeRule>(
                &degrade_file_id(route),
                &self.group,
                scope,
                rules.degrade.clone(),
            )
            .await
        {
            Ok(degrade) => degrade,
            Err(e) => {
                self.manager
                    .destroy_rules(RuleKind::Flow, &flow_file, &self.group)
                    .await;
                return Err(e);
            }
        };

        info!(
            route,
            flow = flow.len(),
            degrade = degrade.len(),
            "gateway route added"
        );
        Ok(rules)
    }

    /// Tear down every route
    pub async fn shutdown(&self) -> RouteSync {
        match self.sync_routes(&[]).await {
            Ok(result) => result,
            // Removing routes never subscribes
            Err(_) => RouteSync::default(),
        }
    }

    /// Resource key for a request on `route`, if any rule covers it
    pub fn resolve(&self, route: &str, method: &str, path: &str) -> Option<String> {
        let rules = self.read_routes().get(route).cloned()?;
        let prefix = KeyPrefix::new(Namespace::Gateway, route, method).ok()?;
        resolve_pair(&rules.flow, &rules.degrade, &prefix, path)
    }

    /// Resolve and open an entry for a request on `route`
    pub fn enter(&self, route: &str, method: &str, path: &str) -> EnforcementOutcome {
        let resource = self.resolve(route, method, path);
        self.gate.resolve_and_enter(resource.as_deref())
    }
}

/// Axum middleware enforcing the rules of the request's [`RouteId`]
pub async fn route_guard(
    State(guard): State<Arc<GatewayGuard>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(RouteId(route)) = request.extensions().get::<RouteId>().cloned() else {
        return next.run(request).await;
    };

    match guard.enter(&route, request.method().as_str(), request.uri().path()) {
        EnforcementOutcome::Unrestricted => next.run(request).await,
        EnforcementOutcome::Blocked(blocked) => Rejection::for_blocked(&blocked).into_response(),
        EnforcementOutcome::Proceed(mut entry) => {
            let response = next.run(request).await;
            let status = response.status().as_u16();
            if is_service_unavailable(status) {
                debug!(route = %route, status, "upstream unavailable");
                guard.gate.trace(&mut entry, &UnavailableStatus(status));
            }
            entry.exit();
            response
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_ids() {
        assert_eq!(flow_file_id("ali-user"), "flow-rules-ali-user.json");
        assert_eq!(degrade_file_id("ali-user"), "degrade-rules-ali-user.json");
    }
}
