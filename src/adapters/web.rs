//! Inbound HTTP adapter
//!
//! Mount [`web_guard`] on an axum router with
//! `middleware::from_fn_with_state(guard, web_guard)`. Every request is keyed
//! `web#<app>#<METHOD>#<path>`; blocked requests get a JSON [`Rejection`]
//! whose HTTP status equals its code, and responses with a
//! service-unavailable status are traced as faults.

use crate::adapters::resolve_pair;
use crate::context::{LOGIN_TOKEN_HEADER, LOGIN_USER_ID_HEADER, LoginContext, LoginUser};
use crate::error::{RuleError, SubscriptionError, UnavailableStatus};
use crate::gate::{EnforcementOutcome, Gate, Rejection, is_service_unavailable};
use crate::rules::index::RuleIndex;
use crate::rules::key::{KeyPrefix, Namespace};
use crate::rules::types::{DegradeRule, FlowRule, RuleKind};
use crate::subscription::{Scope, SubscriptionManager};
use axum::{
    Json,
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::{debug, info};

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self)).into_response()
    }
}

/// Flow and degrade rules of one inbound HTTP application
pub struct WebGuard {
    gate: Gate,
    app: String,
    flow: Arc<RuleIndex<FlowRule>>,
    degrade: Arc<RuleIndex<DegradeRule>>,
}

impl WebGuard {
    /// Guard for application `app`, which becomes the key consumer
    pub fn new(gate: Gate, app: impl Into<String>) -> Result<Self, RuleError> {
        let app = app.into();
        KeyPrefix::new(Namespace::Web, &app, "GET")?;
        Ok(Self {
            gate,
            app,
            flow: Arc::new(RuleIndex::new()),
            degrade: Arc::new(RuleIndex::new()),
        })
    }

    pub fn app(&self) -> &str {
        &self.app
    }

    pub fn gate(&self) -> &Gate {
        &self.gate
    }

    pub fn flow_index(&self) -> &Arc<RuleIndex<FlowRule>> {
        &self.flow
    }

    pub fn degrade_index(&self) -> &Arc<RuleIndex<DegradeRule>> {
        &self.degrade
    }

    /// Watch the application's flow and degrade rule files
    ///
    /// If the degrade file cannot be watched the flow subscription is torn
    /// down again before the error is returned.
    pub async fn subscribe(
        &self,
        manager: &SubscriptionManager,
        flow_file_id: &str,
        degrade_file_id: &str,
        group: &str,
    ) -> Result<(), SubscriptionError> {
        let scope = Scope::consumer(Namespace::Web, self.app.clone());

        let flow = manager
            .init_rules::<FlowRule>(flow_file_id, group, scope.clone(), self.flow.clone())
            .await?;

        let degrade = match manager
            .init_rules::<DegradeRule>(degrade_file_id, group, scope, self.degrade.clone())
            .await
        {
            Ok(rules) => rules,
            Err(e) => {
                manager
                    .destroy_rules(RuleKind::Flow, flow_file_id, group)
                    .await;
                return Err(e);
            }
        };

        info!(
            app = %self.app,
            group,
            flow = flow.len(),
            degrade = degrade.len(),
            "web rules active"
        );
        Ok(())
    }

    /// Resource key for a request, if any rule covers it
    pub fn resolve(&self, method: &str, path: &str) -> Option<String> {
        let prefix = KeyPrefix::new(Namespace::Web, &self.app, method).ok()?;
        resolve_pair(&self.flow, &self.degrade, &prefix, path)
    }
}

fn login_from_headers(headers: &HeaderMap) -> LoginUser {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };
    LoginUser {
        user_id: header(LOGIN_USER_ID_HEADER),
        token: header(LOGIN_TOKEN_HEADER),
    }
}

/// Axum middleware enforcing the guard's rules
pub async fn web_guard(
    State(guard): State<Arc<WebGuard>>,
    request: Request,
    next: Next,
) -> Response {
    let user = login_from_headers(request.headers());
    let resource = guard.resolve(request.method().as_str(), request.uri().path());

    match guard.gate.resolve_and_enter(resource.as_deref()) {
        EnforcementOutcome::Unrestricted => LoginContext::scope(user, next.run(request)).await,
        EnforcementOutcome::Blocked(blocked) => Rejection::for_blocked(&blocked).into_response(),
        EnforcementOutcome::Proceed(mut entry) => {
            let response = LoginContext::scope(user, next.run(request)).await;
            let status = response.status().as_u16();
            if is_service_unavailable(status) {
                debug!(resource = %entry.resource(), status, "service unavailable response");
                guard.gate.trace(&mut entry, &UnavailableStatus(status));
            }
            entry.exit();
            response
        }
    }
}
