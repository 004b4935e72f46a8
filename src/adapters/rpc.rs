//! Outbound RPC-style HTTP client
//!
//! Calls to downstream applications are keyed
//! `rpc#<app>#<METHOD>#<url path>`. One degrade rule file lists rules for
//! every downstream application, told apart by each rule's `limitApp`.
//!
//! Responses are always handed back to the caller. Service-unavailable
//! statuses, transport errors and timeouts are traced into admission control
//! so the breaker of the called resource can open.

use crate::context::LoginContext;
use crate::error::{GuardError, RpcError, SubscriptionError, UnavailableStatus};
use crate::gate::{EnforcementOutcome, Gate, Rejection, is_service_unavailable};
use crate::rules::index::RuleIndex;
use crate::rules::key::{KeyPrefix, Namespace};
use crate::rules::types::DegradeRule;
use crate::subscription::{Scope, SubscriptionManager};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

impl RpcError {
    /// Payload to answer the upstream caller with
    pub fn rejection(&self) -> Rejection {
        match self {
            RpcError::Timeout { .. } => Rejection::timeout(),
            RpcError::Transport { .. } => Rejection::service_error(),
        }
    }
}

/// Payload for any failed guarded call
pub fn rejection_for(err: &GuardError<RpcError>) -> Rejection {
    match err {
        GuardError::Blocked(blocked) => Rejection::for_blocked(blocked),
        GuardError::Downstream(e) => e.rejection(),
    }
}

/// Copy the current login onto outgoing headers
fn forward_login(headers: &mut HeaderMap) {
    let Some(user) = LoginContext::current() else {
        return;
    };
    for (name, value) in user.headers() {
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) else {
            warn!(header = name, "login header not forwardable, skipping");
            continue;
        };
        headers.insert(name, value);
    }
}

/// HTTP client guarded by downstream degrade rules
pub struct GuardedClient {
    http: reqwest::Client,
    gate: Gate,
    rules: Arc<RuleIndex<DegradeRule>>,
    timeout: Duration,
}

impl GuardedClient {
    pub fn new(gate: Gate, timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("flowguard/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self::with_client(http, gate, timeout))
    }

    pub fn with_client(http: reqwest::Client, gate: Gate, timeout: Duration) -> Self {
        Self {
            http,
            gate,
            rules: Arc::new(RuleIndex::new()),
            timeout,
        }
    }

    /// Underlying client, for building requests
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub fn rule_index(&self) -> &Arc<RuleIndex<DegradeRule>> {
        &self.rules
    }

    /// Watch the downstream degrade rule file
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
                Scope::limit_app(Namespace::Rpc),
                self.rules.clone(),
            )
            .await
    }

    /// Resource key for a call to `app`, if any rule covers it
    pub fn resolve(&self, app: &str, method: &str, path: &str) -> Option<String> {
        let prefix = KeyPrefix::new(Namespace::Rpc, app, method).ok()?;
        self.rules.resolve(&prefix, path)
    }

    /// Send `request` to downstream application `app`
    #[instrument(skip(self, request), fields(method = %request.method(), path = %request.url().path()))]
    pub async fn send(
        &self,
        app: &str,
        mut request: reqwest::Request,
    ) -> Result<reqwest::Response, GuardError<RpcError>> {
        forward_login(request.headers_mut());
        let resource = self.resolve(app, request.method().as_str(), request.url().path());

        let mut entry = match self.gate.resolve_and_enter(resource.as_deref()) {
            EnforcementOutcome::Blocked(blocked) => return Err(GuardError::Blocked(blocked)),
            EnforcementOutcome::Unrestricted => None,
            EnforcementOutcome::Proceed(entry) => Some(entry),
        };

        let result = match tokio::time::timeout(self.timeout, self.http.execute(request)).await {
            Ok(Ok(response)) => {
                let status = response.status().as_u16();
                if is_service_unavailable(status) {
                    warn!(app, status, "downstream unavailable");
                    if let Some(entry) = entry.as_mut() {
                        self.gate.trace(entry, &UnavailableStatus(status));
                    }
                } else {
                    debug!(app, status, "downstream responded");
                }
                Ok(response)
            }
            Ok(Err(source)) => Err(RpcError::Transport {
                app: app.to_string(),
                source,
            }),
            Err(_) => Err(RpcError::Timeout {
                app: app.to_string(),
                timeout_ms: self.timeout.as_millis() as u64,
            }),
        };

        if let Err(e) = &result {
            warn!(app, error = %e, "downstream call failed");
            if let Some(entry) = entry.as_mut() {
                self.gate.trace(entry, e);
            }
        }
        if let Some(entry) = entry {
            entry.exit();
        }

        result.map_err(GuardError::Downstream)
    }

    /// GET `url` on downstream application `app`
    pub async fn get(
        &self,
        app: &str,
        url: &str,
    ) -> Result<reqwest::Response, GuardError<RpcError>> {
        let request = self.http.get(url).build().map_err(|source| {
            GuardError::Downstream(RpcError::Transport {
                app: app.to_string(),
                source,
            })
        })?;
        self.send(app, request).await
    }
}
