//! Dashboard HTTP server
//!
//! Read-only JSON API over the registries, subscriptions and gate metrics.

use crate::config::AppConfig;
use crate::dashboard::metrics::{GateMetrics, MetricsSnapshot};
use crate::rules::key::RuleKey;
use crate::rules::registry::Registries;
use crate::rules::types::{Rule, RuleKind};
use crate::subscription::{SubscriptionInfo, SubscriptionManager};
use axum::{
    Json, Router,
    extract::{Query, State},
    routing::get,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Default port for the dashboard server
pub const DEFAULT_DASHBOARD_PORT: u16 = 19890;

/// Dashboard configuration
#[derive(Debug, Clone)]
pub struct DashboardConfig {
    /// Address to bind the dashboard server
    pub bind: SocketAddr,
    /// Enable dashboard (default: true)
    pub enabled: bool,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], DEFAULT_DASHBOARD_PORT)),
            enabled: true,
        }
    }
}

impl DashboardConfig {
    /// Create config from host and port
    pub fn new(host: &str, port: u16) -> Result<Self, std::net::AddrParseError> {
        let bind: SocketAddr = format!("{}:{}", host, port).parse()?;
        Ok(Self {
            bind,
            enabled: true,
        })
    }
}

/// Shared state for dashboard handlers
#[derive(Clone)]
pub struct DashboardState {
    pub metrics: Arc<GateMetrics>,
    pub registries: Arc<Registries>,
    pub subscriptions: Arc<SubscriptionManager>,
    pub config: Arc<AppConfig>,
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
    version: &'static str,
    subscriptions: usize,
}

/// Optional filter on rule listings
#[derive(Debug, Default, Deserialize)]
pub struct RuleFilter {
    /// Only keys in this namespace
    pub namespace: Option<String>,
    /// Only keys of this consumer
    pub consumer: Option<String>,
}

impl RuleFilter {
    fn matches(&self, resource: &str) -> bool {
        if self.namespace.is_none() && self.consumer.is_none() {
            return true;
        }
        let Some(key) = RuleKey::decode(resource) else {
            return false;
        };
        self.namespace.as_deref().is_none_or(|ns| ns == key.namespace)
            && self.consumer.as_deref().is_none_or(|c| c == key.consumer)
    }
}

/// Rule listing for the API
#[derive(Serialize)]
pub struct RuleListing<R> {
    pub kind: RuleKind,
    pub count: usize,
    pub rules: Vec<R>,
}

#[derive(Serialize)]
struct ConfigInfo {
    app: String,
    source: String,
    namespace: Option<String>,
    web: bool,
    rpc: bool,
    cache: bool,
    gateway_routes: Vec<String>,
}

/// Build the API router
pub fn router(state: DashboardState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/rules/flow", get(api_rules_flow))
        .route("/api/rules/degrade", get(api_rules_degrade))
        .route("/api/subscriptions", get(api_subscriptions))
        .route("/api/metrics", get(api_metrics))
        .route("/api/config", get(api_config))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind the preferred port, else one of the next ten, else any free port
async fn bind_listener(bind: SocketAddr) -> std::io::Result<TcpListener> {
    if let Ok(listener) = TcpListener::bind(bind).await {
        return Ok(listener);
    }
    for offset in 1..=10 {
        let addr = SocketAddr::new(bind.ip(), bind.port().saturating_add(offset));
        if let Ok(listener) = TcpListener::bind(addr).await {
            warn!(
                preferred = bind.port(),
                actual = addr.port(),
                "Preferred port unavailable, using alternate"
            );
            return Ok(listener);
        }
    }
    let listener = TcpListener::bind(SocketAddr::new(bind.ip(), 0)).await?;
    warn!(
        preferred = bind.port(),
        actual = listener.local_addr()?.port(),
        "Using OS-assigned port"
    );
    Ok(listener)
}

/// Run the dashboard server until `shutdown` is cancelled
pub async fn run_dashboard(
    config: DashboardConfig,
    state: DashboardState,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    if !config.enabled {
        info!("Dashboard is disabled");
        return Ok(());
    }

    let listener = bind_listener(config.bind).await?;
    info!("Dashboard server running at http://{}", listener.local_addr()?);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!("Dashboard server stopped");
    Ok(())
}

async fn health(State(state): State<DashboardState>) -> Json<Health> {
    Json(Health {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        subscriptions: state.subscriptions.subscriptions().len(),
    })
}

fn listing<R: Rule>(registries: &Registries, filter: &RuleFilter) -> RuleListing<R> {
    let rules: Vec<R> = registries
        .of::<R>()
        .snapshot()
        .rules()
        .iter()
        .filter(|r| filter.matches(r.resource()))
        .cloned()
        .collect();
    RuleListing {
        kind: R::KIND,
        count: rules.len(),
        rules,
    }
}

async fn api_rules_flow(
    State(state): State<DashboardState>,
    Query(filter): Query<RuleFilter>,
) -> Json<RuleListing<crate::rules::FlowRule>> {
    Json(listing(&state.registries, &filter))
}

async fn api_rules_degrade(
    State(state): State<DashboardState>,
    Query(filter): Query<RuleFilter>,
) -> Json<RuleListing<crate::rules::DegradeRule>> {
    Json(listing(&state.registries, &filter))
}

async fn api_subscriptions(State(state): State<DashboardState>) -> Json<Vec<SubscriptionInfo>> {
    Json(state.subscriptions.subscriptions())
}

async fn api_metrics(State(state): State<DashboardState>) -> Json<MetricsSnapshot> {
    Json(state.metrics.snapshot())
}

async fn api_config(State(state): State<DashboardState>) -> Json<ConfigInfo> {
    let config = &state.config;
    Json(ConfigInfo {
        app: config.app.name.clone(),
        source: config.source.server_addr.clone(),
        namespace: config.source.namespace.clone(),
        web: config.web.enabled,
        rpc: config.rpc.enabled,
        cache: config.cache.enabled,
        gateway_routes: if config.gateway.enabled {
            config.gateway.routes.clone()
        } else {
            Vec::new()
        },
    })
}
