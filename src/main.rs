//! flowguard rule-sync agent
//!
//! Watches the configured rule files, keeps the registries current and
//! serves the admin API until interrupted.

use clap::Parser;
use flowguard::{
    adapters::{CacheGuard, GatewayGuard, GuardedClient, WebGuard},
    admission::LocalAdmission,
    config::{AppConfig, LogFormat, load_config},
    dashboard::{DashboardConfig, DashboardState, GateMetrics, run_dashboard},
    gate::Gate,
    rules::Registries,
    source::{NacosConfigSource, SharedConfigSource},
    subscription::SubscriptionManager,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// flowguard - flow-control and circuit-breaking rule sync agent
#[derive(Parser, Debug)]
#[command(name = "flowguard")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "FLOWGUARD_CONFIG")]
    config: Option<String>,

    /// Log level (trace, debug, info, warn, error); overrides logging.level
    #[arg(long, env = "FLOWGUARD_LOG_LEVEL")]
    log_level: Option<String>,

    /// Disable the dashboard
    #[arg(long, env = "FLOWGUARD_NO_DASHBOARD")]
    no_dashboard: bool,

    /// Dashboard host; overrides dashboard.host
    #[arg(long, env = "FLOWGUARD_DASHBOARD_HOST")]
    dashboard_host: Option<String>,

    /// Dashboard port; overrides dashboard.port
    #[arg(long, env = "FLOWGUARD_DASHBOARD_PORT")]
    dashboard_port: Option<u16>,
}

fn init_logging(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
        LogFormat::Pretty => registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .init(),
    }
}

/// Guards of the enabled adapters
///
/// Each guard owns the rule index its subscription listener updates, so the
/// guards live until the subscriptions are torn down.
#[derive(Default)]
struct Adapters {
    web: Option<WebGuard>,
    rpc: Option<GuardedClient>,
    cache: Option<CacheGuard>,
    gateway: Option<GatewayGuard>,
}

impl Adapters {
    fn enabled(&self) -> Vec<&'static str> {
        [
            self.web.as_ref().map(|_| "web"),
            self.rpc.as_ref().map(|_| "rpc"),
            self.cache.as_ref().map(|_| "cache"),
            self.gateway.as_ref().map(|_| "gateway"),
        ]
        .into_iter()
        .flatten()
        .collect()
    }
}

/// Subscribe every enabled adapter's rule files
async fn start_adapters(
    config: &AppConfig,
    gate: &Gate,
    manager: &Arc<SubscriptionManager>,
) -> anyhow::Result<Adapters> {
    let mut adapters = Adapters::default();

    if config.web.enabled {
        let web = WebGuard::new(gate.clone(), &config.app.name)?;
        web.subscribe(
            manager,
            &config.web.flow_file_id,
            &config.web.degrade_file_id,
            config.group_for(config.web.group.as_deref()),
        )
        .await?;
        adapters.web = Some(web);
    }

    if config.rpc.enabled {
        let rpc = GuardedClient::new(gate.clone(), Duration::from_secs(config.rpc.timeout_secs))?;
        let rules = rpc
            .subscribe(
                manager,
                &config.rpc.degrade_file_id,
                config.group_for(config.rpc.group.as_deref()),
            )
            .await?;
        info!(rules = rules.len(), "rpc rules active");
        adapters.rpc = Some(rpc);
    }

    if config.cache.enabled {
        let cache = CacheGuard::new(gate.clone());
        let rules = cache
            .subscribe(
                manager,
                &config.cache.degrade_file_id,
                config.group_for(config.cache.group.as_deref()),
            )
            .await?;
        info!(rules = rules.len(), "cache rules active");
        adapters.cache = Some(cache);
    }

    if !config.gateway.enabled {
        return Ok(adapters);
    }
    let gateway = GatewayGuard::new(
        gate.clone(),
        manager.clone(),
        config.group_for(config.gateway.group.as_deref()),
    );
    let synced = gateway.sync_routes(&config.gateway.routes).await?;
    info!(routes = ?synced.added, "gateway routes active");
    adapters.gateway = Some(gateway);
    Ok(adapters)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Parse CLI arguments
    let args = Args::parse();

    // Logging settings come from the config file when it loads
    let loaded = load_config(args.config.as_deref());
    let (level, format) = match &loaded {
        Ok(config) => (config.logging.level.clone(), config.logging.format),
        Err(_) => ("info".to_string(), LogFormat::Pretty),
    };
    init_logging(args.log_level.as_deref().unwrap_or(&level), format);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting flowguard rule-sync agent"
    );

    let config =
        loaded.inspect_err(|e| error!(error = %e, "Failed to load configuration"))?;

    let registries = Arc::new(Registries::new());
    let source: SharedConfigSource = Arc::new(
        NacosConfigSource::new(&config.source)
            .inspect_err(|e| error!(error = %e, "Failed to create config source"))?,
    );
    let manager = Arc::new(
        SubscriptionManager::new(source, registries.clone())
            .with_fetch_timeout(Duration::from_millis(config.source.fetch_timeout_ms)),
    );

    let metrics = Arc::new(GateMetrics::new());
    let gate =
        Gate::new(Arc::new(LocalAdmission::new(registries.clone()))).with_metrics(metrics.clone());

    let adapters = start_adapters(&config, &gate, &manager)
        .await
        .inspect_err(|e| error!(error = %e, "Failed to start rule subscriptions"))?;
    info!(adapters = ?adapters.enabled(), "Adapters ready");

    let shutdown = CancellationToken::new();

    // Start dashboard if enabled (in background)
    let dashboard_handle = if !args.no_dashboard && config.dashboard.enabled {
        let host = args.dashboard_host.as_deref().unwrap_or(&config.dashboard.host);
        let port = args.dashboard_port.unwrap_or(config.dashboard.port);
        let dashboard_config = DashboardConfig::new(host, port).unwrap_or_default();

        let state = DashboardState {
            metrics,
            registries,
            subscriptions: manager.clone(),
            config: Arc::new(config.clone()),
        };
        let token = shutdown.clone();

        Some(tokio::spawn(async move {
            if let Err(e) = run_dashboard(dashboard_config, state, token).await {
                error!(error = %e, "Dashboard server error");
            }
        }))
    } else {
        info!("Dashboard is disabled");
        None
    };

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    shutdown.cancel();

    if let Some(gateway) = &adapters.gateway {
        gateway.shutdown().await;
    }
    let removed = manager.destroy_all().await;
    info!(removed, "All rule subscriptions torn down");
    drop(adapters);

    if let Some(handle) = dashboard_handle
        && let Err(e) = handle.await
    {
        error!(error = %e, "Dashboard task failed");
    }

    Ok(())
}
