//! Nacos configuration source
//!
//! Reads payloads through the Nacos open API
//! (`GET /nacos/v1/cs/configs?dataId=..&group=..&tenant=..`) and watches
//! them with one polling task per subscription. A poller calls its listener
//! whenever the payload differs from the last one it saw; the first poll
//! always reports, which the idempotent refresh path absorbs.

use crate::config::SourceConfig;
use crate::error::{SourceError, SourceResult};
use crate::source::{ChangeListener, ConfigSource, SubscriptionHandle};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

const CONFIG_PATH: &str = "/nacos/v1/cs/configs";

/// HTTP half of the source, cheap to clone into poller tasks
#[derive(Clone)]
struct NacosClient {
    http: Client,
    base_url: String,
    namespace: Option<String>,
}

impl NacosClient {
    async fn get_config(&self, file_id: &str, group: &str) -> SourceResult<Option<String>> {
        let mut request = self
            .http
            .get(format!("{}{}", self.base_url, CONFIG_PATH))
            .query(&[("dataId", file_id), ("group", group)]);
        if let Some(tenant) = &self.namespace {
            request = request.query(&[("tenant", tenant.as_str())]);
        }

        let response = request
            .send()
            .await
            .map_err(|e| SourceError::Unavailable {
                file_id: file_id.to_string(),
                group: group.to_string(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(SourceError::Api {
                status: status.as_u16(),
                message,
            });
        }

        Ok(Some(response.text().await?))
    }
}

/// Nacos open API client with polling subscriptions
pub struct NacosConfigSource {
    client: NacosClient,
    poll_interval: Duration,
    pollers: Mutex<HashMap<u64, CancellationToken>>,
    next_handle: AtomicU64,
}

impl NacosConfigSource {
    pub fn new(config: &SourceConfig) -> SourceResult<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .pool_max_idle_per_host(4)
            .user_agent(format!("flowguard/{}", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client: NacosClient {
                http,
                base_url: config.server_addr.trim_end_matches('/').to_string(),
                namespace: config.namespace.clone().filter(|ns| !ns.is_empty()),
            },
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            pollers: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
        })
    }

    fn pollers(&self) -> MutexGuard<'_, HashMap<u64, CancellationToken>> {
        self.pollers.lock().unwrap_or_else(|poisoned| {
            warn!("nacos poller table lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Number of running pollers
    pub fn active_pollers(&self) -> usize {
        self.pollers().len()
    }
}

#[async_trait]
impl ConfigSource for NacosConfigSource {
    #[instrument(skip(self), fields(server = %self.client.base_url))]
    async fn fetch(
        &self,
        file_id: &str,
        group: &str,
        timeout: Duration,
    ) -> SourceResult<Option<String>> {
        match tokio::time::timeout(timeout, self.client.get_config(file_id, group)).await {
            Ok(result) => result,
            Err(_) => Err(SourceError::Timeout {
                file_id: file_id.to_string(),
                group: group.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    #[instrument(skip(self, listener))]
    async fn subscribe(
        &self,
        file_id: &str,
        group: &str,
        listener: ChangeListener,
    ) -> SourceResult<SubscriptionHandle> {
        let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        self.pollers().insert(id, token.clone());

        let client = self.client.clone();
        let period = self.poll_interval;
        let file_id = file_id.to_string();
        let group = group.to_string();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut last: Option<Option<String>> = None;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                match client.get_config(&file_id, &group).await {
                    Ok(current) => {
                        if last.as_ref() == Some(&current) {
                            continue;
                        }
                        debug!(file_id = %file_id, group = %group, "config changed");
                        last = Some(current.clone());
                        // A cancel that raced the request wins
                        if token.is_cancelled() {
                            break;
                        }
                        listener(current);
                    }
                    Err(e) => {
                        warn!(file_id = %file_id, group = %group, error = %e, "config poll failed, retrying");
                    }
                }
            }
            debug!(file_id = %file_id, group = %group, "config poller stopped");
        });

        info!(handle = id, "watching config");
        Ok(SubscriptionHandle::new(id))
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) -> SourceResult<()> {
        let token = self
            .pollers()
            .remove(&handle.id())
            .ok_or(SourceError::UnknownHandle(handle.id()))?;
        token.cancel();
        Ok(())
    }

    fn name(&self) -> &'static str {
        "nacos"
    }
}

impl Drop for NacosConfigSource {
    fn drop(&mut self) {
        for (_, token) in self.pollers().drain() {
            token.cancel();
        }
    }
}
