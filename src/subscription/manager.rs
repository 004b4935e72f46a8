//! Subscription lifecycle
//!
//! ```text
//! Uninitialized ──init_rules──▶ Fetching ──first apply──▶ Active ──destroy_rules──▶ TornDown
//!                                  │
//!                                  └─ fetch/subscribe failure or cancel ─▶ Uninitialized
//! ```

use crate::error::SubscriptionError;
use crate::rules::registry::Registries;
use crate::rules::types::{Rule, RuleKind, parse_rules};
use crate::source::{ChangeListener, SharedConfigSource, SubscriptionHandle};
use crate::subscription::{RuleListener, Scope};
use futures::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default bound on the initial fetch
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_millis(5000);

/// Lifecycle state of one subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    Uninitialized,
    Fetching,
    Active,
    TornDown,
}

/// Point-in-time view of one subscription, for the admin API
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionInfo {
    pub kind: RuleKind,
    pub file_id: String,
    pub group: String,
    pub scope: String,
    pub state: SubscriptionState,
    pub rules: usize,
    pub refreshes: u64,
}

/// Type-erased handle on a subscription's refresh path
trait ActiveRules: Send + Sync {
    fn teardown(&self) -> usize;
    fn rule_count(&self) -> usize;
    fn refreshes(&self) -> u64;
}

/// Applies payloads for one (kind, file, group)
struct Refresher<R: Rule> {
    registries: Arc<Registries>,
    owner: String,
    scope: Scope,
    listener: Arc<dyn RuleListener<R>>,
    live: AtomicBool,
    refreshes: AtomicU64,
    // Keeps post_refresh calls in the same order as registry updates
    serial: Mutex<()>,
}

impl<R: Rule> Refresher<R> {
    fn serialize(&self) -> MutexGuard<'_, ()> {
        self.serial.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Parse, scope and publish a payload; returns the applied rules
    fn apply(&self, payload: Option<&str>) -> Option<Vec<R>> {
        let mut rules: Vec<R> = match parse_rules(payload) {
            Ok(rules) => rules,
            Err(e) => {
                warn!(
                    kind = %R::KIND,
                    owner = %self.owner,
                    error = %e,
                    "malformed rule payload, treating as empty"
                );
                Vec::new()
            }
        };
        rules = self.scope.apply(rules);
        self.listener.prev_refresh(&mut rules);

        let _serial = self.serialize();
        let applied = R::registry(&self.registries).refresh_if(&self.owner, rules, &self.live)?;
        self.refreshes.fetch_add(1, Ordering::Relaxed);
        self.listener.post_refresh(&applied.rules);

        info!(
            kind = %R::KIND,
            owner = %self.owner,
            rules = applied.rules.len(),
            added = applied.diff.added.len(),
            removed = applied.diff.removed.len(),
            "rules applied"
        );
        Some(applied.rules)
    }
}

impl<R: Rule> ActiveRules for Refresher<R> {
    fn teardown(&self) -> usize {
        let _serial = self.serialize();
        self.live.store(false, Ordering::Release);
        let removed = R::registry(&self.registries).unload(&self.owner);
        self.listener.post_refresh(&[]);
        removed
    }

    fn rule_count(&self) -> usize {
        R::registry(&self.registries).owned_by(&self.owner).len()
    }

    fn refreshes(&self) -> u64 {
        self.refreshes.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SlotKey {
    kind: RuleKind,
    file_id: String,
    group: String,
}

struct Slot {
    scope: Scope,
    state: SubscriptionState,
    handle: Option<SubscriptionHandle>,
    rules: Option<Arc<dyn ActiveRules>>,
}

/// Undoes a half-finished `init_rules` unless disarmed
///
/// Covers both error returns and the init future being dropped mid-way:
/// the slot goes back to uninitialized and any rules already applied are
/// unloaded, so a later `init_rules` starts clean.
struct PendingInit<'a> {
    manager: &'a SubscriptionManager,
    key: SlotKey,
    rules: Option<Arc<dyn ActiveRules>>,
    armed: bool,
}

impl PendingInit<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingInit<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Some(rules) = self.rules.take() {
            rules.teardown();
        }
        self.manager.slots().remove(&self.key);
        debug!(
            kind = %self.key.kind,
            file_id = %self.key.file_id,
            group = %self.key.group,
            "rule subscription init abandoned"
        );
    }
}

/// Owns every rule subscription of the process
pub struct SubscriptionManager {
    source: SharedConfigSource,
    registries: Arc<Registries>,
    fetch_timeout: Duration,
    slots: Mutex<HashMap<SlotKey, Slot>>,
}

impl SubscriptionManager {
    pub fn new(source: SharedConfigSource, registries: Arc<Registries>) -> Self {
        Self {
            source,
            registries,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn registries(&self) -> &Arc<Registries> {
        &self.registries
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<SlotKey, Slot>> {
        self.slots.lock().unwrap_or_else(|poisoned| {
            warn!("subscription table lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Registry owner id of one subscription
    fn owner(file_id: &str, group: &str) -> String {
        format!("{group}#{file_id}")
    }

    /// Fetch, apply and watch the rules of `(file_id, group)`
    ///
    /// Returns the rules as applied. Fails with
    /// [`SubscriptionError::ConfigUnavailable`] when the source cannot be
    /// read or subscribed to; nothing stays registered in that case, nor
    /// when the returned future is dropped before it completes.
    pub async fn init_rules<R: Rule>(
        &self,
        file_id: &str,
        group: &str,
        scope: Scope,
        listener: Arc<dyn RuleListener<R>>,
    ) -> Result<Vec<R>, SubscriptionError> {
        let key = SlotKey {
            kind: R::KIND,
            file_id: file_id.to_string(),
            group: group.to_string(),
        };

        {
            let mut slots = self.slots();
            if let Some(slot) = slots.get(&key)
                && matches!(
                    slot.state,
                    SubscriptionState::Fetching | SubscriptionState::Active
                )
            {
                return Err(SubscriptionError::AlreadyActive {
                    kind: R::KIND.as_str(),
                    file_id: file_id.to_string(),
                    group: group.to_string(),
                });
            }
            slots.insert(
                key.clone(),
                Slot {
                    scope: scope.clone(),
                    state: SubscriptionState::Fetching,
                    handle: None,
                    rules: None,
                },
            );
        }
        let mut pending = PendingInit {
            manager: self,
            key: key.clone(),
            rules: None,
            armed: true,
        };

        debug!(kind = %R::KIND, file_id, group, "fetching rules");
        let payload = self
            .source
            .fetch(file_id, group, self.fetch_timeout)
            .await
            .map_err(SubscriptionError::ConfigUnavailable)?;

        let refresher = Arc::new(Refresher {
            registries: self.registries.clone(),
            owner: Self::owner(file_id, group),
            scope: scope.clone(),
            listener,
            live: AtomicBool::new(true),
            refreshes: AtomicU64::new(0),
            serial: Mutex::new(()),
        });
        pending.rules = Some(refresher.clone() as Arc<dyn ActiveRules>);
        let applied = refresher.apply(payload.as_deref()).unwrap_or_default();

        let callback: ChangeListener = {
            let refresher = refresher.clone();
            Arc::new(move |payload: Option<String>| {
                refresher.apply(payload.as_deref());
            })
        };
        let handle = self
            .source
            .subscribe(file_id, group, callback)
            .await
            .map_err(SubscriptionError::ConfigUnavailable)?;

        if let Some(slot) = self.slots().get_mut(&key) {
            slot.state = SubscriptionState::Active;
            slot.handle = Some(handle);
            slot.rules = Some(refresher as Arc<dyn ActiveRules>);
        }
        pending.disarm();

        info!(
            kind = %R::KIND,
            file_id,
            group,
            %scope,
            source = self.source.name(),
            %handle,
            rules = applied.len(),
            "rule subscription active"
        );
        Ok(applied)
    }

    /// Unsubscribe and remove every rule this subscription contributed
    ///
    /// Returns how many registry entries were removed. Tearing down an
    /// unknown or already torn-down subscription is a no-op.
    pub async fn destroy_rules(&self, kind: RuleKind, file_id: &str, group: &str) -> usize {
        let key = SlotKey {
            kind,
            file_id: file_id.to_string(),
            group: group.to_string(),
        };

        let (handle, rules) = {
            let mut slots = self.slots();
            let Some(slot) = slots.get_mut(&key) else {
                debug!(%kind, file_id, group, "no subscription to tear down");
                return 0;
            };
            if slot.state != SubscriptionState::Active {
                return 0;
            }
            slot.state = SubscriptionState::TornDown;
            (slot.handle.take(), slot.rules.take())
        };

        if let Some(handle) = handle
            && let Err(e) = self.source.unsubscribe(handle).await
        {
            warn!(%kind, file_id, group, error = %e, "unsubscribe failed, unloading anyway");
        }

        let removed = rules.map(|r| r.teardown()).unwrap_or_default();
        info!(%kind, file_id, group, removed, "rule subscription torn down");
        removed
    }

    /// Tear down every active subscription
    pub async fn destroy_all(&self) -> usize {
        let keys: Vec<SlotKey> = self
            .slots()
            .iter()
            .filter(|(_, slot)| slot.state == SubscriptionState::Active)
            .map(|(key, _)| key.clone())
            .collect();

        join_all(
            keys.iter()
                .map(|key| self.destroy_rules(key.kind, &key.file_id, &key.group)),
        )
        .await
        .into_iter()
        .sum()
    }

    pub fn state(&self, kind: RuleKind, file_id: &str, group: &str) -> SubscriptionState {
        let key = SlotKey {
            kind,
            file_id: file_id.to_string(),
            group: group.to_string(),
        };
        self.slots()
            .get(&key)
            .map_or(SubscriptionState::Uninitialized, |slot| slot.state)
    }

    /// Every known subscription, sorted by group, file and kind
    pub fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        let mut infos: Vec<SubscriptionInfo> = self
            .slots()
            .iter()
            .map(|(key, slot)| SubscriptionInfo {
                kind: key.kind,
                file_id: key.file_id.clone(),
                group: key.group.clone(),
                scope: slot.scope.to_string(),
                state: slot.state,
                rules: slot.rules.as_ref().map_or(0, |r| r.rule_count()),
                refreshes: slot.rules.as_ref().map_or(0, |r| r.refreshes()),
            })
            .collect();
        infos.sort_by(|a, b| {
            (&a.group, &a.file_id, a.kind.as_str()).cmp(&(&b.group, &b.file_id, b.kind.as_str()))
        });
        infos
    }
}
