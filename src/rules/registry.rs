//! Global rule registries
//!
//! One registry per rule kind, shared by every consumer in the process.
//! Writers serialize on the per-kind mutex and publish a complete new
//! snapshot with a single `ArcSwap::store`; readers (the admission
//! primitive, the admin API) load snapshots lock-free and therefore only
//! ever see the list before or after a refresh, never a mix.

use crate::rules::diff::{RuleDiff, apply_diff, dedup_rules, remove_owned};
use crate::rules::types::Rule;
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

/// Immutable published view of one kind's rules
#[derive(Debug)]
pub struct RegistrySnapshot<R> {
    rules: Vec<R>,
    index: HashMap<String, usize>,
}

impl<R: Rule> RegistrySnapshot<R> {
    fn new(rules: Vec<R>) -> Self {
        let index = rules
            .iter()
            .enumerate()
            .map(|(i, r)| (r.resource().to_string(), i))
            .collect();
        Self { rules, index }
    }

    pub fn rules(&self) -> &[R] {
        &self.rules
    }

    pub fn get(&self, resource: &str) -> Option<&R> {
        self.index.get(resource).map(|&i| &self.rules[i])
    }

    pub fn contains(&self, resource: &str) -> bool {
        self.index.contains_key(resource)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Result of one refresh
#[derive(Debug, Clone)]
pub struct Applied<R> {
    /// The owner's rules as now published
    pub rules: Vec<R>,
    pub diff: RuleDiff,
}

/// Rules contributed by each owner, keyed by owner id
struct RegistryState<R> {
    owned: HashMap<String, Vec<R>>,
}

impl<R: Rule> RegistryState<R> {
    /// Keys other owners still hold, each with that owner's version
    ///
    /// When several other owners hold a key, the smallest owner id wins so
    /// the choice does not depend on map order.
    fn held_elsewhere(&self, owner: &str) -> HashMap<&str, (&str, &R)> {
        let mut held: HashMap<&str, (&str, &R)> = HashMap::new();
        for (other, rules) in &self.owned {
            if other == owner {
                continue;
            }
            for rule in rules {
                held.entry(rule.resource())
                    .and_modify(|slot| {
                        if other.as_str() < slot.0 {
                            *slot = (other.as_str(), rule);
                        }
                    })
                    .or_insert((other.as_str(), rule));
            }
        }
        held
    }
}

/// Put back other owners' versions of keys this owner just dropped
fn restore_shared<'a, R: Rule>(
    next: &mut Vec<R>,
    dropped: impl IntoIterator<Item = &'a str>,
    held: &HashMap<&str, (&str, &R)>,
) {
    for key in dropped {
        if let Some((holder, rule)) = held.get(key) {
            debug!(kind = %R::KIND, key, holder, "shared key kept for its other owner");
            next.push((*rule).clone());
        }
    }
}

/// Process-wide list of rules of one kind
pub struct GlobalRegistry<R> {
    published: ArcSwap<RegistrySnapshot<R>>,
    state: Mutex<RegistryState<R>>,
}

impl<R: Rule> GlobalRegistry<R> {
    pub fn new() -> Self {
        Self {
            published: ArcSwap::from_pointee(RegistrySnapshot::new(Vec::new())),
            state: Mutex::new(RegistryState {
                owned: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState<R>> {
        self.state.lock().unwrap_or_else(|poisoned| {
            warn!(kind = %R::KIND, "rule registry lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Current published rules, lock-free
    pub fn snapshot(&self) -> Arc<RegistrySnapshot<R>> {
        self.published.load_full()
    }

    /// Replace `owner`'s contribution with `latest`
    pub fn refresh(&self, owner: &str, latest: Vec<R>) -> Applied<R> {
        let mut state = self.lock();
        self.refresh_locked(&mut state, owner, latest)
    }

    /// Like [`refresh`](Self::refresh), but a no-op once `live` is false
    ///
    /// `live` is re-checked after the lock is taken, so a teardown that
    /// clears the flag before unloading cannot be undone by a push that was
    /// already in flight.
    pub fn refresh_if(&self, owner: &str, latest: Vec<R>, live: &AtomicBool) -> Option<Applied<R>> {
        let mut state = self.lock();
        if !live.load(Ordering::Acquire) {
            debug!(kind = %R::KIND, owner, "skipping refresh for torn-down owner");
            return None;
        }
        Some(self.refresh_locked(&mut state, owner, latest))
    }

    fn refresh_locked(
        &self,
        state: &mut RegistryState<R>,
        owner: &str,
        latest: Vec<R>,
    ) -> Applied<R> {
        let latest = dedup_rules(latest);
        let previous = state.owned.get(owner).map(Vec::as_slice).unwrap_or(&[]);
        let held = state.held_elsewhere(owner);
        let current = self.published.load();

        let (mut next, diff) = apply_diff(current.rules(), previous, &latest);
        for key in &diff.added {
            if let Some((holder, _)) = held.get(key.as_str()) {
                warn!(
                    kind = %R::KIND,
                    key = %key,
                    owner,
                    holder,
                    "rule key already published by another owner, replacing it"
                );
            }
        }
        restore_shared(&mut next, diff.removed.iter().map(String::as_str), &held);
        self.published.store(Arc::new(RegistrySnapshot::new(next)));

        debug!(
            kind = %R::KIND,
            owner,
            added = diff.added.len(),
            removed = diff.removed.len(),
            kept = diff.kept,
            "rules refreshed"
        );

        state.owned.insert(owner.to_string(), latest.clone());
        Applied {
            rules: latest,
            diff,
        }
    }

    /// Remove everything `owner` contributed, returning how many rules went
    pub fn unload(&self, owner: &str) -> usize {
        let mut state = self.lock();
        let Some(owned) = state.owned.remove(owner) else {
            return 0;
        };

        let held = state.held_elsewhere(owner);
        let current = self.published.load();
        let mut next = remove_owned(current.rules(), &owned);
        restore_shared(&mut next, owned.iter().map(Rule::resource), &held);
        let removed = current.len().saturating_sub(next.len());
        self.published.store(Arc::new(RegistrySnapshot::new(next)));

        debug!(kind = %R::KIND, owner, removed, "rules unloaded");
        removed
    }

    /// Rules currently attributed to `owner`
    pub fn owned_by(&self, owner: &str) -> Vec<R> {
        self.lock().owned.get(owner).cloned().unwrap_or_default()
    }

    /// Owners with at least one refresh applied
    pub fn owners(&self) -> Vec<String> {
        let mut owners: Vec<String> = self.lock().owned.keys().cloned().collect();
        owners.sort_unstable();
        owners
    }
}

impl<R: Rule> Default for GlobalRegistry<R> {
    fn default() -> Self {
        Self::new()
    }
}

/// The flow and degrade registries of one process
///
/// Usually created once and shared through an `Arc`; tests build their own
/// to stay isolated.
#[derive(Default)]
pub struct Registries {
    pub flow: GlobalRegistry<crate::rules::types::FlowRule>,
    pub degrade: GlobalRegistry<crate::rules::types::DegradeRule>,
}

impl Registries {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry for rule type `R`
    pub fn of<R: Rule>(&self) -> &GlobalRegistry<R> {
        R::registry(self)
    }
}
