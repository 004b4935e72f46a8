//! In-process admission engine
//!
//! Coarse by intent: one fixed one-second window per resource for QPS
//! rules, a live counter for concurrency rules, and a per-resource breaker
//! driven by a fixed statistics window for degrade rules.
//!
//! Breaker states:
//!
//! ```text
//! Closed ──threshold reached──▶ Open ──timeWindow elapsed──▶ HalfOpen
//!   ▲                                                           │
//!   └──────────── probe succeeded ──────── probe faulted ───────┴──▶ Open
//! ```
//!
//! Only the entry holding the probe's [`Permit`] settles a half-open
//! breaker. State is kept only for resources some rule covers and is
//! pruned once the registries drop them.

use crate::admission::{AdmissionControl, BlockReason, Blocked, Permit};
use crate::rules::registry::Registries;
use crate::rules::types::{DegradeGrade, DegradeRule, FlowGrade, FlowRule};
use std::collections::HashMap;
use std::error::Error;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const QPS_WINDOW: Duration = Duration::from_secs(1);

/// Permit of an entry no rule covered; its exit touches no state
const UNTRACKED: Permit = Permit(u64::MAX);

/// Breaker state of one resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
enum Breaker {
    Closed,
    Open { until: Instant },
    /// One probe in flight, identified by its permit
    HalfOpen { probe: u64 },
}

#[derive(Debug)]
struct ResourceState {
    concurrency: u32,
    qps_window_start: Instant,
    qps_passed: u32,
    stat_window_start: Instant,
    stat_total: u32,
    stat_faults: u32,
    stat_slow: u32,
    breaker: Breaker,
    probes: u64,
}

impl ResourceState {
    fn new(now: Instant) -> Self {
        Self {
            concurrency: 0,
            qps_window_start: now,
            qps_passed: 0,
            stat_window_start: now,
            stat_total: 0,
            stat_faults: 0,
            stat_slow: 0,
            breaker: Breaker::Closed,
            probes: 0,
        }
    }

    fn roll_qps(&mut self, now: Instant) {
        if now.duration_since(self.qps_window_start) >= QPS_WINDOW {
            self.qps_window_start = now;
            self.qps_passed = 0;
        }
    }

    fn roll_stats(&mut self, now: Instant, interval: Duration) {
        if now.duration_since(self.stat_window_start) >= interval {
            self.reset_stats(now);
        }
    }

    fn reset_stats(&mut self, now: Instant) {
        self.stat_window_start = now;
        self.stat_total = 0;
        self.stat_faults = 0;
        self.stat_slow = 0;
    }

    fn check_flow(&mut self, rule: &FlowRule, now: Instant) -> Result<(), String> {
        match rule.grade {
            FlowGrade::Thread => {
                if f64::from(self.concurrency) >= rule.count {
                    return Err(format!("concurrency {}", rule.count));
                }
            }
            FlowGrade::Qps => {
                self.roll_qps(now);
                if f64::from(self.qps_passed) >= rule.count {
                    return Err(format!("qps {}", rule.count));
                }
            }
        }
        Ok(())
    }

    /// Permit for an entry the breaker admits; may hand out the probe
    fn check_breaker(&mut self, now: Instant) -> Option<Permit> {
        match self.breaker {
            Breaker::Closed => Some(Permit::PLAIN),
            Breaker::Open { until } if now >= until => {
                // Probe ids start at 1 so they never equal the plain permit
                self.probes += 1;
                self.breaker = Breaker::HalfOpen { probe: self.probes };
                Some(Permit(self.probes))
            }
            Breaker::Open { .. } | Breaker::HalfOpen { .. } => None,
        }
    }

    fn is_probe(&self, permit: Permit) -> bool {
        matches!(self.breaker, Breaker::HalfOpen { probe } if Permit(probe) == permit)
    }

    /// Open the breaker if the window crossed the rule's threshold
    fn evaluate(&mut self, rule: &DegradeRule, now: Instant) -> bool {
        if !matches!(self.breaker, Breaker::Closed) {
            return false;
        }
        let tripped = match rule.grade {
            DegradeGrade::ErrorCount => f64::from(self.stat_faults) >= rule.count,
            DegradeGrade::ErrorRatio => {
                self.stat_total >= rule.min_request_amount
                    && self.stat_total > 0
                    && f64::from(self.stat_faults) / f64::from(self.stat_total) >= rule.count
            }
            DegradeGrade::SlowRequestRatio => {
                self.stat_total >= rule.min_request_amount
                    && self.stat_total > 0
                    && f64::from(self.stat_slow) / f64::from(self.stat_total)
                        >= rule.slow_ratio_threshold
            }
        };
        if tripped {
            self.open(rule, now);
        }
        tripped
    }

    fn open(&mut self, rule: &DegradeRule, now: Instant) {
        self.breaker = Breaker::Open {
            until: now + Duration::from_secs(u64::from(rule.time_window)),
        };
        self.reset_stats(now);
    }

    fn circuit_state(&self) -> CircuitState {
        match self.breaker {
            Breaker::Closed => CircuitState::Closed,
            Breaker::Open { .. } => CircuitState::Open,
            Breaker::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }
}

/// Registry-backed admission engine
pub struct LocalAdmission {
    registries: Arc<Registries>,
    resources: RwLock<HashMap<String, Arc<Mutex<ResourceState>>>>,
}

impl LocalAdmission {
    pub fn new(registries: Arc<Registries>) -> Self {
        Self {
            registries,
            resources: RwLock::new(HashMap::new()),
        }
    }

    fn state(&self, resource: &str) -> Arc<Mutex<ResourceState>> {
        {
            let resources = self.resources.read().unwrap_or_else(|p| p.into_inner());
            if let Some(state) = resources.get(resource) {
                return state.clone();
            }
        }
        let mut resources = self.resources.write().unwrap_or_else(|p| p.into_inner());
        if !resources.contains_key(resource) {
            self.prune_locked(&mut resources);
        }
        resources
            .entry(resource.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(ResourceState::new(Instant::now()))))
            .clone()
    }

    /// Drop state of idle resources no rule covers any more
    fn prune_locked(&self, resources: &mut HashMap<String, Arc<Mutex<ResourceState>>>) -> usize {
        let flow = self.registries.flow.snapshot();
        let degrade = self.registries.degrade.snapshot();
        let before = resources.len();
        resources.retain(|resource, state| {
            flow.contains(resource)
                || degrade.contains(resource)
                || Self::lock(state).concurrency > 0
        });
        let pruned = before - resources.len();
        if pruned > 0 {
            debug!(pruned, "admission state pruned");
        }
        pruned
    }

    /// Drop state of resources whose rules are gone, returning how many went
    ///
    /// Runs on its own whenever a new resource is tracked.
    pub fn prune(&self) -> usize {
        let mut resources = self.resources.write().unwrap_or_else(|p| p.into_inner());
        self.prune_locked(&mut resources)
    }

    /// Number of resources with state
    pub fn tracked(&self) -> usize {
        self.resources
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .len()
    }

    fn existing(&self, resource: &str) -> Option<Arc<Mutex<ResourceState>>> {
        self.resources
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(resource)
            .cloned()
    }

    fn lock(state: &Mutex<ResourceState>) -> MutexGuard<'_, ResourceState> {
        state.lock().unwrap_or_else(|poisoned| {
            warn!("admission state lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Current breaker state, `None` if the resource was never entered
    pub fn circuit_state(&self, resource: &str) -> Option<CircuitState> {
        self.existing(resource)
            .map(|state| Self::lock(&state).circuit_state())
    }

    /// Entries currently open on `resource`
    pub fn concurrency(&self, resource: &str) -> u32 {
        self.existing(resource)
            .map_or(0, |state| Self::lock(&state).concurrency)
    }
}

impl AdmissionControl for LocalAdmission {
    fn try_enter(&self, resource: &str) -> Result<Permit, Blocked> {
        let flow = self.registries.flow.snapshot();
        let degrade = self.registries.degrade.snapshot();
        let flow_rule = flow.get(resource);
        let degrade_rule = degrade.get(resource);
        if flow_rule.is_none() && degrade_rule.is_none() {
            return Ok(UNTRACKED);
        }

        let state = self.state(resource);
        let mut state = Self::lock(&state);
        let now = Instant::now();

        if let Some(rule) = flow_rule
            && let Err(limit) = state.check_flow(rule, now)
        {
            debug!(resource, %limit, "flow rule blocked entry");
            return Err(Blocked::new(resource, BlockReason::Flow, Some(limit)));
        }

        let mut permit = Permit::PLAIN;
        if let Some(rule) = degrade_rule {
            state.roll_stats(now, Duration::from_millis(u64::from(rule.stat_interval_ms)));
            match state.check_breaker(now) {
                Some(granted) => permit = granted,
                None => {
                    debug!(resource, "breaker open, entry blocked");
                    return Err(Blocked::new(
                        resource,
                        BlockReason::Degrade,
                        Some(format!("breaker open for {}s", rule.time_window)),
                    ));
                }
            }
        }

        state.roll_qps(now);
        state.qps_passed += 1;
        state.concurrency += 1;
        Ok(permit)
    }

    fn exit(&self, resource: &str, permit: Permit, elapsed: Duration, faulted: bool) {
        if permit == UNTRACKED {
            return;
        }
        let Some(state) = self.existing(resource) else {
            return;
        };
        let mut state = Self::lock(&state);
        state.concurrency = state.concurrency.saturating_sub(1);

        let degrade = self.registries.degrade.snapshot();
        let Some(rule) = degrade.get(resource) else {
            return;
        };
        let now = Instant::now();

        if state.is_probe(permit) {
            if faulted {
                info!(resource, "probe failed, breaker re-opened");
                state.open(rule, now);
            } else {
                info!(resource, "probe succeeded, breaker closed");
                state.breaker = Breaker::Closed;
                state.reset_stats(now);
            }
            return;
        }
        if matches!(state.breaker, Breaker::HalfOpen { .. }) {
            debug!(resource, "non-probe entry exited while half-open");
        }

        state.roll_stats(now, Duration::from_millis(u64::from(rule.stat_interval_ms)));
        state.stat_total += 1;
        if rule.grade == DegradeGrade::SlowRequestRatio
            && elapsed.as_secs_f64() * 1000.0 > rule.count
        {
            state.stat_slow += 1;
        }
        if state.evaluate(rule, now) {
            info!(resource, grade = ?rule.grade, "breaker opened");
        }
    }

    fn trace_fault(&self, resource: &str, fault: &(dyn Error + 'static)) {
        let degrade = self.registries.degrade.snapshot();
        let Some(rule) = degrade.get(resource) else {
            return;
        };
        let state = self.state(resource);
        let mut state = Self::lock(&state);
        let now = Instant::now();

        state.roll_stats(now, Duration::from_millis(u64::from(rule.stat_interval_ms)));
        state.stat_faults += 1;
        debug!(resource, faults = state.stat_faults, error = %fault, "fault traced");
        if state.evaluate(rule, now) {
            info!(resource, grade = ?rule.grade, "breaker opened");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::types::{DegradeRule, FlowRule};

    fn admission() -> (Arc<Registries>, LocalAdmission) {
        let registries = Arc::new(Registries::new());
        let admission = LocalAdmission::new(registries.clone());
        (registries, admission)
    }

    fn fault() -> std::io::Error {
        std::io::Error::other("downstream unavailable")
    }

    #[test]
    fn test_no_rule_always_admits() {
        let (_, admission) = admission();
        for _ in 0..100 {
            admission.try_enter("r").unwrap();
        }
    }

    #[test]
    fn test_qps_window() {
        let (registries, admission) = admission();
        registries.flow.refresh("o", vec![FlowRule::qps("r", 2.0)]);

        admission.try_enter("r").unwrap();
        admission.try_enter("r").unwrap();
        let blocked = admission.try_enter("r").unwrap_err();
        assert_eq!(blocked.reason, BlockReason::Flow);
        assert_eq!(blocked.rule.as_deref(), Some("qps 2"));
    }

    #[test]
    fn test_concurrency_limit_released_on_exit() {
        let (registries, admission) = admission();
        registries.flow.refresh("o", vec![FlowRule::concurrency("r", 1.0)]);

        let permit = admission.try_enter("r").unwrap();
        assert!(admission.try_enter("r").is_err());
        assert_eq!(admission.concurrency("r"), 1);

        admission.exit("r", permit, Duration::ZERO, false);
        admission.try_enter("r").unwrap();
    }

    #[test]
    fn test_error_count_opens_breaker() {
        let (registries, admission) = admission();
        registries
            .degrade
            .refresh("o", vec![DegradeRule::error_count("r", 2.0, 60)]);

        admission.try_enter("r").unwrap();
        admission.trace_fault("r", &fault());
        assert_eq!(admission.circuit_state("r"), Some(CircuitState::Closed));
        admission.trace_fault("r", &fault());
        assert_eq!(admission.circuit_state("r"), Some(CircuitState::Open));

        let blocked = admission.try_enter("r").unwrap_err();
        assert_eq!(blocked.reason, BlockReason::Degrade);
    }

    #[test]
    fn test_half_open_probe() {
        let (registries, admission) = admission();
        registries
            .degrade
            .refresh("o", vec![DegradeRule::error_count("r", 1.0, 0)]);

        admission.trace_fault("r", &fault());
        assert_eq!(admission.circuit_state("r"), Some(CircuitState::Open));

        // Zero-second window: the next entry is the probe, others wait on it
        let probe = admission.try_enter("r").unwrap();
        assert_ne!(probe, Permit::PLAIN);
        assert_eq!(admission.circuit_state("r"), Some(CircuitState::HalfOpen));
        assert!(admission.try_enter("r").is_err());

        admission.exit("r", probe, Duration::ZERO, false);
        assert_eq!(admission.circuit_state("r"), Some(CircuitState::Closed));
    }

    #[test]
    fn test_failed_probe_reopens() {
        let (registries, admission) = admission();
        registries
            .degrade
            .refresh("o", vec![DegradeRule::error_count("r", 1.0, 0)]);

        admission.trace_fault("r", &fault());
        let probe = admission.try_enter("r").unwrap();
        admission.exit("r", probe, Duration::ZERO, true);
        assert_eq!(admission.circuit_state("r"), Some(CircuitState::Open));
    }

    #[test]
    fn test_only_the_probe_settles_half_open() {
        let (registries, admission) = admission();
        registries
            .degrade
            .refresh("o", vec![DegradeRule::error_count("r", 1.0, 0)]);

        // Long request admitted while closed
        let early = admission.try_enter("r").unwrap();
        admission.trace_fault("r", &fault());
        assert_eq!(admission.circuit_state("r"), Some(CircuitState::Open));

        let probe = admission.try_enter("r").unwrap();
        assert_eq!(admission.circuit_state("r"), Some(CircuitState::HalfOpen));

        admission.exit("r", early, Duration::from_secs(5), false);
        assert_eq!(admission.circuit_state("r"), Some(CircuitState::HalfOpen));
        assert!(admission.try_enter("r").is_err());

        admission.exit("r", probe, Duration::ZERO, false);
        assert_eq!(admission.circuit_state("r"), Some(CircuitState::Closed));
    }

    #[test]
    fn test_each_half_open_round_has_its_own_probe() {
        let (registries, admission) = admission();
        registries
            .degrade
            .refresh("o", vec![DegradeRule::error_count("r", 1.0, 0)]);

        admission.trace_fault("r", &fault());
        let first = admission.try_enter("r").unwrap();
        admission.exit("r", first, Duration::ZERO, true);
        assert_eq!(admission.circuit_state("r"), Some(CircuitState::Open));

        let second = admission.try_enter("r").unwrap();
        assert_ne!(first, second);
        // A repeated exit with the stale probe permit settles nothing
        admission.exit("r", first, Duration::ZERO, false);
        assert_eq!(admission.circuit_state("r"), Some(CircuitState::HalfOpen));
    }

    #[test]
    fn test_state_pruned_after_rules_removed() {
        let (registries, admission) = admission();
        registries.flow.refresh(
            "o",
            vec![FlowRule::qps("a", 10.0), FlowRule::qps("b", 10.0)],
        );

        let permit = admission.try_enter("a").unwrap();
        admission.exit("a", permit, Duration::ZERO, false);
        let held = admission.try_enter("b").unwrap();
        assert_eq!(admission.tracked(), 2);

        registries.flow.refresh("o", vec![FlowRule::qps("c", 10.0)]);

        // "b" still has an entry open and survives until it exits
        assert_eq!(admission.prune(), 1);
        assert_eq!(admission.circuit_state("a"), None);
        admission.exit("b", held, Duration::ZERO, false);

        // Tracking a new resource prunes on its own
        admission.try_enter("c").unwrap();
        assert_eq!(admission.tracked(), 1);
        assert_eq!(admission.circuit_state("b"), None);
    }

    #[test]
    fn test_uncovered_resource_keeps_no_state() {
        let (_, admission) = admission();
        let permit = admission.try_enter("r").unwrap();
        admission.exit("r", permit, Duration::ZERO, false);
        assert_eq!(admission.tracked(), 0);
    }

    #[test]
    fn test_fault_without_rule_is_ignored() {
        let (_, admission) = admission();
        admission.trace_fault("r", &fault());
        assert_eq!(admission.circuit_state("r"), None);
    }
}
