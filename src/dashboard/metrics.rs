//! Enforcement metrics for the dashboard
//!
//! Thread-safe counters for entries passed, blocked and faulted per
//! resource and per namespace, plus a bounded log of recent rejections.

use crate::admission::{BlockReason, Blocked};
use crate::rules::key::RuleKey;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant, SystemTime};

/// Enforcement metrics collector
pub struct GateMetrics {
    start_time: Instant,
    start_system_time: SystemTime,
    total_passed: AtomicU64,
    total_blocked: AtomicU64,
    total_faulted: AtomicU64,
    /// Single lock for all collections
    data: RwLock<MetricsData>,
    max_recent_rejections: usize,
}

#[derive(Default)]
struct ResourceStatsInner {
    passed: u64,
    blocked_flow: u64,
    blocked_degrade: u64,
    blocked_other: u64,
    faulted: u64,
    last_seen: Option<SystemTime>,
}

impl ResourceStatsInner {
    fn blocked(&self) -> u64 {
        self.blocked_flow + self.blocked_degrade + self.blocked_other
    }
}

#[derive(Default)]
struct NamespaceStatsInner {
    passed: u64,
    blocked: u64,
    faulted: u64,
}

#[derive(Default)]
struct MetricsData {
    resources: HashMap<String, ResourceStatsInner>,
    namespaces: HashMap<String, NamespaceStatsInner>,
    recent_rejections: VecDeque<RejectionRecord>,
}

impl MetricsData {
    fn resource(&mut self, resource: &str) -> &mut ResourceStatsInner {
        self.resources.entry(resource.to_string()).or_default()
    }

    fn namespace(&mut self, resource: &str) -> &mut NamespaceStatsInner {
        let namespace = RuleKey::decode(resource)
            .map(|k| k.namespace)
            .unwrap_or("unknown");
        self.namespaces.entry(namespace.to_string()).or_default()
    }
}

/// One refused entry
#[derive(Debug, Clone, Serialize)]
pub struct RejectionRecord {
    pub resource: String,
    pub reason: BlockReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
    pub timestamp: u64,
}

/// Serializable per-resource statistics
#[derive(Debug, Clone, Serialize)]
pub struct ResourceStats {
    pub resource: String,
    pub passed: u64,
    pub blocked_flow: u64,
    pub blocked_degrade: u64,
    pub blocked_other: u64,
    pub faulted: u64,
    pub last_seen: Option<u64>,
}

/// Serializable per-namespace statistics
#[derive(Debug, Clone, Serialize)]
pub struct NamespaceStats {
    pub name: String,
    pub passed: u64,
    pub blocked: u64,
    pub faulted: u64,
}

/// Overall metrics snapshot for the API
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub start_time: u64,
    pub total_passed: u64,
    pub total_blocked: u64,
    pub total_faulted: u64,
    pub resources: Vec<ResourceStats>,
    pub namespaces: Vec<NamespaceStats>,
    pub recent_rejections: Vec<RejectionRecord>,
}

fn unix_secs(t: SystemTime) -> u64 {
    t.duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl GateMetrics {
    pub fn new() -> Self {
        Self::with_capacity(100)
    }

    /// Create a collector keeping at most `max_recent_rejections` records
    pub fn with_capacity(max_recent_rejections: usize) -> Self {
        Self {
            start_time: Instant::now(),
            start_system_time: SystemTime::now(),
            total_passed: AtomicU64::new(0),
            total_blocked: AtomicU64::new(0),
            total_faulted: AtomicU64::new(0),
            data: RwLock::new(MetricsData {
                recent_rejections: VecDeque::with_capacity(max_recent_rejections),
                ..Default::default()
            }),
            max_recent_rejections,
        }
    }

    fn write_data(&self) -> RwLockWriteGuard<'_, MetricsData> {
        self.data.write().unwrap_or_else(|poisoned| {
            tracing::warn!("metrics data lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn read_data(&self) -> RwLockReadGuard<'_, MetricsData> {
        self.data.read().unwrap_or_else(|poisoned| {
            tracing::warn!("metrics data lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Record an admitted entry
    pub fn record_passed(&self, resource: &str) {
        self.total_passed.fetch_add(1, Ordering::Relaxed);
        let mut data = self.write_data();
        let stats = data.resource(resource);
        stats.passed += 1;
        stats.last_seen = Some(SystemTime::now());
        data.namespace(resource).passed += 1;
    }

    /// Record a refused entry
    pub fn record_blocked(&self, blocked: &Blocked) {
        self.total_blocked.fetch_add(1, Ordering::Relaxed);
        let now = SystemTime::now();
        let mut data = self.write_data();

        let stats = data.resource(&blocked.resource);
        match blocked.reason {
            BlockReason::Flow => stats.blocked_flow += 1,
            BlockReason::Degrade => stats.blocked_degrade += 1,
            BlockReason::Other => stats.blocked_other += 1,
        }
        stats.last_seen = Some(now);
        data.namespace(&blocked.resource).blocked += 1;

        if data.recent_rejections.len() >= self.max_recent_rejections {
            data.recent_rejections.pop_front();
        }
        data.recent_rejections.push_back(RejectionRecord {
            resource: blocked.resource.clone(),
            reason: blocked.reason,
            rule: blocked.rule.clone(),
            timestamp: unix_secs(now),
        });
    }

    /// Record a downstream fault traced against a resource
    pub fn record_fault(&self, resource: &str) {
        self.total_faulted.fetch_add(1, Ordering::Relaxed);
        let mut data = self.write_data();
        data.resource(resource).faulted += 1;
        data.namespace(resource).faulted += 1;
    }

    /// Get a snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        let data = self.read_data();

        let mut resources: Vec<ResourceStats> = data
            .resources
            .iter()
            .map(|(name, s)| ResourceStats {
                resource: name.clone(),
                passed: s.passed,
                blocked_flow: s.blocked_flow,
                blocked_degrade: s.blocked_degrade,
                blocked_other: s.blocked_other,
                faulted: s.faulted,
                last_seen: s.last_seen.map(unix_secs),
            })
            .collect();
        resources.sort_unstable_by(|a, b| {
            let total = |r: &ResourceStats| {
                r.passed + r.blocked_flow + r.blocked_degrade + r.blocked_other
            };
            total(b).cmp(&total(a)).then_with(|| a.resource.cmp(&b.resource))
        });

        let mut namespaces: Vec<NamespaceStats> = data
            .namespaces
            .iter()
            .map(|(name, s)| NamespaceStats {
                name: name.clone(),
                passed: s.passed,
                blocked: s.blocked,
                faulted: s.faulted,
            })
            .collect();
        namespaces.sort_unstable_by(|a, b| a.name.cmp(&b.name));

        let recent_rejections: Vec<_> = data.recent_rejections.iter().cloned().collect();
        drop(data);

        MetricsSnapshot {
            uptime_secs: self.start_time.elapsed().as_secs(),
            start_time: unix_secs(self.start_system_time),
            total_passed: self.total_passed.load(Ordering::Relaxed),
            total_blocked: self.total_blocked.load(Ordering::Relaxed),
            total_faulted: self.total_faulted.load(Ordering::Relaxed),
            resources,
            namespaces,
            recent_rejections,
        }
    }

    /// Blocked count of one resource
    pub fn blocked_count(&self, resource: &str) -> u64 {
        self.read_data()
            .resources
            .get(resource)
            .map_or(0, ResourceStatsInner::blocked)
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn total_passed(&self) -> u64 {
        self.total_passed.load(Ordering::Relaxed)
    }

    pub fn total_blocked(&self) -> u64 {
        self.total_blocked.load(Ordering::Relaxed)
    }

    pub fn total_faulted(&self) -> u64 {
        self.total_faulted.load(Ordering::Relaxed)
    }
}

impl Default for GateMetrics {
    fn default() -> Self {
        Self::new()
    }
}
