//! Enforcement gate
//!
//! The per-request call site every adapter goes through:
//!
//! ```text
//! resolved key? ──no──▶ Unrestricted
//!      │yes
//!   try_enter ──deny──▶ Blocked(reason)
//!      │ok
//!   Proceed(Entry) ──downstream fault──▶ trace ──▶ exit on drop
//! ```
//!
//! A missing rule never denies a request.

pub mod status;

pub use status::{Rejection, RespStatus, is_service_unavailable};

use crate::admission::{Blocked, Entry, SharedAdmission};
use crate::dashboard::GateMetrics;
use crate::error::GuardError;
use std::error::Error;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

/// Result of trying to pass the gate
#[derive(Debug)]
pub enum EnforcementOutcome {
    /// A rule applies and admitted the request; hold the entry until done
    Proceed(Entry),
    /// A rule applies and refused the request
    Blocked(Blocked),
    /// No rule applies
    Unrestricted,
}

impl EnforcementOutcome {
    pub fn is_blocked(&self) -> bool {
        matches!(self, EnforcementOutcome::Blocked(_))
    }

    pub fn is_unrestricted(&self) -> bool {
        matches!(self, EnforcementOutcome::Unrestricted)
    }
}

/// Shared enforcement entry point
#[derive(Clone)]
pub struct Gate {
    admission: SharedAdmission,
    metrics: Option<Arc<GateMetrics>>,
}

impl Gate {
    pub fn new(admission: SharedAdmission) -> Self {
        Self {
            admission,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<GateMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn metrics(&self) -> Option<&Arc<GateMetrics>> {
        self.metrics.as_ref()
    }

    pub fn admission(&self) -> &SharedAdmission {
        &self.admission
    }

    /// Open an entry for a resolved resource key
    pub fn resolve_and_enter(&self, resource: Option<&str>) -> EnforcementOutcome {
        let Some(resource) = resource else {
            return EnforcementOutcome::Unrestricted;
        };

        match Entry::enter(&self.admission, resource) {
            Ok(entry) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_passed(resource);
                }
                EnforcementOutcome::Proceed(entry)
            }
            Err(blocked) => {
                warn!(
                    resource = %blocked.resource,
                    reason = %blocked.reason,
                    rule = blocked.rule.as_deref().unwrap_or("-"),
                    "request blocked"
                );
                if let Some(metrics) = &self.metrics {
                    metrics.record_blocked(&blocked);
                }
                EnforcementOutcome::Blocked(blocked)
            }
        }
    }

    /// Report a downstream fault against an open entry
    pub fn trace(&self, entry: &mut Entry, fault: &(dyn Error + 'static)) {
        debug!(resource = %entry.resource(), error = %fault, "tracing downstream fault");
        entry.trace(fault);
        if let Some(metrics) = &self.metrics {
            metrics.record_fault(entry.resource());
        }
    }

    /// Run `call` behind the gate, tracing every error it returns
    pub async fn guard<T, E, Fut>(
        &self,
        resource: Option<&str>,
        call: Fut,
    ) -> Result<T, GuardError<E>>
    where
        Fut: Future<Output = Result<T, E>>,
        E: Error + 'static,
    {
        self.guard_classified(resource, call, |_| true).await
    }

    /// Run `call` behind the gate, tracing only errors `is_fault` accepts
    pub async fn guard_classified<T, E, Fut, C>(
        &self,
        resource: Option<&str>,
        call: Fut,
        is_fault: C,
    ) -> Result<T, GuardError<E>>
    where
        Fut: Future<Output = Result<T, E>>,
        E: Error + 'static,
        C: Fn(&E) -> bool,
    {
        match self.resolve_and_enter(resource) {
            EnforcementOutcome::Unrestricted => call.await.map_err(GuardError::Downstream),
            EnforcementOutcome::Blocked(blocked) => Err(GuardError::Blocked(blocked)),
            EnforcementOutcome::Proceed(mut entry) => {
                let result = call.await;
                if let Err(e) = &result
                    && is_fault(e)
                {
                    self.trace(&mut entry, e);
                }
                entry.exit();
                result.map_err(GuardError::Downstream)
            }
        }
    }
}
