//! Admission control
//!
//! The gate talks to the flow-control engine through [`AdmissionControl`]:
//! enter a resource, exit it, and report faults against it. [`Entry`] pairs
//! enter with exit structurally; dropping it on any path releases the slot.
//!
//! [`LocalAdmission`] is the in-process engine used by the binary and the
//! tests. It reads the global registries directly.

pub mod local;

pub use local::{CircuitState, LocalAdmission};

use serde::Serialize;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::trace;

/// Why an entry was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockReason {
    /// A flow rule's threshold was reached
    Flow,
    /// A degrade rule's breaker is open
    Degrade,
    /// Any other refusal by the engine
    Other,
}

impl BlockReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockReason::Flow => "flow",
            BlockReason::Degrade => "degrade",
            BlockReason::Other => "other",
        }
    }
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Refusal returned by [`AdmissionControl::try_enter`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Blocked {
    pub resource: String,
    pub reason: BlockReason,
    /// Description of the rule that refused the entry, if known
    pub rule: Option<String>,
}

impl Blocked {
    pub fn new(resource: impl Into<String>, reason: BlockReason, rule: Option<String>) -> Self {
        Self {
            resource: resource.into(),
            reason,
            rule,
        }
    }
}

impl fmt::Display for Blocked {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Blocked by {} rule on '{}'", self.reason, self.resource)?;
        if let Some(rule) = &self.rule {
            write!(f, " ({rule})")?;
        }
        Ok(())
    }
}

impl Error for Blocked {}

/// Engine-issued token for one admitted entry
///
/// Handed back on exit so the engine can tell entries apart, e.g. the one
/// probe it let through a half-open breaker from entries admitted earlier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Permit(pub u64);

impl Permit {
    /// Token carrying nothing engine-specific
    pub const PLAIN: Permit = Permit(0);
}

/// Flow-control engine seam
///
/// Implementations must be non-blocking and safe to call from any thread;
/// they read rules from snapshots, never from a lock the refresh path holds.
pub trait AdmissionControl: Send + Sync {
    /// Try to take a slot on `resource`
    fn try_enter(&self, resource: &str) -> Result<Permit, Blocked>;

    /// Release a slot taken by `try_enter`
    fn exit(&self, resource: &str, permit: Permit, elapsed: Duration, faulted: bool);

    /// Record a downstream fault against `resource`
    fn trace_fault(&self, resource: &str, fault: &(dyn Error + 'static));
}

/// Shared engine type alias
pub type SharedAdmission = Arc<dyn AdmissionControl>;

/// An open slot on a resource; released on drop
#[must_use = "dropping an Entry releases it immediately"]
pub struct Entry {
    admission: SharedAdmission,
    resource: String,
    permit: Permit,
    started: Instant,
    faulted: bool,
}

impl Entry {
    /// Take a slot on `resource`
    pub fn enter(admission: &SharedAdmission, resource: impl Into<String>) -> Result<Self, Blocked> {
        let resource = resource.into();
        let permit = admission.try_enter(&resource)?;
        trace!(resource = %resource, "entry opened");
        Ok(Self {
            admission: admission.clone(),
            resource,
            permit,
            started: Instant::now(),
            faulted: false,
        })
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn is_faulted(&self) -> bool {
        self.faulted
    }

    /// Report a downstream fault for this entry
    pub fn trace(&mut self, fault: &(dyn Error + 'static)) {
        self.faulted = true;
        self.admission.trace_fault(&self.resource, fault);
    }

    /// Release explicitly; same as dropping
    pub fn exit(self) {}
}

impl Drop for Entry {
    fn drop(&mut self) {
        self.admission.exit(
            &self.resource,
            self.permit,
            self.started.elapsed(),
            self.faulted,
        );
        trace!(resource = %self.resource, faulted = self.faulted, "entry closed");
    }
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("resource", &self.resource)
            .field("faulted", &self.faulted)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        events: Mutex<Vec<String>>,
        deny: bool,
    }

    impl AdmissionControl for Recording {
        fn try_enter(&self, resource: &str) -> Result<Permit, Blocked> {
            if self.deny {
                return Err(Blocked::new(resource, BlockReason::Other, None));
            }
            self.events.lock().unwrap().push(format!("enter {resource}"));
            Ok(Permit::PLAIN)
        }

        fn exit(&self, resource: &str, _permit: Permit, _elapsed: Duration, faulted: bool) {
            self.events
                .lock()
                .unwrap()
                .push(format!("exit {resource} faulted={faulted}"));
        }

        fn trace_fault(&self, resource: &str, fault: &(dyn Error + 'static)) {
            self.events
                .lock()
                .unwrap()
                .push(format!("fault {resource}: {fault}"));
        }
    }

    #[test]
    fn test_entry_exits_on_drop() {
        let recording = Arc::new(Recording::default());
        let admission: SharedAdmission = recording.clone();
        {
            let _entry = Entry::enter(&admission, "r").unwrap();
        }
        assert_eq!(
            *recording.events.lock().unwrap(),
            ["enter r", "exit r faulted=false"]
        );
    }

    #[test]
    fn test_entry_exits_on_panic() {
        let recording = Arc::new(Recording::default());
        let admission: SharedAdmission = recording.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _entry = Entry::enter(&admission, "r").unwrap();
            panic!("handler failed");
        }));
        assert!(result.is_err());
        assert_eq!(recording.events.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_trace_marks_entry_faulted() {
        let recording = Arc::new(Recording::default());
        let admission: SharedAdmission = recording.clone();
        let mut entry = Entry::enter(&admission, "r").unwrap();
        let fault = std::io::Error::other("boom");
        entry.trace(&fault);
        assert!(entry.is_faulted());
        entry.exit();

        assert_eq!(
            *recording.events.lock().unwrap(),
            ["enter r", "fault r: boom", "exit r faulted=true"]
        );
    }

    #[test]
    fn test_denied_entry_never_exits() {
        let recording = Arc::new(Recording {
            deny: true,
            ..Default::default()
        });
        let admission: SharedAdmission = recording.clone();
        let blocked = Entry::enter(&admission, "r").unwrap_err();
        assert_eq!(blocked.reason, BlockReason::Other);
        assert!(recording.events.lock().unwrap().is_empty());
    }

    #[test]
    fn test_blocked_display() {
        let blocked = Blocked::new("web#app#GET#/a", BlockReason::Flow, Some("qps 10".into()));
        assert_eq!(
            blocked.to_string(),
            "Blocked by flow rule on 'web#app#GET#/a' (qps 10)"
        );
    }
}
