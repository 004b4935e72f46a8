//! Rule types
//!
//! Flow (rate/concurrency limiting) and degrade (circuit breaking) rules as
//! they travel on the wire. Field names follow the admission engine's JSON
//! schema (camelCase); unknown fields are ignored so newer dashboards can
//! publish extra attributes without breaking older agents.

use crate::rules::registry::{GlobalRegistry, Registries};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Default `limitApp` when a payload omits it
pub const DEFAULT_LIMIT_APP: &str = "default";

/// Kind of rule; each kind has its own global registry and refresh lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleKind {
    Flow,
    Degrade,
}

impl RuleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleKind::Flow => "flow",
            RuleKind::Degrade => "degrade",
        }
    }

    pub fn all() -> &'static [RuleKind] {
        &[RuleKind::Flow, RuleKind::Degrade]
    }
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Common behaviour of every rule kind
///
/// Rules are value objects. Two rules are "the same rule" for diffing when
/// their `resource` strings are equal; every other field is payload.
pub trait Rule:
    Clone + fmt::Debug + Send + Sync + Serialize + DeserializeOwned + 'static
{
    const KIND: RuleKind;

    fn resource(&self) -> &str;

    fn set_resource(&mut self, resource: String);

    fn limit_app(&self) -> &str;

    /// The global registry that holds rules of this kind
    fn registry(registries: &Registries) -> &GlobalRegistry<Self>;
}

fn default_limit_app() -> String {
    DEFAULT_LIMIT_APP.to_string()
}

/// Flow threshold type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlowGrade {
    /// Concurrent in-flight entries
    Thread,
    /// Entries per second
    #[default]
    Qps,
}

/// Which resource the flow statistics are taken from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlowStrategy {
    #[default]
    Direct,
    Relate,
    Chain,
}

/// What happens to traffic over the threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ControlBehavior {
    #[default]
    Reject,
    WarmUp,
    RateLimiter,
    WarmUpRateLimiter,
}

/// Circuit-breaking trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DegradeGrade {
    /// Ratio of slow requests over `count` ms
    #[default]
    SlowRequestRatio,
    /// Ratio of failed requests
    ErrorRatio,
    /// Absolute number of failed requests
    ErrorCount,
}

// Enums travel as integer codes on the wire.
macro_rules! int_coded {
    ($ty:ident { $($code:literal => $variant:ident),+ $(,)? }) => {
        impl Serialize for $ty {
            fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
                let code: u8 = match self {
                    $($ty::$variant => $code,)+
                };
                s.serialize_u8(code)
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
                let code = u8::deserialize(d)?;
                match code {
                    $($code => Ok($ty::$variant),)+
                    other => Err(serde::de::Error::custom(format!(
                        "invalid {} code {}",
                        stringify!($ty),
                        other
                    ))),
                }
            }
        }
    };
}

int_coded!(FlowGrade { 0 => Thread, 1 => Qps });
int_coded!(FlowStrategy { 0 => Direct, 1 => Relate, 2 => Chain });
int_coded!(ControlBehavior { 0 => Reject, 1 => WarmUp, 2 => RateLimiter, 3 => WarmUpRateLimiter });
int_coded!(DegradeGrade { 0 => SlowRequestRatio, 1 => ErrorRatio, 2 => ErrorCount });

/// Rate/concurrency limiting rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowRule {
    pub resource: String,

    #[serde(default = "default_limit_app")]
    pub limit_app: String,

    #[serde(default)]
    pub grade: FlowGrade,

    /// Threshold, interpreted according to `grade`
    #[serde(default)]
    pub count: f64,

    #[serde(default)]
    pub strategy: FlowStrategy,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ref_resource: Option<String>,

    #[serde(default)]
    pub control_behavior: ControlBehavior,

    #[serde(default = "FlowRule::default_warm_up_period_sec")]
    pub warm_up_period_sec: u32,

    #[serde(default = "FlowRule::default_max_queueing_time_ms")]
    pub max_queueing_time_ms: u32,

    #[serde(default)]
    pub cluster_mode: bool,
}

impl FlowRule {
    fn default_warm_up_period_sec() -> u32 {
        10
    }

    fn default_max_queueing_time_ms() -> u32 {
        500
    }

    /// A QPS rule with default behaviour
    pub fn qps(resource: impl Into<String>, count: f64) -> Self {
        Self {
            resource: resource.into(),
            limit_app: default_limit_app(),
            grade: FlowGrade::Qps,
            count,
            strategy: FlowStrategy::Direct,
            ref_resource: None,
            control_behavior: ControlBehavior::Reject,
            warm_up_period_sec: Self::default_warm_up_period_sec(),
            max_queueing_time_ms: Self::default_max_queueing_time_ms(),
            cluster_mode: false,
        }
    }

    /// A concurrency rule with default behaviour
    pub fn concurrency(resource: impl Into<String>, count: f64) -> Self {
        Self {
            grade: FlowGrade::Thread,
            ..Self::qps(resource, count)
        }
    }

    pub fn with_limit_app(mut self, limit_app: impl Into<String>) -> Self {
        self.limit_app = limit_app.into();
        self
    }
}

impl Rule for FlowRule {
    const KIND: RuleKind = RuleKind::Flow;

    fn resource(&self) -> &str {
        &self.resource
    }

    fn set_resource(&mut self, resource: String) {
        self.resource = resource;
    }

    fn limit_app(&self) -> &str {
        &self.limit_app
    }

    fn registry(registries: &Registries) -> &GlobalRegistry<Self> {
        &registries.flow
    }
}

/// Circuit-breaking rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DegradeRule {
    pub resource: String,

    #[serde(default = "default_limit_app")]
    pub limit_app: String,

    #[serde(default)]
    pub grade: DegradeGrade,

    /// Threshold: max response time (ms), error ratio, or error count
    #[serde(default)]
    pub count: f64,

    /// Recovery window in seconds once the breaker opens
    #[serde(default)]
    pub time_window: u32,

    #[serde(default = "DegradeRule::default_min_request_amount")]
    pub min_request_amount: u32,

    #[serde(default = "DegradeRule::default_slow_ratio_threshold")]
    pub slow_ratio_threshold: f64,

    #[serde(default = "DegradeRule::default_stat_interval_ms")]
    pub stat_interval_ms: u32,
}

impl DegradeRule {
    fn default_min_request_amount() -> u32 {
        5
    }

    fn default_slow_ratio_threshold() -> f64 {
        1.0
    }

    fn default_stat_interval_ms() -> u32 {
        1000
    }

    /// An error-count breaker
    pub fn error_count(resource: impl Into<String>, count: f64, time_window: u32) -> Self {
        Self {
            resource: resource.into(),
            limit_app: default_limit_app(),
            grade: DegradeGrade::ErrorCount,
            count,
            time_window,
            min_request_amount: Self::default_min_request_amount(),
            slow_ratio_threshold: Self::default_slow_ratio_threshold(),
            stat_interval_ms: Self::default_stat_interval_ms(),
        }
    }

    pub fn with_limit_app(mut self, limit_app: impl Into<String>) -> Self {
        self.limit_app = limit_app.into();
        self
    }
}

impl Rule for DegradeRule {
    const KIND: RuleKind = RuleKind::Degrade;

    fn resource(&self) -> &str {
        &self.resource
    }

    fn set_resource(&mut self, resource: String) {
        self.resource = resource;
    }

    fn limit_app(&self) -> &str {
        &self.limit_app
    }

    fn registry(registries: &Registries) -> &GlobalRegistry<Self> {
        &registries.degrade
    }
}

/// Parse a rule payload
///
/// Absent or blank payloads are an empty rule list. Anything that is not a
/// JSON array of rules is an error; callers decide whether to fail open.
pub fn parse_rules<R: Rule>(payload: Option<&str>) -> Result<Vec<R>, serde_json::Error> {
    match payload.map(str::trim) {
        None | Some("") => Ok(Vec::new()),
        Some(body) => serde_json::from_str(body),
    }
}
