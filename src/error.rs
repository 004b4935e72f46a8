//! Error types for flowguard
//!
//! This module defines the error hierarchy used throughout the crate.
//! We use `thiserror` for library-style errors that are part of the API;
//! only the binary reaches for `anyhow`.

use crate::admission::Blocked;
use thiserror::Error;

/// Top-level application error
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Config source error: {0}")]
    Source(#[from] SourceError),

    #[error("Rule error: {0}")]
    Rule(#[from] RuleError),

    #[error("Subscription error: {0}")]
    Subscription(#[from] SubscriptionError),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(String),

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required configuration: {field}")]
    Missing { field: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Remote configuration store errors
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Config '{group}/{file_id}' unavailable: {reason}")]
    Unavailable {
        file_id: String,
        group: String,
        reason: String,
    },

    #[error("Fetching '{group}/{file_id}' timed out after {timeout_ms} ms")]
    Timeout {
        file_id: String,
        group: String,
        timeout_ms: u64,
    },

    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Config server error (HTTP {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Unknown subscription handle {0}")]
    UnknownHandle(u64),
}

/// Rule payload and key errors
#[derive(Error, Debug)]
pub enum RuleError {
    #[error("Malformed rule payload: {0}")]
    MalformedPayload(#[from] serde_json::Error),

    #[error("Malformed key component {component} '{value}': must not contain '#'")]
    MalformedKey {
        component: &'static str,
        value: String,
    },

    #[error("Invalid path template '{template}': {reason}")]
    InvalidTemplate { template: String, reason: String },
}

/// Subscription lifecycle errors
#[derive(Error, Debug)]
pub enum SubscriptionError {
    #[error("Config unavailable, cannot start rule watching: {0}")]
    ConfigUnavailable(#[from] SourceError),

    #[error("Subscription for {kind} rules '{group}/{file_id}' is already active")]
    AlreadyActive {
        kind: &'static str,
        file_id: String,
        group: String,
    },
}

/// Failures of a guarded outbound HTTP call
#[derive(Error, Debug)]
pub enum RpcError {
    #[error("Request to {app} failed: {source}")]
    Transport {
        app: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Request to {app} timed out after {timeout_ms} ms")]
    Timeout { app: String, timeout_ms: u64 },
}

/// A downstream response whose status marks the service unavailable
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Downstream responded with HTTP {0}")]
pub struct UnavailableStatus(pub u16);

/// Outcome of a guarded call that did not succeed
///
/// `Blocked` means admission control refused the entry and the downstream
/// call never ran; `Downstream` carries the protected call's own failure
/// after it has been traced.
#[derive(Error, Debug)]
pub enum GuardError<E>
where
    E: std::error::Error + 'static,
{
    #[error("{0}")]
    Blocked(Blocked),

    #[error("Downstream call failed: {0}")]
    Downstream(#[source] E),
}

impl<E> GuardError<E>
where
    E: std::error::Error + 'static,
{
    pub fn is_blocked(&self) -> bool {
        matches!(self, GuardError::Blocked(_))
    }

    /// The admission-control refusal, if this is one
    pub fn blocked(&self) -> Option<&Blocked> {
        match self {
            GuardError::Blocked(b) => Some(b),
            GuardError::Downstream(_) => None,
        }
    }
}

/// Result type alias for the application
pub type Result<T> = std::result::Result<T, AppError>;

/// Result type alias for remote config operations
pub type SourceResult<T> = std::result::Result<T, SourceError>;
