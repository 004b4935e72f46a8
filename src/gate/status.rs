//! Response classification and rejection payloads

use crate::admission::{BlockReason, Blocked};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Known downstream response statuses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RespStatus {
    Ok,
    NotFound,
    TooManyRequests,
    InternalError,
    BadGateway,
    ServiceUnavailable,
    GatewayTimeout,
    Unknown(u16),
}

impl RespStatus {
    pub fn from_code(code: u16) -> Self {
        match code {
            200 => RespStatus::Ok,
            404 => RespStatus::NotFound,
            429 => RespStatus::TooManyRequests,
            500 => RespStatus::InternalError,
            502 => RespStatus::BadGateway,
            503 => RespStatus::ServiceUnavailable,
            504 => RespStatus::GatewayTimeout,
            other => RespStatus::Unknown(other),
        }
    }

    /// Whether this outcome counts against the downstream's breaker
    ///
    /// Successful, not-found and throttled responses mean the downstream is
    /// up; server errors and unrecognised statuses mean it is not.
    pub fn is_service_unavailable(&self) -> bool {
        match self {
            RespStatus::Ok | RespStatus::NotFound | RespStatus::TooManyRequests => false,
            RespStatus::Unknown(code) => !(200..300).contains(code),
            RespStatus::InternalError
            | RespStatus::BadGateway
            | RespStatus::ServiceUnavailable
            | RespStatus::GatewayTimeout => true,
        }
    }
}

/// Shorthand for `RespStatus::from_code(code).is_service_unavailable()`
pub fn is_service_unavailable(code: u16) -> bool {
    RespStatus::from_code(code).is_service_unavailable()
}

/// Machine-readable refusal returned to callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub code: u16,
    pub msg: String,
}

impl Rejection {
    fn new(code: u16, msg: &str) -> Self {
        Self {
            code,
            msg: msg.to_string(),
        }
    }

    pub fn too_many_requests() -> Self {
        Self::new(429, "request.too.many")
    }

    pub fn service_unavailable() -> Self {
        Self::new(503, "service.not.available")
    }

    pub fn internal_error() -> Self {
        Self::new(500, "server.internal.error")
    }

    pub fn service_error() -> Self {
        Self::new(502, "service.error")
    }

    pub fn timeout() -> Self {
        Self::new(504, "service.timeout")
    }

    /// Payload for an admission refusal
    pub fn for_blocked(blocked: &Blocked) -> Self {
        match blocked.reason {
            BlockReason::Flow => Self::too_many_requests(),
            BlockReason::Degrade => Self::service_unavailable(),
            BlockReason::Other => Self::internal_error(),
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.msg)
    }
}
