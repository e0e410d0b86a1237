//! Error taxonomy for the agent bus
//!
//! A closed set of failure categories. Several variants are reserved for
//! callers layered above the bus and are not produced by the bus itself.

use serde_json::{json, Value};

use crate::message::AgentId;

/// Bus-level error taxonomy
///
/// Every variant maps to a stable wire code via [`BusError::code`], which is
/// what `ERROR` message payloads carry.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BusError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("processing failed: {0}")]
    Processing(String),
    #[error("invalid message: {0}")]
    InvalidMessage(String),
    #[error("unknown agent: {0}")]
    UnknownAgent(AgentId),
    #[error("agent unreachable: {0}")]
    AgentUnreachable(AgentId),
    /// Reserved
    #[error("system overloaded: {0}")]
    SystemOverload(String),
    /// Reserved
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    /// Reserved
    #[error("not implemented: {0}")]
    NotImplemented(String),
    #[error("no agent satisfies required capabilities: {0}")]
    CapabilityMismatch(String),
    /// Reserved
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// Reserved
    #[error("forbidden: {0}")]
    Forbidden(String),
}

impl BusError {
    /// Stable wire code embedded in `ERROR` payloads
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Timeout(_) => "TIMEOUT_ERROR",
            Self::Processing(_) => "PROCESSING_ERROR",
            Self::InvalidMessage(_) => "INVALID_MESSAGE",
            Self::UnknownAgent(_) => "UNKNOWN_AGENT",
            Self::AgentUnreachable(_) => "AGENT_UNREACHABLE",
            Self::SystemOverload(_) => "SYSTEM_OVERLOAD",
            Self::ResourceExhausted(_) => "RESOURCE_EXHAUSTED",
            Self::NotImplemented(_) => "NOT_IMPLEMENTED",
            Self::CapabilityMismatch(_) => "CAPABILITY_MISMATCH",
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::Forbidden(_) => "FORBIDDEN",
        }
    }

    /// Payload for an `ERROR` message describing this failure
    pub fn to_payload(&self) -> Value {
        json!({
            "error": self.code(),
            "message": self.to_string(),
        })
    }
}
