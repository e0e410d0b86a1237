//! The behavior seam between the bus and business logic

use async_trait::async_trait;
use serde_json::{json, Value};

use valora_core::{AgentExperience, BusError};

/// What a concrete agent actually does
///
/// [`process_request`](Behavior::process_request) is the only method an
/// implementer must supply; everything else defaults to cooperative no-ops.
/// Payloads and results are opaque JSON agreed out of band with the callers.
#[async_trait]
pub trait Behavior: Send + Sync {
    /// Handle one request payload, returning the result or an error.
    async fn process_request(&self, payload: &Value) -> Result<Value, BusError>;

    /// Cooperate in capability-based help routing.
    ///
    /// Returning `Ok(Some(result))` answers the requester with an
    /// `ASSISTANCE_PROVIDED` message; `Ok(None)` declines silently. The
    /// default declines.
    async fn handle_help_request(
        &self,
        _payload: &Value,
        _requester: &str,
    ) -> Result<Option<Value>, BusError> {
        Ok(None)
    }

    /// Consume a batch of buffered experiences.
    ///
    /// The returned summary is sent back as a `STATUS_UPDATE`. The default
    /// learns nothing.
    async fn learn(&self, experiences: &[AgentExperience]) -> Result<Value, BusError> {
        Ok(json!({ "learned": 0, "offered": experiences.len() }))
    }
}
