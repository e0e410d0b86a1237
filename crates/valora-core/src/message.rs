//! Message envelope for the Valora agent bus
//!
//! An [`AgentMessage`] is the unit passed between agents and the router.
//! Targets are closed: the router itself, the broadcast address, or a
//! concrete agent id. Event types are a closed enum; anything else is
//! rejected at ingress.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::BusError;

/// Stable identifier of an agent (e.g. `"valuation-agent"`)
pub type AgentId = String;

/// Source id used by the embedding application itself
pub const CORE_SOURCE: &str = "CORE";

/// Message event types (closed set)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    /// Ask an agent to process a payload
    Request,
    /// Successful answer to a `Request`
    Response,
    /// Failure answer, payload carries the error code
    Error,
    /// Ask the router to find a capable helper
    AssistanceRequested,
    /// Helper's answer to an assistance request
    AssistanceProvided,
    /// Feed buffered experiences to an agent
    LearningTriggered,
    /// Lightweight state notification / acknowledgment
    StatusUpdate,
    /// Built-in command (agent-level or router-level)
    Command,
    /// Answer to a `Command`
    CommandResult,
    /// Fan-out to every registered agent
    Broadcast,
    /// Liveness ping
    Heartbeat,
    /// Welcome message sent on registration
    Registration,
}

/// Delivery target of a message
///
/// Serializes as the literal addresses `"MCP"` and `"BROADCAST"`, or the
/// agent id itself, so the web layer can submit raw JSON messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Target {
    /// The router handles the message itself
    Mcp,
    /// Delivered to every registered agent except the sender
    Broadcast,
    /// Delivered to one named agent
    Agent(AgentId),
}

impl From<String> for Target {
    fn from(s: String) -> Self {
        match s.as_str() {
            "MCP" => Target::Mcp,
            "BROADCAST" => Target::Broadcast,
            _ => Target::Agent(s),
        }
    }
}

impl From<Target> for String {
    fn from(t: Target) -> Self {
        match t {
            Target::Mcp => "MCP".to_string(),
            Target::Broadcast => "BROADCAST".to_string(),
            Target::Agent(id) => id,
        }
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Target::Mcp => write!(f, "MCP"),
            Target::Broadcast => write!(f, "BROADCAST"),
            Target::Agent(id) => write!(f, "{id}"),
        }
    }
}

/// The wire unit inside the process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMessage {
    /// Unique per message
    pub message_id: Uuid,
    /// Groups a request with its eventual response or error
    pub correlation_id: Uuid,
    /// Sender: a registered agent id or [`CORE_SOURCE`]
    pub source: AgentId,
    /// Delivery target
    pub target: Target,
    /// When the message was created
    pub timestamp: DateTime<Utc>,
    /// What kind of event this is
    pub event_type: EventType,
    /// Event-type-dependent content, opaque to the bus
    #[serde(default)]
    pub payload: Value,
}

impl AgentMessage {
    /// Create a message with fresh message and correlation ids
    pub fn new(
        source: impl Into<AgentId>,
        target: Target,
        event_type: EventType,
        payload: Value,
    ) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            correlation_id: Uuid::new_v4(),
            source: source.into(),
            target,
            timestamp: Utc::now(),
            event_type,
            payload,
        }
    }

    /// Create a reply addressed to this message's sender, preserving the
    /// correlation id
    pub fn reply(&self, from: impl Into<AgentId>, event_type: EventType, payload: Value) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            correlation_id: self.correlation_id,
            source: from.into(),
            target: Target::Agent(self.source.clone()),
            timestamp: Utc::now(),
            event_type,
            payload,
        }
    }

    /// Re-address a copy of this message to a new target, keeping ids,
    /// source and payload (used by broadcast fan-out and help forwarding)
    pub fn readdress(&self, target: Target) -> Self {
        Self {
            target,
            ..self.clone()
        }
    }

    /// Structural validation: ids present and non-empty
    ///
    /// The event type is already closed at the type level; raw JSON with an
    /// unknown type never deserializes into an [`AgentMessage`].
    pub fn validate(&self) -> Result<(), BusError> {
        if self.source.trim().is_empty() {
            return Err(BusError::InvalidMessage("empty source agent id".into()));
        }
        if let Target::Agent(id) = &self.target {
            if id.trim().is_empty() {
                return Err(BusError::InvalidMessage("empty target agent id".into()));
            }
        }
        Ok(())
    }

    /// Parse and validate a raw JSON message (the web-layer ingress path)
    pub fn from_value(value: Value) -> Result<Self, BusError> {
        let msg: AgentMessage = serde_json::from_value(value)
            .map_err(|e| BusError::InvalidMessage(e.to_string()))?;
        msg.validate()?;
        Ok(msg)
    }
}
