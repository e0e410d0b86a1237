//! Experience records
//!
//! An [`AgentExperience`] is the immutable record of one processed message,
//! produced by the router right after dispatch and consumed by the replay
//! buffer for later sampling and learning.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::message::{AgentId, EventType};

/// Metadata describing how the message was processed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperienceMetadata {
    /// Event type of the processed message
    pub message_type: EventType,
    /// Wall-clock processing time in milliseconds
    pub processing_time_ms: u64,
    /// 0.0 or 1.0 at creation time; stored as a float so future consumers
    /// may record graded success
    pub success_rate: Option<f64>,
}

/// Immutable record of one processed message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentExperience {
    pub experience_id: Uuid,
    /// Owning agent
    pub agent_id: AgentId,
    pub timestamp: DateTime<Utc>,
    /// Correlation id of the originating request
    pub task_id: Uuid,
    pub metadata: ExperienceMetadata,
    /// The request payload as received
    pub request: Value,
    /// Outcome summary (response payload or error description)
    pub result: Value,
    /// Free-form labels
    pub tags: Vec<String>,
}

impl AgentExperience {
    pub fn new(
        agent_id: impl Into<AgentId>,
        task_id: Uuid,
        message_type: EventType,
        processing_time_ms: u64,
        success_rate: Option<f64>,
        request: Value,
        result: Value,
    ) -> Self {
        Self {
            experience_id: Uuid::new_v4(),
            agent_id: agent_id.into(),
            timestamp: Utc::now(),
            task_id,
            metadata: ExperienceMetadata {
                message_type,
                processing_time_ms,
                success_rate,
            },
            request,
            result,
            tags: Vec::new(),
        }
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    /// Age of this experience
    pub fn age(&self) -> Duration {
        Utc::now().signed_duration_since(self.timestamp)
    }
}
