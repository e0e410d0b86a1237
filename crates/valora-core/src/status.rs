//! Derived status snapshots
//!
//! Health is never stored; it is computed from error-rate thresholds at the
//! moment a status is requested.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::message::AgentId;

/// Closed category tag for agents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    /// Property valuation models (income, comparables, ...)
    Valuation,
    /// Report assembly and narrative generation
    Reporting,
    /// Input cleaning and validation
    DataQuality,
    /// Everything else (schedulers, notifiers, ...)
    Utility,
}

/// Health tag derived from error rates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Healthy,
    Degraded,
    Error,
}

impl Health {
    /// Derive a health tag from observed failure counts.
    ///
    /// `error` above 50% failure rate, `degraded` above 20% or when the
    /// recent-error ring holds more than 3 entries, `healthy` otherwise.
    pub fn from_rates(processed: u64, failed: u64, recent_errors: usize) -> Self {
        let observations = processed + failed;
        if observations > 0 {
            let error_rate = failed as f64 / observations as f64;
            if error_rate > 0.5 {
                return Health::Error;
            }
            if error_rate > 0.2 {
                return Health::Degraded;
            }
        }
        if recent_errors > 3 {
            return Health::Degraded;
        }
        Health::Healthy
    }
}

/// Point-in-time view of one agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStatus {
    pub agent_id: AgentId,
    pub kind: AgentKind,
    pub health: Health,
    pub last_activity: DateTime<Utc>,
    /// Requests currently being processed
    pub active_requests: usize,
    pub avg_response_time_ms: f64,
    pub success_rate: f64,
    pub error_rate: f64,
    pub requests_processed: u64,
}
