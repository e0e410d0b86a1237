//! Per-agent counters and the rolling error ring

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How many recent error strings an agent retains
pub const ERROR_RING_CAPACITY: usize = 10;

/// Mutable counters owned by one [`Agent`](crate::Agent)
#[derive(Debug)]
pub struct AgentMetrics {
    pub requests_received: u64,
    pub requests_processed: u64,
    pub requests_failed: u64,
    pub help_requests_received: u64,
    pub help_requests_provided: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    /// Sum of response times; the mean is `total / processed`, so old
    /// samples never expire from it
    pub total_response_time_ms: f64,
    /// Last 10 error strings, oldest evicted first
    pub recent_errors: VecDeque<String>,
    pub last_activity: DateTime<Utc>,
}

impl Default for AgentMetrics {
    fn default() -> Self {
        Self {
            requests_received: 0,
            requests_processed: 0,
            requests_failed: 0,
            help_requests_received: 0,
            help_requests_provided: 0,
            messages_sent: 0,
            messages_received: 0,
            total_response_time_ms: 0.0,
            recent_errors: VecDeque::with_capacity(ERROR_RING_CAPACITY),
            last_activity: Utc::now(),
        }
    }
}

impl AgentMetrics {
    /// Fold one successful response time into the running mean
    pub fn record_response_time(&mut self, elapsed_ms: f64) {
        self.total_response_time_ms += elapsed_ms;
    }

    /// Push onto the error ring, evicting the oldest entry when full
    pub fn record_error(&mut self, error: String) {
        if self.recent_errors.len() == ERROR_RING_CAPACITY {
            self.recent_errors.pop_front();
        }
        self.recent_errors.push_back(error);
    }

    pub fn avg_response_time_ms(&self) -> f64 {
        if self.requests_processed == 0 {
            0.0
        } else {
            self.total_response_time_ms / self.requests_processed as f64
        }
    }

    pub fn error_rate(&self) -> f64 {
        let observations = self.requests_processed + self.requests_failed;
        if observations == 0 {
            0.0
        } else {
            self.requests_failed as f64 / observations as f64
        }
    }

    pub fn success_rate(&self) -> f64 {
        let observations = self.requests_processed + self.requests_failed;
        if observations == 0 {
            1.0
        } else {
            self.requests_processed as f64 / observations as f64
        }
    }

    /// Zero everything; the activity timestamp restarts at now
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_received: self.requests_received,
            requests_processed: self.requests_processed,
            requests_failed: self.requests_failed,
            help_requests_received: self.help_requests_received,
            help_requests_provided: self.help_requests_provided,
            messages_sent: self.messages_sent,
            messages_received: self.messages_received,
            avg_response_time_ms: self.avg_response_time_ms(),
            success_rate: self.success_rate(),
            error_rate: self.error_rate(),
            recent_errors: self.recent_errors.iter().cloned().collect(),
            last_activity: self.last_activity,
        }
    }
}

/// Serializable point-in-time copy of [`AgentMetrics`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub requests_received: u64,
    pub requests_processed: u64,
    pub requests_failed: u64,
    pub help_requests_received: u64,
    pub help_requests_provided: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub avg_response_time_ms: f64,
    pub success_rate: f64,
    pub error_rate: f64,
    pub recent_errors: Vec<String>,
    pub last_activity: DateTime<Utc>,
}
