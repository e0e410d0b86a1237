//! Router-level counters and health

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use valora_core::Health;

/// How many recent error strings the router retains
pub const ERROR_RING_CAPACITY: usize = 10;

/// Mutable counters owned by the router
#[derive(Debug, Default)]
pub struct RouterMetrics {
    pub messages_processed: u64,
    pub messages_errored: u64,
    pub messages_dropped: u64,
    pub help_requests_routed: u64,
    pub registrations: u64,
    pub unregistrations: u64,
    pub broadcasts_sent: u64,
    pub recent_errors: VecDeque<String>,
}

impl RouterMetrics {
    pub fn record_error(&mut self, error: String) {
        if self.recent_errors.len() == ERROR_RING_CAPACITY {
            self.recent_errors.pop_front();
        }
        self.recent_errors.push_back(error);
    }

    /// `error` above 5 recent errors, `degraded` above 2
    pub fn health(&self) -> Health {
        match self.recent_errors.len() {
            n if n > 5 => Health::Error,
            n if n > 2 => Health::Degraded,
            _ => Health::Healthy,
        }
    }

    pub fn snapshot(&self) -> RouterStatus {
        RouterStatus {
            health: self.health(),
            messages_processed: self.messages_processed,
            messages_errored: self.messages_errored,
            messages_dropped: self.messages_dropped,
            help_requests_routed: self.help_requests_routed,
            registrations: self.registrations,
            unregistrations: self.unregistrations,
            broadcasts_sent: self.broadcasts_sent,
            recent_errors: self.recent_errors.iter().cloned().collect(),
        }
    }
}

/// Serializable point-in-time copy of [`RouterMetrics`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterStatus {
    pub health: Health,
    pub messages_processed: u64,
    pub messages_errored: u64,
    pub messages_dropped: u64,
    pub help_requests_routed: u64,
    pub registrations: u64,
    pub unregistrations: u64,
    pub broadcasts_sent: u64,
    pub recent_errors: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_thresholds() {
        let mut metrics = RouterMetrics::default();
        assert_eq!(metrics.health(), Health::Healthy);

        for i in 0..3 {
            metrics.record_error(format!("error {i}"));
        }
        assert_eq!(metrics.health(), Health::Degraded);

        for i in 3..6 {
            metrics.record_error(format!("error {i}"));
        }
        assert_eq!(metrics.health(), Health::Error);
    }

    #[test]
    fn test_error_ring_is_bounded() {
        let mut metrics = RouterMetrics::default();
        for i in 0..20 {
            metrics.record_error(format!("error {i}"));
        }
        assert_eq!(metrics.recent_errors.len(), ERROR_RING_CAPACITY);
        assert_eq!(metrics.recent_errors.back().unwrap(), "error 19");
    }
}
