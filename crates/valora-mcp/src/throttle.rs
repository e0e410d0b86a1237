//! Per-source throttling
//!
//! A sliding window of send instants per source id. The drain worker asks
//! before each dispatch; a refused message is held and the queue defers for
//! one window before retrying.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// Throttle tuning knobs
#[derive(Debug, Clone)]
pub struct ThrottleConfig {
    /// Maximum dispatches per source within one window
    pub limit: usize,
    /// Window length
    pub window: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            limit: 10,
            window: Duration::from_secs(1),
        }
    }
}

/// Sliding-window counter per source id
#[derive(Debug)]
pub struct SourceThrottle {
    config: ThrottleConfig,
    windows: HashMap<String, VecDeque<Instant>>,
}

impl SourceThrottle {
    pub fn new(config: ThrottleConfig) -> Self {
        Self {
            config,
            windows: HashMap::new(),
        }
    }

    /// Record a dispatch for `source` if it is under the limit.
    ///
    /// Returns `false` without recording when the source is at its limit.
    pub fn try_acquire(&mut self, source: &str) -> bool {
        let now = Instant::now();
        let window = self.windows.entry(source.to_string()).or_default();
        while let Some(front) = window.front() {
            if now.duration_since(*front) >= self.config.window {
                window.pop_front();
            } else {
                break;
            }
        }
        if window.len() >= self.config.limit {
            return false;
        }
        window.push_back(now);
        true
    }

    /// How long the drain loop defers after a refusal
    pub fn retry_delay(&self) -> Duration {
        self.config.window
    }
}
