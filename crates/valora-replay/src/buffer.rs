//! Replay buffer with priority buckets and FIFO eviction
//!
//! Experiences are classified into `high`/`medium`/`low` buckets on insert.
//! The buffer holds at most `max_size` entries; at capacity the globally
//! oldest entry is evicted regardless of its bucket, which keeps insertion
//! O(1) amortized and never starves a bucket of capacity during eviction.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Duration, Utc};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tracing::debug;

use valora_core::{AgentExperience, AgentId, EventType};

/// Importance bucket of a stored experience
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

/// Buffer tuning knobs
#[derive(Debug, Clone)]
pub struct ReplayConfig {
    /// Hard cap on stored entries
    pub max_size: usize,
    /// Entries older than this are removed by [`ReplayBuffer::cleanup_expired`]
    pub expiry: Duration,
    /// Event types never stored (high-volume, low-information)
    pub excluded_types: HashSet<EventType>,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            expiry: Duration::days(30),
            excluded_types: [EventType::Heartbeat, EventType::StatusUpdate]
                .into_iter()
                .collect(),
        }
    }
}

/// One stored experience with its derived index keys
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayEntry {
    pub experience: AgentExperience,
    pub priority: Priority,
    pub inserted_at: DateTime<Utc>,
}

/// Counts by bucket and by owning agent, for observability
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferStats {
    pub total: usize,
    pub by_priority: HashMap<Priority, usize>,
    pub by_agent: HashMap<AgentId, usize>,
}

/// Bounded, priority-classified experience store
#[derive(Debug, Default)]
pub struct ReplayBuffer {
    config: ReplayConfig,
    /// Insertion order; front is the oldest entry
    entries: VecDeque<ReplayEntry>,
}

impl ReplayBuffer {
    pub fn new() -> Self {
        Self::with_config(ReplayConfig::default())
    }

    pub fn with_config(config: ReplayConfig) -> Self {
        Self {
            config,
            entries: VecDeque::new(),
        }
    }

    /// Classify an experience into its priority bucket (first match wins)
    pub fn classify(experience: &AgentExperience) -> Priority {
        if let Some(rate) = experience.metadata.success_rate {
            if rate <= 0.2 {
                return Priority::High;
            }
            if rate <= 0.5 {
                return Priority::Medium;
            }
        }
        match experience.metadata.message_type {
            EventType::Error => Priority::High,
            EventType::AssistanceRequested | EventType::AssistanceProvided => Priority::Medium,
            _ => Priority::Low,
        }
    }

    /// Insert an experience, returning whether it was stored.
    ///
    /// Excluded event types are rejected without side effects. At capacity
    /// the globally oldest entry is evicted first.
    pub fn add(&mut self, experience: AgentExperience) -> bool {
        if self
            .config
            .excluded_types
            .contains(&experience.metadata.message_type)
        {
            debug!(
                event = ?experience.metadata.message_type,
                agent = %experience.agent_id,
                "experience excluded from replay buffer"
            );
            metrics::counter!("valora_replay_excluded_total").increment(1);
            return false;
        }

        let priority = Self::classify(&experience);
        if self.entries.len() >= self.config.max_size {
            self.entries.pop_front();
            metrics::counter!("valora_replay_evictions_total").increment(1);
        }
        self.entries.push_back(ReplayEntry {
            experience,
            priority,
            inserted_at: Utc::now(),
        });

        metrics::counter!("valora_replay_recorded_total").increment(1);
        metrics::gauge!("valora_replay_size").set(self.entries.len() as f64);
        true
    }

    /// Experiences owned by one agent, oldest first
    pub fn get_by_agent(&self, agent_id: &str, limit: usize) -> Vec<AgentExperience> {
        self.entries
            .iter()
            .filter(|e| e.experience.agent_id == agent_id)
            .take(limit)
            .map(|e| e.experience.clone())
            .collect()
    }

    /// Experiences in one priority bucket, oldest first
    pub fn get_by_priority(&self, priority: Priority, limit: usize) -> Vec<AgentExperience> {
        self.entries
            .iter()
            .filter(|e| e.priority == priority)
            .take(limit)
            .map(|e| e.experience.clone())
            .collect()
    }

    /// Everything stored, oldest first
    pub fn get_all(&self, limit: usize) -> Vec<AgentExperience> {
        self.entries
            .iter()
            .take(limit)
            .map(|e| e.experience.clone())
            .collect()
    }

    /// Most recent experiences, newest first
    pub fn get_recent(&self, limit: usize) -> Vec<AgentExperience> {
        let mut all: Vec<&ReplayEntry> = self.entries.iter().collect();
        all.sort_by(|a, b| b.experience.timestamp.cmp(&a.experience.timestamp));
        all.into_iter()
            .take(limit)
            .map(|e| e.experience.clone())
            .collect()
    }

    /// Draw a sample biased toward the rarer buckets: ~50% high, ~30%
    /// medium, ~20% low (ceil/ceil/floor), shuffled uniformly and truncated
    /// to `limit`.
    pub fn get_balanced_sample(&self, limit: usize) -> Vec<AgentExperience> {
        let high_n = (limit as f64 * 0.5).ceil() as usize;
        let medium_n = (limit as f64 * 0.3).ceil() as usize;
        let low_n = (limit as f64 * 0.2).floor() as usize;

        let mut sample = self.get_by_priority(Priority::High, high_n);
        sample.extend(self.get_by_priority(Priority::Medium, medium_n));
        sample.extend(self.get_by_priority(Priority::Low, low_n));

        sample.shuffle(&mut rand::rng());
        sample.truncate(limit);
        sample
    }

    /// Remove every entry older than the configured expiry; returns how many
    /// were removed. Safe to call repeatedly; scheduling is the caller's job.
    pub fn cleanup_expired(&mut self) -> usize {
        let cutoff = Utc::now() - self.config.expiry;
        let before = self.entries.len();
        self.entries.retain(|e| e.inserted_at >= cutoff);
        let removed = before - self.entries.len();
        if removed > 0 {
            debug!(removed, "expired replay entries removed");
            metrics::gauge!("valora_replay_size").set(self.entries.len() as f64);
        }
        removed
    }

    pub fn get_stats(&self) -> BufferStats {
        let mut by_priority: HashMap<Priority, usize> = HashMap::new();
        let mut by_agent: HashMap<AgentId, usize> = HashMap::new();
        for entry in &self.entries {
            *by_priority.entry(entry.priority).or_default() += 1;
            *by_agent
                .entry(entry.experience.agent_id.clone())
                .or_default() += 1;
        }
        BufferStats {
            total: self.entries.len(),
            by_priority,
            by_agent,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn config(&self) -> &ReplayConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn experience(
        agent: &str,
        message_type: EventType,
        success_rate: Option<f64>,
        tag: &str,
    ) -> AgentExperience {
        AgentExperience::new(
            agent,
            Uuid::new_v4(),
            message_type,
            10,
            success_rate,
            json!({}),
            json!({}),
        )
        .with_tags(vec![tag.to_string()])
    }

    #[test]
    fn test_classification_determinism() {
        let high = experience("a", EventType::Request, Some(0.1), "t");
        assert_eq!(ReplayBuffer::classify(&high), Priority::High);

        let low = experience("a", EventType::Response, Some(0.6), "t");
        assert_eq!(ReplayBuffer::classify(&low), Priority::Low);

        let medium = experience("a", EventType::Request, Some(0.4), "t");
        assert_eq!(ReplayBuffer::classify(&medium), Priority::Medium);

        let error = experience("a", EventType::Error, None, "t");
        assert_eq!(ReplayBuffer::classify(&error), Priority::High);

        let assist = experience("a", EventType::AssistanceRequested, None, "t");
        assert_eq!(ReplayBuffer::classify(&assist), Priority::Medium);
    }

    #[test]
    fn test_capacity_bound_and_fifo_eviction() {
        let mut buffer = ReplayBuffer::with_config(ReplayConfig {
            max_size: 5,
            ..ReplayConfig::default()
        });

        for i in 0..8 {
            assert!(buffer.add(experience(
                "valuation-agent",
                EventType::Request,
                Some(1.0),
                &format!("exp-{i}"),
            )));
        }

        assert_eq!(buffer.len(), 5);
        // The 3 oldest entries are gone
        let tags: Vec<String> = buffer
            .get_all(10)
            .iter()
            .map(|e| e.tags[0].clone())
            .collect();
        assert_eq!(tags, vec!["exp-3", "exp-4", "exp-5", "exp-6", "exp-7"]);
    }

    #[test]
    fn test_exclusion_set_rejects_without_side_effects() {
        let mut buffer = ReplayBuffer::new();
        assert!(!buffer.add(experience("a", EventType::Heartbeat, None, "hb")));
        assert!(!buffer.add(experience("a", EventType::StatusUpdate, None, "su")));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_projections() {
        let mut buffer = ReplayBuffer::new();
        buffer.add(experience("valuation-agent", EventType::Request, Some(1.0), "a"));
        buffer.add(experience("report-agent", EventType::Request, Some(0.1), "b"));
        buffer.add(experience("valuation-agent", EventType::Error, None, "c"));

        assert_eq!(buffer.get_by_agent("valuation-agent", 10).len(), 2);
        assert_eq!(buffer.get_by_agent("valuation-agent", 1).len(), 1);
        assert_eq!(buffer.get_by_priority(Priority::High, 10).len(), 2);
        assert_eq!(buffer.get_by_priority(Priority::Low, 10).len(), 1);
        assert_eq!(buffer.get_all(2).len(), 2);
    }

    #[test]
    fn test_get_recent_is_newest_first() {
        let mut buffer = ReplayBuffer::new();
        for i in 0..5 {
            buffer.add(experience("a", EventType::Request, Some(1.0), &format!("{i}")));
        }
        let recent = buffer.get_recent(3);
        assert_eq!(recent.len(), 3);
        assert!(recent[0].timestamp >= recent[1].timestamp);
        assert!(recent[1].timestamp >= recent[2].timestamp);
    }

    #[test]
    fn test_balanced_sample_proportions() {
        let mut buffer = ReplayBuffer::with_config(ReplayConfig {
            max_size: 500,
            ..ReplayConfig::default()
        });
        for i in 0..120 {
            buffer.add(experience("a", EventType::Request, Some(0.1), &format!("h{i}")));
            buffer.add(experience("a", EventType::Request, Some(0.4), &format!("m{i}")));
            buffer.add(experience("a", EventType::Response, Some(1.0), &format!("l{i}")));
        }

        let sample = buffer.get_balanced_sample(100);
        assert_eq!(sample.len(), 100);

        let count = |prefix: &str| {
            sample
                .iter()
                .filter(|e| e.tags[0].starts_with(prefix))
                .count()
        };
        assert_eq!(count("h"), 50);
        assert_eq!(count("m"), 30);
        assert_eq!(count("l"), 20);

        // Shuffled: two draws are extremely unlikely to agree element-for-element
        let other = buffer.get_balanced_sample(100);
        let ids = |s: &[AgentExperience]| -> Vec<Uuid> {
            s.iter().map(|e| e.experience_id).collect()
        };
        assert_ne!(ids(&sample), ids(&other));
    }

    #[test]
    fn test_balanced_sample_on_small_buffer() {
        let mut buffer = ReplayBuffer::new();
        buffer.add(experience("a", EventType::Request, Some(0.1), "h"));
        buffer.add(experience("a", EventType::Response, Some(1.0), "l"));
        let sample = buffer.get_balanced_sample(10);
        assert_eq!(sample.len(), 2);
    }

    #[test]
    fn test_cleanup_expired() {
        let mut buffer = ReplayBuffer::with_config(ReplayConfig {
            expiry: Duration::milliseconds(30),
            ..ReplayConfig::default()
        });
        buffer.add(experience("a", EventType::Request, Some(1.0), "old"));
        std::thread::sleep(std::time::Duration::from_millis(50));
        buffer.add(experience("a", EventType::Request, Some(1.0), "fresh"));

        assert_eq!(buffer.cleanup_expired(), 1);
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.get_all(10)[0].tags[0], "fresh");
        // Repeat calls are safe
        assert_eq!(buffer.cleanup_expired(), 0);
    }

    #[test]
    fn test_stats() {
        let mut buffer = ReplayBuffer::new();
        buffer.add(experience("valuation-agent", EventType::Request, Some(0.1), "a"));
        buffer.add(experience("report-agent", EventType::Response, Some(1.0), "b"));
        buffer.add(experience("report-agent", EventType::Request, Some(0.4), "c"));

        let stats = buffer.get_stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_priority[&Priority::High], 1);
        assert_eq!(stats.by_priority[&Priority::Medium], 1);
        assert_eq!(stats.by_priority[&Priority::Low], 1);
        assert_eq!(stats.by_agent["report-agent"], 2);
    }
}
