//! # Valora Replay
//!
//! A bounded, indexed store of [`AgentExperience`](valora_core::AgentExperience)
//! records with priority-bucket classification, expiry, and sampling
//! strategies. Priority buckets bias sampling toward rare and failure-laden
//! interactions; eviction under pressure stays strict FIFO.

pub mod buffer;

pub use buffer::{BufferStats, Priority, ReplayBuffer, ReplayConfig, ReplayEntry};
