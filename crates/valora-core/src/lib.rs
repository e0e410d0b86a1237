//! # Valora Core
//!
//! Shared value types for the Valora agent bus:
//! - [`AgentMessage`] — the in-process wire unit, with [`EventType`] and [`Target`]
//! - [`AgentExperience`] — immutable record of one processed message
//! - [`AgentStatus`] / [`Health`] — derived health snapshots
//! - [`BusError`] — the closed error taxonomy with stable wire codes

pub mod error;
pub mod experience;
pub mod message;
pub mod status;

pub use error::BusError;
pub use experience::{AgentExperience, ExperienceMetadata};
pub use message::{AgentId, AgentMessage, EventType, Target, CORE_SOURCE};
pub use status::{AgentKind, AgentStatus, Health};
