//! # Valora MCP
//!
//! The Master Control Program: the router at the center of the Valora agent
//! bus. One [`Mcp`] instance owns the agent registry, the capability index,
//! a bounded message queue with a single drain worker, per-source
//! throttling, and the replay buffer fed by every dispatched message.
//!
//! There is no process-wide singleton; construct an [`Mcp`], register
//! [`Agent`](valora_agents::Agent)s against it, and tear it down with
//! [`Mcp::shutdown`].

pub mod broker;
pub mod metrics;
pub mod registry;
pub mod supervisor;
pub mod throttle;

pub use broker::{Mcp, McpConfig};
pub use crate::metrics::{RouterMetrics, RouterStatus};
pub use registry::Registry;
pub use supervisor::{Supervisor, SupervisorConfig};
pub use throttle::{SourceThrottle, ThrottleConfig};
