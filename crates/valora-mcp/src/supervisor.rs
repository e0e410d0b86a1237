//! Pass-through supervisor glue
//!
//! Composes the router, registers agents, and runs the periodic health
//! poll. No routing policy lives here.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use valora_agents::Agent;
use valora_core::{EventType, Health, Target};

use crate::broker::Mcp;

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// How often agent health is polled
    pub poll_interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
        }
    }
}

/// Thin composition layer over one [`Mcp`]
pub struct Supervisor {
    mcp: Mcp,
    config: SupervisorConfig,
    poll: StdMutex<Option<JoinHandle<()>>>,
}

impl Supervisor {
    pub fn new(mcp: Mcp, config: SupervisorConfig) -> Self {
        Self {
            mcp,
            config,
            poll: StdMutex::new(None),
        }
    }

    pub fn mcp(&self) -> &Mcp {
        &self.mcp
    }

    pub async fn register_agent(&self, agent: Agent) -> Arc<Agent> {
        self.mcp.register_agent(agent).await
    }

    /// Start the periodic health poll. Idempotent.
    pub fn start_health_poll(&self) {
        let mut poll = self.poll.lock().expect("poll handle lock poisoned");
        if poll.is_some() {
            return;
        }
        let mcp = self.mcp.clone();
        let interval = self.config.poll_interval;
        *poll = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately; skip it so a fresh bus is
            // not polled before agents are registered
            ticker.tick().await;
            loop {
                ticker.tick().await;
                Self::poll_once(&mcp).await;
            }
        }));
        info!(interval_secs = interval.as_secs(), "health poll started");
    }

    /// One health sweep: log every unhealthy agent and ping the router
    pub async fn poll_once(mcp: &Mcp) {
        for id in mcp.registered_agents().await {
            if let Some(status) = mcp.agent_status(&id).await {
                match status.health {
                    Health::Healthy => {}
                    health => {
                        warn!(
                            agent = %id,
                            health = ?health,
                            error_rate = status.error_rate,
                            "agent unhealthy"
                        );
                    }
                }
            }
        }
        mcp.send_system_message(
            Target::Mcp,
            EventType::Heartbeat,
            json!({ "origin": "supervisor" }),
        )
        .await;
    }

    /// Stop polling and shut the router down gracefully
    pub async fn shutdown(&self) {
        if let Some(handle) = self.poll.lock().expect("poll handle lock poisoned").take() {
            handle.abort();
        }
        self.mcp.shutdown().await;
    }
}
