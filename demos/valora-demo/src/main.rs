//! Valora bus demo
//!
//! Wires three agents through the Master Control Program and exercises the
//! main flows: direct requests, capability-routed help, broadcast, and the
//! built-in system commands.
//!
//! Run with: cargo run -p valora-demo

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

use valora_agents::{Agent, Behavior};
use valora_core::{AgentKind, BusError, EventType, Target};
use valora_mcp::{Mcp, Supervisor, SupervisorConfig};

/// Income-approach valuation: value = NOI / cap rate
struct IncomeValuation;

#[async_trait]
impl Behavior for IncomeValuation {
    async fn process_request(&self, payload: &Value) -> Result<Value, BusError> {
        let noi = payload
            .get("noi")
            .and_then(Value::as_f64)
            .ok_or_else(|| BusError::Validation("missing noi".into()))?;
        let cap_rate = payload
            .get("cap_rate")
            .and_then(Value::as_f64)
            .filter(|r| *r > 0.0)
            .ok_or_else(|| BusError::Validation("missing or zero cap_rate".into()))?;
        Ok(json!({
            "approach": "income",
            "estimated_value": (noi / cap_rate).round(),
        }))
    }
}

/// Assembles a one-line narrative from a valuation result
struct ReportWriter;

#[async_trait]
impl Behavior for ReportWriter {
    async fn process_request(&self, payload: &Value) -> Result<Value, BusError> {
        let value = payload
            .get("estimated_value")
            .and_then(Value::as_f64)
            .unwrap_or_default();
        Ok(json!({
            "narrative": format!("The subject property is estimated at ${value:.0}."),
        }))
    }
}

/// Validates parcel records and helps anyone who asks
struct DataValidator;

#[async_trait]
impl Behavior for DataValidator {
    async fn process_request(&self, payload: &Value) -> Result<Value, BusError> {
        self.check(payload)
    }

    async fn handle_help_request(
        &self,
        payload: &Value,
        requester: &str,
    ) -> Result<Option<Value>, BusError> {
        info!(requester, "validating on behalf of another agent");
        Ok(Some(self.check(payload)?))
    }
}

impl DataValidator {
    fn check(&self, payload: &Value) -> Result<Value, BusError> {
        let missing: Vec<&str> = ["parcel_id", "address"]
            .into_iter()
            .filter(|field| payload.get(field).is_none())
            .collect();
        Ok(json!({ "valid": missing.is_empty(), "missing_fields": missing }))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let supervisor = Supervisor::new(Mcp::new(), SupervisorConfig::default());
    let mcp = supervisor.mcp().clone();

    supervisor
        .register_agent(Agent::new(
            "valuation-agent",
            AgentKind::Valuation,
            vec!["income_analysis".into(), "comparables".into()],
            Box::new(IncomeValuation),
        ))
        .await;
    supervisor
        .register_agent(Agent::new(
            "report-agent",
            AgentKind::Reporting,
            vec!["narrative_generation".into()],
            Box::new(ReportWriter),
        ))
        .await;
    supervisor
        .register_agent(Agent::new(
            "data-agent",
            AgentKind::DataQuality,
            vec!["data_validation".into()],
            Box::new(DataValidator),
        ))
        .await;
    supervisor.start_health_poll();

    // Direct request
    mcp.send_system_message(
        Target::Agent("valuation-agent".into()),
        EventType::Request,
        json!({ "parcel_id": "12-0042", "noi": 84_000.0, "cap_rate": 0.065 }),
    )
    .await;

    // Capability-routed help: the valuation agent needs its input checked
    mcp.handle_raw(json!({
        "message_id": uuid_like(),
        "correlation_id": uuid_like(),
        "source": "valuation-agent",
        "target": "MCP",
        "timestamp": chrono_now(),
        "event_type": "ASSISTANCE_REQUESTED",
        "payload": {
            "required_capabilities": ["data_validation"],
            "parcel_id": "12-0042",
            "address": "742 Alder St"
        }
    }))
    .await;

    // Broadcast a notice to everyone
    mcp.send_system_message(
        Target::Broadcast,
        EventType::Broadcast,
        json!({ "notice": "comparables index refreshed" }),
    )
    .await;

    // Built-in system command
    mcp.send_system_message(
        Target::Mcp,
        EventType::Command,
        json!({ "command": "trigger_training", "count": 25 }),
    )
    .await;

    // Let the drain worker catch up
    tokio::time::sleep(Duration::from_millis(200)).await;

    let info = mcp.system_info().await;
    info!(%info, "system info");
    for id in mcp.registered_agents().await {
        if let Some(status) = mcp.agent_status(&id).await {
            info!(
                agent = %id,
                health = ?status.health,
                processed = status.requests_processed,
                "agent status"
            );
        }
    }
    for exp in mcp.recent_experiences(5).await {
        info!(
            owner = %exp.agent_id,
            event = ?exp.metadata.message_type,
            took_ms = exp.metadata.processing_time_ms,
            "experience"
        );
    }

    supervisor.shutdown().await;
    Ok(())
}

fn uuid_like() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn chrono_now() -> String {
    chrono::Utc::now().to_rfc3339()
}
