//! Agent runtime
//!
//! [`Agent`] wraps a [`Behavior`] with identity, declared capabilities, the
//! standard per-event-type message state machine, and metrics. Processing
//! errors never escape [`Agent::on_message`]; they are recorded and converted
//! into `ERROR` messages addressed back to the sender with the correlation
//! id preserved.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, RwLock};
use std::time::Instant;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use valora_core::{
    AgentExperience, AgentId, AgentKind, AgentMessage, AgentStatus, BusError, EventType, Health,
};

use crate::behavior::Behavior;
use crate::metrics::{AgentMetrics, MetricsSnapshot};

/// Bookkeeping for a request currently being processed
#[derive(Debug)]
struct InFlightRequest {
    started: Instant,
    #[allow(dead_code)]
    kind: EventType,
    #[allow(dead_code)]
    payload: Value,
}

/// Removes the in-flight entry when dropped, so a dispatch future cancelled
/// by the router's deadline still cleans up after itself
struct InFlightGuard<'a> {
    agent: &'a Agent,
    correlation_id: Uuid,
}

impl InFlightGuard<'_> {
    fn elapsed_ms(&self) -> f64 {
        self.agent
            .in_flight
            .lock()
            .expect("in-flight map lock poisoned")
            .get(&self.correlation_id)
            .map(|r| r.started.elapsed().as_secs_f64() * 1000.0)
            .unwrap_or(0.0)
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.agent
            .in_flight
            .lock()
            .expect("in-flight map lock poisoned")
            .remove(&self.correlation_id);
    }
}

/// A unit of work on the bus: identity, capabilities, and a [`Behavior`]
pub struct Agent {
    id: AgentId,
    kind: AgentKind,
    /// Declaration order, duplicates dropped
    capabilities: Vec<String>,
    capability_set: HashSet<String>,
    behavior: Box<dyn Behavior>,
    metrics: Mutex<AgentMetrics>,
    in_flight: Mutex<HashMap<Uuid, InFlightRequest>>,
    outbound: RwLock<Option<mpsc::Sender<AgentMessage>>>,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("capabilities", &self.capabilities)
            .finish_non_exhaustive()
    }
}

impl Agent {
    pub fn new(
        id: impl Into<AgentId>,
        kind: AgentKind,
        capabilities: Vec<String>,
        behavior: Box<dyn Behavior>,
    ) -> Self {
        let mut seen = HashSet::new();
        let capabilities: Vec<String> = capabilities
            .into_iter()
            .filter(|c| seen.insert(c.clone()))
            .collect();
        let capability_set = seen;
        Self {
            id: id.into(),
            kind,
            capabilities,
            capability_set,
            behavior,
            metrics: Mutex::new(AgentMetrics::default()),
            in_flight: Mutex::new(HashMap::new()),
            outbound: RwLock::new(None),
        }
    }

    pub fn id(&self) -> &AgentId {
        &self.id
    }

    pub fn kind(&self) -> AgentKind {
        self.kind
    }

    /// Declared capabilities in declaration order
    pub fn capabilities(&self) -> &[String] {
        &self.capabilities
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capability_set.contains(capability)
    }

    /// Install the outbound channel; done by the router at registration
    pub fn set_outbound(&self, sender: mpsc::Sender<AgentMessage>) {
        *self.outbound.write().expect("outbound lock poisoned") = Some(sender);
    }

    /// Remove the outbound channel; done by the router at unregistration
    pub fn clear_outbound(&self) {
        *self.outbound.write().expect("outbound lock poisoned") = None;
    }

    /// Hand a message to the router.
    ///
    /// Without an installed outbound channel this is a logged no-op, not a
    /// failure. A full queue drops the message with a warning, matching the
    /// router's admission policy.
    pub fn send_message(&self, msg: AgentMessage) {
        let outbound = self.outbound.read().expect("outbound lock poisoned");
        match outbound.as_ref() {
            Some(sender) => match sender.try_send(msg) {
                Ok(()) => {
                    self.metrics
                        .lock()
                        .expect("metrics lock poisoned")
                        .messages_sent += 1;
                }
                Err(mpsc::error::TrySendError::Full(msg)) => {
                    warn!(agent = %self.id, event = ?msg.event_type, "bus queue full, dropping outbound message");
                }
                Err(mpsc::error::TrySendError::Closed(msg)) => {
                    warn!(agent = %self.id, event = ?msg.event_type, "bus is shut down, dropping outbound message");
                }
            },
            None => {
                debug!(agent = %self.id, "no outbound handler installed, dropping message");
            }
        }
    }

    /// Dispatch one inbound message through the event-type state machine.
    ///
    /// `REQUEST → RESPONSE | ERROR`; `ASSISTANCE_REQUESTED` delegates to the
    /// behavior; `LEARNING_TRIGGERED → STATUS_UPDATE | ERROR`;
    /// `COMMAND → COMMAND_RESULT | ERROR`; `BROADCAST → STATUS_UPDATE`.
    /// Every other event type is silently ignored.
    pub async fn on_message(&self, msg: &AgentMessage) {
        {
            let mut m = self.metrics.lock().expect("metrics lock poisoned");
            m.messages_received += 1;
            m.last_activity = Utc::now();
        }
        match msg.event_type {
            EventType::Request => self.handle_request(msg).await,
            EventType::AssistanceRequested => self.handle_assistance(msg).await,
            EventType::LearningTriggered => self.handle_learning(msg).await,
            EventType::Command => self.handle_command(msg).await,
            EventType::Broadcast => self.handle_broadcast(msg),
            other => {
                trace!(agent = %self.id, event = ?other, "ignoring event type");
            }
        }
    }

    async fn handle_request(&self, msg: &AgentMessage) {
        self.metrics
            .lock()
            .expect("metrics lock poisoned")
            .requests_received += 1;

        let guard = self.begin_request(msg);
        match self.behavior.process_request(&msg.payload).await {
            Ok(result) => {
                let elapsed_ms = guard.elapsed_ms();
                {
                    let mut m = self.metrics.lock().expect("metrics lock poisoned");
                    m.requests_processed += 1;
                    m.record_response_time(elapsed_ms);
                }
                self.send_message(msg.reply(self.id.clone(), EventType::Response, result));
            }
            Err(err) => {
                {
                    let mut m = self.metrics.lock().expect("metrics lock poisoned");
                    m.requests_failed += 1;
                    m.record_error(err.to_string());
                }
                self.send_message(msg.reply(self.id.clone(), EventType::Error, err.to_payload()));
            }
        }
    }

    async fn handle_assistance(&self, msg: &AgentMessage) {
        self.metrics
            .lock()
            .expect("metrics lock poisoned")
            .help_requests_received += 1;

        match self.behavior.handle_help_request(&msg.payload, &msg.source).await {
            Ok(Some(result)) => {
                self.metrics
                    .lock()
                    .expect("metrics lock poisoned")
                    .help_requests_provided += 1;
                self.send_message(msg.reply(self.id.clone(), EventType::AssistanceProvided, result));
            }
            Ok(None) => {
                debug!(agent = %self.id, requester = %msg.source, "declined help request");
            }
            Err(err) => {
                self.metrics
                    .lock()
                    .expect("metrics lock poisoned")
                    .record_error(err.to_string());
                self.send_message(msg.reply(self.id.clone(), EventType::Error, err.to_payload()));
            }
        }
    }

    async fn handle_learning(&self, msg: &AgentMessage) {
        let experiences: Vec<AgentExperience> = match msg.payload.get("experiences") {
            Some(v) => match serde_json::from_value(v.clone()) {
                Ok(exps) => exps,
                Err(e) => {
                    let err = BusError::Validation(format!("malformed experiences: {e}"));
                    self.metrics
                        .lock()
                        .expect("metrics lock poisoned")
                        .record_error(err.to_string());
                    self.send_message(msg.reply(self.id.clone(), EventType::Error, err.to_payload()));
                    return;
                }
            },
            None => Vec::new(),
        };

        match self.behavior.learn(&experiences).await {
            Ok(summary) => {
                self.send_message(msg.reply(self.id.clone(), EventType::StatusUpdate, summary));
            }
            Err(err) => {
                self.metrics
                    .lock()
                    .expect("metrics lock poisoned")
                    .record_error(err.to_string());
                self.send_message(msg.reply(self.id.clone(), EventType::Error, err.to_payload()));
            }
        }
    }

    async fn handle_command(&self, msg: &AgentMessage) {
        let command = msg
            .payload
            .get("command")
            .and_then(Value::as_str)
            .unwrap_or_default();

        let result = match command {
            "get_status" => {
                serde_json::to_value(self.status()).map_err(|e| BusError::Processing(e.to_string()))
            }
            "get_metrics" => serde_json::to_value(self.metrics_snapshot())
                .map_err(|e| BusError::Processing(e.to_string())),
            "get_capabilities" => Ok(json!({ "capabilities": self.capabilities })),
            "reset_metrics" => {
                self.metrics.lock().expect("metrics lock poisoned").reset();
                Ok(json!({ "reset": true }))
            }
            other => Err(BusError::Validation(format!("unknown command: {other:?}"))),
        };

        match result {
            Ok(value) => {
                self.send_message(msg.reply(self.id.clone(), EventType::CommandResult, value));
            }
            Err(err) => {
                self.send_message(msg.reply(self.id.clone(), EventType::Error, err.to_payload()));
            }
        }
    }

    fn handle_broadcast(&self, msg: &AgentMessage) {
        // Simple acknowledgment, no payload processing
        self.send_message(msg.reply(
            self.id.clone(),
            EventType::StatusUpdate,
            json!({ "ack": true, "agent_id": self.id }),
        ));
    }

    fn begin_request(&self, msg: &AgentMessage) -> InFlightGuard<'_> {
        self.in_flight
            .lock()
            .expect("in-flight map lock poisoned")
            .insert(
                msg.correlation_id,
                InFlightRequest {
                    started: Instant::now(),
                    kind: msg.event_type,
                    payload: msg.payload.clone(),
                },
            );
        InFlightGuard {
            agent: self,
            correlation_id: msg.correlation_id,
        }
    }

    /// Derived health snapshot
    pub fn status(&self) -> AgentStatus {
        let m = self.metrics.lock().expect("metrics lock poisoned");
        let active_requests = self
            .in_flight
            .lock()
            .expect("in-flight map lock poisoned")
            .len();
        AgentStatus {
            agent_id: self.id.clone(),
            kind: self.kind,
            health: Health::from_rates(m.requests_processed, m.requests_failed, m.recent_errors.len()),
            last_activity: m.last_activity,
            active_requests,
            avg_response_time_ms: m.avg_response_time_ms(),
            success_rate: m.success_rate(),
            error_rate: m.error_rate(),
            requests_processed: m.requests_processed,
        }
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics
            .lock()
            .expect("metrics lock poisoned")
            .snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio::sync::mpsc::error::TryRecvError;
    use valora_core::Target;

    /// Echoes the request payload back
    struct EchoBehavior;

    #[async_trait]
    impl Behavior for EchoBehavior {
        async fn process_request(&self, payload: &Value) -> Result<Value, BusError> {
            Ok(payload.clone())
        }
    }

    /// Always fails
    struct FailingBehavior;

    #[async_trait]
    impl Behavior for FailingBehavior {
        async fn process_request(&self, _payload: &Value) -> Result<Value, BusError> {
            Err(BusError::Processing("comparables model unavailable".into()))
        }
    }

    /// Helps with anything
    struct HelpfulBehavior;

    #[async_trait]
    impl Behavior for HelpfulBehavior {
        async fn process_request(&self, payload: &Value) -> Result<Value, BusError> {
            Ok(payload.clone())
        }

        async fn handle_help_request(
            &self,
            payload: &Value,
            requester: &str,
        ) -> Result<Option<Value>, BusError> {
            Ok(Some(json!({ "helped": requester, "echo": payload })))
        }
    }

    fn wired_agent(behavior: Box<dyn Behavior>) -> (Agent, mpsc::Receiver<AgentMessage>) {
        let (tx, rx) = mpsc::channel(16);
        let agent = Agent::new(
            "valuation-agent",
            AgentKind::Valuation,
            vec!["income_analysis".into()],
            behavior,
        );
        agent.set_outbound(tx);
        (agent, rx)
    }

    fn request(payload: Value) -> AgentMessage {
        AgentMessage::new(
            "CORE",
            Target::Agent("valuation-agent".into()),
            EventType::Request,
            payload,
        )
    }

    #[tokio::test]
    async fn test_request_yields_response_with_same_correlation() {
        let (agent, mut rx) = wired_agent(Box::new(EchoBehavior));
        let req = request(json!({"parcel": "12-0042"}));
        agent.on_message(&req).await;

        let out = rx.try_recv().unwrap();
        assert_eq!(out.event_type, EventType::Response);
        assert_eq!(out.correlation_id, req.correlation_id);
        assert_eq!(out.target, Target::Agent("CORE".into()));
        assert_eq!(out.payload, json!({"parcel": "12-0042"}));

        let status = agent.status();
        assert_eq!(status.requests_processed, 1);
        assert_eq!(status.active_requests, 0);
    }

    #[tokio::test]
    async fn test_error_round_trip() {
        let (agent, mut rx) = wired_agent(Box::new(FailingBehavior));
        let req = request(json!({"parcel": "bad"}));
        agent.on_message(&req).await;

        // Exactly one ERROR back to the sender, correlation preserved
        let out = rx.try_recv().unwrap();
        assert_eq!(out.event_type, EventType::Error);
        assert_eq!(out.correlation_id, req.correlation_id);
        assert_eq!(out.payload["error"], "PROCESSING_ERROR");
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

        let snapshot = agent.metrics_snapshot();
        assert_eq!(snapshot.requests_failed, 1);
        assert_eq!(snapshot.recent_errors.len(), 1);
    }

    #[tokio::test]
    async fn test_unhandled_event_types_are_ignored() {
        let (agent, mut rx) = wired_agent(Box::new(EchoBehavior));
        let msg = AgentMessage::new(
            "CORE",
            Target::Agent("valuation-agent".into()),
            EventType::Response,
            json!({}),
        );
        agent.on_message(&msg).await;
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
        assert_eq!(agent.metrics_snapshot().messages_received, 1);
    }

    #[tokio::test]
    async fn test_help_request_default_declines() {
        let (agent, mut rx) = wired_agent(Box::new(EchoBehavior));
        let msg = AgentMessage::new(
            "report-agent",
            Target::Agent("valuation-agent".into()),
            EventType::AssistanceRequested,
            json!({"need": "numbers"}),
        );
        agent.on_message(&msg).await;
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
        assert_eq!(agent.metrics_snapshot().help_requests_received, 1);
        assert_eq!(agent.metrics_snapshot().help_requests_provided, 0);
    }

    #[tokio::test]
    async fn test_help_request_override_provides() {
        let (agent, mut rx) = wired_agent(Box::new(HelpfulBehavior));
        let msg = AgentMessage::new(
            "report-agent",
            Target::Agent("valuation-agent".into()),
            EventType::AssistanceRequested,
            json!({"need": "numbers"}),
        );
        agent.on_message(&msg).await;

        let out = rx.try_recv().unwrap();
        assert_eq!(out.event_type, EventType::AssistanceProvided);
        assert_eq!(out.target, Target::Agent("report-agent".into()));
        assert_eq!(out.payload["helped"], "report-agent");
        assert_eq!(agent.metrics_snapshot().help_requests_provided, 1);
    }

    #[tokio::test]
    async fn test_learning_yields_status_update() {
        let (agent, mut rx) = wired_agent(Box::new(EchoBehavior));
        let exp = AgentExperience::new(
            "valuation-agent",
            Uuid::new_v4(),
            EventType::Request,
            10,
            Some(1.0),
            json!({}),
            json!({}),
        );
        let msg = AgentMessage::new(
            "CORE",
            Target::Agent("valuation-agent".into()),
            EventType::LearningTriggered,
            json!({ "experiences": [exp] }),
        );
        agent.on_message(&msg).await;

        let out = rx.try_recv().unwrap();
        assert_eq!(out.event_type, EventType::StatusUpdate);
        assert_eq!(out.payload["offered"], 1);
    }

    #[tokio::test]
    async fn test_malformed_learning_payload_errors() {
        let (agent, mut rx) = wired_agent(Box::new(EchoBehavior));
        let msg = AgentMessage::new(
            "CORE",
            Target::Agent("valuation-agent".into()),
            EventType::LearningTriggered,
            json!({ "experiences": "not-a-list" }),
        );
        agent.on_message(&msg).await;

        let out = rx.try_recv().unwrap();
        assert_eq!(out.event_type, EventType::Error);
        assert_eq!(out.payload["error"], "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_builtin_commands() {
        let (agent, mut rx) = wired_agent(Box::new(EchoBehavior));
        let cmd = |name: &str| {
            AgentMessage::new(
                "CORE",
                Target::Agent("valuation-agent".into()),
                EventType::Command,
                json!({ "command": name }),
            )
        };

        agent.on_message(&cmd("get_capabilities")).await;
        let out = rx.try_recv().unwrap();
        assert_eq!(out.event_type, EventType::CommandResult);
        assert_eq!(out.payload["capabilities"], json!(["income_analysis"]));

        agent.on_message(&cmd("get_status")).await;
        let out = rx.try_recv().unwrap();
        assert_eq!(out.event_type, EventType::CommandResult);
        assert_eq!(out.payload["health"], "healthy");

        agent.on_message(&cmd("reset_metrics")).await;
        let out = rx.try_recv().unwrap();
        assert_eq!(out.payload["reset"], true);
        assert_eq!(agent.metrics_snapshot().messages_received, 0);

        agent.on_message(&cmd("self_destruct")).await;
        let out = rx.try_recv().unwrap();
        assert_eq!(out.event_type, EventType::Error);
        assert_eq!(out.payload["error"], "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_broadcast_is_acknowledged() {
        let (agent, mut rx) = wired_agent(Box::new(EchoBehavior));
        let msg = AgentMessage::new(
            "CORE",
            Target::Broadcast,
            EventType::Broadcast,
            json!({"notice": "maintenance"}),
        );
        agent.on_message(&msg).await;

        let out = rx.try_recv().unwrap();
        assert_eq!(out.event_type, EventType::StatusUpdate);
        assert_eq!(out.payload["ack"], true);
        assert_eq!(out.correlation_id, msg.correlation_id);
    }

    #[tokio::test]
    async fn test_send_without_outbound_is_a_noop() {
        let agent = Agent::new(
            "orphan",
            AgentKind::Utility,
            vec![],
            Box::new(EchoBehavior),
        );
        // Must not panic, and metrics must not count a send
        agent.send_message(AgentMessage::new(
            "orphan",
            Target::Mcp,
            EventType::Heartbeat,
            json!({}),
        ));
        assert_eq!(agent.metrics_snapshot().messages_sent, 0);
    }

    #[tokio::test]
    async fn test_duplicate_capabilities_ignored() {
        let agent = Agent::new(
            "dupes",
            AgentKind::Utility,
            vec!["a".into(), "b".into(), "a".into()],
            Box::new(EchoBehavior),
        );
        assert_eq!(agent.capabilities(), &["a".to_string(), "b".to_string()]);
        assert!(agent.has_capability("a"));
        assert!(!agent.has_capability("c"));
    }

    #[tokio::test]
    async fn test_health_degrades_under_failures() {
        let (agent, mut rx) = wired_agent(Box::new(FailingBehavior));
        for _ in 0..4 {
            agent.on_message(&request(json!({}))).await;
            let _ = rx.try_recv();
        }
        // 4/4 failed -> over the 50% line
        assert_eq!(agent.status().health, Health::Error);
    }
}
