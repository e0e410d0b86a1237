//! The router: bounded queue, drain worker, dispatch, system commands
//!
//! `handle_message` never blocks and never fails loudly: a message is either
//! admitted to the queue or dropped with a log line. One spawned worker task
//! drains the queue strictly sequentially; every dispatch failure is
//! converted into an `ERROR` message back to the originator (or logged when
//! the source has no verified return address) so the queue keeps draining.

use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex as AsyncMutex, RwLock as AsyncRwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use valora_agents::Agent;
use valora_core::{
    AgentExperience, AgentId, AgentMessage, AgentStatus, BusError, EventType, Target, CORE_SOURCE,
};
use valora_replay::{BufferStats, ReplayBuffer, ReplayConfig};

use crate::metrics::{RouterMetrics, RouterStatus};
use crate::registry::Registry;
use crate::throttle::{SourceThrottle, ThrottleConfig};

/// Router tuning knobs
#[derive(Debug, Clone)]
pub struct McpConfig {
    /// Bounded queue capacity; admission beyond it drops the message
    pub queue_capacity: usize,
    /// Log every admitted message at debug level
    pub log_messages: bool,
    /// Per-source throttling; disabled by default
    pub throttle: Option<ThrottleConfig>,
    /// Deadline for one dispatched message
    pub dispatch_timeout: std::time::Duration,
    pub replay: ReplayConfig,
}

impl Default for McpConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            log_messages: false,
            throttle: None,
            dispatch_timeout: std::time::Duration::from_secs(30),
            replay: ReplayConfig::default(),
        }
    }
}

struct Inner {
    config: McpConfig,
    /// Taken (and thereby closed) on shutdown
    tx: StdRwLock<Option<mpsc::Sender<AgentMessage>>>,
    registry: AsyncRwLock<Registry>,
    replay: AsyncMutex<ReplayBuffer>,
    metrics: StdMutex<RouterMetrics>,
    worker: StdMutex<Option<JoinHandle<()>>>,
    started_at: DateTime<Utc>,
}

/// The Master Control Program. Cheap to clone; all clones share one queue,
/// registry, and replay buffer.
#[derive(Clone)]
pub struct Mcp {
    inner: Arc<Inner>,
}

impl Mcp {
    /// Construct with defaults. Requires a tokio runtime: the drain worker
    /// is spawned here.
    pub fn new() -> Self {
        Self::with_config(McpConfig::default())
    }

    pub fn with_config(config: McpConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let replay = ReplayBuffer::with_config(config.replay.clone());
        let inner = Arc::new(Inner {
            config,
            tx: StdRwLock::new(Some(tx)),
            registry: AsyncRwLock::new(Registry::new()),
            replay: AsyncMutex::new(replay),
            metrics: StdMutex::new(RouterMetrics::default()),
            worker: StdMutex::new(None),
            started_at: Utc::now(),
        });

        let handle = tokio::spawn(Self::run(inner.clone(), rx));
        *inner.worker.lock().expect("worker handle lock poisoned") = Some(handle);

        Self { inner }
    }

    // === Registration ===

    /// Register an agent: index it, install its outbound channel, and queue
    /// a `REGISTRATION` welcome. A duplicate id logs a warning and replaces
    /// the previous registration.
    pub async fn register_agent(&self, agent: Agent) -> Arc<Agent> {
        let agent = Arc::new(agent);
        if let Some(sender) = self.sender() {
            agent.set_outbound(sender);
        }

        let (replaced, agent_count) = {
            let mut registry = self.inner.registry.write().await;
            let replaced = registry.insert(agent.clone());
            (replaced, registry.len())
        };
        if let Some(old) = replaced {
            warn!(agent = %agent.id(), "duplicate agent id, replacing previous registration");
            old.clear_outbound();
        }
        self.inner
            .metrics
            .lock()
            .expect("router metrics lock poisoned")
            .registrations += 1;

        info!(agent = %agent.id(), kind = ?agent.kind(), "agent registered");

        let welcome = AgentMessage::new(
            CORE_SOURCE,
            Target::Agent(agent.id().clone()),
            EventType::Registration,
            json!({
                "agent_count": agent_count,
                "queue_depth": self.queue_depth(),
            }),
        );
        self.handle_message(welcome).await;

        agent
    }

    /// Remove an agent from every index. A warning no-op if unknown.
    pub async fn unregister_agent(&self, id: &str) -> bool {
        let removed = self.inner.registry.write().await.remove(id);
        match removed {
            Some(agent) => {
                agent.clear_outbound();
                self.inner
                    .metrics
                    .lock()
                    .expect("router metrics lock poisoned")
                    .unregistrations += 1;
                info!(agent = %id, "agent unregistered");
                true
            }
            None => {
                warn!(agent = %id, "cannot unregister unknown agent");
                false
            }
        }
    }

    // === Ingress ===

    /// Validate and enqueue one message. Returns whether it was admitted.
    ///
    /// Malformed messages and messages from unregistered non-system sources
    /// are dropped with a log line; there is no verified return address to
    /// echo an error to. A full queue also drops (the back-pressure policy).
    pub async fn handle_message(&self, msg: AgentMessage) -> bool {
        if let Err(e) = msg.validate() {
            warn!(error = %e, "dropping malformed message");
            self.count_dropped();
            return false;
        }
        if msg.source != CORE_SOURCE && !self.inner.registry.read().await.contains(&msg.source) {
            warn!(source = %msg.source, "dropping message from unregistered source");
            self.count_dropped();
            return false;
        }

        let Some(sender) = self.sender() else {
            warn!("bus is shut down, dropping message");
            return false;
        };
        if self.inner.config.log_messages {
            debug!(
                source = %msg.source,
                target = %msg.target,
                event = ?msg.event_type,
                "message admitted"
            );
        }
        match sender.try_send(msg) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(msg)) => {
                warn!(source = %msg.source, event = ?msg.event_type, "queue full, dropping message");
                self.count_dropped();
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("bus is shut down, dropping message");
                false
            }
        }
    }

    /// Ingress for untyped JSON from the web layer
    pub async fn handle_raw(&self, value: Value) -> bool {
        match AgentMessage::from_value(value) {
            Ok(msg) => self.handle_message(msg).await,
            Err(e) => {
                warn!(error = %e, "dropping undeserializable message");
                self.count_dropped();
                false
            }
        }
    }

    /// Convenience for the embedding application: send as `CORE`
    pub async fn send_system_message(
        &self,
        target: Target,
        event_type: EventType,
        payload: Value,
    ) -> bool {
        self.handle_message(AgentMessage::new(CORE_SOURCE, target, event_type, payload))
            .await
    }

    // === Admin surface ===

    pub async fn agent_status(&self, id: &str) -> Option<AgentStatus> {
        self.inner.registry.read().await.get(id).map(|a| a.status())
    }

    pub async fn registered_agents(&self) -> Vec<AgentId> {
        self.inner.registry.read().await.ids()
    }

    pub async fn agent_count(&self) -> usize {
        self.inner.registry.read().await.len()
    }

    /// Messages currently sitting in the queue
    pub fn queue_depth(&self) -> usize {
        match self.sender() {
            Some(s) => s.max_capacity() - s.capacity(),
            None => 0,
        }
    }

    pub fn router_status(&self) -> RouterStatus {
        self.inner
            .metrics
            .lock()
            .expect("router metrics lock poisoned")
            .snapshot()
    }

    pub async fn recent_experiences(&self, limit: usize) -> Vec<AgentExperience> {
        self.inner.replay.lock().await.get_recent(limit)
    }

    pub async fn replay_stats(&self) -> BufferStats {
        self.inner.replay.lock().await.get_stats()
    }

    /// Expiry sweep over the replay buffer; scheduling is the embedder's job
    pub async fn cleanup_expired_experiences(&self) -> usize {
        self.inner.replay.lock().await.cleanup_expired()
    }

    pub async fn system_info(&self) -> Value {
        let uptime = Utc::now()
            .signed_duration_since(self.inner.started_at)
            .num_seconds();
        json!({
            "uptime_secs": uptime,
            "agent_count": self.agent_count().await,
            "queue_depth": self.queue_depth(),
            "replay_size": self.inner.replay.lock().await.len(),
            "router": self.router_status(),
        })
    }

    /// Graceful teardown: close admission, let the worker drain what was
    /// already queued, await it, then clear the error ring.
    pub async fn shutdown(&self) {
        let sender = self
            .inner
            .tx
            .write()
            .expect("sender lock poisoned")
            .take();
        if sender.is_none() {
            return; // already shut down
        }

        {
            let registry = self.inner.registry.read().await;
            for agent in registry.agents() {
                agent.clear_outbound();
            }
        }
        drop(sender);

        let handle = self
            .inner
            .worker
            .lock()
            .expect("worker handle lock poisoned")
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "drain worker terminated abnormally");
            }
        }

        let mut m = self
            .inner
            .metrics
            .lock()
            .expect("router metrics lock poisoned");
        m.recent_errors.clear();
        info!("bus shut down");
    }

    fn sender(&self) -> Option<mpsc::Sender<AgentMessage>> {
        self.inner.tx.read().expect("sender lock poisoned").clone()
    }

    fn count_dropped(&self) {
        self.inner
            .metrics
            .lock()
            .expect("router metrics lock poisoned")
            .messages_dropped += 1;
    }

    // === Drain loop ===

    /// The single drain worker. Strictly sequential: one message is fully
    /// dispatched before the next is popped. A throttled message is held
    /// and the whole queue defers for one window.
    async fn run(inner: Arc<Inner>, mut rx: mpsc::Receiver<AgentMessage>) {
        let mut throttle = inner.config.throttle.clone().map(SourceThrottle::new);
        let mut held: Option<AgentMessage> = None;

        loop {
            let msg = match held.take() {
                Some(msg) => msg,
                None => match rx.recv().await {
                    Some(msg) => msg,
                    // All senders gone and the queue is drained
                    None => break,
                },
            };

            if let Some(t) = throttle.as_mut() {
                if !t.try_acquire(&msg.source) {
                    debug!(source = %msg.source, "source throttled, deferring queue");
                    let delay = t.retry_delay();
                    held = Some(msg);
                    tokio::time::sleep(delay).await;
                    continue;
                }
            }

            Self::dispatch_one(&inner, msg).await;
        }
        debug!("drain worker exited");
    }

    async fn dispatch_one(inner: &Arc<Inner>, msg: AgentMessage) {
        let start = Instant::now();
        let outcome = match &msg.target {
            Target::Mcp => Self::handle_local(inner, &msg).await,
            Target::Broadcast => Self::broadcast(inner, &msg).await,
            Target::Agent(id) => Self::deliver(inner, id, &msg).await,
        };
        let elapsed_ms = start.elapsed().as_millis() as u64;

        metrics::counter!("valora_bus_messages_total").increment(1);
        let result_value = match &outcome {
            Ok(value) => {
                inner
                    .metrics
                    .lock()
                    .expect("router metrics lock poisoned")
                    .messages_processed += 1;
                value.clone()
            }
            Err(err) => {
                warn!(
                    source = %msg.source,
                    target = %msg.target,
                    event = ?msg.event_type,
                    error = %err,
                    "dispatch failed"
                );
                {
                    let mut m = inner
                        .metrics
                        .lock()
                        .expect("router metrics lock poisoned");
                    m.messages_errored += 1;
                    m.record_error(err.to_string());
                }
                metrics::counter!("valora_bus_dispatch_errors_total").increment(1);
                Self::reply_to_source(inner, &msg, EventType::Error, err.to_payload()).await;
                err.to_payload()
            }
        };

        let owner: AgentId = match &msg.target {
            Target::Agent(id) => id.clone(),
            Target::Mcp => "MCP".into(),
            Target::Broadcast => "BROADCAST".into(),
        };
        let success_rate = if outcome.is_ok() { 1.0 } else { 0.0 };
        let experience = AgentExperience::new(
            owner,
            msg.correlation_id,
            msg.event_type,
            elapsed_ms,
            Some(success_rate),
            msg.payload.clone(),
            result_value,
        );
        inner.replay.lock().await.add(experience);
    }

    /// Deliver to one named agent under the dispatch deadline.
    ///
    /// `CORE` is a valid sink: the embedding application has no inbox, so
    /// responses addressed to it are observed through the replay buffer and
    /// admin getters instead.
    async fn deliver(inner: &Arc<Inner>, id: &str, msg: &AgentMessage) -> Result<Value, BusError> {
        if id == CORE_SOURCE {
            debug!(event = ?msg.event_type, "message addressed to CORE, absorbed");
            return Ok(json!({ "delivered": CORE_SOURCE }));
        }
        let agent = inner.registry.read().await.get(id);
        match agent {
            Some(agent) => {
                match tokio::time::timeout(inner.config.dispatch_timeout, agent.on_message(msg))
                    .await
                {
                    Ok(()) => Ok(json!({ "delivered": id })),
                    Err(_) => Err(BusError::Timeout(format!(
                        "dispatch to {id} exceeded {:?}",
                        inner.config.dispatch_timeout
                    ))),
                }
            }
            None => Err(BusError::AgentUnreachable(id.to_string())),
        }
    }

    /// Re-addressed copy to every registered agent except the sender.
    /// Individual delivery failures are isolated and logged.
    async fn broadcast(inner: &Arc<Inner>, msg: &AgentMessage) -> Result<Value, BusError> {
        let recipients: Vec<Arc<Agent>> = {
            let registry = inner.registry.read().await;
            registry
                .agents()
                .filter(|a| a.id() != &msg.source)
                .cloned()
                .collect()
        };

        let mut delivered = 0usize;
        for agent in &recipients {
            let copy = msg.readdress(Target::Agent(agent.id().clone()));
            match tokio::time::timeout(inner.config.dispatch_timeout, agent.on_message(&copy))
                .await
            {
                Ok(()) => delivered += 1,
                Err(_) => {
                    warn!(agent = %agent.id(), "broadcast delivery timed out");
                }
            }
        }

        inner
            .metrics
            .lock()
            .expect("router metrics lock poisoned")
            .broadcasts_sent += 1;
        Ok(json!({ "recipients": delivered }))
    }

    /// Messages addressed to the router itself
    async fn handle_local(inner: &Arc<Inner>, msg: &AgentMessage) -> Result<Value, BusError> {
        match msg.event_type {
            EventType::Heartbeat => {
                Self::reply_to_source(
                    inner,
                    msg,
                    EventType::StatusUpdate,
                    json!({ "ack": true }),
                )
                .await;
                Ok(json!({ "ack": true }))
            }
            EventType::AssistanceRequested => Self::route_help_request(inner, msg).await,
            EventType::Command => {
                let result = Self::system_command(inner, msg).await?;
                Self::reply_to_source(inner, msg, EventType::CommandResult, result.clone()).await;
                Ok(result)
            }
            other => {
                debug!(event = ?other, source = %msg.source, "router ignoring event type");
                Ok(json!({ "ignored": true }))
            }
        }
    }

    /// Capability-based help routing: score every other agent by required
    /// coverage and forward the original payload to the best match.
    async fn route_help_request(
        inner: &Arc<Inner>,
        msg: &AgentMessage,
    ) -> Result<Value, BusError> {
        let required: Vec<String> = msg
            .payload
            .get("required_capabilities")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| BusError::Validation(format!("malformed required_capabilities: {e}")))?
            .unwrap_or_default();

        let best = inner
            .registry
            .read()
            .await
            .best_helper(&required, &msg.source);

        match best {
            Some((helper, score)) => {
                debug!(
                    requester = %msg.source,
                    helper = %helper.id(),
                    score,
                    "help request routed"
                );
                inner
                    .metrics
                    .lock()
                    .expect("router metrics lock poisoned")
                    .help_requests_routed += 1;

                // Forwarded copy keeps the requester as source, so the
                // helper's answer goes straight back to it
                let forward = msg.readdress(Target::Agent(helper.id().clone()));
                match tokio::time::timeout(
                    inner.config.dispatch_timeout,
                    helper.on_message(&forward),
                )
                .await
                {
                    Ok(()) => Ok(json!({ "routed_to": helper.id(), "score": score })),
                    Err(_) => Err(BusError::Timeout(format!(
                        "help dispatch to {} exceeded {:?}",
                        helper.id(),
                        inner.config.dispatch_timeout
                    ))),
                }
            }
            None => Err(BusError::CapabilityMismatch(required.join(", "))),
        }
    }

    /// Built-in commands targeted at the router
    async fn system_command(inner: &Arc<Inner>, msg: &AgentMessage) -> Result<Value, BusError> {
        let command = msg
            .payload
            .get("command")
            .and_then(Value::as_str)
            .unwrap_or_default();

        match command {
            "get_agent_list" => {
                let kind = msg
                    .payload
                    .get("kind")
                    .cloned()
                    .map(serde_json::from_value)
                    .transpose()
                    .map_err(|e| BusError::Validation(format!("unknown agent kind: {e}")))?;
                let registry = inner.registry.read().await;
                let ids = match kind {
                    Some(kind) => registry.ids_of_kind(kind),
                    None => registry.ids(),
                };
                let agents: Vec<Value> = ids
                    .iter()
                    .filter_map(|id| registry.get(id))
                    .map(|a| {
                        json!({
                            "agent_id": a.id(),
                            "kind": a.kind(),
                            "capabilities": a.capabilities(),
                        })
                    })
                    .collect();
                Ok(json!({ "agents": agents }))
            }
            "get_agent_status" => {
                let id = msg
                    .payload
                    .get("agent_id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| BusError::Validation("missing agent_id".into()))?;
                let agent = inner
                    .registry
                    .read()
                    .await
                    .get(id)
                    .ok_or_else(|| BusError::UnknownAgent(id.to_string()))?;
                serde_json::to_value(agent.status())
                    .map_err(|e| BusError::Processing(e.to_string()))
            }
            "get_capability_map" => {
                let map = inner.registry.read().await.capability_map();
                serde_json::to_value(map).map_err(|e| BusError::Processing(e.to_string()))
            }
            "trigger_training" => Self::trigger_training(inner, msg).await,
            "system_info" => {
                let registry = inner.registry.read().await;
                let replay = inner.replay.lock().await;
                let uptime = Utc::now()
                    .signed_duration_since(inner.started_at)
                    .num_seconds();
                Ok(json!({
                    "uptime_secs": uptime,
                    "agent_count": registry.len(),
                    "replay_size": replay.len(),
                    "router": inner
                        .metrics
                        .lock()
                        .expect("router metrics lock poisoned")
                        .snapshot(),
                }))
            }
            other => Err(BusError::Validation(format!(
                "unknown system command: {other:?}"
            ))),
        }
    }

    /// Fan buffered experiences back out to their owning agents
    async fn trigger_training(inner: &Arc<Inner>, msg: &AgentMessage) -> Result<Value, BusError> {
        let count = msg
            .payload
            .get("count")
            .and_then(Value::as_u64)
            .unwrap_or(50) as usize;
        let only: Option<&str> = msg.payload.get("agent_id").and_then(Value::as_str);

        let targets: Vec<Arc<Agent>> = {
            let registry = inner.registry.read().await;
            match only {
                Some(id) => registry
                    .get(id)
                    .map(|a| vec![a])
                    .ok_or_else(|| BusError::UnknownAgent(id.to_string()))?,
                None => registry.agents().cloned().collect(),
            }
        };

        let mut triggered = serde_json::Map::new();
        for agent in targets {
            let experiences = {
                let replay = inner.replay.lock().await;
                replay.get_by_agent(agent.id(), count)
            };
            if experiences.is_empty() {
                continue;
            }
            let batch_size = experiences.len();
            let learning = AgentMessage::new(
                msg.source.clone(),
                Target::Agent(agent.id().clone()),
                EventType::LearningTriggered,
                json!({ "experiences": experiences, "count": batch_size }),
            );
            match tokio::time::timeout(inner.config.dispatch_timeout, agent.on_message(&learning))
                .await
            {
                Ok(()) => {
                    triggered.insert(agent.id().clone(), json!(batch_size));
                }
                Err(_) => {
                    warn!(agent = %agent.id(), "training dispatch timed out");
                }
            }
        }

        Ok(json!({ "triggered": triggered }))
    }

    /// Deliver a router-generated reply straight to the source agent.
    /// Sources without a verified return address (unregistered, or `CORE`)
    /// only get a log line.
    async fn reply_to_source(
        inner: &Arc<Inner>,
        original: &AgentMessage,
        event_type: EventType,
        payload: Value,
    ) {
        let agent = inner.registry.read().await.get(&original.source);
        match agent {
            Some(agent) => {
                let reply = original.reply("MCP", event_type, payload);
                agent.on_message(&reply).await;
            }
            None => {
                debug!(
                    source = %original.source,
                    event = ?event_type,
                    "no return address for router reply, dropping"
                );
            }
        }
    }
}

impl Default for Mcp {
    fn default() -> Self {
        Self::new()
    }
}
