//! The routing core: bot events go to a worker, worker actions go to a bot,
//! and responses find their way back through echo correlation.
//!
//! Outbound actions try the bot's socket first. If that fails the action is
//! appended to the remote hub partition of the durable log, which the caller
//! sees as [`DeliveryOutcome::DeliveredQueued`]. Nothing here holds a
//! registry lock while writing to a socket.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::{broadcast, oneshot, watch};

use botmesh_broker::{EntryId, Fields, LogBroker};
use botmesh_protocol::{
    classify, from_wire, to_wire, ActionFrame, ActionResponse, Frame, IdentityResolver,
    InternalMessage, RoutingHints, TypedAction, WorkerRegister, REMOTE_HUB_PARTITION,
    RETCODE_TIMEOUT, SKILL_RESULT_CHANNEL, WORKER_REGISTER_CHANNEL,
};
use botmesh_state::{BotRoute, PeerKind, Registry, StatScope, WorkerRoute};

use crate::routing::RoutingTable;
use crate::DispatchError;

/// Where a frame ended up.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    /// Written to the peer's socket.
    DeliveredDirect { peer: String },
    /// Handed to the durable log for another gateway to deliver.
    DeliveredQueued { partition: String, entry_id: EntryId },
    Failed { retcode: i64, reason: String },
}

impl DeliveryOutcome {
    pub fn is_delivered(&self) -> bool {
        !matches!(self, Self::Failed { .. })
    }

    fn failed(err: &DispatchError) -> Self {
        Self::Failed {
            retcode: err.retcode(),
            reason: err.to_string(),
        }
    }
}

/// Result of [`Dispatcher::dispatch_action`]. `response` is only set for
/// direct delivery, where the bot's answer can still arrive.
#[derive(Debug)]
pub struct ActionDispatch {
    pub outcome: DeliveryOutcome,
    pub echo: Option<String>,
    pub response: Option<oneshot::Receiver<ActionResponse>>,
}

impl ActionDispatch {
    fn without_response(outcome: DeliveryOutcome) -> Self {
        Self {
            outcome,
            echo: None,
            response: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub action_timeout: Duration,
    pub remote_hub_partition: String,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            action_timeout: Duration::from_secs(30),
            remote_hub_partition: REMOTE_HUB_PARTITION.into(),
        }
    }
}

fn frame_kind(frame: &Frame) -> &'static str {
    match frame {
        Frame::Event(_) => "event",
        Frame::Action(_) => "action",
        Frame::Response(_) => "response",
        Frame::Register(_) => "worker_register",
        Frame::SkillResult(_) => "skill_result",
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<Registry>,
    broker: Arc<dyn LogBroker>,
    routing: Arc<RoutingTable>,
    identity: Option<Arc<IdentityResolver>>,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<Registry>,
        broker: Arc<dyn LogBroker>,
        routing: Arc<RoutingTable>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            registry,
            broker,
            routing,
            identity: None,
            config,
        }
    }

    /// Map opaque platform identifiers to numeric ones on the way in and
    /// back on the way out.
    pub fn with_identity(mut self, resolver: Arc<IdentityResolver>) -> Self {
        self.identity = Some(resolver);
        self
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn routing(&self) -> &Arc<RoutingTable> {
        &self.routing
    }

    // ── Bot side ─────────────────────────────────────────────────────────────

    /// Process one text frame read from a bot socket.
    pub async fn handle_bot_frame(&self, bot: &BotRoute, text: &str) -> Result<(), DispatchError> {
        self.registry.touch_heartbeat(PeerKind::Bot, &bot.self_id).await;

        match classify(text)? {
            Frame::Event(value) => {
                let mut msg = from_wire(&value)?;
                if msg.self_id.is_empty() {
                    msg.self_id = bot.self_id.clone();
                }
                if msg.platform.is_empty() {
                    msg.platform = bot.platform.clone();
                }
                self.registry.note_bot_received(&bot.self_id, &msg.platform).await;
                if msg.is_heartbeat() {
                    tracing::trace!(self_id = %bot.self_id, "Bot heartbeat");
                    return Ok(());
                }
                if let Some(identity) = &self.identity {
                    identity.normalize(&mut msg).await?;
                }
                self.registry.count_traffic(StatScope::Bot, &bot.self_id).await;
                if msg.is_group() {
                    self.registry.count_traffic(StatScope::Group, &msg.group_id).await;
                }
                self.dispatch_event(&msg).await;
            }
            Frame::Response(response) => self.resolve_response(response).await,
            other => {
                tracing::warn!(
                    self_id = %bot.self_id,
                    kind = frame_kind(&other),
                    "Ignoring frame bots are not expected to send"
                );
            }
        }
        Ok(())
    }

    async fn resolve_response(&self, response: ActionResponse) {
        match response.echo_token() {
            Some(echo) => {
                if !self.registry.pending().resolve(&echo, response).await {
                    tracing::debug!(echo = %echo, "Response for unknown or expired echo");
                }
            }
            None => tracing::debug!("Response without echo, nothing to correlate"),
        }
    }

    /// Forward an event to one worker: the planned worker first, then the
    /// others in rotation order. Events are not buffered when nobody takes
    /// them.
    pub async fn dispatch_event(&self, msg: &InternalMessage) -> DeliveryOutcome {
        let workers = self.registry.worker_ids().await;
        if workers.is_empty() {
            tracing::warn!(event = %msg.id, self_id = %msg.self_id, "No worker connected, dropping event");
            return DeliveryOutcome::failed(&DispatchError::UnknownTarget("no worker connected".into()));
        }

        let capabilities = self.registry.worker_capabilities().await;
        let plan = self.routing.plan(msg, &workers, &capabilities).await;
        for worker_id in plan {
            let Some(route) = self.registry.worker_route(&worker_id).await else {
                continue;
            };
            match route.link.send_json(&to_wire(msg, route.dialect)) {
                Ok(()) => {
                    self.registry.note_event_forwarded(&worker_id, Utc::now()).await;
                    tracing::debug!(event = %msg.id, worker = %worker_id, "Event forwarded");
                    return DeliveryOutcome::DeliveredDirect { peer: worker_id };
                }
                Err(e) => {
                    tracing::warn!(worker = %worker_id, error = %e, "Failed to forward event, trying next worker");
                }
            }
        }

        tracing::warn!(event = %msg.id, "No worker accepted the event, dropping it");
        DeliveryOutcome::failed(&DispatchError::Transport("every worker link refused the event".into()))
    }

    // ── Actions ──────────────────────────────────────────────────────────────

    /// Deliver an action to a bot: socket first, durable log second.
    pub async fn dispatch_action(&self, frame: ActionFrame) -> ActionDispatch {
        self.route_action(frame)
            .await
            .unwrap_or_else(|e| ActionDispatch::without_response(DeliveryOutcome::failed(&e)))
    }

    /// Like [`Dispatcher::dispatch_action`], but a failed fallback append is
    /// returned as the error so queue callers can leave the entry pending.
    async fn route_action(&self, frame: ActionFrame) -> Result<ActionDispatch, DispatchError> {
        let typed = TypedAction::parse(&frame);
        let last = self.registry.last_observed().await;
        let hints = typed.routing_hints().or_last_observed(last.as_ref());

        let bot = match typed.self_id.as_deref() {
            Some(id) => self.registry.find_bot(Some(id), None).await,
            None => {
                let by_last = match hints.self_id.as_deref() {
                    Some(id) => self.registry.find_bot(Some(id), None).await,
                    None => None,
                };
                match by_last {
                    Some(bot) => Some(bot),
                    None => self.registry.find_bot(None, hints.platform.as_deref()).await,
                }
            }
        };

        if bot.is_none() && hints.self_id.is_none() && hints.platform.is_none() {
            let err = DispatchError::UnknownTarget(format!("no bot for action '{}'", frame.action));
            tracing::warn!(action = %frame.action, "Action has no reachable bot and no routing hints");
            return Ok(ActionDispatch::without_response(DeliveryOutcome::failed(&err)));
        }

        if let Some(bot) = bot {
            match self.send_to_bot(&bot, &frame).await {
                Ok((echo, rx)) => {
                    return Ok(ActionDispatch {
                        outcome: DeliveryOutcome::DeliveredDirect { peer: bot.self_id },
                        echo: Some(echo),
                        response: Some(rx),
                    });
                }
                Err(e) => tracing::warn!(
                    self_id = %bot.self_id,
                    action = %frame.action,
                    error = %e,
                    "Direct delivery failed, falling back to the durable log"
                ),
            }
        }

        match self.enqueue_remote(&frame, &hints).await {
            Ok(entry_id) => {
                tracing::info!(
                    action = %frame.action,
                    partition = %self.config.remote_hub_partition,
                    entry = %entry_id,
                    "Action queued for remote delivery"
                );
                Ok(ActionDispatch::without_response(DeliveryOutcome::DeliveredQueued {
                    partition: self.config.remote_hub_partition.clone(),
                    entry_id,
                }))
            }
            Err(e) => {
                tracing::error!(action = %frame.action, error = %e, "Fallback publish failed");
                Err(e)
            }
        }
    }

    async fn send_to_bot(
        &self,
        bot: &BotRoute,
        frame: &ActionFrame,
    ) -> Result<(String, oneshot::Receiver<ActionResponse>), DispatchError> {
        let mut params = frame.params.clone();
        if let Some(identity) = &self.identity {
            identity.denormalize_params(&bot.platform, &mut params).await?;
        }

        let pending = self.registry.pending();
        let (echo, rx) = pending.register().await;
        let outbound = ActionFrame {
            action: frame.action.clone(),
            params,
            echo: Some(Value::from(echo.clone())),
        };
        if let Err(e) = bot.link.send_json(&outbound) {
            pending.cancel(&echo).await;
            return Err(DispatchError::Transport(e.to_string()));
        }
        pending.mark_sent(&echo).await;
        self.registry.note_bot_sent(&bot.self_id).await;
        Ok((echo, rx))
    }

    async fn enqueue_remote(&self, frame: &ActionFrame, hints: &RoutingHints) -> Result<EntryId, DispatchError> {
        let mut fields = Fields::new();
        fields.insert("type".into(), "action".into());
        fields.insert("action".into(), frame.action.clone());
        fields.insert("payload".into(), serde_json::to_string(frame).map_err(botmesh_protocol::ProtocolError::from)?);
        fields.insert("timestamp".into(), Utc::now().timestamp().to_string());
        let optional = [
            ("platform", &hints.platform),
            ("self_id", &hints.self_id),
            ("group_id", &hints.group_id),
            ("user_id", &hints.user_id),
            ("text", &hints.text),
        ];
        for (key, value) in optional {
            if let Some(v) = value {
                fields.insert(key.to_string(), v.clone());
            }
        }
        Ok(self
            .broker
            .append(&self.config.remote_hub_partition, fields)
            .await?)
    }

    /// Dispatch an action and wait for the bot's answer. Queued delivery
    /// answers immediately with an `async` response.
    pub async fn send_action_and_wait(&self, frame: ActionFrame) -> Result<ActionResponse, DispatchError> {
        let caller_echo = frame.echo.clone();
        let dispatch = self.dispatch_action(frame).await;
        match dispatch.outcome {
            DeliveryOutcome::DeliveredDirect { .. } => {
                let (Some(rx), Some(echo)) = (dispatch.response, dispatch.echo) else {
                    return Err(DispatchError::Transport("direct delivery without a response channel".into()));
                };
                match tokio::time::timeout(self.config.action_timeout, rx).await {
                    Ok(Ok(mut response)) => {
                        response.echo = caller_echo;
                        Ok(response)
                    }
                    Ok(Err(_)) => Err(DispatchError::Timeout(format!("response to {echo}"))),
                    Err(_) => {
                        self.registry.pending().cancel(&echo).await;
                        Err(DispatchError::Timeout(format!("response to {echo}")))
                    }
                }
            }
            DeliveryOutcome::DeliveredQueued { partition, entry_id } => Ok(ActionResponse::queued(
                json!({"partition": partition, "entry_id": entry_id.to_string()}),
                caller_echo,
            )),
            DeliveryOutcome::Failed { retcode, reason } => Ok(ActionResponse::failed(retcode, reason, caller_echo)),
        }
    }

    // ── Worker side ──────────────────────────────────────────────────────────

    /// Process one text frame read from a worker socket.
    pub async fn handle_worker_frame(&self, worker: &WorkerRoute, text: &str) -> Result<(), DispatchError> {
        self.registry.touch_heartbeat(PeerKind::Worker, &worker.worker_id).await;

        match classify(text)? {
            Frame::Action(frame) => self.relay_action(worker, frame).await,
            Frame::Register(announcement) => self.apply_registration(worker, announcement).await,
            Frame::SkillResult(result) => {
                let payload = serde_json::to_string(&result).map_err(botmesh_protocol::ProtocolError::from)?;
                if let Err(e) = self.broker.publish(SKILL_RESULT_CHANNEL, &payload).await {
                    tracing::warn!(worker = %worker.worker_id, error = %e, "Failed to publish skill result");
                }
            }
            Frame::Response(response) => self.resolve_response(response).await,
            Frame::Event(_) => {
                tracing::trace!(worker = %worker.worker_id, "Worker event treated as a sign of life");
            }
        }
        Ok(())
    }

    /// Forward a worker's action to a bot and send the outcome back to the
    /// worker under the worker's own echo.
    async fn relay_action(&self, worker: &WorkerRoute, frame: ActionFrame) {
        let started = Instant::now();
        self.registry.note_worker_action(&worker.worker_id, Utc::now()).await;
        let worker_echo = frame.echo.clone();
        let action = frame.action.clone();

        let dispatch = self.dispatch_action(frame).await;
        let immediate = match dispatch.outcome {
            DeliveryOutcome::DeliveredDirect { .. } => None,
            DeliveryOutcome::DeliveredQueued { partition, entry_id } => Some(ActionResponse::queued(
                json!({"partition": partition, "entry_id": entry_id.to_string()}),
                worker_echo.clone(),
            )),
            DeliveryOutcome::Failed { retcode, reason } => {
                Some(ActionResponse::failed(retcode, reason, worker_echo.clone()))
            }
        };
        if let Some(response) = immediate {
            if let Err(e) = worker.link.send_json(&response) {
                tracing::debug!(worker = %worker.worker_id, error = %e, "Worker gone before action outcome");
            }
            return;
        }

        let (Some(rx), Some(echo)) = (dispatch.response, dispatch.echo) else {
            return;
        };
        // Waiting happens off the worker's read loop so its later frames are
        // not held up behind a slow bot.
        let this = self.clone();
        let worker = worker.clone();
        tokio::spawn(async move {
            let response = match tokio::time::timeout(this.config.action_timeout, rx).await {
                Ok(Ok(mut response)) => {
                    let rtt_ms = started.elapsed().as_secs_f64() * 1000.0;
                    this.registry.record_rtt(&worker.worker_id, rtt_ms).await;
                    response.echo = worker_echo;
                    response
                }
                Ok(Err(_)) => ActionResponse::failed(RETCODE_TIMEOUT, "response expired", worker_echo),
                Err(_) => {
                    this.registry.pending().cancel(&echo).await;
                    tracing::warn!(worker = %worker.worker_id, action = %action, "Bot did not answer in time");
                    ActionResponse::failed(RETCODE_TIMEOUT, "bot did not answer in time", worker_echo)
                }
            };
            if let Err(e) = worker.link.send_json(&response) {
                tracing::debug!(worker = %worker.worker_id, error = %e, "Worker gone before the bot answered");
            }
        });
    }

    async fn apply_registration(&self, worker: &WorkerRoute, announcement: WorkerRegister) {
        if !announcement.worker_id.is_empty() && announcement.worker_id != worker.worker_id {
            tracing::warn!(
                connection = %worker.worker_id,
                announced = %announcement.worker_id,
                "Announcement names another worker, using the connection's id"
            );
        }
        let announcement = WorkerRegister {
            worker_id: worker.worker_id.clone(),
            timestamp: if announcement.timestamp > 0 {
                announcement.timestamp
            } else {
                Utc::now().timestamp()
            },
            ..announcement
        };
        let count = announcement.capabilities.len();
        self.registry
            .set_capabilities(&worker.worker_id, announcement.capabilities.clone())
            .await;
        tracing::info!(worker = %worker.worker_id, capabilities = count, "Worker capabilities updated");

        match serde_json::to_string(&announcement) {
            Ok(payload) => {
                if let Err(e) = self.broker.publish(WORKER_REGISTER_CHANNEL, &payload).await {
                    tracing::warn!(worker = %worker.worker_id, error = %e, "Failed to publish worker announcement");
                }
            }
            Err(e) => tracing::warn!(error = %e, "Failed to encode worker announcement"),
        }
    }

    /// Apply an announcement received on the register channel. Only workers
    /// connected to this gateway are affected.
    pub async fn apply_remote_announcement(&self, payload: &str) -> bool {
        match serde_json::from_str::<WorkerRegister>(payload) {
            Ok(announcement) => {
                self.registry
                    .set_capabilities(&announcement.worker_id, announcement.capabilities)
                    .await
            }
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring malformed worker announcement");
                false
            }
        }
    }

    /// Follow the register channel until shutdown.
    pub async fn run_announcement_listener(self, mut shutdown: watch::Receiver<bool>) {
        let mut rx = self.broker.subscribe(WORKER_REGISTER_CHANNEL);
        loop {
            tokio::select! {
                received = rx.recv() => match received {
                    Ok(payload) => {
                        self.apply_remote_announcement(&payload).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Worker announcement listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    // ── Queue path ───────────────────────────────────────────────────────────

    /// Dispatch an event or action taken from the durable log.
    pub async fn dispatch_internal_event(&self, payload: &Value) -> Result<DeliveryOutcome, DispatchError> {
        if payload.get("post_type").is_some() {
            let mut msg = from_wire(payload)?;
            if let Some(identity) = &self.identity {
                identity.normalize(&mut msg).await?;
            }
            return Ok(self.dispatch_event(&msg).await);
        }
        if payload.get("action").and_then(Value::as_str).is_some() {
            let frame: ActionFrame = serde_json::from_value(payload.clone())
                .map_err(|e| DispatchError::Malformed(e.to_string()))?;
            return Ok(self.route_action(frame).await?.outcome);
        }
        Err(DispatchError::Malformed(
            "queue payload is neither an event nor an action".into(),
        ))
    }

    /// Send a frame to every connected worker. Returns how many took it.
    pub async fn broadcast_to_workers(&self, frame: &Value) -> usize {
        let text = frame.to_string();
        let mut delivered = 0;
        for worker_id in self.registry.worker_ids().await {
            if let Some(route) = self.registry.worker_route(&worker_id).await {
                if route.link.try_send_text(text.clone()).is_ok() {
                    delivered += 1;
                }
            }
        }
        delivered
    }
}
