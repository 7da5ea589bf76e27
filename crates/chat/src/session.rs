//! A chat session bound to one UI context.

use std::{sync::Arc, time::Duration};

use {
    castle_config::ChatConfig,
    castle_gateway::{GatewayClient, GatewayError, GatewayEvent, Subscription},
    castle_protocol::methods,
    serde::Deserialize,
    serde_json::json,
    tokio::{
        sync::mpsc,
        time::{Instant, sleep_until},
    },
    tracing::{debug, info, warn},
};

use crate::{
    orphan::OrphanRegistry,
    run::RunUpdate,
    store::{MessageStatus, MessageStore, NewMessage},
    tracker::{RunOwner, RunTracker},
};

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub session_key: String,
    pub channel: String,
    pub agent_id: String,
    pub agent_name: String,
    pub heartbeat_timeout: Duration,
}

impl SessionOptions {
    pub fn from_config(config: &ChatConfig) -> Self {
        Self {
            session_key: config.session_key.clone(),
            channel: config.channel.clone(),
            agent_id: config.agent_id.clone(),
            agent_name: config.agent_name.clone(),
            heartbeat_timeout: Duration::from_millis(config.heartbeat_timeout_ms),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendAck {
    run_id: String,
}

pub struct ChatSession {
    client: GatewayClient,
    store: Arc<dyn MessageStore>,
    orphans: OrphanRegistry,
    subscription: Subscription,
    tracker: RunTracker,
    options: SessionOptions,
}

impl ChatSession {
    /// Subscribe to the client's bus and return the session with the
    /// receiver the UI renders from.
    pub fn new(
        client: GatewayClient,
        store: Arc<dyn MessageStore>,
        orphans: OrphanRegistry,
        options: SessionOptions,
    ) -> (Self, mpsc::UnboundedReceiver<RunUpdate>) {
        let subscription = client.subscribe();
        let (tracker, updates) = RunTracker::new(Arc::clone(&store), options.heartbeat_timeout);
        (
            Self {
                client,
                store,
                orphans,
                subscription,
                tracker,
                options,
            },
            updates,
        )
    }

    pub fn tracker(&self) -> &RunTracker {
        &self.tracker
    }

    /// Persist the user's message, send it, and track the resulting run.
    pub async fn send(&mut self, text: &str) -> Result<String, GatewayError> {
        if let Err(e) = self
            .store
            .create(NewMessage {
                channel: self.options.channel.clone(),
                sender: "user".into(),
                content: text.to_string(),
                run_id: None,
                status: MessageStatus::Complete,
            })
            .await
        {
            warn!(error = %e, "failed to persist user message");
        }

        let params = json!({
            "sessionKey": self.options.session_key,
            "message": text,
            "idempotencyKey": uuid::Uuid::new_v4().to_string(),
        });
        let payload = self.client.request(methods::CHAT_SEND, params).await?;
        let ack: SendAck = serde_json::from_value(payload)
            .map_err(|e| GatewayError::Protocol(format!("chat.send reply: {e}")))?;

        info!(run_id = %ack.run_id, session_key = %self.options.session_key, "chat run started");
        self.tracker.register(&ack.run_id, RunOwner {
            agent_id: self.options.agent_id.clone(),
            agent_name: self.options.agent_name.clone(),
            session_key: self.options.session_key.clone(),
            channel: self.options.channel.clone(),
        });
        Ok(ack.run_id)
    }

    /// Ask the gateway to stop a run. Its terminal event arrives as usual.
    pub async fn abort(&self, run_id: &str) -> Result<(), GatewayError> {
        self.client
            .request(
                methods::CHAT_ABORT,
                json!({ "sessionKey": self.options.session_key, "runId": run_id }),
            )
            .await?;
        Ok(())
    }

    /// Process the next bus event or heartbeat expiry. Returns `false` once
    /// the bus is gone.
    pub async fn pump(&mut self) -> bool {
        let deadline = self.tracker.heartbeat_deadline();
        tokio::select! {
            event = self.subscription.recv() => match event {
                Some(event) => {
                    self.tracker.handle_event(&event).await;
                    true
                },
                None => false,
            },
            () = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                self.tracker.check_heartbeat(Instant::now()).await;
                true
            },
        }
    }

    /// Pump until no run is awaiting a terminal event.
    pub async fn run_until_idle(&mut self) {
        while self.tracker.has_active_runs() {
            if !self.pump().await {
                break;
            }
        }
    }

    /// Process everything already queued, then drop the session. Runs still
    /// active afterwards move to the orphan registry.
    pub async fn close(mut self) {
        while let Some(event) = self.subscription.try_recv() {
            self.tracker.handle_event(&event).await;
        }
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        if !self.tracker.has_active_runs() {
            debug!(session_key = %self.options.session_key, "session closed with no active runs");
            return;
        }
        let handoff = self.orphans.prepare();
        let backlog: Vec<GatewayEvent> =
            std::iter::from_fn(|| self.subscription.try_recv()).collect();
        let runs = self.tracker.detach_active();
        info!(
            runs = runs.len(),
            backlog = backlog.len(),
            "handing active runs to orphan registry"
        );
        handoff.complete_with_backlog(runs, backlog);
    }
}
