//! Per-session run tracking.
//!
//! A run is tracked from the `chat.send` acknowledgment until its first
//! terminal event. Tracking stops *before* the persist is awaited so a
//! duplicate terminal event can never persist twice, while the run itself
//! stays in memory until the persist attempt returns.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use {
    castle_gateway::GatewayEvent,
    castle_protocol::{
        chat::{ChatEvent, ChatState},
        events,
    },
    tokio::{sync::mpsc, time::Instant},
    tracing::{debug, info, trace, warn},
};

use crate::{
    run::{Run, RunPhase, RunUpdate, persist_run},
    store::{MessageStatus, MessageStore, now_ms},
};

pub struct RunTracker {
    runs: HashMap<String, Run>,
    /// Runs still awaiting a terminal event.
    tracked: HashSet<String>,
    thinking: HashSet<String>,
    last_event_at: Instant,
    heartbeat_timeout: Duration,
    store: Arc<dyn MessageStore>,
    updates: mpsc::UnboundedSender<RunUpdate>,
}

/// Who and where a run belongs to.
#[derive(Debug, Clone)]
pub struct RunOwner {
    pub agent_id: String,
    pub agent_name: String,
    pub session_key: String,
    pub channel: String,
}

impl RunTracker {
    pub fn new(
        store: Arc<dyn MessageStore>,
        heartbeat_timeout: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<RunUpdate>) {
        let (updates, rx) = mpsc::unbounded_channel();
        (
            Self {
                runs: HashMap::new(),
                tracked: HashSet::new(),
                thinking: HashSet::new(),
                last_event_at: Instant::now(),
                heartbeat_timeout,
                store,
                updates,
            },
            rx,
        )
    }

    pub fn is_tracking(&self, run_id: &str) -> bool {
        self.tracked.contains(run_id)
    }

    pub fn has_active_runs(&self) -> bool {
        !self.tracked.is_empty()
    }

    pub fn run(&self, run_id: &str) -> Option<&Run> {
        self.runs.get(run_id)
    }

    pub fn is_thinking(&self, agent_id: &str) -> bool {
        self.thinking.contains(agent_id)
    }

    fn emit(&self, update: RunUpdate) {
        let _ = self.updates.send(update);
    }

    /// Start tracking an acknowledged send.
    pub fn register(&mut self, run_id: &str, owner: RunOwner) {
        let run = Run {
            run_id: run_id.to_string(),
            agent_id: owner.agent_id,
            agent_name: owner.agent_name,
            session_key: owner.session_key,
            channel: owner.channel,
            content: String::new(),
            started_at_ms: now_ms(),
            phase: RunPhase::Sent,
        };
        debug!(run_id, agent_id = %run.agent_id, "tracking run");
        if self.tracked.is_empty() {
            self.last_event_at = Instant::now();
        }
        self.tracked.insert(run.run_id.clone());
        if self.thinking.insert(run.agent_id.clone()) {
            self.emit(RunUpdate::AgentThinking {
                agent_id: run.agent_id.clone(),
                thinking: true,
            });
        }
        self.emit(RunUpdate::Started(run.snapshot()));
        self.runs.insert(run.run_id.clone(), run);
    }

    /// Feed one bus event. Every gateway event counts as liveness.
    pub async fn handle_event(&mut self, event: &GatewayEvent) {
        let GatewayEvent::Gateway(frame) = event else {
            return;
        };
        self.last_event_at = Instant::now();
        if frame.event != events::CHAT {
            return;
        }
        match serde_json::from_value::<ChatEvent>(frame.payload.clone()) {
            Ok(chat) => self.handle_chat(chat).await,
            Err(e) => debug!(error = %e, "ignoring malformed chat event"),
        }
    }

    pub async fn handle_chat(&mut self, chat: ChatEvent) {
        match chat.state {
            ChatState::Delta => self.apply_delta(&chat),
            ChatState::Final => {
                if !self.tracked.remove(&chat.run_id) {
                    debug!(run_id = %chat.run_id, "dropping final for untracked run");
                    return;
                }
                self.finish(&chat.run_id, chat.content(), MessageStatus::Complete)
                    .await;
            },
            ChatState::Error | ChatState::Aborted => {
                if !self.tracked.remove(&chat.run_id) {
                    debug!(run_id = %chat.run_id, state = ?chat.state, "dropping failure for untracked run");
                    return;
                }
                let reason = chat.failure_reason();
                warn!(run_id = %chat.run_id, reason = %reason, "run ended without completing");
                self.finish(&chat.run_id, None, MessageStatus::Interrupted)
                    .await;
                self.emit(RunUpdate::Error {
                    run_id: chat.run_id,
                    message: reason,
                });
            },
            ChatState::Other => {
                trace!(run_id = %chat.run_id, "run progress");
            },
        }
    }

    fn apply_delta(&mut self, chat: &ChatEvent) {
        if !self.tracked.contains(&chat.run_id) {
            trace!(run_id = %chat.run_id, "ignoring delta for untracked run");
            return;
        }
        let Some(run) = self.runs.get_mut(&chat.run_id) else {
            return;
        };
        if let Some(text) = chat.content() {
            run.content = text;
        }
        run.phase = RunPhase::Streaming;
        let snapshot = run.snapshot();
        self.emit(RunUpdate::Updated(snapshot));
    }

    /// Persist and drop a run that is no longer tracked.
    async fn finish(&mut self, run_id: &str, explicit: Option<String>, status: MessageStatus) {
        let Some(run) = self.runs.get_mut(run_id) else {
            return;
        };
        run.phase = RunPhase::Finalizing;
        let content = run.settle_content(explicit);
        let run = run.clone();
        persist_run(self.store.as_ref(), &run, &content, status).await;

        self.runs.remove(run_id);
        let agent_busy = self.runs.values().any(|r| r.agent_id == run.agent_id);
        if !agent_busy && self.thinking.remove(&run.agent_id) {
            self.emit(RunUpdate::AgentThinking {
                agent_id: run.agent_id.clone(),
                thinking: false,
            });
        }
        self.emit(RunUpdate::Removed {
            run_id: run_id.to_string(),
            status,
        });
    }

    /// When the heartbeat window runs out, if any runs are tracked.
    pub fn heartbeat_deadline(&self) -> Option<Instant> {
        if self.tracked.is_empty() {
            None
        } else {
            Some(self.last_event_at + self.heartbeat_timeout)
        }
    }

    /// Interrupt every tracked run if no event arrived within the heartbeat
    /// window. Returns how many runs were interrupted.
    pub async fn check_heartbeat(&mut self, now: Instant) -> usize {
        let Some(deadline) = self.heartbeat_deadline() else {
            return 0;
        };
        if now < deadline {
            return 0;
        }
        let stalled: Vec<String> = self.tracked.drain().collect();
        info!(
            runs = stalled.len(),
            silent_for = ?now.saturating_duration_since(self.last_event_at),
            "event stream stalled, interrupting runs"
        );
        for run_id in &stalled {
            self.finish(run_id, None, MessageStatus::Interrupted).await;
            self.emit(RunUpdate::Error {
                run_id: run_id.clone(),
                message: "no response from gateway".into(),
            });
        }
        stalled.len()
    }

    /// Remove every still-active run for hand-off, marking it orphaned.
    pub fn detach_active(&mut self) -> Vec<Run> {
        let mut detached = Vec::with_capacity(self.tracked.len());
        for run_id in self.tracked.drain() {
            if let Some(mut run) = self.runs.remove(&run_id) {
                run.phase = RunPhase::Orphaned;
                detached.push(run);
            }
        }
        self.thinking.clear();
        detached
    }
}
