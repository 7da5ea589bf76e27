//! Keeps runs alive after their session is gone.
//!
//! Construct one [`OrphanRegistry`] per process and hand clones to every
//! session. A closing session calls [`OrphanRegistry::prepare`] *before*
//! draining its own subscription, so every event published after that point
//! is also queued for the registry; [`HandOff::complete`] then replays that
//! queue against the detached runs before adopting them. At most one
//! listener task (with one bus subscription) runs at a time, and it exits as
//! soon as no orphans remain.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use {
    castle_gateway::{EventBus, GatewayEvent, Subscription},
    castle_protocol::{
        chat::{ChatEvent, ChatState},
        events,
    },
    tokio::{
        runtime::Handle,
        time::{Instant, sleep_until},
    },
    tracing::{debug, info, warn},
};

use crate::{
    run::{Run, persist_run},
    store::{MessageStatus, MessageStore},
};

struct Orphan {
    run: Run,
    expires_at: Instant,
}

#[derive(Default)]
struct Registry {
    runs: HashMap<String, Orphan>,
    listening: bool,
}

struct Shared {
    bus: EventBus,
    store: Arc<dyn MessageStore>,
    ttl: Duration,
    registry: Mutex<Registry>,
}

#[derive(Clone)]
pub struct OrphanRegistry {
    shared: Arc<Shared>,
}

/// A terminal outcome decided under the lock, persisted outside it.
struct Settled {
    run: Run,
    content: String,
    status: MessageStatus,
}

impl OrphanRegistry {
    pub fn new(bus: EventBus, store: Arc<dyn MessageStore>, ttl: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                bus,
                store,
                ttl,
                registry: Mutex::new(Registry::default()),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.shared
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.lock().runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, run_id: &str) -> bool {
        self.lock().runs.contains_key(run_id)
    }

    /// Whether a listener task currently holds a subscription.
    pub fn is_listening(&self) -> bool {
        self.lock().listening
    }

    /// Start queueing events for a hand-off that is about to happen.
    pub fn prepare(&self) -> HandOff {
        HandOff {
            registry: self.clone(),
            subscription: self.shared.bus.subscribe(),
        }
    }

    /// Apply one chat event to an adopted run.
    fn apply(registry: &mut Registry, chat: ChatEvent) -> Option<Settled> {
        match chat.state {
            ChatState::Delta => {
                if let Some(orphan) = registry.runs.get_mut(&chat.run_id)
                    && let Some(text) = chat.content()
                {
                    orphan.run.content = text;
                }
                None
            },
            state if state.is_terminal() => {
                let orphan = registry.runs.remove(&chat.run_id)?;
                let (content, status) = if chat.state == ChatState::Final {
                    (orphan.run.settle_content(chat.content()), MessageStatus::Complete)
                } else {
                    (orphan.run.content.clone(), MessageStatus::Interrupted)
                };
                Some(Settled {
                    run: orphan.run,
                    content,
                    status,
                })
            },
            _ => None,
        }
    }

    fn chat_event(event: &GatewayEvent) -> Option<ChatEvent> {
        let frame = event.frame_named(events::CHAT)?;
        serde_json::from_value(frame.payload.clone()).ok()
    }

    async fn persist(&self, settled: Vec<Settled>) {
        for s in settled {
            info!(run_id = %s.run.run_id, status = %s.status, "persisting orphaned run");
            persist_run(self.shared.store.as_ref(), &s.run, &s.content, s.status).await;
        }
    }

    /// Drop expired orphans, returning them for an interrupted persist.
    fn take_expired(&self, now: Instant) -> Vec<Settled> {
        let mut registry = self.lock();
        let expired: Vec<String> = registry
            .runs
            .iter()
            .filter(|(_, o)| o.expires_at <= now)
            .map(|(id, _)| id.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|id| registry.runs.remove(&id))
            .map(|orphan| {
                warn!(run_id = %orphan.run.run_id, "orphaned run never finished, giving up");
                Settled {
                    content: orphan.run.content.clone(),
                    run: orphan.run,
                    status: MessageStatus::Interrupted,
                }
            })
            .collect()
    }

    fn next_expiry(&self) -> Option<Instant> {
        self.lock().runs.values().map(|o| o.expires_at).min()
    }

    /// Release the listener slot if nothing is left to watch.
    fn release_if_idle(&self) -> bool {
        let mut registry = self.lock();
        if registry.runs.is_empty() {
            registry.listening = false;
            true
        } else {
            false
        }
    }

    async fn listen(self, mut subscription: Subscription) {
        debug!("orphan listener started");
        loop {
            let expiry = self.next_expiry();
            tokio::select! {
                event = subscription.recv() => {
                    let Some(event) = event else {
                        let settled = self.take_all();
                        self.persist(settled).await;
                        break;
                    };
                    let Some(chat) = Self::chat_event(&event) else {
                        continue;
                    };
                    let settled = Self::apply(&mut self.lock(), chat);
                    if let Some(s) = settled {
                        self.persist(vec![s]).await;
                    }
                },
                () = sleep_until(expiry.unwrap_or_else(Instant::now)), if expiry.is_some() => {
                    let settled = self.take_expired(Instant::now());
                    self.persist(settled).await;
                },
            }
            if self.release_if_idle() {
                break;
            }
        }
        debug!("orphan listener stopped");
    }

    /// Everything left when the bus is gone; nothing can finish these.
    fn take_all(&self) -> Vec<Settled> {
        let mut registry = self.lock();
        registry.listening = false;
        registry
            .runs
            .drain()
            .map(|(_, orphan)| Settled {
                content: orphan.run.content.clone(),
                run: orphan.run,
                status: MessageStatus::Interrupted,
            })
            .collect()
    }
}

/// An in-progress hand-off holding its own subscription.
pub struct HandOff {
    registry: OrphanRegistry,
    subscription: Subscription,
}

impl HandOff {
    /// Adopt `runs`, replaying whatever arrived since [`OrphanRegistry::prepare`].
    pub fn complete(self, runs: Vec<Run>) {
        self.complete_with_backlog(runs, Vec::new());
    }

    /// Like [`Self::complete`], but first replays `backlog`: events the
    /// closing owner received and never processed. Events published after
    /// `prepare` may appear in both; replaying one twice is a no-op since
    /// deltas replace content and a settled run is never re-adopted.
    ///
    /// Adoption happens before this returns. Persisting runs that already
    /// finished, and the listener, are spawned on the current runtime.
    pub fn complete_with_backlog(mut self, runs: Vec<Run>, backlog: Vec<GatewayEvent>) {
        if runs.is_empty() {
            return;
        }
        let Ok(runtime) = Handle::try_current() else {
            let run_ids: Vec<&str> = runs.iter().map(|r| r.run_id.as_str()).collect();
            warn!(?run_ids, "no runtime to watch orphaned runs, dropping them");
            return;
        };
        let registry = self.registry.clone();
        let expires_at = Instant::now() + registry.shared.ttl;

        let (settled, spawn_listener) = {
            let mut state = registry.lock();
            let mut pending: Registry = Registry {
                runs: runs
                    .into_iter()
                    .map(|run| {
                        (run.run_id.clone(), Orphan {
                            run,
                            expires_at,
                        })
                    })
                    .collect(),
                listening: false,
            };
            let queued = std::iter::from_fn(|| self.subscription.try_recv());
            let settled: Vec<Settled> = backlog
                .into_iter()
                .chain(queued)
                .filter_map(|event| OrphanRegistry::chat_event(&event))
                .filter_map(|chat| OrphanRegistry::apply(&mut pending, chat))
                .collect();
            let adopted = pending.runs.len();
            state.runs.extend(pending.runs);
            let spawn_listener = adopted > 0 && !state.listening;
            if spawn_listener {
                state.listening = true;
            }
            info!(adopted, finished = settled.len(), total = state.runs.len(), "adopted orphaned runs");
            (settled, spawn_listener)
        };

        if !settled.is_empty() {
            let registry = registry.clone();
            runtime.spawn(async move { registry.persist(settled).await });
        }
        if spawn_listener {
            runtime.spawn(registry.listen(self.subscription));
        }
    }
}
