//! Run state shared by the live tracker and the orphan registry.

use {
    serde::Serialize,
    tracing::{debug, warn},
};

use crate::store::{MessagePatch, MessageStatus, MessageStore, NewMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunPhase {
    /// Acknowledged by `chat.send`, nothing streamed yet.
    Sent,
    Streaming,
    /// Terminal event seen, persist in progress.
    Finalizing,
    /// Handed to the orphan registry after its session closed.
    Orphaned,
}

/// One in-flight agent response.
#[derive(Debug, Clone)]
pub struct Run {
    pub run_id: String,
    pub agent_id: String,
    pub agent_name: String,
    pub session_key: String,
    pub channel: String,
    /// Latest full text; each delta replaces it.
    pub content: String,
    pub started_at_ms: u64,
    pub phase: RunPhase,
}

impl Run {
    pub fn snapshot(&self) -> RunSnapshot {
        RunSnapshot {
            run_id: self.run_id.clone(),
            agent_id: self.agent_id.clone(),
            agent_name: self.agent_name.clone(),
            session_key: self.session_key.clone(),
            content: self.content.clone(),
            started_at_ms: self.started_at_ms,
        }
    }

    /// Definitive text for a terminal event: the explicit text when it has
    /// any, otherwise the last streamed content.
    pub fn settle_content(&self, explicit: Option<String>) -> String {
        explicit
            .filter(|text| !text.is_empty())
            .unwrap_or_else(|| self.content.clone())
    }
}

/// Read-only view handed to the UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSnapshot {
    pub run_id: String,
    pub agent_id: String,
    pub agent_name: String,
    pub session_key: String,
    pub content: String,
    pub started_at_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunUpdate {
    Started(RunSnapshot),
    Updated(RunSnapshot),
    AgentThinking { agent_id: String, thinking: bool },
    /// The run left memory; `status` is what was persisted for it.
    Removed { run_id: String, status: MessageStatus },
    Error { run_id: String, message: String },
}

/// Write the run's message, updating an existing row for the run rather than
/// adding a second one. Failures are logged and reported as `false`; callers
/// clear their in-memory state either way.
pub(crate) async fn persist_run(
    store: &dyn MessageStore,
    run: &Run,
    content: &str,
    status: MessageStatus,
) -> bool {
    if content.is_empty() {
        debug!(run_id = %run.run_id, %status, "nothing to persist for run");
        return true;
    }
    let outcome = async {
        if let Some(existing) = store.find_by_run_id(&run.run_id).await? {
            let patch = MessagePatch {
                content: Some(content.to_string()),
                status: Some(status),
            };
            return store.update(&existing.id, patch).await;
        }
        store
            .create(NewMessage {
                channel: run.channel.clone(),
                sender: run.agent_id.clone(),
                content: content.to_string(),
                run_id: Some(run.run_id.clone()),
                status,
            })
            .await
            .map(|_| true)
    }
    .await;

    match outcome {
        Ok(true) => {
            debug!(run_id = %run.run_id, %status, chars = content.len(), "persisted run");
            true
        },
        Ok(false) => {
            warn!(run_id = %run.run_id, %status, "run message vanished before update");
            false
        },
        Err(e) => {
            warn!(run_id = %run.run_id, %status, error = %e, "failed to persist run");
            false
        },
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use {
        super::*,
        anyhow::{Result, bail},
        async_trait::async_trait,
    };

    use crate::store::Message;

    pub fn run(run_id: &str) -> Run {
        Run {
            run_id: run_id.into(),
            agent_id: "main".into(),
            agent_name: "Main".into(),
            session_key: "agent:main:main".into(),
            channel: "main".into(),
            content: String::new(),
            started_at_ms: 1,
            phase: RunPhase::Streaming,
        }
    }

    /// A store whose every call fails.
    #[derive(Default)]
    pub struct FailingStore {
        pub calls: AtomicUsize,
    }

    #[async_trait]
    impl MessageStore for FailingStore {
        async fn create(&self, _message: NewMessage) -> Result<Message> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            bail!("disk full")
        }

        async fn find_by_run_id(&self, _run_id: &str) -> Result<Option<Message>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            bail!("disk full")
        }

        async fn update(&self, _id: &str, _patch: MessagePatch) -> Result<bool> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            bail!("disk full")
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::{test_support::*, *},
        crate::store::MemoryMessageStore,
    };

    #[tokio::test]
    async fn persist_updates_existing_row() {
        let store = MemoryMessageStore::new();
        let mut r = run("r1");
        assert!(persist_run(&store, &r, "partial", MessageStatus::Interrupted).await);
        r.content = "full".into();
        assert!(persist_run(&store, &r, "full", MessageStatus::Complete).await);

        let rows = store.for_run("r1");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].content, "full");
        assert_eq!(rows[0].status, MessageStatus::Complete);
    }

    #[tokio::test]
    async fn empty_content_is_skipped() {
        let store = MemoryMessageStore::new();
        assert!(persist_run(&store, &run("r1"), "", MessageStatus::Interrupted).await);
        assert!(store.all().is_empty());
    }

    #[tokio::test]
    async fn failure_is_reported_not_raised() {
        let store = FailingStore::default();
        assert!(!persist_run(&store, &run("r1"), "text", MessageStatus::Complete).await);
    }

    #[test]
    fn settle_prefers_non_empty_explicit_text() {
        let mut r = run("r1");
        r.content = "streamed".into();
        assert_eq!(r.settle_content(Some("final".into())), "final");
        assert_eq!(r.settle_content(Some(String::new())), "streamed");
        assert_eq!(r.settle_content(None), "streamed");
    }
}
