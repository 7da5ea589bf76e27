//! Correlation table for in-flight requests.
//!
//! Each entry owns its reply channel and a deadline in a shared
//! [`DelayQueue`]. Settling removes both under one `&mut self`, and an
//! expired deadline is only reported for an id that is still present, so
//! a response and a timeout can never both resolve the same request.

use std::{
    collections::HashMap,
    task::{Context, Poll},
    time::Duration,
};

use {
    serde_json::Value,
    tokio::sync::oneshot,
    tokio_util::time::{DelayQueue, delay_queue},
    tracing::debug,
};

use crate::error::GatewayError;

pub type Reply = oneshot::Sender<Result<Value, GatewayError>>;

struct PendingRequest {
    method: String,
    timeout: Duration,
    reply: Reply,
    deadline: delay_queue::Key,
}

#[derive(Default)]
pub struct PendingRequests {
    entries: HashMap<String, PendingRequest>,
    deadlines: DelayQueue<String>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn insert(&mut self, id: String, method: String, timeout: Duration, reply: Reply) {
        let deadline = self.deadlines.insert(id.clone(), timeout);
        if let Some(previous) = self.entries.insert(id, PendingRequest {
            method,
            timeout,
            reply,
            deadline,
        }) {
            self.deadlines.remove(&previous.deadline);
        }
    }

    /// Resolve `id` with `outcome`. Returns `false` when the id is unknown
    /// (already settled, timed out, or never ours).
    pub fn settle(&mut self, id: &str, outcome: Result<Value, GatewayError>) -> bool {
        let Some(entry) = self.entries.remove(id) else {
            return false;
        };
        self.deadlines.remove(&entry.deadline);
        if entry.reply.send(outcome).is_err() {
            debug!(id, method = %entry.method, "request caller went away before reply");
        }
        true
    }

    /// Poll for the next request whose deadline passed, failing it with
    /// [`GatewayError::Timeout`]. Yields the timed-out id.
    pub fn poll_expired(&mut self, cx: &mut Context<'_>) -> Poll<Option<String>> {
        loop {
            match self.deadlines.poll_expired(cx) {
                Poll::Ready(Some(expired)) => {
                    let id = expired.into_inner();
                    let Some(entry) = self.entries.remove(&id) else {
                        continue;
                    };
                    debug!(id = %id, method = %entry.method, "request timed out");
                    let _ = entry.reply.send(Err(GatewayError::Timeout {
                        method: entry.method,
                        after: entry.timeout,
                    }));
                    return Poll::Ready(Some(id));
                },
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }

    /// Wait for the next timeout. Never resolves while the table is empty.
    pub async fn next_expired(&mut self) -> String {
        loop {
            if let Some(id) = std::future::poll_fn(|cx| self.poll_expired(cx)).await {
                return id;
            }
            std::future::pending::<()>().await;
        }
    }

    /// Fail every outstanding request with `err`.
    pub fn reject_all(&mut self, err: GatewayError) -> usize {
        let count = self.entries.len();
        for (_, entry) in self.entries.drain() {
            let _ = entry.reply.send(Err(err.clone()));
        }
        self.deadlines.clear();
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(table: &mut PendingRequests, id: &str, timeout_ms: u64) -> oneshot::Receiver<Result<Value, GatewayError>> {
        let (tx, rx) = oneshot::channel();
        table.insert(id.into(), "test.method".into(), Duration::from_millis(timeout_ms), tx);
        rx
    }

    #[tokio::test(start_paused = true)]
    async fn settles_out_of_order() {
        let mut table = PendingRequests::new();
        let a = request(&mut table, "a", 1_000);
        let b = request(&mut table, "b", 1_000);

        assert!(table.settle("b", Ok(serde_json::json!(2))));
        assert!(table.settle("a", Ok(serde_json::json!(1))));
        assert_eq!(a.await.unwrap().unwrap(), serde_json::json!(1));
        assert_eq!(b.await.unwrap().unwrap(), serde_json::json!(2));
        assert!(table.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn late_response_after_timeout_is_noop() {
        let mut table = PendingRequests::new();
        let rx = request(&mut table, "slow", 50);

        let expired = table.next_expired().await;
        assert_eq!(expired, "slow");
        assert!(matches!(rx.await.unwrap(), Err(GatewayError::Timeout { .. })));

        assert!(!table.settle("slow", Ok(Value::Null)));
        assert!(table.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn response_cancels_deadline() {
        let mut table = PendingRequests::new();
        let rx = request(&mut table, "fast", 50);
        assert!(table.settle("fast", Ok(Value::Null)));
        assert!(!table.settle("fast", Ok(Value::Null)));

        let timed_out = tokio::time::timeout(Duration::from_millis(200), table.next_expired()).await;
        assert!(timed_out.is_err(), "no deadline should fire for a settled request");
        assert!(rx.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn reject_all_fails_everything_once() {
        let mut table = PendingRequests::new();
        let receivers: Vec<_> = (0..5)
            .map(|i| request(&mut table, &format!("r{i}"), 10_000))
            .collect();

        assert_eq!(table.reject_all(GatewayError::ConnectionClosed), 5);
        assert!(table.is_empty());
        for rx in receivers {
            assert!(matches!(rx.await.unwrap(), Err(GatewayError::ConnectionClosed)));
        }
        assert!(!table.settle("r0", Ok(Value::Null)));
    }

    #[tokio::test(start_paused = true)]
    async fn each_request_settles_exactly_once() {
        let mut table = PendingRequests::new();
        let mut receivers = Vec::new();
        for i in 0..20u64 {
            receivers.push(request(&mut table, &format!("q{i}"), 100 + i * 10));
        }
        // Answer the even ones, let the odd ones time out.
        for i in (0..20).step_by(2) {
            assert!(table.settle(&format!("q{i}"), Ok(serde_json::json!(i))));
        }
        let mut expired = Vec::new();
        while !table.is_empty() {
            expired.push(table.next_expired().await);
        }
        assert_eq!(expired.len(), 10);

        for (i, rx) in receivers.into_iter().enumerate() {
            let outcome = rx.await.unwrap();
            if i % 2 == 0 {
                assert_eq!(outcome.unwrap(), serde_json::json!(i));
            } else {
                assert!(matches!(outcome, Err(GatewayError::Timeout { .. })));
            }
        }
    }
}
