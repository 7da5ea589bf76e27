//! Durable message storage consumed by the run layer.

use std::{
    sync::{Mutex, PoisonError},
    time::{SystemTime, UNIX_EPOCH},
};

use {
    anyhow::Result,
    async_trait::async_trait,
    serde::{Deserialize, Serialize},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Complete,
    Interrupted,
}

impl MessageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::Interrupted => "interrupted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "complete" => Some(Self::Complete),
            "interrupted" => Some(Self::Interrupted),
            _ => None,
        }
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    pub id: String,
    pub channel: String,
    pub sender: String,
    pub content: String,
    pub run_id: Option<String>,
    pub status: MessageStatus,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub channel: String,
    pub sender: String,
    pub content: String,
    pub run_id: Option<String>,
    pub status: MessageStatus,
}

#[derive(Debug, Clone, Default)]
pub struct MessagePatch {
    pub content: Option<String>,
    pub status: Option<MessageStatus>,
}

/// Message persistence as seen by the run layer. No transactional guarantee
/// spans two calls.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn create(&self, message: NewMessage) -> Result<Message>;
    async fn find_by_run_id(&self, run_id: &str) -> Result<Option<Message>>;
    /// Apply `patch` to message `id`. Returns `false` if no such message.
    async fn update(&self, id: &str, patch: MessagePatch) -> Result<bool>;
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ── In-memory store ──────────────────────────────────────────────────

/// Vec-backed store for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryMessageStore {
    messages: Mutex<Vec<Message>>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<Message> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn for_run(&self, run_id: &str) -> Vec<Message> {
        self.all()
            .into_iter()
            .filter(|m| m.run_id.as_deref() == Some(run_id))
            .collect()
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn create(&self, message: NewMessage) -> Result<Message> {
        let now = now_ms();
        let message = Message {
            id: uuid::Uuid::new_v4().to_string(),
            channel: message.channel,
            sender: message.sender,
            content: message.content,
            run_id: message.run_id,
            status: message.status,
            created_at_ms: now,
            updated_at_ms: now,
        };
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message.clone());
        Ok(message)
    }

    async fn find_by_run_id(&self, run_id: &str) -> Result<Option<Message>> {
        Ok(self.for_run(run_id).into_iter().next())
    }

    async fn update(&self, id: &str, patch: MessagePatch) -> Result<bool> {
        let mut messages = self
            .messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(message) = messages.iter_mut().find(|m| m.id == id) else {
            return Ok(false);
        };
        if let Some(content) = patch.content {
            message.content = content;
        }
        if let Some(status) = patch.status {
            message.status = status;
        }
        message.updated_at_ms = now_ms();
        Ok(true)
    }
}

// ── SQLite store ─────────────────────────────────────────────────────

/// SQLite-backed message store.
pub struct SqliteMessageStore {
    pool: sqlx::SqlitePool,
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: String,
    channel: String,
    sender: String,
    content: String,
    run_id: Option<String>,
    status: String,
    created_at: i64,
    updated_at: i64,
}

impl From<MessageRow> for Message {
    fn from(r: MessageRow) -> Self {
        Self {
            id: r.id,
            channel: r.channel,
            sender: r.sender,
            content: r.content,
            run_id: r.run_id,
            status: MessageStatus::parse(&r.status).unwrap_or(MessageStatus::Complete),
            created_at_ms: r.created_at as u64,
            updated_at_ms: r.updated_at as u64,
        }
    }
}

impl SqliteMessageStore {
    pub fn new(pool: sqlx::SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the `messages` table if it doesn't exist.
    pub async fn init(pool: &sqlx::SqlitePool) -> Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS messages (
                id         TEXT PRIMARY KEY,
                channel    TEXT NOT NULL,
                sender     TEXT NOT NULL,
                content    TEXT NOT NULL,
                run_id     TEXT,
                status     TEXT NOT NULL DEFAULT 'complete',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )"#,
        )
        .execute(pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_run_id ON messages(run_id)")
            .execute(pool)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_channel ON messages(channel, created_at)",
        )
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Messages whose content contains `query`, newest first.
    pub async fn search(&self, query: &str, limit: u32) -> Result<Vec<Message>> {
        let pattern = format!("%{}%", escape_like(query));
        let rows = sqlx::query_as::<_, MessageRow>(
            "SELECT * FROM messages WHERE content LIKE ? ESCAPE '\\' \
             ORDER BY created_at DESC LIMIT ?",
        )
        .bind(pattern)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Most recent `limit` messages of `channel`, oldest first.
    pub async fn recent(&self, channel: &str, limit: u32) -> Result<Vec<Message>> {
        let mut rows = sqlx::query_as::<_, MessageRow>(
            "SELECT * FROM messages WHERE channel = ? ORDER BY created_at DESC, rowid DESC LIMIT ?",
        )
        .bind(channel)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.reverse();
        Ok(rows.into_iter().map(Into::into).collect())
    }
}

fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[async_trait]
impl MessageStore for SqliteMessageStore {
    async fn create(&self, message: NewMessage) -> Result<Message> {
        let now = now_ms() as i64;
        let id = uuid::Uuid::new_v4().to_string();
        sqlx::query(
            r#"INSERT INTO messages (id, channel, sender, content, run_id, status, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&id)
        .bind(&message.channel)
        .bind(&message.sender)
        .bind(&message.content)
        .bind(&message.run_id)
        .bind(message.status.as_str())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(Message {
            id,
            channel: message.channel,
            sender: message.sender,
            content: message.content,
            run_id: message.run_id,
            status: message.status,
            created_at_ms: now as u64,
            updated_at_ms: now as u64,
        })
    }

    async fn find_by_run_id(&self, run_id: &str) -> Result<Option<Message>> {
        let row = sqlx::query_as::<_, MessageRow>(
            "SELECT * FROM messages WHERE run_id = ? ORDER BY created_at ASC LIMIT 1",
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn update(&self, id: &str, patch: MessagePatch) -> Result<bool> {
        let result = sqlx::query(
            r#"UPDATE messages SET
                 content = COALESCE(?, content),
                 status = COALESCE(?, status),
                 updated_at = ?
               WHERE id = ?"#,
        )
        .bind(patch.content)
        .bind(patch.status.map(MessageStatus::as_str))
        .bind(now_ms() as i64)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
