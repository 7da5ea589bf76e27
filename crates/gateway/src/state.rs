use std::sync::atomic::{AtomicU64, Ordering};

use {
    castle_protocol::{HelloOk, Policy},
    serde::Serialize,
};

// ── Connection state ─────────────────────────────────────────────────────────

/// Process-wide connection state. Only the socket loop writes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Pairing,
    Error,
}

impl ConnectionState {
    /// `start()` is a no-op in these states.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Connecting | Self::Connected | Self::Pairing)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Pairing => "pairing",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

// ── Server metadata ──────────────────────────────────────────────────────────

/// What the gateway told us about itself in the hello payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ServerInfo {
    pub version: Option<String>,
    pub host: Option<String>,
    pub conn_id: Option<String>,
    pub protocol: Option<u32>,
    pub policy: Option<Policy>,
    pub methods: Vec<String>,
    pub events: Vec<String>,
}

impl From<&HelloOk> for ServerInfo {
    fn from(hello: &HelloOk) -> Self {
        let server = hello.server.as_ref();
        let features = hello.features.as_ref();
        Self {
            version: server.map(|s| s.version.clone()),
            host: server.map(|s| s.host.clone()),
            conn_id: server.map(|s| s.conn_id.clone()),
            protocol: hello.protocol,
            policy: hello.policy.clone(),
            methods: features.map(|f| f.methods.clone()).unwrap_or_default(),
            events: features.map(|f| f.events.clone()).unwrap_or_default(),
        }
    }
}

// ── Counters ─────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct ConnectionStats {
    frames_received: AtomicU64,
    frames_oversized: AtomicU64,
    frames_unparseable: AtomicU64,
    reconnects_scheduled: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub frames_received: u64,
    pub frames_oversized: u64,
    pub frames_unparseable: u64,
    pub reconnects_scheduled: u64,
}

impl ConnectionStats {
    pub(crate) fn frame_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn frame_oversized(&self) {
        self.frames_oversized.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn frame_unparseable(&self) {
        self.frames_unparseable.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn reconnect_scheduled(&self) {
        self.reconnects_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_oversized: self.frames_oversized.load(Ordering::Relaxed),
            frames_unparseable: self.frames_unparseable.load(Ordering::Relaxed),
            reconnects_scheduled: self.reconnects_scheduled.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_states() {
        assert!(ConnectionState::Connecting.is_active());
        assert!(ConnectionState::Pairing.is_active());
        assert!(ConnectionState::Connected.is_active());
        assert!(!ConnectionState::Disconnected.is_active());
        assert!(!ConnectionState::Error.is_active());
    }

    #[test]
    fn server_info_from_hello() {
        let hello: HelloOk = serde_json::from_value(serde_json::json!({
            "protocol": 3,
            "server": { "version": "2026.1.5", "host": "gw", "connId": "c-9" },
            "features": { "methods": ["chat.send"], "events": ["chat"] },
            "policy": { "maxPayload": 524288, "tickIntervalMs": 30000 },
        }))
        .unwrap();
        let info = ServerInfo::from(&hello);
        assert_eq!(info.conn_id.as_deref(), Some("c-9"));
        assert_eq!(info.protocol, Some(3));
        assert_eq!(info.methods, vec!["chat.send".to_string()]);
        assert_eq!(info.policy.unwrap().tick_interval_ms, Some(30_000));
    }
}
