//! Config schema for the gateway client and the chat run layer.

use std::path::PathBuf;

use {
    castle_protocol as proto,
    serde::{Deserialize, Serialize},
};

pub const DEFAULT_GATEWAY_URL: &str = "ws://127.0.0.1:18789";

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CastleConfig {
    pub gateway: GatewayConfig,
    pub chat: ChatConfig,
}

/// Connection settings for the gateway socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// WebSocket endpoint, e.g. `ws://127.0.0.1:18789`.
    pub url: String,

    /// Static bearer token. Superseded by a device token once paired.
    pub token: Option<String>,

    pub client_id: String,
    pub display_name: Option<String>,
    pub client_mode: String,
    pub role: String,
    pub scopes: Vec<String>,
    pub caps: Vec<String>,

    pub request_timeout_ms: u64,
    pub max_frame_bytes: usize,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,

    /// Answer `connect.challenge` with a device signature.
    pub device_auth: bool,

    /// Keypair file. Defaults to `<config dir>/identity/device.json`.
    pub identity_path: Option<PathBuf>,
    /// Issued device token. Defaults to `<config dir>/identity/device-auth.json`.
    pub device_token_path: Option<PathBuf>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_GATEWAY_URL.into(),
            token: None,
            client_id: proto::DEFAULT_CLIENT_ID.into(),
            display_name: None,
            client_mode: proto::DEFAULT_CLIENT_MODE.into(),
            role: proto::DEFAULT_ROLE.into(),
            scopes: vec![
                proto::scopes::ADMIN.into(),
                proto::scopes::APPROVALS.into(),
                proto::scopes::PAIRING.into(),
            ],
            caps: Vec::new(),
            request_timeout_ms: proto::DEFAULT_REQUEST_TIMEOUT_MS,
            max_frame_bytes: proto::MAX_FRAME_BYTES,
            reconnect_base_ms: proto::RECONNECT_BASE_MS,
            reconnect_max_ms: proto::RECONNECT_MAX_MS,
            device_auth: true,
            identity_path: None,
            device_token_path: None,
        }
    }
}

/// Settings for run tracking and persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    pub heartbeat_timeout_ms: u64,
    pub orphan_ttl_ms: u64,
    /// SQLite database for persisted messages. Defaults to `<data dir>/castle.db`.
    pub database_path: Option<PathBuf>,
    /// Channel that messages from the CLI are stored under.
    pub channel: String,
    pub session_key: String,
    pub agent_id: String,
    /// Display name shown for the agent's replies.
    pub agent_name: String,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_ms: proto::RUN_HEARTBEAT_TIMEOUT_MS,
            orphan_ttl_ms: proto::ORPHAN_TTL_MS,
            database_path: None,
            channel: "main".into(),
            session_key: "agent:main:main".into(),
            agent_id: "main".into(),
            agent_name: "Main".into(),
        }
    }
}
