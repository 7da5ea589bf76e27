//! Gateway wire protocol: frame envelopes, handshake payloads and the
//! constants both ends agree on.
//!
//! Every message on the socket is one JSON text frame tagged by `type`:
//! `req` (client → server call), `res` (reply correlated by `id`) or
//! `event` (server push, optionally sequenced).

pub mod chat;

use serde::{Deserialize, Serialize};

pub use chat::{ChatEvent, ChatState};

// ── Constants ────────────────────────────────────────────────────────────────

/// Highest protocol revision this client speaks.
pub const PROTOCOL_VERSION: u32 = 3;
/// Lowest protocol revision this client accepts.
pub const MIN_PROTOCOL_VERSION: u32 = 3;

/// Per-request deadline when the caller does not pick one.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 15_000;
/// Inbound frames larger than this are discarded before parsing.
pub const MAX_FRAME_BYTES: usize = 10 * 1024 * 1024;

pub const RECONNECT_BASE_MS: u64 = 1_000;
pub const RECONNECT_MAX_MS: u64 = 30_000;

/// Close code the gateway uses when it refuses a device signature.
pub const DEVICE_AUTH_REJECTED_CLOSE_CODE: u16 = 1008;

/// Silence on the push channel longer than this interrupts tracked runs.
pub const RUN_HEARTBEAT_TIMEOUT_MS: u64 = 60_000;
/// Absolute retention bound for a run detached from its owner.
pub const ORPHAN_TTL_MS: u64 = 5 * 60 * 1_000;

pub const DEFAULT_ROLE: &str = "operator";
pub const DEFAULT_CLIENT_ID: &str = "gateway-client";
pub const DEFAULT_CLIENT_MODE: &str = "backend";

pub mod scopes {
    pub const ADMIN: &str = "operator.admin";
    pub const APPROVALS: &str = "operator.approvals";
    pub const PAIRING: &str = "operator.pairing";
}

pub mod methods {
    pub const CONNECT: &str = "connect";
    pub const CHAT_SEND: &str = "chat.send";
    pub const CHAT_ABORT: &str = "chat.abort";
}

pub mod events {
    pub const CONNECT_CHALLENGE: &str = "connect.challenge";
    pub const PAIRING_REQUIRED: &str = "device.pairing.required";
    pub const PAIRING_APPROVED: &str = "device.pairing.approved";
    pub const CHAT: &str = "chat";
}

/// Error codes the client classifies explicitly. Anything else is retryable.
pub mod error_codes {
    pub const AUTH_FAILED: &str = "auth_failed";
    pub const PROTOCOL_MISMATCH: &str = "protocol_mismatch";
    pub const PROTOCOL_UNSUPPORTED: &str = "protocol_unsupported";
    pub const UNAVAILABLE: &str = "unavailable";
}

// ── Frames ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    #[serde(rename = "req")]
    Request(RequestFrame),
    #[serde(rename = "res")]
    Response(ResponseFrame),
    #[serde(rename = "event")]
    Event(EventFrame),
}

impl Frame {
    pub fn parse(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl RequestFrame {
    pub fn new(id: impl Into<String>, method: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub id: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorShape>,
}

impl ResponseFrame {
    pub fn ok(id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            ok: true,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn err(id: impl Into<String>, error: ErrorShape) -> Self {
        Self {
            id: id.into(),
            ok: false,
            payload: None,
            error: Some(error),
        }
    }

    /// Collapse the frame into the caller-facing outcome. A failed frame
    /// without an error body still fails.
    pub fn into_result(self) -> Result<serde_json::Value, ErrorShape> {
        if self.ok {
            return Ok(self.payload.unwrap_or(serde_json::Value::Null));
        }
        Err(self
            .error
            .unwrap_or_else(|| ErrorShape::new(error_codes::UNAVAILABLE, "request failed")))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventFrame {
    pub event: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
}

impl EventFrame {
    pub fn new(event: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event: event.into(),
            payload,
            seq: None,
        }
    }
}

/// Server-reported failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorShape {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ErrorShape {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            retryable: None,
            retry_after_ms: None,
            details: None,
        }
    }

    /// Codes are compared case-insensitively; gateways disagree on casing.
    pub fn is(&self, code: &str) -> bool {
        self.code.eq_ignore_ascii_case(code)
    }
}

impl std::fmt::Display for ErrorShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

// ── Handshake payloads ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub min_protocol: u32,
    pub max_protocol: u32,
    pub client: ClientInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthParams>,
    pub role: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub caps: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<DeviceAuth>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub version: String,
    pub platform: String,
    pub mode: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// Device-signed block attached to a connect that answers a challenge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceAuth {
    pub id: String,
    pub public_key: String,
    pub signature: String,
    pub signed_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectChallenge {
    pub nonce: String,
    #[serde(default)]
    pub ts: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingApproved {
    pub device_token: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
}

/// Payload of a successful `connect` response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HelloOk {
    pub protocol: Option<u32>,
    pub server: Option<ServerDescriptor>,
    pub features: Option<Features>,
    pub auth: Option<HelloAuth>,
    pub policy: Option<Policy>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerDescriptor {
    pub version: String,
    pub commit: Option<String>,
    pub host: String,
    #[serde(alias = "conn_id")]
    pub conn_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Features {
    pub methods: Vec<String>,
    pub events: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloAuth {
    pub device_token: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub issued_at_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Policy {
    pub max_payload: Option<usize>,
    pub max_buffered_bytes: Option<usize>,
    pub tick_interval_ms: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_response_with_error() {
        let raw = r#"{"type":"res","id":"7","ok":false,"error":{"code":"AUTH_FAILED","message":"bad token","retryable":false}}"#;
        let Frame::Response(res) = Frame::parse(raw).unwrap() else {
            panic!("expected response");
        };
        assert_eq!(res.id, "7");
        let err = res.into_result().unwrap_err();
        assert!(err.is(error_codes::AUTH_FAILED));
        assert_eq!(err.retryable, Some(false));
    }

    #[test]
    fn parses_event_without_payload() {
        let frame = Frame::parse(r#"{"type":"event","event":"tick","seq":4}"#).unwrap();
        assert_eq!(
            frame,
            Frame::Event(EventFrame {
                event: "tick".into(),
                payload: serde_json::Value::Null,
                seq: Some(4),
            })
        );
    }

    #[test]
    fn request_serializes_with_type_tag() {
        let frame = Frame::Request(RequestFrame::new(
            "1",
            methods::CHAT_SEND,
            serde_json::json!({ "message": "hi" }),
        ));
        let value: serde_json::Value = serde_json::from_str(&frame.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "req");
        assert_eq!(value["method"], "chat.send");
        assert_eq!(value["params"]["message"], "hi");
    }

    #[test]
    fn connect_params_omit_device_when_absent() {
        let params = ConnectParams {
            min_protocol: MIN_PROTOCOL_VERSION,
            max_protocol: PROTOCOL_VERSION,
            client: ClientInfo {
                id: DEFAULT_CLIENT_ID.into(),
                display_name: None,
                version: "0.1.0".into(),
                platform: "linux".into(),
                mode: DEFAULT_CLIENT_MODE.into(),
            },
            auth: Some(AuthParams {
                token: Some("tok".into()),
            }),
            role: DEFAULT_ROLE.into(),
            scopes: vec![scopes::ADMIN.into()],
            caps: vec![],
            device: None,
        };
        let value = serde_json::to_value(&params).unwrap();
        assert!(value.get("device").is_none());
        assert_eq!(value["minProtocol"], 3);
        assert_eq!(value["auth"]["token"], "tok");
    }

    #[test]
    fn hello_accepts_snake_case_conn_id() {
        let hello: HelloOk = serde_json::from_value(serde_json::json!({
            "protocol": 3,
            "server": { "version": "1.2.0", "host": "gw", "conn_id": "c-1" },
            "auth": { "deviceToken": "dtok", "scopes": [] },
        }))
        .unwrap();
        assert_eq!(hello.server.unwrap().conn_id, "c-1");
        assert_eq!(hello.auth.unwrap().device_token, "dtok");
    }

    #[test]
    fn failed_response_without_error_body_still_fails() {
        let res = ResponseFrame {
            id: "1".into(),
            ok: false,
            payload: None,
            error: None,
        };
        assert!(res.into_result().is_err());
    }
}
