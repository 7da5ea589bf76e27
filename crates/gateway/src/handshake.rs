//! Connect handshake bookkeeping and failure classification.
//!
//! The first `connect` carries only the bearer token. If the gateway pushes
//! `connect.challenge`, a second `connect` carrying the device signature
//! replaces it; from then on replies to the first request are ignored, so
//! one handshake produces exactly one outcome.

use std::collections::HashSet;

use castle_protocol::{
    self as proto, AuthParams, ClientInfo, ConnectParams, DeviceAuth, ErrorShape, error_codes,
};

use crate::{credentials::ResolvedCredential, identity::SignaturePayload};

// ── Client descriptor ────────────────────────────────────────────────────────

/// How this client introduces itself in `connect`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientDescriptor {
    pub id: String,
    pub display_name: Option<String>,
    pub version: String,
    pub platform: String,
    pub mode: String,
    pub role: String,
    pub scopes: Vec<String>,
    pub caps: Vec<String>,
}

impl Default for ClientDescriptor {
    fn default() -> Self {
        Self {
            id: proto::DEFAULT_CLIENT_ID.into(),
            display_name: None,
            version: env!("CARGO_PKG_VERSION").into(),
            platform: std::env::consts::OS.into(),
            mode: proto::DEFAULT_CLIENT_MODE.into(),
            role: proto::DEFAULT_ROLE.into(),
            scopes: vec![proto::scopes::ADMIN.into()],
            caps: Vec::new(),
        }
    }
}

impl ClientDescriptor {
    pub fn connect_params(&self, token: &str, device: Option<DeviceAuth>) -> ConnectParams {
        ConnectParams {
            min_protocol: proto::MIN_PROTOCOL_VERSION,
            max_protocol: proto::PROTOCOL_VERSION,
            client: ClientInfo {
                id: self.id.clone(),
                display_name: self.display_name.clone(),
                version: self.version.clone(),
                platform: self.platform.clone(),
                mode: self.mode.clone(),
            },
            auth: Some(AuthParams {
                token: Some(token.to_string()),
            }),
            role: self.role.clone(),
            scopes: self.scopes.clone(),
            caps: self.caps.clone(),
            device,
        }
    }

    pub fn signature_payload<'a>(&'a self, token: &'a str, nonce: &'a str) -> SignaturePayload<'a> {
        SignaturePayload {
            client_id: &self.id,
            client_mode: &self.mode,
            role: &self.role,
            scopes: &self.scopes,
            token: Some(token),
            nonce: Some(nonce),
        }
    }
}

// ── Handshake tracking ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakePhase {
    /// Waiting for the connect reply (or a challenge / pairing notice).
    AwaitingHello,
    /// Server asked for operator approval; nothing to do until it arrives.
    Pairing,
}

/// How a response id relates to the handshake in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyRole {
    Current,
    Superseded,
    Unrelated,
}

#[derive(Debug)]
pub struct Handshake {
    current_id: Option<String>,
    superseded: HashSet<String>,
    phase: HandshakePhase,
    credential: ResolvedCredential,
    device_auth_attempted: bool,
}

impl Handshake {
    pub fn new(connect_id: String, credential: ResolvedCredential) -> Self {
        Self {
            current_id: Some(connect_id),
            superseded: HashSet::new(),
            phase: HandshakePhase::AwaitingHello,
            credential,
            device_auth_attempted: false,
        }
    }

    pub fn phase(&self) -> HandshakePhase {
        self.phase
    }

    pub fn credential(&self) -> &ResolvedCredential {
        &self.credential
    }

    pub fn device_auth_attempted(&self) -> bool {
        self.device_auth_attempted
    }

    /// A signed connect with id `connect_id` replaces the one in flight.
    pub fn answer_challenge(&mut self, connect_id: String) {
        self.supersede_current();
        self.current_id = Some(connect_id);
        self.device_auth_attempted = true;
    }

    /// Stop listening for a connect reply until approval arrives.
    pub fn enter_pairing(&mut self) {
        self.supersede_current();
        self.phase = HandshakePhase::Pairing;
    }

    fn supersede_current(&mut self) {
        if let Some(id) = self.current_id.take() {
            self.superseded.insert(id);
        }
    }

    pub fn classify_reply(&self, id: &str) -> ReplyRole {
        if self.current_id.as_deref() == Some(id) {
            ReplyRole::Current
        } else if self.superseded.contains(id) {
            ReplyRole::Superseded
        } else {
            ReplyRole::Unrelated
        }
    }
}

// ── Failure classification ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectFailure {
    /// The stored device token was refused; drop it and retry at once with
    /// the static token.
    StaleDeviceToken,
    /// Retrying cannot help; wait for an explicit `start()`.
    Terminal { auth: bool },
    /// Back off and try again.
    Retry,
}

pub fn classify_connect_error(error: &ErrorShape, used_device_token: bool) -> ConnectFailure {
    if error.is(error_codes::AUTH_FAILED) {
        return if used_device_token {
            ConnectFailure::StaleDeviceToken
        } else {
            ConnectFailure::Terminal { auth: true }
        };
    }
    if error.is(error_codes::PROTOCOL_MISMATCH) || error.is(error_codes::PROTOCOL_UNSUPPORTED) {
        return ConnectFailure::Terminal { auth: false };
    }
    ConnectFailure::Retry
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseAction {
    /// Device auth was refused at the transport level: turn it off for the
    /// rest of the process and reconnect immediately with the token alone.
    DisableDeviceAuth,
    Reconnect,
}

pub fn classify_close(code: Option<u16>, device_auth_attempted: bool) -> CloseAction {
    if device_auth_attempted && code == Some(proto::DEVICE_AUTH_REJECTED_CLOSE_CODE) {
        CloseAction::DisableDeviceAuth
    } else {
        CloseAction::Reconnect
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::credentials::CredentialSource,
        secrecy::Secret,
    };

    fn credential(source: CredentialSource) -> ResolvedCredential {
        ResolvedCredential {
            token: Secret::new("tok".into()),
            source,
        }
    }

    #[test]
    fn auth_failure_with_device_token_self_heals() {
        let err = ErrorShape::new("AUTH_FAILED", "device token revoked");
        assert_eq!(
            classify_connect_error(&err, true),
            ConnectFailure::StaleDeviceToken
        );
        assert_eq!(
            classify_connect_error(&err, false),
            ConnectFailure::Terminal { auth: true }
        );
    }

    #[test]
    fn protocol_errors_are_terminal() {
        for code in [error_codes::PROTOCOL_MISMATCH, error_codes::PROTOCOL_UNSUPPORTED] {
            let err = ErrorShape::new(code, "nope");
            assert_eq!(
                classify_connect_error(&err, true),
                ConnectFailure::Terminal { auth: false }
            );
        }
    }

    #[test]
    fn other_codes_retry() {
        let err = ErrorShape::new("unavailable", "starting up");
        assert_eq!(classify_connect_error(&err, false), ConnectFailure::Retry);
    }

    #[test]
    fn close_downgrades_only_after_device_attempt() {
        assert_eq!(classify_close(Some(1008), true), CloseAction::DisableDeviceAuth);
        assert_eq!(classify_close(Some(1008), false), CloseAction::Reconnect);
        assert_eq!(classify_close(Some(1006), true), CloseAction::Reconnect);
        assert_eq!(classify_close(None, true), CloseAction::Reconnect);
    }

    #[test]
    fn challenge_supersedes_first_connect() {
        let mut hs = Handshake::new("c1".into(), credential(CredentialSource::Config));
        assert_eq!(hs.classify_reply("c1"), ReplyRole::Current);

        hs.answer_challenge("c2".into());
        assert!(hs.device_auth_attempted());
        assert_eq!(hs.classify_reply("c1"), ReplyRole::Superseded);
        assert_eq!(hs.classify_reply("c2"), ReplyRole::Current);
        assert_eq!(hs.classify_reply("zzz"), ReplyRole::Unrelated);
    }

    #[test]
    fn pairing_ignores_outstanding_connect() {
        let mut hs = Handshake::new("c1".into(), credential(CredentialSource::DeviceToken));
        hs.enter_pairing();
        assert_eq!(hs.phase(), HandshakePhase::Pairing);
        assert_eq!(hs.classify_reply("c1"), ReplyRole::Superseded);
        assert!(hs.credential().is_device_token());
    }

    #[test]
    fn connect_params_carry_token_and_device() {
        let client = ClientDescriptor::default();
        let params = client.connect_params("tok_abc", None);
        assert_eq!(params.auth.unwrap().token.as_deref(), Some("tok_abc"));
        assert!(params.device.is_none());
        assert_eq!(params.max_protocol, proto::PROTOCOL_VERSION);
    }
}
