//! Authenticated, self-healing WebSocket client for an OpenClaw-style gateway.
//!
//! Lifecycle:
//! 1. Resolve a bearer token (stored device token first, then static sources)
//! 2. Dial the gateway and send `connect`
//! 3. Answer `connect.challenge` with a signed device block, or wait out
//!    device pairing until the gateway issues a device token
//! 4. Multiplex requests over the socket and fan events out on the bus
//! 5. On transport loss, fail outstanding requests and reconnect with backoff

pub mod backoff;
pub mod bus;
pub mod client;
pub mod credentials;
pub mod error;
pub mod handshake;
pub mod identity;
pub mod pending;
pub mod state;

pub use {
    backoff::Backoff,
    bus::{EventBus, GatewayEvent, Subscription},
    client::{ClientOptions, GatewayClient},
    credentials::{CredentialResolver, CredentialSource, DeviceTokenStore, ResolvedCredential},
    error::{GatewayError, Result},
    handshake::ClientDescriptor,
    identity::DeviceIdentity,
    state::{ConnectionState, ServerInfo, StatsSnapshot},
};
