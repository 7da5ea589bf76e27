//! Persistent gateway connection.
//!
//! [`GatewayClient`] is a cheap, cloneable handle. All mutable connection
//! state lives in a single [`ConnectionActor`] task that owns the socket,
//! the pending-request table and the reconnect timer; handles talk to it
//! over a command channel. The socket itself is driven by a per-connection
//! link task whose events carry a generation number, so anything arriving
//! from a socket that was already replaced is dropped on the floor.

use std::{
    future::pending,
    pin::Pin,
    sync::Arc,
    time::Duration,
};

use {
    castle_config::GatewayConfig,
    castle_protocol::{
        self as proto, ConnectChallenge, DeviceAuth, ErrorShape, EventFrame, Frame, HelloOk,
        PairingApproved, RequestFrame, ResponseFrame, events, methods,
    },
    futures::{SinkExt, StreamExt},
    serde_json::Value,
    tokio::{
        sync::{mpsc, oneshot, watch},
        task::AbortHandle,
        time::{Sleep, sleep},
    },
    tokio_tungstenite::{
        connect_async_with_config,
        tungstenite::{Message, protocol::WebSocketConfig},
    },
    tracing::{debug, info, trace, warn},
};

use crate::{
    backoff::Backoff,
    bus::{EventBus, GatewayEvent, Subscription},
    credentials::{CredentialResolver, ResolvedCredential, expose},
    error::{GatewayError, Result},
    handshake::{
        ClientDescriptor, CloseAction, ConnectFailure, Handshake, HandshakePhase, ReplyRole,
        classify_close, classify_connect_error,
    },
    identity::DeviceIdentity,
    pending::{PendingRequests, Reply},
    state::{ConnectionState, ConnectionStats, ServerInfo, StatsSnapshot},
};

// ── Options ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub url: String,
    pub client: ClientDescriptor,
    pub request_timeout: Duration,
    pub max_frame_bytes: usize,
    pub backoff: Backoff,
    /// Answer `connect.challenge` with a device signature.
    pub device_auth: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self::from_config(&GatewayConfig::default())
    }
}

impl ClientOptions {
    pub fn from_config(config: &GatewayConfig) -> Self {
        let defaults = ClientDescriptor::default();
        Self {
            url: config.url.clone(),
            client: ClientDescriptor {
                id: config.client_id.clone(),
                display_name: config.display_name.clone(),
                mode: config.client_mode.clone(),
                role: config.role.clone(),
                scopes: config.scopes.clone(),
                caps: config.caps.clone(),
                ..defaults
            },
            request_timeout: Duration::from_millis(config.request_timeout_ms),
            max_frame_bytes: config.max_frame_bytes,
            backoff: Backoff::new(
                Duration::from_millis(config.reconnect_base_ms),
                Duration::from_millis(config.reconnect_max_ms),
            ),
            device_auth: config.device_auth,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }
}

// ── Handle ───────────────────────────────────────────────────────────────────

enum Command {
    Start,
    Stop(oneshot::Sender<()>),
    Request {
        method: String,
        params: Value,
        timeout: Duration,
        reply: Reply,
    },
}

/// Handle to the process-wide gateway connection.
#[derive(Clone)]
pub struct GatewayClient {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    server: watch::Receiver<Option<ServerInfo>>,
    bus: EventBus,
    stats: Arc<ConnectionStats>,
    request_timeout: Duration,
}

impl GatewayClient {
    /// Spawn the connection actor. Nothing is dialed until [`Self::start`].
    ///
    /// Without an `identity`, challenges go unanswered and the gateway decides
    /// whether the bearer token alone is enough.
    pub fn spawn(
        options: ClientOptions,
        resolver: CredentialResolver,
        identity: Option<Arc<DeviceIdentity>>,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (server_tx, server_rx) = watch::channel(None);
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let bus = EventBus::new();
        let stats = Arc::new(ConnectionStats::default());
        let request_timeout = options.request_timeout;

        let actor = ConnectionActor {
            options,
            resolver,
            identity,
            bus: bus.clone(),
            stats: Arc::clone(&stats),
            state_tx,
            server_tx,
            commands: commands_rx,
            link_tx,
            link_rx,
            link: None,
            generation: 0,
            pending: PendingRequests::new(),
            handshake: None,
            handshake_deadline: None,
            reconnect_timer: None,
            credential: None,
            attempt: 0,
            device_auth_disabled: false,
        };
        tokio::spawn(actor.run());

        Self {
            commands: commands_tx,
            state: state_rx,
            server: server_rx,
            bus,
            stats,
            request_timeout,
        }
    }

    /// Begin connecting. No-op while connecting, paired-waiting or connected.
    pub fn start(&self) {
        let _ = self.commands.send(Command::Start);
    }

    /// Cancel any pending reconnect, close the socket and fail every
    /// outstanding request. Returns once the actor has done so.
    pub async fn stop(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Stop(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    pub async fn request(&self, method: &str, params: Value) -> Result<Value> {
        self.request_with_timeout(method, params, self.request_timeout)
            .await
    }

    pub async fn request_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Request {
                method: method.to_string(),
                params,
                timeout,
                reply: tx,
            })
            .map_err(|_| GatewayError::ConnectionClosed)?;
        rx.await.map_err(|_| GatewayError::ConnectionClosed)?
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Wait until the connection state satisfies `predicate`.
    pub async fn wait_for_state(
        &self,
        predicate: impl Fn(ConnectionState) -> bool,
    ) -> ConnectionState {
        let mut rx = self.state.clone();
        let reached = match rx.wait_for(|s| predicate(*s)).await {
            Ok(state) => Some(*state),
            Err(_) => None,
        };
        reached.unwrap_or_else(|| *rx.borrow())
    }

    /// Metadata from the most recent hello, if any.
    pub fn server_info(&self) -> Option<ServerInfo> {
        self.server.borrow().clone()
    }

    pub fn subscribe(&self) -> Subscription {
        self.bus.subscribe()
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

// ── Socket link ──────────────────────────────────────────────────────────────

enum LinkEvent {
    Opened {
        generation: u64,
        outbound: mpsc::UnboundedSender<Message>,
    },
    OpenFailed {
        generation: u64,
        error: String,
    },
    Text {
        generation: u64,
        text: String,
    },
    Closed {
        generation: u64,
        code: Option<u16>,
        reason: String,
    },
}

/// Hard ceiling handed to the websocket codec. A frame above it is a
/// protocol violation that closes the socket, so it sits well above
/// `max_frame_bytes`; anything in between is read, counted and dropped.
const TRANSPORT_FRAME_LIMIT: usize = 64 * 1024 * 1024;

fn transport_limit(max_frame_bytes: usize) -> usize {
    max_frame_bytes.saturating_mul(4).max(TRANSPORT_FRAME_LIMIT)
}

struct Link {
    task: AbortHandle,
    outbound: Option<mpsc::UnboundedSender<Message>>,
}

async fn run_link(
    url: String,
    generation: u64,
    max_frame_bytes: usize,
    stats: Arc<ConnectionStats>,
    events: mpsc::UnboundedSender<LinkEvent>,
) {
    let limit = transport_limit(max_frame_bytes);
    let config = WebSocketConfig::default()
        .max_message_size(Some(limit))
        .max_frame_size(Some(limit));
    let ws = match connect_async_with_config(url.as_str(), Some(config), false).await {
        Ok((ws, _response)) => ws,
        Err(e) => {
            let _ = events.send(LinkEvent::OpenFailed {
                generation,
                error: e.to_string(),
            });
            return;
        },
    };
    let (mut sink, mut stream) = ws.split();

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
    let writer = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if let Err(e) = sink.send(msg).await {
                debug!(error = %e, "gateway socket write failed");
                break;
            }
            if closing {
                break;
            }
        }
        let _ = sink.close().await;
    });

    if events
        .send(LinkEvent::Opened {
            generation,
            outbound: outbound_tx,
        })
        .is_err()
    {
        writer.abort();
        return;
    }

    let (code, reason) = loop {
        let text = match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                if text.len() > max_frame_bytes {
                    stats.frame_oversized();
                    warn!(bytes = text.len(), limit = max_frame_bytes, "dropping oversized frame");
                    continue;
                }
                text.to_string()
            },
            Some(Ok(Message::Binary(data))) => {
                if data.len() > max_frame_bytes {
                    stats.frame_oversized();
                    warn!(bytes = data.len(), limit = max_frame_bytes, "dropping oversized frame");
                    continue;
                }
                match String::from_utf8(data.to_vec()) {
                    Ok(text) => text,
                    Err(_) => {
                        stats.frame_unparseable();
                        debug!("dropping non-utf8 binary frame");
                        continue;
                    },
                }
            },
            Some(Ok(Message::Close(frame))) => {
                break match frame {
                    Some(f) => (Some(u16::from(f.code)), f.reason.to_string()),
                    None => (None, String::new()),
                };
            },
            Some(Ok(_)) => continue,
            Some(Err(e)) => break (None, e.to_string()),
            None => break (None, "stream ended".to_string()),
        };
        stats.frame_received();
        if events.send(LinkEvent::Text { generation, text }).is_err() {
            break (None, "client dropped".to_string());
        }
    };

    writer.abort();
    let _ = events.send(LinkEvent::Closed {
        generation,
        code,
        reason,
    });
}

// ── Actor ────────────────────────────────────────────────────────────────────

struct ConnectionActor {
    options: ClientOptions,
    resolver: CredentialResolver,
    identity: Option<Arc<DeviceIdentity>>,
    bus: EventBus,
    stats: Arc<ConnectionStats>,
    state_tx: watch::Sender<ConnectionState>,
    server_tx: watch::Sender<Option<ServerInfo>>,
    commands: mpsc::UnboundedReceiver<Command>,
    link_tx: mpsc::UnboundedSender<LinkEvent>,
    link_rx: mpsc::UnboundedReceiver<LinkEvent>,
    link: Option<Link>,
    generation: u64,
    pending: PendingRequests,
    handshake: Option<Handshake>,
    handshake_deadline: Option<Pin<Box<Sleep>>>,
    reconnect_timer: Option<Pin<Box<Sleep>>>,
    /// Credential chosen for the socket being opened.
    credential: Option<ResolvedCredential>,
    attempt: u32,
    /// Set once the gateway refuses device auth at the transport level.
    device_auth_disabled: bool,
}

async fn fire(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => pending().await,
    }
}

fn new_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl ConnectionActor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => {
                        debug!("all gateway handles dropped, shutting down");
                        self.shutdown();
                        break;
                    },
                },
                Some(event) = self.link_rx.recv() => self.handle_link_event(event),
                id = self.pending.next_expired() => {
                    trace!(id = %id, pending = self.pending.len(), "request deadline elapsed");
                },
                () = fire(&mut self.reconnect_timer) => {
                    self.reconnect_timer = None;
                    self.open();
                },
                () = fire(&mut self.handshake_deadline) => {
                    self.handshake_deadline = None;
                    warn!(timeout = ?self.options.request_timeout, "connect handshake timed out");
                    self.handshake = None;
                    self.teardown_link();
                    self.pending
                        .reject_all(GatewayError::Transport("connect handshake timed out".into()));
                    self.schedule_reconnect();
                },
            }
        }
    }

    // ── Commands ─────────────────────────────────────────────────────────

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Start => {
                let state = self.current_state();
                if state.is_active() {
                    debug!(%state, "start ignored, connection already active");
                    return;
                }
                self.attempt = 0;
                self.open();
            },
            Command::Stop(ack) => {
                self.shutdown();
                self.attempt = 0;
                self.set_state(ConnectionState::Disconnected);
                let _ = ack.send(());
            },
            Command::Request {
                method,
                params,
                timeout,
                reply,
            } => self.send_request(method, params, timeout, reply),
        }
    }

    fn send_request(&mut self, method: String, params: Value, timeout: Duration, reply: Reply) {
        let outbound = match (&self.link, self.current_state()) {
            (Some(Link {
                outbound: Some(tx), ..
            }), ConnectionState::Connected) => tx.clone(),
            _ => {
                let _ = reply.send(Err(GatewayError::NotConnected));
                return;
            },
        };
        let id = new_request_id();
        let frame = Frame::Request(RequestFrame::new(id.clone(), method.clone(), params));
        let json = match frame.to_json() {
            Ok(json) => json,
            Err(e) => {
                let _ = reply.send(Err(GatewayError::Protocol(e.to_string())));
                return;
            },
        };
        trace!(id = %id, method = %method, "client -> gateway");
        self.pending.insert(id.clone(), method, timeout, reply);
        if outbound.send(Message::text(json)).is_err() {
            self.pending.settle(
                &id,
                Err(GatewayError::Transport("socket writer has stopped".into())),
            );
        }
    }

    /// Drop the socket and every timer, failing outstanding requests.
    fn shutdown(&mut self) {
        self.reconnect_timer = None;
        self.handshake_deadline = None;
        self.handshake = None;
        self.credential = None;
        self.teardown_link();
        let rejected = self.pending.reject_all(GatewayError::ConnectionClosed);
        if rejected > 0 {
            debug!(rejected, "failed outstanding requests on stop");
        }
    }

    // ── Connection lifecycle ─────────────────────────────────────────────

    fn current_state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    fn set_state(&mut self, to: ConnectionState) {
        let from = self.current_state();
        if from == to {
            return;
        }
        self.state_tx.send_replace(to);
        info!(%from, %to, "gateway connection state changed");
        self.bus.publish(GatewayEvent::StateChange { from, to });
    }

    fn open(&mut self) {
        self.reconnect_timer = None;
        let Some(credential) = self.resolver.resolve() else {
            warn!("no gateway credential configured");
            self.set_state(ConnectionState::Error);
            self.bus.publish(GatewayEvent::AuthError {
                message: GatewayError::NoCredential.to_string(),
            });
            return;
        };
        self.teardown_link();
        debug!(source = %credential.source, url = %self.options.url, "opening gateway connection");
        self.credential = Some(credential);
        self.set_state(ConnectionState::Connecting);

        let task = tokio::spawn(run_link(
            self.options.url.clone(),
            self.generation,
            self.options.max_frame_bytes,
            Arc::clone(&self.stats),
            self.link_tx.clone(),
        ));
        self.link = Some(Link {
            task: task.abort_handle(),
            outbound: None,
        });
    }

    /// Close the current socket (if any) and invalidate its pending events.
    fn teardown_link(&mut self) {
        self.generation += 1;
        if let Some(link) = self.link.take() {
            if let Some(outbound) = link.outbound {
                let _ = outbound.send(Message::Close(None));
            }
            link.task.abort();
        }
    }

    fn schedule_reconnect(&mut self) {
        self.attempt = self.attempt.saturating_add(1);
        let delay = self.options.backoff.delay(self.attempt);
        self.stats.reconnect_scheduled();
        info!(attempt = self.attempt, delay_ms = delay.as_millis() as u64, "scheduling gateway reconnect");
        self.set_state(ConnectionState::Disconnected);
        self.reconnect_timer = Some(Box::pin(sleep(delay)));
    }

    fn handle_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Opened {
                generation,
                outbound,
            } if generation == self.generation => self.on_opened(outbound),
            LinkEvent::OpenFailed { generation, error } if generation == self.generation => {
                warn!(url = %self.options.url, error = %error, "gateway connection failed");
                self.link = None;
                self.credential = None;
                self.schedule_reconnect();
            },
            LinkEvent::Text { generation, text } if generation == self.generation => {
                self.on_text(&text)
            },
            LinkEvent::Closed {
                generation,
                code,
                reason,
            } if generation == self.generation => self.on_closed(code, &reason),
            _ => trace!("ignoring event from a replaced socket"),
        }
    }

    fn on_opened(&mut self, outbound: mpsc::UnboundedSender<Message>) {
        let Some(credential) = self.credential.take() else {
            return;
        };
        if let Some(link) = self.link.as_mut() {
            link.outbound = Some(outbound);
        }
        let connect_id = new_request_id();
        let params = self
            .options
            .client
            .connect_params(expose(&credential), None);
        self.send_connect(&connect_id, params);
        self.handshake = Some(Handshake::new(connect_id, credential));
        self.arm_handshake_deadline();
    }

    fn on_closed(&mut self, code: Option<u16>, reason: &str) {
        self.link = None;
        let device_auth_attempted = self
            .handshake
            .take()
            .is_some_and(|hs| hs.device_auth_attempted());
        self.handshake_deadline = None;
        let cause = match code {
            Some(code) => format!("socket closed ({code}): {reason}"),
            None => format!("socket closed: {reason}"),
        };
        let rejected = self.pending.reject_all(GatewayError::Transport(cause));
        info!(?code, reason, rejected, "gateway connection closed");

        match classify_close(code, device_auth_attempted) {
            CloseAction::DisableDeviceAuth => {
                warn!("gateway rejected device auth, continuing with token only");
                self.device_auth_disabled = true;
                self.attempt = 0;
                self.open();
            },
            CloseAction::Reconnect => self.schedule_reconnect(),
        }
    }

    // ── Inbound frames ───────────────────────────────────────────────────

    fn on_text(&mut self, text: &str) {
        let frame = match Frame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                self.stats.frame_unparseable();
                warn!(error = %e, "dropping unparseable gateway frame");
                return;
            },
        };
        if self.handshake.is_some() {
            self.on_handshake_frame(frame);
        } else {
            self.dispatch(frame);
        }
    }

    fn dispatch(&mut self, frame: Frame) {
        match frame {
            Frame::Response(res) => {
                let id = res.id.clone();
                let outcome = res.into_result().map_err(GatewayError::Server);
                if !self.pending.settle(&id, outcome) {
                    debug!(id = %id, "response for unknown or settled request");
                }
            },
            Frame::Event(event) => {
                trace!(event = %event.event, seq = ?event.seq, "gateway event");
                self.bus.publish(GatewayEvent::Gateway(event));
            },
            Frame::Request(req) => {
                debug!(method = %req.method, "ignoring server-initiated request");
            },
        }
    }

    fn on_handshake_frame(&mut self, frame: Frame) {
        match frame {
            Frame::Event(event) => self.on_handshake_event(event),
            Frame::Response(res) => {
                let role = self
                    .handshake
                    .as_ref()
                    .map_or(ReplyRole::Unrelated, |hs| hs.classify_reply(&res.id));
                match role {
                    ReplyRole::Current => self.on_connect_reply(res),
                    ReplyRole::Superseded => {
                        debug!(id = %res.id, "ignoring reply to superseded connect")
                    },
                    ReplyRole::Unrelated => {
                        debug!(id = %res.id, "ignoring response during handshake")
                    },
                }
            },
            Frame::Request(req) => {
                debug!(method = %req.method, "ignoring server request during handshake");
            },
        }
    }

    fn on_handshake_event(&mut self, event: EventFrame) {
        match event.event.as_str() {
            events::CONNECT_CHALLENGE => self.answer_challenge(event.payload),
            events::PAIRING_REQUIRED => {
                if let Some(hs) = self.handshake.as_mut() {
                    hs.enter_pairing();
                }
                self.handshake_deadline = None;
                info!("gateway requires device pairing, waiting for approval");
                self.set_state(ConnectionState::Pairing);
                self.bus
                    .publish(GatewayEvent::PairingRequired(event.payload));
            },
            events::PAIRING_APPROVED => {
                let approved: PairingApproved = match serde_json::from_value(event.payload) {
                    Ok(approved) => approved,
                    Err(e) => {
                        warn!(error = %e, "malformed pairing approval");
                        return;
                    },
                };
                self.store_device_token(
                    &approved.device_token,
                    approved.role.as_deref(),
                    &approved.scopes,
                );
                self.bus.publish(GatewayEvent::PairingApproved {
                    device_id: self.identity.as_ref().map(|i| i.device_id().to_string()),
                });
                self.complete_handshake(None);
            },
            other => trace!(event = other, "dropping event received before handshake completed"),
        }
    }

    fn answer_challenge(&mut self, payload: Value) {
        let challenge: ConnectChallenge = match serde_json::from_value(payload) {
            Ok(challenge) => challenge,
            Err(e) => {
                warn!(error = %e, "malformed connect challenge");
                return;
            },
        };
        let Some(hs) = self.handshake.as_ref() else {
            return;
        };
        if hs.phase() == HandshakePhase::Pairing {
            debug!("ignoring challenge while waiting for pairing approval");
            return;
        }
        if !self.options.device_auth || self.device_auth_disabled {
            debug!("device auth disabled, ignoring challenge");
            return;
        }
        let Some(identity) = self.identity.clone() else {
            warn!("no device identity, cannot answer connect challenge");
            return;
        };

        let token = expose(hs.credential()).to_string();
        let device: DeviceAuth = identity.sign(
            &self
                .options
                .client
                .signature_payload(&token, &challenge.nonce),
        );
        let params = self.options.client.connect_params(&token, Some(device));
        let connect_id = new_request_id();
        if let Some(hs) = self.handshake.as_mut() {
            hs.answer_challenge(connect_id.clone());
        }
        debug!(device_id = %identity.device_id(), "answering connect challenge");
        self.send_connect(&connect_id, params);
        self.arm_handshake_deadline();
    }

    fn on_connect_reply(&mut self, res: ResponseFrame) {
        match res.into_result() {
            Ok(payload) => {
                let hello = match serde_json::from_value::<HelloOk>(payload) {
                    Ok(hello) => hello,
                    Err(e) => {
                        warn!(error = %e, "unrecognised hello payload");
                        HelloOk::default()
                    },
                };
                self.complete_handshake(Some(hello));
            },
            Err(error) => self.fail_handshake(error),
        }
    }

    fn complete_handshake(&mut self, hello: Option<HelloOk>) {
        self.handshake = None;
        self.handshake_deadline = None;
        self.attempt = 0;
        if let Some(hello) = hello {
            if let Some(auth) = &hello.auth {
                self.store_device_token(&auth.device_token, auth.role.as_deref(), &auth.scopes);
            }
            let info = ServerInfo::from(&hello);
            info!(
                version = info.version.as_deref().unwrap_or("unknown"),
                protocol = ?info.protocol,
                conn_id = info.conn_id.as_deref().unwrap_or(""),
                "gateway handshake complete"
            );
            self.server_tx.send_replace(Some(info));
        }
        self.set_state(ConnectionState::Connected);
    }

    fn fail_handshake(&mut self, error: ErrorShape) {
        let used_device_token = self
            .handshake
            .take()
            .is_some_and(|hs| hs.credential().is_device_token());
        self.handshake_deadline = None;

        match classify_connect_error(&error, used_device_token) {
            ConnectFailure::StaleDeviceToken => {
                warn!(code = %error.code, "stored device token rejected, falling back to static token");
                if let Err(e) = self.resolver.device_tokens().clear() {
                    warn!(error = %e, "failed to clear device token");
                }
                self.attempt = 0;
                self.open();
            },
            ConnectFailure::Terminal { auth } => {
                warn!(code = %error.code, message = %error.message, "gateway refused connection");
                self.teardown_link();
                self.set_state(ConnectionState::Error);
                if auth {
                    self.bus.publish(GatewayEvent::AuthError {
                        message: error.message,
                    });
                }
            },
            ConnectFailure::Retry => {
                warn!(code = %error.code, message = %error.message, "connect failed, will retry");
                self.teardown_link();
                self.schedule_reconnect();
            },
        }
    }

    // ── Helpers ──────────────────────────────────────────────────────────

    fn send_connect(&mut self, id: &str, params: proto::ConnectParams) {
        let params = match serde_json::to_value(params) {
            Ok(params) => params,
            Err(e) => {
                warn!(error = %e, "failed to encode connect params");
                return;
            },
        };
        let frame = Frame::Request(RequestFrame::new(id, methods::CONNECT, params));
        let outbound = self.link.as_ref().and_then(|link| link.outbound.as_ref());
        match (frame.to_json(), outbound) {
            (Ok(json), Some(tx)) => {
                let _ = tx.send(Message::text(json));
            },
            (Err(e), _) => warn!(error = %e, "failed to encode connect frame"),
            (_, None) => debug!("no socket to send connect on"),
        }
    }

    fn arm_handshake_deadline(&mut self) {
        self.handshake_deadline = Some(Box::pin(sleep(self.options.request_timeout)));
    }

    fn store_device_token(&self, token: &str, role: Option<&str>, scopes: &[String]) {
        if token.is_empty() {
            return;
        }
        match self.resolver.device_tokens().save(token, role, scopes) {
            Ok(()) => info!("stored device token from gateway"),
            Err(e) => warn!(error = %e, "failed to store device token"),
        }
    }
}
