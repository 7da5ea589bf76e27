//! Scripted gateway for integration tests.
//!
//! Each accepted socket is handed to the test body, which drives the
//! conversation frame by frame.

#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use {
    castle_gateway::{
        Backoff, ClientOptions, CredentialResolver, DeviceIdentity, DeviceTokenStore,
        GatewayClient, credentials::ConfigToken,
    },
    futures::{SinkExt, StreamExt},
    serde_json::{Value, json},
    tokio::{
        net::{TcpListener, TcpStream},
        sync::mpsc,
    },
    tokio_tungstenite::{
        WebSocketStream, accept_async,
        tungstenite::{
            Message,
            protocol::{CloseFrame, frame::coding::CloseCode},
        },
    },
};

pub const STEP: Duration = Duration::from_secs(5);

/// Fail the test instead of hanging when `fut` stalls.
pub async fn within<T>(fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(STEP, fut)
        .await
        .expect("step timed out")
}

pub struct FakeGateway {
    pub url: String,
    conns: mpsc::UnboundedReceiver<ServerConn>,
}

impl FakeGateway {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (tx, conns) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let Ok(ws) = accept_async(stream).await else {
                    continue;
                };
                if tx.send(ServerConn { ws }).is_err() {
                    break;
                }
            }
        });
        Self { url, conns }
    }

    pub async fn accept(&mut self) -> ServerConn {
        within(self.conns.recv()).await.expect("gateway listener gone")
    }

    /// A connection arriving within `wait`, if any.
    pub async fn try_accept(&mut self, wait: Duration) -> Option<ServerConn> {
        tokio::time::timeout(wait, self.conns.recv())
            .await
            .ok()
            .flatten()
    }
}

pub struct ServerConn {
    ws: WebSocketStream<TcpStream>,
}

impl ServerConn {
    /// Next JSON frame from the client.
    pub async fn recv(&mut self) -> Value {
        loop {
            match within(self.ws.next()).await {
                Some(Ok(Message::Text(text))) => return serde_json::from_str(&text).unwrap(),
                Some(Ok(Message::Close(_))) | None => panic!("client closed the socket"),
                Some(Ok(_)) => continue,
                Some(Err(e)) => panic!("socket error: {e}"),
            }
        }
    }

    /// Next frame, asserting it is a `connect` request.
    pub async fn recv_connect(&mut self) -> Value {
        let frame = self.recv().await;
        assert_eq!(frame["type"], "req");
        assert_eq!(frame["method"], "connect");
        frame
    }

    pub async fn send(&mut self, frame: Value) {
        self.ws.send(Message::text(frame.to_string())).await.unwrap();
    }

    pub async fn send_raw(&mut self, text: String) {
        self.ws.send(Message::text(text)).await.unwrap();
    }

    pub async fn event(&mut self, name: &str, payload: Value) {
        self.send(json!({ "type": "event", "event": name, "payload": payload }))
            .await;
    }

    pub async fn reply_ok(&mut self, id: &Value, payload: Value) {
        self.send(json!({ "type": "res", "id": id, "ok": true, "payload": payload }))
            .await;
    }

    pub async fn reply_err(&mut self, id: &Value, code: &str, message: &str) {
        self.send(json!({
            "type": "res",
            "id": id,
            "ok": false,
            "error": { "code": code, "message": message },
        }))
        .await;
    }

    /// Accept the connect request `frame` with a minimal hello.
    pub async fn hello(&mut self, frame: &Value) {
        self.reply_ok(&frame["id"], hello_payload()).await;
    }

    pub async fn close_with(&mut self, code: CloseCode, reason: &str) {
        let _ = self
            .ws
            .close(Some(CloseFrame {
                code,
                reason: reason.into(),
            }))
            .await;
    }
}

pub fn hello_payload() -> Value {
    json!({
        "type": "hello-ok",
        "protocol": 3,
        "server": { "version": "2026.2.1", "host": "gw-test", "connId": "conn-1" },
        "features": { "methods": ["chat.send", "chat.abort"], "events": ["chat", "tick"] },
        "policy": { "maxPayload": 1048576, "tickIntervalMs": 30000 },
    })
}

pub fn device_tokens(dir: &tempfile::TempDir) -> DeviceTokenStore {
    DeviceTokenStore::with_path(dir.path().join("device-auth.json"))
}

pub fn test_options(url: &str) -> ClientOptions {
    ClientOptions {
        request_timeout: Duration::from_secs(2),
        backoff: Backoff::new(Duration::from_millis(20), Duration::from_millis(200)),
        ..ClientOptions::default()
    }
    .with_url(url)
}

pub fn spawn_client(
    options: ClientOptions,
    dir: &tempfile::TempDir,
    token: Option<&str>,
    identity: Option<Arc<DeviceIdentity>>,
) -> GatewayClient {
    let resolver = CredentialResolver::new(device_tokens(dir))
        .with_source(ConfigToken(token.map(str::to_string)));
    GatewayClient::spawn(options, resolver, identity)
}
