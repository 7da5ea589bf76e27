//! Minimal scripted gateway: accepts one client, completes the handshake and
//! hands the socket to the test.

#![allow(dead_code)]

use std::time::Duration;

use {
    castle_gateway::{
        Backoff, ClientOptions, ConnectionState, CredentialResolver, DeviceTokenStore,
        GatewayClient, credentials::ConfigToken,
    },
    futures::{SinkExt, StreamExt},
    serde_json::{Value, json},
    tokio::net::{TcpListener, TcpStream},
    tokio_tungstenite::{WebSocketStream, accept_async, tungstenite::Message},
};

pub const STEP: Duration = Duration::from_secs(5);

pub async fn within<T>(fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(STEP, fut)
        .await
        .expect("step timed out")
}

pub struct Peer {
    ws: WebSocketStream<TcpStream>,
}

impl Peer {
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

    pub async fn send(&mut self, frame: Value) {
        self.ws.send(Message::text(frame.to_string())).await.unwrap();
    }

    pub async fn reply_ok(&mut self, id: &Value, payload: Value) {
        self.send(json!({ "type": "res", "id": id, "ok": true, "payload": payload }))
            .await;
    }

    pub async fn chat(&mut self, payload: Value) {
        self.send(json!({ "type": "event", "event": "chat", "payload": payload }))
            .await;
    }
}

/// Start a gateway, connect a client to it and return both ends.
pub async fn connected_pair(dir: &tempfile::TempDir) -> (GatewayClient, Peer) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());

    let options = ClientOptions {
        request_timeout: Duration::from_secs(2),
        backoff: Backoff::new(Duration::from_millis(20), Duration::from_millis(200)),
        ..ClientOptions::default()
    }
    .with_url(url);
    let resolver = CredentialResolver::new(DeviceTokenStore::with_path(
        dir.path().join("device-auth.json"),
    ))
    .with_source(ConfigToken(Some("tok_abc".into())));
    let client = GatewayClient::spawn(options, resolver, None);
    client.start();

    let (stream, _) = within(listener.accept()).await.unwrap();
    let mut peer = Peer {
        ws: accept_async(stream).await.unwrap(),
    };
    let connect = peer.recv().await;
    assert_eq!(connect["method"], "connect");
    peer.reply_ok(&connect["id"], json!({ "protocol": 3 })).await;
    within(client.wait_for_state(|s| s == ConnectionState::Connected)).await;
    (client, peer)
}
