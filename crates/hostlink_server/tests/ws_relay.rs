//! End-to-end relay tests over real WebSocket connections.
//!
//! Each test binds the full application on `127.0.0.1:0` and drives it with
//! `tokio-tungstenite` clients, the way a browser would.

use futures::{SinkExt, StreamExt};
use hostlink_core::{
    HostServices, InMemoryClipboard, MessageRouter, RouterHandle, Sandbox, ShellPolicy,
    ShellRunner, SystemSpawner,
};
use hostlink_server::{build_app, config::Config};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message,
};

const TOKEN: &str = "relay-token";

struct TestServer {
    addr: SocketAddr,
    relay: RouterHandle,
    _root: TempDir,
}

impl TestServer {
    async fn start() -> Self {
        let root = tempfile::tempdir().expect("temp root");
        let mut vars: HashMap<String, String> = HashMap::new();
        vars.insert("SERVER_TOKEN".into(), TOKEN.into());
        vars.insert("ROOT_DIR".into(), root.path().to_string_lossy().into_owned());
        let config = Config::from_source(|key| vars.get(key).cloned()).expect("config");

        let sandbox = Arc::new(Sandbox::new(&config.root_dir).expect("sandbox"));
        let shell = Arc::new(ShellRunner::new(
            ShellPolicy::default(),
            Arc::new(SystemSpawner::for_current_platform()),
            sandbox.root().to_path_buf(),
            1,
        ));
        let services = HostServices {
            sandbox: sandbox.clone(),
            clipboard: Arc::new(InMemoryClipboard::new()),
            shell,
        };
        let (relay, _task) = MessageRouter::spawn(config.router_config(), services);
        let app = build_app(&config, relay.clone(), sandbox);

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });

        Self {
            addr,
            relay,
            _root: root,
        }
    }

    async fn connect(&self, path: &str) -> TestClient {
        let url = format!("ws://{}{}", self.addr, path);
        let (ws, _) = connect_async(url).await.expect("connect");
        TestClient { ws }
    }

    async fn device(&self, device_id: &str) -> TestClient {
        let mut client = self.connect("/ws").await;
        client
            .send(json!({"type": "auth", "token": TOKEN, "deviceId": device_id}))
            .await;
        let ack = client.next_of("ack").await;
        assert_eq!(ack["deviceId"], device_id);
        client
    }

    /// Wait until the router reports `count` devices.
    async fn wait_for_devices(&self, count: usize) {
        for _ in 0..100 {
            let snapshot = self.relay.snapshot().await.expect("router alive");
            if snapshot.devices.len() == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("router never reached {count} devices");
    }
}

struct TestClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl TestClient {
    async fn send(&mut self, message: Value) {
        self.ws
            .send(Message::text(message.to_string()))
            .await
            .expect("send");
    }

    async fn next_message(&mut self) -> Message {
        tokio::time::timeout(Duration::from_secs(5), self.ws.next())
            .await
            .expect("timed out")
            .expect("stream ended")
            .expect("ws error")
    }

    async fn next_json(&mut self) -> Value {
        loop {
            match self.next_message().await {
                Message::Text(text) => return serde_json::from_str(text.as_str()).expect("json"),
                Message::Ping(_) | Message::Pong(_) => continue,
                other => panic!("unexpected frame: {other:?}"),
            }
        }
    }

    async fn next_of(&mut self, kind: &str) -> Value {
        loop {
            let value = self.next_json().await;
            if value["type"] == kind {
                return value;
            }
        }
    }
}

fn chunk(file_id: &str, bytes: &[u8]) -> Value {
    use base64::Engine;
    json!({
        "type": "file_chunk",
        "fileId": file_id,
        "data": base64::engine::general_purpose::STANDARD.encode(bytes),
    })
}

#[tokio::test]
async fn unauthenticated_connection_stays_open() {
    let server = TestServer::start().await;
    let mut client = server.connect("/").await;

    client.send(json!({"type": "fs_list", "path": "."})).await;
    assert_eq!(client.next_json().await["error"], "Not authenticated");

    client
        .send(json!({"type": "auth", "token": "nope", "deviceId": "x"}))
        .await;
    assert_eq!(client.next_json().await["error"], "Unauthorized");

    client
        .send(json!({"type": "auth", "token": TOKEN, "deviceId": "x"}))
        .await;
    assert_eq!(client.next_of("ack").await["role"], "client");
}

#[tokio::test]
async fn file_transfer_between_devices() {
    let server = TestServer::start().await;
    let mut a = server.device("A").await;
    let mut b = server.device("B").await;
    server.wait_for_devices(2).await;

    a.send(json!({"type": "file_send_init", "fileId": "f1", "to": "B", "size": 100, "name": "photo.jpg"}))
        .await;
    let init = b.next_of("file_send_init").await;
    assert_eq!(init["from"], "A");
    assert_eq!(init["name"], "photo.jpg");

    a.send(chunk("f1", &[1u8; 50])).await;
    a.send(chunk("f1", &[2u8; 50])).await;
    a.send(json!({"type": "file_complete", "fileId": "f1"})).await;

    let first = b.next_of("file_chunk").await;
    let second = b.next_of("file_chunk").await;
    assert_eq!(first["data"], chunk("f1", &[1u8; 50])["data"]);
    assert_eq!(second["data"], chunk("f1", &[2u8; 50])["data"]);
    assert_eq!(first["from"], "A");
    assert_eq!(second["from"], "A");
    assert_eq!(b.next_of("file_complete").await["fileId"], "f1");

    let snapshot = server.relay.snapshot().await.expect("router alive");
    assert!(snapshot.transfers.is_empty());
}

#[tokio::test]
async fn second_login_replaces_first() {
    let server = TestServer::start().await;
    let mut first = server.device("laptop").await;
    let _second = server.device("laptop").await;

    loop {
        match first.next_message().await {
            Message::Close(Some(frame)) => {
                assert_eq!(u16::from(frame.code), 4000);
                assert_eq!(frame.reason.as_str(), "Replaced");
                break;
            }
            Message::Close(None) => panic!("close without frame"),
            _ => continue,
        }
    }

    server.wait_for_devices(1).await;
    let snapshot = server.relay.snapshot().await.expect("router alive");
    assert_eq!(snapshot.devices, vec!["laptop"]);
}

#[tokio::test]
async fn disconnect_broadcasts_presence_and_cancels() {
    let server = TestServer::start().await;
    let mut a = server.device("A").await;
    let mut b = server.device("B").await;
    server.wait_for_devices(2).await;

    a.send(json!({"type": "file_send_init", "fileId": "f9", "to": "B", "size": 10}))
        .await;
    b.next_of("file_send_init").await;

    a.ws.close(None).await.expect("close");
    drop(a);

    let presence = b.next_of("presence").await;
    assert_eq!(presence["deviceId"], "A");
    assert_eq!(presence["status"], "offline");
    assert_eq!(b.next_of("device_list").await["devices"], json!(["B"]));
    let cancel = b.next_of("file_cancel").await;
    assert_eq!(cancel["fileId"], "f9");
    assert_eq!(cancel["reason"], "peer disconnected");
}

#[tokio::test]
async fn host_clipboard_changes_are_broadcast() {
    let server = TestServer::start().await;
    let mut a = server.device("A").await;
    server.wait_for_devices(1).await;

    assert!(server.relay.host_clipboard_changed("from the host".into()));
    let update = a.next_of("host_clipboard_update").await;
    assert_eq!(update["data"], "from the host");
    assert_eq!(update["from"], "host");
}
