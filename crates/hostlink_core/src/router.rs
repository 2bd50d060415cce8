//! The message router: one task, one event channel, all relay state.
//!
//! Socket tasks never touch the registry or the ledger. They announce
//! themselves through a [`RouterHandle`], push raw text frames, and drain the
//! [`OutgoingQueue`] they were given. The router consumes [`RouterEvent`]s in
//! arrival order, so a connection's messages are handled in the order they
//! were received and no state needs a lock.
//!
//! Host operations that block (directory listings, clipboard writes, child
//! processes) run off the router task. Their results either go straight to the
//! requesting connection or come back in as another event.

use crate::clipboard::ClipboardAccess;
use crate::connection::{ConnectionHandle, ConnectionId, OutgoingQueue, encode};
use crate::error::{RelayError, RelayResult};
use crate::ledger::TransferLedger;
use crate::protocol::{
    ClientMessage, Envelope, HOST_DEVICE_ID, PresenceStatus, Role, ServerMessage, now_millis,
};
use crate::registry::DeviceRegistry;
use crate::sandbox::Sandbox;
use crate::shell::{ShellEvent, ShellRunner};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use subtle::ConstantTimeEq;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const DEFAULT_MAX_FILE_SIZE: u64 = 500 * 1024 * 1024;
pub const DEFAULT_MAX_CHUNK_SIZE: u64 = 64 * 1024;

const PEER_DISCONNECTED: &str = "peer disconnected";

#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Shared secret every device must present in `auth`.
    pub token: String,
    pub allow_remote_clipboard_set: bool,
    pub max_file_size: u64,
    pub max_chunk_size: u64,
}

impl RouterConfig {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            allow_remote_clipboard_set: false,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
        }
    }
}

/// Host-side capabilities the router delegates to.
#[derive(Clone)]
pub struct HostServices {
    pub sandbox: Arc<Sandbox>,
    pub clipboard: Arc<dyn ClipboardAccess>,
    pub shell: Arc<ShellRunner>,
}

#[derive(Debug)]
pub enum RouterEvent {
    Connected(ConnectionHandle),
    Frame {
        connection: ConnectionId,
        text: String,
    },
    Disconnected(ConnectionId),
    /// The clipboard watcher saw new host clipboard text.
    HostClipboardChanged(String),
    /// A `host_clipboard_set` write finished.
    HostClipboardWritten {
        connection: ConnectionId,
        text: String,
        result: RelayResult<()>,
    },
    Snapshot(oneshot::Sender<RouterSnapshot>),
}

/// Point-in-time view of router state, for status endpoints and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouterSnapshot {
    /// Connected identities in registration order.
    pub devices: Vec<String>,
    /// In-flight transfer ids, sorted.
    pub transfers: Vec<String>,
}

/// Cheap, cloneable entry point into a running router.
#[derive(Debug, Clone)]
pub struct RouterHandle {
    tx: mpsc::UnboundedSender<RouterEvent>,
    next_id: Arc<AtomicU64>,
}

impl RouterHandle {
    /// Register a new socket and get the queue its task must drain.
    pub fn open_connection(&self) -> (ConnectionHandle, OutgoingQueue) {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (handle, rx) = ConnectionHandle::channel(id);
        let _ = self.tx.send(RouterEvent::Connected(handle.clone()));
        (handle, rx)
    }

    pub fn frame(&self, connection: ConnectionId, text: impl Into<String>) -> bool {
        self.tx
            .send(RouterEvent::Frame {
                connection,
                text: text.into(),
            })
            .is_ok()
    }

    pub fn disconnect(&self, connection: ConnectionId) {
        let _ = self.tx.send(RouterEvent::Disconnected(connection));
    }

    /// Returns false once the router has stopped.
    pub fn host_clipboard_changed(&self, text: String) -> bool {
        self.tx.send(RouterEvent::HostClipboardChanged(text)).is_ok()
    }

    /// Every event sent before this call has been handled when it resolves.
    pub async fn snapshot(&self) -> Option<RouterSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(RouterEvent::Snapshot(tx)).ok()?;
        rx.await.ok()
    }
}

enum ConnectionState {
    Unauthenticated,
    Authenticated { device_id: String },
    /// Replaced by a newer connection; its frames are dropped until it goes.
    Closed,
}

struct ConnectionEntry {
    handle: ConnectionHandle,
    state: ConnectionState,
}

pub struct MessageRouter {
    config: RouterConfig,
    services: HostServices,
    registry: DeviceRegistry,
    ledger: TransferLedger,
    connections: HashMap<ConnectionId, ConnectionEntry>,
    events: mpsc::UnboundedReceiver<RouterEvent>,
    /// For host operations that report back. Weak so the router still stops
    /// when every handle is dropped.
    feedback: mpsc::WeakUnboundedSender<RouterEvent>,
}

impl MessageRouter {
    pub fn new(config: RouterConfig, services: HostServices) -> (Self, RouterHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let ledger = TransferLedger::new(config.max_file_size, config.max_chunk_size);
        let router = Self {
            config,
            services,
            registry: DeviceRegistry::new(),
            ledger,
            connections: HashMap::new(),
            events: rx,
            feedback: tx.downgrade(),
        };
        let handle = RouterHandle {
            tx,
            next_id: Arc::new(AtomicU64::new(1)),
        };
        (router, handle)
    }

    /// Create a router and drive it on its own task.
    pub fn spawn(config: RouterConfig, services: HostServices) -> (RouterHandle, JoinHandle<()>) {
        let (router, handle) = Self::new(config, services);
        let task = tokio::spawn(router.run());
        (handle, task)
    }

    pub async fn run(mut self) {
        info!("Message router started");
        while let Some(event) = self.events.recv().await {
            self.handle_event(event);
        }
        info!("Message router stopped");
    }

    pub fn handle_event(&mut self, event: RouterEvent) {
        match event {
            RouterEvent::Connected(handle) => {
                debug!("{} connected", handle.id());
                self.connections.insert(
                    handle.id(),
                    ConnectionEntry {
                        handle,
                        state: ConnectionState::Unauthenticated,
                    },
                );
            }
            RouterEvent::Frame { connection, text } => self.on_frame(connection, &text),
            RouterEvent::Disconnected(connection) => self.on_disconnect(connection),
            RouterEvent::HostClipboardChanged(text) => self.broadcast_host_clipboard(text),
            RouterEvent::HostClipboardWritten {
                connection,
                text,
                result,
            } => match result {
                Ok(()) => self.broadcast_host_clipboard(text),
                Err(err) => {
                    if let Some(entry) = self.connections.get(&connection) {
                        entry.handle.send(&ServerMessage::error(&err, None));
                    }
                }
            },
            RouterEvent::Snapshot(reply) => {
                let mut transfers = self.ledger.file_ids();
                transfers.sort();
                let _ = reply.send(RouterSnapshot {
                    devices: self.registry.identities(),
                    transfers,
                });
            }
        }
    }

    fn on_frame(&mut self, connection: ConnectionId, text: &str) {
        let Some(entry) = self.connections.get(&connection) else {
            debug!("Frame from unknown {}", connection);
            return;
        };
        let handle = entry.handle.clone();
        let device_id = match &entry.state {
            ConnectionState::Closed => return,
            ConnectionState::Unauthenticated => None,
            ConnectionState::Authenticated { device_id } => Some(device_id.clone()),
        };

        let envelope = match Envelope::parse(text) {
            Ok(envelope) => envelope,
            Err(err) => {
                handle.send(&ServerMessage::error(&err, None));
                return;
            }
        };

        if envelope.is_auth() {
            if let Err(err) = self.authenticate(&handle, device_id, &envelope) {
                handle.send(&ServerMessage::error(&err, None));
            }
            return;
        }

        let Some(device_id) = device_id else {
            handle.send(&ServerMessage::error(&RelayError::NotAuthenticated, None));
            return;
        };
        self.registry.touch(&device_id);

        let request_id = envelope.request_id();
        if let Err(err) = self.dispatch(&handle, &device_id, envelope) {
            debug!("{} ({}): {}", device_id, connection, err);
            handle.send(&ServerMessage::error(&err, request_id));
        }
    }

    fn authenticate(
        &mut self,
        handle: &ConnectionHandle,
        current: Option<String>,
        envelope: &Envelope,
    ) -> RelayResult<()> {
        let Ok(ClientMessage::Auth { token, device_id }) = envelope.decode() else {
            return Err(RelayError::AuthFailure);
        };
        let presented = token.unwrap_or_default();
        if !bool::from(presented.as_bytes().ct_eq(self.config.token.as_bytes())) {
            warn!("{} presented a bad token", handle.id());
            return Err(RelayError::AuthFailure);
        }

        let device_id = device_id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| format!("device-{}", Uuid::new_v4()));

        if let Some(previous) = current.filter(|previous| *previous != device_id) {
            info!("{} switching identity {} -> {}", handle.id(), previous, device_id);
            self.release_device(&previous, handle.id());
        }

        if let Some(replaced) = self.registry.register(&device_id, handle.clone()) {
            if let Some(entry) = self.connections.get_mut(&replaced.id()) {
                entry.state = ConnectionState::Closed;
            }
        }
        if let Some(entry) = self.connections.get_mut(&handle.id()) {
            entry.state = ConnectionState::Authenticated {
                device_id: device_id.clone(),
            };
        }

        info!("{} authenticated as {}", handle.id(), device_id);
        handle.send(&ServerMessage::Ack {
            device_id: device_id.clone(),
            role: Role::for_identity(&device_id),
            shell: self.services.shell.is_enabled(),
        });
        self.registry.announce(&device_id, PresenceStatus::Online);
        Ok(())
    }

    fn dispatch(
        &mut self,
        handle: &ConnectionHandle,
        device_id: &str,
        envelope: Envelope,
    ) -> RelayResult<()> {
        match envelope.decode()? {
            // Handled before dispatch.
            ClientMessage::Auth { .. } => Ok(()),

            ClientMessage::ClipboardUpdate { to } => {
                let relay = envelope.relay(device_id).with("timestamp", now_millis());
                let Some(frame) = relay.encode() else {
                    return Ok(());
                };
                match to.filter(|to| !to.is_empty()) {
                    Some(to) => self.forward(&to, frame),
                    None => {
                        self.registry.broadcast(frame, Some(device_id));
                        Ok(())
                    }
                }
            }

            ClientMessage::ClipboardRequest { target_device } => {
                let target = target_device
                    .filter(|target| !target.is_empty())
                    .ok_or_else(|| RelayError::protocol("targetDevice required"))?;
                self.forward_envelope(&target, envelope, device_id)
            }

            ClientMessage::ClipboardResponse { requester_device } => {
                let requester = requester_device
                    .filter(|requester| !requester.is_empty())
                    .ok_or_else(|| RelayError::protocol("requesterDevice required"))?;
                self.forward_envelope(&requester, envelope, device_id)
            }

            ClientMessage::HostClipboardSet { data } => {
                if !self.config.allow_remote_clipboard_set {
                    return Err(RelayError::denied("Host clipboard setting disabled"));
                }
                let Some(Value::String(text)) = data else {
                    return Err(RelayError::protocol("Invalid clipboard data"));
                };
                self.write_host_clipboard(handle.id(), text);
                Ok(())
            }

            ClientMessage::FileSendInit { file_id, to, size } => {
                let file_id = file_id.unwrap_or_default();
                let to = to.unwrap_or_default();
                self.ledger
                    .init(&file_id, device_id, &to, size.unwrap_or(0))?;
                let delivered = envelope
                    .relay(device_id)
                    .encode()
                    .is_some_and(|frame| self.registry.send_to(&to, frame));
                if !delivered {
                    self.ledger.cancel(&file_id, device_id);
                    return Err(RelayError::DeviceNotConnected(to));
                }
                Ok(())
            }

            ClientMessage::FileChunk { file_id } => {
                let file_id = file_id.unwrap_or_default();
                let payload = envelope.str_field("data").unwrap_or_default();
                let payload_len = decoded_len(payload)
                    .ok_or_else(|| RelayError::protocol("Invalid chunk encoding"))?;
                // Oversized chunks fail in the ledger without being decoded.
                if payload_len <= self.config.max_chunk_size && BASE64.decode(payload).is_err() {
                    return Err(RelayError::protocol("Invalid chunk encoding"));
                }
                let recipient = self.ledger.chunk(&file_id, device_id, payload_len)?.to.clone();
                self.forward_envelope(&recipient, envelope, device_id)
            }

            ClientMessage::FileComplete { file_id } => {
                let file_id = file_id.unwrap_or_default();
                match self.ledger.complete(&file_id, device_id) {
                    Some(session) => self.forward_envelope(&session.to, envelope, device_id),
                    None => Ok(()),
                }
            }

            ClientMessage::FileCancel { file_id, reason } => {
                let file_id = file_id.unwrap_or_default();
                let Some(session) = self.ledger.cancel(&file_id, device_id) else {
                    return Ok(());
                };
                let relay = envelope
                    .relay(device_id)
                    .with("reason", reason.unwrap_or_default());
                match relay.encode() {
                    Some(frame) => self.forward(session.counterpart(device_id), frame),
                    None => Ok(()),
                }
            }

            ClientMessage::FsList { path, request_id } => {
                self.list_directory(handle.clone(), path.unwrap_or_default(), request_id);
                Ok(())
            }

            ClientMessage::ShellRun {
                command,
                args,
                request_id,
            } => {
                if !self.services.shell.is_enabled() {
                    return Err(RelayError::denied("Shell disabled"));
                }
                let command = command
                    .filter(|command| !command.is_empty())
                    .ok_or_else(|| RelayError::protocol("Invalid command"))?;
                self.run_shell(handle.clone(), &command, &args.unwrap_or_default(), request_id)
            }
        }
    }

    fn forward(&self, device_id: &str, frame: Arc<str>) -> RelayResult<()> {
        if self.registry.send_to(device_id, frame) {
            Ok(())
        } else {
            Err(RelayError::DeviceNotConnected(device_id.to_string()))
        }
    }

    fn forward_envelope(&self, to: &str, envelope: Envelope, from: &str) -> RelayResult<()> {
        match envelope.relay(from).encode() {
            Some(frame) => self.forward(to, frame),
            None => Ok(()),
        }
    }

    fn broadcast_host_clipboard(&self, data: String) {
        self.registry
            .broadcast_message(&ServerMessage::HostClipboardUpdate {
                data,
                from: HOST_DEVICE_ID.to_string(),
                timestamp: now_millis(),
            });
    }

    fn write_host_clipboard(&self, connection: ConnectionId, text: String) {
        let clipboard = self.services.clipboard.clone();
        let feedback = self.feedback.clone();
        tokio::spawn(async move {
            let (text, result) = match tokio::task::spawn_blocking(move || {
                let result = clipboard.write_text(&text);
                (text, result)
            })
            .await
            {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!("Clipboard write task failed: {}", e);
                    return;
                }
            };
            if let Some(tx) = feedback.upgrade() {
                let _ = tx.send(RouterEvent::HostClipboardWritten {
                    connection,
                    text,
                    result,
                });
            }
        });
    }

    fn list_directory(&self, handle: ConnectionHandle, path: String, request_id: Option<Value>) {
        let sandbox = self.services.sandbox.clone();
        tokio::spawn(async move {
            let result = tokio::task::spawn_blocking(move || sandbox.list_directory(&path))
                .await
                .unwrap_or_else(|e| {
                    error!("Directory listing task failed: {}", e);
                    Err(RelayError::Io("I/O error"))
                });
            let reply = match result {
                Ok(data) => ServerMessage::FsListResult { request_id, data },
                Err(err) => ServerMessage::error(&err, request_id),
            };
            handle.send(&reply);
        });
    }

    fn run_shell(
        &self,
        handle: ConnectionHandle,
        command: &str,
        args: &[String],
        request_id: Option<Value>,
    ) -> RelayResult<()> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.services.shell.run(command, args, tx)?;
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let message = match event {
                    ShellEvent::Output { stream, data } => ServerMessage::ShellOutput {
                        request_id: request_id.clone(),
                        stream,
                        data,
                    },
                    ShellEvent::Exit { code } => ServerMessage::ShellDone {
                        request_id: request_id.clone(),
                        code,
                    },
                };
                if !handle.send(&message) {
                    break;
                }
            }
        });
        Ok(())
    }

    fn on_disconnect(&mut self, connection: ConnectionId) {
        let Some(entry) = self.connections.remove(&connection) else {
            return;
        };
        debug!("{} disconnected", connection);
        if let ConnectionState::Authenticated { device_id } = entry.state {
            self.release_device(&device_id, connection);
        }
    }

    /// Take `device_id` offline if `connection` still holds it.
    fn release_device(&mut self, device_id: &str, connection: ConnectionId) {
        if !self.registry.unregister(device_id, connection) {
            return;
        }
        info!("{} went offline", device_id);
        self.registry.announce(device_id, PresenceStatus::Offline);

        for session in self.ledger.cancel_for_device(device_id) {
            let peer = session.counterpart(device_id);
            info!("Transfer {} dropped: {} disconnected", session.file_id, device_id);
            let notice = ServerMessage::FileCancel {
                file_id: session.file_id.clone(),
                from: device_id.to_string(),
                reason: PEER_DISCONNECTED.to_string(),
            };
            if let Some(frame) = encode(&notice) {
                self.registry.send_to(peer, frame);
            }
        }
    }
}

/// Exact byte length a padded base64 string decodes to, or `None` if its
/// length or padding can't be valid. Alphabet errors surface when decoding.
fn decoded_len(encoded: &str) -> Option<u64> {
    let bytes = encoded.as_bytes();
    if bytes.len() % 4 != 0 {
        return None;
    }
    let padding = bytes.iter().rev().take_while(|&&b| b == b'=').count();
    if padding > 2 {
        return None;
    }
    Some((bytes.len() / 4 * 3 - padding) as u64)
}
