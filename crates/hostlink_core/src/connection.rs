//! Handle to one live device connection.
//!
//! The socket task owns the actual WebSocket; everything else talks to it
//! through a [`ConnectionHandle`], which only queues frames. Sends never block
//! and silently drop once the socket is gone.
//!
//! The queue is bounded. A peer that stops reading until
//! [`OUTGOING_QUEUE_CAPACITY`] frames pile up is closed with
//! [`OVERFLOW_CLOSE_CODE`] instead of being allowed to grow without limit.

use crate::protocol::ServerMessage;
use std::fmt;
use std::sync::{Arc, OnceLock};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{error, warn};

/// Close code sent to a connection whose identity was claimed by a newer one.
pub const REPLACED_CLOSE_CODE: u16 = 4000;
pub const REPLACED_CLOSE_REASON: &str = "Replaced";

/// Frames a socket task may fall behind by before it is closed.
pub const OUTGOING_QUEUE_CAPACITY: usize = 1024;
/// Policy violation: the peer is not draining its queue.
pub const OVERFLOW_CLOSE_CODE: u16 = 1008;
pub const OVERFLOW_CLOSE_REASON: &str = "Send queue full";

/// Process-unique id of a connection, assigned by the router handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Frames queued for a socket task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    /// A serialized JSON message. Shared so broadcasts serialize once.
    Text(Arc<str>),
    /// Close the socket with a code and reason, then stop.
    Close { code: u16, reason: &'static str },
}

/// Close requested while the queue had no room. First one wins.
type PendingClose = Arc<OnceLock<(u16, &'static str)>>;

#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    tx: mpsc::Sender<Outgoing>,
    pending_close: PendingClose,
}

impl ConnectionHandle {
    /// Create a handle together with the queue its socket task drains.
    pub fn channel(id: ConnectionId) -> (Self, OutgoingQueue) {
        Self::with_capacity(id, OUTGOING_QUEUE_CAPACITY)
    }

    pub fn with_capacity(id: ConnectionId, capacity: usize) -> (Self, OutgoingQueue) {
        let (tx, rx) = mpsc::channel(capacity);
        let pending_close = PendingClose::default();
        let queue = OutgoingQueue {
            rx,
            pending_close: pending_close.clone(),
        };
        (
            Self {
                id,
                tx,
                pending_close,
            },
            queue,
        )
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue an already-encoded frame. Returns false if the frame was not
    /// queued because the socket is gone or has fallen too far behind.
    pub fn send_frame(&self, frame: Arc<str>) -> bool {
        if self.pending_close.get().is_some() {
            return false;
        }
        match self.tx.try_send(Outgoing::Text(frame)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("Outgoing queue full for {}, closing", self.id);
                let _ = self
                    .pending_close
                    .set((OVERFLOW_CLOSE_CODE, OVERFLOW_CLOSE_REASON));
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    pub fn send(&self, message: &ServerMessage) -> bool {
        match encode(message) {
            Some(frame) => self.send_frame(frame),
            None => false,
        }
    }

    pub fn close(&self, code: u16, reason: &'static str) {
        if let Err(TrySendError::Full(_)) = self.tx.try_send(Outgoing::Close { code, reason }) {
            let _ = self.pending_close.set((code, reason));
        }
    }
}

/// Receiving end of a connection's frames, drained by its socket task.
#[derive(Debug)]
pub struct OutgoingQueue {
    rx: mpsc::Receiver<Outgoing>,
    pending_close: PendingClose,
}

impl OutgoingQueue {
    /// Next frame to write. A close that could not be queued jumps ahead of
    /// everything still waiting.
    pub async fn recv(&mut self) -> Option<Outgoing> {
        if let Some(close) = self.take_pending_close() {
            return Some(close);
        }
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Outgoing> {
        self.take_pending_close().or_else(|| self.rx.try_recv().ok())
    }

    fn take_pending_close(&self) -> Option<Outgoing> {
        self.pending_close
            .get()
            .map(|&(code, reason)| Outgoing::Close { code, reason })
    }
}

/// Serialize a server message into a shareable frame.
pub fn encode(message: &ServerMessage) -> Option<Arc<str>> {
    match serde_json::to_string(message) {
        Ok(json) => Some(Arc::from(json)),
        Err(e) => {
            error!("Failed to serialize server message: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(frame: &str) -> Arc<str> {
        Arc::from(frame)
    }

    #[tokio::test]
    async fn frames_arrive_in_order() {
        let (handle, mut queue) = ConnectionHandle::channel(ConnectionId(1));
        assert!(handle.send_frame(text("a")));
        assert!(handle.send_frame(text("b")));
        assert_eq!(queue.recv().await, Some(Outgoing::Text(text("a"))));
        assert_eq!(queue.try_recv(), Some(Outgoing::Text(text("b"))));
        assert_eq!(queue.try_recv(), None);
    }

    #[tokio::test]
    async fn full_queue_closes_connection() {
        let (handle, mut queue) = ConnectionHandle::with_capacity(ConnectionId(2), 2);
        assert!(handle.send_frame(text("a")));
        assert!(handle.send_frame(text("b")));
        assert!(!handle.send_frame(text("c")));
        // Nothing else is accepted once the connection is condemned.
        assert!(!handle.send_frame(text("d")));

        assert_eq!(
            queue.recv().await,
            Some(Outgoing::Close {
                code: OVERFLOW_CLOSE_CODE,
                reason: OVERFLOW_CLOSE_REASON,
            })
        );
    }

    #[tokio::test]
    async fn close_on_full_queue_is_not_lost() {
        let (handle, mut queue) = ConnectionHandle::with_capacity(ConnectionId(3), 1);
        assert!(handle.send_frame(text("a")));
        handle.close(REPLACED_CLOSE_CODE, REPLACED_CLOSE_REASON);
        assert_eq!(
            queue.try_recv(),
            Some(Outgoing::Close {
                code: REPLACED_CLOSE_CODE,
                reason: REPLACED_CLOSE_REASON,
            })
        );
    }

    #[test]
    fn send_after_socket_gone_fails() {
        let (handle, queue) = ConnectionHandle::channel(ConnectionId(4));
        drop(queue);
        assert!(!handle.send_frame(text("a")));
    }
}
