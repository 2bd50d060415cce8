//! Device registry: identity -> live connection.
//!
//! At most one connection holds an identity at any time. Claiming a held
//! identity closes the previous connection with [`REPLACED_CLOSE_CODE`] before
//! the new one is installed. The device list keeps registration order; a
//! replaced identity keeps its slot.

use crate::connection::{
    ConnectionHandle, ConnectionId, REPLACED_CLOSE_CODE, REPLACED_CLOSE_REASON, encode,
};
use crate::protocol::{PresenceStatus, ServerMessage, now_millis};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct Device {
    pub id: String,
    pub connection: ConnectionHandle,
    pub connected_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: IndexMap<String, Device>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `connection` as the holder of `device_id`.
    ///
    /// Returns the previous holder if one was replaced; it has already been
    /// sent the replacement close.
    pub fn register(
        &mut self,
        device_id: &str,
        connection: ConnectionHandle,
    ) -> Option<ConnectionHandle> {
        let now = Utc::now();
        let replaced = match self.devices.get(device_id) {
            Some(existing) if existing.connection.id() == connection.id() => None,
            Some(existing) => {
                info!(
                    "Device {} reconnected on {}, replacing {}",
                    device_id,
                    connection.id(),
                    existing.connection.id()
                );
                existing
                    .connection
                    .close(REPLACED_CLOSE_CODE, REPLACED_CLOSE_REASON);
                Some(existing.connection.clone())
            }
            None => None,
        };

        self.devices.insert(
            device_id.to_string(),
            Device {
                id: device_id.to_string(),
                connection,
                connected_at: now,
                last_seen: now,
            },
        );
        replaced
    }

    pub fn lookup(&self, device_id: &str) -> Option<&Device> {
        self.devices.get(device_id)
    }

    /// Remove `device_id` if it is still held by `connection`.
    ///
    /// A connection that was replaced must not evict its successor, so this
    /// returns false when the identity now belongs to someone else.
    pub fn unregister(&mut self, device_id: &str, connection: ConnectionId) -> bool {
        match self.devices.get(device_id) {
            Some(device) if device.connection.id() == connection => {
                self.devices.shift_remove(device_id);
                true
            }
            _ => false,
        }
    }

    pub fn touch(&mut self, device_id: &str) {
        if let Some(device) = self.devices.get_mut(device_id) {
            device.last_seen = Utc::now();
        }
    }

    pub fn identities(&self) -> Vec<String> {
        self.devices.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Queue a frame for one device. Returns false if it is not connected.
    pub fn send_to(&self, device_id: &str, frame: Arc<str>) -> bool {
        match self.devices.get(device_id) {
            Some(device) => device.connection.send_frame(frame),
            None => false,
        }
    }

    /// Queue a frame for every device except `exclude`.
    pub fn broadcast(&self, frame: Arc<str>, exclude: Option<&str>) {
        for (id, device) in &self.devices {
            if Some(id.as_str()) == exclude {
                continue;
            }
            device.connection.send_frame(frame.clone());
        }
    }

    pub fn broadcast_message(&self, message: &ServerMessage) {
        if let Some(frame) = encode(message) {
            self.broadcast(frame, None);
        }
    }

    /// Presence event for `device_id`, then the full device list, to everyone.
    pub fn announce(&self, device_id: &str, status: PresenceStatus) {
        debug!("Presence: {} is {:?} ({} devices)", device_id, status, self.len());
        self.broadcast_message(&ServerMessage::Presence {
            device_id: device_id.to_string(),
            status,
            timestamp: now_millis(),
        });
        self.broadcast_message(&ServerMessage::DeviceList {
            devices: self.identities(),
        });
    }
}
