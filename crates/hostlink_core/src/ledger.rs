//! Transfer ledger: bookkeeping for device-to-device file relays.
//!
//! The ledger never sees file contents, only payload lengths. Each session
//! counts decoded chunk bytes against the size the sender declared up front;
//! going over destroys the session. Completed, cancelled and violated
//! sessions are removed, so an id that isn't in the map is simply unknown.

use crate::error::{RelayError, RelayResult};
use std::collections::HashMap;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    /// Init accepted, no chunk relayed yet.
    Init,
    /// At least one chunk relayed.
    Active,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSession {
    pub file_id: String,
    pub from: String,
    pub to: String,
    pub size: u64,
    pub received_bytes: u64,
    pub state: TransferState,
}

impl TransferSession {
    /// The other party of the transfer, seen from `device_id`.
    pub fn counterpart(&self, device_id: &str) -> &str {
        if device_id == self.from {
            &self.to
        } else {
            &self.from
        }
    }

    pub fn involves(&self, device_id: &str) -> bool {
        self.from == device_id || self.to == device_id
    }
}

#[derive(Debug)]
pub struct TransferLedger {
    max_file_size: u64,
    max_chunk_size: u64,
    sessions: HashMap<String, TransferSession>,
}

impl TransferLedger {
    pub fn new(max_file_size: u64, max_chunk_size: u64) -> Self {
        Self {
            max_file_size,
            max_chunk_size,
            sessions: HashMap::new(),
        }
    }

    pub fn init(
        &mut self,
        file_id: &str,
        from: &str,
        to: &str,
        size: u64,
    ) -> RelayResult<&TransferSession> {
        if file_id.is_empty() || to.is_empty() || size == 0 {
            return Err(RelayError::protocol("Missing file init params"));
        }
        if size > self.max_file_size {
            return Err(RelayError::capacity("File too large"));
        }
        if self.sessions.contains_key(file_id) {
            return Err(RelayError::protocol("Duplicate fileId"));
        }

        info!(
            "Transfer {} started: {} -> {} ({} bytes)",
            file_id, from, to, size
        );
        let session = self
            .sessions
            .entry(file_id.to_string())
            .or_insert(TransferSession {
                file_id: file_id.to_string(),
                from: from.to_string(),
                to: to.to_string(),
                size,
                received_bytes: 0,
                state: TransferState::Init,
            });
        Ok(session)
    }

    /// Account for one chunk of `payload_len` decoded bytes from `sender`.
    ///
    /// On success the chunk may be forwarded to the returned session's
    /// recipient. On a size violation the session is gone before this returns.
    pub fn chunk(
        &mut self,
        file_id: &str,
        sender: &str,
        payload_len: u64,
    ) -> RelayResult<&TransferSession> {
        let verdict = {
            let Some(session) = self.sessions.get_mut(file_id) else {
                return Err(RelayError::protocol("Unknown fileId"));
            };
            if session.from != sender {
                return Err(RelayError::protocol("Unknown fileId"));
            }

            if payload_len > self.max_chunk_size {
                warn!(
                    "Transfer {} dropped: chunk of {} bytes over limit {}",
                    file_id, payload_len, self.max_chunk_size
                );
                Err(RelayError::capacity("Chunk too large"))
            } else {
                session.received_bytes = session.received_bytes.saturating_add(payload_len);
                if session.received_bytes > session.size {
                    warn!(
                        "Transfer {} dropped: {} bytes received, {} declared",
                        file_id, session.received_bytes, session.size
                    );
                    Err(RelayError::capacity("File size exceeded"))
                } else {
                    session.state = TransferState::Active;
                    Ok(())
                }
            }
        };

        if let Err(err) = verdict {
            self.sessions.remove(file_id);
            return Err(err);
        }
        self.sessions
            .get(file_id)
            .ok_or_else(|| RelayError::protocol("Unknown fileId"))
    }

    /// Finish a transfer. Only the sender can complete it.
    pub fn complete(&mut self, file_id: &str, sender: &str) -> Option<TransferSession> {
        match self.sessions.get(file_id) {
            Some(session) if session.from == sender => {
                let session = self.sessions.remove(file_id)?;
                info!(
                    "Transfer {} complete: {} of {} bytes",
                    file_id, session.received_bytes, session.size
                );
                Some(session)
            }
            _ => {
                debug!("Ignoring complete for unknown transfer {}", file_id);
                None
            }
        }
    }

    /// Drop a transfer in any state. Either party may cancel.
    pub fn cancel(&mut self, file_id: &str, by: &str) -> Option<TransferSession> {
        match self.sessions.get(file_id) {
            Some(session) if session.involves(by) => {
                info!("Transfer {} cancelled by {}", file_id, by);
                self.sessions.remove(file_id)
            }
            _ => {
                debug!("Ignoring cancel for unknown transfer {}", file_id);
                None
            }
        }
    }

    /// Remove every session the device takes part in.
    pub fn cancel_for_device(&mut self, device_id: &str) -> Vec<TransferSession> {
        let ids: Vec<String> = self
            .sessions
            .values()
            .filter(|session| session.involves(device_id))
            .map(|session| session.file_id.clone())
            .collect();
        ids.iter()
            .filter_map(|id| self.sessions.remove(id))
            .collect()
    }

    pub fn get(&self, file_id: &str) -> Option<&TransferSession> {
        self.sessions.get(file_id)
    }

    pub fn file_ids(&self) -> Vec<String> {
        self.sessions.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
