//! Wire protocol: one JSON object per WebSocket text frame.
//!
//! Every message carries a `type` discriminator. Inbound frames are parsed in
//! two steps: [`Envelope::parse`] only checks that the frame is a JSON object
//! and extracts the kind, so the router can reject unauthenticated traffic
//! before looking at payloads; [`Envelope::decode`] then produces the typed
//! [`ClientMessage`]. The envelope keeps the original object so forwarded
//! messages reach the peer verbatim, with extra client fields (file names,
//! sequence numbers, ...) intact.

use crate::error::{RelayError, RelayResult};
use crate::sandbox::DirListing;
use crate::shell::OutputStream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::error;

/// Identity that receives host privileges.
pub const HOST_DEVICE_ID: &str = "host";

/// Milliseconds since the Unix epoch, the timestamp unit used on the wire.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Messages a device may send.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    Auth {
        #[serde(default)]
        token: Option<String>,
        #[serde(default)]
        device_id: Option<String>,
    },
    ClipboardUpdate {
        #[serde(default)]
        to: Option<String>,
    },
    ClipboardRequest {
        #[serde(default)]
        target_device: Option<String>,
    },
    ClipboardResponse {
        #[serde(default)]
        requester_device: Option<String>,
    },
    HostClipboardSet {
        #[serde(default)]
        data: Option<Value>,
    },
    FileSendInit {
        #[serde(default)]
        file_id: Option<String>,
        #[serde(default)]
        to: Option<String>,
        #[serde(default)]
        size: Option<u64>,
    },
    /// The base64 `data` payload stays in the envelope and is never copied.
    FileChunk {
        #[serde(default)]
        file_id: Option<String>,
    },
    FileComplete {
        #[serde(default)]
        file_id: Option<String>,
    },
    FileCancel {
        #[serde(default)]
        file_id: Option<String>,
        #[serde(default)]
        reason: Option<String>,
    },
    FsList {
        #[serde(default)]
        path: Option<String>,
        #[serde(default)]
        request_id: Option<Value>,
    },
    ShellRun {
        #[serde(default)]
        command: Option<String>,
        #[serde(default)]
        args: Option<Vec<String>>,
        #[serde(default)]
        request_id: Option<Value>,
    },
}

impl ClientMessage {
    /// Every `type` value a device may send.
    pub const KINDS: &'static [&'static str] = &[
        "auth",
        "clipboard_update",
        "clipboard_request",
        "clipboard_response",
        "host_clipboard_set",
        "file_send_init",
        "file_chunk",
        "file_complete",
        "file_cancel",
        "fs_list",
        "shell_run",
    ];
}

/// An inbound frame that is known to be a JSON object.
#[derive(Debug, Clone)]
pub struct Envelope {
    kind: String,
    fields: Map<String, Value>,
}

impl Envelope {
    pub fn parse(text: &str) -> RelayResult<Self> {
        let value: Value =
            serde_json::from_str(text).map_err(|_| RelayError::protocol("Invalid JSON"))?;
        let Value::Object(fields) = value else {
            return Err(RelayError::protocol("Invalid JSON"));
        };
        let kind = match fields.get("type") {
            Some(Value::String(kind)) => kind.clone(),
            _ => String::new(),
        };
        Ok(Self { kind, fields })
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn is_auth(&self) -> bool {
        self.kind == "auth"
    }

    /// Decode the typed message, naming unknown kinds.
    pub fn decode(&self) -> RelayResult<ClientMessage> {
        if self.kind.is_empty() {
            return Err(RelayError::protocol("Missing message type"));
        }
        if !ClientMessage::KINDS.contains(&self.kind.as_str()) {
            return Err(RelayError::UnknownKind(self.kind.clone()));
        }
        let fields = self.fields.iter().filter(|(key, _)| key.as_str() != "data");
        let mut object: Map<String, Value> =
            fields.map(|(key, value)| (key.clone(), value.clone())).collect();
        // host_clipboard_set is the one kind whose data the router reads.
        if self.kind == "host_clipboard_set" {
            if let Some(data) = self.fields.get("data") {
                object.insert("data".into(), data.clone());
            }
        }
        serde_json::from_value(Value::Object(object))
            .map_err(|_| RelayError::protocol(format!("Invalid {} message", self.kind)))
    }

    /// A string field straight from the original object.
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    /// The caller-supplied correlation id, echoed on replies.
    pub fn request_id(&self) -> Option<Value> {
        self.fields.get("requestId").cloned()
    }

    /// Re-encode the original message for a peer, stamped with the sender.
    pub fn relay(self, from: &str) -> Relay {
        let mut fields = self.fields;
        fields.insert("from".into(), Value::String(from.to_string()));
        Relay { fields }
    }
}

/// An inbound message on its way to another device.
#[derive(Debug, Clone)]
pub struct Relay {
    fields: Map<String, Value>,
}

impl Relay {
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    pub fn encode(&self) -> Option<Arc<str>> {
        match serde_json::to_string(&self.fields) {
            Ok(json) => Some(Arc::from(json)),
            Err(e) => {
                error!("Failed to serialize relayed message: {}", e);
                None
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Host,
    Client,
}

impl Role {
    pub fn for_identity(device_id: &str) -> Self {
        if device_id == HOST_DEVICE_ID {
            Role::Host
        } else {
            Role::Client
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
}

/// Messages the server originates. Forwarded device messages use [`Relay`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    Ack {
        device_id: String,
        role: Role,
        shell: bool,
    },
    Error {
        error: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<Value>,
    },
    Presence {
        device_id: String,
        status: PresenceStatus,
        timestamp: i64,
    },
    DeviceList {
        devices: Vec<String>,
    },
    HostClipboardUpdate {
        data: String,
        from: String,
        timestamp: i64,
    },
    FileCancel {
        file_id: String,
        from: String,
        reason: String,
    },
    FsListResult {
        request_id: Option<Value>,
        data: DirListing,
    },
    ShellOutput {
        request_id: Option<Value>,
        stream: OutputStream,
        data: String,
    },
    ShellDone {
        request_id: Option<Value>,
        code: Option<i32>,
    },
}

impl ServerMessage {
    pub fn error(err: &RelayError, request_id: Option<Value>) -> Self {
        ServerMessage::Error {
            error: err.to_string(),
            request_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_auth() {
        let env = Envelope::parse(r#"{"type":"auth","token":"t","deviceId":"laptop"}"#).unwrap();
        assert!(env.is_auth());
        assert_eq!(
            env.decode().unwrap(),
            ClientMessage::Auth {
                token: Some("t".into()),
                device_id: Some("laptop".into()),
            }
        );
    }

    #[test]
    fn rejects_non_json() {
        let err = Envelope::parse("not json").unwrap_err();
        assert_eq!(err.to_string(), "Invalid JSON");
        assert!(Envelope::parse("[1,2]").is_err());
    }

    #[test]
    fn unknown_kind_is_named() {
        let env = Envelope::parse(r#"{"type":"teleport"}"#).unwrap();
        assert_eq!(env.decode().unwrap_err(), RelayError::UnknownKind("teleport".into()));
    }

    #[test]
    fn server_kinds_are_not_accepted_from_devices() {
        let env = Envelope::parse(r#"{"type":"device_list","devices":[]}"#).unwrap();
        assert!(matches!(env.decode(), Err(RelayError::UnknownKind(_))));
    }

    #[test]
    fn missing_type_is_protocol_error() {
        let env = Envelope::parse(r#"{"token":"x"}"#).unwrap();
        assert_eq!(env.decode().unwrap_err().to_string(), "Missing message type");
    }

    #[test]
    fn wrong_field_type_is_protocol_error() {
        let env = Envelope::parse(r#"{"type":"file_send_init","fileId":"f","to":"b","size":"big"}"#)
            .unwrap();
        assert_eq!(
            env.decode().unwrap_err().to_string(),
            "Invalid file_send_init message"
        );
    }

    #[test]
    fn chunk_data_read_from_envelope() {
        let env = Envelope::parse(r#"{"type":"file_chunk","fileId":"f1","seq":3,"data":"AAEC"}"#)
            .unwrap();
        assert_eq!(
            env.decode().unwrap(),
            ClientMessage::FileChunk { file_id: Some("f1".into()) }
        );
        assert_eq!(env.str_field("data"), Some("AAEC"));
    }

    #[test]
    fn relay_keeps_client_fields_and_stamps_sender() {
        let env = Envelope::parse(
            r#"{"type":"file_send_init","fileId":"f1","to":"B","size":10,"name":"a.txt"}"#,
        )
        .unwrap();
        let frame = env.relay("A").encode().unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["from"], "A");
        assert_eq!(value["name"], "a.txt");
        assert_eq!(value["type"], "file_send_init");
    }

    #[test]
    fn relay_cannot_spoof_sender() {
        let env = Envelope::parse(r#"{"type":"clipboard_update","data":"x","from":"host"}"#).unwrap();
        let frame = env.relay("mallory").encode().unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["from"], "mallory");
    }

    #[test]
    fn ack_serializes_camel_case() {
        let msg = ServerMessage::Ack {
            device_id: "host".into(),
            role: Role::for_identity("host"),
            shell: false,
        };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"type": "ack", "deviceId": "host", "role": "host", "shell": false})
        );
    }

    #[test]
    fn error_omits_missing_request_id() {
        let msg = ServerMessage::error(&RelayError::AuthFailure, None);
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"type": "error", "error": "Unauthorized"})
        );
        let msg = ServerMessage::error(&RelayError::denied("Shell disabled"), Some(json!(7)));
        assert_eq!(serde_json::to_value(&msg).unwrap()["requestId"], 7);
    }
}
