//! # hostlink core
//!
//! Platform-agnostic relay engine shared by the hostlink server.
//!
//! This crate provides:
//! - **Protocol types**: the JSON message union exchanged over a device connection
//! - **Device registry**: one live connection per device identity, presence broadcasts
//! - **Transfer ledger**: byte accounting for peer-to-peer file relays
//! - **Host boundary**: sandboxed filesystem access, clipboard access, constrained
//!   process spawning
//! - **Message router**: the serialized per-connection state machine tying it together
//!
//! Nothing in here knows about HTTP; the server crate feeds frames in through a
//! [`RouterHandle`] and drains [`Outgoing`] frames back out to its sockets.

pub mod clipboard;
pub mod connection;
pub mod error;
pub mod ledger;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod sandbox;
pub mod shell;

#[cfg(feature = "system-clipboard")]
pub use clipboard::SystemClipboard;
pub use clipboard::{
    ClipboardAccess, ClipboardState, ClipboardWatcher, InMemoryClipboard, UnavailableClipboard,
    host_clipboard,
};
pub use connection::{
    ConnectionHandle, ConnectionId, OVERFLOW_CLOSE_CODE, Outgoing, OutgoingQueue,
    REPLACED_CLOSE_CODE,
};
pub use error::{RelayError, RelayResult};
pub use ledger::{TransferLedger, TransferSession, TransferState};
pub use protocol::{ClientMessage, Envelope, ServerMessage};
pub use registry::{Device, DeviceRegistry};
pub use router::{
    HostServices, MessageRouter, RouterConfig, RouterEvent, RouterHandle, RouterSnapshot,
};
pub use sandbox::{DirEntry, DirListing, EntryKind, Sandbox, SandboxFile, UploadTarget};
pub use shell::{
    OutputStream, ProcessSpawner, ShellEvent, ShellPolicy, ShellRunner, SpawnStrategy,
    SystemSpawner,
};
