//! Error taxonomy for everything a device can trigger.
//!
//! Every variant is caught where it originates and turned into a targeted
//! `error` reply; none of them closes a connection. The `Display` text is what
//! goes over the wire, so variants never carry absolute paths or raw OS error
//! strings.

use std::io;
use thiserror::Error;
use tracing::debug;

pub type RelayResult<T> = Result<T, RelayError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    /// Bad or missing shared-secret token.
    #[error("Unauthorized")]
    AuthFailure,
    /// Any message other than `auth` on an unauthenticated connection.
    #[error("Not authenticated")]
    NotAuthenticated,
    /// Malformed payload or missing required field.
    #[error("{0}")]
    Protocol(String),
    /// A `type` discriminator we don't know.
    #[error("Unknown message type: {0}")]
    UnknownKind(String),
    /// Path resolves outside the sandbox root.
    #[error("Path outside sandbox")]
    SandboxViolation,
    /// Declared or observed transfer size over the configured limit.
    #[error("{0}")]
    Capacity(String),
    /// Feature disabled by configuration, or command not whitelisted.
    #[error("{0}")]
    ConfigurationDenied(String),
    /// Targeted forward to an identity with no live connection.
    #[error("Device not connected: {0}")]
    DeviceNotConnected(String),
    /// Filesystem or process failure, already reduced to a fixed phrase.
    #[error("{0}")]
    Io(&'static str),
    #[error("Clipboard unavailable")]
    Clipboard,
}

impl RelayError {
    pub fn protocol(message: impl Into<String>) -> Self {
        RelayError::Protocol(message.into())
    }

    pub fn capacity(message: impl Into<String>) -> Self {
        RelayError::Capacity(message.into())
    }

    pub fn denied(message: impl Into<String>) -> Self {
        RelayError::ConfigurationDenied(message.into())
    }

    /// Reduce an I/O error to a phrase that is safe to send to a device.
    ///
    /// The original error (which may include paths) only goes to the log.
    pub fn io(context: &str, err: &io::Error) -> Self {
        debug!("{}: {}", context, err);
        let phrase = match err.kind() {
            io::ErrorKind::NotFound => "Not found",
            io::ErrorKind::PermissionDenied => "Permission denied",
            io::ErrorKind::AlreadyExists => "Already exists",
            io::ErrorKind::NotADirectory => "Not a directory",
            io::ErrorKind::IsADirectory => "Is a directory",
            io::ErrorKind::InvalidInput | io::ErrorKind::InvalidFilename => "Invalid path",
            io::ErrorKind::StorageFull => "No space left on device",
            _ => "I/O error",
        };
        RelayError::Io(phrase)
    }

    /// Whether this error concerns the size limits (mapped to 413 over HTTP).
    pub fn is_capacity(&self) -> bool {
        matches!(self, RelayError::Capacity(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_do_not_leak_paths() {
        let err = io::Error::new(io::ErrorKind::NotFound, "/home/alice/secret.txt: missing");
        let relay = RelayError::io("open", &err);
        assert_eq!(relay.to_string(), "Not found");
    }

    #[test]
    fn unmapped_io_kind_is_generic() {
        let err = io::Error::other("disk on fire at /dev/sda");
        assert_eq!(RelayError::io("write", &err).to_string(), "I/O error");
    }

    #[test]
    fn unknown_kind_names_the_kind() {
        let err = RelayError::UnknownKind("teleport".into());
        assert_eq!(err.to_string(), "Unknown message type: teleport");
    }

    #[test]
    fn sandbox_violation_is_generic() {
        assert_eq!(RelayError::SandboxViolation.to_string(), "Path outside sandbox");
    }
}
