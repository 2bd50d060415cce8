//! Host clipboard access and change detection.
//!
//! [`ClipboardAccess`] is the seam to the desktop clipboard. The watcher polls
//! it on a fixed interval and only reports text whose SHA-256 differs from the
//! last one it saw; it keeps the hash, not the text.

use crate::error::{RelayError, RelayResult};
use crate::router::RouterHandle;
use sha2::{Digest, Sha256};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// Blocking access to a text clipboard. Callers run it off the async threads.
pub trait ClipboardAccess: Send + Sync + 'static {
    fn read_text(&self) -> RelayResult<String>;
    fn write_text(&self, text: &str) -> RelayResult<()>;
}

/// The desktop clipboard, opened per call so no handle outlives a request.
#[cfg(feature = "system-clipboard")]
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClipboard;

#[cfg(feature = "system-clipboard")]
impl SystemClipboard {
    /// Check that a clipboard can be opened on this machine at all.
    pub fn probe() -> RelayResult<Self> {
        arboard::Clipboard::new().map_err(|e| {
            debug!("Clipboard probe failed: {}", e);
            RelayError::Clipboard
        })?;
        Ok(Self)
    }
}

#[cfg(feature = "system-clipboard")]
impl ClipboardAccess for SystemClipboard {
    fn read_text(&self) -> RelayResult<String> {
        let mut clipboard = arboard::Clipboard::new().map_err(|e| {
            debug!("Failed to open clipboard: {}", e);
            RelayError::Clipboard
        })?;
        clipboard.get_text().map_err(|e| {
            debug!("Failed to read clipboard: {}", e);
            RelayError::Clipboard
        })
    }

    fn write_text(&self, text: &str) -> RelayResult<()> {
        let mut clipboard = arboard::Clipboard::new().map_err(|e| {
            debug!("Failed to open clipboard: {}", e);
            RelayError::Clipboard
        })?;
        clipboard.set_text(text.to_string()).map_err(|e| {
            debug!("Failed to write clipboard: {}", e);
            RelayError::Clipboard
        })
    }
}

/// The best clipboard this build and machine offer.
///
/// Falls back to [`UnavailableClipboard`] without a desktop session, so clipboard
/// requests fail per call instead of at startup.
pub fn host_clipboard() -> Arc<dyn ClipboardAccess> {
    #[cfg(feature = "system-clipboard")]
    match SystemClipboard::probe() {
        Ok(clipboard) => return Arc::new(clipboard),
        Err(_) => tracing::warn!("No desktop clipboard available; clipboard features disabled"),
    }
    Arc::new(UnavailableClipboard)
}

/// Stand-in for machines without a desktop session. Every call fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableClipboard;

impl ClipboardAccess for UnavailableClipboard {
    fn read_text(&self) -> RelayResult<String> {
        Err(RelayError::Clipboard)
    }

    fn write_text(&self, _text: &str) -> RelayResult<()> {
        Err(RelayError::Clipboard)
    }
}

/// Process-local clipboard, used by tests and headless runs.
#[derive(Debug, Default)]
pub struct InMemoryClipboard {
    text: Mutex<Option<String>>,
}

impl InMemoryClipboard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_text(text: &str) -> Self {
        Self {
            text: Mutex::new(Some(text.to_string())),
        }
    }
}

impl ClipboardAccess for InMemoryClipboard {
    fn read_text(&self) -> RelayResult<String> {
        let guard = self.text.lock().map_err(|_| RelayError::Clipboard)?;
        guard.clone().ok_or(RelayError::Clipboard)
    }

    fn write_text(&self, text: &str) -> RelayResult<()> {
        let mut guard = self.text.lock().map_err(|_| RelayError::Clipboard)?;
        *guard = Some(text.to_string());
        Ok(())
    }
}

/// Last-seen clipboard hash.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ClipboardState {
    last_hash: Option<String>,
}

impl ClipboardState {
    /// Record `text`; true if it differs from the previous observation.
    pub fn observe(&mut self, text: &str) -> bool {
        let hash = hex::encode(Sha256::digest(text.as_bytes()));
        if self.last_hash.as_deref() == Some(hash.as_str()) {
            return false;
        }
        self.last_hash = Some(hash);
        true
    }
}

pub struct ClipboardWatcher {
    clipboard: Arc<dyn ClipboardAccess>,
    state: ClipboardState,
    interval: Duration,
}

impl ClipboardWatcher {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(2);

    pub fn new(clipboard: Arc<dyn ClipboardAccess>, interval: Duration) -> Self {
        Self {
            clipboard,
            state: ClipboardState::default(),
            interval,
        }
    }

    /// Read the clipboard once. Returns the text only if it changed.
    ///
    /// Read failures are logged and treated as "no change".
    pub async fn poll_once(&mut self) -> Option<String> {
        let clipboard = self.clipboard.clone();
        let text = match tokio::task::spawn_blocking(move || clipboard.read_text()).await {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => {
                debug!("Clipboard poll skipped: {}", e);
                return None;
            }
            Err(e) => {
                debug!("Clipboard poll task failed: {}", e);
                return None;
            }
        };
        self.state.observe(&text).then_some(text)
    }

    /// Poll forever, pushing changes into the router's broadcast path.
    pub fn spawn(mut self, router: RouterHandle) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Clipboard watcher polling every {:?}", self.interval);
            let mut interval = tokio::time::interval(self.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if let Some(text) = self.poll_once().await {
                    debug!("Host clipboard changed ({} bytes)", text.len());
                    if !router.host_clipboard_changed(text) {
                        break;
                    }
                }
            }
            debug!("Clipboard watcher stopped: router gone");
        })
    }
}
