//! Sandboxed filesystem access.
//!
//! Every path a device names is resolved against one root and must stay
//! inside it. [`Sandbox::resolve`] is purely lexical and runs before any
//! filesystem call; operations that touch an existing path re-check the
//! canonical path afterwards so a symlink inside the tree can't point out of
//! it.

use crate::error::{RelayError, RelayResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Dir,
    File,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
}

/// Directory contents as sent to devices. Entries are in filesystem order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirListing {
    /// The relative path as the caller gave it.
    pub path: String,
    pub entries: Vec<DirEntry>,
}

/// A regular file inside the sandbox, ready to be streamed.
#[derive(Debug, Clone)]
pub struct SandboxFile {
    pub path: PathBuf,
    pub size: u64,
    pub file_name: String,
}

#[derive(Debug, Clone)]
pub struct Sandbox {
    root: PathBuf,
}

impl Sandbox {
    /// Open a sandbox at `root`, which must be an existing directory.
    pub fn new(root: impl AsRef<Path>) -> RelayResult<Self> {
        let root = fs::canonicalize(root.as_ref())
            .map_err(|e| RelayError::io("canonicalize sandbox root", &e))?;
        if !root.is_dir() {
            return Err(RelayError::Io("Not a directory"));
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `relative` against the root without touching the filesystem.
    ///
    /// Absolute paths replace the root entirely, exactly like joining would,
    /// and are accepted only if they land inside it.
    pub fn resolve(&self, relative: &str) -> RelayResult<PathBuf> {
        let relative = if relative.is_empty() { "." } else { relative };
        let joined = normalize(&self.root.join(relative));
        if joined.starts_with(&self.root) {
            Ok(joined)
        } else {
            warn!("Rejected path outside sandbox: {:?}", relative);
            Err(RelayError::SandboxViolation)
        }
    }

    /// Re-check an existing path after resolving symlinks.
    fn confine(&self, path: &Path) -> RelayResult<PathBuf> {
        let canonical = fs::canonicalize(path).map_err(|e| RelayError::io("canonicalize", &e))?;
        if canonical.starts_with(&self.root) {
            Ok(canonical)
        } else {
            warn!("Rejected symlink escaping sandbox: {:?}", path);
            Err(RelayError::SandboxViolation)
        }
    }

    pub fn list_directory(&self, relative: &str) -> RelayResult<DirListing> {
        let path = self.confine(&self.resolve(relative)?)?;
        let metadata = fs::metadata(&path).map_err(|e| RelayError::io("stat", &e))?;
        if !metadata.is_dir() {
            return Err(RelayError::Io("Not a directory"));
        }

        let mut entries = Vec::new();
        for entry in fs::read_dir(&path).map_err(|e| RelayError::io("read_dir", &e))? {
            let entry = entry.map_err(|e| RelayError::io("read_dir entry", &e))?;
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                kind: if is_dir { EntryKind::Dir } else { EntryKind::File },
            });
        }

        Ok(DirListing {
            path: if relative.is_empty() { ".".into() } else { relative.to_string() },
            entries,
        })
    }

    /// Look up a regular file for download.
    pub fn open_file(&self, relative: &str) -> RelayResult<SandboxFile> {
        let path = self.confine(&self.resolve(relative)?)?;
        let metadata = fs::metadata(&path).map_err(|e| RelayError::io("stat", &e))?;
        if !metadata.is_file() {
            return Err(RelayError::Io("Not a file"));
        }
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "download".to_string());
        Ok(SandboxFile {
            path,
            size: metadata.len(),
            file_name,
        })
    }

    /// Resolve an upload destination, creating it if absent.
    ///
    /// The deepest part of the path that already exists is confined first,
    /// so nothing is ever created through a symlink pointing out of the root.
    pub fn ensure_directory(&self, relative: &str) -> RelayResult<PathBuf> {
        let path = self.resolve(relative)?;
        let existing = path
            .ancestors()
            .find(|ancestor| fs::symlink_metadata(ancestor).is_ok())
            .unwrap_or(self.root.as_path());
        let missing = path.strip_prefix(existing).unwrap_or(Path::new(""));
        let base = self.confine(existing)?;

        let path = if missing.as_os_str().is_empty() {
            base
        } else {
            let target = base.join(missing);
            fs::create_dir_all(&target).map_err(|e| RelayError::io("create_dir_all", &e))?;
            self.confine(&target)?
        };
        if !path.is_dir() {
            return Err(RelayError::Io("Destination not a directory"));
        }
        Ok(path)
    }

    /// Where an uploaded file named `file_name` inside `directory` goes.
    ///
    /// The name must be a single plain component; anything that would climb
    /// out of `directory` or address a subdirectory is rejected, as is an
    /// existing symlink under that name.
    pub fn upload_target(&self, directory: &Path, file_name: &str) -> RelayResult<UploadTarget> {
        let mut components = Path::new(file_name).components();
        let valid = matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(_)), None)
        );
        if !valid || file_name.contains(['/', '\\']) {
            warn!("Rejected upload file name {:?}", file_name);
            return Err(RelayError::protocol("Invalid file name"));
        }

        let directory = self.confine(directory)?;
        let path = directory.join(file_name);
        match fs::symlink_metadata(&path) {
            Ok(meta) if meta.file_type().is_symlink() => {
                warn!("Rejected upload over symlink {:?}", path);
                return Err(RelayError::SandboxViolation);
            }
            Ok(meta) if meta.is_dir() => return Err(RelayError::Io("Not a file")),
            _ => {}
        }
        let partial = directory.join(format!(".{}.{}.part", file_name, Uuid::new_v4().simple()));
        Ok(UploadTarget { path, partial })
    }
}

/// Destination of one uploaded file.
///
/// Data is written to `partial`, created exclusively so an existing entry is
/// never followed, then renamed onto `path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTarget {
    pub path: PathBuf,
    pub partial: PathBuf,
}

/// Collapse `.` and `..` lexically. `..` at the root stays at the root.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(prefix) => out.push(prefix.as_os_str()),
            Component::RootDir => out.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(part) => out.push(part),
        }
    }
    out
}
