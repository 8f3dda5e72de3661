//! Key/value persistence for the access and refresh tokens
//!
//! The store is pure storage: no validation, no expiry logic. It must be
//! safe to call synchronously from any component, so every implementation
//! is infallible from the caller's point of view. `FileStore` logs
//! persistence failures instead of returning them.
//!
//! Only `TokenManager` writes the token keys; other components read.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Synchronous string key/value store.
pub trait CredentialStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
    fn remove(&self, key: &str);
}

/// In-process store. Contents are lost when the process exits.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        self.entries.lock().insert(key.to_string(), value.to_string());
    }

    fn remove(&self, key: &str) {
        self.entries.lock().remove(key);
    }
}

/// Store backed by a JSON object file.
///
/// The in-memory map is authoritative; every mutation rewrites the file with
/// an atomic temp-file + rename while the lock is held, so concurrent writers
/// never interleave on disk.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    entries: Mutex<HashMap<String, String>>,
}

impl FileStore {
    /// Open the store at `path`.
    ///
    /// If the file doesn't exist it is created as `{}` so later opens take
    /// the normal path.
    pub fn open(path: PathBuf) -> Result<Self> {
        let entries = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .map_err(|e| Error::Io(format!("reading credential file: {e}")))?;
            let entries: HashMap<String, String> = serde_json::from_str(&contents)
                .map_err(|e| Error::CredentialParse(format!("parsing credential file: {e}")))?;
            info!(path = %path.display(), keys = entries.len(), "loaded credential file");
            entries
        } else {
            info!(path = %path.display(), "credential file not found, starting empty");
            if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                std::fs::create_dir_all(dir)
                    .map_err(|e| Error::Io(format!("creating credential directory: {e}")))?;
            }
            let entries = HashMap::new();
            write_atomic(&path, &entries)?;
            entries
        };

        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    fn mutate(&self, key: &str, apply: impl FnOnce(&mut HashMap<String, String>) -> bool) {
        let mut entries = self.entries.lock();
        if !apply(&mut entries) {
            return;
        }
        if let Err(e) = write_atomic(&self.path, &entries) {
            warn!(key, error = %e, "failed to persist credential file");
        }
    }
}

impl CredentialStore for FileStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        self.mutate(key, |entries| {
            entries.insert(key.to_string(), value.to_string());
            true
        });
        debug!(key, "stored credential");
    }

    fn remove(&self, key: &str) {
        self.mutate(key, |entries| entries.remove(key).is_some());
    }
}

/// Write the map to `path` atomically with 0600 permissions on unix.
fn write_atomic(path: &Path, entries: &HashMap<String, String>) -> Result<()> {
    let json = serde_json::to_string_pretty(entries)
        .map_err(|e| Error::CredentialParse(format!("serializing credentials: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("credential path has no parent directory".into()))?;
    let tmp_path = dir.join(format!(".credentials.tmp.{}", std::process::id()));

    std::fs::write(&tmp_path, json.as_bytes())
        .map_err(|e| Error::Io(format!("writing temp credential file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o600))
            .map_err(|e| Error::Io(format!("setting credential file permissions: {e}")))?;
    }

    std::fs::rename(&tmp_path, path)
        .map_err(|e| Error::Io(format!("renaming temp credential file: {e}")))?;

    debug!(path = %path.display(), "persisted credential file");
    Ok(())
}
