//! Credential slot adapters: a JSON file on disk and an in-memory slot.

use parking_lot::Mutex;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use crate::domain::{Credential, SyncError};
use crate::ports::CredentialStore;

/// File-backed credential slot.
///
/// The credential is stored as a small JSON document and rewritten atomically
/// via a temp file, so a crash mid-write never leaves a torn slot.
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    /// Slot at `path`. Nothing is touched until the first save.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Location of the slot.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn io_error(context: &str, path: &Path, err: std::io::Error) -> SyncError {
    SyncError::Storage(format!("{} {}: {}", context, path.display(), err))
}

impl CredentialStore for FileCredentialStore {
    fn load(&self) -> Result<Option<Credential>, SyncError> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error("read", &self.path, e)),
        };

        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| SyncError::Storage(format!("corrupt credential slot: {}", e)))
    }

    fn save(&self, credential: &Credential) -> Result<(), SyncError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| io_error("create", parent, e))?;
        }

        let bytes = serde_json::to_vec(credential)
            .map_err(|e| SyncError::Storage(format!("encode credential: {}", e)))?;

        // Write atomically via temp file
        let temp_path = self.path.with_extension("tmp");
        let mut file =
            std::fs::File::create(&temp_path).map_err(|e| io_error("create", &temp_path, e))?;
        file.write_all(&bytes)
            .map_err(|e| io_error("write", &temp_path, e))?;
        file.sync_all()
            .map_err(|e| io_error("sync", &temp_path, e))?;

        std::fs::rename(&temp_path, &self.path).map_err(|e| io_error("rename", &self.path, e))?;

        tracing::debug!(path = %self.path.display(), "Credential persisted");
        Ok(())
    }

    fn clear(&self) -> Result<(), SyncError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error("remove", &self.path, e)),
        }
    }
}

/// Process-lifetime credential slot.
#[derive(Default)]
pub struct MemoryCredentialStore {
    slot: Mutex<Option<Credential>>,
}

impl MemoryCredentialStore {
    /// Empty slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Slot pre-filled with `credential`.
    pub fn with_credential(credential: Credential) -> Self {
        Self {
            slot: Mutex::new(Some(credential)),
        }
    }

    /// Peek at the slot.
    pub fn stored(&self) -> Option<Credential> {
        self.slot.lock().clone()
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn load(&self) -> Result<Option<Credential>, SyncError> {
        Ok(self.slot.lock().clone())
    }

    fn save(&self, credential: &Credential) -> Result<(), SyncError> {
        *self.slot.lock() = Some(credential.clone());
        Ok(())
    }

    fn clear(&self) -> Result<(), SyncError> {
        *self.slot.lock() = None;
        Ok(())
    }
}
