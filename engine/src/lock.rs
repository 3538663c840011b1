//! Exclusive ownership of a destination root.
//!
//! The metadata index and manifest assume a single writer per destination.
//! An operation claims the root by creating a lock file there with
//! create-new semantics; a second claimant fails with `DestinationBusy`.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::EngineError;
use crate::model::LOCK_FILE_NAME;

/// Held for the duration of one operation; the lock file is removed on drop.
#[derive(Debug)]
pub struct DestinationLock {
    path: PathBuf,
    operation_id: Uuid,
}

impl DestinationLock {
    /// Create `root` if needed and claim it for `operation_id`.
    pub fn acquire(root: &Path, operation_id: Uuid) -> Result<Self, EngineError> {
        fs::create_dir_all(root).map_err(|e| EngineError::DestinationUnusable {
            path: root.to_path_buf(),
            source: e,
        })?;

        let path = root.join(LOCK_FILE_NAME);
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(EngineError::DestinationBusy {
                    path: root.to_path_buf(),
                })
            }
            Err(e) => {
                return Err(EngineError::DestinationUnusable {
                    path: root.to_path_buf(),
                    source: e,
                })
            }
        };

        // The id is informational; ownership is the file's existence.
        if let Err(e) = writeln!(file, "{}", operation_id) {
            warn!(path = %path.display(), error = %e, "could not record lock owner");
        }
        debug!(path = %path.display(), %operation_id, "destination locked");

        Ok(DestinationLock { path, operation_id })
    }

    pub fn operation_id(&self) -> Uuid {
        self.operation_id
    }
}

impl Drop for DestinationLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to release destination lock");
        }
    }
}
