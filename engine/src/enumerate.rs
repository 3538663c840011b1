//! File enumeration.
//!
//! Walks a source tree (or accepts a single file) and captures a
//! `FileRecord` for every regular file. Entries the caller cannot read are
//! omitted silently; symbolic links are not followed.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::EngineError;
use crate::model::{is_engine_file, FileRecord};

/// Files found under one source root.
#[derive(Debug, Clone)]
pub struct Enumeration {
    /// Absolute source root the relative paths are computed against
    pub root: PathBuf,

    pub records: Vec<FileRecord>,

    /// Sum of all record sizes
    pub total_size: u64,
}

impl Enumeration {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Enumerate every regular file under `root`.
///
/// # Errors
/// `SourceNotFound` if `root` does not exist, `InvalidSource` if it is
/// neither a file nor a directory, `PermissionDenied` if the root itself
/// cannot be read.
pub fn enumerate(root: &Path) -> Result<Enumeration, EngineError> {
    enumerate_filtered(root, |_| true)
}

/// Enumerate a backup directory, leaving out the engine's own files
/// (metadata index, manifest, lock) at its root.
pub fn enumerate_backup_tree(root: &Path) -> Result<Enumeration, EngineError> {
    enumerate_filtered(root, |relative| {
        let top_level = relative.parent().map_or(true, |p| p.as_os_str().is_empty());
        !(top_level && relative.file_name().map_or(false, is_engine_file))
    })
}

fn enumerate_filtered<F>(root: &Path, keep: F) -> Result<Enumeration, EngineError>
where
    F: Fn(&Path) -> bool,
{
    if root.as_os_str().is_empty() {
        return Err(EngineError::invalid_argument("source path is empty"));
    }
    let root = absolute(root)?;

    let metadata = fs::metadata(&root).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => EngineError::SourceNotFound { path: root.clone() },
        _ => EngineError::io(&root, e),
    })?;

    if metadata.is_file() {
        let name = root
            .file_name()
            .map(PathBuf::from)
            .ok_or_else(|| EngineError::InvalidSource { path: root.clone() })?;
        let record = FileRecord::from_metadata(root.clone(), name, &metadata);
        let total_size = record.size;
        // Relative paths of a single file are computed against its directory.
        let parent = root.parent().map_or_else(|| root.clone(), Path::to_path_buf);
        return Ok(Enumeration {
            root: parent,
            records: vec![record],
            total_size,
        });
    }

    if !metadata.is_dir() {
        return Err(EngineError::InvalidSource { path: root });
    }

    let mut records = Vec::new();
    let mut total_size = 0u64;

    for entry in WalkDir::new(&root).follow_links(false).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if e.depth() == 0 => {
                let path = e.path().map_or_else(|| root.clone(), Path::to_path_buf);
                return Err(EngineError::io(path, io::Error::from(e)));
            }
            Err(e) => {
                let denied = e
                    .io_error()
                    .map_or(false, |io| io.kind() == io::ErrorKind::PermissionDenied);
                if denied {
                    debug!(path = ?e.path(), "skipping unreadable entry");
                } else {
                    warn!(path = ?e.path(), error = %e, "skipping entry that could not be read");
                }
                continue;
            }
        };

        if !entry.file_type().is_file() {
            continue;
        }

        let relative = match entry.path().strip_prefix(&root) {
            Ok(rel) => rel.to_path_buf(),
            Err(_) => continue,
        };
        if !keep(&relative) {
            continue;
        }

        let metadata = match entry.metadata() {
            Ok(m) => m,
            Err(e) => {
                debug!(path = %entry.path().display(), error = %e, "skipping entry without metadata");
                continue;
            }
        };

        let record = FileRecord::from_metadata(entry.path().to_path_buf(), relative, &metadata);
        total_size += record.size;
        records.push(record);
    }

    debug!(root = %root.display(), files = records.len(), total_size, "enumeration complete");
    Ok(Enumeration {
        root,
        records,
        total_size,
    })
}

fn absolute(path: &Path) -> Result<PathBuf, EngineError> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().map_err(|e| EngineError::Unknown {
        message: "cannot resolve current directory".to_string(),
        source: Some(e),
    })?;
    Ok(cwd.join(path))
}
