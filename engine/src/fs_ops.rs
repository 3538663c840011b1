//! Filesystem operations module.
//!
//! This module provides low-level operations for:
//! - Creating destination directories
//! - Copying one file's content in buffered chunks
//! - Restoring timestamps and attribute bits on the copy

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::Path;
use tracing::debug;

use crate::error::EngineError;
use crate::model::{FileRecord, OverwritePolicy};

/// Ensure the parent directory of a path exists, creating it if necessary.
///
/// # Errors
/// Returns `DestinationUnusable`: a destination tree that cannot hold
/// directories cannot hold anything else either.
pub fn ensure_parent_dir_exists(path: &Path) -> Result<(), EngineError> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => ensure_dir_exists(parent),
        _ => Ok(()),
    }
}

/// Ensure `dir` exists as a directory.
pub fn ensure_dir_exists(dir: &Path) -> Result<(), EngineError> {
    match fs::metadata(dir) {
        Ok(metadata) if metadata.is_dir() => Ok(()),
        Ok(_) => Err(EngineError::DestinationUnusable {
            path: dir.to_path_buf(),
            source: io::Error::new(
                io::ErrorKind::InvalidInput,
                "path exists but is not a directory",
            ),
        }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            fs::create_dir_all(dir).map_err(|e| EngineError::DestinationUnusable {
                path: dir.to_path_buf(),
                source: e,
            })
        }
        Err(e) => Err(EngineError::DestinationUnusable {
            path: dir.to_path_buf(),
            source: e,
        }),
    }
}

/// Open the destination for writing according to `policy`.
///
/// For `FailIfExists` and `SkipIfExists` the file is created exclusively, so
/// a collision shows up as `io::ErrorKind::AlreadyExists`.
pub fn open_destination(path: &Path, policy: OverwritePolicy) -> io::Result<File> {
    match policy {
        OverwritePolicy::Overwrite => {
            if let Ok(metadata) = fs::metadata(path) {
                let mut perms = metadata.permissions();
                if perms.readonly() {
                    #[allow(clippy::permissions_set_readonly_false)]
                    perms.set_readonly(false);
                    fs::set_permissions(path, perms)?;
                }
            }
            OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)
        }
        OverwritePolicy::FailIfExists | OverwritePolicy::SkipIfExists => {
            OpenOptions::new().write(true).create_new(true).open(path)
        }
    }
}

/// Copy `record` to `dst` with its timestamp and attributes.
///
/// `on_bytes` is called after every chunk with the number of bytes written.
/// On a failure after the destination was opened the partial file is removed.
///
/// # Returns
/// Number of bytes copied
pub fn copy_file_with_metadata(
    record: &FileRecord,
    dst: &Path,
    policy: OverwritePolicy,
    buffer_size: usize,
    on_bytes: &mut dyn FnMut(u64),
) -> io::Result<u64> {
    let mut src_file = File::open(&record.path)?;
    let mut dst_file = open_destination(dst, policy)?;

    let result = copy_contents(&mut src_file, &mut dst_file, buffer_size, on_bytes);
    drop(dst_file);

    match result {
        Ok(bytes) => {
            preserve_metadata(record, dst);
            Ok(bytes)
        }
        Err(e) => {
            if let Err(cleanup) = fs::remove_file(dst) {
                debug!(path = %dst.display(), error = %cleanup, "could not remove partial copy");
            }
            Err(e)
        }
    }
}

fn copy_contents(
    src: &mut File,
    dst: &mut File,
    buffer_size: usize,
    on_bytes: &mut dyn FnMut(u64),
) -> io::Result<u64> {
    let mut buffer = vec![0u8; buffer_size.max(1)];
    let mut copied = 0u64;
    loop {
        let n = match src.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        dst.write_all(&buffer[..n])?;
        copied += n as u64;
        on_bytes(n as u64);
    }
    dst.flush()?;
    Ok(copied)
}

/// Apply the record's modification time and then its attribute bits.
///
/// Timestamps go first: a read-only attribute would block them on Windows.
/// Failures are logged, not returned; the content copy already succeeded.
fn preserve_metadata(record: &FileRecord, dst: &Path) {
    if let Err(e) = filetime::set_file_mtime(dst, record.modified.to_filetime()) {
        debug!(path = %dst.display(), error = %e, "could not preserve modification time");
    }
    if let Err(e) = apply_attributes(dst, record.attributes) {
        debug!(path = %dst.display(), error = %e, "could not preserve attributes");
    }
}

#[cfg(unix)]
pub fn apply_attributes(path: &Path, attributes: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    if attributes == 0 {
        return Ok(());
    }
    fs::set_permissions(path, fs::Permissions::from_mode(attributes & 0o7777))
}

#[cfg(not(unix))]
pub fn apply_attributes(path: &Path, attributes: u32) -> io::Result<()> {
    const FILE_ATTRIBUTE_READONLY: u32 = 0x1;
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_readonly(attributes & FILE_ATTRIBUTE_READONLY != 0);
    fs::set_permissions(path, perms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FileTime;
    use std::path::PathBuf;

    fn record_for(path: &Path) -> FileRecord {
        let metadata = fs::metadata(path).expect("Failed to stat source");
        FileRecord::from_metadata(
            path.to_path_buf(),
            PathBuf::from(path.file_name().expect("file name")),
            &metadata,
        )
    }

    #[test]
    fn test_copy_file_with_metadata() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src_file = temp_dir.path().join("source.txt");
        let dst_file = temp_dir.path().join("dest.txt");
        fs::write(&src_file, b"test content").expect("Failed to write source");
        filetime::set_file_mtime(&src_file, filetime::FileTime::from_unix_time(1_600_000_000, 0))
            .expect("Failed to set mtime");

        let record = record_for(&src_file);
        let mut chunks = Vec::new();
        let bytes = copy_file_with_metadata(
            &record,
            &dst_file,
            OverwritePolicy::Overwrite,
            5,
            &mut |n| chunks.push(n),
        )
        .expect("Failed to copy");

        assert_eq!(bytes, 12);
        assert_eq!(chunks, vec![5, 5, 2]);
        assert_eq!(fs::read_to_string(&dst_file).expect("read dest"), "test content");

        let copied = fs::metadata(&dst_file).expect("stat dest");
        assert_eq!(FileTime::modified(&copied), record.modified);
    }

    #[test]
    fn test_exclusive_open_reports_collision() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src_file = temp_dir.path().join("source.txt");
        let dst_file = temp_dir.path().join("dest.txt");
        fs::write(&src_file, b"new").expect("Failed to write source");
        fs::write(&dst_file, b"existing").expect("Failed to write dest");

        let err = copy_file_with_metadata(
            &record_for(&src_file),
            &dst_file,
            OverwritePolicy::FailIfExists,
            1024,
            &mut |_| {},
        )
        .unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        assert_eq!(fs::read_to_string(&dst_file).expect("read dest"), "existing");
    }

    #[test]
    fn test_overwrite_replaces_read_only_destination() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src_file = temp_dir.path().join("source.txt");
        let dst_file = temp_dir.path().join("dest.txt");
        fs::write(&src_file, b"fresh").expect("Failed to write source");
        fs::write(&dst_file, b"stale").expect("Failed to write dest");
        let mut perms = fs::metadata(&dst_file).expect("stat").permissions();
        perms.set_readonly(true);
        fs::set_permissions(&dst_file, perms).expect("Failed to set readonly");

        copy_file_with_metadata(
            &record_for(&src_file),
            &dst_file,
            OverwritePolicy::Overwrite,
            1024,
            &mut |_| {},
        )
        .expect("Overwrite should replace a read-only file");

        assert_eq!(fs::read_to_string(&dst_file).expect("read dest"), "fresh");
    }

    #[test]
    fn test_missing_source_leaves_no_destination() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let record = FileRecord {
            path: temp_dir.path().join("gone.txt"),
            relative_path: PathBuf::from("gone.txt"),
            size: 3,
            modified: FileTime::default(),
            attributes: 0,
        };
        let dst_file = temp_dir.path().join("out.txt");

        let err = copy_file_with_metadata(&record, &dst_file, OverwritePolicy::Overwrite, 8, &mut |_| {})
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        assert!(!dst_file.exists());
    }

    #[test]
    fn test_ensure_parent_dir_exists() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("subdir").join("file.txt");

        ensure_parent_dir_exists(&path).expect("Failed to create parent");

        assert!(path.parent().unwrap().is_dir());
    }

    #[test]
    fn test_parent_blocked_by_file_is_unusable() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let blocker = temp_dir.path().join("blocker");
        fs::write(&blocker, b"x").expect("Failed to write file");

        let err = ensure_parent_dir_exists(&blocker.join("file.txt")).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::DestinationUnusable);
    }
}
