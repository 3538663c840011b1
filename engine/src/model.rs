//! Core data model for backup and restore operations.
//!
//! This module defines the values that flow between the engine's stages:
//! - FileRecord: identity of one file captured during enumeration
//! - FileTime: the totally ordered modification timestamp
//! - OverwritePolicy, BackupKind, OperationStatus: enums controlling behavior

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::Metadata;
use std::path::PathBuf;
use std::str::FromStr;

/// Name of the metadata index written at the root of every backup.
pub const METADATA_FILE_NAME: &str = "backup_metadata.dat";

/// Name of the human-readable manifest written at the root of every backup.
pub const MANIFEST_FILE_NAME: &str = "backup_info.txt";

/// Name of the lock file held while an operation owns a destination root.
pub const LOCK_FILE_NAME: &str = ".backup.lock";

/// Returns true for files the engine itself writes into a backup root.
pub fn is_engine_file(name: &std::ffi::OsStr) -> bool {
    name == METADATA_FILE_NAME || name == MANIFEST_FILE_NAME || name == LOCK_FILE_NAME
}

/// 100ns ticks between 1601-01-01 and the Unix epoch.
const UNIX_EPOCH_TICKS: i128 = 116_444_736_000_000_000;
const TICKS_PER_SECOND: i128 = 10_000_000;

/// File modification time in 100ns intervals since 1601-01-01 UTC.
///
/// Stored as one 64-bit value so comparisons are a total order; the
/// metadata index persists it as a low/high pair of 32-bit words.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct FileTime(u64);

impl FileTime {
    pub const fn from_ticks(ticks: u64) -> Self {
        FileTime(ticks)
    }

    pub fn from_parts(low: u32, high: u32) -> Self {
        FileTime(((high as u64) << 32) | low as u64)
    }

    pub fn ticks(&self) -> u64 {
        self.0
    }

    pub fn low(&self) -> u32 {
        (self.0 & 0xFFFF_FFFF) as u32
    }

    pub fn high(&self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Modification time of a file. Times before 1601 clamp to zero.
    pub fn modified(metadata: &Metadata) -> Self {
        Self::from(filetime::FileTime::from_last_modification_time(metadata))
    }

    /// Convert back to a value `filetime` can apply to a destination file.
    pub fn to_filetime(self) -> filetime::FileTime {
        let since_unix = self.0 as i128 - UNIX_EPOCH_TICKS;
        let secs = since_unix.div_euclid(TICKS_PER_SECOND) as i64;
        let nanos = (since_unix.rem_euclid(TICKS_PER_SECOND) * 100) as u32;
        filetime::FileTime::from_unix_time(secs, nanos)
    }
}

impl From<filetime::FileTime> for FileTime {
    fn from(ft: filetime::FileTime) -> Self {
        let ticks = ft.unix_seconds() as i128 * TICKS_PER_SECOND
            + (ft.nanoseconds() / 100) as i128
            + UNIX_EPOCH_TICKS;
        FileTime(ticks.clamp(0, u64::MAX as i128) as u64)
    }
}

/// Identity of one backed-up file.
///
/// Captured once per enumeration pass and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileRecord {
    /// Absolute path at the source
    pub path: PathBuf,

    /// Path relative to the source root; re-rooted under the destination
    pub relative_path: PathBuf,

    /// File size in bytes
    pub size: u64,

    /// Last modification time
    pub modified: FileTime,

    /// Platform attribute bits, preserved opaquely
    pub attributes: u32,
}

impl FileRecord {
    pub fn from_metadata(path: PathBuf, relative_path: PathBuf, metadata: &Metadata) -> Self {
        FileRecord {
            path,
            relative_path,
            size: metadata.len(),
            modified: FileTime::modified(metadata),
            attributes: attributes_of(metadata),
        }
    }
}

/// Platform attribute bits for a file: Unix mode bits or Windows attributes.
#[cfg(unix)]
pub fn attributes_of(metadata: &Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode()
}

#[cfg(windows)]
pub fn attributes_of(metadata: &Metadata) -> u32 {
    use std::os::windows::fs::MetadataExt;
    metadata.file_attributes()
}

#[cfg(not(any(unix, windows)))]
pub fn attributes_of(metadata: &Metadata) -> u32 {
    u32::from(metadata.permissions().readonly())
}

/// Policy for handling files that already exist at the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverwritePolicy {
    /// Always replace the existing file
    Overwrite,
    /// Leave the existing file and record the collision as a failure
    FailIfExists,
    /// Leave the existing file silently
    SkipIfExists,
}

impl fmt::Display for OverwritePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OverwritePolicy::Overwrite => write!(f, "Overwrite"),
            OverwritePolicy::FailIfExists => write!(f, "FailIfExists"),
            OverwritePolicy::SkipIfExists => write!(f, "SkipIfExists"),
        }
    }
}

/// Which baseline, if any, a backup run diffs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackupKind {
    /// No baseline: every enumerated file is selected
    Full,
    /// Baseline is the immediately preceding backup
    Incremental,
    /// Baseline is the last full backup
    Differential,
}

impl fmt::Display for BackupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupKind::Full => write!(f, "Full"),
            BackupKind::Incremental => write!(f, "Incremental"),
            BackupKind::Differential => write!(f, "Differential"),
        }
    }
}

impl FromStr for BackupKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "full" => Ok(BackupKind::Full),
            "incremental" => Ok(BackupKind::Incremental),
            "differential" => Ok(BackupKind::Differential),
            other => Err(format!("unknown backup kind '{}'", other)),
        }
    }
}

/// Machine-checkable status of an operation that ran to completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OperationStatus {
    /// Every selected file was handled as requested
    Success,
    /// One or more files failed and were skipped; the rest completed
    PartialFailure,
}
