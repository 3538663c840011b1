//! Read-only queries against a completed backup directory.

use serde::Serialize;
use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::copy::{abort, format_size};
use crate::enumerate::enumerate_backup_tree;
use crate::error::EngineError;
use crate::manifest::{self, BackupManifest};
use crate::metadata;
use crate::progress::{MonotonicReporter, ProgressReporter, Stage};

/// What is known about a backup directory.
#[derive(Debug, Clone, Serialize)]
pub struct BackupInfo {
    pub directory: PathBuf,

    /// The manifest, when one was written and could be read
    pub manifest: Option<BackupManifest>,

    /// Files present, excluding the engine's own files
    pub total_files: usize,
    pub total_size: u64,

    pub has_index: bool,
}

impl fmt::Display for BackupInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.manifest {
            Some(m) => {
                writeln!(f, "Backup ID: {}", m.id)?;
                writeln!(f, "Type: {}", m.backup_type)?;
                writeln!(f, "Source: {}", m.source.display())?;
                writeln!(f, "Destination: {}", m.destination.display())?;
                writeln!(f, "Date: {}", m.created.to_rfc3339())?;
                writeln!(f, "Files: {} ({} skipped)", m.total_files, m.files_skipped)?;
                writeln!(f, "Size: {}", format_size(m.total_size))
            }
            None => {
                writeln!(f, "Backup Information")?;
                writeln!(f, "==================")?;
                writeln!(f, "Location: {}", self.directory.display())?;
                writeln!(f, "Files: {}", self.total_files)?;
                writeln!(f, "Size: {}", format_size(self.total_size))?;
                writeln!(f, "Type: {}", if self.has_index { "File Backup" } else { "Unknown" })
            }
        }
    }
}

/// Describe a backup directory from its manifest, or from its contents when
/// there is no usable manifest.
pub fn backup_info(backup_dir: &Path) -> Result<BackupInfo, EngineError> {
    let contents = enumerate_backup_tree(backup_dir)?;

    let manifest = match manifest::read(&contents.root) {
        Ok(m) => Some(m),
        Err(EngineError::IndexNotFound { .. }) => None,
        Err(e) => {
            warn!(dir = %contents.root.display(), error = %e, "ignoring unreadable manifest");
            None
        }
    };

    Ok(BackupInfo {
        has_index: metadata::index_path(&contents.root).is_file(),
        directory: contents.root,
        manifest,
        total_files: contents.records.len(),
        total_size: contents.total_size,
    })
}

/// One file in a backup listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContentEntry {
    pub relative_path: PathBuf,
    pub size: u64,
}

impl fmt::Display for ContentEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.relative_path.display(), format_size(self.size))
    }
}

/// Files in a backup, sorted by relative path, without the engine's own files.
pub fn list_contents(backup_dir: &Path) -> Result<Vec<ContentEntry>, EngineError> {
    let contents = enumerate_backup_tree(backup_dir)?;
    let mut entries: Vec<ContentEntry> = contents
        .records
        .into_iter()
        .map(|r| ContentEntry {
            relative_path: r.relative_path,
            size: r.size,
        })
        .collect();
    entries.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    Ok(entries)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    pub files_checked: usize,
    pub total_size: u64,
}

/// Read-back presence check: every file in the backup must open for reading.
///
/// # Errors
/// `Corrupt` naming the first file that cannot be opened.
pub fn verify_backup(
    backup_dir: &Path,
    reporter: &dyn ProgressReporter,
) -> Result<VerifyReport, EngineError> {
    let reporter = MonotonicReporter::new(reporter);
    reporter.report(0, "Starting backup verification");

    let contents = match enumerate_backup_tree(backup_dir) {
        Ok(contents) => contents,
        Err(e) => return Err(abort(&reporter, e)),
    };
    let total = contents.records.len();
    let stage = Stage::new(10, 90);
    reporter.report(stage.start(), &format!("Verifying {} files", total));

    for (checked, record) in contents.records.iter().enumerate() {
        if let Err(e) = File::open(&record.path) {
            let err = EngineError::Corrupt {
                path: record.path.clone(),
                reason: format!("cannot be read back: {}", e),
            };
            return Err(abort(&reporter, err));
        }
        reporter.report(
            stage.percent(checked as u64 + 1, total as u64),
            &format!("Verified {} of {} files", checked + 1, total),
        );
    }

    info!(dir = %contents.root.display(), files = total, "backup verified");
    reporter.report(100, "Backup verification completed successfully");
    Ok(VerifyReport {
        files_checked: total,
        total_size: contents.total_size,
    })
}
