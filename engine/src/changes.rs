//! Change detection for incremental and differential backups.
//!
//! Both kinds run the same selection against a baseline index; they differ
//! only in which backup's index is supplied.

use std::path::PathBuf;
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::metadata::{self, MetadataIndex};
use crate::model::{BackupKind, FileRecord};

/// Where the baseline index for a run comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Baseline {
    /// No baseline: every file is selected
    None,
    /// Directory of the immediately preceding backup (incremental)
    Previous(PathBuf),
    /// Directory of the last full backup (differential)
    LastFull(PathBuf),
}

impl Baseline {
    /// Baseline appropriate for `kind`, reading from `backup_dir`.
    pub fn for_kind(kind: BackupKind, backup_dir: Option<PathBuf>) -> Result<Self, EngineError> {
        match (kind, backup_dir) {
            (BackupKind::Full, _) => Ok(Baseline::None),
            (BackupKind::Incremental, Some(dir)) => Ok(Baseline::Previous(dir)),
            (BackupKind::Differential, Some(dir)) => Ok(Baseline::LastFull(dir)),
            (kind, None) => Err(EngineError::invalid_argument(format!(
                "{} backup requires a baseline backup directory",
                kind
            ))),
        }
    }

    pub fn backup_dir(&self) -> Option<&PathBuf> {
        match self {
            Baseline::None => None,
            Baseline::Previous(dir) | Baseline::LastFull(dir) => Some(dir),
        }
    }
}

/// Baseline index after loading, with the diagnostics of the load.
#[derive(Debug, Clone, Default)]
pub struct ResolvedBaseline {
    pub index: Option<MetadataIndex>,

    /// A baseline was requested but its index does not exist
    pub missing: bool,

    /// Malformed lines dropped while loading the baseline index
    pub skipped_lines: usize,
}

/// Load the index a baseline points at.
///
/// A missing index is not an error: it is logged and every file will be
/// treated as new.
pub fn resolve_baseline(baseline: &Baseline) -> Result<ResolvedBaseline, EngineError> {
    let Some(dir) = baseline.backup_dir() else {
        return Ok(ResolvedBaseline::default());
    };

    match metadata::load(&metadata::index_path(dir)) {
        Ok(loaded) => Ok(ResolvedBaseline {
            index: Some(loaded.index),
            missing: false,
            skipped_lines: loaded.skipped_lines,
        }),
        Err(EngineError::IndexNotFound { path }) => {
            warn!(path = %path.display(), "baseline index not found; selecting every file");
            Ok(ResolvedBaseline {
                index: None,
                missing: true,
                skipped_lines: 0,
            })
        }
        Err(e) => Err(e),
    }
}

/// Ordered list of records selected for copying.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    records: Vec<FileRecord>,
}

impl ChangeSet {
    pub fn records(&self) -> &[FileRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<FileRecord> {
        self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn total_size(&self) -> u64 {
        self.records.iter().map(|r| r.size).sum()
    }
}

/// Select the records that are new or strictly newer than the baseline.
///
/// Equal or older timestamps are never selected. Without a baseline every
/// record is selected.
pub fn select_changes(current: &[FileRecord], baseline: Option<&MetadataIndex>) -> ChangeSet {
    let records: Vec<FileRecord> = match baseline {
        None => current.to_vec(),
        Some(index) => current
            .iter()
            .filter(|record| match index.get(&record.path) {
                None => true,
                Some(previous) => record.modified > previous.modified,
            })
            .cloned()
            .collect(),
    };

    debug!(
        considered = current.len(),
        selected = records.len(),
        has_baseline = baseline.is_some(),
        "change selection complete"
    );
    ChangeSet { records }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::model::FileTime;
    use std::path::Path;

    fn record(rel: &str, ticks: u64) -> FileRecord {
        FileRecord {
            path: Path::new("/src").join(rel),
            relative_path: PathBuf::from(rel),
            size: 10,
            modified: FileTime::from_ticks(ticks),
            attributes: 0,
        }
    }

    #[test]
    fn test_no_baseline_selects_everything() {
        let current = vec![record("a", 1), record("b", 2)];
        let changes = select_changes(&current, None);
        assert_eq!(changes.records(), current.as_slice());
        assert_eq!(changes.total_size(), 20);
    }

    #[test]
    fn test_selects_new_and_strictly_newer_only() {
        let baseline = MetadataIndex::from_records(
            "/src",
            vec![record("same", 100), record("older_now", 100), record("newer_now", 100)],
        );
        let current = vec![
            record("same", 100),
            record("older_now", 50),
            record("newer_now", 101),
            record("brand_new", 1),
        ];

        let changes = select_changes(&current, Some(&baseline));

        let names: Vec<_> = changes
            .records()
            .iter()
            .map(|r| r.relative_path.to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["newer_now", "brand_new"]);

        for selected in changes.records() {
            match baseline.get(&selected.path) {
                None => {}
                Some(prev) => assert!(selected.modified > prev.modified),
            }
        }
    }

    #[test]
    fn test_baseline_for_kind() {
        assert_eq!(Baseline::for_kind(BackupKind::Full, None).unwrap(), Baseline::None);
        assert_eq!(
            Baseline::for_kind(BackupKind::Differential, Some(PathBuf::from("/full"))).unwrap(),
            Baseline::LastFull(PathBuf::from("/full"))
        );
        let err = Baseline::for_kind(BackupKind::Incremental, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_missing_baseline_index_is_not_fatal() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let resolved = resolve_baseline(&Baseline::Previous(temp_dir.path().to_path_buf()))
            .expect("Missing baseline should resolve");
        assert!(resolved.missing);
        assert!(resolved.index.is_none());
    }

    #[test]
    fn test_resolves_saved_baseline() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let index = MetadataIndex::from_records("/src", vec![record("a", 7)]);
        metadata::save(&metadata::index_path(temp_dir.path()), &index).expect("Failed to save");

        let resolved = resolve_baseline(&Baseline::LastFull(temp_dir.path().to_path_buf()))
            .expect("Failed to resolve baseline");
        assert!(!resolved.missing);
        assert_eq!(resolved.index, Some(index));
    }
}
