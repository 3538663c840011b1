//! Backup operations.
//!
//! File backups follow one pipeline for every kind:
//!
//! 1. Claim the destination (`DestinationLock`).
//! 2. Enumerate the source.
//! 3. Load the baseline index, if the kind has one.
//! 4. Select changes and copy them.
//! 5. Save this run's metadata index and write the manifest.
//!
//! Volume, device and VM backups wrap that pipeline (or the block imager)
//! around an external job supervised by the `JobMonitor`.

use chrono::Utc;
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use uuid::Uuid;

use crate::block::{image_file_name, BlockImager, ImageDirection};
use crate::cancel::CancelToken;
use crate::changes::{resolve_baseline, select_changes, Baseline};
use crate::config::EngineConfig;
use crate::copy::{abort, CopyEngine, FileFailure};
use crate::enumerate::{enumerate, enumerate_backup_tree};
use crate::error::EngineError;
use crate::external::{ExportOptions, SnapshotProvider, VirtualizationManager};
use crate::lock::DestinationLock;
use crate::manifest::{self, BackupManifest};
use crate::metadata::{self, MetadataIndex};
use crate::model::{BackupKind, FileRecord, OperationStatus, OverwritePolicy};
use crate::monitor::JobMonitor;
use crate::progress::{MonotonicReporter, ProgressReporter, Stage};

const ENUMERATE_STAGE: Stage = Stage::new(0, 5);
const COPY_STAGE: Stage = Stage::new(5, 90);
const SNAPSHOT_STAGE: Stage = Stage::new(0, 30);
const AFTER_SNAPSHOT_STAGE: Stage = Stage::new(30, 70);
const EXTERNAL_STAGE: Stage = Stage::new(0, 95);

/// Parameters of a file backup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupRequest {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub kind: BackupKind,

    /// Backup directory holding the baseline index: the previous backup for
    /// an incremental run, the last full backup for a differential one
    pub baseline_dir: Option<PathBuf>,

    pub policy: OverwritePolicy,
}

impl BackupRequest {
    pub fn full(source: impl Into<PathBuf>, destination: impl Into<PathBuf>) -> Self {
        BackupRequest {
            source: source.into(),
            destination: destination.into(),
            kind: BackupKind::Full,
            baseline_dir: None,
            policy: OverwritePolicy::Overwrite,
        }
    }

    pub fn incremental(
        source: impl Into<PathBuf>,
        destination: impl Into<PathBuf>,
        previous_backup: impl Into<PathBuf>,
    ) -> Self {
        BackupRequest {
            kind: BackupKind::Incremental,
            baseline_dir: Some(previous_backup.into()),
            ..Self::full(source, destination)
        }
    }

    pub fn differential(
        source: impl Into<PathBuf>,
        destination: impl Into<PathBuf>,
        last_full_backup: impl Into<PathBuf>,
    ) -> Self {
        BackupRequest {
            kind: BackupKind::Differential,
            baseline_dir: Some(last_full_backup.into()),
            ..Self::full(source, destination)
        }
    }

    pub fn with_policy(mut self, policy: OverwritePolicy) -> Self {
        self.policy = policy;
        self
    }
}

/// Summary of a completed backup.
#[derive(Debug, Clone, Serialize)]
pub struct BackupReport {
    pub id: Uuid,
    pub status: OperationStatus,
    pub backup_type: String,
    pub destination: PathBuf,

    /// Files found at the source
    pub files_enumerated: usize,
    /// Files the change detector selected
    pub files_selected: usize,
    pub files_copied: usize,
    pub files_skipped: usize,
    pub bytes_copied: u64,
    pub failures: Vec<FileFailure>,

    /// A baseline was requested but had no index; every file was treated as new
    pub baseline_missing: bool,
    /// Malformed lines dropped from the baseline index
    pub baseline_skipped_lines: usize,

    pub message: String,
}

impl BackupReport {
    fn single_object(id: Uuid, backup_type: &str, destination: &Path, files: usize, bytes: u64) -> Self {
        BackupReport {
            id,
            status: OperationStatus::Success,
            backup_type: backup_type.to_string(),
            destination: destination.to_path_buf(),
            files_enumerated: files,
            files_selected: files,
            files_copied: files,
            files_skipped: 0,
            bytes_copied: bytes,
            failures: Vec::new(),
            baseline_missing: false,
            baseline_skipped_lines: 0,
            message: format!("{} backup completed", backup_type),
        }
    }
}

/// Back up a file tree (or a single file) as a full, incremental or
/// differential backup.
pub fn backup_files(
    request: &BackupRequest,
    config: &EngineConfig,
    reporter: &dyn ProgressReporter,
    cancel: &CancelToken,
) -> Result<BackupReport, EngineError> {
    let reporter = MonotonicReporter::new(reporter);
    let label = request.kind.to_string();
    run_file_backup(request, &request.source, &label, config, &reporter, cancel)
        .map_err(|e| abort(&reporter, e))
}

fn run_file_backup(
    request: &BackupRequest,
    source_label: &Path,
    backup_type: &str,
    config: &EngineConfig,
    reporter: &MonotonicReporter<'_>,
    cancel: &CancelToken,
) -> Result<BackupReport, EngineError> {
    require_path(&request.source, "source")?;
    require_path(&request.destination, "destination")?;
    let baseline = Baseline::for_kind(request.kind, request.baseline_dir.clone())?;

    let id = Uuid::new_v4();
    let _lock = DestinationLock::acquire(&request.destination, id)?;
    info!(
        %id,
        kind = %request.kind,
        source = %request.source.display(),
        dest = %request.destination.display(),
        "backup started"
    );

    reporter.report(ENUMERATE_STAGE.start(), "Enumerating source files");
    let enumeration = enumerate(&request.source)?;
    let resolved = resolve_baseline(&baseline)?;
    let changes = select_changes(&enumeration.records, resolved.index.as_ref());
    reporter.report(
        ENUMERATE_STAGE.end(),
        &format!(
            "{} of {} files selected for {} backup",
            changes.len(),
            enumeration.len(),
            request.kind
        ),
    );

    let outcome = CopyEngine::with_config(request.policy, config)
        .in_stage(COPY_STAGE)
        .run(changes.records(), &request.destination, reporter, cancel)?;

    reporter.report(COPY_STAGE.end(), "Saving backup metadata");
    let failed: HashSet<&Path> = outcome.failures.iter().map(|f| f.path.as_path()).collect();
    let index = index_for_run(
        &enumeration.root,
        &enumeration.records,
        &failed,
        resolved.index.as_ref(),
    );
    metadata::save(&metadata::index_path(&request.destination), &index)?;

    let files: Vec<PathBuf> = changes
        .records()
        .iter()
        .filter(|r| !failed.contains(r.path.as_path()))
        .map(|r| r.relative_path.clone())
        .collect();
    manifest::write(
        &request.destination,
        &BackupManifest {
            id,
            backup_type: backup_type.to_string(),
            source: source_label.to_path_buf(),
            destination: request.destination.clone(),
            created: Utc::now(),
            total_files: outcome.files_copied,
            total_size: outcome.bytes_copied,
            files_skipped: outcome.files_skipped,
            files,
        },
    )?;

    let status = outcome.status();
    let message = match status {
        OperationStatus::Success => format!(
            "Backup completed: {} files copied, {} skipped",
            outcome.files_copied, outcome.files_skipped
        ),
        OperationStatus::PartialFailure => format!(
            "Backup completed with errors: {} files copied, {} failed",
            outcome.files_copied,
            outcome.failures.len()
        ),
    };
    info!(%id, ?status, copied = outcome.files_copied, skipped = outcome.files_skipped, "backup finished");
    reporter.report(100, &message);

    Ok(BackupReport {
        id,
        status,
        backup_type: backup_type.to_string(),
        destination: request.destination.clone(),
        files_enumerated: enumeration.len(),
        files_selected: changes.len(),
        files_copied: outcome.files_copied,
        files_skipped: outcome.files_skipped,
        bytes_copied: outcome.bytes_copied,
        failures: outcome.failures,
        baseline_missing: resolved.missing,
        baseline_skipped_lines: resolved.skipped_lines,
        message,
    })
}

/// The index this run leaves behind: the current enumeration, except that a
/// file which failed to copy keeps its baseline entry (or none), so the next
/// run selects it again.
fn index_for_run(
    source_root: &Path,
    current: &[FileRecord],
    failed: &HashSet<&Path>,
    baseline: Option<&MetadataIndex>,
) -> MetadataIndex {
    let records = current.iter().filter_map(|record| {
        if failed.contains(record.path.as_path()) {
            baseline.and_then(|b| b.get(&record.path)).cloned()
        } else {
            Some(record.clone())
        }
    });
    MetadataIndex::from_records(source_root, records)
}

fn require_path(path: &Path, what: &str) -> Result<(), EngineError> {
    if path.as_os_str().is_empty() {
        return Err(EngineError::invalid_argument(format!("{} path is empty", what)));
    }
    Ok(())
}

/// Back up a volume through a snapshot.
///
/// The snapshot is created under the job monitor, its file tree is backed up
/// like any other source, and the snapshot is deleted afterwards whether or
/// not the copy succeeded.
pub fn backup_volume<P: SnapshotProvider>(
    volume: &Path,
    destination: &Path,
    provider: &P,
    config: &EngineConfig,
    reporter: &dyn ProgressReporter,
    cancel: &CancelToken,
) -> Result<BackupReport, EngineError> {
    let reporter = MonotonicReporter::new(reporter);
    require_path(volume, "volume").map_err(|e| abort(&reporter, e))?;

    let snapshot = JobMonitor::new(config)
        .in_stage(SNAPSHOT_STAGE)
        .supervise(
            "Snapshot creation",
            || provider.create_snapshot(volume),
            |job| provider.poll_snapshot(job),
            &reporter,
            cancel,
        )
        .map_err(|e| abort(&reporter, e))?;
    info!(id = %snapshot.id, path = %snapshot.path.display(), "snapshot ready");

    let request = BackupRequest::full(&snapshot.path, destination);
    let staged = AFTER_SNAPSHOT_STAGE.scope(&reporter);
    let nested = MonotonicReporter::new(&staged);
    let result = run_file_backup(&request, volume, "Volume", config, &nested, cancel);

    if let Err(e) = provider.delete_snapshot(&snapshot) {
        warn!(id = %snapshot.id, error = %e, "failed to delete snapshot");
    }

    result.map_err(|e| abort(&reporter, e))
}

/// Image a raw device into `destination/disk_<name>.img`.
pub fn backup_device(
    device: &Path,
    name: &str,
    destination: &Path,
    config: &EngineConfig,
    reporter: &dyn ProgressReporter,
    cancel: &CancelToken,
) -> Result<BackupReport, EngineError> {
    let reporter = MonotonicReporter::new(reporter);
    let run = || -> Result<BackupReport, EngineError> {
        require_path(device, "device")?;
        require_path(destination, "destination")?;
        if name.is_empty() {
            return Err(EngineError::invalid_argument("device name is empty"));
        }

        let id = Uuid::new_v4();
        let _lock = DestinationLock::acquire(destination, id)?;
        let file_name = image_file_name(name);
        let outcome = BlockImager::new(config).in_stage(EXTERNAL_STAGE).image(
            ImageDirection::Read,
            device,
            &destination.join(&file_name),
            &reporter,
            cancel,
        )?;

        manifest::write(
            destination,
            &BackupManifest {
                id,
                backup_type: "Disk Image".to_string(),
                source: device.to_path_buf(),
                destination: destination.to_path_buf(),
                created: Utc::now(),
                total_files: 1,
                total_size: outcome.bytes,
                files_skipped: 0,
                files: vec![PathBuf::from(&file_name)],
            },
        )?;

        info!(%id, device = %device.display(), bytes = outcome.bytes, "device backup finished");
        let report = BackupReport::single_object(id, "Disk Image", destination, 1, outcome.bytes);
        reporter.report(100, &report.message);
        Ok(report)
    };
    run().map_err(|e| abort(&reporter, e))
}

/// Export a virtual machine into `destination` through the virtualization
/// manager.
pub fn backup_vm<M: VirtualizationManager>(
    vm_id: &str,
    destination: &Path,
    manager: &M,
    options: &ExportOptions,
    config: &EngineConfig,
    reporter: &dyn ProgressReporter,
    cancel: &CancelToken,
) -> Result<BackupReport, EngineError> {
    let reporter = MonotonicReporter::new(reporter);
    let run = || -> Result<BackupReport, EngineError> {
        if vm_id.is_empty() {
            return Err(EngineError::invalid_argument("VM identifier is empty"));
        }
        require_path(destination, "destination")?;

        let id = Uuid::new_v4();
        let _lock = DestinationLock::acquire(destination, id)?;
        JobMonitor::new(config).in_stage(EXTERNAL_STAGE).supervise(
            "VM export",
            || manager.export_definition(vm_id, destination, options),
            |job| manager.poll(job),
            &reporter,
            cancel,
        )?;

        let exported = enumerate_backup_tree(destination)?;
        manifest::write(
            destination,
            &BackupManifest {
                id,
                backup_type: "Virtual Machine".to_string(),
                source: PathBuf::from(vm_id),
                destination: destination.to_path_buf(),
                created: Utc::now(),
                total_files: exported.len(),
                total_size: exported.total_size,
                files_skipped: 0,
                files: exported.records.iter().map(|r| r.relative_path.clone()).collect(),
            },
        )?;

        info!(%id, vm = vm_id, files = exported.len(), "VM backup finished");
        let report = BackupReport::single_object(
            id,
            "Virtual Machine",
            destination,
            exported.len(),
            exported.total_size,
        );
        reporter.report(100, &report.message);
        Ok(report)
    };
    run().map_err(|e| abort(&reporter, e))
}
