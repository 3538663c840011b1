//! Restore operations.
//!
//! The inverse of `backup`: a backup tree is copied back onto a target, a
//! disk image is written back onto a device, an exported VM is imported, or
//! an external system-state tool is run under the job monitor.

use serde::Serialize;
use std::collections::HashSet;
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use uuid::Uuid;

use crate::block::{locate_image, BlockImager, ImageDirection, ImageOutcome};
use crate::cancel::CancelToken;
use crate::config::EngineConfig;
use crate::copy::{abort, CopyEngine, FailureReason, FileFailure};
use crate::enumerate::enumerate_backup_tree;
use crate::error::EngineError;
use crate::external::{ImportOptions, SystemStateTool, ToolProcess, VirtualizationManager};
use crate::lock::DestinationLock;
use crate::model::{OperationStatus, OverwritePolicy};
use crate::monitor::{JobMonitor, Submission};
use crate::progress::{MonotonicReporter, ProgressReporter, Stage};

const COPY_STAGE: Stage = Stage::new(5, 85);
const CHECK_STAGE: Stage = Stage::new(90, 10);
const IMPORT_STAGE: Stage = Stage::new(0, 90);
const TOOL_STAGE: Stage = Stage::new(10, 85);

/// Summary of a completed file restore.
#[derive(Debug, Clone, Serialize)]
pub struct RestoreReport {
    pub id: Uuid,
    pub status: OperationStatus,
    pub target: PathBuf,
    pub files_restored: usize,
    pub files_skipped: usize,
    pub bytes_restored: u64,
    pub failures: Vec<FileFailure>,
    pub message: String,
}

/// Copy the files of `backup_dir` onto `target`.
///
/// The engine's own files are not restored. After the copy every restored
/// file is opened once more; one that cannot be is recorded as a failure.
pub fn restore_files(
    backup_dir: &Path,
    target: &Path,
    policy: OverwritePolicy,
    config: &EngineConfig,
    reporter: &dyn ProgressReporter,
    cancel: &CancelToken,
) -> Result<RestoreReport, EngineError> {
    let reporter = MonotonicReporter::new(reporter);
    let run = || -> Result<RestoreReport, EngineError> {
        if target.as_os_str().is_empty() {
            return Err(EngineError::invalid_argument("restore target is empty"));
        }
        reporter.report(0, "Reading backup contents");
        let contents = enumerate_backup_tree(backup_dir)?;

        let id = Uuid::new_v4();
        let _lock = DestinationLock::acquire(target, id)?;
        info!(%id, backup = %contents.root.display(), target = %target.display(), files = contents.len(), "restore started");

        let mut outcome = CopyEngine::with_config(policy, config)
            .in_stage(COPY_STAGE)
            .run(&contents.records, target, &reporter, cancel)?;

        // Read-back presence check over what the copy reported as restored.
        reporter.report(CHECK_STAGE.start(), "Checking restored files");
        let already_failed: HashSet<PathBuf> = outcome.failures.iter().map(|f| f.path.clone()).collect();
        let total = contents.len() as u64;
        for (checked, record) in contents.records.iter().enumerate() {
            if already_failed.contains(&record.path) {
                continue;
            }
            let restored = target.join(&record.relative_path);
            if let Err(e) = File::open(&restored) {
                warn!(path = %restored.display(), error = %e, "restored file cannot be read back");
                outcome.files_copied = outcome.files_copied.saturating_sub(1);
                outcome.files_skipped += 1;
                outcome.failures.push(FileFailure {
                    path: record.path.clone(),
                    reason: FailureReason::Io,
                    message: format!("not readable after restore: {}", e),
                });
            }
            reporter.report(CHECK_STAGE.percent(checked as u64 + 1, total), "Checking restored files");
        }

        let status = outcome.status();
        let message = match status {
            OperationStatus::Success => format!(
                "Restore completed: {} files restored, {} skipped",
                outcome.files_copied, outcome.files_skipped
            ),
            OperationStatus::PartialFailure => format!(
                "Restore completed with errors: {} files restored, {} failed",
                outcome.files_copied,
                outcome.failures.len()
            ),
        };
        info!(%id, ?status, restored = outcome.files_copied, "restore finished");
        reporter.report(100, &message);

        Ok(RestoreReport {
            id,
            status,
            target: target.to_path_buf(),
            files_restored: outcome.files_copied,
            files_skipped: outcome.files_skipped,
            bytes_restored: outcome.bytes_copied,
            failures: outcome.failures,
            message,
        })
    };
    run().map_err(|e| abort(&reporter, e))
}

/// Write the image for `name` in `backup_dir` back onto `device`.
///
/// Uses `disk_<name>.img` when present, otherwise the first `.img` file.
pub fn restore_device(
    backup_dir: &Path,
    name: &str,
    device: &Path,
    config: &EngineConfig,
    reporter: &dyn ProgressReporter,
    cancel: &CancelToken,
) -> Result<ImageOutcome, EngineError> {
    let image = match locate_image(backup_dir, name) {
        Ok(image) => image,
        Err(e) => return Err(abort(&MonotonicReporter::new(reporter), e)),
    };
    info!(image = %image.display(), device = %device.display(), "device restore started");
    BlockImager::new(config).image(ImageDirection::Write, device, &image, reporter, cancel)
}

/// Import the VM exported in `backup_dir`, then start it when `start_vm`
/// names it.
pub fn restore_vm<M: VirtualizationManager>(
    backup_dir: &Path,
    manager: &M,
    options: &ImportOptions,
    start_vm: Option<&str>,
    config: &EngineConfig,
    reporter: &dyn ProgressReporter,
    cancel: &CancelToken,
) -> Result<(), EngineError> {
    let reporter = MonotonicReporter::new(reporter);
    let run = || -> Result<(), EngineError> {
        if !backup_dir.is_dir() {
            return Err(EngineError::SourceNotFound {
                path: backup_dir.to_path_buf(),
            });
        }
        JobMonitor::new(config).in_stage(IMPORT_STAGE).supervise(
            "VM import",
            || manager.import_definition(backup_dir, options),
            |job| manager.poll(job),
            &reporter,
            cancel,
        )?;

        if let Some(vm_id) = start_vm {
            reporter.report(IMPORT_STAGE.end(), &format!("Starting {}", vm_id));
            manager.start(vm_id)?;
        }
        info!(backup = %backup_dir.display(), started = start_vm.is_some(), "VM restore finished");
        reporter.report(100, "VM restore completed");
        Ok(())
    };
    run().map_err(|e| abort(&reporter, e))
}

/// Run an external system-state restore tool to completion.
///
/// Exit code 0 completes the restore; any other code fails it with that
/// code. Percentages the tool prints are used as progress hints, and a
/// cancel request kills the process.
pub fn restore_system_state(
    tool: &SystemStateTool,
    config: &EngineConfig,
    reporter: &dyn ProgressReporter,
    cancel: &CancelToken,
) -> Result<(), EngineError> {
    let reporter = MonotonicReporter::new(reporter);
    reporter.report(0, "Preparing system state restore");

    JobMonitor::new(config)
        .in_stage(TOOL_STAGE)
        .supervise_with_cancel_hook(
            "System state restore",
            || tool.spawn().map(Submission::Pending),
            |process: &ToolProcess| process.poll(),
            |process: &ToolProcess| process.kill(),
            &reporter,
            cancel,
        )
        .map_err(|e| abort(&reporter, e))?;

    info!(program = %tool.program().to_string_lossy(), "system state restore finished");
    reporter.report(100, "System state restore completed");
    Ok(())
}
