//! Copy engine.
//!
//! Transfers a list of records into a destination tree, one file at a time.
//! Per-file problems are recorded and the loop moves on; only a destination
//! that cannot hold directories, or a cancellation, stops the run.
//!
//! Progress is byte-based: cumulative bytes processed over the total bytes
//! of the set, mapped into the caller's stage band.

use std::io;
use std::path::{Component, Path, PathBuf};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::cancel::CancelToken;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::fs_ops;
use crate::model::{FileRecord, OperationStatus, OverwritePolicy};
use crate::progress::{MonotonicReporter, ProgressReporter, Stage};

/// Why a file was not copied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FailureReason {
    /// Destination already existed under `FailIfExists`
    AlreadyExists,
    /// Source or destination refused access
    PermissionDenied,
    /// Relative path would escape the destination root
    InvalidPath,
    /// Any other I/O failure
    Io,
}

/// A file that was skipped because of an error.
#[derive(Debug, Clone, Serialize)]
pub struct FileFailure {
    pub path: PathBuf,
    pub reason: FailureReason,
    pub message: String,
}

/// Result of one copy run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CopyOutcome {
    pub files_copied: usize,

    /// Every file not copied: collisions, permission problems, I/O errors
    pub files_skipped: usize,

    pub bytes_copied: u64,

    /// The skipped files that count as failures
    pub failures: Vec<FileFailure>,
}

impl CopyOutcome {
    pub fn status(&self) -> OperationStatus {
        if self.failures.is_empty() {
            OperationStatus::Success
        } else {
            OperationStatus::PartialFailure
        }
    }
}

/// Copies records under a destination root with a fixed overwrite policy.
#[derive(Debug, Clone)]
pub struct CopyEngine {
    policy: OverwritePolicy,
    buffer_size: usize,
    progress_interval_bytes: u64,
    stage: Stage,
}

impl CopyEngine {
    pub fn new(policy: OverwritePolicy) -> Self {
        Self::with_config(policy, &EngineConfig::default())
    }

    pub fn with_config(policy: OverwritePolicy, config: &EngineConfig) -> Self {
        CopyEngine {
            policy,
            buffer_size: config.copy_buffer_size,
            progress_interval_bytes: config.progress_interval_bytes.max(1),
            stage: Stage::WHOLE,
        }
    }

    /// Report progress within `stage` instead of the whole 0-100 range.
    pub fn in_stage(mut self, stage: Stage) -> Self {
        self.stage = stage;
        self
    }

    /// Copy every record to `dest_root.join(record.relative_path)`.
    ///
    /// # Errors
    /// `DestinationUnusable` if a destination directory cannot be created,
    /// `Cancelled` if `cancel` is set between two files. Either leaves the
    /// files copied so far in place.
    pub fn run(
        &self,
        records: &[FileRecord],
        dest_root: &Path,
        reporter: &dyn ProgressReporter,
        cancel: &CancelToken,
    ) -> Result<CopyOutcome, EngineError> {
        let reporter = MonotonicReporter::new(reporter);
        let total_files = records.len();
        let mut effective_total: u64 = records.iter().map(|r| r.size).sum();
        let mut processed: u64 = 0;
        let mut outcome = CopyOutcome::default();

        info!(
            files = total_files,
            bytes = effective_total,
            dest = %dest_root.display(),
            policy = %self.policy,
            "copy started"
        );
        reporter.report(
            self.stage.start(),
            &format!("Copying {} files ({})", total_files, format_size(effective_total)),
        );

        if let Err(e) = fs_ops::ensure_dir_exists(dest_root) {
            return Err(abort(&reporter, e));
        }

        for (index, record) in records.iter().enumerate() {
            if let Err(e) = cancel.check("copy") {
                return Err(abort(&reporter, e));
            }

            let dst = match destination_for(dest_root, &record.relative_path) {
                Some(dst) => dst,
                None => {
                    self.record_failure(&mut outcome, record, FailureReason::InvalidPath, "path escapes destination root");
                    processed += record.size;
                    continue;
                }
            };

            if self.policy == OverwritePolicy::SkipIfExists && dst.exists() {
                debug!(path = %dst.display(), "destination exists; skipping");
                outcome.files_skipped += 1;
                effective_total -= record.size;
                continue;
            }

            if let Err(e) = fs_ops::ensure_parent_dir_exists(&dst) {
                return Err(abort(&reporter, e));
            }

            let file_start = processed;
            let mut since_report = 0u64;
            let mut in_file = 0u64;
            let result = fs_ops::copy_file_with_metadata(
                record,
                &dst,
                self.policy,
                self.buffer_size,
                &mut |n| {
                    in_file += n;
                    since_report += n;
                    if since_report >= self.progress_interval_bytes {
                        since_report = 0;
                        let done = file_start + in_file.min(record.size);
                        reporter.report(
                            self.stage.percent(done, effective_total),
                            &format!("Copying {}", record.relative_path.display()),
                        );
                    }
                },
            );

            match result {
                Ok(bytes) => {
                    debug!(path = %record.path.display(), bytes, "file copied");
                    outcome.files_copied += 1;
                    outcome.bytes_copied += bytes;
                    processed = file_start + record.size;
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    // SkipIfExists lands here only if the file appeared after the check above.
                    effective_total -= record.size;
                    if self.policy == OverwritePolicy::FailIfExists {
                        self.record_failure(
                            &mut outcome,
                            record,
                            FailureReason::AlreadyExists,
                            "destination already exists",
                        );
                    } else {
                        outcome.files_skipped += 1;
                    }
                }
                Err(e) => {
                    let reason = if e.kind() == io::ErrorKind::PermissionDenied {
                        FailureReason::PermissionDenied
                    } else {
                        FailureReason::Io
                    };
                    self.record_failure(&mut outcome, record, reason, &e.to_string());
                    processed = file_start + record.size;
                }
            }

            reporter.report(
                self.stage.percent(processed, effective_total),
                &format!("Processed {} of {} files", index + 1, total_files),
            );
        }

        info!(
            copied = outcome.files_copied,
            skipped = outcome.files_skipped,
            failed = outcome.failures.len(),
            bytes = outcome.bytes_copied,
            "copy finished"
        );
        reporter.report(
            self.stage.end(),
            &format!(
                "Copied {} files, skipped {}",
                outcome.files_copied, outcome.files_skipped
            ),
        );
        Ok(outcome)
    }

    fn record_failure(
        &self,
        outcome: &mut CopyOutcome,
        record: &FileRecord,
        reason: FailureReason,
        message: &str,
    ) {
        warn!(path = %record.path.display(), ?reason, message, "file skipped");
        outcome.files_skipped += 1;
        outcome.failures.push(FileFailure {
            path: record.path.clone(),
            reason,
            message: message.to_string(),
        });
    }
}

/// Re-root `relative` under `dest_root`, refusing paths that would leave it.
fn destination_for(dest_root: &Path, relative: &Path) -> Option<PathBuf> {
    let mut has_name = false;
    for component in relative.components() {
        match component {
            Component::Normal(_) => has_name = true,
            Component::CurDir => {}
            _ => return None,
        }
    }
    has_name.then(|| dest_root.join(relative))
}

/// Report the failure context on the reporter's current percentage, then hand the error back.
pub(crate) fn abort(reporter: &MonotonicReporter<'_>, err: EngineError) -> EngineError {
    error!(error = %err, "operation aborted");
    reporter.report(reporter.last(), &format!("Aborted: {}", err));
    err
}

/// Human-readable size for progress messages and listings.
pub fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{} KB", bytes / 1024)
    } else {
        format!("{} MB", bytes / (1024 * 1024))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enumerate::enumerate;
    use crate::error::ErrorKind;
    use crate::progress::testing::RecordingReporter;
    use crate::progress::NullReporter;
    use std::fs;

    fn make_source(root: &Path) {
        fs::create_dir_all(root.join("nested")).expect("Failed to create src");
        fs::write(root.join("a.txt"), vec![b'a'; 100]).expect("Failed to write a");
        fs::write(root.join("b.txt"), vec![b'b'; 50]).expect("Failed to write b");
        fs::write(root.join("nested").join("c.txt"), vec![b'c'; 150]).expect("Failed to write c");
    }

    #[test]
    fn test_copies_tree_and_reports_monotonic_progress() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("src");
        let dst = temp_dir.path().join("dst");
        make_source(&src);
        let found = enumerate(&src).expect("Failed to enumerate");

        let recorder = RecordingReporter::new();
        let outcome = CopyEngine::new(OverwritePolicy::Overwrite)
            .run(&found.records, &dst, &recorder, &CancelToken::new())
            .expect("Copy failed");

        assert_eq!(outcome.files_copied, 3);
        assert_eq!(outcome.files_skipped, 0);
        assert_eq!(outcome.bytes_copied, 300);
        assert_eq!(outcome.status(), OperationStatus::Success);
        assert_eq!(
            fs::read(dst.join("nested").join("c.txt")).expect("read c"),
            vec![b'c'; 150]
        );

        recorder.assert_monotonic();
        assert_eq!(recorder.percentages().first(), Some(&0));
        assert_eq!(recorder.percentages().last(), Some(&100));
    }

    #[test]
    fn test_fail_if_exists_skips_collision_and_continues() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("src");
        let dst = temp_dir.path().join("dst");
        make_source(&src);
        fs::create_dir_all(&dst).expect("Failed to create dst");
        fs::write(dst.join("b.txt"), b"existing").expect("Failed to write existing");
        let found = enumerate(&src).expect("Failed to enumerate");

        let recorder = RecordingReporter::new();
        let outcome = CopyEngine::new(OverwritePolicy::FailIfExists)
            .run(&found.records, &dst, &recorder, &CancelToken::new())
            .expect("Collision must not be fatal");

        assert_eq!(outcome.files_copied, 2);
        assert_eq!(outcome.files_skipped, 1);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].reason, FailureReason::AlreadyExists);
        assert_eq!(outcome.status(), OperationStatus::PartialFailure);
        assert_eq!(fs::read_to_string(dst.join("b.txt")).expect("read b"), "existing");
        recorder.assert_monotonic();
        assert_eq!(recorder.percentages().last(), Some(&100));
    }

    #[test]
    fn test_skip_if_exists_is_not_a_failure() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("src");
        let dst = temp_dir.path().join("dst");
        make_source(&src);
        fs::create_dir_all(&dst).expect("Failed to create dst");
        fs::write(dst.join("a.txt"), b"keep").expect("Failed to write existing");
        let found = enumerate(&src).expect("Failed to enumerate");

        let outcome = CopyEngine::new(OverwritePolicy::SkipIfExists)
            .run(&found.records, &dst, &NullReporter, &CancelToken::new())
            .expect("Copy failed");

        assert_eq!(outcome.files_copied, 2);
        assert_eq!(outcome.files_skipped, 1);
        assert!(outcome.failures.is_empty());
        assert_eq!(outcome.status(), OperationStatus::Success);
        assert_eq!(fs::read_to_string(dst.join("a.txt")).expect("read a"), "keep");
    }

    #[test]
    fn test_vanished_source_is_recorded_and_skipped() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("src");
        let dst = temp_dir.path().join("dst");
        make_source(&src);
        let found = enumerate(&src).expect("Failed to enumerate");
        fs::remove_file(src.join("a.txt")).expect("Failed to remove a");

        let recorder = RecordingReporter::new();
        let outcome = CopyEngine::new(OverwritePolicy::Overwrite)
            .run(&found.records, &dst, &recorder, &CancelToken::new())
            .expect("One bad file must not abort the copy");

        assert_eq!(outcome.files_copied, 2);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].reason, FailureReason::Io);
        assert!(dst.join("b.txt").exists());
        assert_eq!(recorder.percentages().last(), Some(&100));
    }

    #[test]
    #[cfg(unix)]
    fn test_unreadable_source_is_permission_denied_and_skipped() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("src");
        let dst = temp_dir.path().join("dst");
        make_source(&src);
        let found = enumerate(&src).expect("Failed to enumerate");
        let locked = src.join("a.txt");
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).expect("chmod");

        // Running as root can still read the file.
        if fs::File::open(&locked).is_ok() {
            fs::set_permissions(&locked, fs::Permissions::from_mode(0o644)).expect("chmod");
            return;
        }

        let recorder = RecordingReporter::new();
        let result = CopyEngine::new(OverwritePolicy::Overwrite)
            .run(&found.records, &dst, &recorder, &CancelToken::new());
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o644)).expect("chmod");

        let outcome = result.expect("A permission error must not abort the copy");
        assert_eq!(outcome.files_copied, 2);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].path, locked);
        assert_eq!(outcome.failures[0].reason, FailureReason::PermissionDenied);
        assert_eq!(outcome.status(), OperationStatus::PartialFailure);
        assert!(dst.join("b.txt").exists());
        assert!(dst.join("nested").join("c.txt").exists());
        recorder.assert_monotonic();
        assert_eq!(recorder.percentages().last(), Some(&100));
    }

    #[test]
    fn test_unusable_destination_is_fatal() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("src");
        make_source(&src);
        let blocker = temp_dir.path().join("blocker");
        fs::write(&blocker, b"x").expect("Failed to write blocker");
        let found = enumerate(&src).expect("Failed to enumerate");

        let recorder = RecordingReporter::new();
        let err = CopyEngine::new(OverwritePolicy::Overwrite)
            .run(&found.records, &blocker, &recorder, &CancelToken::new())
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::DestinationUnusable);
        let (_, last_message) = recorder.events().last().cloned().expect("events");
        assert!(last_message.starts_with("Aborted"));
    }

    #[test]
    fn test_cancel_stops_between_files() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("src");
        let dst = temp_dir.path().join("dst");
        make_source(&src);
        let found = enumerate(&src).expect("Failed to enumerate");

        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        let reporter = move |_pct: u8, msg: &str| {
            if msg.starts_with("Processed 1 of") {
                trigger.cancel();
            }
        };

        let err = CopyEngine::new(OverwritePolicy::Overwrite)
            .run(&found.records, &dst, &reporter, &cancel)
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Cancelled);
        let copied = enumerate(&dst).expect("Failed to enumerate dst");
        assert_eq!(copied.len(), 1, "exactly one file finished before cancellation");
    }

    #[test]
    fn test_intra_file_progress_is_reported() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("src");
        let dst = temp_dir.path().join("dst");
        fs::create_dir_all(&src).expect("Failed to create src");
        fs::write(src.join("big.bin"), vec![7u8; 1000]).expect("Failed to write big");
        let found = enumerate(&src).expect("Failed to enumerate");

        let config = EngineConfig {
            copy_buffer_size: 100,
            progress_interval_bytes: 250,
            ..EngineConfig::default()
        };
        let recorder = RecordingReporter::new();
        CopyEngine::with_config(OverwritePolicy::Overwrite, &config)
            .in_stage(Stage::new(10, 80))
            .run(&found.records, &dst, &recorder, &CancelToken::new())
            .expect("Copy failed");

        let pcts = recorder.percentages();
        // 300 of 1000 bytes in a 10..90 band
        assert!(pcts.contains(&34), "expected an intra-file update: {:?}", pcts);
        assert_eq!(pcts.first(), Some(&10));
        assert_eq!(pcts.last(), Some(&90));
        recorder.assert_monotonic();
    }

    #[test]
    fn test_destination_for_rejects_escaping_paths() {
        let root = Path::new("/dst");
        assert_eq!(destination_for(root, Path::new("a/b")), Some(root.join("a/b")));
        assert_eq!(destination_for(root, Path::new("../x")), None);
        assert_eq!(destination_for(root, Path::new("")), None);
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(10), "10 B");
        assert_eq!(format_size(2048), "2 KB");
        assert_eq!(format_size(5 * 1024 * 1024), "5 MB");
    }
}
