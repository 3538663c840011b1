//! # Backup Engine - Backup/Restore Orchestration Library
//!
//! A headless engine that backs up and restores file trees, raw block
//! devices and externally managed virtual machines.
//! Designed as the foundation for multiple front ends (CLI, GUI, services).
//!
//! ## Overview
//!
//! The engine provides:
//! - Full, incremental and differential file backups driven by a persisted
//!   per-file metadata index
//! - Byte-weighted progress reporting via callbacks, never decreasing
//! - Per-file error isolation: one unreadable file never aborts a backup
//! - Raw device imaging in fixed-size chunks
//! - Supervision of long-running external jobs (snapshots, VM export/import,
//!   system-state tools) through one poll loop
//!
//! ## Basic Usage
//!
//! ```no_run
//! use backup_engine::{backup_files, BackupRequest, CancelToken, EngineConfig, NullReporter};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = EngineConfig::default();
//!
//! // Full backup
//! let full = backup_files(
//!     &BackupRequest::full("/data", "/backups/full"),
//!     &config,
//!     &|pct: u8, msg: &str| println!("{:3}% {}", pct, msg),
//!     &CancelToken::new(),
//! )?;
//! println!("{}", full.message);
//!
//! // Incremental backup against the full one
//! let incr = backup_files(
//!     &BackupRequest::incremental("/data", "/backups/incr-1", "/backups/full"),
//!     &config,
//!     &NullReporter,
//!     &CancelToken::new(),
//! )?;
//! println!("{} changed files copied", incr.files_copied);
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - **model**: Core data structures (FileRecord, FileTime, policies)
//! - **error**: Error types and classification
//! - **progress**: Progress reporter trait and percentage aggregation
//! - **config**: Engine configuration (TOML)
//! - **metadata**: Persisted per-file index
//! - **enumerate** / **changes** / **copy**: The file backup pipeline
//! - **block**: Raw device imaging
//! - **monitor** / **external**: Supervision of external jobs
//! - **manifest** / **inspect**: Backup summaries and read-only queries
//! - **backup** / **restore**: Top-level operations

pub mod backup;
pub mod block;
pub mod cancel;
pub mod changes;
pub mod config;
pub mod copy;
pub mod enumerate;
pub mod error;
pub mod external;
pub mod fs_ops;
pub mod inspect;
pub mod lock;
pub mod logging;
pub mod manifest;
pub mod metadata;
pub mod model;
pub mod monitor;
pub mod progress;
pub mod restore;

// Re-export main types and functions
pub use backup::{backup_device, backup_files, backup_volume, backup_vm, BackupReport, BackupRequest};
pub use block::{BlockImager, ImageDirection, ImageOutcome};
pub use cancel::CancelToken;
pub use changes::{select_changes, Baseline, ChangeSet};
pub use config::EngineConfig;
pub use copy::{CopyEngine, CopyOutcome, FailureReason, FileFailure};
pub use enumerate::{enumerate, Enumeration};
pub use error::{EngineError, ErrorKind};
pub use external::{
    ExportOptions, ImportOptions, Snapshot, SnapshotProvider, SystemStateTool, VirtualizationManager,
};
pub use inspect::{backup_info, list_contents, verify_backup, BackupInfo, ContentEntry, VerifyReport};
pub use manifest::BackupManifest;
pub use metadata::MetadataIndex;
pub use model::{BackupKind, FileRecord, FileTime, OperationStatus, OverwritePolicy};
pub use monitor::{ExternalFailure, JobMonitor, JobPoll, JobState, Submission};
pub use progress::{NullReporter, ProgressReporter};
pub use restore::{restore_device, restore_files, restore_system_state, restore_vm, RestoreReport};
