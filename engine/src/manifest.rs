//! Backup manifest (`backup_info.txt`).
//!
//! A human-readable summary written once at the end of every backup:
//!
//! ```text
//! Backup ID: 6f1c...
//! Type: Incremental
//! Source: /home/alice
//! Destination: /mnt/backups/2024-06-01
//! Date: 2024-06-01T09:30:00+00:00
//! Total Files: 3
//! Total Size: 300
//! Files Skipped: 0
//! ---
//! docs/a.txt
//! ```
//!
//! Written as UTF-8. Read back from UTF-8 or UTF-16 (byte order mark
//! detected). Unknown keys and unparseable listing lines are ignored.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;
use uuid::Uuid;

use crate::error::EngineError;
use crate::model::MANIFEST_FILE_NAME;

const SEPARATOR: &str = "---";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupManifest {
    pub id: Uuid,

    /// What was backed up: a backup kind for file backups, or the kind of
    /// object (volume, disk image, virtual machine)
    pub backup_type: String,

    pub source: PathBuf,
    pub destination: PathBuf,
    pub created: DateTime<Utc>,
    pub total_files: usize,
    pub total_size: u64,
    pub files_skipped: usize,

    /// Relative paths of the files this backup contains
    pub files: Vec<PathBuf>,
}

pub fn manifest_path(backup_dir: &Path) -> PathBuf {
    backup_dir.join(MANIFEST_FILE_NAME)
}

/// Write the manifest into `backup_dir`, replacing any previous one atomically.
pub fn write(backup_dir: &Path, manifest: &BackupManifest) -> Result<PathBuf, EngineError> {
    let path = manifest_path(backup_dir);
    let write_err = |e: io::Error| EngineError::DestinationUnusable {
        path: path.clone(),
        source: e,
    };

    let temp = NamedTempFile::new_in(backup_dir).map_err(write_err)?;
    {
        let mut out = BufWriter::new(temp.as_file());
        render(manifest, &mut out).map_err(write_err)?;
        out.flush().map_err(write_err)?;
    }
    temp.as_file().sync_all().map_err(write_err)?;
    temp.persist(&path).map_err(|e| write_err(e.error))?;

    debug!(path = %path.display(), files = manifest.total_files, "manifest written");
    Ok(path)
}

fn render(manifest: &BackupManifest, out: &mut impl Write) -> io::Result<()> {
    writeln!(out, "Backup ID: {}", manifest.id)?;
    writeln!(out, "Type: {}", manifest.backup_type)?;
    writeln!(out, "Source: {}", manifest.source.display())?;
    writeln!(out, "Destination: {}", manifest.destination.display())?;
    writeln!(out, "Date: {}", manifest.created.to_rfc3339())?;
    writeln!(out, "Total Files: {}", manifest.total_files)?;
    writeln!(out, "Total Size: {}", manifest.total_size)?;
    writeln!(out, "Files Skipped: {}", manifest.files_skipped)?;
    writeln!(out, "{}", SEPARATOR)?;
    for file in &manifest.files {
        writeln!(out, "{}", file.display())?;
    }
    Ok(())
}

/// Read the manifest in `backup_dir`.
///
/// # Errors
/// `NotFound` (as `IndexNotFound`) when there is no manifest, `Corrupt` when
/// a required key is missing or unparseable.
pub fn read(backup_dir: &Path) -> Result<BackupManifest, EngineError> {
    let path = manifest_path(backup_dir);
    let bytes = match fs::read(&path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(EngineError::IndexNotFound { path })
        }
        Err(e) => return Err(EngineError::io(&path, e)),
    };
    parse(&decode(&bytes)).map_err(|reason| EngineError::Corrupt { path, reason })
}

/// Decode manifest bytes as UTF-16 LE/BE when a byte order mark says so,
/// UTF-8 otherwise.
fn decode(bytes: &[u8]) -> String {
    match bytes {
        [0xFF, 0xFE, rest @ ..] => decode_utf16(rest, u16::from_le_bytes),
        [0xFE, 0xFF, rest @ ..] => decode_utf16(rest, u16::from_be_bytes),
        [0xEF, 0xBB, 0xBF, rest @ ..] => String::from_utf8_lossy(rest).into_owned(),
        _ => String::from_utf8_lossy(bytes).into_owned(),
    }
}

fn decode_utf16(bytes: &[u8], unit: fn([u8; 2]) -> u16) -> String {
    let units = bytes.chunks_exact(2).map(|pair| unit([pair[0], pair[1]]));
    char::decode_utf16(units)
        .map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect()
}

fn parse(text: &str) -> Result<BackupManifest, String> {
    let mut id = None;
    let mut backup_type = None;
    let mut source = None;
    let mut destination = None;
    let mut created = None;
    let mut total_files = None;
    let mut total_size = None;
    let mut files_skipped = 0usize;

    let mut lines = text.lines();
    for line in lines.by_ref() {
        let line = line.trim();
        if line == SEPARATOR {
            break;
        }
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "Backup ID" => id = Some(Uuid::parse_str(value).map_err(|e| format!("Backup ID: {}", e))?),
            "Type" => backup_type = Some(value.to_string()),
            "Source" => source = Some(PathBuf::from(value)),
            "Destination" => destination = Some(PathBuf::from(value)),
            "Date" => {
                let parsed = DateTime::parse_from_rfc3339(value).map_err(|e| format!("Date: {}", e))?;
                created = Some(parsed.with_timezone(&Utc));
            }
            "Total Files" => total_files = Some(value.parse().map_err(|_| "Total Files is not a number")?),
            "Total Size" => total_size = Some(value.parse().map_err(|_| "Total Size is not a number")?),
            "Files Skipped" => files_skipped = value.parse().unwrap_or(0),
            _ => {}
        }
    }

    let files = lines
        .map(|line| line.trim_end_matches('\r'))
        .take_while(|line| !line.contains('\0'))
        .filter(|line| !line.trim().is_empty())
        .map(PathBuf::from)
        .collect();

    let missing = |key: &str| format!("missing '{}'", key);
    Ok(BackupManifest {
        id: id.ok_or_else(|| missing("Backup ID"))?,
        backup_type: backup_type.ok_or_else(|| missing("Type"))?,
        source: source.ok_or_else(|| missing("Source"))?,
        destination: destination.ok_or_else(|| missing("Destination"))?,
        created: created.ok_or_else(|| missing("Date"))?,
        total_files: total_files.ok_or_else(|| missing("Total Files"))?,
        total_size: total_size.ok_or_else(|| missing("Total Size"))?,
        files_skipped,
        files,
    })
}
