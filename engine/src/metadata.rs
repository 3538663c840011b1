//! Metadata store: the per-file identity index persisted with each backup.
//!
//! On-disk format (UTF-8, one record per line):
//!
//! ```text
//! BACKUP_METADATA_V2|<record count>|<source root>
//! <relative path>|<size>|<time low>|<time high>|<attributes>
//! ...
//! ```
//!
//! Records are split from the right, so a `|` inside a path is preserved.
//! Loading is best effort: a malformed record line is skipped and counted,
//! never fatal. Only an unreadable header makes the file `Corrupt`.
//! Saving writes a temporary file next to the target and renames it into
//! place, so an interrupted save leaves the previous index intact.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::model::{FileRecord, FileTime, METADATA_FILE_NAME};

/// Format tag written on the first line of every index.
pub const FORMAT_TAG: &str = "BACKUP_METADATA_V2";

const DELIMITER: char = '|';

/// Mapping from absolute source path to the file's recorded identity.
///
/// Keys are unique: inserting a record for an existing path replaces it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataIndex {
    source_root: PathBuf,
    records: BTreeMap<PathBuf, FileRecord>,
}

impl MetadataIndex {
    pub fn new(source_root: impl Into<PathBuf>) -> Self {
        MetadataIndex {
            source_root: source_root.into(),
            records: BTreeMap::new(),
        }
    }

    pub fn from_records<I>(source_root: impl Into<PathBuf>, records: I) -> Self
    where
        I: IntoIterator<Item = FileRecord>,
    {
        let mut index = Self::new(source_root);
        for record in records {
            index.insert(record);
        }
        index
    }

    pub fn insert(&mut self, record: FileRecord) -> Option<FileRecord> {
        self.records.insert(record.path.clone(), record)
    }

    pub fn get(&self, path: &Path) -> Option<&FileRecord> {
        self.records.get(path)
    }

    pub fn source_root(&self) -> &Path {
        &self.source_root
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> impl Iterator<Item = &FileRecord> {
        self.records.values()
    }
}

/// Result of a best-effort load.
#[derive(Debug, Clone)]
pub struct LoadedIndex {
    pub index: MetadataIndex,

    /// Record lines that could not be parsed and were dropped
    pub skipped_lines: usize,

    /// The file held fewer lines than its header declared
    pub truncated: bool,
}

/// Location of the index inside a backup directory.
pub fn index_path(backup_dir: &Path) -> PathBuf {
    backup_dir.join(METADATA_FILE_NAME)
}

/// Load an index.
///
/// Fails with `IndexNotFound` when no file exists, which callers doing a
/// full backup treat as "no baseline" rather than an error.
pub fn load(path: &Path) -> Result<LoadedIndex, EngineError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(EngineError::IndexNotFound {
                path: path.to_path_buf(),
            })
        }
        Err(e) => return Err(EngineError::io(path, e)),
    };

    let mut lines = bytes
        .split(|b| *b == b'\n')
        .map(|line| line.strip_suffix(b"\r").unwrap_or(line));

    let header = lines
        .next()
        .and_then(|line| std::str::from_utf8(line).ok())
        .ok_or_else(|| corrupt(path, "missing header"))?;
    let (declared, source_root) = parse_header(header).ok_or_else(|| corrupt(path, "bad header"))?;

    let mut index = MetadataIndex::new(source_root);
    let mut seen = 0usize;
    let mut skipped_lines = 0usize;

    for (line_no, raw) in lines.enumerate() {
        if raw.is_empty() {
            continue;
        }
        seen += 1;
        let parsed = std::str::from_utf8(raw)
            .ok()
            .and_then(|line| parse_record(line, &index.source_root));
        match parsed {
            Some(record) => {
                index.insert(record);
            }
            None => {
                skipped_lines += 1;
                warn!(path = %path.display(), line = line_no + 2, "skipping malformed metadata line");
            }
        }
    }

    let truncated = seen < declared;
    if truncated {
        warn!(
            path = %path.display(),
            declared,
            found = seen,
            "metadata index is shorter than its header declares"
        );
    }
    debug!(path = %path.display(), records = index.len(), skipped_lines, "metadata index loaded");

    Ok(LoadedIndex {
        index,
        skipped_lines,
        truncated,
    })
}

/// Persist an index atomically.
pub fn save(path: &Path, index: &MetadataIndex) -> Result<(), EngineError> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).map_err(|e| EngineError::DestinationUnusable {
        path: parent.to_path_buf(),
        source: e,
    })?;

    let mut lines = Vec::with_capacity(index.len());
    for record in index.records() {
        match format_record(record) {
            Some(line) => lines.push(line),
            None => warn!(
                path = %record.path.display(),
                "path cannot be stored in the metadata index; it will be treated as new next run"
            ),
        }
    }

    let write_err = |e: io::Error| EngineError::DestinationUnusable {
        path: path.to_path_buf(),
        source: e,
    };

    let temp = NamedTempFile::new_in(parent).map_err(write_err)?;
    {
        let mut out = BufWriter::new(temp.as_file());
        writeln!(
            out,
            "{}{}{}{}{}",
            FORMAT_TAG,
            DELIMITER,
            lines.len(),
            DELIMITER,
            index.source_root().display()
        )
        .map_err(write_err)?;
        for line in &lines {
            writeln!(out, "{}", line).map_err(write_err)?;
        }
        out.flush().map_err(write_err)?;
    }
    temp.as_file().sync_all().map_err(write_err)?;
    temp.persist(path).map_err(|e| write_err(e.error))?;

    debug!(path = %path.display(), records = lines.len(), "metadata index saved");
    Ok(())
}

fn corrupt(path: &Path, reason: &str) -> EngineError {
    EngineError::Corrupt {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

fn parse_header(line: &str) -> Option<(usize, PathBuf)> {
    let mut parts = line.splitn(3, DELIMITER);
    if parts.next()? != FORMAT_TAG {
        return None;
    }
    let count = parts.next()?.trim().parse().ok()?;
    let root = PathBuf::from(parts.next().unwrap_or(""));
    Some((count, root))
}

fn parse_record(line: &str, source_root: &Path) -> Option<FileRecord> {
    let mut fields = line.rsplitn(5, DELIMITER);
    let attributes = fields.next()?.trim().parse().ok()?;
    let high = fields.next()?.trim().parse().ok()?;
    let low = fields.next()?.trim().parse().ok()?;
    let size = fields.next()?.trim().parse().ok()?;
    let relative = fields.next()?;
    if relative.is_empty() {
        return None;
    }

    let relative_path = PathBuf::from(relative);
    if relative_path.is_absolute() {
        return None;
    }

    Some(FileRecord {
        path: source_root.join(&relative_path),
        relative_path,
        size,
        modified: FileTime::from_parts(low, high),
        attributes,
    })
}

fn format_record(record: &FileRecord) -> Option<String> {
    let relative = record.relative_path.to_str()?;
    if relative.is_empty() || relative.contains(['\n', '\r']) {
        return None;
    }
    Some(format!(
        "{rel}{d}{size}{d}{low}{d}{high}{d}{attrs}",
        rel = relative,
        size = record.size,
        low = record.modified.low(),
        high = record.modified.high(),
        attrs = record.attributes,
        d = DELIMITER,
    ))
}
