//! Block imager.
//!
//! Streams a raw device to an image file, or an image file back to a device,
//! in fixed-size chunks. Any short read or write aborts the whole operation:
//! raw images have no partial-success mode.

use std::ffi::OsStr;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::cancel::CancelToken;
use crate::config::{EngineConfig, MIN_BLOCK_CHUNK_SIZE};
use crate::copy::{abort, format_size};
use crate::error::EngineError;
use crate::fs_ops;
use crate::progress::{MonotonicReporter, ProgressReporter, Stage};

/// Which way the bytes flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageDirection {
    /// Device to image file (backup)
    Read,
    /// Image file to device (restore)
    Write,
}

/// Bytes moved by a completed imaging run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageOutcome {
    pub bytes: u64,
    pub chunks: u64,
}

/// Image file name for a device label: `disk_<name>.img`.
pub fn image_file_name(name: &str) -> String {
    format!("disk_{}.img", name)
}

/// Find the image for `name` in `dir`, falling back to the first `.img` file
/// in name order.
pub fn locate_image(dir: &Path, name: &str) -> Result<PathBuf, EngineError> {
    let preferred = dir.join(image_file_name(name));
    if preferred.is_file() {
        return Ok(preferred);
    }

    let entries = fs::read_dir(dir).map_err(|e| EngineError::io(dir, e))?;
    let mut candidates: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && p.extension() == Some(OsStr::new("img")))
        .collect();
    candidates.sort();

    candidates.into_iter().next().ok_or_else(|| EngineError::SourceNotFound {
        path: preferred,
    })
}

/// Copies between a block device and an image file.
#[derive(Debug, Clone)]
pub struct BlockImager {
    chunk_size: usize,
    stage: Stage,
}

impl BlockImager {
    pub fn new(config: &EngineConfig) -> Self {
        BlockImager {
            chunk_size: config.block_chunk_size.max(MIN_BLOCK_CHUNK_SIZE),
            stage: Stage::WHOLE,
        }
    }

    /// Use an explicit chunk size. Values below 64 KiB are raised to it.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(MIN_BLOCK_CHUNK_SIZE);
        self
    }

    pub fn in_stage(mut self, stage: Stage) -> Self {
        self.stage = stage;
        self
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Image `device_path` to or from `image_path`.
    ///
    /// The byte total is the device size when reading and the image size
    /// when writing. Cancellation is checked between chunks only.
    ///
    /// # Errors
    /// `Device` on any open, short read, short write or sync failure;
    /// `Cancelled` if `cancel` is set between two chunks.
    pub fn image(
        &self,
        direction: ImageDirection,
        device_path: &Path,
        image_path: &Path,
        reporter: &dyn ProgressReporter,
        cancel: &CancelToken,
    ) -> Result<ImageOutcome, EngineError> {
        let reporter = MonotonicReporter::new(reporter);
        match self.transfer(direction, device_path, image_path, &reporter, cancel) {
            Ok(outcome) => Ok(outcome),
            Err(e) => Err(abort(&reporter, e)),
        }
    }

    fn transfer(
        &self,
        direction: ImageDirection,
        device_path: &Path,
        image_path: &Path,
        reporter: &MonotonicReporter<'_>,
        cancel: &CancelToken,
    ) -> Result<ImageOutcome, EngineError> {
        let (src_path, dst_path) = match direction {
            ImageDirection::Read => (device_path, image_path),
            ImageDirection::Write => (image_path, device_path),
        };

        let mut src = File::open(src_path).map_err(|e| device_error(src_path, "cannot open for reading", e))?;
        let total = stream_len(&mut src).map_err(|e| device_error(src_path, "cannot determine size", e))?;

        let mut dst = match direction {
            ImageDirection::Read => {
                fs_ops::ensure_parent_dir_exists(dst_path)?;
                OpenOptions::new().write(true).create(true).truncate(true).open(dst_path)
            }
            // Devices are written in place; never truncate or create them.
            ImageDirection::Write => OpenOptions::new().write(true).open(dst_path),
        }
        .map_err(|e| device_error(dst_path, "cannot open for writing", e))?;

        info!(
            ?direction,
            from = %src_path.display(),
            to = %dst_path.display(),
            bytes = total,
            chunk = self.chunk_size,
            "imaging started"
        );
        reporter.report(
            self.stage.start(),
            &format!("Imaging {} from {}", format_size(total), src_path.display()),
        );

        let mut buffer = vec![0u8; self.chunk_size];
        let mut transferred = 0u64;
        let mut chunks = 0u64;

        while transferred < total {
            cancel.check("block imaging")?;

            let want = (total - transferred).min(self.chunk_size as u64) as usize;
            let chunk = &mut buffer[..want];
            read_chunk(&mut src, chunk)
                .map_err(|e| device_error(src_path, &format!("read failed at offset {}", transferred), e))?;
            dst.write_all(chunk)
                .map_err(|e| device_error(dst_path, &format!("write failed at offset {}", transferred), e))?;

            transferred += want as u64;
            chunks += 1;
            reporter.report(
                self.stage.percent(transferred, total),
                &format!("Imaged {} of {}", format_size(transferred), format_size(total)),
            );
        }

        dst.flush()
            .and_then(|_| dst.sync_all())
            .map_err(|e| device_error(dst_path, "flush failed", e))?;

        debug!(bytes = transferred, chunks, "imaging finished");
        reporter.report(self.stage.end(), "Imaging complete");
        Ok(ImageOutcome {
            bytes: transferred,
            chunks,
        })
    }
}

/// Size of a file or device, found by seeking to its end.
fn stream_len(file: &mut File) -> io::Result<u64> {
    let len = file.seek(SeekFrom::End(0))?;
    file.seek(SeekFrom::Start(0))?;
    Ok(len)
}

/// Fill `buf` completely; an early end of stream is a short read.
fn read_chunk(src: &mut File, buf: &mut [u8]) -> io::Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        match src.read(&mut buf[filled..]) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("short read: {} of {} bytes", filled, buf.len()),
                ))
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn device_error(path: &Path, reason: &str, source: io::Error) -> EngineError {
    EngineError::Device {
        path: path.to_path_buf(),
        reason: reason.to_string(),
        source: Some(source),
    }
}
