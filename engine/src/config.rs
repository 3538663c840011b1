//! Engine configuration.
//!
//! Loaded from a TOML file; every field has a default so a partial file (or
//! none at all) is valid.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::EngineError;

/// Smallest chunk the block imager will accept.
pub const MIN_BLOCK_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Buffer size for per-file copies (default: 64 KiB)
    #[serde(default = "default_copy_buffer_size")]
    pub copy_buffer_size: usize,

    /// Chunk size for raw device imaging (default: 1 MiB)
    #[serde(default = "default_block_chunk_size")]
    pub block_chunk_size: usize,

    /// Bytes between progress updates while copying a single large file
    #[serde(default = "default_progress_interval_bytes")]
    pub progress_interval_bytes: u64,

    /// Delay between polls of an external job
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Give up supervising an external job after this long (None = never)
    #[serde(default)]
    pub job_deadline_secs: Option<u64>,

    /// First heartbeat percentage reported while a job runs
    #[serde(default = "default_heartbeat_start")]
    pub heartbeat_start: u8,

    /// Heartbeat increment per poll when the job reports no percentage
    #[serde(default = "default_heartbeat_step")]
    pub heartbeat_step: u8,

    /// Heartbeat never climbs past this value before the job completes
    #[serde(default = "default_heartbeat_ceiling")]
    pub heartbeat_ceiling: u8,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_copy_buffer_size() -> usize {
    64 * 1024
}

fn default_block_chunk_size() -> usize {
    1024 * 1024
}

fn default_progress_interval_bytes() -> u64 {
    4 * 1024 * 1024
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_heartbeat_start() -> u8 {
    40
}

fn default_heartbeat_step() -> u8 {
    10
}

fn default_heartbeat_ceiling() -> u8 {
    95
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            copy_buffer_size: default_copy_buffer_size(),
            block_chunk_size: default_block_chunk_size(),
            progress_interval_bytes: default_progress_interval_bytes(),
            poll_interval_ms: default_poll_interval_ms(),
            job_deadline_secs: None,
            heartbeat_start: default_heartbeat_start(),
            heartbeat_step: default_heartbeat_step(),
            heartbeat_ceiling: default_heartbeat_ceiling(),
            log_level: default_log_level(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, EngineError> {
        let content = std::fs::read_to_string(path).map_err(|e| EngineError::io(path, e))?;
        let config = Self::from_toml(&content).map_err(|e| match e {
            EngineError::InvalidArgument { message } => EngineError::Corrupt {
                path: path.to_path_buf(),
                reason: message,
            },
            other => other,
        })?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, EngineError> {
        let config: EngineConfig = toml::from_str(content)
            .map_err(|e| EngineError::invalid_argument(format!("configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.copy_buffer_size == 0 {
            return Err(EngineError::invalid_argument("copy_buffer_size must be non-zero"));
        }
        if self.block_chunk_size < MIN_BLOCK_CHUNK_SIZE {
            return Err(EngineError::invalid_argument(format!(
                "block_chunk_size must be at least {} bytes",
                MIN_BLOCK_CHUNK_SIZE
            )));
        }
        if self.heartbeat_ceiling > 100 || self.heartbeat_start > self.heartbeat_ceiling {
            return Err(EngineError::invalid_argument(
                "heartbeat_start must not exceed heartbeat_ceiling (max 100)",
            ));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn job_deadline(&self) -> Option<Duration> {
        self.job_deadline_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().expect("default config should validate");
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.job_deadline(), None);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config = EngineConfig::from_toml("poll_interval_ms = 250\njob_deadline_secs = 60\n")
            .expect("Failed to parse config");
        assert_eq!(config.poll_interval_ms, 250);
        assert_eq!(config.job_deadline(), Some(Duration::from_secs(60)));
        assert_eq!(config.block_chunk_size, 1024 * 1024);
    }

    #[test]
    fn test_rejects_small_block_chunk() {
        let err = EngineConfig::from_toml("block_chunk_size = 4096\n").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_from_file_reports_bad_content_as_corrupt() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("engine.toml");
        std::fs::write(&path, "copy_buffer_size = \"lots\"\n").expect("Failed to write config");

        let err = EngineConfig::from_file(&path).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Corrupt);
    }
}
