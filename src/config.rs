//! Configuration for AtlasLog
//!
//! Centralized configuration with sensible defaults.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{AtlasError, Result};
use crate::log::{header_size, IoMode};
use crate::lsn::{MAX_BLOCK_SIZE, MIN_BLOCK_SIZE};

/// Smallest log file (header included) the engine will create or resize to
pub const MIN_LOG_FILE_SIZE: u64 = 64 * 1024;

/// Main configuration for an AtlasLog instance
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Directory holding the live log file
    /// Internal structure:
    ///   {log_dir}/
    ///     ├── ib_logfile0      (circular redo log)
    ///     ├── ib_logfile101    (resize target, only while resizing)
    ///     └── archive/         (default archive directory)
    pub log_dir: PathBuf,

    /// Total size of the log file in bytes, header included
    pub log_file_size: u64,

    /// Size of each of the two in-memory buffer areas
    pub log_buffer_size: usize,

    /// Log block size (power of two, 512..=4096)
    pub block_size: usize,

    /// Memory-mapped I/O selection
    pub io_mode: IoMode,

    // -------------------------------------------------------------------------
    // Checkpoint Configuration
    // -------------------------------------------------------------------------
    /// `max_checkpoint_age = margin - margin / ratio`
    pub checkpoint_margin_ratio: u64,

    /// `max_modified_age_async = max_checkpoint_age - max_checkpoint_age / ratio`
    pub checkpoint_async_ratio: u64,

    /// Bytes kept free at the end of the circular body.
    /// `None` uses two buffer areas plus four blocks.
    pub checkpoint_reserve: Option<u64>,

    /// Background flush period in milliseconds (0 disables the flusher thread)
    pub flush_interval_ms: u64,

    // -------------------------------------------------------------------------
    // Archive Configuration
    // -------------------------------------------------------------------------
    /// Archive directory. `None` means `{log_dir}/archive`
    pub archive_dir: Option<PathBuf>,

    /// Most bytes the archiver copies per step
    pub archive_chunk_size: usize,

    /// How long the writer waits for a lagging archiver before aborting archiving
    pub archiver_wait_timeout_ms: u64,

    // -------------------------------------------------------------------------
    // Encryption
    // -------------------------------------------------------------------------
    /// Encrypt log block bodies (requires a key-management collaborator)
    pub encryption: bool,

    // -------------------------------------------------------------------------
    // Waits and Failure Handling
    // -------------------------------------------------------------------------
    /// Upper bound for any caller-facing wait (group commit followers, archive stop)
    pub wait_timeout_ms: u64,

    /// Period of the "still waiting" diagnostics emitted by long waits
    pub alert_interval_ms: u64,

    /// What to do with a fatal log I/O failure
    pub fatal_policy: FatalPolicy,
}

/// Escalation of fatal errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FatalPolicy {
    /// Log and abort the process (production behavior)
    #[default]
    Abort,

    /// Return the fatal error to the caller (embedding and tests)
    Propagate,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("./atlaslog_data"),
            log_file_size: 96 * 1024 * 1024, // 96 MB
            log_buffer_size: 2 * 1024 * 1024, // 2 MB
            block_size: 512,
            io_mode: IoMode::Normal,
            checkpoint_margin_ratio: 10,
            checkpoint_async_ratio: 8,
            checkpoint_reserve: None,
            flush_interval_ms: 1000,
            archive_dir: None,
            archive_chunk_size: 1024 * 1024, // 1 MB
            archiver_wait_timeout_ms: 5000,
            encryption: false,
            wait_timeout_ms: 60_000,
            alert_interval_ms: 1000,
            fatal_policy: FatalPolicy::Abort,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Check the knobs against each other
    pub fn validate(&self) -> Result<()> {
        let block = self.block_size;
        if !block.is_power_of_two() || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block) {
            return Err(AtlasError::Config(format!(
                "block_size {} must be a power of two in {}..={}",
                block, MIN_BLOCK_SIZE, MAX_BLOCK_SIZE
            )));
        }

        if self.log_buffer_size < block || self.log_buffer_size % block != 0 {
            return Err(AtlasError::Config(format!(
                "log_buffer_size {} must be a non-zero multiple of the block size {}",
                self.log_buffer_size, block
            )));
        }

        if self.log_file_size < MIN_LOG_FILE_SIZE {
            return Err(AtlasError::Config(format!(
                "log_file_size {} is below the minimum of {}",
                self.log_file_size, MIN_LOG_FILE_SIZE
            )));
        }

        let body = self.log_file_size - header_size(block);
        if body % block as u64 != 0 {
            return Err(AtlasError::Config(format!(
                "log body of {} bytes is not a multiple of the block size {}",
                body, block
            )));
        }

        if self.archive_chunk_size == 0 || self.archive_chunk_size % block != 0 {
            return Err(AtlasError::Config(format!(
                "archive_chunk_size {} must be a non-zero multiple of the block size {}",
                self.archive_chunk_size, block
            )));
        }

        if self.checkpoint_margin_ratio < 2 || self.checkpoint_async_ratio < 2 {
            return Err(AtlasError::Config(
                "checkpoint ratios must be at least 2".to_string(),
            ));
        }

        if self.wait_timeout_ms == 0 || self.archiver_wait_timeout_ms == 0 || self.alert_interval_ms == 0 {
            return Err(AtlasError::Config(
                "wait timeouts and the alert interval must be non-zero".to_string(),
            ));
        }

        Ok(())
    }

    /// Archive directory after applying the default
    pub fn archive_dir(&self) -> PathBuf {
        self.archive_dir
            .clone()
            .unwrap_or_else(|| self.log_dir.join("archive"))
    }

    /// Reserved free space used by the checkpoint margins
    pub fn checkpoint_reserve(&self) -> u64 {
        self.checkpoint_reserve
            .unwrap_or(2 * self.log_buffer_size as u64 + 4 * self.block_size as u64)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    pub fn archiver_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.archiver_wait_timeout_ms)
    }

    pub fn alert_interval(&self) -> Duration {
        Duration::from_millis(self.alert_interval_ms)
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the log directory
    pub fn log_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.log_dir = path.into();
        self
    }

    /// Set the log file size (in bytes, header included)
    pub fn log_file_size(mut self, size: u64) -> Self {
        self.config.log_file_size = size;
        self
    }

    /// Set the size of each log buffer area (in bytes)
    pub fn log_buffer_size(mut self, size: usize) -> Self {
        self.config.log_buffer_size = size;
        self
    }

    /// Set the log block size (in bytes)
    pub fn block_size(mut self, size: usize) -> Self {
        self.config.block_size = size;
        self
    }

    /// Select plain or memory-mapped I/O
    pub fn io_mode(mut self, mode: IoMode) -> Self {
        self.config.io_mode = mode;
        self
    }

    /// Set both checkpoint margin ratios
    pub fn checkpoint_ratios(mut self, margin_ratio: u64, async_ratio: u64) -> Self {
        self.config.checkpoint_margin_ratio = margin_ratio;
        self.config.checkpoint_async_ratio = async_ratio;
        self
    }

    /// Override the reserved free space behind the checkpoint margins
    pub fn checkpoint_reserve(mut self, bytes: u64) -> Self {
        self.config.checkpoint_reserve = Some(bytes);
        self
    }

    /// Set the background flush interval (0 disables it)
    pub fn flush_interval_ms(mut self, ms: u64) -> Self {
        self.config.flush_interval_ms = ms;
        self
    }

    /// Set the archive directory
    pub fn archive_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.archive_dir = Some(path.into());
        self
    }

    /// Set the archive copy chunk size (in bytes)
    pub fn archive_chunk_size(mut self, size: usize) -> Self {
        self.config.archive_chunk_size = size;
        self
    }

    /// Set how long the writer waits for the archiver (in milliseconds)
    pub fn archiver_wait_timeout_ms(mut self, ms: u64) -> Self {
        self.config.archiver_wait_timeout_ms = ms;
        self
    }

    /// Enable or disable block encryption
    pub fn encryption(mut self, enabled: bool) -> Self {
        self.config.encryption = enabled;
        self
    }

    /// Set the caller-facing wait timeout (in milliseconds)
    pub fn wait_timeout_ms(mut self, ms: u64) -> Self {
        self.config.wait_timeout_ms = ms;
        self
    }

    /// Set the alert interval of long waits (in milliseconds)
    pub fn alert_interval_ms(mut self, ms: u64) -> Self {
        self.config.alert_interval_ms = ms;
        self
    }

    /// Set the fatal error policy
    pub fn fatal_policy(mut self, policy: FatalPolicy) -> Self {
        self.config.fatal_policy = policy;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
