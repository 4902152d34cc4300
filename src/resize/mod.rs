//! Resize Controller
//!
//! Changes the log capacity while writers keep running.
//!
//! ## Protocol
//! ```text
//! NONE ──start──► IN_PROGRESS ──checkpoint past start──► COMMITTED
//!                      │
//!                      └──abort / shadow I/O error──► ABORTED
//! ```
//! From `start` on, every block the writer puts in the live file is also
//! written to `ib_logfile101`, whose body begins at the resize start LSN.
//! Once a checkpoint strictly after that LSN is in both files the target
//! is renamed over the live file. Until then the live file alone is a
//! complete log, so a crash anywhere in between loses nothing.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::checkpoint::CheckpointRecord;
use crate::config::MIN_LOG_FILE_SIZE;
use crate::engine::LogCore;
use crate::error::{AtlasError, Result};
use crate::log::{self, header_size, LogFile, LOG_FILE_NAME, RESIZE_FILE_NAME};
use crate::lsn::Lsn;
use crate::status::Severity;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResizeStatus {
    None,
    InProgress { start_lsn: Lsn, target_size: u64 },
    Committed { size: u64 },
    Aborted { target_size: u64 },
}

struct ActiveResize {
    target: Arc<LogFile>,
    start_lsn: Lsn,
    target_size: u64,
    /// A checkpoint past `start_lsn` reached the target
    checkpointed: bool,
}

struct ResizeState {
    active: Option<ActiveResize>,
    outcome: ResizeStatus,
}

pub struct ResizeController {
    log_dir: PathBuf,
    state: Mutex<ResizeState>,
}

impl ResizeController {
    pub(crate) fn new(log_dir: &Path) -> Self {
        Self {
            log_dir: log_dir.to_path_buf(),
            state: Mutex::new(ResizeState {
                active: None,
                outcome: ResizeStatus::None,
            }),
        }
    }

    /// Remove a target left behind by an interrupted resize
    pub(crate) fn discard_stale(log_dir: &Path) -> Result<bool> {
        let path = log_dir.join(RESIZE_FILE_NAME);
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(&path)?;
        warn!(path = %path.display(), "log.resize.stale_target_removed");
        Ok(true)
    }

    pub fn status(&self) -> ResizeStatus {
        let state = self.state.lock();
        match &state.active {
            Some(active) => ResizeStatus::InProgress {
                start_lsn: active.start_lsn,
                target_size: active.target_size,
            },
            None => state.outcome,
        }
    }

    pub fn in_progress(&self) -> bool {
        self.state.lock().active.is_some()
    }

    /// Capacity the checkpoint margins must respect
    pub(crate) fn smallest_capacity(&self, live_capacity: u64) -> u64 {
        match &self.state.lock().active {
            Some(active) => live_capacity.min(active.target.capacity()),
            None => live_capacity,
        }
    }

    fn target_path(&self) -> PathBuf {
        self.log_dir.join(RESIZE_FILE_NAME)
    }

    /// Begin resizing the live log to `new_size` bytes; returns the start LSN
    pub(crate) fn start(&self, core: &LogCore, new_size: u64) -> Result<Lsn> {
        let geometry = core.geometry;
        let b = geometry.block_size() as u64;
        if new_size < MIN_LOG_FILE_SIZE {
            return Err(AtlasError::InvalidArgument(format!(
                "log file size {} is below the minimum of {}",
                new_size, MIN_LOG_FILE_SIZE
            )));
        }
        if (new_size - header_size(geometry.block_size())) % b != 0 {
            return Err(AtlasError::InvalidArgument(format!(
                "log body of a {} byte file is not a multiple of the block size {}",
                new_size, b
            )));
        }

        let _io = core.writer.io.lock();
        let live = core.current_file();
        if new_size == live.file_size() {
            return Err(AtlasError::InvalidArgument(format!(
                "log file is already {} bytes",
                new_size
            )));
        }
        if self.in_progress() {
            return Err(AtlasError::InvalidState("a resize is already in progress".to_string()));
        }

        // Writes from here on begin at the block holding the pending LSN
        let (block_lsn, mut image) = core.buffer.lock().last_block();
        let checkpoint = core.checkpoint.last();
        let target = LogFile::create(
            &self.target_path(),
            new_size,
            &geometry,
            block_lsn,
            live.mode(),
            live.header().encrypted,
            Some(&checkpoint),
        )?;

        log::block::set_checkpoint_no(&mut image, core.checkpoint.current_no());
        log::seal_block(core, &mut image, block_lsn)?;
        if let Err(e) = target.write_at_lsn(block_lsn, &image).and_then(|_| target.persist()) {
            drop(target);
            let _ = fs::remove_file(self.target_path());
            return Err(AtlasError::ResourceExhausted(format!(
                "cannot prepare resize target: {}",
                e
            )));
        }

        self.state.lock().active = Some(ActiveResize {
            target: Arc::new(target),
            start_lsn: block_lsn,
            target_size: new_size,
            checkpointed: false,
        });

        info!(start_lsn = block_lsn, from = live.file_size(), to = new_size, "log.resize.started");
        core.status.record(
            Severity::Info,
            "resize",
            format!("resize from {} to {} bytes started", live.file_size(), new_size),
            block_lsn,
        );
        Ok(block_lsn)
    }

    // =========================================================================
    // Shadow writes (called by the writer under its I/O lock)
    // =========================================================================

    pub(crate) fn shadow_write(&self, core: &LogCore, lsn: Lsn, blocks: &[u8]) {
        let mut state = self.state.lock();
        let result = match &state.active {
            Some(active) => {
                let skip = active.start_lsn.saturating_sub(lsn).min(blocks.len() as u64) as usize;
                active.target.write_at_lsn(lsn + skip as u64, &blocks[skip..])
            }
            None => return,
        };
        if let Err(e) = result {
            self.fail(core, &mut state, "shadow_write", e);
        }
    }

    pub(crate) fn shadow_persist(&self, core: &LogCore) {
        let mut state = self.state.lock();
        let result = match &state.active {
            Some(active) => active.target.persist(),
            None => return,
        };
        if let Err(e) = result {
            self.fail(core, &mut state, "shadow_flush", e);
        }
    }

    pub(crate) fn shadow_checkpoint(&self, core: &LogCore, record: &CheckpointRecord) {
        let mut state = self.state.lock();
        let result = match &mut state.active {
            Some(active) if record.checkpoint_lsn >= active.start_lsn => {
                let written = active.target.write_checkpoint(record);
                if written.is_ok() && record.checkpoint_lsn > active.start_lsn {
                    active.checkpointed = true;
                }
                written
            }
            _ => return,
        };
        if let Err(e) = result {
            self.fail(core, &mut state, "shadow_checkpoint", e);
        }
    }

    /// Shadow I/O errors abort the resize, never the log
    fn fail(&self, core: &LogCore, state: &mut ResizeState, what: &str, err: std::io::Error) {
        let Some(active) = state.active.take() else {
            return;
        };
        drop(active.target);
        let _ = fs::remove_file(self.target_path());
        state.outcome = ResizeStatus::Aborted {
            target_size: active.target_size,
        };

        warn!(error = %err, start_lsn = active.start_lsn, what, "log.resize.shadow_failed");
        core.status.record(
            Severity::Warning,
            "resize",
            format!("{} failed, resize aborted: {}", what, err),
            active.start_lsn,
        );
    }

    // =========================================================================
    // Completion
    // =========================================================================

    /// Called after every checkpoint; commits the resize once it can
    pub(crate) fn on_checkpoint(&self, core: &LogCore, checkpoint_lsn: Lsn) {
        let ready = matches!(&self.state.lock().active, Some(a) if a.checkpointed);
        if !ready {
            return;
        }
        if let Err(e) = self.rename(core) {
            warn!(checkpoint_lsn, error = %e, "log.resize.rename_failed");
            core.status.record(Severity::Error, "resize", format!("rename failed: {}", e), checkpoint_lsn);
        }
    }

    /// Put the target in place of the live file
    pub(crate) fn rename(&self, core: &LogCore) -> Result<u64> {
        let start_lsn = match &self.state.lock().active {
            Some(active) if active.checkpointed => active.start_lsn,
            Some(active) => {
                return Err(AtlasError::InvalidState(format!(
                    "no checkpoint after resize start lsn {} yet",
                    active.start_lsn
                )))
            }
            None => return Err(AtlasError::InvalidState("no resize in progress".to_string())),
        };

        // The live file stops holding anything before start_lsn
        core.archive.wait_archived(core, start_lsn);

        let size = {
            let _io = core.writer.io.lock();
            let mut state = self.state.lock();
            let active = state
                .active
                .take()
                .ok_or_else(|| AtlasError::InvalidState("resize aborted concurrently".to_string()))?;

            let mode = active.target.mode();
            let persisted = active.target.persist();
            drop(active.target);
            if let Err(e) = persisted {
                let _ = fs::remove_file(self.target_path());
                state.outcome = ResizeStatus::Aborted {
                    target_size: active.target_size,
                };
                return Err(AtlasError::Io(e));
            }

            let live_path = self.log_dir.join(LOG_FILE_NAME);
            fs::rename(self.target_path(), &live_path)
                .and_then(|_| sync_dir(&self.log_dir))
                .map_err(|e| core.escalate(AtlasError::Fatal(format!("resize rename failed: {}", e))))?;

            let file = LogFile::open(&live_path, mode)
                .map_err(|e| core.escalate(AtlasError::Fatal(format!("reopen after resize failed: {}", e))))?;
            core.replace_file(Arc::new(file));

            state.outcome = ResizeStatus::Committed {
                size: active.target_size,
            };
            active.target_size
        };

        core.refresh_margins()?;
        info!(start_lsn, size, "log.resize.committed");
        core.status.record(Severity::Info, "resize", format!("log resized to {} bytes", size), start_lsn);
        Ok(size)
    }

    /// Drop the target and go back to single-file writing
    pub(crate) fn abort(&self, core: &LogCore) -> Result<()> {
        {
            let _io = core.writer.io.lock();
            let mut state = self.state.lock();
            let active = state
                .active
                .take()
                .ok_or_else(|| AtlasError::InvalidState("no resize in progress".to_string()))?;
            drop(active.target);
            fs::remove_file(self.target_path())?;
            state.outcome = ResizeStatus::Aborted {
                target_size: active.target_size,
            };
            info!(start_lsn = active.start_lsn, "log.resize.aborted");
        }
        core.refresh_margins()
    }
}

fn sync_dir(dir: &Path) -> std::io::Result<()> {
    fs::File::open(dir)?.sync_all()
}
