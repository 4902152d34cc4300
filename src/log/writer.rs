//! Writer
//!
//! Moves promoted buffer areas to the log file and runs group commit.
//!
//! ## Group commit
//! The first caller of [`Writer::write_up_to`] that finds the writer idle
//! becomes the leader. It promotes everything buffered, writes it in one
//! physical I/O, flushes if anyone asked for durability, and wakes every
//! follower. Followers whose target is now covered return without doing
//! any I/O; the rest elect the next leader.
//!
//! ## Failure
//! A failed write or flush latches: the leader and every follower get the
//! same `Fatal` error, and so does every later call.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, error};

use crate::engine::LogCore;
use crate::error::{AtlasError, Result};
use crate::lsn::Lsn;
use crate::status::Severity;
use crate::wait::wait_until;

use super::block;
use super::file::LogFile;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterPhase {
    Idle,
    /// A leader was elected and is promoting the buffer
    WritePending,
    /// The leader is doing physical I/O
    Writing,
}

/// Hook consulted before every physical body write and flush.
///
/// An error returned here is handled exactly like a device error.
pub trait IoInterceptor: Send + Sync {
    fn before_write(&self, _lsn: Lsn, _len: usize) -> io::Result<()> {
        Ok(())
    }

    fn before_flush(&self) -> io::Result<()> {
        Ok(())
    }
}

/// The three log watermarks plus the last checkpoint LSN.
///
/// Lock-free snapshot reads; writers only move them forward.
/// Readers that need `flushed <= write <= buffered` read in that order.
#[derive(Debug)]
pub struct Watermarks {
    buffered: AtomicU64,
    write: AtomicU64,
    flushed: AtomicU64,
    checkpoint: AtomicU64,
}

impl Watermarks {
    pub(crate) fn new(buffered: Lsn, written: Lsn, checkpoint: Lsn) -> Self {
        Self {
            buffered: AtomicU64::new(buffered),
            write: AtomicU64::new(written),
            flushed: AtomicU64::new(written),
            checkpoint: AtomicU64::new(checkpoint),
        }
    }

    pub fn buffered(&self) -> Lsn {
        self.buffered.load(Ordering::SeqCst)
    }

    pub fn write(&self) -> Lsn {
        self.write.load(Ordering::SeqCst)
    }

    pub fn flushed(&self) -> Lsn {
        self.flushed.load(Ordering::SeqCst)
    }

    pub fn checkpoint(&self) -> Lsn {
        self.checkpoint.load(Ordering::SeqCst)
    }

    pub(crate) fn set_buffered(&self, lsn: Lsn) {
        self.buffered.fetch_max(lsn, Ordering::SeqCst);
    }

    pub(crate) fn set_write(&self, lsn: Lsn) {
        self.write.fetch_max(lsn, Ordering::SeqCst);
    }

    pub(crate) fn set_flushed(&self, lsn: Lsn) {
        self.flushed.fetch_max(lsn, Ordering::SeqCst);
    }

    pub(crate) fn set_checkpoint(&self, lsn: Lsn) {
        self.checkpoint.fetch_max(lsn, Ordering::SeqCst);
    }

    /// True if `target` is already written (or durable, when asked)
    pub fn satisfied(&self, target: Lsn, durable: bool) -> bool {
        if durable {
            self.flushed() >= target
        } else {
            self.write() >= target
        }
    }
}

struct WriterState {
    phase: WriterPhase,
    /// A follower wants the next leader to flush
    want_durable: bool,
    /// Latched fatal failure
    failure: Option<String>,
}

/// Group-commit writer
pub struct Writer {
    state: Mutex<WriterState>,
    done: Condvar,
    /// Held for the duration of any physical I/O on the live file
    pub(crate) io: Mutex<()>,
}

impl Writer {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(WriterState {
                phase: WriterPhase::Idle,
                want_durable: false,
                failure: None,
            }),
            done: Condvar::new(),
            io: Mutex::new(()),
        }
    }

    pub fn phase(&self) -> WriterPhase {
        self.state.lock().phase
    }

    /// Latched failure, if any
    pub fn failure(&self) -> Option<String> {
        self.state.lock().failure.clone()
    }

    /// Make the log written (or durable) at least up to `target`
    pub(crate) fn write_up_to(&self, core: &LogCore, target: Lsn, durable: bool) -> Result<()> {
        let target = target.min(core.watermarks.buffered());
        if core.watermarks.satisfied(target, durable) {
            return Ok(());
        }

        let mut state = self.state.lock();
        loop {
            if let Some(reason) = &state.failure {
                return Err(AtlasError::Fatal(reason.clone()));
            }
            if core.watermarks.satisfied(target, durable) {
                return Ok(());
            }

            if state.phase == WriterPhase::Idle {
                state.phase = WriterPhase::WritePending;
                let flush = durable || std::mem::take(&mut state.want_durable);

                let outcome = MutexGuard::unlocked(&mut state, || self.lead(core, flush));

                state.phase = WriterPhase::Idle;
                if let Err(err) = outcome {
                    let reason = err.to_string();
                    error!(target_lsn = target, error = %reason, "log.writer.failed");
                    core.status.record(Severity::Fatal, "writer", reason.clone(), target);
                    state.failure = Some(reason.clone());
                    self.done.notify_all();
                    return Err(AtlasError::Fatal(reason));
                }
                self.done.notify_all();
                continue;
            }

            // Follower
            state.want_durable |= durable;
            wait_until(
                &self.done,
                &mut state,
                Some(&core.shutdown),
                core.wait_policy(),
                "group commit leader",
                |st| st.phase == WriterPhase::Idle || st.failure.is_some(),
                |st, waited| {
                    tracing::warn!(
                        target_lsn = target,
                        phase = ?st.phase,
                        waited_ms = waited.as_millis() as u64,
                        "log.writer.follower_waiting"
                    );
                },
            )?;
        }
    }

    /// Leader body: promote, write, optionally flush
    fn lead(&self, core: &LogCore, flush: bool) -> Result<()> {
        let _io = self.io.lock();
        let checkpoint_no = core.checkpoint.current_no();
        let promoted = core.buffer.lock().promote(checkpoint_no);
        self.state.lock().phase = WriterPhase::Writing;

        let file = core.current_file();
        if let Some(mut area) = promoted {
            core.stats.record_promote();
            let start = area.start_lsn();
            let end = area.end_lsn();

            let write_end = start + area.len() as u64;
            if core.archive.needs_wait(file.capacity(), write_end) {
                // The archiver copies durable bytes only
                self.flush(core, &file)?;
                core.archive.wait_archiver(core, file.capacity(), write_end);
            }

            let unconsumed = end.saturating_sub(core.watermarks.checkpoint());
            if unconsumed > file.capacity() {
                error!(
                    end_lsn = end,
                    checkpoint_lsn = core.watermarks.checkpoint(),
                    capacity = file.capacity(),
                    "log.writer.overwriting_unconsumed_log"
                );
                core.status.record(
                    Severity::Error,
                    "writer",
                    "checkpoint age exceeds log capacity",
                    end,
                );
            }

            let block_size = core.geometry.block_size();
            for (i, blk) in area.bytes_mut().chunks_exact_mut(block_size).enumerate() {
                seal_block(core, blk, start + (i * block_size) as u64)?;
            }

            if let Some(hook) = &core.interceptor {
                hook.before_write(start, area.len())
                    .map_err(|e| write_failure(start, area.len(), e))?;
            }
            file.write_at_lsn(start, area.bytes())
                .map_err(|e| write_failure(start, area.len(), e))?;
            core.resize.shadow_write(core, start, area.bytes());
            core.stats.record_write();

            debug!(start_lsn = start, end_lsn = end, bytes = area.len(), "log.writer.write");
            core.buffer.lock().recycle(area);
            core.watermarks.set_write(end);
        }

        if flush {
            self.flush(core, &file)?;
        }
        Ok(())
    }

    /// Persist everything written so far
    fn flush(&self, core: &LogCore, file: &LogFile) -> Result<()> {
        let written = core.watermarks.write();
        if core.watermarks.flushed() >= written {
            return Ok(());
        }

        if let Some(hook) = &core.interceptor {
            hook.before_flush().map_err(|e| flush_failure(written, e))?;
        }
        file.persist().map_err(|e| flush_failure(written, e))?;
        core.resize.shadow_persist(core);
        core.stats.record_flush();
        core.watermarks.set_flushed(written);
        Ok(())
    }

    /// Write a checkpoint record to the live file (and a resize target)
    pub(crate) fn write_checkpoint(&self, core: &LogCore, record: &crate::checkpoint::CheckpointRecord) -> Result<()> {
        let _io = self.io.lock();
        if let Some(reason) = self.failure() {
            return Err(AtlasError::Fatal(reason));
        }

        let file = core.current_file();
        if let Err(e) = file.write_checkpoint(record) {
            let reason = format!(
                "checkpoint {} write at lsn {} failed: {}",
                record.checkpoint_no, record.checkpoint_lsn, e
            );
            error!(error = %reason, "log.writer.checkpoint_failed");
            core.status.record(Severity::Fatal, "writer", reason.clone(), record.checkpoint_lsn);
            self.state.lock().failure = Some(reason.clone());
            self.done.notify_all();
            return Err(AtlasError::Fatal(reason));
        }
        core.resize.shadow_checkpoint(core, record);
        Ok(())
    }

    /// Read written block images for the archiver
    pub(crate) fn read_log(&self, core: &LogCore, lsn: Lsn, buf: &mut [u8]) -> Result<()> {
        let file = core.current_file();
        let end = lsn + buf.len() as u64;
        if lsn < file.first_lsn() || end > core.watermarks.write() {
            return Err(AtlasError::Archive(format!(
                "lsn range {}..{} is not available in the live log",
                lsn, end
            )));
        }
        file.read_at_lsn(lsn, buf)?;
        Ok(())
    }
}

/// Checksum then encrypt one block image in place
pub(crate) fn seal_block(core: &LogCore, blk: &mut [u8], block_lsn: Lsn) -> Result<()> {
    block::store_checksum(blk);
    if let Some(crypto) = &core.crypto {
        crypto.encrypt_block(blk, block_lsn)?;
    }
    Ok(())
}

fn write_failure(lsn: Lsn, len: usize, err: io::Error) -> AtlasError {
    AtlasError::Fatal(format!("log write of {} bytes at lsn {} failed: {}", len, lsn, err))
}

fn flush_failure(lsn: Lsn, err: io::Error) -> AtlasError {
    AtlasError::Fatal(format!("log flush up to lsn {} failed: {}", lsn, err))
}
