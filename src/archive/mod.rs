//! Archive Coordinator
//!
//! Copies the live log into archive groups for backup clients.
//!
//! ## Phases
//! ```text
//! INIT ──start──► ACTIVE ──last client stops / forced abort──► IDLE
//!                   ▲                                           │
//!                   └──────────────────start────────────────────┘
//! any ──shutdown──► ABORT
//! ```
//! A background thread copies `min(chunk, align_down(flushed) - archived)`
//! bytes at a time from the live log into the current group. When the
//! writer is about to overwrite log the archiver has not copied yet it
//! waits, bounded by `archiver_wait_timeout_ms`; on timeout archiving is
//! aborted and the writer carries on.

mod client;
mod group;

pub use client::{ArchiveClient, ClientState};
pub use group::{
    archive_file_name, discard_stale, list_archive_files, list_group_dirs, ArchiveGroup, ArchiveMeta,
    META_FILE_NAME,
};

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use crossbeam::channel::{self, select, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use crate::engine::LogCore;
use crate::error::{AtlasError, Result};
use crate::log;
use crate::lsn::Lsn;
use crate::status::Severity;
use crate::wait::{wait_until, WaitPolicy};

/// How long the archiver sleeps without a wakeup
const IDLE_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiverPhase {
    Init,
    Active,
    Idle,
    /// Shut down; no more archiving in this process
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveStatus {
    pub phase: ArchiverPhase,
    pub archived_lsn: Lsn,
    /// Groups still held by a client or still active
    pub groups: usize,
    /// Clients of the current group that have not stopped
    pub active_clients: usize,
}

struct CoordinatorState {
    phase: ArchiverPhase,
    current: Option<Arc<ArchiveGroup>>,
    groups: Vec<Arc<ArchiveGroup>>,
}

impl CoordinatorState {
    fn is_current(&self, group: &Arc<ArchiveGroup>) -> bool {
        self.current.as_ref().is_some_and(|g| Arc::ptr_eq(g, group))
    }

    fn prune(&mut self) {
        self.groups.retain(|g| g.is_active() || g.ref_count() > 0);
    }
}

pub struct ArchiveCoordinator {
    dir: PathBuf,
    chunk_size: usize,
    state: Mutex<CoordinatorState>,
    progress: Condvar,
    archived_lsn: AtomicU64,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
}

impl ArchiveCoordinator {
    pub(crate) fn new(dir: &Path, chunk_size: usize) -> Self {
        let (wake_tx, wake_rx) = channel::bounded(1);
        Self {
            dir: dir.to_path_buf(),
            chunk_size,
            state: Mutex::new(CoordinatorState {
                phase: ArchiverPhase::Init,
                current: None,
                groups: Vec::new(),
            }),
            progress: Condvar::new(),
            archived_lsn: AtomicU64::new(0),
            wake_tx,
            wake_rx,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn phase(&self) -> ArchiverPhase {
        self.state.lock().phase
    }

    pub fn archived_lsn(&self) -> Lsn {
        self.archived_lsn.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> ArchiveStatus {
        let state = self.state.lock();
        ArchiveStatus {
            phase: state.phase,
            archived_lsn: self.archived_lsn(),
            groups: state.groups.len(),
            active_clients: state.current.as_ref().map_or(0, |g| g.active_clients()),
        }
    }

    /// Wake the archiver thread
    pub(crate) fn signal(&self) {
        let _ = self.wake_tx.try_send(());
    }

    // =========================================================================
    // Client protocol
    // =========================================================================

    /// Attach a client to the active group, creating one if needed.
    ///
    /// Returns the group, the client's start LSN and the header region
    /// of the archive file holding that LSN.
    pub(crate) fn start(&self, core: &LogCore, durable: bool) -> Result<(Arc<ArchiveGroup>, Lsn, Bytes)> {
        if self.phase() == ArchiverPhase::Abort {
            return Err(AtlasError::Interrupted("log archiver is shut down".to_string()));
        }

        // Archived content starts from a known checkpoint
        core.make_checkpoint()?;

        let mut state = self.state.lock();
        if state.phase == ArchiverPhase::Abort {
            return Err(AtlasError::Interrupted("log archiver is shut down".to_string()));
        }

        let checkpoint = core.checkpoint.last();
        let group = match &state.current {
            Some(group) => Arc::clone(group),
            None => {
                let file = core.current_file();
                let group = Arc::new(ArchiveGroup::create(
                    &self.dir,
                    checkpoint,
                    core.geometry,
                    file.file_size(),
                    core.crypto.is_some(),
                    durable,
                )?);
                self.archived_lsn.store(group.aligned_begin(), Ordering::SeqCst);
                state.groups.push(Arc::clone(&group));
                state.current = Some(Arc::clone(&group));
                group
            }
        };
        group.attach(durable)?;
        state.phase = ArchiverPhase::Active;
        drop(state);

        self.signal();
        let start_lsn = checkpoint.checkpoint_lsn;
        let header = Bytes::from(group.header_region(group.extent_start(start_lsn), &checkpoint));
        info!(start_lsn, durable, clients = group.active_clients(), "archive.client.started");
        Ok((group, start_lsn, header))
    }

    /// Capture the tail, wait for the copy to reach it, detach.
    ///
    /// Returns the stop LSN and the sealed image of the block holding it.
    pub(crate) fn stop(&self, core: &LogCore, group: &Arc<ArchiveGroup>) -> Result<(Lsn, Bytes)> {
        let (stop_lsn, block_lsn, mut trailer) = {
            let buffer = core.buffer.lock();
            let (block_lsn, image) = buffer.last_block();
            (buffer.buffered_lsn(), block_lsn, image)
        };
        log::block::set_checkpoint_no(&mut trailer, core.checkpoint.current_no());
        log::seal_block(core, &mut trailer, block_lsn)?;

        let mut outcome = core.write_up_to(stop_lsn, true);
        if outcome.is_ok() {
            outcome = self.wait_copied(core, group, block_lsn);
        }

        self.detach(group);
        outcome?;

        if group.is_failed() {
            return Err(AtlasError::Archive(format!(
                "log archiver failed before lsn {}",
                stop_lsn
            )));
        }

        info!(stop_lsn, "archive.client.stopped");
        Ok((stop_lsn, Bytes::from(trailer)))
    }

    /// Wait (caller-facing bound) until `group` holds everything below `lsn`
    fn wait_copied(&self, core: &LogCore, group: &Arc<ArchiveGroup>, lsn: Lsn) -> Result<()> {
        self.signal();
        let mut state = self.state.lock();
        let archived = &self.archived_lsn;
        wait_until(
            &self.progress,
            &mut state,
            Some(&core.shutdown),
            core.wait_policy(),
            "archive copy",
            |st| !st.is_current(group) || !group.is_active() || archived.load(Ordering::SeqCst) >= lsn,
            |_, waited| {
                warn!(
                    target_lsn = lsn,
                    archived_lsn = archived.load(Ordering::SeqCst),
                    waited_ms = waited.as_millis() as u64,
                    "archive.stop_waiting"
                );
            },
        )
    }

    /// A client stops archiving; the last one takes the group idle
    pub(crate) fn detach(&self, group: &Arc<ArchiveGroup>) {
        let mut state = self.state.lock();
        let remaining = group.detach();
        if remaining > 0 || !state.is_current(group) {
            return;
        }

        group.disable(self.archived_lsn(), false);
        state.current = None;
        if state.phase == ArchiverPhase::Active {
            state.phase = ArchiverPhase::Idle;
        }
        state.prune();
        self.progress.notify_all();
        debug!(begin_lsn = group.begin_lsn(), "archive.idle");
    }

    pub(crate) fn release(&self, group: &Arc<ArchiveGroup>) {
        let mut state = self.state.lock();
        group.release();
        state.prune();
    }

    // =========================================================================
    // Writer side
    // =========================================================================

    /// True if writing up to `write_end` would overwrite uncopied log
    pub(crate) fn needs_wait(&self, capacity: u64, write_end: Lsn) -> bool {
        let state = self.state.lock();
        state.phase == ArchiverPhase::Active
            && state.current.is_some()
            && write_end > self.archived_lsn() + capacity
    }

    /// Block the writer until the archiver makes room, aborting archiving
    /// if it takes too long
    pub(crate) fn wait_archiver(&self, core: &LogCore, capacity: u64, write_end: Lsn) {
        let outcome = self.wait_progress(core, "log archiver to make room", |archived| {
            archived + capacity >= write_end
        });
        if let Err(e) = outcome {
            error!(
                write_end,
                archived_lsn = self.archived_lsn(),
                error = %e,
                "archive.writer_wait_expired"
            );
            self.force_abort(core, &format!("writer waited too long for the archiver: {}", e));
        }
    }

    /// Block until everything below `lsn` is archived (or archiving stops)
    pub(crate) fn wait_archived(&self, core: &LogCore, lsn: Lsn) {
        if let Err(e) = self.wait_progress(core, "log archiver catch-up", |archived| archived >= lsn) {
            self.force_abort(core, &format!("archiver did not reach lsn {}: {}", lsn, e));
        }
    }

    fn wait_progress(&self, core: &LogCore, what: &str, reached: impl Fn(Lsn) -> bool) -> Result<()> {
        self.signal();
        let policy = WaitPolicy {
            timeout: core.config.archiver_wait_timeout(),
            alert_interval: core.config.alert_interval(),
        };
        let archived = &self.archived_lsn;
        let mut state = self.state.lock();
        wait_until(
            &self.progress,
            &mut state,
            Some(&core.shutdown),
            policy,
            what,
            |st| st.phase != ArchiverPhase::Active || reached(archived.load(Ordering::SeqCst)),
            |_, waited| {
                warn!(
                    archived_lsn = archived.load(Ordering::SeqCst),
                    waited_ms = waited.as_millis() as u64,
                    what,
                    "archive.waiting_for_archiver"
                );
            },
        )
    }

    /// Give up on the current group; the log itself is unaffected
    pub(crate) fn force_abort(&self, core: &LogCore, reason: &str) {
        let mut state = self.state.lock();
        let Some(group) = state.current.take() else {
            return;
        };
        group.disable(self.archived_lsn(), true);
        if state.phase == ArchiverPhase::Active {
            state.phase = ArchiverPhase::Idle;
        }
        state.prune();
        self.progress.notify_all();
        drop(state);

        core.stats.record_archive_abort();
        warn!(begin_lsn = group.begin_lsn(), reason, "archive.aborted");
        core.status.record(Severity::Warning, "archive", reason, self.archived_lsn());
    }

    // =========================================================================
    // Background copy
    // =========================================================================

    /// Copy one chunk; returns false when there was nothing to copy
    pub(crate) fn step(&self, core: &LogCore) -> Result<bool> {
        let (group, archived) = {
            let state = self.state.lock();
            match (state.phase, &state.current) {
                (ArchiverPhase::Active, Some(group)) => (Arc::clone(group), self.archived_lsn()),
                _ => return Ok(false),
            }
        };

        let limit = core.geometry.align_down(core.watermarks.flushed());
        if limit <= archived {
            return Ok(false);
        }
        let len = (limit - archived).min(self.chunk_size as u64) as usize;
        let mut chunk = vec![0u8; len];
        core.writer.read_log(core, archived, &mut chunk)?;
        group.write(archived, &chunk)?;

        let state = self.state.lock();
        if state.is_current(&group) {
            self.archived_lsn.store(archived + len as u64, Ordering::SeqCst);
            core.stats.record_archived(len as u64);
        }
        self.progress.notify_all();
        Ok(true)
    }

    /// Archiver thread body
    pub(crate) fn run(&self, core: &LogCore) {
        let shutdown = core.shutdown.receiver();
        debug!("archive.thread.started");

        loop {
            select! {
                recv(shutdown) -> _ => break,
                recv(self.wake_rx) -> _ => {}
                default(IDLE_POLL) => {}
            }
            if core.shutdown.is_set() {
                break;
            }

            loop {
                match self.step(core) {
                    Ok(true) if !core.shutdown.is_set() => continue,
                    Ok(_) => break,
                    Err(e) => {
                        self.force_abort(core, &format!("archive copy failed: {}", e));
                        break;
                    }
                }
            }
        }

        let mut state = self.state.lock();
        if let Some(group) = state.current.take() {
            group.disable(self.archived_lsn(), false);
        }
        state.phase = ArchiverPhase::Abort;
        state.prune();
        self.progress.notify_all();
        debug!("archive.thread.stopped");
    }
}
