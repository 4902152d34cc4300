//! Checkpoint Manager
//!
//! Decides when a checkpoint is due, asks the page-flush collaborator to
//! make room, and writes the record into the alternate slot.
//!
//! ## Margins
//! ```text
//! margin                 = smallest_capacity - reserve
//! max_checkpoint_age     = margin - margin / margin_ratio
//! max_modified_age_async = max_checkpoint_age - max_checkpoint_age / async_ratio
//! ```
//! Past `max_modified_age_async` a checkpoint is attempted opportunistically;
//! past `max_checkpoint_age` it is mandatory before the append proceeds.

mod record;

pub use record::{CheckpointRecord, CryptoEpoch, CHECKPOINT_SLOT_LEN};

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::engine::LogCore;
use crate::error::{AtlasError, Result};
use crate::lsn::Lsn;
use crate::status::Severity;

/// Minimum spacing of the "record larger than the checkpoint age" warning
const OVERSIZE_WARNING_INTERVAL: Duration = Duration::from_secs(15);

/// Narrow view of the buffer pool
pub trait DurabilityDemand: Send + Sync {
    /// Oldest LSN of a modification not yet written to a data page.
    /// `None` when nothing is dirty.
    fn oldest_dirty_lsn(&self) -> Option<Lsn>;

    /// Write back every page modified before `lsn` (blocking)
    fn flush_upto(&self, lsn: Lsn);
}

/// Collaborator for a log without a buffer pool behind it
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDirtyPages;

impl DurabilityDemand for NoDirtyPages {
    fn oldest_dirty_lsn(&self) -> Option<Lsn> {
        None
    }

    fn flush_upto(&self, _lsn: Lsn) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointMargins {
    /// Capacity the margins were computed for
    pub capacity: u64,
    pub max_checkpoint_age: u64,
    pub max_modified_age_async: u64,
}

impl CheckpointMargins {
    pub fn compute(smallest_capacity: u64, reserve: u64, margin_ratio: u64, async_ratio: u64) -> Result<Self> {
        let margin = smallest_capacity
            .checked_sub(reserve)
            .filter(|m| *m > 0)
            .ok_or_else(|| {
                AtlasError::Config(format!(
                    "log capacity {} is too small for a reserve of {} bytes",
                    smallest_capacity, reserve
                ))
            })?;

        let max_checkpoint_age = margin - margin / margin_ratio;
        let max_modified_age_async = max_checkpoint_age - max_checkpoint_age / async_ratio;

        Ok(Self {
            capacity: smallest_capacity,
            max_checkpoint_age,
            max_modified_age_async,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointUrgency {
    None,
    /// Past `max_modified_age_async`
    Async,
    /// Past `max_checkpoint_age`
    Sync,
}

pub struct CheckpointManager {
    last: Mutex<CheckpointRecord>,
    margins: RwLock<CheckpointMargins>,
    checkpoint_no: AtomicU64,
    /// Serializes checkpoint runs
    running: Mutex<()>,
    last_oversize_warning: Mutex<Option<Instant>>,
}

impl CheckpointManager {
    pub(crate) fn new(last: CheckpointRecord, margins: CheckpointMargins) -> Self {
        Self {
            checkpoint_no: AtomicU64::new(last.checkpoint_no),
            last: Mutex::new(last),
            margins: RwLock::new(margins),
            running: Mutex::new(()),
            last_oversize_warning: Mutex::new(None),
        }
    }

    pub fn margins(&self) -> CheckpointMargins {
        *self.margins.read()
    }

    pub(crate) fn set_margins(&self, margins: CheckpointMargins) {
        *self.margins.write() = margins;
    }

    /// The last written checkpoint
    pub fn last(&self) -> CheckpointRecord {
        *self.last.lock()
    }

    /// Number of the last written checkpoint (the current key epoch)
    pub fn current_no(&self) -> u64 {
        self.checkpoint_no.load(Ordering::SeqCst)
    }

    pub fn urgency(&self, tail_lsn: Lsn, checkpoint_lsn: Lsn) -> CheckpointUrgency {
        let margins = self.margins();
        let age = tail_lsn.saturating_sub(checkpoint_lsn);
        if age > margins.max_checkpoint_age {
            CheckpointUrgency::Sync
        } else if age > margins.max_modified_age_async {
            CheckpointUrgency::Async
        } else {
            CheckpointUrgency::None
        }
    }

    /// Checkpoint if the outstanding log calls for it.
    ///
    /// An async checkpoint is skipped when another one is already running;
    /// a mandatory one waits for it and re-checks.
    pub(crate) fn maybe_checkpoint(&self, core: &LogCore) -> Result<bool> {
        match self.urgency(core.watermarks.buffered(), core.watermarks.checkpoint()) {
            CheckpointUrgency::None => Ok(false),
            CheckpointUrgency::Async => match self.running.try_lock() {
                Some(_running) => self.run(core, CheckpointUrgency::Async, false),
                None => Ok(false),
            },
            CheckpointUrgency::Sync => {
                let _running = self.running.lock();
                if self.urgency(core.watermarks.buffered(), core.watermarks.checkpoint())
                    == CheckpointUrgency::None
                {
                    return Ok(false);
                }
                self.run(core, CheckpointUrgency::Sync, false)
            }
        }
    }

    /// Make room for an append that would end at `projected_tail`.
    ///
    /// Returns false when the checkpoint cannot advance any further.
    pub(crate) fn make_room(&self, core: &LogCore, projected_tail: Lsn) -> Result<bool> {
        let _running = self.running.lock();
        let age = projected_tail.saturating_sub(core.watermarks.checkpoint());
        if age <= self.margins().max_checkpoint_age {
            return Ok(true);
        }
        self.run(core, CheckpointUrgency::Sync, false)
    }

    /// Write a checkpoint now, even if the checkpoint LSN does not move
    pub(crate) fn make_checkpoint(&self, core: &LogCore) -> Result<bool> {
        let _running = self.running.lock();
        self.run(core, CheckpointUrgency::Sync, true)
    }

    fn run(&self, core: &LogCore, urgency: CheckpointUrgency, force: bool) -> Result<bool> {
        let margins = self.margins();
        let current = core.watermarks.buffered();

        if force {
            core.demand.flush_upto(current);
        } else if urgency == CheckpointUrgency::Sync {
            core.demand
                .flush_upto(current.saturating_sub(margins.max_modified_age_async));
        }

        core.writer.write_up_to(core, current, true)?;
        let end_lsn = core.watermarks.flushed();
        let oldest = core
            .demand
            .oldest_dirty_lsn()
            .map_or(end_lsn, |lsn| lsn.min(end_lsn));

        let last = self.last();
        let checkpoint_lsn = oldest.max(last.checkpoint_lsn);
        if checkpoint_lsn == last.checkpoint_lsn && !force {
            debug!(checkpoint_lsn, "log.checkpoint.no_progress");
            return Ok(false);
        }

        let checkpoint_no = last.checkpoint_no + 1;
        let crypto = match &core.crypto {
            Some(codec) => Some(codec.begin_epoch(checkpoint_no)?),
            None => None,
        };
        let record = CheckpointRecord {
            checkpoint_no,
            checkpoint_lsn,
            end_lsn,
            crypto,
        };

        core.writer.write_checkpoint(core, &record)?;

        *self.last.lock() = record;
        self.checkpoint_no.store(checkpoint_no, Ordering::SeqCst);
        core.watermarks.set_checkpoint(checkpoint_lsn);
        core.stats.record_checkpoint();

        info!(
            checkpoint_no,
            checkpoint_lsn,
            end_lsn,
            urgency = ?urgency,
            "log.checkpoint.written"
        );

        core.resize.on_checkpoint(core, checkpoint_lsn);
        Ok(true)
    }

    /// Rate-limited warning for a single record larger than the checkpoint age
    pub(crate) fn warn_oversize(&self, core: &LogCore, record_len: usize, lsn: Lsn) {
        let mut last = self.last_oversize_warning.lock();
        let now = Instant::now();
        if last.is_some_and(|at| now.duration_since(at) < OVERSIZE_WARNING_INTERVAL) {
            return;
        }
        *last = Some(now);

        let margins = self.margins();
        warn!(
            record_len,
            lsn,
            max_checkpoint_age = margins.max_checkpoint_age,
            "log.checkpoint.age_exceeds_margin"
        );
        core.status.record(
            Severity::Warning,
            "checkpoint",
            format!(
                "checkpoint age exceeds max_checkpoint_age {} after a {} byte record",
                margins.max_checkpoint_age, record_len
            ),
            lsn,
        );
    }
}
