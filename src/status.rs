//! Operational status
//!
//! Counters are plain atomics and the event ring sits behind a short
//! RwLock, so a status snapshot never waits on log I/O.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use parking_lot::RwLock;

use crate::archive::ArchiveStatus;
use crate::checkpoint::CheckpointMargins;
use crate::log::WriterPhase;
use crate::lsn::Lsn;
use crate::resize::ResizeStatus;

const EVENT_HISTORY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warning,
    Error,
    Fatal,
}

#[derive(Debug, Clone)]
pub struct StatusEvent {
    pub severity: Severity,
    /// "writer", "checkpoint", "resize", "archive", ...
    pub component: &'static str,
    pub message: String,
    pub lsn: Lsn,
    pub at: SystemTime,
}

/// Ring of recent severity-tagged events
pub struct StatusBoard {
    events: RwLock<VecDeque<StatusEvent>>,
}

impl StatusBoard {
    pub(crate) fn new() -> Self {
        Self {
            events: RwLock::new(VecDeque::with_capacity(EVENT_HISTORY)),
        }
    }

    pub(crate) fn record(&self, severity: Severity, component: &'static str, message: impl Into<String>, lsn: Lsn) {
        let mut events = self.events.write();
        if events.len() == EVENT_HISTORY {
            events.pop_front();
        }
        events.push_back(StatusEvent {
            severity,
            component,
            message: message.into(),
            lsn,
            at: SystemTime::now(),
        });
    }

    /// Oldest first
    pub fn recent(&self) -> Vec<StatusEvent> {
        self.events.read().iter().cloned().collect()
    }

    /// Most recent event at or above `severity`
    pub fn last_at_least(&self, severity: Severity) -> Option<StatusEvent> {
        self.events
            .read()
            .iter()
            .rev()
            .find(|e| e.severity >= severity)
            .cloned()
    }
}

/// I/O and activity counters
#[derive(Debug, Default)]
pub struct LogStats {
    promotes: AtomicU64,
    physical_writes: AtomicU64,
    flushes: AtomicU64,
    checkpoints: AtomicU64,
    archived_bytes: AtomicU64,
    archive_aborts: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub promotes: u64,
    /// Body writes to the live log (shadow writes not counted)
    pub physical_writes: u64,
    pub flushes: u64,
    pub checkpoints: u64,
    pub archived_bytes: u64,
    pub archive_aborts: u64,
}

impl LogStats {
    pub(crate) fn record_promote(&self) {
        self.promotes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_write(&self) {
        self.physical_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_flush(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_checkpoint(&self) {
        self.checkpoints.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_archived(&self, bytes: u64) {
        self.archived_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_archive_abort(&self) {
        self.archive_aborts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            promotes: self.promotes.load(Ordering::Relaxed),
            physical_writes: self.physical_writes.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            checkpoints: self.checkpoints.load(Ordering::Relaxed),
            archived_bytes: self.archived_bytes.load(Ordering::Relaxed),
            archive_aborts: self.archive_aborts.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of the engine
#[derive(Debug, Clone)]
pub struct LogStatus {
    pub buffered_lsn: Lsn,
    pub write_lsn: Lsn,
    pub flushed_lsn: Lsn,
    pub last_checkpoint_lsn: Lsn,
    pub checkpoint_no: u64,
    /// `buffered_lsn - last_checkpoint_lsn`
    pub checkpoint_age: u64,
    pub margins: CheckpointMargins,
    pub writer: WriterPhase,
    pub resize: ResizeStatus,
    pub archive: ArchiveStatus,
    pub stats: StatsSnapshot,
    pub events: Vec<StatusEvent>,
}
