//! Archive Client
//!
//! One consumer of archived log. A client moves `Init → Started →
//! Stopped` and is detached by `release` (or on drop).

use std::path::Path;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use tracing::warn;

use crate::engine::LogCore;
use crate::error::{AtlasError, Result};
use crate::lsn::Lsn;

use super::group::ArchiveGroup;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Init,
    Started,
    Stopped,
}

pub struct ArchiveClient {
    core: Weak<LogCore>,
    group: Option<Arc<ArchiveGroup>>,
    state: ClientState,
    durable: bool,
    begin_lsn: Lsn,
    end_lsn: Option<Lsn>,
    header: Bytes,
    trailer: Bytes,
}

impl std::fmt::Debug for ArchiveClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveClient")
            .field("state", &self.state)
            .field("durable", &self.durable)
            .field("begin_lsn", &self.begin_lsn)
            .field("end_lsn", &self.end_lsn)
            .finish()
    }
}

impl ArchiveClient {
    pub(crate) fn new(core: &Arc<LogCore>, durable: bool) -> Self {
        Self {
            core: Arc::downgrade(core),
            group: None,
            state: ClientState::Init,
            durable,
            begin_lsn: 0,
            end_lsn: None,
            header: Bytes::new(),
            trailer: Bytes::new(),
        }
    }

    pub(crate) fn started(&mut self, group: Arc<ArchiveGroup>, begin_lsn: Lsn, header: Bytes) {
        self.group = Some(group);
        self.begin_lsn = begin_lsn;
        self.header = header;
        self.state = ClientState::Started;
    }

    pub(crate) fn stopped(&mut self, end_lsn: Lsn, trailer: Bytes) {
        self.end_lsn = Some(end_lsn);
        self.trailer = trailer;
        self.state = ClientState::Stopped;
    }

    /// Stop failed after the client was detached
    pub(crate) fn abandoned(&mut self) {
        self.end_lsn = None;
        self.state = ClientState::Stopped;
    }

    pub(crate) fn take_group(&mut self) -> Option<Arc<ArchiveGroup>> {
        self.group.take()
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn group(&self) -> Option<&Arc<ArchiveGroup>> {
        self.group.as_ref()
    }

    /// Checkpoint LSN archiving started from
    pub fn begin_lsn(&self) -> Lsn {
        self.begin_lsn
    }

    pub fn end_lsn(&self) -> Option<Lsn> {
        self.end_lsn
    }

    /// Log file header region for the first archive file of this client
    pub fn header(&self) -> &Bytes {
        &self.header
    }

    /// Image of the partial block holding `end_lsn`
    pub fn trailer(&self) -> &Bytes {
        &self.trailer
    }

    /// Report the archive files holding `[begin_lsn, end_lsn)`.
    ///
    /// The callback gets `(path, size, offset)`: read the file from
    /// `offset` up to `size`, then append the trailer. When the whole
    /// range lies in one block the callback runs once with no path; the
    /// trailer holds the data.
    pub fn get_files<F>(&self, mut callback: F) -> Result<()>
    where
        F: FnMut(Option<&Path>, u64, u64) -> Result<()>,
    {
        let (group, end_lsn) = match (&self.group, self.state, self.end_lsn) {
            (Some(group), ClientState::Stopped, Some(end)) => (group, end),
            _ => {
                return Err(AtlasError::InvalidState(format!(
                    "archive files are available after stop, client is {:?}",
                    self.state
                )))
            }
        };

        let block_size = group.block_size() as u64;
        let align_down = |lsn: Lsn| lsn - lsn % block_size;

        // The block holding end_lsn is the trailer, not part of any file
        let last_block = align_down(end_lsn);
        if align_down(self.begin_lsn) == last_block {
            return callback(None, 0, 0);
        }

        // Every file starts with its own header region; block images follow
        let capacity = group.capacity();
        let header = group.header_size();
        let first_block = align_down(self.begin_lsn);
        let mut extent = group.extent_start(self.begin_lsn);

        while extent < last_block {
            let path = group.file_path(extent);
            let offset = header + first_block.max(extent) - extent;
            let size = header + (extent + capacity).min(last_block) - extent;
            callback(Some(&path), size, offset)?;
            extent += capacity;
        }
        Ok(())
    }
}

impl Drop for ArchiveClient {
    fn drop(&mut self) {
        let Some(group) = self.group.take() else {
            return;
        };
        // Best effort: the engine may already be gone
        match self.core.upgrade() {
            Some(core) => {
                if self.state == ClientState::Started {
                    core.archive.detach(&group);
                }
                core.archive.release(&group);
            }
            None => {
                if self.state == ClientState::Started {
                    group.detach();
                }
                if group.release() {
                    warn!(begin_lsn = group.begin_lsn(), "archive.client.dropped_with_group_active");
                }
            }
        }
    }
}
