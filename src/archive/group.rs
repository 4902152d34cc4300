//! Archive Group
//!
//! One contiguous archived range, stored as a series of files under
//! `<archive_dir>/grp_<begin>/`. Each file covers one capacity-sized
//! extent of LSNs, laid out exactly like the live log body so a file
//! can be opened and read like a log of its own.

use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::checkpoint::CheckpointRecord;
use crate::error::{AtlasError, Result};
use crate::log::{build_header_region, header_size, LogFileHeader, CHECKPOINT_1, CHECKPOINT_2};
use crate::lsn::{BlockGeometry, Lsn};

pub const META_FILE_NAME: &str = "archive.meta";
const GROUP_DIR_PREFIX: &str = "grp_";

/// Persisted description of a group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveMeta {
    pub begin_lsn: Lsn,
    pub file_size: u64,
    pub block_size: u32,
    pub durable: bool,
    /// Set once archiving for the group stopped
    pub end_lsn: Option<Lsn>,
}

impl ArchiveMeta {
    pub fn load(group_dir: &Path) -> Result<Self> {
        let bytes = fs::read(group_dir.join(META_FILE_NAME))?;
        Ok(bincode::deserialize(&bytes)?)
    }

    fn store(&self, group_dir: &Path) -> Result<()> {
        let tmp = group_dir.join(format!("{}.tmp", META_FILE_NAME));
        let mut file = File::create(&tmp)?;
        file.write_all(&bincode::serialize(self)?)?;
        file.sync_all()?;
        fs::rename(&tmp, group_dir.join(META_FILE_NAME))?;
        Ok(())
    }
}

pub fn archive_file_name(extent_lsn: Lsn) -> String {
    format!("ib_{:016x}.log", extent_lsn)
}

/// Group directories under `archive_dir`, oldest begin first
pub fn list_group_dirs(archive_dir: &Path) -> Result<Vec<PathBuf>> {
    if !archive_dir.exists() {
        return Ok(Vec::new());
    }
    let mut dirs: Vec<PathBuf> = fs::read_dir(archive_dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_dir()
                && path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(GROUP_DIR_PREFIX))
        })
        .collect();
    dirs.sort();
    Ok(dirs)
}

/// Archive files of a group directory, in LSN order
pub fn list_archive_files(group_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = fs::read_dir(group_dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "log"))
        .collect();
    files.sort();
    Ok(files)
}

/// Remove groups a previous run left behind that nobody asked to keep
pub fn discard_stale(archive_dir: &Path) -> Result<usize> {
    let mut removed = 0;
    for dir in list_group_dirs(archive_dir)? {
        let keep = matches!(ArchiveMeta::load(&dir), Ok(meta) if meta.durable);
        if !keep {
            fs::remove_dir_all(&dir)?;
            warn!(dir = %dir.display(), "archive.group.stale_removed");
            removed += 1;
        }
    }
    Ok(removed)
}

struct OpenExtent {
    start_lsn: Lsn,
    file: File,
}

struct GroupState {
    active: bool,
    failed: bool,
    /// Clients holding the group (started or stopped, not yet released)
    ref_count: usize,
    /// Clients that have not stopped yet
    active_clients: usize,
    durable: bool,
    end_lsn: Option<Lsn>,
    files: Vec<PathBuf>,
    current: Option<OpenExtent>,
    purged: bool,
}

pub struct ArchiveGroup {
    dir: PathBuf,
    begin_lsn: Lsn,
    geometry: BlockGeometry,
    file_size: u64,
    checkpoint: CheckpointRecord,
    encrypted: bool,
    state: Mutex<GroupState>,
}

impl ArchiveGroup {
    /// Create the group directory for a range starting at `checkpoint`
    pub(crate) fn create(
        archive_dir: &Path,
        checkpoint: CheckpointRecord,
        geometry: BlockGeometry,
        file_size: u64,
        encrypted: bool,
        durable: bool,
    ) -> Result<Self> {
        let begin_lsn = checkpoint.checkpoint_lsn;
        fs::create_dir_all(archive_dir)?;

        let base = format!("{}{:016x}", GROUP_DIR_PREFIX, begin_lsn);
        let mut dir = archive_dir.join(&base);
        let mut n = 1;
        while dir.exists() {
            dir = archive_dir.join(format!("{}_{}", base, n));
            n += 1;
        }
        fs::create_dir(&dir)?;

        let group = Self {
            dir,
            begin_lsn,
            geometry,
            file_size,
            checkpoint,
            encrypted,
            state: Mutex::new(GroupState {
                active: true,
                failed: false,
                ref_count: 0,
                active_clients: 0,
                durable,
                end_lsn: None,
                files: Vec::new(),
                current: None,
                purged: false,
            }),
        };
        group.store_meta(&group.state.lock())?;

        info!(begin_lsn, dir = %group.dir.display(), durable, "archive.group.created");
        Ok(group)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn begin_lsn(&self) -> Lsn {
        self.begin_lsn
    }

    /// Block-aligned begin; extents are counted from here
    pub fn aligned_begin(&self) -> Lsn {
        self.geometry.align_down(self.begin_lsn)
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn block_size(&self) -> usize {
        self.geometry.block_size()
    }

    pub fn header_size(&self) -> u64 {
        header_size(self.geometry.block_size())
    }

    /// Body bytes per archive file
    pub fn capacity(&self) -> u64 {
        self.file_size - self.header_size()
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().active
    }

    pub fn is_failed(&self) -> bool {
        self.state.lock().failed
    }

    pub fn is_durable(&self) -> bool {
        self.state.lock().durable
    }

    pub fn ref_count(&self) -> usize {
        self.state.lock().ref_count
    }

    pub fn active_clients(&self) -> usize {
        self.state.lock().active_clients
    }

    pub fn end_lsn(&self) -> Option<Lsn> {
        self.state.lock().end_lsn
    }

    /// Files written so far
    pub fn files(&self) -> Vec<PathBuf> {
        self.state.lock().files.clone()
    }

    /// First LSN of the extent holding `lsn`
    pub fn extent_start(&self, lsn: Lsn) -> Lsn {
        let aligned = self.aligned_begin();
        aligned + (lsn - aligned) / self.capacity() * self.capacity()
    }

    pub fn file_path(&self, extent_lsn: Lsn) -> PathBuf {
        self.dir.join(archive_file_name(extent_lsn))
    }

    /// Header region of the archive file for the extent at `extent_lsn`.
    /// Both checkpoint slots hold `checkpoint`.
    pub fn header_region(&self, extent_lsn: Lsn, checkpoint: &CheckpointRecord) -> Vec<u8> {
        let header = LogFileHeader::new(&self.geometry, extent_lsn, self.encrypted);
        let mut region = build_header_region(&header, std::slice::from_ref(checkpoint));
        let slot = checkpoint.encode();
        for at in [CHECKPOINT_1, CHECKPOINT_2] {
            let at = at as usize;
            region[at..at + slot.len()].copy_from_slice(&slot);
        }
        region
    }

    // =========================================================================
    // Client bookkeeping
    // =========================================================================

    pub(crate) fn attach(&self, durable: bool) -> Result<()> {
        let mut state = self.state.lock();
        state.ref_count += 1;
        state.active_clients += 1;
        if durable && !state.durable {
            state.durable = true;
            self.store_meta(&state)?;
        }
        Ok(())
    }

    /// Returns the number of clients still archiving
    pub(crate) fn detach(&self) -> usize {
        let mut state = self.state.lock();
        state.active_clients = state.active_clients.saturating_sub(1);
        state.active_clients
    }

    /// Drop one reference; frees the group once unreferenced and inactive.
    /// Returns true while the group is still referenced or active.
    pub(crate) fn release(&self) -> bool {
        let mut state = self.state.lock();
        state.ref_count = state.ref_count.saturating_sub(1);
        if state.ref_count > 0 || state.active {
            return true;
        }
        self.destroy(&mut state);
        false
    }

    /// Stop archiving into this group at `end_lsn`
    pub(crate) fn disable(&self, end_lsn: Lsn, failed: bool) {
        let mut state = self.state.lock();
        if !state.active {
            return;
        }
        state.active = false;
        state.failed = failed;
        state.end_lsn = Some(end_lsn);

        if let Some(extent) = state.current.take() {
            if state.durable {
                if let Err(e) = extent.file.sync_all() {
                    warn!(error = %e, "archive.group.final_sync_failed");
                }
            }
        }
        if let Err(e) = self.store_meta(&state) {
            warn!(error = %e, dir = %self.dir.display(), "archive.group.meta_write_failed");
        }
        info!(begin_lsn = self.begin_lsn, end_lsn, failed, "archive.group.disabled");

        if state.ref_count == 0 {
            self.destroy(&mut state);
        }
    }

    /// Non-durable groups take their files with them
    fn destroy(&self, state: &mut GroupState) {
        state.current = None;
        if state.durable || state.purged {
            return;
        }
        state.purged = true;
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => debug!(dir = %self.dir.display(), "archive.group.purged"),
            Err(e) => warn!(error = %e, dir = %self.dir.display(), "archive.group.purge_failed"),
        }
    }

    fn store_meta(&self, state: &GroupState) -> Result<()> {
        ArchiveMeta {
            begin_lsn: self.begin_lsn,
            file_size: self.file_size,
            block_size: self.geometry.block_size() as u32,
            durable: state.durable,
            end_lsn: state.end_lsn,
        }
        .store(&self.dir)
    }

    // =========================================================================
    // Copy target
    // =========================================================================

    /// Append block images starting at block-aligned `lsn`.
    ///
    /// Rolls to a new file at every extent boundary. A no-op once the
    /// group is inactive.
    pub(crate) fn write(&self, lsn: Lsn, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        if !state.active {
            return Ok(());
        }

        let capacity = self.capacity();
        let header_size = self.header_size();
        let mut lsn = lsn;
        let mut data = data;

        while !data.is_empty() {
            let extent = self.extent_start(lsn);
            let needs_roll = state.current.as_ref().map_or(true, |c| c.start_lsn != extent);
            if needs_roll {
                self.roll(&mut state, extent)?;
            }

            let n = (data.len() as u64).min(extent + capacity - lsn) as usize;
            let durable = state.durable;
            let current = state
                .current
                .as_mut()
                .ok_or_else(|| AtlasError::Archive("no open archive file".to_string()))?;
            current.file.seek(SeekFrom::Start(header_size + (lsn - extent)))?;
            current.file.write_all(&data[..n])?;
            if durable {
                current.file.sync_data()?;
            }

            data = &data[n..];
            lsn += n as u64;
        }
        Ok(())
    }

    fn roll(&self, state: &mut GroupState, extent: Lsn) -> Result<()> {
        if let Some(previous) = state.current.take() {
            if state.durable {
                previous.file.sync_all()?;
            }
        }

        let path = self.file_path(extent);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(self.file_size)?;
        file.write_all(&self.header_region(extent, &self.checkpoint))?;
        if state.durable {
            file.sync_all()?;
        }

        debug!(extent_lsn = extent, path = %path.display(), "archive.group.file_created");
        state.files.push(path);
        state.current = Some(OpenExtent {
            start_lsn: extent,
            file,
        });
        Ok(())
    }
}
