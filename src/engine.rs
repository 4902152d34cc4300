//! Engine Module
//!
//! The log engine context that owns every component.
//!
//! ## Responsibilities
//! - Open or create the log and find its end after a crash
//! - Frame appended records into the buffer and trigger group commit
//! - Keep the checkpoint age inside the margins of the smallest log file
//! - Expose online resize and archiving to outside callers
//! - Run the background flusher and archiver threads

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use crossbeam::channel::{self, select};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::archive::{self, ArchiveClient, ArchiveCoordinator, ClientState};
use crate::checkpoint::{
    CheckpointManager, CheckpointMargins, CheckpointRecord, CheckpointUrgency, DurabilityDemand, NoDirtyPages,
};
use crate::config::{Config, FatalPolicy};
use crate::crypto::{CryptoCodec, KeyManagement};
use crate::error::{AtlasError, Result};
use crate::log::{IoInterceptor, LogBuffer, LogFile, LogReader, LogRecovery, Watermarks, Writer, LOG_FILE_NAME};
use crate::lsn::{BlockGeometry, Lsn, FIRST_LSN, LOG_BLOCK_HDR_SIZE};
use crate::resize::{ResizeController, ResizeStatus};
use crate::status::{LogStats, LogStatus, StatsSnapshot, StatusBoard};
use crate::wait::{ShutdownSignal, WaitPolicy};

/// Outside collaborators of the engine
#[derive(Clone)]
pub struct Collaborators {
    /// Buffer pool view used by checkpoints
    pub demand: Arc<dyn DurabilityDemand>,
    /// Required when `Config::encryption` is on
    pub key_management: Option<Arc<dyn KeyManagement>>,
    /// Consulted before every physical write and flush
    pub io_interceptor: Option<Arc<dyn IoInterceptor>>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            demand: Arc::new(NoDirtyPages),
            key_management: None,
            io_interceptor: None,
        }
    }
}

/// State shared by the engine, its background threads and archive clients
pub(crate) struct LogCore {
    pub(crate) config: Config,
    pub(crate) geometry: BlockGeometry,
    pub(crate) buffer: Mutex<LogBuffer>,
    pub(crate) watermarks: Watermarks,
    file: RwLock<Arc<LogFile>>,
    pub(crate) writer: Writer,
    pub(crate) checkpoint: CheckpointManager,
    pub(crate) resize: ResizeController,
    pub(crate) archive: ArchiveCoordinator,
    pub(crate) crypto: Option<CryptoCodec>,
    pub(crate) demand: Arc<dyn DurabilityDemand>,
    pub(crate) interceptor: Option<Arc<dyn IoInterceptor>>,
    pub(crate) shutdown: ShutdownSignal,
    pub(crate) status: StatusBoard,
    pub(crate) stats: LogStats,
}

impl LogCore {
    /// The live log file
    pub(crate) fn current_file(&self) -> Arc<LogFile> {
        Arc::clone(&self.file.read())
    }

    /// Swap in a new live file (resize rename), under the writer I/O lock
    pub(crate) fn replace_file(&self, file: Arc<LogFile>) {
        *self.file.write() = file;
    }

    pub(crate) fn wait_policy(&self) -> WaitPolicy {
        WaitPolicy {
            timeout: self.config.wait_timeout(),
            alert_interval: self.config.alert_interval(),
        }
    }

    /// Apply the fatal policy. Returns the error when it is to be propagated.
    pub(crate) fn escalate(&self, err: AtlasError) -> AtlasError {
        if err.is_fatal() {
            error!(error = %err, policy = ?self.config.fatal_policy, "log.fatal");
            if self.config.fatal_policy == FatalPolicy::Abort {
                std::process::abort();
            }
        }
        err
    }

    pub(crate) fn write_up_to(&self, lsn: Lsn, durable: bool) -> Result<()> {
        self.writer
            .write_up_to(self, lsn, durable)
            .map_err(|e| self.escalate(e))
    }

    pub(crate) fn make_checkpoint(&self) -> Result<bool> {
        self.checkpoint
            .make_checkpoint(self)
            .map_err(|e| self.escalate(e))
    }

    pub(crate) fn maybe_checkpoint(&self) -> Result<bool> {
        self.checkpoint
            .maybe_checkpoint(self)
            .map_err(|e| self.escalate(e))
    }

    fn margins_for(config: &Config, capacity: u64) -> Result<CheckpointMargins> {
        CheckpointMargins::compute(
            capacity,
            config.checkpoint_reserve(),
            config.checkpoint_margin_ratio,
            config.checkpoint_async_ratio,
        )
    }

    /// Recompute the checkpoint margins for the smallest log in use
    pub(crate) fn refresh_margins(&self) -> Result<()> {
        let capacity = self.resize.smallest_capacity(self.current_file().capacity());
        let margins = Self::margins_for(&self.config, capacity)?;
        self.checkpoint.set_margins(margins);
        debug!(
            capacity,
            max_checkpoint_age = margins.max_checkpoint_age,
            max_modified_age_async = margins.max_modified_age_async,
            "log.checkpoint.margins"
        );
        Ok(())
    }
}

/// The redo log engine
///
/// ## Concurrency Model
///
/// - **Appends** serialize on the buffer mutex only for the copy into the
///   buffer; physical I/O happens outside it.
/// - **Commits** go through group commit: one leader writes for everyone
///   waiting, followers sleep on a condition variable.
/// - **Background**: a flusher thread makes the log durable every
///   `flush_interval_ms` and checkpoints when due; an archiver thread
///   copies the log while archive clients are attached.
///
/// Lock order: writer I/O → buffer → resize state → archive state.
pub struct LogEngine {
    core: Arc<LogCore>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    /// Continuous archiving client in `IoMode::ArchivedMmap`
    internal_archive: Mutex<Option<ArchiveClient>>,
}

impl LogEngine {
    /// Open or create a log with no buffer pool and no encryption
    pub fn open(config: Config) -> Result<Self> {
        Self::open_with(config, Collaborators::default())
    }

    /// Open or create a log
    ///
    /// On startup:
    /// 1. Validate the configuration
    /// 2. Remove leftovers of an interrupted resize and of non-durable archiving
    /// 3. Open the log and find its end, or create a fresh one
    /// 4. Start the background threads
    /// 5. Make the recovered (or initial) tail durable
    pub fn open_with(config: Config, collaborators: Collaborators) -> Result<Self> {
        // Step 1: Validate
        config.validate()?;
        let geometry = BlockGeometry::new(config.block_size)?;
        let crypto = match (config.encryption, &collaborators.key_management) {
            (false, _) => None,
            (true, Some(keys)) => Some(CryptoCodec::new(Arc::clone(keys))),
            (true, None) => {
                return Err(AtlasError::Config(
                    "encryption needs a key management collaborator".to_string(),
                ))
            }
        };

        // Step 2: Directories and stale files
        fs::create_dir_all(&config.log_dir)?;
        ResizeController::discard_stale(&config.log_dir)?;
        let archive_dir = config.archive_dir();
        archive::discard_stale(&archive_dir)?;

        // Step 3: Open or create the log file
        let path = config.log_dir.join(LOG_FILE_NAME);
        let hdr = LOG_BLOCK_HDR_SIZE as u64;
        let (file, checkpoint, start_lsn, written, last_block) = if path.exists() {
            let file = LogFile::open(&path, config.io_mode)?;
            if file.block_size() != geometry.block_size() {
                return Err(AtlasError::Config(format!(
                    "log file uses {} byte blocks, configured block size is {}",
                    file.block_size(),
                    geometry.block_size()
                )));
            }
            if file.header().encrypted != crypto.is_some() {
                return Err(AtlasError::Config(format!(
                    "log file encryption is {}, configuration says {}",
                    file.header().encrypted,
                    crypto.is_some()
                )));
            }

            let recovered = LogRecovery::recover(&file, crypto.as_ref())?;
            // Without a usable partial block the block at the end is rewritten fresh
            let written = match recovered.last_block {
                Some(_) => recovered.end_lsn,
                None => geometry.align_down(recovered.end_lsn),
            };
            (
                file,
                recovered.checkpoint,
                recovered.end_lsn,
                written,
                recovered.last_block,
            )
        } else {
            let initial = CheckpointRecord {
                checkpoint_no: 0,
                checkpoint_lsn: FIRST_LSN + hdr,
                end_lsn: FIRST_LSN + hdr,
                crypto: crypto.as_ref().map(|c| c.begin_epoch(0)).transpose()?,
            };
            let file = LogFile::create(
                &path,
                config.log_file_size,
                &geometry,
                FIRST_LSN,
                config.io_mode,
                crypto.is_some(),
                Some(&initial),
            )?;
            info!(path = %path.display(), size = config.log_file_size, "log.created");
            (file, initial, FIRST_LSN + hdr, FIRST_LSN, None)
        };

        let margins = LogCore::margins_for(&config, file.capacity())?;
        let buffer = LogBuffer::new(geometry, config.log_buffer_size, start_lsn, last_block.as_deref())?;

        let core = Arc::new(LogCore {
            geometry,
            buffer: Mutex::new(buffer),
            watermarks: Watermarks::new(start_lsn, written, checkpoint.checkpoint_lsn),
            file: RwLock::new(Arc::new(file)),
            writer: Writer::new(),
            checkpoint: CheckpointManager::new(checkpoint, margins),
            resize: ResizeController::new(&config.log_dir),
            archive: ArchiveCoordinator::new(&archive_dir, config.archive_chunk_size),
            crypto,
            demand: collaborators.demand,
            interceptor: collaborators.io_interceptor,
            shutdown: ShutdownSignal::new(),
            status: StatusBoard::new(),
            stats: LogStats::default(),
            config,
        });

        // Step 4: Background threads
        let engine = Self {
            workers: Mutex::new(Self::spawn_workers(&core)?),
            core,
            internal_archive: Mutex::new(None),
        };

        // Step 5: Durable starting point
        engine.core.write_up_to(start_lsn, true)?;
        info!(
            start_lsn,
            checkpoint_no = checkpoint.checkpoint_no,
            checkpoint_lsn = checkpoint.checkpoint_lsn,
            mode = ?engine.core.config.io_mode,
            "log.opened"
        );

        if engine.core.config.io_mode == crate::log::IoMode::ArchivedMmap {
            let client = engine.archive_start(true)?;
            *engine.internal_archive.lock() = Some(client);
        }

        Ok(engine)
    }

    fn spawn_workers(core: &Arc<LogCore>) -> Result<Vec<JoinHandle<()>>> {
        let mut workers = Vec::new();

        let archiver = Arc::clone(core);
        workers.push(
            thread::Builder::new()
                .name("atlaslog-archiver".to_string())
                .spawn(move || archiver.archive.run(&archiver))?,
        );

        if core.config.flush_interval_ms > 0 {
            let flusher = Arc::clone(core);
            let interval = Duration::from_millis(core.config.flush_interval_ms);
            workers.push(
                thread::Builder::new()
                    .name("atlaslog-flusher".to_string())
                    .spawn(move || run_flusher(&flusher, interval))?,
            );
        }
        Ok(workers)
    }

    // =========================================================================
    // Append and Commit
    // =========================================================================

    /// Append one record; returns the LSN right after it.
    ///
    /// The record is buffered, not written. Pass the returned LSN to
    /// [`LogEngine::commit`] to wait for it to become durable.
    pub fn append(&self, record: &[u8]) -> Result<Lsn> {
        let core = &self.core;
        let mut stalled = false;

        loop {
            let mut buffer = core.buffer.lock();
            let tail = buffer.buffered_lsn();
            let projected = core.geometry.advance(tail, record.len());

            let age = projected.saturating_sub(core.watermarks.checkpoint());
            if !stalled && !record.is_empty() && age > core.checkpoint.margins().max_checkpoint_age {
                drop(buffer);
                if !core
                    .checkpoint
                    .make_room(core, projected)
                    .map_err(|e| core.escalate(e))?
                {
                    stalled = true;
                    core.checkpoint.warn_oversize(core, record.len(), projected);
                }
                continue;
            }

            match buffer.reserve(record.len())? {
                Some(reservation) => {
                    buffer.append(&reservation, record);
                    core.watermarks.set_buffered(reservation.end_lsn);
                    drop(buffer);

                    if core.checkpoint.urgency(reservation.end_lsn, core.watermarks.checkpoint())
                        != CheckpointUrgency::None
                    {
                        core.maybe_checkpoint()?;
                    }
                    return Ok(reservation.end_lsn);
                }
                None => {
                    // Active area is full: hand it to the writer and retry
                    drop(buffer);
                    core.write_up_to(tail, false)?;
                }
            }
        }
    }

    /// Wait until everything up to `lsn` is durable
    pub fn commit(&self, lsn: Lsn) -> Result<()> {
        self.core.write_up_to(lsn, true)
    }

    /// Make the log written (or durable) up to `lsn`
    pub fn write_up_to(&self, lsn: Lsn, durable: bool) -> Result<()> {
        self.core.write_up_to(lsn, durable)
    }

    // =========================================================================
    // Checkpoints
    // =========================================================================

    /// Checkpoint if the log age calls for it; returns true if one was written
    pub fn maybe_checkpoint(&self) -> Result<bool> {
        self.core.maybe_checkpoint()
    }

    /// Write a checkpoint now
    pub fn make_checkpoint(&self) -> Result<bool> {
        self.core.make_checkpoint()
    }

    // =========================================================================
    // Resize
    // =========================================================================

    /// Start resizing the log file to `new_size` bytes; returns the start LSN
    pub fn resize_start(&self, new_size: u64) -> Result<Lsn> {
        let core = &self.core;
        let header = crate::log::header_size(core.geometry.block_size());
        let smallest = core.current_file().capacity().min(new_size.saturating_sub(header));
        LogCore::margins_for(&core.config, smallest).map_err(|e| {
            AtlasError::InvalidArgument(format!("log file of {} bytes is too small: {}", new_size, e))
        })?;

        let start_lsn = core.resize.start(core, new_size)?;
        core.refresh_margins()?;
        Ok(start_lsn)
    }

    /// Finish the resize: checkpoint past the start LSN, then rename.
    /// Returns the new file size.
    pub fn resize_rename(&self) -> Result<u64> {
        if !self.core.resize.in_progress() {
            return Err(AtlasError::InvalidState("no resize in progress".to_string()));
        }
        // A checkpoint past the start LSN commits the resize on its own
        self.core.make_checkpoint()?;
        match self.core.resize.status() {
            ResizeStatus::Committed { size } => Ok(size),
            ResizeStatus::InProgress { .. } => self.core.resize.rename(&self.core),
            other => Err(AtlasError::InvalidState(format!("resize ended as {:?}", other))),
        }
    }

    pub fn resize_abort(&self) -> Result<()> {
        self.core.resize.abort(&self.core)
    }

    pub fn resize_status(&self) -> ResizeStatus {
        self.core.resize.status()
    }

    // =========================================================================
    // Archiving
    // =========================================================================

    /// Start archiving for a new client
    pub fn archive_start(&self, durable: bool) -> Result<ArchiveClient> {
        let mut client = ArchiveClient::new(&self.core, durable);
        let (group, start_lsn, header) = self.core.archive.start(&self.core, durable)?;
        client.started(group, start_lsn, header);
        Ok(client)
    }

    /// Stop archiving for `client`; returns the end LSN and trailer block
    pub fn archive_stop(&self, client: &mut ArchiveClient) -> Result<(Lsn, Bytes)> {
        let group = match (client.state(), client.group()) {
            (ClientState::Started, Some(group)) => Arc::clone(group),
            (state, _) => {
                return Err(AtlasError::InvalidState(format!(
                    "archive stop on a client in state {:?}",
                    state
                )))
            }
        };

        match self.core.archive.stop(&self.core, &group) {
            Ok((end_lsn, trailer)) => {
                client.stopped(end_lsn, trailer.clone());
                Ok((end_lsn, trailer))
            }
            Err(e) => {
                client.abandoned();
                Err(e)
            }
        }
    }

    /// Report the archive files of a stopped client
    pub fn archive_get_files<F>(&self, client: &ArchiveClient, callback: F) -> Result<()>
    where
        F: FnMut(Option<&std::path::Path>, u64, u64) -> Result<()>,
    {
        client.get_files(callback)
    }

    /// Let go of a client's group
    pub fn archive_release(&self, mut client: ArchiveClient) {
        if let Some(group) = client.take_group() {
            if client.state() == ClientState::Started {
                self.core.archive.detach(&group);
            }
            self.core.archive.release(&group);
        }
    }

    // =========================================================================
    // Reads and Status
    // =========================================================================

    /// Payload bytes in `[from, to)`, which must be durable
    pub fn read_payload(&self, from: Lsn, to: Lsn) -> Result<Vec<u8>> {
        let core = &self.core;
        if from > to || to > core.watermarks.flushed() {
            return Err(AtlasError::InvalidArgument(format!(
                "lsn range {}..{} is not durable (flushed up to {})",
                from,
                to,
                core.watermarks.flushed()
            )));
        }

        // Keep the partial last block from being rewritten mid-read
        let _io = core.writer.io.lock();
        let file = core.current_file();
        if from < file.first_lsn() || from + file.capacity() < core.watermarks.write() {
            return Err(AtlasError::InvalidArgument(format!(
                "lsn {} is no longer in the live log (starts at {}, capacity {})",
                from,
                file.first_lsn(),
                file.capacity()
            )));
        }
        LogReader::new(&file, core.crypto.as_ref())?.read_payload(from, to)
    }

    /// Point-in-time status; never waits on log I/O
    pub fn status(&self) -> LogStatus {
        let core = &self.core;
        let flushed_lsn = core.watermarks.flushed();
        let write_lsn = core.watermarks.write();
        let buffered_lsn = core.watermarks.buffered();
        let checkpoint = core.checkpoint.last();

        LogStatus {
            buffered_lsn,
            write_lsn,
            flushed_lsn,
            last_checkpoint_lsn: checkpoint.checkpoint_lsn,
            checkpoint_no: checkpoint.checkpoint_no,
            checkpoint_age: buffered_lsn.saturating_sub(checkpoint.checkpoint_lsn),
            margins: core.checkpoint.margins(),
            writer: core.writer.phase(),
            resize: core.resize.status(),
            archive: core.archive.status(),
            stats: core.stats.snapshot(),
            events: core.status.recent(),
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.core.stats.snapshot()
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Orderly shutdown: stop archiving, stop threads, make the log durable
    /// and write a final checkpoint
    pub fn shutdown(self) -> Result<()> {
        // Step 1: Internal archive client
        let internal = self.internal_archive.lock().take();
        if let Some(mut client) = internal {
            if let Err(e) = self.archive_stop(&mut client) {
                warn!(error = %e, "log.shutdown.archive_stop_failed");
            }
            self.archive_release(client);
        }

        // Step 2: Background threads
        self.stop_workers();

        // Step 3: Durable tail and final checkpoint
        let tail = self.core.watermarks.buffered();
        self.core.write_up_to(tail, true)?;
        self.core.make_checkpoint()?;

        info!(end_lsn = tail, "log.shutdown.complete");
        Ok(())
    }

    /// Signal background threads and blocked waiters to stop.
    ///
    /// In-flight leader I/O still completes; committers waiting on it
    /// return `Interrupted`. `shutdown` or drop finishes the job.
    pub fn request_shutdown(&self) {
        info!("log.shutdown.requested");
        self.core.shutdown.trigger();
    }

    fn stop_workers(&self) {
        self.core.shutdown.trigger();
        for handle in self.workers.lock().drain(..) {
            if handle.join().is_err() {
                warn!("log.shutdown.worker_panicked");
            }
        }
    }

    // =========================================================================
    // Accessors (for testing and debugging)
    // =========================================================================

    pub fn config(&self) -> &Config {
        &self.core.config
    }

    pub fn log_file_path(&self) -> PathBuf {
        self.core.current_file().path().to_path_buf()
    }

    /// Current live file size, header included
    pub fn log_file_size(&self) -> u64 {
        self.core.current_file().file_size()
    }

    pub fn geometry(&self) -> &BlockGeometry {
        &self.core.geometry
    }

    pub fn watermarks(&self) -> &Watermarks {
        &self.core.watermarks
    }

    pub fn buffered_lsn(&self) -> Lsn {
        self.core.watermarks.buffered()
    }

    pub fn flushed_lsn(&self) -> Lsn {
        self.core.watermarks.flushed()
    }

    pub fn last_checkpoint(&self) -> CheckpointRecord {
        self.core.checkpoint.last()
    }

    pub fn margins(&self) -> CheckpointMargins {
        self.core.checkpoint.margins()
    }

    /// Key epochs currently held (empty without encryption)
    pub fn key_epochs(&self) -> Vec<u64> {
        self.core.crypto.as_ref().map(|c| c.epochs()).unwrap_or_default()
    }

    /// Latched writer failure, if any
    pub fn writer_failure(&self) -> Option<String> {
        self.core.writer.failure()
    }
}

impl Drop for LogEngine {
    /// Stops the background threads without flushing
    fn drop(&mut self) {
        self.stop_workers();
    }
}

/// Periodic log sync, once per `interval`
fn run_flusher(core: &LogCore, interval: Duration) {
    let ticker = channel::tick(interval);
    let shutdown = core.shutdown.receiver();
    debug!(interval_ms = interval.as_millis() as u64, "log.flusher.started");

    loop {
        select! {
            recv(shutdown) -> _ => break,
            recv(ticker) -> _ => {}
        }
        if core.shutdown.is_set() {
            break;
        }

        if let Err(e) = core.write_up_to(core.watermarks.buffered(), true) {
            warn!(error = %e, "log.flusher.write_failed");
            if e.is_fatal() {
                break;
            }
            continue;
        }
        if let Err(e) = core.maybe_checkpoint() {
            warn!(error = %e, "log.flusher.checkpoint_failed");
        }
    }
    debug!("log.flusher.stopped");
}
