//! Log File
//!
//! A fixed header region followed by a circular body.
//!
//! ```text
//! 0          512                 1536                header_size         file_size
//! ┌──────────┬────────┬──────────┬────────┬──────────┬───────────────────┐
//! │ header   │ ckpt 1 │          │ ckpt 2 │          │ circular body     │
//! │ block    │ (even) │          │ (odd)  │          │ (blocks)          │
//! └──────────┴────────┴──────────┴────────┴──────────┴───────────────────┘
//! ```
//!
//! Header block: format tag (4) | block size (4) | first LSN (8) |
//! creator (32) | ... | crc32 of bytes 0..508 at 508.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use memmap2::MmapMut;
use parking_lot::{Mutex, RwLock};

use crate::checkpoint::CheckpointRecord;
use crate::error::{AtlasError, Result};
use crate::lsn::{BlockGeometry, Lsn, LsnMapper};

pub const LOG_FILE_NAME: &str = "ib_logfile0";
pub const RESIZE_FILE_NAME: &str = "ib_logfile101";

pub const LOG_FORMAT: u32 = 0x4154_4C47;
pub const FORMAT_ENCRYPTED: u32 = 1 << 31;

pub const LOG_FILE_HDR_SIZE: u64 = 2048;
pub const CHECKPOINT_1: u64 = 512;
pub const CHECKPOINT_2: u64 = 1536;

const HEADER_BLOCK_LEN: usize = 512;
const HEADER_CHECKSUM_AT: usize = 508;
const CREATOR_AT: usize = 16;
const CREATOR_LEN: usize = 32;

pub const LOG_CREATOR: &str = concat!("AtlasLog ", env!("CARGO_PKG_VERSION"));

/// Size of the header region for a block size
pub fn header_size(block_size: usize) -> u64 {
    LOG_FILE_HDR_SIZE.max(block_size as u64)
}

/// Physical I/O path of the log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IoMode {
    /// Positioned writes plus fdatasync
    #[default]
    Normal,
    /// Writes into a shared mapping of the circular file, persisted with msync
    CircularMmap,
    /// `CircularMmap` with continuous archiving from open to shutdown
    ArchivedMmap,
}

impl IoMode {
    pub fn is_mmap(&self) -> bool {
        !matches!(self, IoMode::Normal)
    }
}

/// Decoded header block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFileHeader {
    pub block_size: u32,
    pub first_lsn: Lsn,
    pub creator: String,
    pub encrypted: bool,
}

impl LogFileHeader {
    pub fn new(geometry: &BlockGeometry, first_lsn: Lsn, encrypted: bool) -> Self {
        Self {
            block_size: geometry.block_size() as u32,
            first_lsn,
            creator: LOG_CREATOR.to_string(),
            encrypted,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_BLOCK_LEN] {
        let mut buf = [0u8; HEADER_BLOCK_LEN];
        let format = if self.encrypted {
            LOG_FORMAT | FORMAT_ENCRYPTED
        } else {
            LOG_FORMAT
        };
        buf[0..4].copy_from_slice(&format.to_be_bytes());
        buf[4..8].copy_from_slice(&self.block_size.to_be_bytes());
        buf[8..16].copy_from_slice(&self.first_lsn.to_be_bytes());
        let creator = self.creator.as_bytes();
        let n = creator.len().min(CREATOR_LEN);
        buf[CREATOR_AT..CREATOR_AT + n].copy_from_slice(&creator[..n]);
        let checksum = crc32fast::hash(&buf[..HEADER_CHECKSUM_AT]);
        buf[HEADER_CHECKSUM_AT..].copy_from_slice(&checksum.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_BLOCK_LEN {
            return Err(AtlasError::Corruption("log header is truncated".to_string()));
        }
        let u32_at = |at: usize| u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);

        if crc32fast::hash(&buf[..HEADER_CHECKSUM_AT]) != u32_at(HEADER_CHECKSUM_AT) {
            return Err(AtlasError::Corruption("log header checksum mismatch".to_string()));
        }

        let format = u32_at(0);
        if format & !FORMAT_ENCRYPTED != LOG_FORMAT {
            return Err(AtlasError::Corruption(format!(
                "unknown log format tag {:#010x}",
                format
            )));
        }

        let mut lsn = [0u8; 8];
        lsn.copy_from_slice(&buf[8..16]);
        let creator = &buf[CREATOR_AT..CREATOR_AT + CREATOR_LEN];
        let end = creator.iter().position(|&b| b == 0).unwrap_or(CREATOR_LEN);

        Ok(Self {
            block_size: u32_at(4),
            first_lsn: u64::from_be_bytes(lsn),
            creator: String::from_utf8_lossy(&creator[..end]).into_owned(),
            encrypted: format & FORMAT_ENCRYPTED != 0,
        })
    }
}

/// Full header region: header block plus any checkpoint slots
pub fn build_header_region(header: &LogFileHeader, checkpoints: &[CheckpointRecord]) -> Vec<u8> {
    let mut region = vec![0u8; header_size(header.block_size as usize) as usize];
    region[..HEADER_BLOCK_LEN].copy_from_slice(&header.encode());
    for record in checkpoints {
        let at = record.slot_offset() as usize;
        let bytes = record.encode();
        region[at..at + bytes.len()].copy_from_slice(&bytes);
    }
    region
}

/// An open log file
///
/// All methods take `&self`: positioned I/O goes through a short file
/// mutex, mapped I/O through the mapping's RwLock.
pub struct LogFile {
    path: PathBuf,
    file: Mutex<File>,
    map: Option<RwLock<MmapMut>>,
    header: LogFileHeader,
    file_size: u64,
    mapper: LsnMapper,
    mode: IoMode,
}

impl LogFile {
    /// Create (or truncate) a log file and write its header region
    pub fn create(
        path: &Path,
        file_size: u64,
        geometry: &BlockGeometry,
        first_lsn: Lsn,
        mode: IoMode,
        encrypted: bool,
        checkpoint: Option<&CheckpointRecord>,
    ) -> Result<Self> {
        let header = LogFileHeader::new(geometry, first_lsn, encrypted);
        let mapper = LsnMapper::new(header_size(geometry.block_size()), file_size, first_lsn)?;

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        file.set_len(file_size).map_err(|e| {
            AtlasError::ResourceExhausted(format!(
                "cannot allocate {} bytes for {}: {}",
                file_size,
                path.display(),
                e
            ))
        })?;

        let checkpoints: Vec<CheckpointRecord> = checkpoint.into_iter().copied().collect();
        file.write_all(&build_header_region(&header, &checkpoints))?;
        file.sync_all()?;

        let map = Self::map(&file, mode)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            map,
            header,
            file_size,
            mapper,
            mode,
        })
    }

    /// Open an existing log file and validate its header
    pub fn open(path: &Path, mode: IoMode) -> Result<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let file_size = file.metadata()?.len();

        let mut buf = [0u8; HEADER_BLOCK_LEN];
        file.read_exact(&mut buf).map_err(|_| {
            AtlasError::Corruption(format!("{} is too short for a log header", path.display()))
        })?;
        let header = LogFileHeader::decode(&buf)?;
        let geometry = BlockGeometry::new(header.block_size as usize)?;
        let mapper = LsnMapper::new(header_size(geometry.block_size()), file_size, header.first_lsn)?;

        if mapper.capacity() % geometry.block_size() as u64 != 0 {
            return Err(AtlasError::Corruption(format!(
                "log body of {} is not block aligned",
                path.display()
            )));
        }

        let map = Self::map(&file, mode)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            map,
            header,
            file_size,
            mapper,
            mode,
        })
    }

    fn map(file: &File, mode: IoMode) -> Result<Option<RwLock<MmapMut>>> {
        if !mode.is_mmap() {
            return Ok(None);
        }
        // SAFETY: the log file is owned by this process; nothing truncates
        // it while the mapping is alive.
        let map = unsafe { MmapMut::map_mut(file) }?;
        Ok(Some(RwLock::new(map)))
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &LogFileHeader {
        &self.header
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn capacity(&self) -> u64 {
        self.mapper.capacity()
    }

    pub fn mapper(&self) -> &LsnMapper {
        &self.mapper
    }

    pub fn first_lsn(&self) -> Lsn {
        self.mapper.first_lsn()
    }

    pub fn mode(&self) -> IoMode {
        self.mode
    }

    pub fn block_size(&self) -> usize {
        self.header.block_size as usize
    }

    // =========================================================================
    // I/O
    // =========================================================================

    /// Write block images starting at block-aligned `lsn`, splitting at the wrap point
    pub fn write_at_lsn(&self, lsn: Lsn, data: &[u8]) -> io::Result<()> {
        let mut lsn = lsn;
        let mut data = data;
        while !data.is_empty() {
            let n = (data.len() as u64).min(self.mapper.bytes_until_wrap(lsn)) as usize;
            self.write_at(self.mapper.calc_offset(lsn), &data[..n])?;
            data = &data[n..];
            lsn += n as u64;
        }
        Ok(())
    }

    /// Read block images starting at block-aligned `lsn`
    pub fn read_at_lsn(&self, lsn: Lsn, buf: &mut [u8]) -> io::Result<()> {
        let mut lsn = lsn;
        let mut done = 0;
        while done < buf.len() {
            let n = ((buf.len() - done) as u64).min(self.mapper.bytes_until_wrap(lsn)) as usize;
            self.read_at(self.mapper.calc_offset(lsn), &mut buf[done..done + n])?;
            done += n;
            lsn += n as u64;
        }
        Ok(())
    }

    fn write_at(&self, offset: u64, bytes: &[u8]) -> io::Result<()> {
        match &self.map {
            Some(map) => {
                let start = offset as usize;
                map.write()[start..start + bytes.len()].copy_from_slice(bytes);
                Ok(())
            }
            None => {
                let mut file = self.file.lock();
                file.seek(SeekFrom::Start(offset))?;
                file.write_all(bytes)
            }
        }
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        match &self.map {
            Some(map) => {
                let start = offset as usize;
                buf.copy_from_slice(&map.read()[start..start + buf.len()]);
                Ok(())
            }
            None => {
                let mut file = self.file.lock();
                file.seek(SeekFrom::Start(offset))?;
                file.read_exact(buf)
            }
        }
    }

    /// Make every completed write durable
    pub fn persist(&self) -> io::Result<()> {
        match &self.map {
            Some(map) => map.read().flush(),
            None => self.file.lock().sync_data(),
        }
    }

    /// Write a checkpoint record into its slot and persist it
    pub fn write_checkpoint(&self, record: &CheckpointRecord) -> io::Result<()> {
        self.write_at(record.slot_offset(), &record.encode())?;
        self.persist()
    }

    /// Both checkpoint slots, raw
    pub fn read_checkpoint_slots(&self) -> io::Result<[Vec<u8>; 2]> {
        let len = crate::checkpoint::CHECKPOINT_SLOT_LEN;
        let mut first = vec![0u8; len];
        let mut second = vec![0u8; len];
        self.read_at(CHECKPOINT_1, &mut first)?;
        self.read_at(CHECKPOINT_2, &mut second)?;
        Ok([first, second])
    }
}
