//! # AtlasLog
//!
//! A write-ahead redo log engine with:
//! - Block-framed, checksummed log records addressed by LSN
//! - Double-buffered log tail with group commit
//! - Circular log file with two alternating checkpoint slots
//! - Checkpoint margins that keep unconsumed log from being overwritten
//! - Online resize of the log file while writers keep running
//! - Log archiving for backup clients
//! - Optional at-rest encryption of log blocks
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Appenders / Committers                       │
//! │              (append → LSN, commit(LSN))                     │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                     Log Buffer                               │
//! │        (two areas: one filling, one being written)           │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │ group commit leader
//!          ┌────────────┼─────────────────┐
//!          │            │                 │
//!          ▼            ▼                 ▼
//!   ┌─────────────┐ ┌─────────────┐ ┌─────────────┐
//!   │ ib_logfile0 │ │ib_logfile101│ │  Archiver   │
//!   │   (live)    │ │  (resize)   │ │  (groups)   │
//!   └──────┬──────┘ └─────────────┘ └─────────────┘
//!          │
//!          ▼
//!   ┌─────────────┐
//!   │ Checkpoints │
//!   │  (slots)    │
//!   └─────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;
pub mod lsn;

pub mod log;
pub mod checkpoint;
pub mod resize;
pub mod archive;
pub mod crypto;
pub mod status;
pub mod engine;

mod wait;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{AtlasError, ErrorKind, Result};
pub use config::{Config, ConfigBuilder, FatalPolicy, MIN_LOG_FILE_SIZE};
pub use lsn::{BlockGeometry, Lsn, FIRST_LSN, LOG_BLOCK_HDR_SIZE, LOG_BLOCK_TRL_SIZE};
pub use engine::{Collaborators, LogEngine};

pub use checkpoint::{CheckpointMargins, CheckpointRecord, DurabilityDemand, NoDirtyPages};
pub use resize::ResizeStatus;
pub use archive::{ArchiveClient, ArchiveStatus, ArchiverPhase, ClientState};
pub use crypto::{KeyManagement, LocalKeyManagement};
pub use log::{IoInterceptor, IoMode, WriterPhase};
pub use status::{LogStatus, Severity, StatsSnapshot, StatusEvent};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of AtlasLog
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
