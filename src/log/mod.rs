//! Redo Log Module
//!
//! The in-memory tail, the on-disk circular file and the group-commit
//! writer between them.
//!
//! ## Responsibilities
//! - Frame appended bytes into checksummed blocks
//! - Double-buffer the tail so appends continue while a write is in flight
//! - Write blocks in LSN order, one physical I/O per group commit
//! - Find the end of an existing log on startup

pub mod block;
mod buffer;
mod file;
mod reader;
mod recovery;
mod writer;

pub use buffer::{LogBuffer, PromotedArea, Reservation};
pub use file::{
    build_header_region, header_size, IoMode, LogFile, LogFileHeader, CHECKPOINT_1, CHECKPOINT_2,
    FORMAT_ENCRYPTED, LOG_CREATOR, LOG_FILE_HDR_SIZE, LOG_FILE_NAME, LOG_FORMAT, RESIZE_FILE_NAME,
};
pub use reader::{verify_block, BlockDefect, LogReader};
pub use recovery::{LogRecovery, RecoveryResult};
pub use writer::{IoInterceptor, Watermarks, Writer, WriterPhase};

pub(crate) use writer::seal_block;
