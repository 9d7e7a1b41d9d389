//! vellum — the paged memory-file storage substrate of an embedded,
//! single-file document database.
//!
//! The crate pairs a thread-safe, fixed-size page cache with a write-ahead
//! log: callers read position-addressed pages through short-lived readers,
//! mutate by handing batches of dirty pages to a single background writer,
//! and rely on the confirm/checkpoint protocol for atomic multi-page
//! transactions and crash recovery.
//!
//! ```no_run
//! use vellum::{FileOptions, PagedFile, PagePos, PageKind};
//! use vellum::types::page::{self, PAGE_HDR_LEN};
//!
//! # fn main() -> vellum::Result<()> {
//! let file = PagedFile::open("demo.db", FileOptions::default())?;
//! let tx = file.begin_tx();
//! let buf = {
//!     let mut reader = file.reader(true);
//!     let buf = reader.new_page(PagePos(0), PageKind::Data)?;
//!     let mut data = buf.data_mut();
//!     data[PAGE_HDR_LEN..].fill(0xAA);
//!     page::write_tx_id(&mut data, tx);
//!     page::write_confirmed(&mut data, true);
//!     drop(data);
//!     buf
//! };
//! file.write(vec![buf])?;
//! file.close()?;
//! # Ok(())
//! # }
//! ```

pub mod file;
pub mod primitives;
pub mod types;

pub use crate::file::{
    CheckpointMode, FileOptions, FileReader, FileStatsSnapshot, PagedFile,
};
pub use crate::primitives::io::{DiskFactory, FileDiskFactory, FileMode, FileStream, StreamPool};
pub use crate::primitives::memory::{MemoryStore, PageBuffer, PageBufferRef};
pub use crate::types::page::{PageHeader, PageKind};
pub use crate::types::{FileOrigin, PagePos, Result, TxId, VellumError};
