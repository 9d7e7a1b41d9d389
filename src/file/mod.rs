#![forbid(unsafe_code)]

//! The paged memory-file: a fixed-size page cache over a data file and an
//! append-only log, drained by one background writer and reconciled by
//! checkpoint and recovery.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::{rngs::OsRng, RngCore};
use tracing::{debug, info, warn};

use crate::primitives::crypto::PageCipher;
use crate::primitives::io::{DiskFactory, FileDiskFactory, FileMode, FileStream, StreamPool};
use crate::primitives::memory::{MemoryStore, PageBufferRef, DEFAULT_MAX_SEGMENTS};
use crate::primitives::quiesce::Quiescence;
use crate::primitives::wal::{LogHeader, LogScanner, WalIndex, LOG_HDR_LEN};
use crate::primitives::writer::FileWriter;
use crate::types::{
    page::{self, PageHeader, PAGE_HDR_LEN, PAGE_SIZE},
    FileOrigin, PagePos, Result, TxId, VellumError,
};

mod reader;

pub use reader::FileReader;

/// Configuration of one paged file.
#[derive(Clone, Debug)]
pub struct FileOptions {
    /// Enables AES page-body encryption when present.
    pub encryption_key: Option<[u8; 32]>,
    /// Log size, in pages, at which a confirmed write triggers an automatic
    /// best-effort checkpoint.
    pub checkpoint_threshold_pages: usize,
    /// Ceiling on memory segments the store may allocate.
    pub max_extend_segments: usize,
    /// Scratch mode: no log, no recovery, file deleted on dispose.
    pub temp: bool,
}

impl Default for FileOptions {
    fn default() -> Self {
        Self {
            encryption_key: None,
            checkpoint_threshold_pages: 1024,
            max_extend_segments: DEFAULT_MAX_SEGMENTS,
            temp: false,
        }
    }
}

/// Mode for checkpoint execution.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CheckpointMode {
    /// Wait for readers and pending transactions, then checkpoint.
    Force,
    /// Skip entirely if anything stands in the way.
    BestEffort,
}

/// Counters mirroring the diagnostic events, so tests can observe behavior
/// without installing a tracing subscriber.
#[derive(Default)]
pub struct FileStats {
    pub(crate) reads: AtomicU64,
    pub(crate) queued_pages: AtomicU64,
    pub(crate) cache_hits: AtomicU64,
    pub(crate) cache_misses: AtomicU64,
    pub(crate) checkpoints: AtomicU64,
    pub(crate) recoveries: AtomicU64,
}

impl FileStats {
    fn snapshot(&self) -> FileStatsSnapshot {
        FileStatsSnapshot {
            reads: self.reads.load(Ordering::Relaxed),
            queued_pages: self.queued_pages.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            checkpoints: self.checkpoints.load(Ordering::Relaxed),
            recoveries: self.recoveries.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`FileStats`].
#[derive(Clone, Copy, Debug, Default)]
pub struct FileStatsSnapshot {
    pub reads: u64,
    pub queued_pages: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub checkpoints: u64,
    pub recoveries: u64,
}

struct RecoveryOutcome {
    header: Option<LogHeader>,
    max_tx: u32,
    data_len: Option<u64>,
}

/// One logical database file: data file plus log, page cache, background
/// writer, and write-ahead index.
pub struct PagedFile {
    factory: Arc<dyn DiskFactory>,
    options: FileOptions,
    pub(crate) store: Arc<MemoryStore>,
    pub(crate) index: Arc<WalIndex>,
    pub(crate) writer: FileWriter,
    quiesce: Arc<Quiescence>,
    pub(crate) data_pool: StreamPool,
    pub(crate) log_pool: StreamPool,
    pub(crate) cipher: Option<Arc<PageCipher>>,
    pub(crate) stats: Arc<FileStats>,
    header: Mutex<LogHeader>,
    length: AtomicU64,
    disposed: AtomicBool,
    pub(crate) temp: bool,
}

impl PagedFile {
    /// Opens (or creates) the paged file at `path`, running log recovery if a
    /// previous session left a non-empty log behind.
    pub fn open(path: impl AsRef<std::path::Path>, options: FileOptions) -> Result<Self> {
        Self::open_with_factory(Arc::new(FileDiskFactory::new(path)), options)
    }

    pub fn open_with_factory(factory: Arc<dyn DiskFactory>, options: FileOptions) -> Result<Self> {
        let store = Arc::new(MemoryStore::new(options.max_extend_segments));
        let quiesce = Quiescence::new();
        let index = Arc::new(WalIndex::new(Arc::clone(&quiesce)));
        let stats = Arc::new(FileStats::default());
        let temp = options.temp;
        let base_mode = if temp {
            FileMode::TempFile
        } else {
            FileMode::DataFile
        };

        let mut rng = OsRng;
        let mut header = LogHeader::new(rng.next_u64());
        if !temp && factory.exists(FileMode::LogFile) {
            if let Some(existing) = peek_log_header(factory.as_ref())? {
                header = existing;
            }
        }
        // The cipher IV is salted with the persisted instance salt, so it can
        // only be built once the log header has been consulted.
        let cipher = options
            .encryption_key
            .map(|key| Arc::new(PageCipher::new(key, header.salt)));

        let mut length = 0u64;
        if factory.exists(base_mode) {
            let mut stream = factory.open_stream(false, base_mode)?;
            length = stream.len()?;
        }
        if !temp && factory.exists(FileMode::LogFile) {
            let outcome = recover(factory.as_ref(), cipher.as_deref(), &stats)?;
            if let Some(recovered) = outcome.header {
                header = recovered;
            }
            index.set_tx_floor(outcome.max_tx);
            if let Some(len) = outcome.data_len {
                length = length.max(len);
            }
        }

        let writer = FileWriter::new(
            Arc::clone(&factory),
            Arc::clone(&store),
            cipher.clone(),
            header.clone(),
            PagePos(PAGE_SIZE as u64),
        );
        Ok(Self {
            data_pool: StreamPool::new(Arc::clone(&factory), base_mode),
            log_pool: StreamPool::new(Arc::clone(&factory), FileMode::LogFile),
            factory,
            options,
            store,
            index,
            writer,
            quiesce,
            cipher,
            stats,
            header: Mutex::new(header),
            length: AtomicU64::new(length),
            disposed: AtomicBool::new(false),
            temp,
        })
    }

    /// Current logical length of the data file.
    pub fn length(&self) -> u64 {
        self.length.load(Ordering::Acquire)
    }

    /// Heap bytes allocated by the page cache.
    pub fn memory_buffer_size(&self) -> u64 {
        self.store.memory_buffer_size()
    }

    pub fn stats(&self) -> FileStatsSnapshot {
        self.stats.snapshot()
    }

    /// Hands out a fresh transaction id.
    pub fn begin_tx(&self) -> TxId {
        self.index.begin_tx()
    }

    /// Discards a transaction that will never confirm; its pages become
    /// unreachable and vanish at the next checkpoint or open.
    pub fn abort(&self, tx: TxId) -> bool {
        self.index.abort_tx(tx)
    }

    /// Opens a thread-local read handle. A writable reader can additionally
    /// allocate pages for not-yet-persisted positions.
    pub fn reader(&self, writable: bool) -> FileReader<'_> {
        FileReader::new(self, writable, self.quiesce.begin_reader())
    }

    /// Enqueues a batch of pages and returns immediately; ownership of the
    /// buffers transfers to the writer and callers must not touch them
    /// afterwards.
    ///
    /// Each page carries its transaction id and logical position in its
    /// header; the batch's final page of a transaction carries the confirmed
    /// flag. A confirmed write that pushes the log past the checkpoint
    /// threshold triggers a best-effort checkpoint before returning.
    pub fn write(&self, pages: Vec<PageBufferRef>) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            for buf in &pages {
                self.store.release(buf);
            }
            return Err(VellumError::Invalid("file is disposed"));
        }
        let mut confirmed_seen = false;
        let mut iter = pages.into_iter();
        while let Some(buf) = iter.next() {
            match self.queue_one(buf) {
                Ok(confirmed) => confirmed_seen |= confirmed,
                Err(err) => {
                    for rest in iter {
                        self.store.release(&rest);
                    }
                    self.writer.run_queue();
                    return Err(err);
                }
            }
        }
        self.writer.run_queue();
        if confirmed_seen && self.log_pages() >= self.options.checkpoint_threshold_pages {
            self.checkpoint(CheckpointMode::BestEffort)?;
        }
        Ok(())
    }

    fn queue_one(&self, buf: PageBufferRef) -> Result<bool> {
        let decoded = {
            let data = buf.data();
            PageHeader::decode(&data[..PAGE_HDR_LEN])
        };
        let header = match decoded {
            Ok(header) => header,
            Err(err) => {
                self.store.release(&buf);
                return Err(err);
            }
        };
        if !header.logical_pos.is_aligned() {
            self.store.release(&buf);
            return Err(VellumError::Invalid("page position not aligned"));
        }
        if self.temp {
            buf.set_position(header.logical_pos);
            self.store.discard(FileOrigin::DataFile, header.logical_pos);
            self.writer.queue_page(buf, FileMode::TempFile)?;
            self.length
                .fetch_max(header.logical_pos.0 + PAGE_SIZE as u64, Ordering::AcqRel);
            return Ok(false);
        }
        if header.tx_id.0 == 0 {
            self.store.release(&buf);
            return Err(VellumError::Invalid("page write outside a transaction"));
        }
        let log_pos = self.writer.queue_page(buf, FileMode::LogFile)?;
        self.index
            .index_page(header.tx_id, header.logical_pos, log_pos, header.confirmed);
        self.stats.queued_pages.fetch_add(1, Ordering::Relaxed);
        self.length
            .fetch_max(header.logical_pos.0 + PAGE_SIZE as u64, Ordering::AcqRel);
        Ok(header.confirmed)
    }

    /// Schedules a data-file length change.
    pub fn set_length_async(&self, len: u64) -> Result<()> {
        if len % PAGE_SIZE as u64 != 0 {
            return Err(VellumError::Invalid("length not page aligned"));
        }
        let target = if self.temp {
            FileMode::TempFile
        } else {
            FileMode::DataFile
        };
        self.writer.queue_set_length(len, target)?;
        self.writer.run_queue();
        self.length.store(len, Ordering::Release);
        Ok(())
    }

    /// Blocks until every enqueued operation is durable at OS granularity.
    pub fn wait_writer(&self) -> Result<()> {
        self.writer.run_queue();
        self.writer.wait_completion()
    }

    fn log_pages(&self) -> usize {
        let append = self.writer.log_append().0;
        (append.saturating_sub(PAGE_SIZE as u64) / PAGE_SIZE as u64) as usize
    }

    /// Copies every confirmed log page back into the data file and truncates
    /// the log to its header.
    ///
    /// `Force` waits for quiescence (no readers, no pending transactions);
    /// `BestEffort` returns without doing anything when the file is busy.
    pub fn checkpoint(&self, mode: CheckpointMode) -> Result<()> {
        if self.temp {
            return Ok(());
        }
        let guard = match mode {
            CheckpointMode::Force => self.quiesce.acquire_checkpoint(),
            CheckpointMode::BestEffort => match self.quiesce.try_acquire_checkpoint() {
                Some(guard) => guard,
                None => {
                    debug!(mode = ?mode, "wal.checkpoint.skip");
                    return Ok(());
                }
            },
        };
        self.writer.run_queue();
        self.writer.wait_completion()?;
        let entries = self.index.confirmed_snapshot();
        if entries.is_empty() && self.writer.log_append().0 <= PAGE_SIZE as u64 {
            // nothing logged since the last truncation
            drop(guard);
            return Ok(());
        }
        self.stats.checkpoints.fetch_add(1, Ordering::Relaxed);
        info!(mode = ?mode, pages = entries.len(), "wal.checkpoint");

        if !entries.is_empty() {
            let mut log_stream = self.log_pool.rent()?;
            let applied = self.apply_checkpoint_pages(&entries, log_stream.as_mut());
            self.log_pool.give_back(log_stream);
            applied?;
            self.writer.run_queue();
            self.writer.wait_completion()?;
            if let Some((last_logical, _)) = entries.last() {
                self.length
                    .fetch_max(last_logical.0 + PAGE_SIZE as u64, Ordering::AcqRel);
            }
        }

        {
            let mut header = self.header.lock();
            header.last_confirmed_tx = TxId(0);
            self.writer
                .queue_set_length(PAGE_SIZE as u64, FileMode::LogFile)?;
            self.writer.queue_log_header(header.clone())?;
        }
        self.writer.run_queue();
        self.writer.wait_completion()?;
        self.writer.reset_log_append(PagePos(PAGE_SIZE as u64));
        self.index.reset();
        self.store.discard_origin(FileOrigin::LogFile);
        drop(guard);
        Ok(())
    }

    fn apply_checkpoint_pages(
        &self,
        entries: &[(PagePos, PagePos)],
        log_stream: &mut dyn FileStream,
    ) -> Result<()> {
        for (logical, log_pos) in entries {
            let buf = self.store.get_writable()?;
            let filled = self.load_log_page(&buf, log_stream, *logical, *log_pos);
            if let Err(err) = filled {
                self.store.release(&buf);
                return Err(err);
            }
            buf.set_position(*logical);
            buf.set_origin(FileOrigin::DataFile);
            self.store.discard(FileOrigin::DataFile, *logical);
            self.writer.queue_page(buf, FileMode::DataFile)?;
        }
        Ok(())
    }

    fn load_log_page(
        &self,
        buf: &PageBufferRef,
        log_stream: &mut dyn FileStream,
        logical: PagePos,
        log_pos: PagePos,
    ) -> Result<()> {
        let mut data = buf.data_mut();
        log_stream.read_exact_at(log_pos.0, &mut data)?;
        if let Some(cipher) = &self.cipher {
            cipher.apply(logical, &mut data);
        }
        page::verify_crc32(&data)?;
        Ok(())
    }

    fn dispose_inner(&self) -> Result<()> {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let drained = if self.temp {
            self.writer.run_queue();
            self.writer.wait_completion()
        } else {
            let discarded = self.index.discard_all_pending();
            if discarded > 0 {
                debug!(discarded, "wal.abort");
            }
            self.checkpoint(CheckpointMode::Force)
        };
        let closed = self.writer.close();
        if self.temp {
            let _ = self.factory.delete(FileMode::TempFile);
        }
        drained.and(closed)
    }

    /// Drains, checkpoints, and releases every stream. Idempotent; also runs
    /// on drop. Must not be called while a reader is alive.
    pub fn close(&self) -> Result<()> {
        self.dispose_inner()
    }
}

impl Drop for PagedFile {
    fn drop(&mut self) {
        if let Err(err) = self.dispose_inner() {
            warn!(error = %err, "file.dispose");
        }
    }
}

/// Reads the persisted log header, if the log has a valid one. Used to seed
/// the cipher salt before recovery runs; all discard decisions stay with
/// [`recover`].
fn peek_log_header(factory: &dyn DiskFactory) -> Result<Option<LogHeader>> {
    let mut log = factory.open_stream(false, FileMode::LogFile)?;
    if log.len()? < PAGE_SIZE as u64 {
        return Ok(None);
    }
    let mut header_buf = vec![0u8; LOG_HDR_LEN];
    log.read_exact_at(0, &mut header_buf)?;
    Ok(LogHeader::decode(&header_buf).ok())
}

fn recover(
    factory: &dyn DiskFactory,
    cipher: Option<&PageCipher>,
    stats: &FileStats,
) -> Result<RecoveryOutcome> {
    let empty = RecoveryOutcome {
        header: None,
        max_tx: 0,
        data_len: None,
    };
    let mut log = factory.open_stream(true, FileMode::LogFile)?;
    let log_len = log.len()?;
    if log_len == 0 {
        return Ok(empty);
    }
    stats.recoveries.fetch_add(1, Ordering::Relaxed);
    if log_len < PAGE_SIZE as u64 {
        warn!(log_len, "wal.recovery.discard");
        log.set_len(0)?;
        log.flush()?;
        return Ok(empty);
    }
    let mut header_buf = vec![0u8; LOG_HDR_LEN];
    log.read_exact_at(0, &mut header_buf)?;
    let header = match LogHeader::decode(&header_buf) {
        Ok(header) => header,
        Err(err) => {
            warn!(error = %err, "wal.recovery.discard");
            log.set_len(0)?;
            log.flush()?;
            return Ok(empty);
        }
    };

    let mut scanner = LogScanner::new(log_len);
    let mut scratch = vec![0u8; PAGE_SIZE];
    let mut pending: HashMap<TxId, Vec<(PagePos, PagePos)>> = HashMap::new();
    let mut confirmed: HashMap<PagePos, PagePos> = HashMap::new();
    let mut max_tx = header.last_confirmed_tx.0;
    while let Some(scanned) = scanner.next_page(log.as_mut(), cipher, &mut scratch)? {
        max_tx = max_tx.max(scanned.header.tx_id.0);
        if scanned.header.tx_id.0 != 0 && scanned.header.tx_id <= header.last_confirmed_tx {
            confirmed.insert(scanned.header.logical_pos, scanned.log_pos);
            continue;
        }
        pending
            .entry(scanned.header.tx_id)
            .or_default()
            .push((scanned.header.logical_pos, scanned.log_pos));
        if scanned.header.confirmed {
            for (logical, log_pos) in pending.remove(&scanned.header.tx_id).unwrap_or_default() {
                confirmed.insert(logical, log_pos);
            }
        }
    }

    let promoted = confirmed.len();
    let discarded: usize = pending.values().map(|pages| pages.len()).sum();
    let mut data_len = None;
    if !confirmed.is_empty() {
        let mut data = factory.open_stream(true, FileMode::DataFile)?;
        let mut entries: Vec<(PagePos, PagePos)> = confirmed.into_iter().collect();
        entries.sort_unstable();
        let mut raw = vec![0u8; PAGE_SIZE];
        for (logical, log_pos) in &entries {
            // ciphertext is keyed to the logical position, so the bytes copy
            // between files verbatim
            log.read_exact_at(log_pos.0, &mut raw)?;
            data.write_all_at(logical.0, &raw)?;
        }
        data.flush()?;
        data_len = Some(data.len()?);
    }

    let fresh = LogHeader::new(header.salt);
    let mut header_page = vec![0u8; PAGE_SIZE];
    header_page[..LOG_HDR_LEN].copy_from_slice(&fresh.encode());
    log.write_all_at(0, &header_page)?;
    log.set_len(PAGE_SIZE as u64)?;
    log.flush()?;
    info!(promoted, discarded, "wal.recovery");
    Ok(RecoveryOutcome {
        header: Some(fresh),
        max_tx,
        data_len,
    })
}
