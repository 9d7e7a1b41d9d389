use std::io::ErrorKind;
use std::sync::Arc;

use tracing::debug;

use crate::file::PagedFile;
use crate::primitives::io::FileStream;
use crate::primitives::memory::PageBufferRef;
use crate::primitives::quiesce::ReaderGuard;
use crate::types::{
    page::{self, PageHeader, PageKind},
    FileOrigin, PagePos, Result, TxId, VellumError,
};

/// Thread-local read handle over the combined data-plus-log state of one
/// paged file.
///
/// Every buffer handed out is borrowed: it stays valid until the reader is
/// dropped, which releases all held shares and returns the pooled streams.
/// Readers must not be shared between threads.
pub struct FileReader<'a> {
    file: &'a PagedFile,
    writable: bool,
    data_stream: Option<Box<dyn FileStream>>,
    log_stream: Option<Box<dyn FileStream>>,
    held: Vec<PageBufferRef>,
    _quiesce: ReaderGuard,
}

impl<'a> FileReader<'a> {
    pub(crate) fn new(file: &'a PagedFile, writable: bool, guard: ReaderGuard) -> Self {
        Self {
            file,
            writable,
            data_stream: None,
            log_stream: None,
            held: Vec::new(),
            _quiesce: guard,
        }
    }

    /// Returns the latest confirmed version of the page at `position`.
    ///
    /// A confirmed log copy wins over the data file; positions never written
    /// read as zeroed pages. A checksum failure on a log copy falls back to
    /// the data file; on the data file itself it is surfaced.
    pub fn read_page(&mut self, position: PagePos) -> Result<PageBufferRef> {
        if !position.is_aligned() {
            return Err(VellumError::Invalid("position not page aligned"));
        }
        self.file.stats.reads.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let (mut origin, mut phys) = if self.file.temp {
            (FileOrigin::DataFile, position)
        } else {
            match self.file.index.resolve(position) {
                Some(log_pos) => (FileOrigin::LogFile, log_pos),
                None => (FileOrigin::DataFile, position),
            }
        };
        loop {
            if let Some(buf) = self.file.store.get_readable(origin, phys) {
                self.file
                    .stats
                    .cache_hits
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                debug!(position = position.0, origin = ?origin, hit = true, "file.read");
                self.held.push(Arc::clone(&buf));
                return Ok(buf);
            }
            self.file
                .stats
                .cache_misses
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            let buf = self.file.store.get_writable()?;
            match self.fill_from_disk(&buf, origin, phys, position) {
                Ok(()) => {
                    buf.set_origin(origin);
                    buf.set_position(phys);
                    let promoted = self.file.store.move_to_readable(buf);
                    debug!(position = position.0, origin = ?origin, hit = false, "file.read");
                    self.held.push(Arc::clone(&promoted));
                    return Ok(promoted);
                }
                Err(err) => {
                    self.file.store.release(&buf);
                    let recoverable = matches!(
                        err,
                        VellumError::ChecksumMismatch { .. } | VellumError::InvalidFormat(_)
                    );
                    if origin == FileOrigin::LogFile && recoverable {
                        debug!(position = position.0, error = %err, "file.read.fallback");
                        origin = FileOrigin::DataFile;
                        phys = position;
                        continue;
                    }
                    return Err(err);
                }
            }
        }
    }

    /// Allocates a writable buffer for a not-yet-persisted page at
    /// `position`, with a fresh header and zeroed body.
    ///
    /// The caller fills the body, stamps the transaction id (and the
    /// confirmed flag on the final page), and hands the buffer to
    /// [`PagedFile::write`]; it is not tracked by this reader.
    pub fn new_page(&mut self, position: PagePos, kind: PageKind) -> Result<PageBufferRef> {
        if !self.writable {
            return Err(VellumError::Invalid("reader is not writable"));
        }
        if !position.is_aligned() {
            return Err(VellumError::Invalid("position not page aligned"));
        }
        let buf = self.file.store.get_writable()?;
        let encoded = {
            let mut data = buf.data_mut();
            data.fill(0);
            PageHeader::new(kind, TxId(0), position).encode(&mut data[..])
        };
        if let Err(err) = encoded {
            self.file.store.release(&buf);
            return Err(err);
        }
        buf.set_position(position);
        Ok(buf)
    }

    /// Releases every buffer handed out so far. Useful in long scans to keep
    /// the cache evictable; the buffers must no longer be dereferenced.
    pub fn release_pages(&mut self) {
        for buf in self.held.drain(..) {
            self.file.store.release(&buf);
        }
    }

    fn fill_from_disk(
        &mut self,
        buf: &PageBufferRef,
        origin: FileOrigin,
        phys: PagePos,
        logical: PagePos,
    ) -> Result<()> {
        let cipher = self.file.cipher.clone();
        let stream = self.stream_for(origin)?;
        let mut data = buf.data_mut();
        data.fill(0);
        match stream {
            // Backing file not created yet: the page reads as zeroes.
            None => return Ok(()),
            Some(stream) => match stream.read_exact_at(phys.0, &mut data) {
                Ok(()) => {}
                Err(VellumError::Io(err)) if err.kind() == ErrorKind::UnexpectedEof => {
                    data.fill(0);
                    return Ok(());
                }
                Err(err) => return Err(err),
            },
        }
        if page::is_blank(&data) {
            return Ok(());
        }
        if let Some(cipher) = &cipher {
            cipher.apply(logical, &mut data);
        }
        let header = PageHeader::decode(&data)?;
        if header.logical_pos != logical {
            return Err(VellumError::InvalidFormat("page logical position mismatch"));
        }
        page::verify_crc32(&data)?;
        Ok(())
    }

    fn stream_for(&mut self, origin: FileOrigin) -> Result<Option<&mut Box<dyn FileStream>>> {
        let (slot, pool) = match origin {
            FileOrigin::DataFile => (&mut self.data_stream, &self.file.data_pool),
            FileOrigin::LogFile => (&mut self.log_stream, &self.file.log_pool),
            FileOrigin::None => {
                return Err(VellumError::Invalid("read from unpersisted origin"));
            }
        };
        if slot.is_none() {
            match pool.rent() {
                Ok(stream) => *slot = Some(stream),
                Err(VellumError::Io(err)) if err.kind() == ErrorKind::NotFound => {
                    return Ok(None);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(slot.as_mut())
    }
}

impl Drop for FileReader<'_> {
    fn drop(&mut self) {
        self.release_pages();
        if let Some(stream) = self.data_stream.take() {
            self.file.data_pool.give_back(stream);
        }
        if let Some(stream) = self.log_stream.take() {
            self.file.log_pool.give_back(stream);
        }
    }
}
