#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::primitives::crypto::PageCipher;
use crate::primitives::io::{DiskFactory, FileMode, FileStream};
use crate::primitives::memory::{MemoryStore, PageBufferRef};
use crate::primitives::wal::{LogHeader, LOG_HDR_LEN};
use crate::types::{
    clone_error,
    page::{self, PAGE_SIZE},
    FileOrigin, PagePos, Result, VellumError,
};

enum WriteOp {
    Page { buf: PageBufferRef, target: FileMode },
    SetLength { len: u64, target: FileMode },
    LogHeader { header: LogHeader },
}

struct WriterState {
    queue: VecDeque<WriteOp>,
    busy: bool,
    dirty_streams: bool,
    worker_running: bool,
    shutdown: bool,
    last_error: Option<VellumError>,
    log_append: PagePos,
    join: Option<thread::JoinHandle<()>>,
}

struct WriterShared {
    factory: Arc<dyn DiskFactory>,
    store: Arc<MemoryStore>,
    cipher: Option<Arc<PageCipher>>,
    initial_log_header: LogHeader,
    state: Mutex<WriterState>,
    wakeup: Condvar,
    drained: Condvar,
    data_stream: Mutex<Option<Box<dyn FileStream>>>,
    log_stream: Mutex<Option<Box<dyn FileStream>>>,
    temp_stream: Mutex<Option<Box<dyn FileStream>>>,
}

/// Single background drain for one paged file.
///
/// Producers enqueue pages and length changes without blocking; one worker
/// thread persists them in submission order. In log mode a page's physical
/// position is rewritten to append-at-end at enqueue time, so the write-ahead
/// index can map the page before it reaches disk. The stream carrying a
/// confirmed-flag page is fsynced immediately after the write; all open
/// streams are flushed whenever the queue drains.
///
/// The first I/O failure latches: queued work is abandoned, producers get the
/// error from every subsequent call, and the worker parks until dispose.
pub struct FileWriter {
    shared: Arc<WriterShared>,
}

impl FileWriter {
    pub fn new(
        factory: Arc<dyn DiskFactory>,
        store: Arc<MemoryStore>,
        cipher: Option<Arc<PageCipher>>,
        initial_log_header: LogHeader,
        log_append: PagePos,
    ) -> Self {
        Self {
            shared: Arc::new(WriterShared {
                factory,
                store,
                cipher,
                initial_log_header,
                state: Mutex::new(WriterState {
                    queue: VecDeque::new(),
                    busy: false,
                    dirty_streams: false,
                    worker_running: false,
                    shutdown: false,
                    last_error: None,
                    log_append,
                    join: None,
                }),
                wakeup: Condvar::new(),
                drained: Condvar::new(),
                data_stream: Mutex::new(None),
                log_stream: Mutex::new(None),
                temp_stream: Mutex::new(None),
            }),
        }
    }

    /// Next append position in the log file.
    pub fn log_append(&self) -> PagePos {
        self.shared.state.lock().log_append
    }

    /// Rewinds the append position after the log has been truncated. Only
    /// valid while no producer can enqueue log pages.
    pub fn reset_log_append(&self, pos: PagePos) {
        self.shared.state.lock().log_append = pos;
    }

    /// Enqueues a page write and transfers the caller's share to the queue.
    ///
    /// The buffer is promoted into the readable map under its physical
    /// position before this returns, so readers see the new version from
    /// memory while the disk write is still in flight. Returns the physical
    /// position the page will be written at.
    pub fn queue_page(&self, buf: PageBufferRef, target: FileMode) -> Result<PagePos> {
        let phys = {
            let mut state = self.shared.state.lock();
            if let Some(err) = state.last_error.as_ref() {
                let err = clone_error(err);
                drop(state);
                self.shared.store.release(&buf);
                return Err(err);
            }
            if state.shutdown {
                drop(state);
                self.shared.store.release(&buf);
                return Err(VellumError::Invalid("writer is closed"));
            }
            match target {
                FileMode::LogFile => {
                    let pos = state.log_append;
                    state.log_append.0 += PAGE_SIZE as u64;
                    pos
                }
                _ => buf.position(),
            }
        };
        if phys == PagePos::UNSET || !phys.is_aligned() {
            self.shared.store.release(&buf);
            return Err(VellumError::Invalid("page position not aligned"));
        }
        buf.set_position(phys);
        buf.set_origin(origin_for(target));
        buf.mark_dirty();
        // The caller's share transfers to the queue and is released by the
        // worker once the page is on disk.
        let promoted = self.shared.store.move_to_readable(buf);
        let mut state = self.shared.state.lock();
        debug!(position = phys.0, target = ?target, queued = state.queue.len() + 1, "writer.queue");
        state.queue.push_back(WriteOp::Page {
            buf: promoted,
            target,
        });
        Ok(phys)
    }

    /// Enqueues a file-length change.
    pub fn queue_set_length(&self, len: u64, target: FileMode) -> Result<()> {
        let mut state = self.shared.state.lock();
        if let Some(err) = state.last_error.as_ref() {
            return Err(clone_error(err));
        }
        if state.shutdown {
            return Err(VellumError::Invalid("writer is closed"));
        }
        debug!(len, target = ?target, "writer.queue");
        state.queue.push_back(WriteOp::SetLength { len, target });
        Ok(())
    }

    /// Enqueues a rewrite of the log header page.
    pub fn queue_log_header(&self, header: LogHeader) -> Result<()> {
        let mut state = self.shared.state.lock();
        if let Some(err) = state.last_error.as_ref() {
            return Err(clone_error(err));
        }
        if state.shutdown {
            return Err(VellumError::Invalid("writer is closed"));
        }
        state.queue.push_back(WriteOp::LogHeader { header });
        Ok(())
    }

    /// Wakes the worker if it is sleeping, starting it on first use.
    /// Idempotent; producers never block here.
    pub fn run_queue(&self) {
        let mut state = self.shared.state.lock();
        if state.worker_running {
            self.shared.wakeup.notify_one();
            return;
        }
        if state.queue.is_empty() || state.shutdown || state.last_error.is_some() {
            return;
        }
        state.worker_running = true;
        let shared = Arc::clone(&self.shared);
        state.join = Some(thread::spawn(move || worker_loop(shared)));
    }

    /// Blocks until the queue is drained and every write is flushed to the
    /// OS, or surfaces the writer's latched error.
    pub fn wait_completion(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        loop {
            if let Some(err) = state.last_error.as_ref() {
                return Err(clone_error(err));
            }
            if state.queue.is_empty() && !state.busy && !state.dirty_streams {
                return Ok(());
            }
            if !state.worker_running && !state.shutdown {
                state.worker_running = true;
                let shared = Arc::clone(&self.shared);
                state.join = Some(thread::spawn(move || worker_loop(shared)));
            } else {
                self.shared.wakeup.notify_one();
            }
            self.shared.drained.wait(&mut state);
        }
    }

    /// Drains, joins the worker, and releases the write streams.
    pub fn close(&self) -> Result<()> {
        self.run_queue();
        let result = self.wait_completion();
        let join = {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            self.shared.wakeup.notify_all();
            state.join.take()
        };
        if let Some(handle) = join {
            let _ = handle.join();
        }
        *self.shared.data_stream.lock() = None;
        *self.shared.log_stream.lock() = None;
        *self.shared.temp_stream.lock() = None;
        result
    }
}

fn origin_for(target: FileMode) -> FileOrigin {
    match target {
        FileMode::LogFile => FileOrigin::LogFile,
        FileMode::DataFile | FileMode::TempFile => FileOrigin::DataFile,
    }
}

fn worker_loop(shared: Arc<WriterShared>) {
    let mut state = shared.state.lock();
    loop {
        if state.last_error.is_some() {
            if state.shutdown {
                break;
            }
            shared.wakeup.wait(&mut state);
            continue;
        }
        if let Some(op) = state.queue.pop_front() {
            state.busy = true;
            drop(state);
            let result = shared.apply(&op);
            if let WriteOp::Page { buf, .. } = &op {
                if result.is_ok() {
                    buf.clear_dirty();
                }
                shared.store.release(buf);
            }
            state = shared.state.lock();
            state.busy = false;
            match result {
                Ok(()) => state.dirty_streams = true,
                Err(err) => shared.fail_locked(&mut state, err),
            }
            continue;
        }
        if state.dirty_streams {
            drop(state);
            let result = shared.flush_streams();
            state = shared.state.lock();
            match result {
                Ok(()) => state.dirty_streams = false,
                Err(err) => shared.fail_locked(&mut state, err),
            }
            continue;
        }
        shared.drained.notify_all();
        if state.shutdown {
            break;
        }
        shared.wakeup.wait(&mut state);
    }
    state.worker_running = false;
    shared.drained.notify_all();
}

impl WriterShared {
    fn apply(&self, op: &WriteOp) -> Result<()> {
        match op {
            WriteOp::Page { buf, target } => {
                let pos = buf.position();
                let mut scratch = buf.data().to_vec();
                page::stamp_crc32(&mut scratch)?;
                let confirmed = scratch[page::header::FLAGS] & page::FLAG_CONFIRMED != 0;
                if let Some(cipher) = &self.cipher {
                    let logical = PagePos(u64::from_be_bytes(
                        scratch[page::header::LOGICAL_POS].try_into().unwrap(),
                    ));
                    cipher.apply(logical, &mut scratch);
                }
                self.with_stream(*target, |stream| {
                    stream.write_all_at(pos.0, &scratch)?;
                    if confirmed {
                        stream.flush()?;
                    }
                    Ok(())
                })?;
                debug!(position = pos.0, target = ?target, confirmed, "writer.write");
                Ok(())
            }
            WriteOp::SetLength { len, target } => {
                self.with_stream(*target, |stream| stream.set_len(*len))?;
                debug!(len, target = ?target, "writer.write");
                Ok(())
            }
            WriteOp::LogHeader { header } => {
                let mut page_buf = vec![0u8; PAGE_SIZE];
                page_buf[..LOG_HDR_LEN].copy_from_slice(&header.encode());
                self.with_stream(FileMode::LogFile, |stream| {
                    stream.write_all_at(0, &page_buf)?;
                    stream.flush()
                })
            }
        }
    }

    fn with_stream<T>(
        &self,
        target: FileMode,
        f: impl FnOnce(&mut dyn FileStream) -> Result<T>,
    ) -> Result<T> {
        let slot = match target {
            FileMode::DataFile => &self.data_stream,
            FileMode::LogFile => &self.log_stream,
            FileMode::TempFile => &self.temp_stream,
        };
        let mut guard = slot.lock();
        if guard.is_none() {
            // Write streams are created on first mutation only, so read-only
            // sessions never touch the write side.
            let mut stream = self.factory.open_stream(true, target)?;
            if target == FileMode::LogFile && stream.len()? < PAGE_SIZE as u64 {
                let mut page_buf = vec![0u8; PAGE_SIZE];
                page_buf[..LOG_HDR_LEN].copy_from_slice(&self.initial_log_header.encode());
                stream.write_all_at(0, &page_buf)?;
                stream.flush()?;
            }
            *guard = Some(stream);
        }
        let stream = guard.as_mut().expect("stream initialized");
        f(stream.as_mut())
    }

    fn flush_streams(&self) -> Result<()> {
        for slot in [&self.data_stream, &self.log_stream, &self.temp_stream] {
            let mut guard = slot.lock();
            if let Some(stream) = guard.as_mut() {
                stream.flush()?;
            }
        }
        Ok(())
    }

    fn fail_locked(&self, state: &mut WriterState, err: VellumError) {
        warn!(error = %err, abandoned = state.queue.len(), "writer.failed");
        if state.last_error.is_none() {
            state.last_error = Some(err);
        }
        let abandoned: Vec<WriteOp> = state.queue.drain(..).collect();
        for op in &abandoned {
            if let WriteOp::Page { buf, .. } = op {
                self.store.release(buf);
            }
        }
        self.drained.notify_all();
    }
}
