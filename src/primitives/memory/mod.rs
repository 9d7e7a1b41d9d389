#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

use crate::types::{
    page::PAGE_SIZE, FileOrigin, PagePos, Result, VellumError,
};

/// Pages per allocation slab. Memory grows by whole segments and never
/// shrinks while the store is alive.
pub const SEGMENT_PAGES: usize = 128;

/// Default ceiling on allocated segments (32 * 128 * 8 KiB = 32 MiB).
pub const DEFAULT_MAX_SEGMENTS: usize = 32;

/// One in-memory page slot plus its bookkeeping.
///
/// Buffers are owned by the [`MemoryStore`] for their entire life. Readers
/// and the writer hold `Arc` handles; a handle is only valid to dereference
/// while it accounts for one share on the counter.
#[derive(Debug)]
pub struct PageBuffer {
    origin: AtomicU8,
    position: AtomicU64,
    share_counter: AtomicU32,
    timestamp: AtomicU64,
    dirty: AtomicBool,
    linked: AtomicBool,
    data: RwLock<Box<[u8]>>,
}

pub type PageBufferRef = Arc<PageBuffer>;

impl PageBuffer {
    fn new() -> Self {
        Self {
            origin: AtomicU8::new(FileOrigin::None.as_u8()),
            position: AtomicU64::new(PagePos::UNSET.0),
            share_counter: AtomicU32::new(0),
            timestamp: AtomicU64::new(0),
            dirty: AtomicBool::new(false),
            linked: AtomicBool::new(false),
            data: RwLock::new(vec![0u8; PAGE_SIZE].into_boxed_slice()),
        }
    }

    pub fn origin(&self) -> FileOrigin {
        FileOrigin::from_u8(self.origin.load(Ordering::Acquire))
    }

    pub fn set_origin(&self, origin: FileOrigin) {
        self.origin.store(origin.as_u8(), Ordering::Release);
    }

    pub fn position(&self) -> PagePos {
        PagePos(self.position.load(Ordering::Acquire))
    }

    pub fn set_position(&self, position: PagePos) {
        self.position.store(position.0, Ordering::Release);
    }

    pub fn share_count(&self) -> u32 {
        self.share_counter.load(Ordering::Acquire)
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp.load(Ordering::Acquire)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub fn clear_dirty(&self) {
        self.dirty.store(false, Ordering::Release);
    }

    fn is_linked(&self) -> bool {
        self.linked.load(Ordering::Acquire)
    }

    pub fn data(&self) -> RwLockReadGuard<'_, Box<[u8]>> {
        self.data.read()
    }

    pub fn data_mut(&self) -> RwLockWriteGuard<'_, Box<[u8]>> {
        self.data.write()
    }

    fn reset_for_reuse(&self) {
        self.origin.store(FileOrigin::None.as_u8(), Ordering::Release);
        self.position.store(PagePos::UNSET.0, Ordering::Release);
        self.dirty.store(false, Ordering::Release);
        self.timestamp.store(0, Ordering::Release);
    }
}

struct StoreInner {
    free: Vec<PageBufferRef>,
    readable: HashMap<(FileOrigin, PagePos), PageBufferRef>,
    segments: usize,
    next_stamp: u64,
}

/// Bounded pool of [`PageBuffer`]s shared by every reader and the writer of
/// one paged file.
///
/// All free-list and map mutations are serialized under one store-wide lock;
/// share counters and stamps are atomics so hits stay cheap.
pub struct MemoryStore {
    inner: Mutex<StoreInner>,
    max_segments: usize,
}

impl MemoryStore {
    pub fn new(max_segments: usize) -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                free: Vec::new(),
                readable: HashMap::new(),
                segments: 0,
                next_stamp: 0,
            }),
            max_segments: max_segments.max(1),
        }
    }

    /// Heap bytes currently allocated across segments. Non-decreasing for
    /// the life of the store.
    pub fn memory_buffer_size(&self) -> u64 {
        let inner = self.inner.lock();
        (inner.segments * SEGMENT_PAGES * PAGE_SIZE) as u64
    }

    pub fn segments(&self) -> usize {
        self.inner.lock().segments
    }

    pub fn free_pages(&self) -> usize {
        self.inner.lock().free.len()
    }

    pub fn readable_pages(&self) -> usize {
        self.inner.lock().readable.len()
    }

    /// Looks up a cached page. On a hit the share counter is incremented and
    /// the stamp refreshed; the caller must pair the hit with [`release`].
    ///
    /// [`release`]: MemoryStore::release
    pub fn get_readable(&self, origin: FileOrigin, position: PagePos) -> Option<PageBufferRef> {
        let mut inner = self.inner.lock();
        inner.next_stamp += 1;
        let stamp = inner.next_stamp;
        let buf = inner.readable.get(&(origin, position))?;
        buf.share_counter.fetch_add(1, Ordering::AcqRel);
        buf.timestamp.store(stamp, Ordering::Release);
        Some(Arc::clone(buf))
    }

    /// Hands out a fresh writable slot (share count one) that is not keyed in
    /// the readable map. The caller populates it and either queues it on the
    /// writer or promotes it with [`move_to_readable`].
    ///
    /// [`move_to_readable`]: MemoryStore::move_to_readable
    pub fn get_writable(&self) -> Result<PageBufferRef> {
        let mut inner = self.inner.lock();
        let buf = self.acquire_slot(&mut inner)?;
        inner.next_stamp += 1;
        let stamp = inner.next_stamp;
        buf.share_counter.store(1, Ordering::Release);
        buf.timestamp.store(stamp, Ordering::Release);
        buf.set_origin(FileOrigin::None);
        buf.set_position(PagePos::UNSET);
        buf.clear_dirty();
        buf.linked.store(false, Ordering::Release);
        Ok(buf)
    }

    /// Inserts a populated buffer into the readable map under its current
    /// `(origin, position)` key.
    ///
    /// If another buffer won the race for the key, the existing entry wins:
    /// the caller's share transfers onto it and the duplicate slot returns to
    /// the free list. The returned handle is the mapped buffer and carries
    /// the caller's share.
    pub fn move_to_readable(&self, buf: PageBufferRef) -> PageBufferRef {
        let key = (buf.origin(), buf.position());
        debug_assert!(key.1 != PagePos::UNSET, "promoting unpositioned buffer");
        let mut inner = self.inner.lock();
        inner.next_stamp += 1;
        let stamp = inner.next_stamp;
        if let Some(existing) = inner.readable.get(&key) {
            let winner = Arc::clone(existing);
            winner.share_counter.fetch_add(1, Ordering::AcqRel);
            winner.timestamp.store(stamp, Ordering::Release);
            let prev = buf.share_counter.fetch_sub(1, Ordering::AcqRel);
            debug_assert!(prev > 0, "promoting unshared buffer");
            if prev == 1 && !buf.is_dirty() {
                buf.reset_for_reuse();
                inner.free.push(buf);
            }
            return winner;
        }
        buf.timestamp.store(stamp, Ordering::Release);
        buf.linked.store(true, Ordering::Release);
        inner.readable.insert(key, Arc::clone(&buf));
        buf
    }

    /// Drops one share. A clean buffer outside the readable map rejoins the
    /// free list when its last share is gone; mapped buffers stay put as
    /// eviction candidates.
    pub fn release(&self, buf: &PageBufferRef) {
        let prev = buf.share_counter.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "release without a share");
        if prev == 1 && !buf.is_linked() && !buf.is_dirty() {
            let mut inner = self.inner.lock();
            if buf.share_count() == 0 && !buf.is_linked() {
                buf.reset_for_reuse();
                inner.free.push(Arc::clone(buf));
            }
        }
    }

    /// Drops an unpinned clean entry from the readable map. Returns whether
    /// the entry was removed.
    pub fn discard(&self, origin: FileOrigin, position: PagePos) -> bool {
        let mut inner = self.inner.lock();
        let key = (origin, position);
        let removable = inner
            .readable
            .get(&key)
            .map(|buf| buf.share_count() == 0 && !buf.is_dirty())
            .unwrap_or(false);
        if !removable {
            return false;
        }
        if let Some(buf) = inner.readable.remove(&key) {
            buf.linked.store(false, Ordering::Release);
            buf.reset_for_reuse();
            inner.free.push(buf);
            return true;
        }
        false
    }

    /// Drops every unpinned clean entry whose bytes came from `origin`.
    /// Used after log truncation, when log offsets stop meaning anything.
    pub fn discard_origin(&self, origin: FileOrigin) -> usize {
        let mut inner = self.inner.lock();
        let keys: Vec<(FileOrigin, PagePos)> = inner
            .readable
            .iter()
            .filter(|((o, _), buf)| *o == origin && buf.share_count() == 0 && !buf.is_dirty())
            .map(|(key, _)| *key)
            .collect();
        let count = keys.len();
        for key in keys {
            if let Some(buf) = inner.readable.remove(&key) {
                buf.linked.store(false, Ordering::Release);
                buf.reset_for_reuse();
                inner.free.push(buf);
            }
        }
        count
    }

    fn acquire_slot(&self, inner: &mut StoreInner) -> Result<PageBufferRef> {
        if let Some(buf) = inner.free.pop() {
            return Ok(buf);
        }
        if let Some(buf) = Self::evict_oldest(inner) {
            return Ok(buf);
        }
        self.extend_segment(inner)?;
        inner
            .free
            .pop()
            .ok_or(VellumError::Invalid("fresh segment yielded no free page"))
    }

    fn evict_oldest(inner: &mut StoreInner) -> Option<PageBufferRef> {
        let key = inner
            .readable
            .iter()
            .filter(|(_, buf)| buf.share_count() == 0 && !buf.is_dirty())
            .min_by_key(|(_, buf)| buf.timestamp())
            .map(|(key, _)| *key)?;
        let buf = inner.readable.remove(&key)?;
        buf.linked.store(false, Ordering::Release);
        Some(buf)
    }

    fn extend_segment(&self, inner: &mut StoreInner) -> Result<()> {
        if inner.segments >= self.max_segments {
            return Err(VellumError::CapacityExhausted);
        }
        inner.segments += 1;
        inner.free.reserve(SEGMENT_PAGES);
        for _ in 0..SEGMENT_PAGES {
            inner.free.push(Arc::new(PageBuffer::new()));
        }
        debug!(segments = inner.segments, "memory.extend");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(store: &MemoryStore, origin: FileOrigin, position: PagePos, byte: u8) -> PageBufferRef {
        let buf = store.get_writable().unwrap();
        buf.data_mut().fill(byte);
        buf.set_origin(origin);
        buf.set_position(position);
        store.move_to_readable(buf)
    }

    #[test]
    fn hit_returns_same_bytes_and_counts_shares() {
        let store = MemoryStore::new(2);
        let buf = filled(&store, FileOrigin::DataFile, PagePos(0), 0xAB);
        assert_eq!(buf.share_count(), 1);

        let hit = store
            .get_readable(FileOrigin::DataFile, PagePos(0))
            .expect("cached page");
        assert_eq!(hit.share_count(), 2);
        assert!(hit.data().iter().all(|&b| b == 0xAB));

        store.release(&hit);
        store.release(&buf);
        assert_eq!(buf.share_count(), 0);
        // Stays mapped as an eviction candidate.
        assert_eq!(store.readable_pages(), 1);
    }

    #[test]
    fn miss_returns_none() {
        let store = MemoryStore::new(2);
        assert!(store.get_readable(FileOrigin::DataFile, PagePos(0)).is_none());
    }

    #[test]
    fn writable_slots_are_not_keyed() {
        let store = MemoryStore::new(2);
        let buf = store.get_writable().unwrap();
        assert_eq!(buf.share_count(), 1);
        assert_eq!(buf.origin(), FileOrigin::None);
        assert_eq!(store.readable_pages(), 0);
        store.release(&buf);
        assert_eq!(store.free_pages(), SEGMENT_PAGES);
    }

    #[test]
    fn promotion_race_keeps_existing_entry() {
        let store = MemoryStore::new(2);
        let first = filled(&store, FileOrigin::LogFile, PagePos(8192), 1);

        let dup = store.get_writable().unwrap();
        dup.data_mut().fill(1);
        dup.set_origin(FileOrigin::LogFile);
        dup.set_position(PagePos(8192));
        let winner = store.move_to_readable(dup);

        assert!(Arc::ptr_eq(&winner, &first));
        assert_eq!(winner.share_count(), 2);
        assert_eq!(store.readable_pages(), 1);
        store.release(&winner);
        store.release(&first);
    }

    #[test]
    fn eviction_picks_oldest_clean_unpinned() {
        let store = MemoryStore::new(1);
        // Fill the single segment with mapped pages.
        let mut handles = Vec::new();
        for i in 0..SEGMENT_PAGES {
            handles.push(filled(
                &store,
                FileOrigin::DataFile,
                PagePos::from_index(i as u64),
                i as u8,
            ));
        }
        for buf in &handles {
            store.release(buf);
        }
        // Touch every page except index 3 so it stays the oldest.
        for i in 0..SEGMENT_PAGES {
            if i == 3 {
                continue;
            }
            let hit = store
                .get_readable(FileOrigin::DataFile, PagePos::from_index(i as u64))
                .unwrap();
            store.release(&hit);
        }
        let fresh = store.get_writable().unwrap();
        assert!(store
            .get_readable(FileOrigin::DataFile, PagePos::from_index(3))
            .is_none());
        assert_eq!(store.readable_pages(), SEGMENT_PAGES - 1);
        store.release(&fresh);
    }

    #[test]
    fn pinned_and_dirty_pages_are_never_evicted() {
        let store = MemoryStore::new(1);
        let mut handles = Vec::new();
        for i in 0..SEGMENT_PAGES {
            handles.push(filled(
                &store,
                FileOrigin::DataFile,
                PagePos::from_index(i as u64),
                0,
            ));
        }
        // Every page still has one share; eviction has no candidate and the
        // cap is one segment.
        match store.get_writable() {
            Err(VellumError::CapacityExhausted) => {}
            other => panic!("expected CapacityExhausted, got {other:?}"),
        }
        for buf in &handles {
            store.release(buf);
        }

        // Dirty pages are equally untouchable.
        let dirty = store
            .get_readable(FileOrigin::DataFile, PagePos(0))
            .unwrap();
        dirty.mark_dirty();
        store.release(&dirty);
        let fresh = store.get_writable().unwrap();
        assert!(store
            .get_readable(FileOrigin::DataFile, PagePos(0))
            .is_some_and(|b| {
                store.release(&b);
                true
            }));
        store.release(&fresh);
        dirty.clear_dirty();
    }

    #[test]
    fn memory_grows_by_whole_segments_and_never_shrinks() {
        let store = MemoryStore::new(4);
        assert_eq!(store.memory_buffer_size(), 0);
        let a = store.get_writable().unwrap();
        let one_segment = (SEGMENT_PAGES * PAGE_SIZE) as u64;
        assert_eq!(store.memory_buffer_size(), one_segment);
        store.release(&a);
        assert_eq!(store.memory_buffer_size(), one_segment);
    }

    #[test]
    fn discard_origin_sweeps_clean_entries() {
        let store = MemoryStore::new(2);
        for i in 0..4u64 {
            let buf = filled(&store, FileOrigin::LogFile, PagePos::from_index(i), 0);
            store.release(&buf);
        }
        let pinned = filled(&store, FileOrigin::LogFile, PagePos::from_index(9), 0);
        assert_eq!(store.discard_origin(FileOrigin::LogFile), 4);
        assert_eq!(store.readable_pages(), 1);
        store.release(&pinned);
    }
}
