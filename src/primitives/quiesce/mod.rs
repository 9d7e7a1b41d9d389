#![forbid(unsafe_code)]

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

/// Coordinates readers, in-flight transactions, and the exclusive checkpoint
/// phase of one paged file.
///
/// Readers stack freely; a checkpoint excludes new readers and waits for
/// active ones and for every pending transaction to finish.
pub struct Quiescence {
    state: Mutex<QuiesceState>,
    cv: Condvar,
}

#[derive(Default, Debug)]
struct QuiesceState {
    readers: u32,
    pending_txs: u32,
    checkpoint: bool,
}

/// Snapshot of the coordination state for observability.
#[derive(Default, Debug, Clone, Copy)]
pub struct QuiesceSnapshot {
    /// Number of active readers.
    pub readers: u32,
    /// Number of transactions with unconfirmed pages.
    pub pending_txs: u32,
    /// Whether a checkpoint currently holds the exclusive slot.
    pub checkpoint: bool,
}

/// Guard representing one active reader.
pub struct ReaderGuard {
    owner: Arc<Quiescence>,
}

/// Guard representing the exclusive checkpoint slot.
pub struct CheckpointGuard {
    owner: Arc<Quiescence>,
}

impl Quiescence {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QuiesceState::default()),
            cv: Condvar::new(),
        })
    }

    /// Registers a reader, blocking while a checkpoint holds the slot.
    pub fn begin_reader(self: &Arc<Self>) -> ReaderGuard {
        let mut state = self.state.lock();
        while state.checkpoint {
            self.cv.wait(&mut state);
        }
        state.readers += 1;
        ReaderGuard {
            owner: Arc::clone(self),
        }
    }

    /// Records a transaction whose pages are not all confirmed yet.
    pub fn tx_started(&self) {
        let mut state = self.state.lock();
        state.pending_txs += 1;
    }

    /// Records that a transaction confirmed or was discarded.
    pub fn tx_finished(&self) {
        let mut state = self.state.lock();
        state.pending_txs = state.pending_txs.saturating_sub(1);
        self.cv.notify_all();
    }

    /// Takes the exclusive checkpoint slot if nothing stands in the way.
    pub fn try_acquire_checkpoint(self: &Arc<Self>) -> Option<CheckpointGuard> {
        let mut state = self.state.lock();
        if state.readers > 0 || state.pending_txs > 0 || state.checkpoint {
            return None;
        }
        state.checkpoint = true;
        Some(CheckpointGuard {
            owner: Arc::clone(self),
        })
    }

    /// Takes the exclusive checkpoint slot, waiting for readers and pending
    /// transactions to drain.
    pub fn acquire_checkpoint(self: &Arc<Self>) -> CheckpointGuard {
        let mut state = self.state.lock();
        while state.readers > 0 || state.pending_txs > 0 || state.checkpoint {
            self.cv.wait(&mut state);
        }
        state.checkpoint = true;
        CheckpointGuard {
            owner: Arc::clone(self),
        }
    }

    pub fn snapshot(&self) -> QuiesceSnapshot {
        let state = self.state.lock();
        QuiesceSnapshot {
            readers: state.readers,
            pending_txs: state.pending_txs,
            checkpoint: state.checkpoint,
        }
    }
}

impl Drop for ReaderGuard {
    fn drop(&mut self) {
        let mut state = self.owner.state.lock();
        state.readers = state.readers.saturating_sub(1);
        self.owner.cv.notify_all();
    }
}

impl Drop for CheckpointGuard {
    fn drop(&mut self) {
        let mut state = self.owner.state.lock();
        state.checkpoint = false;
        self.owner.cv.notify_all();
    }
}
