#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::primitives::crypto::PageCipher;
use crate::primitives::io::FileStream;
use crate::primitives::quiesce::Quiescence;
use crate::types::{
    page::{self, PageHeader, PAGE_SIZE},
    PagePos, Result, TxId, VellumError,
};

pub const LOG_MAGIC: [u8; 4] = *b"VELL";
pub const LOG_FORMAT_VERSION: u16 = 1;
pub const LOG_HDR_LEN: usize = 32;

mod header_layout {
    //! Byte offsets for the log header fields.
    use core::ops::Range;

    pub const MAGIC: Range<usize> = 0..4;
    pub const FORMAT_VERSION: Range<usize> = 4..6;
    pub const RESERVED: Range<usize> = 6..8;
    pub const LAST_CONFIRMED_TX: Range<usize> = 8..12;
    pub const SALT: Range<usize> = 12..20;
    pub const RESERVED_2: Range<usize> = 20..28;
    pub const CRC32: Range<usize> = 28..32;
}

/// Persisted record at the start of the log file.
///
/// The header occupies the whole first page; appended log pages start at
/// position [`PAGE_SIZE`]. The salt is generated once per database instance
/// and perturbs the page cipher's IVs when encryption is configured; the
/// last-confirmed-transaction marker lets recovery promote transactions whose
/// confirm page predates the marker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogHeader {
    pub format_version: u16,
    pub last_confirmed_tx: TxId,
    pub salt: u64,
}

impl LogHeader {
    pub fn new(salt: u64) -> Self {
        Self {
            format_version: LOG_FORMAT_VERSION,
            last_confirmed_tx: TxId(0),
            salt,
        }
    }

    pub fn encode(&self) -> [u8; LOG_HDR_LEN] {
        let mut buf = [0u8; LOG_HDR_LEN];
        buf[header_layout::MAGIC].copy_from_slice(&LOG_MAGIC);
        buf[header_layout::FORMAT_VERSION].copy_from_slice(&self.format_version.to_be_bytes());
        buf[header_layout::RESERVED].fill(0);
        buf[header_layout::LAST_CONFIRMED_TX]
            .copy_from_slice(&self.last_confirmed_tx.0.to_be_bytes());
        buf[header_layout::SALT].copy_from_slice(&self.salt.to_be_bytes());
        buf[header_layout::RESERVED_2].fill(0);
        let mut crc_buf = buf;
        crc_buf[header_layout::CRC32].fill(0);
        let crc = crc32fast::hash(&crc_buf);
        buf[header_layout::CRC32].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    pub fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < LOG_HDR_LEN {
            return Err(VellumError::InvalidFormat("log header truncated"));
        }
        let mut header = [0u8; LOG_HDR_LEN];
        header.copy_from_slice(&src[..LOG_HDR_LEN]);
        if header[header_layout::MAGIC] != LOG_MAGIC {
            return Err(VellumError::InvalidFormat("log magic mismatch"));
        }
        let version = u16::from_be_bytes(header[header_layout::FORMAT_VERSION].try_into().unwrap());
        if version != LOG_FORMAT_VERSION {
            return Err(VellumError::InvalidFormat("log format version mismatch"));
        }
        if header[header_layout::RESERVED] != [0, 0] {
            return Err(VellumError::InvalidFormat("log reserved header bytes non-zero"));
        }
        let stored_crc = u32::from_be_bytes(header[header_layout::CRC32].try_into().unwrap());
        header[header_layout::CRC32].fill(0);
        let crc = crc32fast::hash(&header);
        if crc != stored_crc {
            return Err(VellumError::InvalidFormat("log header crc mismatch"));
        }
        let last_confirmed_tx = TxId(u32::from_be_bytes(
            src[header_layout::LAST_CONFIRMED_TX].try_into().unwrap(),
        ));
        let salt = u64::from_be_bytes(src[header_layout::SALT].try_into().unwrap());
        Ok(Self {
            format_version: version,
            last_confirmed_tx,
            salt,
        })
    }
}

struct IndexState {
    /// Logical position -> newest log position of a confirmed version.
    confirmed: HashMap<PagePos, PagePos>,
    /// Transaction id -> (logical, log) pairs not yet confirmed.
    pending: HashMap<TxId, Vec<(PagePos, PagePos)>>,
}

/// In-memory map from logical page positions to their confirmed log copies.
///
/// A transaction's pages stay in the pending map, invisible to every reader,
/// until the page carrying the confirmed flag is indexed; the whole
/// transaction then promotes atomically.
pub struct WalIndex {
    state: Mutex<IndexState>,
    quiesce: Arc<Quiescence>,
    tx_counter: AtomicU32,
    last_confirmed_tx: AtomicU32,
}

impl WalIndex {
    pub fn new(quiesce: Arc<Quiescence>) -> Self {
        Self {
            state: Mutex::new(IndexState {
                confirmed: HashMap::new(),
                pending: HashMap::new(),
            }),
            quiesce,
            tx_counter: AtomicU32::new(0),
            last_confirmed_tx: AtomicU32::new(0),
        }
    }

    /// Hands out the next transaction id. Ids are monotonic within a session
    /// and restart above everything seen during recovery.
    pub fn begin_tx(&self) -> TxId {
        TxId(self.tx_counter.fetch_add(1, Ordering::AcqRel) + 1)
    }

    /// Raises the transaction counter so fresh ids stay above `floor`.
    pub fn set_tx_floor(&self, floor: u32) {
        self.tx_counter.fetch_max(floor, Ordering::AcqRel);
    }

    pub fn last_confirmed_tx(&self) -> TxId {
        TxId(self.last_confirmed_tx.load(Ordering::Acquire))
    }

    /// Newest confirmed log position for a logical position, if any.
    pub fn resolve(&self, logical: PagePos) -> Option<PagePos> {
        let state = self.state.lock();
        state.confirmed.get(&logical).copied()
    }

    /// Records one page appended to the log. On the confirmed page the whole
    /// transaction promotes into the confirmed map atomically.
    pub fn index_page(&self, tx: TxId, logical: PagePos, log_pos: PagePos, confirmed: bool) {
        let mut state = self.state.lock();
        let entry = state.pending.entry(tx).or_insert_with(|| {
            self.quiesce.tx_started();
            Vec::new()
        });
        entry.push((logical, log_pos));
        if confirmed {
            let pages = state.pending.remove(&tx).unwrap_or_default();
            let promoted = pages.len();
            for (logical, log_pos) in pages {
                state.confirmed.insert(logical, log_pos);
            }
            self.last_confirmed_tx.fetch_max(tx.0, Ordering::AcqRel);
            self.quiesce.tx_finished();
            debug!(tx = tx.0, pages = promoted, "wal.confirm");
        }
    }

    /// Discards a transaction that will never confirm. Its log pages stay on
    /// disk but remain invisible and vanish at the next checkpoint or open.
    pub fn abort_tx(&self, tx: TxId) -> bool {
        let mut state = self.state.lock();
        if state.pending.remove(&tx).is_some() {
            self.quiesce.tx_finished();
            debug!(tx = tx.0, "wal.abort");
            true
        } else {
            false
        }
    }

    /// Discards every pending transaction. Used on dispose, where dangling
    /// producers can no longer confirm.
    pub fn discard_all_pending(&self) -> usize {
        let mut state = self.state.lock();
        let count = state.pending.len();
        for _ in 0..count {
            self.quiesce.tx_finished();
        }
        state.pending.clear();
        count
    }

    pub fn has_pending(&self) -> bool {
        !self.state.lock().pending.is_empty()
    }

    /// Confirmed entries ordered by logical position, for checkpointing.
    pub fn confirmed_snapshot(&self) -> Vec<(PagePos, PagePos)> {
        let state = self.state.lock();
        let mut entries: Vec<(PagePos, PagePos)> =
            state.confirmed.iter().map(|(k, v)| (*k, *v)).collect();
        entries.sort_unstable();
        entries
    }

    /// Forgets everything after the log has been truncated back to its
    /// header.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.confirmed.clear();
        for _ in 0..state.pending.len() {
            self.quiesce.tx_finished();
        }
        state.pending.clear();
        self.last_confirmed_tx.store(0, Ordering::Release);
    }
}

/// One page pulled out of a sequential log scan.
pub struct ScannedPage {
    pub log_pos: PagePos,
    pub header: PageHeader,
}

/// Sequential reader over the appended pages of a log file.
///
/// The scan stops cleanly at the first page that fails to decode or verify;
/// everything past a torn write is treated as garbage from a previous life of
/// the file, exactly like an unconfirmed transaction.
pub struct LogScanner {
    offset: u64,
    end: u64,
    valid_up_to: u64,
}

impl LogScanner {
    pub fn new(log_len: u64) -> Self {
        Self {
            offset: PAGE_SIZE as u64,
            end: log_len,
            valid_up_to: PAGE_SIZE as u64,
        }
    }

    /// Reads, decrypts, and verifies the next page. Returns `None` at the end
    /// of the valid prefix.
    pub fn next_page(
        &mut self,
        stream: &mut dyn FileStream,
        cipher: Option<&PageCipher>,
        scratch: &mut [u8],
    ) -> Result<Option<ScannedPage>> {
        debug_assert_eq!(scratch.len(), PAGE_SIZE);
        if self.offset + PAGE_SIZE as u64 > self.end {
            self.offset = self.end;
            return Ok(None);
        }
        if let Err(err) = stream.read_exact_at(self.offset, scratch) {
            if matches!(&err, VellumError::Io(io_err) if io_err.kind() == ErrorKind::UnexpectedEof)
            {
                self.offset = self.end;
                return Ok(None);
            }
            return Err(err);
        }
        let header = match PageHeader::decode(scratch) {
            Ok(header) => header,
            Err(_) => {
                self.offset = self.end;
                return Ok(None);
            }
        };
        if let Some(cipher) = cipher {
            cipher.apply(header.logical_pos, scratch);
        }
        if page::verify_crc32(scratch).is_err() {
            self.offset = self.end;
            return Ok(None);
        }
        let log_pos = PagePos(self.offset);
        self.offset += PAGE_SIZE as u64;
        self.valid_up_to = self.offset;
        Ok(Some(ScannedPage { log_pos, header }))
    }

    /// File offset up to which pages have been validated.
    pub fn valid_up_to(&self) -> u64 {
        self.valid_up_to
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::io::StdFileStream;
    use crate::types::page::{PageKind, PAGE_HDR_LEN};
    use tempfile::tempdir;

    fn encoded_page(tx: TxId, logical: PagePos, confirmed: bool, fill: u8) -> Vec<u8> {
        let mut buf = vec![0u8; PAGE_SIZE];
        PageHeader::new(PageKind::Data, tx, logical)
            .with_confirmed(confirmed)
            .encode(&mut buf)
            .unwrap();
        buf[PAGE_HDR_LEN..].fill(fill);
        page::stamp_crc32(&mut buf).unwrap();
        buf
    }

    #[test]
    fn log_header_roundtrip() {
        let header = LogHeader::new(0xDEADBEEF);
        let encoded = header.encode();
        let decoded = LogHeader::decode(&encoded).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn log_header_detects_corruption() {
        let mut encoded = LogHeader::new(1).encode();
        encoded[header_layout::SALT.start] ^= 0xFF;
        assert!(matches!(
            LogHeader::decode(&encoded),
            Err(VellumError::InvalidFormat(_))
        ));

        let mut bad_magic = LogHeader::new(1).encode();
        bad_magic[0] = b'X';
        assert!(LogHeader::decode(&bad_magic).is_err());
    }

    #[test]
    fn pending_pages_stay_invisible_until_confirm() {
        let quiesce = Quiescence::new();
        let index = WalIndex::new(Arc::clone(&quiesce));
        let tx = index.begin_tx();

        index.index_page(tx, PagePos(0), PagePos(8192), false);
        index.index_page(tx, PagePos(8192), PagePos(16384), false);
        assert!(index.resolve(PagePos(0)).is_none());
        assert!(index.has_pending());
        assert_eq!(quiesce.snapshot().pending_txs, 1);

        index.index_page(tx, PagePos(16384), PagePos(24576), true);
        assert_eq!(index.resolve(PagePos(0)), Some(PagePos(8192)));
        assert_eq!(index.resolve(PagePos(16384)), Some(PagePos(24576)));
        assert!(!index.has_pending());
        assert_eq!(quiesce.snapshot().pending_txs, 0);
        assert_eq!(index.last_confirmed_tx(), tx);
    }

    #[test]
    fn later_transaction_wins_a_position() {
        let index = WalIndex::new(Quiescence::new());
        let a = index.begin_tx();
        index.index_page(a, PagePos(0), PagePos(8192), true);
        let b = index.begin_tx();
        index.index_page(b, PagePos(0), PagePos(16384), true);
        assert_eq!(index.resolve(PagePos(0)), Some(PagePos(16384)));
    }

    #[test]
    fn abort_discards_pending_pages() {
        let quiesce = Quiescence::new();
        let index = WalIndex::new(Arc::clone(&quiesce));
        let tx = index.begin_tx();
        index.index_page(tx, PagePos(0), PagePos(8192), false);
        assert!(index.abort_tx(tx));
        assert!(!index.has_pending());
        assert!(index.resolve(PagePos(0)).is_none());
        assert_eq!(quiesce.snapshot().pending_txs, 0);
        assert!(!index.abort_tx(tx));
    }

    #[test]
    fn scanner_reads_valid_prefix_and_stops_at_torn_tail() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("scan-log");
        let mut stream = StdFileStream::open(&path, true).unwrap();

        let mut header_page = vec![0u8; PAGE_SIZE];
        header_page[..LOG_HDR_LEN].copy_from_slice(&LogHeader::new(7).encode());
        stream.write_all_at(0, &header_page).unwrap();

        let first = encoded_page(TxId(1), PagePos(0), false, 1);
        let second = encoded_page(TxId(1), PagePos(8192), true, 2);
        stream.write_all_at(PAGE_SIZE as u64, &first).unwrap();
        stream.write_all_at(2 * PAGE_SIZE as u64, &second).unwrap();
        // Torn third page: valid header, corrupted body.
        let mut torn = encoded_page(TxId(2), PagePos(16384), false, 3);
        torn[PAGE_HDR_LEN + 5] ^= 0xFF;
        stream.write_all_at(3 * PAGE_SIZE as u64, &torn).unwrap();
        stream.flush().unwrap();

        let len = stream.len().unwrap();
        let mut scanner = LogScanner::new(len);
        let mut scratch = vec![0u8; PAGE_SIZE];

        let page_one = scanner
            .next_page(&mut stream, None, &mut scratch)
            .unwrap()
            .expect("first page");
        assert_eq!(page_one.log_pos, PagePos(PAGE_SIZE as u64));
        assert_eq!(page_one.header.tx_id, TxId(1));
        assert!(!page_one.header.confirmed);

        let page_two = scanner
            .next_page(&mut stream, None, &mut scratch)
            .unwrap()
            .expect("second page");
        assert!(page_two.header.confirmed);
        assert_eq!(page_two.header.logical_pos, PagePos(8192));

        assert!(scanner
            .next_page(&mut stream, None, &mut scratch)
            .unwrap()
            .is_none());
        assert_eq!(scanner.valid_up_to(), 3 * PAGE_SIZE as u64);
    }
}
