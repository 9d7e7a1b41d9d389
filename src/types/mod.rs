#![forbid(unsafe_code)]

use std::fmt;

/// Absolute byte offset of a page inside its containing file.
///
/// Always a multiple of [`page::PAGE_SIZE`]; `pos.index()` yields the page
/// index within the file.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct PagePos(pub u64);

/// Identifier of a write transaction. Zero is reserved for "no transaction".
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct TxId(pub u32);

impl PagePos {
    /// Sentinel for a buffer that has not been assigned a position yet.
    pub const UNSET: PagePos = PagePos(u64::MAX);

    /// Page index within the file.
    pub fn index(self) -> u64 {
        self.0 / page::PAGE_SIZE as u64
    }

    /// Position of the page with the given index.
    pub fn from_index(index: u64) -> Self {
        PagePos(index * page::PAGE_SIZE as u64)
    }

    /// Whether the position sits on a page boundary.
    pub fn is_aligned(self) -> bool {
        self.0 % page::PAGE_SIZE as u64 == 0
    }
}

impl fmt::Display for PagePos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which physical file a cached page's bytes came from.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum FileOrigin {
    /// Freshly allocated, not yet persisted anywhere.
    None,
    /// Read from or written to the main data file.
    DataFile,
    /// Read from or written to the write-ahead log file.
    LogFile,
}

impl FileOrigin {
    pub const fn as_u8(self) -> u8 {
        match self {
            FileOrigin::None => 0,
            FileOrigin::DataFile => 1,
            FileOrigin::LogFile => 2,
        }
    }

    pub fn from_u8(value: u8) -> FileOrigin {
        match value {
            1 => FileOrigin::DataFile,
            2 => FileOrigin::LogFile,
            _ => FileOrigin::None,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum VellumError {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid format: {0}")]
    InvalidFormat(&'static str),
    #[error("checksum mismatch at page position {position}")]
    ChecksumMismatch { position: u64 },
    #[error("memory capacity exhausted")]
    CapacityExhausted,
    #[error("transaction aborted")]
    TransactionAborted,
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
}

pub type Result<T> = std::result::Result<T, VellumError>;

/// Recreates an error value for delivery to a second caller.
///
/// `std::io::Error` is not `Clone`, so I/O errors are rebuilt from their kind
/// and message.
pub fn clone_error(err: &VellumError) -> VellumError {
    match err {
        VellumError::Io(io_err) => {
            let kind = io_err.kind();
            let message = io_err.to_string();
            VellumError::Io(std::io::Error::new(kind, message))
        }
        VellumError::InvalidFormat(msg) => VellumError::InvalidFormat(msg),
        VellumError::ChecksumMismatch { position } => VellumError::ChecksumMismatch {
            position: *position,
        },
        VellumError::CapacityExhausted => VellumError::CapacityExhausted,
        VellumError::TransactionAborted => VellumError::TransactionAborted,
        VellumError::Invalid(msg) => VellumError::Invalid(msg),
    }
}

pub mod page {
    //! Shared on-disk page layout used by every vellum component.

    use core::convert::TryFrom;

    use super::{PagePos, Result, TxId, VellumError};

    pub const PAGE_MAGIC: [u8; 4] = *b"VELP";
    pub const PAGE_FORMAT_VERSION: u16 = 1;
    pub const PAGE_SIZE: usize = 8192;
    pub const PAGE_HDR_LEN: usize = 32;
    pub const FLAG_CONFIRMED: u8 = 0b0000_0001;

    pub mod header {
        //! Byte offsets for fixed header fields.
        use core::ops::Range;

        pub const MAGIC: Range<usize> = 0..4;
        pub const FORMAT_VERSION: Range<usize> = 4..6;
        pub const PAGE_KIND: usize = 6;
        pub const FLAGS: usize = 7;
        pub const TX_ID: Range<usize> = 8..12;
        pub const LOGICAL_POS: Range<usize> = 12..20;
        pub const CRC32: Range<usize> = 20..24;
        pub const RESERVED: Range<usize> = 24..32;
    }

    #[repr(u8)]
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub enum PageKind {
        Empty = 0,
        Header = 1,
        Data = 2,
        Index = 3,
    }

    impl PageKind {
        pub const fn as_u8(self) -> u8 {
            self as u8
        }
    }

    impl TryFrom<u8> for PageKind {
        type Error = VellumError;

        fn try_from(value: u8) -> Result<Self> {
            match value {
                0 => Ok(PageKind::Empty),
                1 => Ok(PageKind::Header),
                2 => Ok(PageKind::Data),
                3 => Ok(PageKind::Index),
                _ => Err(VellumError::InvalidFormat("unknown page kind")),
            }
        }
    }

    /// Decoded form of the 32-byte page header.
    ///
    /// The body (bytes 32..8192) is opaque to the storage subsystem; the
    /// header carries everything the log and recovery need.
    #[derive(Clone, Debug, Eq, PartialEq)]
    pub struct PageHeader {
        pub format_version: u16,
        pub kind: PageKind,
        pub confirmed: bool,
        pub tx_id: TxId,
        pub logical_pos: PagePos,
        pub crc32: u32,
    }

    impl PageHeader {
        pub fn new(kind: PageKind, tx_id: TxId, logical_pos: PagePos) -> Self {
            Self {
                format_version: PAGE_FORMAT_VERSION,
                kind,
                confirmed: false,
                tx_id,
                logical_pos,
                crc32: 0,
            }
        }

        pub fn with_confirmed(mut self, confirmed: bool) -> Self {
            self.confirmed = confirmed;
            self
        }

        pub fn encode(&self, dst: &mut [u8]) -> Result<()> {
            if dst.len() < PAGE_HDR_LEN {
                return Err(VellumError::Invalid("page header buffer too small"));
            }
            let hdr = &mut dst[..PAGE_HDR_LEN];
            hdr[header::MAGIC].copy_from_slice(&PAGE_MAGIC);
            hdr[header::FORMAT_VERSION].copy_from_slice(&self.format_version.to_be_bytes());
            hdr[header::PAGE_KIND] = self.kind.as_u8();
            hdr[header::FLAGS] = if self.confirmed { FLAG_CONFIRMED } else { 0 };
            hdr[header::TX_ID].copy_from_slice(&self.tx_id.0.to_be_bytes());
            hdr[header::LOGICAL_POS].copy_from_slice(&self.logical_pos.0.to_be_bytes());
            hdr[header::CRC32].copy_from_slice(&self.crc32.to_be_bytes());
            hdr[header::RESERVED].fill(0);
            Ok(())
        }

        pub fn decode(src: &[u8]) -> Result<Self> {
            if src.len() < PAGE_HDR_LEN {
                return Err(VellumError::InvalidFormat("page header truncated"));
            }
            let hdr = &src[..PAGE_HDR_LEN];
            let magic: [u8; 4] = hdr[header::MAGIC].try_into().unwrap();
            if magic != PAGE_MAGIC {
                return Err(VellumError::InvalidFormat("invalid page magic"));
            }
            let format_version = u16::from_be_bytes(hdr[header::FORMAT_VERSION].try_into().unwrap());
            if format_version != PAGE_FORMAT_VERSION {
                return Err(VellumError::InvalidFormat("unsupported page format version"));
            }
            let kind = PageKind::try_from(hdr[header::PAGE_KIND])?;
            let flags = hdr[header::FLAGS];
            if flags & !FLAG_CONFIRMED != 0 {
                return Err(VellumError::InvalidFormat("unknown page flags set"));
            }
            if hdr[header::RESERVED].iter().any(|b| *b != 0) {
                return Err(VellumError::InvalidFormat("page header reserved bytes non-zero"));
            }
            let tx_id = TxId(u32::from_be_bytes(hdr[header::TX_ID].try_into().unwrap()));
            let logical_pos = PagePos(u64::from_be_bytes(
                hdr[header::LOGICAL_POS].try_into().unwrap(),
            ));
            let crc32 = u32::from_be_bytes(hdr[header::CRC32].try_into().unwrap());
            Ok(Self {
                format_version,
                kind,
                confirmed: flags & FLAG_CONFIRMED != 0,
                tx_id,
                logical_pos,
                crc32,
            })
        }
    }

    /// Whether the page bytes are an untouched region (no magic written).
    pub fn is_blank(src: &[u8]) -> bool {
        src.len() < PAGE_HDR_LEN || src[header::MAGIC] == [0, 0, 0, 0]
    }

    /// Stamps the transaction id into an encoded page.
    pub fn write_tx_id(page: &mut [u8], tx_id: TxId) {
        page[header::TX_ID].copy_from_slice(&tx_id.0.to_be_bytes());
    }

    /// Sets or clears the confirmed flag of an encoded page.
    pub fn write_confirmed(page: &mut [u8], confirmed: bool) {
        if confirmed {
            page[header::FLAGS] |= FLAG_CONFIRMED;
        } else {
            page[header::FLAGS] &= !FLAG_CONFIRMED;
        }
    }

    /// Content checksum of a page body, bound to the page's logical position
    /// so a page copied to the wrong slot fails verification.
    fn content_crc32(logical_pos: u64, body: &[u8]) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&logical_pos.to_be_bytes());
        hasher.update(body);
        hasher.finalize()
    }

    /// Computes the content checksum over the plaintext page and stores it in
    /// the header. Returns the stamped value.
    pub fn stamp_crc32(page: &mut [u8]) -> Result<u32> {
        if page.len() != PAGE_SIZE {
            return Err(VellumError::Invalid("page buffer size mismatch"));
        }
        let logical = u64::from_be_bytes(page[header::LOGICAL_POS].try_into().unwrap());
        let crc = content_crc32(logical, &page[PAGE_HDR_LEN..]);
        page[header::CRC32].copy_from_slice(&crc.to_be_bytes());
        Ok(crc)
    }

    /// Verifies the content checksum of a plaintext page.
    pub fn verify_crc32(page: &[u8]) -> Result<()> {
        if page.len() != PAGE_SIZE {
            return Err(VellumError::Invalid("page buffer size mismatch"));
        }
        let logical = u64::from_be_bytes(page[header::LOGICAL_POS].try_into().unwrap());
        let stored = u32::from_be_bytes(page[header::CRC32].try_into().unwrap());
        let crc = content_crc32(logical, &page[PAGE_HDR_LEN..]);
        if crc != stored {
            return Err(VellumError::ChecksumMismatch { position: logical });
        }
        Ok(())
    }
}
