#![forbid(unsafe_code)]

use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crossbeam_queue::SegQueue;

use crate::types::{Result, VellumError};

/// Streams retained by a pool beyond this count are closed on return.
pub const MAX_POOLED_STREAMS: usize = 8;

/// Which physical artifact a stream addresses.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum FileMode {
    /// Random-access main data file.
    DataFile,
    /// Append-only write-ahead log file.
    LogFile,
    /// Discardable scratch file, deleted on dispose.
    TempFile,
}

/// One positional handle over a physical file.
///
/// A stream must be used by a single thread at a time; concurrency comes from
/// opening several streams over the same file and pooling them.
pub trait FileStream: Send + 'static {
    fn read_exact_at(&mut self, off: u64, dst: &mut [u8]) -> Result<()>;
    fn write_all_at(&mut self, off: u64, src: &[u8]) -> Result<()>;
    /// Forces buffered writes down to the OS and the device.
    fn flush(&mut self) -> Result<()>;
    fn len(&mut self) -> Result<u64>;
    fn set_len(&mut self, len: u64) -> Result<()>;
}

/// Opens streams over the data, log, and temp artifacts of one logical file.
pub trait DiskFactory: Send + Sync + 'static {
    /// Human-readable name of the backing store, for diagnostics.
    fn name(&self) -> &str;
    fn exists(&self, mode: FileMode) -> bool;
    fn open_stream(&self, writable: bool, mode: FileMode) -> Result<Box<dyn FileStream>>;
    fn delete(&self, mode: FileMode) -> Result<()>;
}

#[cfg(unix)]
mod stdio_unix {
    use std::{
        fs::File,
        io::{self, ErrorKind},
        os::unix::fs::FileExt,
    };

    pub fn read_exact(file: &File, mut off: u64, mut dst: &mut [u8]) -> io::Result<()> {
        while !dst.is_empty() {
            let read = file.read_at(dst, off)?;
            if read == 0 {
                return Err(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "read_at reached EOF",
                ));
            }
            let (_, tail) = dst.split_at_mut(read);
            dst = tail;
            off += read as u64;
        }
        Ok(())
    }

    pub fn write_all(file: &File, mut off: u64, mut src: &[u8]) -> io::Result<()> {
        while !src.is_empty() {
            let written = file.write_at(src, off)?;
            if written == 0 {
                return Err(io::Error::new(
                    ErrorKind::WriteZero,
                    "write_at wrote zero bytes",
                ));
            }
            src = &src[written..];
            off += written as u64;
        }
        Ok(())
    }
}

#[cfg(windows)]
mod stdio_win {
    use std::{
        fs::File,
        io::{self, ErrorKind},
        os::windows::fs::FileExt,
    };

    pub fn read_exact(file: &File, mut off: u64, mut dst: &mut [u8]) -> io::Result<()> {
        while !dst.is_empty() {
            let read = file.seek_read(dst, off)?;
            if read == 0 {
                return Err(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "seek_read reached EOF",
                ));
            }
            let (_, tail) = dst.split_at_mut(read);
            dst = tail;
            off += read as u64;
        }
        Ok(())
    }

    pub fn write_all(file: &File, mut off: u64, mut src: &[u8]) -> io::Result<()> {
        while !src.is_empty() {
            let written = file.seek_write(src, off)?;
            if written == 0 {
                return Err(io::Error::new(
                    ErrorKind::WriteZero,
                    "seek_write wrote zero bytes",
                ));
            }
            src = &src[written..];
            off += written as u64;
        }
        Ok(())
    }
}

/// `FileStream` over a plain `std::fs::File`.
pub struct StdFileStream {
    file: File,
}

impl StdFileStream {
    pub fn new(file: File) -> Self {
        Self { file }
    }

    pub fn open(path: impl AsRef<Path>, writable: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .create(writable)
            .truncate(false)
            .open(path)
            .map_err(VellumError::from)?;
        Ok(Self { file })
    }
}

impl FileStream for StdFileStream {
    fn read_exact_at(&mut self, off: u64, dst: &mut [u8]) -> Result<()> {
        #[cfg(unix)]
        {
            stdio_unix::read_exact(&self.file, off, dst).map_err(VellumError::from)
        }
        #[cfg(windows)]
        {
            stdio_win::read_exact(&self.file, off, dst).map_err(VellumError::from)
        }
        #[cfg(not(any(unix, windows)))]
        {
            let _ = (off, dst);
            Err(VellumError::Invalid(
                "StdFileStream unsupported on this platform",
            ))
        }
    }

    fn write_all_at(&mut self, off: u64, src: &[u8]) -> Result<()> {
        #[cfg(unix)]
        {
            stdio_unix::write_all(&self.file, off, src).map_err(VellumError::from)
        }
        #[cfg(windows)]
        {
            stdio_win::write_all(&self.file, off, src).map_err(VellumError::from)
        }
        #[cfg(not(any(unix, windows)))]
        {
            let _ = (off, src);
            Err(VellumError::Invalid(
                "StdFileStream unsupported on this platform",
            ))
        }
    }

    fn flush(&mut self) -> Result<()> {
        self.file.sync_all().map_err(VellumError::from)
    }

    fn len(&mut self) -> Result<u64> {
        Ok(self.file.metadata().map_err(VellumError::from)?.len())
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        self.file.set_len(len).map_err(VellumError::from)
    }
}

/// Factory over sibling files on the local file system: the data file at the
/// given path, the log at `<path>-log`, scratch at `<path>-tmp`.
pub struct FileDiskFactory {
    path: PathBuf,
    name: String,
}

impl FileDiskFactory {
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "vellum".to_string());
        Self { path, name }
    }

    pub fn path_for(&self, mode: FileMode) -> PathBuf {
        match mode {
            FileMode::DataFile => self.path.clone(),
            FileMode::LogFile => append_suffix(&self.path, "-log"),
            FileMode::TempFile => append_suffix(&self.path, "-tmp"),
        }
    }
}

impl DiskFactory for FileDiskFactory {
    fn name(&self) -> &str {
        &self.name
    }

    fn exists(&self, mode: FileMode) -> bool {
        self.path_for(mode).exists()
    }

    fn open_stream(&self, writable: bool, mode: FileMode) -> Result<Box<dyn FileStream>> {
        Ok(Box::new(StdFileStream::open(self.path_for(mode), writable)?))
    }

    fn delete(&self, mode: FileMode) -> Result<()> {
        match fs::remove_file(self.path_for(mode)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(VellumError::from(err)),
        }
    }
}

fn append_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(OsString::from)
        .unwrap_or_else(|| OsString::from("vellum"));
    name.push(suffix);
    let mut new_path = path.to_path_buf();
    new_path.set_file_name(name);
    new_path
}

/// Multi-producer/multi-consumer bag of idle read streams over one file mode.
///
/// Renting pulls an idle stream or opens a fresh one; returning retains at
/// most [`MAX_POOLED_STREAMS`], closing the rest.
pub struct StreamPool {
    factory: Arc<dyn DiskFactory>,
    mode: FileMode,
    idle: SegQueue<Box<dyn FileStream>>,
}

impl StreamPool {
    pub fn new(factory: Arc<dyn DiskFactory>, mode: FileMode) -> Self {
        Self {
            factory,
            mode,
            idle: SegQueue::new(),
        }
    }

    pub fn rent(&self) -> Result<Box<dyn FileStream>> {
        if let Some(stream) = self.idle.pop() {
            return Ok(stream);
        }
        self.factory.open_stream(false, self.mode)
    }

    pub fn give_back(&self, stream: Box<dyn FileStream>) {
        if self.idle.len() < MAX_POOLED_STREAMS {
            self.idle.push(stream);
        }
    }

    pub fn idle_count(&self) -> usize {
        self.idle.len()
    }
}
