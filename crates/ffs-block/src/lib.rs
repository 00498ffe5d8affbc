#![forbid(unsafe_code)]
//! Device I/O boundary.
//!
//! Provides the byte-addressed [`ByteDevice`] abstraction, the
//! [`IoPort`] trait the executor drives (extent enumeration, extent-sized
//! reads and writes, durable flush), a file-backed port with an optional
//! bounded scratch store, the retrying wrapper, and extent probes.
//!
//! Platform error codes are adapted here, in [`io_error`] and
//! [`errno_error`]; nothing above this crate inspects raw codes.

mod probe;
mod retry;

pub use probe::{ExtentProbe, FallbackProbe, FiemapProbe, FibmapProbe, parse_filefrag_output};
pub use retry::{RetryPolicy, RetryingIoPort};

use ffs_error::{FfsError, IoErrorKind, Result};
use ffs_extent::{Extent, ExtentMap};
use ffs_types::Region;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

// ── Error adaptation ────────────────────────────────────────────────────────

const EIO: i32 = 5;
const ENXIO: i32 = 6;
const ENODEV: i32 = 19;
const ENOTTY: i32 = 25;
const ENOSPC: i32 = 28;
const EOPNOTSUPP: i32 = 95;

fn kind_from_errno(errno: i32) -> Option<IoErrorKind> {
    match errno {
        EIO | ENXIO | ENODEV => Some(IoErrorKind::Device),
        ENOSPC => Some(IoErrorKind::NoSpace),
        ENOTTY | EOPNOTSUPP => Some(IoErrorKind::Unsupported),
        _ => None,
    }
}

/// Adapt a `std::io::Error` raised during `op`.
#[must_use]
pub fn io_error(op: &'static str, err: &std::io::Error) -> FfsError {
    use std::io::ErrorKind as K;
    let code = err.raw_os_error();
    let kind = match err.kind() {
        K::NotFound => IoErrorKind::NotFound,
        K::PermissionDenied => IoErrorKind::PermissionDenied,
        K::Interrupted => IoErrorKind::Interrupted,
        K::TimedOut => IoErrorKind::TimedOut,
        K::WouldBlock => IoErrorKind::WouldBlock,
        K::Unsupported => IoErrorKind::Unsupported,
        K::UnexpectedEof => IoErrorKind::UnexpectedEof,
        K::StorageFull => IoErrorKind::NoSpace,
        _ => code.and_then(kind_from_errno).unwrap_or(IoErrorKind::Other),
    };
    FfsError::Io {
        op,
        kind,
        code,
        detail: err.to_string(),
    }
}

/// Adapt a bare errno. Negative values (the `-errno` return convention)
/// are normalized to positive codes.
#[must_use]
pub fn errno_error(op: &'static str, errno: i32, detail: impl Into<String>) -> FfsError {
    let code = errno.checked_abs().unwrap_or(i32::MAX);
    let kind = kind_from_errno(code).unwrap_or_else(|| {
        match std::io::Error::from_raw_os_error(code).kind() {
            std::io::ErrorKind::NotFound => IoErrorKind::NotFound,
            std::io::ErrorKind::PermissionDenied => IoErrorKind::PermissionDenied,
            std::io::ErrorKind::Interrupted => IoErrorKind::Interrupted,
            std::io::ErrorKind::TimedOut => IoErrorKind::TimedOut,
            std::io::ErrorKind::WouldBlock => IoErrorKind::WouldBlock,
            _ => IoErrorKind::Other,
        }
    });
    FfsError::Io {
        op,
        kind,
        code: Some(code),
        detail: detail.into(),
    }
}

fn buf_len(buf: &[u8]) -> Result<u64> {
    u64::try_from(buf.len()).map_err(|_| FfsError::InvalidExtent("buffer length overflows u64".into()))
}

// ── Byte devices ────────────────────────────────────────────────────────────

/// Byte-addressed device for fixed-offset I/O (pread/pwrite semantics).
pub trait ByteDevice: Send + Sync {
    fn len_bytes(&self) -> u64;

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Flush written data to stable storage.
    fn sync(&self) -> Result<()>;
}

/// File- or block-device-backed byte device.
///
/// Uses `FileExt` positional I/O, so there is no shared seek position.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
}

impl FileByteDevice {
    /// Open read-write. Length is taken by seeking to the end, which also
    /// works for block device nodes.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map_err(|e| io_error("open", &e))?;
        let len = file
            .seek(SeekFrom::End(0))
            .map_err(|e| io_error("open", &e))?;
        Ok(Self {
            file: Arc::new(file),
            len,
        })
    }

    /// Open or create a regular file at least `len` bytes long.
    pub fn create(path: impl AsRef<Path>, len: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.as_ref())
            .map_err(|e| io_error("create", &e))?;
        let current = file.metadata().map_err(|e| io_error("create", &e))?.len();
        if current < len {
            file.set_len(len).map_err(|e| io_error("create", &e))?;
        }
        Ok(Self {
            file: Arc::new(file),
            len: current.max(len),
        })
    }

    fn check_range(&self, op: &'static str, offset: u64, len: u64) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(FfsError::Io {
                op,
                kind: IoErrorKind::UnexpectedEof,
                code: None,
                detail: format!(
                    "range offset={offset} len={len} exceeds device length {}",
                    self.len
                ),
            }),
        }
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.check_range("read", offset, buf_len(buf)?)?;
        self.file
            .read_exact_at(buf, offset)
            .map_err(|e| io_error("read", &e))
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        self.check_range("write", offset, buf_len(buf)?)?;
        self.file
            .write_all_at(buf, offset)
            .map_err(|e| io_error("write", &e))
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all().map_err(|e| io_error("flush", &e))
    }
}

// ── IoPort ──────────────────────────────────────────────────────────────────

/// Everything the engine asks of the outside world.
///
/// `read` and `write` take a buffer exactly as long as the extent.
/// `flush` returns only once every completed write is durable.
pub trait IoPort: Send + Sync {
    /// Logical-order extent map of a file.
    fn extents_of(&self, path: &Path) -> Result<ExtentMap>;

    fn read(&self, extent: &Extent, buf: &mut [u8]) -> Result<()>;

    fn write(&self, extent: &Extent, buf: &[u8]) -> Result<()>;

    fn flush(&self) -> Result<()>;
}

impl<P: IoPort + ?Sized> IoPort for Arc<P> {
    fn extents_of(&self, path: &Path) -> Result<ExtentMap> {
        (**self).extents_of(path)
    }

    fn read(&self, extent: &Extent, buf: &mut [u8]) -> Result<()> {
        (**self).read(extent, buf)
    }

    fn write(&self, extent: &Extent, buf: &[u8]) -> Result<()> {
        (**self).write(extent, buf)
    }

    fn flush(&self) -> Result<()> {
        (**self).flush()
    }
}

impl<P: IoPort + ?Sized> IoPort for &P {
    fn extents_of(&self, path: &Path) -> Result<ExtentMap> {
        (**self).extents_of(path)
    }

    fn read(&self, extent: &Extent, buf: &mut [u8]) -> Result<()> {
        (**self).read(extent, buf)
    }

    fn write(&self, extent: &Extent, buf: &[u8]) -> Result<()> {
        (**self).write(extent, buf)
    }

    fn flush(&self) -> Result<()> {
        (**self).flush()
    }
}

impl<P: IoPort + ?Sized> IoPort for Box<P> {
    fn extents_of(&self, path: &Path) -> Result<ExtentMap> {
        (**self).extents_of(path)
    }

    fn read(&self, extent: &Extent, buf: &mut [u8]) -> Result<()> {
        (**self).read(extent, buf)
    }

    fn write(&self, extent: &Extent, buf: &[u8]) -> Result<()> {
        (**self).write(extent, buf)
    }

    fn flush(&self) -> Result<()> {
        (**self).flush()
    }
}

/// Length check shared by port implementations.
pub fn check_buffer(extent: &Extent, len: usize) -> Result<()> {
    if u64::try_from(len).ok() == Some(extent.length()) {
        Ok(())
    } else {
        Err(FfsError::InvalidExtent(format!(
            "buffer of {len} bytes for extent {extent}"
        )))
    }
}

struct ScratchStore {
    device: FileByteDevice,
    extent: Extent,
}

/// Port over a device file plus an optional scratch file.
///
/// Scratch I/O outside the declared scratch extent is refused.
pub struct FileIoPort {
    device: FileByteDevice,
    scratch: Option<ScratchStore>,
    probe: Box<dyn ExtentProbe>,
}

impl std::fmt::Debug for FileIoPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileIoPort")
            .field("device_len", &self.device.len_bytes())
            .field("scratch", &self.scratch.as_ref().map(|s| s.extent))
            .field("probe", &self.probe.name())
            .finish()
    }
}

impl FileIoPort {
    pub fn open(device: impl AsRef<Path>, probe: Box<dyn ExtentProbe>) -> Result<Self> {
        Ok(Self {
            device: FileByteDevice::open(device)?,
            scratch: None,
            probe,
        })
    }

    /// Back the scratch region with `path`, sized to cover `extent`.
    pub fn with_scratch(mut self, path: impl AsRef<Path>, extent: Extent) -> Result<Self> {
        if extent.region() != Region::Scratch {
            return Err(FfsError::InvalidExtent(format!(
                "scratch extent {extent} must be on the scratch region"
            )));
        }
        self.scratch = Some(ScratchStore {
            device: FileByteDevice::create(path, extent.end())?,
            extent,
        });
        Ok(self)
    }

    #[must_use]
    pub fn device_len(&self) -> u64 {
        self.device.len_bytes()
    }

    fn target(&self, extent: &Extent) -> Result<&FileByteDevice> {
        match extent.region() {
            Region::Device => Ok(&self.device),
            Region::Scratch => match &self.scratch {
                Some(s) if s.extent.covers(extent) => Ok(&s.device),
                Some(s) => Err(FfsError::InvalidExtent(format!(
                    "{extent} lies outside scratch extent {}",
                    s.extent
                ))),
                None => Err(FfsError::InvalidExtent(format!(
                    "{extent} addresses scratch but no scratch store is configured"
                ))),
            },
        }
    }
}

impl IoPort for FileIoPort {
    fn extents_of(&self, path: &Path) -> Result<ExtentMap> {
        self.probe.query(path)
    }

    fn read(&self, extent: &Extent, buf: &mut [u8]) -> Result<()> {
        check_buffer(extent, buf.len())?;
        self.target(extent)?.read_exact_at(extent.offset(), buf)
    }

    fn write(&self, extent: &Extent, buf: &[u8]) -> Result<()> {
        check_buffer(extent, buf.len())?;
        self.target(extent)?.write_all_at(extent.offset(), buf)
    }

    fn flush(&self) -> Result<()> {
        self.device.sync()?;
        if let Some(scratch) = &self.scratch {
            scratch.device.sync()?;
        }
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
