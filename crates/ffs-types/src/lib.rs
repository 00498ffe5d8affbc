#![forbid(unsafe_code)]
//! Primitive types shared by every remapper crate.
//!
//! - [`Region`]: which backing store an extent lives on.
//! - [`Cx`]: cooperative cancellation context threaded through long loops.
//! - Little-endian field readers used by the on-disk job record codec.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

// ── Region ──────────────────────────────────────────────────────────────────

/// Backing store of an extent.
///
/// `Device` is the block device being remapped. `Scratch` is the bounded
/// secondary store used as holding space while breaking move cycles.
/// Offsets in different regions are unrelated and never overlap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Region {
    Device,
    Scratch,
}

impl Region {
    /// On-disk code used by the job record.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Device => 0,
            Self::Scratch => 1,
        }
    }

    /// Inverse of [`Region::code`].
    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Device),
            1 => Some(Self::Scratch),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Device => "device",
            Self::Scratch => "scratch",
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Cancellation context ────────────────────────────────────────────────────

/// Returned by [`Cx::checkpoint`] once cancellation has been requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

impl fmt::Display for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("cancellation requested")
    }
}

impl std::error::Error for Cancelled {}

/// Capability context for cooperative cancellation.
///
/// Clones share the same flag, so a signal handler can hold one clone and
/// request cancellation while the engine polls another. Cancellation is
/// only ever observed at explicit checkpoints.
#[derive(Debug, Clone, Default)]
pub struct Cx {
    cancel: Arc<AtomicBool>,
}

impl Cx {
    /// Context for a real run.
    #[must_use]
    pub fn for_request() -> Self {
        Self::default()
    }

    /// Context for tests; identical to [`Cx::for_request`].
    #[must_use]
    pub fn for_testing() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    /// Fail with [`Cancelled`] if cancellation has been requested.
    pub fn checkpoint(&self) -> Result<(), Cancelled> {
        if self.is_cancel_requested() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }
}

// ── Parsing helpers ─────────────────────────────────────────────────────────

/// Low-level decode failure for fixed-layout records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    InvalidMagic {
        expected: u32,
        actual: u32,
    },
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InsufficientData {
                needed,
                offset,
                actual,
            } => write!(
                f,
                "insufficient data: need {needed} bytes at offset {offset}, buffer is {actual}"
            ),
            Self::InvalidMagic { expected, actual } => {
                write!(f, "bad magic: expected {expected:#010x}, got {actual:#010x}")
            }
            Self::InvalidField { field, reason } => write!(f, "invalid {field}: {reason}"),
        }
    }
}

impl std::error::Error for ParseError {}

/// Borrow `len` bytes at `offset`, or report how much was missing.
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let end = offset.checked_add(len).ok_or(ParseError::InsufficientData {
        needed: len,
        offset,
        actual: data.len(),
    })?;
    data.get(offset..end).ok_or(ParseError::InsufficientData {
        needed: len,
        offset,
        actual: data.len(),
    })
}

pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    Ok(u16::from_le_bytes(read_fixed::<2>(data, offset)?))
}

pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    Ok(u32::from_le_bytes(read_fixed::<4>(data, offset)?))
}

pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    Ok(u64::from_le_bytes(read_fixed::<8>(data, offset)?))
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_codes_are_stable() {
        assert_eq!(Region::Device.code(), 0);
        assert_eq!(Region::Scratch.code(), 1);
        assert_eq!(Region::from_code(1), Some(Region::Scratch));
        assert_eq!(Region::from_code(7), None);
    }

    #[test]
    fn region_serializes_snake_case() {
        let json = serde_json::to_string(&Region::Scratch).unwrap();
        assert_eq!(json, "\"scratch\"");
    }

    #[test]
    fn cx_clones_share_cancellation() {
        let cx = Cx::for_testing();
        let handle = cx.clone();
        assert!(cx.checkpoint().is_ok());
        handle.cancel();
        assert!(cx.is_cancel_requested());
        assert_eq!(cx.checkpoint(), Err(Cancelled));
    }

    #[test]
    fn readers_report_short_buffers() {
        let data = [1_u8, 0, 0, 0, 2];
        assert_eq!(read_le_u32(&data, 0).unwrap(), 1);
        let err = read_le_u64(&data, 0).unwrap_err();
        assert_eq!(
            err,
            ParseError::InsufficientData {
                needed: 8,
                offset: 0,
                actual: 5
            }
        );
        assert!(ensure_slice(&data, usize::MAX, 2).is_err());
    }
}
