#![forbid(unsafe_code)]
//! Error taxonomy for planning, persistence and execution.
//!
//! Platform error codes never leave the I/O layer raw: collaborators adapt
//! them into an [`IoErrorKind`] and keep the original code only as opaque
//! diagnostic payload.

use std::fmt;
use thiserror::Error;

/// Normalized I/O failure classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IoErrorKind {
    NotFound,
    PermissionDenied,
    NoSpace,
    /// Media or transport failure reported by the device.
    Device,
    Interrupted,
    TimedOut,
    WouldBlock,
    Unsupported,
    UnexpectedEof,
    Other,
}

impl IoErrorKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::PermissionDenied => "permission_denied",
            Self::NoSpace => "no_space",
            Self::Device => "device",
            Self::Interrupted => "interrupted",
            Self::TimedOut => "timed_out",
            Self::WouldBlock => "would_block",
            Self::Unsupported => "unsupported",
            Self::UnexpectedEof => "unexpected_eof",
            Self::Other => "other",
        }
    }

    /// Failures worth retrying with backoff.
    #[must_use]
    pub const fn is_transient(self) -> bool {
        matches!(self, Self::Interrupted | Self::TimedOut | Self::WouldBlock)
    }
}

impl fmt::Display for IoErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum FfsError {
    /// Zero-length, overflowing, misaligned or overlapping extent input.
    #[error("invalid extent: {0}")]
    InvalidExtent(String),

    /// Free and scratch space together cannot realize the layout change.
    #[error("insufficient space: need {needed} bytes of holding space, {available} available ({detail})")]
    InsufficientSpace {
        needed: u64,
        available: u64,
        detail: String,
    },

    /// The target layout cannot be reached from the source layout.
    #[error("unreachable target: {0}")]
    UnreachableTarget(String),

    /// Extent enumeration failed.
    #[error("extent query failed for {path}: {detail}")]
    ExtentQuery { path: String, detail: String },

    #[error("I/O error during {op} ({kind}{}): {detail}", .code.map(|c| format!(", code {c}")).unwrap_or_default())]
    Io {
        op: &'static str,
        kind: IoErrorKind,
        code: Option<i32>,
        detail: String,
    },

    /// The persisted plan no longer matches a freshly computed one.
    #[error("plan mismatch: persisted fingerprint {persisted}, recomputed {recomputed}")]
    PlanMismatch {
        persisted: String,
        recomputed: String,
    },

    #[error("retries exhausted after {attempts} attempts during {op}: {last}")]
    RetryExhausted {
        op: &'static str,
        attempts: u32,
        last: Box<FfsError>,
    },

    /// Cancellation observed at a checkpoint.
    #[error("interrupted")]
    Interrupted,

    /// Destination re-read does not match the source.
    #[error("verification mismatch at {region} offset {offset}")]
    VerifyMismatch { region: &'static str, offset: u64 },

    /// Corrupt or unsupported persisted data.
    #[error("invalid format: {0}")]
    Format(String),

    #[error("invalid job transition: {from} -> {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },

    /// Progress recorded for a move other than the next uncommitted one.
    #[error("out-of-order progress: expected move {expected}, got {actual}")]
    OutOfOrder { expected: u64, actual: u64 },
}

impl FfsError {
    /// Stable snake_case name of the error kind, used in structured logs.
    #[must_use]
    pub const fn kind_name(&self) -> &'static str {
        match self {
            Self::InvalidExtent(_) => "invalid_extent",
            Self::InsufficientSpace { .. } => "insufficient_space",
            Self::UnreachableTarget(_) => "unreachable_target",
            Self::ExtentQuery { .. } => "extent_query_error",
            Self::Io { .. } => "io_error",
            Self::PlanMismatch { .. } => "plan_mismatch",
            Self::RetryExhausted { .. } => "retry_exhausted",
            Self::Interrupted => "interrupted",
            Self::VerifyMismatch { .. } => "verify_mismatch",
            Self::Format(_) => "format",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::OutOfOrder { .. } => "out_of_order",
        }
    }

    /// Raw platform code carried by the innermost I/O failure, if any.
    #[must_use]
    pub fn platform_code(&self) -> Option<i32> {
        match self {
            Self::Io { code, .. } => *code,
            Self::RetryExhausted { last, .. } => last.platform_code(),
            _ => None,
        }
    }

    /// Whether the I/O layer may retry the failed operation.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Io { kind, .. } => kind.is_transient(),
            _ => false,
        }
    }

    /// Planning-phase errors: the caller must change inputs and replan.
    #[must_use]
    pub const fn is_planning_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidExtent(_) | Self::InsufficientSpace { .. } | Self::UnreachableTarget(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, FfsError>;
