//! On-disk job record format, version 1.
//!
//! All integers are little-endian. Every section carries its own CRC32C so
//! a torn write is detected per section rather than per file.
//!
//! ```text
//! ┌──────────────┬──────────────┬──────────────┬───────────────────────────┐
//! │ header (64)  │ slot A (48)  │ slot B (48)  │ move list (32 × count)    │
//! └──────────────┴──────────────┴──────────────┴───────────────────────────┘
//! 0              64             112            160
//! ```
//!
//! The header and move list are written once, when the job is created.
//! Progress updates alternate between the two slots; a slot with sequence
//! `n` lives in slot `n % 2`.

use ffs_extent::Extent;
use ffs_plan::{Move, PlanFingerprint};
use ffs_types::{ParseError, Region, read_fixed, read_le_u16, read_le_u32, read_le_u64};
use serde::Serialize;

// ── Magic constants ─────────────────────────────────────────────────────────

/// "FRJB" (remap job).
pub const JOB_HEADER_MAGIC: u32 = 0x424A_5246;

/// "FRPG" (remap progress).
pub const PROGRESS_MAGIC: u32 = 0x4750_5246;

pub const FORMAT_VERSION: u16 = 1;

pub const SLOT_OFFSETS: [usize; 2] = [JobHeader::SIZE, JobHeader::SIZE + ProgressSlot::SIZE];

pub const MOVES_OFFSET: usize = JobHeader::SIZE + 2 * ProgressSlot::SIZE;

// ── JobStatus ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Planning,
    Running,
    Paused,
    Done,
    Failed,
}

impl JobStatus {
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Planning => 0,
            Self::Running => 1,
            Self::Paused => 2,
            Self::Done => 3,
            Self::Failed => 4,
        }
    }

    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Planning),
            1 => Some(Self::Running),
            2 => Some(Self::Paused),
            3 => Some(Self::Done),
            4 => Some(Self::Failed),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Planning => "planning",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn checksum_mismatch(field: &'static str) -> ParseError {
    ParseError::InvalidField {
        field,
        reason: "checksum mismatch",
    }
}

// ── JobHeader ───────────────────────────────────────────────────────────────

/// Immutable part of the record.
///
/// ```text
/// Offset  Size  Field
/// 0       4     magic (0x424A5246 = "FRJB")
/// 4       2     version
/// 6       2     reserved (zero)
/// 8       32    plan fingerprint (BLAKE3)
/// 40      8     move_count
/// 48      8     total_bytes
/// 56      4     move_list_crc: CRC32C of the whole move list
/// 60      4     header_crc: CRC32C of bytes [0..60]
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobHeader {
    pub fingerprint: PlanFingerprint,
    pub move_count: u64,
    pub total_bytes: u64,
    pub move_list_crc: u32,
}

impl JobHeader {
    pub const SIZE: usize = 64;

    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0_u8; Self::SIZE];
        buf[0..4].copy_from_slice(&JOB_HEADER_MAGIC.to_le_bytes());
        buf[4..6].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        buf[8..40].copy_from_slice(self.fingerprint.as_bytes());
        buf[40..48].copy_from_slice(&self.move_count.to_le_bytes());
        buf[48..56].copy_from_slice(&self.total_bytes.to_le_bytes());
        buf[56..60].copy_from_slice(&self.move_list_crc.to_le_bytes());
        let crc = crc32c::crc32c(&buf[..60]);
        buf[60..64].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let magic = read_le_u32(data, 0)?;
        if magic != JOB_HEADER_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: JOB_HEADER_MAGIC,
                actual: magic,
            });
        }
        let stored = read_le_u32(data, 60)?;
        if stored != crc32c::crc32c(&data[..60]) {
            return Err(checksum_mismatch("header_crc"));
        }
        if read_le_u16(data, 4)? != FORMAT_VERSION {
            return Err(ParseError::InvalidField {
                field: "version",
                reason: "unsupported job record version",
            });
        }
        Ok(Self {
            fingerprint: PlanFingerprint::from_bytes(read_fixed::<32>(data, 8)?),
            move_count: read_le_u64(data, 40)?,
            total_bytes: read_le_u64(data, 48)?,
            move_list_crc: read_le_u32(data, 56)?,
        })
    }
}

// ── ProgressSlot ────────────────────────────────────────────────────────────

/// One copy of the mutable progress state.
///
/// ```text
/// Offset  Size  Field
/// 0       4     magic (0x47505246 = "FRPG")
/// 4       1     status
/// 5       3     reserved (zero)
/// 8       8     sequence: strictly increasing per update
/// 16      8     next_move_index
/// 24      8     completed_bytes
/// 32      8     updated_at: unix seconds
/// 40      4     crc: CRC32C of bytes [0..40]
/// 44      4     reserved (zero)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProgressSlot {
    pub status: JobStatus,
    pub sequence: u64,
    pub next_move_index: u64,
    pub completed_bytes: u64,
    pub updated_at: u64,
}

impl ProgressSlot {
    pub const SIZE: usize = 48;

    /// Index of the slot this sequence number is written to.
    #[must_use]
    pub const fn slot_index(&self) -> usize {
        (self.sequence % 2) as usize
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0_u8; Self::SIZE];
        buf[0..4].copy_from_slice(&PROGRESS_MAGIC.to_le_bytes());
        buf[4] = self.status.code();
        buf[8..16].copy_from_slice(&self.sequence.to_le_bytes());
        buf[16..24].copy_from_slice(&self.next_move_index.to_le_bytes());
        buf[24..32].copy_from_slice(&self.completed_bytes.to_le_bytes());
        buf[32..40].copy_from_slice(&self.updated_at.to_le_bytes());
        let crc = crc32c::crc32c(&buf[..40]);
        buf[40..44].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let magic = read_le_u32(data, 0)?;
        if magic != PROGRESS_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: PROGRESS_MAGIC,
                actual: magic,
            });
        }
        let stored = read_le_u32(data, 40)?;
        if stored != crc32c::crc32c(&data[..40]) {
            return Err(checksum_mismatch("progress_crc"));
        }
        let status = JobStatus::from_code(read_fixed::<1>(data, 4)?[0]).ok_or(
            ParseError::InvalidField {
                field: "status",
                reason: "unknown status code",
            },
        )?;
        Ok(Self {
            status,
            sequence: read_le_u64(data, 8)?,
            next_move_index: read_le_u64(data, 16)?,
            completed_bytes: read_le_u64(data, 24)?,
            updated_at: read_le_u64(data, 32)?,
        })
    }

    /// The newest slot that parses, if any.
    #[must_use]
    pub fn newest(a: &[u8], b: &[u8]) -> Option<Self> {
        match (Self::parse(a).ok(), Self::parse(b).ok()) {
            (Some(x), Some(y)) => Some(if y.sequence > x.sequence { y } else { x }),
            (x, y) => x.or(y),
        }
    }
}

// ── Move list ───────────────────────────────────────────────────────────────

/// ```text
/// Offset  Size  Field
/// 0       8     source offset
/// 8       8     destination offset
/// 16      8     length
/// 24      1     source region
/// 25      1     destination region
/// 26      6     reserved (zero)
/// ```
pub const MOVE_SIZE: usize = 32;

#[must_use]
pub fn encode_moves(moves: &[Move]) -> Vec<u8> {
    let mut out = vec![0_u8; moves.len() * MOVE_SIZE];
    for (chunk, mv) in out.chunks_exact_mut(MOVE_SIZE).zip(moves) {
        chunk[0..8].copy_from_slice(&mv.source().offset().to_le_bytes());
        chunk[8..16].copy_from_slice(&mv.destination().offset().to_le_bytes());
        chunk[16..24].copy_from_slice(&mv.length().to_le_bytes());
        chunk[24] = mv.source().region().code();
        chunk[25] = mv.destination().region().code();
    }
    out
}

fn region_at(data: &[u8], offset: usize) -> Result<Region, ParseError> {
    Region::from_code(read_fixed::<1>(data, offset)?[0]).ok_or(ParseError::InvalidField {
        field: "region",
        reason: "unknown region code",
    })
}

fn invalid_move() -> ParseError {
    ParseError::InvalidField {
        field: "move",
        reason: "zero-length, overflowing or mismatched extents",
    }
}

/// Decode `count` moves, checking the list against `expected_crc`.
pub fn decode_moves(data: &[u8], count: u64, expected_crc: u32) -> Result<Vec<Move>, ParseError> {
    let count = usize::try_from(count).map_err(|_| ParseError::InvalidField {
        field: "move_count",
        reason: "does not fit in memory",
    })?;
    let len = count.checked_mul(MOVE_SIZE).ok_or(ParseError::InvalidField {
        field: "move_count",
        reason: "does not fit in memory",
    })?;
    let list = ffs_types::ensure_slice(data, 0, len)?;
    if crc32c::crc32c(list) != expected_crc {
        return Err(checksum_mismatch("move_list_crc"));
    }

    let mut moves = Vec::with_capacity(count);
    for chunk in list.chunks_exact(MOVE_SIZE) {
        let length = read_le_u64(chunk, 16)?;
        let source = Extent::new(read_le_u64(chunk, 0)?, length, region_at(chunk, 24)?)
            .map_err(|_| invalid_move())?;
        let destination = Extent::new(read_le_u64(chunk, 8)?, length, region_at(chunk, 25)?)
            .map_err(|_| invalid_move())?;
        moves.push(Move::new(source, destination).map_err(|_| invalid_move())?);
    }
    Ok(moves)
}

// ── Tests ───────────────────────────────────────────────────────────────────
