//! Immutable plan value: ordered moves plus the fingerprint binding them
//! to their inputs.

use ffs_error::{FfsError, Result};
use ffs_extent::Extent;
use ffs_types::Region;
use serde::{Serialize, Serializer};
use std::fmt;

/// Copy `source` to `destination`; afterwards `source` may be reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Move {
    source: Extent,
    destination: Extent,
}

impl Move {
    pub fn new(source: Extent, destination: Extent) -> Result<Self> {
        if source.length() != destination.length() {
            return Err(FfsError::InvalidExtent(format!(
                "move {source} -> {destination} changes length"
            )));
        }
        Ok(Self {
            source,
            destination,
        })
    }

    /// Caller guarantees equal lengths.
    pub(crate) const fn between(source: Extent, destination: Extent) -> Self {
        Self {
            source,
            destination,
        }
    }

    #[must_use]
    pub const fn source(&self) -> Extent {
        self.source
    }

    #[must_use]
    pub const fn destination(&self) -> Extent {
        self.destination
    }

    #[must_use]
    pub const fn length(&self) -> u64 {
        self.source.length()
    }

    #[must_use]
    pub fn touches_scratch(&self) -> bool {
        self.source.region() == Region::Scratch || self.destination.region() == Region::Scratch
    }
}

impl fmt::Display for Move {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.source, self.destination)
    }
}

/// BLAKE3 digest over block size and every planner input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PlanFingerprint([u8; 32]);

impl PlanFingerprint {
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for PlanFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl Serialize for PlanFingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Planner bookkeeping. Not persisted; a plan restored from a job record
/// carries zeroed stats.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlanStats {
    /// Moves straight from source to final destination.
    pub direct_moves: u64,
    /// Moves into holding space.
    pub parked_moves: u64,
    pub cycles_broken: u64,
    /// Highest simultaneous holding use, device and scratch combined.
    pub peak_holding_bytes: u64,
    pub peak_scratch_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemapPlan {
    fingerprint: PlanFingerprint,
    total_bytes: u64,
    stats: PlanStats,
    moves: Vec<Move>,
}

impl RemapPlan {
    /// Rebuild a plan from persisted parts.
    #[must_use]
    pub fn restore(fingerprint: PlanFingerprint, moves: Vec<Move>) -> Self {
        Self {
            fingerprint,
            total_bytes: moves.iter().map(Move::length).sum(),
            stats: PlanStats::default(),
            moves,
        }
    }

    #[must_use]
    pub const fn fingerprint(&self) -> PlanFingerprint {
        self.fingerprint
    }

    #[must_use]
    pub fn moves(&self) -> &[Move] {
        &self.moves
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.moves.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.moves.is_empty()
    }

    /// Sum of all move lengths.
    #[must_use]
    pub const fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    #[must_use]
    pub const fn stats(&self) -> &PlanStats {
        &self.stats
    }
}

/// Accumulates moves and stats while planning.
#[derive(Debug, Default)]
pub(crate) struct PlanBuilder {
    moves: Vec<Move>,
    stats: PlanStats,
}

impl PlanBuilder {
    pub(crate) fn direct(&mut self, source: Extent, destination: Extent) {
        self.moves.push(Move::between(source, destination));
        self.stats.direct_moves += 1;
    }

    pub(crate) fn park(&mut self, source: Extent, holding: Extent) {
        self.moves.push(Move::between(source, holding));
        self.stats.parked_moves += 1;
        self.stats.cycles_broken += 1;
    }

    pub(crate) fn unpark(&mut self, holding: Extent, destination: Extent) {
        self.moves.push(Move::between(holding, destination));
    }

    pub(crate) fn record_holding(&mut self, holding: u64, scratch: u64) {
        self.stats.peak_holding_bytes = self.stats.peak_holding_bytes.max(holding);
        self.stats.peak_scratch_bytes = self.stats.peak_scratch_bytes.max(scratch);
    }

    pub(crate) fn finish(self, fingerprint: PlanFingerprint) -> RemapPlan {
        RemapPlan {
            fingerprint,
            total_bytes: self.moves.iter().map(Move::length).sum(),
            stats: self.stats,
            moves: self.moves,
        }
    }
}
