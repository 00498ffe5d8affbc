#![forbid(unsafe_code)]
//! Extent algebra: byte ranges on the device and on scratch storage.
//!
//! ## Types
//!
//! - **Extent**: one contiguous, non-empty byte range tagged with its
//!   [`Region`].
//! - **ExtentSet**: non-overlapping extents ordered by region then offset.
//!   Supports `union`, `intersect`, `subtract`, `normalize`, `alignment`.
//! - **ExtentMap**: non-overlapping extents kept in *logical* order; the
//!   logical offset of an entry is the sum of the lengths before it.
//!
//! Construction validates. Every set operation returns a normalized set
//! (adjacent ranges merged).

use ffs_error::{FfsError, Result};
use ffs_types::Region;
use serde::Serialize;
use std::fmt;

// ── Extent ──────────────────────────────────────────────────────────────────

/// A non-empty byte range. `offset + length` never overflows.
///
/// Field order gives the derived `Ord` its (region, offset, length) key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Extent {
    region: Region,
    offset: u64,
    length: u64,
}

impl Extent {
    pub fn new(offset: u64, length: u64, region: Region) -> Result<Self> {
        if length == 0 {
            return Err(FfsError::InvalidExtent(format!(
                "zero-length {region} extent at offset {offset}"
            )));
        }
        if offset.checked_add(length).is_none() {
            return Err(FfsError::InvalidExtent(format!(
                "{region} extent at offset {offset} with length {length} overflows"
            )));
        }
        Ok(Self {
            region,
            offset,
            length,
        })
    }

    pub fn device(offset: u64, length: u64) -> Result<Self> {
        Self::new(offset, length, Region::Device)
    }

    pub fn scratch(offset: u64, length: u64) -> Result<Self> {
        Self::new(offset, length, Region::Scratch)
    }

    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    #[must_use]
    pub const fn length(&self) -> u64 {
        self.length
    }

    #[must_use]
    pub const fn region(&self) -> Region {
        self.region
    }

    /// Exclusive end offset.
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.offset + self.length
    }

    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        self.region == other.region && self.offset < other.end() && other.offset < self.end()
    }

    /// `other` lies entirely within `self`.
    #[must_use]
    pub fn covers(&self, other: &Self) -> bool {
        self.region == other.region && self.offset <= other.offset && other.end() <= self.end()
    }

    #[must_use]
    pub fn intersection(&self, other: &Self) -> Option<Self> {
        if !self.overlaps(other) {
            return None;
        }
        let start = self.offset.max(other.offset);
        let end = self.end().min(other.end());
        Some(Self {
            region: self.region,
            offset: start,
            length: end - start,
        })
    }

    /// Sub-range `[offset + skip, offset + skip + len)`, if non-empty and in bounds.
    #[must_use]
    pub fn slice(&self, skip: u64, len: u64) -> Option<Self> {
        if len == 0 || skip.checked_add(len)? > self.length {
            return None;
        }
        Some(Self {
            region: self.region,
            offset: self.offset + skip,
            length: len,
        })
    }

    /// Both offset and length are multiples of `block_size`.
    #[must_use]
    pub const fn is_aligned(&self, block_size: u64) -> bool {
        block_size != 0 && self.offset % block_size == 0 && self.length % block_size == 0
    }
}

impl fmt::Display for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}..{})", self.region, self.offset, self.end())
    }
}

fn first_overlap(msg: &str, sorted: &[Extent]) -> Result<()> {
    for pair in sorted.windows(2) {
        if pair[0].overlaps(&pair[1]) {
            return Err(FfsError::InvalidExtent(format!(
                "{msg}: {} overlaps {}",
                pair[0], pair[1]
            )));
        }
    }
    Ok(())
}

// ── ExtentSet ───────────────────────────────────────────────────────────────

/// Ordered, pairwise non-overlapping extents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ExtentSet {
    extents: Vec<Extent>,
}

impl ExtentSet {
    /// Sort and validate. Adjacent extents are kept distinct; call
    /// [`ExtentSet::normalize`] to merge them.
    pub fn new(mut extents: Vec<Extent>) -> Result<Self> {
        extents.sort_unstable();
        first_overlap("extent set", &extents)?;
        Ok(Self { extents })
    }

    #[must_use]
    pub const fn empty() -> Self {
        Self {
            extents: Vec::new(),
        }
    }

    /// Build from extents already sorted and disjoint, merging adjacent ones.
    fn from_sorted(extents: Vec<Extent>) -> Self {
        let mut out: Vec<Extent> = Vec::with_capacity(extents.len());
        for ext in extents {
            match out.last_mut() {
                Some(last) if last.region == ext.region && last.end() >= ext.offset => {
                    let end = last.end().max(ext.end());
                    last.length = end - last.offset;
                }
                _ => out.push(ext),
            }
        }
        Self { extents: out }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[Extent] {
        &self.extents
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Extent> {
        self.extents.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.extents.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.extents.is_empty()
    }

    #[must_use]
    pub fn total_length(&self) -> u64 {
        self.extents.iter().map(Extent::length).sum()
    }

    /// Merge adjacent ranges of the same region.
    #[must_use]
    pub fn normalize(&self) -> Self {
        Self::from_sorted(self.extents.clone())
    }

    /// Only the extents of `region`.
    #[must_use]
    pub fn in_region(&self, region: Region) -> Self {
        Self {
            extents: self
                .extents
                .iter()
                .copied()
                .filter(|e| e.region == region)
                .collect(),
        }
    }

    #[must_use]
    pub fn union(&self, other: &Self) -> Self {
        let mut all = Vec::with_capacity(self.len() + other.len());
        all.extend_from_slice(&self.extents);
        all.extend_from_slice(&other.extents);
        all.sort_unstable();
        Self::from_sorted(all)
    }

    #[must_use]
    pub fn intersect(&self, other: &Self) -> Self {
        let (a, b) = (&self.extents, &other.extents);
        let (mut i, mut j) = (0, 0);
        let mut out = Vec::new();
        while i < a.len() && j < b.len() {
            if let Some(common) = a[i].intersection(&b[j]) {
                out.push(common);
            }
            if (a[i].region, a[i].end()) <= (b[j].region, b[j].end()) {
                i += 1;
            } else {
                j += 1;
            }
        }
        Self::from_sorted(out)
    }

    /// Bytes of `self` not covered by `other`.
    #[must_use]
    pub fn subtract(&self, other: &Self) -> Self {
        let mut out = Vec::new();
        for ext in &self.extents {
            let mut cursor = ext.offset;
            for cut in other.overlapping(ext) {
                if cut.offset > cursor {
                    out.push(Extent {
                        region: ext.region,
                        offset: cursor,
                        length: cut.offset - cursor,
                    });
                }
                cursor = cursor.max(cut.end());
            }
            if cursor < ext.end() {
                out.push(Extent {
                    region: ext.region,
                    offset: cursor,
                    length: ext.end() - cursor,
                });
            }
        }
        Self::from_sorted(out)
    }

    /// Members overlapping `probe`, in order.
    pub fn overlapping<'a>(&'a self, probe: &'a Extent) -> impl Iterator<Item = &'a Extent> + 'a {
        let start = self
            .extents
            .partition_point(|e| (e.region, e.end()) <= (probe.region, probe.offset));
        self.extents[start..]
            .iter()
            .take_while(move |e| e.region == probe.region && e.offset < probe.end())
    }

    /// Any byte of `probe` is in the set.
    #[must_use]
    pub fn overlaps(&self, probe: &Extent) -> bool {
        self.overlapping(probe).next().is_some()
    }

    /// Every byte of `probe` is in the set.
    #[must_use]
    pub fn contains(&self, probe: &Extent) -> bool {
        let mut cursor = probe.offset;
        for ext in self.overlapping(probe) {
            if ext.offset > cursor {
                return false;
            }
            cursor = cursor.max(ext.end());
            if cursor >= probe.end() {
                return true;
            }
        }
        false
    }

    /// Largest power of two dividing every offset and length, or `None`
    /// for an empty set.
    #[must_use]
    pub fn alignment(&self) -> Option<u64> {
        let bits = self
            .extents
            .iter()
            .fold(0_u64, |acc, e| acc | e.offset | e.length);
        if self.extents.is_empty() {
            None
        } else {
            // `length >= 1`, so `bits` is non-zero.
            Some(1_u64 << bits.trailing_zeros())
        }
    }

    /// Longest member, earliest on ties.
    #[must_use]
    pub fn largest(&self) -> Option<Extent> {
        self.extents
            .iter()
            .copied()
            .reduce(|best, e| if e.length > best.length { e } else { best })
    }
}

impl<'a> IntoIterator for &'a ExtentSet {
    type Item = &'a Extent;
    type IntoIter = std::slice::Iter<'a, Extent>;

    fn into_iter(self) -> Self::IntoIter {
        self.extents.iter()
    }
}

impl fmt::Display for ExtentSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, ext) in self.extents.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{ext}")?;
        }
        f.write_str("}")
    }
}

// ── ExtentMap ───────────────────────────────────────────────────────────────

/// Non-overlapping extents in logical order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ExtentMap {
    extents: Vec<Extent>,
}

impl ExtentMap {
    pub fn new(extents: Vec<Extent>) -> Result<Self> {
        let mut sorted = extents.clone();
        sorted.sort_unstable();
        first_overlap("extent map", &sorted)?;
        Ok(Self { extents })
    }

    #[must_use]
    pub fn as_slice(&self) -> &[Extent] {
        &self.extents
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.extents.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.extents.is_empty()
    }

    #[must_use]
    pub fn total_length(&self) -> u64 {
        self.extents.iter().map(Extent::length).sum()
    }

    /// Physical set covered by the map, normalized.
    #[must_use]
    pub fn to_set(&self) -> ExtentSet {
        let mut sorted = self.extents.clone();
        sorted.sort_unstable();
        ExtentSet::from_sorted(sorted)
    }

    /// Merge logically consecutive entries that are also physically
    /// contiguous, so differently fragmented reports of one layout compare
    /// equal.
    #[must_use]
    pub fn coalesce(&self) -> Self {
        let mut out: Vec<Extent> = Vec::with_capacity(self.extents.len());
        for ext in &self.extents {
            match out.last_mut() {
                Some(last) if last.region == ext.region && last.end() == ext.offset => {
                    last.length += ext.length;
                }
                _ => out.push(*ext),
            }
        }
        Self { extents: out }
    }

    /// `(logical_offset, extent)` pairs in logical order.
    pub fn iter_logical(&self) -> impl Iterator<Item = (u64, Extent)> + '_ {
        self.extents.iter().scan(0_u64, |logical, ext| {
            let at = *logical;
            *logical += ext.length;
            Some((at, *ext))
        })
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
