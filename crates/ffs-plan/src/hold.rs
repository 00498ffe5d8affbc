//! Holding space for parked data while a cycle is broken.
//!
//! Two sources: spare device free space (free space no target uses, so no
//! move ever writes it) and the optional scratch extent.

use ffs_extent::{Extent, ExtentSet};
use ffs_types::Region;

#[derive(Debug, Clone)]
pub(crate) struct HoldingPool {
    capacity: ExtentSet,
    available: ExtentSet,
    block_size: u64,
    in_use_device: u64,
    in_use_scratch: u64,
}

impl HoldingPool {
    pub(crate) fn new(spare_device: &ExtentSet, scratch: Option<Extent>, block_size: u64) -> Self {
        let scratch: ExtentSet = scratch
            .and_then(|e| ExtentSet::new(vec![e]).ok())
            .unwrap_or_default();
        let capacity = spare_device.in_region(Region::Device).union(&scratch);
        Self {
            available: capacity.clone(),
            capacity,
            block_size,
            in_use_device: 0,
            in_use_scratch: 0,
        }
    }

    /// Largest contiguous block-aligned allocation currently possible.
    pub(crate) fn largest(&self) -> u64 {
        self.available
            .iter()
            .map(|e| self.usable(e).1)
            .max()
            .unwrap_or(0)
    }

    /// Aligned start and usable length inside `extent`.
    fn usable(&self, extent: &Extent) -> (u64, u64) {
        let bs = self.block_size;
        let start = extent.offset().div_ceil(bs).saturating_mul(bs);
        let len = extent.end().saturating_sub(start) / bs * bs;
        (start, len)
    }

    /// Carve `len` contiguous bytes, device space first.
    pub(crate) fn allocate(&mut self, len: u64) -> Option<Extent> {
        if len == 0 {
            return None;
        }
        let pick = self
            .available
            .iter()
            .filter(|e| self.usable(e).1 >= len)
            .min_by_key(|e| (e.region(), e.offset()))
            .copied()?;
        let (start, _) = self.usable(&pick);
        let taken = Extent::new(start, len, pick.region()).ok()?;
        let carved = ExtentSet::new(vec![taken]).ok()?;
        self.available = self.available.subtract(&carved);
        match taken.region() {
            Region::Device => self.in_use_device += len,
            Region::Scratch => self.in_use_scratch += len,
        }
        Some(taken)
    }

    pub(crate) fn release(&mut self, extent: Extent) {
        if let Ok(returned) = ExtentSet::new(vec![extent]) {
            self.available = self.available.union(&returned);
        }
        match extent.region() {
            Region::Device => self.in_use_device = self.in_use_device.saturating_sub(extent.length()),
            Region::Scratch => {
                self.in_use_scratch = self.in_use_scratch.saturating_sub(extent.length());
            }
        }
    }

    /// Return every holding extent to the pool.
    pub(crate) fn reset(&mut self) {
        self.available = self.capacity.clone();
        self.in_use_device = 0;
        self.in_use_scratch = 0;
    }

    pub(crate) const fn in_use(&self) -> u64 {
        self.in_use_device + self.in_use_scratch
    }

    pub(crate) const fn in_use_scratch(&self) -> u64 {
        self.in_use_scratch
    }
}
