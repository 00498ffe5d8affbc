//! Breaking one cyclic component into executable moves.
//!
//! The component's pieces are first refined so that every destination
//! either equals exactly one member's source or touches none of them. After
//! refinement each piece has at most one successor and one predecessor,
//! so the component decomposes into chains and simple cycles of equal-length
//! pieces. Chains drain as their heads become free; each remaining cycle is
//! broken by parking its lowest-logical piece in holding space, rotating
//! the rest, then delivering the parked data.

use crate::graph::Piece;
use crate::hold::HoldingPool;
use crate::plan::PlanBuilder;
use ffs_error::{FfsError, Result};
use ffs_extent::Extent;
use ffs_log::Logger;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};

// ── Refinement ──────────────────────────────────────────────────────────────

/// Split pieces at every boundary that any member's source or destination
/// introduces, closed under the source/destination correspondence.
pub(crate) fn refine(pieces: &[Piece]) -> Vec<Piece> {
    let by_source: BTreeMap<u64, usize> = pieces
        .iter()
        .enumerate()
        .map(|(i, p)| (p.source.offset(), i))
        .collect();
    let by_dest: BTreeMap<u64, usize> = pieces
        .iter()
        .enumerate()
        .map(|(i, p)| (p.destination.offset(), i))
        .collect();

    let mut cuts: BTreeSet<u64> = BTreeSet::new();
    for p in pieces {
        cuts.extend([
            p.source.offset(),
            p.source.end(),
            p.destination.offset(),
            p.destination.end(),
        ]);
    }

    let mut work: Vec<u64> = cuts.iter().copied().collect();
    while let Some(point) = work.pop() {
        if let Some((_, &i)) = by_source.range(..point).next_back() {
            let p = &pieces[i];
            if point < p.source.end() {
                let mapped = p.destination.offset() + (point - p.source.offset());
                if cuts.insert(mapped) {
                    work.push(mapped);
                }
            }
        }
        if let Some((_, &i)) = by_dest.range(..point).next_back() {
            let p = &pieces[i];
            if point < p.destination.end() {
                let mapped = p.source.offset() + (point - p.destination.offset());
                if cuts.insert(mapped) {
                    work.push(mapped);
                }
            }
        }
    }

    let mut out = Vec::new();
    for p in pieces {
        let mut rel: BTreeSet<u64> = cuts
            .range(p.source.offset() + 1..p.source.end())
            .map(|c| c - p.source.offset())
            .collect();
        rel.extend(
            cuts.range(p.destination.offset() + 1..p.destination.end())
                .map(|c| c - p.destination.offset()),
        );
        rel.insert(p.source.length());

        let mut start = 0;
        for end in rel {
            if let Some(part) = sub_piece(p, start, end - start) {
                out.push(part);
            }
            start = end;
        }
    }
    out.sort_unstable_by_key(|p| p.logical);
    out
}

fn sub_piece(p: &Piece, skip: u64, len: u64) -> Option<Piece> {
    Some(Piece {
        logical: p.logical + skip,
        source: p.source.slice(skip, len)?,
        destination: p.destination.slice(skip, len)?,
    })
}

// ── Rotation ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Location {
    /// Data still at its source.
    Source,
    Parked(Extent),
    Delivered,
}

#[derive(Debug)]
struct Slot {
    piece: Piece,
    next: Option<usize>,
    prev: Option<usize>,
    at: Location,
}

pub(crate) struct CycleBreaker<'a> {
    block_size: u64,
    pool: &'a mut HoldingPool,
    out: &'a mut PlanBuilder,
    logger: &'a Logger,
    slots: Vec<Slot>,
    /// Source-resident slots by (logical, index).
    pending: BTreeSet<(u64, usize)>,
    ready: BinaryHeap<Reverse<(u64, usize)>>,
}

impl<'a> CycleBreaker<'a> {
    pub(crate) fn new(
        block_size: u64,
        pool: &'a mut HoldingPool,
        out: &'a mut PlanBuilder,
        logger: &'a Logger,
    ) -> Self {
        Self {
            block_size,
            pool,
            out,
            logger,
            slots: Vec::new(),
            pending: BTreeSet::new(),
            ready: BinaryHeap::new(),
        }
    }

    /// Emit moves realizing every piece of one cyclic component.
    pub(crate) fn resolve(mut self, members: &[Piece]) -> Result<()> {
        let refined = refine(members);
        self.link(refined);

        loop {
            while let Some(Reverse((_, i))) = self.ready.pop() {
                self.deliver(i);
            }
            let Some(&(_, stuck)) = self.pending.iter().next() else {
                break;
            };
            self.park(stuck)?;
        }
        self.pool.reset();
        Ok(())
    }

    fn link(&mut self, pieces: Vec<Piece>) {
        let by_source: BTreeMap<u64, usize> = pieces
            .iter()
            .enumerate()
            .map(|(i, p)| (p.source.offset(), i))
            .collect();
        self.slots = pieces
            .into_iter()
            .map(|piece| Slot {
                piece,
                next: None,
                prev: None,
                at: Location::Source,
            })
            .collect();
        for i in 0..self.slots.len() {
            let dest = self.slots[i].piece.destination;
            if let Some(&j) = by_source.get(&dest.offset()) {
                if self.slots[j].piece.source == dest {
                    self.slots[i].next = Some(j);
                    self.slots[j].prev = Some(i);
                }
            }
        }
        for (i, slot) in self.slots.iter().enumerate() {
            self.pending.insert((slot.piece.logical, i));
            if slot.next.is_none() {
                self.ready.push(Reverse((slot.piece.logical, i)));
            }
        }
    }

    fn deliver(&mut self, i: usize) {
        let piece = self.slots[i].piece;
        let at = self.slots[i].at;
        match at {
            Location::Source => {
                self.slots[i].at = Location::Delivered;
                self.pending.remove(&(piece.logical, i));
                self.out.direct(piece.source, piece.destination);
                self.vacated(i);
            }
            Location::Parked(holding) => {
                self.slots[i].at = Location::Delivered;
                self.out.unpark(holding, piece.destination);
                self.pool.release(holding);
            }
            Location::Delivered => {}
        }
    }

    /// Source of slot `i` is now free: its predecessor can land.
    fn vacated(&mut self, i: usize) {
        if let Some(p) = self.slots[i].prev {
            if self.slots[p].at != Location::Delivered {
                self.ready.push(Reverse((self.slots[p].piece.logical, p)));
            }
        }
    }

    fn park(&mut self, i: usize) -> Result<()> {
        let bs = self.block_size;
        let available = self.pool.largest();
        if available < bs {
            return Err(FfsError::InsufficientSpace {
                needed: bs,
                available,
                detail: format!(
                    "cannot break cycle at logical offset {}",
                    self.slots[i].piece.logical
                ),
            });
        }

        let len = self.slots[i].piece.source.length();
        if available < len {
            self.logger.debug(format!(
                "splitting cycle at logical {} into {available}-byte chunks",
                self.slots[i].piece.logical
            ));
            self.split_cycle(i, available);
        }

        let piece = self.slots[i].piece;
        let holding = self
            .pool
            .allocate(piece.source.length())
            .ok_or_else(|| FfsError::InsufficientSpace {
                needed: piece.source.length(),
                available,
                detail: "holding space fragmented".to_owned(),
            })?;
        self.out.park(piece.source, holding);
        self.out
            .record_holding(self.pool.in_use(), self.pool.in_use_scratch());
        self.logger.trace(format!(
            "parked {} in {holding} to break cycle",
            piece.source
        ));

        self.slots[i].at = Location::Parked(holding);
        self.pending.remove(&(piece.logical, i));
        self.vacated(i);
        Ok(())
    }

    /// Split every piece of the cycle through `start` at relative offset
    /// `at`, producing two independent cycles.
    fn split_cycle(&mut self, start: usize, at: u64) {
        let mut cycle = vec![start];
        let mut cursor = self.slots[start].next;
        while let Some(c) = cursor {
            if c == start {
                break;
            }
            cycle.push(c);
            cursor = self.slots[c].next;
        }

        let mut tails = Vec::with_capacity(cycle.len());
        for &c in &cycle {
            let whole = self.slots[c].piece;
            let len = whole.source.length();
            let (Some(head), Some(tail)) = (sub_piece(&whole, 0, at), sub_piece(&whole, at, len - at))
            else {
                continue;
            };
            self.pending.remove(&(whole.logical, c));
            self.slots[c].piece = head;
            self.pending.insert((head.logical, c));

            let t = self.slots.len();
            self.slots.push(Slot {
                piece: tail,
                next: None,
                prev: None,
                at: Location::Source,
            });
            self.pending.insert((tail.logical, t));
            tails.push((c, t));
        }

        let tail_of: BTreeMap<usize, usize> = tails.iter().copied().collect();
        for &(c, t) in &tails {
            let next_tail = self.slots[c].next.and_then(|n| tail_of.get(&n).copied());
            self.slots[t].next = next_tail;
            if let Some(nt) = next_tail {
                self.slots[nt].prev = Some(t);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ffs_extent::ExtentSet;

    fn piece(logical: u64, src: u64, dst: u64, len: u64) -> Piece {
        Piece {
            logical,
            source: Extent::device(src, len).unwrap(),
            destination: Extent::device(dst, len).unwrap(),
        }
    }

    #[test]
    fn refine_aligns_destinations_with_sources() {
        // A: [0,30) -> [30,60); B: [30,40) -> [0,10); C: [40,60) -> [10,30).
        let refined = refine(&[
            piece(0, 0, 30, 30),
            piece(30, 30, 0, 10),
            piece(40, 40, 10, 20),
        ]);
        let sources: Vec<u64> = refined.iter().map(|p| p.source.offset()).collect();
        for p in &refined {
            let hits: Vec<&Piece> = refined
                .iter()
                .filter(|q| q.source.overlaps(&p.destination))
                .collect();
            assert!(hits.len() <= 1, "destination {} hits {hits:?}", p.destination);
            if let Some(q) = hits.first() {
                assert_eq!(q.source, p.destination);
            }
        }
        assert!(sources.len() > 3);
        let total: u64 = refined.iter().map(|p| p.source.length()).sum();
        assert_eq!(total, 60);
    }

    #[test]
    fn two_cycle_parks_lowest_logical_member() {
        let mut pool = HoldingPool::new(
            &ExtentSet::empty(),
            Some(Extent::scratch(1000, 100).unwrap()),
            1,
        );
        let mut out = PlanBuilder::default();
        let logger = Logger::discard();
        CycleBreaker::new(1, &mut pool, &mut out, &logger)
            .resolve(&[piece(0, 0, 100, 100), piece(100, 100, 0, 100)])
            .unwrap();
        let plan = out.finish(crate::PlanFingerprint::from_bytes([0; 32]));
        let moves: Vec<String> = plan.moves().iter().map(ToString::to_string).collect();
        assert_eq!(
            moves,
            vec![
                "device[0..100) -> scratch[1000..1100)",
                "device[100..200) -> device[0..100)",
                "scratch[1000..1100) -> device[100..200)",
            ]
        );
        assert_eq!(plan.stats().cycles_broken, 1);
        assert_eq!(plan.stats().peak_scratch_bytes, 100);
    }

    #[test]
    fn small_holding_splits_cycle_into_chunks() {
        let mut pool = HoldingPool::new(
            &ExtentSet::empty(),
            Some(Extent::scratch(0, 40).unwrap()),
            10,
        );
        let mut out = PlanBuilder::default();
        let logger = Logger::discard();
        CycleBreaker::new(10, &mut pool, &mut out, &logger)
            .resolve(&[piece(0, 0, 100, 100), piece(100, 100, 0, 100)])
            .unwrap();
        let plan = out.finish(crate::PlanFingerprint::from_bytes([0; 32]));
        assert_eq!(plan.stats().cycles_broken, 3);
        assert!(plan.stats().peak_scratch_bytes <= 40);
        let parked: Vec<u64> = plan
            .moves()
            .iter()
            .filter(|m| m.destination().region() == ffs_types::Region::Scratch)
            .map(|m| m.source().offset())
            .collect();
        assert_eq!(parked, vec![0, 40, 80]);
    }

    #[test]
    fn no_holding_space_fails() {
        let mut pool = HoldingPool::new(&ExtentSet::empty(), None, 1);
        let mut out = PlanBuilder::default();
        let logger = Logger::discard();
        let err = CycleBreaker::new(1, &mut pool, &mut out, &logger)
            .resolve(&[piece(0, 0, 10, 10), piece(10, 10, 0, 10)])
            .unwrap_err();
        assert!(matches!(err, FfsError::InsufficientSpace { available: 0, .. }));
    }
}
