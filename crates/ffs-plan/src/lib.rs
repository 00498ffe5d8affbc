#![forbid(unsafe_code)]
//! Remap planning: from a current and a desired block layout to an ordered
//! list of in-place moves.
//!
//! ## Pipeline
//!
//! 1. **validate**: regions, block alignment, free/source disjointness,
//!    equal totals, every target byte inside source ∪ free.
//! 2. **pieces**: zip source and target maps by logical offset, drop
//!    identity pieces, split self-overlapping pieces into chunks no longer
//!    than their displacement.
//! 3. **graph**: `a -> b` when `a`'s destination overlaps `b`'s source.
//! 4. **schedule**: Tarjan components in dependency order, ties by lowest
//!    logical offset.
//! 5. **emit**: acyclic components move directly; cyclic ones are broken
//!    through holding space (spare free space first, then scratch).
//!
//! Identical inputs always produce identical plans.

mod cycle;
mod graph;
mod hold;
mod layout;
mod plan;

pub use graph::{Component, DependencyGraph, GraphReport, Piece};
pub use layout::{LayoutSpec, RangeSpec};
pub use plan::{Move, PlanFingerprint, PlanStats, RemapPlan};

use cycle::CycleBreaker;
use ffs_error::{FfsError, Result};
use ffs_extent::{Extent, ExtentMap, ExtentSet};
use ffs_log::{Logger, Severity};
use ffs_types::{Cx, Region};
use hold::HoldingPool;
use plan::PlanBuilder;

const FINGERPRINT_DOMAIN: &[u8] = b"ffs-remap-plan-v1";

fn cx_checkpoint(cx: &Cx) -> Result<()> {
    cx.checkpoint().map_err(|_| FfsError::Interrupted)
}

// ── Inputs ──────────────────────────────────────────────────────────────────

/// Everything the planner needs about the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemapInput {
    /// Where each logical byte lives now (device region).
    pub source_map: ExtentMap,
    /// Where each logical byte must end up (device region).
    pub target_map: ExtentMap,
    /// Device space holding no live data.
    pub free_extents: ExtentSet,
    /// Bounded secondary store; `None` means no scratch capacity.
    pub scratch: Option<Extent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannerConfig {
    /// Every input offset and length must be a multiple of this.
    pub block_size: u64,
}

impl PlannerConfig {
    pub const DEFAULT_BLOCK_SIZE: u64 = 4096;
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            block_size: Self::DEFAULT_BLOCK_SIZE,
        }
    }
}

// ── Planner ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RemapPlanner {
    logger: Logger,
    config: PlannerConfig,
}

impl RemapPlanner {
    #[must_use]
    pub fn new(logger: &Logger, config: PlannerConfig) -> Self {
        Self {
            logger: logger.child("plan"),
            config,
        }
    }

    #[must_use]
    pub const fn config(&self) -> PlannerConfig {
        self.config
    }

    /// Compute the move list. Nothing is persisted; on error the caller
    /// must change its inputs.
    pub fn plan(&self, cx: &Cx, input: &RemapInput) -> Result<RemapPlan> {
        self.plan_with_graph(cx, input).map(|(plan, _)| plan)
    }

    /// [`plan`](Self::plan), also returning the dependency graph and
    /// component schedule the plan was built from.
    pub fn plan_with_graph(
        &self,
        cx: &Cx,
        input: &RemapInput,
    ) -> Result<(RemapPlan, GraphReport)> {
        let bs = self.config.block_size;
        let report = self.graph(cx, input)?;
        let fingerprint = self.fingerprint(input);
        self.logger.info(format!(
            "planning {} bytes: {} source extents -> {} target extents",
            input.source_map.total_length(),
            input.source_map.len(),
            input.target_map.len()
        ));

        let GraphReport { graph, schedule } = &report;
        self.logger.debug(format!(
            "{} pieces, {} dependencies, {} components ({} cyclic)",
            graph.nodes().len(),
            graph.edge_count(),
            schedule.len(),
            schedule.iter().filter(|c| c.cyclic).count()
        ));

        let spare = input
            .free_extents
            .subtract(&input.target_map.to_set());
        let mut pool = HoldingPool::new(&spare, input.scratch, bs);
        let mut builder = PlanBuilder::default();

        for component in schedule {
            cx_checkpoint(cx)?;
            if component.cyclic {
                let members: Vec<Piece> = component
                    .members
                    .iter()
                    .map(|&m| graph.nodes()[m])
                    .collect();
                CycleBreaker::new(bs, &mut pool, &mut builder, &self.logger).resolve(&members)?;
            } else {
                for &m in &component.members {
                    let piece = graph.nodes()[m];
                    builder.direct(piece.source, piece.destination);
                }
            }
        }

        let plan = builder.finish(fingerprint);
        let stats = plan.stats();
        if stats.cycles_broken > 0 {
            self.logger.notice(format!(
                "broke {} cycles, peak holding {} bytes ({} on scratch)",
                stats.cycles_broken, stats.peak_holding_bytes, stats.peak_scratch_bytes
            ));
        }
        if self.logger.enabled(Severity::Dump) {
            for (i, mv) in plan.moves().iter().enumerate() {
                self.logger.dump(format!("move {i}: {mv}"));
            }
        }
        self.logger.info(format!(
            "plan {}: {} moves, {} bytes",
            plan.fingerprint(),
            plan.len(),
            plan.total_bytes()
        ));
        Ok((plan, report))
    }

    /// Dependency graph and component schedule, for diagnostics.
    pub fn graph(&self, cx: &Cx, input: &RemapInput) -> Result<GraphReport> {
        self.validate(input)?;
        cx_checkpoint(cx)?;
        let graph = DependencyGraph::build(self.pieces(input));
        let schedule = graph.schedule();
        Ok(GraphReport { graph, schedule })
    }

    /// Fingerprint binding a plan to its inputs.
    #[must_use]
    pub fn fingerprint(&self, input: &RemapInput) -> PlanFingerprint {
        fn section(hasher: &mut blake3::Hasher, tag: u8, extents: &[Extent]) {
            hasher.update(&[tag]);
            hasher.update(&(extents.len() as u64).to_le_bytes());
            for e in extents {
                hasher.update(&[e.region().code()]);
                hasher.update(&e.offset().to_le_bytes());
                hasher.update(&e.length().to_le_bytes());
            }
        }

        let mut hasher = blake3::Hasher::new();
        hasher.update(FINGERPRINT_DOMAIN);
        hasher.update(&self.config.block_size.to_le_bytes());
        section(&mut hasher, b'S', input.source_map.coalesce().as_slice());
        section(&mut hasher, b'T', input.target_map.coalesce().as_slice());
        section(&mut hasher, b'F', input.free_extents.normalize().as_slice());
        section(&mut hasher, b'X', input.scratch.as_slice());
        PlanFingerprint::from_bytes(*hasher.finalize().as_bytes())
    }

    fn validate(&self, input: &RemapInput) -> Result<()> {
        let bs = self.config.block_size;
        if bs == 0 {
            return Err(FfsError::InvalidExtent("block size must be non-zero".into()));
        }

        let groups: [(&str, &[Extent], Region); 4] = [
            ("source", input.source_map.as_slice(), Region::Device),
            ("target", input.target_map.as_slice(), Region::Device),
            ("free", input.free_extents.as_slice(), Region::Device),
            ("scratch", input.scratch.as_slice(), Region::Scratch),
        ];
        for (what, extents, region) in groups {
            for e in extents {
                if e.region() != region {
                    return Err(FfsError::InvalidExtent(format!(
                        "{what} extent {e} must be on the {region} region"
                    )));
                }
                if !e.is_aligned(bs) {
                    return Err(FfsError::InvalidExtent(format!(
                        "{what} extent {e} is not aligned to block size {bs}"
                    )));
                }
            }
        }

        let source = input.source_map.to_set();
        let clash = input.free_extents.intersect(&source);
        if !clash.is_empty() {
            return Err(FfsError::InvalidExtent(format!(
                "free space overlaps live data at {clash}"
            )));
        }

        let (have, want) = (
            input.source_map.total_length(),
            input.target_map.total_length(),
        );
        if have != want {
            return Err(FfsError::UnreachableTarget(format!(
                "source holds {have} bytes but target holds {want}"
            )));
        }

        let outside = input
            .target_map
            .to_set()
            .subtract(&source.union(&input.free_extents));
        if !outside.is_empty() {
            return Err(FfsError::UnreachableTarget(format!(
                "target bytes {outside} lie outside source and free space"
            )));
        }
        Ok(())
    }

    fn pieces(&self, input: &RemapInput) -> Vec<Piece> {
        let src = input.source_map.as_slice();
        let dst = input.target_map.as_slice();
        let (mut i, mut j) = (0, 0);
        let (mut src_skip, mut dst_skip) = (0, 0);
        let mut logical = 0;
        let mut out = Vec::new();

        while i < src.len() && j < dst.len() {
            let len = (src[i].length() - src_skip).min(dst[j].length() - dst_skip);
            let (Some(from), Some(to)) = (src[i].slice(src_skip, len), dst[j].slice(dst_skip, len))
            else {
                break;
            };
            if from != to {
                split_self_overlap(
                    Piece {
                        logical,
                        source: from,
                        destination: to,
                    },
                    &mut out,
                );
            }
            logical += len;
            src_skip += len;
            dst_skip += len;
            if src_skip == src[i].length() {
                i += 1;
                src_skip = 0;
            }
            if dst_skip == dst[j].length() {
                j += 1;
                dst_skip = 0;
            }
        }
        out
    }
}

/// Chunk a piece whose destination overlaps its own source so that no
/// chunk overwrites its own source. Chunks are at most the displacement
/// long; the dependency graph orders them.
fn split_self_overlap(piece: Piece, out: &mut Vec<Piece>) {
    if !piece.source.overlaps(&piece.destination) {
        out.push(piece);
        return;
    }
    let (from, to) = (piece.source.offset(), piece.destination.offset());
    let shift = from.abs_diff(to);
    let len = piece.source.length();
    let mut chunk = |skip: u64, n: u64| {
        if let (Some(source), Some(destination)) =
            (piece.source.slice(skip, n), piece.destination.slice(skip, n))
        {
            out.push(Piece {
                logical: piece.logical + skip,
                source,
                destination,
            });
        }
    };
    if to > from {
        let mut end = len;
        while end > 0 {
            let start = end.saturating_sub(shift);
            chunk(start, end - start);
            end = start;
        }
    } else {
        let mut start = 0;
        while start < len {
            let n = shift.min(len - start);
            chunk(start, n);
            start += n;
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use ffs_log::{EventSink, LogContext, MemorySink};
    use proptest::prelude::*;
    use std::sync::Arc;

    fn dev(offset: u64, length: u64) -> Extent {
        Extent::device(offset, length).unwrap()
    }

    fn input(
        source: &[(u64, u64)],
        target: &[(u64, u64)],
        free: &[(u64, u64)],
        scratch: Option<(u64, u64)>,
    ) -> RemapInput {
        let map = |r: &[(u64, u64)]| r.iter().map(|&(o, l)| dev(o, l)).collect::<Vec<_>>();
        RemapInput {
            source_map: ExtentMap::new(map(source)).unwrap(),
            target_map: ExtentMap::new(map(target)).unwrap(),
            free_extents: ExtentSet::new(map(free)).unwrap(),
            scratch: scratch.map(|(o, l)| Extent::scratch(o, l).unwrap()),
        }
    }

    fn planner(block_size: u64) -> RemapPlanner {
        RemapPlanner::new(&Logger::discard(), PlannerConfig { block_size })
    }

    fn rendered(plan: &RemapPlan) -> Vec<String> {
        plan.moves().iter().map(ToString::to_string).collect()
    }

    /// Apply a plan to an in-memory device and check every logical byte
    /// landed where the target map says.
    fn execute_and_check(input: &RemapInput, plan: &RemapPlan) {
        let dev_len = input
            .source_map
            .to_set()
            .union(&input.free_extents)
            .union(&input.target_map.to_set())
            .iter()
            .map(Extent::end)
            .max()
            .unwrap_or(0);
        let scratch_len = input.scratch.map_or(0, |s| s.end());
        let mut device: Vec<Option<u64>> = vec![None; usize::try_from(dev_len).unwrap()];
        let mut scratch: Vec<Option<u64>> = vec![None; usize::try_from(scratch_len).unwrap()];

        for (logical, ext) in input.source_map.iter_logical() {
            for k in 0..ext.length() {
                device[(ext.offset() + k) as usize] = Some(logical + k);
            }
        }

        for mv in plan.moves() {
            let (s, d) = (mv.source(), mv.destination());
            assert!(!s.overlaps(&d), "move {mv} overwrites its own source");
            if let Some(scr) = input.scratch {
                for e in [s, d] {
                    if e.region() == Region::Scratch {
                        assert!(scr.covers(&e), "move {mv} escapes scratch");
                    }
                }
            }
            let data: Vec<Option<u64>> = (0..s.length())
                .map(|k| {
                    let at = (s.offset() + k) as usize;
                    match s.region() {
                        Region::Device => device[at],
                        Region::Scratch => scratch[at],
                    }
                })
                .collect();
            for (k, v) in data.into_iter().enumerate() {
                let at = d.offset() as usize + k;
                match d.region() {
                    Region::Device => device[at] = v,
                    Region::Scratch => scratch[at] = v,
                }
            }
        }

        for (logical, ext) in input.target_map.iter_logical() {
            for k in 0..ext.length() {
                assert_eq!(
                    device[(ext.offset() + k) as usize],
                    Some(logical + k),
                    "logical byte {} misplaced",
                    logical + k
                );
            }
        }
    }

    #[test]
    fn two_extent_swap_uses_scratch() {
        let input = input(
            &[(0, 100), (100, 100)],
            &[(100, 100), (0, 100)],
            &[],
            Some((1000, 100)),
        );
        let plan = planner(1).plan(&Cx::for_testing(), &input).unwrap();
        assert_eq!(
            rendered(&plan),
            vec![
                "device[0..100) -> scratch[1000..1100)",
                "device[100..200) -> device[0..100)",
                "scratch[1000..1100) -> device[100..200)",
            ]
        );
        assert_eq!(plan.total_bytes(), 300);
        assert_eq!(plan.stats().direct_moves, 1);
        assert_eq!(plan.stats().parked_moves, 1);
        execute_and_check(&input, &plan);
    }

    #[test]
    fn identical_layouts_produce_empty_plan() {
        let input = input(&[(0, 8), (16, 8)], &[(0, 8), (16, 8)], &[(8, 8)], None);
        let plan = planner(8).plan(&Cx::for_testing(), &input).unwrap();
        assert!(plan.is_empty());
        assert_eq!(plan.total_bytes(), 0);
    }

    #[test]
    fn cycle_without_holding_space_fails() {
        let input = input(&[(0, 100), (100, 100)], &[(100, 100), (0, 100)], &[], None);
        let err = planner(1).plan(&Cx::for_testing(), &input).unwrap_err();
        assert!(matches!(err, FfsError::InsufficientSpace { .. }), "{err}");
        assert!(err.is_planning_error());
    }

    #[test]
    fn spare_free_space_is_preferred_over_scratch() {
        let input = input(
            &[(0, 100), (100, 100)],
            &[(100, 100), (0, 100)],
            &[(500, 100)],
            Some((0, 100)),
        );
        let plan = planner(1).plan(&Cx::for_testing(), &input).unwrap();
        assert_eq!(rendered(&plan)[0], "device[0..100) -> device[500..600)");
        assert_eq!(plan.stats().peak_scratch_bytes, 0);
        assert_eq!(plan.stats().peak_holding_bytes, 100);
        execute_and_check(&input, &plan);
    }

    #[test]
    fn free_space_used_by_target_is_not_holding_space() {
        // Target occupies the only free extent, so the cycle needs scratch.
        let input = input(
            &[(0, 10), (10, 10), (20, 10)],
            &[(10, 10), (0, 10), (30, 10)],
            &[(30, 10)],
            Some((0, 10)),
        );
        let plan = planner(10).plan(&Cx::for_testing(), &input).unwrap();
        assert_eq!(plan.stats().peak_scratch_bytes, 10);
        execute_and_check(&input, &plan);
    }

    #[test]
    fn small_scratch_splits_cycle() {
        let input = input(
            &[(0, 100), (100, 100)],
            &[(100, 100), (0, 100)],
            &[],
            Some((0, 30)),
        );
        let plan = planner(10).plan(&Cx::for_testing(), &input).unwrap();
        assert_eq!(plan.stats().cycles_broken, 4);
        assert!(plan.stats().peak_scratch_bytes <= 30);
        execute_and_check(&input, &plan);
    }

    #[test]
    fn overlapping_shift_is_chunked() {
        let forward = input(&[(0, 300)], &[(100, 300)], &[(300, 100)], None);
        let plan = planner(100).plan(&Cx::for_testing(), &forward).unwrap();
        assert_eq!(
            rendered(&plan),
            vec![
                "device[200..300) -> device[300..400)",
                "device[100..200) -> device[200..300)",
                "device[0..100) -> device[100..200)",
            ]
        );
        execute_and_check(&forward, &plan);

        let backward = input(&[(100, 300)], &[(0, 300)], &[(0, 100)], None);
        let plan = planner(100).plan(&Cx::for_testing(), &backward).unwrap();
        assert_eq!(rendered(&plan)[0], "device[100..200) -> device[0..100)");
        execute_and_check(&backward, &plan);
    }

    #[test]
    fn chain_moves_back_to_front_without_holding() {
        let input = input(&[(0, 4), (4, 4)], &[(4, 4), (8, 4)], &[(8, 4)], None);
        let plan = planner(4).plan(&Cx::for_testing(), &input).unwrap();
        assert_eq!(
            rendered(&plan),
            vec!["device[4..8) -> device[8..12)", "device[0..4) -> device[4..8)"]
        );
        assert_eq!(plan.stats().cycles_broken, 0);
    }

    #[test]
    fn validation_failures() {
        let p = planner(4);
        let cx = Cx::for_testing();

        let short = input(&[(0, 8)], &[(8, 4)], &[(8, 8)], None);
        assert!(matches!(p.plan(&cx, &short), Err(FfsError::UnreachableTarget(_))));

        let foreign = input(&[(0, 8)], &[(100, 8)], &[], None);
        assert!(matches!(p.plan(&cx, &foreign), Err(FfsError::UnreachableTarget(_))));

        let clash = input(&[(0, 8)], &[(8, 8)], &[(4, 8)], None);
        assert!(matches!(p.plan(&cx, &clash), Err(FfsError::InvalidExtent(_))));

        let unaligned = input(&[(0, 6)], &[(8, 6)], &[(8, 8)], None);
        assert!(matches!(p.plan(&cx, &unaligned), Err(FfsError::InvalidExtent(_))));

        let mut wrong_region = input(&[(0, 8)], &[(8, 8)], &[(8, 8)], None);
        wrong_region.scratch = Some(dev(64, 8));
        assert!(matches!(p.plan(&cx, &wrong_region), Err(FfsError::InvalidExtent(_))));

        assert!(matches!(
            planner(0).plan(&cx, &short),
            Err(FfsError::InvalidExtent(_))
        ));
    }

    #[test]
    fn planning_is_deterministic() {
        let input = input(
            &[(0, 40), (40, 40), (80, 40)],
            &[(80, 40), (0, 40), (40, 40)],
            &[(200, 16)],
            Some((0, 8)),
        );
        let a = planner(8).plan(&Cx::for_testing(), &input).unwrap();
        let b = planner(8).plan(&Cx::for_testing(), &input).unwrap();
        assert_eq!(a, b);
        execute_and_check(&input, &a);
    }

    #[test]
    fn fingerprint_binds_inputs_not_fragmentation() {
        let p = planner(4);
        let a = input(&[(0, 8)], &[(8, 8)], &[(8, 8)], None);
        let b = input(&[(0, 4), (4, 4)], &[(8, 8)], &[(8, 4), (12, 4)], None);
        assert_eq!(p.fingerprint(&a), p.fingerprint(&b));

        let c = input(&[(0, 8)], &[(8, 8)], &[(8, 8)], Some((0, 4)));
        assert_ne!(p.fingerprint(&a), p.fingerprint(&c));
        assert_ne!(p.fingerprint(&a), planner(8).fingerprint(&a));
    }

    #[test]
    fn cancelled_context_interrupts_planning() {
        let input = input(&[(0, 8)], &[(8, 8)], &[(8, 8)], None);
        let cx = Cx::for_testing();
        cx.cancel();
        assert!(matches!(
            planner(4).plan(&cx, &input),
            Err(FfsError::Interrupted)
        ));
    }

    #[test]
    fn planner_reports_through_logger() {
        let sink = Arc::new(MemorySink::new());
        let logger = Logger::new(
            LogContext::new("remap").with_min(Severity::Dump),
            Arc::clone(&sink) as Arc<dyn EventSink>,
        );
        let input = input(
            &[(0, 100), (100, 100)],
            &[(100, 100), (0, 100)],
            &[],
            Some((0, 100)),
        );
        RemapPlanner::new(&logger, PlannerConfig { block_size: 1 })
            .plan(&Cx::for_testing(), &input)
            .unwrap();
        let events = sink.events();
        assert!(events.iter().all(|e| e.subsystem == "plan"));
        assert_eq!(sink.messages_at(Severity::Dump).len(), 3);
        assert_eq!(sink.messages_at(Severity::Notice).len(), 1);
    }

    #[test]
    fn graph_report_lists_components() {
        let input = input(
            &[(0, 100), (100, 100), (200, 100)],
            &[(100, 100), (0, 100), (300, 100)],
            &[(300, 100)],
            None,
        );
        let report = planner(100).graph(&Cx::for_testing(), &input).unwrap();
        assert_eq!(report.graph.nodes().len(), 3);
        assert_eq!(report.schedule.len(), 2);
        let json = serde_json::to_value(&report).unwrap();
        assert!(json["schedule"][0]["cyclic"].is_boolean());
    }

    #[test]
    fn plan_with_graph_matches_separate_calls() {
        let input = input(
            &[(0, 100), (100, 100), (200, 100)],
            &[(100, 100), (0, 100), (300, 100)],
            &[(300, 100)],
            None,
        );
        let cx = Cx::for_testing();
        let planner = planner(100);
        let (plan, report) = planner.plan_with_graph(&cx, &input).unwrap();
        assert_eq!(plan, planner.plan(&cx, &input).unwrap());
        let separate = planner.graph(&cx, &input).unwrap();
        assert_eq!(report.graph.nodes().len(), separate.graph.nodes().len());
        assert_eq!(report.schedule.len(), separate.schedule.len());
        assert_eq!(report.schedule.iter().filter(|c| c.cyclic).count(), 1);
    }

    // ── Properties ──────────────────────────────────────────────────────

    const BS: u64 = 4;

    /// Segments laid out contiguously in two different orders, visited in
    /// a third (logical) order, plus optional free tail and scratch.
    fn arb_layout() -> impl Strategy<Value = (RemapInput, bool)> {
        (prop::collection::vec(1_u64..5, 1..9), 0_u64..4, 0_u64..4)
            .prop_flat_map(|(lens, extra, scratch)| {
                let ids: Vec<usize> = (0..lens.len()).collect();
                (
                    Just(lens),
                    Just(ids.clone()).prop_shuffle(),
                    Just(ids.clone()).prop_shuffle(),
                    Just(ids).prop_shuffle(),
                    Just(extra),
                    Just(scratch),
                )
            })
            .prop_map(|(lens, src_order, dst_order, logical, extra, scratch)| {
                let place = |order: &[usize]| {
                    let mut at = vec![0_u64; lens.len()];
                    let mut cursor = 0;
                    for &s in order {
                        at[s] = cursor;
                        cursor += lens[s] * BS;
                    }
                    (at, cursor)
                };
                let (src_at, total) = place(&src_order);
                let (dst_at, _) = place(&dst_order);
                let source: Vec<Extent> = logical.iter().map(|&s| dev(src_at[s], lens[s] * BS)).collect();
                let target: Vec<Extent> = logical.iter().map(|&s| dev(dst_at[s], lens[s] * BS)).collect();
                let free = if extra > 0 { vec![dev(total, extra * BS)] } else { vec![] };
                let input = RemapInput {
                    source_map: ExtentMap::new(source).unwrap(),
                    target_map: ExtentMap::new(target).unwrap(),
                    free_extents: ExtentSet::new(free).unwrap(),
                    scratch: (scratch > 0).then(|| Extent::scratch(0, scratch * BS).unwrap()),
                };
                (input, extra + scratch > 0)
            })
    }

    proptest! {
        #[test]
        fn plans_realize_the_target_layout((input, has_holding) in arb_layout()) {
            match planner(BS).plan(&Cx::for_testing(), &input) {
                Ok(plan) => {
                    let cap = input.scratch.map_or(0, |s| s.length());
                    prop_assert!(plan.stats().peak_scratch_bytes <= cap);
                    execute_and_check(&input, &plan);
                }
                Err(FfsError::InsufficientSpace { .. }) => prop_assert!(!has_holding),
                Err(other) => prop_assert!(false, "unexpected error {other}"),
            }
        }

        #[test]
        fn replanning_is_deterministic((input, _) in arb_layout()) {
            let a = planner(BS).plan(&Cx::for_testing(), &input);
            let b = planner(BS).plan(&Cx::for_testing(), &input);
            match (a, b) {
                (Ok(a), Ok(b)) => prop_assert_eq!(a, b),
                (Err(_), Err(_)) => {}
                _ => prop_assert!(false, "planning outcome changed between runs"),
            }
        }
    }
}
