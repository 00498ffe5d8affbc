#![forbid(unsafe_code)]
//! Test harness for the remap engine.
//!
//! - [`MemIoPort`]: in-memory device and scratch with a volatile/durable
//!   split, so a simulated crash drops every write not yet flushed.
//! - Layout fixtures: [`cycle_pair`], [`random_layout`], and JSON
//!   conformance cases under `conformance/fixtures`.
//! - [`fill_source`] / [`verify_layout`]: stamp every logical block with a
//!   recognizable pattern and check it arrived at its target.
//! - [`self_test`]: random layouts with a crash injected at a random point.

use anyhow::{Context, Result, bail};
use ffs_block::IoPort;
use ffs_error::{FfsError, IoErrorKind};
use ffs_exec::{Remapper, RemapperConfig, RunOutcome};
use ffs_extent::{Extent, ExtentMap, ExtentSet};
use ffs_log::Logger;
use ffs_plan::{LayoutSpec, PlannerConfig, RemapInput, RemapPlanner};
use ffs_types::{Cx, Region};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

// ── MemIoPort ───────────────────────────────────────────────────────────────

/// Injected failure, keyed by the 0-based index of the operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// The write fails with EIO and nothing lands.
    FailWrite(u64),
    /// The flush fails with EIO; earlier writes stay volatile.
    FailFlush(u64),
    /// The write fails once with EINTR, which the retry layer absorbs.
    TransientWrite(u64),
}

#[derive(Debug, Default)]
struct Image {
    live: Vec<u8>,
    durable: Vec<u8>,
}

impl Image {
    fn zeroed(len: usize) -> Self {
        Self {
            live: vec![0; len],
            durable: vec![0; len],
        }
    }
}

fn injected(op: &'static str, kind: IoErrorKind, code: i32) -> FfsError {
    FfsError::Io {
        op,
        kind,
        code: Some(code),
        detail: "injected fault".to_owned(),
    }
}

#[derive(Debug, Default)]
pub struct MemIoPort {
    device: Mutex<Image>,
    scratch: Mutex<Image>,
    extents: Mutex<HashMap<PathBuf, ExtentMap>>,
    fault: Mutex<Option<Fault>>,
    cancel: Mutex<Option<(u64, Cx)>>,
    writes: AtomicU64,
    flushes: AtomicU64,
}

impl MemIoPort {
    #[must_use]
    pub fn new(device_len: usize, scratch_len: usize) -> Self {
        Self {
            device: Mutex::new(Image::zeroed(device_len)),
            scratch: Mutex::new(Image::zeroed(scratch_len)),
            ..Self::default()
        }
    }

    /// Sized to hold every extent `input` mentions.
    pub fn for_input(input: &RemapInput) -> Result<Self> {
        let device_end = input
            .source_map
            .as_slice()
            .iter()
            .chain(input.target_map.as_slice())
            .chain(input.free_extents.iter())
            .map(Extent::end)
            .max()
            .unwrap_or(0);
        let scratch_end = input.scratch.map_or(0, |s| s.end());
        Ok(Self::new(
            usize::try_from(device_end).context("device too large for memory")?,
            usize::try_from(scratch_end).context("scratch too large for memory")?,
        ))
    }

    pub fn inject(&self, fault: Fault) {
        *self.fault.lock() = Some(fault);
    }

    pub fn clear_faults(&self) {
        *self.fault.lock() = None;
        *self.cancel.lock() = None;
    }

    /// Cancel `cx` once `writes` writes have landed.
    pub fn cancel_after(&self, writes: u64, cx: &Cx) {
        *self.cancel.lock() = Some((writes, cx.clone()));
    }

    pub fn set_extents(&self, path: impl Into<PathBuf>, map: ExtentMap) {
        self.extents.lock().insert(path.into(), map);
    }

    /// Drop every write not yet flushed.
    pub fn crash(&self) {
        for image in [&self.device, &self.scratch] {
            let mut image = image.lock();
            let durable = image.durable.clone();
            image.live = durable;
        }
    }

    /// Place `data` at `extent`, durably, bypassing fault accounting.
    pub fn load(&self, extent: &Extent, data: &[u8]) -> ffs_error::Result<()> {
        let range = self.range(extent, data.len())?;
        let mut image = self.image(extent).lock();
        image.live[range.clone()].copy_from_slice(data);
        image.durable[range].copy_from_slice(data);
        Ok(())
    }

    /// Current (possibly volatile) contents of `extent`.
    pub fn snapshot(&self, extent: &Extent) -> ffs_error::Result<Vec<u8>> {
        let len = usize::try_from(extent.length())
            .map_err(|_| FfsError::InvalidExtent(format!("{extent} too large")))?;
        let range = self.range(extent, len)?;
        Ok(self.image(extent).lock().live[range].to_vec())
    }

    #[must_use]
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn flushes(&self) -> u64 {
        self.flushes.load(Ordering::SeqCst)
    }

    fn image(&self, extent: &Extent) -> &Mutex<Image> {
        match extent.region() {
            Region::Device => &self.device,
            Region::Scratch => &self.scratch,
        }
    }

    fn range(&self, extent: &Extent, len: usize) -> ffs_error::Result<std::ops::Range<usize>> {
        ffs_block::check_buffer(extent, len)?;
        let size = self.image(extent).lock().live.len();
        let start = usize::try_from(extent.offset()).unwrap_or(usize::MAX);
        match start.checked_add(len) {
            Some(end) if end <= size => Ok(start..end),
            _ => Err(FfsError::InvalidExtent(format!(
                "{extent} beyond {size}-byte image"
            ))),
        }
    }
}

impl IoPort for MemIoPort {
    fn extents_of(&self, path: &Path) -> ffs_error::Result<ExtentMap> {
        self.extents
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| FfsError::ExtentQuery {
                path: path.display().to_string(),
                detail: "no such file".to_owned(),
            })
    }

    fn read(&self, extent: &Extent, buf: &mut [u8]) -> ffs_error::Result<()> {
        let range = self.range(extent, buf.len())?;
        buf.copy_from_slice(&self.image(extent).lock().live[range]);
        Ok(())
    }

    fn write(&self, extent: &Extent, buf: &[u8]) -> ffs_error::Result<()> {
        let range = self.range(extent, buf.len())?;
        let n = self.writes.load(Ordering::SeqCst);
        {
            let mut fault = self.fault.lock();
            match *fault {
                Some(Fault::FailWrite(at)) if at == n => {
                    return Err(injected("write", IoErrorKind::Device, 5));
                }
                Some(Fault::TransientWrite(at)) if at == n => {
                    *fault = None;
                    return Err(injected("write", IoErrorKind::Interrupted, 4));
                }
                _ => {}
            }
        }
        self.image(extent).lock().live[range].copy_from_slice(buf);
        let landed = self.writes.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((after, cx)) = &*self.cancel.lock() {
            if landed >= *after {
                cx.cancel();
            }
        }
        Ok(())
    }

    fn flush(&self) -> ffs_error::Result<()> {
        let n = self.flushes.fetch_add(1, Ordering::SeqCst);
        if *self.fault.lock() == Some(Fault::FailFlush(n)) {
            return Err(injected("flush", IoErrorKind::Device, 5));
        }
        for image in [&self.device, &self.scratch] {
            let mut image = image.lock();
            let live = image.live.clone();
            image.durable = live;
        }
        Ok(())
    }
}

// ── Patterns ────────────────────────────────────────────────────────────────

/// Byte expected at `logical` offset. Each block starts with its index, so
/// blocks of at least 8 bytes are pairwise distinct.
#[must_use]
#[expect(clippy::cast_possible_truncation)]
pub fn pattern_byte(logical: u64, block_size: u64) -> u8 {
    let block = logical / block_size;
    let within = logical % block_size;
    if within < 8 {
        block.to_le_bytes()[within as usize]
    } else {
        (block as u8).wrapping_mul(0x9D) ^ (within as u8)
    }
}

fn pattern(logical: u64, len: u64, block_size: u64) -> Vec<u8> {
    (logical..logical + len)
        .map(|at| pattern_byte(at, block_size))
        .collect()
}

/// Stamp every logical byte of the source layout.
pub fn fill_source(port: &MemIoPort, input: &RemapInput, block_size: u64) -> ffs_error::Result<()> {
    for (logical, extent) in input.source_map.iter_logical() {
        port.load(&extent, &pattern(logical, extent.length(), block_size))?;
    }
    Ok(())
}

/// Check every logical byte sits at its target location.
pub fn verify_layout(
    port: &MemIoPort,
    input: &RemapInput,
    block_size: u64,
) -> ffs_error::Result<()> {
    for (logical, extent) in input.target_map.iter_logical() {
        let actual = port.snapshot(&extent)?;
        let expected = pattern(logical, extent.length(), block_size);
        if let Some(at) = actual.iter().zip(&expected).position(|(a, b)| a != b) {
            return Err(FfsError::VerifyMismatch {
                region: extent.region().as_str(),
                offset: extent.offset() + at as u64,
            });
        }
    }
    Ok(())
}

// ── Layout fixtures ─────────────────────────────────────────────────────────

fn blocks_to_extents(blocks: &[u64], block_size: u64) -> ffs_error::Result<Vec<Extent>> {
    blocks
        .iter()
        .map(|&b| Extent::device(b * block_size, block_size))
        .collect()
}

/// Two blocks trading places with one block of scratch.
pub fn cycle_pair(block_size: u64) -> ffs_error::Result<RemapInput> {
    Ok(RemapInput {
        source_map: ExtentMap::new(blocks_to_extents(&[0, 1], block_size)?)?,
        target_map: ExtentMap::new(blocks_to_extents(&[1, 0], block_size)?)?,
        free_extents: ExtentSet::empty(),
        scratch: Some(Extent::scratch(0, block_size)?),
    })
}

/// A random but always plannable layout of `blocks` live blocks on a
/// device twice that size. Half the seeds produce a pure permutation of
/// the source blocks, which is rich in cycles.
pub fn random_layout(seed: u64, blocks: u64, block_size: u64) -> ffs_error::Result<RemapInput> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut positions: Vec<u64> = (0..blocks * 2).collect();
    positions.shuffle(&mut rng);
    let (source, rest) = positions.split_at(usize::try_from(blocks).unwrap_or(usize::MAX));

    let mut pool: Vec<u64> = if rng.random_bool(0.5) {
        source.to_vec()
    } else {
        positions.clone()
    };
    pool.shuffle(&mut rng);
    pool.truncate(source.len());

    let scratch_blocks = rng.random_range(1..=2_u64);
    Ok(RemapInput {
        source_map: ExtentMap::new(blocks_to_extents(source, block_size)?)?,
        target_map: ExtentMap::new(blocks_to_extents(&pool, block_size)?)?,
        free_extents: ExtentSet::new(blocks_to_extents(rest, block_size)?)?,
        scratch: Some(Extent::scratch(0, scratch_blocks * block_size)?),
    })
}

// ── Conformance cases ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Expectation {
    /// `"done"` or the kind name of the expected planning error.
    pub outcome: String,
    #[serde(default)]
    pub moves: Option<usize>,
    #[serde(default)]
    pub scratch_moves: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConformanceCase {
    pub name: String,
    pub layout: LayoutSpec,
    pub expect: Expectation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CaseReport {
    pub name: String,
    pub outcome: String,
    pub moves: usize,
    pub scratch_moves: usize,
}

pub fn load_case(path: &Path) -> Result<ConformanceCase> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("invalid case {}", path.display()))
}

/// Plan and execute a case against a [`MemIoPort`], checking the result
/// against its expectation.
pub fn run_case(case: &ConformanceCase, work_dir: &Path) -> Result<CaseReport> {
    let cx = Cx::for_request();
    let input = case.layout.to_input()?;
    let bs = case.layout.block_size;
    let planner = RemapPlanner::new(&Logger::discard(), case.layout.config());

    let plan = match planner.plan(&cx, &input) {
        Ok(plan) => plan,
        Err(err) => {
            if case.expect.outcome != err.kind_name() {
                bail!("{}: expected {}, planning failed: {err}", case.name, case.expect.outcome);
            }
            return Ok(CaseReport {
                name: case.name.clone(),
                outcome: err.kind_name().to_owned(),
                moves: 0,
                scratch_moves: 0,
            });
        }
    };

    let report = CaseReport {
        name: case.name.clone(),
        outcome: "done".to_owned(),
        moves: plan.len(),
        scratch_moves: plan.moves().iter().filter(|m| m.touches_scratch()).count(),
    };
    if case.expect.outcome != report.outcome {
        bail!("{}: expected {}, planning succeeded", case.name, case.expect.outcome);
    }
    if case.expect.moves.is_some_and(|m| m != report.moves) {
        bail!("{}: expected {:?} moves, got {}", case.name, case.expect.moves, report.moves);
    }
    if case.expect.scratch_moves.is_some_and(|m| m != report.scratch_moves) {
        bail!(
            "{}: expected {:?} scratch moves, got {}",
            case.name,
            case.expect.scratch_moves,
            report.scratch_moves
        );
    }

    let port = MemIoPort::for_input(&input)?;
    fill_source(&port, &input, bs)?;
    let config = RemapperConfig {
        planner: case.layout.config(),
        ..RemapperConfig::new(work_dir.join(format!("{}.job", case.name)))
    };
    let outcome = Remapper::new(&port, &Logger::discard(), config).run(&cx, &input)?;
    if !outcome.is_done() {
        bail!("{}: run paused unexpectedly", case.name);
    }
    verify_layout(&port, &input, bs).with_context(|| format!("{}: layout check", case.name))?;
    Ok(report)
}

/// Every `*.json` case in `dir`, sorted by file name.
pub fn case_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("failed to list {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    files.sort();
    Ok(files)
}

// ── Self-test ───────────────────────────────────────────────────────────────

pub const SELF_TEST_BLOCK_SIZE: u64 = 512;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SelfTestReport {
    pub seed: u64,
    pub rounds: u32,
    pub moves: u64,
    pub bytes: u64,
    pub crashes_recovered: u32,
}

/// Random layouts, each interrupted by a crash at a random write or flush,
/// then resumed from the job record and checked byte for byte.
pub fn self_test(
    work_dir: &Path,
    seed: u64,
    rounds: u32,
    blocks: u64,
    logger: &Logger,
) -> Result<SelfTestReport> {
    let bs = SELF_TEST_BLOCK_SIZE;
    let mut rng = StdRng::seed_from_u64(seed);
    let mut report = SelfTestReport {
        seed,
        rounds,
        ..SelfTestReport::default()
    };

    for round in 0..rounds {
        let layout_seed = seed.wrapping_add(u64::from(round));
        let input = random_layout(layout_seed, blocks, bs)?;
        let config = RemapperConfig {
            planner: PlannerConfig { block_size: bs },
            ..RemapperConfig::new(work_dir.join(format!("self-test-{round}.job")))
        };
        let plan = RemapPlanner::new(logger, config.planner).plan(&Cx::for_request(), &input)?;
        let port = MemIoPort::for_input(&input)?;
        fill_source(&port, &input, bs)?;

        let at = rng.random_range(0..=plan.len() as u64);
        port.inject(if round % 2 == 0 {
            Fault::FailWrite(at)
        } else {
            Fault::FailFlush(at)
        });

        let remapper = Remapper::new(&port, logger, config);
        if remapper.run(&Cx::for_request(), &input).is_err() {
            port.crash();
            port.clear_faults();
            report.crashes_recovered += 1;
            let outcome = remapper
                .run(&Cx::for_request(), &input)
                .with_context(|| format!("round {round} (seed {layout_seed}): resume failed"))?;
            if !matches!(outcome, RunOutcome::Done(_)) {
                bail!("round {round} (seed {layout_seed}): resume did not finish");
            }
        }
        verify_layout(&port, &input, bs)
            .with_context(|| format!("round {round} (seed {layout_seed}): layout check"))?;

        report.moves += plan.len() as u64;
        report.bytes += plan.total_bytes();
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crash_drops_unflushed_writes() {
        let port = MemIoPort::new(16, 0);
        let a = Extent::device(0, 4).unwrap();
        let b = Extent::device(4, 4).unwrap();
        port.write(&a, &[1; 4]).unwrap();
        port.flush().unwrap();
        port.write(&b, &[2; 4]).unwrap();
        port.crash();
        assert_eq!(port.snapshot(&a).unwrap(), vec![1; 4]);
        assert_eq!(port.snapshot(&b).unwrap(), vec![0; 4]);
    }

    #[test]
    fn faults_fire_at_their_index() {
        let port = MemIoPort::new(8, 0);
        let e = Extent::device(0, 4).unwrap();
        port.inject(Fault::FailWrite(1));
        port.write(&e, &[1; 4]).unwrap();
        assert_eq!(port.write(&e, &[2; 4]).unwrap_err().platform_code(), Some(5));
        assert_eq!(port.writes(), 1);

        port.inject(Fault::TransientWrite(1));
        assert!(port.write(&e, &[3; 4]).unwrap_err().is_transient());
        port.write(&e, &[3; 4]).unwrap();
        assert_eq!(port.snapshot(&e).unwrap(), vec![3; 4]);
    }

    #[test]
    fn out_of_bounds_access_is_rejected() {
        let port = MemIoPort::new(8, 4);
        let mut buf = [0; 4];
        assert!(port.read(&Extent::device(6, 4).unwrap(), &mut buf).is_err());
        assert!(port.read(&Extent::scratch(4, 4).unwrap(), &mut buf).is_err());
        assert!(
            port.extents_of(Path::new("missing"))
                .unwrap_err()
                .to_string()
                .contains("missing")
        );
    }

    #[test]
    fn pattern_blocks_are_distinct() {
        let a = pattern(0, 16, 16);
        let b = pattern(16, 16, 16);
        assert_ne!(a, b);
        assert_eq!(&b[..8], &1_u64.to_le_bytes());
    }

    #[test]
    fn random_layouts_are_reproducible_and_plannable() {
        for seed in 0..16 {
            let input = random_layout(seed, 12, 512).unwrap();
            assert_eq!(input, random_layout(seed, 12, 512).unwrap());
            assert_eq!(input.source_map.total_length(), input.target_map.total_length());
            RemapPlanner::new(&Logger::discard(), PlannerConfig { block_size: 512 })
                .plan(&Cx::for_testing(), &input)
                .unwrap();
        }
    }

    #[test]
    fn verify_layout_reports_first_bad_byte() {
        let input = cycle_pair(16).unwrap();
        let port = MemIoPort::for_input(&input).unwrap();
        fill_source(&port, &input, 16).unwrap();
        let err = verify_layout(&port, &input, 16).unwrap_err();
        assert!(matches!(
            err,
            FfsError::VerifyMismatch {
                region: "device",
                offset: 16
            }
        ));
    }
}
