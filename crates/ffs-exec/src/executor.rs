use crate::progress::{ProgressMeter, ProgressReport};
use ffs_block::IoPort;
use ffs_error::{FfsError, Result};
use ffs_extent::Extent;
use ffs_job::JobState;
use ffs_log::Logger;
use ffs_plan::Move;
use ffs_types::Cx;
use serde::Serialize;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecOptions {
    /// Working buffer; larger moves are copied in chunks of this size.
    pub buffer_size: usize,
    /// Re-read each destination and compare with its source.
    pub verify: bool,
    /// Minimum time between progress events.
    pub progress_interval: Duration,
}

impl ExecOptions {
    pub const DEFAULT_BUFFER_SIZE: usize = 1024 * 1024;
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            buffer_size: Self::DEFAULT_BUFFER_SIZE,
            verify: false,
            progress_interval: Duration::from_secs(5),
        }
    }
}

/// What a run accomplished.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Moves applied by this run alone.
    pub moves_applied: u64,
    pub bytes_moved: u64,
    pub next_move_index: u64,
    pub total_moves: u64,
    pub completed_bytes: u64,
    pub total_bytes: u64,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "summary", rename_all = "snake_case")]
pub enum RunOutcome {
    Done(RunSummary),
    /// Stopped cleanly at a move boundary; resume continues from here.
    Paused(RunSummary),
}

impl RunOutcome {
    #[must_use]
    pub const fn summary(&self) -> &RunSummary {
        match self {
            Self::Done(s) | Self::Paused(s) => s,
        }
    }

    #[must_use]
    pub const fn is_done(&self) -> bool {
        matches!(self, Self::Done(_))
    }
}

/// Drains a job's plan through an [`IoPort`].
#[derive(Debug)]
pub struct Executor<P> {
    port: P,
    logger: Logger,
    options: ExecOptions,
}

impl<P: IoPort> Executor<P> {
    #[must_use]
    pub fn new(port: P, logger: &Logger, options: ExecOptions) -> Self {
        Self {
            port,
            logger: logger.child("exec"),
            options,
        }
    }

    /// Apply every remaining move of `job`.
    ///
    /// Cancellation is honoured only between moves and leaves the job
    /// `Paused`. Any move failure leaves it `Failed` with every earlier
    /// move still committed, and the error is returned.
    pub fn execute(&self, cx: &Cx, job: &mut JobState) -> Result<RunOutcome> {
        job.begin()?;
        let started = Instant::now();
        let first_index = job.next_move_index();
        let mut meter = ProgressMeter::new(
            job.plan().total_bytes(),
            job.plan().len() as u64,
            job.completed_bytes(),
            first_index,
            self.options.progress_interval,
            started,
        );
        let chunk = self.options.buffer_size.max(1);
        let mut buf = vec![0_u8; chunk];
        let mut check = if self.options.verify {
            vec![0_u8; chunk]
        } else {
            Vec::new()
        };

        self.logger.info(format!(
            "executing {} of {} moves from index {first_index}",
            job.plan().len() as u64 - first_index,
            job.plan().len()
        ));

        while let Some(mv) = job.next_move().copied() {
            if cx.checkpoint().is_err() {
                job.pause()?;
                self.logger.notice(format!(
                    "paused before move {} of {}",
                    job.next_move_index(),
                    job.plan().len()
                ));
                return Ok(RunOutcome::Paused(summary(job, first_index, started)));
            }

            let index = job.next_move_index();
            self.logger.trace(format!("move {index}: {mv}"));
            if let Err(err) = self.apply(&mv, &mut buf, &mut check) {
                self.abandon(job, index, &mv, &err);
                return Err(err);
            }
            if let Err(err) = job.advance(index, mv.length()) {
                self.abandon(job, index, &mv, &err);
                return Err(err);
            }

            meter.record(mv.length());
            if let Some(report) = meter.report_due(Instant::now()) {
                self.report(&report);
            }
        }

        job.finish()?;
        self.report(&meter.snapshot(Instant::now()));
        let summary = summary(job, first_index, started);
        self.logger.info(format!(
            "remap complete: {} moves, {} bytes in {}ms",
            summary.moves_applied, summary.bytes_moved, summary.elapsed_ms
        ));
        Ok(RunOutcome::Done(summary))
    }

    fn report(&self, report: &ProgressReport) {
        self.logger.info(report.to_string());
    }

    fn abandon(&self, job: &mut JobState, index: u64, mv: &Move, err: &FfsError) {
        self.logger
            .error(format!("move {index} ({mv}) failed"), err.platform_code(), err);
        if let Err(ckpt) = job.fail() {
            self.logger.error(
                "could not record failed status",
                ckpt.platform_code(),
                &ckpt,
            );
        }
    }

    /// Copy one move, flush, and optionally verify. Never records progress.
    fn apply(&self, mv: &Move, buf: &mut [u8], check: &mut [u8]) -> Result<()> {
        for (src, dst) in chunks(mv, buf.len())? {
            let n = usize::try_from(src.length())
                .map_err(|_| FfsError::InvalidExtent(format!("chunk {src} too large")))?;
            self.port.read(&src, &mut buf[..n])?;
            self.port.write(&dst, &buf[..n])?;
        }
        self.port.flush()?;

        if self.options.verify {
            for (src, dst) in chunks(mv, buf.len())? {
                let n = usize::try_from(src.length())
                    .map_err(|_| FfsError::InvalidExtent(format!("chunk {src} too large")))?;
                self.port.read(&src, &mut buf[..n])?;
                self.port.read(&dst, &mut check[..n])?;
                if let Some(at) = buf[..n].iter().zip(&check[..n]).position(|(a, b)| a != b) {
                    return Err(FfsError::VerifyMismatch {
                        region: dst.region().as_str(),
                        offset: dst.offset() + at as u64,
                    });
                }
            }
        }
        Ok(())
    }
}

/// Source and destination pieces of at most `chunk` bytes each.
fn chunks(mv: &Move, chunk: usize) -> Result<Vec<(Extent, Extent)>> {
    let chunk = chunk as u64;
    let mut out = Vec::with_capacity(usize::try_from(mv.length().div_ceil(chunk)).unwrap_or(0));
    let mut skip = 0;
    while skip < mv.length() {
        let len = chunk.min(mv.length() - skip);
        let piece = |e: Extent| {
            e.slice(skip, len)
                .ok_or_else(|| FfsError::InvalidExtent(format!("cannot slice {e} at {skip}+{len}")))
        };
        out.push((piece(mv.source())?, piece(mv.destination())?));
        skip += len;
    }
    Ok(out)
}

fn summary(job: &JobState, first_index: u64, started: Instant) -> RunSummary {
    let moved: u64 = job
        .plan()
        .moves()
        .iter()
        .skip(usize::try_from(first_index).unwrap_or(usize::MAX))
        .take(usize::try_from(job.next_move_index() - first_index).unwrap_or(usize::MAX))
        .map(Move::length)
        .sum();
    RunSummary {
        moves_applied: job.next_move_index() - first_index,
        bytes_moved: moved,
        next_move_index: job.next_move_index(),
        total_moves: job.plan().len() as u64,
        completed_bytes: job.completed_bytes(),
        total_bytes: job.plan().total_bytes(),
        elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
    }
}
