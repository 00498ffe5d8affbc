//! Throttled progress reporting.

use serde::Serialize;
use std::fmt;
use std::time::{Duration, Instant};

/// Point-in-time progress of a run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProgressReport {
    pub bytes_moved: u64,
    pub total_bytes: u64,
    pub moves_done: u64,
    pub moves_remaining: u64,
    pub percent: f64,
    /// Estimated time to completion at this run's average rate.
    pub eta_secs: Option<u64>,
}

fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    #[expect(clippy::cast_precision_loss)]
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

impl fmt::Display for ProgressReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "moved {} of {} ({:.1}%), {} moves remaining",
            human_bytes(self.bytes_moved),
            human_bytes(self.total_bytes),
            self.percent,
            self.moves_remaining
        )?;
        if let Some(eta) = self.eta_secs {
            write!(f, ", eta {eta}s")?;
        }
        Ok(())
    }
}

/// Accumulates progress and decides when a report is due.
#[derive(Debug)]
pub struct ProgressMeter {
    total_bytes: u64,
    total_moves: u64,
    bytes_done: u64,
    moves_done: u64,
    started: Instant,
    bytes_at_start: u64,
    interval: Duration,
    last_report: Option<Instant>,
}

impl ProgressMeter {
    /// Start metering a run resuming at `moves_done` / `bytes_done`.
    #[must_use]
    pub fn new(
        total_bytes: u64,
        total_moves: u64,
        bytes_done: u64,
        moves_done: u64,
        interval: Duration,
        now: Instant,
    ) -> Self {
        Self {
            total_bytes,
            total_moves,
            bytes_done,
            moves_done,
            started: now,
            bytes_at_start: bytes_done,
            interval,
            last_report: None,
        }
    }

    pub fn record(&mut self, bytes: u64) {
        self.bytes_done = self.bytes_done.saturating_add(bytes);
        self.moves_done += 1;
    }

    /// A report, if `interval` has elapsed since the last one. The first
    /// call always reports.
    pub fn report_due(&mut self, now: Instant) -> Option<ProgressReport> {
        let due = self
            .last_report
            .is_none_or(|last| now.saturating_duration_since(last) >= self.interval);
        if !due {
            return None;
        }
        self.last_report = Some(now);
        Some(self.snapshot(now))
    }

    #[must_use]
    pub fn snapshot(&self, now: Instant) -> ProgressReport {
        #[expect(clippy::cast_precision_loss)]
        let percent = if self.total_bytes == 0 {
            100.0
        } else {
            self.bytes_done as f64 * 100.0 / self.total_bytes as f64
        };

        let moved_this_run = self.bytes_done.saturating_sub(self.bytes_at_start);
        let elapsed = now.saturating_duration_since(self.started).as_secs_f64();
        let remaining = self.total_bytes.saturating_sub(self.bytes_done);
        let eta_secs = if remaining == 0 {
            Some(0)
        } else if moved_this_run == 0 || elapsed <= 0.0 {
            None
        } else {
            #[expect(
                clippy::cast_precision_loss,
                clippy::cast_possible_truncation,
                clippy::cast_sign_loss
            )]
            let secs = (remaining as f64 * elapsed / moved_this_run as f64).ceil() as u64;
            Some(secs)
        };

        ProgressReport {
            bytes_moved: self.bytes_done,
            total_bytes: self.total_bytes,
            moves_done: self.moves_done,
            moves_remaining: self.total_moves.saturating_sub(self.moves_done),
            percent,
            eta_secs,
        }
    }
}
