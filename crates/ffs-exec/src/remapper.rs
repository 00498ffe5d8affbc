use crate::executor::{ExecOptions, Executor, RunOutcome, RunSummary};
use ffs_block::IoPort;
use ffs_error::{FfsError, Result};
use ffs_job::{JobState, JobStatus};
use ffs_log::Logger;
use ffs_plan::{PlannerConfig, RemapInput, RemapPlan, RemapPlanner};
use ffs_types::Cx;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemapperConfig {
    /// Where the job record lives while a remap is in flight.
    pub job_path: PathBuf,
    pub planner: PlannerConfig,
    pub exec: ExecOptions,
    /// On fingerprint mismatch, set the old record aside as `<job>.stale`
    /// and start over instead of failing with `PlanMismatch`.
    pub replan_on_mismatch: bool,
}

impl RemapperConfig {
    #[must_use]
    pub fn new(job_path: impl Into<PathBuf>) -> Self {
        Self {
            job_path: job_path.into(),
            planner: PlannerConfig::default(),
            exec: ExecOptions::default(),
            replan_on_mismatch: false,
        }
    }
}

/// Plan, persist, execute and archive in one call.
#[derive(Debug)]
pub struct Remapper<P> {
    port: P,
    logger: Logger,
    config: RemapperConfig,
}

impl<P: IoPort> Remapper<P> {
    #[must_use]
    pub fn new(port: P, logger: &Logger, config: RemapperConfig) -> Self {
        Self {
            port,
            logger: logger.clone(),
            config,
        }
    }

    #[must_use]
    pub const fn port(&self) -> &P {
        &self.port
    }

    #[must_use]
    pub const fn config(&self) -> &RemapperConfig {
        &self.config
    }

    /// Drive `input` to completion or to a clean pause.
    ///
    /// Planning errors persist nothing. A job record already at the
    /// configured path is resumed when its fingerprint matches the plan
    /// computed from `input`; otherwise it is marked failed and left in
    /// place for the layout it was planned from.
    pub fn run(&self, cx: &Cx, input: &RemapInput) -> Result<RunOutcome> {
        let planner = RemapPlanner::new(&self.logger, self.config.planner);
        let plan = planner.plan(cx, input)?;
        let path = &self.config.job_path;

        if plan.is_empty() && !path.exists() {
            self.logger
                .info("source already matches target, nothing to do");
            return Ok(RunOutcome::Done(RunSummary::default()));
        }

        let mut job = if path.exists() {
            self.resume(plan)?
        } else {
            JobState::create(path, plan)?
        };

        if job.status() == JobStatus::Done {
            // Finished earlier but the record was never archived.
            let summary = RunSummary {
                next_move_index: job.next_move_index(),
                total_moves: job.plan().len() as u64,
                completed_bytes: job.completed_bytes(),
                total_bytes: job.plan().total_bytes(),
                ..RunSummary::default()
            };
            self.archive(job)?;
            return Ok(RunOutcome::Done(summary));
        }

        let executor = Executor::new(&self.port, &self.logger, self.config.exec);
        let outcome = executor.execute(cx, &mut job)?;
        if outcome.is_done() {
            self.archive(job)?;
        }
        Ok(outcome)
    }

    fn resume(&self, plan: RemapPlan) -> Result<JobState> {
        let path = &self.config.job_path;
        let mut job = JobState::load(path)?;
        match job.validate(&plan.fingerprint()) {
            Ok(()) => {
                self.logger.notice(format!(
                    "resuming {} job {} at move {} of {}",
                    job.status(),
                    path.display(),
                    job.next_move_index(),
                    job.plan().len()
                ));
                Ok(job)
            }
            Err(err @ FfsError::PlanMismatch { .. }) if self.config.replan_on_mismatch => {
                self.logger.warn(format!("{err}; replanning"));
                let stale = job.retire("stale")?;
                self.logger
                    .notice(format!("stale job moved to {}", stale.display()));
                JobState::create(path, plan)
            }
            Err(err) => {
                self.logger
                    .error("persisted job does not match current layout", None, &err);
                // Terminal until the original layout returns or the caller replans.
                if !matches!(job.status(), JobStatus::Done | JobStatus::Failed) {
                    job.fail()?;
                }
                Err(err)
            }
        }
    }

    fn archive(&self, job: JobState) -> Result<()> {
        let archived = job.archive()?;
        self.logger
            .info(format!("job archived to {}", archived.display()));
        Ok(())
    }
}
