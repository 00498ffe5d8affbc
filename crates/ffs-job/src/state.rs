use crate::record::{
    JobHeader, JobStatus, MOVES_OFFSET, ProgressSlot, SLOT_OFFSETS, decode_moves, encode_moves,
};
use ffs_block::io_error;
use ffs_error::{FfsError, Result};
use ffs_plan::{Move, PlanFingerprint, RemapPlan};
use ffs_types::ParseError;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tempfile::NamedTempFile;

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

fn format_error(path: &Path, section: &str, err: &ParseError) -> FfsError {
    FfsError::Format(format!("{}: {section}: {err}", path.display()))
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    }
}

fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)
        .and_then(|d| d.sync_all())
        .map_err(|e| io_error("job directory sync", &e))
}

/// Path with `.suffix` appended to the file name.
#[must_use]
pub fn sibling_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

/// Read the newest progress slot without taking ownership of the job.
pub fn peek_progress(path: &Path) -> Result<ProgressSlot> {
    let data = std::fs::read(path).map_err(|e| io_error("job read", &e))?;
    JobHeader::parse(&data).map_err(|e| format_error(path, "header", &e))?;
    newest_slot(path, &data)
}

fn newest_slot(path: &Path, data: &[u8]) -> Result<ProgressSlot> {
    let slot = |i: usize| data.get(SLOT_OFFSETS[i]..SLOT_OFFSETS[i] + ProgressSlot::SIZE);
    ProgressSlot::newest(slot(0).unwrap_or_default(), slot(1).unwrap_or_default()).ok_or_else(
        || FfsError::Format(format!("{}: no valid progress slot", path.display())),
    )
}

/// Durable plan plus execution progress.
///
/// Exactly the prefix `[0, next_move_index)` of the plan has been applied
/// to the device. Every mutation is written to the alternate progress slot
/// and synced before the call returns.
#[derive(Debug)]
pub struct JobState {
    path: PathBuf,
    file: File,
    header: JobHeader,
    plan: RemapPlan,
    progress: ProgressSlot,
    validated: bool,
}

impl JobState {
    /// Persist a new job in `Planning` state.
    ///
    /// The record is assembled in a temporary file next to `path`, synced,
    /// then renamed into place and the directory synced. An existing record
    /// at `path` is never overwritten.
    pub fn create(path: &Path, plan: RemapPlan) -> Result<Self> {
        let moves = encode_moves(plan.moves());
        let header = JobHeader {
            fingerprint: plan.fingerprint(),
            move_count: plan.len() as u64,
            total_bytes: plan.total_bytes(),
            move_list_crc: crc32c::crc32c(&moves),
        };
        let progress = ProgressSlot {
            status: JobStatus::Planning,
            sequence: 1,
            next_move_index: 0,
            completed_bytes: 0,
            updated_at: unix_now(),
        };

        let mut image = vec![0_u8; MOVES_OFFSET];
        image[..JobHeader::SIZE].copy_from_slice(&header.to_bytes());
        let at = SLOT_OFFSETS[progress.slot_index()];
        image[at..at + ProgressSlot::SIZE].copy_from_slice(&progress.to_bytes());
        image.extend_from_slice(&moves);

        let dir = parent_dir(path);
        let temp = NamedTempFile::new_in(dir).map_err(|e| io_error("job create", &e))?;
        temp.as_file()
            .write_all(&image)
            .map_err(|e| io_error("job write", &e))?;
        temp.as_file()
            .sync_all()
            .map_err(|e| io_error("job sync", &e))?;
        let file = temp
            .persist_noclobber(path)
            .map_err(|err| io_error("job persist", &err.error))?;
        sync_dir(dir)?;

        Ok(Self {
            path: path.to_path_buf(),
            file,
            header,
            plan,
            progress,
            validated: true,
        })
    }

    /// Reconstruct a job from its record alone.
    ///
    /// A loaded job must pass [`validate`](Self::validate) before it can run.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read(path).map_err(|e| io_error("job read", &e))?;
        let header = JobHeader::parse(&data).map_err(|e| format_error(path, "header", &e))?;
        let progress = newest_slot(path, &data)?;
        let list = data.get(MOVES_OFFSET..).unwrap_or_default();
        let moves: Vec<Move> = decode_moves(list, header.move_count, header.move_list_crc)
            .map_err(|e| format_error(path, "move list", &e))?;

        let plan = RemapPlan::restore(header.fingerprint, moves);
        if plan.total_bytes() != header.total_bytes {
            return Err(FfsError::Format(format!(
                "{}: move list sums to {} bytes, header says {}",
                path.display(),
                plan.total_bytes(),
                header.total_bytes
            )));
        }
        if progress.next_move_index > header.move_count
            || progress.completed_bytes > header.total_bytes
        {
            return Err(FfsError::Format(format!(
                "{}: progress ({} moves, {} bytes) beyond the plan",
                path.display(),
                progress.next_move_index,
                progress.completed_bytes
            )));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| io_error("job open", &e))?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            header,
            plan,
            progress,
            validated: false,
        })
    }

    /// Check the persisted plan against a freshly computed fingerprint.
    pub fn validate(&mut self, recomputed: &PlanFingerprint) -> Result<()> {
        if self.header.fingerprint != *recomputed {
            self.validated = false;
            return Err(FfsError::PlanMismatch {
                persisted: self.header.fingerprint.to_string(),
                recomputed: recomputed.to_string(),
            });
        }
        self.validated = true;
        Ok(())
    }

    // ── Transitions ─────────────────────────────────────────────────────

    /// Enter `Running`. Resuming a loaded job requires a prior `validate`.
    pub fn begin(&mut self) -> Result<()> {
        match self.progress.status {
            JobStatus::Done => Err(self.refuse(JobStatus::Running)),
            _ if !self.validated => Err(FfsError::InvalidTransition {
                from: "unvalidated",
                to: JobStatus::Running.as_str(),
            }),
            JobStatus::Running => Ok(()),
            _ => self.commit(JobStatus::Running, self.progress.next_move_index, 0),
        }
    }

    /// Record move `index` (of `bytes` bytes) as durably applied.
    ///
    /// The destination write must already be flushed.
    pub fn advance(&mut self, index: u64, bytes: u64) -> Result<()> {
        if self.progress.status != JobStatus::Running {
            return Err(self.refuse(JobStatus::Running));
        }
        let expected = self.progress.next_move_index;
        if index != expected || index >= self.header.move_count {
            return Err(FfsError::OutOfOrder {
                expected,
                actual: index,
            });
        }
        self.commit(JobStatus::Running, index + 1, bytes)
    }

    pub fn pause(&mut self) -> Result<()> {
        match self.progress.status {
            JobStatus::Paused => Ok(()),
            JobStatus::Planning | JobStatus::Running => {
                self.commit(JobStatus::Paused, self.progress.next_move_index, 0)
            }
            _ => Err(self.refuse(JobStatus::Paused)),
        }
    }

    pub fn fail(&mut self) -> Result<()> {
        match self.progress.status {
            JobStatus::Done => Err(self.refuse(JobStatus::Failed)),
            _ => self.commit(JobStatus::Failed, self.progress.next_move_index, 0),
        }
    }

    /// Enter `Done`; every move must have been applied.
    pub fn finish(&mut self) -> Result<()> {
        match self.progress.status {
            JobStatus::Done => Ok(()),
            JobStatus::Running if self.progress.next_move_index == self.header.move_count => {
                self.commit(JobStatus::Done, self.header.move_count, 0)
            }
            _ => Err(self.refuse(JobStatus::Done)),
        }
    }

    /// Move a finished record aside as `<job>.done`.
    pub fn archive(self) -> Result<PathBuf> {
        if self.progress.status != JobStatus::Done {
            return Err(self.refuse(JobStatus::Done));
        }
        self.retire("done")
    }

    /// Move the record aside as `<job>.<suffix>`, replacing any earlier one.
    pub fn retire(self, suffix: &str) -> Result<PathBuf> {
        let target = sibling_path(&self.path, suffix);
        drop(self.file);
        std::fs::rename(&self.path, &target).map_err(|e| io_error("job archive", &e))?;
        sync_dir(parent_dir(&target))?;
        Ok(target)
    }

    fn refuse(&self, to: JobStatus) -> FfsError {
        FfsError::InvalidTransition {
            from: self.progress.status.as_str(),
            to: to.as_str(),
        }
    }

    fn commit(&mut self, status: JobStatus, next_move_index: u64, added_bytes: u64) -> Result<()> {
        let next = ProgressSlot {
            status,
            sequence: self.progress.sequence + 1,
            next_move_index,
            completed_bytes: self.progress.completed_bytes.saturating_add(added_bytes),
            updated_at: unix_now(),
        };
        self.file
            .write_all_at(&next.to_bytes(), SLOT_OFFSETS[next.slot_index()] as u64)
            .map_err(|e| io_error("job progress write", &e))?;
        self.file
            .sync_data()
            .map_err(|e| io_error("job progress sync", &e))?;
        self.progress = next;
        Ok(())
    }

    // ── Accessors ───────────────────────────────────────────────────────

    /// The next move to apply, `None` once the plan is exhausted.
    #[must_use]
    pub fn next_move(&self) -> Option<&Move> {
        usize::try_from(self.progress.next_move_index)
            .ok()
            .and_then(|i| self.plan.moves().get(i))
    }

    #[must_use]
    pub const fn plan(&self) -> &RemapPlan {
        &self.plan
    }

    #[must_use]
    pub const fn status(&self) -> JobStatus {
        self.progress.status
    }

    #[must_use]
    pub const fn next_move_index(&self) -> u64 {
        self.progress.next_move_index
    }

    #[must_use]
    pub const fn completed_bytes(&self) -> u64 {
        self.progress.completed_bytes
    }

    #[must_use]
    pub const fn sequence(&self) -> u64 {
        self.progress.sequence
    }

    #[must_use]
    pub const fn progress(&self) -> &ProgressSlot {
        &self.progress
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub const fn is_validated(&self) -> bool {
        self.validated
    }
}
