#![forbid(unsafe_code)]

use ffs_block::IoPort;
use ffs_error::Result as FfsResult;
use ffs_exec::{Remapper, RemapperConfig};
use ffs_extent::{Extent, ExtentMap};
use ffs_harness::{Fault, MemIoPort, fill_source, random_layout, verify_layout};
use ffs_job::{JobStatus, peek_progress};
use ffs_log::Logger;
use ffs_plan::PlannerConfig;
use ffs_types::Cx;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};

const BS: u64 = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Write,
    Flush,
}

#[derive(Debug, Clone, Copy)]
struct Observation {
    op: Op,
    /// Flushes completed before this operation started.
    flushed: u64,
    /// `next_move_index` persisted in the job record at that moment.
    persisted: u64,
}

/// Reads the job record before every write and flush it forwards.
#[derive(Debug)]
struct ObservingPort<'a> {
    inner: &'a MemIoPort,
    job: PathBuf,
    seen: Mutex<Vec<Observation>>,
}

impl ObservingPort<'_> {
    fn observe(&self, op: Op) {
        let persisted = peek_progress(&self.job).map_or(0, |p| p.next_move_index);
        self.seen.lock().push(Observation {
            op,
            flushed: self.inner.flushes(),
            persisted,
        });
    }
}

impl IoPort for ObservingPort<'_> {
    fn extents_of(&self, path: &Path) -> FfsResult<ExtentMap> {
        self.inner.extents_of(path)
    }

    fn read(&self, extent: &Extent, buf: &mut [u8]) -> FfsResult<()> {
        self.inner.read(extent, buf)
    }

    fn write(&self, extent: &Extent, buf: &[u8]) -> FfsResult<()> {
        self.observe(Op::Write);
        self.inner.write(extent, buf)
    }

    fn flush(&self) -> FfsResult<()> {
        self.observe(Op::Flush);
        self.inner.flush()
    }
}

fn config(dir: &Path) -> RemapperConfig {
    RemapperConfig {
        planner: PlannerConfig { block_size: BS },
        ..RemapperConfig::new(dir.join("job"))
    }
}

#[test]
fn progress_never_runs_ahead_of_flushed_data() {
    let input = random_layout(9, 20, BS).expect("layout");
    let dir = tempfile::tempdir().expect("work dir");
    let mem = MemIoPort::for_input(&input).expect("port");
    fill_source(&mem, &input, BS).expect("fill");
    let port = ObservingPort {
        inner: &mem,
        job: dir.path().join("job"),
        seen: Mutex::new(Vec::new()),
    };

    let outcome = Remapper::new(&port, &Logger::discard(), config(dir.path()))
        .run(&Cx::for_testing(), &input)
        .expect("run");
    assert!(outcome.is_done());
    verify_layout(&mem, &input, BS).expect("target layout");

    let seen = port.seen.lock();
    assert!(!seen.is_empty());
    for obs in seen.iter() {
        // One flush per move: before move i writes or flushes, exactly
        // moves [0, i) are both flushed and recorded.
        assert_eq!(obs.persisted, obs.flushed, "{obs:?}");
    }
    let flushes = seen.iter().filter(|o| o.op == Op::Flush).count() as u64;
    assert_eq!(flushes, outcome.summary().total_moves);
}

#[test]
fn failed_flush_is_never_recorded() {
    let input = random_layout(21, 12, BS).expect("layout");
    let dir = tempfile::tempdir().expect("work dir");
    let port = MemIoPort::for_input(&input).expect("port");
    fill_source(&port, &input, BS).expect("fill");
    port.inject(Fault::FailFlush(4));

    let remapper = Remapper::new(&port, &Logger::discard(), config(dir.path()));
    let err = remapper
        .run(&Cx::for_testing(), &input)
        .expect_err("injected flush failure");
    assert_eq!(err.kind_name(), "io_error");

    let progress = peek_progress(&dir.path().join("job")).expect("record");
    assert_eq!(progress.status, JobStatus::Failed);
    assert_eq!(progress.next_move_index, 4);

    // Power loss: move 4's write never reached stable storage.
    port.crash();
    port.clear_faults();
    let outcome = remapper.run(&Cx::for_testing(), &input).expect("resume");
    assert!(outcome.is_done());
    verify_layout(&port, &input, BS).expect("target layout");
}
