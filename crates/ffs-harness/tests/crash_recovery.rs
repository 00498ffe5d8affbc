#![forbid(unsafe_code)]

use ffs_block::{RetryPolicy, RetryingIoPort};
use ffs_exec::{Remapper, RemapperConfig, RunOutcome};
use ffs_extent::Extent;
use ffs_harness::{Fault, MemIoPort, cycle_pair, fill_source, random_layout, verify_layout};
use ffs_job::{JobStatus, peek_progress};
use ffs_log::Logger;
use ffs_plan::{PlannerConfig, RemapInput, RemapPlanner};
use ffs_types::Cx;
use std::path::Path;
use std::time::Duration;

const BS: u64 = 512;

fn config(dir: &Path, name: &str) -> RemapperConfig {
    RemapperConfig {
        planner: PlannerConfig { block_size: BS },
        ..RemapperConfig::new(dir.join(name))
    }
}

fn device_image(port: &MemIoPort, input: &RemapInput) -> Vec<u8> {
    let end = input
        .source_map
        .as_slice()
        .iter()
        .chain(input.target_map.as_slice())
        .chain(input.free_extents.iter())
        .map(Extent::end)
        .max()
        .expect("non-empty layout");
    port.snapshot(&Extent::device(0, end).expect("device extent"))
        .expect("device image")
}

fn move_count(input: &RemapInput) -> u64 {
    RemapPlanner::new(&Logger::discard(), PlannerConfig { block_size: BS })
        .plan(&Cx::for_testing(), input)
        .expect("plannable")
        .len() as u64
}

fn uninterrupted(input: &RemapInput, dir: &Path) -> Vec<u8> {
    let port = MemIoPort::for_input(input).expect("port");
    fill_source(&port, input, BS).expect("fill");
    let outcome = Remapper::new(&port, &Logger::discard(), config(dir, "reference.job"))
        .run(&Cx::for_testing(), input)
        .expect("reference run");
    assert!(outcome.is_done());
    device_image(&port, input)
}

/// Crash at every write in turn, resume, and compare with a clean run.
fn crash_everywhere(input: &RemapInput) {
    let dir = tempfile::tempdir().expect("work dir");
    let reference = uninterrupted(input, dir.path());
    let moves = move_count(input);

    for k in 0..moves {
        let port = MemIoPort::for_input(input).expect("port");
        fill_source(&port, input, BS).expect("fill");
        port.inject(Fault::FailWrite(k));
        let name = format!("crash-{k}.job");
        let remapper = Remapper::new(&port, &Logger::discard(), config(dir.path(), &name));

        remapper
            .run(&Cx::for_testing(), input)
            .expect_err("injected write failure");
        let progress = peek_progress(&dir.path().join(&name)).expect("job record");
        assert_eq!(progress.status, JobStatus::Failed);
        assert_eq!(progress.next_move_index, k, "crash at write {k}");

        port.crash();
        port.clear_faults();
        let outcome = remapper.run(&Cx::for_testing(), input).expect("resume");
        assert!(outcome.is_done(), "crash at write {k}");
        assert_eq!(outcome.summary().moves_applied, moves - k);
        verify_layout(&port, input, BS).expect("target layout");
        assert_eq!(device_image(&port, input), reference, "crash at write {k}");
    }
}

#[test]
fn cycle_pair_survives_a_crash_at_every_write() {
    crash_everywhere(&cycle_pair(BS).expect("cycle pair"));
}

#[test]
fn random_layouts_survive_a_crash_at_every_write() {
    for seed in [3, 11, 42] {
        crash_everywhere(&random_layout(seed, 16, BS).expect("layout"));
    }
}

#[test]
fn repeated_pauses_converge() {
    let input = random_layout(5, 24, BS).expect("layout");
    let dir = tempfile::tempdir().expect("work dir");
    let port = MemIoPort::for_input(&input).expect("port");
    fill_source(&port, &input, BS).expect("fill");
    let remapper = Remapper::new(&port, &Logger::discard(), config(dir.path(), "pause.job"));

    let mut runs = 0;
    loop {
        runs += 1;
        assert!(runs < 1_000, "pausing never converged");
        let cx = Cx::for_testing();
        port.cancel_after(port.writes() + 3, &cx);
        match remapper.run(&cx, &input).expect("run") {
            RunOutcome::Done(_) => break,
            RunOutcome::Paused(summary) => {
                assert!(summary.moves_applied >= 1);
                assert_eq!(
                    peek_progress(&dir.path().join("pause.job"))
                        .expect("record")
                        .status,
                    JobStatus::Paused
                );
            }
        }
    }
    assert!(runs > 1);
    verify_layout(&port, &input, BS).expect("target layout");
    assert!(dir.path().join("pause.job.done").exists());
}

#[test]
fn transient_faults_are_absorbed_by_retries() {
    let input = cycle_pair(BS).expect("cycle pair");
    let dir = tempfile::tempdir().expect("work dir");
    let port = MemIoPort::for_input(&input).expect("port");
    fill_source(&port, &input, BS).expect("fill");
    port.inject(Fault::TransientWrite(1));

    let policy = RetryPolicy {
        max_attempts: 3,
        initial_backoff: Duration::ZERO,
        max_backoff: Duration::ZERO,
    };
    let retrying = RetryingIoPort::new(&port, policy, &Logger::discard());
    let outcome = Remapper::new(&retrying, &Logger::discard(), config(dir.path(), "retry.job"))
        .run(&Cx::for_testing(), &input)
        .expect("retries hide the fault");
    assert!(outcome.is_done());
    verify_layout(&port, &input, BS).expect("target layout");
}
