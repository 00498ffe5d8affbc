#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use ffs_harness::{SELF_TEST_BLOCK_SIZE, case_files, load_case, random_layout, run_case, self_test};
use ffs_log::Logger;
use ffs_plan::{LayoutSpec, PlannerConfig};
use std::env;
use std::path::Path;
use tracing_subscriber::EnvFilter;

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    let cmd = args.first().map(String::as_str);

    match cmd {
        Some("self-test") => self_test_cmd(&args[1..]),
        Some("check-fixtures") => {
            let dir = args
                .get(1)
                .map_or_else(|| Path::new("conformance/fixtures").to_path_buf(), Into::into);
            check_fixtures(&dir)
        }
        Some("generate-layout") => generate_layout(&args[1..]),
        Some("--help" | "-h" | "help") | None => {
            print_usage();
            Ok(())
        }
        Some(other) => {
            print_usage();
            bail!("unknown command: {other}")
        }
    }
}

fn parse_flag(args: &[String], name: &str, default: u64) -> Result<u64> {
    match args.iter().position(|a| a == name) {
        Some(i) => args
            .get(i + 1)
            .with_context(|| format!("{name} requires a value"))?
            .parse()
            .with_context(|| format!("invalid {name}")),
        None => Ok(default),
    }
}

fn self_test_cmd(args: &[String]) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let seed = parse_flag(args, "--seed", 1)?;
    let rounds = u32::try_from(parse_flag(args, "--rounds", 32)?).context("--rounds too large")?;
    let blocks = parse_flag(args, "--blocks", 64)?;
    if blocks == 0 {
        bail!("--blocks must be positive");
    }

    let work_dir = tempfile::tempdir().context("failed to create work directory")?;
    let report = self_test(work_dir.path(), seed, rounds, blocks, &Logger::tracing("harness"))?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn check_fixtures(dir: &Path) -> Result<()> {
    let files = case_files(dir)?;
    if files.is_empty() {
        bail!("no cases in {}", dir.display());
    }
    let work_dir = tempfile::tempdir().context("failed to create work directory")?;
    for file in files {
        let case = load_case(&file)?;
        let report = run_case(&case, work_dir.path())?;
        println!(
            "{}: {} ({} moves, {} via scratch)",
            report.name, report.outcome, report.moves, report.scratch_moves
        );
    }
    Ok(())
}

fn generate_layout(args: &[String]) -> Result<()> {
    if args.len() < 2 {
        bail!("usage: ffs-harness generate-layout <seed> <blocks> [block-size]");
    }
    let seed: u64 = args[0].parse().context("invalid seed")?;
    let blocks: u64 = args[1].parse().context("invalid blocks")?;
    let block_size: u64 = match args.get(2) {
        Some(v) => v.parse().context("invalid block size")?,
        None => SELF_TEST_BLOCK_SIZE,
    };
    let input = random_layout(seed, blocks, block_size)?;
    let layout = LayoutSpec::from_input(&input, PlannerConfig { block_size });
    println!("{}", layout.to_json_pretty()?);
    Ok(())
}

fn print_usage() {
    println!("ffs-harness: conformance cases and crash self-test for ffs-remap");
    println!();
    println!("USAGE:");
    println!("  ffs-harness self-test [--seed N] [--rounds N] [--blocks N]");
    println!("  ffs-harness check-fixtures [dir]");
    println!("  ffs-harness generate-layout <seed> <blocks> [block-size]");
    println!();
    println!("SELF-TEST:");
    println!("  Remaps random in-memory layouts, crashing each run at a random write");
    println!("  or flush, then resumes from the job record and checks every byte.");
    println!();
    println!("EXAMPLES:");
    println!("  ffs-harness generate-layout 7 128 4096 > layout.json && ffs-remap plan layout.json");
}
