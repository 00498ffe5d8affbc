#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use ffs_block::{ExtentProbe, FallbackProbe, FileIoPort, RetryPolicy, RetryingIoPort};
use ffs_error::FfsError;
use ffs_exec::{ExecOptions, ProgressMeter, ProgressReport, Remapper, RemapperConfig, RunOutcome};
use ffs_extent::ExtentMap;
use ffs_job::{JobState, JobStatus, sibling_path};
use ffs_log::{
    EventSink, FanoutSink, JsonlSink, LevelRange, LogContext, Logger, Severity, TextFormat, TextSink,
    TracingSink,
};
use ffs_plan::{
    GraphReport, LayoutSpec, Move, PlanFingerprint, PlanStats, PlannerConfig, RemapInput,
    RemapPlanner,
};
use ffs_types::Cx;
use serde::Serialize;
use std::env::VarError;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, info_span, warn};
use tracing_subscriber::EnvFilter;

// ── Production Cx acquisition ───────────────────────────────────────────────

fn cli_cx() -> Cx {
    Cx::for_request()
}

// ── CLI definition ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Human,
    Json,
}

impl LogFormat {
    const ENV_KEY: &'static str = "FFS_LOG_FORMAT";

    fn parse(raw: &str) -> Result<Self> {
        <Self as ValueEnum>::from_str(raw.trim(), true).map_err(|_| {
            anyhow::anyhow!(
                "invalid {key}={raw:?}; expected one of: human, json",
                key = Self::ENV_KEY
            )
        })
    }

    fn from_env() -> Result<Option<Self>> {
        match std::env::var(Self::ENV_KEY) {
            Ok(value) => Ok(Some(Self::parse(&value)?)),
            Err(VarError::NotPresent) => Ok(None),
            Err(VarError::NotUnicode(_)) => {
                bail!("{key} contains non-UTF-8 bytes", key = Self::ENV_KEY)
            }
        }
    }

    const fn as_str(self) -> &'static str {
        match self {
            Self::Human => "human",
            Self::Json => "json",
        }
    }
}

/// Layout of the `--event-log` file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
enum EventLogFormat {
    /// One JSON object per line.
    #[default]
    Jsonl,
    Msg,
    LevelMsg,
    DatetimeLevelMsg,
    DatetimeLevelCallerMsg,
}

impl EventLogFormat {
    const fn text_format(self) -> Option<TextFormat> {
        match self {
            Self::Jsonl => None,
            Self::Msg => Some(TextFormat::Msg),
            Self::LevelMsg => Some(TextFormat::LevelMsg),
            Self::DatetimeLevelMsg => Some(TextFormat::DatetimeLevelMsg),
            Self::DatetimeLevelCallerMsg => Some(TextFormat::DatetimeLevelCallerMsg),
        }
    }
}

const VERIFY_ENV_KEY: &str = "FFS_REMAP_VERIFY";

fn default_env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    let value = value.trim();
    if value == "1"
        || value.eq_ignore_ascii_case("true")
        || value.eq_ignore_ascii_case("yes")
        || value.eq_ignore_ascii_case("on")
    {
        Ok(true)
    } else if value == "0"
        || value.eq_ignore_ascii_case("false")
        || value.eq_ignore_ascii_case("no")
        || value.eq_ignore_ascii_case("off")
    {
        Ok(false)
    } else {
        bail!("invalid {key}={value:?}; expected one of: 1,0,true,false,yes,no,on,off")
    }
}

fn env_bool(key: &str, default: bool) -> Result<bool> {
    match std::env::var(key) {
        Ok(value) => parse_bool(key, &value),
        Err(VarError::NotPresent) => Ok(default),
        Err(VarError::NotUnicode(_)) => bail!("{key} contains non-UTF-8 bytes"),
    }
}

fn init_logging(log_format_override: Option<LogFormat>) -> Result<LogFormat> {
    let format = log_format_override
        .or(LogFormat::from_env()?)
        .unwrap_or(LogFormat::Human);

    match format {
        LogFormat::Human => tracing_subscriber::fmt()
            .with_env_filter(default_env_filter())
            .with_target(true)
            .with_level(true)
            .with_writer(std::io::stderr)
            .compact()
            .try_init()
            .map_err(|err| anyhow::anyhow!("failed to initialize human logger: {err}"))?,
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(true)
            .with_env_filter(default_env_filter())
            .with_target(true)
            .with_level(true)
            .with_writer(std::io::stderr)
            .try_init()
            .map_err(|err| anyhow::anyhow!("failed to initialize JSON logger: {err}"))?,
    }

    Ok(format)
}

/// Engine logger: tracing, plus an event log file restricted to `levels`
/// when requested.
fn engine_logger(
    event_log: Option<&Path>,
    format: EventLogFormat,
    levels: LevelRange,
) -> Result<Logger> {
    let Some(path) = event_log else {
        return Ok(Logger::tracing("remap"));
    };
    let open_failed = || format!("failed to open event log {}", path.display());
    let ledger: Arc<dyn EventSink> = match format.text_format() {
        None => Arc::new(JsonlSink::open(path).with_context(open_failed)?),
        Some(text) => Arc::new(TextSink::open(path, text).with_context(open_failed)?),
    };
    let console: Arc<dyn EventSink> = Arc::new(TracingSink);
    let fanout = FanoutSink::new(vec![console]).with_route(levels, ledger);
    let min = levels.min().min(Severity::Info);
    Ok(Logger::new(
        LogContext::new("remap").with_min(min),
        Arc::new(fanout),
    ))
}

#[derive(Parser)]
#[command(
    name = "ffs-remap",
    about = "ffs-remap: crash-safe in-place block relocation"
)]
struct Cli {
    /// Log output format (`human` or `json`).
    ///
    /// Precedence: `--log-format` > `FFS_LOG_FORMAT` > `human`.
    #[arg(long, value_enum, global = true)]
    log_format: Option<LogFormat>,
    /// Also append engine events to this file.
    #[arg(long, global = true)]
    event_log: Option<PathBuf>,
    /// Layout of the event log file.
    #[arg(long, value_enum, global = true, default_value_t = EventLogFormat::Jsonl)]
    event_log_format: EventLogFormat,
    /// Severities written to the event log: `warn` (and above) or `debug..error`.
    #[arg(long, global = true, default_value_t = LevelRange::at_least(Severity::Info))]
    event_log_levels: LevelRange,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Compute the move plan for a layout file. Touches no device.
    Plan {
        /// Layout file (JSON).
        layout: PathBuf,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
        /// Include the dependency graph and component schedule.
        #[arg(long)]
        graph: bool,
    },
    /// Execute a layout against a device, resuming an existing job record.
    Run {
        /// Layout file (JSON).
        layout: PathBuf,
        /// Device or image file holding the data.
        #[arg(long)]
        device: PathBuf,
        /// File backing the layout's scratch region.
        #[arg(long)]
        scratch_file: Option<PathBuf>,
        /// Job record path. Rerunning with the same path resumes.
        #[arg(long)]
        job: PathBuf,
        /// Re-read each destination after writing (default: `FFS_REMAP_VERIFY`).
        #[arg(long)]
        verify: bool,
        /// Copy buffer size in bytes.
        #[arg(
            long,
            env = "FFS_REMAP_BUFFER_SIZE",
            default_value_t = ExecOptions::DEFAULT_BUFFER_SIZE
        )]
        buffer_size: usize,
        /// Discard a job record whose plan no longer matches and start over.
        #[arg(long)]
        replan: bool,
        /// Attempts per I/O operation, including the first.
        #[arg(long, default_value_t = RetryPolicy::default().max_attempts)]
        io_attempts: u32,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
    /// Show the persisted progress of a job record.
    Status {
        /// Job record path.
        job: PathBuf,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
    /// List the physical extents of a file.
    Extents {
        file: PathBuf,
        /// Block size reported extents must align to.
        #[arg(long, default_value_t = PlannerConfig::DEFAULT_BLOCK_SIZE)]
        block_size: u64,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
}

impl Command {
    const fn name(&self) -> &'static str {
        match self {
            Self::Plan { .. } => "plan",
            Self::Run { .. } => "run",
            Self::Status { .. } => "status",
            Self::Extents { .. } => "extents",
        }
    }
}

struct RunCommandOptions {
    layout: PathBuf,
    device: PathBuf,
    scratch_file: Option<PathBuf>,
    job: PathBuf,
    verify: bool,
    buffer_size: usize,
    replan: bool,
    io_attempts: u32,
    json: bool,
}

// ── Serializable outputs ────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct PlanOutput<'a> {
    fingerprint: PlanFingerprint,
    block_size: u64,
    total_bytes: u64,
    stats: PlanStats,
    moves: &'a [Move],
    #[serde(skip_serializing_if = "Option::is_none")]
    graph: Option<GraphReport>,
}

#[derive(Debug, Serialize)]
struct RunOutput<'a> {
    job: &'a Path,
    #[serde(flatten)]
    outcome: &'a RunOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    archived_to: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
struct StatusOutput {
    path: PathBuf,
    status: JobStatus,
    fingerprint: PlanFingerprint,
    sequence: u64,
    next_move_index: u64,
    total_moves: u64,
    updated_at: u64,
    progress: ProgressReport,
}

#[derive(Debug, Serialize)]
struct ExtentsOutput<'a> {
    path: &'a Path,
    probe: &'static str,
    total_bytes: u64,
    extents: ExtentMap,
}

// ── Entry point ─────────────────────────────────────────────────────────────

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let log_format = init_logging(cli.log_format)?;
    let command_name = cli.command.name();
    let run_span = info_span!(
        target: "ffs::cli",
        "command",
        command = command_name,
        log_format = log_format.as_str()
    );
    let _run_guard = run_span.enter();
    let started = Instant::now();

    info!(
        target: "ffs::cli",
        command = command_name,
        log_format = log_format.as_str(),
        "command_start"
    );

    let result = engine_logger(
        cli.event_log.as_deref(),
        cli.event_log_format,
        cli.event_log_levels,
    )
    .and_then(|logger| {
        let result = dispatch(&logger, cli.command);
        if result.is_err() {
            logger.flush_all(Severity::Error);
        }
        result
    });

    let duration_us = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX);
    if let Err(err) = &result {
        let error_kind = err
            .downcast_ref::<FfsError>()
            .map_or("other", FfsError::kind_name);
        error!(
            target: "ffs::cli",
            command = command_name,
            duration_us,
            error_kind,
            error = %err,
            "command_failed"
        );
    } else {
        info!(
            target: "ffs::cli",
            command = command_name,
            duration_us,
            "command_succeeded"
        );
    }

    result
}

fn dispatch(logger: &Logger, command: Command) -> Result<()> {
    match command {
        Command::Plan {
            layout,
            json,
            graph,
        } => plan_cmd(logger, &layout, json, graph),
        Command::Run {
            layout,
            device,
            scratch_file,
            job,
            verify,
            buffer_size,
            replan,
            io_attempts,
            json,
        } => run_cmd(
            logger,
            &RunCommandOptions {
                layout,
                device,
                scratch_file,
                job,
                verify,
                buffer_size,
                replan,
                io_attempts,
                json,
            },
        ),
        Command::Status { job, json } => status_cmd(&job, json),
        Command::Extents {
            file,
            block_size,
            json,
        } => extents_cmd(logger, &file, block_size, json),
    }
}

fn load_layout(path: &Path) -> Result<(LayoutSpec, RemapInput)> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read layout {}", path.display()))?;
    let layout = LayoutSpec::from_json(&text)
        .with_context(|| format!("failed to parse layout {}", path.display()))?;
    let input = layout
        .to_input()
        .with_context(|| format!("invalid extents in layout {}", path.display()))?;
    Ok((layout, input))
}

// ── plan ────────────────────────────────────────────────────────────────────

fn plan_cmd(logger: &Logger, layout_path: &Path, json: bool, graph: bool) -> Result<()> {
    let command_span = info_span!(
        target: "ffs::cli::plan",
        "plan",
        layout = %layout_path.display(),
        output_json = json
    );
    let _command_guard = command_span.enter();
    let started = Instant::now();
    info!(target: "ffs::cli::plan", "plan_start");

    let cx = cli_cx();
    let (layout, input) = load_layout(layout_path)?;
    let planner = RemapPlanner::new(logger, layout.config());
    let (plan, report) = planner.plan_with_graph(&cx, &input)?;
    let graph = graph.then_some(report);

    info!(
        target: "ffs::cli::plan",
        moves = plan.len(),
        total_bytes = plan.total_bytes(),
        cycles_broken = plan.stats().cycles_broken,
        duration_us = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX),
        "plan_complete"
    );

    let output = PlanOutput {
        fingerprint: plan.fingerprint(),
        block_size: layout.block_size,
        total_bytes: plan.total_bytes(),
        stats: *plan.stats(),
        moves: plan.moves(),
        graph,
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&output).context("serialize plan")?
        );
        return Ok(());
    }

    println!("fingerprint: {}", output.fingerprint);
    println!(
        "moves: {} ({} direct, {} parked, {} cycles broken)",
        output.moves.len(),
        output.stats.direct_moves,
        output.stats.parked_moves,
        output.stats.cycles_broken
    );
    println!("bytes: {}", output.total_bytes);
    println!(
        "peak holding: {} bytes ({} on scratch)",
        output.stats.peak_holding_bytes, output.stats.peak_scratch_bytes
    );
    for (index, mv) in output.moves.iter().enumerate() {
        println!("  {index:>6}  {mv}");
    }
    if let Some(report) = &output.graph {
        let cyclic = report.schedule.iter().filter(|c| c.cyclic).count();
        println!(
            "graph: {} nodes, {} edges, {} components ({cyclic} cyclic)",
            report.graph.nodes().len(),
            report.graph.edge_count(),
            report.schedule.len()
        );
    }
    Ok(())
}

// ── run ─────────────────────────────────────────────────────────────────────

fn run_cmd(logger: &Logger, opts: &RunCommandOptions) -> Result<()> {
    let command_span = info_span!(
        target: "ffs::cli::run",
        "run",
        layout = %opts.layout.display(),
        device = %opts.device.display(),
        job = %opts.job.display(),
        output_json = opts.json
    );
    let _command_guard = command_span.enter();
    info!(target: "ffs::cli::run", "run_start");

    let cx = cli_cx();
    let handler_cx = cx.clone();
    ctrlc::set_handler(move || handler_cx.cancel())
        .context("failed to install Ctrl-C handler")?;

    let outcome = execute_remap(logger, opts, &cx)?;
    let archived_to = outcome
        .is_done()
        .then(|| sibling_path(&opts.job, "done"))
        .filter(|p| p.exists());

    let output = RunOutput {
        job: &opts.job,
        outcome: &outcome,
        archived_to,
    };
    if opts.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&output).context("serialize run outcome")?
        );
        return Ok(());
    }

    let summary = outcome.summary();
    match &outcome {
        RunOutcome::Done(_) if summary.total_moves == 0 => {
            println!("nothing to do: source already matches target");
        }
        RunOutcome::Done(_) => {
            println!(
                "done: {} moves applied this run, {} bytes in {}ms",
                summary.moves_applied, summary.bytes_moved, summary.elapsed_ms
            );
            if let Some(path) = &output.archived_to {
                println!("job record archived to {}", path.display());
            }
        }
        RunOutcome::Paused(_) => {
            println!(
                "paused before move {} of {}; rerun the same command to resume",
                summary.next_move_index, summary.total_moves
            );
        }
    }
    Ok(())
}

/// Open the device, wire up retries, and drive the remap under `cx`.
fn execute_remap(logger: &Logger, opts: &RunCommandOptions, cx: &Cx) -> Result<RunOutcome> {
    let started = Instant::now();
    if opts.buffer_size == 0 {
        bail!("--buffer-size must be positive");
    }
    let verify = opts.verify || env_bool(VERIFY_ENV_KEY, false)?;
    let (layout, input) = load_layout(&opts.layout)?;

    let probe = FallbackProbe::system(layout.block_size, logger);
    let mut port = FileIoPort::open(&opts.device, Box::new(probe))
        .with_context(|| format!("failed to open device {}", opts.device.display()))?;
    match (input.scratch, &opts.scratch_file) {
        (Some(extent), Some(path)) => {
            port = port
                .with_scratch(path, extent)
                .with_context(|| format!("failed to prepare scratch file {}", path.display()))?;
        }
        (Some(extent), None) => {
            bail!("layout declares scratch space {extent} but no --scratch-file was given");
        }
        (None, Some(path)) => {
            warn!(
                target: "ffs::cli::run",
                scratch_file = %path.display(),
                "scratch_file_unused"
            );
        }
        (None, None) => {}
    }

    let policy = RetryPolicy {
        max_attempts: opts.io_attempts,
        ..RetryPolicy::default()
    };
    let port = RetryingIoPort::new(port, policy, logger);
    let config = RemapperConfig {
        job_path: opts.job.clone(),
        planner: layout.config(),
        exec: ExecOptions {
            buffer_size: opts.buffer_size,
            verify,
            ..ExecOptions::default()
        },
        replan_on_mismatch: opts.replan,
    };

    let outcome = Remapper::new(port, logger, config).run(cx, &input)?;
    let summary = outcome.summary();
    let state = if outcome.is_done() { "done" } else { "paused" };
    info!(
        target: "ffs::cli::run",
        outcome = state,
        moves_applied = summary.moves_applied,
        bytes_moved = summary.bytes_moved,
        next_move_index = summary.next_move_index,
        total_moves = summary.total_moves,
        verify,
        duration_us = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX),
        "run_complete"
    );
    Ok(outcome)
}

// ── status ──────────────────────────────────────────────────────────────────

/// `path` itself, or its archived `.done` sibling once the job finished.
fn resolve_job_path(path: &Path) -> Result<PathBuf> {
    if path.exists() {
        return Ok(path.to_path_buf());
    }
    let archived = sibling_path(path, "done");
    if archived.exists() {
        return Ok(archived);
    }
    bail!("no job record at {}", path.display())
}

fn job_status(path: &Path) -> Result<StatusOutput> {
    let path = resolve_job_path(path)?;
    let job = JobState::load(&path)
        .with_context(|| format!("failed to read job record {}", path.display()))?;
    let total_moves = job.plan().len() as u64;
    let now = Instant::now();
    let progress = ProgressMeter::new(
        job.plan().total_bytes(),
        total_moves,
        job.completed_bytes(),
        job.next_move_index(),
        std::time::Duration::ZERO,
        now,
    )
    .snapshot(now);
    Ok(StatusOutput {
        status: job.status(),
        fingerprint: job.plan().fingerprint(),
        sequence: job.sequence(),
        next_move_index: job.next_move_index(),
        total_moves,
        updated_at: job.progress().updated_at,
        progress,
        path,
    })
}

fn status_cmd(job: &Path, json: bool) -> Result<()> {
    let command_span = info_span!(
        target: "ffs::cli::status",
        "status",
        job = %job.display(),
        output_json = json
    );
    let _command_guard = command_span.enter();

    let output = job_status(job)?;
    info!(
        target: "ffs::cli::status",
        status = output.status.as_str(),
        next_move_index = output.next_move_index,
        total_moves = output.total_moves,
        "status_loaded"
    );

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&output).context("serialize status")?
        );
        return Ok(());
    }
    println!("job: {}", output.path.display());
    println!("status: {}", output.status);
    println!("fingerprint: {}", output.fingerprint);
    println!(
        "next move: {} of {}",
        output.next_move_index, output.total_moves
    );
    println!("progress: {}", output.progress);
    println!("checkpoint: #{} at unix {}", output.sequence, output.updated_at);
    Ok(())
}

// ── extents ─────────────────────────────────────────────────────────────────

fn extents_cmd(logger: &Logger, file: &Path, block_size: u64, json: bool) -> Result<()> {
    let command_span = info_span!(
        target: "ffs::cli::extents",
        "extents",
        file = %file.display(),
        block_size,
        output_json = json
    );
    let _command_guard = command_span.enter();
    let started = Instant::now();

    if block_size == 0 {
        bail!("--block-size must be positive");
    }
    let probe = FallbackProbe::system(block_size, logger);
    let extents = probe
        .query(file)
        .with_context(|| format!("failed to query extents of {}", file.display()))?;

    info!(
        target: "ffs::cli::extents",
        probe = probe.name(),
        extents = extents.len(),
        total_bytes = extents.total_length(),
        duration_us = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX),
        "extents_complete"
    );

    let output = ExtentsOutput {
        path: file,
        probe: probe.name(),
        total_bytes: extents.total_length(),
        extents,
    };
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&output).context("serialize extents")?
        );
        return Ok(());
    }
    println!(
        "{}: {} extents, {} bytes",
        output.path.display(),
        output.extents.len(),
        output.total_bytes
    );
    for (logical, extent) in output.extents.iter_logical() {
        println!("  {logical:>12}  {extent}");
    }
    Ok(())
}

// ── Tests ───────────────────────────────────────────────────────────────────
