#![forbid(unsafe_code)]
//! Leveled event logging for the remapper engine.
//!
//! The planner and executor never touch a global logger. They receive a
//! [`Logger`]: an immutable [`LogContext`] (subsystem name, minimum
//! severity, enabled-level mask) paired with a shared [`EventSink`].
//! Narrowing a context for a sub-component produces a new `Logger`; the
//! parent is never mutated.
//!
//! Shipped sinks:
//!
//! - [`TracingSink`]: forwards into `tracing` under the `ffs::remap` target.
//! - [`JsonlSink`]: append-only JSON-lines event ledger.
//! - [`TextSink`]: one formatted line per event, see [`TextFormat`].
//! - [`FanoutSink`]: routes events to several sinks, each behind its own
//!   [`LevelRange`].
//! - [`MemorySink`]: captures events for assertions.

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

// ── Severity ────────────────────────────────────────────────────────────────

/// Event severity, ordered from most verbose to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Raw data dumps (extent tables, move lists).
    Dump,
    Trace,
    Debug,
    Info,
    /// Noteworthy but expected conditions (resumes, fallbacks).
    Notice,
    Warn,
    Error,
    /// Unrecoverable; sinks flush immediately.
    Fatal,
}

impl Severity {
    pub const ALL: [Self; 8] = [
        Self::Dump,
        Self::Trace,
        Self::Debug,
        Self::Info,
        Self::Notice,
        Self::Warn,
        Self::Error,
        Self::Fatal,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Dump => "dump",
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Notice => "notice",
            Self::Warn => "warn",
            Self::Error => "error",
            Self::Fatal => "fatal",
        }
    }

    /// Upper-case name used in text output.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Dump => "DUMP",
            Self::Trace => "TRACE",
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Notice => "NOTICE",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
            Self::Fatal => "FATAL",
        }
    }

    const fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|sev| sev.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown severity {s:?}"))
    }
}

/// Per-severity enable bits, applied on top of the minimum severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LevelMask(u8);

impl LevelMask {
    pub const ALL: Self = Self(u8::MAX);
    pub const NONE: Self = Self(0);

    #[must_use]
    pub const fn with(self, severity: Severity) -> Self {
        Self(self.0 | severity.bit())
    }

    #[must_use]
    pub const fn without(self, severity: Severity) -> Self {
        Self(self.0 & !severity.bit())
    }

    #[must_use]
    pub const fn contains(self, severity: Severity) -> bool {
        self.0 & severity.bit() != 0
    }
}

impl Default for LevelMask {
    fn default() -> Self {
        Self::ALL
    }
}

/// Inclusive severity band accepted by one sink of a [`FanoutSink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LevelRange {
    min: Severity,
    max: Severity,
}

impl LevelRange {
    pub const ALL: Self = Self {
        min: Severity::Dump,
        max: Severity::Fatal,
    };

    /// `None` when `min` is above `max`.
    #[must_use]
    pub fn new(min: Severity, max: Severity) -> Option<Self> {
        (min <= max).then_some(Self { min, max })
    }

    #[must_use]
    pub const fn at_least(min: Severity) -> Self {
        Self {
            min,
            max: Severity::Fatal,
        }
    }

    #[must_use]
    pub const fn min(&self) -> Severity {
        self.min
    }

    #[must_use]
    pub const fn max(&self) -> Severity {
        self.max
    }

    #[must_use]
    pub fn contains(&self, severity: Severity) -> bool {
        (self.min..=self.max).contains(&severity)
    }
}

impl Default for LevelRange {
    fn default() -> Self {
        Self::ALL
    }
}

impl fmt::Display for LevelRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.min, self.max)
    }
}

/// `warn` (warn and above) or `debug..warn` (both ends inclusive).
impl std::str::FromStr for LevelRange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once("..") {
            None => Ok(Self::at_least(s.parse()?)),
            Some((min, max)) => {
                let (min, max): (Severity, Severity) = (min.parse()?, max.parse()?);
                Self::new(min, max).ok_or_else(|| format!("empty severity range {s:?}"))
            }
        }
    }
}

// ── Context ─────────────────────────────────────────────────────────────────

/// Immutable logging context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogContext {
    subsystem: &'static str,
    min: Severity,
    mask: LevelMask,
}

impl LogContext {
    #[must_use]
    pub const fn new(subsystem: &'static str) -> Self {
        Self {
            subsystem,
            min: Severity::Info,
            mask: LevelMask::ALL,
        }
    }

    #[must_use]
    pub const fn with_min(self, min: Severity) -> Self {
        Self { min, ..self }
    }

    #[must_use]
    pub const fn with_mask(self, mask: LevelMask) -> Self {
        Self { mask, ..self }
    }

    /// Same filtering, different subsystem name.
    #[must_use]
    pub const fn child(self, subsystem: &'static str) -> Self {
        Self { subsystem, ..self }
    }

    #[must_use]
    pub const fn subsystem(&self) -> &'static str {
        self.subsystem
    }

    #[must_use]
    pub const fn min(&self) -> Severity {
        self.min
    }

    #[must_use]
    pub fn enabled(&self, severity: Severity) -> bool {
        severity >= self.min && self.mask.contains(severity)
    }
}

// ── Events ──────────────────────────────────────────────────────────────────

/// One emitted log event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEvent {
    pub severity: Severity,
    pub subsystem: &'static str,
    pub message: String,
    /// Raw platform error code, opaque to the engine.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl LogEvent {
    #[must_use]
    pub fn with_code(mut self, code: Option<i32>) -> Self {
        self.code = code;
        self
    }

    #[must_use]
    pub fn with_detail(mut self, detail: impl fmt::Display) -> Self {
        self.detail = Some(detail.to_string());
        self
    }
}

/// Destination for log events. Implementations must tolerate concurrent
/// callers and must not fail: a sink that cannot write drops the event.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &LogEvent);

    fn flush(&self) {}

    /// Flush whatever would accept an event at `severity`.
    fn flush_level(&self, _severity: Severity) {
        self.flush();
    }
}

// ── Logger ──────────────────────────────────────────────────────────────────

/// Context plus sink. Cheap to clone.
#[derive(Clone)]
pub struct Logger {
    ctx: LogContext,
    sink: Arc<dyn EventSink>,
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger").field("ctx", &self.ctx).finish_non_exhaustive()
    }
}

impl Logger {
    #[must_use]
    pub fn new(ctx: LogContext, sink: Arc<dyn EventSink>) -> Self {
        Self { ctx, sink }
    }

    /// Logger forwarding into `tracing` with default filtering.
    #[must_use]
    pub fn tracing(subsystem: &'static str) -> Self {
        Self::new(LogContext::new(subsystem), Arc::new(TracingSink))
    }

    /// Logger that filters everything.
    #[must_use]
    pub fn discard() -> Self {
        Self::new(
            LogContext::new("discard").with_mask(LevelMask::NONE),
            Arc::new(TracingSink),
        )
    }

    #[must_use]
    pub fn child(&self, subsystem: &'static str) -> Self {
        Self {
            ctx: self.ctx.child(subsystem),
            sink: Arc::clone(&self.sink),
        }
    }

    #[must_use]
    pub const fn context(&self) -> &LogContext {
        &self.ctx
    }

    #[must_use]
    pub fn enabled(&self, severity: Severity) -> bool {
        self.ctx.enabled(severity)
    }

    /// Start an event in this logger's subsystem.
    #[must_use]
    pub fn event(&self, severity: Severity, message: impl Into<String>) -> LogEvent {
        LogEvent {
            severity,
            subsystem: self.ctx.subsystem,
            message: message.into(),
            code: None,
            detail: None,
        }
    }

    pub fn emit(&self, event: &LogEvent) {
        if !self.ctx.enabled(event.severity) {
            return;
        }
        self.sink.emit(event);
        if event.severity == Severity::Fatal {
            self.sink.flush_level(Severity::Fatal);
        }
    }

    /// Flush every sink that accepts `severity`, filtering or not.
    pub fn flush_all(&self, severity: Severity) {
        self.sink.flush_level(severity);
    }

    pub fn log(&self, severity: Severity, message: impl Into<String>) {
        if self.enabled(severity) {
            self.emit(&self.event(severity, message));
        }
    }

    pub fn dump(&self, message: impl Into<String>) {
        self.log(Severity::Dump, message);
    }

    pub fn trace(&self, message: impl Into<String>) {
        self.log(Severity::Trace, message);
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.log(Severity::Debug, message);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(Severity::Info, message);
    }

    pub fn notice(&self, message: impl Into<String>) {
        self.log(Severity::Notice, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.log(Severity::Warn, message);
    }

    /// Error event carrying an optional raw platform code.
    pub fn error(&self, message: impl Into<String>, code: Option<i32>, detail: impl fmt::Display) {
        if self.enabled(Severity::Error) {
            let event = self
                .event(Severity::Error, message)
                .with_code(code)
                .with_detail(detail);
            self.emit(&event);
        }
    }

    pub fn fatal(&self, message: impl Into<String>, code: Option<i32>, detail: impl fmt::Display) {
        if self.enabled(Severity::Fatal) {
            let event = self
                .event(Severity::Fatal, message)
                .with_code(code)
                .with_detail(detail);
            self.emit(&event);
        }
    }
}

// ── Sinks ───────────────────────────────────────────────────────────────────

/// Forwards events into `tracing` under the `ffs::remap` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

macro_rules! forward {
    ($level:ident, $ev:expr) => {
        tracing::$level!(
            target: "ffs::remap",
            subsystem = $ev.subsystem,
            severity = $ev.severity.as_str(),
            code = $ev.code,
            detail = $ev.detail.as_deref(),
            "{}",
            $ev.message
        )
    };
}

impl EventSink for TracingSink {
    fn emit(&self, event: &LogEvent) {
        match event.severity {
            Severity::Dump | Severity::Trace => forward!(trace, event),
            Severity::Debug => forward!(debug, event),
            Severity::Info | Severity::Notice => forward!(info, event),
            Severity::Warn => forward!(warn, event),
            Severity::Error | Severity::Fatal => forward!(error, event),
        }
    }
}

#[derive(Serialize)]
struct LedgerLine<'a> {
    ts_ms: u64,
    #[serde(flatten)]
    event: &'a LogEvent,
}

/// JSON-lines event ledger. Buffered; flushed on fatal events and on drop.
pub struct JsonlSink {
    out: Mutex<BufWriter<Box<dyn Write + Send>>>,
    dropped: AtomicU64,
}

impl fmt::Debug for JsonlSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonlSink")
            .field("dropped", &self.dropped.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl JsonlSink {
    #[must_use]
    pub fn new(writer: Box<dyn Write + Send>) -> Self {
        Self {
            out: Mutex::new(BufWriter::new(writer)),
            dropped: AtomicU64::new(0),
        }
    }

    /// Append to `path`, creating it if needed.
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::new(Box::new(file)))
    }

    /// Events that could not be serialized or written.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

impl EventSink for JsonlSink {
    fn emit(&self, event: &LogEvent) {
        let line = LedgerLine {
            ts_ms: unix_millis(),
            event,
        };
        let mut out = self.out.lock();
        let written = serde_json::to_writer(&mut *out, &line)
            .map_err(std::io::Error::from)
            .and_then(|()| out.write_all(b"\n"));
        if written.is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn flush(&self) {
        if self.out.lock().flush().is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

// ── Text output ─────────────────────────────────────────────────────────────

/// Layout of one [`TextSink`] line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TextFormat {
    /// `message`
    #[default]
    Msg,
    /// `LEVEL message`
    LevelMsg,
    /// `datetime LEVEL message`
    DatetimeLevelMsg,
    /// `datetime LEVEL [subsystem] message`
    DatetimeLevelCallerMsg,
}

impl TextFormat {
    pub const ALL: [Self; 4] = [
        Self::Msg,
        Self::LevelMsg,
        Self::DatetimeLevelMsg,
        Self::DatetimeLevelCallerMsg,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Msg => "msg",
            Self::LevelMsg => "level-msg",
            Self::DatetimeLevelMsg => "datetime-level-msg",
            Self::DatetimeLevelCallerMsg => "datetime-level-caller-msg",
        }
    }

    /// Render `event` as it was emitted at `at`. Detail and platform code
    /// follow the message.
    #[must_use]
    pub fn format_line(self, event: &LogEvent, at: DateTime<Utc>) -> String {
        let mut parts: Vec<String> = Vec::with_capacity(4);
        if matches!(self, Self::DatetimeLevelMsg | Self::DatetimeLevelCallerMsg) {
            parts.push(at.to_rfc3339_opts(SecondsFormat::Millis, true));
        }
        if self != Self::Msg {
            parts.push(event.severity.label().to_owned());
        }
        if self == Self::DatetimeLevelCallerMsg {
            parts.push(format!("[{}]", event.subsystem));
        }
        let mut message = event.message.clone();
        if let Some(detail) = &event.detail {
            message = format!("{message}: {detail}");
        }
        if let Some(code) = event.code {
            message = format!("{message} (code {code})");
        }
        parts.push(message);
        parts.join(" ")
    }
}

impl fmt::Display for TextFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TextFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().replace('_', "-");
        Self::ALL
            .into_iter()
            .find(|format| format.as_str().eq_ignore_ascii_case(&wanted))
            .ok_or_else(|| format!("unknown text format {s:?}"))
    }
}

/// One formatted line per event, written straight through.
pub struct TextSink {
    out: Mutex<Box<dyn Write + Send>>,
    format: TextFormat,
    dropped: AtomicU64,
}

impl fmt::Debug for TextSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TextSink")
            .field("format", &self.format)
            .field("dropped", &self.dropped.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl TextSink {
    #[must_use]
    pub fn new(writer: Box<dyn Write + Send>, format: TextFormat) -> Self {
        Self {
            out: Mutex::new(writer),
            format,
            dropped: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn stderr(format: TextFormat) -> Self {
        Self::new(Box::new(std::io::stderr()), format)
    }

    /// Append to `path`, creating it if needed.
    pub fn open(path: &Path, format: TextFormat) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::new(Box::new(file), format))
    }

    #[must_use]
    pub const fn format(&self) -> TextFormat {
        self.format
    }

    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl EventSink for TextSink {
    fn emit(&self, event: &LogEvent) {
        let line = self.format.format_line(event, Utc::now());
        if writeln!(self.out.lock(), "{line}").is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn flush(&self) {
        if self.out.lock().flush().is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

// ── Fan-out ─────────────────────────────────────────────────────────────────

struct Route {
    range: LevelRange,
    sink: Arc<dyn EventSink>,
}

/// Routes each event to every inner sink whose [`LevelRange`] contains
/// its severity, in insertion order.
#[derive(Default)]
pub struct FanoutSink {
    routes: Vec<Route>,
}

impl FanoutSink {
    /// Every sink accepts every severity.
    #[must_use]
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self {
            routes: sinks
                .into_iter()
                .map(|sink| Route {
                    range: LevelRange::ALL,
                    sink,
                })
                .collect(),
        }
    }

    /// Add `sink`, accepting only severities within `range`.
    #[must_use]
    pub fn with_route(mut self, range: LevelRange, sink: Arc<dyn EventSink>) -> Self {
        self.routes.push(Route { range, sink });
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: &LogEvent) {
        for route in &self.routes {
            if route.range.contains(event.severity) {
                route.sink.emit(event);
            }
        }
    }

    fn flush(&self) {
        for route in &self.routes {
            route.sink.flush();
        }
    }

    fn flush_level(&self, severity: Severity) {
        for route in self.routes.iter().filter(|r| r.range.contains(severity)) {
            route.sink.flush_level(severity);
        }
    }
}

/// Captures events in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<LogEvent>>,
    flushes: AtomicU64,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn events(&self) -> Vec<LogEvent> {
        self.events.lock().clone()
    }

    /// Messages of captured events at exactly `severity`.
    #[must_use]
    pub fn messages_at(&self, severity: Severity) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.severity == severity)
            .map(|e| e.message.clone())
            .collect()
    }

    #[must_use]
    pub fn flushes(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: &LogEvent) {
        self.events.lock().push(event.clone());
    }

    fn flush(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_logger(ctx: LogContext) -> (Logger, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        let logger = Logger::new(ctx, Arc::clone(&sink) as Arc<dyn EventSink>);
        (logger, sink)
    }

    #[test]
    fn severities_are_ordered() {
        assert!(Severity::Dump < Severity::Trace);
        assert!(Severity::Notice < Severity::Warn);
        assert!(Severity::Error < Severity::Fatal);
        assert_eq!("NOTICE".parse::<Severity>().unwrap(), Severity::Notice);
        assert!("loud".parse::<Severity>().is_err());
    }

    #[test]
    fn minimum_severity_filters_events() {
        let (logger, sink) = memory_logger(LogContext::new("plan").with_min(Severity::Notice));
        logger.debug("hidden");
        logger.info("hidden");
        logger.notice("shown");
        logger.warn("shown too");
        assert_eq!(sink.events().len(), 2);
        assert_eq!(sink.messages_at(Severity::Notice), vec!["shown".to_owned()]);
    }

    #[test]
    fn mask_disables_individual_levels() {
        let ctx = LogContext::new("exec")
            .with_min(Severity::Dump)
            .with_mask(LevelMask::ALL.without(Severity::Warn));
        let (logger, sink) = memory_logger(ctx);
        logger.dump("table");
        logger.warn("muted");
        logger.error("failed", Some(5), "media error");
        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].code, Some(5));
        assert_eq!(events[1].detail.as_deref(), Some("media error"));
    }

    #[test]
    fn child_keeps_filtering_and_sink() {
        let (parent, sink) = memory_logger(LogContext::new("remap").with_min(Severity::Warn));
        let child = parent.child("job");
        child.info("hidden");
        child.warn("visible");
        assert_eq!(parent.context().subsystem(), "remap");
        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].subsystem, "job");
    }

    #[test]
    fn fatal_flushes_sink() {
        let (logger, sink) = memory_logger(LogContext::new("exec"));
        logger.error("first", None, "x");
        assert_eq!(sink.flushes(), 0);
        logger.fatal("boom", None, "y");
        assert_eq!(sink.flushes(), 1);
    }

    #[test]
    fn jsonl_ledger_is_flushed_on_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let sink = Arc::new(JsonlSink::open(&path).unwrap());
        let logger = Logger::new(LogContext::new("exec"), Arc::clone(&sink) as Arc<dyn EventSink>);

        logger.info("move committed");
        logger.fatal("device lost", Some(19), "no such device");

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["severity"], "info");
        assert!(lines[0].get("code").is_none());
        assert_eq!(lines[1]["severity"], "fatal");
        assert_eq!(lines[1]["code"], 19);
        assert_eq!(lines[1]["subsystem"], "exec");
        assert!(lines[1]["ts_ms"].as_u64().is_some());
        assert_eq!(sink.dropped(), 0);
    }

    #[test]
    fn fanout_reaches_every_sink() {
        let a = Arc::new(MemorySink::new());
        let b = Arc::new(MemorySink::new());
        let fanout = FanoutSink::new(vec![
            Arc::clone(&a) as Arc<dyn EventSink>,
            Arc::clone(&b) as Arc<dyn EventSink>,
        ]);
        assert_eq!(fanout.len(), 2);
        let logger = Logger::new(LogContext::new("cli"), Arc::new(fanout));
        logger.notice("resuming");
        assert_eq!(a.events(), b.events());
        assert_eq!(a.events().len(), 1);
    }

    fn sample(severity: Severity) -> LogEvent {
        LogEvent {
            severity,
            subsystem: "exec",
            message: "write failed".into(),
            code: Some(5),
            detail: Some("media error".into()),
        }
    }

    #[test]
    fn text_formats_add_fields_in_order() {
        let at = DateTime::parse_from_rfc3339("2024-03-01T12:30:45.250Z")
            .unwrap()
            .with_timezone(&Utc);
        let event = sample(Severity::Error);
        assert_eq!(
            TextFormat::Msg.format_line(&event, at),
            "write failed: media error (code 5)"
        );
        assert_eq!(
            TextFormat::LevelMsg.format_line(&event, at),
            "ERROR write failed: media error (code 5)"
        );
        assert_eq!(
            TextFormat::DatetimeLevelMsg.format_line(&event, at),
            "2024-03-01T12:30:45.250Z ERROR write failed: media error (code 5)"
        );
        assert_eq!(
            TextFormat::DatetimeLevelCallerMsg.format_line(&event, at),
            "2024-03-01T12:30:45.250Z ERROR [exec] write failed: media error (code 5)"
        );
        let plain = LogEvent {
            code: None,
            detail: None,
            ..sample(Severity::Notice)
        };
        assert_eq!(TextFormat::LevelMsg.format_line(&plain, at), "NOTICE write failed");
    }

    #[test]
    fn text_format_names_parse() {
        for format in TextFormat::ALL {
            assert_eq!(format.as_str().parse::<TextFormat>().unwrap(), format);
        }
        assert_eq!(
            "DATETIME_LEVEL_CALLER_MSG".parse::<TextFormat>().unwrap(),
            TextFormat::DatetimeLevelCallerMsg
        );
        assert!("xml".parse::<TextFormat>().is_err());
    }

    #[test]
    fn text_sink_writes_one_line_per_event() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.log");
        let sink = Arc::new(TextSink::open(&path, TextFormat::LevelMsg).unwrap());
        let logger = Logger::new(LogContext::new("plan"), Arc::clone(&sink) as Arc<dyn EventSink>);
        logger.info("planning");
        logger.warn("tight on space");
        logger.flush_all(Severity::Warn);

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "INFO planning\nWARN tight on space\n");
        assert_eq!(sink.dropped(), 0);
    }

    #[test]
    fn level_ranges_parse_and_bound_both_ends() {
        let range: LevelRange = "debug..warn".parse().unwrap();
        assert!(range.contains(Severity::Debug));
        assert!(range.contains(Severity::Warn));
        assert!(!range.contains(Severity::Trace));
        assert!(!range.contains(Severity::Error));
        assert_eq!(range.to_string(), "debug..warn");

        let open: LevelRange = "error".parse().unwrap();
        assert_eq!(open, LevelRange::at_least(Severity::Error));
        assert!(open.contains(Severity::Fatal));
        assert!("warn..info".parse::<LevelRange>().is_err());
        assert!(LevelRange::new(Severity::Fatal, Severity::Dump).is_none());
    }

    #[test]
    fn fanout_routes_by_level_range() {
        let chatty = Arc::new(MemorySink::new());
        let alerts = Arc::new(MemorySink::new());
        let fanout = FanoutSink::default()
            .with_route(
                LevelRange::new(Severity::Info, Severity::Warn).unwrap(),
                Arc::clone(&chatty) as Arc<dyn EventSink>,
            )
            .with_route(
                LevelRange::at_least(Severity::Error),
                Arc::clone(&alerts) as Arc<dyn EventSink>,
            );
        let logger = Logger::new(LogContext::new("exec"), Arc::new(fanout));
        logger.info("move 0 done");
        logger.warn("retrying");
        logger.error("write failed", Some(5), "media error");

        assert_eq!(chatty.events().len(), 2);
        assert_eq!(alerts.messages_at(Severity::Error), vec!["write failed".to_owned()]);
        assert!(alerts.messages_at(Severity::Info).is_empty());
    }

    #[test]
    fn flush_all_reaches_only_sinks_accepting_the_level() {
        let chatty = Arc::new(MemorySink::new());
        let alerts = Arc::new(MemorySink::new());
        let fanout = FanoutSink::default()
            .with_route(
                LevelRange::new(Severity::Dump, Severity::Info).unwrap(),
                Arc::clone(&chatty) as Arc<dyn EventSink>,
            )
            .with_route(
                LevelRange::at_least(Severity::Warn),
                Arc::clone(&alerts) as Arc<dyn EventSink>,
            );
        let logger = Logger::new(LogContext::new("exec"), Arc::new(fanout));

        logger.flush_all(Severity::Error);
        assert_eq!((chatty.flushes(), alerts.flushes()), (0, 1));

        logger.fatal("device lost", Some(19), "no such device");
        assert_eq!((chatty.flushes(), alerts.flushes()), (0, 2));

        logger.flush_all(Severity::Debug);
        assert_eq!((chatty.flushes(), alerts.flushes()), (1, 2));
    }

    #[test]
    fn tracing_sink_accepts_every_severity() {
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_test_writer()
            .finish();
        tracing::subscriber::with_default(subscriber, || {
            let logger = Logger::new(
                LogContext::new("plan").with_min(Severity::Dump),
                Arc::new(TracingSink),
            );
            for severity in Severity::ALL {
                logger.emit(&logger.event(severity, "event").with_code(Some(1)));
            }
        });
    }

    #[test]
    fn discard_logger_emits_nothing() {
        let logger = Logger::discard();
        for severity in Severity::ALL {
            assert!(!logger.enabled(severity));
        }
    }
}
