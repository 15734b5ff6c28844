//! Structured JSON-lines logging for the decision engine.
//!
//! Every record lands in `<LOG_DIR>/<RUN_ID>/events.jsonl` with a run id,
//! a process-wide sequence number and an RFC3339 timestamp. Records at
//! `warn` and above are echoed to stderr so operators see them without
//! tailing the run directory.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fs::{create_dir_all, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

// =============================================================================
// Log Levels
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
    Fatal = 5,
}

impl Level {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "trace" => Some(Level::Trace),
            "debug" => Some(Level::Debug),
            "info" => Some(Level::Info),
            "warn" | "warning" => Some(Level::Warn),
            "error" => Some(Level::Error),
            "fatal" => Some(Level::Fatal),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Trace => "TRACE",
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
            Level::Fatal => "FATAL",
        }
    }
}

// =============================================================================
// Log Domains (categories for filtering)
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Stream,  // Consumer-group reads, acks, publishes
    State,   // Snapshot updates and state-store mirrors
    Mode,    // Policy decisions and mode transitions
    Intent,  // Intent generation (derisk, band, trim)
    Arbiter, // Arbitration input/output
    Exit,    // Hard exit engine and fallback heuristic
    System,  // Startup, shutdown, recovery
    Profile, // Evaluation timing
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Stream => "stream",
            Domain::State => "state",
            Domain::Mode => "mode",
            Domain::Intent => "intent",
            Domain::Arbiter => "arbiter",
            Domain::Exit => "exit",
            Domain::System => "system",
            Domain::Profile => "profile",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        const ALL: [Domain; 8] = [
            Domain::Stream,
            Domain::State,
            Domain::Mode,
            Domain::Intent,
            Domain::Arbiter,
            Domain::Exit,
            Domain::System,
            Domain::Profile,
        ];
        ALL.into_iter().find(|d| d.as_str() == raw.trim())
    }
}

/// Level and domain filter, read from `LOG_LEVEL` / `LOG_DOMAINS` once.
#[derive(Debug, Clone, PartialEq)]
struct Filter {
    min_level: Level,
    /// `None` lets every domain through.
    domains: Option<Vec<Domain>>,
}

impl Filter {
    fn from_values(level: Option<&str>, domains: Option<&str>) -> Self {
        let min_level = level.and_then(Level::parse).unwrap_or(Level::Info);
        let domains = match domains.map(str::trim) {
            None | Some("") | Some("all") => None,
            Some(list) => Some(list.split(',').filter_map(Domain::parse).collect()),
        };
        Self { min_level, domains }
    }

    fn allows(&self, level: Level, domain: Domain) -> bool {
        level >= self.min_level
            && self
                .domains
                .as_ref()
                .map(|ds| ds.contains(&domain))
                .unwrap_or(true)
    }
}

static FILTER: OnceLock<Filter> = OnceLock::new();

fn filter() -> &'static Filter {
    FILTER.get_or_init(|| {
        Filter::from_values(
            std::env::var("LOG_LEVEL").ok().as_deref(),
            std::env::var("LOG_DOMAINS").ok().as_deref(),
        )
    })
}

// =============================================================================
// Sequence counter and run context
// =============================================================================

static LOG_SEQ: AtomicU64 = AtomicU64::new(0);
static RUN_CONTEXT: OnceLock<RunContext> = OnceLock::new();

fn next_seq() -> u64 {
    LOG_SEQ.fetch_add(1, Ordering::SeqCst)
}

#[derive(Debug)]
struct RunContext {
    run_id: String,
    events: Option<Mutex<BufWriter<File>>>,
}

fn ensure_run_context() -> &'static RunContext {
    RUN_CONTEXT.get_or_init(|| {
        let run_id = std::env::var("RUN_ID")
            .unwrap_or_else(|_| format!("rb-{}-{}", ts_epoch_ms(), process::id()));
        let run_dir = run_root(std::env::var("LOG_DIR").ok()).join(&run_id);

        let events = create_dir_all(&run_dir)
            .and_then(|_| {
                let manifest = json!({
                    "run_id": run_id,
                    "service": env!("CARGO_PKG_NAME"),
                    "version": env!("CARGO_PKG_VERSION"),
                    "started_at": ts_now(),
                    "pid": process::id(),
                });
                std::fs::write(run_dir.join("manifest.json"), manifest.to_string())?;
                File::create(run_dir.join("events.jsonl"))
            })
            .map(|file| Mutex::new(BufWriter::new(file)));

        // An unwritable run dir degrades to stderr-only logging.
        let events = match events {
            Ok(w) => Some(w),
            Err(err) => {
                eprintln!("riskbrain: run log unavailable at {}: {}", run_dir.display(), err);
                None
            }
        };

        RunContext { run_id, events }
    })
}

/// `LOG_DIR`, else `out/runs`. Unit tests write under the system temp dir.
fn run_root(log_dir: Option<String>) -> PathBuf {
    match log_dir {
        Some(dir) if !dir.trim().is_empty() => PathBuf::from(dir),
        _ if cfg!(test) => std::env::temp_dir().join("riskbrain-runs"),
        _ => PathBuf::from("out/runs"),
    }
}

fn sanitize_fields(mut fields: Map<String, Value>) -> Map<String, Value> {
    let redacted = Value::String("[REDACTED]".to_string());
    for key in ["authorization", "Authorization", "api_key", "password", "signature"] {
        if fields.contains_key(key) {
            fields.insert(key.to_string(), redacted.clone());
        }
    }
    fields
}

fn split_fields(mut fields: Map<String, Value>) -> (Map<String, Value>, Map<String, Value>) {
    let mut top = Map::new();
    for key in ["intent_id", "message_id", "topic", "symbol", "mode", "msg"] {
        if let Some(value) = fields.remove(key) {
            top.insert(key.to_string(), value);
        }
    }
    (top, fields)
}

// =============================================================================
// Core logging functions
// =============================================================================

/// RFC3339 timestamp with milliseconds
pub fn ts_now() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Epoch milliseconds
pub fn ts_epoch_ms() -> u64 {
    Utc::now().timestamp_millis() as u64
}

/// Emit a structured log entry
pub fn log(level: Level, domain: Domain, event: &str, fields: Map<String, Value>) {
    if !filter().allows(level, domain) {
        return;
    }
    emit_record(level, domain.as_str(), event, fields);
}

/// Shorthand for module-scoped info records.
pub fn json_log(module: &str, fields: Map<String, Value>) {
    emit_record(Level::Info, module, module, fields);
}

fn emit_record(level: Level, component: &str, event: &str, fields: Map<String, Value>) {
    let ctx = ensure_run_context();
    let fields = sanitize_fields(fields);
    let (mut top, data) = split_fields(fields);

    let msg = top.remove("msg").unwrap_or(Value::String(String::new()));
    let mut entry = Map::new();
    entry.insert("ts".to_string(), json!(ts_now()));
    entry.insert("run_id".to_string(), json!(ctx.run_id.clone()));
    entry.insert("seq".to_string(), json!(next_seq()));
    entry.insert("lvl".to_string(), json!(level.as_str()));
    entry.insert("component".to_string(), json!(component));
    entry.insert("event".to_string(), json!(event));
    entry.insert("msg".to_string(), msg);
    for (k, v) in top {
        entry.insert(k, v);
    }
    entry.insert("data".to_string(), Value::Object(data));

    let line = Value::Object(entry).to_string();
    if let Some(events) = &ctx.events {
        if let Ok(mut w) = events.lock() {
            let _ = writeln!(w, "{}", line);
            let _ = w.flush();
        }
    }
    if level >= Level::Warn {
        eprintln!("{}", line);
    }
}

// =============================================================================
// Domain helpers
// =============================================================================

pub fn log_mode_transition(from: &str, to: &str, reason: &str, gross_pct: f64, potential_pct: f64) {
    log(
        Level::Warn,
        Domain::Mode,
        "mode_transition",
        obj(&[
            ("from", v_str(from)),
            ("mode", v_str(to)),
            ("reason", v_str(reason)),
            ("gross_pct", v_num(gross_pct)),
            ("potential_pct", v_num(potential_pct)),
        ]),
    );
}

pub fn log_intent_published(
    intent_id: &str,
    intent_type: &str,
    symbol: &str,
    action: &str,
    quantity: i64,
    message_id: Option<&str>,
) {
    log(
        Level::Info,
        Domain::Intent,
        "intent_published",
        obj(&[
            ("intent_id", v_str(intent_id)),
            ("intent_type", v_str(intent_type)),
            ("symbol", v_str(symbol)),
            ("action", v_str(action)),
            ("quantity", json!(quantity)),
            ("message_id", message_id.map(v_str).unwrap_or(Value::Null)),
        ]),
    );
}

pub fn log_stream_error(topic: &str, operation: &str, error: &str) {
    log(
        Level::Error,
        Domain::Stream,
        "stream_error",
        obj(&[
            ("topic", v_str(topic)),
            ("operation", v_str(operation)),
            ("error", v_str(error)),
        ]),
    );
}

pub fn log_fallback(mode: &str, cause: &str, reduction_notional: f64) {
    log(
        Level::Warn,
        Domain::Exit,
        "exit_fallback",
        obj(&[
            ("mode", v_str(mode)),
            ("cause", v_str(cause)),
            ("reduction_notional", v_num(reduction_notional)),
        ]),
    );
}

// =============================================================================
// Utility Functions
// =============================================================================

pub fn obj(pairs: &[(&str, Value)]) -> Map<String, Value> {
    let mut map = Map::new();
    for (k, v) in pairs {
        map.insert((*k).to_string(), v.clone());
    }
    map
}

pub fn v_str(s: &str) -> Value {
    Value::String(s.to_string())
}

pub fn v_num(n: f64) -> Value {
    json!(n)
}

// =============================================================================
// Profiling Scope
// =============================================================================

/// Emits elapsed wall time for the enclosing scope on drop.
pub struct ProfileScope {
    label: &'static str,
    context: Map<String, Value>,
    started: Instant,
}

impl ProfileScope {
    pub fn with_context(label: &'static str, fields: &[(&str, Value)]) -> Self {
        Self {
            label,
            context: obj(fields),
            started: Instant::now(),
        }
    }
}

impl Drop for ProfileScope {
    fn drop(&mut self) {
        let elapsed_ms = self.started.elapsed().as_secs_f64() * 1000.0;
        let mut fields = std::mem::take(&mut self.context);
        fields.insert("label".to_string(), v_str(self.label));
        fields.insert("elapsed_ms".to_string(), v_num(elapsed_ms));
        log(Level::Trace, Domain::Profile, "profile", fields);
    }
}

// =============================================================================
// Periodic throughput summary
// =============================================================================

/// Counted occurrences rolled into the periodic `throughput` record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tally {
    Message,
    Failure,
    Intent,
    Fallback,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Counters {
    messages: u64,
    failures: u64,
    intents: u64,
    fallbacks: u64,
}

impl Counters {
    fn bump(&mut self, tally: Tally) {
        let slot = match tally {
            Tally::Message => &mut self.messages,
            Tally::Failure => &mut self.failures,
            Tally::Intent => &mut self.intents,
            Tally::Fallback => &mut self.fallbacks,
        };
        *slot += 1;
    }
}

struct Throughput {
    counters: Counters,
    window_start: Instant,
    window: Duration,
}

impl Throughput {
    fn new(window: Duration) -> Self {
        Self {
            counters: Counters::default(),
            window_start: Instant::now(),
            window,
        }
    }

    /// Counters for a finished window, resetting for the next one.
    fn roll(&mut self) -> Option<(Counters, Duration)> {
        let elapsed = self.window_start.elapsed();
        if elapsed < self.window {
            return None;
        }
        self.window_start = Instant::now();
        Some((std::mem::take(&mut self.counters), elapsed))
    }
}

static THROUGHPUT: OnceLock<Mutex<Throughput>> = OnceLock::new();

fn throughput() -> &'static Mutex<Throughput> {
    THROUGHPUT.get_or_init(|| {
        let secs = std::env::var("LOG_FLUSH_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(300);
        Mutex::new(Throughput::new(Duration::from_secs(secs)))
    })
}

pub fn agg_increment(tally: Tally) {
    if let Ok(mut t) = throughput().lock() {
        t.counters.bump(tally);
    }
}

/// Emits the `throughput` record once per window. Cheap to call every loop.
pub fn tick_aggregator() {
    let rolled = match throughput().lock() {
        Ok(mut t) => t.roll(),
        Err(_) => None,
    };
    if let Some((c, elapsed)) = rolled {
        log(
            Level::Info,
            Domain::System,
            "throughput",
            obj(&[
                ("window_secs", v_num(elapsed.as_secs_f64())),
                ("messages", json!(c.messages)),
                ("failures", json!(c.failures)),
                ("intents", json!(c.intents)),
                ("fallbacks", json!(c.fallbacks)),
            ]),
        );
    }
}
