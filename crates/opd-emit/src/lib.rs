//! The single sink for everything a consumer sees.
//!
//! Structured objects and human text both pass through the active
//! [`Redactor`] here and nowhere else. The [`OutputMode`] is fixed when the
//! emitter is built.

pub mod capture;
pub mod heartbeat;
pub mod summary;

pub use capture::Capture;
pub use heartbeat::Heartbeat;
pub use summary::{append_step_summary, DeploySummary};

use colored::{Color, Colorize};
use opd_core::settings::Settings;
use opd_core::OutputMode;
use opd_redact::Redactor;
use serde_json::Value;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

#[derive(Debug, Clone, Default)]
pub struct EmitterOptions {
    pub mode: OutputMode,
    /// Stamp structured objects and human lines with RFC 3339 time.
    pub timestamps: bool,
    pub no_emoji: bool,
    /// ANSI colour for human output.
    pub color: bool,
    /// Mirror of the JSON objects (pretty unless NDJSON mode).
    pub json_file: Option<PathBuf>,
    /// Mirror of every structured object and stream event, one per line.
    pub ndjson_file: Option<PathBuf>,
}

impl EmitterOptions {
    pub fn new(mode: OutputMode) -> Self {
        Self {
            mode,
            ..Default::default()
        }
    }

    /// Env-driven options. CLI file-sink flags override afterwards.
    pub fn from_settings(settings: &Settings, mode: OutputMode) -> Self {
        Self {
            mode,
            timestamps: settings.timestamps,
            no_emoji: settings.no_emoji,
            color: false,
            json_file: settings.json_file.clone(),
            ndjson_file: settings.ndjson_file.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Level {
    Info,
    Warn,
    Error,
    Success,
    Note,
}

type Writer = Box<dyn Write + Send>;

pub struct Emitter {
    opts: EmitterOptions,
    redactor: RwLock<Arc<Redactor>>,
    out: Mutex<Writer>,
    err: Mutex<Writer>,
    status_active: AtomicBool,
}

impl std::fmt::Debug for Emitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Emitter").field("opts", &self.opts).finish()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Whether `val` is a terminal outcome object.
pub fn is_final(val: &Value) -> bool {
    val.get("final").and_then(Value::as_bool) == Some(true)
}

impl Emitter {
    /// Process stdout/stderr.
    pub fn new(opts: EmitterOptions) -> Self {
        Self::with_writers(opts, Box::new(std::io::stdout()), Box::new(std::io::stderr()))
    }

    pub fn with_writers(opts: EmitterOptions, out: Writer, err: Writer) -> Self {
        Self {
            opts,
            redactor: RwLock::new(Arc::new(Redactor::vendor_only())),
            out: Mutex::new(out),
            err: Mutex::new(err),
            status_active: AtomicBool::new(false),
        }
    }

    /// Emitter writing both channels into one in-memory buffer.
    pub fn capture(opts: EmitterOptions) -> (Self, Capture) {
        let cap = Capture::default();
        let emitter = Self::with_writers(opts, Box::new(cap.clone()), Box::new(cap.clone()));
        (emitter, cap)
    }

    pub fn mode(&self) -> OutputMode {
        self.opts.mode
    }

    pub fn options(&self) -> &EmitterOptions {
        &self.opts
    }

    /// Swap the active redactor. Rebuilt per top-level command.
    pub fn set_redactor(&self, redactor: Redactor) {
        let mut guard = self.redactor.write().unwrap_or_else(|e| e.into_inner());
        *guard = Arc::new(redactor);
    }

    pub fn redactor(&self) -> Arc<Redactor> {
        Arc::clone(&self.redactor.read().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn redact(&self, text: &str) -> String {
        self.redactor().redact(text)
    }

    fn prepare(&self, val: &Value) -> Value {
        let mut v = self.redactor().redact_json(val);
        if self.opts.timestamps {
            if let Value::Object(map) = &mut v {
                map.entry("ts")
                    .or_insert_with(|| Value::String(opd_core::now_rfc3339()));
            }
        }
        v
    }

    /// A logical structured object: plans, listings, terminal summaries.
    ///
    /// Printed pretty in JSON mode, compact in NDJSON mode, and only when
    /// `final: true` in summary mode. Interactive mode prints nothing but
    /// still mirrors to the file sinks.
    pub fn json(&self, val: &Value) {
        let v = self.prepare(val);
        if self.opts.mode == OutputMode::Summary && !is_final(&v) {
            return;
        }
        let compact = v.to_string();
        let pretty = serde_json::to_string_pretty(&v).unwrap_or_else(|_| compact.clone());
        match self.opts.mode {
            OutputMode::Json => self.write_out(&pretty),
            OutputMode::Ndjson | OutputMode::Summary => self.write_out(&compact),
            OutputMode::Interactive => {}
        }
        if let Some(path) = &self.opts.ndjson_file {
            append_line(path, &compact);
        }
        if let Some(path) = &self.opts.json_file {
            let line = if self.opts.mode == OutputMode::Ndjson {
                &compact
            } else {
                &pretty
            };
            append_line(path, line);
        }
    }

    /// A streaming progress event (`status`, `stdout`, `logs`, `hint`, ...).
    /// Printed only in NDJSON mode; always mirrored to the NDJSON file sink.
    pub fn event(&self, val: &Value) {
        let v = self.prepare(val);
        let line = v.to_string();
        if self.opts.mode == OutputMode::Ndjson {
            self.write_out(&line);
        }
        if let Some(path) = &self.opts.ndjson_file {
            append_line(path, &line);
        }
    }

    pub fn info(&self, msg: &str) {
        self.human(Level::Info, msg);
    }

    pub fn warn(&self, msg: &str) {
        self.human(Level::Warn, msg);
    }

    pub fn error(&self, msg: &str) {
        self.human(Level::Error, msg);
    }

    pub fn success(&self, msg: &str) {
        self.human(Level::Success, msg);
    }

    pub fn note(&self, msg: &str) {
        self.human(Level::Note, msg);
    }

    pub fn section(&self, title: &str) {
        if !self.opts.mode.is_interactive() {
            return;
        }
        let bar = "─".repeat((title.chars().count() + 10).clamp(12, 60));
        let bar = self.tint(&bar, Color::Cyan);
        let mut title = self.redact(title);
        if self.opts.color {
            title = title.as_str().bold().to_string();
        }
        self.write_out(&format!("{bar}\n{title}\n{bar}"));
    }

    /// Raw provider output relayed verbatim (`--show-logs`).
    pub fn log_line(&self, line: &str) {
        if !self.opts.mode.is_interactive() {
            return;
        }
        let line = self.redact(line);
        self.write_out(&self.tint(&line, Color::BrightBlack));
    }

    /// Overwrite the transient status line on stderr.
    pub fn status_line(&self, text: &str) {
        if !self.opts.mode.is_interactive() {
            return;
        }
        let text = self.redact(text);
        let mut err = lock(&self.err);
        let _ = write!(err, "\r\x1b[2K{text}");
        let _ = err.flush();
        self.status_active.store(true, Ordering::SeqCst);
    }

    pub fn clear_status(&self) {
        if self.status_active.swap(false, Ordering::SeqCst) {
            let mut err = lock(&self.err);
            let _ = write!(err, "\r\x1b[2K");
            let _ = err.flush();
        }
    }

    fn human(&self, level: Level, msg: &str) {
        if !self.opts.mode.is_interactive() {
            return;
        }
        let (emoji, plain, color) = match level {
            Level::Info => ("ℹ", "[info]", Color::Cyan),
            Level::Warn => ("⚠", "[warn]", Color::Yellow),
            Level::Error => ("✖", "[error]", Color::Red),
            Level::Success => ("✓", "[ok]", Color::Green),
            Level::Note => ("✱", "[note]", Color::Blue),
        };
        let prefix = if self.opts.no_emoji { plain } else { emoji };
        let ts = if self.opts.timestamps {
            format!("{} ", opd_core::now_rfc3339())
        } else {
            String::new()
        };
        let body = self.tint(&self.redact(msg), color);
        let line = format!("{ts}{prefix} {body}");
        if matches!(level, Level::Warn | Level::Error) {
            self.clear_status();
            let mut err = lock(&self.err);
            let _ = writeln!(err, "{line}");
            let _ = err.flush();
        } else {
            self.write_out(&line);
        }
    }

    fn tint(&self, text: &str, color: Color) -> String {
        if self.opts.color {
            text.color(color).to_string()
        } else {
            text.to_string()
        }
    }

    fn write_out(&self, line: &str) {
        self.clear_status();
        let mut out = lock(&self.out);
        let _ = writeln!(out, "{line}");
        let _ = out.flush();
    }
}

/// Append one line to a sink file, creating parent dirs. Sink failures never
/// affect console output.
fn append_line(path: &Path, line: &str) {
    let result = (|| -> std::io::Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut f = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(f, "{line}")
    })();
    if let Err(e) = result {
        tracing::debug!(path = %path.display(), error = %e, "file sink write failed");
    }
}
