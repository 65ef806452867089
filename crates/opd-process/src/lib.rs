//! Subprocess execution for provider CLIs.
//!
//! Every call goes through the [`Runner`] trait: [`ShellRunner`] spawns real
//! processes, [`ReplayRunner`] answers from recorded fixtures, and
//! [`RecordingRunner`] tees real runs into a fixture file. None of them ever
//! return `Err`; failures are `ExecResult { ok: false, .. }`.

pub mod fixture;
pub mod lines;
pub mod quote;
pub mod retry;
pub mod runner;
mod watchdog;

pub use fixture::{ChunkRecord, Fd, Fixture, FixtureKind, RecordingRunner, ReplayRunner};
pub use lines::LineBuffer;
pub use quote::{quote_arg, quote_path};
pub use retry::{backoff_delay, run_with_retry, run_with_timeout, RetryPolicy};
pub use runner::ShellRunner;

use opd_core::settings::Settings;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Exit code reported when the hard timeout fires.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// One subprocess request. Consumed exactly once by a [`Runner`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Invocation {
    pub cmd: String,
    pub cwd: PathBuf,
    /// Merged over the inherited environment.
    pub env: BTreeMap<String, String>,
    pub stdin: Option<String>,
    pub timeout: Option<Duration>,
    pub idle_timeout: Option<Duration>,
}

impl Invocation {
    pub fn new(cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            cwd: PathBuf::from("."),
            ..Default::default()
        }
    }

    pub fn in_dir(mut self, cwd: impl AsRef<Path>) -> Self {
        self.cwd = cwd.as_ref().to_path_buf();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_idle_timeout(mut self, idle: Option<Duration>) -> Self {
        self.idle_timeout = idle;
        self
    }
}

/// Why a process was terminated by us rather than exiting on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Timeout,
    IdleTimeout,
    Stopped,
}

/// Outcome of an [`Invocation`].
///
/// `exit_code` is `None` when the process was killed or signaled. Streaming
/// runs leave `stdout`/`stderr` empty; the text went through the chunk channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecResult {
    pub ok: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub stop_reason: Option<StopReason>,
}

impl ExecResult {
    pub fn exited(code: Option<i32>) -> Self {
        Self {
            ok: code == Some(0),
            exit_code: code,
            ..Default::default()
        }
    }

    pub fn stopped(reason: StopReason) -> Self {
        Self {
            ok: false,
            exit_code: (reason == StopReason::Timeout).then_some(TIMEOUT_EXIT_CODE),
            stop_reason: Some(reason),
            ..Default::default()
        }
    }

    /// Spawn or supervision failure.
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            exit_code: Some(1),
            stderr: message.into(),
            ..Default::default()
        }
    }

    /// Combined output, stdout first.
    pub fn output(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
            (false, true) => self.stdout.clone(),
            _ => self.stderr.clone(),
        }
    }
}

/// A piece of output as it arrived. No line-boundary guarantee.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamChunk {
    Stdout(String),
    Stderr(String),
}

impl StreamChunk {
    pub fn text(&self) -> &str {
        match self {
            StreamChunk::Stdout(s) | StreamChunk::Stderr(s) => s,
        }
    }

    pub fn is_stderr(&self) -> bool {
        matches!(self, StreamChunk::Stderr(_))
    }
}

/// Cloneable, idempotent stop capability for a running stream.
#[derive(Debug, Clone)]
pub struct StopHandle(CancellationToken);

impl StopHandle {
    pub fn stop(&self) {
        self.0.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.0.is_cancelled()
    }
}

/// Live handle to a spawned process.
///
/// `stop()` may be called any number of times, before or after exit.
#[derive(Debug)]
pub struct StreamController {
    stop: CancellationToken,
    done: JoinHandle<ExecResult>,
}

impl StreamController {
    pub(crate) fn new(stop: CancellationToken, done: JoinHandle<ExecResult>) -> Self {
        Self { stop, done }
    }

    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(self.stop.clone())
    }

    /// Resolve once the process has exited or been killed.
    pub async fn done(self) -> ExecResult {
        match self.done.await {
            Ok(res) => res,
            Err(e) => ExecResult::failed(format!("process supervisor failed: {e}")),
        }
    }
}

/// Controller plus the ordered chunk stream. The channel closes after the
/// process is gone and all output has been delivered.
#[derive(Debug)]
pub struct StreamHandle {
    pub controller: StreamController,
    pub chunks: mpsc::UnboundedReceiver<StreamChunk>,
}

impl StreamHandle {
    /// Drain all output and accumulate it into the result (blocking mode).
    pub async fn collect(self) -> ExecResult {
        let StreamHandle {
            controller,
            mut chunks,
        } = self;
        let (mut stdout, mut stderr) = (String::new(), String::new());
        while let Some(chunk) = chunks.recv().await {
            match chunk {
                StreamChunk::Stdout(s) => stdout.push_str(&s),
                StreamChunk::Stderr(s) => stderr.push_str(&s),
            }
        }
        let mut res = controller.done().await;
        res.stdout = stdout;
        if !stderr.is_empty() {
            res.stderr = stderr;
        }
        res
    }

    /// [`collect`](Self::collect), but the process is stopped as soon as
    /// `cancel` fires. Output produced before the stop is kept.
    pub async fn collect_until(self, cancel: &CancellationToken) -> ExecResult {
        let stop = self.controller.stop_handle();
        let collect = self.collect();
        tokio::pin!(collect);
        tokio::select! {
            res = &mut collect => res,
            _ = cancel.cancelled() => {
                stop.stop();
                collect.await
            }
        }
    }
}

/// Subprocess execution seam.
#[async_trait::async_trait]
pub trait Runner: Send + Sync {
    /// Run to completion, buffering output.
    async fn run(&self, inv: Invocation) -> ExecResult;

    /// Spawn and stream output incrementally.
    fn spawn_stream(&self, inv: Invocation) -> StreamHandle;

    /// Blocking run that `cancel` can interrupt. A token that already fired
    /// spawns nothing.
    async fn run_cancellable(&self, inv: Invocation, cancel: &CancellationToken) -> ExecResult {
        if cancel.is_cancelled() {
            return ExecResult::stopped(StopReason::Stopped);
        }
        self.spawn_stream(inv).collect_until(cancel).await
    }

    /// Whether `<bin> --version` exits successfully.
    async fn has(&self, bin: &str, cwd: &Path) -> bool {
        self.run(Invocation::new(format!("{bin} --version")).in_dir(cwd))
            .await
            .ok
    }
}

/// Pick the runner the environment asks for: replay fixtures, optionally
/// recorded, over a shell runner with CI env forcing when appropriate.
pub fn runner_from_settings(settings: &Settings) -> anyhow::Result<Arc<dyn Runner>> {
    let base: Arc<dyn Runner> = match &settings.replay_fixtures {
        Some(path) => Arc::new(ReplayRunner::from_file(path)?),
        None => Arc::new(ShellRunner::new().with_ci_env(settings.ci_child_env())),
    };
    Ok(match &settings.record_fixtures {
        Some(path) => Arc::new(RecordingRunner::new(base, path.clone())),
        None => base,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invocation_builder() {
        let inv = Invocation::new("vercel deploy --yes")
            .in_dir("/tmp/app")
            .with_env("A", "1")
            .with_stdin("value")
            .with_timeout(Some(Duration::from_secs(5)))
            .with_idle_timeout(Some(Duration::from_secs(2)));
        assert_eq!(inv.cmd, "vercel deploy --yes");
        assert_eq!(inv.cwd, PathBuf::from("/tmp/app"));
        assert_eq!(inv.env.get("A").map(String::as_str), Some("1"));
        assert_eq!(inv.stdin.as_deref(), Some("value"));
        assert_eq!(inv.timeout, Some(Duration::from_secs(5)));
        assert_eq!(inv.idle_timeout, Some(Duration::from_secs(2)));
    }

    #[test]
    fn result_constructors() {
        assert!(ExecResult::exited(Some(0)).ok);
        assert!(!ExecResult::exited(Some(2)).ok);
        assert!(!ExecResult::exited(None).ok);

        let t = ExecResult::stopped(StopReason::Timeout);
        assert_eq!(t.exit_code, Some(TIMEOUT_EXIT_CODE));
        let i = ExecResult::stopped(StopReason::IdleTimeout);
        assert_eq!(i.exit_code, None);
        assert_eq!(i.stop_reason, Some(StopReason::IdleTimeout));

        let f = ExecResult::failed("spawn error: nope");
        assert_eq!(f.exit_code, Some(1));
        assert!(f.stderr.contains("nope"));
    }

    #[test]
    fn output_joins_streams() {
        let mut r = ExecResult::exited(Some(0));
        r.stdout = "out".into();
        assert_eq!(r.output(), "out");
        r.stderr = "err".into();
        assert_eq!(r.output(), "out\nerr");
    }

    #[test]
    fn replay_selected_from_settings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fx.ndjson");
        std::fs::write(&path, "").unwrap();
        let settings = Settings {
            replay_fixtures: Some(path),
            ..Default::default()
        };
        assert!(runner_from_settings(&settings).is_ok());

        let missing = Settings {
            replay_fixtures: Some(dir.path().join("missing.ndjson")),
            ..Default::default()
        };
        assert!(runner_from_settings(&missing).is_err());
    }
}
