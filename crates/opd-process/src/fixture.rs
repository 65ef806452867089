//! Recorded subprocess interactions.
//!
//! A fixture file is NDJSON, one [`Fixture`] per line. [`ReplayRunner`]
//! answers invocations from it without spawning anything, including
//! streamed output with per-chunk delays and processes that never exit.
//! [`RecordingRunner`] wraps a real runner and appends what it saw.

use crate::watchdog::{drain, supervise, Outcome};
use crate::{ExecResult, Invocation, Runner, StopReason, StreamChunk, StreamController, StreamHandle};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Exit code for invocations no fixture matches.
pub const NO_FIXTURE_EXIT_CODE: i32 = 127;

const REPLAY_DRAIN: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FixtureKind {
    #[default]
    Run,
    Stream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Fd {
    Out,
    Err,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkRecord {
    pub fd: Fd,
    pub data: String,
    /// Wait before emitting this chunk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,
}

impl ChunkRecord {
    pub fn out(data: impl Into<String>) -> Self {
        Self {
            fd: Fd::Out,
            data: data.into(),
            delay_ms: None,
        }
    }

    pub fn err(data: impl Into<String>) -> Self {
        Self {
            fd: Fd::Err,
            data: data.into(),
            delay_ms: None,
        }
    }

    pub fn after_ms(mut self, ms: u64) -> Self {
        self.delay_ms = Some(ms);
        self
    }

    fn to_chunk(&self) -> StreamChunk {
        match self.fd {
            Fd::Out => StreamChunk::Stdout(self.data.clone()),
            Fd::Err => StreamChunk::Stderr(self.data.clone()),
        }
    }
}

/// One recorded invocation. `cmd` ending in `*` matches by prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fixture {
    #[serde(rename = "t", default)]
    pub kind: FixtureKind,
    pub cmd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default)]
    pub ok: bool,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chunks: Vec<ChunkRecord>,
    /// Never exit; only a watchdog or stop ends it.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub hang: bool,
}

impl Fixture {
    pub fn run(
        cmd: impl Into<String>,
        ok: bool,
        exit_code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) -> Self {
        Self {
            kind: FixtureKind::Run,
            cmd: cmd.into(),
            cwd: None,
            ok,
            exit_code,
            stdout: stdout.into(),
            stderr: stderr.into(),
            chunks: Vec::new(),
            hang: false,
        }
    }

    pub fn stream(cmd: impl Into<String>, chunks: Vec<ChunkRecord>, exit_code: i32) -> Self {
        Self {
            kind: FixtureKind::Stream,
            chunks,
            ..Self::run(cmd, exit_code == 0, Some(exit_code), "", "")
        }
    }

    pub fn hanging(mut self) -> Self {
        self.hang = true;
        self
    }

    fn unmatched(cmd: &str) -> Self {
        Self::run(
            cmd,
            false,
            Some(NO_FIXTURE_EXIT_CODE),
            "",
            format!("no fixture for: {cmd}"),
        )
    }

    fn from_result(inv: &Invocation, kind: FixtureKind, res: &ExecResult) -> Self {
        Self {
            kind,
            cmd: inv.cmd.clone(),
            cwd: Some(inv.cwd.display().to_string()),
            ok: res.ok,
            exit_code: res.exit_code,
            stdout: res.stdout.clone(),
            stderr: res.stderr.clone(),
            chunks: Vec::new(),
            hang: false,
        }
    }

    pub fn matches(&self, cmd: &str) -> bool {
        match self.cmd.strip_suffix('*') {
            Some(prefix) => cmd.starts_with(prefix),
            None => self.cmd == cmd,
        }
    }

    fn into_buffered(self) -> ExecResult {
        let mut res = self.result(self.exit_code);
        res.stdout = self.stdout;
        res.stderr = self.stderr;
        res
    }

    fn is_immediate(&self) -> bool {
        !self.hang && self.chunks.is_empty()
    }

    /// Recorded chunks, or the buffered output split by stream.
    fn stream_chunks(&self) -> Vec<ChunkRecord> {
        if !self.chunks.is_empty() {
            return self.chunks.clone();
        }
        let mut out = Vec::new();
        if !self.stdout.is_empty() {
            out.push(ChunkRecord::out(self.stdout.clone()));
        }
        if !self.stderr.is_empty() {
            out.push(ChunkRecord::err(self.stderr.clone()));
        }
        out
    }

    fn result(&self, code: Option<i32>) -> ExecResult {
        ExecResult {
            ok: self.ok,
            exit_code: code,
            ..Default::default()
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Answers invocations from fixtures.
///
/// Matching fixtures are consumed in order; the last one left for a
/// command stays and answers every later call.
#[derive(Debug, Default)]
pub struct ReplayRunner {
    fixtures: Mutex<Vec<Fixture>>,
    calls: Mutex<Vec<Invocation>>,
}

impl ReplayRunner {
    pub fn new(fixtures: Vec<Fixture>) -> Self {
        Self {
            fixtures: Mutex::new(fixtures),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Load an NDJSON fixture file. Blank lines are skipped.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading fixtures from {}", path.display()))?;
        let mut fixtures = Vec::new();
        for (i, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let fx: Fixture = serde_json::from_str(line)
                .with_context(|| format!("{}:{}: invalid fixture", path.display(), i + 1))?;
            fixtures.push(fx);
        }
        tracing::debug!(path = %path.display(), count = fixtures.len(), "loaded fixtures");
        Ok(Self::new(fixtures))
    }

    pub fn push(&self, fixture: Fixture) {
        lock(&self.fixtures).push(fixture);
    }

    /// Every invocation seen so far, in order.
    pub fn calls(&self) -> Vec<Invocation> {
        lock(&self.calls).clone()
    }

    fn take(&self, inv: &Invocation) -> Fixture {
        lock(&self.calls).push(inv.clone());
        let mut fixtures = lock(&self.fixtures);
        let matching: Vec<usize> = fixtures
            .iter()
            .enumerate()
            .filter(|(_, f)| f.matches(&inv.cmd))
            .map(|(i, _)| i)
            .take(2)
            .collect();
        match matching[..] {
            [first, _] => fixtures.remove(first),
            [only] => fixtures[only].clone(),
            _ => {
                tracing::warn!(cmd = %inv.cmd, "no fixture for invocation");
                Fixture::unmatched(&inv.cmd)
            }
        }
    }

    fn replay_stream(fx: Fixture, inv: Invocation) -> StreamHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let stop = CancellationToken::new();
        let done = tokio::spawn(replay(fx, inv, tx, stop.clone()));
        StreamHandle {
            controller: StreamController::new(stop, done),
            chunks: rx,
        }
    }
}

#[async_trait::async_trait]
impl Runner for ReplayRunner {
    async fn run(&self, inv: Invocation) -> ExecResult {
        let fx = self.take(&inv);
        if fx.is_immediate() {
            return fx.into_buffered();
        }
        Self::replay_stream(fx, inv).collect().await
    }

    async fn run_cancellable(&self, inv: Invocation, cancel: &CancellationToken) -> ExecResult {
        if cancel.is_cancelled() {
            lock(&self.calls).push(inv);
            return ExecResult::stopped(StopReason::Stopped);
        }
        let fx = self.take(&inv);
        if fx.is_immediate() {
            return fx.into_buffered();
        }
        Self::replay_stream(fx, inv).collect_until(cancel).await
    }

    fn spawn_stream(&self, inv: Invocation) -> StreamHandle {
        let fx = self.take(&inv);
        Self::replay_stream(fx, inv)
    }
}

async fn replay(
    fx: Fixture,
    inv: Invocation,
    out: mpsc::UnboundedSender<StreamChunk>,
    stop: CancellationToken,
) -> ExecResult {
    let (feed_tx, mut feed_rx) = mpsc::unbounded_channel();
    let chunks = fx.stream_chunks();
    let (hang, code) = (fx.hang, fx.exit_code);
    let exit = async move {
        for c in &chunks {
            if let Some(ms) = c.delay_ms {
                tokio::time::sleep(Duration::from_millis(ms)).await;
            }
            let _ = feed_tx.send(c.to_chunk());
        }
        if hang {
            std::future::pending::<()>().await;
        }
        code
    };

    match supervise(exit, &mut feed_rx, &out, inv.timeout, inv.idle_timeout, &stop).await {
        Outcome::Exited(code) => {
            drain(&mut feed_rx, &out, REPLAY_DRAIN).await;
            fx.result(code)
        }
        Outcome::Killed(reason) => ExecResult::stopped(reason),
    }
}

/// Runs through `inner` and appends each invocation to an NDJSON fixture
/// file that [`ReplayRunner::from_file`] can load.
pub struct RecordingRunner {
    inner: Arc<dyn Runner>,
    path: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl RecordingRunner {
    pub fn new(inner: Arc<dyn Runner>, path: PathBuf) -> Self {
        Self {
            inner,
            path,
            write_lock: Arc::new(Mutex::new(())),
        }
    }
}

fn append_fixture(path: &Path, write_lock: &Mutex<()>, fx: &Fixture) {
    let _guard = lock(write_lock);
    if let Err(e) = try_append(path, fx) {
        tracing::warn!(path = %path.display(), error = %e, "failed to record fixture");
    }
}

fn try_append(path: &Path, fx: &Fixture) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let line = serde_json::to_string(fx)?;
    let mut f = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(f, "{line}")?;
    Ok(())
}

#[async_trait::async_trait]
impl Runner for RecordingRunner {
    async fn run(&self, inv: Invocation) -> ExecResult {
        let res = self.inner.run(inv.clone()).await;
        let fx = Fixture::from_result(&inv, FixtureKind::Run, &res);
        append_fixture(&self.path, &self.write_lock, &fx);
        res
    }

    async fn run_cancellable(&self, inv: Invocation, cancel: &CancellationToken) -> ExecResult {
        let res = self.inner.run_cancellable(inv.clone(), cancel).await;
        let fx = Fixture::from_result(&inv, FixtureKind::Run, &res);
        append_fixture(&self.path, &self.write_lock, &fx);
        res
    }

    fn spawn_stream(&self, inv: Invocation) -> StreamHandle {
        let StreamHandle {
            controller,
            chunks: mut inner_rx,
        } = self.inner.spawn_stream(inv.clone());
        let stop = controller.stop.clone();
        let (tx, rx) = mpsc::unbounded_channel();
        let path = self.path.clone();
        let write_lock = Arc::clone(&self.write_lock);

        let done = tokio::spawn(async move {
            let mut recorded = Vec::new();
            let mut last = Instant::now();
            while let Some(chunk) = inner_rx.recv().await {
                let gap = last.elapsed().as_millis() as u64;
                last = Instant::now();
                let mut rec = match &chunk {
                    StreamChunk::Stdout(s) => ChunkRecord::out(s.clone()),
                    StreamChunk::Stderr(s) => ChunkRecord::err(s.clone()),
                };
                if gap > 0 {
                    rec = rec.after_ms(gap);
                }
                recorded.push(rec);
                let _ = tx.send(chunk);
            }
            let res = controller.done().await;
            let mut fx = Fixture::from_result(&inv, FixtureKind::Stream, &res);
            fx.chunks = recorded;
            append_fixture(&path, &write_lock, &fx);
            res
        });

        StreamHandle {
            controller: StreamController::new(stop, done),
            chunks: rx,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StopReason;

    #[tokio::test]
    async fn replays_run_fixture() {
        let runner = ReplayRunner::new(vec![Fixture::run(
            "vercel whoami",
            true,
            Some(0),
            "alice\n",
            "",
        )]);
        let res = runner.run(Invocation::new("vercel whoami")).await;
        assert!(res.ok);
        assert_eq!(res.stdout, "alice\n");
        assert_eq!(runner.calls()[0].cmd, "vercel whoami");
    }

    #[tokio::test]
    async fn consumes_in_order_then_sticks() {
        let runner = ReplayRunner::new(vec![
            Fixture::run("x", false, Some(1), "", "first"),
            Fixture::run("x", true, Some(0), "second", ""),
        ]);
        assert_eq!(runner.run(Invocation::new("x")).await.stderr, "first");
        assert_eq!(runner.run(Invocation::new("x")).await.stdout, "second");
        assert_eq!(runner.run(Invocation::new("x")).await.stdout, "second");
    }

    #[tokio::test]
    async fn prefix_match_and_unmatched() {
        let runner = ReplayRunner::new(vec![Fixture::run("vercel env add *", true, Some(0), "", "")]);
        assert!(runner.run(Invocation::new("vercel env add API_KEY production")).await.ok);

        let res = runner.run(Invocation::new("wrangler whoami")).await;
        assert!(!res.ok);
        assert_eq!(res.exit_code, Some(NO_FIXTURE_EXIT_CODE));
        assert_eq!(res.stderr, "no fixture for: wrangler whoami");
        assert!(!runner.has("netlify", Path::new(".")).await);
    }

    #[tokio::test(start_paused = true)]
    async fn stream_replays_chunks_with_delays() {
        let runner = ReplayRunner::new(vec![Fixture::stream(
            "vercel deploy --yes",
            vec![
                ChunkRecord::err("Inspect: https://vercel.com/acme/app/abc\n"),
                ChunkRecord::out("https://app-abc.vercel.app\n").after_ms(1500),
            ],
            0,
        )]);
        let start = Instant::now();
        let mut handle = runner.spawn_stream(Invocation::new("vercel deploy --yes"));
        let first = handle.chunks.recv().await.unwrap();
        assert!(first.is_stderr());
        let second = handle.chunks.recv().await.unwrap();
        assert_eq!(second.text(), "https://app-abc.vercel.app\n");
        assert!(start.elapsed() >= Duration::from_millis(1500));
        assert!(handle.chunks.recv().await.is_none());
        assert!(handle.controller.done().await.ok);
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_fixture_hits_idle_timeout() {
        let runner = ReplayRunner::new(vec![Fixture::stream(
            "wrangler pages deploy dist",
            vec![ChunkRecord::out("Uploading...\n")],
            0,
        )
        .hanging()]);
        let res = runner
            .spawn_stream(
                Invocation::new("wrangler pages deploy dist")
                    .with_idle_timeout(Some(Duration::from_secs(45))),
            )
            .collect()
            .await;
        assert_eq!(res.stop_reason, Some(StopReason::IdleTimeout));
        assert_eq!(res.stdout, "Uploading...\n");
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_fixture_stops_and_times_out() {
        let runner = ReplayRunner::new(vec![Fixture::run("sleepy", false, None, "", "").hanging()]);
        let handle = runner.spawn_stream(Invocation::new("sleepy"));
        handle.controller.stop();
        let res = handle.collect().await;
        assert_eq!(res.stop_reason, Some(StopReason::Stopped));

        let res = runner
            .run(Invocation::new("sleepy").with_timeout(Some(Duration::from_secs(3))))
            .await;
        assert_eq!(res.stop_reason, Some(StopReason::Timeout));
        assert_eq!(res.exit_code, Some(crate::TIMEOUT_EXIT_CODE));
    }

    #[test]
    fn fixture_json_shape() {
        let line = r#"{"t":"stream","cmd":"gh api *","ok":true,"exitCode":0,"chunks":[{"fd":"out","data":"hi","delayMs":5}]}"#;
        let fx: Fixture = serde_json::from_str(line).unwrap();
        assert_eq!(fx.kind, FixtureKind::Stream);
        assert_eq!(fx.chunks[0].delay_ms, Some(5));
        assert!(fx.matches("gh api repos/acme/site/pages"));
        assert!(!fx.hang);

        let back = serde_json::to_value(&fx).unwrap();
        assert_eq!(back["exitCode"], 0);
        assert!(back.get("hang").is_none());
    }

    #[test]
    fn from_file_reports_bad_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fx.ndjson");
        fs::write(&path, "{\"cmd\":\"a\",\"ok\":true}\n\nnot json\n").unwrap();
        let err = ReplayRunner::from_file(&path).unwrap_err();
        assert!(format!("{err:#}").contains(":3:"));
    }

    #[tokio::test]
    async fn recording_round_trips_through_replay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rec/fixtures.ndjson");
        let inner: Arc<dyn Runner> = Arc::new(ReplayRunner::new(vec![
            Fixture::run("vercel whoami", true, Some(0), "alice", ""),
            Fixture::stream("vercel deploy", vec![ChunkRecord::out("https://a.vercel.app\n")], 0),
        ]));
        let rec = RecordingRunner::new(inner, path.clone());
        assert!(rec.run(Invocation::new("vercel whoami")).await.ok);
        let res = rec.spawn_stream(Invocation::new("vercel deploy")).collect().await;
        assert_eq!(res.stdout, "https://a.vercel.app\n");

        let replay = ReplayRunner::from_file(&path).unwrap();
        assert_eq!(replay.run(Invocation::new("vercel whoami")).await.stdout, "alice");
        let again = replay.spawn_stream(Invocation::new("vercel deploy")).collect().await;
        assert!(again.ok);
        assert_eq!(again.stdout, "https://a.vercel.app\n");
    }
}
