//! The shared deploy-stream loop every provider drives its CLI through.
//!
//! One spawned process, one [`DeploySession`]. Output chunks are relayed as
//! `stdout`/`stderr` events, split into lines, and run through the named
//! extractors. An optional inspect poll reports remote state over a channel,
//! so the session has a single writer for its terminal outcome.

use crate::error::DeployFailure;
use crate::extract;
use crate::hints::{self, HintRule};
use crate::provider::{DeployContext, EventBase};
use crate::session::{DeploySession, Phase, Terminal};
use opd_core::truncate_chars;
use opd_emit::Heartbeat;
use opd_process::{
    ExecResult, Invocation, LineBuffer, Runner, StopHandle, StopReason, StreamChunk, StreamHandle,
};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Longest `data` payload on a `stdout`/`stderr` event.
pub const EVENT_DATA_LIMIT: usize = 2000;
pub const INSPECT_INTERVAL: Duration = Duration::from_secs(3);

pub type Extractor = fn(&str) -> Option<String>;

/// Which output stream an extractor reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Stdout,
    Stderr,
    Any,
}

impl Source {
    fn admits(self, stderr: bool) -> bool {
        match self {
            Source::Stdout => !stderr,
            Source::Stderr => stderr,
            Source::Any => true,
        }
    }
}

/// Remote-state poll started once a logs URL is known. Runs
/// `<command> <logsUrl> --json` every `interval`.
#[derive(Debug, Clone)]
pub struct InspectPoll {
    pub command: String,
    pub interval: Duration,
}

pub struct StreamSpec {
    pub label: String,
    pub inv: Invocation,
    pub url: Option<(Extractor, Source)>,
    pub logs: Option<(Extractor, Source)>,
    pub inspect: Option<InspectPoll>,
    /// Echo provider lines in interactive mode.
    pub show_logs: bool,
    pub print_cmd: bool,
}

impl StreamSpec {
    pub fn new(label: &str, inv: Invocation) -> Self {
        Self {
            label: label.to_string(),
            inv,
            url: None,
            logs: None,
            inspect: None,
            show_logs: false,
            print_cmd: false,
        }
    }

    pub fn with_url(mut self, extractor: Extractor, source: Source) -> Self {
        self.url = Some((extractor, source));
        self
    }

    pub fn with_logs(mut self, extractor: Extractor, source: Source) -> Self {
        self.logs = Some((extractor, source));
        self
    }

    pub fn with_inspect(mut self, command: impl Into<String>) -> Self {
        self.inspect = Some(InspectPoll {
            command: command.into(),
            interval: INSPECT_INTERVAL,
        });
        self
    }

    pub fn show_logs(mut self, show: bool) -> Self {
        self.show_logs = show;
        self
    }

    pub fn print_cmd(mut self, print: bool) -> Self {
        self.print_cmd = print;
        self
    }
}

/// What a finished stream left behind. `done` is not emitted yet; callers
/// may still resolve a logs URL first.
#[derive(Debug, Clone)]
pub struct StreamReport {
    pub terminal: Terminal,
    pub exit_code: Option<i32>,
    pub url: Option<String>,
    pub logs_url: Option<String>,
    pub error_tail: Vec<String>,
    logs_emitted: bool,
}

impl StreamReport {
    /// A successful outcome that never spawned (`OPD_TEST_NO_SPAWN`).
    pub fn ready(url: Option<String>, logs_url: Option<String>) -> Self {
        Self {
            terminal: Terminal::Ready,
            exit_code: Some(0),
            url,
            logs_url,
            error_tail: Vec::new(),
            logs_emitted: false,
        }
    }

    pub fn ok(&self) -> bool {
        self.terminal.is_ok()
    }

    pub fn reason(&self) -> Option<String> {
        self.terminal.reason()
    }

    /// Fill in the logs URL if the stream never printed one.
    pub fn resolve_logs_url(&mut self, url: Option<String>) {
        if self.logs_url.is_none() {
            self.logs_url = url;
        }
    }

    /// Emit a pending `logs` event, then `done`. Always the last two
    /// driver events of an attempt.
    pub fn emit_done(&mut self, ctx: &DeployContext, base: &EventBase) {
        if let (Some(logs), false) = (&self.logs_url, self.logs_emitted) {
            ctx.emitter
                .event(&base.event("logs", json!({ "logsUrl": logs })));
            self.logs_emitted = true;
        }
        let mut done = json!({
            "ok": self.ok(),
            "url": self.url,
            "logsUrl": self.logs_url,
        });
        if let Some(reason) = self.reason() {
            done["reason"] = json!(reason);
        }
        ctx.emitter.event(&base.event("done", done));
    }

    pub fn failure(&self, provider: &str, message: &str) -> DeployFailure {
        DeployFailure {
            provider: provider.to_string(),
            message: message.to_string(),
            reason: self.reason(),
            url: self.url.clone(),
            logs_url: self.logs_url.clone(),
            error_log_tail: self.error_tail.clone(),
        }
    }
}

/// Spawn `spec.inv` and drive it to a terminal outcome.
pub async fn drive_stream(ctx: &DeployContext, base: &EventBase, spec: StreamSpec) -> StreamReport {
    let StreamSpec {
        label,
        inv,
        url,
        logs,
        inspect,
        show_logs,
        print_cmd,
    } = spec;
    if print_cmd {
        ctx.emitter.info(&format!("$ {}", inv.cmd));
    }
    tracing::debug!(provider = %base.provider, cmd = %inv.cmd, "deploy stream");
    let (timeout, idle) = (inv.timeout, inv.idle_timeout);
    let cwd = inv.cwd.clone();
    let StreamHandle {
        controller,
        mut chunks,
    } = ctx.runner.spawn_stream(inv);
    let (states_tx, mut states_rx) = mpsc::unbounded_channel();

    let mut driver = Driver {
        ctx,
        base,
        session: DeploySession::new(),
        heartbeat: Heartbeat::start(
            &ctx.emitter,
            &base.action,
            &label,
            Some("waiting for provider output"),
        ),
        url,
        logs,
        inspect,
        show_logs,
        cwd,
        stop: controller.stop_handle(),
        states: states_tx,
        poll: None,
        last_state: None,
        logs_emitted: false,
    };
    let (mut out, mut err) = (LineBuffer::new(), LineBuffer::new());

    loop {
        tokio::select! {
            chunk = chunks.recv() => {
                let Some(chunk) = chunk else { break };
                driver.on_chunk(chunk, &mut out, &mut err);
            }
            Some(state) = states_rx.recv() => driver.on_state(&state),
            _ = ctx.cancel.cancelled(), if !driver.session.is_finished() => driver.on_cancel(),
        }
    }
    if let Some(line) = out.finish() {
        driver.on_line(&line, false);
    }
    if let Some(line) = err.finish() {
        driver.on_line(&line, true);
    }
    if let Some(poll) = driver.poll.take() {
        poll.abort();
    }
    let res = controller.done().await;
    driver.into_report(&label, res, timeout, idle)
}

struct Driver<'a> {
    ctx: &'a DeployContext,
    base: &'a EventBase,
    session: DeploySession,
    heartbeat: Heartbeat,
    url: Option<(Extractor, Source)>,
    logs: Option<(Extractor, Source)>,
    inspect: Option<InspectPoll>,
    show_logs: bool,
    cwd: PathBuf,
    stop: StopHandle,
    states: mpsc::UnboundedSender<String>,
    poll: Option<JoinHandle<()>>,
    last_state: Option<String>,
    logs_emitted: bool,
}

impl Driver<'_> {
    fn emit(&self, kind: &str, extra: Value) {
        self.ctx.emitter.event(&self.base.event(kind, extra));
    }

    fn status(&self, status: &str, extra: Value) {
        let mut fields = json!({ "status": status });
        if let (Value::Object(map), Value::Object(more)) = (&mut fields, extra) {
            map.extend(more);
        }
        self.emit("status", fields);
        self.heartbeat.set_status(status);
    }

    fn on_chunk(&mut self, chunk: StreamChunk, out: &mut LineBuffer, err: &mut LineBuffer) {
        let stderr = chunk.is_stderr();
        let text = chunk.text();
        if !text.trim().is_empty() {
            let kind = if stderr { "stderr" } else { "stdout" };
            self.emit(kind, json!({ "data": truncate_chars(text, EVENT_DATA_LIMIT) }));
        }
        let buf = if stderr { err } else { out };
        for line in buf.push(text) {
            self.on_line(&line, stderr);
        }
    }

    fn on_line(&mut self, raw: &str, stderr: bool) {
        let line = extract::strip_ansi(raw).into_owned();
        self.session.push_line(&line);
        if self.show_logs {
            self.ctx.emitter.log_line(&line);
        }

        for rule in hints::matching(&self.base.provider, &line) {
            if self.session.mark_hint(rule.id) {
                self.emit_hint(rule);
            }
        }

        if let Some((extract_url, source)) = self.url {
            if source.admits(stderr) {
                if let Some(url) = extract_url(&line) {
                    self.session.capture_url(&url);
                }
            }
        }

        if let Some((extract_logs, source)) = self.logs {
            if source.admits(stderr) {
                if let Some(logs) = extract_logs(&line) {
                    if self.session.capture_logs_url(&logs) {
                        self.emit("logs", json!({ "logsUrl": logs }));
                        self.logs_emitted = true;
                        self.start_inspect(&logs);
                    }
                }
            }
        }

        if let Some(phase) = extract::phase(&line) {
            if self.session.advance(phase) {
                self.status(phase.as_str(), Value::Null);
            }
        }

        if let Some(message) = extract::error_line(&line) {
            if self.session.finish(Terminal::Error(message.clone())) {
                self.status("error", json!({ "message": message }));
                self.stop.stop();
            }
        }
    }

    fn emit_hint(&self, rule: &HintRule) {
        self.emit(
            "hint",
            json!({ "id": rule.id, "kind": rule.kind, "message": rule.message }),
        );
        self.ctx.emitter.note(&format!("Hint: {}", rule.message));
    }

    fn start_inspect(&mut self, logs_url: &str) {
        let Some(poll) = &self.inspect else { return };
        if self.poll.is_some() {
            return;
        }
        self.poll = Some(spawn_inspect(
            Arc::clone(&self.ctx.runner),
            format!("{} {} --json", poll.command, opd_process::quote_arg(logs_url)),
            self.cwd.clone(),
            poll.interval,
            self.states.clone(),
        ));
    }

    /// Remote state from the inspect poll. A terminal state ends the
    /// stream even if the CLI keeps running.
    fn on_state(&mut self, state: &str) {
        if self.last_state.as_deref() == Some(state) {
            return;
        }
        self.last_state = Some(state.to_string());
        self.status(&state.to_ascii_lowercase(), json!({ "source": "inspect" }));
        if !extract::is_terminal_state(state) {
            return;
        }
        let terminal = if state == "READY" {
            self.session.advance(Phase::Ready);
            Terminal::Ready
        } else {
            Terminal::Error(format!("Deployment {}", state.to_ascii_lowercase()))
        };
        if self.session.finish(terminal) {
            self.stop.stop();
        }
    }

    fn on_cancel(&mut self) {
        if self.session.finish(Terminal::Cancelled) {
            self.status("cancelled", Value::Null);
            self.stop.stop();
        }
    }

    fn into_report(
        mut self,
        label: &str,
        res: ExecResult,
        timeout: Option<Duration>,
        idle: Option<Duration>,
    ) -> StreamReport {
        if !self.session.is_finished() {
            let terminal = match res.stop_reason {
                Some(StopReason::Timeout) => Terminal::Timeout(timeout.unwrap_or_default()),
                Some(StopReason::IdleTimeout) => Terminal::IdleTimeout(idle.unwrap_or_default()),
                Some(StopReason::Stopped) => Terminal::Cancelled,
                None if res.ok => Terminal::Ready,
                None => Terminal::Error(match res.exit_code {
                    Some(code) => format!("{label} exited with code {code}"),
                    None => format!("{label} was terminated by a signal"),
                }),
            };
            match &terminal {
                Terminal::Timeout(_) => self.status("timeout", Value::Null),
                Terminal::IdleTimeout(_) => self.status("idle-timeout", Value::Null),
                _ => {}
            }
            self.session.finish(terminal);
        }
        let terminal = self
            .session
            .terminal()
            .cloned()
            .unwrap_or(Terminal::Cancelled);
        tracing::debug!(
            provider = %self.base.provider,
            ok = terminal.is_ok(),
            exit_code = ?res.exit_code,
            "deploy stream finished"
        );
        StreamReport {
            terminal,
            exit_code: res.exit_code,
            url: self.session.url().map(str::to_string),
            logs_url: self.session.logs_url().map(str::to_string),
            error_tail: self.session.error_tail(),
            logs_emitted: self.logs_emitted,
        }
    }
}

fn spawn_inspect(
    runner: Arc<dyn Runner>,
    cmd: String,
    cwd: PathBuf,
    interval: Duration,
    states: mpsc::UnboundedSender<String>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval_at(Instant::now() + interval, interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            let res = runner
                .run(
                    Invocation::new(cmd.clone())
                        .in_dir(&cwd)
                        .with_timeout(Some(interval * 10)),
                )
                .await;
            if !res.ok {
                continue;
            }
            let Some(state) = extract::inspect_state(&res.stdout) else {
                continue;
            };
            let terminal = extract::is_terminal_state(&state);
            if states.send(state).is_err() || terminal {
                return;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use opd_core::settings::Settings;
    use opd_core::{OutputMode, Target};
    use opd_emit::{Capture, Emitter, EmitterOptions};
    use opd_process::{ChunkRecord, Fixture, ReplayRunner};

    const DEPLOY: &str = "vercel deploy --yes";

    fn setup(fixtures: Vec<Fixture>) -> (DeployContext, EventBase, Capture, Arc<ReplayRunner>) {
        let (emitter, cap) = Emitter::capture(EmitterOptions::new(OutputMode::Ndjson));
        let replay = Arc::new(ReplayRunner::new(fixtures));
        let ctx = DeployContext::new(
            Arc::new(emitter),
            replay.clone(),
            Arc::new(Settings::default()),
            "up",
        );
        let base = ctx.base("vercel", Target::Preview);
        (ctx, base, cap, replay)
    }

    fn vercel_spec(inv: Invocation) -> StreamSpec {
        StreamSpec::new("Vercel deploy", inv)
            .with_url(extract::vercel_deploy_url, Source::Stdout)
            .with_logs(extract::vercel_inspect_url, Source::Stderr)
            .with_inspect("vercel inspect")
    }

    fn kinds(cap: &Capture) -> Vec<String> {
        cap.json_values()
            .iter()
            .filter_map(|v| v["event"].as_str().map(str::to_string))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn first_url_wins_and_logs_precede_done() {
        let (ctx, base, cap, _) = setup(vec![Fixture::stream(
            DEPLOY,
            vec![
                ChunkRecord::err("Inspect: https://vercel.com/acme/app/abc [1s]\n"),
                ChunkRecord::out("https://app-one.vercel."),
                ChunkRecord::out("app\nhttps://app-two.vercel.app\n"),
                ChunkRecord::err("Building\nWARN Ignored build scripts: esbuild\n"),
                ChunkRecord::err("Ignored build scripts: esbuild\n"),
            ],
            0,
        )]);
        let mut report = drive_stream(&ctx, &base, vercel_spec(Invocation::new(DEPLOY))).await;
        assert!(report.ok());
        assert_eq!(report.url.as_deref(), Some("https://app-one.vercel.app"));
        assert_eq!(report.logs_url.as_deref(), Some("https://vercel.com/acme/app/abc"));
        report.emit_done(&ctx, &base);

        let kinds = kinds(&cap);
        assert_eq!(kinds.iter().filter(|k| *k == "logs").count(), 1);
        assert_eq!(kinds.iter().filter(|k| *k == "hint").count(), 1);
        assert_eq!(kinds.last().map(String::as_str), Some("done"));
        let done = cap.events("done").remove(0);
        assert_eq!(done["ok"], true);
        assert_eq!(done["action"], "up");
        assert_eq!(done["target"], "preview");
        assert!(done.get("reason").is_none());
        let status = cap.events("status");
        assert_eq!(status[0]["status"], "building");
    }

    #[tokio::test(start_paused = true)]
    async fn error_line_stops_a_hanging_process() {
        let (ctx, base, cap, _) = setup(vec![Fixture::stream(
            DEPLOY,
            vec![ChunkRecord::err("Error: Build failed with 1 error\n")],
            0,
        )
        .hanging()]);
        let report = drive_stream(&ctx, &base, vercel_spec(Invocation::new(DEPLOY))).await;
        assert!(!report.ok());
        assert_eq!(report.reason().as_deref(), Some("Build failed with 1 error"));
        assert_eq!(report.error_tail, ["Error: Build failed with 1 error"]);
        let err = cap
            .events("status")
            .into_iter()
            .find(|s| s["status"] == "error")
            .unwrap();
        assert_eq!(err["message"], "Build failed with 1 error");
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timeout_is_reported() {
        let (ctx, base, cap, _) = setup(vec![Fixture::stream(
            DEPLOY,
            vec![ChunkRecord::err("Queued\n")],
            0,
        )
        .hanging()]);
        let inv = Invocation::new(DEPLOY).with_idle_timeout(Some(Duration::from_secs(2)));
        let started = Instant::now();
        let mut report = drive_stream(&ctx, &base, vercel_spec(inv)).await;
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(report.terminal, Terminal::IdleTimeout(Duration::from_secs(2)));
        report.emit_done(&ctx, &base);
        let done = cap.events("done").remove(0);
        assert_eq!(done["ok"], false);
        assert_eq!(done["reason"], "idle-timeout after 2s");
        assert!(cap.events("status").iter().any(|s| s["status"] == "idle-timeout"));
    }

    #[tokio::test(start_paused = true)]
    async fn inspect_ready_ends_the_stream() {
        let (ctx, base, cap, replay) = setup(vec![
            Fixture::stream(
                DEPLOY,
                vec![
                    ChunkRecord::out("https://app-abc.vercel.app\n"),
                    ChunkRecord::err("Inspect: https://vercel.com/acme/app/abc\n"),
                ],
                0,
            )
            .hanging(),
            Fixture::run(
                "vercel inspect https://vercel.com/acme/app/abc --json",
                true,
                Some(0),
                r#"{"readyState":"BUILDING"}"#,
                "",
            ),
            Fixture::run(
                "vercel inspect https://vercel.com/acme/app/abc --json",
                true,
                Some(0),
                r#"{"readyState":"READY"}"#,
                "",
            ),
        ]);
        let report = drive_stream(&ctx, &base, vercel_spec(Invocation::new(DEPLOY))).await;
        assert!(report.ok());
        assert_eq!(report.url.as_deref(), Some("https://app-abc.vercel.app"));
        let polls = replay
            .calls()
            .iter()
            .filter(|c| c.cmd.starts_with("vercel inspect"))
            .count();
        assert_eq!(polls, 2);
        let statuses: Vec<_> = cap
            .events("status")
            .iter()
            .map(|s| s["status"].as_str().unwrap_or_default().to_string())
            .collect();
        assert_eq!(statuses, ["building", "ready"]);
    }

    #[tokio::test(start_paused = true)]
    async fn non_zero_exit_fails_with_tail() {
        let (ctx, base, _, _) = setup(vec![Fixture::stream(
            DEPLOY,
            vec![ChunkRecord::err("npm ERR! missing script: build\n")],
            1,
        )]);
        let report = drive_stream(&ctx, &base, vercel_spec(Invocation::new(DEPLOY))).await;
        assert_eq!(report.exit_code, Some(1));
        assert_eq!(report.reason().as_deref(), Some("Vercel deploy exited with code 1"));
        let failure = report.failure("vercel", "Vercel deploy failed");
        assert_eq!(failure.error_log_tail, ["npm ERR! missing script: build"]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_token_stops_the_stream() {
        let (ctx, base, cap, _) = setup(vec![Fixture::stream(
            DEPLOY,
            vec![ChunkRecord::err("Building\n")],
            0,
        )
        .hanging()]);
        let cancel = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            cancel.cancel();
        });
        let report = drive_stream(&ctx, &base, vercel_spec(Invocation::new(DEPLOY))).await;
        assert_eq!(report.terminal, Terminal::Cancelled);
        assert!(cap.events("status").iter().any(|s| s["status"] == "cancelled"));
    }

    #[tokio::test(start_paused = true)]
    async fn chunk_events_are_truncated() {
        let big = "x".repeat(5000) + "\n";
        let (ctx, base, cap, _) = setup(vec![Fixture::stream(
            DEPLOY,
            vec![ChunkRecord::out(big)],
            0,
        )]);
        drive_stream(&ctx, &base, vercel_spec(Invocation::new(DEPLOY))).await;
        let ev = cap.events("stdout").remove(0);
        assert_eq!(ev["data"].as_str().map(str::len), Some(EVENT_DATA_LIMIT));
    }
}
