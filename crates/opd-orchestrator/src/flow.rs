//! The start/up deploy sequence and its terminal summaries.

use crate::context::AppContext;
use crate::detect::{detect_with, Detection};
use crate::env_sync::EnvSyncRequest;
use crate::error::OrchestratorError;
use crate::fixes::apply_safe_fixes;
use crate::preflight::{run_preflight, PreflightCheck, PreflightInput};
use opd_core::defaults::{ProjectDefaults, CONFIG_FILE};
use opd_core::{OutputMode, Target};
use opd_emit::{append_step_summary, DeploySummary};
use opd_process::Invocation;
use opd_providers::{DeployContext, DeployRequest, Provider};
use opd_redact::{compute_redactors, RedactionOptions, Redactor};
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Hard ceiling applied to the deploy stream with `--ci`.
pub const CI_TIMEOUT: Duration = Duration::from_secs(900);
/// Idle window applied to the deploy stream with `--ci`.
pub const CI_IDLE_TIMEOUT: Duration = Duration::from_secs(45);

const EXAMPLE_KEYS_MAX: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Start,
    Up,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Start => "start",
            Action::Up => "up",
        }
    }
}

/// Flags shared by `start` and `up`.
#[derive(Debug, Clone, Default)]
pub struct DeployOptions {
    pub provider: Option<String>,
    /// `None` falls back to saved defaults, then preview.
    pub target: Option<Target>,
    /// Directory commands were run from.
    pub root: PathBuf,
    /// App directory relative to `root`.
    pub path: Option<String>,
    pub project: Option<String>,
    pub org: Option<String>,
    pub alias: Option<String>,
    pub sync_env: bool,
    pub env_file: Option<String>,
    pub only: Vec<String>,
    pub ignore: Vec<String>,
    pub dry_run: bool,
    pub no_build: bool,
    pub ci: bool,
    pub json: bool,
    pub soft_fail: bool,
    pub timeout: Option<Duration>,
    pub idle_timeout: Option<Duration>,
    pub show_logs: bool,
    pub print_cmd: bool,
    /// `start` only: leave `opendeploy.config.json` untouched.
    pub no_save_defaults: bool,
}

impl DeployOptions {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Default::default()
        }
    }

    pub fn app_dir(&self) -> PathBuf {
        match self.path.as_deref().filter(|p| !p.is_empty()) {
            Some(p) => self.root.join(p),
            None => self.root.clone(),
        }
    }

    pub fn effective_timeout(&self) -> Option<Duration> {
        self.timeout.or(self.ci.then_some(CI_TIMEOUT))
    }

    pub fn effective_idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout.or(self.ci.then_some(CI_IDLE_TIMEOUT))
    }

    /// Fill unset fields from `opendeploy.config.json`. Flags always win.
    pub fn merge_defaults(&mut self, defaults: &ProjectDefaults) {
        if self.provider.is_none() {
            self.provider = defaults.provider.clone();
        }
        if self.target.is_none() {
            self.target = defaults.env.as_deref().and_then(|e| e.parse().ok());
        }
        if self.path.is_none() {
            self.path = defaults.path.clone();
        }
        if self.project.is_none() {
            self.project = defaults.project.clone();
        }
        if self.org.is_none() {
            self.org = defaults.org.clone();
        }
        self.sync_env |= defaults.sync_env.unwrap_or(false);
    }
}

/// Exit status of one command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    pub ok: bool,
    pub exit_code: i32,
}

/// What a successful deploy produced.
#[derive(Debug, Clone)]
pub struct DeployReport {
    pub provider: String,
    /// Canonical id as asked for, before any virtual substitution.
    pub selected: String,
    pub target: Target,
    pub cwd: PathBuf,
    pub url: Option<String>,
    pub logs_url: Option<String>,
    pub alias_url: Option<String>,
    pub duration: Duration,
    pub preflight: Vec<PreflightCheck>,
    pub detection: Detection,
    pub env_file: Option<String>,
}

pub(crate) enum Flow {
    DryRun { plan: Vec<String> },
    Deployed(DeployReport),
}

/// Context gathered so far, kept for the failure summary.
#[derive(Debug, Clone, Default)]
pub(crate) struct Partial {
    pub provider: Option<String>,
    pub target: Target,
    pub detection: Option<Detection>,
    pub started: Option<Instant>,
}

/// `up`-only `{action, stage, provider, target}` progress events.
struct Stages<'a> {
    ctx: &'a DeployContext,
    enabled: bool,
    provider: &'a str,
    target: Target,
}

impl Stages<'_> {
    fn emit(&self, stage: &str, extra: Value) {
        if !self.enabled {
            return;
        }
        let mut map = Map::new();
        map.insert("ok".into(), json!(true));
        map.insert("action".into(), json!(self.ctx.action));
        map.insert("stage".into(), json!(stage));
        map.insert("provider".into(), json!(self.provider));
        map.insert("target".into(), json!(self.target));
        if let Value::Object(fields) = extra {
            map.extend(fields);
        }
        self.ctx.emitter.event(&Value::Object(map));
    }
}

fn env_file_candidates(target: Target) -> [&'static str; 2] {
    match target {
        Target::Production => [".env.production.local", ".env"],
        Target::Preview => [".env", ".env.local"],
    }
}

/// The env file to sync: the explicit one, else the first candidate present.
pub fn choose_env_file(cwd: &Path, target: Target, explicit: Option<&str>) -> Option<String> {
    if let Some(f) = explicit.filter(|f| !f.is_empty()) {
        return Some(f.to_string());
    }
    env_file_candidates(target)
        .iter()
        .find(|f| cwd.join(f).is_file())
        .map(|f| f.to_string())
}

/// Fresh redactor for this command. Never cached across invocations.
pub fn install_redactor(app: &AppContext, cwd: &Path, env_files: Vec<String>) {
    let redactor = if app.settings.no_redact {
        Redactor::disabled()
    } else {
        compute_redactors(
            &RedactionOptions::new(cwd)
                .with_env_files(env_files)
                .with_process_env(true),
        )
    };
    tracing::debug!(tracked = redactor.tracked_len(), "redactor installed");
    app.emitter.set_redactor(redactor);
}

fn redaction_files(cwd: &Path, target: Target, explicit: Option<&str>) -> Vec<String> {
    let mut files: Vec<String> = opd_redact::DEFAULT_ENV_FILES
        .iter()
        .chain(env_file_candidates(target).iter())
        .map(|s| s.to_string())
        .collect();
    files.extend(choose_env_file(cwd, target, explicit));
    files.sort();
    files.dedup();
    files
}

fn checkpoint(ctx: &DeployContext, stage: &'static str) -> Result<(), OrchestratorError> {
    if ctx.is_cancelled() {
        return Err(OrchestratorError::Cancelled { stage });
    }
    Ok(())
}

async fn ensure_auth(
    app: &AppContext,
    ctx: &DeployContext,
    provider: &dyn Provider,
    cwd: &Path,
    opts: &DeployOptions,
) -> Result<(), OrchestratorError> {
    let err = match provider.validate_auth(ctx, cwd).await {
        Ok(()) => return Ok(()),
        Err(_) if ctx.is_cancelled() => return Err(OrchestratorError::Cancelled { stage: "auth" }),
        Err(e) if !e.is_auth() => return Err(e.into()),
        Err(e) => e,
    };
    if !app.emitter.mode().is_interactive() || opts.ci || app.settings.force_ci {
        return Err(err.into());
    }
    let login = provider.login_command();
    app.emitter.warn(&err.to_string());
    if !app.prompt.confirm(&format!("Run {login} now?"), true).await {
        return Err(err.into());
    }
    let res = ctx.run(Invocation::new(login.clone()).in_dir(cwd)).await;
    checkpoint(ctx, "auth")?;
    if !res.ok {
        tracing::warn!(cmd = %login, exit = ?res.exit_code, "login command failed");
    }
    provider.validate_auth(ctx, cwd).await.map_err(Into::into)
}

async fn sync_env(
    app: &AppContext,
    ctx: &DeployContext,
    stages: &Stages<'_>,
    req: EnvSyncRequest,
) {
    let file = req.file.display().to_string();
    stages.emit("envSyncStart", json!({ "file": file }));
    app.emitter.section("Environment");
    app.emitter
        .note(&format!("Syncing {file} to {}", req.provider));
    match app.env_sync.sync(ctx, &req).await {
        Ok(count) => {
            app.emitter.success("Environment sync complete");
            stages.emit("envSyncDone", json!({ "count": count }));
        }
        Err(e) => {
            app.emitter.warn(&format!("Env sync skipped: {e}"));
            stages.emit("envSyncDone", json!({ "ok": false, "message": e.to_string() }));
        }
    }
}

/// Interactive pick among registered providers.
async fn choose_provider(app: &AppContext) -> Result<String, OrchestratorError> {
    let ids: Vec<String> = app.registry.ids().into_iter().map(str::to_string).collect();
    if app.emitter.mode().is_interactive() {
        let picked = app.prompt.select("Select a provider", &ids).await;
        if let Some(id) = picked.and_then(|i| ids.get(i)) {
            return Ok(id.clone());
        }
    }
    Err(anyhow::anyhow!("No provider specified. Pass --provider <{}>", ids.join("|")).into())
}

pub(crate) async fn deploy_flow(
    app: &AppContext,
    action: Action,
    opts: &DeployOptions,
    partial: &mut Partial,
    own_redactor: bool,
) -> Result<Flow, OrchestratorError> {
    let target = opts.target.unwrap_or_default();
    partial.target = target;
    partial.started = Some(Instant::now());

    let provider_id = match opts.provider.as_deref().filter(|p| !p.trim().is_empty()) {
        Some(p) => p.to_string(),
        None => choose_provider(app).await?,
    };
    partial.provider = Some(opd_providers::registry::canonical_id(&provider_id).to_string());
    let provider: Arc<dyn Provider> = app.registry.resolve(&provider_id)?;
    let id = provider.id().to_string();
    partial.provider = Some(id.clone());

    let cwd = opts.app_dir();
    if !cwd.is_dir() {
        return Err(anyhow::anyhow!("App directory not found: {}", cwd.display()).into());
    }
    if own_redactor {
        install_redactor(app, &cwd, redaction_files(&cwd, target, opts.env_file.as_deref()));
    }

    let detection = detect_with(&[app.detector.as_ref()], &cwd);
    tracing::debug!(framework = %detection.framework, confidence = detection.confidence, "detected");
    partial.detection = Some(detection.clone());

    let req = DeployRequest {
        root: opts.root.clone(),
        project: opts.project.clone(),
        org: opts.org.clone(),
        publish_dir: detection.publish_dir.clone(),
        framework: Some(detection.framework.clone()),
        alias: opts.alias.clone(),
        timeout: opts.effective_timeout(),
        idle_timeout: opts.effective_idle_timeout(),
        show_logs: opts.show_logs,
        print_cmd: opts.print_cmd,
        ..DeployRequest::new(&cwd, target)
    };

    if opts.dry_run {
        return Ok(Flow::DryRun {
            plan: provider.deploy_plan(&req),
        });
    }

    let ctx = app.deploy_context(action.as_str());
    let stages = Stages {
        ctx: &ctx,
        enabled: action == Action::Up,
        provider: &id,
        target,
    };
    let caps = provider.capabilities();

    ensure_auth(app, &ctx, provider.as_ref(), &cwd, opts).await?;
    checkpoint(&ctx, "auth")?;

    let env_file = choose_env_file(&cwd, target, opts.env_file.as_deref());
    if opts.sync_env {
        match &env_file {
            Some(file) => {
                let sync_req = EnvSyncRequest {
                    provider: id.clone(),
                    cwd: cwd.clone(),
                    file: cwd.join(file),
                    target,
                    project: opts.project.clone(),
                    org: opts.org.clone(),
                    only: opts.only.clone(),
                    ignore: opts.ignore.clone(),
                };
                sync_env(app, &ctx, &stages, sync_req).await;
            }
            None => app.emitter.note("No env file found; skipping env sync"),
        }
        checkpoint(&ctx, "env sync")?;
    }

    if caps.has_project_linking {
        stages.emit("linking", Value::Null);
        let linked = provider.link(&ctx, &req).await;
        checkpoint(&ctx, "linking")?;
        if linked? {
            app.emitter.success("Linked project");
        }
    }

    apply_safe_fixes(
        &app.emitter,
        app.prompt.as_ref(),
        action.as_str(),
        &id,
        &cwd,
        &detection,
    )
    .await?;

    let preflight = run_preflight(
        &ctx,
        app.prompt.as_ref(),
        PreflightInput {
            cwd: &cwd,
            detection: &detection,
            capabilities: &caps,
            no_build: opts.no_build,
            timeout: opts.effective_timeout(),
        },
    )
    .await?;

    checkpoint(&ctx, "preflight")?;
    stages.emit("deployStart", Value::Null);
    let outcome = provider.deploy(&ctx, &req).await?;
    let url = outcome.url;
    let logs_url = outcome
        .logs_url
        .or_else(|| url.as_deref().and_then(|u| provider.dashboard_fallback(u)));
    if let Some(u) = &url {
        stages.emit("url", json!({ "url": u }));
    }
    if let Some(l) = &logs_url {
        stages.emit("logsUrl", json!({ "logsUrl": l }));
    }
    stages.emit("deployed", json!({ "url": url, "logsUrl": logs_url }));

    let mut alias_url = None;
    if let (Some(alias), Some(u)) = (opts.alias.as_deref(), url.as_deref()) {
        match provider.alias(&ctx, &cwd, u, alias).await {
            Ok(Some(a)) => {
                stages.emit("aliasSet", json!({ "alias": a }));
                alias_url = Some(a);
            }
            Ok(None) => {}
            Err(e) => app.emitter.warn(&format!("Alias skipped: {e}")),
        }
    }

    Ok(Flow::Deployed(DeployReport {
        provider: id,
        selected: opd_providers::registry::canonical_id(provider_id.trim()).to_string(),
        target,
        cwd,
        url,
        logs_url,
        alias_url,
        duration: partial.started.map(|s| s.elapsed()).unwrap_or_default(),
        preflight,
        detection,
        env_file,
    }))
}

fn example_keys(cwd: &Path) -> Vec<String> {
    opd_redact::read_dotenv(&cwd.join(".env.example"))
        .map(|vars| vars.into_keys().take(EXAMPLE_KEYS_MAX).collect())
        .unwrap_or_default()
}

/// `opendeploy up ...` equivalent of a finished `start`.
pub fn rerun_command(report: &DeployReport, opts: &DeployOptions) -> String {
    let mut cmd = format!("opendeploy up {} --env {}", report.provider, report.target);
    if let Some(p) = opts.path.as_deref().filter(|p| !p.is_empty()) {
        cmd.push_str(&format!(" --path {p}"));
    }
    if let Some(p) = &opts.project {
        cmd.push_str(&format!(" --project {p}"));
    }
    if let Some(o) = &opts.org {
        cmd.push_str(&format!(" --org {o}"));
    }
    if opts.sync_env {
        cmd.push_str(" --sync-env");
    }
    cmd
}

fn exit_code(app: &AppContext, opts: &DeployOptions, ok: bool) -> Outcome {
    let soft = app.settings.soft_fail(opts.soft_fail, opts.ci, opts.json);
    Outcome {
        ok,
        exit_code: if ok || soft { 0 } else { 1 },
    }
}

fn write_step_summary(app: &AppContext, summary: &DeploySummary) {
    if let Some(path) = &app.settings.step_summary {
        if let Err(e) = append_step_summary(path, &summary.markdown()) {
            tracing::warn!(path = %path.display(), error = %e, "could not write step summary");
        }
    }
}

fn finish_dry_run(app: &AppContext, action: Action, opts: &DeployOptions, partial: &Partial, plan: Vec<String>) -> Outcome {
    let provider = partial.provider.clone().unwrap_or_default();
    app.emitter.json(&json!({
        "ok": true,
        "action": action.as_str(),
        "provider": provider,
        "target": partial.target,
        "mode": "dry-run",
        "cmdPlan": plan,
        "final": true,
    }));
    app.emitter
        .info(&format!("[dry-run] {} {provider} (env={})", action.as_str(), partial.target));
    for cmd in &plan {
        app.emitter.log_line(&format!("  $ {cmd}"));
    }
    exit_code(app, opts, true)
}

fn finish_success(app: &AppContext, action: Action, opts: &DeployOptions, report: &DeployReport) -> Outcome {
    let summary = DeploySummary {
        ok: true,
        provider: report.provider.clone(),
        target: report.target,
        url: report.url.clone(),
        alias: report.alias_url.clone(),
        logs_url: report.logs_url.clone(),
        duration: report.duration,
    };
    let final_obj = match action {
        Action::Start => json!({
            "ok": true,
            "action": "start",
            "provider": report.provider,
            "target": report.target,
            "mode": "deploy",
            "url": report.url,
            "logsUrl": report.logs_url,
            "alias": report.alias_url,
            "cmd": rerun_command(report, opts),
            "ciChecklist": {
                "buildCommand": report.detection.build_command,
                "envFile": report.env_file,
                "exampleKeys": example_keys(&report.cwd),
            },
            "cwd": report.cwd.display().to_string(),
            "preflight": report.preflight,
            "final": true,
        }),
        Action::Up => json!({
            "ok": true,
            "action": "up",
            "provider": report.provider,
            "target": report.target,
            "url": report.url,
            "logsUrl": report.logs_url,
            "aliasUrl": report.alias_url,
            "durationMs": report.duration.as_millis() as u64,
            "preflight": report.preflight,
            "final": true,
        }),
    };
    app.emitter.json(&final_obj);

    if app.emitter.mode() == OutputMode::Interactive {
        let label = if report.target.is_production() {
            "Production"
        } else {
            "Preview"
        };
        match &report.url {
            Some(u) => app.emitter.success(&format!("{label}: {u}")),
            None => app.emitter.success(&format!("{label} deploy complete")),
        }
        app.emitter.deploy_summary(&summary);
        if action == Action::Start {
            app.emitter.section("CI checklist");
            app.emitter
                .info(&format!("Build command: {}", report.detection.build_command));
            if let Some(f) = &report.env_file {
                app.emitter.info(&format!("Env file: {f}"));
            }
            app.emitter.note("Rerun without prompts:");
            app.emitter.log_line(&format!("  {}", rerun_command(report, opts)));
        }
    }
    write_step_summary(app, &summary);
    exit_code(app, opts, true)
}

pub(crate) fn failure_object(action: Action, partial: &Partial, err: &OrchestratorError) -> Value {
    let mut obj = json!({
        "ok": false,
        "action": action.as_str(),
        "provider": partial.provider,
        "target": partial.target,
        "message": err.to_string(),
        "final": true,
    });
    if let Some(m) = obj.as_object_mut() {
        if let Some(r) = err.reason() {
            m.insert("reason".into(), json!(r));
        }
        if let Some(u) = err.url() {
            m.insert("url".into(), json!(u));
        }
        if let Some(l) = err.logs_url() {
            m.insert("logsUrl".into(), json!(l));
        }
        if !err.error_tail().is_empty() {
            m.insert("errorLogTail".into(), json!(err.error_tail()));
        }
        if let Some(d) = &partial.detection {
            m.insert("ciChecklist".into(), json!({ "buildCommand": d.build_command }));
        }
    }
    obj
}

fn finish_failure(app: &AppContext, action: Action, opts: &DeployOptions, partial: &Partial, err: &OrchestratorError) -> Outcome {
    tracing::debug!(error = ?err, "deploy flow failed");
    app.emitter.json(&failure_object(action, partial, err));
    app.emitter.clear_status();
    app.emitter
        .failure(&app.emitter.redact(&err.to_string()), err.error_tail(), err.logs_url());
    if let OrchestratorError::Auth { login, .. } = err {
        app.emitter.note(&format!("Log in with: {login}"));
    }
    if let Some(provider) = &partial.provider {
        write_step_summary(
            app,
            &DeploySummary {
                ok: false,
                provider: provider.clone(),
                target: partial.target,
                url: err.url().map(str::to_string),
                alias: None,
                logs_url: err.logs_url().map(str::to_string),
                duration: partial.started.map(|s| s.elapsed()).unwrap_or_default(),
            },
        );
    }
    exit_code(app, opts, false)
}

async fn run(app: &AppContext, action: Action, opts: &DeployOptions) -> Outcome {
    let mut partial = Partial::default();
    match deploy_flow(app, action, opts, &mut partial, true).await {
        Ok(Flow::DryRun { plan }) => finish_dry_run(app, action, opts, &partial, plan),
        Ok(Flow::Deployed(report)) => {
            let outcome = finish_success(app, action, opts, &report);
            if action == Action::Start {
                save_defaults(app, opts, &report).await;
            }
            outcome
        }
        Err(err) => finish_failure(app, action, opts, &partial, &err),
    }
}

/// Remember this run's selections for the next `start`. Interactive runs
/// ask first; machine-readable runs save unless told not to.
async fn save_defaults(app: &AppContext, opts: &DeployOptions, report: &DeployReport) {
    if opts.no_save_defaults || opts.ci {
        return;
    }
    if app.emitter.mode().is_interactive()
        && !app
            .prompt
            .confirm(&format!("Save these selections as defaults ({CONFIG_FILE})?"), true)
            .await
    {
        return;
    }
    let defaults = ProjectDefaults {
        framework: Some(report.detection.framework.clone()),
        provider: Some(report.selected.clone()),
        env: Some(report.target.to_string()),
        path: opts.path.clone(),
        project: opts.project.clone(),
        org: opts.org.clone(),
        sync_env: Some(opts.sync_env),
    };
    match defaults.save(&opts.root) {
        Ok(path) => {
            tracing::debug!(path = %path.display(), "saved start defaults");
            app.emitter.note(&format!("Wrote {}", path.display()));
        }
        Err(e) => {
            tracing::warn!(error = %e, "could not save start defaults");
            app.emitter.warn(&format!("Could not save defaults: {e:#}"));
        }
    }
}

/// Guided deploy: saved defaults fill unset flags, and a missing provider
/// is asked for.
pub async fn run_start(app: &AppContext, mut opts: DeployOptions) -> Outcome {
    opts.merge_defaults(&ProjectDefaults::load(&opts.root));
    run(app, Action::Start, &opts).await
}

/// Single-command deploy of one app directory.
pub async fn run_up(app: &AppContext, opts: DeployOptions) -> Outcome {
    run(app, Action::Up, &opts).await
}
