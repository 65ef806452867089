use crate::capabilities::Capabilities;
use crate::error::{DeployFailure, ProviderError};
use opd_core::settings::Settings;
use opd_core::Target;
use opd_emit::Emitter;
use opd_process::{run_with_retry, ExecResult, Invocation, RetryPolicy, Runner};
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Host plugin API version. Providers must share its major.
pub const PLUGIN_API_VERSION: &str = "1.0.0";

/// Everything a driver needs to talk to the outside world for one command.
#[derive(Clone)]
pub struct DeployContext {
    pub emitter: Arc<Emitter>,
    pub runner: Arc<dyn Runner>,
    pub settings: Arc<Settings>,
    /// Command name stamped on every event (`start`, `up`).
    pub action: String,
    pub cancel: CancellationToken,
}

impl DeployContext {
    pub fn new(
        emitter: Arc<Emitter>,
        runner: Arc<dyn Runner>,
        settings: Arc<Settings>,
        action: &str,
    ) -> Self {
        Self {
            emitter,
            runner,
            settings,
            action: action.to_string(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from_settings(&self.settings)
    }

    /// Retry-wrapped run for idempotent read-style calls (auth, link).
    /// Cancellation stops the current attempt and skips the rest.
    pub async fn run_retry(&self, inv: Invocation) -> ExecResult {
        run_with_retry(self.runner.as_ref(), &inv, &self.retry_policy(), &self.cancel).await
    }

    /// Single run, stopped when the command is cancelled.
    pub async fn run(&self, inv: Invocation) -> ExecResult {
        self.runner.run_cancellable(inv, &self.cancel).await
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn base(&self, provider: &str, target: Target) -> EventBase {
        EventBase {
            action: self.action.clone(),
            provider: provider.to_string(),
            target,
        }
    }
}

/// Fields shared by every event of one deploy attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventBase {
    pub action: String,
    pub provider: String,
    pub target: Target,
}

impl EventBase {
    /// `{action, provider, target, event}` merged with the fields of `extra`.
    pub fn event(&self, kind: &str, extra: Value) -> Value {
        let mut map = Map::new();
        map.insert("action".into(), json!(self.action));
        map.insert("provider".into(), json!(self.provider));
        map.insert("target".into(), json!(self.target));
        map.insert("event".into(), json!(kind));
        if let Value::Object(fields) = extra {
            map.extend(fields);
        }
        Value::Object(map)
    }
}

/// One deploy attempt as requested by the orchestrator.
#[derive(Debug, Clone, Default)]
pub struct DeployRequest {
    /// App directory being deployed.
    pub cwd: PathBuf,
    /// Repository root; may equal `cwd`.
    pub root: PathBuf,
    pub target: Target,
    pub project: Option<String>,
    pub org: Option<String>,
    /// Build output directory, relative to `cwd`.
    pub publish_dir: Option<String>,
    pub framework: Option<String>,
    pub alias: Option<String>,
    pub timeout: Option<Duration>,
    pub idle_timeout: Option<Duration>,
    pub show_logs: bool,
    pub print_cmd: bool,
}

impl DeployRequest {
    pub fn new(cwd: impl AsRef<Path>, target: Target) -> Self {
        let cwd = cwd.as_ref().to_path_buf();
        Self {
            root: cwd.clone(),
            cwd,
            target,
            ..Default::default()
        }
    }

    pub fn is_next(&self) -> bool {
        self.framework.as_deref() == Some("next")
    }
}

/// First existing output directory: the configured one, then `candidates`.
pub fn find_artifact_dir(
    req: &DeployRequest,
    provider: &str,
    candidates: &[&str],
) -> Result<PathBuf, DeployFailure> {
    let configured = req.publish_dir.iter().map(String::as_str);
    for candidate in configured.chain(candidates.iter().copied()) {
        let dir = req.cwd.join(candidate);
        if dir.is_dir() {
            return Ok(dir);
        }
    }
    let wanted = req.cwd.join(req.publish_dir.as_deref().unwrap_or("dist"));
    Err(DeployFailure::new(
        provider,
        format!(
            "Artifact directory not found: {}. Run your build or set publishDir.",
            wanted.display()
        ),
    ))
}

/// A deploy that finished successfully.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeployOutcome {
    pub url: Option<String>,
    pub logs_url: Option<String>,
}

/// A deploy target the orchestrator can drive.
#[async_trait::async_trait]
pub trait Provider: Send + Sync {
    fn id(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    fn api_version(&self) -> &str {
        PLUGIN_API_VERSION
    }

    /// Shell command that logs the user in.
    fn login_command(&self) -> String;

    /// Fails with [`ProviderError::CliMissing`] or [`ProviderError::Auth`].
    async fn validate_auth(&self, ctx: &DeployContext, cwd: &Path) -> Result<(), ProviderError>;

    /// Commands `deploy` would run, for dry-run output.
    fn deploy_plan(&self, req: &DeployRequest) -> Vec<String>;

    /// Link the directory to a remote project. Returns whether a link ran.
    async fn link(&self, _ctx: &DeployContext, _req: &DeployRequest) -> Result<bool, ProviderError> {
        Ok(false)
    }

    /// Drive the deploy process. Emits driver events up to and including
    /// `done`; the final summary object belongs to the caller.
    async fn deploy(
        &self,
        ctx: &DeployContext,
        req: &DeployRequest,
    ) -> Result<DeployOutcome, DeployFailure>;

    /// Point `alias` at `url`. Returns the alias URL on success.
    async fn alias(
        &self,
        _ctx: &DeployContext,
        _cwd: &Path,
        _url: &str,
        _alias: &str,
    ) -> Result<Option<String>, ProviderError> {
        Err(ProviderError::Unsupported(format!(
            "{} does not support aliases",
            self.id()
        )))
    }

    /// Best-effort dashboard link when no logs URL could be resolved.
    fn dashboard_fallback(&self, _url: &str) -> Option<String> {
        None
    }
}
