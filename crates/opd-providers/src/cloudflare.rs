use crate::capabilities::Capabilities;
use crate::driver::{drive_stream, Source, StreamSpec};
use crate::error::{DeployFailure, ProviderError};
use crate::extract;
use crate::provider::{find_artifact_dir, DeployContext, DeployOutcome, DeployRequest, Provider};
use opd_process::{quote_arg, quote_path, Invocation};
use serde_json::Value;
use std::path::{Path, PathBuf};

const BIN: &str = "wrangler";

/// Output directories tried after the configured one, in order.
const ARTIFACT_CANDIDATES: &[&str] = &[".vercel/output/static", "dist", "build", "out", "public"];

pub fn find_output_dir(req: &DeployRequest) -> Result<PathBuf, DeployFailure> {
    find_artifact_dir(req, "cloudflare", ARTIFACT_CANDIDATES)
}

#[derive(Debug, Default)]
pub struct CloudflareProvider;

impl CloudflareProvider {
    pub fn new() -> Self {
        Self
    }
}

/// Pages project name: explicit, else `name` in `wrangler.toml`, else the
/// slugified directory name.
pub fn project_name(req: &DeployRequest) -> String {
    if let Some(p) = req.project.as_deref().filter(|p| !p.is_empty()) {
        return extract::slugify(p);
    }
    let from_toml = std::fs::read_to_string(req.cwd.join("wrangler.toml"))
        .ok()
        .and_then(|t| extract::wrangler_project_name(&t));
    if let Some(name) = from_toml {
        return name;
    }
    let base = req
        .cwd
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    extract::slugify(&base)
}

/// Id of the current deployment in `wrangler pages deployments list --json`
/// output, else the first listed.
pub fn current_deployment_id(json_text: &str) -> Option<String> {
    let list: Value = serde_json::from_str(json_text.trim()).ok()?;
    let items = list.as_array()?;
    let pick = items
        .iter()
        .find(|d| d.get("is_current").and_then(Value::as_bool) == Some(true))
        .or_else(|| items.first())?;
    pick.get("id")
        .or_else(|| pick.get("Id"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

pub fn dashboard_url(account: &str, project: &str, deployment: Option<&str>) -> String {
    match deployment {
        Some(id) => format!("https://dash.cloudflare.com/{account}/pages/view/{project}/{id}"),
        None => format!("https://dash.cloudflare.com/{account}/pages/view/{project}"),
    }
}

impl CloudflareProvider {
    async fn resolve_logs_url(&self, ctx: &DeployContext, cwd: &Path, name: &str) -> Option<String> {
        let who = ctx
            .run(Invocation::new(format!("{BIN} whoami")).in_dir(cwd))
            .await;
        let account = extract::cloudflare_account_id(&who.output())?;
        let list = ctx
            .run(
                Invocation::new(format!(
                    "{BIN} pages deployments list --project-name {} --json",
                    quote_arg(name)
                ))
                .in_dir(cwd),
            )
            .await;
        let id = list
            .ok
            .then(|| current_deployment_id(&list.stdout))
            .flatten();
        Some(dashboard_url(&account, name, id.as_deref()))
    }
}

#[async_trait::async_trait]
impl Provider for CloudflareProvider {
    fn id(&self) -> &str {
        "cloudflare"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::CLOUDFLARE
    }

    fn login_command(&self) -> String {
        format!("{BIN} login")
    }

    async fn validate_auth(&self, ctx: &DeployContext, cwd: &Path) -> Result<(), ProviderError> {
        if ctx.settings.test_no_spawn {
            return Ok(());
        }
        let ver = ctx
            .run_retry(Invocation::new(format!("{BIN} --version")).in_dir(cwd))
            .await;
        if !ver.ok {
            return Err(ProviderError::CliMissing {
                provider: "cloudflare".into(),
                message: "Wrangler not found. Install with: npm i -g wrangler".into(),
            });
        }
        let who = ctx
            .run_retry(Invocation::new(format!("{BIN} whoami")).in_dir(cwd))
            .await;
        if !who.ok {
            return Err(ProviderError::Auth {
                provider: "cloudflare".into(),
                message: "Wrangler not logged in. Run: wrangler login".into(),
                login: self.login_command(),
            });
        }
        Ok(())
    }

    fn deploy_plan(&self, req: &DeployRequest) -> Vec<String> {
        let dir = req.publish_dir.as_deref().unwrap_or("dist");
        vec![format!(
            "{BIN} pages deploy {} --project-name {}",
            quote_arg(dir),
            quote_arg(&project_name(req))
        )]
    }

    /// Create the Pages project. An existing project counts as linked.
    async fn link(&self, ctx: &DeployContext, req: &DeployRequest) -> Result<bool, ProviderError> {
        if ctx.settings.test_no_spawn {
            return Ok(false);
        }
        let name = project_name(req);
        let res = ctx
            .run(
                Invocation::new(format!(
                    "{BIN} pages project create {} --production-branch main",
                    quote_arg(&name)
                ))
                .in_dir(&req.cwd),
            )
            .await;
        if res.ok || res.output().to_lowercase().contains("already exists") {
            return Ok(true);
        }
        Err(ProviderError::Command {
            provider: "cloudflare".into(),
            message: format!("Cloudflare project create failed: {}", res.output().trim()),
        })
    }

    async fn deploy(
        &self,
        ctx: &DeployContext,
        req: &DeployRequest,
    ) -> Result<DeployOutcome, DeployFailure> {
        let base = ctx.base("cloudflare", req.target);
        let name = project_name(req);
        let dir = find_output_dir(req)?;
        let inv = Invocation::new(format!(
            "{BIN} pages deploy {} --project-name {}",
            quote_path(&dir),
            quote_arg(&name)
        ))
        .in_dir(&req.cwd)
        .with_timeout(req.timeout)
        .with_idle_timeout(req.idle_timeout);
        let spec = StreamSpec::new("Cloudflare Pages deploy", inv)
            .with_url(extract::pages_dev_url, Source::Any)
            .with_logs(extract::cloudflare_dash_url, Source::Any)
            .show_logs(req.show_logs)
            .print_cmd(req.print_cmd);
        let mut report = drive_stream(ctx, &base, spec).await;

        if !report.ok() {
            report.emit_done(ctx, &base);
            return Err(report.failure("cloudflare", "Cloudflare deploy failed"));
        }
        if report.url.is_none() {
            report.url = Some(format!("https://{name}.pages.dev"));
        }
        if report.logs_url.is_none() {
            let logs = self.resolve_logs_url(ctx, &req.cwd, &name).await;
            report.resolve_logs_url(logs);
        }
        report.emit_done(ctx, &base);
        Ok(DeployOutcome {
            url: report.url,
            logs_url: report.logs_url,
        })
    }

    fn dashboard_fallback(&self, url: &str) -> Option<String> {
        let host = url.trim_start_matches("https://").split('/').next()?;
        let project = host.strip_suffix(".pages.dev")?.rsplit('.').next()?;
        Some(format!(
            "https://dash.cloudflare.com/?to=/:account/pages/view/{project}"
        ))
    }
}
