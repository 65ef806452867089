use crate::capabilities::Capabilities;
use crate::driver::{drive_stream, Source, StreamReport, StreamSpec};
use crate::error::{DeployFailure, ProviderError};
use crate::extract;
use crate::provider::{DeployContext, DeployOutcome, DeployRequest, Provider};
use opd_core::Target;
use opd_process::{quote_arg, Invocation};
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use std::path::{Path, PathBuf};

const NO_SPAWN_URL: &str = "https://example-preview.vercel.app";
const NO_SPAWN_LOGS_URL: &str = "https://vercel.com/acme/app/inspect/dep_123";

#[derive(Debug, Default)]
pub struct VercelProvider;

impl VercelProvider {
    pub fn new() -> Self {
        Self
    }

    fn bin(ctx: &DeployContext) -> &str {
        ctx.settings
            .vercel_bin
            .as_deref()
            .filter(|b| !b.trim().is_empty())
            .unwrap_or("vercel")
    }

    fn deploy_command(bin: &str, target: Target) -> String {
        match target {
            Target::Production => format!("{bin} deploy --prod --yes"),
            Target::Preview => format!("{bin} deploy --yes"),
        }
    }

    fn link_command(bin: &str, req: &DeployRequest) -> Option<String> {
        if req.project.is_none() && req.org.is_none() {
            return None;
        }
        let mut cmd = format!("{bin} link --yes");
        if let Some(p) = &req.project {
            cmd.push_str(&format!(" --project {}", quote_arg(p)));
        }
        if let Some(o) = &req.org {
            cmd.push_str(&format!(" --org {}", quote_arg(o)));
        }
        Some(cmd)
    }
}

/// Whether `dir` has been linked to a Vercel project.
pub fn is_linked(dir: &Path) -> bool {
    dir.join(".vercel").join("project.json").is_file()
}

/// The directory Vercel commands run in: the app dir when linked, else a
/// linked repo root, else the app dir.
pub fn run_cwd(req: &DeployRequest) -> PathBuf {
    if !is_linked(&req.cwd) && is_linked(&req.root) {
        req.root.clone()
    } else {
        req.cwd.clone()
    }
}

#[async_trait::async_trait]
impl Provider for VercelProvider {
    fn id(&self) -> &str {
        "vercel"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::VERCEL
    }

    fn login_command(&self) -> String {
        "vercel login".to_string()
    }

    async fn validate_auth(&self, ctx: &DeployContext, cwd: &Path) -> Result<(), ProviderError> {
        if ctx.settings.test_no_spawn {
            return Ok(());
        }
        let bin = Self::bin(ctx);
        let ver = ctx
            .run_retry(Invocation::new(format!("{bin} --version")).in_dir(cwd))
            .await;
        if !ver.ok {
            return Err(ProviderError::CliMissing {
                provider: "vercel".into(),
                message: "Vercel CLI not found. Install from https://vercel.com/cli or npm i -g vercel"
                    .into(),
            });
        }
        let who = ctx
            .run_retry(Invocation::new(format!("{bin} whoami")).in_dir(cwd))
            .await;
        if !who.ok {
            return Err(ProviderError::Auth {
                provider: "vercel".into(),
                message: "Vercel not logged in. Run: vercel login".into(),
                login: self.login_command(),
            });
        }
        Ok(())
    }

    fn deploy_plan(&self, req: &DeployRequest) -> Vec<String> {
        let bin = "vercel";
        let mut plan = Vec::new();
        if !is_linked(&req.cwd) {
            plan.extend(Self::link_command(bin, req));
        }
        plan.push(Self::deploy_command(bin, req.target));
        if let Some(alias) = &req.alias {
            plan.push(format!("{bin} alias set <deployment-url> {}", quote_arg(alias)));
        }
        plan
    }

    async fn link(&self, ctx: &DeployContext, req: &DeployRequest) -> Result<bool, ProviderError> {
        if ctx.settings.test_no_spawn || is_linked(&req.cwd) {
            return Ok(false);
        }
        let Some(cmd) = Self::link_command(Self::bin(ctx), req) else {
            return Ok(false);
        };
        let res = ctx.run_retry(Invocation::new(cmd).in_dir(&req.cwd)).await;
        if !res.ok {
            return Err(ProviderError::Command {
                provider: "vercel".into(),
                message: format!("Vercel link failed: {}", res.output().trim()),
            });
        }
        Ok(true)
    }

    async fn deploy(
        &self,
        ctx: &DeployContext,
        req: &DeployRequest,
    ) -> Result<DeployOutcome, DeployFailure> {
        let base = ctx.base("vercel", req.target);
        if ctx.settings.test_no_spawn {
            let mut report =
                StreamReport::ready(Some(NO_SPAWN_URL.into()), Some(NO_SPAWN_LOGS_URL.into()));
            report.emit_done(ctx, &base);
            return Ok(DeployOutcome {
                url: report.url,
                logs_url: report.logs_url,
            });
        }

        let bin = Self::bin(ctx);
        let cwd = run_cwd(req);
        let inv = Invocation::new(Self::deploy_command(bin, req.target))
            .in_dir(&cwd)
            .with_timeout(req.timeout)
            .with_idle_timeout(req.idle_timeout);
        let spec = StreamSpec::new("Vercel deploy", inv)
            .with_url(extract::vercel_deploy_url, Source::Stdout)
            .with_logs(extract::vercel_inspect_url, Source::Stderr)
            .with_inspect(format!("{bin} inspect"))
            .show_logs(req.show_logs)
            .print_cmd(req.print_cmd);
        let mut report = drive_stream(ctx, &base, spec).await;

        if !report.ok() {
            report.emit_done(ctx, &base);
            return Err(report.failure("vercel", "Vercel deploy failed"));
        }
        if report.logs_url.is_none() {
            if let Some(url) = &report.url {
                let insp = ctx
                    .run(Invocation::new(format!("{bin} inspect {}", quote_arg(url))).in_dir(&cwd))
                    .await;
                if insp.ok {
                    report.resolve_logs_url(extract::vercel_inspect_url(&insp.output()));
                }
            }
        }
        report.emit_done(ctx, &base);
        Ok(DeployOutcome {
            url: report.url,
            logs_url: report.logs_url,
        })
    }

    async fn alias(
        &self,
        ctx: &DeployContext,
        cwd: &Path,
        url: &str,
        alias: &str,
    ) -> Result<Option<String>, ProviderError> {
        if ctx.settings.test_no_spawn {
            return Ok(Some(format!("https://{alias}")));
        }
        let cmd = format!(
            "{} alias set {} {}",
            Self::bin(ctx),
            quote_arg(url),
            quote_arg(alias)
        );
        let res = ctx.run_retry(Invocation::new(cmd).in_dir(cwd)).await;
        if !res.ok {
            return Err(ProviderError::Command {
                provider: "vercel".into(),
                message: format!("Vercel alias failed: {}", res.output().trim()),
            });
        }
        Ok(Some(format!("https://{alias}")))
    }

    fn dashboard_fallback(&self, url: &str) -> Option<String> {
        Some(format!(
            "https://vercel.com/inspect?url={}",
            utf8_percent_encode(url, NON_ALPHANUMERIC)
        ))
    }
}
