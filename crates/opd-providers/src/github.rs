use crate::capabilities::Capabilities;
use crate::driver::{drive_stream, StreamSpec};
use crate::error::{DeployFailure, ProviderError};
use crate::extract;
use crate::provider::{find_artifact_dir, DeployContext, DeployOutcome, DeployRequest, Provider};
use opd_process::{quote_arg, quote_path, Invocation};
use serde_json::json;
use std::path::{Path, PathBuf};

const ARTIFACT_CANDIDATES: &[&str] = &["out", "dist", "build", "public"];

const ORIGIN_HINT: &str =
    "Published, but the Pages URL is unknown: `git remote get-url origin` gave no GitHub repository";

#[derive(Debug, Default)]
pub struct GithubProvider;

impl GithubProvider {
    pub fn new() -> Self {
        Self
    }

    async fn gh_pages_bin(ctx: &DeployContext, cwd: &Path) -> &'static str {
        let direct = ctx
            .run(Invocation::new("gh-pages --help").in_dir(cwd))
            .await;
        if direct.ok {
            "gh-pages"
        } else {
            "npx -y gh-pages"
        }
    }

    async fn origin(ctx: &DeployContext, cwd: &Path) -> Option<(String, String)> {
        let res = ctx
            .run(Invocation::new("git remote get-url origin").in_dir(cwd))
            .await;
        if !res.ok {
            return None;
        }
        extract::parse_git_remote(&res.stdout)
    }
}

pub fn pages_url(owner: &str, repo: &str) -> String {
    format!("https://{owner}.github.io/{repo}/")
}

pub fn deployments_url(owner: &str, repo: &str) -> String {
    format!("https://github.com/{owner}/{repo}/deployments")
}

/// Create `<dir>/.nojekyll` when missing. Returns whether it was written.
pub fn ensure_nojekyll(dir: &Path) -> std::io::Result<bool> {
    let marker = dir.join(".nojekyll");
    if marker.exists() {
        return Ok(false);
    }
    std::fs::write(marker, "")?;
    Ok(true)
}

fn output_dir(req: &DeployRequest) -> Result<PathBuf, DeployFailure> {
    find_artifact_dir(req, "github", ARTIFACT_CANDIDATES)
}

#[async_trait::async_trait]
impl Provider for GithubProvider {
    fn id(&self) -> &str {
        "github"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::GITHUB
    }

    fn login_command(&self) -> String {
        "gh auth login".to_string()
    }

    /// gh-pages pushes with the local git credentials; all that can be
    /// checked up front is git itself and an `origin` remote.
    async fn validate_auth(&self, ctx: &DeployContext, cwd: &Path) -> Result<(), ProviderError> {
        if ctx.settings.test_no_spawn {
            return Ok(());
        }
        let git = ctx
            .run_retry(Invocation::new("git --version").in_dir(cwd))
            .await;
        if !git.ok {
            return Err(ProviderError::CliMissing {
                provider: "github".into(),
                message: "git not found. Install git to deploy to GitHub Pages".into(),
            });
        }
        let origin = ctx
            .run_retry(Invocation::new("git remote get-url origin").in_dir(cwd))
            .await;
        if !origin.ok {
            return Err(ProviderError::Command {
                provider: "github".into(),
                message: "No git remote named origin. Run: git remote add origin <url>".into(),
            });
        }
        Ok(())
    }

    fn deploy_plan(&self, req: &DeployRequest) -> Vec<String> {
        let dir = req.publish_dir.as_deref().unwrap_or("dist");
        vec![format!("gh-pages -d {} --dotfiles", quote_arg(dir))]
    }

    async fn deploy(
        &self,
        ctx: &DeployContext,
        req: &DeployRequest,
    ) -> Result<DeployOutcome, DeployFailure> {
        let base = ctx.base("github", req.target);
        let dir = output_dir(req)?;
        if let Err(e) = ensure_nojekyll(&dir) {
            tracing::warn!(dir = %dir.display(), error = %e, "could not write .nojekyll");
        }
        let bin = Self::gh_pages_bin(ctx, &req.cwd).await;
        let inv = Invocation::new(format!("{bin} -d {} --dotfiles", quote_path(&dir)))
            .in_dir(&req.cwd)
            .with_timeout(req.timeout)
            .with_idle_timeout(req.idle_timeout);
        let spec = StreamSpec::new("GitHub Pages deploy", inv)
            .show_logs(req.show_logs)
            .print_cmd(req.print_cmd);
        let mut report = drive_stream(ctx, &base, spec).await;

        match Self::origin(ctx, &req.cwd).await {
            Some((owner, repo)) => {
                report.url = Some(pages_url(&owner, &repo));
                report.resolve_logs_url(Some(deployments_url(&owner, &repo)));
            }
            None if report.ok() => {
                tracing::warn!(cwd = %req.cwd.display(), "origin remote did not resolve to a GitHub repo");
                ctx.emitter.event(&base.event(
                    "hint",
                    json!({ "id": "github-origin-url", "kind": "url", "message": ORIGIN_HINT }),
                ));
                ctx.emitter.warn(ORIGIN_HINT);
            }
            None => {}
        }
        report.emit_done(ctx, &base);
        if !report.ok() {
            return Err(report.failure("github", "GitHub Pages deploy failed"));
        }
        Ok(DeployOutcome {
            url: report.url,
            logs_url: report.logs_url,
        })
    }

    fn dashboard_fallback(&self, url: &str) -> Option<String> {
        let rest = url.strip_prefix("https://")?;
        let (host, path) = rest.split_once('/')?;
        let owner = host.strip_suffix(".github.io")?;
        let repo = path.trim_matches('/').split('/').next().filter(|r| !r.is_empty())?;
        Some(deployments_url(owner, repo))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opd_core::settings::Settings;
    use opd_core::{OutputMode, Target};
    use opd_emit::{Emitter, EmitterOptions};
    use opd_process::{ChunkRecord, Fixture, ReplayRunner};
    use std::sync::Arc;

    fn ctx(fixtures: Vec<Fixture>) -> (DeployContext, opd_emit::Capture, Arc<ReplayRunner>) {
        let (emitter, cap) = Emitter::capture(EmitterOptions::new(OutputMode::Ndjson));
        let replay = Arc::new(ReplayRunner::new(fixtures));
        let ctx = DeployContext::new(
            Arc::new(emitter),
            replay.clone(),
            Arc::new(Settings::default()),
            "up",
        );
        (ctx, cap, replay)
    }

    #[test]
    fn nojekyll_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ensure_nojekyll(dir.path()).unwrap());
        assert!(!ensure_nojekyll(dir.path()).unwrap());
        assert!(dir.path().join(".nojekyll").is_file());
    }

    #[test]
    fn fallback_from_pages_url() {
        assert_eq!(
            GithubProvider
                .dashboard_fallback("https://acme.github.io/site/")
                .as_deref(),
            Some("https://github.com/acme/site/deployments")
        );
        assert_eq!(GithubProvider.dashboard_fallback("https://acme.github.io/"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn deploy_uses_npx_fallback_and_git_remote() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("out")).unwrap();
        let out_dir = dir.path().join("out");
        let (ctx, cap, replay) = ctx(vec![
            Fixture::run("gh-pages --help", false, Some(127), "", "not found"),
            Fixture::stream(
                format!("npx -y gh-pages -d {} --dotfiles", out_dir.display()),
                vec![ChunkRecord::out("Published\n")],
                0,
            ),
            Fixture::run(
                "git remote get-url origin",
                true,
                Some(0),
                "git@github.com:acme/site.git\n",
                "",
            ),
        ]);
        let req = DeployRequest::new(dir.path(), Target::Production);
        let out = GithubProvider.deploy(&ctx, &req).await.unwrap();
        assert_eq!(out.url.as_deref(), Some("https://acme.github.io/site/"));
        assert_eq!(
            out.logs_url.as_deref(),
            Some("https://github.com/acme/site/deployments")
        );
        assert!(out_dir.join(".nojekyll").is_file());
        assert_eq!(replay.calls().len(), 3);
        assert_eq!(cap.events("done")[0]["url"], "https://acme.github.io/site/");
    }

    #[tokio::test(start_paused = true)]
    async fn publish_dir_with_a_space_is_one_argument() {
        let dir = tempfile::tempdir().unwrap();
        let app = dir.path().join("My App");
        let out_dir = app.join("out");
        std::fs::create_dir_all(&out_dir).unwrap();
        let (ctx, _cap, replay) = ctx(vec![
            Fixture::run("gh-pages --help", true, Some(0), "Usage: gh-pages", ""),
            Fixture::stream(
                format!("gh-pages -d '{}' --dotfiles", out_dir.display()),
                vec![ChunkRecord::out("Published\n")],
                0,
            ),
            Fixture::run(
                "git remote get-url origin",
                true,
                Some(0),
                "https://github.com/acme/site.git\n",
                "",
            ),
        ]);
        let req = DeployRequest::new(&app, Target::Production);
        let out = GithubProvider.deploy(&ctx, &req).await.unwrap();
        assert_eq!(out.url.as_deref(), Some("https://acme.github.io/site/"));
        let publish = &replay.calls()[1];
        assert!(publish.cmd.ends_with("My App/out' --dotfiles"), "{}", publish.cmd);
    }

    #[tokio::test(start_paused = true)]
    async fn unresolved_origin_after_publish_emits_a_hint() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("dist")).unwrap();
        let dist = dir.path().join("dist");
        let (ctx, cap, _) = ctx(vec![
            Fixture::run("gh-pages --help", true, Some(0), "Usage: gh-pages", ""),
            Fixture::stream(
                format!("gh-pages -d {} --dotfiles", dist.display()),
                vec![ChunkRecord::out("Published\n")],
                0,
            ),
            Fixture::run("git remote get-url origin", false, Some(2), "", "error: No such remote 'origin'"),
        ]);
        let req = DeployRequest::new(dir.path(), Target::Production);
        let out = GithubProvider.deploy(&ctx, &req).await.unwrap();
        assert_eq!(out.url, None);
        let hints = cap.events("hint");
        assert_eq!(hints.len(), 1);
        assert_eq!(hints[0]["id"], "github-origin-url");
        assert!(hints[0]["message"].as_str().unwrap().contains("git remote get-url origin"));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_publish_emits_done_then_errors() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("dist")).unwrap();
        let dist = dir.path().join("dist");
        let (ctx, cap, _) = ctx(vec![
            Fixture::run("gh-pages --help", true, Some(0), "Usage: gh-pages", ""),
            Fixture::stream(
                format!("gh-pages -d {} --dotfiles", dist.display()),
                vec![ChunkRecord::err("fatal: could not read Username\n")],
                1,
            ),
            Fixture::run("git remote get-url origin", false, Some(2), "", "no such remote"),
        ]);
        let req = DeployRequest::new(dir.path(), Target::Production);
        let err = GithubProvider.deploy(&ctx, &req).await.unwrap_err();
        assert_eq!(err.message, "GitHub Pages deploy failed");
        assert_eq!(err.error_log_tail, ["fatal: could not read Username"]);
        let done = cap.events("done");
        assert_eq!(done.len(), 1);
        assert_eq!(done[0]["ok"], false);
    }
}
