//! Pushing `.env` values to the provider.

use anyhow::{bail, Context};
use globset::{Glob, GlobSet, GlobSetBuilder};
use opd_core::Target;
use opd_process::{quote_arg, Invocation};
use opd_providers::{cloudflare, DeployContext, DeployRequest};
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct EnvSyncRequest {
    pub provider: String,
    pub cwd: PathBuf,
    pub file: PathBuf,
    pub target: Target,
    pub project: Option<String>,
    pub org: Option<String>,
    pub only: Vec<String>,
    pub ignore: Vec<String>,
}

#[async_trait::async_trait]
pub trait EnvSync: Send + Sync {
    /// Returns how many keys were pushed.
    async fn sync(&self, ctx: &DeployContext, req: &EnvSyncRequest) -> anyhow::Result<usize>;
}

/// `only`/`ignore` glob lists over key names. Empty `only` admits everything.
#[derive(Debug)]
pub struct KeyFilter {
    only: Option<GlobSet>,
    ignore: GlobSet,
}

fn build_set(patterns: &[String]) -> anyhow::Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for p in patterns {
        builder.add(Glob::new(p).with_context(|| format!("invalid key pattern: {p}"))?);
    }
    Ok(builder.build()?)
}

impl KeyFilter {
    pub fn new(only: &[String], ignore: &[String]) -> anyhow::Result<Self> {
        Ok(Self {
            only: if only.is_empty() {
                None
            } else {
                Some(build_set(only)?)
            },
            ignore: build_set(ignore)?,
        })
    }

    pub fn admits(&self, key: &str) -> bool {
        self.only.as_ref().map_or(true, |s| s.is_match(key)) && !self.ignore.is_match(key)
    }
}

/// Filtered key/value pairs from the request's env file.
pub fn load_pairs(req: &EnvSyncRequest) -> anyhow::Result<BTreeMap<String, String>> {
    let Some(vars) = opd_redact::read_dotenv(&req.file) else {
        bail!("env file not found: {}", req.file.display());
    };
    let filter = KeyFilter::new(&req.only, &req.ignore)?;
    Ok(vars.into_iter().filter(|(k, _)| filter.admits(k)).collect())
}

/// Shells out to the provider CLI, one key at a time.
#[derive(Debug, Default)]
pub struct CliEnvSync;

impl CliEnvSync {
    async fn vercel(
        ctx: &DeployContext,
        req: &EnvSyncRequest,
        pairs: &BTreeMap<String, String>,
    ) -> anyhow::Result<()> {
        let bin = ctx.settings.vercel_bin.as_deref().unwrap_or("vercel");
        let env = req.target.context_name();
        for (key, value) in pairs {
            // Removal fails harmlessly when the key is new.
            ctx.run_retry(Invocation::new(format!("{bin} env rm {} {env} -y", quote_arg(key))).in_dir(&req.cwd))
                .await;
            let add = ctx
                .run_retry(
                    Invocation::new(format!("{bin} env add {} {env}", quote_arg(key)))
                        .in_dir(&req.cwd)
                        .with_stdin(value.clone()),
                )
                .await;
            if !add.ok {
                bail!("vercel env add {key} failed: {}", add.output().trim());
            }
        }
        Ok(())
    }

    async fn cloudflare(
        ctx: &DeployContext,
        req: &EnvSyncRequest,
        pairs: &BTreeMap<String, String>,
    ) -> anyhow::Result<()> {
        let mut dreq = DeployRequest::new(&req.cwd, req.target);
        dreq.project = req.project.clone();
        let name = cloudflare::project_name(&dreq);
        for (key, value) in pairs {
            let put = ctx
                .run_retry(
                    Invocation::new(format!(
                        "wrangler pages secret put {} --project-name {}",
                        quote_arg(key),
                        quote_arg(&name)
                    ))
                    .in_dir(&req.cwd)
                    .with_stdin(value.clone()),
                )
                .await;
            if !put.ok {
                bail!("wrangler secret put {key} failed: {}", put.output().trim());
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl EnvSync for CliEnvSync {
    async fn sync(&self, ctx: &DeployContext, req: &EnvSyncRequest) -> anyhow::Result<usize> {
        let pairs = load_pairs(req)?;
        match req.provider.as_str() {
            p if p.ends_with("-virtual") => {}
            "vercel" => Self::vercel(ctx, req, &pairs).await?,
            "cloudflare" => Self::cloudflare(ctx, req, &pairs).await?,
            "github" => bail!("env sync is not supported for GitHub Pages"),
            other => bail!("env sync is not supported for {other}"),
        }
        tracing::debug!(provider = %req.provider, count = pairs.len(), "env synced");
        Ok(pairs.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opd_core::settings::Settings;
    use opd_core::OutputMode;
    use opd_emit::{Emitter, EmitterOptions};
    use opd_process::{Fixture, ReplayRunner};
    use std::sync::Arc;

    fn request(dir: &std::path::Path, provider: &str) -> EnvSyncRequest {
        EnvSyncRequest {
            provider: provider.into(),
            cwd: dir.to_path_buf(),
            file: dir.join(".env"),
            target: Target::Production,
            project: None,
            org: None,
            only: Vec::new(),
            ignore: Vec::new(),
        }
    }

    fn ctx(replay: Arc<ReplayRunner>) -> DeployContext {
        let (emitter, _) = Emitter::capture(EmitterOptions::new(OutputMode::Ndjson));
        DeployContext::new(Arc::new(emitter), replay, Arc::new(Settings::default()), "up")
    }

    #[test]
    fn filter_globs() {
        let f = KeyFilter::new(&["NEXT_*".into(), "API_KEY".into()], &["*_DEBUG".into()]).unwrap();
        assert!(f.admits("NEXT_PUBLIC_URL"));
        assert!(f.admits("API_KEY"));
        assert!(!f.admits("NEXT_DEBUG"));
        assert!(!f.admits("DB_URL"));
        assert!(KeyFilter::new(&[], &[]).unwrap().admits("ANY"));
        assert!(KeyFilter::new(&["[".into()], &[]).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn vercel_rm_then_add_with_stdin() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".env"), "API_KEY=s3cret\nNEXT_PUBLIC_X=1\n").unwrap();
        let replay = Arc::new(ReplayRunner::new(vec![
            Fixture::run("vercel env rm *", false, Some(1), "", "not found"),
            Fixture::run("vercel env add *", true, Some(0), "Added", ""),
        ]));
        let mut req = request(dir.path(), "vercel");
        req.ignore = vec!["NEXT_PUBLIC_*".into()];
        let n = CliEnvSync.sync(&ctx(replay.clone()), &req).await.unwrap();
        assert_eq!(n, 1);
        let calls = replay.calls();
        // The failed rm is retried before moving on.
        assert!(calls[..calls.len() - 1]
            .iter()
            .all(|c| c.cmd == "vercel env rm API_KEY production -y"));
        let add = calls.last().unwrap();
        assert_eq!(add.cmd, "vercel env add API_KEY production");
        assert_eq!(add.stdin.as_deref(), Some("s3cret"));
    }

    #[tokio::test]
    async fn cloudflare_uses_project_name() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".env"), "TOKEN=abc\n").unwrap();
        std::fs::write(dir.path().join("wrangler.toml"), "name = \"shop\"\n").unwrap();
        let replay = Arc::new(ReplayRunner::new(vec![Fixture::run(
            "wrangler pages secret put TOKEN --project-name shop",
            true,
            Some(0),
            "",
            "",
        )]));
        let n = CliEnvSync
            .sync(&ctx(replay.clone()), &request(dir.path(), "cloudflare"))
            .await
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(replay.calls().len(), 1);
    }

    #[tokio::test]
    async fn github_and_missing_file_fail() {
        let dir = tempfile::tempdir().unwrap();
        let replay = Arc::new(ReplayRunner::new(vec![]));
        let err = CliEnvSync
            .sync(&ctx(replay.clone()), &request(dir.path(), "github"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("env file not found"));

        std::fs::write(dir.path().join(".env"), "A=1\n").unwrap();
        let err = CliEnvSync
            .sync(&ctx(replay.clone()), &request(dir.path(), "github"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not supported"));
        assert!(replay.calls().is_empty());
    }

    #[tokio::test]
    async fn virtual_counts_without_spawning() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".env"), "A=1\nB=2\n").unwrap();
        let replay = Arc::new(ReplayRunner::new(vec![]));
        let n = CliEnvSync
            .sync(&ctx(replay.clone()), &request(dir.path(), "vercel-virtual"))
            .await
            .unwrap();
        assert_eq!(n, 2);
        assert!(replay.calls().is_empty());
    }
}
