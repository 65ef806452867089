use crate::{build_emitter, DeployArgs};
use anyhow::Result;
use opd_core::settings::Settings;
use opd_core::OutputMode;
use opd_orchestrator::{run_batch, run_start, run_up, AppContext, DeployOptions, StdinPrompt};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn deploy_options(root: PathBuf, provider: Option<String>, path: Option<String>, args: DeployArgs) -> DeployOptions {
    DeployOptions {
        provider,
        target: args.target,
        root,
        path,
        project: args.project,
        org: args.org,
        alias: args.alias,
        sync_env: args.sync_env,
        env_file: args.env_file,
        only: args.only,
        ignore: args.ignore,
        dry_run: args.dry_run,
        no_build: args.no_build,
        ci: args.ci,
        json: args.output.json,
        soft_fail: args.soft_fail,
        timeout: args.timeout.map(Duration::from_secs),
        idle_timeout: args.idle_timeout.map(Duration::from_secs),
        show_logs: args.show_logs,
        print_cmd: args.print_cmd,
        no_save_defaults: false,
    }
}

fn app_context(settings: Settings, mode: OutputMode, args: &DeployArgs) -> Result<AppContext> {
    let emitter = Arc::new(build_emitter(&settings, mode, &args.output));
    let runner = opd_process::runner_from_settings(&settings)?;
    let app = AppContext::new(Arc::new(settings), emitter, runner);
    let can_ask = mode.is_interactive() && !args.ci && std::io::stdin().is_terminal();
    Ok(if can_ask {
        app.with_prompt(Arc::new(StdinPrompt))
    } else {
        app
    })
}

fn ctrlc_cancel(cancel: CancellationToken) {
    let _ = ctrlc::set_handler(move || {
        cancel.cancel();
    });
}

/// Run `fut` on a fresh runtime with Ctrl-C wired to the app's token.
fn block_on_app<F>(app: &AppContext, fut: F) -> Result<i32>
where
    F: std::future::Future<Output = i32>,
{
    ctrlc_cancel(app.cancel.clone());
    let rt = tokio::runtime::Runtime::new()?;
    let code = rt.block_on(fut);
    app.teardown();
    Ok(code)
}

/// `opendeploy start`
pub fn start(
    settings: Settings,
    mode: OutputMode,
    root: PathBuf,
    provider: Option<String>,
    path: Option<String>,
    no_save_defaults: bool,
    args: DeployArgs,
) -> Result<i32> {
    let app = app_context(settings, mode, &args)?;
    let opts = DeployOptions {
        no_save_defaults,
        ..deploy_options(root, provider, path, args)
    };
    tracing::debug!(root = %opts.root.display(), "start");
    block_on_app(&app, async { run_start(&app, opts).await.exit_code })
}

/// `opendeploy up <provider>`; more than one `--path` deploys them as a batch.
pub fn up(
    settings: Settings,
    mode: OutputMode,
    root: PathBuf,
    provider: String,
    mut paths: Vec<String>,
    concurrency: usize,
    args: DeployArgs,
) -> Result<i32> {
    let app = app_context(settings, mode, &args)?;
    if paths.len() > 1 {
        let opts = deploy_options(root, Some(provider), None, args);
        tracing::debug!(projects = paths.len(), concurrency, "batch up");
        return block_on_app(&app, async {
            run_batch(&app, opts, paths, concurrency).await.exit_code
        });
    }
    let opts = deploy_options(root, Some(provider), paths.pop(), args);
    block_on_app(&app, async { run_up(&app, opts).await.exit_code })
}
