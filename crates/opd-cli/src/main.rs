mod cmd_deploy;
mod cmd_providers;

use clap::{Args, Parser, Subcommand};
use opd_core::settings::Settings;
use opd_core::{OutputMode, Target};
use opd_emit::{Emitter, EmitterOptions};
use std::io::IsTerminal;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "opendeploy",
    version,
    about = "Deploy web apps with one command and one machine-readable result"
)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Guided deploy: detect, pick a provider, sync env, build and deploy
    Start {
        /// Provider id (vercel, cloudflare, github). Asked for when omitted.
        #[arg(long)]
        provider: Option<String>,
        /// App directory relative to the current directory
        #[arg(long)]
        path: Option<String>,
        /// Do not offer to store these selections in opendeploy.config.json
        #[arg(long)]
        no_save_defaults: bool,
        #[command(flatten)]
        deploy: DeployArgs,
    },
    /// Single-command deploy to a named provider
    Up {
        /// Provider id
        provider: String,
        /// App directory (repeat to deploy several in one run)
        #[arg(long = "path")]
        paths: Vec<String>,
        /// Parallel deploys when more than one --path is given
        #[arg(long, default_value_t = 2)]
        concurrency: usize,
        #[command(flatten)]
        deploy: DeployArgs,
    },
    /// List registered providers and their capabilities as JSON
    Providers {
        #[command(flatten)]
        output: OutputArgs,
    },
}

#[derive(Args, Debug, Clone, Default)]
pub(crate) struct OutputArgs {
    /// Print one JSON summary object
    #[arg(long)]
    pub json: bool,
    /// Print every event as one JSON object per line
    #[arg(long)]
    pub ndjson: bool,
    /// Print only the final summary object
    #[arg(long)]
    pub summary_only: bool,
    /// Mirror JSON objects into this file
    #[arg(long)]
    pub json_file: Option<PathBuf>,
    /// Mirror NDJSON events into this file
    #[arg(long)]
    pub ndjson_file: Option<PathBuf>,
}

#[derive(Args, Debug, Clone, Default)]
pub(crate) struct DeployArgs {
    /// Deploy target: prod or preview
    #[arg(long = "env", value_name = "prod|preview")]
    pub target: Option<Target>,
    #[arg(long)]
    pub project: Option<String>,
    #[arg(long)]
    pub org: Option<String>,
    /// Domain to point at the new deployment
    #[arg(long)]
    pub alias: Option<String>,
    /// Push variables from the env file to the provider first
    #[arg(long)]
    pub sync_env: bool,
    #[arg(long)]
    pub env_file: Option<String>,
    /// Only sync keys matching these globs
    #[arg(long, value_delimiter = ',')]
    pub only: Vec<String>,
    /// Skip keys matching these globs
    #[arg(long, value_delimiter = ',')]
    pub ignore: Vec<String>,
    /// Print the command plan without running anything
    #[arg(long)]
    pub dry_run: bool,
    #[arg(long)]
    pub no_build: bool,
    /// CI mode: no prompts, hard and idle timeouts, soft-fail exit
    #[arg(long)]
    pub ci: bool,
    /// Exit 0 even when the deploy fails
    #[arg(long)]
    pub soft_fail: bool,
    /// Hard timeout for the deploy stream, in seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,
    /// Stop the deploy stream after this many silent seconds
    #[arg(long, value_name = "SECS")]
    pub idle_timeout: Option<u64>,
    /// Echo provider output lines
    #[arg(long)]
    pub show_logs: bool,
    /// Print each provider command before it runs
    #[arg(long)]
    pub print_cmd: bool,
    #[command(flatten)]
    pub output: OutputArgs,
}

/// Logging goes to stderr so stdout stays clean for JSON consumers.
fn init_tracing(mode: OutputMode) {
    let filter = tracing_subscriber::EnvFilter::try_from_env("OPD_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(!mode.is_machine() && std::io::stderr().is_terminal())
        .try_init();
}

pub(crate) fn build_emitter(settings: &Settings, mode: OutputMode, output: &OutputArgs) -> Emitter {
    let mut opts = EmitterOptions::from_settings(settings, mode);
    opts.color = mode.is_interactive()
        && std::io::stderr().is_terminal()
        && std::env::var_os("NO_COLOR").is_none();
    if output.json_file.is_some() {
        opts.json_file = output.json_file.clone();
    }
    if output.ndjson_file.is_some() {
        opts.ndjson_file = output.ndjson_file.clone();
    }
    Emitter::new(opts)
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = Settings::from_env();
    let root = std::env::current_dir()?;

    let code = match cli.cmd {
        Command::Start {
            provider,
            path,
            no_save_defaults,
            deploy,
        } => {
            let mode = settings.output_mode(deploy.output.json, deploy.output.ndjson, deploy.output.summary_only);
            init_tracing(mode);
            cmd_deploy::start(settings, mode, root, provider, path, no_save_defaults, deploy)?
        }
        Command::Up {
            provider,
            paths,
            concurrency,
            deploy,
        } => {
            let mode = settings.output_mode(deploy.output.json, deploy.output.ndjson, deploy.output.summary_only);
            init_tracing(mode);
            cmd_deploy::up(settings, mode, root, provider, paths, concurrency, deploy)?
        }
        Command::Providers { output } => {
            let mode = settings.output_mode(true, output.ndjson, output.summary_only);
            init_tracing(mode);
            cmd_providers::execute(&settings, mode, &output)
        }
    };
    std::process::exit(code);
}
