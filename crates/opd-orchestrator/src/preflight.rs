//! Local build before a deploy, and the checks reported alongside it.

use crate::detect::Detection;
use crate::error::OrchestratorError;
use crate::prompt::Prompt;
use opd_emit::Heartbeat;
use opd_process::Invocation;
use opd_providers::{Capabilities, DeployContext};
use serde::Serialize;
use std::path::Path;
use std::time::Duration;

/// Lines of build output kept for failure reports.
pub const BUILD_TAIL_LINES: usize = 10;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Warn,
    Note,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PreflightCheck {
    pub name: String,
    pub ok: bool,
    pub level: Level,
    pub message: String,
}

impl PreflightCheck {
    fn note(name: &str, ok: bool, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ok,
            level: Level::Note,
            message: message.into(),
        }
    }

    fn warn(name: &str, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ok: false,
            level: Level::Warn,
            message: message.into(),
        }
    }
}

/// Last non-empty lines of `output`, oldest first.
pub fn tail_lines(output: &str, n: usize) -> Vec<String> {
    let mut lines: Vec<String> = output
        .lines()
        .map(str::trim_end)
        .filter(|l| !l.trim().is_empty())
        .rev()
        .take(n)
        .map(str::to_string)
        .collect();
    lines.reverse();
    lines
}

pub struct PreflightInput<'a> {
    pub cwd: &'a Path,
    pub detection: &'a Detection,
    pub capabilities: &'a Capabilities,
    pub no_build: bool,
    pub timeout: Option<Duration>,
}

/// Run the project's build when the provider needs local artifacts.
///
/// Providers that build remotely only get a local build when an
/// interactive user asks for one, and its failure is a warning. For
/// everything else a failed build stops the deploy.
pub async fn run_preflight(
    ctx: &DeployContext,
    prompt: &dyn Prompt,
    input: PreflightInput<'_>,
) -> Result<Vec<PreflightCheck>, OrchestratorError> {
    let mut checks = Vec::new();
    let has_pkg = input.cwd.join("package.json").is_file();
    checks.push(PreflightCheck::note(
        "package.json",
        has_pkg,
        if has_pkg {
            "found"
        } else {
            "no package.json; nothing to build"
        },
    ));

    let skip = input.no_build
        || !has_pkg
        || ctx.settings.provider_virtual
        || ctx.settings.test_no_spawn
        || !input.capabilities.supports_local_build;
    if skip {
        checks.push(PreflightCheck::note("build", true, "skipped"));
        return Ok(checks);
    }

    let remote = input.capabilities.supports_remote_build;
    if remote {
        let wanted = ctx.emitter.mode().is_interactive()
            && prompt
                .confirm("Run a local build before deploying?", false)
                .await;
        if !wanted {
            checks.push(PreflightCheck::note("build", true, "remote build"));
            return Ok(checks);
        }
    }

    let cmd = input.detection.build_command.clone();
    ctx.emitter.info(&format!("Building: {cmd}"));
    let res = {
        let hb = Heartbeat::start(&ctx.emitter, &ctx.action, "Building", None);
        hb.set_status(&cmd);
        ctx.run(
            Invocation::new(cmd.clone())
                .in_dir(input.cwd)
                .with_timeout(input.timeout),
        )
        .await
    };
    ctx.emitter.clear_status();

    if ctx.is_cancelled() {
        return Err(OrchestratorError::Cancelled { stage: "build" });
    }
    if res.ok {
        checks.push(PreflightCheck::note("build", true, format!("{cmd} succeeded")));
        ctx.emitter.success("Build succeeded");
        return Ok(checks);
    }

    let tail = tail_lines(&ctx.emitter.redact(&res.output()), BUILD_TAIL_LINES);
    let message = format!("Build failed: {cmd}");
    if remote {
        ctx.emitter.warn(&format!("{message} (continuing with remote build)"));
        checks.push(PreflightCheck::warn("build", message));
        return Ok(checks);
    }
    Err(OrchestratorError::Build { message, tail })
}
