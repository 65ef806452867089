//! Known-bad output signatures and the remediation shown for each.

use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HintKind {
    Config,
    Env,
    Dependency,
    Platform,
    Build,
    Runtime,
}

pub struct HintRule {
    pub id: &'static str,
    /// Only applies to this provider's output when set.
    pub provider: Option<&'static str>,
    pub kind: HintKind,
    pub message: &'static str,
    pattern: &'static str,
}

const RULES: &[HintRule] = &[
    HintRule {
        id: "pnpm-approve-builds",
        provider: None,
        kind: HintKind::Dependency,
        message: "pnpm v9 blocked postinstall scripts (e.g., @tailwindcss/oxide, esbuild). Run \"pnpm approve-builds\" or add { \"pnpm\": { \"trustedDependencies\": [\"@tailwindcss/oxide\",\"esbuild\"] } } to package.json.",
        pattern: r"(?i)Ignored build scripts:",
    },
    HintRule {
        id: "env-missing",
        provider: None,
        kind: HintKind::Env,
        message: "Missing environment variables. Consider: opendeploy start --sync-env, or add them in the provider dashboard.",
        pattern: r"(?i)(Missing required (environment )?variables?|not found in process\.env|Environment variable .+ is required|ReferenceError: process is not defined)",
    },
    HintRule {
        id: "fs-watch-limit",
        provider: None,
        kind: HintKind::Platform,
        message: "File watcher limit reached. Increase inotify/fs.watch limits or run builds in CI/Linux/WSL.",
        pattern: r"(?i)ENOSPC: System limit for number of file watchers reached|inotify watch limits reached",
    },
    HintRule {
        id: "cf-wrangler-output-dir",
        provider: Some("cloudflare"),
        kind: HintKind::Config,
        message: "wrangler.toml: set pages_build_output_dir = \".vercel/output/static\" for Next on Pages.",
        pattern: r"(?i)pages_build_output_dir\s+.*not found|Cannot find output directory",
    },
    HintRule {
        id: "cf-nodejs-compat",
        provider: Some("cloudflare"),
        kind: HintKind::Runtime,
        message: "wrangler.toml: add compatibility_flags = [\"nodejs_compat\"].",
        pattern: r"(?i)ReferenceError:\s*require\s+is\s+not\s+defined|node:.* module not found",
    },
    HintRule {
        id: "gh-next-export-missing",
        provider: Some("github"),
        kind: HintKind::Build,
        message: "Next.js on GitHub Pages: enable static export (next.config: { output: \"export\" }) and build to out/.",
        pattern: r"(?i)No static files found in 'out'|ENOENT.*out/_next/static",
    },
];

static COMPILED: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    RULES
        .iter()
        .map(|r| Regex::new(r.pattern).unwrap())
        .collect()
});

/// Rules whose pattern matches `text` and whose scope admits `provider`.
pub fn matching(provider: &str, text: &str) -> Vec<&'static HintRule> {
    RULES
        .iter()
        .zip(COMPILED.iter())
        .filter(|(rule, _)| rule.provider.is_none_or(|p| p == provider))
        .filter(|(_, re)| re.is_match(text))
        .map(|(rule, _)| rule)
        .collect()
}
