//! Named extractors over provider CLI output.
//!
//! Provider CLIs have no structured progress protocol, so every signal is a
//! regex over free text. Each signal gets one function here so the patterns
//! can be tested without any subprocess.

use crate::session::Phase;
use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

static VERCEL_URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"https?://[^\s]+\.vercel\.app").unwrap());
static VERCEL_INSPECT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"https?://[^\s]*vercel\.com[^\s]*").unwrap());
static PAGES_DEV_URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"https://[^\s]+\.pages\.dev[^\s]*").unwrap());
static CLOUDFLARE_DASH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"https://dash\.cloudflare\.com/[^\s]+").unwrap());
static PHASE_QUEUED: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bqueued\b").unwrap());
static PHASE_BUILDING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bbuilding\b").unwrap());
static PHASE_DEPLOYING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(deploying|uploading)\b").unwrap());
static PHASE_READY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(\bproduction:|\bready\b|deployment complete)").unwrap());
static ERROR_LINE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\s*Error:\s+(.+)$").unwrap());
static ACCOUNT_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)account\s*id\s*[:=]\s*([a-z0-9]+)").unwrap());
static WRANGLER_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\bname\s*=\s*"([^"]+)""#).unwrap());
static GIT_HTTPS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^https?://github\.com/(.+?)/(.+?)(?:\.git)?/?$").unwrap());
static GIT_SSH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^git@github\.com:(.+?)/(.+?)(?:\.git)?$").unwrap());
static ANSI: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]").unwrap());

/// Remove terminal escape sequences so anchors like `^Error:` hold even
/// when a CLI ignores `FORCE_COLOR=0`.
pub fn strip_ansi(line: &str) -> std::borrow::Cow<'_, str> {
    ANSI.replace_all(line, "")
}

fn first(re: &Regex, text: &str) -> Option<String> {
    re.find(text)
        .map(|m| m.as_str().trim_end_matches(['.', ',', ')', ']']).to_string())
}

pub fn vercel_deploy_url(text: &str) -> Option<String> {
    first(&VERCEL_URL, text)
}

pub fn vercel_inspect_url(text: &str) -> Option<String> {
    first(&VERCEL_INSPECT, text)
}

pub fn pages_dev_url(text: &str) -> Option<String> {
    first(&PAGES_DEV_URL, text)
}

pub fn cloudflare_dash_url(text: &str) -> Option<String> {
    first(&CLOUDFLARE_DASH, text)
}

/// Phase a log line announces, if any. Ready wins over earlier phases
/// mentioned on the same line.
pub fn phase(line: &str) -> Option<Phase> {
    if PHASE_READY.is_match(line) {
        Some(Phase::Ready)
    } else if PHASE_DEPLOYING.is_match(line) {
        Some(Phase::Deploying)
    } else if PHASE_BUILDING.is_match(line) {
        Some(Phase::Building)
    } else if PHASE_QUEUED.is_match(line) {
        Some(Phase::Queued)
    } else {
        None
    }
}

/// Message of an `Error: ...` line.
pub fn error_line(line: &str) -> Option<String> {
    ERROR_LINE
        .captures(line)
        .map(|c| c[1].trim().to_string())
        .filter(|m| !m.is_empty())
}

/// Upper-cased deployment state from `vercel inspect --json` output.
pub fn inspect_state(json_text: &str) -> Option<String> {
    let val: Value = serde_json::from_str(json_text.trim()).ok()?;
    ["readyState", "state", "status"]
        .iter()
        .find_map(|k| val.get(*k).and_then(Value::as_str))
        .map(str::to_ascii_uppercase)
}

/// Whether an inspect state ends the deployment.
pub fn is_terminal_state(state: &str) -> bool {
    matches!(state, "READY" | "ERROR" | "FAILED" | "CANCELED")
}

pub fn cloudflare_account_id(text: &str) -> Option<String> {
    ACCOUNT_ID.captures(text).map(|c| c[1].to_string())
}

/// Project `name` from `wrangler.toml` text.
pub fn wrangler_project_name(toml_text: &str) -> Option<String> {
    WRANGLER_NAME.captures(toml_text).map(|c| c[1].to_string())
}

/// `(owner, repo)` from a GitHub remote URL in https or ssh form.
pub fn parse_git_remote(remote: &str) -> Option<(String, String)> {
    let remote = remote.trim();
    GIT_HTTPS
        .captures(remote)
        .or_else(|| GIT_SSH.captures(remote))
        .map(|c| (c[1].to_string(), c[2].to_string()))
}

/// Lowercase, `[a-z0-9-]` only, no doubled or edge dashes. Never empty.
pub fn slugify(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for ch in name.to_lowercase().chars() {
        let ch = if ch.is_ascii_lowercase() || ch.is_ascii_digit() {
            ch
        } else {
            '-'
        };
        if ch == '-' && out.ends_with('-') {
            continue;
        }
        out.push(ch);
    }
    let slug = out.trim_matches('-');
    if slug.is_empty() {
        "site".to_string()
    } else {
        slug.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vercel_urls() {
        let line = "✅  Preview: https://app-abc123-acme.vercel.app [2s]";
        assert_eq!(
            vercel_deploy_url(line).as_deref(),
            Some("https://app-abc123-acme.vercel.app")
        );
        let inspect = "🔍  Inspect: https://vercel.com/acme/app/9xYz [1s]";
        assert_eq!(
            vercel_inspect_url(inspect).as_deref(),
            Some("https://vercel.com/acme/app/9xYz")
        );
        assert_eq!(vercel_deploy_url("no url here"), None);
    }

    #[test]
    fn phases() {
        assert_eq!(phase("Queued"), Some(Phase::Queued));
        assert_eq!(phase("Building..."), Some(Phase::Building));
        assert_eq!(phase("Uploading [====] 3/3"), Some(Phase::Deploying));
        assert_eq!(phase("Production: https://x.vercel.app"), Some(Phase::Ready));
        assert_eq!(phase("Build is Ready after building"), Some(Phase::Ready));
        assert_eq!(phase("rebuilding cache"), None);
    }

    #[test]
    fn error_lines() {
        assert_eq!(
            error_line("Error: Command \"npm run build\" exited with 1").as_deref(),
            Some("Command \"npm run build\" exited with 1")
        );
        assert_eq!(error_line("  Error:   spaced  ").as_deref(), Some("spaced"));
        assert_eq!(error_line("TypeError: x is undefined"), None);
        assert_eq!(error_line("Error:"), None);
        assert_eq!(
            error_line(&strip_ansi("\x1b[31mError: red\x1b[39m")).as_deref(),
            Some("red")
        );
    }

    #[test]
    fn inspect_json_states() {
        assert_eq!(inspect_state(r#"{"readyState":"ready"}"#).as_deref(), Some("READY"));
        assert_eq!(inspect_state(r#"{"state":"ERROR"}"#).as_deref(), Some("ERROR"));
        assert_eq!(inspect_state(r#"{"status":"Building"}"#).as_deref(), Some("BUILDING"));
        assert_eq!(inspect_state("not json"), None);
        assert!(is_terminal_state("FAILED"));
        assert!(!is_terminal_state("BUILDING"));
    }

    #[test]
    fn cloudflare_signals() {
        let out = "✨ Deployment complete! Take a peek over at https://4f2a.my-site.pages.dev";
        assert_eq!(pages_dev_url(out).as_deref(), Some("https://4f2a.my-site.pages.dev"));
        assert_eq!(
            cloudflare_account_id("Account ID: 0123abcd").as_deref(),
            Some("0123abcd")
        );
        let toml = "account_name = \"x\"\nname = \"my-site\"\n";
        assert_eq!(wrangler_project_name(toml).as_deref(), Some("my-site"));
    }

    #[test]
    fn git_remotes() {
        let want = Some(("acme".to_string(), "site".to_string()));
        assert_eq!(parse_git_remote("https://github.com/acme/site.git\n"), want);
        assert_eq!(parse_git_remote("https://github.com/acme/site"), want);
        assert_eq!(parse_git_remote("git@github.com:acme/site.git"), want);
        assert_eq!(parse_git_remote("https://gitlab.com/acme/site.git"), None);
    }

    #[test]
    fn slugs() {
        assert_eq!(slugify("My Site!!"), "my-site");
        assert_eq!(slugify("--a__b--"), "a-b");
        assert_eq!(slugify("***"), "site");
    }
}
