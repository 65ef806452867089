//! Process-wide knobs read from the environment once at entry.

use crate::OutputMode;
use std::path::PathBuf;
use std::time::Duration;

/// Default per-attempt timeout for retry-wrapped calls.
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_millis(120_000);
/// Default number of additional attempts.
pub const DEFAULT_RETRIES: u32 = 2;
/// Default base delay between attempts.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(300);

/// Snapshot of every environment variable the core recognizes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    pub ndjson: bool,
    pub json: bool,
    pub summary: bool,
    pub force_ci: bool,
    /// `CI=1|true` or `GITHUB_ACTIONS=true` in the parent environment.
    pub ci_detected: bool,
    pub timeout_ms: Option<u64>,
    pub retries: Option<u32>,
    pub base_delay_ms: Option<u64>,
    pub provider_virtual: bool,
    pub test_no_spawn: bool,
    pub no_redact: bool,
    pub soft_fail: bool,
    pub gha: bool,
    pub json_file: Option<PathBuf>,
    pub ndjson_file: Option<PathBuf>,
    pub timestamps: bool,
    pub no_emoji: bool,
    pub record_fixtures: Option<PathBuf>,
    pub replay_fixtures: Option<PathBuf>,
    pub vercel_bin: Option<String>,
    pub step_summary: Option<PathBuf>,
}

impl Settings {
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Build from an arbitrary lookup (tests pass a map).
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let flag = |k: &str| get(k).is_some_and(|v| v == "1");
        let truthy = |k: &str| {
            get(k).is_some_and(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        };
        let path = |k: &str| get(k).filter(|v| !v.is_empty()).map(PathBuf::from);
        Self {
            ndjson: flag("OPD_NDJSON"),
            json: flag("OPD_JSON"),
            summary: flag("OPD_SUMMARY"),
            force_ci: flag("OPD_FORCE_CI"),
            ci_detected: truthy("CI") || truthy("GITHUB_ACTIONS"),
            timeout_ms: get("OPD_TIMEOUT_MS").and_then(|v| v.trim().parse().ok()),
            retries: get("OPD_RETRIES").and_then(|v| v.trim().parse().ok()),
            base_delay_ms: get("OPD_BASE_DELAY_MS").and_then(|v| v.trim().parse().ok()),
            provider_virtual: get("OPD_PROVIDER_MODE").is_some_and(|v| v == "virtual"),
            test_no_spawn: flag("OPD_TEST_NO_SPAWN"),
            no_redact: flag("OPD_NO_REDACT"),
            soft_fail: flag("OPD_SOFT_FAIL"),
            gha: flag("OPD_GHA"),
            json_file: path("OPD_JSON_FILE"),
            ndjson_file: path("OPD_NDJSON_FILE"),
            timestamps: flag("OPD_TIMESTAMPS"),
            no_emoji: flag("OPD_NO_EMOJI"),
            record_fixtures: path("OPD_RECORD_FIXTURES"),
            replay_fixtures: path("OPD_REPLAY_FIXTURES"),
            vercel_bin: get("OPD_VERCEL_BIN").filter(|v| !v.trim().is_empty()),
            step_summary: path("GITHUB_STEP_SUMMARY"),
        }
    }

    /// Resolve the single output mode from CLI flags and env.
    /// Precedence: ndjson > summary > json > interactive.
    pub fn output_mode(&self, json: bool, ndjson: bool, summary_only: bool) -> OutputMode {
        if ndjson || self.ndjson {
            OutputMode::Ndjson
        } else if summary_only || self.summary {
            OutputMode::Summary
        } else if json || self.json {
            OutputMode::Json
        } else {
            OutputMode::Interactive
        }
    }

    /// Whether child processes get `CI=1`, `FORCE_COLOR=0`, `TERM=dumb`.
    pub fn ci_child_env(&self) -> bool {
        self.force_ci || self.json || self.ndjson || self.ci_detected
    }

    /// Soft-fail exit policy: failures still exit 0.
    pub fn soft_fail(&self, cli_soft_fail: bool, cli_ci: bool, cli_json: bool) -> bool {
        cli_soft_fail || cli_ci || cli_json || self.soft_fail || self.gha || self.summary
    }

    pub fn step_timeout(&self) -> Duration {
        self.timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_STEP_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings(pairs: &[(&str, &str)]) -> Settings {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn empty_env_is_interactive() {
        let s = settings(&[]);
        assert_eq!(s.output_mode(false, false, false), OutputMode::Interactive);
        assert!(!s.ci_child_env());
        assert_eq!(s.step_timeout(), DEFAULT_STEP_TIMEOUT);
    }

    #[test]
    fn ndjson_wins_over_json_and_summary() {
        let s = settings(&[("OPD_NDJSON", "1"), ("OPD_JSON", "1")]);
        assert_eq!(s.output_mode(false, false, true), OutputMode::Ndjson);
        let s = settings(&[]);
        assert_eq!(s.output_mode(true, false, true), OutputMode::Summary);
        assert_eq!(s.output_mode(true, false, false), OutputMode::Json);
    }

    #[test]
    fn ci_detection_variants() {
        assert!(settings(&[("CI", "true")]).ci_child_env());
        assert!(settings(&[("CI", "1")]).ci_child_env());
        assert!(settings(&[("GITHUB_ACTIONS", "true")]).ci_child_env());
        assert!(settings(&[("OPD_FORCE_CI", "1")]).ci_child_env());
        assert!(settings(&[("OPD_JSON", "1")]).ci_child_env());
        assert!(!settings(&[("CI", "false")]).ci_child_env());
    }

    #[test]
    fn numeric_knobs_parse_or_ignore() {
        let s = settings(&[
            ("OPD_TIMEOUT_MS", "5000"),
            ("OPD_RETRIES", "4"),
            ("OPD_BASE_DELAY_MS", "nope"),
        ]);
        assert_eq!(s.timeout_ms, Some(5000));
        assert_eq!(s.retries, Some(4));
        assert_eq!(s.base_delay_ms, None);
        assert_eq!(s.step_timeout(), Duration::from_millis(5000));
    }

    #[test]
    fn provider_mode_virtual() {
        assert!(settings(&[("OPD_PROVIDER_MODE", "virtual")]).provider_virtual);
        assert!(!settings(&[("OPD_PROVIDER_MODE", "real")]).provider_virtual);
    }

    #[test]
    fn soft_fail_sources() {
        let s = settings(&[]);
        assert!(!s.soft_fail(false, false, false));
        assert!(s.soft_fail(true, false, false));
        assert!(s.soft_fail(false, true, false));
        assert!(s.soft_fail(false, false, true));
        assert!(settings(&[("OPD_SOFT_FAIL", "1")]).soft_fail(false, false, false));
        assert!(settings(&[("OPD_GHA", "1")]).soft_fail(false, false, false));
    }

    #[test]
    fn empty_paths_are_none() {
        let s = settings(&[("OPD_NDJSON_FILE", ""), ("GITHUB_STEP_SUMMARY", "/tmp/s.md")]);
        assert_eq!(s.ndjson_file, None);
        assert_eq!(s.step_summary, Some(PathBuf::from("/tmp/s.md")));
    }
}
