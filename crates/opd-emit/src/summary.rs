use crate::Emitter;
use opd_core::{format_elapsed, Target};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

/// What a finished deploy looks like to a human.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeploySummary {
    pub ok: bool,
    pub provider: String,
    pub target: Target,
    pub url: Option<String>,
    pub alias: Option<String>,
    pub logs_url: Option<String>,
    pub duration: Duration,
}

impl DeploySummary {
    fn rows(&self) -> Vec<(&'static str, String)> {
        let mut rows = vec![
            ("Provider", self.provider.clone()),
            ("Target", self.target.to_string()),
        ];
        if let Some(url) = &self.url {
            rows.push(("URL", url.clone()));
        }
        if let Some(alias) = &self.alias {
            rows.push(("Alias", alias.clone()));
        }
        if let Some(logs) = &self.logs_url {
            rows.push(("Inspect", logs.clone()));
        }
        rows.push(("Duration", format_elapsed(self.duration)));
        rows
    }

    pub fn human_lines(&self) -> Vec<String> {
        self.rows()
            .into_iter()
            .map(|(k, v)| format!("{k:<9} {v}"))
            .collect()
    }

    /// Markdown block for `$GITHUB_STEP_SUMMARY`.
    pub fn markdown(&self) -> String {
        let status = if self.ok { "succeeded" } else { "failed" };
        let mut md = format!("### opendeploy: {} deploy {status}\n\n", self.provider);
        md.push_str("| Field | Value |\n|---|---|\n");
        for (k, v) in self.rows() {
            md.push_str(&format!("| {k} | {} |\n", v.replace('|', "\\|")));
        }
        md.push('\n');
        md
    }
}

/// Append to the GitHub step summary file.
pub fn append_step_summary(path: &Path, markdown: &str) -> anyhow::Result<()> {
    let mut f = OpenOptions::new().create(true).append(true).open(path)?;
    f.write_all(markdown.as_bytes())?;
    Ok(())
}

impl Emitter {
    pub fn deploy_summary(&self, summary: &DeploySummary) {
        self.section("Summary");
        for line in summary.human_lines() {
            self.info(&line);
        }
    }

    /// Human rendering of a failure: message, error tail, logs URL.
    pub fn failure(&self, message: &str, error_tail: &[String], logs_url: Option<&str>) {
        self.error(message);
        if !error_tail.is_empty() {
            self.note("Last output:");
            for line in error_tail {
                self.log_line(&format!("  {line}"));
            }
        }
        if let Some(url) = logs_url {
            self.note(&format!("Logs: {url}"));
        }
    }
}
