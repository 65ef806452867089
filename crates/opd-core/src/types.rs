use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Deploy target environment.
///
/// Serialized as `prod` / `preview` in every emitted object. Input also
/// accepts `production`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum Target {
    #[default]
    #[serde(rename = "preview")]
    Preview,
    #[serde(rename = "prod", alias = "production")]
    Production,
}

impl Target {
    pub fn as_str(self) -> &'static str {
        match self {
            Target::Preview => "preview",
            Target::Production => "prod",
        }
    }

    /// Name used by provider env contexts (`vercel env add K production`).
    pub fn context_name(self) -> &'static str {
        match self {
            Target::Preview => "preview",
            Target::Production => "production",
        }
    }

    pub fn is_production(self) -> bool {
        matches!(self, Target::Production)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Target {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "prod" | "production" => Ok(Target::Production),
            "preview" => Ok(Target::Preview),
            other => anyhow::bail!("unknown target \"{other}\" (expected prod or preview)"),
        }
    }
}

/// How consumer-facing output is rendered. Resolved once at entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    /// Human prose on the terminal; prompts allowed.
    #[default]
    Interactive,
    /// Structured objects only, pretty-printed; stream events suppressed.
    Json,
    /// One compact object per line, including stream events.
    Ndjson,
    /// Only objects carrying `final: true`.
    Summary,
}

impl OutputMode {
    pub fn is_machine(self) -> bool {
        !matches!(self, OutputMode::Interactive)
    }

    pub fn is_interactive(self) -> bool {
        matches!(self, OutputMode::Interactive)
    }
}
