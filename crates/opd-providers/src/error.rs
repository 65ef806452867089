use serde_json::{json, Value};
use thiserror::Error;

/// Failures a provider reports before or instead of a deploy outcome.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The provider CLI is installed but not logged in. `login` is the
    /// command that fixes it.
    #[error("{message}")]
    Auth {
        provider: String,
        message: String,
        login: String,
    },

    #[error("{message}")]
    CliMissing { provider: String, message: String },

    /// A provider CLI step other than the deploy itself failed.
    #[error("{message}")]
    Command { provider: String, message: String },

    #[error("Unknown provider: {0}")]
    Unknown(String),

    #[error("provider {id} requires plugin API {required}, host provides {found}")]
    VersionMismatch {
        id: String,
        required: String,
        found: String,
    },

    #[error("{0}")]
    Unsupported(String),

    #[error(transparent)]
    Deploy(#[from] DeployFailure),
}

impl ProviderError {
    pub fn is_auth(&self) -> bool {
        matches!(self, ProviderError::Auth { .. })
    }
}

/// A deploy attempt that ran and failed, with whatever context was gathered.
#[derive(Debug, Clone, Default, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct DeployFailure {
    pub provider: String,
    pub message: String,
    /// Why the stream ended, e.g. `idle-timeout after 45s`.
    pub reason: Option<String>,
    pub url: Option<String>,
    pub logs_url: Option<String>,
    pub error_log_tail: Vec<String>,
}

impl DeployFailure {
    pub fn new(provider: &str, message: impl Into<String>) -> Self {
        Self {
            provider: provider.to_string(),
            message: message.into(),
            ..Default::default()
        }
    }

    /// Fields merged into the terminal `ok:false` object.
    pub fn context(&self) -> Value {
        json!({
            "message": self.message,
            "reason": self.reason,
            "url": self.url,
            "logsUrl": self.logs_url,
            "errorLogTail": self.error_log_tail,
        })
    }
}
