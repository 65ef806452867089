use opd_providers::{DeployFailure, ProviderError};
use thiserror::Error;

/// Anything that ends a start/up flow early.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Not logged in and no chance (or no wish) to fix it interactively.
    #[error("{message}")]
    Auth {
        provider: String,
        message: String,
        login: String,
    },

    /// The local build preflight failed for a provider that needs one.
    #[error("{message}")]
    Build { message: String, tail: Vec<String> },

    /// Ctrl-C or teardown fired while `stage` was running.
    #[error("Cancelled during {stage}")]
    Cancelled { stage: &'static str },

    #[error(transparent)]
    Deploy(#[from] DeployFailure),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<ProviderError> for OrchestratorError {
    fn from(e: ProviderError) -> Self {
        match e {
            ProviderError::Auth {
                provider,
                message,
                login,
            } => OrchestratorError::Auth {
                provider,
                message,
                login,
            },
            ProviderError::Deploy(f) => OrchestratorError::Deploy(f),
            other => OrchestratorError::Other(anyhow::Error::new(other)),
        }
    }
}

impl OrchestratorError {
    pub fn error_tail(&self) -> &[String] {
        match self {
            OrchestratorError::Build { tail, .. } => tail,
            OrchestratorError::Deploy(f) => &f.error_log_tail,
            _ => &[],
        }
    }

    pub fn url(&self) -> Option<&str> {
        match self {
            OrchestratorError::Deploy(f) => f.url.as_deref(),
            _ => None,
        }
    }

    pub fn logs_url(&self) -> Option<&str> {
        match self {
            OrchestratorError::Deploy(f) => f.logs_url.as_deref(),
            _ => None,
        }
    }

    /// Why the deploy stream stopped, when a watchdog ended it.
    pub fn reason(&self) -> Option<&str> {
        match self {
            OrchestratorError::Deploy(f) => f.reason.as_deref(),
            OrchestratorError::Cancelled { .. } => Some("cancelled"),
            _ => None,
        }
    }
}
