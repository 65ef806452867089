//! Sequences a deploy: detect, auth, env sync, fixes, build, deploy, alias,
//! and exactly one terminal summary object per command.

pub mod batch;
pub mod context;
pub mod detect;
pub mod env_sync;
pub mod error;
pub mod fixes;
pub mod flow;
pub mod preflight;
pub mod prompt;

pub use batch::{map_limit, run_batch, ProjectResult};
pub use context::AppContext;
pub use detect::{Detection, Detector, PackageJsonDetector};
pub use env_sync::{CliEnvSync, EnvSync, EnvSyncRequest};
pub use error::OrchestratorError;
pub use flow::{run_start, run_up, Action, DeployOptions, DeployReport, Outcome};
pub use preflight::PreflightCheck;
pub use prompt::{NoPrompt, Prompt, ScriptedPrompt, StdinPrompt};
