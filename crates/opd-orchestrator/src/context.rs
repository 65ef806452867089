use crate::detect::{Detector, PackageJsonDetector};
use crate::env_sync::{CliEnvSync, EnvSync};
use crate::prompt::{NoPrompt, Prompt};
use opd_core::settings::Settings;
use opd_emit::Emitter;
use opd_process::Runner;
use opd_providers::{DeployContext, ProviderRegistry};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Every collaborator a command needs, owned in one place and passed down.
#[derive(Clone)]
pub struct AppContext {
    pub settings: Arc<Settings>,
    pub emitter: Arc<Emitter>,
    pub runner: Arc<dyn Runner>,
    pub registry: Arc<ProviderRegistry>,
    pub detector: Arc<dyn Detector>,
    pub env_sync: Arc<dyn EnvSync>,
    pub prompt: Arc<dyn Prompt>,
    pub cancel: CancellationToken,
}

impl AppContext {
    pub fn new(settings: Arc<Settings>, emitter: Arc<Emitter>, runner: Arc<dyn Runner>) -> Self {
        let registry = ProviderRegistry::from_settings(Arc::clone(&emitter), &settings);
        Self {
            settings,
            emitter,
            runner,
            registry: Arc::new(registry),
            detector: Arc::new(PackageJsonDetector),
            env_sync: Arc::new(CliEnvSync),
            prompt: Arc::new(NoPrompt),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_registry(mut self, registry: ProviderRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    pub fn with_detector(mut self, detector: Arc<dyn Detector>) -> Self {
        self.detector = detector;
        self
    }

    pub fn with_env_sync(mut self, env_sync: Arc<dyn EnvSync>) -> Self {
        self.env_sync = env_sync;
        self
    }

    pub fn with_prompt(mut self, prompt: Arc<dyn Prompt>) -> Self {
        self.prompt = prompt;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn deploy_context(&self, action: &str) -> DeployContext {
        DeployContext::new(
            Arc::clone(&self.emitter),
            Arc::clone(&self.runner),
            Arc::clone(&self.settings),
            action,
        )
        .with_cancel(self.cancel.clone())
    }

    /// Stop anything still running and leave the terminal clean.
    pub fn teardown(&self) {
        self.cancel.cancel();
        self.emitter.clear_status();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opd_core::OutputMode;
    use opd_emit::EmitterOptions;
    use opd_process::ReplayRunner;

    #[test]
    fn deploy_context_shares_cancellation() {
        let (emitter, _) = Emitter::capture(EmitterOptions::new(OutputMode::Ndjson));
        let app = AppContext::new(
            Arc::new(Settings::default()),
            Arc::new(emitter),
            Arc::new(ReplayRunner::new(vec![])),
        );
        let ctx = app.deploy_context("up");
        assert_eq!(ctx.action, "up");
        assert!(!ctx.cancel.is_cancelled());
        app.teardown();
        assert!(ctx.cancel.is_cancelled());
    }
}
