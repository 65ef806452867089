use crate::capabilities::Capabilities;
use crate::driver::StreamReport;
use crate::error::{DeployFailure, ProviderError};
use crate::provider::{DeployContext, DeployOutcome, DeployRequest, Provider};
use opd_core::Target;
use std::path::Path;

pub const VIRTUAL_LOGS_URL: &str = "https://virtual.dev/provider/logs/abc123";

/// Hermetic stand-in selected by `OPD_PROVIDER_MODE=virtual`. Spawns
/// nothing and answers with fixed URLs.
#[derive(Debug, Clone)]
pub struct VirtualProvider {
    id: String,
}

impl VirtualProvider {
    pub fn new(base_id: &str) -> Self {
        Self {
            id: format!("{base_id}-virtual"),
        }
    }

    pub fn url_for(target: Target) -> &'static str {
        match target {
            Target::Production => "https://example-prod.virtual.app",
            Target::Preview => "https://example-preview.virtual.app",
        }
    }
}

#[async_trait::async_trait]
impl Provider for VirtualProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::VIRTUAL
    }

    fn login_command(&self) -> String {
        String::from("true")
    }

    async fn validate_auth(&self, _ctx: &DeployContext, _cwd: &Path) -> Result<(), ProviderError> {
        Ok(())
    }

    fn deploy_plan(&self, req: &DeployRequest) -> Vec<String> {
        vec![format!("{} deploy --target {}", self.id, req.target)]
    }

    async fn deploy(
        &self,
        ctx: &DeployContext,
        req: &DeployRequest,
    ) -> Result<DeployOutcome, DeployFailure> {
        let base = ctx.base(&self.id, req.target);
        let mut report = StreamReport::ready(
            Some(Self::url_for(req.target).to_string()),
            Some(VIRTUAL_LOGS_URL.to_string()),
        );
        report.emit_done(ctx, &base);
        Ok(DeployOutcome {
            url: report.url,
            logs_url: report.logs_url,
        })
    }

    async fn alias(
        &self,
        _ctx: &DeployContext,
        _cwd: &Path,
        _url: &str,
        alias: &str,
    ) -> Result<Option<String>, ProviderError> {
        Ok(Some(format!("https://{alias}")))
    }
}
