use crate::cloudflare::CloudflareProvider;
use crate::error::ProviderError;
use crate::github::GithubProvider;
use crate::provider::{Provider, PLUGIN_API_VERSION};
use crate::vercel::VercelProvider;
use crate::virtual_provider::VirtualProvider;
use opd_core::settings::Settings;
use opd_emit::Emitter;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

const ALIASES: &[(&str, &str)] = &[("cloudflare-pages", "cloudflare"), ("github-pages", "github")];

/// Leading numeric component of a semver string; `0` when unparseable.
pub fn major_of(version: &str) -> u64 {
    version
        .trim()
        .trim_start_matches('v')
        .split('.')
        .next()
        .and_then(|m| m.parse().ok())
        .unwrap_or(0)
}

pub fn canonical_id(id: &str) -> &str {
    ALIASES
        .iter()
        .find(|(alias, _)| *alias == id)
        .map(|(_, canonical)| *canonical)
        .unwrap_or(id)
}

/// Known providers by id. Every registration, built-ins included, is gated
/// on the plugin API major.
pub struct ProviderRegistry {
    providers: BTreeMap<String, Arc<dyn Provider>>,
    emitter: Arc<Emitter>,
    virtual_mode: bool,
}

impl ProviderRegistry {
    pub fn new(emitter: Arc<Emitter>) -> Self {
        Self {
            providers: BTreeMap::new(),
            emitter,
            virtual_mode: false,
        }
    }

    /// Vercel, Cloudflare Pages and GitHub Pages.
    pub fn with_builtins(emitter: Arc<Emitter>) -> Self {
        let mut reg = Self::new(emitter);
        let builtins: [Arc<dyn Provider>; 3] = [
            Arc::new(VercelProvider::new()),
            Arc::new(CloudflareProvider::new()),
            Arc::new(GithubProvider::new()),
        ];
        for p in builtins {
            if let Err(e) = reg.register(p) {
                tracing::error!(error = %e, "built-in provider rejected");
            }
        }
        reg
    }

    pub fn from_settings(emitter: Arc<Emitter>, settings: &Settings) -> Self {
        Self::with_builtins(emitter).virtual_mode(settings.provider_virtual)
    }

    /// Resolve every id to a [`VirtualProvider`].
    pub fn virtual_mode(mut self, on: bool) -> Self {
        self.virtual_mode = on;
        self
    }

    /// Add a provider whose API major matches the host's.
    pub fn register(&mut self, provider: Arc<dyn Provider>) -> Result<(), ProviderError> {
        let id = provider.id().to_string();
        let found = provider.api_version().to_string();
        if major_of(&found) != major_of(PLUGIN_API_VERSION) {
            self.emitter.json(&json!({
                "action": "plugin",
                "event": "version-mismatch",
                "kind": "provider",
                "id": id,
                "required": PLUGIN_API_VERSION,
                "found": found,
            }));
            return Err(ProviderError::VersionMismatch {
                id,
                required: PLUGIN_API_VERSION.to_string(),
                found,
            });
        }
        self.emitter.event(&json!({
            "action": "plugin",
            "event": "version-ok",
            "kind": "provider",
            "id": id,
            "version": found,
        }));
        self.providers.insert(id, provider);
        Ok(())
    }

    pub fn resolve(&self, id: &str) -> Result<Arc<dyn Provider>, ProviderError> {
        let id = canonical_id(id.trim());
        if self.virtual_mode {
            return Ok(Arc::new(VirtualProvider::new(id)));
        }
        self.providers
            .get(id)
            .cloned()
            .ok_or_else(|| ProviderError::Unknown(id.to_string()))
    }

    pub fn ids(&self) -> Vec<&str> {
        self.providers.keys().map(String::as_str).collect()
    }

    /// `{ok, action:"providers", providers:[{id, apiVersion, capabilities}], final}`.
    pub fn listing(&self) -> Value {
        let providers: Vec<Value> = self
            .providers
            .values()
            .map(|p| {
                json!({
                    "id": p.id(),
                    "apiVersion": p.api_version(),
                    "capabilities": p.capabilities(),
                })
            })
            .collect();
        json!({
            "ok": true,
            "action": "providers",
            "providers": providers,
            "final": true,
        })
    }
}
