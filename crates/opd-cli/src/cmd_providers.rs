use crate::{build_emitter, OutputArgs};
use opd_core::settings::Settings;
use opd_core::OutputMode;
use opd_providers::ProviderRegistry;
use std::sync::Arc;

/// `opendeploy providers`
pub fn execute(settings: &Settings, mode: OutputMode, output: &OutputArgs) -> i32 {
    let emitter = Arc::new(build_emitter(settings, mode, output));
    let registry = ProviderRegistry::from_settings(Arc::clone(&emitter), settings);
    emitter.json(&registry.listing());
    0
}
