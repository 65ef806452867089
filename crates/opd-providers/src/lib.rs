//! Deploy drivers for the supported hosting providers.
//!
//! Each provider wraps the vendor CLI (`vercel`, `wrangler`, `gh-pages`)
//! behind the [`Provider`] trait. They all stream through
//! [`driver::drive_stream`], which turns free-text CLI output into
//! structured events and one terminal [`session::Terminal`] outcome.

pub mod capabilities;
pub mod cloudflare;
pub mod driver;
pub mod error;
pub mod extract;
pub mod github;
pub mod hints;
pub mod provider;
pub mod registry;
pub mod session;
pub mod vercel;
pub mod virtual_provider;

pub use capabilities::Capabilities;
pub use cloudflare::CloudflareProvider;
pub use driver::{drive_stream, StreamReport, StreamSpec};
pub use error::{DeployFailure, ProviderError};
pub use github::GithubProvider;
pub use provider::{
    DeployContext, DeployOutcome, DeployRequest, EventBase, Provider, PLUGIN_API_VERSION,
};
pub use registry::ProviderRegistry;
pub use session::{DeploySession, Phase, Terminal};
pub use vercel::VercelProvider;
pub use virtual_provider::VirtualProvider;
