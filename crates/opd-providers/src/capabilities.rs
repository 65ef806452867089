use serde::Serialize;

/// What a provider can do, as reported by `opendeploy providers`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    pub name: &'static str,
    pub supports_local_build: bool,
    pub supports_remote_build: bool,
    pub supports_static_deploy: bool,
    pub supports_serverless: bool,
    pub supports_edge_functions: bool,
    pub supports_ssr: bool,
    pub has_project_linking: bool,
    pub env_contexts: &'static [&'static str],
    pub supports_logs_follow: bool,
    pub supports_alias_domains: bool,
    pub supports_rollback: bool,
}

const BOTH_CONTEXTS: &[&str] = &["preview", "production"];

impl Capabilities {
    pub const VERCEL: Capabilities = Capabilities {
        name: "Vercel",
        supports_local_build: true,
        supports_remote_build: true,
        supports_static_deploy: true,
        supports_serverless: true,
        supports_edge_functions: true,
        supports_ssr: true,
        has_project_linking: true,
        env_contexts: BOTH_CONTEXTS,
        supports_logs_follow: true,
        supports_alias_domains: true,
        supports_rollback: false,
    };

    pub const CLOUDFLARE: Capabilities = Capabilities {
        name: "Cloudflare Pages",
        supports_local_build: true,
        supports_remote_build: false,
        supports_static_deploy: true,
        supports_serverless: true,
        supports_edge_functions: true,
        supports_ssr: true,
        has_project_linking: true,
        env_contexts: BOTH_CONTEXTS,
        supports_logs_follow: false,
        supports_alias_domains: false,
        supports_rollback: false,
    };

    pub const GITHUB: Capabilities = Capabilities {
        name: "GitHub Pages",
        supports_local_build: true,
        supports_remote_build: false,
        supports_static_deploy: true,
        supports_serverless: false,
        supports_edge_functions: false,
        supports_ssr: false,
        has_project_linking: false,
        env_contexts: &["production"],
        supports_logs_follow: false,
        supports_alias_domains: false,
        supports_rollback: false,
    };

    pub const VIRTUAL: Capabilities = Capabilities {
        name: "Virtual Provider",
        supports_local_build: true,
        supports_remote_build: false,
        supports_static_deploy: true,
        supports_serverless: false,
        supports_edge_functions: false,
        supports_ssr: false,
        has_project_linking: false,
        env_contexts: BOTH_CONTEXTS,
        supports_logs_follow: true,
        supports_alias_domains: false,
        supports_rollback: false,
    };
}
