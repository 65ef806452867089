use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = "opendeploy.config.json";

/// Saved `start` defaults from `opendeploy.config.json`.
///
/// Only selections live here. Tokens and env values are never written.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProjectDefaults {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub framework: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub env: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub org: Option<String>,
    #[serde(default)]
    pub sync_env: Option<bool>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigFile {
    #[serde(default)]
    start_defaults: Option<ProjectDefaults>,
}

impl ProjectDefaults {
    /// Load from `{root}/opendeploy.config.json`. Missing or malformed
    /// files yield empty defaults.
    pub fn load(root: &Path) -> Self {
        let Ok(raw) = std::fs::read_to_string(root.join(CONFIG_FILE)) else {
            return Self::default();
        };
        serde_json::from_str::<ConfigFile>(&raw)
            .ok()
            .and_then(|c| c.start_defaults)
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Store as `startDefaults` in `{root}/opendeploy.config.json`, keeping
    /// every other key of an existing file.
    pub fn save(&self, root: &Path) -> anyhow::Result<PathBuf> {
        let path = root.join(CONFIG_FILE);
        let mut config = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<Value>(&raw) {
                Ok(Value::Object(map)) => map,
                Ok(_) => anyhow::bail!("{} is not a JSON object", path.display()),
                Err(e) => return Err(e).with_context(|| format!("parse {}", path.display())),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Map::new(),
            Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
        };
        config.insert("startDefaults".into(), serde_json::to_value(self)?);
        let mut text = serde_json::to_string_pretty(&Value::Object(config))?;
        text.push('\n');
        std::fs::write(&path, text).with_context(|| format!("write {}", path.display()))?;
        Ok(path)
    }
}
