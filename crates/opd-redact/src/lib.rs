pub mod dotenv;

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine as _;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

pub use dotenv::{is_public_key, parse_dotenv, read_dotenv};

/// Replacement text for every redacted match.
pub const MASK: &str = "******";

/// Project-level override file.
pub const CONFIG_FILE: &str = "opendeploy.redaction.json";

/// Env files scanned when the caller names none.
pub const DEFAULT_ENV_FILES: &[&str] = &[".env", ".env.local"];

/// Values shorter than this are never tracked.
const MIN_SECRET_LEN: usize = 4;

/// Literals that show up in logs constantly and are never secrets.
const TRIVIAL_VALUES: &[&str] = &[
    "true", "false", "null", "undefined", "on", "off", "yes", "no",
];

/// Process-env keys that hold machine paths/locale rather than secrets.
const SYSTEM_ENV_KEYS: &[&str] = &[
    "PATH", "HOME", "PWD", "OLDPWD", "SHELL", "USER", "LOGNAME", "TERM", "LANG", "TMPDIR",
    "HOSTNAME", "SHLVL", "_",
];

/// Characters `encodeURIComponent` leaves alone.
const URI_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// Vendor token shapes redacted regardless of local env contents.
static VENDOR_PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    vec![
        // JWT: three base64url segments
        (
            Regex::new(r"eyJ[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+").unwrap(),
            MASK,
        ),
        // GitHub tokens: ghp_, gho_, ghs_, ghu_, github_pat_
        (
            Regex::new(r"\b(?:gh[pous]_[A-Za-z0-9_]{20,}|github_pat_[A-Za-z0-9_]{20,})").unwrap(),
            MASK,
        ),
        // GitLab PAT
        (Regex::new(r"\bglpat-[A-Za-z0-9_-]{20,}").unwrap(), MASK),
        // Stripe secret and publishable keys
        (
            Regex::new(r"\b[sp]k_(?:live|test)_[A-Za-z0-9]{16,}").unwrap(),
            MASK,
        ),
        // AWS access key IDs (long-lived and STS)
        (Regex::new(r"\b(?:AKIA|ASIA)[0-9A-Z]{16}\b").unwrap(), MASK),
        // AWS secret access key next to its label
        (
            Regex::new(r"(?i)(aws.{0,20}(?:secret|access).{0,20}[:=]\s*)[A-Za-z0-9/+=]{40}")
                .unwrap(),
            "${1}******",
        ),
        // Google OAuth client secret
        (Regex::new(r"GOCSPX-[A-Za-z0-9_-]{10,}").unwrap(), MASK),
        // Bearer tokens in Authorization headers
        (
            Regex::new(r"(?i)(Bearer\s+)[A-Za-z0-9._\-]{20,}").unwrap(),
            "${1}******",
        ),
    ]
});

/// Inputs for [`compute_redactors`].
#[derive(Debug, Clone, Default)]
pub struct RedactionOptions {
    pub cwd: PathBuf,
    /// Env file names relative to `cwd`; empty means [`DEFAULT_ENV_FILES`].
    pub env_files: Vec<String>,
    pub include_process_env: bool,
}

impl RedactionOptions {
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self {
            cwd: cwd.into(),
            ..Default::default()
        }
    }

    pub fn with_env_files<I, S>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.env_files = files.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_process_env(mut self, include: bool) -> Self {
        self.include_process_env = include;
        self
    }
}

/// Ordered set of secret matchers. Built once per top-level invocation.
#[derive(Debug, Clone, Default)]
pub struct Redactor {
    /// Escaped literals, longest first so overlapping secrets never leave
    /// a partial suffix behind.
    literals: Vec<Regex>,
    /// User-supplied regexes from the project config.
    custom: Vec<Regex>,
    vendor: bool,
}

impl Redactor {
    /// No redaction at all (`OPD_NO_REDACT=1`).
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Vendor token shapes only.
    pub fn vendor_only() -> Self {
        Self {
            vendor: true,
            ..Default::default()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.vendor || !self.literals.is_empty() || !self.custom.is_empty()
    }

    /// Number of literal plus custom matchers (vendor shapes excluded).
    pub fn tracked_len(&self) -> usize {
        self.literals.len() + self.custom.len()
    }

    /// Replace every tracked secret with [`MASK`].
    pub fn redact(&self, input: &str) -> String {
        let mut output = input.to_string();
        for re in self.literals.iter().chain(&self.custom) {
            if re.is_match(&output) {
                output = re.replace_all(&output, MASK).into_owned();
            }
        }
        if self.vendor {
            for (re, replacement) in VENDOR_PATTERNS.iter() {
                if re.is_match(&output) {
                    output = re.replace_all(&output, *replacement).into_owned();
                }
            }
        }
        output
    }

    /// Recursively redact every string inside a JSON value.
    pub fn redact_json(&self, val: &serde_json::Value) -> serde_json::Value {
        match val {
            serde_json::Value::String(s) => serde_json::Value::String(self.redact(s)),
            serde_json::Value::Object(map) => {
                let mut new_map = serde_json::Map::new();
                for (k, v) in map {
                    new_map.insert(k.clone(), self.redact_json(v));
                }
                serde_json::Value::Object(new_map)
            }
            serde_json::Value::Array(arr) => {
                serde_json::Value::Array(arr.iter().map(|v| self.redact_json(v)).collect())
            }
            other => other.clone(),
        }
    }
}

/// Every form of `value` that must not reach output: the literal, base64,
/// base64url and percent-encoded. Empty for short or trivial values.
pub fn secret_variants(value: &str) -> Vec<String> {
    if value.chars().count() < MIN_SECRET_LEN {
        return Vec::new();
    }
    if TRIVIAL_VALUES.contains(&value.to_ascii_lowercase().as_str()) {
        return Vec::new();
    }
    let mut out = vec![value.to_string()];
    for encoded in [
        STANDARD.encode(value),
        URL_SAFE_NO_PAD.encode(value),
        utf8_percent_encode(value, URI_COMPONENT).to_string(),
    ] {
        if !out.contains(&encoded) {
            out.push(encoded);
        }
    }
    out
}

#[derive(Debug, Default, Deserialize)]
struct RedactionFile {
    #[serde(default)]
    redaction: Option<RedactionSection>,
}

#[derive(Debug, Default, Deserialize)]
struct RedactionSection {
    #[serde(default)]
    literals: Vec<String>,
    #[serde(default)]
    regex: Vec<RegexEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RegexEntry {
    Plain(String),
    WithFlags {
        pattern: String,
        #[serde(default)]
        flags: Option<String>,
    },
}

impl RegexEntry {
    /// Compile, translating JS-style flags (`i`, `m`, `s`) into inline flags.
    fn compile(&self) -> Option<Regex> {
        let (pattern, flags) = match self {
            RegexEntry::Plain(p) => (p.as_str(), ""),
            RegexEntry::WithFlags { pattern, flags } => {
                (pattern.as_str(), flags.as_deref().unwrap_or(""))
            }
        };
        let inline: String = flags.chars().filter(|c| matches!(c, 'i' | 'm' | 's')).collect();
        let source = if inline.is_empty() {
            pattern.to_string()
        } else {
            format!("(?{inline}){pattern}")
        };
        match Regex::new(&source) {
            Ok(re) => Some(re),
            Err(e) => {
                tracing::warn!(pattern, error = %e, "ignoring invalid redaction regex");
                None
            }
        }
    }
}

/// Build a [`Redactor`] from env files, the optional project config, and
/// (when asked) the live process environment.
pub fn compute_redactors(opts: &RedactionOptions) -> Redactor {
    compute_redactors_with_env(opts, std::env::vars())
}

/// Same as [`compute_redactors`] with an explicit process environment.
pub fn compute_redactors_with_env<I>(opts: &RedactionOptions, process_env: I) -> Redactor
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut literals: BTreeSet<String> = BTreeSet::new();

    let files: Vec<String> = if opts.env_files.is_empty() {
        DEFAULT_ENV_FILES.iter().map(|s| s.to_string()).collect()
    } else {
        opts.env_files.clone()
    };
    for name in &files {
        let Some(pairs) = read_dotenv(&opts.cwd.join(name)) else {
            continue;
        };
        for (k, v) in pairs {
            if k.is_empty() || is_public_key(&k) {
                continue;
            }
            literals.extend(secret_variants(&v));
        }
    }

    let custom = load_config(&opts.cwd, &mut literals);

    if opts.include_process_env {
        for (k, v) in process_env {
            if k.is_empty() || is_public_key(&k) || SYSTEM_ENV_KEYS.contains(&k.as_str()) {
                continue;
            }
            literals.extend(secret_variants(&v));
        }
    }

    let mut ordered: Vec<String> = literals.into_iter().collect();
    ordered.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
    let literals = ordered
        .iter()
        .filter_map(|lit| Regex::new(&regex::escape(lit)).ok())
        .collect();

    Redactor {
        literals,
        custom,
        vendor: true,
    }
}

/// Load `opendeploy.redaction.json`; literals join `literals`, regexes are
/// returned. Malformed files are ignored.
fn load_config(cwd: &Path, literals: &mut BTreeSet<String>) -> Vec<Regex> {
    let path = cwd.join(CONFIG_FILE);
    let Ok(raw) = std::fs::read_to_string(&path) else {
        return Vec::new();
    };
    let parsed: RedactionFile = match serde_json::from_str(&raw) {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "ignoring malformed redaction config");
            return Vec::new();
        }
    };
    let Some(section) = parsed.redaction else {
        return Vec::new();
    };
    literals.extend(section.literals.into_iter().filter(|l| !l.is_empty()));
    section.regex.iter().filter_map(RegexEntry::compile).collect()
}
