//! Provider-specific config fixes. Every patcher checks before it changes
//! anything, so running one twice is a no-op.

use crate::detect::{next_config, Detection};
use crate::prompt::Prompt;
use opd_emit::Emitter;
use regex::Regex;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

static CONFIG_OPEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(module\.exports\s*=\s*\{|export\s+default\s*\{|const\s+nextConfig(?:\s*:\s*[\w.]+)?\s*=\s*\{)",
    )
    .unwrap()
});
static OUTPUT_EXPORT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"output\s*:\s*['"]export['"]"#).unwrap());
static OUTPUT_EXPORT_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?m)^[ \t]*output\s*:\s*['"]export['"]\s*,?[ \t]*\r?\n?"#).unwrap());
static IMAGES_UNOPTIMIZED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"unoptimized\s*:\s*true").unwrap());
static IMAGES_OPEN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"images\s*:\s*\{").unwrap());
static ASSET_PREFIX_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^[ \t]*assetPrefix\s*:[^\n]*\r?\n?").unwrap());
static BASE_PATH_SET: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"basePath\s*:\s*(?:'[^']+'|"[^"]+"|`[^`]+`)"#).unwrap());

pub fn has_output_export(src: &str) -> bool {
    OUTPUT_EXPORT.is_match(src)
}

/// Insert `text` right after the opening brace of the exported config.
fn insert_into_config(src: &str, text: &str) -> Option<String> {
    let m = CONFIG_OPEN.find(src)?;
    let mut out = String::with_capacity(src.len() + text.len());
    out.push_str(&src[..m.end()]);
    out.push_str(text);
    out.push_str(&src[m.end()..]);
    Some(out)
}

/// Static export plus unoptimized images, which GitHub Pages needs.
pub fn patch_next_for_github(src: &str) -> (String, Vec<&'static str>) {
    let mut out = src.to_string();
    let mut applied = Vec::new();
    if !has_output_export(&out) {
        if let Some(patched) = insert_into_config(&out, "\n  output: 'export',") {
            out = patched;
            applied.push("github-next-output-export");
        }
    }
    if !IMAGES_UNOPTIMIZED.is_match(&out) {
        let patched = match IMAGES_OPEN.find(&out) {
            Some(m) => Some(format!("{} unoptimized: true,{}", &out[..m.end()], &out[m.end()..])),
            None => insert_into_config(&out, "\n  images: { unoptimized: true },"),
        };
        if let Some(patched) = patched {
            out = patched;
            applied.push("github-next-images-unoptimized");
        }
    }
    (out, applied)
}

/// Undo settings that break `next-on-pages` style deploys.
pub fn patch_next_for_cloudflare(src: &str) -> (String, Vec<&'static str>) {
    let mut out = src.to_string();
    let mut applied = Vec::new();
    if OUTPUT_EXPORT_LINE.is_match(&out) {
        out = OUTPUT_EXPORT_LINE.replace_all(&out, "").into_owned();
        applied.push("cloudflare-next-remove-output-export");
    }
    if ASSET_PREFIX_LINE.is_match(&out) {
        out = ASSET_PREFIX_LINE.replace_all(&out, "").into_owned();
        applied.push("cloudflare-next-remove-assetPrefix");
    }
    if BASE_PATH_SET.is_match(&out) {
        out = BASE_PATH_SET.replace_all(&out, "basePath: ''").into_owned();
        applied.push("cloudflare-next-basePath-empty");
    }
    (out, applied)
}

/// One fix that changed a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedFix {
    pub id: &'static str,
    pub file: PathBuf,
}

fn emit_fix(emitter: &Emitter, action: &str, provider: &str, fix: &AppliedFix) {
    emitter.event(&json!({
        "action": action,
        "event": "fix",
        "provider": provider,
        "id": fix.id,
        "file": fix.file.display().to_string(),
    }));
    emitter.note(&format!("Applied fix {} ({})", fix.id, fix.file.display()));
}

/// Apply whatever fixes `provider` needs in `cwd`. Interactive runs are
/// asked first; machine runs apply without asking.
pub async fn apply_safe_fixes(
    emitter: &Emitter,
    prompt: &dyn Prompt,
    action: &str,
    provider: &str,
    cwd: &Path,
    detection: &Detection,
) -> anyhow::Result<Vec<AppliedFix>> {
    let mut applied = Vec::new();

    if provider == "github" {
        let public = cwd.join("public");
        if public.is_dir() && opd_providers::github::ensure_nojekyll(&public)? {
            applied.push(AppliedFix {
                id: "github-nojekyll",
                file: public.join(".nojekyll"),
            });
        }
    }

    let patcher: Option<fn(&str) -> (String, Vec<&'static str>)> = match provider {
        "github" => Some(patch_next_for_github),
        "cloudflare" => Some(patch_next_for_cloudflare),
        _ => None,
    };
    if let (Some(patch), Some(file), true) = (patcher, next_config(cwd), detection.is_next()) {
        let src = std::fs::read_to_string(&file)?;
        let (patched, ids) = patch(&src);
        if !ids.is_empty() {
            let name = file.file_name().map(|n| n.to_string_lossy().into_owned());
            let question = format!(
                "Apply {} fix(es) to {}? ({})",
                ids.len(),
                name.as_deref().unwrap_or("next.config"),
                ids.join(", ")
            );
            if !emitter.mode().is_interactive() || prompt.confirm(&question, true).await {
                std::fs::write(&file, patched)?;
                applied.extend(ids.into_iter().map(|id| AppliedFix {
                    id,
                    file: file.clone(),
                }));
            }
        }
    }

    for fix in &applied {
        emit_fix(emitter, action, provider, fix);
    }
    Ok(applied)
}
