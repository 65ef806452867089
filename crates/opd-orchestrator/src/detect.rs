//! Framework detection from `package.json` and the files around it.

use serde::Serialize;
use serde_json::Value;
use std::path::Path;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RenderMode {
    Static,
    Ssr,
    Hybrid,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Detection {
    pub framework: String,
    pub build_command: String,
    pub output_dir: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub publish_dir: Option<String>,
    pub render_mode: RenderMode,
    pub confidence: f32,
    pub package_manager: String,
    pub monorepo: String,
    pub environment_files: Vec<String>,
}

impl Detection {
    /// What deploys get when nothing was recognized.
    pub fn unknown() -> Self {
        Self {
            framework: "unknown".into(),
            build_command: "npm run build".into(),
            output_dir: "dist".into(),
            publish_dir: None,
            render_mode: RenderMode::Static,
            confidence: 0.0,
            package_manager: "npm".into(),
            monorepo: "none".into(),
            environment_files: Vec::new(),
        }
    }

    pub fn is_next(&self) -> bool {
        self.framework == "next"
    }
}

pub trait Detector: Send + Sync {
    fn detect(&self, cwd: &Path) -> anyhow::Result<Detection>;
}

/// Highest confidence wins; earlier entries win ties.
pub fn select_best(candidates: Vec<Detection>) -> Option<Detection> {
    candidates.into_iter().fold(None, |best, d| match best {
        Some(b) if b.confidence >= d.confidence => Some(b),
        _ => Some(d),
    })
}

/// Runs every detector and keeps the best answer. Failing detectors are
/// skipped.
pub fn detect_with(detectors: &[&dyn Detector], cwd: &Path) -> Detection {
    let found = detectors
        .iter()
        .filter_map(|d| match d.detect(cwd) {
            Ok(det) => Some(det),
            Err(e) => {
                tracing::debug!(error = %e, "detector failed");
                None
            }
        })
        .collect();
    select_best(found).unwrap_or_else(Detection::unknown)
}

struct FrameworkRule {
    dep: &'static str,
    framework: &'static str,
    output_dir: &'static str,
    render: RenderMode,
    confidence: f32,
    /// Framework CLI used when `package.json` has no build script.
    build: &'static str,
}

const RULES: &[FrameworkRule] = &[
    FrameworkRule { dep: "next", framework: "next", output_dir: ".next", render: RenderMode::Hybrid, confidence: 0.95, build: "next build" },
    FrameworkRule { dep: "astro", framework: "astro", output_dir: "dist", render: RenderMode::Static, confidence: 0.9, build: "astro build" },
    FrameworkRule { dep: "@sveltejs/kit", framework: "sveltekit", output_dir: "build", render: RenderMode::Ssr, confidence: 0.9, build: "vite build" },
    FrameworkRule { dep: "nuxt", framework: "nuxt", output_dir: ".output/public", render: RenderMode::Ssr, confidence: 0.9, build: "nuxt build" },
    FrameworkRule { dep: "@remix-run/dev", framework: "remix", output_dir: "build/client", render: RenderMode::Ssr, confidence: 0.85, build: "remix vite:build" },
    FrameworkRule { dep: "@react-router/dev", framework: "remix", output_dir: "build/client", render: RenderMode::Ssr, confidence: 0.85, build: "react-router build" },
    FrameworkRule { dep: "vite", framework: "vite", output_dir: "dist", render: RenderMode::Static, confidence: 0.6, build: "vite build" },
];

/// Reads `package.json` dependencies, lockfiles and `.env*` files.
#[derive(Debug, Default)]
pub struct PackageJsonDetector;

impl Detector for PackageJsonDetector {
    fn detect(&self, cwd: &Path) -> anyhow::Result<Detection> {
        let raw = std::fs::read_to_string(cwd.join("package.json"))?;
        let pkg: Value = serde_json::from_str(&raw)?;
        let has_dep = |name: &str| {
            ["dependencies", "devDependencies"]
                .iter()
                .any(|k| pkg[*k].get(name).is_some())
        };

        let package_manager = package_manager(cwd, &pkg);
        let mut det = Detection {
            package_manager: package_manager.clone(),
            monorepo: monorepo(cwd, &pkg),
            environment_files: env_files(cwd),
            ..Detection::unknown()
        };

        let rule = RULES.iter().find(|r| has_dep(r.dep));
        if let Some(rule) = rule {
            det.framework = rule.framework.into();
            det.output_dir = rule.output_dir.into();
            det.render_mode = rule.render;
            det.confidence = rule.confidence;
            match rule.framework {
                "next" if next_static_export(cwd) => {
                    det.output_dir = "out".into();
                    det.render_mode = RenderMode::Static;
                }
                "sveltekit" if has_dep("@sveltejs/adapter-static") => {
                    det.render_mode = RenderMode::Static;
                }
                _ => {}
            }
            det.publish_dir = Some(det.output_dir.clone());
        }

        det.build_command = match (pkg["scripts"]["build"].as_str(), rule) {
            (Some(_), _) => build_script_command(&package_manager),
            (None, Some(rule)) => exec_command(&package_manager, rule.build),
            (None, None) => det.build_command,
        };
        Ok(det)
    }
}

/// `pnpm build`, `yarn build`, `bun run build` or `npm run build`.
pub fn build_script_command(package_manager: &str) -> String {
    match package_manager {
        "pnpm" => "pnpm build".into(),
        "yarn" => "yarn build".into(),
        "bun" => "bun run build".into(),
        _ => "npm run build".into(),
    }
}

/// Run a locally installed binary through the package manager.
pub fn exec_command(package_manager: &str, cmd: &str) -> String {
    match package_manager {
        "pnpm" => format!("pnpm exec {cmd}"),
        "yarn" => format!("yarn {cmd}"),
        "bun" => format!("bunx {cmd}"),
        _ => format!("npx -y {cmd}"),
    }
}

fn package_manager(cwd: &Path, pkg: &Value) -> String {
    if let Some(pm) = pkg["packageManager"].as_str() {
        let name = pm.split('@').next().unwrap_or(pm);
        if !name.is_empty() {
            return name.to_string();
        }
    }
    let lockfiles = [
        ("bun.lockb", "bun"),
        ("bun.lock", "bun"),
        ("pnpm-lock.yaml", "pnpm"),
        ("yarn.lock", "yarn"),
        ("package-lock.json", "npm"),
    ];
    lockfiles
        .iter()
        .find(|(file, _)| cwd.join(file).is_file())
        .map(|(_, pm)| pm.to_string())
        .unwrap_or_else(|| "npm".into())
}

fn monorepo(cwd: &Path, pkg: &Value) -> String {
    let markers = [
        ("pnpm-workspace.yaml", "pnpm"),
        ("turbo.json", "turborepo"),
        ("nx.json", "nx"),
    ];
    if let Some((_, kind)) = markers.iter().find(|(f, _)| cwd.join(f).is_file()) {
        return kind.to_string();
    }
    if pkg.get("workspaces").is_some() {
        return "workspaces".into();
    }
    "none".into()
}

fn env_files(cwd: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(cwd) else {
        return Vec::new();
    };
    let mut files: Vec<String> = entries
        .filter_map(Result::ok)
        .filter(|e| e.path().is_file())
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|n| n.starts_with(".env") && !n.contains("example") && !n.contains("sample"))
        .collect();
    files.sort();
    files
}

pub(crate) fn next_config(cwd: &Path) -> Option<std::path::PathBuf> {
    ["next.config.ts", "next.config.js", "next.config.mjs"]
        .iter()
        .map(|f| cwd.join(f))
        .find(|p| p.is_file())
}

fn next_static_export(cwd: &Path) -> bool {
    next_config(cwd)
        .and_then(|p| std::fs::read_to_string(p).ok())
        .is_some_and(|src| crate::fixes::has_output_export(&src))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(dir: &Path, name: &str, body: &str) {
        fs::write(dir.join(name), body).unwrap();
    }

    #[test]
    fn next_with_pnpm() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "package.json",
            r#"{"scripts":{"build":"next build"},"dependencies":{"next":"14.2.0","react":"18"}}"#,
        );
        write(dir.path(), "pnpm-lock.yaml", "");
        write(dir.path(), ".env", "A=1");
        write(dir.path(), ".env.example", "A=");
        let det = PackageJsonDetector.detect(dir.path()).unwrap();
        assert_eq!(det.framework, "next");
        assert_eq!(det.package_manager, "pnpm");
        assert_eq!(det.build_command, "pnpm build");
        assert_eq!(det.render_mode, RenderMode::Hybrid);
        assert_eq!(det.output_dir, ".next");
        assert_eq!(det.environment_files, [".env"]);
    }

    #[test]
    fn next_static_export_uses_out() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "package.json", r#"{"dependencies":{"next":"14"}}"#);
        write(
            dir.path(),
            "next.config.js",
            "module.exports = { output: 'export' }\n",
        );
        let det = PackageJsonDetector.detect(dir.path()).unwrap();
        assert_eq!(det.output_dir, "out");
        assert_eq!(det.render_mode, RenderMode::Static);
        assert_eq!(det.build_command, "npx -y next build");
        assert_eq!(det.publish_dir.as_deref(), Some("out"));
    }

    #[test]
    fn package_manager_field_beats_lockfile() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "package.json",
            r#"{"packageManager":"yarn@4.1.0","workspaces":["apps/*"],"devDependencies":{"vite":"5"},"scripts":{"build":"vite build"}}"#,
        );
        write(dir.path(), "package-lock.json", "{}");
        let det = PackageJsonDetector.detect(dir.path()).unwrap();
        assert_eq!(det.framework, "vite");
        assert_eq!(det.package_manager, "yarn");
        assert_eq!(det.build_command, "yarn build");
        assert_eq!(det.monorepo, "workspaces");
    }

    #[test]
    fn missing_package_json_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        assert!(PackageJsonDetector.detect(dir.path()).is_err());
        let det = detect_with(&[&PackageJsonDetector], dir.path());
        assert_eq!(det, Detection::unknown());
    }

    #[test]
    fn best_confidence_wins_ties_go_first() {
        let mk = |fw: &str, c: f32| Detection {
            framework: fw.into(),
            confidence: c,
            ..Detection::unknown()
        };
        let best = select_best(vec![mk("vite", 0.6), mk("astro", 0.9), mk("nuxt", 0.9)]);
        assert_eq!(best.map(|d| d.framework).as_deref(), Some("astro"));
        assert!(select_best(Vec::new()).is_none());
    }
}
