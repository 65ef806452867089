//! Deploying several app directories in one `up`.

use crate::context::AppContext;
use crate::flow::{deploy_flow, install_redactor, Action, DeployOptions, Flow, Outcome, Partial};
use serde::Serialize;
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Run `worker` over `items` with at most `limit` in flight. Results come
/// back in input order.
pub async fn map_limit<T, R, F, Fut>(items: Vec<T>, limit: usize, worker: F) -> Vec<R>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
{
    let gate = Arc::new(Semaphore::new(limit.max(1)));
    let worker = Arc::new(worker);
    let mut set = JoinSet::new();
    for (i, item) in items.into_iter().enumerate() {
        let (gate, worker) = (Arc::clone(&gate), Arc::clone(&worker));
        set.spawn(async move {
            // The semaphore is never closed.
            let _permit = gate.acquire_owned().await.ok();
            (i, worker(item).await)
        });
    }
    let mut out: Vec<Option<R>> = std::iter::repeat_with(|| None).take(set.len()).collect();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((i, r)) => out[i] = Some(r),
            Err(e) => tracing::warn!(error = %e, "batch worker panicked"),
        }
    }
    out.into_iter().flatten().collect()
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProjectResult {
    pub path: String,
    pub ok: bool,
    pub url: Option<String>,
    pub logs_url: Option<String>,
    pub message: Option<String>,
}

async fn deploy_one(app: AppContext, opts: DeployOptions) -> ProjectResult {
    let path = opts.path.clone().unwrap_or_else(|| ".".into());
    let mut partial = Partial::default();
    let res = match deploy_flow(&app, Action::Up, &opts, &mut partial, false).await {
        Ok(Flow::Deployed(report)) => ProjectResult {
            path,
            ok: true,
            url: report.url,
            logs_url: report.logs_url,
            message: None,
        },
        Ok(Flow::DryRun { plan }) => ProjectResult {
            path,
            ok: true,
            url: None,
            logs_url: None,
            message: Some(plan.join(" && ")),
        },
        Err(e) => ProjectResult {
            path,
            ok: false,
            url: e.url().map(str::to_string),
            logs_url: e.logs_url().map(str::to_string),
            message: Some(e.to_string()),
        },
    };
    app.emitter.event(&json!({
        "action": "up",
        "event": "project",
        "path": res.path,
        "ok": res.ok,
        "url": res.url,
        "logsUrl": res.logs_url,
        "message": res.message,
    }));
    if res.ok {
        app.emitter.success(&format!("{}: deployed", res.path));
    } else {
        app.emitter.error(&format!(
            "{}: {}",
            res.path,
            res.message.as_deref().unwrap_or("failed")
        ));
    }
    res
}

/// Deploy every path in `paths` (relative to `opts.root`), `concurrency` at
/// a time, then emit one terminal batch summary.
pub async fn run_batch(
    app: &AppContext,
    opts: DeployOptions,
    paths: Vec<String>,
    concurrency: usize,
) -> Outcome {
    let target = opts.target.unwrap_or_default();
    // One redactor covering every project, installed before any worker runs.
    let files = paths
        .iter()
        .flat_map(|p| {
            [".env", ".env.local", ".env.production.local"].map(|f| format!("{p}/{f}"))
        })
        .collect();
    install_redactor(app, &opts.root, files);

    let jobs: Vec<DeployOptions> = paths
        .into_iter()
        .map(|p| DeployOptions {
            path: Some(p),
            ..opts.clone()
        })
        .collect();
    let worker_app = app.clone();
    let results = map_limit(jobs, concurrency, move |job| {
        deploy_one(worker_app.clone(), job)
    })
    .await;

    let ok = results.iter().all(|r| r.ok);
    app.emitter.json(&json!({
        "ok": ok,
        "action": "up",
        "mode": "batch",
        "provider": opts.provider,
        "target": target,
        "results": results,
        "final": true,
    }));
    let soft = app.settings.soft_fail(opts.soft_fail, opts.ci, opts.json);
    Outcome {
        ok,
        exit_code: if ok || soft { 0 } else { 1 },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opd_core::settings::Settings;
    use opd_core::OutputMode;
    use opd_emit::{Emitter, EmitterOptions};
    use opd_process::ReplayRunner;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn map_limit_bounds_concurrency_and_keeps_order() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (a, p) = (Arc::clone(&active), Arc::clone(&peak));
        let out = map_limit(vec![50u64, 10, 30, 5, 20], 2, move |ms| {
            let (a, p) = (Arc::clone(&a), Arc::clone(&p));
            async move {
                let now = a.fetch_add(1, Ordering::SeqCst) + 1;
                p.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                a.fetch_sub(1, Ordering::SeqCst);
                ms * 2
            }
        })
        .await;
        assert_eq!(out, [100, 20, 60, 10, 40]);
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn zero_limit_still_runs() {
        let out = map_limit(vec![1, 2, 3], 0, |x| async move { x + 1 }).await;
        assert_eq!(out, [2, 3, 4]);
    }

    #[tokio::test]
    async fn batch_reports_each_project_then_one_final() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir(root.path().join("web")).unwrap();
        std::fs::create_dir(root.path().join("docs")).unwrap();
        let (emitter, cap) = Emitter::capture(EmitterOptions::new(OutputMode::Ndjson));
        let settings = Settings {
            provider_virtual: true,
            no_redact: true,
            ..Settings::default()
        };
        let app = AppContext::new(
            Arc::new(settings),
            Arc::new(emitter),
            Arc::new(ReplayRunner::new(vec![])),
        );
        let opts = DeployOptions {
            provider: Some("cloudflare".into()),
            no_build: true,
            ..DeployOptions::new(root.path())
        };
        let out = run_batch(
            &app,
            opts,
            vec!["web".into(), "docs".into(), "missing".into()],
            2,
        )
        .await;
        assert_eq!(out, Outcome { ok: false, exit_code: 1 });

        let projects = cap.events("project");
        assert_eq!(projects.len(), 3);
        let fin = cap.last_final().unwrap();
        assert_eq!(fin["mode"], "batch");
        assert_eq!(fin["ok"], false);
        let results = fin["results"].as_array().unwrap();
        assert_eq!(results[0]["path"], "web");
        assert_eq!(results[0]["url"], "https://example-preview.virtual.app");
        assert_eq!(results[2]["ok"], false);
        assert!(results[2]["message"]
            .as_str()
            .unwrap()
            .starts_with("App directory not found"));
        let finals = cap
            .json_values()
            .into_iter()
            .filter(|v| v["final"] == true)
            .count();
        assert_eq!(finals, 1);
    }
}
