//! Liveness signal independent of provider output cadence.

use crate::Emitter;
use opd_core::{format_elapsed, OutputMode};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

pub const STATUS_LINE_PERIOD: Duration = Duration::from_secs(1);
pub const NDJSON_PERIOD: Duration = Duration::from_secs(5);

/// Runs until dropped. Interactive mode redraws `label: status - 1m 05s`
/// every second; NDJSON mode emits a `heartbeat` event every five seconds;
/// other modes do nothing.
pub struct Heartbeat {
    status: Arc<Mutex<String>>,
    emitter: Arc<Emitter>,
    task: Option<JoinHandle<()>>,
}

impl Heartbeat {
    pub fn start(emitter: &Arc<Emitter>, action: &str, label: &str, hint: Option<&str>) -> Self {
        let status = Arc::new(Mutex::new(String::from("starting")));
        let task = match emitter.mode() {
            OutputMode::Interactive => {
                let (emitter, status, label) =
                    (Arc::clone(emitter), Arc::clone(&status), label.to_string());
                Some(tokio::spawn(async move {
                    let started = Instant::now();
                    let mut tick = tokio::time::interval(STATUS_LINE_PERIOD);
                    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    loop {
                        tick.tick().await;
                        let current = status.lock().unwrap_or_else(|e| e.into_inner()).clone();
                        emitter.status_line(&format!(
                            "{label}: {current} - {}",
                            format_elapsed(started.elapsed())
                        ));
                    }
                }))
            }
            OutputMode::Ndjson => {
                let emitter = Arc::clone(emitter);
                let (action, label) = (action.to_string(), label.to_string());
                let hint = hint.map(str::to_string);
                Some(tokio::spawn(async move {
                    let started = Instant::now();
                    let mut tick =
                        tokio::time::interval_at(started + NDJSON_PERIOD, NDJSON_PERIOD);
                    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    loop {
                        tick.tick().await;
                        emitter.event(&json!({
                            "action": action,
                            "event": "heartbeat",
                            "label": label,
                            "elapsedMs": started.elapsed().as_millis() as u64,
                            "hint": hint,
                        }));
                    }
                }))
            }
            OutputMode::Json | OutputMode::Summary => None,
        };
        Self {
            status,
            emitter: Arc::clone(emitter),
            task,
        }
    }

    /// Text shown after the label on the next redraw.
    pub fn set_status(&self, status: &str) {
        *self.status.lock().unwrap_or_else(|e| e.into_inner()) = status.to_string();
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.emitter.clear_status();
    }
}
