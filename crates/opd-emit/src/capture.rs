use serde_json::Value;
use std::io::Write;
use std::sync::{Arc, Mutex};

/// Shared in-memory writer. Clones see the same buffer.
#[derive(Debug, Clone, Default)]
pub struct Capture(Arc<Mutex<Vec<u8>>>);

impl Capture {
    pub fn text(&self) -> String {
        let buf = self.0.lock().unwrap_or_else(|e| e.into_inner());
        String::from_utf8_lossy(&buf).into_owned()
    }

    pub fn lines(&self) -> Vec<String> {
        self.text()
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Every JSON value in the buffer, compact or pretty. Non-JSON text
    /// ends the scan.
    pub fn json_values(&self) -> Vec<Value> {
        let text = self.text();
        serde_json::Deserializer::from_str(&text)
            .into_iter::<Value>()
            .map_while(Result::ok)
            .collect()
    }

    /// The authoritative outcome: the last object with `final: true`.
    pub fn last_final(&self) -> Option<Value> {
        self.json_values().into_iter().rev().find(crate::is_final)
    }

    /// Structured events whose `event` field equals `kind`.
    pub fn events(&self, kind: &str) -> Vec<Value> {
        self.json_values()
            .into_iter()
            .filter(|v| v.get("event").and_then(Value::as_str) == Some(kind))
            .collect()
    }
}

impl Write for Capture {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
