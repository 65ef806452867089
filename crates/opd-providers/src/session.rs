use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::time::Duration;

/// Lines kept for failure context.
pub const TAIL_LINES: usize = 50;
/// Lines shown as the error tail.
pub const ERROR_TAIL_LINES: usize = 10;

// ── Phases ──

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Idle,
    Linking,
    Queued,
    Building,
    Deploying,
    Ready,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Linking => "linking",
            Phase::Queued => "queued",
            Phase::Building => "building",
            Phase::Deploying => "deploying",
            Phase::Ready => "ready",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// Phases only move forward. Skipping is allowed; providers often never
// print some of them.
const VALID_TRANSITIONS: &[(Phase, &[Phase])] = &[
    (
        Phase::Idle,
        &[
            Phase::Linking,
            Phase::Queued,
            Phase::Building,
            Phase::Deploying,
            Phase::Ready,
        ],
    ),
    (
        Phase::Linking,
        &[Phase::Queued, Phase::Building, Phase::Deploying, Phase::Ready],
    ),
    (
        Phase::Queued,
        &[Phase::Building, Phase::Deploying, Phase::Ready],
    ),
    (Phase::Building, &[Phase::Deploying, Phase::Ready]),
    (Phase::Deploying, &[Phase::Ready]),
    // Ready is terminal
];

fn is_valid_transition(from: Phase, to: Phase) -> bool {
    VALID_TRANSITIONS
        .iter()
        .any(|(f, targets)| *f == from && targets.contains(&to))
}

// ── Terminal outcomes ──

/// How a deploy attempt ended. Exactly one is recorded per session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Terminal {
    Ready,
    Error(String),
    Timeout(Duration),
    IdleTimeout(Duration),
    Cancelled,
}

impl Terminal {
    pub fn is_ok(&self) -> bool {
        matches!(self, Terminal::Ready)
    }

    pub fn reason(&self) -> Option<String> {
        match self {
            Terminal::Ready => None,
            Terminal::Error(msg) => Some(msg.clone()),
            Terminal::Timeout(d) => Some(format!("timeout after {}s", d.as_secs())),
            Terminal::IdleTimeout(d) => Some(format!("idle-timeout after {}s", d.as_secs())),
            Terminal::Cancelled => Some("cancelled".to_string()),
        }
    }
}

// ── Session ──

/// State for one deploy subprocess. Dropped when the attempt completes.
#[derive(Debug)]
pub struct DeploySession {
    url: Option<String>,
    logs_url: Option<String>,
    phase: Phase,
    terminal: Option<Terminal>,
    tail: VecDeque<String>,
    hints: HashSet<&'static str>,
}

impl Default for DeploySession {
    fn default() -> Self {
        Self::new()
    }
}

impl DeploySession {
    pub fn new() -> Self {
        Self {
            url: None,
            logs_url: None,
            phase: Phase::Idle,
            terminal: None,
            tail: VecDeque::with_capacity(TAIL_LINES),
            hints: HashSet::new(),
        }
    }

    /// First capture wins. Returns whether this call stored the value.
    pub fn capture_url(&mut self, url: &str) -> bool {
        capture_once(&mut self.url, url)
    }

    pub fn capture_logs_url(&mut self, url: &str) -> bool {
        capture_once(&mut self.logs_url, url)
    }

    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    pub fn logs_url(&self) -> Option<&str> {
        self.logs_url.as_deref()
    }

    /// Record a non-empty line in the rolling tail.
    pub fn push_line(&mut self, line: &str) {
        let line = line.trim_end();
        if line.trim().is_empty() {
            return;
        }
        if self.tail.len() == TAIL_LINES {
            self.tail.pop_front();
        }
        self.tail.push_back(line.to_string());
    }

    #[cfg(test)]
    fn tail(&self) -> Vec<String> {
        self.tail.iter().cloned().collect()
    }

    pub fn error_tail(&self) -> Vec<String> {
        let skip = self.tail.len().saturating_sub(ERROR_TAIL_LINES);
        self.tail.iter().skip(skip).cloned().collect()
    }

    /// Returns true the first time a hint id is seen.
    pub fn mark_hint(&mut self, id: &'static str) -> bool {
        self.hints.insert(id)
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Move forward to `to`. Backward or repeated phases are ignored, as is
    /// anything after the session finished.
    pub fn advance(&mut self, to: Phase) -> bool {
        if self.terminal.is_some() || !is_valid_transition(self.phase, to) {
            return false;
        }
        self.phase = to;
        true
    }

    /// Record the outcome. Only the first writer wins.
    pub fn finish(&mut self, terminal: Terminal) -> bool {
        if self.terminal.is_some() {
            return false;
        }
        if terminal.is_ok() {
            self.phase = Phase::Ready;
        }
        self.terminal = Some(terminal);
        true
    }

    pub fn terminal(&self) -> Option<&Terminal> {
        self.terminal.as_ref()
    }

    pub fn is_finished(&self) -> bool {
        self.terminal.is_some()
    }
}

fn capture_once(slot: &mut Option<String>, value: &str) -> bool {
    if slot.is_some() || value.is_empty() {
        return false;
    }
    *slot = Some(value.to_string());
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_first_write_wins() {
        let mut s = DeploySession::new();
        assert!(s.capture_url("https://a.vercel.app"));
        assert!(!s.capture_url("https://b.vercel.app"));
        assert_eq!(s.url(), Some("https://a.vercel.app"));
        assert!(!s.capture_logs_url(""));
        assert!(s.capture_logs_url("https://vercel.com/x"));
        assert_eq!(s.logs_url(), Some("https://vercel.com/x"));
    }

    #[test]
    fn phases_are_monotonic() {
        let mut s = DeploySession::new();
        assert!(s.advance(Phase::Queued));
        assert!(s.advance(Phase::Building));
        assert!(!s.advance(Phase::Queued));
        assert!(!s.advance(Phase::Building));
        assert!(s.advance(Phase::Ready));
        assert!(!s.advance(Phase::Deploying));
        assert_eq!(s.phase(), Phase::Ready);
    }

    #[test]
    fn first_terminal_wins() {
        let mut s = DeploySession::new();
        s.advance(Phase::Building);
        assert!(s.finish(Terminal::IdleTimeout(Duration::from_secs(45))));
        assert!(!s.finish(Terminal::Ready));
        assert!(!s.advance(Phase::Deploying));
        assert_eq!(
            s.terminal().and_then(Terminal::reason).as_deref(),
            Some("idle-timeout after 45s")
        );
        assert_eq!(s.phase(), Phase::Building);
    }

    #[test]
    fn tail_is_bounded_and_skips_blank_lines() {
        let mut s = DeploySession::new();
        for i in 0..60 {
            s.push_line(&format!("line {i}"));
            s.push_line("   ");
        }
        let tail = s.tail();
        assert_eq!(tail.len(), TAIL_LINES);
        assert_eq!(tail[0], "line 10");
        let err = s.error_tail();
        assert_eq!(err.len(), ERROR_TAIL_LINES);
        assert_eq!(err[0], "line 50");
        assert_eq!(err[9], "line 59");
    }

    #[test]
    fn hints_dedup() {
        let mut s = DeploySession::new();
        assert!(s.mark_hint("env-missing"));
        assert!(!s.mark_hint("env-missing"));
    }
}
