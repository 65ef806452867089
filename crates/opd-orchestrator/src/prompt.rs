//! Interactive questions, behind a trait so flows stay testable.

use std::collections::VecDeque;
use std::io::{BufRead, Write};
use std::sync::Mutex;

#[async_trait::async_trait]
pub trait Prompt: Send + Sync {
    /// Yes/no question. EOF or an empty answer yields `default`.
    async fn confirm(&self, message: &str, default: bool) -> bool;

    /// Pick one of `choices` by index. `None` when nothing was chosen.
    async fn select(&self, message: &str, choices: &[String]) -> Option<usize>;
}

/// Reads answers from stdin; questions go to stderr so stdout stays clean.
pub struct StdinPrompt;

fn read_answer(question: String) -> Option<String> {
    let mut err = std::io::stderr();
    let _ = write!(err, "{question}");
    let _ = err.flush();
    let mut line = String::new();
    match std::io::stdin().lock().read_line(&mut line) {
        Ok(0) | Err(_) => None,
        Ok(_) => Some(line.trim().to_string()),
    }
}

fn parse_confirm(answer: Option<&str>, default: bool) -> bool {
    match answer.map(str::to_ascii_lowercase).as_deref() {
        Some("y") | Some("yes") => true,
        Some("n") | Some("no") => false,
        _ => default,
    }
}

fn parse_choice(answer: Option<&str>, choices: &[String]) -> Option<usize> {
    let answer = answer?.trim();
    if let Ok(n) = answer.parse::<usize>() {
        return (1..=choices.len()).contains(&n).then(|| n - 1);
    }
    choices.iter().position(|c| c.eq_ignore_ascii_case(answer))
}

#[async_trait::async_trait]
impl Prompt for StdinPrompt {
    async fn confirm(&self, message: &str, default: bool) -> bool {
        let hint = if default { "[Y/n]" } else { "[y/N]" };
        let question = format!("{message} {hint} ");
        let answer = tokio::task::spawn_blocking(move || read_answer(question))
            .await
            .ok()
            .flatten();
        parse_confirm(answer.as_deref(), default)
    }

    async fn select(&self, message: &str, choices: &[String]) -> Option<usize> {
        let mut question = format!("{message}\n");
        for (i, c) in choices.iter().enumerate() {
            question.push_str(&format!("  {}) {c}\n", i + 1));
        }
        question.push_str("> ");
        let answer = tokio::task::spawn_blocking(move || read_answer(question))
            .await
            .ok()
            .flatten();
        parse_choice(answer.as_deref(), choices)
    }
}

/// Never asks. Used whenever output is machine-readable or stdin is not a TTY.
pub struct NoPrompt;

#[async_trait::async_trait]
impl Prompt for NoPrompt {
    async fn confirm(&self, _message: &str, _default: bool) -> bool {
        false
    }

    async fn select(&self, _message: &str, _choices: &[String]) -> Option<usize> {
        None
    }
}

/// Canned answers, consumed in order (for testing).
pub struct ScriptedPrompt {
    answers: Mutex<VecDeque<String>>,
    asked: Mutex<Vec<String>>,
}

impl ScriptedPrompt {
    pub fn new<I, S>(answers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            answers: Mutex::new(answers.into_iter().map(Into::into).collect()),
            asked: Mutex::new(Vec::new()),
        }
    }

    pub fn asked(&self) -> Vec<String> {
        self.asked.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn next(&self, message: &str) -> Option<String> {
        self.asked
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(message.to_string());
        self.answers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }
}

#[async_trait::async_trait]
impl Prompt for ScriptedPrompt {
    async fn confirm(&self, message: &str, default: bool) -> bool {
        parse_confirm(self.next(message).as_deref(), default)
    }

    async fn select(&self, message: &str, choices: &[String]) -> Option<usize> {
        parse_choice(self.next(message).as_deref(), choices)
    }
}
