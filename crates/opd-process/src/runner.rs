use crate::lines::Utf8Decoder;
use crate::watchdog::{drain, supervise, Outcome};
use crate::{ExecResult, Invocation, Runner, StreamChunk, StreamController, StreamHandle};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Grace window between SIGTERM and SIGKILL.
const KILL_GRACE: Duration = Duration::from_millis(500);
/// How long to keep forwarding buffered output after the process is gone.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Spawns commands through the platform shell.
#[derive(Debug, Clone, Default)]
pub struct ShellRunner {
    ci_env: bool,
}

impl ShellRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Force `CI=1`, `FORCE_COLOR=0`, `TERM=dumb` into every child so
    /// provider CLIs skip prompts and ANSI output.
    pub fn with_ci_env(mut self, ci_env: bool) -> Self {
        self.ci_env = ci_env;
        self
    }

    fn command(&self, inv: &Invocation) -> Command {
        let mut cmd = shell_command(&inv.cmd);
        cmd.current_dir(&inv.cwd)
            .envs(&inv.env)
            .stdin(if inv.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if self.ci_env {
            cmd.env("CI", "1").env("FORCE_COLOR", "0").env("TERM", "dumb");
        }
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }
}

/// `cmd.exe /d /s /c` on Windows.
#[cfg(windows)]
fn shell_command(line: &str) -> Command {
    let mut cmd = Command::new("cmd.exe");
    cmd.args(["/d", "/s", "/c"]).raw_arg(line);
    cmd
}

/// `$SHELL -c`, falling back to `/bin/sh -c`.
#[cfg(not(windows))]
fn shell_command(line: &str) -> Command {
    let shell = std::env::var("SHELL")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| "/bin/sh".into());
    let mut cmd = Command::new(shell);
    cmd.arg("-c").arg(line);
    cmd
}

#[async_trait::async_trait]
impl Runner for ShellRunner {
    async fn run(&self, inv: Invocation) -> ExecResult {
        self.spawn_stream(inv).collect().await
    }

    fn spawn_stream(&self, inv: Invocation) -> StreamHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let stop = CancellationToken::new();
        let command = self.command(&inv);
        let done = tokio::spawn(supervise_child(command, inv, tx, stop.clone()));
        StreamHandle {
            controller: StreamController::new(stop, done),
            chunks: rx,
        }
    }
}

async fn supervise_child(
    mut command: Command,
    inv: Invocation,
    out: mpsc::UnboundedSender<StreamChunk>,
    stop: CancellationToken,
) -> ExecResult {
    tracing::debug!(cmd = %inv.cmd, cwd = %inv.cwd.display(), "spawn");
    let mut child = match command.spawn() {
        Ok(c) => c,
        Err(e) => {
            let msg = format!("spawn error: {e}");
            let _ = out.send(StreamChunk::Stderr(msg.clone()));
            return ExecResult::failed(msg);
        }
    };

    let (pipe_tx, mut pipe_rx) = mpsc::unbounded_channel();
    if let Some(stdout) = child.stdout.take() {
        pump(stdout, pipe_tx.clone(), StreamChunk::Stdout);
    }
    if let Some(stderr) = child.stderr.take() {
        pump(stderr, pipe_tx.clone(), StreamChunk::Stderr);
    }
    drop(pipe_tx);

    // Fed concurrently with the pumps: a child may fill its stdout pipe
    // before it has read all of its input.
    if let (Some(input), Some(mut stdin)) = (inv.stdin.clone(), child.stdin.take()) {
        tokio::spawn(async move {
            // A child that exits without reading stdin is not an error here
            let _ = stdin.write_all(input.as_bytes()).await;
            let _ = stdin.shutdown().await;
        });
    }

    let outcome = {
        let exit = async {
            match child.wait().await {
                Ok(status) => status.code(),
                Err(_) => None,
            }
        };
        supervise(exit, &mut pipe_rx, &out, inv.timeout, inv.idle_timeout, &stop).await
    };

    match outcome {
        Outcome::Exited(code) => {
            drain(&mut pipe_rx, &out, DRAIN_GRACE).await;
            tracing::debug!(cmd = %inv.cmd, ?code, "exit");
            ExecResult::exited(code)
        }
        Outcome::Killed(reason) => {
            tracing::debug!(cmd = %inv.cmd, ?reason, "terminating");
            terminate(&mut child).await;
            drain(&mut pipe_rx, &out, KILL_GRACE).await;
            ExecResult::stopped(reason)
        }
    }
}

fn pump<R>(
    mut reader: R,
    tx: mpsc::UnboundedSender<StreamChunk>,
    wrap: fn(String) -> StreamChunk,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut decoder = Utf8Decoder::default();
        let mut buf = [0u8; 8192];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let text = decoder.decode(&buf[..n]);
                    if !text.is_empty() && tx.send(wrap(text)).is_err() {
                        return;
                    }
                }
            }
        }
        let rest = decoder.finish();
        if !rest.is_empty() {
            let _ = tx.send(wrap(rest));
        }
    });
}

/// Stop the whole process tree. POSIX: SIGTERM to the group, then SIGKILL
/// after [`KILL_GRACE`]. Windows: `taskkill /T /F`.
async fn terminate(child: &mut Child) {
    let Some(pid) = child.id() else {
        return;
    };

    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        let pgid = Pid::from_raw(pid as i32);
        let _ = killpg(pgid, Signal::SIGTERM);
        if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_err() {
            let _ = child.start_kill();
        }
        // Stragglers that ignored SIGTERM
        let _ = killpg(pgid, Signal::SIGKILL);
    }

    #[cfg(windows)]
    {
        let _ = Command::new("taskkill")
            .args(["/T", "/F", "/PID", &pid.to_string()])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        let _ = child.start_kill();
    }

    let _ = child.wait().await;
}
