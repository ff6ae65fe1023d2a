//! External tool runner.
//!
//! Launches a subprocess with piped stdio, forwards its stdout/stderr line by
//! line over an mpsc channel and publishes the exit status on a watch channel
//! so any number of tasks can await termination. Both `\n` and `\r` end a
//! line: ffmpeg rewrites its progress line in place with carriage returns.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{Mutex, mpsc, watch};
use tokio_util::sync::CancellationToken;

/// Number of stderr lines kept for error reporting.
const STDERR_TAIL_LINES: usize = 40;

const OUTPUT_CHANNEL_CAPACITY: usize = 256;

/// How long the waiter gives the pipe readers to drain after the child exits.
/// A grandchild that inherited the pipes can otherwise hold them open forever.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("tool binary not found: {program}")]
    BinaryNotFound { program: String },

    #[error("failed to spawn {program}: {message}")]
    Spawn { program: String, message: String },
}

/// Program plus argv for one external tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl ToolCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Human-readable command line, used for logging only.
    pub fn display(&self) -> String {
        let mut parts = vec![self.program.display().to_string()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolLine {
    pub stream: OutputStream,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolExit {
    /// `None` when the process was terminated by a signal.
    pub code: Option<i32>,
    /// True when the exit followed [`ToolHandle::kill`].
    pub killed: bool,
    pub stderr_tail: String,
}

impl ToolExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    fn lost() -> Self {
        Self {
            code: None,
            killed: false,
            stderr_tail: "exit status lost: waiter task ended early".to_string(),
        }
    }
}

/// A running tool: its output stream plus a cloneable control handle.
pub struct ToolProcess {
    pub output: mpsc::Receiver<ToolLine>,
    pub handle: ToolHandle,
}

impl ToolProcess {
    /// Hand every output line to `on_line` until the tool exits.
    ///
    /// Completion is driven by the exit status, not by the output channel
    /// closing: a detached grandchild may keep the pipes open long after the
    /// tool itself is gone. Lines already buffered at exit are still delivered.
    pub async fn follow<F>(self, mut on_line: F) -> ToolExit
    where
        F: FnMut(&ToolLine),
    {
        let Self { mut output, handle } = self;
        loop {
            tokio::select! {
                biased;
                line = output.recv() => match line {
                    Some(line) => on_line(&line),
                    None => break,
                },
                exit = handle.wait() => {
                    while let Ok(line) = output.try_recv() {
                        on_line(&line);
                    }
                    return exit;
                }
            }
        }
        handle.wait().await
    }
}

/// Cloneable control surface for a spawned tool.
#[derive(Clone)]
pub struct ToolHandle {
    program: String,
    pid: Option<u32>,
    stdin: Arc<Mutex<Option<ChildStdin>>>,
    kill: CancellationToken,
    exit: watch::Receiver<Option<ToolExit>>,
}

impl std::fmt::Debug for ToolHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolHandle")
            .field("program", &self.program)
            .field("pid", &self.pid)
            .field("exited", &self.has_exited())
            .finish()
    }
}

impl ToolHandle {
    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    /// Wait until the tool terminates.
    pub async fn wait(&self) -> ToolExit {
        let mut exit = self.exit.clone();
        match exit.wait_for(Option::is_some).await {
            Ok(status) => status.clone().unwrap_or_else(ToolExit::lost),
            Err(_) => ToolExit::lost(),
        }
    }

    /// Write raw bytes to the tool's stdin.
    pub async fn write_stdin(&self, bytes: &[u8]) -> std::io::Result<()> {
        let mut guard = self.stdin.lock().await;
        let Some(stdin) = guard.as_mut() else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "stdin already closed",
            ));
        };
        stdin.write_all(bytes).await?;
        stdin.flush().await
    }

    /// Close stdin so the tool sees EOF.
    pub async fn close_stdin(&self) {
        let mut guard = self.stdin.lock().await;
        if let Some(mut stdin) = guard.take() {
            let _ = stdin.shutdown().await;
        }
    }

    /// Ask the tool to terminate with SIGTERM. Returns false if no signal was sent.
    #[cfg(unix)]
    pub fn terminate(&self) -> bool {
        if self.has_exited() {
            return false;
        }
        let Some(pid) = self.pid.and_then(|pid| libc::pid_t::try_from(pid).ok()) else {
            return false;
        };
        // SAFETY: kill(2) with a pid we spawned and have not yet reaped.
        unsafe { libc::kill(pid, libc::SIGTERM) == 0 }
    }

    #[cfg(not(unix))]
    pub fn terminate(&self) -> bool {
        self.kill();
        true
    }

    /// Force-kill the tool. The exit is still published through [`Self::wait`].
    pub fn kill(&self) {
        self.kill.cancel();
    }
}

/// Spawn `command` with piped stdio.
pub fn spawn_tool(command: &ToolCommand) -> Result<ToolProcess, ToolError> {
    let program = command.program.display().to_string();
    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    tracing::info!("Launching tool: {}", command.display());

    let mut child = cmd.spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ToolError::BinaryNotFound {
                program: program.clone(),
            }
        } else {
            ToolError::Spawn {
                program: program.clone(),
                message: e.to_string(),
            }
        }
    })?;

    let pid = child.id();
    let stdin = child.stdin.take();
    let stdout = child.stdout.take().ok_or_else(|| ToolError::Spawn {
        program: program.clone(),
        message: "failed to capture stdout".to_string(),
    })?;
    let stderr = child.stderr.take().ok_or_else(|| ToolError::Spawn {
        program: program.clone(),
        message: "failed to capture stderr".to_string(),
    })?;

    let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
    let tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));

    let stdout_task = tokio::spawn(forward_lines(
        stdout,
        OutputStream::Stdout,
        program.clone(),
        tx.clone(),
        None,
    ));
    let stderr_task = tokio::spawn(forward_lines(
        stderr,
        OutputStream::Stderr,
        program.clone(),
        tx,
        Some(Arc::clone(&tail)),
    ));

    let (exit_tx, exit_rx) = watch::channel(None);
    let kill = CancellationToken::new();
    let kill_signal = kill.clone();
    let label = program.clone();

    tokio::spawn(async move {
        let (status, killed) = tokio::select! {
            status = child.wait() => (status, false),
            () = kill_signal.cancelled() => {
                if let Err(e) = child.start_kill() {
                    tracing::warn!("Failed to kill {label}: {e}");
                }
                (child.wait().await, true)
            }
        };

        // Aborting a stuck reader drops its sender, which closes the output channel.
        for mut task in [stdout_task, stderr_task] {
            if tokio::time::timeout(READER_DRAIN_TIMEOUT, &mut task)
                .await
                .is_err()
            {
                tracing::debug!("{label}: output pipe still open after exit");
                task.abort();
            }
        }

        let code = match status {
            Ok(status) => status.code(),
            Err(e) => {
                tracing::warn!("Failed to wait for {label}: {e}");
                None
            }
        };
        let stderr_tail = tail.lock().await.iter().cloned().collect::<Vec<_>>().join("\n");

        tracing::debug!("{label} exited with code {code:?} (killed: {killed})");
        let _ = exit_tx.send(Some(ToolExit {
            code,
            killed,
            stderr_tail,
        }));
    });

    Ok(ToolProcess {
        output: rx,
        handle: ToolHandle {
            program,
            pid,
            stdin: Arc::new(Mutex::new(stdin)),
            kill,
            exit: exit_rx,
        },
    })
}

/// Spawn `command`, hand every output line to `on_line`, and wait for exit.
pub async fn run_to_exit<F>(command: &ToolCommand, on_line: F) -> Result<ToolExit, ToolError>
where
    F: FnMut(&ToolLine),
{
    Ok(spawn_tool(command)?.follow(on_line).await)
}

async fn forward_lines<R>(
    reader: R,
    stream: OutputStream,
    label: String,
    tx: mpsc::Sender<ToolLine>,
    tail: Option<Arc<Mutex<VecDeque<String>>>>,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut pending = Vec::new();
    let mut receiver_alive = true;

    loop {
        let mut complete = Vec::new();
        let consumed = match reader.fill_buf().await {
            Ok([]) => {
                if !pending.is_empty() {
                    complete.push(std::mem::take(&mut pending));
                }
                0
            }
            Ok(chunk) => {
                for &byte in chunk {
                    if byte == b'\n' || byte == b'\r' {
                        if !pending.is_empty() {
                            complete.push(std::mem::take(&mut pending));
                        }
                    } else {
                        pending.push(byte);
                    }
                }
                chunk.len()
            }
            Err(e) => {
                tracing::debug!("{label}: read error on {stream:?}: {e}");
                0
            }
        };
        reader.consume(consumed);

        for raw in complete {
            let text = String::from_utf8_lossy(&raw).trim_end().to_string();
            if text.is_empty() {
                continue;
            }
            tracing::debug!("{label}: {text}");
            if let Some(tail) = &tail {
                let mut tail = tail.lock().await;
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(text.clone());
            }
            if receiver_alive && tx.send(ToolLine { stream, text }).await.is_err() {
                receiver_alive = false;
            }
        }

        if consumed == 0 {
            break;
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sh(script: &str) -> ToolCommand {
        ToolCommand::new("/bin/sh").arg("-c").arg(script)
    }

    #[tokio::test]
    async fn streams_lines_and_reports_exit_code() {
        let mut lines = Vec::new();
        let exit = run_to_exit(&sh("echo out1; echo err1 1>&2; echo out2; exit 3"), |line| {
            lines.push(line.clone());
        })
        .await
        .unwrap();

        assert_eq!(exit.code, Some(3));
        assert!(!exit.success());
        assert!(!exit.killed);
        assert_eq!(exit.stderr_tail, "err1");

        let stdout: Vec<_> = lines
            .iter()
            .filter(|l| l.stream == OutputStream::Stdout)
            .map(|l| l.text.as_str())
            .collect();
        assert_eq!(stdout, vec!["out1", "out2"]);
    }

    #[tokio::test]
    async fn carriage_returns_split_progress_lines() {
        let mut texts = Vec::new();
        let exit = run_to_exit(
            &sh("printf 'frame=1 fps=0\\rframe=2 fps=0\\rdone\\n' 1>&2"),
            |line| texts.push(line.text.clone()),
        )
        .await
        .unwrap();

        assert!(exit.success());
        assert_eq!(texts, vec!["frame=1 fps=0", "frame=2 fps=0", "done"]);
    }

    #[tokio::test]
    async fn missing_binary_is_reported() {
        let err = spawn_tool(&ToolCommand::new("/nonexistent/tapedeck-tool")).err();
        assert!(
            matches!(err, Some(ToolError::BinaryNotFound { .. })),
            "unexpected: {err:?}"
        );
    }

    #[tokio::test]
    async fn kill_publishes_exit() {
        let process = spawn_tool(&sh("sleep 30")).unwrap();
        assert!(!process.handle.has_exited());
        process.handle.kill();
        let exit = process.handle.wait().await;
        assert!(exit.killed);
        assert!(process.handle.has_exited());
    }

    #[tokio::test]
    async fn stdin_reaches_the_tool() {
        let process = spawn_tool(&sh("read line; echo \"got:$line\"")).unwrap();
        let ToolProcess { mut output, handle } = process;
        handle.write_stdin(b"q\n").await.unwrap();
        handle.close_stdin().await;

        let line = output.recv().await.unwrap();
        assert_eq!(line.text, "got:q");
        assert!(handle.wait().await.success());
        assert!(handle.write_stdin(b"again").await.is_err());
    }

    #[tokio::test]
    async fn exit_is_reported_while_a_grandchild_holds_the_pipes() {
        let mut texts = Vec::new();
        let exit = tokio::time::timeout(
            Duration::from_secs(10),
            run_to_exit(&sh("echo hi; sleep 20 & exit 0"), |line| {
                texts.push(line.text.clone());
            }),
        )
        .await
        .expect("run_to_exit must not wait for the detached sleep")
        .unwrap();

        assert!(exit.success());
        assert_eq!(texts, vec!["hi"]);
    }

    #[tokio::test]
    async fn terminate_sends_sigterm() {
        let process = spawn_tool(&sh("sleep 30")).unwrap();
        assert!(process.handle.terminate());
        let exit = process.handle.wait().await;
        assert_eq!(exit.code, None);
        assert!(!exit.killed);
        assert!(!process.handle.terminate());
    }
}
