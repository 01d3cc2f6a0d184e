//! Child process lifecycle for stdio MCP servers.
//!
//! [`ProcessHandle`] owns the child and its three pipes. Stdin is owned by a
//! writer thread fed through a channel, so callers can stop waiting on a
//! server that no longer reads. Stdout is handed to the router, and stderr is
//! drained on its own thread so the child never blocks on a full pipe.

use std::io::{self, BufRead, BufReader, ErrorKind, Write};
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError, Sender, SyncSender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::McpServerConfig;
use crate::correlator::LineSink;
use crate::error::{McpError, Result};

/// Most stderr output retained for error reports.
const STDERR_CAPACITY: usize = 64 * 1024;

/// How often to poll the child while waiting for it to exit.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Lifecycle of the server process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildState {
    /// Spawned, still inside the startup grace period.
    Starting,
    /// Confirmed alive.
    Running,
    /// Exited on its own. Holds the exit code when there is one.
    Exited(Option<i32>),
    /// Shut down by us.
    Terminated,
}

impl ChildState {
    /// Whether no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Exited(_) | Self::Terminated)
    }
}

/// Drains the child's stderr into a bounded buffer.
struct StderrCapture {
    buf: Arc<Mutex<String>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl StderrCapture {
    fn spawn(server: &str, stderr: ChildStderr) -> io::Result<Self> {
        let buf = Arc::new(Mutex::new(String::new()));
        let sink = Arc::clone(&buf);
        let server = server.to_string();

        let handle = thread::Builder::new()
            .name(format!("mcp-stderr-{server}"))
            .spawn(move || {
                let mut reader = BufReader::new(stderr);
                let mut line = Vec::new();
                loop {
                    line.clear();
                    match reader.read_until(b'\n', &mut line) {
                        Ok(0) => break,
                        Ok(_) => {
                            let text = String::from_utf8_lossy(&line);
                            tracing::debug!(server = %server, line = %text.trim_end(), "server stderr");
                            push_bounded(&mut sink.lock(), &text);
                        }
                        Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                        Err(_) => break,
                    }
                }
            })?;

        Ok(Self {
            buf,
            handle: Mutex::new(Some(handle)),
        })
    }

    fn contents(&self) -> String {
        self.buf.lock().clone()
    }

    /// Wait up to `timeout` for stderr to reach EOF.
    fn wait_drained(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        loop {
            let finished = self
                .handle
                .lock()
                .as_ref()
                .is_none_or(JoinHandle::is_finished);
            if finished || Instant::now() >= deadline {
                break;
            }
            thread::sleep(EXIT_POLL_INTERVAL);
        }
        if let Some(handle) = self.handle.lock().take_if(|h| h.is_finished()) {
            let _ = handle.join();
        }
    }
}

fn push_bounded(buf: &mut String, text: &str) {
    buf.push_str(text);
    if buf.len() > STDERR_CAPACITY {
        let mut cut = buf.len() - STDERR_CAPACITY;
        while !buf.is_char_boundary(cut) {
            cut += 1;
        }
        buf.drain(..cut);
    }
}

/// One framed line for the stdin writer, and where to report how it went.
type WriteJob = (Vec<u8>, SyncSender<io::Result<()>>);

/// Move `stdin` onto its own thread. Jobs are written in order; the thread
/// stops at the first failed write or once every sender is dropped, and
/// closes the pipe on the way out.
fn spawn_stdin_writer(server: &str, mut stdin: ChildStdin) -> io::Result<Sender<WriteJob>> {
    let (tx, rx) = mpsc::channel::<WriteJob>();
    thread::Builder::new()
        .name(format!("mcp-stdin-{server}"))
        .spawn(move || {
            for (bytes, ack) in rx {
                let result = stdin.write_all(&bytes).and_then(|()| stdin.flush());
                let failed = result.is_err();
                let _ = ack.send(result);
                if failed {
                    break;
                }
            }
        })?;
    Ok(tx)
}

fn stdin_closed() -> io::Error {
    io::Error::new(ErrorKind::BrokenPipe, "server stdin is closed")
}

/// A running (or finished) MCP server process.
pub struct ProcessHandle {
    name: String,
    pid: u32,
    child: Mutex<Child>,
    /// Feeds the stdin writer thread. `None` once stdin has been closed.
    stdin: Mutex<Option<Sender<WriteJob>>>,
    stdout: Mutex<Option<ChildStdout>>,
    stderr: StderrCapture,
    state: Mutex<ChildState>,
}

impl ProcessHandle {
    /// Spawn the server described by `config` and wait out its startup grace
    /// period.
    ///
    /// Fails with [`McpError::Launch`] if the executable cannot be spawned or
    /// the process has already exited when the grace period ends.
    pub fn start(config: &McpServerConfig) -> Result<Self> {
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        for (key, value) in &config.env {
            cmd.env(key, value);
        }
        if let Some(cwd) = &config.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn().map_err(|e| {
            McpError::launch(format!("failed to spawn '{}': {}", config.command, e))
        })?;

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(McpError::launch("failed to capture stdio pipes"));
        };

        let stderr = match StderrCapture::spawn(&config.name, stderr) {
            Ok(capture) => capture,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(McpError::launch(format!("failed to start stderr reader: {e}")));
            }
        };
        let stdin = match spawn_stdin_writer(&config.name, stdin) {
            Ok(tx) => tx,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(McpError::launch(format!("failed to start stdin writer: {e}")));
            }
        };

        let handle = Self {
            name: config.name.clone(),
            pid: child.id(),
            child: Mutex::new(child),
            stdin: Mutex::new(Some(stdin)),
            stdout: Mutex::new(Some(stdout)),
            stderr,
            state: Mutex::new(ChildState::Starting),
        };

        thread::sleep(config.startup_grace);

        let status = handle.child.lock().try_wait();
        match status {
            Ok(None) => {
                *handle.state.lock() = ChildState::Running;
                tracing::info!(
                    server = %handle.name,
                    command = %config.command,
                    pid = handle.pid,
                    "MCP server process started"
                );
                Ok(handle)
            }
            Ok(Some(status)) => {
                *handle.state.lock() = ChildState::Exited(status.code());
                handle.stderr.wait_drained(Duration::from_secs(1));
                Err(McpError::launch_with_stderr(
                    format!("'{}' exited during startup ({status})", config.command),
                    handle.stderr.contents(),
                ))
            }
            Err(e) => Err(McpError::launch(format!(
                "failed to query '{}' status: {e}",
                config.command
            ))),
        }
    }

    /// Server name from the launch configuration.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// OS process id.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Take the read end of the child's stdout. Only the first call gets it.
    pub fn take_stdout(&self) -> Option<ChildStdout> {
        self.stdout.lock().take()
    }

    /// Everything retained from the child's stderr so far.
    pub fn stderr_output(&self) -> String {
        self.stderr.contents()
    }

    /// Current lifecycle state, after checking whether the child has exited.
    pub fn state(&self) -> ChildState {
        let mut state = self.state.lock();
        if !state.is_terminal() {
            if let Ok(Some(status)) = self.child.lock().try_wait() {
                tracing::warn!(server = %self.name, %status, "MCP server exited");
                *state = ChildState::Exited(status.code());
            }
        }
        *state
    }

    /// Whether the child is still running.
    pub fn is_alive(&self) -> bool {
        !self.state().is_terminal()
    }

    /// Shut the child down: close its stdin, give it `grace` to exit, then
    /// kill it. Idempotent; a child that already exited is left as-is.
    ///
    /// A child that exits after stdin closes ends as [`ChildState::Exited`];
    /// one that has to be killed ends as [`ChildState::Terminated`]. The state
    /// lock is not held while waiting, so [`state`](Self::state) stays
    /// responsive.
    pub fn terminate(&self, grace: Duration) -> Result<()> {
        let deadline = Instant::now() + grace;

        // Closing stdin is the polite way to ask a stdio server to stop.
        let closed = match self.stdin.try_lock_for(grace) {
            Some(mut stdin) => {
                drop(stdin.take());
                true
            }
            None => false,
        };
        if self.state().is_terminal() {
            return Ok(());
        }

        let exited = if closed {
            self.wait_for_exit(deadline)?
        } else {
            tracing::debug!(server = %self.name, "stdin busy; skipping graceful shutdown");
            None
        };

        let mut state = self.state.lock();
        if state.is_terminal() {
            return Ok(());
        }
        let mut child = self.child.lock();
        let status = match exited {
            Some(status) => Some(status),
            None => child.try_wait()?,
        };
        *state = match status {
            Some(status) => {
                tracing::debug!(server = %self.name, %status, "MCP server exited after stdin closed");
                ChildState::Exited(status.code())
            }
            None => {
                tracing::debug!(server = %self.name, pid = self.pid, "killing MCP server");
                match child.kill() {
                    Ok(()) => {}
                    // Already exited between try_wait and kill.
                    Err(e) if e.kind() == ErrorKind::InvalidInput => {}
                    Err(e) => return Err(e.into()),
                }
                child.wait()?;
                ChildState::Terminated
            }
        };

        tracing::info!(server = %self.name, state = ?*state, "MCP server stopped");
        Ok(())
    }

    /// Poll until the child exits or `deadline` passes, taking the child lock
    /// only for each check.
    fn wait_for_exit(&self, deadline: Instant) -> Result<Option<ExitStatus>> {
        loop {
            if let Some(status) = self.child.lock().try_wait()? {
                return Ok(Some(status));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            thread::sleep(EXIT_POLL_INTERVAL);
        }
    }
}

impl LineSink for ProcessHandle {
    fn send_line(&self, line: &str, timeout: Duration) -> io::Result<()> {
        let mut framed = Vec::with_capacity(line.len() + 1);
        framed.extend_from_slice(line.as_bytes());
        framed.push(b'\n');

        let (ack_tx, ack_rx) = mpsc::sync_channel(1);
        self.stdin
            .lock()
            .as_ref()
            .ok_or_else(stdin_closed)?
            .send((framed, ack_tx))
            .map_err(|_| stdin_closed())?;

        // On timeout the line stays queued; later lines are written after it.
        match ack_rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(io::Error::new(
                ErrorKind::TimedOut,
                "server is not reading its stdin",
            )),
            Err(RecvTimeoutError::Disconnected) => Err(stdin_closed()),
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        let _ = self.terminate(Duration::ZERO);
    }
}
