//! One long-lived shell process and its command queue.
//!
//! The queue owns the spawned shell's streams and an explicit FIFO of
//! commands. Up to `concurrent_cmds` commands are transmitted ahead of their
//! completions; the raw output stream is demultiplexed back to them by
//! scanning for each command's unique marker followed by the one-character
//! exit-status probe. Bytes before the oldest command's marker belong to that
//! command; a marker or status split across reads is withheld in a carry
//! buffer until the next read completes it.

mod side;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command as ProcessCommand;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use shellpool_core::{PoolConfig, Result, ShellError, decode_line, encode_line};

use command_fds::CommandFdExt;

use crate::command::{Command, CommandFifo, QueueIo};
use side::{SIDE_CHANNEL_FD, SIDE_CHANNEL_FD_ENV};

/// Size of the buffer handed to each stdout/stderr read.
const READ_BUF_SIZE: usize = 8192;

/// Lifecycle state of a process queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    /// Spawning; not yet accepting commands.
    Init,
    /// Accepting and executing commands.
    Online,
    /// Deliberately shut down; queued commands were cancelled.
    Shutdown,
    /// The shell closed its output stream.
    Closed,
    /// The shell process failed.
    Error,
    /// The shell process exited on its own.
    Exited,
}

/// Mutable queue state behind the queue's lock.
struct QueueInner {
    state: QueueState,
    fifo: CommandFifo,
    /// Commands transmitted to the shell but not yet completed. Always the
    /// first `running` entries of the FIFO.
    running: usize,
    ceiling: usize,
    /// Output bytes withheld from attribution: the unmatched suffix of the
    /// previous read that may be a marker or status probe cut mid-way.
    carry: String,
    stdin_tx: mpsc::UnboundedSender<String>,
    side_tx: Option<mpsc::UnboundedSender<Value>>,
    /// Pinged on every completion so the pool can drain pending work.
    finished_tx: Option<mpsc::UnboundedSender<()>>,
}

impl QueueInner {
    fn new(
        ceiling: usize,
        stdin_tx: mpsc::UnboundedSender<String>,
        side_tx: Option<mpsc::UnboundedSender<Value>>,
        finished_tx: Option<mpsc::UnboundedSender<()>>,
    ) -> Self {
        Self {
            state: QueueState::Online,
            fifo: CommandFifo::default(),
            running: 0,
            ceiling: ceiling.max(1),
            carry: String::new(),
            stdin_tx,
            side_tx,
            finished_tx,
        }
    }

    /// Accept a command into the FIFO, or cancel it if the queue is no longer
    /// accepting work.
    fn enqueue(&mut self, cmd: Command) {
        if self.state != QueueState::Online {
            cmd.cancel();
            return;
        }
        cmd.mark_enqueued(QueueIo {
            stdin_tx: self.stdin_tx.clone(),
            side_tx: self.side_tx.clone(),
        });
        self.fifo.push(cmd);
        self.top_up();
    }

    /// Transmit queued commands until the concurrency ceiling is reached.
    fn top_up(&mut self) {
        if self.state != QueueState::Online {
            return;
        }
        while self.running < self.ceiling {
            // Commands cancelled before transmission never reach the shell.
            while self
                .fifo
                .get(self.running)
                .is_some_and(Command::is_resolved)
            {
                self.fifo.remove(self.running);
            }
            let Some(cmd) = self.fifo.get(self.running) else {
                return;
            };
            let cmd = cmd.clone();
            let text = cmd.transmit_text();
            debug!(command = %cmd.text(), "Transmitting command");
            if self.stdin_tx.send(text).is_err() {
                // Writer task is gone; the monitor tears the queue down.
                return;
            }
            self.running += 1;
            cmd.mark_executing();
        }
    }

    /// Demultiplex a chunk of shell output back onto the FIFO.
    fn handle_chunk(&mut self, chunk: &str) {
        let mut buf = std::mem::take(&mut self.carry);
        buf.push_str(chunk);
        loop {
            let Some(head) = self.fifo.front().cloned() else {
                // No command in flight: withhold everything until one is.
                self.carry = buf;
                return;
            };
            let marker = head.marker();
            if let Some(at) = buf.find(&marker) {
                if at > 0 {
                    head.receive_chunk(&buf[..at]);
                }
                let after = at + marker.len();
                let Some(status) = buf[after..].chars().next() else {
                    // Marker seen but its status probe not yet read.
                    self.carry = buf[at..].to_string();
                    return;
                };
                buf = buf[after + status.len_utf8()..].to_string();
                self.handle_finished(status != '0', None);
            } else {
                let withheld = partial_suffix_len(&buf, &marker);
                let data_end = buf.len() - withheld;
                if data_end > 0 {
                    head.receive_chunk(&buf[..data_end]);
                }
                self.carry = buf.split_off(data_end);
                return;
            }
        }
    }

    /// Complete the oldest command and admit the next one. `fail_error`
    /// replaces the normal exit-status resolution when set.
    fn handle_finished(&mut self, failed: bool, fail_error: Option<ShellError>) {
        let Some(cmd) = self.fifo.pop_front() else {
            return;
        };
        self.running = self.running.saturating_sub(1);
        self.top_up();
        match fail_error {
            Some(error) => cmd.fail(error),
            None => cmd.finish(failed),
        }
        if let Some(tx) = &self.finished_tx {
            let _ = tx.send(());
        }
    }

    /// Output on stderr breaks the framing contract: every transmitted
    /// command redirects stderr into stdout, so whatever produced this got
    /// past the trailer. Attribute it to the oldest command and fail it.
    fn handle_stderr(&mut self, data: &str) {
        if let Some(head) = self.fifo.front().cloned() {
            error!(command = %head.text(), stderr = data, "Unexpected stderr output");
            let error = ShellError::ProtocolViolation {
                command: head.text(),
                stderr: data.to_string(),
            };
            self.handle_finished(true, Some(error));
        } else {
            warn!(stderr = data, "Stderr output with no command in flight");
        }
    }

    /// Route a side-channel message to the oldest command in flight.
    fn handle_message(&mut self, message: Value) {
        if let Some(head) = self.fifo.front() {
            head.receive_message(message);
        } else {
            warn!(?message, "Side-channel message with no command in flight");
        }
    }

    /// Mark the queue shut down and cancel everything still queued. Returns
    /// `false` when already shut down.
    fn shutdown(&mut self) -> bool {
        if self.state == QueueState::Shutdown {
            return false;
        }
        self.state = QueueState::Shutdown;
        self.cancel_all();
        true
    }

    fn cancel_all(&mut self) {
        for cmd in self.fifo.drain() {
            cmd.cancel();
        }
        self.running = 0;
        self.carry.clear();
    }

    /// Reject every queued command after the shell died under it.
    fn fail_all(&mut self, error: &ShellError) {
        for cmd in self.fifo.drain() {
            cmd.fail(error.clone());
        }
        self.running = 0;
        self.carry.clear();
        if let Some(tx) = &self.finished_tx {
            let _ = tx.send(());
        }
    }

    fn mark_stream_closed(&mut self) {
        if self.state == QueueState::Online {
            self.state = QueueState::Closed;
        }
    }
}

/// Length of the longest proper marker prefix that the chunk ends with.
/// Those bytes may be the start of a marker finishing in the next read.
fn partial_suffix_len(buf: &str, marker: &str) -> usize {
    let max = marker.len().saturating_sub(1).min(buf.len());
    (1..=max)
        .rev()
        .find(|&n| buf.is_char_boundary(buf.len() - n) && buf.ends_with(&marker[..n]))
        .unwrap_or(0)
}

/// A spawned shell process with its command FIFO and stream tasks.
pub(crate) struct ShellQueue {
    inner: Arc<Mutex<QueueInner>>,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
    pid: Option<u32>,
}

fn lock_inner(inner: &Arc<Mutex<QueueInner>>) -> MutexGuard<'_, QueueInner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ShellQueue {
    /// Spawn the shell process and the tasks that service its streams.
    pub(crate) fn spawn(
        config: &PoolConfig,
        finished_tx: Option<mpsc::UnboundedSender<()>>,
    ) -> Result<Arc<Self>> {
        let side = if config.side_channel {
            Some(side::create()?)
        } else {
            None
        };

        let mut process = ProcessCommand::new(&config.shell);
        process
            .args(&config.spawn_args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());
        let side_stream = match side {
            Some((stream, mapping)) => {
                process.env(SIDE_CHANNEL_FD_ENV, SIDE_CHANNEL_FD.to_string());
                process
                    .fd_mappings(vec![mapping])
                    .map_err(|e| ShellError::SpawnFailed {
                        reason: format!("side-channel fd mapping: {e}"),
                    })?;
                Some(stream)
            }
            None => None,
        };
        let mut child = process.spawn().map_err(|e| ShellError::SpawnFailed {
            reason: format!("{}: {e}", config.shell),
        })?;
        let pid = child.id();
        info!(pid, shell = %config.shell, "Shell process online");

        let stdin = child.stdin.take().ok_or_else(|| ShellError::SpawnFailed {
            reason: "stdin not captured".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| ShellError::SpawnFailed {
            reason: "stdout not captured".to_string(),
        })?;
        let stderr = child.stderr.take().ok_or_else(|| ShellError::SpawnFailed {
            reason: "stderr not captured".to_string(),
        })?;

        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel::<String>();
        let side_pair = side_stream.map(|stream| {
            let (side_tx, side_rx) = mpsc::unbounded_channel::<Value>();
            (stream, side_tx, side_rx)
        });
        let side_tx = side_pair.as_ref().map(|(_, tx, _)| tx.clone());

        let inner = Arc::new(Mutex::new(QueueInner::new(
            config.concurrent_cmds,
            stdin_tx,
            side_tx,
            finished_tx,
        )));

        Self::run_stdin_writer(stdin, stdin_rx);
        Self::run_stdout_reader(Arc::clone(&inner), stdout);
        Self::run_stderr_reader(Arc::clone(&inner), stderr);
        if let Some((stream, _, side_rx)) = side_pair {
            Self::run_side_channel(Arc::clone(&inner), stream, side_rx);
        }

        let (kill_tx, kill_rx) = oneshot::channel();
        Self::run_monitor(Arc::clone(&inner), child, kill_rx, pid);

        Ok(Arc::new(Self {
            inner,
            kill_tx: Mutex::new(Some(kill_tx)),
            pid,
        }))
    }

    fn run_stdin_writer(
        mut stdin: tokio::process::ChildStdin,
        mut stdin_rx: mpsc::UnboundedReceiver<String>,
    ) {
        tokio::spawn(async move {
            while let Some(text) = stdin_rx.recv().await {
                if let Err(e) = stdin.write_all(text.as_bytes()).await {
                    error!(error = %e, "Failed to write to shell stdin");
                    break;
                }
                if let Err(e) = stdin.flush().await {
                    error!(error = %e, "Failed to flush shell stdin");
                    break;
                }
            }
        });
    }

    fn run_stdout_reader(inner: Arc<Mutex<QueueInner>>, mut stdout: tokio::process::ChildStdout) {
        tokio::spawn(async move {
            let mut buf = vec![0_u8; READ_BUF_SIZE];
            loop {
                match stdout.read(&mut buf).await {
                    Ok(0) => {
                        lock_inner(&inner).mark_stream_closed();
                        debug!("Shell stdout closed");
                        break;
                    }
                    Ok(n) => {
                        let chunk = String::from_utf8_lossy(&buf[..n]).into_owned();
                        lock_inner(&inner).handle_chunk(&chunk);
                    }
                    Err(e) => {
                        warn!(error = %e, "Shell stdout read failed");
                        break;
                    }
                }
            }
        });
    }

    fn run_stderr_reader(inner: Arc<Mutex<QueueInner>>, mut stderr: tokio::process::ChildStderr) {
        tokio::spawn(async move {
            let mut buf = vec![0_u8; READ_BUF_SIZE];
            loop {
                match stderr.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        let data = String::from_utf8_lossy(&buf[..n]).into_owned();
                        lock_inner(&inner).handle_stderr(&data);
                    }
                    Err(e) => {
                        warn!(error = %e, "Shell stderr read failed");
                        break;
                    }
                }
            }
        });
    }

    fn run_side_channel(
        inner: Arc<Mutex<QueueInner>>,
        stream: tokio::net::UnixStream,
        mut side_rx: mpsc::UnboundedReceiver<Value>,
    ) {
        let (read_half, mut write_half) = stream.into_split();
        tokio::spawn(async move {
            let mut lines = BufReader::new(read_half).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(message) = decode_line(&line) {
                    lock_inner(&inner).handle_message(message);
                }
            }
            debug!("Side-channel closed");
        });
        tokio::spawn(async move {
            while let Some(message) = side_rx.recv().await {
                match encode_line(&message) {
                    Ok(line) => {
                        if let Err(e) = write_half.write_all(line.as_bytes()).await {
                            warn!(error = %e, "Side-channel write failed");
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "Unencodable side-channel message"),
                }
            }
        });
    }

    fn run_monitor(
        inner: Arc<Mutex<QueueInner>>,
        mut child: tokio::process::Child,
        kill_rx: oneshot::Receiver<()>,
        pid: Option<u32>,
    ) {
        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    let mut guard = lock_inner(&inner);
                    if guard.state == QueueState::Shutdown {
                        return;
                    }
                    match status {
                        Ok(status) => {
                            info!(pid, %status, "Shell process exited");
                            guard.state = QueueState::Exited;
                            guard.fail_all(&ShellError::ProcessFailed(format!(
                                "shell process exited: {status}"
                            )));
                        }
                        Err(e) => {
                            error!(pid, error = %e, "Shell process failed");
                            guard.state = QueueState::Error;
                            guard.fail_all(&ShellError::ProcessFailed(e.to_string()));
                        }
                    }
                }
                // Fires on shutdown, and on drop of the queue handle.
                _ = kill_rx => {
                    if let Err(e) = child.start_kill() {
                        warn!(pid, error = %e, "Failed to kill shell process");
                    }
                    let _ = child.wait().await;
                    info!(pid, "Shell process killed");
                }
            }
        });
    }

    /// Submit a command to this queue.
    pub(crate) fn enqueue(&self, cmd: Command) {
        lock_inner(&self.inner).enqueue(cmd);
    }

    /// Whether another command can be accepted without exceeding the
    /// concurrency ceiling.
    pub(crate) fn has_capacity(&self) -> bool {
        let guard = lock_inner(&self.inner);
        guard.state == QueueState::Online && guard.fifo.len() < guard.ceiling
    }

    /// Number of commands queued or in flight.
    pub(crate) fn len(&self) -> usize {
        lock_inner(&self.inner).fifo.len()
    }

    pub(crate) fn state(&self) -> QueueState {
        lock_inner(&self.inner).state
    }

    pub(crate) fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Cancel queued commands and kill the shell process. Idempotent.
    pub(crate) fn shutdown(&self) {
        let first = lock_inner(&self.inner).shutdown();
        if !first {
            return;
        }
        let kill_tx = self
            .kill_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(tx) = kill_tx {
            let _ = tx.send(());
        }
        info!(pid = self.pid, "Process queue shut down");
    }
}

impl Drop for ShellQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}
