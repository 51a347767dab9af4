//! A discrete command/script to execute on a shell.
//!
//! Commands resolve a completion handle exactly once -- with the captured
//! output and exit status, or with an error if cancelled or failed. They also
//! publish lifecycle notifications as they progress: `Enqueued`, `Executing`,
//! `Data`, `Message`, `Cancelled`, `Failed`, `Finished`.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::debug;

use shellpool_core::{CommandReport, CommandResult, DoneCallback, Result, ShellError};

/// Capacity of the per-command lifecycle event channel. Data events are one
/// per stream read, so bursts stay well under this.
const EVENT_CAPACITY: usize = 256;

/// Lifecycle state of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    Created,
    Enqueued,
    Executing,
    ReceivingData,
    Finished,
    Failed,
    Cancelled,
}

impl CommandState {
    /// Terminal states never transition again.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Failed | Self::Cancelled)
    }
}

/// Lifecycle notification published to subscribed observers.
#[derive(Debug, Clone)]
pub enum CommandEvent {
    /// Accepted into a process queue's FIFO.
    Enqueued,
    /// Transmitted to the shell's input stream.
    Executing,
    /// A chunk of output was attributed to this command.
    Data(String),
    /// A side-channel message was routed to this command.
    Message(Value),
    /// The command was cancelled; the completion handle rejects.
    Cancelled,
    /// The command failed; the completion handle rejects.
    Failed,
    /// The exit-status probe was observed; the completion handle resolves.
    Finished,
}

/// Lifecycle timestamps, recorded as monotonic instants.
#[derive(Debug, Clone, Copy)]
pub struct CommandTimestamps {
    pub created: Instant,
    pub enqueued: Option<Instant>,
    pub started: Option<Instant>,
    pub first_data: Option<Instant>,
    pub finished: Option<Instant>,
}

/// Write ends of the owning queue's process streams, attached when the
/// command is accepted into a queue.
#[derive(Clone)]
pub(crate) struct QueueIo {
    pub(crate) stdin_tx: mpsc::UnboundedSender<String>,
    pub(crate) side_tx: Option<mpsc::UnboundedSender<Value>>,
}

struct CommandCore {
    text: String,
    marker: String,
    auto_done: bool,
    payload: Option<Value>,
    callback: Option<DoneCallback>,
    output: String,
    error: Option<ShellError>,
    state: CommandState,
    timestamps: CommandTimestamps,
    done_tx: Option<oneshot::Sender<Result<CommandResult>>>,
    events: broadcast::Sender<CommandEvent>,
    io: Option<QueueIo>,
}

/// Shared command state. Clones refer to the same command: one clone sits in
/// a queue's FIFO for framing, others back the caller-facing handle/control.
#[derive(Clone)]
pub(crate) struct Command {
    core: Arc<Mutex<CommandCore>>,
}

impl Command {
    pub(crate) fn new(
        text: String,
        marker: String,
        auto_done: bool,
        payload: Option<Value>,
        callback: Option<DoneCallback>,
    ) -> (Self, CommandHandle) {
        let (done_tx, done_rx) = oneshot::channel();
        let (events, events_rx) = broadcast::channel(EVENT_CAPACITY);
        let cmd = Self {
            core: Arc::new(Mutex::new(CommandCore {
                text,
                marker,
                auto_done,
                payload,
                callback,
                output: String::new(),
                error: None,
                state: CommandState::Created,
                timestamps: CommandTimestamps {
                    created: Instant::now(),
                    enqueued: None,
                    started: None,
                    first_data: None,
                    finished: None,
                },
                done_tx: Some(done_tx),
                events,
                io: None,
            })),
        };
        let handle = CommandHandle {
            outcome: done_rx,
            events: Some(events_rx),
            cmd: cmd.clone(),
        };
        (cmd, handle)
    }

    fn lock(&self) -> MutexGuard<'_, CommandCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The text written to the shell's input: the raw command in interactive
    /// mode, or the command wrapped with the status+marker trailer.
    pub(crate) fn transmit_text(&self) -> String {
        let core = self.lock();
        if core.auto_done {
            format!(
                "{{ {} }} 2>&1;\nprintf '{}'$?;\n",
                core.text, core.marker
            )
        } else {
            core.text.clone()
        }
    }

    /// Attach the owning queue's streams and mark the command enqueued.
    pub(crate) fn mark_enqueued(&self, io: QueueIo) {
        let events = {
            let mut core = self.lock();
            core.io = Some(io);
            if core.state.is_terminal() {
                return;
            }
            core.timestamps.enqueued = Some(Instant::now());
            core.state = CommandState::Enqueued;
            core.events.clone()
        };
        let _ = events.send(CommandEvent::Enqueued);
    }

    /// Mark the command transmitted to the shell.
    pub(crate) fn mark_executing(&self) {
        let events = {
            let mut core = self.lock();
            if core.state.is_terminal() {
                return;
            }
            core.timestamps.started = Some(Instant::now());
            core.state = CommandState::Executing;
            core.events.clone()
        };
        let _ = events.send(CommandEvent::Executing);
    }

    /// Append a chunk of attributed output.
    pub(crate) fn receive_chunk(&self, chunk: &str) {
        let events = {
            let mut core = self.lock();
            core.output.push_str(chunk);
            if core.timestamps.first_data.is_none() {
                core.timestamps.first_data = Some(Instant::now());
            }
            if core.state.is_terminal() {
                return;
            }
            core.state = CommandState::ReceivingData;
            core.events.clone()
        };
        let _ = events.send(CommandEvent::Data(chunk.to_string()));
    }

    /// Route a side-channel message to this command's observers.
    pub(crate) fn receive_message(&self, message: Value) {
        let events = self.lock().events.clone();
        debug!(?message, "Side-channel message routed to command");
        let _ = events.send(CommandEvent::Message(message));
    }

    /// Resolve the completion handle. `failed` is the exit-status probe's
    /// verdict. No-op if the command already resolved.
    pub(crate) fn finish(&self, failed: bool) {
        let (tx, report, callback, payload, events) = {
            let mut core = self.lock();
            let Some(tx) = core.done_tx.take() else { return };
            core.timestamps.finished = Some(Instant::now());
            core.state = CommandState::Finished;
            core.error = failed.then_some(ShellError::NonZeroStatus);
            let report = CommandReport {
                error: core.error.clone(),
                command: core.text.clone(),
                output: core.output.clone(),
            };
            (
                tx,
                report,
                core.callback.clone(),
                core.payload.clone(),
                core.events.clone(),
            )
        };
        debug!(command = %report.command, failed, "Command finished");
        let _ = events.send(CommandEvent::Finished);
        if let Some(callback) = callback {
            // User code may be async; never block the queue's reader loop.
            tokio::spawn(async move {
                let value = callback(report, payload).await;
                let _ = tx.send(Ok(CommandResult::Custom(value)));
            });
        } else {
            let _ = tx.send(Ok(CommandResult::Report(report)));
        }
    }

    /// Reject the completion handle with `error`. No-op if already resolved.
    pub(crate) fn fail(&self, error: ShellError) {
        let (tx, events) = {
            let mut core = self.lock();
            let Some(tx) = core.done_tx.take() else { return };
            core.state = CommandState::Failed;
            core.error = Some(error.clone());
            (tx, core.events.clone())
        };
        let _ = events.send(CommandEvent::Failed);
        let _ = tx.send(Err(error));
    }

    /// Reject the completion handle with a cancellation error, independent of
    /// current state. No-op if already resolved.
    pub(crate) fn cancel(&self) {
        let (tx, events) = {
            let mut core = self.lock();
            let Some(tx) = core.done_tx.take() else { return };
            core.state = CommandState::Cancelled;
            (tx, core.events.clone())
        };
        let _ = events.send(CommandEvent::Cancelled);
        let _ = tx.send(Err(ShellError::Cancelled));
    }

    fn io(&self) -> Result<QueueIo> {
        self.lock().io.clone().ok_or(ShellError::NotAttached)
    }

    /// Write raw text to the owning shell's input stream.
    pub(crate) fn write_stdin(&self, text: String) -> Result<()> {
        self.io()?
            .stdin_tx
            .send(text)
            .map_err(|_| ShellError::ProcessFailed("stdin writer closed".to_string()))
    }

    /// Write the exit-status probe, completing an interactive session.
    pub(crate) fn send_done_marker(&self) -> Result<()> {
        let marker = self.marker();
        self.write_stdin(format!("printf '{marker}'$?;\n"))
    }

    /// Send a structured message over the owning queue's side-channel.
    pub(crate) fn send_message(&self, message: Value) -> Result<()> {
        let io = self.io()?;
        let side_tx = io.side_tx.ok_or(ShellError::NoSideChannel)?;
        side_tx
            .send(message)
            .map_err(|_| ShellError::ProcessFailed("side-channel writer closed".to_string()))
    }

    pub(crate) fn marker(&self) -> String {
        self.lock().marker.clone()
    }

    pub(crate) fn text(&self) -> String {
        self.lock().text.clone()
    }

    pub(crate) fn state(&self) -> CommandState {
        self.lock().state
    }

    pub(crate) fn output(&self) -> String {
        self.lock().output.clone()
    }

    pub(crate) fn timestamps(&self) -> CommandTimestamps {
        self.lock().timestamps
    }

    pub(crate) fn is_resolved(&self) -> bool {
        self.lock().done_tx.is_none()
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<CommandEvent> {
        self.lock().events.subscribe()
    }
}

/// Caller-facing completion handle for a submitted command.
pub struct CommandHandle {
    outcome: oneshot::Receiver<Result<CommandResult>>,
    events: Option<broadcast::Receiver<CommandEvent>>,
    cmd: Command,
}

impl CommandHandle {
    /// Suspend until the command completes, is cancelled, or fails.
    pub async fn wait(self) -> Result<CommandResult> {
        match self.outcome.await {
            Ok(result) => result,
            // The queue dropped the command without resolving it; treat as
            // cancellation.
            Err(_) => Err(ShellError::Cancelled),
        }
    }

    /// Lifecycle notifications. The first call returns the receiver created
    /// with the command, which has missed nothing; later calls subscribe from
    /// the current point.
    pub fn events(&mut self) -> broadcast::Receiver<CommandEvent> {
        self.events.take().unwrap_or_else(|| self.cmd.subscribe())
    }

    /// Clonable control handle for interactive use.
    pub fn control(&self) -> CommandControl {
        CommandControl {
            cmd: self.cmd.clone(),
        }
    }

    /// Cancel the command, rejecting the completion handle.
    pub fn cancel(&self) {
        self.cmd.cancel();
    }

    pub fn state(&self) -> CommandState {
        self.cmd.state()
    }

    /// Snapshot of the output accumulated so far.
    pub fn output(&self) -> String {
        self.cmd.output()
    }

    /// This command's unique marker token.
    pub fn marker(&self) -> String {
        self.cmd.marker()
    }

    pub fn timestamps(&self) -> CommandTimestamps {
        self.cmd.timestamps()
    }
}

/// Control surface for interactive (non-autodone) commands: write to the
/// shell's stdin mid-execution, exchange side-channel messages, and signal
/// completion with the done-marker probe.
#[derive(Clone)]
pub struct CommandControl {
    cmd: Command,
}

impl CommandControl {
    /// Write raw text to the shell executing this command.
    pub fn write_stdin(&self, text: impl Into<String>) -> Result<()> {
        self.cmd.write_stdin(text.into())
    }

    /// Write the exit-status probe; the command completes once the shell
    /// executes it and the marker is observed on output.
    pub fn send_done_marker(&self) -> Result<()> {
        self.cmd.send_done_marker()
    }

    /// Send a structured message to the script over the side-channel.
    pub fn send_message(&self, message: Value) -> Result<()> {
        self.cmd.send_message(message)
    }

    /// Cancel the command, rejecting the completion handle.
    pub fn cancel(&self) {
        self.cmd.cancel();
    }

    pub fn state(&self) -> CommandState {
        self.cmd.state()
    }

    /// Snapshot of the output accumulated so far.
    pub fn output(&self) -> String {
        self.cmd.output()
    }
}

/// Explicit FIFO of commands owned by one process queue. Index 0 is the
/// oldest unfinished command -- the one whose output the shell is currently
/// producing.
#[derive(Default)]
pub(crate) struct CommandFifo {
    items: VecDeque<Command>,
}

impl CommandFifo {
    pub(crate) fn push(&mut self, cmd: Command) {
        self.items.push_back(cmd);
    }

    pub(crate) fn pop_front(&mut self) -> Option<Command> {
        self.items.pop_front()
    }

    pub(crate) fn front(&self) -> Option<&Command> {
        self.items.front()
    }

    pub(crate) fn get(&self, index: usize) -> Option<&Command> {
        self.items.get(index)
    }

    pub(crate) fn remove(&mut self, index: usize) -> Option<Command> {
        self.items.remove(index)
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub(crate) fn drain(&mut self) -> impl Iterator<Item = Command> + '_ {
        self.items.drain(..)
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn cmd(auto_done: bool) -> (Command, CommandHandle) {
        Command::new(
            "printf HELLO;".to_string(),
            "__done__0000001@".to_string(),
            auto_done,
            None,
            None,
        )
    }

    #[test]
    fn autodone_trailer_wraps_command_and_probes_status() {
        let (cmd, _handle) = cmd(true);
        assert_eq!(
            cmd.transmit_text(),
            "{ printf HELLO; } 2>&1;\nprintf '__done__0000001@'$?;\n"
        );
    }

    #[test]
    fn interactive_text_is_transmitted_verbatim() {
        let (cmd, _handle) = Command::new(
            "read name;\n".to_string(),
            "__done__0000002@".to_string(),
            false,
            None,
            None,
        );
        assert_eq!(cmd.transmit_text(), "read name;\n");
    }

    #[tokio::test]
    async fn finish_resolves_with_report() {
        let (cmd, handle) = cmd(true);
        cmd.receive_chunk("HELLO");
        cmd.finish(false);
        let report = handle.wait().await.unwrap().into_report().unwrap();
        assert_eq!(report.output, "HELLO");
        assert!(report.is_success());
    }

    #[tokio::test]
    async fn finish_with_failure_reports_non_zero_status() {
        let (cmd, handle) = cmd(true);
        cmd.finish(true);
        let report = handle.wait().await.unwrap().into_report().unwrap();
        assert_eq!(report.error, Some(ShellError::NonZeroStatus));
    }

    #[tokio::test]
    async fn cancel_rejects_the_handle() {
        let (cmd, handle) = cmd(true);
        cmd.cancel();
        assert_eq!(cmd.state(), CommandState::Cancelled);
        assert_eq!(handle.wait().await, Err(ShellError::Cancelled));
    }

    #[tokio::test]
    async fn resolution_happens_exactly_once() {
        let (cmd, handle) = cmd(true);
        cmd.finish(false);
        cmd.cancel();
        cmd.fail(ShellError::WrongPassword);
        // The first resolution wins; the state stays terminal.
        assert_eq!(cmd.state(), CommandState::Finished);
        assert!(handle.wait().await.is_ok());
    }

    #[tokio::test]
    async fn callback_overrides_resolved_value() {
        let callback: DoneCallback = Arc::new(|report, payload| {
            Box::pin(async move {
                serde_json::json!({"payload": payload, "output": report.output})
            })
        });
        let (cmd, handle) = Command::new(
            "printf HELLO;".to_string(),
            "__done__0000003@".to_string(),
            true,
            Some(serde_json::json!("HIT")),
            Some(callback),
        );
        cmd.receive_chunk("HELLO");
        cmd.finish(false);
        match handle.wait().await.unwrap() {
            CommandResult::Custom(value) => {
                assert_eq!(value["payload"], "HIT");
                assert_eq!(value["output"], "HELLO");
            }
            CommandResult::Report(report) => panic!("expected Custom, got {report:?}"),
        }
    }

    #[tokio::test]
    async fn lifecycle_events_arrive_in_order() {
        let (cmd, mut handle) = cmd(true);
        let mut events = handle.events();
        let (stdin_tx, _stdin_rx) = mpsc::unbounded_channel();
        cmd.mark_enqueued(QueueIo {
            stdin_tx,
            side_tx: None,
        });
        cmd.mark_executing();
        cmd.receive_chunk("HEL");
        cmd.finish(false);

        assert!(matches!(events.try_recv().unwrap(), CommandEvent::Enqueued));
        assert!(matches!(events.try_recv().unwrap(), CommandEvent::Executing));
        match events.try_recv().unwrap() {
            CommandEvent::Data(chunk) => assert_eq!(chunk, "HEL"),
            other => panic!("expected Data, got {other:?}"),
        }
        assert!(matches!(events.try_recv().unwrap(), CommandEvent::Finished));
    }

    #[test]
    fn interactive_io_requires_attachment() {
        let (cmd, handle) = cmd(false);
        assert_eq!(
            cmd.write_stdin("whoami;\n".to_string()),
            Err(ShellError::NotAttached)
        );
        assert_eq!(handle.control().send_done_marker(), Err(ShellError::NotAttached));
    }

    #[test]
    fn send_message_requires_side_channel() {
        let (cmd, _handle) = cmd(false);
        let (stdin_tx, _stdin_rx) = mpsc::unbounded_channel();
        cmd.mark_enqueued(QueueIo {
            stdin_tx,
            side_tx: None,
        });
        assert_eq!(
            cmd.send_message(serde_json::json!("HELLOBOB")),
            Err(ShellError::NoSideChannel)
        );
    }

    #[test]
    fn fifo_preserves_order() {
        let mut fifo = CommandFifo::default();
        let (a, _ha) = cmd(true);
        let (b, _hb) = cmd(true);
        fifo.push(a.clone());
        fifo.push(b);
        assert_eq!(fifo.len(), 2);
        assert_eq!(
            fifo.front().map(super::Command::marker),
            Some(a.marker())
        );
        let popped = fifo.pop_front().unwrap();
        assert_eq!(popped.marker(), a.marker());
        assert_eq!(fifo.len(), 1);
    }
}
