//! Pool supervisor: shell lifecycle, load balancing, startup rituals.
//!
//! The pool owns a fixed set of process queues, brought up lazily on the
//! first submission (or eagerly via [`ShellPool::start`]). Startup spawns the
//! shells sequentially, runs the elevation dialogue when a target user is
//! configured, and runs the init script on each shell; any failure tears down
//! what was started and the memoized error is handed to every submission.
//!
//! Submitted commands wait in a pool-level pending FIFO. Every command
//! completion pings the drain task, which moves pending commands onto the
//! first queue with spare capacity.

mod elevate;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde_json::Value;
use tokio::sync::{OnceCell, mpsc};
use tracing::{error, info};

use shellpool_core::tracing_init::init_tracing;
use shellpool_core::{CommandResult, DoneCallback, PoolConfig, Result, ShellError};

use crate::command::{Command, CommandHandle};
use crate::queue::{QueueState, ShellQueue};

/// A pool of persistent shell processes.
///
/// Cheap to clone; all clones drive the same pool. Commands are accepted at
/// any time -- before startup they wait for the shells to come up, after
/// [`close`](Self::close) they are rejected with [`ShellError::PoolClosed`].
#[derive(Clone)]
pub struct ShellPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    config: PoolConfig,
    /// Elevation password, moved out of the config at construction and taken
    /// from here when startup begins. Never retained past startup.
    password: Mutex<Option<String>>,
    /// Pool-wide marker sequence; uniqueness across queues keeps markers
    /// unambiguous no matter where a command lands.
    marker_seq: AtomicU64,
    /// Memoized startup outcome. Concurrent first submissions all await the
    /// same startup; a startup error is cloned to every later submission.
    queues: OnceCell<std::result::Result<Vec<Arc<ShellQueue>>, ShellError>>,
    /// Commands accepted but not yet placed on a queue.
    pending: Mutex<VecDeque<Command>>,
    closed: AtomicBool,
    /// Cloned into every queue; pinged on each completion to wake the drain
    /// task.
    finished_tx: mpsc::UnboundedSender<()>,
}

impl ShellPool {
    /// Create a pool. No shell is spawned until the first submission or an
    /// explicit [`start`](Self::start).
    ///
    /// Must be called from within a Tokio runtime: the task that drains
    /// pending commands onto free shells is spawned here.
    pub fn new(mut config: PoolConfig) -> Self {
        if config.log {
            init_tracing("shellpool=info", false);
        }
        let password = config.password.take();
        let (finished_tx, finished_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(PoolInner {
            config,
            password: Mutex::new(password),
            marker_seq: AtomicU64::new(0),
            queues: OnceCell::new(),
            pending: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
            finished_tx,
        });
        PoolInner::run_drain(Arc::downgrade(&inner), finished_rx);
        Self { inner }
    }

    /// Bring the shells up now instead of on the first submission.
    pub async fn start(&self) -> Result<()> {
        self.inner.shells().await.map(|_| ())
    }

    /// Submit a command for execution; output and exit status are captured.
    ///
    /// The command text should be terminated like a shell statement
    /// (`"printf HELLO;"`); it is wrapped with the framing trailer before
    /// transmission.
    pub fn create_command(&self, text: impl Into<String>) -> CommandHandle {
        self.submit(text.into(), true, None, None)
    }

    /// [`create_command`](Self::create_command) with an opaque payload and a
    /// done-callback overriding the pool-wide one.
    pub fn create_command_with(
        &self,
        text: impl Into<String>,
        payload: Option<Value>,
        callback: Option<DoneCallback>,
    ) -> CommandHandle {
        self.submit(text.into(), true, payload, callback)
    }

    /// Submit an interactive command: the text is transmitted verbatim, the
    /// caller drives the shell's stdin through the handle's
    /// [`control`](CommandHandle::control), and completion happens when the
    /// caller sends the done-marker probe.
    pub fn interact(&self, text: impl Into<String>) -> CommandHandle {
        self.submit(text.into(), false, None, None)
    }

    /// [`interact`](Self::interact) with a payload and done-callback.
    pub fn interact_with(
        &self,
        text: impl Into<String>,
        payload: Option<Value>,
        callback: Option<DoneCallback>,
    ) -> CommandHandle {
        self.submit(text.into(), false, payload, callback)
    }

    /// Run `text` once on every shell process and collect all results.
    /// Bypasses the pending FIFO so each queue receives exactly one copy.
    pub async fn broadcast(&self, text: impl Into<String>) -> Result<Vec<CommandResult>> {
        let text = text.into();
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(ShellError::PoolClosed);
        }
        let queues = self.inner.shells().await?;
        let handles: Vec<_> = queues
            .iter()
            .map(|queue| {
                let (cmd, handle) = Command::new(
                    text.clone(),
                    self.inner.next_marker(),
                    true,
                    None,
                    self.inner.config.done_callback.clone(),
                );
                queue.enqueue(cmd);
                handle
            })
            .collect();
        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            results.push(handle.wait().await?);
        }
        Ok(results)
    }

    /// Number of commands accepted but not yet completed.
    pub fn running_commands(&self) -> usize {
        let pending = self.inner.lock_pending().len();
        let queued = match self.inner.queues.get() {
            Some(Ok(queues)) => queues.iter().map(|queue| queue.len()).sum(),
            _ => 0,
        };
        pending + queued
    }

    /// Lifecycle state of each shell process queue, in spawn order. Empty
    /// until startup completes.
    pub fn queue_states(&self) -> Vec<QueueState> {
        match self.inner.queues.get() {
            Some(Ok(queues)) => queues.iter().map(|queue| queue.state()).collect(),
            _ => Vec::new(),
        }
    }

    /// Whether an elevation password is still held (startup consumes it).
    pub fn has_password(&self) -> bool {
        self.inner
            .password
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Close the pool: cancel pending commands, shut every queue down and
    /// kill its shell. Terminal; later submissions are rejected. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let pending: Vec<Command> = self.inner.lock_pending().drain(..).collect();
        for cmd in pending {
            cmd.cancel();
        }
        if let Some(Ok(queues)) = self.inner.queues.get() {
            for queue in queues {
                queue.shutdown();
            }
        }
        info!("Shell pool closed");
    }

    fn submit(
        &self,
        text: String,
        auto_done: bool,
        payload: Option<Value>,
        callback: Option<DoneCallback>,
    ) -> CommandHandle {
        let callback = callback.or_else(|| self.inner.config.done_callback.clone());
        let (cmd, handle) = Command::new(text, self.inner.next_marker(), auto_done, payload, callback);
        // Park the command in the pending FIFO before yielding to the
        // scheduler, so back-to-back submissions keep their call order. The
        // closed flag is read under the pending lock: close() drains the
        // list under the same lock after raising the flag, so a command
        // either sees the flag or is cancelled by the drain.
        {
            let mut pending = self.inner.lock_pending();
            if self.inner.closed.load(Ordering::SeqCst) {
                drop(pending);
                cmd.fail(ShellError::PoolClosed);
                return handle;
            }
            pending.push_back(cmd.clone());
        }
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            match inner.shells().await {
                Ok(_) => inner.drain(),
                Err(error) => {
                    cmd.fail(error);
                    inner.lock_pending().retain(|parked| !parked.is_resolved());
                }
            }
        });
        handle
    }
}

impl PoolInner {
    fn lock_pending(&self) -> MutexGuard<'_, VecDeque<Command>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_marker(&self) -> String {
        let seq = self.marker_seq.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}{seq:07}@", self.config.done_marker)
    }

    async fn shells(self: &Arc<Self>) -> Result<Vec<Arc<ShellQueue>>> {
        self.queues.get_or_init(|| self.start()).await.clone()
    }

    /// Bring up every shell process, elevating and running the init script on
    /// each. On any failure the queues already started are shut down and the
    /// error becomes the pool's permanent startup outcome.
    async fn start(&self) -> std::result::Result<Vec<Arc<ShellQueue>>, ShellError> {
        let password = self
            .password
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if self.config.user.is_some() && password.is_none() {
            return Err(ShellError::PasswordRequired);
        }
        let init_script = match &self.config.init_script {
            Some(script) => Some(script.resolve().await?),
            None => None,
        };

        let count = self.config.number_of_processes.max(1);
        let mut queues = Vec::with_capacity(count);
        for _ in 0..count {
            if self.closed.load(Ordering::SeqCst) {
                shutdown_all(&queues);
                return Err(ShellError::PoolClosed);
            }
            match self
                .bring_up_queue(password.as_deref(), init_script.as_deref())
                .await
            {
                Ok(queue) => queues.push(queue),
                Err(error) => {
                    error!(%error, "Pool startup failed");
                    shutdown_all(&queues);
                    return Err(error);
                }
            }
        }
        if self.closed.load(Ordering::SeqCst) {
            shutdown_all(&queues);
            return Err(ShellError::PoolClosed);
        }
        info!(count = queues.len(), user = ?self.config.user, "Shell pool online");
        Ok(queues)
    }

    async fn bring_up_queue(
        &self,
        password: Option<&str>,
        init_script: Option<&str>,
    ) -> Result<Arc<ShellQueue>> {
        let queue = ShellQueue::spawn(&self.config, Some(self.finished_tx.clone()))?;
        if let Some(user) = &self.config.user {
            let password = password.ok_or(ShellError::PasswordRequired)?;
            let result = elevate::elevate(
                &queue,
                user,
                password,
                self.config.sudo_settle(),
                self.next_marker(),
                self.next_marker(),
            )
            .await;
            if let Err(error) = result {
                queue.shutdown();
                return Err(error);
            }
        }
        if let Some(script) = init_script {
            let (cmd, handle) = Command::new(script.to_string(), self.next_marker(), true, None, None);
            queue.enqueue(cmd);
            match handle.wait().await {
                Ok(CommandResult::Report(report)) if !report.is_success() => {
                    queue.shutdown();
                    return Err(ShellError::InitScriptFailed {
                        output: report.output,
                    });
                }
                Ok(_) => {}
                Err(error) => {
                    queue.shutdown();
                    return Err(error);
                }
            }
        }
        Ok(queue)
    }

    fn run_drain(inner: Weak<Self>, mut finished_rx: mpsc::UnboundedReceiver<()>) {
        tokio::spawn(async move {
            while finished_rx.recv().await.is_some() {
                let Some(inner) = inner.upgrade() else { break };
                inner.drain();
            }
        });
    }

    /// Move pending commands onto queues with spare capacity, oldest first.
    /// Commands cancelled while pending are dropped without transmission.
    fn drain(&self) {
        let Some(Ok(queues)) = self.queues.get() else {
            return;
        };
        let mut pending = self.lock_pending();
        if self.closed.load(Ordering::SeqCst) {
            for cmd in pending.drain(..) {
                cmd.cancel();
            }
            return;
        }
        while let Some(cmd) = pending.pop_front() {
            if cmd.is_resolved() {
                continue;
            }
            if let Some(queue) = queues.iter().find(|queue| queue.has_capacity()) {
                queue.enqueue(cmd);
            } else {
                pending.push_front(cmd);
                return;
            }
        }
    }
}

fn shutdown_all(queues: &[Arc<ShellQueue>]) {
    for queue in queues {
        queue.shutdown();
    }
}
