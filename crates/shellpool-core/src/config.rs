//! Pool configuration.
//!
//! A [`PoolConfig`] describes how shell processes are spawned and how
//! commands are framed. All fields have working defaults; a pool built from
//! `PoolConfig::default()` runs `/bin/sh -s` with a single process.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::outcome::{BoxFuture, DoneCallback};

/// Default marker prefix injected ahead of the per-command sequence number.
pub const DEFAULT_DONE_MARKER: &str = "__done__";

/// Provider for a deferred init script, invoked once at pool startup.
pub type InitScriptFn = std::sync::Arc<dyn Fn() -> BoxFuture<Result<String>> + Send + Sync>;

/// Script to run on each shell when it is first launched.
#[derive(Clone)]
pub enum InitScript {
    /// A literal script, run as-is.
    Literal(String),
    /// A provider that resolves to the script at startup. Resolved once per
    /// pool; every queue runs the same resolved text.
    Deferred(InitScriptFn),
}

impl InitScript {
    /// Resolve to the literal script text.
    pub async fn resolve(&self) -> Result<String> {
        match self {
            Self::Literal(script) => Ok(script.clone()),
            Self::Deferred(provider) => provider().await,
        }
    }
}

impl From<String> for InitScript {
    fn from(script: String) -> Self {
        Self::Literal(script)
    }
}

impl From<&str> for InitScript {
    fn from(script: &str) -> Self {
        Self::Literal(script.to_string())
    }
}

impl fmt::Debug for InitScript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(script) => f.debug_tuple("Literal").field(script).finish(),
            Self::Deferred(_) => f.write_str("Deferred(..)"),
        }
    }
}

/// Configuration for a [`ShellPool`](../shellpool/struct.ShellPool.html).
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Shell executable to spawn.
    pub shell: String,
    /// Arguments passed to the shell.
    pub spawn_args: Vec<String>,
    /// Whether to open the structured side-channel (an inherited socketpair
    /// end whose fd number is exported as `$SHELL_MSG_FD`).
    pub side_channel: bool,
    /// Script to run when each shell is first launched. Must succeed or pool
    /// startup is aborted.
    #[serde(skip)]
    pub init_script: Option<InitScript>,
    /// Pool-wide done-callback, applied when a command supplies none.
    #[serde(skip)]
    pub done_callback: Option<DoneCallback>,
    /// User to switch to via the interactive sudo dialogue at startup.
    pub user: Option<String>,
    /// Elevation password. Taken out of the pool's state when startup begins
    /// and never retained after it completes.
    pub password: Option<String>,
    /// Number of shell processes to spawn.
    pub number_of_processes: usize,
    /// Maximum commands transmitted-but-unfinished per shell.
    pub concurrent_cmds: usize,
    /// Marker prefix; a zero-padded sequence number is appended per command.
    pub done_marker: String,
    /// Delay between observing the sudo prompt and writing the password,
    /// allowing the child's terminal driver to settle.
    pub sudo_settle_ms: u64,
    /// Install the default tracing subscriber at pool construction.
    pub log: bool,
}

impl PoolConfig {
    /// Settle delay for the elevation dialogue as a [`Duration`].
    pub const fn sudo_settle(&self) -> Duration {
        Duration::from_millis(self.sudo_settle_ms)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            shell: "/bin/sh".to_string(),
            spawn_args: vec!["-s".to_string()],
            side_channel: true,
            init_script: None,
            done_callback: None,
            user: None,
            password: None,
            number_of_processes: 1,
            concurrent_cmds: 100,
            done_marker: DEFAULT_DONE_MARKER.to_string(),
            sudo_settle_ms: 50,
            log: true,
        }
    }
}

impl fmt::Debug for PoolConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolConfig")
            .field("shell", &self.shell)
            .field("spawn_args", &self.spawn_args)
            .field("side_channel", &self.side_channel)
            .field("init_script", &self.init_script)
            .field("has_done_callback", &self.done_callback.is_some())
            .field("user", &self.user)
            .field("has_password", &self.password.is_some())
            .field("number_of_processes", &self.number_of_processes)
            .field("concurrent_cmds", &self.concurrent_cmds)
            .field("done_marker", &self.done_marker)
            .field("sudo_settle_ms", &self.sudo_settle_ms)
            .field("log", &self.log)
            .finish()
    }
}
