//! Persistent shell process pool.
//!
//! Runs shell commands/scripts against a small pool of long-lived `/bin/sh`
//! processes. Each submission returns a completion handle that resolves with
//! the command's captured output and exit status; command boundaries are
//! framed inside the raw output stream with injected sentinel markers, so
//! several commands can be pipelined per shell while completions stay
//! attributable. Interactive commands, an NDJSON side-channel and privilege
//! elevation at startup (an interactive `sudo`/`su` dialogue) are supported.
//!
//! Unix only: the engine spawns pipe-connected shells and the side-channel
//! rides an inherited socketpair fd.
//!
//! ```no_run
//! # async fn demo() -> shellpool::Result<()> {
//! use shellpool::{PoolConfig, ShellPool};
//!
//! let pool = ShellPool::new(PoolConfig::default());
//! let result = pool.create_command("printf HELLO;").wait().await?;
//! assert_eq!(result.output(), Some("HELLO"));
//! pool.close();
//! # Ok(())
//! # }
//! ```

pub mod command;
pub mod pool;
pub mod queue;

pub use command::{CommandControl, CommandEvent, CommandHandle, CommandState, CommandTimestamps};
pub use pool::ShellPool;
pub use queue::QueueState;
pub use shellpool_core::{
    CommandReport, CommandResult, DoneCallback, InitScript, PoolConfig, Result, ShellError,
};
