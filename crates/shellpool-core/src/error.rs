//! Error types for the shellpool engine.
//!
//! All variants carry owned strings rather than source errors so the type is
//! `Clone`: a memoized pool-startup failure is handed to every caller that
//! awaits pool readiness, and queue teardown rejects every tracked command
//! with the same error.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using [`ShellError`].
pub type Result<T> = std::result::Result<T, ShellError>;

/// Errors produced by the shell pool engine.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ShellError {
    /// The command's exit-status probe reported a non-zero status.
    #[error("command exited with non-zero status")]
    NonZeroStatus,

    /// The command was cancelled (queue shutdown or explicit cancel).
    #[error("cancelled")]
    Cancelled,

    /// Data arrived on the process's stderr stream. Commands are required to
    /// redirect their own error output into the captured stream.
    #[error(
        "cmd: {command} returned stderr: {stderr}. stderr is not supported, \
         only stdout, use {{ cmd; }} 2>&1;"
    )]
    ProtocolViolation { command: String, stderr: String },

    /// Elevation failed: the target user does not exist.
    #[error("user not found: {0}")]
    NoSuchUser(String),

    /// Elevation failed: the password was rejected.
    #[error("wrong password provided")]
    WrongPassword,

    /// Elevation failed for a reason other than a bad user or password.
    #[error("login failed: {0}")]
    LoginFailed(String),

    /// Post-elevation verification reported a different user.
    #[error("not logged in as {expected}, shell reports {actual:?}")]
    IdentityMismatch { expected: String, actual: String },

    /// The configured init script exited with a failure status.
    #[error("init script failed: {output}")]
    InitScriptFailed { output: String },

    /// A target user was configured without an elevation password.
    #[error("root password required to change user")]
    PasswordRequired,

    /// The shell process could not be spawned.
    #[error("failed to spawn shell process: {reason}")]
    SpawnFailed { reason: String },

    /// The shell process exited or errored while commands were tracked.
    #[error("shell process failed: {0}")]
    ProcessFailed(String),

    /// An interactive operation was attempted before the command was
    /// assigned to a shell process.
    #[error("command is not attached to a shell")]
    NotAttached,

    /// A side-channel message was sent on a pool spawned without one.
    #[error("side channel is not enabled")]
    NoSideChannel,

    /// The pool has been closed; no further submissions are accepted.
    #[error("pool is closed")]
    PoolClosed,
}
