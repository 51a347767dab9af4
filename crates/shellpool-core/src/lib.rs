//! Shellpool Core Library
//!
//! Shared functionality for shellpool components:
//! - Pool configuration and defaults
//! - Command outcome types and the done-callback contract
//! - Side-channel NDJSON message codec
//! - Common error types

pub mod config;
pub mod error;
pub mod message;
pub mod outcome;
pub mod tracing_init;

pub use config::{InitScript, PoolConfig};
pub use error::{Result, ShellError};
pub use message::{decode_line, encode_line};
pub use outcome::{CommandReport, CommandResult, DoneCallback};
