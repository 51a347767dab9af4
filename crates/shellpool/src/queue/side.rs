//! Side-channel transport setup.
//!
//! The structured message channel rides a Unix socketpair. The child's end
//! is dup'd onto a fixed low fd in the spawned shell and the fd number is
//! exported as `$SHELL_MSG_FD`, so scripts can read and write NDJSON lines
//! on it (`read -r line <&$SHELL_MSG_FD`). The fd must stay single-digit:
//! dash parses only one digit after `>&`, so an inherited fd of 10 or above
//! would make the redirection a fatal syntax error.

use std::os::fd::{OwnedFd, RawFd};
use std::os::unix::net::UnixStream as StdUnixStream;

use command_fds::FdMapping;
use tokio::net::UnixStream;

use shellpool_core::{Result, ShellError};

/// Fd the child's end of the socketpair is mapped to: the conventional IPC
/// slot right after stdio.
pub(crate) const SIDE_CHANNEL_FD: RawFd = 3;

/// Environment variable naming the mapped side-channel fd.
pub(crate) const SIDE_CHANNEL_FD_ENV: &str = "SHELL_MSG_FD";

/// Create the socketpair: the parent's end registered with the runtime, the
/// child's end packaged as the fd mapping to apply at spawn.
pub(crate) fn create() -> Result<(UnixStream, FdMapping)> {
    let (parent, child_end) = StdUnixStream::pair().map_err(|e| ShellError::SpawnFailed {
        reason: format!("side-channel socketpair: {e}"),
    })?;
    parent
        .set_nonblocking(true)
        .and_then(|()| UnixStream::from_std(parent))
        .map(|parent| {
            let mapping = FdMapping {
                parent_fd: OwnedFd::from(child_end),
                child_fd: SIDE_CHANNEL_FD,
            };
            (parent, mapping)
        })
        .map_err(|e| ShellError::SpawnFailed {
            reason: format!("side-channel register: {e}"),
        })
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::io::Read;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn mapping_pins_the_low_fd_and_carries_data() {
        let (mut parent, mapping) = create().unwrap();
        assert_eq!(mapping.child_fd, SIDE_CHANNEL_FD);

        parent.write_all(b"ping\n").await.unwrap();
        let mut child = StdUnixStream::from(mapping.parent_fd);
        let mut buf = [0_u8; 5];
        child.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping\n");
    }
}
