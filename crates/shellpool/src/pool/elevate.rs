//! Interactive privilege elevation at pool startup.
//!
//! Each freshly spawned shell is switched to the configured user with an
//! interactive `sudo`/`su` dialogue: the dialogue command sets a known sudo
//! prompt, the prompt's appearance on the output stream triggers the password
//! write, and a `whoami` probe afterwards confirms the shell now runs as the
//! target user.

use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info};

use shellpool_core::{CommandResult, Result, ShellError};

use crate::command::{Command, CommandEvent};
use crate::queue::ShellQueue;

/// Prompt string given to `sudo -p`. Recognisable on the output stream and
/// never produced by `su` itself.
const SUDO_PROMPT: &str = "PaxsWord";

/// The elevation dialogue command. `sudo -K` drops any cached credential so
/// the prompt is guaranteed to appear; stderr is folded into the captured
/// stream because both `sudo` and `su` report failures there.
fn elevation_command(user: &str) -> String {
    format!("sudo -K && sudo -p {SUDO_PROMPT} -S su {user} 2>&1;\n")
}

/// Map a non-prompt dialogue chunk to the elevation failure it reports.
fn classify_login_chunk(chunk: &str, user: &str) -> ShellError {
    if chunk.contains("No passwd entry for user") {
        ShellError::NoSuchUser(user.to_string())
    } else if chunk.contains("Sorry, try again.") {
        ShellError::WrongPassword
    } else {
        ShellError::LoginFailed(chunk.trim().to_string())
    }
}

/// Run the elevation dialogue on `queue` and verify the resulting identity.
///
/// The password is borrowed for the duration of the dialogue and written to
/// the shell exactly once.
pub(super) async fn elevate(
    queue: &ShellQueue,
    user: &str,
    password: &str,
    settle: Duration,
    dialogue_marker: String,
    verify_marker: String,
) -> Result<()> {
    debug!(user, pid = queue.pid(), "Starting elevation dialogue");
    let (cmd, mut handle) = Command::new(elevation_command(user), dialogue_marker, false, None, None);
    let mut events = handle.events();
    let control = handle.control();
    queue.enqueue(cmd);

    let mut dialogue_error = None;
    let mut password_sent = false;
    loop {
        match events.recv().await {
            Ok(CommandEvent::Data(chunk)) => {
                if chunk == SUDO_PROMPT && !password_sent {
                    // Give the child's terminal handling a moment to settle
                    // between printing the prompt and reading the answer.
                    tokio::time::sleep(settle).await;
                    control.write_stdin(format!("{password}\n"))?;
                    control.send_done_marker()?;
                    password_sent = true;
                } else if chunk != SUDO_PROMPT {
                    dialogue_error = Some(classify_login_chunk(&chunk, user));
                    control.cancel();
                    break;
                }
            }
            Ok(
                CommandEvent::Finished | CommandEvent::Cancelled | CommandEvent::Failed,
            ) => break,
            Ok(_) | Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => break,
        }
    }
    if let Some(error) = dialogue_error {
        let _ = handle.wait().await;
        return Err(error);
    }
    handle.wait().await?;

    // The elevated shell now reads the input stream; probe who it runs as.
    let (cmd, handle) = Command::new("whoami;".to_string(), verify_marker, true, None, None);
    queue.enqueue(cmd);
    let actual = match handle.wait().await? {
        CommandResult::Report(report) => report.output,
        CommandResult::Custom(_) => String::new(),
    };
    if actual != format!("{user}\n") {
        return Err(ShellError::IdentityMismatch {
            expected: user.to_string(),
            actual,
        });
    }
    info!(user, pid = queue.pid(), "Shell elevated");
    Ok(())
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn dialogue_command_sets_prompt_and_folds_stderr() {
        assert_eq!(
            elevation_command("root"),
            "sudo -K && sudo -p PaxsWord -S su root 2>&1;\n"
        );
    }

    #[test]
    fn login_chunks_classify_to_specific_errors() {
        assert_eq!(
            classify_login_chunk("No passwd entry for user 'zork'\n", "zork"),
            ShellError::NoSuchUser("zork".to_string())
        );
        assert_eq!(
            classify_login_chunk("Sorry, try again.\n", "root"),
            ShellError::WrongPassword
        );
        assert_eq!(
            classify_login_chunk("su: Authentication service cannot retrieve info\n", "root"),
            ShellError::LoginFailed(
                "su: Authentication service cannot retrieve info".to_string()
            )
        );
    }
}
