//! Side-channel NDJSON message codec.
//!
//! Messages cross the side-channel as newline-delimited JSON, one value per
//! line, in either direction. The engine does not interpret message content;
//! scripts read and write whole lines on `$SHELL_MSG_FD`.

use serde_json::Value;

use crate::error::{Result, ShellError};

/// Encode a message as a single NDJSON line (trailing newline included).
pub fn encode_line(message: &Value) -> Result<String> {
    let mut line = serde_json::to_string(message)
        .map_err(|e| ShellError::ProcessFailed(format!("side-channel encode: {e}")))?;
    line.push('\n');
    Ok(line)
}

/// Decode one side-channel line. Returns `None` for blank or malformed lines;
/// a chatty script must not be able to wedge the reader.
pub fn decode_line(line: &str) -> Option<Value> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    match serde_json::from_str(trimmed) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(error = %e, line = trimmed, "Discarding malformed side-channel line");
            None
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn encode_appends_newline() {
        let line = encode_line(&json!({"ipc": true})).unwrap();
        assert_eq!(line, "{\"ipc\":true}\n");
    }

    #[test]
    fn decode_round_trips() {
        let msg = json!({"kind": "progress", "pct": 40});
        let line = encode_line(&msg).unwrap();
        assert_eq!(decode_line(&line), Some(msg));
    }

    #[test]
    fn decode_accepts_bare_scalars() {
        assert_eq!(decode_line("\"HELLOBOB\"\n"), Some(json!("HELLOBOB")));
        assert_eq!(decode_line("42"), Some(json!(42)));
    }

    #[test]
    fn decode_rejects_garbage_and_blanks() {
        assert_eq!(decode_line(""), None);
        assert_eq!(decode_line("   \n"), None);
        assert_eq!(decode_line("{not json"), None);
    }
}
