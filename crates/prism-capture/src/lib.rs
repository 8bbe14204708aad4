//! Prism Capture
//!
//! The capture side of the tutoring pipeline: a CLI child process on a
//! pseudo-terminal ([`PtySession`]), a streaming prompt parser that lifts
//! command/response cycles off its output ([`CommandParser`]), and a
//! formatter that turns each response into a canonical, comparable string
//! ([`ResultFormatter`]).
//!
//! # Example
//!
//! ```
//! use prism_capture::{CommandParser, ParserEvent, PromptPattern};
//!
//! let prompt = PromptPattern::new("127.0.0.1", 6379).unwrap();
//! let mut parser = CommandParser::new(prompt, 64 * 1024);
//!
//! let events = parser.feed("127.0.0.1:6379> HSET user:1 name Max\r\nOK\r\n127.0.0.1:6379> ");
//! assert!(events.iter().any(|e| matches!(
//!     e,
//!     ParserEvent::Completed { command, output, .. }
//!         if command == "HSET user:1 name Max" && output == "OK"
//! )));
//! ```

pub mod formatter;
pub mod parser;
pub mod pty;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use formatter::{derive_csv_from_terminal, is_read_only, split_command_args, ResultFormatter};
pub use parser::{strip_ansi, CommandParser, ParserEvent, PromptPattern};
pub use pty::{validate_size, PtyEvent, PtyOptions, PtySession};

/// A specialized `Result` type for capture operations.
pub type Result<T> = std::result::Result<T, CaptureError>;

/// One command/response cycle lifted off the terminal.
///
/// Serialized camelCase; this is the wire format on the command channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapturedCommand {
    /// Command text as typed, ANSI stripped.
    pub command: String,
    /// Response lines shown on the terminal.
    pub terminal_output: String,
    /// Canonical comma-separated rendering of the response. Empty when none
    /// could be obtained.
    pub csv_output: String,
    /// When the cycle completed.
    pub timestamp: DateTime<Utc>,
    /// Session the command was typed in.
    pub session_id: String,
}

impl CapturedCommand {
    /// Creates a captured command stamped with the current time.
    pub fn new(
        command: impl Into<String>,
        terminal_output: impl Into<String>,
        csv_output: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            command: command.into(),
            terminal_output: terminal_output.into(),
            csv_output: csv_output.into(),
            timestamp: Utc::now(),
            session_id: session_id.into(),
        }
    }
}

/// Errors raised on the capture side.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// The CLI could not be started.
    #[error("failed to spawn '{program}': {message}\n\nSuggestion: Check that '{program}' is installed and on PATH.")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Underlying failure.
        message: String,
    },

    /// The pseudo-terminal rejected an operation.
    #[error("pseudo-terminal error: {0}")]
    Pty(String),

    /// A resize request was outside the accepted range.
    #[error("invalid terminal size {cols}x{rows} (cols 20-500, rows 5-200)")]
    InvalidSize {
        /// Requested columns.
        cols: u16,
        /// Requested rows.
        rows: u16,
    },

    /// The terminal or its child process has gone away.
    #[error("terminal session closed")]
    Closed,

    /// The prompt pattern could not be compiled.
    #[error("invalid prompt pattern: {0}")]
    InvalidPrompt(#[from] regex::Error),

    /// The out-of-band canonical query did not finish in time.
    #[error("canonical output query timed out after {timeout_ms}ms")]
    FormatterTimeout {
        /// The bound that was exceeded.
        timeout_ms: u64,
    },

    /// An I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CaptureError {
    /// Creates a new `Spawn` error.
    #[must_use]
    pub fn spawn(program: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Spawn {
            program: program.into(),
            message: message.into(),
        }
    }

    /// Creates a new `Pty` error.
    #[must_use]
    pub fn pty(message: impl std::fmt::Display) -> Self {
        Self::Pty(message.to_string())
    }

    /// Returns `true` if the session cannot continue after this error.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Spawn { .. } | Self::Closed)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_captured_command_wire_format() {
        let cmd = CapturedCommand::new("GET a", "\"1\"", "\"1\"", "session-1");
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["command"], "GET a");
        assert_eq!(json["terminalOutput"], "\"1\"");
        assert_eq!(json["csvOutput"], "\"1\"");
        assert_eq!(json["sessionId"], "session-1");
        assert!(json["timestamp"].is_string());

        let back: CapturedCommand = serde_json::from_value(json).unwrap();
        assert_eq!(back, cmd);
    }

    #[test]
    fn test_error_messages() {
        let err = CaptureError::spawn("redis-cli", "No such file or directory");
        assert!(err.to_string().contains("Suggestion:"));
        assert!(err.is_fatal());

        let err = CaptureError::InvalidSize { cols: 10, rows: 3 };
        assert!(err.to_string().contains("10x3"));
        assert!(!err.is_fatal());

        assert!(CaptureError::FormatterTimeout { timeout_ms: 1000 }
            .to_string()
            .contains("1000ms"));
    }
}
