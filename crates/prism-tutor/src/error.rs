//! Error types for the Prism tutor.
//!
//! This module defines the error hierarchy for configuration loading, lesson
//! catalog parsing, the capture transport and lesson state persistence.

use std::path::PathBuf;

use prism_capture::CaptureError;
use prism_store::StoreError;

/// A specialized `Result` type for Prism tutor operations.
pub type Result<T> = std::result::Result<T, PrismError>;

/// Errors that can occur while running a tutoring session.
///
/// Variants are grouped by subsystem and carry actionable suggestions where
/// the user can do something about them.
#[derive(Debug, thiserror::Error)]
pub enum PrismError {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Invalid JSON syntax in the configuration file.
    #[error("Invalid JSON in config file '{path}': {message}\n\nSuggestion: Validate your prism.json with a JSON linter")]
    ConfigParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Description of the parse error.
        message: String,
    },

    /// Configuration validation failed.
    #[error("Invalid configuration: {message}\n\nSuggestion: {suggestion}")]
    ConfigValidationError {
        /// Description of the validation failure.
        message: String,
        /// Actionable suggestion for the user.
        suggestion: String,
    },

    // ========================================================================
    // Lesson Catalog Errors
    // ========================================================================
    /// The lessons file was not found.
    #[error("Lessons file not found: '{path}'\n\nSuggestion: Check the 'lessonsFile' field in prism.json")]
    LessonFileNotFound {
        /// Path where the lessons file was expected.
        path: PathBuf,
    },

    /// The lessons file exceeds the size limit.
    #[error("Lessons file exceeds size limit (100KB): '{path}' is {size_kb}KB\n\nSuggestion: Split the catalog into smaller files")]
    LessonFileTooLarge {
        /// Path to the oversized file.
        path: PathBuf,
        /// Actual size in kilobytes.
        size_kb: u64,
    },

    /// The lessons file is not valid UTF-8.
    #[error("Lessons file has invalid encoding: '{path}'\n\nSuggestion: Convert the file to UTF-8 encoding")]
    LessonFileEncoding {
        /// Path to the file.
        path: PathBuf,
    },

    /// The lessons file is valid JSON but not a valid catalog.
    #[error("Invalid lessons file '{path}': {message}")]
    LessonFileInvalid {
        /// Path to the file.
        path: PathBuf,
        /// What is wrong with it.
        message: String,
    },

    /// No lesson plan is available to choose from.
    #[error("No lesson plans available\n\nSuggestion: Remove 'lessonsFile' from prism.json to use the built-in lessons")]
    NoLessonPlans,

    // ========================================================================
    // Transport Errors
    // ========================================================================
    /// The client socket or terminal closed unexpectedly.
    #[error("Transport closed: {0}")]
    Transport(String),

    /// The terminal capture side failed.
    #[error(transparent)]
    Capture(#[from] CaptureError),

    // ========================================================================
    // State Persistence Errors
    // ========================================================================
    /// Lesson metadata could not be read or written.
    #[error("Lesson state unavailable: {0}\n\nSuggestion: Check that the key/value server is running and reachable")]
    StateStore(#[from] StoreError),

    // ========================================================================
    // General I/O Errors
    // ========================================================================
    /// General I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // ========================================================================
    // State Machine Errors
    // ========================================================================
    /// Invalid state transition attempted.
    #[error("Invalid state transition: cannot go from {from} to {to}")]
    InvalidStateTransition {
        /// The current state.
        from: String,
        /// The attempted target state.
        to: String,
    },
}

impl PrismError {
    /// Creates a new `ConfigParseError` with the given path and message.
    #[must_use]
    pub fn config_parse(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::ConfigParseError {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Creates a new `ConfigValidationError` with the given message and suggestion.
    #[must_use]
    pub fn config_validation(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::ConfigValidationError {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Creates a new `LessonFileNotFound` error.
    #[must_use]
    pub fn lesson_file_not_found(path: impl Into<PathBuf>) -> Self {
        Self::LessonFileNotFound { path: path.into() }
    }

    /// Creates a new `LessonFileTooLarge` error.
    #[must_use]
    pub fn lesson_file_too_large(path: impl Into<PathBuf>, size_kb: u64) -> Self {
        Self::LessonFileTooLarge {
            path: path.into(),
            size_kb,
        }
    }

    /// Creates a new `LessonFileEncoding` error.
    #[must_use]
    pub fn lesson_file_encoding(path: impl Into<PathBuf>) -> Self {
        Self::LessonFileEncoding { path: path.into() }
    }

    /// Creates a new `LessonFileInvalid` error.
    #[must_use]
    pub fn lesson_file_invalid(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::LessonFileInvalid {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Creates a new `Transport` error.
    #[must_use]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    /// Creates a new `InvalidStateTransition` error.
    #[must_use]
    pub fn invalid_transition(from: impl std::fmt::Display, to: impl std::fmt::Display) -> Self {
        Self::InvalidStateTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Returns `true` if this error is transient and may be retried.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::StateStore(StoreError::Backend(_) | StoreError::Publish { .. })
                | Self::Capture(CaptureError::FormatterTimeout { .. })
        )
    }

    /// Returns `true` if this error is fatal and requires immediate termination.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ConfigParseError { .. }
                | Self::ConfigValidationError { .. }
                | Self::LessonFileNotFound { .. }
                | Self::LessonFileTooLarge { .. }
                | Self::LessonFileEncoding { .. }
                | Self::LessonFileInvalid { .. }
                | Self::NoLessonPlans
                | Self::Transport(_)
                | Self::Capture(CaptureError::Spawn { .. } | CaptureError::Closed)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_messages() {
        let err = PrismError::lesson_file_not_found("/path/to/lessons.json");
        let msg = err.to_string();
        assert!(msg.contains("Lessons file not found"));
        assert!(msg.contains("/path/to/lessons.json"));
        assert!(msg.contains("Suggestion"));
    }

    #[test]
    fn test_lesson_file_too_large_display() {
        let err = PrismError::lesson_file_too_large("/big/lessons.json", 150);
        let msg = err.to_string();
        assert!(msg.contains("150KB"));
        assert!(msg.contains("100KB"));
    }

    #[test]
    fn test_is_transient() {
        let publish = PrismError::from(StoreError::publish("prism:commands", "reset"));
        assert!(publish.is_transient());
        assert!(!publish.is_fatal());

        let timeout = PrismError::from(CaptureError::FormatterTimeout { timeout_ms: 1000 });
        assert!(timeout.is_transient());

        assert!(!PrismError::NoLessonPlans.is_transient());
    }

    #[test]
    fn test_is_fatal() {
        assert!(PrismError::NoLessonPlans.is_fatal());
        assert!(PrismError::transport("socket closed").is_fatal());
        assert!(PrismError::from(CaptureError::Closed).is_fatal());

        let invalid_db = PrismError::from(StoreError::InvalidDatabase(0));
        assert!(!invalid_db.is_fatal());
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: PrismError = io_err.into();
        assert!(matches!(err, PrismError::Io(_)));
    }
}
