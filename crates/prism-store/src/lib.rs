//! Prism State Store
//!
//! Lesson state persistence and command pub/sub over a numbered key/value store.
//!
//! Database 0 of the backing store holds lesson metadata only; databases 1-15
//! are handed out to lessons by a round-robin [`DatabaseAllocator`]. Captured
//! commands cross from the capture side to the tutor side over a named
//! [`CommandChannel`].

pub mod allocator;
pub mod channel;
pub mod lesson_id;
pub mod manager;
pub mod store;

use thiserror::Error;

pub use allocator::{
    is_lesson_database, DatabaseAllocator, LESSON_DB_END, LESSON_DB_START, METADATA_DB,
};
pub use channel::{
    CommandChannel, CommandPublisher, CommandStream, LocalChannel, RedisChannel, Subscription,
    DEFAULT_CHANNEL,
};
pub use lesson_id::{resolve_lesson_id, slugify, stable_lesson_id};
pub use manager::{LessonStateMetadata, SessionStateManager, DEFAULT_NAMESPACE};
pub use store::{MemoryStateStore, RedisStateStore, StateStore};

/// A specialized `Result` type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur while talking to the backing store or the channel.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing store rejected a command or the connection failed.
    #[error("store backend error: {0}")]
    Backend(#[from] redis::RedisError),

    /// A metadata record could not be encoded or decoded.
    #[error("invalid metadata record: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A lesson database outside the allocatable range was supplied.
    #[error("database {0} is not a lesson database (expected 1..=15)")]
    InvalidDatabase(u8),

    /// A publish call failed.
    #[error("failed to publish on '{channel}': {message}")]
    Publish {
        /// Channel the event was addressed to.
        channel: String,
        /// Description of the failure.
        message: String,
    },
}

impl StoreError {
    /// Creates a new `Publish` error.
    #[must_use]
    pub fn publish(channel: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Publish {
            channel: channel.into(),
            message: message.into(),
        }
    }
}
