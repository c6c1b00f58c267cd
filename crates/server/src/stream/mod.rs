//! Durable message stream the ingestion consumer reads from.
//!
//! Delivery is at-least-once: a message is handed out again after a restart
//! until its offset has been committed for the consumer group.

pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

pub use postgres::PgMessageStream;

/// Errors from the message stream.
#[derive(Debug, Error)]
pub enum StreamError {
    /// Database error from sqlx.
    #[error("stream database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The stream was closed and will not deliver further messages.
    #[error("stream closed")]
    Closed,
}

/// A message fetched from the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMessage {
    /// Position of the message within its topic.
    pub offset: i64,
    /// Optional partitioning key (the order identifier for published orders).
    pub key: Option<String>,
    /// Raw payload bytes.
    pub payload: Vec<u8>,
    /// When the message was appended.
    pub published_at: DateTime<Utc>,
}

/// Source of messages for one consumer group.
///
/// `fetch` may be cancelled by dropping its future; no message is consumed
/// in that case and the next call starts over.
#[async_trait]
pub trait MessageStream: Send + Sync {
    /// Wait for the next message after the last fetched one.
    ///
    /// # Errors
    ///
    /// Returns `StreamError::Closed` once the stream is exhausted for good,
    /// other errors for transient failures.
    async fn fetch(&self) -> Result<StreamMessage, StreamError>;

    /// Mark `message` and everything before it as processed.
    ///
    /// # Errors
    ///
    /// Returns `StreamError` if the offset cannot be stored.
    async fn commit(&self, message: &StreamMessage) -> Result<(), StreamError>;

    /// Record a message that was skipped without being processed.
    ///
    /// # Errors
    ///
    /// Returns `StreamError` if the record cannot be stored.
    async fn dead_letter(&self, message: &StreamMessage, reason: &str) -> Result<(), StreamError>;
}
