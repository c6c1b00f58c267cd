//! `PostgreSQL`-backed message stream.
//!
//! Messages are appended to `stream_messages` with a monotonically increasing
//! offset per topic. Appends to one topic are serialized by an insert trigger
//! that takes a transaction-scoped advisory lock before drawing the offset, so
//! offsets commit in order and a reader positioned at N never skips a smaller
//! offset committed later. This holds for any writer of the table, not only
//! [`PgMessageStream::publish`]. Each consumer group keeps its committed offset in
//! `stream_offsets`; on startup a consumer resumes right after it, so anything
//! fetched but not committed before a restart is delivered again.
//!
//! An idle `fetch` waits for a `NOTIFY` on [`NOTIFY_CHANNEL`] (sent by
//! [`PgMessageStream::publish`]) and re-checks the table at least every poll
//! interval, so messages appended by other writers are picked up as well.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::postgres::PgListener;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::{MessageStream, StreamError, StreamMessage};

/// Channel notified whenever a message is published.
pub const NOTIFY_CHANNEL: &str = "orderflow_stream";

/// A topic read by one consumer group.
pub struct PgMessageStream {
    pool: PgPool,
    topic: String,
    consumer_group: String,
    poll_interval: Duration,
    /// Offset of the last fetched message; loaded from the committed offset on first fetch.
    position: Mutex<Option<i64>>,
    listener: Mutex<Option<PgListener>>,
    closed: CancellationToken,
}

#[derive(Debug, sqlx::FromRow)]
struct MessageRow {
    message_offset: i64,
    message_key: Option<String>,
    payload: Vec<u8>,
    published_at: DateTime<Utc>,
}

impl From<MessageRow> for StreamMessage {
    fn from(r: MessageRow) -> Self {
        Self {
            offset: r.message_offset,
            key: r.message_key,
            payload: r.payload,
            published_at: r.published_at,
        }
    }
}

impl PgMessageStream {
    /// Create a stream reader for `topic` on behalf of `consumer_group`.
    #[must_use]
    pub fn new(
        pool: PgPool,
        topic: impl Into<String>,
        consumer_group: impl Into<String>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            pool,
            topic: topic.into(),
            consumer_group: consumer_group.into(),
            poll_interval,
            position: Mutex::new(None),
            listener: Mutex::new(None),
            closed: CancellationToken::new(),
        }
    }

    /// The topic this stream reads.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Append a message to the topic and wake up waiting consumers.
    ///
    /// Returns the offset assigned to the message. Concurrent appends to the
    /// same topic wait for each other until commit.
    ///
    /// # Errors
    ///
    /// Returns `StreamError::Database` if the insert fails.
    #[instrument(skip(self, payload), fields(topic = %self.topic, bytes = payload.len()))]
    pub async fn publish(&self, key: Option<&str>, payload: &[u8]) -> Result<i64, StreamError> {
        let mut tx = self.pool.begin().await?;

        let offset: i64 = sqlx::query_scalar(
            "INSERT INTO stream_messages (topic, message_key, payload) \
             VALUES ($1, $2, $3) RETURNING message_offset",
        )
        .bind(&self.topic)
        .bind(key)
        .bind(payload)
        .fetch_one(&mut *tx)
        .await?;

        // Delivered to listeners when the transaction commits
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(NOTIFY_CHANNEL)
            .bind(&self.topic)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        debug!(offset, "Message published");
        Ok(offset)
    }

    /// The offset committed for this consumer group (0 if none yet).
    ///
    /// # Errors
    ///
    /// Returns `StreamError::Database` if the query fails.
    pub async fn committed_offset(&self) -> Result<i64, StreamError> {
        let offset: Option<i64> = sqlx::query_scalar(
            "SELECT committed_offset FROM stream_offsets WHERE consumer_group = $1 AND topic = $2",
        )
        .bind(&self.consumer_group)
        .bind(&self.topic)
        .fetch_optional(&self.pool)
        .await?;

        Ok(offset.unwrap_or(0))
    }

    /// Stop delivering messages. A pending or later `fetch` returns
    /// `StreamError::Closed`.
    pub fn close(&self) {
        self.closed.cancel();
    }

    async fn next_after(&self, after: i64) -> Result<Option<StreamMessage>, StreamError> {
        let row = sqlx::query_as::<_, MessageRow>(
            "SELECT message_offset, message_key, payload, published_at \
             FROM stream_messages \
             WHERE topic = $1 AND message_offset > $2 \
             ORDER BY message_offset \
             LIMIT 1",
        )
        .bind(&self.topic)
        .bind(after)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(StreamMessage::from))
    }

    /// Block until a publish notification arrives or the poll interval passes.
    async fn wait_for_publish(&self) {
        let mut guard = self.listener.lock().await;

        if guard.is_none() {
            match listen(&self.pool).await {
                Ok(listener) => *guard = Some(listener),
                Err(e) => warn!(error = %e, "Failed to listen for stream notifications, polling"),
            }
        }

        let Some(listener) = guard.as_mut() else {
            tokio::time::sleep(self.poll_interval).await;
            return;
        };

        match tokio::time::timeout(self.poll_interval, listener.try_recv()).await {
            Ok(Ok(Some(_))) | Err(_) => {}
            Ok(Ok(None)) => debug!("Notification connection lost, reconnecting"),
            Ok(Err(e)) => {
                warn!(error = %e, "Stream notification listener failed");
                *guard = None;
            }
        }
    }
}

async fn listen(pool: &PgPool) -> Result<PgListener, sqlx::Error> {
    let mut listener = PgListener::connect_with(pool).await?;
    listener.listen(NOTIFY_CHANNEL).await?;
    Ok(listener)
}

#[async_trait]
impl MessageStream for PgMessageStream {
    async fn fetch(&self) -> Result<StreamMessage, StreamError> {
        let mut position = self.position.lock().await;

        let after = match *position {
            Some(offset) => offset,
            None => {
                let committed = self.committed_offset().await?;
                debug!(
                    topic = %self.topic,
                    group = %self.consumer_group,
                    committed,
                    "Resuming after committed offset"
                );
                *position = Some(committed);
                committed
            }
        };

        loop {
            if self.closed.is_cancelled() {
                return Err(StreamError::Closed);
            }

            if let Some(message) = self.next_after(after).await? {
                *position = Some(message.offset);
                return Ok(message);
            }

            tokio::select! {
                () = self.closed.cancelled() => return Err(StreamError::Closed),
                () = self.wait_for_publish() => {}
            }
        }
    }

    #[instrument(skip(self, message), fields(topic = %self.topic, offset = message.offset))]
    async fn commit(&self, message: &StreamMessage) -> Result<(), StreamError> {
        sqlx::query(
            "INSERT INTO stream_offsets (consumer_group, topic, committed_offset) \
             VALUES ($1, $2, $3) \
             ON CONFLICT (consumer_group, topic) DO UPDATE \
             SET committed_offset = GREATEST(stream_offsets.committed_offset, EXCLUDED.committed_offset), \
                 updated_at = NOW()",
        )
        .bind(&self.consumer_group)
        .bind(&self.topic)
        .bind(message.offset)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[instrument(skip(self, message), fields(topic = %self.topic, offset = message.offset))]
    async fn dead_letter(&self, message: &StreamMessage, reason: &str) -> Result<(), StreamError> {
        sqlx::query(
            "INSERT INTO stream_dead_letters \
             (consumer_group, topic, message_offset, message_key, payload, reason) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(&self.consumer_group)
        .bind(&self.topic)
        .bind(message.offset)
        .bind(message.key.as_deref())
        .bind(&message.payload)
        .bind(reason)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
