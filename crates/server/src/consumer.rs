//! Stream consumer feeding orders into the service.
//!
//! Every fetched message is committed exactly once, whatever happened to it.
//! Messages that cannot be decoded, fail validation, fail to persist or run
//! past the per-message timeout are recorded as dead letters first, so one bad
//! message never stalls the stream.

use std::sync::Arc;
use std::time::Duration;

use orderflow_core::Order;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::service::OrderService;
use crate::stream::{MessageStream, StreamError, StreamMessage};

/// What happened to a single message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The order was persisted and cached.
    Created,
    /// The order was already stored; the cache was refreshed.
    Duplicate,
    /// The message was skipped and recorded as a dead letter.
    DeadLettered,
}

/// Counters accumulated over one [`OrderConsumer::run`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub created: u64,
    pub duplicates: u64,
    pub dead_lettered: u64,
}

impl ConsumerStats {
    fn record(&mut self, outcome: ProcessOutcome) {
        match outcome {
            ProcessOutcome::Created => self.created += 1,
            ProcessOutcome::Duplicate => self.duplicates += 1,
            ProcessOutcome::DeadLettered => self.dead_lettered += 1,
        }
    }

    /// Total number of messages handled.
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.created + self.duplicates + self.dead_lettered
    }
}

/// Long-running ingestion worker.
pub struct OrderConsumer {
    stream: Arc<dyn MessageStream>,
    service: OrderService,
    message_timeout: Option<Duration>,
    retry_backoff: Duration,
}

impl OrderConsumer {
    /// Create a consumer. `message_timeout` of `None` lets persistence run unbounded.
    #[must_use]
    pub fn new(
        stream: Arc<dyn MessageStream>,
        service: OrderService,
        message_timeout: Option<Duration>,
    ) -> Self {
        Self {
            stream,
            service,
            message_timeout,
            retry_backoff: Duration::from_secs(1),
        }
    }

    /// Delay before fetching again after a transient stream error.
    #[must_use]
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Consume until `shutdown` is cancelled or the stream closes.
    ///
    /// A pending fetch is abandoned as soon as `shutdown` fires. A message that
    /// was already fetched is finished before returning.
    pub async fn run(self, shutdown: CancellationToken) -> ConsumerStats {
        info!("Order consumer started");
        let mut stats = ConsumerStats::default();

        loop {
            let fetched = tokio::select! {
                () = shutdown.cancelled() => {
                    info!("Order consumer received shutdown signal");
                    break;
                }
                fetched = self.stream.fetch() => fetched,
            };

            match fetched {
                Ok(message) => stats.record(self.process(&message).await),
                Err(StreamError::Closed) => {
                    info!("Stream closed, order consumer stopping");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to fetch message, retrying");
                    tokio::select! {
                        () = shutdown.cancelled() => break,
                        () = tokio::time::sleep(self.retry_backoff) => {}
                    }
                }
            }
        }

        info!(
            created = stats.created,
            duplicates = stats.duplicates,
            dead_lettered = stats.dead_lettered,
            "Order consumer stopped"
        );
        stats
    }

    /// Handle one message and commit it.
    #[instrument(skip(self, message), fields(offset = message.offset, order_uid))]
    pub async fn process(&self, message: &StreamMessage) -> ProcessOutcome {
        let outcome = match Order::decode(&message.payload) {
            Ok(order) => {
                tracing::Span::current().record("order_uid", order.order_uid.as_str());
                self.persist(message, order).await
            }
            Err(e) => {
                warn!(error = %e, "Undecodable message");
                self.dead_letter(message, &e.to_string()).await
            }
        };

        if let Err(e) = self.stream.commit(message).await {
            // Redelivered after restart; ingestion is idempotent
            error!(error = %e, "Failed to commit offset");
        }

        outcome
    }

    async fn persist(&self, message: &StreamMessage, order: Order) -> ProcessOutcome {
        let ingest = self.service.ingest(order);

        let result = match self.message_timeout {
            Some(limit) => match tokio::time::timeout(limit, ingest).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(timeout = ?limit, "Persisting order timed out");
                    return self
                        .dead_letter(message, &format!("timed out after {}ms", limit.as_millis()))
                        .await;
                }
            },
            None => ingest.await,
        };

        match result {
            Ok(outcome) if outcome.created => {
                info!("Order stored");
                ProcessOutcome::Created
            }
            Ok(_) => {
                debug!("Order already stored, skipped");
                ProcessOutcome::Duplicate
            }
            Err(e) => {
                error!(error = %e, "Failed to persist order");
                self.dead_letter(message, &e.to_string()).await
            }
        }
    }

    async fn dead_letter(&self, message: &StreamMessage, reason: &str) -> ProcessOutcome {
        if let Err(e) = self.stream.dead_letter(message, reason).await {
            error!(error = %e, reason, "Failed to record dead letter");
        }
        ProcessOutcome::DeadLettered
    }
}
