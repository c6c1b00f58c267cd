//! Publish order documents to the ingestion stream.
//!
//! # Usage
//!
//! ```bash
//! of-cli publish model.json
//! of-cli publish --topic orders-replay a.json b.json
//! ```
//!
//! Each file is decoded as an order before publishing so that mistakes are
//! caught here instead of ending up as dead letters. `--raw` skips that check
//! and publishes the bytes untouched, which is how poison messages are
//! reproduced.

use std::path::{Path, PathBuf};

use orderflow_core::{DecodeError, Order};
use orderflow_server::config::{ConfigError, ServerConfig};
use orderflow_server::db;
use orderflow_server::stream::{PgMessageStream, StreamError};
use thiserror::Error;

/// Errors that can occur while publishing.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("Failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("{} is not a valid order: {source}", path.display())]
    Invalid { path: PathBuf, source: DecodeError },
}

/// Publish every file in `paths`, in order.
///
/// All files are read and validated before anything is published.
///
/// # Errors
///
/// Returns `PublishError` if a file cannot be read or decoded, or the stream
/// rejects a message.
pub async fn files(
    paths: &[PathBuf],
    topic: Option<String>,
    raw: bool,
) -> Result<usize, PublishError> {
    let messages = paths
        .iter()
        .map(|path| load(path, raw))
        .collect::<Result<Vec<_>, _>>()?;

    let config = ServerConfig::from_env()?;
    let topic = topic.unwrap_or(config.stream.topic);
    let pool = db::create_pool(&config.database_url, 2).await?;
    let stream = PgMessageStream::new(
        pool.clone(),
        topic,
        config.stream.consumer_group,
        config.stream.poll_interval,
    );

    for (key, payload) in &messages {
        let offset = stream.publish(key.as_deref(), payload).await?;
        tracing::info!(
            offset,
            topic = stream.topic(),
            key = key.as_deref().unwrap_or("-"),
            "Published"
        );
    }

    pool.close().await;
    Ok(messages.len())
}

/// Read a file, returning the message key (the order identifier) and payload.
fn load(path: &Path, raw: bool) -> Result<(Option<String>, Vec<u8>), PublishError> {
    let payload = std::fs::read(path).map_err(|source| PublishError::Read {
        path: path.to_owned(),
        source,
    })?;

    if raw {
        return Ok((None, payload));
    }

    let order = Order::decode(&payload).map_err(|source| PublishError::Invalid {
        path: path.to_owned(),
        source,
    })?;
    Ok((Some(order.order_uid), payload))
}
