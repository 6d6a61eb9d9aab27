//! Record sinks.
//!
//! A sink accepts batches of envelopes up to its own `max_batch_size`.
//! Splitting larger sets is the emitter's job.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use f1_common::{ClickHouseClient, ClickHouseError, Envelope};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::info;

/// Default maximum envelopes per sink call.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 500;

/// Errors that can occur while forwarding a batch.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink unavailable: {0}")]
    Unavailable(String),

    #[error("batch of {size} envelopes exceeds sink limit of {max}")]
    BatchTooLarge { size: usize, max: usize },

    #[error("failed to encode envelope: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("ClickHouse error: {0}")]
    ClickHouse(#[from] ClickHouseError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Downstream stream receiving envelopes.
#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Largest batch accepted by one `put_batch` call.
    fn max_batch_size(&self) -> usize;

    /// Forwards one batch. Returns the number of envelopes accepted.
    async fn put_batch(&self, batch: &[Envelope]) -> Result<usize, SinkError>;
}

fn check_batch(batch: &[Envelope], max: usize) -> Result<(), SinkError> {
    if batch.len() > max {
        return Err(SinkError::BatchTooLarge {
            size: batch.len(),
            max,
        });
    }
    Ok(())
}

/// Sink writing envelope rows to a ClickHouse table.
pub struct ClickHouseSink {
    client: ClickHouseClient,
    table: String,
    max_batch_size: usize,
}

impl ClickHouseSink {
    pub fn new(client: ClickHouseClient, table: &str, max_batch_size: usize) -> Self {
        Self {
            client,
            table: table.to_string(),
            max_batch_size,
        }
    }

    /// Checks connectivity and creates the envelope table if needed.
    pub async fn prepare(&self) -> Result<(), SinkError> {
        self.client.ping().await?;
        self.client.create_envelope_table(&self.table).await?;
        info!("ClickHouse sink ready (table {})", self.table);
        Ok(())
    }
}

#[async_trait]
impl RecordSink for ClickHouseSink {
    fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    async fn put_batch(&self, batch: &[Envelope]) -> Result<usize, SinkError> {
        check_batch(batch, self.max_batch_size)?;
        self.client
            .insert_envelopes(&self.table, batch)
            .await
            .map_err(|e| match e {
                ClickHouseError::Connection(msg) => SinkError::Unavailable(msg),
                other => SinkError::ClickHouse(other),
            })?;
        Ok(batch.len())
    }
}

/// Sink appending newline-delimited JSON envelopes to a file.
pub struct JsonLinesSink {
    path: PathBuf,
    max_batch_size: usize,
    write_lock: Mutex<()>,
}

impl JsonLinesSink {
    pub fn new(path: impl Into<PathBuf>, max_batch_size: usize) -> Self {
        Self {
            path: path.into(),
            max_batch_size,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl RecordSink for JsonLinesSink {
    fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    async fn put_batch(&self, batch: &[Envelope]) -> Result<usize, SinkError> {
        check_batch(batch, self.max_batch_size)?;
        if batch.is_empty() {
            return Ok(0);
        }

        let mut buf = Vec::new();
        for envelope in batch {
            serde_json::to_writer(&mut buf, envelope)?;
            buf.push(b'\n');
        }

        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| SinkError::Unavailable(format!("{}: {}", self.path.display(), e)))?;
        file.write_all(&buf).await?;
        file.flush().await?;

        Ok(batch.len())
    }
}
