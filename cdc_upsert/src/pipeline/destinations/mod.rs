pub mod memory;
pub mod postgres;
pub mod stdout;
pub mod upsert;

use async_trait::async_trait;
use thiserror::Error;

use super::batching::Batch;

#[derive(Debug, Error)]
pub enum DestinationError {
    #[error("destination unreachable: {0}")]
    Connection(#[source] tokio_postgres::Error),

    #[error("write failed: {0}")]
    Write(#[from] tokio_postgres::Error),

    #[error("row rejected: {0}")]
    Rejected(String),

    #[error("destination unavailable: {0}")]
    Unavailable(String),
}

/// A failed write, carrying the batch that was not applied.
#[derive(Debug, Error)]
#[error("failed to write batch of {} records to {destination}: {source}", .batch.len())]
pub struct SinkWriteError {
    pub destination: String,
    pub batch: Batch,
    #[source]
    pub source: DestinationError,
}

/// Applies batches to a downstream table.
///
/// A write either applies every row of the batch or none of them, and
/// applying the same batch again leaves the destination unchanged.
#[async_trait]
pub trait Destination: Send + Sync {
    /// Applies `batch` and returns the number of rows written after
    /// deduplicating by key.
    async fn write_batch(&self, batch: &Batch) -> Result<usize, DestinationError>;

    fn name(&self) -> &str;
}
