use async_trait::async_trait;
use thiserror::Error;

use crate::conversions::{cell::CellConversionError, change_record::{ChangeRecord, ChangeRecordError}};

pub mod memory;
pub mod mysql;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("upstream unreachable: {0}")]
    Connection(#[source] mysql_async::Error),

    #[error("declared schema does not match upstream: {0}")]
    Schema(String),

    #[error("upstream query failed: {0}")]
    Query(#[source] mysql_async::Error),

    #[error("cell conversion error: {0}")]
    CellConversion(#[from] CellConversionError),

    #[error("invalid change record: {0}")]
    ChangeRecord(#[from] ChangeRecordError),

    #[error("invalid row image: {0}")]
    RowImage(String),

    #[error("source is closed")]
    Closed,
}

impl SourceError {
    /// Only a lost connection is worth retrying; everything else is a defect
    /// in configuration or data.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SourceError::Connection(_))
    }
}

impl From<mysql_async::Error> for SourceError {
    fn from(e: mysql_async::Error) -> Self {
        match e {
            mysql_async::Error::Io(_) | mysql_async::Error::Driver(_) => SourceError::Connection(e),
            e => SourceError::Query(e),
        }
    }
}

/// An ordered, possibly endless feed of captured row states.
#[async_trait]
pub trait Source: Send {
    /// Establishes the change feed.
    async fn open(&mut self) -> Result<(), SourceError>;

    /// Waits for the next record; `None` once the feed is closed.
    async fn next(&mut self) -> Result<Option<ChangeRecord>, SourceError>;

    /// Releases the feed's resources.
    async fn close(&mut self);
}
