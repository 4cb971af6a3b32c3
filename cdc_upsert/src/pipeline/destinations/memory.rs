use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::info;

use crate::{
    conversions::change_record::{ChangeRecord, RowKey},
    pipeline::batching::Batch,
};

use super::{Destination, DestinationError};

#[derive(Debug, Default)]
struct MemoryTable {
    rows: HashMap<RowKey, ChangeRecord>,
    attempts: usize,
    flushes: Vec<usize>,
    failures_left: usize,
}

/// A keyed in-memory table with the same all-or-nothing upsert contract as
/// the Postgres destination. Clones share the table.
#[derive(Debug, Clone, Default)]
pub struct MemoryDestination {
    table: Arc<Mutex<MemoryTable>>,
    not_null: Arc<Vec<String>>,
}

impl MemoryDestination {
    pub fn new() -> MemoryDestination {
        MemoryDestination::default()
    }

    /// Rejects any batch holding a row whose `column` is null.
    pub fn with_not_null(mut self, column: impl Into<String>) -> MemoryDestination {
        let mut not_null = self.not_null.as_ref().clone();
        not_null.push(column.into());
        self.not_null = Arc::new(not_null);
        self
    }

    /// Makes the next `count` writes fail as if the destination were down.
    pub async fn fail_next(&self, count: usize) {
        self.table.lock().await.failures_left = count;
    }

    pub async fn get(&self, key: &RowKey) -> Option<ChangeRecord> {
        self.table.lock().await.rows.get(key).cloned()
    }

    pub async fn len(&self) -> usize {
        self.table.lock().await.rows.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Write attempts, failed ones included.
    pub async fn attempts(&self) -> usize {
        self.table.lock().await.attempts
    }

    /// Row counts of the successful writes, in order.
    pub async fn flushes(&self) -> Vec<usize> {
        self.table.lock().await.flushes.clone()
    }

    fn check(&self, row: &ChangeRecord) -> Result<(), DestinationError> {
        for column in self.not_null.iter() {
            if row.field(column).map_or(true, |cell| cell.is_null()) {
                return Err(DestinationError::Rejected(format!(
                    "null value in column {column:?} for key {}",
                    row.key()
                )));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Destination for MemoryDestination {
    async fn write_batch(&self, batch: &Batch) -> Result<usize, DestinationError> {
        let mut table = self.table.lock().await;
        table.attempts += 1;

        if table.failures_left > 0 {
            table.failures_left -= 1;
            return Err(DestinationError::Unavailable(
                "injected failure".to_string(),
            ));
        }

        let rows = batch.deduplicated();
        for row in &rows {
            self.check(row)?;
        }

        for row in &rows {
            table.rows.insert(row.key().clone(), (*row).clone());
        }
        table.flushes.push(rows.len());
        info!(rows = rows.len(), total = table.rows.len(), "applied batch in memory");

        Ok(rows.len())
    }

    fn name(&self) -> &str {
        "memory"
    }
}
