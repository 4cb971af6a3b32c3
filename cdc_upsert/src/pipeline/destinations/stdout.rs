use async_trait::async_trait;
use tracing::info;

use crate::pipeline::batching::Batch;

use super::{Destination, DestinationError};

/// Prints every row instead of writing it anywhere.
pub struct StdoutDestination;

#[async_trait]
impl Destination for StdoutDestination {
    async fn write_batch(&self, batch: &Batch) -> Result<usize, DestinationError> {
        let rows = batch.deduplicated();
        for row in &rows {
            let fields = row
                .fields()
                .iter()
                .map(|(name, cell)| format!("{name}={cell}"))
                .collect::<Vec<_>>()
                .join(" ");
            info!(key = %row.key(), "upsert {fields}");
        }
        Ok(rows.len())
    }

    fn name(&self) -> &str {
        "stdout"
    }
}
