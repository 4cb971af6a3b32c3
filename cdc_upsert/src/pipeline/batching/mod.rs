use std::collections::HashMap;

use thiserror::Error;

use crate::conversions::change_record::{ChangeRecord, RowKey};

#[derive(Debug, Clone)]
pub struct BatchConfig {
    max_batch_size: usize,
}

impl BatchConfig {
    /// A zero size is bumped to one so every batch can make progress.
    pub fn new(max_batch_size: usize) -> BatchConfig {
        BatchConfig {
            max_batch_size: max_batch_size.max(1),
        }
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        BatchConfig::new(3)
    }
}

#[derive(Debug, Error)]
#[error("batch is full ({max_batch_size} records), drain it before adding more")]
pub struct BatchFullError {
    pub max_batch_size: usize,
    pub record: Box<ChangeRecord>,
}

/// An ordered run of captured records handed to a destination in one write.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
#[serde(transparent)]
pub struct Batch {
    records: Vec<ChangeRecord>,
}

impl Batch {
    pub fn new(records: Vec<ChangeRecord>) -> Batch {
        Batch { records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[ChangeRecord] {
        &self.records
    }

    /// Collapses repeated keys: the last record for a key wins but takes the
    /// slot where that key was first seen.
    pub fn deduplicated(&self) -> Vec<&ChangeRecord> {
        let mut positions: HashMap<&RowKey, usize> = HashMap::with_capacity(self.records.len());
        let mut rows: Vec<&ChangeRecord> = Vec::with_capacity(self.records.len());

        for record in &self.records {
            match positions.get(record.key()) {
                Some(&i) => rows[i] = record,
                None => {
                    positions.insert(record.key(), rows.len());
                    rows.push(record);
                }
            }
        }

        rows
    }
}

/// Accumulates records until `BATCH_SIZE` is reached. Single writer only.
#[derive(Debug)]
pub struct Batcher {
    batch_config: BatchConfig,
    records: Vec<ChangeRecord>,
}

impl Batcher {
    pub fn new(batch_config: BatchConfig) -> Batcher {
        Batcher {
            records: Vec::with_capacity(batch_config.max_batch_size),
            batch_config,
        }
    }

    /// Appends a record and reports whether the batch is now ready to flush.
    pub fn add(&mut self, record: ChangeRecord) -> Result<bool, BatchFullError> {
        if self.is_ready() {
            return Err(BatchFullError {
                max_batch_size: self.batch_config.max_batch_size,
                record: Box::new(record),
            });
        }
        self.records.push(record);
        Ok(self.is_ready())
    }

    /// Hands out the current contents and starts over empty.
    pub fn drain(&mut self) -> Batch {
        let records = std::mem::replace(
            &mut self.records,
            Vec::with_capacity(self.batch_config.max_batch_size),
        );
        Batch::new(records)
    }

    pub fn is_ready(&self) -> bool {
        self.records.len() >= self.batch_config.max_batch_size
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
