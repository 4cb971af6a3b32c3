use std::collections::VecDeque;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::conversions::change_record::ChangeRecord;

use super::{Source, SourceError};

pub type MemorySender = mpsc::Sender<Result<ChangeRecord, SourceError>>;

/// A source fed through a bounded channel. The feed ends when every sender is dropped.
#[derive(Debug)]
pub struct MemorySource {
    // served before the channel
    preloaded: VecDeque<ChangeRecord>,
    receiver: mpsc::Receiver<Result<ChangeRecord, SourceError>>,
    open_errors: VecDeque<SourceError>,
    opened: bool,
}

impl MemorySource {
    pub fn new(capacity: usize) -> (MemorySource, MemorySender) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (
            MemorySource {
                preloaded: VecDeque::new(),
                receiver,
                open_errors: VecDeque::new(),
                opened: false,
            },
            sender,
        )
    }

    /// A finite feed holding `records`.
    pub fn from_records(records: Vec<ChangeRecord>) -> MemorySource {
        let (mut source, _) = MemorySource::new(1);
        source.preloaded = records.into();
        source
    }

    /// Makes the next opens fail with `errors`, one per attempt.
    pub fn with_open_errors(mut self, errors: Vec<SourceError>) -> MemorySource {
        self.open_errors.extend(errors);
        self
    }
}

#[async_trait]
impl Source for MemorySource {
    async fn open(&mut self) -> Result<(), SourceError> {
        if let Some(e) = self.open_errors.pop_front() {
            return Err(e);
        }
        self.opened = true;
        Ok(())
    }

    async fn next(&mut self) -> Result<Option<ChangeRecord>, SourceError> {
        if !self.opened {
            return Err(SourceError::Closed);
        }
        if let Some(record) = self.preloaded.pop_front() {
            return Ok(Some(record));
        }
        self.receiver.recv().await.transpose()
    }

    async fn close(&mut self) {
        self.opened = false;
        self.preloaded.clear();
        self.receiver.close();
    }
}
