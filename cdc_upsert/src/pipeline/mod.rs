use batching::BatchFullError;
use destinations::SinkWriteError;
use sources::SourceError;
use thiserror::Error;

pub mod batching;
pub mod data_pipeline;
pub mod destinations;
pub mod sources;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("source error: {0}")]
    SourceError(#[from] SourceError),

    #[error("sink error: {0}")]
    SinkWriteError(#[from] SinkWriteError),

    #[error("batching error: {0}")]
    BatchFullError(#[from] BatchFullError),
}

impl PipelineError {
    /// The batch that never reached the destination, if any.
    pub fn unapplied_batch(&self) -> Option<&batching::Batch> {
        match self {
            PipelineError::SinkWriteError(e) => Some(&e.batch),
            _ => None,
        }
    }
}
