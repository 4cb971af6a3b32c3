use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder, Retryable};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    conversions::change_record::ChangeRecord,
    pipeline::{
        batching::{BatchConfig, Batcher},
        destinations::{Destination, DestinationError, SinkWriteError},
        sources::{Source, SourceError},
        PipelineError,
    },
};

/// Exponential backoff shared by sink writes and upstream reconnects.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: usize,
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl RetryConfig {
    pub fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.min_delay)
            .with_max_delay(self.max_delay.max(self.min_delay))
            .with_max_times(self.max_retries)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_retries: 5,
            min_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    pub batch: BatchConfig,
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Starting,
    Running,
    Draining,
    Failed,
    Stopped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// Successful flushes.
    pub batches: usize,
    /// Records pulled from the source.
    pub records: usize,
    /// Rows written after deduplication.
    pub rows_applied: usize,
}

enum LoopExit {
    Cancelled,
    EndOfStream,
    SourceFailed(SourceError),
}

/// Pulls records from a source, batches them, and upserts each full batch
/// into a destination before pulling again.
pub struct DataPipeline<Src: Source, Dest: Destination> {
    source: Src,
    destination: Dest,
    batcher: Batcher,
    retry: RetryConfig,
    shutdown: CancellationToken,
    state: PipelineState,
    history: Vec<PipelineState>,
    stats: PipelineStats,
}

impl<Src: Source, Dest: Destination> DataPipeline<Src, Dest> {
    pub fn new(source: Src, destination: Dest, config: PipelineConfig) -> Self {
        DataPipeline {
            source,
            destination,
            batcher: Batcher::new(config.batch),
            retry: config.retry,
            shutdown: CancellationToken::new(),
            state: PipelineState::Starting,
            history: Vec::new(),
            stats: PipelineStats::default(),
        }
    }

    /// Cancelling this token makes `run` flush what it holds and stop.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Every state entered by `run`, oldest first.
    pub fn state_history(&self) -> &[PipelineState] {
        &self.history
    }

    pub fn source(&self) -> &Src {
        &self.source
    }

    pub fn destination(&self) -> &Dest {
        &self.destination
    }

    pub async fn run(&mut self) -> Result<PipelineStats, PipelineError> {
        self.set_state(PipelineState::Starting);

        match self.open_source().await {
            Ok(true) => {}
            Ok(false) => {
                self.set_state(PipelineState::Draining);
                self.set_state(PipelineState::Stopped);
                return Ok(self.stats);
            }
            Err(e) => {
                error!("could not open source: {e}");
                return Err(self.fail(e.into()));
            }
        }

        self.set_state(PipelineState::Running);

        let exit = match self.main_loop().await {
            Ok(exit) => exit,
            Err(e) => {
                self.source.close().await;
                return Err(self.fail(e));
            }
        };

        match &exit {
            LoopExit::Cancelled => info!("shutdown requested"),
            LoopExit::EndOfStream => info!("source ended"),
            LoopExit::SourceFailed(e) => error!("source failed: {e}"),
        }

        self.set_state(PipelineState::Draining);
        let flushed = self.flush().await;
        self.source.close().await;

        if let Err(e) = flushed {
            return Err(self.fail(e.into()));
        }
        if let LoopExit::SourceFailed(e) = exit {
            return Err(self.fail(e.into()));
        }

        self.set_state(PipelineState::Stopped);
        info!(
            batches = self.stats.batches,
            records = self.stats.records,
            rows = self.stats.rows_applied,
            "pipeline stopped"
        );
        Ok(self.stats)
    }

    async fn main_loop(&mut self) -> Result<LoopExit, PipelineError> {
        let shutdown = self.shutdown.clone();

        loop {
            let pulled = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Ok(LoopExit::Cancelled),
                pulled = self.pull() => pulled,
            };

            let record = match pulled {
                Ok(Some(record)) => record,
                Ok(None) => return Ok(LoopExit::EndOfStream),
                Err(e) => return Ok(LoopExit::SourceFailed(e)),
            };

            self.stats.records += 1;
            if self.batcher.add(record)? {
                self.flush().await?;
            }
        }
    }

    /// Returns `false` when shutdown was requested before the source opened.
    async fn open_source(&mut self) -> Result<bool, SourceError> {
        let shutdown = self.shutdown.clone();
        let mut backoff = self.retry.backoff().build();
        let mut attempt = 0;

        loop {
            let opened = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Ok(false),
                opened = self.source.open() => opened,
            };

            match opened {
                Ok(()) => return Ok(true),
                Err(e) if e.is_retryable() => {
                    attempt += 1;
                    let Some(delay) = backoff.next() else {
                        return Err(e);
                    };
                    warn!(attempt, ?delay, "source unreachable, retrying open: {e}");
                    tokio::select! {
                        _ = shutdown.cancelled() => return Ok(false),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn pull(&mut self) -> Result<Option<ChangeRecord>, SourceError> {
        let mut backoff = self.retry.backoff().build();
        let mut attempt = 0;

        loop {
            match self.source.next().await {
                Err(e) if e.is_retryable() => {
                    attempt += 1;
                    let Some(delay) = backoff.next() else {
                        return Err(e);
                    };
                    warn!(attempt, ?delay, "source unreachable, retrying read: {e}");
                    tokio::time::sleep(delay).await;
                }
                pulled => return pulled,
            }
        }
    }

    /// Writes whatever the batcher holds. The same batch is retried until it
    /// is applied or the retry budget runs out.
    async fn flush(&mut self) -> Result<(), SinkWriteError> {
        let batch = self.batcher.drain();
        if batch.is_empty() {
            return Ok(());
        }

        let destination = &self.destination;
        let name = destination.name();
        let pending = &batch;
        let mut attempt = 0;

        let written = (move || destination.write_batch(pending))
            .retry(self.retry.backoff())
            .notify(|e: &DestinationError, delay: Duration| {
                attempt += 1;
                warn!(
                    destination = name,
                    attempt,
                    ?delay,
                    records = pending.len(),
                    "write failed, retrying: {e}"
                );
            })
            .await;

        match written {
            Ok(rows) => {
                self.stats.batches += 1;
                self.stats.rows_applied += rows;
                info!(
                    destination = name,
                    rows,
                    records = batch.len(),
                    "flushed batch"
                );
                Ok(())
            }
            Err(source) => Err(SinkWriteError {
                destination: name.to_string(),
                batch,
                source,
            }),
        }
    }

    fn fail(&mut self, e: PipelineError) -> PipelineError {
        self.set_state(PipelineState::Failed);
        if let Some(batch) = e.unapplied_batch() {
            let contents = serde_json::to_string(batch)
                .unwrap_or_else(|json_err| format!("<unserializable batch: {json_err}>"));
            error!(
                records = batch.len(),
                batch = %contents,
                "giving up on batch, replay it manually: {e}"
            );
        }
        self.set_state(PipelineState::Stopped);
        e
    }

    fn set_state(&mut self, state: PipelineState) {
        if let Some(&previous) = self.history.last() {
            info!(from = ?previous, to = ?state, "pipeline state changed");
        }
        self.state = state;
        self.history.push(state);
    }
}
