//! Bounded-concurrency pipeline applying a transform to every item of a
//! stream.
//!
//! One producer task groups the source into batches and pushes them into a
//! queue holding at most one batch per worker. A fixed set of workers, each
//! owning one session, pulls batches and transforms their items in order.
//! The first failure cancels everything else and is returned to the caller.

mod worker;

use crate::connection::SessionFactory;
use crate::connection::config::{ConnectionConfig, RetryPolicy};
use crate::core::{ClusterError, Result};
use crate::progress::ProgressSink;
use async_trait::async_trait;
use futures::Stream;
use std::fmt::Display;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinSet;
use tracing::{Instrument, Level, event, info_span};
use worker::{TaskReport, consume, produce};

pub const DEFAULT_WORKERS: usize = 16;
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// What a transform did with one item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    Applied,
    Skipped,
}

/// Per-item operation run by the pipeline workers
///
/// `S` is the worker's session, `T` the item type. Returning
/// `ClusterError::DocumentMissing` skips the item; any other error stops the
/// whole pipeline.
#[async_trait]
pub trait ItemTransform<S, T>: Send + Sync + 'static
where
    S: Send,
    T: Sync,
{
    async fn apply(&self, session: &mut S, item: &T) -> Result<ItemOutcome>;
}

/// Pipeline tunables
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Number of workers, and capacity of the batch queue
    pub workers: usize,
    /// Maximum items per batch
    pub batch_size: usize,
    /// Retry schedule for each worker's session
    pub retry: RetryPolicy,
}

impl PipelineConfig {
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.workers == 0 {
            return Err("workers must be > 0".to_string());
        }
        if self.batch_size == 0 {
            return Err("batch_size must be > 0".to_string());
        }
        self.retry.validate()
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            batch_size: DEFAULT_BATCH_SIZE,
            retry: RetryPolicy::default(),
        }
    }
}

/// Totals over every worker of a completed run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineReport {
    pub batches: u64,
    pub applied: u64,
    pub skipped: u64,
}

impl PipelineReport {
    pub fn processed(&self) -> u64 {
        self.applied + self.skipped
    }

    fn merge(&mut self, other: PipelineReport) {
        self.batches += other.batches;
        self.applied += other.applied;
        self.skipped += other.skipped;
    }
}

/// The pipeline itself; cheap to construct, reusable across runs.
#[derive(Debug, Clone)]
pub struct BoundedPipeline {
    config: PipelineConfig,
}

impl BoundedPipeline {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.validate().map_err(ClusterError::InvalidConfig)?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Runs `transform` over every item of `source`.
    ///
    /// Every worker opens its own session to `endpoint` through `factory`.
    /// Returns once the source is exhausted and every batch has been
    /// consumed, or with the first error raised by the producer or a worker.
    /// In the latter case some items may already have been transformed and
    /// others not; nothing is retried.
    pub async fn run<F, T, St, X>(
        &self,
        factory: Arc<F>,
        endpoint: &ConnectionConfig,
        source: St,
        transform: Arc<X>,
        progress: Arc<dyn ProgressSink>,
    ) -> Result<PipelineReport>
    where
        F: SessionFactory,
        T: Display + Send + Sync + 'static,
        St: Stream<Item = Result<T>> + Send + 'static,
        X: ItemTransform<F::Session, T>,
    {
        let PipelineConfig {
            workers,
            batch_size,
            retry,
        } = self.config;

        let (batch_tx, batch_rx) = mpsc::channel::<Vec<T>>(workers);
        let batch_rx = Arc::new(Mutex::new(batch_rx));
        let (cancel_tx, cancel_rx) = watch::channel(false);

        event!(Level::INFO, workers, batch_size, url = %endpoint.url, "pipeline starting");

        let mut tasks = JoinSet::new();
        tasks.spawn(
            produce(source, batch_tx, batch_size, cancel_rx.clone())
                .instrument(info_span!("pipeline.producer")),
        );
        for id in 0..workers {
            tasks.spawn(
                consume(
                    id,
                    factory.clone(),
                    endpoint.clone(),
                    retry,
                    batch_rx.clone(),
                    transform.clone(),
                    progress.clone(),
                    cancel_rx.clone(),
                )
                .instrument(info_span!("pipeline.worker", worker = id)),
            );
        }
        drop(batch_rx);

        let mut report = PipelineReport::default();
        let mut produced = 0u64;
        let mut first_error: Option<ClusterError> = None;
        let mut stray_cancel = false;

        while let Some(joined) = tasks.join_next().await {
            match joined.map_err(ClusterError::from).and_then(|outcome| outcome) {
                Ok(TaskReport::Produced { batches, items }) => {
                    event!(Level::DEBUG, batches, items, "all batches queued");
                    produced = items;
                }
                Ok(TaskReport::Consumed(stats)) => report.merge(stats),
                // Expected once the flag is up; before that it means a task
                // stopped on its own and the run cannot be trusted.
                Err(ClusterError::Cancelled) if *cancel_tx.borrow() => {}
                Err(ClusterError::Cancelled) => {
                    event!(Level::ERROR, "pipeline task stopped without a cancellation request");
                    let _ = cancel_tx.send(true);
                    stray_cancel = true;
                }
                Err(err) if first_error.is_none() => {
                    event!(Level::ERROR, error = %err, "pipeline task failed, cancelling");
                    let _ = cancel_tx.send(true);
                    first_error = Some(err);
                }
                Err(err) => {
                    event!(Level::DEBUG, error = %err, "further failure after cancellation");
                }
            }
        }

        if let Some(err) = first_error {
            return Err(err);
        }
        if stray_cancel {
            return Err(ClusterError::Worker(
                "pipeline task stopped without a cancellation request".to_string(),
            ));
        }

        event!(
            Level::INFO,
            produced,
            applied = report.applied,
            skipped = report.skipped,
            batches = report.batches,
            "pipeline finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PipelineConfig::default();
        assert_eq!(config.workers, 16);
        assert_eq!(config.batch_size, 100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        assert!(PipelineConfig::default().workers(0).validate().is_err());
        assert!(PipelineConfig::default().batch_size(0).validate().is_err());
        assert!(BoundedPipeline::new(PipelineConfig::default().workers(0)).is_err());
    }

    #[test]
    fn test_report_merge() {
        let mut report = PipelineReport::default();
        report.merge(PipelineReport {
            batches: 1,
            applied: 99,
            skipped: 1,
        });
        report.merge(PipelineReport {
            batches: 1,
            applied: 10,
            skipped: 0,
        });
        assert_eq!(report.processed(), 110);
        assert_eq!(report.batches, 2);
    }
}
