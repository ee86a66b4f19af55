use super::{ItemOutcome, ItemTransform, PipelineReport};
use crate::connection::config::{ConnectionConfig, RetryPolicy};
use crate::connection::{SessionFactory, connect};
use crate::core::{ClusterError, Result};
use crate::progress::{ProgressEvent, ProgressSink};
use futures::{Stream, StreamExt};
use std::fmt::Display;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{Level, event};

/// Terminal outcome of one pipeline task
pub(super) enum TaskReport {
    Produced { batches: u64, items: u64 },
    Consumed(PipelineReport),
}

/// Resolves once the cancel flag is raised; never resolves otherwise.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    let raised = cancel.wait_for(|flag| *flag).await.is_ok();
    if !raised {
        std::future::pending::<()>().await;
    }
}

/// Pushes one batch, suspending while the queue is full.
async fn push<T>(
    batches: &mpsc::Sender<Vec<T>>,
    batch: Vec<T>,
    cancel: &mut watch::Receiver<bool>,
) -> Result<()> {
    tokio::select! {
        biased;
        _ = cancelled(cancel) => Err(ClusterError::Cancelled),
        sent = batches.send(batch) => sent.map_err(|_| ClusterError::Cancelled),
    }
}

async fn pull<T>(batches: &Mutex<mpsc::Receiver<Vec<T>>>) -> Option<Vec<T>> {
    batches.lock().await.recv().await
}

pub(super) async fn produce<T, St>(
    source: St,
    batches: mpsc::Sender<Vec<T>>,
    batch_size: usize,
    mut cancel: watch::Receiver<bool>,
) -> Result<TaskReport>
where
    St: Stream<Item = Result<T>> + Send,
{
    let mut source = Box::pin(source);
    let mut batch = Vec::with_capacity(batch_size);
    let mut sent = 0u64;
    let mut items = 0u64;

    while let Some(item) = source.next().await {
        if *cancel.borrow() {
            return Err(ClusterError::Cancelled);
        }
        batch.push(item?);
        items += 1;
        if batch.len() >= batch_size {
            let full = std::mem::replace(&mut batch, Vec::with_capacity(batch_size));
            push(&batches, full, &mut cancel).await?;
            sent += 1;
        }
    }

    if !batch.is_empty() {
        push(&batches, batch, &mut cancel).await?;
        sent += 1;
    }

    event!(Level::DEBUG, batches = sent, items, "producer finished");
    Ok(TaskReport::Produced {
        batches: sent,
        items,
    })
}

#[allow(clippy::too_many_arguments)]
pub(super) async fn consume<F, T, X>(
    id: usize,
    factory: Arc<F>,
    endpoint: ConnectionConfig,
    retry: RetryPolicy,
    batches: Arc<Mutex<mpsc::Receiver<Vec<T>>>>,
    transform: Arc<X>,
    progress: Arc<dyn ProgressSink>,
    mut cancel: watch::Receiver<bool>,
) -> Result<TaskReport>
where
    F: SessionFactory,
    T: Display + Send + Sync,
    X: ItemTransform<F::Session, T>,
{
    let mut session = tokio::select! {
        biased;
        _ = cancelled(&mut cancel) => return Err(ClusterError::Cancelled),
        session = connect(factory.as_ref(), &endpoint, &retry) => session?,
    };

    let mut stats = PipelineReport::default();
    loop {
        let batch = tokio::select! {
            biased;
            _ = cancelled(&mut cancel) => return Err(ClusterError::Cancelled),
            batch = pull(&batches) => batch,
        };
        let Some(batch) = batch else {
            break;
        };

        for item in &batch {
            match transform.apply(&mut session, item).await {
                Ok(ItemOutcome::Applied) => stats.applied += 1,
                Ok(ItemOutcome::Skipped) => stats.skipped += 1,
                Err(ClusterError::DocumentMissing(name)) => {
                    stats.skipped += 1;
                    progress.emit(ProgressEvent::ItemSkipped { item: name });
                }
                Err(err) => return Err(ClusterError::in_transform(item.to_string(), err)),
            }
        }

        stats.batches += 1;
        progress.emit(ProgressEvent::BatchCompleted {
            worker: id,
            batch_len: batch.len(),
            processed: stats.processed(),
        });
    }

    event!(Level::DEBUG, applied = stats.applied, skipped = stats.skipped, "worker finished");
    Ok(TaskReport::Consumed(stats))
}
