//! Progress reporting for the pipeline and the convergence monitor.

use std::sync::{Arc, Mutex};
use tracing::{Level, event};

/// Something worth telling the operator about
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    /// A worker finished one batch. `processed` is that worker's running total.
    BatchCompleted {
        worker: usize,
        batch_len: usize,
        processed: u64,
    },
    /// An item was skipped because its document disappeared.
    ItemSkipped { item: String },
    /// One poll of one secondary node.
    NodeProgress {
        node: String,
        current: u64,
        target: u64,
        percent: f64,
    },
    NodeSynced { node: String },
    AllSynced,
}

/// Receives progress events. Implementations must not block.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: ProgressEvent);
}

/// Writes every event to the `tracing` subscriber.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingProgress;

impl ProgressSink for TracingProgress {
    fn emit(&self, progress: ProgressEvent) {
        match progress {
            ProgressEvent::BatchCompleted {
                worker,
                batch_len,
                processed,
            } => event!(Level::INFO, worker, batch_len, processed, "batch completed"),
            ProgressEvent::ItemSkipped { item } => {
                event!(Level::WARN, item = %item, "document disappeared, skipped")
            }
            ProgressEvent::NodeProgress {
                node,
                current,
                target,
                percent,
            } => event!(
                Level::INFO,
                node = %node,
                current,
                target,
                "node sync {:.0}%",
                percent
            ),
            ProgressEvent::NodeSynced { node } => event!(Level::INFO, node = %node, "node synced"),
            ProgressEvent::AllSynced => event!(Level::INFO, "all nodes synced"),
        }
    }
}

/// Keeps every event in memory, in emission order.
#[derive(Debug, Clone, Default)]
pub struct MemoryProgress {
    events: Arc<Mutex<Vec<ProgressEvent>>>,
}

impl MemoryProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Percentages reported for `node`, in order.
    pub fn percents_for(&self, node: &str) -> Vec<f64> {
        self.events()
            .into_iter()
            .filter_map(|progress| match progress {
                ProgressEvent::NodeProgress {
                    node: name,
                    percent,
                    ..
                } if name == node => Some(percent),
                _ => None,
            })
            .collect()
    }
}

impl ProgressSink for MemoryProgress {
    fn emit(&self, progress: ProgressEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(progress);
        }
    }
}

impl<T: ProgressSink + ?Sized> ProgressSink for Arc<T> {
    fn emit(&self, progress: ProgressEvent) {
        (**self).emit(progress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_progress_filters_by_node() {
        let sink = MemoryProgress::new();
        sink.emit(ProgressEvent::NodeProgress {
            node: "a".to_string(),
            current: 1,
            target: 2,
            percent: 50.0,
        });
        sink.emit(ProgressEvent::NodeSynced {
            node: "a".to_string(),
        });
        sink.emit(ProgressEvent::NodeProgress {
            node: "b".to_string(),
            current: 2,
            target: 2,
            percent: 100.0,
        });

        assert_eq!(sink.percents_for("a"), vec![50.0]);
        assert_eq!(sink.events().len(), 3);
    }
}
