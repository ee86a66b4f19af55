//! Waits for secondary nodes to catch up with the primary's shard metadata.
//!
//! The primary's count of metadata documents is captured once; each
//! secondary is then polled until its own count (live plus deleted
//! documents) reaches it.

use crate::connection::config::{ConnectionConfig, RetryPolicy};
use crate::connection::{ClusterSession, SessionFactory, connect};
use crate::core::{ClusterError, Result};
use crate::progress::{ProgressEvent, ProgressSink};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{Level, event};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// A node to poll, with the label used in progress events
#[derive(Debug, Clone)]
pub struct NodeEndpoint {
    pub name: String,
    pub config: ConnectionConfig,
}

impl NodeEndpoint {
    pub fn new(name: impl Into<String>, config: ConnectionConfig) -> Self {
        Self {
            name: name.into(),
            config,
        }
    }

    /// Labels the node by `host:port` of its URL.
    pub fn from_config(config: ConnectionConfig) -> Self {
        let host = config.url.host_str().unwrap_or("unknown");
        let name = match config.url.port_or_known_default() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };
        Self { name, config }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorConfig {
    pub poll_interval: Duration,
    pub retry: RetryPolicy,
}

impl MonitorConfig {
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.poll_interval.is_zero() {
            return Err("poll_interval must be > 0".to_string());
        }
        self.retry.validate()
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            retry: RetryPolicy::default(),
        }
    }
}

/// Sync state of one secondary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeSyncState {
    /// Not polled yet, or polled and still behind
    Waiting { last_count: Option<u64> },
    Synced { count: u64 },
}

impl NodeSyncState {
    pub fn is_synced(&self) -> bool {
        matches!(self, NodeSyncState::Synced { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvergenceReport {
    /// Primary count every secondary had to reach
    pub target: u64,
    /// Polling rounds performed
    pub polls: u32,
    /// Count each secondary reported when it became synced
    pub nodes: BTreeMap<String, u64>,
}

/// `min(current / target, 1) * 100`, or 100 when there is nothing to reach.
pub fn percent(current: u64, target: u64) -> f64 {
    if target == 0 {
        return 100.0;
    }
    (current as f64 * 100.0 / target as f64).min(100.0)
}

struct Tracked<S> {
    node: NodeEndpoint,
    session: Option<S>,
    state: NodeSyncState,
}

pub struct ConvergenceMonitor<F> {
    factory: Arc<F>,
    config: MonitorConfig,
}

impl<F: SessionFactory> ConvergenceMonitor<F> {
    pub fn new(factory: Arc<F>, config: MonitorConfig) -> Result<Self> {
        config.validate().map_err(ClusterError::InvalidConfig)?;
        Ok(Self { factory, config })
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Polls until every secondary has caught up with `primary`.
    ///
    /// There is no timeout: wrap the future in `tokio::time::timeout` to give
    /// up. Dropping it releases every session still open. Any connection or
    /// poll failure ends the wait with that error.
    pub async fn run(
        &self,
        primary: &NodeEndpoint,
        secondaries: &[NodeEndpoint],
        progress: &dyn ProgressSink,
    ) -> Result<ConvergenceReport> {
        let target = {
            let mut session = connect(self.factory.as_ref(), &primary.config, &self.config.retry).await?;
            session.metadata_count().await?
        };
        event!(
            Level::INFO,
            primary = %primary.name,
            target,
            secondaries = secondaries.len(),
            "waiting for shard metadata to converge"
        );

        let mut tracked = Vec::with_capacity(secondaries.len());
        for node in secondaries {
            let session = connect(self.factory.as_ref(), &node.config, &self.config.retry).await?;
            tracked.push(Tracked {
                node: node.clone(),
                session: Some(session),
                state: NodeSyncState::Waiting { last_count: None },
            });
        }

        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut polls = 0u32;

        while tracked.iter().any(|t| !t.state.is_synced()) {
            ticker.tick().await;
            polls += 1;
            for entry in tracked.iter_mut() {
                poll_node(entry, target, progress).await?;
            }
        }

        progress.emit(ProgressEvent::AllSynced);
        event!(Level::INFO, target, polls, "all secondaries synced");

        let nodes = tracked
            .into_iter()
            .filter_map(|t| match t.state {
                NodeSyncState::Synced { count } => Some((t.node.name, count)),
                NodeSyncState::Waiting { .. } => None,
            })
            .collect();
        Ok(ConvergenceReport {
            target,
            polls,
            nodes,
        })
    }
}

async fn poll_node<S: ClusterSession>(
    entry: &mut Tracked<S>,
    target: u64,
    progress: &dyn ProgressSink,
) -> Result<()> {
    let Some(session) = entry.session.as_mut() else {
        return Ok(());
    };

    let current = session.metadata_count().await?;
    progress.emit(ProgressEvent::NodeProgress {
        node: entry.node.name.clone(),
        current,
        target,
        percent: percent(current, target),
    });

    if current >= target {
        entry.session = None;
        entry.state = NodeSyncState::Synced { count: current };
        progress.emit(ProgressEvent::NodeSynced {
            node: entry.node.name.clone(),
        });
    } else {
        entry.state = NodeSyncState::Waiting {
            last_count: Some(current),
        };
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::memory::InMemoryCluster;
    use crate::progress::MemoryProgress;

    #[test]
    fn test_percent_is_capped() {
        assert_eq!(percent(200, 1000), 20.0);
        assert_eq!(percent(600, 1000), 60.0);
        assert_eq!(percent(1500, 1000), 100.0);
        assert_eq!(percent(0, 0), 100.0);
    }

    #[test]
    fn test_node_name_from_url() {
        let config = ConnectionConfig::from_url("http://couch-2.internal:5984").unwrap();
        assert_eq!(NodeEndpoint::from_config(config).name, "couch-2.internal:5984");
    }

    #[test]
    fn test_zero_interval_rejected() {
        let config = MonitorConfig::default().poll_interval(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_no_secondaries_is_immediately_synced() {
        let cluster = InMemoryCluster::new(1, 1);
        let primary = NodeEndpoint::new("primary", cluster.endpoint("primary").unwrap());
        let monitor = ConvergenceMonitor::new(Arc::new(cluster), MonitorConfig::default()).unwrap();
        let progress = MemoryProgress::new();

        let report = monitor.run(&primary, &[], &progress).await.unwrap();
        assert_eq!(report.polls, 0);
        assert_eq!(progress.events(), vec![ProgressEvent::AllSynced]);
    }
}
