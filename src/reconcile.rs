//! End-to-end operations built from the connection, enumerator, pipeline,
//! rewriter and monitor.

use crate::connection::config::ConnectionConfig;
use crate::connection::{ClusterSession, SessionFactory, connect};
use crate::core::{ClusterError, NodeName, Result};
use crate::enumerator::{DEFAULT_PAGE_SIZE, KeyEnumerator};
use crate::monitor::{ConvergenceMonitor, ConvergenceReport, MonitorConfig, NodeEndpoint};
use crate::pipeline::{BoundedPipeline, PipelineConfig, PipelineReport};
use crate::progress::ProgressSink;
use crate::rewriter::{MetadataRewriter, Preflight};
use std::sync::Arc;
use tracing::{Instrument, Level, event, info_span};

/// Options for [`update_metadata`]
#[derive(Debug, Clone)]
pub struct ReconcileOptions {
    pub endpoint: ConnectionConfig,
    /// Nodes that must own every shard; `None` means the cluster's
    /// `cluster_nodes`.
    pub target_nodes: Option<Vec<NodeName>>,
    pub pipeline: PipelineConfig,
    pub page_size: usize,
    /// Rewrite every shard map even when the representative one is already
    /// aligned, as after a run that failed part way.
    pub force: bool,
}

impl ReconcileOptions {
    pub fn new(endpoint: ConnectionConfig) -> Self {
        Self {
            endpoint,
            target_nodes: None,
            pipeline: PipelineConfig::default(),
            page_size: DEFAULT_PAGE_SIZE,
            force: false,
        }
    }

    pub fn target_nodes(mut self, nodes: Vec<NodeName>) -> Self {
        self.target_nodes = Some(nodes);
        self
    }

    pub fn pipeline(mut self, pipeline: PipelineConfig) -> Self {
        self.pipeline = pipeline;
        self
    }

    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        self.endpoint.validate()?;
        self.pipeline.validate()?;
        if self.page_size == 0 {
            return Err("page_size must be > 0".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateReport {
    /// The cluster has no databases
    NoDatabases,
    /// The representative database already names exactly the target nodes
    AlreadyAligned { database: String },
    Rewritten(PipelineReport),
}

/// Resolves the node set every shard should belong to.
async fn resolve_targets<S: ClusterSession>(
    session: &mut S,
    requested: Option<&[NodeName]>,
) -> Result<MetadataRewriter> {
    let membership = session.membership().await?;
    for node in membership.offline_nodes() {
        event!(Level::WARN, node = %node, "cluster member is not connected");
    }

    let targets = match requested {
        Some(nodes) => {
            for node in nodes {
                if !membership.cluster_nodes.contains(node) {
                    event!(Level::WARN, node = %node, "target node is not a cluster member");
                }
            }
            nodes.to_vec()
        }
        None => membership.cluster_nodes,
    };
    MetadataRewriter::new(targets)
}

/// Reassigns every shard of every database to the target nodes.
///
/// One representative database is checked first; if the cluster settings
/// disagree with it the call fails before anything is written, and if it
/// already names the target nodes nothing else is read unless
/// `options.force` is set. Otherwise every
/// shard map is rewritten through the bounded pipeline. Safe to re-run after
/// a failure.
pub async fn update_metadata<F: SessionFactory>(
    factory: Arc<F>,
    options: &ReconcileOptions,
    progress: Arc<dyn ProgressSink>,
) -> Result<UpdateReport> {
    options.validate().map_err(ClusterError::InvalidConfig)?;
    let span = info_span!("update_metadata", url = %options.endpoint.url);

    async move {
        let mut session = connect(factory.as_ref(), &options.endpoint, &options.pipeline.retry).await?;
        let settings = session.cluster_settings().await?;
        let rewriter = resolve_targets(&mut session, options.target_nodes.as_deref()).await?;
        event!(
            Level::INFO,
            q = settings.q,
            n = settings.n,
            targets = ?rewriter.target_nodes(),
            "cluster settings loaded"
        );

        let mut first = KeyEnumerator::new(session).with_page_size(1);
        let Some(database) = first.next_key().await? else {
            event!(Level::INFO, "cluster has no databases");
            return Ok(UpdateReport::NoDatabases);
        };
        let mut session = first.into_session();

        match rewriter.preflight(&mut session, &database, settings).await? {
            Preflight::AlreadyAligned { database } if !options.force => {
                return Ok(UpdateReport::AlreadyAligned { database });
            }
            Preflight::AlreadyAligned { .. } => {
                event!(Level::INFO, "representative shard map aligned, rewriting anyway");
            }
            Preflight::RewriteRequired { shard_ranges, .. } => {
                event!(Level::INFO, shards = shard_ranges.len(), "rewriting shard maps");
            }
        }

        let pipeline = BoundedPipeline::new(options.pipeline)?;
        let source = KeyEnumerator::new(session)
            .with_page_size(options.page_size)
            .into_stream();
        let report = pipeline
            .run(factory, &options.endpoint, source, Arc::new(rewriter), progress)
            .await?;
        Ok(UpdateReport::Rewritten(report))
    }
    .instrument(span)
    .await
}

/// Waits until every secondary holds as many metadata documents as the
/// primary.
pub async fn wait_for_convergence<F: SessionFactory>(
    factory: Arc<F>,
    primary: &NodeEndpoint,
    secondaries: &[NodeEndpoint],
    config: MonitorConfig,
    progress: &dyn ProgressSink,
) -> Result<ConvergenceReport> {
    let monitor = ConvergenceMonitor::new(factory, config)?;
    monitor
        .run(primary, secondaries, progress)
        .instrument(info_span!("wait_for_convergence", primary = %primary.name))
        .await
}

/// One metadata document count per node, in the order given.
pub async fn metadata_counts<F: SessionFactory>(
    factory: &F,
    nodes: &[NodeEndpoint],
    config: &MonitorConfig,
) -> Result<Vec<(String, u64)>> {
    let mut counts = Vec::with_capacity(nodes.len());
    for node in nodes {
        let mut session = connect(factory, &node.config, &config.retry).await?;
        counts.push((node.name.clone(), session.metadata_count().await?));
    }
    Ok(counts)
}
