//! Reassignment of shard ownership to a new node set.
//!
//! Every range of every database is handed to every target node. This
//! fan-out is what makes the cluster copy shard data to the new nodes; the
//! store trims replicas back to `n` on its own afterwards.

use crate::connection::ClusterSession;
use crate::core::{ChangelogEntry, ClusterError, ClusterSettings, NodeName, Result, ShardMapDocument, ShardRange};
use crate::pipeline::{ItemOutcome, ItemTransform};
use async_trait::async_trait;
use std::collections::BTreeSet;
use tracing::{Level, event};

/// Result of the checks run once before any document is touched
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Preflight {
    /// The representative database already belongs to exactly the target
    /// nodes; nothing needs rewriting.
    AlreadyAligned { database: String },
    RewriteRequired {
        database: String,
        current_nodes: BTreeSet<NodeName>,
        shard_ranges: Vec<ShardRange>,
    },
}

/// Rewrites shard maps so that every range belongs to every target node
#[derive(Debug, Clone)]
pub struct MetadataRewriter {
    target_nodes: Vec<NodeName>,
}

impl MetadataRewriter {
    /// `target_nodes` keeps its order (it becomes the replica order of every
    /// range); duplicates are dropped.
    pub fn new(target_nodes: Vec<NodeName>) -> Result<Self> {
        let mut seen = BTreeSet::new();
        let mut nodes = Vec::with_capacity(target_nodes.len());
        for node in target_nodes {
            if node.trim().is_empty() {
                return Err(ClusterError::InvalidConfig(
                    "target node name must not be empty".to_string(),
                ));
            }
            if seen.insert(node.clone()) {
                nodes.push(node);
            }
        }
        if nodes.is_empty() {
            return Err(ClusterError::InvalidConfig(
                "at least one target node is required".to_string(),
            ));
        }
        Ok(Self {
            target_nodes: nodes,
        })
    }

    pub fn target_nodes(&self) -> &[NodeName] {
        &self.target_nodes
    }

    fn target_set(&self) -> BTreeSet<NodeName> {
        self.target_nodes.iter().cloned().collect()
    }

    /// Checks the shard map of `database` against the cluster settings.
    ///
    /// Fails with `ConfigurationMismatch` when the document's shard count is
    /// not `settings.q`, or when `settings.n` asks for more replicas than
    /// there are target nodes.
    pub async fn preflight<S: ClusterSession>(
        &self,
        session: &mut S,
        database: &str,
        settings: ClusterSettings,
    ) -> Result<Preflight> {
        let doc = session
            .get_shard_map(database)
            .await?
            .ok_or_else(|| ClusterError::DocumentMissing(database.to_string()))?;

        if doc.shard_count() != settings.q {
            return Err(ClusterError::ConfigurationMismatch(format!(
                "database '{}' has {} shard ranges but the cluster is configured with q={}",
                database,
                doc.shard_count(),
                settings.q
            )));
        }

        if settings.n > self.target_nodes.len() {
            return Err(ClusterError::ConfigurationMismatch(format!(
                "the cluster is configured with n={} replicas but only {} target node(s) were given",
                settings.n,
                self.target_nodes.len()
            )));
        }

        let current_nodes = doc.node_set();
        if current_nodes == self.target_set() {
            event!(Level::INFO, database, "shard maps already name the target nodes");
            return Ok(Preflight::AlreadyAligned {
                database: database.to_string(),
            });
        }

        event!(
            Level::INFO,
            database,
            current = ?current_nodes,
            target = ?self.target_nodes,
            "shard maps need rewriting"
        );
        Ok(Preflight::RewriteRequired {
            database: database.to_string(),
            current_nodes,
            shard_ranges: doc.shard_ranges(),
        })
    }

    /// Replaces the three ownership fields of `doc`; every other field is
    /// kept. Applying it twice gives the same document as applying it once.
    pub fn rewrite(&self, mut doc: ShardMapDocument) -> ShardMapDocument {
        let ranges = doc.shard_ranges();

        doc.by_node = self
            .target_nodes
            .iter()
            .map(|node| (node.clone(), ranges.clone()))
            .collect();
        doc.by_range = ranges
            .iter()
            .map(|range| (range.clone(), self.target_nodes.clone()))
            .collect();
        doc.changelog = ranges
            .iter()
            .flat_map(|range| {
                self.target_nodes
                    .iter()
                    .map(move |node| ChangelogEntry::add(range.as_str(), node.as_str()))
            })
            .collect();
        doc
    }
}

#[async_trait]
impl<S: ClusterSession + 'static> ItemTransform<S, String> for MetadataRewriter {
    async fn apply(&self, session: &mut S, database: &String) -> Result<ItemOutcome> {
        let doc = session
            .get_shard_map(database)
            .await?
            .ok_or_else(|| ClusterError::DocumentMissing(database.clone()))?;

        let rewritten = self.rewrite(doc);
        rewritten.check_consistency()?;
        session.put_shard_map(database, &rewritten).await?;

        event!(Level::DEBUG, database = %database, "shard map rewritten");
        Ok(ItemOutcome::Applied)
    }
}
