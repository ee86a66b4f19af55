use super::{ClusterError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

/// Label of one cluster member, e.g. `couchdb@10.0.0.1`.
pub type NodeName = String;

/// Keyspace partition key, e.g. `00000000-7fffffff`.
pub type ShardRange = String;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ChangeAction {
    Add,
    Delete,
    /// Any other action, written back verbatim.
    Other(String),
}

impl From<String> for ChangeAction {
    fn from(action: String) -> Self {
        match action.as_str() {
            "add" => ChangeAction::Add,
            "delete" => ChangeAction::Delete,
            _ => ChangeAction::Other(action),
        }
    }
}

impl From<ChangeAction> for String {
    fn from(action: ChangeAction) -> Self {
        match action {
            ChangeAction::Add => "add".to_string(),
            ChangeAction::Delete => "delete".to_string(),
            ChangeAction::Other(action) => action,
        }
    }
}

/// One ownership mutation, stored on the wire as `[action, range, node]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangelogEntry(pub ChangeAction, pub ShardRange, pub NodeName);

impl ChangelogEntry {
    pub fn add(range: impl Into<ShardRange>, node: impl Into<NodeName>) -> Self {
        Self(ChangeAction::Add, range.into(), node.into())
    }
}

/// Shard map of one database as kept in the node-local `_dbs` database.
///
/// Only the ownership fields are typed. Everything else the store keeps in
/// the document (`_id`, `_rev`, `shard_suffix`, `props`, ...) lives in
/// `extra` and is written back untouched.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ShardMapDocument {
    #[serde(default)]
    pub by_node: BTreeMap<NodeName, Vec<ShardRange>>,
    #[serde(default)]
    pub by_range: BTreeMap<ShardRange, Vec<NodeName>>,
    #[serde(default)]
    pub changelog: Vec<ChangelogEntry>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ShardMapDocument {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assigns `range` to `nodes`, keeping `by_node` in step.
    pub fn with_assignment(mut self, range: &str, nodes: &[&str]) -> Self {
        for node in nodes {
            let ranges = self.by_node.entry(node.to_string()).or_default();
            if !ranges.iter().any(|r| r == range) {
                ranges.push(range.to_string());
                ranges.sort();
            }
            self.changelog.push(ChangelogEntry::add(range, *node));
        }
        self.by_range
            .insert(range.to_string(), nodes.iter().map(|n| n.to_string()).collect());
        self
    }

    /// Decodes a raw document fetched for database `db` and validates it.
    pub fn from_json(db: &str, raw: Value) -> Result<Self> {
        let doc: Self = serde_json::from_value(raw)
            .map_err(|err| ClusterError::InvalidDocument(db.to_string(), err.to_string()))?;
        doc.validate(db)?;
        Ok(doc)
    }

    pub fn to_json(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    fn validate(&self, db: &str) -> Result<()> {
        if self.by_range.is_empty() {
            return Err(ClusterError::InvalidDocument(
                db.to_string(),
                "by_range is empty".to_string(),
            ));
        }
        if let Some((range, _)) = self.by_range.iter().find(|(_, nodes)| nodes.is_empty()) {
            return Err(ClusterError::InvalidDocument(
                db.to_string(),
                format!("range {} has no owner", range),
            ));
        }
        Ok(())
    }

    pub fn shard_ranges(&self) -> Vec<ShardRange> {
        self.by_range.keys().cloned().collect()
    }

    pub fn shard_count(&self) -> usize {
        self.by_range.len()
    }

    /// Every node that owns at least one range, from either index.
    pub fn node_set(&self) -> BTreeSet<NodeName> {
        self.by_node
            .keys()
            .cloned()
            .chain(self.by_range.values().flatten().cloned())
            .collect()
    }

    /// Checks that `by_node` and `by_range` describe the same ownership.
    pub fn check_consistency(&self) -> Result<()> {
        let from_nodes: BTreeSet<(&str, &str)> = self
            .by_node
            .iter()
            .flat_map(|(node, ranges)| ranges.iter().map(move |r| (r.as_str(), node.as_str())))
            .collect();
        let from_ranges: BTreeSet<(&str, &str)> = self
            .by_range
            .iter()
            .flat_map(|(range, nodes)| nodes.iter().map(move |n| (range.as_str(), n.as_str())))
            .collect();

        if from_nodes != from_ranges {
            let id = self
                .extra
                .get("_id")
                .and_then(Value::as_str)
                .unwrap_or("<unnamed>");
            return Err(ClusterError::InvalidDocument(
                id.to_string(),
                "by_node and by_range disagree".to_string(),
            ));
        }
        Ok(())
    }
}

/// Response of the store's root info probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    #[serde(default)]
    pub couchdb: String,
    #[serde(default)]
    pub version: Option<String>,
}

/// Nodes known to the cluster (`cluster_nodes`) and the ones currently
/// connected (`all_nodes`).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Membership {
    #[serde(default)]
    pub all_nodes: Vec<NodeName>,
    #[serde(default)]
    pub cluster_nodes: Vec<NodeName>,
}

impl Membership {
    /// Members of `cluster_nodes` that are not currently connected.
    pub fn offline_nodes(&self) -> Vec<NodeName> {
        self.cluster_nodes
            .iter()
            .filter(|node| !self.all_nodes.contains(node))
            .cloned()
            .collect()
    }
}

/// Sharding parameters from the `[cluster]` config section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterSettings {
    /// Shard count per database.
    pub q: usize,
    /// Replica count per shard.
    pub n: usize,
}

impl ClusterSettings {
    /// Parses the config section, whose values the store reports as strings.
    pub fn from_json(raw: &Value) -> Result<Self> {
        let field = |name: &str| -> Result<usize> {
            let value = raw.get(name).ok_or_else(|| {
                ClusterError::InvalidConfig(format!("cluster config has no '{}'", name))
            })?;
            let parsed = match value {
                Value::String(text) => text.trim().parse::<usize>().ok(),
                Value::Number(number) => number.as_u64().map(|n| n as usize),
                _ => None,
            };
            parsed.filter(|n| *n > 0).ok_or_else(|| {
                ClusterError::InvalidConfig(format!(
                    "cluster config '{}' is not a positive integer: {}",
                    name, value
                ))
            })
        };
        Ok(Self {
            q: field("q")?,
            n: field("n")?,
        })
    }
}
