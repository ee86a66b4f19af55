use super::config::ConnectionConfig;
use super::{ClusterSession, SessionFactory};
use crate::core::{ClusterError, ClusterSettings, Membership, Result, ServerInfo, ShardMapDocument};
use async_trait::async_trait;
use reqwest::Url;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Default)]
struct ClusterState {
    shard_maps: BTreeMap<String, Value>,
    /// Listed by `_all_dbs` but gone when read, as after a concurrent delete.
    vanished: HashSet<String>,
    failing_writes: HashSet<String>,
    scripted_counts: HashMap<String, VecDeque<u64>>,
    open_failures: HashMap<String, u32>,
    open_attempts: HashMap<String, u32>,
    reads: HashMap<String, u32>,
    writes: HashMap<String, u32>,
    list_calls: usize,
    live_sessions: usize,
    opened_sessions: u64,
}

/// An in-memory cluster implementing `SessionFactory`, for testing.
///
/// Every endpoint sees the same shard maps. Per-endpoint behaviour (open
/// failures, scripted metadata counts) is keyed by the endpoint URL.
#[derive(Clone)]
pub struct InMemoryCluster {
    settings: ClusterSettings,
    membership: Arc<Mutex<Membership>>,
    state: Arc<Mutex<ClusterState>>,
}

impl InMemoryCluster {
    /// Creates an empty cluster configured with `q` shards and `n` replicas.
    pub fn new(q: usize, n: usize) -> Self {
        Self {
            settings: ClusterSettings { q, n },
            membership: Arc::new(Mutex::new(Membership::default())),
            state: Arc::new(Mutex::new(ClusterState::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ClusterState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Endpoint of a node called `name`.
    pub fn endpoint(&self, name: &str) -> Result<ConnectionConfig> {
        let url = Url::parse(&format!("http://{}.cluster.test:5984/", name))
            .map_err(|err| ClusterError::InvalidConfig(format!("node name '{}': {}", name, err)))?;
        Ok(ConnectionConfig::new(url))
    }

    pub fn set_membership(&self, cluster_nodes: &[&str], all_nodes: &[&str]) {
        let mut membership = self.membership.lock().unwrap_or_else(|p| p.into_inner());
        membership.cluster_nodes = cluster_nodes.iter().map(|n| n.to_string()).collect();
        membership.all_nodes = all_nodes.iter().map(|n| n.to_string()).collect();
    }

    pub fn insert_shard_map(&self, db: &str, doc: &ShardMapDocument) {
        let mut raw = serde_json::to_value(doc).unwrap_or(Value::Null);
        if let Some(fields) = raw.as_object_mut() {
            fields
                .entry("_id".to_string())
                .or_insert_with(|| Value::String(db.to_string()));
        }
        self.lock().shard_maps.insert(db.to_string(), raw);
    }

    /// Current shard map of `db`, if stored.
    pub fn shard_map(&self, db: &str) -> Option<ShardMapDocument> {
        let state = self.lock();
        let raw = state.shard_maps.get(db)?.clone();
        ShardMapDocument::from_json(db, raw).ok()
    }

    pub fn database_names(&self) -> Vec<String> {
        self.lock().shard_maps.keys().cloned().collect()
    }

    /// Keeps `db` listed but makes its shard map unreadable and unwritable.
    pub fn vanish(&self, db: &str) {
        self.lock().vanished.insert(db.to_string());
    }

    /// Makes every write to `db` fail with a 500.
    pub fn fail_writes_for(&self, db: &str) {
        self.lock().failing_writes.insert(db.to_string());
    }

    /// Makes the next `times` opens of `endpoint` fail with a 503.
    pub fn fail_next_opens(&self, endpoint: &ConnectionConfig, times: u32) {
        self.lock()
            .open_failures
            .insert(endpoint.url.to_string(), times);
    }

    /// Scripts the successive `metadata_count` answers of `endpoint`.
    ///
    /// The last value keeps being returned once the script is exhausted.
    /// Endpoints without a script report the number of stored shard maps.
    pub fn script_counts(&self, endpoint: &ConnectionConfig, counts: &[u64]) {
        self.lock()
            .scripted_counts
            .insert(endpoint.url.to_string(), counts.iter().copied().collect());
    }

    pub fn open_attempts(&self, endpoint: &ConnectionConfig) -> u32 {
        self.lock()
            .open_attempts
            .get(endpoint.url.as_str())
            .copied()
            .unwrap_or(0)
    }

    pub fn reads(&self, db: &str) -> u32 {
        self.lock().reads.get(db).copied().unwrap_or(0)
    }

    pub fn writes(&self, db: &str) -> u32 {
        self.lock().writes.get(db).copied().unwrap_or(0)
    }

    pub fn total_reads(&self) -> u32 {
        self.lock().reads.values().sum()
    }

    pub fn total_writes(&self) -> u32 {
        self.lock().writes.values().sum()
    }

    pub fn list_calls(&self) -> usize {
        self.lock().list_calls
    }

    /// Sessions opened and not yet dropped.
    pub fn live_sessions(&self) -> usize {
        self.lock().live_sessions
    }
}

#[async_trait]
impl SessionFactory for InMemoryCluster {
    type Session = InMemorySession;

    async fn open(&self, endpoint: &ConnectionConfig) -> Result<InMemorySession> {
        let key = endpoint.url.to_string();
        let mut state = self.lock();
        *state.open_attempts.entry(key.clone()).or_default() += 1;

        if let Some(remaining) = state.open_failures.get_mut(&key) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ClusterError::Status {
                    status: 503,
                    path: "/".to_string(),
                    body: "node is starting".to_string(),
                });
            }
        }

        state.live_sessions += 1;
        state.opened_sessions += 1;
        Ok(InMemorySession {
            cluster: self.clone(),
            key,
            id: state.opened_sessions,
        })
    }
}

/// Session handed out by `InMemoryCluster`
pub struct InMemorySession {
    cluster: InMemoryCluster,
    key: String,
    id: u64,
}

impl InMemorySession {
    /// Position of this session in the cluster's open order, from 1.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for InMemorySession {
    fn drop(&mut self) {
        let mut state = self.cluster.lock();
        state.live_sessions = state.live_sessions.saturating_sub(1);
    }
}

#[async_trait]
impl ClusterSession for InMemorySession {
    async fn info(&mut self) -> Result<ServerInfo> {
        Ok(ServerInfo {
            couchdb: "Welcome".to_string(),
            version: Some("3.3.3".to_string()),
        })
    }

    async fn list_databases(&mut self, start_key: Option<&str>, limit: usize) -> Result<Vec<String>> {
        let mut state = self.cluster.lock();
        state.list_calls += 1;

        let start = start_key.unwrap_or("");
        if start.contains('\u{0}') {
            return Err(ClusterError::Status {
                status: 400,
                path: "/_all_dbs".to_string(),
                body: "invalid UTF-8 JSON start_key".to_string(),
            });
        }

        Ok(state
            .shard_maps
            .range(start.to_string()..)
            .take(limit)
            .map(|(name, _)| name.clone())
            .collect())
    }

    async fn get_shard_map(&mut self, db: &str) -> Result<Option<ShardMapDocument>> {
        let raw = {
            let mut state = self.cluster.lock();
            *state.reads.entry(db.to_string()).or_default() += 1;
            if state.vanished.contains(db) {
                return Ok(None);
            }
            match state.shard_maps.get(db) {
                Some(raw) => raw.clone(),
                None => return Ok(None),
            }
        };
        ShardMapDocument::from_json(db, raw).map(Some)
    }

    async fn put_shard_map(&mut self, db: &str, doc: &ShardMapDocument) -> Result<()> {
        let raw = doc.to_json()?;
        let mut state = self.cluster.lock();
        if state.failing_writes.contains(db) {
            return Err(ClusterError::Status {
                status: 500,
                path: format!("/_node/_local/_dbs/{}", db),
                body: "internal server error".to_string(),
            });
        }
        if state.vanished.contains(db) || !state.shard_maps.contains_key(db) {
            return Err(ClusterError::DocumentMissing(db.to_string()));
        }
        *state.writes.entry(db.to_string()).or_default() += 1;
        state.shard_maps.insert(db.to_string(), raw);
        Ok(())
    }

    async fn membership(&mut self) -> Result<Membership> {
        let membership = self
            .cluster
            .membership
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        Ok(membership.clone())
    }

    async fn cluster_settings(&mut self) -> Result<ClusterSettings> {
        Ok(self.cluster.settings)
    }

    async fn metadata_count(&mut self) -> Result<u64> {
        let mut state = self.cluster.lock();
        let stored = state.shard_maps.len() as u64;
        let Some(script) = state.scripted_counts.get_mut(&self.key) else {
            return Ok(stored);
        };
        let count = if script.len() > 1 {
            script.pop_front()
        } else {
            script.front().copied()
        };
        Ok(count.unwrap_or(stored))
    }
}
