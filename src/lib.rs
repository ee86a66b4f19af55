// ============================================================================
// couchshard Library
// ============================================================================

pub mod core;
pub mod connection;
pub mod enumerator;
pub mod pipeline;
pub mod progress;
pub mod rewriter;
pub mod monitor;
pub mod reconcile;

// Re-export main types for convenience
pub use crate::core::{
    ChangeAction, ChangelogEntry, ClusterError, ClusterSettings, Membership, NodeName, Result,
    ServerInfo, ShardMapDocument, ShardRange,
};

// Re-export connection API
pub use crate::connection::{
    ClusterSession, SessionFactory, connect,
    config::{ConnectionConfig, RetryPolicy},
    http::{HttpSession, HttpSessionFactory},
    memory::{InMemoryCluster, InMemorySession},
};

// ============================================================================
// Operations
// ============================================================================

pub use enumerator::KeyEnumerator;
pub use monitor::{ConvergenceMonitor, ConvergenceReport, MonitorConfig, NodeEndpoint, NodeSyncState};
pub use pipeline::{BoundedPipeline, ItemOutcome, ItemTransform, PipelineConfig, PipelineReport};
pub use progress::{MemoryProgress, ProgressEvent, ProgressSink, TracingProgress};
pub use reconcile::{ReconcileOptions, UpdateReport, metadata_counts, update_metadata, wait_for_convergence};
pub use rewriter::{MetadataRewriter, Preflight};
