use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("Connection error: {url} unreachable after {attempts} attempt(s): {source}")]
    Connection {
        url: String,
        attempts: u32,
        #[source]
        source: Box<ClusterError>,
    },

    #[error("Configuration mismatch: {0}")]
    ConfigurationMismatch(String),

    #[error("Document '{0}' not found")]
    DocumentMissing(String),

    #[error("Transform failed for '{item}': {source}")]
    Transform {
        item: String,
        #[source]
        source: Box<ClusterError>,
    },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unexpected status {status} from {path}: {body}")]
    Status {
        status: u16,
        path: String,
        body: String,
    },

    #[error("Invalid document '{0}': {1}")]
    InvalidDocument(String, String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Worker failure: {0}")]
    Worker(String),

    /// Raised inside the pipeline when a task observes cancellation. It is
    /// never returned to callers.
    #[error("Operation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, ClusterError>;

impl ClusterError {
    /// Wraps a store error raised while transforming `item`.
    ///
    /// `DocumentMissing` passes through unchanged so the pipeline can still
    /// skip the item. A `Cancelled` raised by the transform itself is wrapped
    /// like any other failure: only the pipeline may cancel its own tasks.
    pub fn in_transform(item: impl Into<String>, err: ClusterError) -> Self {
        match err {
            err @ (ClusterError::DocumentMissing(_) | ClusterError::Transform { .. }) => err,
            other => ClusterError::Transform {
                item: item.into(),
                source: Box::new(other),
            },
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ClusterError::Cancelled)
    }

    pub fn is_document_missing(&self) -> bool {
        matches!(self, ClusterError::DocumentMissing(_))
    }
}

impl From<serde_json::Error> for ClusterError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<tokio::task::JoinError> for ClusterError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Worker(err.to_string())
    }
}
