use thiserror::Error;

/// Errors reported by a coordination tree.
///
/// Only [`CoordError::ConnectionLoss`] is transient; everything else is either
/// a logical outcome the caller has to interpret (`NoNode`, `BadVersion`, ...)
/// or fatal to the session (`SessionExpired`).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoordError {
    #[error("Node does not exist: {0}")]
    NoNode(String),

    #[error("Node already exists: {0}")]
    NodeExists(String),

    #[error("Version mismatch for {0}")]
    BadVersion(String),

    #[error("Node has children: {0}")]
    NotEmpty(String),

    #[error("Ephemeral node cannot have children: {0}")]
    NoChildrenForEphemerals(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Connection to the coordination service lost")]
    ConnectionLoss,

    #[error("Coordination session {0} expired")]
    SessionExpired(u64),

    #[error("Coordination error: {0}")]
    Internal(String),
}

impl CoordError {
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, CoordError::ConnectionLoss)
    }

    pub fn is_session_expired(&self) -> bool {
        matches!(self, CoordError::SessionExpired(_))
    }

    pub fn is_no_node(&self) -> bool {
        matches!(self, CoordError::NoNode(_))
    }
}

pub type CoordResult<T> = std::result::Result<T, CoordError>;

#[derive(Error, Debug)]
pub enum SharddistError {
    #[error(transparent)]
    Coord(#[from] CoordError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Job descriptor codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("Manifest error: {0}")]
    Manifest(#[from] serde_json::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SharddistError {
    /// True if the underlying coordination session is gone and must be rebuilt.
    pub fn is_session_expired(&self) -> bool {
        matches!(self, SharddistError::Coord(e) if e.is_session_expired())
    }
}

pub type Result<T> = std::result::Result<T, SharddistError>;
