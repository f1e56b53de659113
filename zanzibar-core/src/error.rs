use crate::models::Revision;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ZanzibarError {
    /// Write referenced an unknown namespace or relation
    #[error("Invalid tuple: {0}")]
    InvalidTuple(String),

    /// Optimistic concurrency check failed; nothing was committed
    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("Namespace not found: {0}")]
    NamespaceNotFound(String),

    #[error("Relation not found: {namespace}#{relation}")]
    RelationNotFound { namespace: String, relation: String },

    #[error("Schema error: {0}")]
    SchemaError(String),

    /// Recursion bound hit or an evaluation path repeated
    #[error("Evaluation depth exceeded: {0}")]
    EvaluationDepthExceeded(String),

    #[error("Revision {0} is not available")]
    RevisionNotAvailable(Revision),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error("Configuration error: {0}")]
    Configuration(#[from] config::ConfigError),
}

impl ZanzibarError {
    /// Stable code handed to RPC layers alongside the message
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidTuple(_) => "ZANZIBAR_1001",
            Self::PreconditionFailed(_) => "ZANZIBAR_1002",
            Self::NamespaceNotFound(_) => "ZANZIBAR_2001",
            Self::RelationNotFound { .. } => "ZANZIBAR_2002",
            Self::SchemaError(_) => "ZANZIBAR_2003",
            Self::EvaluationDepthExceeded(_) => "ZANZIBAR_3001",
            Self::RevisionNotAvailable(_) => "ZANZIBAR_3002",
            Self::Cancelled => "ZANZIBAR_3003",
            Self::InvalidFormat(_) => "ZANZIBAR_1003",
            Self::Configuration(_) => "ZANZIBAR_5001",
        }
    }

    pub(crate) fn relation_not_found(namespace: &str, relation: &str) -> Self {
        Self::RelationNotFound {
            namespace: namespace.to_string(),
            relation: relation.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ZanzibarError>;
