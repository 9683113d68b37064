use std::path::PathBuf;

use serde_json::Error as JsonError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("graph file {path} could not be read: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("graph JSON could not be parsed: {source}")]
    Parse {
        #[from]
        source: JsonError,
    },
    #[error("unimplemented: {reason}")]
    Unimplemented { reason: String },
    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: String },
    #[error("out of range: {reason}")]
    OutOfRange { reason: String },
    #[error("internal: {reason}")]
    Internal { reason: String },
    #[error("not found: {reason}")]
    NotFound { reason: String },
    #[error("tensor/weights `{name}` already exist")]
    AlreadyExists { name: String },
    #[error("node `{node}`: {source}")]
    Node {
        node: String,
        #[source]
        source: Box<GraphError>,
    },
    #[error("graph could not be exported to {path}: {source}")]
    ExportIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Semantic class of a [`GraphError`], independent of the variant carrying it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Unimplemented,
    InvalidArgument,
    OutOfRange,
    Internal,
    NotFound,
    AlreadyExists,
    Io,
}

impl GraphError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        GraphError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn export(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        GraphError::ExportIo {
            path: path.into(),
            source,
        }
    }

    pub fn unimplemented(reason: impl Into<String>) -> Self {
        GraphError::Unimplemented {
            reason: reason.into(),
        }
    }

    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        GraphError::InvalidArgument {
            reason: reason.into(),
        }
    }

    pub fn out_of_range(reason: impl Into<String>) -> Self {
        GraphError::OutOfRange {
            reason: reason.into(),
        }
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        GraphError::Internal {
            reason: reason.into(),
        }
    }

    pub fn not_found(reason: impl Into<String>) -> Self {
        GraphError::NotFound {
            reason: reason.into(),
        }
    }

    /// Prepend context to the reason, keeping the kind. Variants without a
    /// free-form reason are returned unchanged.
    pub fn prefixed(self, prefix: &str) -> Self {
        match self {
            GraphError::Unimplemented { reason } => GraphError::Unimplemented {
                reason: format!("{}{}", prefix, reason),
            },
            GraphError::InvalidArgument { reason } => GraphError::InvalidArgument {
                reason: format!("{}{}", prefix, reason),
            },
            GraphError::OutOfRange { reason } => GraphError::OutOfRange {
                reason: format!("{}{}", prefix, reason),
            },
            GraphError::Internal { reason } => GraphError::Internal {
                reason: format!("{}{}", prefix, reason),
            },
            GraphError::NotFound { reason } => GraphError::NotFound {
                reason: format!("{}{}", prefix, reason),
            },
            other => other,
        }
    }

    /// Attach the failing node name. Already-wrapped errors are left alone so
    /// the innermost node stays the one reported.
    pub fn in_node(self, node: &str) -> Self {
        match self {
            GraphError::Node { .. } => self,
            other => GraphError::Node {
                node: node.to_string(),
                source: Box::new(other),
            },
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            GraphError::Io { .. } | GraphError::Parse { .. } | GraphError::ExportIo { .. } => {
                ErrorKind::Io
            }
            GraphError::Unimplemented { .. } => ErrorKind::Unimplemented,
            GraphError::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            GraphError::OutOfRange { .. } => ErrorKind::OutOfRange,
            GraphError::Internal { .. } => ErrorKind::Internal,
            GraphError::NotFound { .. } => ErrorKind::NotFound,
            GraphError::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            GraphError::Node { source, .. } => source.kind(),
        }
    }

    /// Name of the node the error was raised for, if it was attached.
    pub fn node(&self) -> Option<&str> {
        match self {
            GraphError::Node { node, .. } => Some(node),
            _ => None,
        }
    }
}
