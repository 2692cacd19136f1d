//! Error types of the node manager.
//!
//! None of these are returned from the mutating entry points; they end up in
//! logs and in the health sink.

use std::fmt;
use std::path::PathBuf;

/// Error returned by a datapath handler callback.
pub type DatapathError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOperation {
    Add,
    Update,
    Delete,
    Validate,
}

impl fmt::Display for HandlerOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HandlerOperation::Add => "add",
            HandlerOperation::Update => "update",
            HandlerOperation::Delete => "delete",
            HandlerOperation::Validate => "validate",
        })
    }
}

/// One handler failing one callback for one node.
#[derive(Debug, thiserror::Error)]
#[error("handler {handler} failed to {operation} node {node}: {source}")]
pub struct HandlerError {
    pub handler: String,
    pub node: String,
    pub operation: HandlerOperation,
    #[source]
    pub source: DatapathError,
}

/// Several failures reported as one.
#[derive(Debug, Default, thiserror::Error)]
#[error("{}", join(.errors))]
pub struct JoinedError {
    pub errors: Vec<HandlerError>,
}

fn join(errors: &[HandlerError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl JoinedError {
    pub fn push(&mut self, error: HandlerError) {
        self.errors.push(error);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn into_result(self) -> Result<(), JoinedError> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("failed to prepare state directory {path}: {source}")]
    StateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("checkpoint io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode node checkpoint: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to decode node checkpoint {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("unsupported checkpoint version {found} (max {supported})")]
    UnsupportedVersion { found: u32, supported: u32 },
}
