use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::jsonl::JsonlParseError;

pub type AuditResult<T> = Result<T, AuditError>;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Parse(#[from] JsonlParseError),

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("policy compiled to an empty assertion set")]
    EmptyAssertionSet,

    #[error("assertion {assertion_id} failed to evaluate: {message}")]
    AssertionEvaluation {
        assertion_id: String,
        message: String,
    },

    #[error("internal error: {0}")]
    Internal(String),
}

impl AuditError {
    pub fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}
