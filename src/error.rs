//! Error taxonomy for pipeline operations.
//!
//! Store traits speak `anyhow::Result`; everything that crosses the logic
//! layer boundary is a [`PipelineError`] so callers can map failures to
//! responses without string matching.

use thiserror::Error;

use crate::model::Id;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// malformed manifest, asset reference or request
    #[error("validation failed: {0}")]
    Validation(String),

    /// unknown org/game/branch/deploy
    #[error("{kind} not found: {key}")]
    NotFound { kind: &'static str, key: String },

    /// lock acquisition timed out or the entity moved on underneath us
    #[error("conflict: {0}")]
    Conflict(String),

    /// claimed and computed content disagree
    #[error("integrity check failed for {path}: expected {expected}, computed {actual}")]
    Integrity {
        path: String,
        expected: String,
        actual: String,
    },

    /// remote tier unreachable during a durability-required write
    #[error("storage unavailable: {0}")]
    Storage(String),

    /// password or membership failure surfaced by a collaborator
    #[error("not authorized: {0}")]
    Authorization(String),

    /// reclaimer refused to touch a path outside the deploy layout
    #[error("refusing to remove unsafe path '{0}'")]
    UnsafePath(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type PipelineResult<T> = Result<T, PipelineError>;

impl PipelineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn deploy_not_found(id: Id) -> Self {
        Self::NotFound {
            kind: "deploy",
            key: id.to_string(),
        }
    }

    pub fn branch_not_found(key: impl std::fmt::Display) -> Self {
        Self::NotFound {
            kind: "branch",
            key: key.to_string(),
        }
    }

    /// Whether retrying the same call later could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Conflict(_) | Self::Storage(_) | Self::Internal(_))
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(err.into())
    }
}
