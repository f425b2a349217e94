use serde::{Deserialize, Serialize};

use crate::model::{Id, Manifest, Timestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeployState {
    Deploying,
    Ready,
    Failed,
}

impl DeployState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeployState::Deploying => "deploying",
            DeployState::Ready => "ready",
            DeployState::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "deploying" => Some(DeployState::Deploying),
            "ready" => Some(DeployState::Ready),
            "failed" => Some(DeployState::Failed),
            _ => None,
        }
    }

    /// `ready` and `failed` are final
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DeployState::Deploying)
    }
}

/// One attempt to publish content to a branch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deploy {
    pub id: Id,
    pub org_id: Id,
    pub game_id: Id,
    pub branch_id: Id,
    /// Root of the materialized tree, see [`crate::storage::paths::deploy_path`]
    pub path: String,
    pub state: DeployState,
    /// Monotonic per branch, starting at 1
    pub number: i32,
    pub error: Option<String>,
    #[serde(skip_serializing)]
    pub manifest: Manifest,
    pub deploying_on: Timestamp,
    pub deployed_on: Option<Timestamp>,
    pub failed_on: Option<Timestamp>,
    pub deployed_by: String,
    pub deleted_on: Option<Timestamp>,
    pub deleted_reason: Option<String>,
}

impl Deploy {
    pub fn is_deleted(&self) -> bool {
        self.deleted_on.is_some()
    }

    pub fn is_ready(&self) -> bool {
        self.state == DeployState::Ready
    }
}

/// Insert request; the store assigns `id` and `number`
#[derive(Debug, Clone)]
pub struct NewDeploy {
    pub org_id: Id,
    pub game_id: Id,
    pub branch_id: Id,
    pub path: String,
    pub manifest: Manifest,
    pub deployed_by: String,
    pub deploying_on: Timestamp,
}

/// Why a deploy was soft-deleted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteReason {
    Superseded,
    Abandoned,
    BranchDeleted,
    Expired,
}

impl DeleteReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeleteReason::Superseded => "superseded",
            DeleteReason::Abandoned => "abandoned",
            DeleteReason::BranchDeleted => "branch-deleted",
            DeleteReason::Expired => "expired",
        }
    }
}

impl std::fmt::Display for DeleteReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
