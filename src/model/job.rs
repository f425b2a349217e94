use serde::{Deserialize, Serialize};

use crate::model::{Id, Timestamp};
use crate::storage::paths::is_safe_deploy_path;

/// Deferred reclamation work. Closed set: adding a kind means adding a
/// variant and a match arm in the reclaimer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ReclaimJob {
    /// Record the path for human review; never touches storage
    MarkForTrash { path: String, reason: String },
    /// Delete the directory from both tiers, then evict its trash entries
    RemoveDirectory { path: String, reason: String },
}

impl ReclaimJob {
    pub fn kind(&self) -> &'static str {
        match self {
            ReclaimJob::MarkForTrash { .. } => "mark-for-trash",
            ReclaimJob::RemoveDirectory { .. } => "remove-directory",
        }
    }

    pub fn path(&self) -> &str {
        match self {
            ReclaimJob::MarkForTrash { path, .. } | ReclaimJob::RemoveDirectory { path, .. } => {
                path
            }
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            ReclaimJob::MarkForTrash { reason, .. }
            | ReclaimJob::RemoveDirectory { reason, .. } => reason,
        }
    }

    /// Repeated enqueues with the same identity collapse onto one pending job
    pub fn identity(&self) -> String {
        format!("{}:{}", self.kind(), self.path())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Done,
    /// Out of retries or hard-stopped; needs manual attention
    Buried,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Done => "done",
            JobStatus::Buried => "buried",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(JobStatus::Pending),
            "done" => Some(JobStatus::Done),
            "buried" => Some(JobStatus::Buried),
            _ => None,
        }
    }
}

/// Durable job state; plain data so retries survive restarts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: Id,
    pub identity: String,
    pub job: ReclaimJob,
    pub status: JobStatus,
    pub attempts: i32,
    pub next_run_at: Timestamp,
    pub last_error: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// A path awaiting manual or automatic deletion, stored under a cache key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrashEntry {
    pub path: String,
    pub reason: String,
    pub safe: bool,
    pub recorded_at: Timestamp,
}

impl TrashEntry {
    pub fn new(path: impl Into<String>, reason: impl Into<String>, recorded_at: Timestamp) -> Self {
        let path = path.into();
        Self {
            safe: is_safe_deploy_path(&path),
            path,
            reason: reason.into(),
            recorded_at,
        }
    }

    pub fn cache_key(&self) -> String {
        trash_cache_key(&self.path, self.safe)
    }
}

pub const TRASH_KEY_PREFIX: &str = "trash:";

pub fn trash_cache_key(path: &str, safe: bool) -> String {
    let class = if safe { "safe" } else { "unsafe" };
    format!("{}{}:{}", TRASH_KEY_PREFIX, class, path)
}
