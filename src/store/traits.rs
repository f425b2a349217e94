use anyhow::Result;
use std::collections::HashSet;
use std::time::Duration;

use crate::model::{
    Branch, BranchAddress, ContentObject, Deploy, Id, InsertOutcome, JobRecord, NewContentObject,
    NewDeploy, ReclaimJob, Timestamp,
};

#[async_trait::async_trait]
pub trait ContentObjectStore: Send + Sync {
    /// Look up a blob row by its primary (sha256) hash
    async fn get_content_object(&self, sha256: &str) -> Result<Option<ContentObject>>;
    /// Subset of `hashes` that already have a row
    async fn find_existing_hashes(&self, hashes: &[String]) -> Result<HashSet<String>>;
    /// Insert a new row; a uniqueness violation on any hash column reports `AlreadyExists`
    async fn insert_content_object(&self, new: NewContentObject) -> Result<InsertOutcome>;
    /// Undo an insert whose byte write failed inside the same critical section
    async fn discard_content_object(&self, sha256: &str) -> Result<()>;
}

#[async_trait::async_trait]
pub trait BranchStore: Send + Sync {
    async fn get_branch(&self, id: Id) -> Result<Option<Branch>>;
    async fn find_branch(&self, address: &BranchAddress) -> Result<Option<Branch>>;
    /// Returns the branch and whether it was created by this call. Slugs are
    /// unique per game, so an existing branch may belong to another org.
    async fn get_or_create_branch(&self, address: &BranchAddress, at: Timestamp)
        -> Result<(Branch, bool)>;
    async fn set_branch_password(&self, id: Id, seal: Option<String>, at: Timestamp) -> Result<bool>;
    async fn set_branch_pinned(&self, id: Id, pinned: bool, at: Timestamp) -> Result<bool>;
    /// Clear both pointers. Callers hold the branch lock.
    async fn clear_branch_pointers(&self, id: Id, at: Timestamp) -> Result<()>;
    /// Delete the row; fails while either pointer is still set
    async fn delete_branch(&self, id: Id) -> Result<bool>;
}

#[async_trait::async_trait]
pub trait DeployStore: Send + Sync {
    async fn get_deploy(&self, id: Id) -> Result<Option<Deploy>>;
    /// Insert in `deploying` state with the next per-branch number.
    /// Callers hold the branch lock.
    async fn create_deploy(&self, new: NewDeploy) -> Result<Deploy>;
    /// Move a `deploying` deploy to `failed`; returns false if it was not `deploying`
    async fn mark_deploy_failed(&self, id: Id, error: &str, at: Timestamp) -> Result<bool>;
    /// Atomically mark a `deploying` deploy `ready` and point both branch
    /// pointers at it. Returns the previously active deploy id.
    /// Fails if the deploy is not `deploying`. Callers hold the branch lock.
    async fn promote_deploy(&self, id: Id, at: Timestamp) -> Result<Option<Id>>;
    /// Set the soft-delete fields; returns false if already deleted
    async fn soft_delete_deploy(&self, id: Id, reason: &str, at: Timestamp) -> Result<bool>;
    async fn list_deploys_for_branch(&self, branch_id: Id) -> Result<Vec<Deploy>>;
    /// Ready, undeleted deploys older than `before` that no branch points at,
    /// excluding deploys of pinned branches
    async fn list_reclaimable_deploys(&self, before: Timestamp) -> Result<Vec<Deploy>>;
    /// Undeleted deploys still `deploying` since before `before`
    async fn list_abandoned_deploys(&self, before: Timestamp) -> Result<Vec<Deploy>>;
}

#[async_trait::async_trait]
pub trait JobStore: Send + Sync {
    /// Enqueue unless a pending job with the same identity exists.
    /// Returns the job id and whether the enqueue collapsed onto an existing job.
    async fn enqueue_job(&self, identity: &str, job: &ReclaimJob, at: Timestamp) -> Result<(Id, bool)>;
    /// Pending jobs whose `next_run_at <= now`, oldest first.
    /// Claimed jobs are pushed back by `lease` so other workers skip them.
    async fn claim_due_jobs(&self, now: Timestamp, limit: usize, lease: Duration) -> Result<Vec<JobRecord>>;
    async fn complete_job(&self, id: Id, at: Timestamp) -> Result<()>;
    async fn retry_job(&self, id: Id, attempts: i32, next_run_at: Timestamp, error: &str) -> Result<()>;
    async fn bury_job(&self, id: Id, attempts: i32, error: &str, at: Timestamp) -> Result<()>;
    async fn get_job(&self, id: Id) -> Result<Option<JobRecord>>;
    async fn list_buried_jobs(&self) -> Result<Vec<JobRecord>>;
}

/// Small shared key/value cache with optional expiry
#[async_trait::async_trait]
pub trait CacheStore: Send + Sync {
    async fn cache_put(&self, key: &str, value: serde_json::Value, ttl: Option<Duration>) -> Result<()>;
    async fn cache_get(&self, key: &str) -> Result<Option<serde_json::Value>>;
    /// Idempotent; returns whether a key was removed
    async fn cache_evict(&self, key: &str) -> Result<bool>;
    async fn cache_keys(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Held advisory lock. Dropping the guard releases the lock.
pub struct LockGuard {
    name: String,
    _held: Box<dyn std::any::Any + Send>,
}

impl LockGuard {
    pub fn new(name: impl Into<String>, held: impl std::any::Any + Send) -> Self {
        Self {
            name: name.into(),
            _held: Box::new(held),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard").field("name", &self.name).finish()
    }
}

/// Named mutex that lives alongside the data it protects
#[async_trait::async_trait]
pub trait LockManager: Send + Sync {
    /// Wait at most `timeout`; `Ok(None)` means the lock was not acquired in time
    async fn acquire_lock(&self, name: &str, timeout: Duration) -> Result<Option<LockGuard>>;
}

pub fn branch_lock_name(branch_id: Id) -> String {
    format!("branch:{}", branch_id)
}

pub fn content_lock_name(sha256: &str) -> String {
    format!("content:{}", sha256)
}

pub trait Store:
    ContentObjectStore + BranchStore + DeployStore + JobStore + CacheStore + LockManager + Send + Sync
{
}
