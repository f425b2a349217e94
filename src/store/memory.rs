use anyhow::{anyhow, bail, Result};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use crate::model::{
    Branch, BranchAddress, ContentObject, Deploy, DeployState, Id, InsertOutcome, JobRecord,
    JobStatus, NewContentObject, NewDeploy, ReclaimJob, Timestamp,
};
use crate::store::cache::TtlCache;
use crate::store::traits::{
    BranchStore, CacheStore, ContentObjectStore, DeployStore, JobStore, LockGuard, LockManager,
    Store,
};

#[derive(Debug, Default)]
struct MemoryState {
    /// keyed by sha256
    content: HashMap<String, ContentObject>,
    /// sha384 and sha512 values already taken
    secondary_hashes: HashSet<String>,
    next_content_id: Id,
    /// arena; deleted branches leave a hole so ids stay stable
    branches: Vec<Option<Branch>>,
    /// append-only arena, id = index + 1
    deploys: Vec<Deploy>,
    jobs: Vec<JobRecord>,
}

impl MemoryState {
    fn branch(&self, id: Id) -> Option<&Branch> {
        slot(id).and_then(|i| self.branches.get(i)).and_then(|b| b.as_ref())
    }

    fn branch_mut(&mut self, id: Id) -> Option<&mut Branch> {
        slot(id)
            .and_then(|i| self.branches.get_mut(i))
            .and_then(|b| b.as_mut())
    }

    fn deploy(&self, id: Id) -> Option<&Deploy> {
        slot(id).and_then(|i| self.deploys.get(i))
    }

    fn deploy_mut(&mut self, id: Id) -> Option<&mut Deploy> {
        slot(id).and_then(|i| self.deploys.get_mut(i))
    }

    fn job_mut(&mut self, id: Id) -> Result<&mut JobRecord> {
        slot(id)
            .and_then(|i| self.jobs.get_mut(i))
            .ok_or_else(|| anyhow!("Job not found: {}", id))
    }

    fn is_referenced(&self, deploy: &Deploy) -> bool {
        self.branch(deploy.branch_id)
            .map_or(false, |b| b.references(deploy.id))
    }
}

fn slot(id: Id) -> Option<usize> {
    if id < 1 {
        None
    } else {
        Some((id - 1) as usize)
    }
}

/// Single-process store.
///
/// Everything lives behind one mutex; advisory locks are per-name tokio
/// mutexes so waiting tasks do not block the runtime.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    locks: LockTable,
    cache: TtlCache,
}

type NamedMutex = Arc<tokio::sync::Mutex<()>>;
type LockTable = Arc<Mutex<HashMap<String, NamedMutex>>>;

/// Remove `name` from the table once only the table and `mutex` refer to it.
fn release_entry(table: &LockTable, name: &str, mutex: &NamedMutex) {
    let mut locks = table.lock();
    let idle = locks
        .get(name)
        .map_or(false, |current| Arc::ptr_eq(current, mutex) && Arc::strong_count(mutex) == 2);
    if idle {
        locks.remove(name);
    }
}

/// Held inside a [`LockGuard`]; unlocks, then prunes the table entry
struct HeldLock {
    table: LockTable,
    name: String,
    mutex: NamedMutex,
    guard: Option<tokio::sync::OwnedMutexGuard<()>>,
}

impl Drop for HeldLock {
    fn drop(&mut self) {
        self.guard.take();
        release_entry(&self.table, &self.name, &self.mutex);
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl ContentObjectStore for MemoryStore {
    async fn get_content_object(&self, sha256: &str) -> Result<Option<ContentObject>> {
        Ok(self.state.lock().content.get(sha256).cloned())
    }

    async fn find_existing_hashes(&self, hashes: &[String]) -> Result<HashSet<String>> {
        let state = self.state.lock();
        Ok(hashes
            .iter()
            .filter(|h| state.content.contains_key(h.as_str()))
            .cloned()
            .collect())
    }

    async fn insert_content_object(&self, new: NewContentObject) -> Result<InsertOutcome> {
        let mut state = self.state.lock();
        let hashes = &new.hashes;

        if state.content.contains_key(&hashes.sha256)
            || state.secondary_hashes.contains(&hashes.sha384)
            || state.secondary_hashes.contains(&hashes.sha512)
        {
            return Ok(InsertOutcome::AlreadyExists);
        }

        state.next_content_id += 1;
        let object = ContentObject {
            id: state.next_content_id,
            sha256: hashes.sha256.clone(),
            sha384: hashes.sha384.clone(),
            sha512: hashes.sha512.clone(),
            content_length: new.content_length,
            content_type: new.content_type,
            created_at: new.created_at,
            updated_at: new.created_at,
        };
        state.secondary_hashes.insert(object.sha384.clone());
        state.secondary_hashes.insert(object.sha512.clone());
        state.content.insert(object.sha256.clone(), object.clone());

        Ok(InsertOutcome::Inserted(object))
    }

    async fn discard_content_object(&self, sha256: &str) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(object) = state.content.remove(sha256) {
            state.secondary_hashes.remove(&object.sha384);
            state.secondary_hashes.remove(&object.sha512);
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl BranchStore for MemoryStore {
    async fn get_branch(&self, id: Id) -> Result<Option<Branch>> {
        Ok(self.state.lock().branch(id).cloned())
    }

    async fn find_branch(&self, address: &BranchAddress) -> Result<Option<Branch>> {
        let state = self.state.lock();
        Ok(state
            .branches
            .iter()
            .flatten()
            .find(|b| {
                b.org_id == address.org_id && b.game_id == address.game_id && b.slug == address.slug
            })
            .cloned())
    }

    async fn get_or_create_branch(
        &self,
        address: &BranchAddress,
        at: Timestamp,
    ) -> Result<(Branch, bool)> {
        let mut state = self.state.lock();

        if let Some(existing) = state
            .branches
            .iter()
            .flatten()
            .find(|b| b.game_id == address.game_id && b.slug == address.slug)
        {
            return Ok((existing.clone(), false));
        }

        let branch = Branch {
            id: state.branches.len() as Id + 1,
            org_id: address.org_id,
            game_id: address.game_id,
            slug: address.slug.clone(),
            password_seal: None,
            pinned: false,
            active_deploy_id: None,
            latest_deploy_id: None,
            created_at: at,
            updated_at: at,
        };
        state.branches.push(Some(branch.clone()));
        Ok((branch, true))
    }

    async fn set_branch_password(&self, id: Id, seal: Option<String>, at: Timestamp) -> Result<bool> {
        let mut state = self.state.lock();
        match state.branch_mut(id) {
            Some(branch) => {
                branch.password_seal = seal;
                branch.updated_at = at;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn set_branch_pinned(&self, id: Id, pinned: bool, at: Timestamp) -> Result<bool> {
        let mut state = self.state.lock();
        match state.branch_mut(id) {
            Some(branch) => {
                branch.pinned = pinned;
                branch.updated_at = at;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn clear_branch_pointers(&self, id: Id, at: Timestamp) -> Result<()> {
        let mut state = self.state.lock();
        let branch = state
            .branch_mut(id)
            .ok_or_else(|| anyhow!("Branch not found: {}", id))?;
        branch.active_deploy_id = None;
        branch.latest_deploy_id = None;
        branch.updated_at = at;
        Ok(())
    }

    async fn delete_branch(&self, id: Id) -> Result<bool> {
        let mut state = self.state.lock();
        let Some(index) = slot(id) else {
            return Ok(false);
        };
        match state.branches.get(index) {
            Some(Some(branch)) if branch.has_pointers() => {
                bail!("Branch {} still points at a deploy", id)
            }
            Some(Some(_)) => {
                state.branches[index] = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait::async_trait]
impl DeployStore for MemoryStore {
    async fn get_deploy(&self, id: Id) -> Result<Option<Deploy>> {
        Ok(self.state.lock().deploy(id).cloned())
    }

    async fn create_deploy(&self, new: NewDeploy) -> Result<Deploy> {
        let mut state = self.state.lock();

        if state.branch(new.branch_id).is_none() {
            bail!("Branch not found: {}", new.branch_id);
        }

        let number = state
            .deploys
            .iter()
            .filter(|d| d.branch_id == new.branch_id)
            .map(|d| d.number)
            .max()
            .unwrap_or(0)
            + 1;

        let deploy = Deploy {
            id: state.deploys.len() as Id + 1,
            org_id: new.org_id,
            game_id: new.game_id,
            branch_id: new.branch_id,
            path: new.path,
            state: DeployState::Deploying,
            number,
            error: None,
            manifest: new.manifest,
            deploying_on: new.deploying_on,
            deployed_on: None,
            failed_on: None,
            deployed_by: new.deployed_by,
            deleted_on: None,
            deleted_reason: None,
        };
        state.deploys.push(deploy.clone());
        Ok(deploy)
    }

    async fn mark_deploy_failed(&self, id: Id, error: &str, at: Timestamp) -> Result<bool> {
        let mut state = self.state.lock();
        let deploy = state
            .deploy_mut(id)
            .ok_or_else(|| anyhow!("Deploy not found: {}", id))?;
        if deploy.state != DeployState::Deploying {
            return Ok(false);
        }
        deploy.state = DeployState::Failed;
        deploy.error = Some(error.to_string());
        deploy.failed_on = Some(at);
        Ok(true)
    }

    async fn promote_deploy(&self, id: Id, at: Timestamp) -> Result<Option<Id>> {
        let mut state = self.state.lock();

        let deploy = state
            .deploy(id)
            .ok_or_else(|| anyhow!("Deploy not found: {}", id))?;
        if deploy.state != DeployState::Deploying || deploy.is_deleted() {
            bail!("Deploy {} is {}, not deploying", id, deploy.state.as_str());
        }
        let branch_id = deploy.branch_id;
        if state.branch(branch_id).is_none() {
            bail!("Branch not found: {}", branch_id);
        }

        if let Some(deploy) = state.deploy_mut(id) {
            deploy.state = DeployState::Ready;
            deploy.deployed_on = Some(at);
        }
        let branch = state
            .branch_mut(branch_id)
            .ok_or_else(|| anyhow!("Branch not found: {}", branch_id))?;
        let previous = branch.active_deploy_id;
        branch.active_deploy_id = Some(id);
        branch.latest_deploy_id = Some(id);
        branch.updated_at = at;

        Ok(previous)
    }

    async fn soft_delete_deploy(&self, id: Id, reason: &str, at: Timestamp) -> Result<bool> {
        let mut state = self.state.lock();
        let deploy = state
            .deploy_mut(id)
            .ok_or_else(|| anyhow!("Deploy not found: {}", id))?;
        if deploy.is_deleted() {
            return Ok(false);
        }
        deploy.deleted_on = Some(at);
        deploy.deleted_reason = Some(reason.to_string());
        Ok(true)
    }

    async fn list_deploys_for_branch(&self, branch_id: Id) -> Result<Vec<Deploy>> {
        let state = self.state.lock();
        Ok(state
            .deploys
            .iter()
            .filter(|d| d.branch_id == branch_id)
            .cloned()
            .collect())
    }

    async fn list_reclaimable_deploys(&self, before: Timestamp) -> Result<Vec<Deploy>> {
        let state = self.state.lock();
        Ok(state
            .deploys
            .iter()
            .filter(|d| d.is_ready() && !d.is_deleted())
            .filter(|d| d.deployed_on.map_or(false, |at| at < before))
            .filter(|d| !state.is_referenced(d))
            .filter(|d| !state.branch(d.branch_id).map_or(false, |b| b.pinned))
            .cloned()
            .collect())
    }

    async fn list_abandoned_deploys(&self, before: Timestamp) -> Result<Vec<Deploy>> {
        let state = self.state.lock();
        Ok(state
            .deploys
            .iter()
            .filter(|d| d.state == DeployState::Deploying && !d.is_deleted())
            .filter(|d| d.deploying_on < before)
            .cloned()
            .collect())
    }
}

#[async_trait::async_trait]
impl JobStore for MemoryStore {
    async fn enqueue_job(&self, identity: &str, job: &ReclaimJob, at: Timestamp) -> Result<(Id, bool)> {
        let mut state = self.state.lock();

        if let Some(existing) = state
            .jobs
            .iter()
            .find(|j| j.identity == identity && j.status == JobStatus::Pending)
        {
            return Ok((existing.id, true));
        }

        let id = state.jobs.len() as Id + 1;
        state.jobs.push(JobRecord {
            id,
            identity: identity.to_string(),
            job: job.clone(),
            status: JobStatus::Pending,
            attempts: 0,
            next_run_at: at,
            last_error: None,
            created_at: at,
            updated_at: at,
        });
        Ok((id, false))
    }

    async fn claim_due_jobs(&self, now: Timestamp, limit: usize, lease: Duration) -> Result<Vec<JobRecord>> {
        let mut state = self.state.lock();
        let lease = chrono::Duration::from_std(lease)?;

        let mut due: Vec<usize> = state
            .jobs
            .iter()
            .enumerate()
            .filter(|(_, j)| j.status == JobStatus::Pending && j.next_run_at <= now)
            .map(|(i, _)| i)
            .collect();
        due.sort_by_key(|&i| (state.jobs[i].next_run_at, state.jobs[i].id));
        due.truncate(limit);

        let mut claimed = Vec::with_capacity(due.len());
        for i in due {
            let job = &mut state.jobs[i];
            claimed.push(job.clone());
            job.next_run_at = now + lease;
            job.updated_at = now;
        }
        Ok(claimed)
    }

    async fn complete_job(&self, id: Id, at: Timestamp) -> Result<()> {
        let mut state = self.state.lock();
        let job = state.job_mut(id)?;
        job.status = JobStatus::Done;
        job.updated_at = at;
        Ok(())
    }

    async fn retry_job(&self, id: Id, attempts: i32, next_run_at: Timestamp, error: &str) -> Result<()> {
        let mut state = self.state.lock();
        let job = state.job_mut(id)?;
        job.status = JobStatus::Pending;
        job.attempts = attempts;
        job.next_run_at = next_run_at;
        job.last_error = Some(error.to_string());
        job.updated_at = chrono::Utc::now();
        Ok(())
    }

    async fn bury_job(&self, id: Id, attempts: i32, error: &str, at: Timestamp) -> Result<()> {
        let mut state = self.state.lock();
        let job = state.job_mut(id)?;
        job.status = JobStatus::Buried;
        job.attempts = attempts;
        job.last_error = Some(error.to_string());
        job.updated_at = at;
        Ok(())
    }

    async fn get_job(&self, id: Id) -> Result<Option<JobRecord>> {
        let state = self.state.lock();
        Ok(slot(id).and_then(|i| state.jobs.get(i)).cloned())
    }

    async fn list_buried_jobs(&self) -> Result<Vec<JobRecord>> {
        let state = self.state.lock();
        Ok(state
            .jobs
            .iter()
            .filter(|j| j.status == JobStatus::Buried)
            .cloned()
            .collect())
    }
}

#[async_trait::async_trait]
impl CacheStore for MemoryStore {
    async fn cache_put(&self, key: &str, value: serde_json::Value, ttl: Option<Duration>) -> Result<()> {
        self.cache.put(key, value, ttl).await;
        Ok(())
    }

    async fn cache_get(&self, key: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.cache.get(key).await)
    }

    async fn cache_evict(&self, key: &str) -> Result<bool> {
        Ok(self.cache.remove(key).await)
    }

    async fn cache_keys(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self.cache.keys(prefix).await)
    }
}

#[async_trait::async_trait]
impl LockManager for MemoryStore {
    async fn acquire_lock(&self, name: &str, timeout: Duration) -> Result<Option<LockGuard>> {
        let mutex = {
            let mut locks = self.locks.lock();
            locks
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };

        match tokio::time::timeout(timeout, mutex.clone().lock_owned()).await {
            Ok(guard) => Ok(Some(LockGuard::new(
                name,
                HeldLock {
                    table: self.locks.clone(),
                    name: name.to_string(),
                    mutex,
                    guard: Some(guard),
                },
            ))),
            Err(_) => {
                release_entry(&self.locks, name, &mutex);
                Ok(None)
            }
        }
    }
}

impl Store for MemoryStore {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ContentHashes, Manifest};
    use chrono::Utc;

    fn new_deploy(branch: &Branch) -> NewDeploy {
        NewDeploy {
            org_id: branch.org_id,
            game_id: branch.game_id,
            branch_id: branch.id,
            path: format!("deploys/1/2/{}/x", branch.id),
            manifest: Manifest::default(),
            deployed_by: "tester".to_string(),
            deploying_on: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_content_insert_is_unique_per_hash() {
        let store = MemoryStore::new();
        let new = NewContentObject {
            hashes: ContentHashes::compute(b"abc"),
            content_length: 3,
            content_type: "text/plain".to_string(),
            created_at: Utc::now(),
        };

        assert!(matches!(
            store.insert_content_object(new.clone()).await.unwrap(),
            InsertOutcome::Inserted(_)
        ));
        assert!(matches!(
            store.insert_content_object(new.clone()).await.unwrap(),
            InsertOutcome::AlreadyExists
        ));

        store.discard_content_object(&new.hashes.sha256).await.unwrap();
        assert!(matches!(
            store.insert_content_object(new).await.unwrap(),
            InsertOutcome::Inserted(_)
        ));
    }

    #[tokio::test]
    async fn test_deploy_numbers_and_promotion() {
        let store = MemoryStore::new();
        let address = BranchAddress::new(1, 2, "main");
        let (branch, created) = store.get_or_create_branch(&address, Utc::now()).await.unwrap();
        assert!(created);
        let (again, created) = store.get_or_create_branch(&address, Utc::now()).await.unwrap();
        assert!(!created);
        assert_eq!(again.id, branch.id);

        let first = store.create_deploy(new_deploy(&branch)).await.unwrap();
        let second = store.create_deploy(new_deploy(&branch)).await.unwrap();
        assert_eq!((first.number, second.number), (1, 2));

        assert_eq!(store.promote_deploy(first.id, Utc::now()).await.unwrap(), None);
        assert_eq!(
            store.promote_deploy(second.id, Utc::now()).await.unwrap(),
            Some(first.id)
        );
        // promoting twice is refused
        assert!(store.promote_deploy(second.id, Utc::now()).await.is_err());

        let branch = store.get_branch(branch.id).await.unwrap().unwrap();
        assert_eq!(branch.active_deploy_id, Some(second.id));
        assert_eq!(branch.latest_deploy_id, Some(second.id));
        assert!(store.delete_branch(branch.id).await.is_err());
    }

    #[tokio::test]
    async fn test_reclaimable_excludes_referenced_and_pinned() {
        let store = MemoryStore::new();
        let (branch, _) = store
            .get_or_create_branch(&BranchAddress::new(1, 2, "main"), Utc::now())
            .await
            .unwrap();
        let old = store.create_deploy(new_deploy(&branch)).await.unwrap();
        let new = store.create_deploy(new_deploy(&branch)).await.unwrap();
        store.promote_deploy(old.id, Utc::now()).await.unwrap();
        store.promote_deploy(new.id, Utc::now()).await.unwrap();

        let later = Utc::now() + chrono::Duration::seconds(1);
        let reclaimable = store.list_reclaimable_deploys(later).await.unwrap();
        assert_eq!(reclaimable.iter().map(|d| d.id).collect::<Vec<_>>(), vec![old.id]);

        store.set_branch_pinned(branch.id, true, Utc::now()).await.unwrap();
        assert!(store.list_reclaimable_deploys(later).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_job_identity_collapses_pending_jobs() {
        let store = MemoryStore::new();
        let job = ReclaimJob::RemoveDirectory {
            path: "deploys/1/2/3/x".to_string(),
            reason: "superseded".to_string(),
        };
        let now = Utc::now();

        let (id, collapsed) = store.enqueue_job(&job.identity(), &job, now).await.unwrap();
        assert!(!collapsed);
        let (same, collapsed) = store.enqueue_job(&job.identity(), &job, now).await.unwrap();
        assert!(collapsed);
        assert_eq!(id, same);

        let claimed = store
            .claim_due_jobs(now, 10, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        // leased jobs are not handed out twice
        assert!(store
            .claim_due_jobs(now, 10, Duration::from_secs(60))
            .await
            .unwrap()
            .is_empty());

        store.complete_job(id, now).await.unwrap();
        let (fresh, collapsed) = store.enqueue_job(&job.identity(), &job, now).await.unwrap();
        assert!(!collapsed);
        assert_ne!(fresh, id);
    }

    #[tokio::test]
    async fn test_lock_times_out_while_held() {
        let store = MemoryStore::new();
        let guard = store
            .acquire_lock("branch:1", Duration::from_millis(50))
            .await
            .unwrap()
            .expect("first acquire");
        assert_eq!(guard.name(), "branch:1");

        let second = store
            .acquire_lock("branch:1", Duration::from_millis(50))
            .await
            .unwrap();
        assert!(second.is_none());

        // other names are independent
        assert!(store
            .acquire_lock("branch:2", Duration::from_millis(50))
            .await
            .unwrap()
            .is_some());

        drop(guard);
        assert!(store
            .acquire_lock("branch:1", Duration::from_millis(50))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_released_locks_leave_no_entries() {
        let store = Arc::new(MemoryStore::new());
        for i in 0..1000 {
            let guard = store
                .acquire_lock(&format!("content:{}", i), Duration::from_millis(50))
                .await
                .unwrap();
            assert!(guard.is_some());
        }
        assert!(store.locks.lock().is_empty());

        // a waiter that times out, then one that takes over from the holder
        let guard = store
            .acquire_lock("branch:1", Duration::from_millis(50))
            .await
            .unwrap()
            .expect("first acquire");
        assert!(store
            .acquire_lock("branch:1", Duration::from_millis(20))
            .await
            .unwrap()
            .is_none());
        assert_eq!(store.locks.lock().len(), 1);

        let waiter = {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .acquire_lock("branch:1", Duration::from_secs(5))
                    .await
                    .unwrap()
                    .is_some()
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(guard);
        assert!(waiter.await.unwrap());
        assert!(store.locks.lock().is_empty());
    }
}
