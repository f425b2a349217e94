use futures::{StreamExt, TryStreamExt};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{PipelineError, PipelineResult};
use crate::logic::archive::read_archive;
use crate::logic::content_store::{ContentStore, UploadOutcome};
use crate::logic::password::{validate_password, PasswordSealer};
use crate::model::{
    generate_dir_name, now, validate_slug, Branch, BranchAddress, ContentHashes, ContentObject,
    DeleteReason, Deploy, DeployState, Id, Manifest, ManifestEntry, NewDeploy, ReclaimJob,
};
use crate::storage::paths::{deploy_path, is_safe_deploy_path, join_key, normalize_relative_path};
use crate::storage::TieredFileStore;
use crate::store::traits::{branch_lock_name, LockGuard, Store};

const MAX_CONCURRENCY: usize = 64;

/// Tunables for the orchestrator
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub default_concurrency: usize,
    pub lock_timeout: Duration,
    pub public_base_url: String,
    pub abandoned_after: Duration,
    pub superseded_after: Duration,
    /// Cap on the total unpacked size of a full-deploy archive
    pub max_archive_bytes: u64,
    pub password_secret: String,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            default_concurrency: 8,
            lock_timeout: Duration::from_secs(5),
            public_base_url: "http://127.0.0.1:3001/play".to_string(),
            abandoned_after: Duration::from_secs(86_400),
            superseded_after: Duration::from_secs(3_600),
            max_archive_bytes: 1 << 30,
            password_secret: "change-me".to_string(),
        }
    }
}

/// Returned by [`DeployPipeline::start_incremental`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartedDeploy {
    pub deploy_id: Id,
    pub branch_id: Id,
    pub number: i32,
    /// Hashes the client still has to upload
    pub missing_assets: Vec<String>,
}

/// Returned once a deploy has been promoted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivatedDeploy {
    pub deploy_id: Id,
    pub branch_slug: String,
    pub servable_url: String,
}

/// Owns the branch/deploy state machine and both ingestion protocols.
pub struct DeployPipeline<S: Store> {
    store: Arc<S>,
    content: ContentStore<S>,
    files: TieredFileStore,
    settings: PipelineSettings,
    sealer: PasswordSealer,
}

impl<S: Store> DeployPipeline<S> {
    pub fn new(store: Arc<S>, files: TieredFileStore, settings: PipelineSettings) -> Self {
        let content = ContentStore::new(store.clone(), files.clone(), settings.lock_timeout);
        let sealer = PasswordSealer::new(settings.password_secret.clone());
        Self {
            store,
            content,
            files,
            settings,
            sealer,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn files(&self) -> &TieredFileStore {
        &self.files
    }

    pub fn content(&self) -> &ContentStore<S> {
        &self.content
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn sealer(&self) -> &PasswordSealer {
        &self.sealer
    }

    pub fn servable_url(&self, address: &BranchAddress) -> String {
        format!(
            "{}/{}/{}/{}/",
            self.settings.public_base_url.trim_end_matches('/'),
            address.org_id,
            address.game_id,
            address.slug
        )
    }

    async fn lock_branch(&self, branch_id: Id) -> PipelineResult<LockGuard> {
        let name = branch_lock_name(branch_id);
        self.store
            .acquire_lock(&name, self.settings.lock_timeout)
            .await?
            .ok_or_else(|| {
                warn!("Timed out waiting for lock {}", name);
                PipelineError::conflict(format!(
                    "branch {} is busy with another deploy operation",
                    branch_id
                ))
            })
    }

    pub async fn get_deploy(&self, deploy_id: Id) -> PipelineResult<Deploy> {
        self.store
            .get_deploy(deploy_id)
            .await?
            .ok_or_else(|| PipelineError::deploy_not_found(deploy_id))
    }

    pub async fn get_branch(&self, branch_id: Id) -> PipelineResult<Branch> {
        self.store
            .get_branch(branch_id)
            .await?
            .ok_or_else(|| PipelineError::branch_not_found(branch_id))
    }

    async fn branch_for_deploy(&self, address: &BranchAddress) -> PipelineResult<Branch> {
        validate_slug(&address.slug).map_err(PipelineError::Validation)?;

        if let Some(branch) = self.store.find_branch(address).await? {
            return Ok(branch);
        }
        let (branch, created) = self.store.get_or_create_branch(address, now()).await?;
        if branch.org_id != address.org_id {
            return Err(PipelineError::conflict(format!(
                "branch '{}' of game {} belongs to another organization",
                address.slug, address.game_id
            )));
        }
        if created {
            info!("Created branch {} ({})", branch.id, address);
        }
        Ok(branch)
    }

    /// Insert a `deploying` row under the branch lock
    async fn create_deploy(
        &self,
        branch: &Branch,
        manifest: Manifest,
        deployed_by: &str,
    ) -> PipelineResult<Deploy> {
        let _guard = self.lock_branch(branch.id).await?;

        let new = NewDeploy {
            org_id: branch.org_id,
            game_id: branch.game_id,
            branch_id: branch.id,
            path: deploy_path(branch.org_id, branch.game_id, branch.id, &generate_dir_name()),
            manifest,
            deployed_by: deployed_by.to_string(),
            deploying_on: now(),
        };
        let deploy = self.store.create_deploy(new).await?;

        info!(
            "Created deploy {} (#{}) for branch {} with {} assets",
            deploy.id,
            deploy.number,
            branch.id,
            deploy.manifest.len()
        );
        Ok(deploy)
    }

    /// First step of an incremental deploy: record the manifest and report
    /// which hashes are not in the content store yet.
    pub async fn start_incremental(
        &self,
        address: &BranchAddress,
        mut manifest: Manifest,
        deployed_by: &str,
    ) -> PipelineResult<StartedDeploy> {
        manifest.normalize().map_err(PipelineError::Validation)?;
        let branch = self.branch_for_deploy(address).await?;

        let missing_assets = self.content.missing_hashes(&manifest.unique_hashes()).await?;
        let deploy = self.create_deploy(&branch, manifest, deployed_by).await?;

        debug!(
            "Deploy {} needs {} of its assets uploaded",
            deploy.id,
            missing_assets.len()
        );
        Ok(StartedDeploy {
            deploy_id: deploy.id,
            branch_id: branch.id,
            number: deploy.number,
            missing_assets,
        })
    }

    /// Upload one asset of a `deploying` deploy. The bytes must hash to the
    /// manifest entry for `relative_path`.
    pub async fn upload_asset(
        &self,
        deploy_id: Id,
        relative_path: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> PipelineResult<UploadOutcome> {
        let deploy = self.get_deploy(deploy_id).await?;
        if deploy.state != DeployState::Deploying || deploy.is_deleted() {
            return Err(PipelineError::validation(format!(
                "deploy {} is {}, assets can only be uploaded while deploying",
                deploy_id,
                deploy.state.as_str()
            )));
        }

        let path = normalize_relative_path(relative_path).map_err(PipelineError::Validation)?;
        let entry = deploy.manifest.find(&path).ok_or_else(|| {
            PipelineError::validation(format!("'{}' is not part of deploy {}", path, deploy_id))
        })?;

        let hashes = ContentHashes::compute(bytes);
        if hashes.sha256 != entry.hash {
            return Err(PipelineError::Integrity {
                path,
                expected: entry.hash.clone(),
                actual: hashes.sha256,
            });
        }

        self.content.upload_hashed(bytes, hashes, content_type).await
    }

    /// Second step of an incremental deploy: materialize every manifest
    /// entry and promote the deploy.
    pub async fn activate_incremental(
        &self,
        deploy_id: Id,
        concurrency: Option<usize>,
    ) -> PipelineResult<ActivatedDeploy> {
        let concurrency = self.concurrency(concurrency)?;
        let deploy = self.get_deploy(deploy_id).await?;
        if deploy.state != DeployState::Deploying || deploy.is_deleted() {
            return Err(PipelineError::conflict(format!(
                "deploy {} is {}, not deploying",
                deploy_id,
                deploy.state.as_str()
            )));
        }

        let missing = self
            .content
            .missing_hashes(&deploy.manifest.unique_hashes())
            .await?;
        if !missing.is_empty() {
            return Err(PipelineError::validation(format!(
                "deploy {} still has {} assets to upload",
                deploy_id,
                missing.len()
            )));
        }

        self.materialize_or_fail(&deploy, concurrency).await?;
        self.promote(&deploy).await
    }

    /// Deploy a whole tar(.gz) bundle in one call.
    pub async fn full_deploy(
        &self,
        address: &BranchAddress,
        archive: Vec<u8>,
        deployed_by: &str,
    ) -> PipelineResult<ActivatedDeploy> {
        validate_slug(&address.slug).map_err(PipelineError::Validation)?;
        let members = read_archive(archive, self.settings.max_archive_bytes).await?;
        let concurrency = self.settings.default_concurrency.max(1);

        let entries: Vec<ManifestEntry> = futures::stream::iter(members)
            .map(|member| async move {
                let outcome = self
                    .content
                    .upload(&member.bytes, &member.content_type)
                    .await?;
                Ok::<_, PipelineError>(ManifestEntry::new(member.path, outcome.object.sha256))
            })
            .buffered(concurrency)
            .try_collect()
            .await?;

        let mut manifest = Manifest::new(entries);
        manifest.normalize().map_err(PipelineError::Validation)?;

        let branch = self.branch_for_deploy(address).await?;
        let deploy = self.create_deploy(&branch, manifest, deployed_by).await?;

        self.materialize_or_fail(&deploy, concurrency).await?;
        self.promote(&deploy).await
    }

    fn concurrency(&self, requested: Option<usize>) -> PipelineResult<usize> {
        match requested {
            None => Ok(self.settings.default_concurrency.clamp(1, MAX_CONCURRENCY)),
            Some(0) => Err(PipelineError::validation("concurrency must be at least 1")),
            Some(n) => Ok(n.min(MAX_CONCURRENCY)),
        }
    }

    /// Link every manifest entry's blob into the deploy tree with at most
    /// `concurrency` copies in flight.
    async fn materialize(&self, deploy: &Deploy, concurrency: usize) -> PipelineResult<()> {
        futures::stream::iter(deploy.manifest.entries.iter().map(Ok))
            .try_for_each_concurrent(concurrency, |entry| async move {
                self.files
                    .copy(
                        &ContentObject::path_for(&entry.hash),
                        &join_key(&deploy.path, &entry.path),
                    )
                    .await
            })
            .await
    }

    async fn materialize_or_fail(&self, deploy: &Deploy, concurrency: usize) -> PipelineResult<()> {
        match self.materialize(deploy, concurrency).await {
            Ok(()) => {
                debug!(
                    "Materialized {} files for deploy {}",
                    deploy.manifest.len(),
                    deploy.id
                );
                Ok(())
            }
            Err(e) => {
                error!("Materializing deploy {} failed: {}", deploy.id, e);
                if self
                    .store
                    .mark_deploy_failed(deploy.id, &e.to_string(), now())
                    .await?
                {
                    self.schedule_reclaim(&deploy.path, "failed").await?;
                }
                Err(e)
            }
        }
    }

    /// Flip both branch pointers to `deploy` under the branch lock and hand
    /// the superseded deploy to the reclaimer.
    async fn promote(&self, deploy: &Deploy) -> PipelineResult<ActivatedDeploy> {
        let _guard = self.lock_branch(deploy.branch_id).await?;

        let current = self.get_deploy(deploy.id).await?;
        if current.state != DeployState::Deploying || current.is_deleted() {
            return Err(PipelineError::conflict(format!(
                "deploy {} changed to {} during activation",
                deploy.id,
                current.state.as_str()
            )));
        }

        let at = now();
        let previous = self.store.promote_deploy(deploy.id, at).await?;
        info!(
            "Branch {} now serves deploy {} (previously {:?})",
            deploy.branch_id, deploy.id, previous
        );

        if let Some(previous_id) = previous.filter(|id| *id != deploy.id) {
            self.retire_deploy(previous_id, DeleteReason::Superseded).await?;
        }

        let branch = self.get_branch(deploy.branch_id).await?;
        let address = BranchAddress::new(branch.org_id, branch.game_id, branch.slug.clone());
        Ok(ActivatedDeploy {
            deploy_id: deploy.id,
            branch_slug: branch.slug,
            servable_url: self.servable_url(&address),
        })
    }

    /// Soft-delete a deploy and queue its tree for reclamation. Callers make
    /// sure no pointer references it.
    async fn retire_deploy(&self, deploy_id: Id, reason: DeleteReason) -> PipelineResult<bool> {
        let deploy = self.get_deploy(deploy_id).await?;
        if !self
            .store
            .soft_delete_deploy(deploy_id, reason.as_str(), now())
            .await?
        {
            return Ok(false);
        }
        info!("Retired deploy {} ({})", deploy_id, reason);
        self.schedule_reclaim(&deploy.path, reason.as_str()).await?;
        Ok(true)
    }

    /// Queue deletion of a deploy tree. Paths that fail the shape check are
    /// only recorded for review.
    pub async fn schedule_reclaim(&self, path: &str, reason: &str) -> PipelineResult<Id> {
        let job = if is_safe_deploy_path(path) {
            ReclaimJob::RemoveDirectory {
                path: path.to_string(),
                reason: reason.to_string(),
            }
        } else {
            warn!("Path '{}' does not look like a deploy tree, marking for trash", path);
            ReclaimJob::MarkForTrash {
                path: path.to_string(),
                reason: reason.to_string(),
            }
        };

        let (job_id, collapsed) = self.store.enqueue_job(&job.identity(), &job, now()).await?;
        if collapsed {
            debug!("Reclaim of {} already pending as job {}", path, job_id);
        }
        Ok(job_id)
    }

    pub async fn set_branch_password(
        &self,
        branch_id: Id,
        password: Option<&str>,
    ) -> PipelineResult<Branch> {
        let seal = match password {
            Some(password) => {
                validate_password(password)?;
                Some(self.sealer.seal(password)?)
            }
            None => None,
        };

        if !self.store.set_branch_password(branch_id, seal, now()).await? {
            return Err(PipelineError::branch_not_found(branch_id));
        }
        info!(
            "Password {} for branch {}",
            if password.is_some() { "set" } else { "cleared" },
            branch_id
        );
        self.get_branch(branch_id).await
    }

    pub async fn set_branch_pinned(&self, branch_id: Id, pinned: bool) -> PipelineResult<Branch> {
        if !self.store.set_branch_pinned(branch_id, pinned, now()).await? {
            return Err(PipelineError::branch_not_found(branch_id));
        }
        self.get_branch(branch_id).await
    }

    /// Clear the pointers, retire every deploy and delete the branch row.
    /// Returns how many deploys were handed to the reclaimer.
    pub async fn delete_branch(&self, branch_id: Id) -> PipelineResult<usize> {
        let _guard = self.lock_branch(branch_id).await?;
        self.get_branch(branch_id).await?;

        let at = now();
        self.store.clear_branch_pointers(branch_id, at).await?;

        let mut retired = 0;
        for deploy in self.store.list_deploys_for_branch(branch_id).await? {
            if deploy.is_deleted() {
                continue;
            }
            if deploy.state == DeployState::Deploying {
                self.store
                    .mark_deploy_failed(deploy.id, "branch deleted", at)
                    .await?;
            }
            if self.retire_deploy(deploy.id, DeleteReason::BranchDeleted).await? {
                retired += 1;
            }
        }

        self.store.delete_branch(branch_id).await?;
        info!("Deleted branch {} and retired {} deploys", branch_id, retired);
        Ok(retired)
    }

    /// Retire ready deploys that no branch points at any more.
    pub async fn sweep_superseded(&self, older_than: Duration) -> PipelineResult<usize> {
        let cutoff = now() - chrono::Duration::from_std(older_than).map_err(anyhow::Error::from)?;

        let mut retired = 0;
        for deploy in self.store.list_reclaimable_deploys(cutoff).await? {
            if self.retire_deploy(deploy.id, DeleteReason::Expired).await? {
                retired += 1;
            }
        }
        if retired > 0 {
            info!("Swept {} unreferenced deploys", retired);
        }
        Ok(retired)
    }

    /// Fail and retire deploys stuck in `deploying` since before the cutoff.
    pub async fn sweep_abandoned(&self, older_than: Duration) -> PipelineResult<usize> {
        let cutoff = now() - chrono::Duration::from_std(older_than).map_err(anyhow::Error::from)?;

        let mut retired = 0;
        for deploy in self.store.list_abandoned_deploys(cutoff).await? {
            // an activation holding the lock gets to finish
            let _guard = match self.lock_branch(deploy.branch_id).await {
                Ok(guard) => guard,
                Err(PipelineError::Conflict(_)) => continue,
                Err(e) => return Err(e),
            };
            if !self
                .store
                .mark_deploy_failed(deploy.id, "abandoned", now())
                .await?
            {
                continue;
            }
            if self.retire_deploy(deploy.id, DeleteReason::Abandoned).await? {
                retired += 1;
            }
        }
        if retired > 0 {
            info!("Swept {} abandoned deploys", retired);
        }
        Ok(retired)
    }

    /// Both sweeps with the configured ages
    pub async fn run_sweeps(&self) -> PipelineResult<usize> {
        let superseded = self.sweep_superseded(self.settings.superseded_after).await?;
        let abandoned = self.sweep_abandoned(self.settings.abandoned_after).await?;
        Ok(superseded + abandoned)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::logic::archive::tests::build_archive;
    use crate::model::JobStatus;
    use crate::storage::{MemoryRemote, RemoteStore};
    use crate::store::traits::{BranchStore, JobStore, LockManager};
    use crate::store::MemoryStore;

    pub(crate) struct Harness {
        pub dir: tempfile::TempDir,
        pub remote: Arc<MemoryRemote>,
        pub store: Arc<MemoryStore>,
        pub pipeline: Arc<DeployPipeline<MemoryStore>>,
    }

    pub(crate) fn harness() -> Harness {
        harness_with(PipelineSettings {
            lock_timeout: Duration::from_millis(500),
            ..PipelineSettings::default()
        })
    }

    pub(crate) fn harness_with(settings: PipelineSettings) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let remote = Arc::new(MemoryRemote::new());
        let files =
            TieredFileStore::new(dir.path(), Some(remote.clone() as Arc<dyn RemoteStore>)).unwrap();
        let store = Arc::new(MemoryStore::new());
        let pipeline = Arc::new(DeployPipeline::new(store.clone(), files, settings));
        Harness {
            dir,
            remote,
            store,
            pipeline,
        }
    }

    fn sha(bytes: &[u8]) -> String {
        ContentHashes::compute(bytes).sha256
    }

    fn address() -> BranchAddress {
        BranchAddress::new(1, 2, "main")
    }

    /// Start, upload everything missing and activate
    pub(crate) async fn deploy_files(
        pipeline: &DeployPipeline<MemoryStore>,
        address: &BranchAddress,
        files: &[(&str, &[u8])],
    ) -> ActivatedDeploy {
        let manifest = Manifest::new(
            files
                .iter()
                .map(|(path, bytes)| ManifestEntry::new(*path, sha(bytes)))
                .collect(),
        );
        let started = pipeline
            .start_incremental(address, manifest, "tester")
            .await
            .unwrap();
        for (path, bytes) in files {
            if started.missing_assets.contains(&sha(bytes)) {
                pipeline
                    .upload_asset(started.deploy_id, path, bytes, "text/plain")
                    .await
                    .unwrap();
            }
        }
        pipeline
            .activate_incremental(started.deploy_id, None)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_missing_set_is_exactly_the_unknown_hashes() {
        let h = harness();
        h.pipeline.content().upload(b"known", "text/plain").await.unwrap();

        let manifest = Manifest::new(vec![
            ManifestEntry::new("a.txt", sha(b"known")),
            ManifestEntry::new("b.txt", sha(b"unknown")),
            ManifestEntry::new("c/b-copy.txt", sha(b"unknown")),
        ]);
        let started = h
            .pipeline
            .start_incremental(&address(), manifest, "tester")
            .await
            .unwrap();

        assert_eq!(started.missing_assets, vec![sha(b"unknown")]);
        assert_eq!(started.number, 1);
        let deploy = h.pipeline.get_deploy(started.deploy_id).await.unwrap();
        assert_eq!(deploy.state, DeployState::Deploying);
        assert!(is_safe_deploy_path(&deploy.path));
    }

    #[tokio::test]
    async fn test_invalid_manifests_are_rejected() {
        let h = harness();
        for manifest in [
            Manifest::default(),
            Manifest::new(vec![ManifestEntry::new("../x", sha(b"x"))]),
            Manifest::new(vec![ManifestEntry::new("x", "not-a-hash")]),
            Manifest::new(vec![
                ManifestEntry::new("x", sha(b"1")),
                ManifestEntry::new("./x", sha(b"2")),
            ]),
        ] {
            let err = h
                .pipeline
                .start_incremental(&address(), manifest, "tester")
                .await
                .unwrap_err();
            assert!(matches!(err, PipelineError::Validation(_)), "{:?}", err);
        }

        let bad_slug = BranchAddress::new(1, 2, "Not A Slug");
        let manifest = Manifest::new(vec![ManifestEntry::new("x", sha(b"x"))]);
        assert!(matches!(
            h.pipeline.start_incremental(&bad_slug, manifest, "tester").await,
            Err(PipelineError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_upload_asset_checks_manifest_and_hash() {
        let h = harness();
        let manifest = Manifest::new(vec![ManifestEntry::new("index.html", sha(b"Hello World"))]);
        let started = h
            .pipeline
            .start_incremental(&address(), manifest, "tester")
            .await
            .unwrap();

        let err = h
            .pipeline
            .upload_asset(started.deploy_id, "index.html", b"Goodbye", "text/html")
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Integrity { .. }));

        let err = h
            .pipeline
            .upload_asset(started.deploy_id, "other.html", b"Hello World", "text/html")
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));

        let outcome = h
            .pipeline
            .upload_asset(started.deploy_id, "index.html", b"Hello World", "text/html")
            .await
            .unwrap();
        assert!(!outcome.already_existed);

        assert!(matches!(
            h.pipeline.upload_asset(999, "index.html", b"Hello World", "text/html").await,
            Err(PipelineError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_activation_requires_every_asset() {
        let h = harness();
        let manifest = Manifest::new(vec![ManifestEntry::new("a.txt", sha(b"a"))]);
        let started = h
            .pipeline
            .start_incremental(&address(), manifest, "tester")
            .await
            .unwrap();

        let err = h
            .pipeline
            .activate_incremental(started.deploy_id, None)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
        let deploy = h.pipeline.get_deploy(started.deploy_id).await.unwrap();
        assert_eq!(deploy.state, DeployState::Deploying);

        h.pipeline
            .upload_asset(started.deploy_id, "a.txt", b"a", "text/plain")
            .await
            .unwrap();
        let activated = h
            .pipeline
            .activate_incremental(started.deploy_id, Some(2))
            .await
            .unwrap();
        assert_eq!(activated.branch_slug, "main");
        assert_eq!(activated.servable_url, "http://127.0.0.1:3001/play/1/2/main/");

        // a ready deploy cannot be activated again
        assert!(matches!(
            h.pipeline.activate_incremental(started.deploy_id, None).await,
            Err(PipelineError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_activation_supersedes_previous_deploy() {
        let h = harness();
        let first = deploy_files(&h.pipeline, &address(), &[("index.html", b"v1")]).await;
        let second = deploy_files(&h.pipeline, &address(), &[("index.html", b"v2")]).await;

        let old = h.pipeline.get_deploy(first.deploy_id).await.unwrap();
        assert!(old.is_deleted());
        assert_eq!(old.deleted_reason.as_deref(), Some("superseded"));

        let branch = h.store.find_branch(&address()).await.unwrap().unwrap();
        assert_eq!(branch.active_deploy_id, Some(second.deploy_id));
        assert_eq!(branch.latest_deploy_id, Some(second.deploy_id));

        let jobs = h
            .store
            .claim_due_jobs(now(), 10, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(
            jobs[0].job,
            ReclaimJob::RemoveDirectory {
                path: old.path.clone(),
                reason: "superseded".to_string()
            }
        );
        assert_eq!(jobs[0].status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_stalled_activation_keeps_old_pointer() {
        let h = harness();
        let first = deploy_files(&h.pipeline, &address(), &[("index.html", b"old")]).await;

        let manifest = Manifest::new(vec![
            ManifestEntry::new("index.html", sha(b"new")),
            ManifestEntry::new("app.js", sha(b"app")),
        ]);
        let started = h
            .pipeline
            .start_incremental(&address(), manifest, "tester")
            .await
            .unwrap();
        h.pipeline
            .upload_asset(started.deploy_id, "index.html", b"new", "text/html")
            .await
            .unwrap();
        h.pipeline
            .upload_asset(started.deploy_id, "app.js", b"app", "text/javascript")
            .await
            .unwrap();

        h.remote.pause_writes();
        let activation = {
            let pipeline = h.pipeline.clone();
            let deploy_id = started.deploy_id;
            tokio::spawn(async move { pipeline.activate_incremental(deploy_id, Some(1)).await })
        };
        while h.remote.waiting_writes() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let branch = h.store.find_branch(&address()).await.unwrap().unwrap();
        assert_eq!(branch.active_deploy_id, Some(first.deploy_id));
        let pending = h.pipeline.get_deploy(started.deploy_id).await.unwrap();
        assert_eq!(pending.state, DeployState::Deploying);

        h.remote.resume_writes();
        let activated = activation.await.unwrap().unwrap();
        let branch = h.store.find_branch(&address()).await.unwrap().unwrap();
        assert_eq!(branch.active_deploy_id, Some(activated.deploy_id));
        assert!(h.pipeline.get_deploy(activated.deploy_id).await.unwrap().is_ready());
    }

    #[tokio::test]
    async fn test_failed_materialization_leaves_branch_alone() {
        let h = harness();
        let first = deploy_files(&h.pipeline, &address(), &[("index.html", b"old")]).await;

        let manifest = Manifest::new(vec![ManifestEntry::new("index.html", sha(b"new"))]);
        let started = h
            .pipeline
            .start_incremental(&address(), manifest, "tester")
            .await
            .unwrap();
        h.pipeline
            .upload_asset(started.deploy_id, "index.html", b"new", "text/html")
            .await
            .unwrap();

        h.remote.set_fail_writes(true);
        let err = h
            .pipeline
            .activate_incremental(started.deploy_id, None)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Storage(_)));

        let failed = h.pipeline.get_deploy(started.deploy_id).await.unwrap();
        assert_eq!(failed.state, DeployState::Failed);
        assert!(failed.error.is_some());

        let branch = h.store.find_branch(&address()).await.unwrap().unwrap();
        assert_eq!(branch.active_deploy_id, Some(first.deploy_id));
    }

    #[tokio::test]
    async fn test_lock_timeout_is_a_conflict_and_keeps_deploying() {
        let h = harness_with(PipelineSettings {
            lock_timeout: Duration::from_millis(50),
            ..PipelineSettings::default()
        });
        let manifest = Manifest::new(vec![ManifestEntry::new("a.txt", sha(b"a"))]);
        let started = h
            .pipeline
            .start_incremental(&address(), manifest, "tester")
            .await
            .unwrap();
        h.pipeline
            .upload_asset(started.deploy_id, "a.txt", b"a", "text/plain")
            .await
            .unwrap();

        let held = h
            .store
            .acquire_lock(&branch_lock_name(started.branch_id), Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        let err = h
            .pipeline
            .activate_incremental(started.deploy_id, None)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Conflict(_)));
        assert_eq!(
            h.pipeline.get_deploy(started.deploy_id).await.unwrap().state,
            DeployState::Deploying
        );

        drop(held);
        h.pipeline
            .activate_incremental(started.deploy_id, None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_activations_serialize() {
        let h = harness();
        let mut deploy_ids = Vec::new();
        for body in [&b"one"[..], &b"two"[..]] {
            let manifest = Manifest::new(vec![ManifestEntry::new("index.html", sha(body))]);
            let started = h
                .pipeline
                .start_incremental(&address(), manifest, "tester")
                .await
                .unwrap();
            h.pipeline
                .upload_asset(started.deploy_id, "index.html", body, "text/html")
                .await
                .unwrap();
            deploy_ids.push(started.deploy_id);
        }

        let activations = deploy_ids.iter().map(|id| {
            let pipeline = h.pipeline.clone();
            let id = *id;
            tokio::spawn(async move { pipeline.activate_incremental(id, None).await })
        });
        for result in futures::future::join_all(activations).await {
            result.unwrap().unwrap();
        }

        // whichever promoted last is active; the other was superseded
        let branch = h.store.find_branch(&address()).await.unwrap().unwrap();
        let active = branch.active_deploy_id.unwrap();
        let other = *deploy_ids.iter().find(|id| **id != active).unwrap();
        assert_eq!(branch.latest_deploy_id, Some(active));
        assert!(h.pipeline.get_deploy(active).await.unwrap().is_ready());
        let other = h.pipeline.get_deploy(other).await.unwrap();
        assert!(other.is_ready());
        assert_eq!(other.deleted_reason.as_deref(), Some("superseded"));
    }

    #[tokio::test]
    async fn test_full_deploy_from_archive() {
        let h = harness();
        let archive = build_archive(
            &[("index.html", b"Hello World"), ("css/site.css", b"body{}")],
            true,
        );

        let activated = h
            .pipeline
            .full_deploy(&address(), archive, "tester")
            .await
            .unwrap();
        let deploy = h.pipeline.get_deploy(activated.deploy_id).await.unwrap();
        assert!(deploy.is_ready());
        assert_eq!(deploy.manifest.len(), 2);

        let served = h
            .pipeline
            .files()
            .load(&join_key(&deploy.path, "index.html"))
            .await
            .unwrap();
        assert_eq!(served, Some(b"Hello World".to_vec()));
        assert!(h
            .pipeline
            .content()
            .get(&sha(b"Hello World"))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_corrupt_archive_touches_nothing() {
        let h = harness();
        let err = h
            .pipeline
            .full_deploy(&address(), b"not an archive at all".to_vec(), "tester")
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
        assert!(h.store.find_branch(&address()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_archive_is_rejected_before_any_upload() {
        let h = harness_with(PipelineSettings {
            max_archive_bytes: 1024,
            ..PipelineSettings::default()
        });
        let big = vec![7u8; 4096];
        let archive = build_archive(&[("big.bin", &big)], true);

        let err = h
            .pipeline
            .full_deploy(&address(), archive, "tester")
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)), "{:?}", err);
        assert!(h.store.find_branch(&address()).await.unwrap().is_none());
        assert!(h.pipeline.content().get(&sha(&big)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_slug_taken_by_another_org_is_a_conflict() {
        let h = harness();
        deploy_files(&h.pipeline, &address(), &[("index.html", b"x")]).await;

        let other_org = BranchAddress::new(9, 2, "main");
        let manifest = Manifest::new(vec![ManifestEntry::new("index.html", sha(b"x"))]);
        let err = h
            .pipeline
            .start_incremental(&other_org, manifest, "tester")
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Conflict(_)), "{:?}", err);

        let archive = build_archive(&[("index.html", b"y")], false);
        assert!(matches!(
            h.pipeline.full_deploy(&other_org, archive, "tester").await,
            Err(PipelineError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_branch_retires_all_deploys() {
        let h = harness();
        deploy_files(&h.pipeline, &address(), &[("a", b"1")]).await;
        let second = deploy_files(&h.pipeline, &address(), &[("a", b"2")]).await;
        let branch = h.store.find_branch(&address()).await.unwrap().unwrap();

        let retired = h.pipeline.delete_branch(branch.id).await.unwrap();
        // the first was already retired on supersession
        assert_eq!(retired, 1);
        assert!(h.store.get_branch(branch.id).await.unwrap().is_none());
        let deploy = h.pipeline.get_deploy(second.deploy_id).await.unwrap();
        assert_eq!(deploy.deleted_reason.as_deref(), Some("branch-deleted"));

        assert!(matches!(
            h.pipeline.delete_branch(branch.id).await,
            Err(PipelineError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_password_and_pin_flags() {
        let h = harness();
        deploy_files(&h.pipeline, &address(), &[("a", b"1")]).await;
        let branch = h.store.find_branch(&address()).await.unwrap().unwrap();

        let updated = h
            .pipeline
            .set_branch_password(branch.id, Some("secret"))
            .await
            .unwrap();
        let seal = updated.password_seal.clone().unwrap();
        assert!(h.pipeline.sealer().verify("secret", &seal));

        let cleared = h.pipeline.set_branch_password(branch.id, None).await.unwrap();
        assert!(!cleared.is_password_protected());

        assert!(h.pipeline.set_branch_pinned(branch.id, true).await.unwrap().pinned);
        assert!(matches!(
            h.pipeline.set_branch_pinned(404, true).await,
            Err(PipelineError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_sweeps_retire_stale_deploys() {
        let h = harness();
        let manifest = Manifest::new(vec![ManifestEntry::new("a", sha(b"a"))]);
        let stuck = h
            .pipeline
            .start_incremental(&address(), manifest, "tester")
            .await
            .unwrap();

        // nothing is old enough yet
        assert_eq!(
            h.pipeline.sweep_abandoned(Duration::from_secs(3600)).await.unwrap(),
            0
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(h.pipeline.sweep_abandoned(Duration::ZERO).await.unwrap(), 1);

        let deploy = h.pipeline.get_deploy(stuck.deploy_id).await.unwrap();
        assert_eq!(deploy.state, DeployState::Failed);
        assert_eq!(deploy.deleted_reason.as_deref(), Some("abandoned"));

        // an active deploy is never swept
        deploy_files(&h.pipeline, &address(), &[("a", b"a")]).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(h.pipeline.sweep_superseded(Duration::ZERO).await.unwrap(), 0);
    }
}
