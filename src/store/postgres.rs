use anyhow::{anyhow, bail, Context, Result};
use sqlx::{postgres::PgPoolOptions, postgres::PgRow, PgPool, Row};
use std::collections::HashSet;
use std::time::{Duration, Instant};

use crate::model::{
    Branch, BranchAddress, ContentObject, Deploy, DeployState, Id, InsertOutcome, JobRecord,
    JobStatus, Manifest, NewContentObject, NewDeploy, ReclaimJob, Timestamp,
};
use crate::store::traits::{
    BranchStore, CacheStore, ContentObjectStore, DeployStore, JobStore, LockGuard, LockManager,
    Store,
};

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(50);

const DEPLOY_COLUMNS: &str = "d.id, d.org_id, d.game_id, d.branch_id, d.path, d.state, d.number, \
     d.error, d.manifest, d.deploying_on, d.deployed_on, d.failed_on, d.deployed_by, \
     d.deleted_on, d.deleted_reason";

#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a new PostgreSQL store with the given database URL
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("Failed to create PostgreSQL connection pool")?;

        Ok(Self { pool })
    }

    /// Apply the schema under `migrations/`
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run database migrations")?;
        Ok(())
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Advisory lock key: first 8 bytes of SHA-256 over the lock name
pub fn advisory_lock_key(name: &str) -> i64 {
    use sha2::{Digest, Sha256};

    let digest = Sha256::digest(name.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes)
}

fn content_from_row(row: &PgRow) -> ContentObject {
    ContentObject {
        id: row.get("id"),
        sha256: row.get("sha256"),
        sha384: row.get("sha384"),
        sha512: row.get("sha512"),
        content_length: row.get("content_length"),
        content_type: row.get("content_type"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn branch_from_row(row: &PgRow) -> Branch {
    Branch {
        id: row.get("id"),
        org_id: row.get("org_id"),
        game_id: row.get("game_id"),
        slug: row.get("slug"),
        password_seal: row.get("password_seal"),
        pinned: row.get("pinned"),
        active_deploy_id: row.get("active_deploy_id"),
        latest_deploy_id: row.get("latest_deploy_id"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn deploy_from_row(row: &PgRow) -> Result<Deploy> {
    let state: String = row.get("state");
    let state = DeployState::parse(&state).ok_or_else(|| anyhow!("Unknown deploy state '{}'", state))?;
    let manifest: Manifest = serde_json::from_value(row.get("manifest"))
        .context("Failed to deserialize deploy manifest")?;

    Ok(Deploy {
        id: row.get("id"),
        org_id: row.get("org_id"),
        game_id: row.get("game_id"),
        branch_id: row.get("branch_id"),
        path: row.get("path"),
        state,
        number: row.get("number"),
        error: row.get("error"),
        manifest,
        deploying_on: row.get("deploying_on"),
        deployed_on: row.get("deployed_on"),
        failed_on: row.get("failed_on"),
        deployed_by: row.get("deployed_by"),
        deleted_on: row.get("deleted_on"),
        deleted_reason: row.get("deleted_reason"),
    })
}

fn job_from_row(row: &PgRow) -> Result<JobRecord> {
    let status: String = row.get("status");
    let status = JobStatus::parse(&status).ok_or_else(|| anyhow!("Unknown job status '{}'", status))?;
    let job: ReclaimJob =
        serde_json::from_value(row.get("payload")).context("Failed to deserialize job payload")?;

    Ok(JobRecord {
        id: row.get("id"),
        identity: row.get("identity"),
        job,
        status,
        attempts: row.get("attempts"),
        next_run_at: row.get("next_run_at"),
        last_error: row.get("last_error"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

#[async_trait::async_trait]
impl ContentObjectStore for PostgresStore {
    async fn get_content_object(&self, sha256: &str) -> Result<Option<ContentObject>> {
        let row = sqlx::query("SELECT * FROM content_objects WHERE sha256 = $1")
            .bind(sha256)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch content object")?;

        Ok(row.as_ref().map(content_from_row))
    }

    async fn find_existing_hashes(&self, hashes: &[String]) -> Result<HashSet<String>> {
        let rows = sqlx::query("SELECT sha256 FROM content_objects WHERE sha256 = ANY($1)")
            .bind(hashes)
            .fetch_all(&self.pool)
            .await
            .context("Failed to look up content hashes")?;

        Ok(rows.iter().map(|row| row.get("sha256")).collect())
    }

    async fn insert_content_object(&self, new: NewContentObject) -> Result<InsertOutcome> {
        // no conflict target: a clash on any of the three unique hashes counts
        let row = sqlx::query(
            r#"
            INSERT INTO content_objects (sha256, sha384, sha512, content_length, content_type, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $6)
            ON CONFLICT DO NOTHING
            RETURNING *
            "#,
        )
        .bind(&new.hashes.sha256)
        .bind(&new.hashes.sha384)
        .bind(&new.hashes.sha512)
        .bind(new.content_length)
        .bind(&new.content_type)
        .bind(new.created_at)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to insert content object")?;

        Ok(match row {
            Some(row) => InsertOutcome::Inserted(content_from_row(&row)),
            None => InsertOutcome::AlreadyExists,
        })
    }

    async fn discard_content_object(&self, sha256: &str) -> Result<()> {
        sqlx::query("DELETE FROM content_objects WHERE sha256 = $1")
            .bind(sha256)
            .execute(&self.pool)
            .await
            .context("Failed to discard content object")?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl BranchStore for PostgresStore {
    async fn get_branch(&self, id: Id) -> Result<Option<Branch>> {
        let row = sqlx::query("SELECT * FROM branches WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch branch")?;

        Ok(row.as_ref().map(branch_from_row))
    }

    async fn find_branch(&self, address: &BranchAddress) -> Result<Option<Branch>> {
        let row = sqlx::query(
            "SELECT * FROM branches WHERE org_id = $1 AND game_id = $2 AND slug = $3",
        )
        .bind(address.org_id)
        .bind(address.game_id)
        .bind(&address.slug)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch branch by address")?;

        Ok(row.as_ref().map(branch_from_row))
    }

    async fn get_or_create_branch(
        &self,
        address: &BranchAddress,
        at: Timestamp,
    ) -> Result<(Branch, bool)> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO branches (org_id, game_id, slug, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $4)
            ON CONFLICT (game_id, slug) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(address.org_id)
        .bind(address.game_id)
        .bind(&address.slug)
        .bind(at)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to create branch")?;

        if let Some(row) = inserted {
            return Ok((branch_from_row(&row), true));
        }

        let row = sqlx::query("SELECT * FROM branches WHERE game_id = $1 AND slug = $2")
            .bind(address.game_id)
            .bind(&address.slug)
            .fetch_one(&self.pool)
            .await
            .context("Failed to fetch existing branch")?;
        let branch = branch_from_row(&row);
        Ok((branch, false))
    }

    async fn set_branch_password(&self, id: Id, seal: Option<String>, at: Timestamp) -> Result<bool> {
        let result = sqlx::query("UPDATE branches SET password_seal = $2, updated_at = $3 WHERE id = $1")
            .bind(id)
            .bind(seal)
            .bind(at)
            .execute(&self.pool)
            .await
            .context("Failed to set branch password")?;

        Ok(result.rows_affected() > 0)
    }

    async fn set_branch_pinned(&self, id: Id, pinned: bool, at: Timestamp) -> Result<bool> {
        let result = sqlx::query("UPDATE branches SET pinned = $2, updated_at = $3 WHERE id = $1")
            .bind(id)
            .bind(pinned)
            .bind(at)
            .execute(&self.pool)
            .await
            .context("Failed to set branch pinned flag")?;

        Ok(result.rows_affected() > 0)
    }

    async fn clear_branch_pointers(&self, id: Id, at: Timestamp) -> Result<()> {
        let result = sqlx::query(
            "UPDATE branches SET active_deploy_id = NULL, latest_deploy_id = NULL, updated_at = $2 WHERE id = $1",
        )
        .bind(id)
        .bind(at)
        .execute(&self.pool)
        .await
        .context("Failed to clear branch pointers")?;

        if result.rows_affected() == 0 {
            bail!("Branch not found: {}", id);
        }
        Ok(())
    }

    async fn delete_branch(&self, id: Id) -> Result<bool> {
        let Some(branch) = self.get_branch(id).await? else {
            return Ok(false);
        };
        if branch.has_pointers() {
            bail!("Branch {} still points at a deploy", id);
        }

        // deploy rows stay behind as history
        let result = sqlx::query(
            "DELETE FROM branches WHERE id = $1 AND active_deploy_id IS NULL AND latest_deploy_id IS NULL",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to delete branch")?;

        Ok(result.rows_affected() > 0)
    }
}

#[async_trait::async_trait]
impl DeployStore for PostgresStore {
    async fn get_deploy(&self, id: Id) -> Result<Option<Deploy>> {
        let row = sqlx::query(&format!("SELECT {} FROM deploys d WHERE d.id = $1", DEPLOY_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch deploy")?;

        row.as_ref().map(deploy_from_row).transpose()
    }

    async fn create_deploy(&self, new: NewDeploy) -> Result<Deploy> {
        let manifest =
            serde_json::to_value(&new.manifest).context("Failed to serialize deploy manifest")?;

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO deploys AS d (org_id, game_id, branch_id, path, state, number, manifest, deploying_on, deployed_by)
            VALUES ($1, $2, $3, $4, 'deploying',
                    (SELECT COALESCE(MAX(number), 0) + 1 FROM deploys WHERE branch_id = $3),
                    $5, $6, $7)
            RETURNING {}
            "#,
            DEPLOY_COLUMNS
        ))
        .bind(new.org_id)
        .bind(new.game_id)
        .bind(new.branch_id)
        .bind(&new.path)
        .bind(manifest)
        .bind(new.deploying_on)
        .bind(&new.deployed_by)
        .fetch_one(&self.pool)
        .await
        .context("Failed to create deploy")?;

        deploy_from_row(&row)
    }

    async fn mark_deploy_failed(&self, id: Id, error: &str, at: Timestamp) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE deploys SET state = 'failed', error = $2, failed_on = $3 WHERE id = $1 AND state = 'deploying'",
        )
        .bind(id)
        .bind(error)
        .bind(at)
        .execute(&self.pool)
        .await
        .context("Failed to mark deploy failed")?;

        Ok(result.rows_affected() > 0)
    }

    async fn promote_deploy(&self, id: Id, at: Timestamp) -> Result<Option<Id>> {
        let mut tx = self.pool.begin().await.context("Failed to start transaction")?;

        let row = sqlx::query("SELECT branch_id, state, deleted_on FROM deploys WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .context("Failed to lock deploy row")?
            .ok_or_else(|| anyhow!("Deploy not found: {}", id))?;

        let state: String = row.get("state");
        let deleted_on: Option<Timestamp> = row.get("deleted_on");
        if state != DeployState::Deploying.as_str() || deleted_on.is_some() {
            bail!("Deploy {} is {}, not deploying", id, state);
        }
        let branch_id: Id = row.get("branch_id");

        let previous: Option<Id> =
            sqlx::query_scalar("SELECT active_deploy_id FROM branches WHERE id = $1 FOR UPDATE")
                .bind(branch_id)
                .fetch_optional(&mut *tx)
                .await
                .context("Failed to lock branch row")?
                .ok_or_else(|| anyhow!("Branch not found: {}", branch_id))?;

        sqlx::query("UPDATE deploys SET state = 'ready', deployed_on = $2 WHERE id = $1")
            .bind(id)
            .bind(at)
            .execute(&mut *tx)
            .await
            .context("Failed to mark deploy ready")?;

        sqlx::query(
            "UPDATE branches SET active_deploy_id = $2, latest_deploy_id = $2, updated_at = $3 WHERE id = $1",
        )
        .bind(branch_id)
        .bind(id)
        .bind(at)
        .execute(&mut *tx)
        .await
        .context("Failed to update branch pointers")?;

        tx.commit().await.context("Failed to commit promotion")?;
        Ok(previous)
    }

    async fn soft_delete_deploy(&self, id: Id, reason: &str, at: Timestamp) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE deploys SET deleted_on = $3, deleted_reason = $2 WHERE id = $1 AND deleted_on IS NULL",
        )
        .bind(id)
        .bind(reason)
        .bind(at)
        .execute(&self.pool)
        .await
        .context("Failed to soft-delete deploy")?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_deploys_for_branch(&self, branch_id: Id) -> Result<Vec<Deploy>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM deploys d WHERE d.branch_id = $1 ORDER BY d.number",
            DEPLOY_COLUMNS
        ))
        .bind(branch_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list deploys")?;

        rows.iter().map(deploy_from_row).collect()
    }

    async fn list_reclaimable_deploys(&self, before: Timestamp) -> Result<Vec<Deploy>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {}
            FROM deploys d
            JOIN branches b ON b.id = d.branch_id
            WHERE d.state = 'ready'
              AND d.deleted_on IS NULL
              AND d.deployed_on < $1
              AND NOT b.pinned
              AND d.id IS DISTINCT FROM b.active_deploy_id
              AND d.id IS DISTINCT FROM b.latest_deploy_id
            ORDER BY d.id
            "#,
            DEPLOY_COLUMNS
        ))
        .bind(before)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list reclaimable deploys")?;

        rows.iter().map(deploy_from_row).collect()
    }

    async fn list_abandoned_deploys(&self, before: Timestamp) -> Result<Vec<Deploy>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {}
            FROM deploys d
            WHERE d.state = 'deploying' AND d.deleted_on IS NULL AND d.deploying_on < $1
            ORDER BY d.id
            "#,
            DEPLOY_COLUMNS
        ))
        .bind(before)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list abandoned deploys")?;

        rows.iter().map(deploy_from_row).collect()
    }
}

#[async_trait::async_trait]
impl JobStore for PostgresStore {
    async fn enqueue_job(&self, identity: &str, job: &ReclaimJob, at: Timestamp) -> Result<(Id, bool)> {
        let payload = serde_json::to_value(job).context("Failed to serialize job")?;

        let inserted: Option<Id> = sqlx::query_scalar(
            r#"
            INSERT INTO reclaim_jobs (identity, payload, status, next_run_at, created_at, updated_at)
            VALUES ($1, $2, 'pending', $3, $3, $3)
            ON CONFLICT (identity) WHERE status = 'pending' DO NOTHING
            RETURNING id
            "#,
        )
        .bind(identity)
        .bind(payload)
        .bind(at)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to enqueue job")?;

        if let Some(id) = inserted {
            return Ok((id, false));
        }

        let existing: Id = sqlx::query_scalar(
            "SELECT id FROM reclaim_jobs WHERE identity = $1 AND status = 'pending'",
        )
        .bind(identity)
        .fetch_one(&self.pool)
        .await
        .context("Failed to fetch pending job")?;

        Ok((existing, true))
    }

    async fn claim_due_jobs(&self, now: Timestamp, limit: usize, lease: Duration) -> Result<Vec<JobRecord>> {
        let lease_until = now + chrono::Duration::from_std(lease)?;

        // the returned rows carry the leased next_run_at; the previous value is not needed
        let rows = sqlx::query(
            r#"
            UPDATE reclaim_jobs SET next_run_at = $2, updated_at = $1
            WHERE id IN (
                SELECT id FROM reclaim_jobs
                WHERE status = 'pending' AND next_run_at <= $1
                ORDER BY next_run_at, id
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(lease_until)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .context("Failed to claim due jobs")?;

        let mut jobs = rows.iter().map(job_from_row).collect::<Result<Vec<_>>>()?;
        jobs.sort_by_key(|j| j.id);
        Ok(jobs)
    }

    async fn complete_job(&self, id: Id, at: Timestamp) -> Result<()> {
        sqlx::query("UPDATE reclaim_jobs SET status = 'done', updated_at = $2 WHERE id = $1")
            .bind(id)
            .bind(at)
            .execute(&self.pool)
            .await
            .context("Failed to complete job")?;
        Ok(())
    }

    async fn retry_job(&self, id: Id, attempts: i32, next_run_at: Timestamp, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE reclaim_jobs
            SET status = 'pending', attempts = $2, next_run_at = $3, last_error = $4, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(attempts)
        .bind(next_run_at)
        .bind(error)
        .execute(&self.pool)
        .await
        .context("Failed to reschedule job")?;
        Ok(())
    }

    async fn bury_job(&self, id: Id, attempts: i32, error: &str, at: Timestamp) -> Result<()> {
        sqlx::query(
            "UPDATE reclaim_jobs SET status = 'buried', attempts = $2, last_error = $3, updated_at = $4 WHERE id = $1",
        )
        .bind(id)
        .bind(attempts)
        .bind(error)
        .bind(at)
        .execute(&self.pool)
        .await
        .context("Failed to bury job")?;
        Ok(())
    }

    async fn get_job(&self, id: Id) -> Result<Option<JobRecord>> {
        let row = sqlx::query("SELECT * FROM reclaim_jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch job")?;

        row.as_ref().map(job_from_row).transpose()
    }

    async fn list_buried_jobs(&self) -> Result<Vec<JobRecord>> {
        let rows = sqlx::query("SELECT * FROM reclaim_jobs WHERE status = 'buried' ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .context("Failed to list buried jobs")?;

        rows.iter().map(job_from_row).collect()
    }
}

#[async_trait::async_trait]
impl CacheStore for PostgresStore {
    async fn cache_put(&self, key: &str, value: serde_json::Value, ttl: Option<Duration>) -> Result<()> {
        let expires_at = match ttl {
            Some(ttl) => Some(chrono::Utc::now() + chrono::Duration::from_std(ttl)?),
            None => None,
        };

        sqlx::query(
            r#"
            INSERT INTO cache_entries (key, value, expires_at) VALUES ($1, $2, $3)
            ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .context("Failed to write cache entry")?;
        Ok(())
    }

    async fn cache_get(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let value = sqlx::query_scalar(
            "SELECT value FROM cache_entries WHERE key = $1 AND (expires_at IS NULL OR expires_at > NOW())",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to read cache entry")?;
        Ok(value)
    }

    async fn cache_evict(&self, key: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM cache_entries WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await
            .context("Failed to evict cache entry")?;
        Ok(result.rows_affected() > 0)
    }

    async fn cache_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let keys = sqlx::query_scalar(
            r#"
            SELECT key FROM cache_entries
            WHERE left(key, length($1)) = $1 AND (expires_at IS NULL OR expires_at > NOW())
            ORDER BY key
            "#,
        )
        .bind(prefix)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list cache keys")?;
        Ok(keys)
    }
}

#[async_trait::async_trait]
impl LockManager for PostgresStore {
    async fn acquire_lock(&self, name: &str, timeout: Duration) -> Result<Option<LockGuard>> {
        let key = advisory_lock_key(name);
        let deadline = Instant::now() + timeout;

        // xact-scoped: the lock goes away with the transaction, so dropping
        // the guard (which rolls the transaction back) releases it
        let mut tx = self.pool.begin().await.context("Failed to start lock transaction")?;
        loop {
            let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_xact_lock($1)")
                .bind(key)
                .fetch_one(&mut *tx)
                .await
                .context("Failed to request advisory lock")?;

            if acquired {
                return Ok(Some(LockGuard::new(name, tx)));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(LOCK_POLL_INTERVAL).await;
        }
    }
}

impl Store for PostgresStore {}
