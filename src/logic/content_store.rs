use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{PipelineError, PipelineResult};
use crate::model::{now, ContentHashes, ContentObject, InsertOutcome, NewContentObject};
use crate::storage::TieredFileStore;
use crate::store::traits::{content_lock_name, Store};

/// Result of [`ContentStore::upload`]
#[derive(Debug, Clone)]
pub struct UploadOutcome {
    pub already_existed: bool,
    pub object: ContentObject,
}

/// Deduplicating blob store keyed by SHA-256.
pub struct ContentStore<S: Store> {
    store: Arc<S>,
    files: TieredFileStore,
    lock_timeout: Duration,
}

impl<S: Store> Clone for ContentStore<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            files: self.files.clone(),
            lock_timeout: self.lock_timeout,
        }
    }
}

impl<S: Store> ContentStore<S> {
    pub fn new(store: Arc<S>, files: TieredFileStore, lock_timeout: Duration) -> Self {
        Self {
            store,
            files,
            lock_timeout,
        }
    }

    pub async fn upload(&self, bytes: &[u8], content_type: &str) -> PipelineResult<UploadOutcome> {
        let hashes = ContentHashes::compute(bytes);
        self.upload_hashed(bytes, hashes, content_type).await
    }

    /// Upload with digests the caller already computed over `bytes`.
    ///
    /// Lookup, insert and byte write happen under the per-hash lock. A failed
    /// byte write discards the fresh row so the store never claims bytes it
    /// does not have.
    pub async fn upload_hashed(
        &self,
        bytes: &[u8],
        hashes: ContentHashes,
        content_type: &str,
    ) -> PipelineResult<UploadOutcome> {
        let sha256 = hashes.sha256.clone();
        let lock_name = content_lock_name(&sha256);
        let _guard = self
            .store
            .acquire_lock(&lock_name, self.lock_timeout)
            .await?
            .ok_or_else(|| {
                warn!("Timed out waiting for lock {}", lock_name);
                PipelineError::conflict(format!("content {} is being uploaded concurrently", sha256))
            })?;

        if let Some(object) = self.store.get_content_object(&sha256).await? {
            debug!("Content {} already stored", sha256);
            return Ok(UploadOutcome {
                already_existed: true,
                object,
            });
        }

        let new = NewContentObject {
            hashes,
            content_length: bytes.len() as i64,
            content_type: content_type.to_string(),
            created_at: now(),
        };

        let object = match self.store.insert_content_object(new).await? {
            InsertOutcome::Inserted(object) => object,
            InsertOutcome::AlreadyExists => {
                // lost a race against a writer holding a different lock
                return match self.store.get_content_object(&sha256).await? {
                    Some(object) => Ok(UploadOutcome {
                        already_existed: true,
                        object,
                    }),
                    None => Err(PipelineError::Integrity {
                        path: ContentObject::path_for(&sha256),
                        expected: sha256.clone(),
                        actual: "secondary hash collision".to_string(),
                    }),
                };
            }
        };

        if let Err(e) = self
            .files
            .save(&object.path(), bytes, Some(&object.content_type))
            .await
        {
            warn!("Storing content {} failed, discarding row: {}", sha256, e);
            self.store.discard_content_object(&sha256).await?;
            return Err(e);
        }

        info!(
            "Stored new content {} ({} bytes, {})",
            sha256, object.content_length, object.content_type
        );
        Ok(UploadOutcome {
            already_existed: false,
            object,
        })
    }

    /// Hashes from `hashes` with no content row, in input order
    pub async fn missing_hashes(&self, hashes: &[String]) -> PipelineResult<Vec<String>> {
        let existing = self.store.find_existing_hashes(hashes).await?;
        Ok(hashes
            .iter()
            .filter(|h| !existing.contains(h.as_str()))
            .cloned()
            .collect())
    }

    pub async fn get(&self, sha256: &str) -> PipelineResult<Option<ContentObject>> {
        Ok(self.store.get_content_object(sha256).await?)
    }

    pub fn files(&self) -> &TieredFileStore {
        &self.files
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryRemote, RemoteStore};
    use crate::store::traits::{ContentObjectStore, LockManager};
    use crate::store::MemoryStore;

    struct Fixture {
        _dir: tempfile::TempDir,
        remote: Arc<MemoryRemote>,
        store: Arc<MemoryStore>,
        content: ContentStore<MemoryStore>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let remote = Arc::new(MemoryRemote::new());
        let files =
            TieredFileStore::new(dir.path(), Some(remote.clone() as Arc<dyn RemoteStore>)).unwrap();
        let store = Arc::new(MemoryStore::new());
        let content = ContentStore::new(store.clone(), files, Duration::from_secs(1));
        Fixture {
            _dir: dir,
            remote,
            store,
            content,
        }
    }

    #[tokio::test]
    async fn test_second_upload_reports_existing_without_writing() {
        let f = fixture();

        let first = f.content.upload(b"Hello World", "text/html").await.unwrap();
        assert!(!first.already_existed);
        assert_eq!(
            first.object.path(),
            "content/a5/91/a591a6d40bf420404a011733cfb7b190d62c65bf0bcda32b57b277d9ad9f146e"
        );
        assert_eq!(f.remote.put_count(), 1);

        let second = f.content.upload(b"Hello World", "text/html").await.unwrap();
        assert!(second.already_existed);
        assert_eq!(second.object.id, first.object.id);
        assert_eq!(second.object.hashes(), first.object.hashes());
        assert_eq!(f.remote.put_count(), 1);

        assert_eq!(
            f.content.files().load(&first.object.path()).await.unwrap(),
            Some(b"Hello World".to_vec())
        );
    }

    #[tokio::test]
    async fn test_concurrent_uploads_write_once() {
        let f = fixture();

        let uploads = (0..8).map(|_| {
            let content = f.content.clone();
            tokio::spawn(async move { content.upload(b"same bytes", "text/plain").await })
        });
        let results = futures::future::join_all(uploads).await;

        let fresh = results
            .into_iter()
            .map(|r| r.unwrap().unwrap())
            .filter(|outcome| !outcome.already_existed)
            .count();
        assert_eq!(fresh, 1);
        assert_eq!(f.remote.put_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_write_leaves_no_row() {
        let f = fixture();
        f.remote.set_fail_writes(true);

        let err = f.content.upload(b"payload", "text/plain").await.unwrap_err();
        assert!(matches!(err, PipelineError::Storage(_)));

        let hash = ContentHashes::compute(b"payload").sha256;
        assert!(f.store.get_content_object(&hash).await.unwrap().is_none());

        f.remote.set_fail_writes(false);
        let retry = f.content.upload(b"payload", "text/plain").await.unwrap();
        assert!(!retry.already_existed);
    }

    #[tokio::test]
    async fn test_missing_hashes_is_exact() {
        let f = fixture();
        let present = f.content.upload(b"one", "text/plain").await.unwrap();
        let absent = ContentHashes::compute(b"two").sha256;

        let missing = f
            .content
            .missing_hashes(&[present.object.sha256.clone(), absent.clone()])
            .await
            .unwrap();
        assert_eq!(missing, vec![absent]);
        assert!(f.content.missing_hashes(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upload_waits_for_hash_lock() {
        let f = fixture();
        let hash = ContentHashes::compute(b"locked").sha256;
        let _held = f
            .store
            .acquire_lock(&content_lock_name(&hash), Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();

        let content = ContentStore::new(
            f.store.clone(),
            f.content.files().clone(),
            Duration::from_millis(50),
        );
        let err = content.upload(b"locked", "text/plain").await.unwrap_err();
        assert!(matches!(err, PipelineError::Conflict(_)));
    }
}
