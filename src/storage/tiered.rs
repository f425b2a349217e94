use log::{debug, warn};
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use crate::error::{PipelineError, PipelineResult};
use crate::model::Timestamp;
use crate::storage::paths::normalize_relative_path;
use crate::storage::remote::{RemoteObjectMeta, RemoteStore};

const LIST_PAGE_SIZE: usize = 1000;
const TEMP_PREFIX: &str = ".tmp-";

/// Size and modification time of a stored file
#[derive(Debug, Clone, PartialEq)]
pub struct FileStat {
    pub path: String,
    pub size: u64,
    pub modified: Option<Timestamp>,
}

/// Local working copy with an optional remote durable tier.
///
/// Reads check local disk first and hydrate from the remote on a miss.
/// Writes go to local disk and then to the remote; a failed remote write
/// is an error. Keys are `/`-separated relative paths.
#[derive(Clone)]
pub struct TieredFileStore {
    root: PathBuf,
    remote: Option<Arc<dyn RemoteStore>>,
}

impl std::fmt::Debug for TieredFileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieredFileStore")
            .field("root", &self.root)
            .field("remote", &self.remote.is_some())
            .finish()
    }
}

/// Make `path` absolute against the working directory and collapse `.`/`..`
/// without touching the filesystem.
fn resolve_root(path: &Path) -> std::io::Result<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };

    let mut resolved = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                resolved.pop();
            }
            other => resolved.push(other.as_os_str()),
        }
    }
    Ok(resolved)
}

fn storage_error(action: &str, key: &str, err: impl std::fmt::Display) -> PipelineError {
    PipelineError::storage(format!("remote {} failed for '{}': {}", action, key, err))
}

impl TieredFileStore {
    pub fn new(root: impl AsRef<Path>, remote: Option<Arc<dyn RemoteStore>>) -> PipelineResult<Self> {
        let root = resolve_root(root.as_ref())?;
        std::fs::create_dir_all(&root)?;
        Ok(Self { root, remote })
    }

    pub fn local_only(root: impl AsRef<Path>) -> PipelineResult<Self> {
        Self::new(root, None)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn has_remote(&self) -> bool {
        self.remote.is_some()
    }

    fn normalize(&self, key: &str) -> PipelineResult<String> {
        normalize_relative_path(key).map_err(PipelineError::Validation)
    }

    fn local_path(&self, key: &str) -> PathBuf {
        key.split('/').fold(self.root.clone(), |path, segment| path.join(segment))
    }

    async fn local_stat(&self, key: &str) -> PipelineResult<Option<FileStat>> {
        match tokio::fs::metadata(self.local_path(key)).await {
            Ok(meta) if meta.is_file() => Ok(Some(FileStat {
                path: key.to_string(),
                size: meta.len(),
                modified: meta.modified().ok().map(Timestamp::from),
            })),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write bytes to local disk through a temp file so readers never see a
    /// partial blob.
    async fn write_local(&self, key: &str, bytes: &[u8]) -> PipelineResult<()> {
        let path = self.local_path(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let temp = path.with_file_name(format!(
            "{}{}",
            TEMP_PREFIX,
            crate::model::generate_dir_name()
        ));
        tokio::fs::write(&temp, bytes).await?;
        if let Err(e) = tokio::fs::rename(&temp, &path).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Pull `key` from the remote into the local tier. Remote errors read as
    /// a miss.
    async fn hydrate(&self, key: &str) -> PipelineResult<Option<Vec<u8>>> {
        let Some(remote) = &self.remote else {
            return Ok(None);
        };

        match remote.get(key).await {
            Ok(Some(bytes)) => {
                debug!("Hydrating {} ({} bytes) from remote tier", key, bytes.len());
                self.write_local(key, &bytes).await?;
                Ok(Some(bytes))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                warn!("Remote read of {} failed, treating as not found: {:#}", key, e);
                Ok(None)
            }
        }
    }

    pub async fn stat(&self, key: &str) -> PipelineResult<Option<FileStat>> {
        let key = self.normalize(key)?;
        if let Some(stat) = self.local_stat(&key).await? {
            return Ok(Some(stat));
        }
        if self.hydrate(&key).await?.is_none() {
            return Ok(None);
        }
        self.local_stat(&key).await
    }

    pub async fn load(&self, key: &str) -> PipelineResult<Option<Vec<u8>>> {
        let key = self.normalize(key)?;
        match tokio::fs::read(self.local_path(&key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => self.hydrate(&key).await,
            Err(e) => Err(e.into()),
        }
    }

    /// Local first, then remote. When the remote write fails the local copy
    /// is removed again and the failure is returned as a storage error.
    pub async fn save(&self, key: &str, bytes: &[u8], content_type: Option<&str>) -> PipelineResult<()> {
        let key = self.normalize(key)?;
        self.write_local(&key, bytes).await?;

        if let Some(remote) = &self.remote {
            if let Err(e) = remote.put(&key, bytes.to_vec(), content_type).await {
                let _ = tokio::fs::remove_file(self.local_path(&key)).await;
                return Err(storage_error("write", &key, e));
            }
        }
        Ok(())
    }

    /// Save the contents of a file outside the store under `key`
    pub async fn upload(&self, source: &Path, key: &str, content_type: Option<&str>) -> PipelineResult<()> {
        let bytes = tokio::fs::read(source).await?;
        self.save(key, &bytes, content_type).await
    }

    /// Write the object at `key` to `dest`; false if it exists in neither tier
    pub async fn download(&self, key: &str, dest: &Path) -> PipelineResult<bool> {
        match self.load(key).await? {
            Some(bytes) => {
                if let Some(parent) = dest.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(dest, bytes).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Link `src` to `dst` in both tiers. Local uses a hard link and falls
    /// back to a byte copy; the remote uses a server-side copy.
    pub async fn copy(&self, src: &str, dst: &str) -> PipelineResult<()> {
        let src = self.normalize(src)?;
        let dst = self.normalize(dst)?;

        if self.local_stat(&src).await?.is_none() && self.hydrate(&src).await?.is_none() {
            return Err(PipelineError::NotFound {
                kind: "object",
                key: src,
            });
        }

        let from = self.local_path(&src);
        let to = self.local_path(&dst);
        if let Some(parent) = to.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // a retried materialization may find its own earlier link
        match tokio::fs::remove_file(&to).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        if let Err(e) = tokio::fs::hard_link(&from, &to).await {
            debug!("Hard link {} -> {} failed ({}), copying bytes", src, dst, e);
            tokio::fs::copy(&from, &to).await?;
        }

        if let Some(remote) = &self.remote {
            remote
                .copy(&src, &dst)
                .await
                .map_err(|e| storage_error("copy", &dst, e))?;
        }
        Ok(())
    }

    /// Every file under `prefix` in the local tier, as sorted keys
    pub async fn list(&self, prefix: &str) -> PipelineResult<Vec<String>> {
        let (start, base) = if prefix.is_empty() {
            (self.root.clone(), String::new())
        } else {
            let prefix = self.normalize(prefix)?;
            (self.local_path(&prefix), prefix)
        };

        let mut keys = Vec::new();
        let mut pending = vec![(start, base)];
        while let Some((dir, key)) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };

            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.starts_with(TEMP_PREFIX) {
                    continue;
                }
                let child = if key.is_empty() {
                    name
                } else {
                    format!("{}/{}", key, name)
                };
                if entry.file_type().await?.is_dir() {
                    pending.push((entry.path(), child));
                } else {
                    keys.push(child);
                }
            }
        }

        keys.sort();
        Ok(keys)
    }

    /// Page through the remote listing under `prefix`. Empty without a
    /// remote; remote errors are storage errors.
    pub async fn list_remote(&self, prefix: &str) -> PipelineResult<Vec<RemoteObjectMeta>> {
        let Some(remote) = &self.remote else {
            return Ok(Vec::new());
        };

        let mut objects = Vec::new();
        let mut token = None;
        loop {
            let page = remote
                .list_page(prefix, token, LIST_PAGE_SIZE)
                .await
                .map_err(|e| storage_error("list", prefix, e))?;
            objects.extend(page.objects);
            match page.next_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }
        Ok(objects)
    }

    /// Whether anything is left at `key` or under `key/` in either tier
    pub async fn exists(&self, key: &str) -> PipelineResult<bool> {
        let key = self.normalize(key)?;

        match tokio::fs::metadata(self.local_path(&key)).await {
            Ok(_) => return Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        if let Some(remote) = &self.remote {
            let exact = remote
                .head(&key)
                .await
                .map_err(|e| storage_error("stat", &key, e))?;
            if exact.is_some() {
                return Ok(true);
            }
            let page = remote
                .list_page(&format!("{}/", key), None, 1)
                .await
                .map_err(|e| storage_error("list", &key, e))?;
            return Ok(!page.objects.is_empty());
        }
        Ok(false)
    }

    /// Delete the subtree in both tiers. Missing directories are fine.
    pub async fn remove_directory(&self, key: &str) -> PipelineResult<()> {
        let key = self.normalize(key)?;

        match tokio::fs::remove_dir_all(self.local_path(&key)).await {
            Ok(()) => debug!("Removed local directory {}", key),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        if let Some(remote) = &self.remote {
            let removed = remote
                .delete_prefix(&format!("{}/", key))
                .await
                .map_err(|e| storage_error("delete", &key, e))?;
            debug!("Removed {} remote objects under {}", removed, key);
        }
        Ok(())
    }
}
