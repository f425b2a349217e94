use anyhow::{anyhow, bail, Result};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::watch;

use crate::model::{now, Timestamp};

/// Metadata for one remote object. Keys are relative to the remote prefix.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteObjectMeta {
    pub key: String,
    pub size: u64,
    pub content_type: Option<String>,
    pub last_modified: Option<Timestamp>,
}

#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub objects: Vec<RemoteObjectMeta>,
    /// Continuation token for the next page, if any
    pub next_token: Option<String>,
}

/// Durable object storage behind the local tier.
///
/// Implementations report a missing key as `Ok(None)`; `Err` means the
/// backend could not be reached or refused the request.
#[async_trait::async_trait]
pub trait RemoteStore: Send + Sync {
    async fn head(&self, key: &str) -> Result<Option<RemoteObjectMeta>>;
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: Option<&str>) -> Result<()>;
    /// Server-side copy; fails if `src` does not exist
    async fn copy(&self, src: &str, dst: &str) -> Result<()>;
    async fn list_page(&self, prefix: &str, token: Option<String>, limit: usize) -> Result<ListPage>;
    /// Delete every object under `prefix`; returns how many were removed
    async fn delete_prefix(&self, prefix: &str) -> Result<usize>;
}

#[derive(Debug, Clone)]
struct StoredObject {
    bytes: Vec<u8>,
    content_type: Option<String>,
    last_modified: Timestamp,
}

impl StoredObject {
    fn meta(&self, key: &str) -> RemoteObjectMeta {
        RemoteObjectMeta {
            key: key.to_string(),
            size: self.bytes.len() as u64,
            content_type: self.content_type.clone(),
            last_modified: Some(self.last_modified),
        }
    }
}

#[derive(Debug, Default)]
struct MemoryRemoteState {
    objects: BTreeMap<String, StoredObject>,
    /// deleted keys that listings keep returning for a few more calls
    ghosts: HashMap<String, (StoredObject, usize)>,
}

/// In-process remote tier.
///
/// Besides plain storage it can simulate an unreachable backend
/// (`set_fail_reads`/`set_fail_writes`), hold writes until released
/// (`pause_writes`/`resume_writes`) and keep deleted keys visible to
/// listings for a number of calls (`set_listing_lag`) the way an
/// eventually-consistent bucket does.
#[derive(Debug)]
pub struct MemoryRemote {
    state: Mutex<MemoryRemoteState>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    listing_lag: AtomicUsize,
    writes_open: watch::Sender<bool>,
    waiting_writes: AtomicUsize,
    puts: AtomicUsize,
    copies: AtomicUsize,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    pub fn new() -> Self {
        let (writes_open, _) = watch::channel(true);
        Self {
            state: Mutex::new(MemoryRemoteState::default()),
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            listing_lag: AtomicUsize::new(0),
            writes_open,
            waiting_writes: AtomicUsize::new(0),
            puts: AtomicUsize::new(0),
            copies: AtomicUsize::new(0),
        }
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Deleted keys stay visible to the next `rounds` listings
    pub fn set_listing_lag(&self, rounds: usize) {
        self.listing_lag.store(rounds, Ordering::SeqCst);
    }

    pub fn pause_writes(&self) {
        self.writes_open.send_replace(false);
    }

    pub fn resume_writes(&self) {
        self.writes_open.send_replace(true);
    }

    /// Writes currently parked behind `pause_writes`
    pub fn waiting_writes(&self) -> usize {
        self.waiting_writes.load(Ordering::SeqCst)
    }

    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn copy_count(&self) -> usize {
        self.copies.load(Ordering::SeqCst)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.state.lock().objects.contains_key(key)
    }

    pub fn object_count(&self) -> usize {
        self.state.lock().objects.len()
    }

    fn check_reads(&self) -> Result<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            bail!("remote unavailable (simulated read failure)");
        }
        Ok(())
    }

    async fn admit_write(&self) -> Result<()> {
        let mut open = self.writes_open.subscribe();
        if !*open.borrow() {
            self.waiting_writes.fetch_add(1, Ordering::SeqCst);
            let waited = open.wait_for(|open| *open).await.map(|_| ());
            self.waiting_writes.fetch_sub(1, Ordering::SeqCst);
            waited.map_err(|_| anyhow!("remote write gate closed"))?;
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            bail!("remote unavailable (simulated write failure)");
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl RemoteStore for MemoryRemote {
    async fn head(&self, key: &str) -> Result<Option<RemoteObjectMeta>> {
        self.check_reads()?;
        Ok(self.state.lock().objects.get(key).map(|o| o.meta(key)))
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.check_reads()?;
        Ok(self.state.lock().objects.get(key).map(|o| o.bytes.clone()))
    }

    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: Option<&str>) -> Result<()> {
        self.admit_write().await?;
        let object = StoredObject {
            bytes,
            content_type: content_type.map(str::to_string),
            last_modified: now(),
        };
        let mut state = self.state.lock();
        state.ghosts.remove(key);
        state.objects.insert(key.to_string(), object);
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn copy(&self, src: &str, dst: &str) -> Result<()> {
        self.admit_write().await?;
        let mut state = self.state.lock();
        let mut object = state
            .objects
            .get(src)
            .cloned()
            .ok_or_else(|| anyhow!("copy source '{}' does not exist", src))?;
        object.last_modified = now();
        state.ghosts.remove(dst);
        state.objects.insert(dst.to_string(), object);
        self.copies.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn list_page(&self, prefix: &str, token: Option<String>, limit: usize) -> Result<ListPage> {
        self.check_reads()?;
        let mut state = self.state.lock();

        let mut visible: BTreeMap<String, RemoteObjectMeta> = state
            .objects
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, object)| (key.clone(), object.meta(key)))
            .collect();

        // each listing that sees a ghost uses up one round of its lag
        state.ghosts.retain(|key, (object, rounds)| {
            if key.starts_with(prefix) {
                visible.insert(key.clone(), object.meta(key));
                *rounds -= 1;
            }
            *rounds > 0
        });

        let start_after = token.unwrap_or_default();
        let mut objects: Vec<RemoteObjectMeta> = visible
            .into_iter()
            .filter(|(key, _)| start_after.is_empty() || key.as_str() > start_after.as_str())
            .map(|(_, meta)| meta)
            .take(limit.max(1) + 1)
            .collect();

        let next_token = if objects.len() > limit.max(1) {
            objects.truncate(limit.max(1));
            objects.last().map(|meta| meta.key.clone())
        } else {
            None
        };

        Ok(ListPage {
            objects,
            next_token,
        })
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        self.admit_write().await?;
        let lag = self.listing_lag.load(Ordering::SeqCst);
        let mut state = self.state.lock();

        let keys: Vec<String> = state
            .objects
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();

        for key in &keys {
            if let Some(object) = state.objects.remove(key) {
                if lag > 0 {
                    state.ghosts.insert(key.clone(), (object, lag));
                }
            }
        }
        Ok(keys.len())
    }
}
