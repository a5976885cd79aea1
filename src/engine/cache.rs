// On-disk response cache with per-entry expiration metadata and a background writer.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::config::{CACHE_FILE_EXTENSION, CACHE_INFO_DIR, DEFAULT_CACHE_GROUP};
use crate::request::{Params, RequestDescriptor};

/// Content-derived cache key: a group (directory) plus a blake3 hash of the
/// resolved URL and the sorted, filtered parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    group: String,
    hash: String,
}

impl CacheKey {
    pub fn derive(group: &str, url: &str, params: &Params, ignored: &[String]) -> Self {
        let filtered: BTreeMap<&str, &Value> = params
            .iter()
            .filter(|(name, _)| !ignored.iter().any(|i| i == *name))
            .map(|(name, value)| (name.as_str(), value))
            .collect();

        let mut hasher = blake3::Hasher::new();
        hasher.update(url.as_bytes());
        hasher.update(b"\n");
        hasher.update(serde_json::to_string(&filtered).unwrap_or_default().as_bytes());

        Self {
            group: sanitize_group(group),
            hash: hasher.finalize().to_hex().to_string(),
        }
    }

    pub fn for_request(desc: &RequestDescriptor, url: &Url) -> Self {
        let policy = desc.cache_policy();
        Self::derive(&policy.group, url.as_str(), desc.params(), &policy.ignored_params)
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    fn file_name(&self) -> String {
        format!("{}.{}", self.hash, CACHE_FILE_EXTENSION)
    }
}

/// Restrict group names to a single safe path segment that cannot collide
/// with the metadata directory.
fn sanitize_group(group: &str) -> String {
    let cleaned: String = group
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_matches('.');
    if cleaned.is_empty() {
        DEFAULT_CACHE_GROUP.to_string()
    } else if cleaned == CACHE_INFO_DIR {
        format!("{}_", cleaned)
    } else {
        cleaned.to_string()
    }
}

/// Metadata persisted next to every payload; the only source of expiration truth.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CacheInfo {
    file_path: String,
    info_file_path: String,
    created_epoch_seconds: f64,
    expiration_epoch_seconds: f64,
}

fn now_epoch_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

struct PendingEntry {
    seq: u64,
    value: String,
    expires_at: f64,
}

struct PutOp {
    key: CacheKey,
    seq: u64,
    generation: u64,
    value: String,
    created_at: f64,
    expires_at: f64,
}

enum WriteOp {
    Put(PutOp),
    Flush(oneshot::Sender<()>),
}

struct Shared {
    root: PathBuf,
    /// Serializes all filesystem access of this store.
    io_lock: Mutex<()>,
    /// Values accepted by `put` but not yet persisted.
    pending: Mutex<HashMap<CacheKey, PendingEntry>>,
    next_seq: AtomicU64,
    /// Bumped by `clear`; queued writes from an older generation are dropped.
    generation: AtomicU64,
}

/// Durable key/value cache with expiration, rooted at one directory:
/// `<root>/<group>/<hash>.request` payloads and
/// `<root>/info/<group>/<hash>.request` JSON metadata.
///
/// Reads block on disk I/O; writes are queued to a background task.
#[derive(Clone)]
pub struct CacheStore {
    shared: Arc<Shared>,
    writer: Option<mpsc::UnboundedSender<WriteOp>>,
}

impl CacheStore {
    /// Open (creating if needed) a cache rooted at `root`. Outside a tokio
    /// runtime writes are performed inline.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join(CACHE_INFO_DIR))
            .with_context(|| format!("failed to create cache dir {}", root.display()))?;

        let shared = Arc::new(Shared {
            root,
            io_lock: Mutex::new(()),
            pending: Mutex::new(HashMap::new()),
            next_seq: AtomicU64::new(1),
            generation: AtomicU64::new(0),
        });
        let writer = Handle::try_current()
            .ok()
            .map(|rt| spawn_writer(&rt, Arc::clone(&shared)));

        Ok(Self { shared, writer })
    }

    pub fn root(&self) -> &Path {
        &self.shared.root
    }

    pub fn payload_path(&self, key: &CacheKey) -> PathBuf {
        self.shared.payload_path(key)
    }

    pub fn info_path(&self, key: &CacheKey) -> PathBuf {
        self.shared.info_path(key)
    }

    /// Queue a write. The value is readable through `get` immediately.
    pub fn put(&self, key: &CacheKey, value: String, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        let created_at = now_epoch_secs();
        let expires_at = created_at + ttl.as_secs_f64();
        let seq = self.shared.next_seq.fetch_add(1, Ordering::Relaxed);

        self.shared.pending.lock().insert(
            key.clone(),
            PendingEntry {
                seq,
                value: value.clone(),
                expires_at,
            },
        );

        let op = PutOp {
            key: key.clone(),
            seq,
            generation: self.shared.generation.load(Ordering::Acquire),
            value,
            created_at,
            expires_at,
        };
        match &self.writer {
            Some(tx) => {
                if let Err(mpsc::error::SendError(WriteOp::Put(op))) = tx.send(WriteOp::Put(op)) {
                    self.shared.apply_put(op);
                }
            }
            None => self.shared.apply_put(op),
        }
    }

    /// Write synchronously, bypassing the queue.
    pub fn put_blocking(&self, key: &CacheKey, value: &str, ttl: Duration) -> Result<()> {
        if ttl.is_zero() {
            return Ok(());
        }
        let created_at = now_epoch_secs();
        self.shared
            .write_entry(key, value, created_at, created_at + ttl.as_secs_f64(), None)
    }

    /// Blocking read. Metadata is checked first; an absent, malformed or
    /// expired entry is a miss and the payload is never opened.
    pub fn get(&self, key: &CacheKey) -> Option<String> {
        let now = now_epoch_secs();
        if let Some(pending) = self.shared.pending.lock().get(key) {
            if now < pending.expires_at {
                return Some(pending.value.clone());
            }
        }
        self.shared.read_entry(key, now)
    }

    /// Delete every payload/metadata pair whose expiration has passed.
    pub fn evict_expired(&self) -> Result<usize> {
        self.shared.evict_expired()
    }

    /// Delete the whole cache, or only one group.
    pub fn clear(&self, group: Option<&str>) -> Result<()> {
        self.shared.clear(group)
    }

    /// Wait until every write queued before this call has been applied.
    pub async fn flush(&self) {
        if let Some(tx) = &self.writer {
            let (done_tx, done_rx) = oneshot::channel();
            if tx.send(WriteOp::Flush(done_tx)).is_ok() {
                let _ = done_rx.await;
            }
        }
    }
}

fn spawn_writer(rt: &Handle, shared: Arc<Shared>) -> mpsc::UnboundedSender<WriteOp> {
    let (tx, mut rx) = mpsc::unbounded_channel::<WriteOp>();
    rt.spawn(async move {
        while let Some(op) = rx.recv().await {
            match op {
                WriteOp::Put(put) => {
                    let shared = Arc::clone(&shared);
                    if let Err(e) = tokio::task::spawn_blocking(move || shared.apply_put(put)).await
                    {
                        warn!("cache writer task failed: {}", e);
                    }
                }
                WriteOp::Flush(done) => {
                    let _ = done.send(());
                }
            }
        }
        debug!("cache writer stopped");
    });
    tx
}

impl Shared {
    fn payload_path(&self, key: &CacheKey) -> PathBuf {
        self.root.join(&key.group).join(key.file_name())
    }

    fn info_path(&self, key: &CacheKey) -> PathBuf {
        self.root
            .join(CACHE_INFO_DIR)
            .join(&key.group)
            .join(key.file_name())
    }

    fn apply_put(&self, op: PutOp) {
        let written = self.write_entry(
            &op.key,
            &op.value,
            op.created_at,
            op.expires_at,
            Some(op.generation),
        );
        if let Err(e) = written {
            warn!("cache write failed for {}: {:#}", op.key.hash, e);
        }
        let mut pending = self.pending.lock();
        if pending.get(&op.key).is_some_and(|p| p.seq == op.seq) {
            pending.remove(&op.key);
        }
    }

    /// Payload first, metadata last, each through a temp file and rename.
    /// A write queued under `generation` is skipped once a clear has bumped it.
    fn write_entry(
        &self,
        key: &CacheKey,
        value: &str,
        created_at: f64,
        expires_at: f64,
        generation: Option<u64>,
    ) -> Result<()> {
        let _guard = self.io_lock.lock();
        if generation.is_some_and(|g| g != self.generation.load(Ordering::Acquire)) {
            debug!("cache write for {}/{} dropped: cleared since queued", key.group, key.hash);
            return Ok(());
        }
        let payload = self.payload_path(key);
        let info_path = self.info_path(key);

        write_atomic(&payload, value.as_bytes())?;

        let info = CacheInfo {
            file_path: format!("{}/{}", key.group, key.file_name()),
            info_file_path: format!("{}/{}/{}", CACHE_INFO_DIR, key.group, key.file_name()),
            created_epoch_seconds: created_at,
            expiration_epoch_seconds: expires_at,
        };
        write_atomic(&info_path, &serde_json::to_vec(&info)?)?;
        debug!("cache stored {}/{}", key.group, key.hash);
        Ok(())
    }

    fn read_entry(&self, key: &CacheKey, now: f64) -> Option<String> {
        let _guard = self.io_lock.lock();
        let info_path = self.info_path(key);

        let info = match read_info(&info_path) {
            Ok(Some(info)) => info,
            Ok(None) => return None,
            Err(e) => {
                warn!("cache metadata unreadable {}: {:#}", info_path.display(), e);
                return None;
            }
        };

        let payload = self.payload_path(key);
        if now >= info.expiration_epoch_seconds {
            debug!("cache entry expired {}/{}", key.group, key.hash);
            remove_pair(&payload, &info_path);
            return None;
        }

        match fs::read_to_string(&payload) {
            Ok(value) => Some(value),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("cache payload missing {}", payload.display());
                None
            }
            Err(e) => {
                warn!("cache payload unreadable {}: {}", payload.display(), e);
                None
            }
        }
    }

    fn evict_expired(&self) -> Result<usize> {
        let _guard = self.io_lock.lock();
        let now = now_epoch_secs();
        let info_root = self.root.join(CACHE_INFO_DIR);
        if !info_root.is_dir() {
            return Ok(0);
        }

        let mut removed = 0;
        for group_entry in fs::read_dir(&info_root)
            .with_context(|| format!("failed to list {}", info_root.display()))?
        {
            let group_dir = group_entry?.path();
            if !group_dir.is_dir() {
                continue;
            }
            let Some(group) = group_dir.file_name().map(|g| g.to_os_string()) else {
                continue;
            };

            for entry in fs::read_dir(&group_dir)? {
                let info_path = entry?.path();
                if info_path.extension().and_then(|e| e.to_str()) != Some(CACHE_FILE_EXTENSION) {
                    continue;
                }
                match read_info(&info_path) {
                    Ok(Some(info)) if info.expiration_epoch_seconds <= now => {
                        let Some(file_name) = info_path.file_name() else {
                            continue;
                        };
                        let payload = self.root.join(&group).join(file_name);
                        remove_pair(&payload, &info_path);
                        removed += 1;
                    }
                    Ok(_) => {}
                    Err(e) => warn!("skipping cache metadata {}: {:#}", info_path.display(), e),
                }
            }
        }

        self.pending.lock().retain(|_, p| p.expires_at > now);
        debug!("cache eviction removed {} entries", removed);
        Ok(removed)
    }

    fn clear(&self, group: Option<&str>) -> Result<()> {
        let _guard = self.io_lock.lock();
        self.generation.fetch_add(1, Ordering::AcqRel);
        match group {
            None => {
                remove_dir_if_exists(&self.root)?;
                self.pending.lock().clear();
            }
            Some(group) => {
                let group = sanitize_group(group);
                remove_dir_if_exists(&self.root.join(&group))?;
                remove_dir_if_exists(&self.root.join(CACHE_INFO_DIR).join(&group))?;
                self.pending.lock().retain(|key, _| key.group != group);
            }
        }
        Ok(())
    }
}

fn read_info(path: &Path) -> Result<Option<CacheInfo>> {
    match fs::read(path) {
        Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let tmp = path.with_extension(format!("{}.tmp", CACHE_FILE_EXTENSION));
    fs::write(&tmp, data).with_context(|| format!("failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("failed to rename into {}", path.display()))?;
    Ok(())
}

/// Metadata goes first so a half-removed entry is never considered valid.
fn remove_pair(payload: &Path, info: &Path) {
    remove_file_logged(info);
    remove_file_logged(payload);
}

fn remove_file_logged(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!("cache file not removed {}: {}", path.display(), e),
    }
}

fn remove_dir_if_exists(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("failed to remove {}", path.display())),
    }
}
