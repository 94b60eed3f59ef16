//! Size-bounded on-disk cache of remote objects.
//!
//! Every entry is an immutable blob named `<file_id>-<generation>.blob`,
//! written to a temp file and renamed into place. The index hands out
//! `Arc<CachedBlob>` handles; dropping the last handle of an evicted or
//! replaced blob deletes its file, so readers never see bytes disappear.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, ReadBuf, Take};
use tracing::{debug, info, warn};

use cloudshelf_common::{Error, FileId, Result};
use cloudshelf_remote::ByteRange;

const BLOB_EXTENSION: &str = "blob";
const TEMP_EXTENSION: &str = "tmp";

/// Persisted cache settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_size_mb: u64,
    pub ttl_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size_mb: 1024,
            ttl_seconds: 86_400,
        }
    }
}

impl CacheConfig {
    pub fn max_size_bytes(&self) -> u64 {
        self.max_size_mb.saturating_mul(1024 * 1024)
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }
}

/// Cache occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub total_bytes: u64,
    pub budget_bytes: u64,
}

/// One cached object on disk.
#[derive(Debug)]
pub struct CachedBlob {
    file_id: FileId,
    /// Remote object and content hash the bytes were fetched for.
    source: String,
    path: PathBuf,
    size: u64,
    content_type: String,
    expires_at: Instant,
}

impl CachedBlob {
    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    /// Open the blob for reading, optionally only `range` of it.
    ///
    /// The reader keeps the blob alive until it is dropped.
    pub async fn open(self: &Arc<Self>, range: Option<ByteRange>) -> Result<BlobReader> {
        let (start, len) = match range {
            Some(range) => (range.start, range.len()),
            None => (0, self.size),
        };

        let mut file = fs::File::open(&self.path).await?;
        if start > 0 {
            file.seek(SeekFrom::Start(start)).await?;
        }

        Ok(BlobReader {
            inner: file.take(len),
            len,
            _blob: Arc::clone(self),
        })
    }
}

impl Drop for CachedBlob {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("Deleted cache blob {}", self.path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to delete cache blob {}: {}", self.path.display(), e),
        }
    }
}

/// Reader over a cached blob.
pub struct BlobReader {
    inner: Take<fs::File>,
    len: u64,
    _blob: Arc<CachedBlob>,
}

impl BlobReader {
    /// Number of bytes this reader yields.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl AsyncRead for BlobReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

struct Slot {
    blob: Arc<CachedBlob>,
    /// LRU tick of the last hit or insert.
    last_access: u64,
}

#[derive(Default)]
struct Index {
    slots: HashMap<FileId, Slot>,
    tick: u64,
    total_bytes: u64,
}

impl Index {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn remove(&mut self, file_id: FileId) -> Option<Arc<CachedBlob>> {
        let slot = self.slots.remove(&file_id)?;
        self.total_bytes -= slot.blob.size;
        Some(slot.blob)
    }

    fn evict_lru(&mut self) -> Option<Arc<CachedBlob>> {
        let victim = self
            .slots
            .iter()
            .min_by_key(|(_, slot)| slot.last_access)
            .map(|(id, _)| *id)?;
        self.remove(victim)
    }
}

/// LRU + TTL cache of whole objects, bounded by a byte budget.
pub struct DiskCache {
    dir: PathBuf,
    budget_bytes: u64,
    ttl: Duration,
    generation: AtomicU64,
    index: Mutex<Index>,
}

impl DiskCache {
    /// Open a cache in `dir` from persisted settings.
    pub async fn from_config(dir: impl AsRef<Path>, config: &CacheConfig) -> Result<Self> {
        Self::open(dir, config.max_size_bytes(), config.ttl()).await
    }

    /// Open a cache in `dir`.
    ///
    /// The index lives in memory only, so blobs left behind by an earlier
    /// process are unreachable and get deleted here.
    ///
    /// # Errors
    /// - `CacheIo` if the directory cannot be created or listed
    pub async fn open(dir: impl AsRef<Path>, budget_bytes: u64, ttl: Duration) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).await?;

        let mut removed = 0usize;
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let orphan = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext == BLOB_EXTENSION || ext == TEMP_EXTENSION);
            if orphan {
                match fs::remove_file(&path).await {
                    Ok(()) => removed += 1,
                    Err(e) => warn!("Failed to remove orphaned blob {}: {}", path.display(), e),
                }
            }
        }
        if removed > 0 {
            info!("Removed {} orphaned cache blobs from {}", removed, dir.display());
        }

        Ok(Self {
            dir,
            budget_bytes,
            ttl,
            generation: AtomicU64::new(0),
            index: Mutex::new(Index::default()),
        })
    }

    fn index(&self) -> MutexGuard<'_, Index> {
        self.index.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn budget_bytes(&self) -> u64 {
        self.budget_bytes
    }

    /// Whether an object of `size` bytes can be cached at all.
    pub fn fits(&self, size: u64) -> bool {
        size <= self.budget_bytes
    }

    /// Live entry for `file_id`. Counts as an access for LRU.
    ///
    /// An expired entry is dropped from the index and reported as a miss.
    pub fn get(&self, file_id: FileId) -> Option<Arc<CachedBlob>> {
        let mut index = self.index();
        let expired = index.slots.get(&file_id)?.blob.is_expired(Instant::now());
        if expired {
            let stale = index.remove(file_id);
            drop(index);
            debug!("Cache entry for file {} expired", file_id);
            drop(stale);
            return None;
        }

        let tick = index.next_tick();
        let slot = index.slots.get_mut(&file_id)?;
        slot.last_access = tick;
        Some(Arc::clone(&slot.blob))
    }

    /// Store `data` for `file_id`, evicting least recently used entries
    /// until it fits. An existing entry for the same file is replaced.
    ///
    /// `source` identifies the version of the file the bytes belong to;
    /// readers compare it before trusting the entry.
    ///
    /// # Errors
    /// - `Validation` if `data` alone exceeds the budget
    /// - `CacheIo` if the blob cannot be written
    pub async fn insert(
        &self,
        file_id: FileId,
        source: &str,
        data: &[u8],
        content_type: &str,
    ) -> Result<Arc<CachedBlob>> {
        let size = data.len() as u64;
        if !self.fits(size) {
            return Err(Error::Validation(format!(
                "{} bytes exceed the cache budget of {} bytes",
                size, self.budget_bytes
            )));
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst);
        let path = self
            .dir
            .join(format!("{}-{}.{}", file_id, generation, BLOB_EXTENSION));
        let temp = path.with_extension(TEMP_EXTENSION);

        fs::write(&temp, data).await?;
        if let Err(e) = fs::rename(&temp, &path).await {
            let _ = fs::remove_file(&temp).await;
            return Err(e.into());
        }

        let blob = Arc::new(CachedBlob {
            file_id,
            source: source.to_string(),
            path,
            size,
            content_type: content_type.to_string(),
            expires_at: Instant::now() + self.ttl,
        });

        // Released outside the lock: dropping a blob touches the filesystem.
        let mut released = Vec::new();
        {
            let mut index = self.index();
            released.extend(index.remove(file_id));
            while index.total_bytes + size > self.budget_bytes {
                match index.evict_lru() {
                    Some(victim) => {
                        debug!("Evicting file {} from cache", victim.file_id);
                        released.push(victim);
                    }
                    None => break,
                }
            }
            let tick = index.next_tick();
            index.total_bytes += size;
            index.slots.insert(
                file_id,
                Slot {
                    blob: Arc::clone(&blob),
                    last_access: tick,
                },
            );
        }
        drop(released);

        debug!("Cached file {} ({} bytes)", file_id, size);
        Ok(blob)
    }

    /// Drop the entry for `file_id`. Returns whether one existed.
    pub fn remove(&self, file_id: FileId) -> bool {
        let removed = self.index().remove(file_id);
        removed.is_some()
    }

    /// Drop every entry. Returns the number removed.
    pub fn clear(&self) -> usize {
        let drained: Vec<Slot> = {
            let mut index = self.index();
            index.total_bytes = 0;
            index.slots.drain().map(|(_, slot)| slot).collect()
        };
        let count = drained.len();
        drop(drained);
        info!("Cleared {} cache entries", count);
        count
    }

    /// Drop entries past their TTL. Returns the number removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<Arc<CachedBlob>> = {
            let mut index = self.index();
            let ids: Vec<FileId> = index
                .slots
                .iter()
                .filter(|(_, slot)| slot.blob.is_expired(now))
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter().filter_map(|id| index.remove(id)).collect()
        };
        expired.len()
    }

    pub fn stats(&self) -> CacheStats {
        let index = self.index();
        CacheStats {
            entries: index.slots.len(),
            total_bytes: index.total_bytes,
            budget_bytes: self.budget_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const HOUR: Duration = Duration::from_secs(3600);

    async fn read_all(blob: &Arc<CachedBlob>, range: Option<ByteRange>) -> Vec<u8> {
        let mut reader = blob.open(range).await.unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let temp = TempDir::new().unwrap();
        let cache = DiskCache::open(temp.path(), 1000, HOUR).await.unwrap();

        cache.insert(FileId(1), "v1", b"hello world", "text/plain").await.unwrap();
        let blob = cache.get(FileId(1)).unwrap();

        assert_eq!(blob.size(), 11);
        assert_eq!(blob.content_type(), "text/plain");
        assert_eq!(read_all(&blob, None).await, b"hello world");
        assert_eq!(
            read_all(&blob, Some(ByteRange { start: 6, end: 10 })).await,
            b"world"
        );
        assert!(cache.get(FileId(2)).is_none());
    }

    #[tokio::test]
    async fn test_lru_eviction_keeps_budget() {
        let temp = TempDir::new().unwrap();
        let cache = DiskCache::open(temp.path(), 300, HOUR).await.unwrap();

        cache.insert(FileId(1), "v1", &[1u8; 100], "a").await.unwrap();
        cache.insert(FileId(2), "v1", &[2u8; 100], "a").await.unwrap();
        cache.insert(FileId(3), "v1", &[3u8; 100], "a").await.unwrap();
        // Touch 1 so 2 becomes the least recently used.
        assert!(cache.get(FileId(1)).is_some());

        cache.insert(FileId(4), "v1", &[4u8; 150], "a").await.unwrap();

        assert!(cache.get(FileId(1)).is_some());
        assert!(cache.get(FileId(2)).is_none());
        assert!(cache.get(FileId(3)).is_none());
        assert!(cache.get(FileId(4)).is_some());
        let stats = cache.stats();
        assert_eq!(stats.total_bytes, 250);
        assert!(stats.total_bytes <= stats.budget_bytes);
    }

    #[tokio::test]
    async fn test_oversized_insert_rejected() {
        let temp = TempDir::new().unwrap();
        let cache = DiskCache::open(temp.path(), 10, HOUR).await.unwrap();

        let err = cache.insert(FileId(1), "v1", &[0u8; 11], "a").await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(cache.stats().entries, 0);
    }

    #[tokio::test]
    async fn test_evicted_blob_survives_open_reader() {
        let temp = TempDir::new().unwrap();
        let cache = DiskCache::open(temp.path(), 100, HOUR).await.unwrap();

        let held = cache.insert(FileId(1), "v1", &[7u8; 80], "a").await.unwrap();
        let mut reader = held.open(None).await.unwrap();
        let path = held.path().to_path_buf();
        drop(held);

        cache.insert(FileId(2), "v1", &[8u8; 80], "a").await.unwrap();
        assert!(cache.get(FileId(1)).is_none());
        assert!(path.exists());

        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, vec![7u8; 80]);

        drop(reader);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_replace_uses_new_generation() {
        let temp = TempDir::new().unwrap();
        let cache = DiskCache::open(temp.path(), 100, HOUR).await.unwrap();

        let first = cache.insert(FileId(1), "v1", b"old", "a").await.unwrap();
        let second = cache.insert(FileId(1), "v2", b"newer", "a").await.unwrap();

        assert_ne!(first.path(), second.path());
        assert_eq!(first.source(), "v1");
        assert_eq!(cache.get(FileId(1)).unwrap().source(), "v2");
        assert_eq!(read_all(&first, None).await, b"old");
        assert_eq!(read_all(&cache.get(FileId(1)).unwrap(), None).await, b"newer");
        assert_eq!(cache.stats().total_bytes, 5);
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let temp = TempDir::new().unwrap();
        let cache = DiskCache::open(temp.path(), 100, Duration::from_millis(20))
            .await
            .unwrap();

        cache.insert(FileId(1), "v1", b"a", "a").await.unwrap();
        cache.insert(FileId(2), "v1", b"b", "a").await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert!(cache.get(FileId(1)).is_none());
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.stats().entries, 0);
        assert_eq!(cache.stats().total_bytes, 0);
    }

    #[tokio::test]
    async fn test_clear_deletes_blobs() {
        let temp = TempDir::new().unwrap();
        let cache = DiskCache::open(temp.path(), 100, HOUR).await.unwrap();

        let path = cache.insert(FileId(1), "v1", b"abc", "a").await.unwrap().path().to_path_buf();
        cache.insert(FileId(2), "v1", b"def", "a").await.unwrap();

        assert_eq!(cache.clear(), 2);
        assert!(!path.exists());
        assert_eq!(cache.stats().total_bytes, 0);
    }

    #[tokio::test]
    async fn test_orphans_removed_on_open() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("5-0.blob"), b"stale").unwrap();
        std::fs::write(temp.path().join("6-1.tmp"), b"partial").unwrap();
        std::fs::write(temp.path().join("notes.txt"), b"keep").unwrap();

        let cache = DiskCache::open(temp.path(), 100, HOUR).await.unwrap();

        assert!(!temp.path().join("5-0.blob").exists());
        assert!(!temp.path().join("6-1.tmp").exists());
        assert!(temp.path().join("notes.txt").exists());
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn test_config_defaults() {
        let config: CacheConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.max_size_mb, 1024);
        assert_eq!(config.ttl(), Duration::from_secs(86_400));
        assert_eq!(config.max_size_bytes(), 1024 * 1024 * 1024);
    }
}
