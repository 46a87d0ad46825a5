//! Response caching: a moka-backed in-memory tier for playlists and AES keys,
//! with an optional disk tier under the process temp directory for bodies
//! worth reusing across runs. Disabled entirely by `no_cache`.

use std::hash::{DefaultHasher, Hash, Hasher};
use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime};

use bytes::Bytes;
use moka::future::Cache;
use tracing::{debug, warn};

const MEMORY_CAPACITY: u64 = 256;
const DISK_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheResourceType {
    Playlist,
    Key,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub resource: CacheResourceType,
    pub url: String,
}

impl CacheKey {
    pub fn new(resource: CacheResourceType, url: impl Into<String>) -> Self {
        Self {
            resource,
            url: url.into(),
        }
    }

    fn storage_key(&self) -> String {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        format!("{:016x}", hasher.finish())
    }
}

pub struct CacheManager {
    memory: Cache<String, (Bytes, Instant)>,
    disk_root: Option<PathBuf>,
}

impl CacheManager {
    /// Build a cache manager. `disk_root` enables the disk tier; callers pass
    /// a directory under `std::env::temp_dir()` unless caching is disabled.
    pub fn new(disk_root: Option<PathBuf>) -> Self {
        if let Some(root) = &disk_root
            && let Err(e) = std::fs::create_dir_all(root)
        {
            warn!(error = %e, root = %root.display(), "disk cache unavailable");
            return Self {
                memory: Cache::new(MEMORY_CAPACITY),
                disk_root: None,
            };
        }
        Self {
            memory: Cache::new(MEMORY_CAPACITY),
            disk_root,
        }
    }

    pub async fn get(&self, key: &CacheKey) -> Option<Bytes> {
        let storage_key = key.storage_key();
        if let Some((data, expires_at)) = self.memory.get(&storage_key).await {
            if Instant::now() < expires_at {
                debug!(url = %key.url, "cache hit (memory)");
                return Some(data);
            }
            self.memory.invalidate(&storage_key).await;
        }

        // Keys never spill to disk.
        if key.resource == CacheResourceType::Key {
            return None;
        }
        let root = self.disk_root.as_ref()?;
        let path = root.join(&storage_key);
        let metadata = std::fs::metadata(&path).ok()?;
        let age = metadata
            .modified()
            .ok()
            .and_then(|m| SystemTime::now().duration_since(m).ok())?;
        if age > DISK_TTL {
            let _ = std::fs::remove_file(&path);
            return None;
        }
        let data = std::fs::read(&path).ok().map(Bytes::from)?;
        debug!(url = %key.url, "cache hit (disk)");
        Some(data)
    }

    pub async fn put(&self, key: CacheKey, data: Bytes, ttl: Duration) {
        let storage_key = key.storage_key();
        self.memory
            .insert(storage_key.clone(), (data.clone(), Instant::now() + ttl))
            .await;

        if key.resource == CacheResourceType::Key {
            return;
        }
        if let Some(root) = &self.disk_root
            && let Err(e) = std::fs::write(root.join(&storage_key), &data)
        {
            warn!(error = %e, url = %key.url, "failed to write cache entry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_roundtrip_and_expiry() {
        let cache = CacheManager::new(None);
        let key = CacheKey::new(CacheResourceType::Key, "http://example.com/key");
        cache
            .put(key.clone(), Bytes::from_static(b"0123456789abcdef"), Duration::from_secs(60))
            .await;
        assert_eq!(
            cache.get(&key).await.unwrap(),
            Bytes::from_static(b"0123456789abcdef")
        );

        let stale = CacheKey::new(CacheResourceType::Key, "http://example.com/stale");
        cache
            .put(stale.clone(), Bytes::from_static(b"x"), Duration::ZERO)
            .await;
        assert!(cache.get(&stale).await.is_none());
    }

    #[tokio::test]
    async fn disk_tier_survives_memory_miss() {
        let dir = tempfile::tempdir().unwrap();
        let key = CacheKey::new(CacheResourceType::Playlist, "http://example.com/pl.m3u8");

        {
            let cache = CacheManager::new(Some(dir.path().to_path_buf()));
            cache
                .put(key.clone(), Bytes::from_static(b"#EXTM3U"), Duration::from_secs(60))
                .await;
        }
        // Fresh manager: memory is cold, the disk tier answers.
        let cache = CacheManager::new(Some(dir.path().to_path_buf()));
        assert_eq!(cache.get(&key).await.unwrap(), Bytes::from_static(b"#EXTM3U"));
    }

    #[tokio::test]
    async fn keys_never_reach_disk() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheManager::new(Some(dir.path().to_path_buf()));
        let key = CacheKey::new(CacheResourceType::Key, "http://example.com/key");
        cache
            .put(key.clone(), Bytes::from_static(b"0123456789abcdef"), Duration::from_secs(60))
            .await;
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
