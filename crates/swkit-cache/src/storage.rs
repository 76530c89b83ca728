//! Named response caches (`self.caches`).

use async_trait::async_trait;
use hashbrown::HashMap;
use tokio::sync::RwLock;

use crate::request::Response;
use crate::CacheError;

/// The cache API the engine runs against.
///
/// Entries are keyed by normalized absolute URL. Every operation may fail,
/// which the engine treats as a recoverable condition.
#[async_trait]
pub trait CacheStorage: Send + Sync {
    /// Look `url` up across every cache, oldest cache first.
    async fn match_any(&self, url: &str) -> Result<Option<Response>, CacheError>;

    /// Look `url` up in the named cache.
    async fn match_in(&self, cache_name: &str, url: &str) -> Result<Option<Response>, CacheError>;

    /// Store a response, creating the cache when needed.
    async fn put(&self, cache_name: &str, url: &str, response: Response) -> Result<(), CacheError>;

    /// Delete one entry. Returns whether it existed.
    async fn delete_entry(&self, cache_name: &str, url: &str) -> Result<bool, CacheError>;

    /// URLs stored in the named cache.
    async fn keys(&self, cache_name: &str) -> Result<Vec<String>, CacheError>;

    /// Names of all caches, in creation order.
    async fn cache_names(&self) -> Result<Vec<String>, CacheError>;

    /// Delete a whole cache. Returns whether it existed.
    async fn delete_cache(&self, cache_name: &str) -> Result<bool, CacheError>;
}

/// A single named cache.
#[derive(Debug, Default)]
struct Cache {
    name: String,
    entries: HashMap<String, Response>,
}

impl Cache {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: HashMap::new(),
        }
    }
}

/// In-process cache storage.
#[derive(Debug, Default)]
pub struct MemoryCacheStorage {
    caches: RwLock<Vec<Cache>>,
}

impl MemoryCacheStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn has(&self, name: &str) -> bool {
        self.caches.read().await.iter().any(|c| c.name == name)
    }

    /// Number of entries in the named cache, zero when it does not exist.
    pub async fn len(&self, name: &str) -> usize {
        self.caches
            .read()
            .await
            .iter()
            .find(|c| c.name == name)
            .map_or(0, |c| c.entries.len())
    }
}

#[async_trait]
impl CacheStorage for MemoryCacheStorage {
    async fn match_any(&self, url: &str) -> Result<Option<Response>, CacheError> {
        let caches = self.caches.read().await;
        Ok(caches
            .iter()
            .find_map(|cache| cache.entries.get(url))
            .map(cached_response))
    }

    async fn match_in(&self, cache_name: &str, url: &str) -> Result<Option<Response>, CacheError> {
        let caches = self.caches.read().await;
        Ok(caches
            .iter()
            .find(|c| c.name == cache_name)
            .and_then(|cache| cache.entries.get(url))
            .map(cached_response))
    }

    async fn put(&self, cache_name: &str, url: &str, response: Response) -> Result<(), CacheError> {
        let mut caches = self.caches.write().await;
        let index = match caches.iter().position(|c| c.name == cache_name) {
            Some(index) => index,
            None => {
                caches.push(Cache::new(cache_name));
                caches.len() - 1
            }
        };
        caches[index].entries.insert(url.to_string(), response);
        Ok(())
    }

    async fn delete_entry(&self, cache_name: &str, url: &str) -> Result<bool, CacheError> {
        let mut caches = self.caches.write().await;
        Ok(caches
            .iter_mut()
            .find(|c| c.name == cache_name)
            .is_some_and(|cache| cache.entries.remove(url).is_some()))
    }

    async fn keys(&self, cache_name: &str) -> Result<Vec<String>, CacheError> {
        let caches = self.caches.read().await;
        Ok(caches
            .iter()
            .find(|c| c.name == cache_name)
            .map(|cache| cache.entries.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn cache_names(&self) -> Result<Vec<String>, CacheError> {
        Ok(self.caches.read().await.iter().map(|c| c.name.clone()).collect())
    }

    async fn delete_cache(&self, cache_name: &str) -> Result<bool, CacheError> {
        let mut caches = self.caches.write().await;
        let before = caches.len();
        caches.retain(|c| c.name != cache_name);
        Ok(caches.len() != before)
    }
}

fn cached_response(response: &Response) -> Response {
    Response {
        from_cache: true,
        ..response.clone()
    }
}
