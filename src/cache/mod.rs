//! Render cache: maps a normalized page URL to its prerendered HTML snapshot.
//!
//! Entries are written once, after a render completes successfully, and are
//! never evicted or expired. The store lives as long as the process; a restart
//! is the only reset. [`CacheStore`] is the seam for swapping in a persistent
//! backend.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use url::Url;

/// Storage for rendered snapshots.
///
/// Once [`store`](Self::store) returns, every later [`lookup`](Self::lookup)
/// for the same key must observe the stored html. Concurrent stores for the
/// same key are last-writer-wins.
pub trait CacheStore: Send + Sync {
    /// Returns the cached snapshot for `key`, if any.
    fn lookup(&self, key: &str) -> Option<String>;

    /// Records `html` as the snapshot for `key`.
    fn store(&self, key: &str, html: String);

    /// Number of cached snapshots.
    fn len(&self) -> usize;

    /// Returns `true` when nothing has been cached yet.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Derives the cache key for a page URL.
///
/// The WHATWG serialization lowercases the host and drops default ports, so
/// spellings of the same address share an entry.
///
/// # Examples
///
/// ```
/// use prerender::cache::cache_key;
/// use url::Url;
///
/// let a = Url::parse("HTTP://Example.COM:80/index.html").unwrap();
/// let b = Url::parse("http://example.com/index.html").unwrap();
/// assert_eq!(cache_key(&a), cache_key(&b));
/// ```
pub fn cache_key(url: &Url) -> String {
    url.as_str().to_owned()
}

/// Unbounded in-memory snapshot store.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }
}

impl CacheStore for MemoryCache {
    fn lookup(&self, key: &str) -> Option<String> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn store(&self, key: &str, html: String) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_owned(), html);
    }

    fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_misses_on_empty_cache() {
        let cache = MemoryCache::new();
        assert!(cache.lookup("http://host/index.html").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn store_then_lookup() {
        let cache = MemoryCache::new();
        cache.store("http://host/index.html", "<html></html>".to_owned());
        assert_eq!(
            cache.lookup("http://host/index.html").as_deref(),
            Some("<html></html>")
        );
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn keys_are_isolated() {
        let cache = MemoryCache::new();
        cache.store("http://host/a", "a".to_owned());
        cache.store("http://host/b", "b".to_owned());
        assert_eq!(cache.lookup("http://host/a").as_deref(), Some("a"));
        assert_eq!(cache.lookup("http://host/b").as_deref(), Some("b"));
    }

    #[test]
    fn last_writer_wins() {
        let cache = MemoryCache::new();
        cache.store("http://host/a", "first".to_owned());
        cache.store("http://host/a", "second".to_owned());
        assert_eq!(cache.lookup("http://host/a").as_deref(), Some("second"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn key_normalizes_host_and_default_port() {
        let a = Url::parse("http://HOST:80/index.html").unwrap();
        let b = Url::parse("http://host/index.html").unwrap();
        assert_eq!(cache_key(&a), cache_key(&b));
    }
}
