//! Result cache keyed by operation fingerprint
//!
//! The store is untyped: [`ResultCache`] only moves [`CacheValue`]s around.
//! Type safety comes from [`ResultCacheExt`], which tags every write with the
//! value's type and checks the tag on read. A read that finds a different
//! type fails with [`QueryError::CacheCorrupted`] instead of returning a
//! wrong value.

use std::any::{Any, TypeId};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use tracing::debug;

use crate::error::{QueryError, Result};

static SHARED_CACHE: Lazy<Arc<MemoryCache>> = Lazy::new(|| Arc::new(MemoryCache::new()));

/// A cached result, distinguishing "cached as absent" from a present value
#[derive(Debug, Clone, PartialEq)]
pub enum Cached<T> {
    Absent,
    Present(T),
}

impl<T> Cached<T> {
    pub fn into_option(self) -> Option<T> {
        match self {
            Cached::Absent => None,
            Cached::Present(value) => Some(value),
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Cached::Absent)
    }
}

impl<T> From<Option<T>> for Cached<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(value) => Cached::Present(value),
            None => Cached::Absent,
        }
    }
}

/// A value tagged with its type identity
#[derive(Clone)]
pub struct TypedValue {
    type_name: &'static str,
    value: Arc<dyn Any + Send + Sync>,
}

impl TypedValue {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            type_name: std::any::type_name::<T>(),
            value: Arc::new(value),
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn type_id(&self) -> TypeId {
        self.value.as_ref().type_id()
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }
}

impl std::fmt::Debug for TypedValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypedValue")
            .field("type_name", &self.type_name)
            .finish_non_exhaustive()
    }
}

/// What the untyped store actually holds
pub type CacheValue = Cached<TypedValue>;

/// Expiration policy for a cache entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CachePolicy {
    /// Keep until explicitly invalidated
    #[default]
    Indefinite,
    /// Expire at a fixed point in time
    AbsoluteExpiration(DateTime<Utc>),
    /// Expire once the entry has not been read for this long
    SlidingExpiration(Duration),
}

impl CachePolicy {
    /// Absolute expiration `ttl` from now
    pub fn ttl(ttl: Duration) -> Self {
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| Utc::now().checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        CachePolicy::AbsoluteExpiration(expires_at)
    }

    pub fn sliding(idle: Duration) -> Self {
        CachePolicy::SlidingExpiration(idle)
    }
}

/// Pluggable untyped store.
///
/// Implementations must be safe under concurrent callers and replace entries
/// atomically: a reader sees either the old entry or the new one.
pub trait ResultCache: Send + Sync {
    /// Fetch a live entry
    fn get(&self, key: &str) -> Option<CacheValue>;

    /// Insert or replace an entry
    fn set(&self, key: &str, value: CacheValue, policy: CachePolicy);

    /// Remove an entry, returning whether one was present
    fn remove(&self, key: &str) -> bool;
}

fn require_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(QueryError::invalid_argument("cache key is null or empty"));
    }
    Ok(())
}

/// Typed operations over any [`ResultCache`]
pub trait ResultCacheExt: ResultCache {
    /// Read a value of type `T`.
    ///
    /// `Ok(None)` means nothing is cached. `Ok(Some(Cached::Absent))` means
    /// an absent result was cached.
    fn try_read<T>(&self, key: &str) -> Result<Option<Cached<T>>>
    where
        T: Clone + Send + Sync + 'static,
    {
        require_key(key)?;

        match self.get(key) {
            None => Ok(None),
            Some(Cached::Absent) => Ok(Some(Cached::Absent)),
            Some(Cached::Present(stored)) => match stored.downcast_ref::<T>() {
                Some(value) => Ok(Some(Cached::Present(value.clone()))),
                None => Err(QueryError::CacheCorrupted {
                    key: key.to_string(),
                    stored: stored.type_name(),
                    requested: std::any::type_name::<T>(),
                }),
            },
        }
    }

    /// Write a value, replacing any previous entry. `None` is cached as absent.
    fn write<T>(&self, key: &str, value: Option<T>, policy: CachePolicy) -> Result<()>
    where
        T: Send + Sync + 'static,
    {
        require_key(key)?;
        self.set(key, Cached::from(value).map_present(TypedValue::new), policy);
        Ok(())
    }

    /// Remove an entry. Removing a missing key is not an error.
    fn invalidate(&self, key: &str) -> Result<()> {
        require_key(key)?;
        self.remove(key);
        Ok(())
    }
}

impl<C: ResultCache + ?Sized> ResultCacheExt for C {}

impl<T> Cached<T> {
    fn map_present<U>(self, f: impl FnOnce(T) -> U) -> Cached<U> {
        match self {
            Cached::Absent => Cached::Absent,
            Cached::Present(value) => Cached::Present(f(value)),
        }
    }
}

struct MemoryEntry {
    value: CacheValue,
    policy: CachePolicy,
    last_access: DateTime<Utc>,
}

impl MemoryEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.policy {
            CachePolicy::Indefinite => false,
            CachePolicy::AbsoluteExpiration(at) => now >= at,
            CachePolicy::SlidingExpiration(idle) => match chrono::Duration::from_std(idle) {
                Ok(idle) => now - self.last_access >= idle,
                Err(_) => false,
            },
        }
    }
}

/// Process-local cache over a sharded concurrent map.
///
/// Expired entries are dropped lazily on read or by [`MemoryCache::purge_expired`].
#[derive(Default)]
pub struct MemoryCache {
    entries: DashMap<String, MemoryEntry>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide default cache used by data sources that are not given one
    pub fn shared() -> Arc<MemoryCache> {
        SHARED_CACHE.clone()
    }

    /// Number of stored entries, including ones that expired but were not yet purged
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Drop every expired entry, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before.saturating_sub(self.entries.len())
    }
}

impl ResultCache for MemoryCache {
    fn get(&self, key: &str) -> Option<CacheValue> {
        let now = Utc::now();

        if let Some(mut entry) = self.entries.get_mut(key) {
            if !entry.is_expired(now) {
                entry.last_access = now;
                debug!("Cache hit for key: {}", key);
                return Some(entry.value.clone());
            }
        } else {
            debug!("Cache miss for key: {}", key);
            return None;
        }

        // Shard guard is released above; re-check under remove_if so a fresh write survives
        self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        debug!("Cache entry expired for key: {}", key);
        None
    }

    fn set(&self, key: &str, value: CacheValue, policy: CachePolicy) {
        debug!("Writing cache key: {}", key);
        self.entries.insert(
            key.to_string(),
            MemoryEntry {
                value,
                policy,
                last_access: Utc::now(),
            },
        );
    }

    fn remove(&self, key: &str) -> bool {
        let removed = self.entries.remove(key).is_some();
        if removed {
            debug!("Invalidated cache key: {}", key);
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_then_read_same_type() {
        let cache = MemoryCache::new();
        cache
            .write("users:1", Some(vec![1_i64, 2, 3]), CachePolicy::Indefinite)
            .unwrap();

        let read = cache.try_read::<Vec<i64>>("users:1").unwrap();
        assert_eq!(read, Some(Cached::Present(vec![1, 2, 3])));
    }

    #[test]
    fn test_absent_round_trip() {
        let cache = MemoryCache::new();
        cache
            .write::<String>("missing-user", None, CachePolicy::Indefinite)
            .unwrap();

        let read = cache.try_read::<String>("missing-user").unwrap();
        assert_eq!(read, Some(Cached::Absent));
        assert_eq!(read.and_then(Cached::into_option).unwrap_or_default(), "");
    }

    #[test]
    fn test_absent_is_readable_as_any_type() {
        let cache = MemoryCache::new();
        cache
            .write::<String>("k", None, CachePolicy::Indefinite)
            .unwrap();
        assert_eq!(cache.try_read::<i64>("k").unwrap(), Some(Cached::Absent));
    }

    #[test]
    fn test_never_written_is_miss() {
        let cache = MemoryCache::new();
        assert_eq!(cache.try_read::<i64>("never").unwrap(), None);
    }

    #[test]
    fn test_type_mismatch_is_corruption() {
        let cache = MemoryCache::new();
        cache
            .write("k", Some("text".to_string()), CachePolicy::Indefinite)
            .unwrap();

        let err = cache.try_read::<i64>("k").unwrap_err();
        match err {
            QueryError::CacheCorrupted {
                key,
                stored,
                requested,
            } => {
                assert_eq!(key, "k");
                assert!(stored.contains("String"));
                assert_eq!(requested, "i64");
            }
            other => panic!("expected cache corruption, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_key_rejected() {
        let cache = MemoryCache::new();
        assert!(matches!(
            cache.try_read::<i64>(""),
            Err(QueryError::InvalidArgument(_))
        ));
        assert!(matches!(
            cache.write("", Some(1_i64), CachePolicy::Indefinite),
            Err(QueryError::InvalidArgument(_))
        ));
        assert!(matches!(
            cache.invalidate(""),
            Err(QueryError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_invalidate_removes_and_tolerates_missing() {
        let cache = MemoryCache::new();
        cache.invalidate("nothing-here").unwrap();

        cache
            .write("k", Some(1_i64), CachePolicy::Indefinite)
            .unwrap();
        cache.invalidate("k").unwrap();
        assert_eq!(cache.try_read::<i64>("k").unwrap(), None);
    }

    #[test]
    fn test_overwrite_replaces_entry() {
        let cache = MemoryCache::new();
        cache.write("k", Some(1_i64), CachePolicy::Indefinite).unwrap();
        cache
            .write("k", Some("now a string".to_string()), CachePolicy::Indefinite)
            .unwrap();

        assert_eq!(
            cache.try_read::<String>("k").unwrap(),
            Some(Cached::Present("now a string".to_string()))
        );
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_absolute_expiration_in_past() {
        let cache = MemoryCache::new();
        let past = Utc::now() - chrono::Duration::seconds(1);
        cache
            .write("k", Some(1_i64), CachePolicy::AbsoluteExpiration(past))
            .unwrap();

        assert_eq!(cache.try_read::<i64>("k").unwrap(), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_sliding_expiration() {
        let cache = MemoryCache::new();
        cache
            .write("idle", Some(1_i64), CachePolicy::sliding(Duration::ZERO))
            .unwrap();
        cache
            .write("busy", Some(2_i64), CachePolicy::sliding(Duration::from_secs(3600)))
            .unwrap();

        assert_eq!(cache.try_read::<i64>("idle").unwrap(), None);
        assert_eq!(
            cache.try_read::<i64>("busy").unwrap(),
            Some(Cached::Present(2))
        );
    }

    #[test]
    fn test_purge_expired() {
        let cache = MemoryCache::new();
        let past = Utc::now() - chrono::Duration::seconds(1);
        cache
            .write("old", Some(1_i64), CachePolicy::AbsoluteExpiration(past))
            .unwrap();
        cache
            .write("fresh", Some(2_i64), CachePolicy::ttl(Duration::from_secs(60)))
            .unwrap();

        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_racing_writes_and_reads_never_tear() {
        let cache = MemoryCache::new();
        let old = vec!["old".to_string(); 64];
        let new = vec!["new".to_string(); 64];
        cache
            .write("hot-key", Some(old.clone()), CachePolicy::Indefinite)
            .unwrap();

        std::thread::scope(|scope| {
            for writer in 0..2 {
                let (cache, old, new) = (&cache, &old, &new);
                scope.spawn(move || {
                    for round in 0..500 {
                        let value = if (round + writer) % 2 == 0 { new } else { old };
                        cache
                            .write("hot-key", Some(value.clone()), CachePolicy::Indefinite)
                            .unwrap();
                        if round % 50 == 0 {
                            cache.invalidate("hot-key").unwrap();
                        }
                    }
                });
            }
            for _ in 0..4 {
                let (cache, old, new) = (&cache, &old, &new);
                scope.spawn(move || {
                    for _ in 0..1000 {
                        match cache.try_read::<Vec<String>>("hot-key").unwrap() {
                            None => {}
                            Some(Cached::Present(seen)) => {
                                assert!(&seen == old || &seen == new, "torn read: {:?}", seen)
                            }
                            Some(Cached::Absent) => panic!("nothing wrote an absent value"),
                        }
                    }
                });
            }
        });

        let last = cache.try_read::<Vec<String>>("hot-key").unwrap();
        assert!(matches!(last, None | Some(Cached::Present(_))));
    }
}
