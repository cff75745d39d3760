//! Two-tier key/value cache with protection and eviction (§4.2).
//!
//! Three physical tiers cooperate as logical layers: an in-memory LRU
//! ([`memory::MemoryLayer`]), a mutable persistent layer, and an optional
//! read-only protected overlay (both backed by [`persistent::PersistentKV`]).
//! Lookup order is memory → mutable → protected; mutable hits promote into
//! memory, protected hits never do.

mod memory;
pub mod persistent;

pub use persistent::{KvError, PersistentKV, SledKV, StoredValue};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, warn};

use crate::clock::Clock;
use memory::{MemoryLayer, PutOutcome};

/// Errors from [`DefaultCache`] operations (§4.2 failure model).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// The key is absent.
    #[error("not found")]
    NotFound,
    /// The write does not fit within the configured budget and the eviction
    /// policy is `None`.
    #[error("cache full")]
    CacheFull,
    /// The persistent layer failed.
    #[error("I/O error: {0}")]
    IoError(String),
    /// Another process holds the mutable layer's path exclusively.
    #[error("path in use: {0}")]
    PathInUse(String),
    /// `open` was called on an already-open cache.
    #[error("already open")]
    AlreadyOpen,
    /// An operation requires the cache to be open.
    #[error("not open")]
    NotOpen,
}

impl From<KvError> for CacheError {
    fn from(err: KvError) -> Self {
        match err {
            KvError::Io(message) => CacheError::IoError(message),
            KvError::PathInUse(message) => CacheError::PathInUse(message),
            KvError::AlreadyOpen => CacheError::AlreadyOpen,
            KvError::NotOpen => CacheError::NotOpen,
        }
    }
}

/// Cache-wide result alias.
pub type CacheResult<T> = Result<T, CacheError>;

/// Eviction policy applied by the memory layer (§4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionPolicy {
    /// Refuse writes that don't fit the budget.
    None,
    /// Evict least-recently-used unprotected entries until the write fits.
    LeastRecentlyUsed,
}

/// Configuration surface for [`DefaultCache`] (§6).
#[derive(Clone)]
pub struct CacheConfig {
    /// `0` disables the in-memory LRU.
    pub max_memory_bytes: usize,
    /// `None` disables persistent writes (memory-only mode).
    pub disk_path_mutable: Option<PathBuf>,
    /// `None` disables the read-only overlay.
    pub disk_path_protected: Option<PathBuf>,
    /// Byte budget for the mutable persistent layer. Informational only for
    /// the default `sled`-backed store (sled manages its own on-disk growth);
    /// surfaced so callers can monitor `size_bytes()` against it.
    pub max_disk_bytes: u64,
    /// Entries larger than this are rejected by the memory LRU (but may still
    /// be persisted).
    pub max_value_size: usize,
    /// Eviction policy for the memory layer.
    pub eviction_policy: EvictionPolicy,
    /// When `true`, an `IoError` during `put` propagates to the caller.
    /// When `false`, `put` failures are logged and treated as a cold cache.
    pub propagate_all_cache_errors: bool,
}

impl CacheConfig {
    /// A memory-only configuration with no persistent layers, useful for
    /// tests and for callers that want caching without a filesystem.
    pub fn in_memory_only(max_memory_bytes: usize) -> Self {
        CacheConfig {
            max_memory_bytes,
            ..CacheConfig::default()
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            max_memory_bytes: 16 * 1024 * 1024,
            disk_path_mutable: None,
            disk_path_protected: None,
            max_disk_bytes: 512 * 1024 * 1024,
            max_value_size: 4 * 1024 * 1024,
            eviction_policy: EvictionPolicy::LeastRecentlyUsed,
            propagate_all_cache_errors: false,
        }
    }
}

/// A cache entry (§3), conceptual only — not exposed outside this module.
#[derive(Debug, Clone)]
struct CacheEntry {
    payload: Bytes,
    expiry: Option<Instant>,
    protected: bool,
    size: usize,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        if self.protected {
            return false;
        }
        matches!(self.expiry, Some(deadline) if now >= deadline)
    }
}

/// Two-tier key/value cache. Safe to share across threads behind an `Arc`;
/// every operation is internally synchronized (§5).
pub struct DefaultCache {
    memory: MemoryLayer,
    mutable: RwLock<Option<Arc<dyn PersistentKV>>>,
    protected: RwLock<Option<Arc<dyn PersistentKV>>>,
    config: CacheConfig,
    clock: Arc<dyn Clock>,
}

impl DefaultCache {
    /// Open the cache per `config`, using `clock` for every expiry decision.
    /// Performs existence/directory checks on both configured paths; fails
    /// with [`CacheError::PathInUse`] if another process holds the mutable
    /// layer's lock.
    pub fn open(config: CacheConfig, clock: Arc<dyn Clock>) -> CacheResult<Self> {
        let mutable: Option<Arc<dyn PersistentKV>> = match &config.disk_path_mutable {
            Some(path) => Some(Arc::new(SledKV::open(path)?)),
            None => None,
        };
        let protected: Option<Arc<dyn PersistentKV>> = match &config.disk_path_protected {
            Some(path) => Some(Arc::new(SledKV::open_read_only(path)?)),
            None => None,
        };
        Ok(DefaultCache {
            memory: MemoryLayer::new(config.max_memory_bytes, config.eviction_policy),
            mutable: RwLock::new(mutable),
            protected: RwLock::new(protected),
            config,
            clock,
        })
    }

    /// Close both persistent layers, if open.
    pub fn close(&self) -> CacheResult<()> {
        if let Some(kv) = self.mutable.write().take() {
            kv.close()?;
        }
        if let Some(kv) = self.protected.write().take() {
            kv.close()?;
        }
        Ok(())
    }

    /// Look up `key`: memory → mutable → protected, first hit wins. Mutable
    /// hits are promoted into memory; protected hits are not.
    pub fn get(&self, key: &str) -> CacheResult<Option<Bytes>> {
        let now = self.clock.now_monotonic();

        if let Some(entry) = self.memory.get(key, now) {
            debug!(key, "cache hit: memory");
            return Ok(Some(entry.payload));
        }

        if let Some(kv) = self.mutable.read().as_ref() {
            if let Some(stored) = kv.get(key)? {
                let expired = stored
                    .ttl
                    .map(|ttl| ttl == Duration::ZERO)
                    .unwrap_or(false);
                if expired {
                    let _ = kv.remove(key);
                } else {
                    debug!(key, "cache hit: mutable (promoting to memory)");
                    let bytes = Bytes::from(stored.bytes);
                    let entry = CacheEntry {
                        payload: bytes.clone(),
                        expiry: stored.ttl.map(|ttl| now + ttl),
                        protected: false,
                        size: bytes.len(),
                    };
                    if bytes.len() <= self.config.max_value_size {
                        self.memory.put(key.to_string(), entry);
                    }
                    return Ok(Some(bytes));
                }
            }
        }

        if let Some(kv) = self.protected.read().as_ref() {
            if let Some(stored) = kv.get(key)? {
                debug!(key, "cache hit: protected overlay");
                return Ok(Some(Bytes::from(stored.bytes)));
            }
        }

        Ok(None)
    }

    /// Store `value` under `key` with optional TTL, targeting the mutable
    /// layer (and memory LRU, if the value fits).
    ///
    /// If no mutable layer is configured, this returns success without
    /// persisting: a memory-only configuration still benefits from caching,
    /// and a protected-only configuration silently discards the write once it
    /// falls out of the memory LRU (§9 open question, preserved verbatim).
    pub fn put(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> CacheResult<()> {
        let now = self.clock.now_monotonic();

        if value.len() <= self.config.max_value_size {
            let entry = CacheEntry {
                payload: value.clone(),
                expiry: ttl.map(|ttl| now + ttl),
                protected: false,
                size: value.len(),
            };
            match self.memory.put(key.to_string(), entry) {
                PutOutcome::Stored | PutOutcome::TooLargeForBudget => {}
                PutOutcome::Full => {
                    if self.mutable.read().is_none() {
                        return Err(CacheError::CacheFull);
                    }
                }
            }
        }

        if let Some(kv) = self.mutable.read().as_ref() {
            let result = kv.put(key, &value, ttl);
            if let Err(err) = result {
                let cache_err: CacheError = err.into();
                if self.config.propagate_all_cache_errors {
                    return Err(cache_err);
                }
                warn!(key, error = %cache_err, "cache put failed; treating cache as cold");
            }
        }

        Ok(())
    }

    /// Remove `key` from every tier where semantically permitted. No-op
    /// (success) for unknown keys and for protected keys, which survive
    /// `remove` by design (§9 open question, preserved verbatim: implementers
    /// should not add a force-remove path — use `release` first).
    pub fn remove(&self, key: &str) -> CacheResult<()> {
        self.memory.remove(key);
        if let Some(kv) = self.mutable.read().as_ref() {
            kv.remove(key)?;
        }
        Ok(())
    }

    /// Remove every key starting with `prefix`, across memory and mutable
    /// tiers. Protected entries survive, same as [`DefaultCache::remove`].
    pub fn remove_with_prefix(&self, prefix: &str) -> CacheResult<()> {
        self.memory.remove_with_prefix(prefix);
        if let Some(kv) = self.mutable.read().as_ref() {
            kv.remove_with_prefix(prefix)?;
        }
        Ok(())
    }

    /// Protect `keys`: remove them from LRU eviction consideration and clear
    /// their expiry. The mutable persistent layer has no separate
    /// protected-set concept; protection there is achieved entirely by
    /// keeping the key resident, unexpired, in memory and by the protected
    /// *overlay* being a distinct configured path.
    ///
    /// Keys already resident in memory move there directly. A key that is
    /// only on the persistent mutable layer (e.g. immediately after process
    /// start, before anything has been read back into memory) is hydrated
    /// from there first, so protecting a key never silently depends on it
    /// having been read at least once.
    pub fn protect(&self, keys: &[String]) {
        let missing = self.memory.protect(keys);
        if missing.is_empty() {
            return;
        }
        if let Some(kv) = self.mutable.read().as_ref() {
            for key in &missing {
                if let Ok(Some(stored)) = kv.get(key) {
                    let bytes = Bytes::from(stored.bytes);
                    let entry = CacheEntry {
                        size: bytes.len(),
                        payload: bytes,
                        expiry: None,
                        protected: true,
                    };
                    self.memory.insert_protected(key.clone(), entry);
                }
            }
        }
    }

    /// Release `keys`: reinsert them into the LRU at the MRU end with a
    /// freshly computed expiry.
    pub fn release(&self, keys: &[String], ttl: Option<Duration>) {
        let now = self.clock.now_monotonic();
        self.memory
            .release(keys, || ttl.map(|ttl| now + ttl));
    }

    /// Rewrite the mutable store, dropping tombstones and unused pages, in
    /// preparation for promotion to a protected overlay.
    pub fn compact(&self) -> CacheResult<()> {
        if let Some(kv) = self.mutable.read().as_ref() {
            kv.compact()?;
        }
        Ok(())
    }

    /// Drop every entry from the memory layer and the mutable persistent
    /// layer (not the protected overlay, which this process never writes).
    pub fn clear(&self) -> CacheResult<()> {
        self.memory.clear();
        if let Some(kv) = self.mutable.read().as_ref() {
            kv.remove_with_prefix("")?;
        }
        Ok(())
    }
}
