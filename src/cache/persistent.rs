//! Abstract on-disk key/value store (§6 `PersistentKV`) and the default
//! [`sled`]-backed implementation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

/// Error from a [`PersistentKV`] implementation.
#[derive(Error, Debug, Clone)]
pub enum KvError {
    /// Underlying storage I/O failure.
    #[error("I/O error: {0}")]
    Io(String),
    /// The path is held exclusively by another process.
    #[error("path in use: {0}")]
    PathInUse(String),
    /// `open` was called on a store that is already open.
    #[error("already open")]
    AlreadyOpen,
    /// An operation was attempted before `open` or after `close`.
    #[error("not open")]
    NotOpen,
}

/// A key/value entry read back from a [`PersistentKV`], with its stored TTL
/// (if any) so the cache layer above can re-derive expiry.
#[derive(Debug, Clone)]
pub struct StoredValue {
    /// The raw stored bytes.
    pub bytes: Vec<u8>,
    /// Time-to-live from the moment of `put`, if one was set.
    pub ttl: Option<Duration>,
}

/// Abstract crash-safe on-disk key/value engine.
///
/// Implementations must be crash-safe to the granularity of a successful
/// `put`: a `put` that returns `Ok` must survive a process crash immediately
/// afterward.
pub trait PersistentKV: Send + Sync {
    /// Open (or create, if the directory is empty) the store at `path`.
    fn open(path: &Path) -> Result<Self, KvError>
    where
        Self: Sized;

    /// Close the store, releasing any exclusive lock on its path.
    fn close(&self) -> Result<(), KvError>;

    /// Fetch the raw bytes for `key`, if present.
    fn get(&self, key: &str) -> Result<Option<StoredValue>, KvError>;

    /// Store `bytes` for `key` with an optional TTL.
    fn put(&self, key: &str, bytes: &[u8], ttl: Option<Duration>) -> Result<(), KvError>;

    /// Remove `key`. No-op (success) if the key is absent.
    fn remove(&self, key: &str) -> Result<(), KvError>;

    /// Remove every key starting with `prefix`. No-op (success) if none
    /// match.
    fn remove_with_prefix(&self, prefix: &str) -> Result<(), KvError>;

    /// Iterate keys starting with `prefix`.
    fn iterate_prefix(&self, prefix: &str) -> Result<Vec<(String, StoredValue)>, KvError>;

    /// Rewrite the store, dropping tombstones and unused pages.
    fn compact(&self) -> Result<(), KvError>;

    /// Approximate on-disk size in bytes.
    fn size_bytes(&self) -> Result<u64, KvError>;
}

/// TTL is stored as a little-endian `u64` of seconds-since-epoch absolute
/// deadline, prefixed to the value so it survives process restarts. `0` means
/// "no expiry".
fn encode_with_ttl(bytes: &[u8], ttl: Option<Duration>) -> Vec<u8> {
    let deadline = ttl
        .map(|ttl| {
            let now = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default();
            (now + ttl).as_secs()
        })
        .unwrap_or(0);
    let mut out = Vec::with_capacity(8 + bytes.len());
    out.extend_from_slice(&deadline.to_le_bytes());
    out.extend_from_slice(bytes);
    out
}

fn decode_with_ttl(raw: &[u8]) -> StoredValue {
    if raw.len() < 8 {
        return StoredValue {
            bytes: raw.to_vec(),
            ttl: None,
        };
    }
    let mut deadline_bytes = [0u8; 8];
    deadline_bytes.copy_from_slice(&raw[..8]);
    let deadline = u64::from_le_bytes(deadline_bytes);
    let ttl = if deadline == 0 {
        None
    } else {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        Some(Duration::from_secs(deadline.saturating_sub(now)))
    };
    StoredValue {
        bytes: raw[8..].to_vec(),
        ttl,
    }
}

/// Default [`PersistentKV`] backed by an embedded `sled::Db`.
///
/// Opening fails with [`KvError::PathInUse`] if another process holds `sled`'s
/// exclusive file lock on `path`, matching §4.2's open/close semantics.
pub struct SledKV {
    db: sled::Db,
    path: PathBuf,
}

impl SledKV {
    /// The directory this store was opened against.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open `path` read-only, for use as the protected overlay (§4.2).
    /// After `compact()` the mutable path is guaranteed valid here.
    pub fn open_read_only(path: &Path) -> Result<Self, KvError> {
        let config = sled::Config::new().path(path).read_only(true);
        let db = config.open().map_err(map_sled_error)?;
        Ok(SledKV {
            db,
            path: path.to_path_buf(),
        })
    }
}

fn map_sled_error(err: sled::Error) -> KvError {
    match &err {
        sled::Error::Io(io_err) if io_err.kind() == std::io::ErrorKind::WouldBlock => {
            KvError::PathInUse(err.to_string())
        }
        _ => {
            let message = err.to_string();
            if message.to_lowercase().contains("lock") {
                KvError::PathInUse(message)
            } else {
                KvError::Io(message)
            }
        }
    }
}

impl PersistentKV for SledKV {
    fn open(path: &Path) -> Result<Self, KvError> {
        std::fs::create_dir_all(path).map_err(|e| KvError::Io(e.to_string()))?;
        let db = sled::open(path).map_err(map_sled_error)?;
        Ok(SledKV {
            db,
            path: path.to_path_buf(),
        })
    }

    fn close(&self) -> Result<(), KvError> {
        self.db.flush().map_err(map_sled_error)?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<StoredValue>, KvError> {
        match self.db.get(key.as_bytes()).map_err(map_sled_error)? {
            Some(raw) => Ok(Some(decode_with_ttl(&raw))),
            None => Ok(None),
        }
    }

    fn put(&self, key: &str, bytes: &[u8], ttl: Option<Duration>) -> Result<(), KvError> {
        let encoded = encode_with_ttl(bytes, ttl);
        self.db
            .insert(key.as_bytes(), encoded)
            .map_err(map_sled_error)?;
        self.db.flush().map_err(map_sled_error)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), KvError> {
        self.db.remove(key.as_bytes()).map_err(map_sled_error)?;
        Ok(())
    }

    fn remove_with_prefix(&self, prefix: &str) -> Result<(), KvError> {
        let keys: Vec<sled::IVec> = self
            .db
            .scan_prefix(prefix.as_bytes())
            .keys()
            .collect::<Result<_, _>>()
            .map_err(map_sled_error)?;
        for key in keys {
            self.db.remove(key).map_err(map_sled_error)?;
        }
        Ok(())
    }

    fn iterate_prefix(&self, prefix: &str) -> Result<Vec<(String, StoredValue)>, KvError> {
        let mut out = Vec::new();
        for entry in self.db.scan_prefix(prefix.as_bytes()) {
            let (key, value) = entry.map_err(map_sled_error)?;
            let key = String::from_utf8_lossy(&key).to_string();
            out.push((key, decode_with_ttl(&value)));
        }
        Ok(out)
    }

    fn compact(&self) -> Result<(), KvError> {
        // sled has no explicit compaction API; flush ensures durability and
        // the segment GC runs in the background. We expose this as the seam
        // `DefaultCache::compact` calls so a different PersistentKV can do a
        // real rewrite.
        self.db.flush().map_err(map_sled_error)?;
        Ok(())
    }

    fn size_bytes(&self) -> Result<u64, KvError> {
        self.db.size_on_disk().map_err(map_sled_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let kv = SledKV::open(dir.path()).unwrap();
        kv.put("k1", b"v1", None).unwrap();
        let value = kv.get("k1").unwrap().unwrap();
        assert_eq!(value.bytes, b"v1");
        assert_eq!(value.ttl, None);
    }

    #[test]
    fn remove_with_prefix_removes_matching_keys_only() {
        let dir = tempfile::tempdir().unwrap();
        let kv = SledKV::open(dir.path()).unwrap();
        kv.put("catalog::a", b"1", None).unwrap();
        kv.put("catalog::b", b"2", None).unwrap();
        kv.put("other::c", b"3", None).unwrap();
        kv.remove_with_prefix("catalog::").unwrap();
        assert!(kv.get("catalog::a").unwrap().is_none());
        assert!(kv.get("catalog::b").unwrap().is_none());
        assert!(kv.get("other::c").unwrap().is_some());
    }

    #[test]
    fn remove_unknown_key_is_success() {
        let dir = tempfile::tempdir().unwrap();
        let kv = SledKV::open(dir.path()).unwrap();
        assert!(kv.remove("nope").is_ok());
    }

    #[test]
    fn reopen_after_compact_as_read_only_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        {
            let kv = SledKV::open(dir.path()).unwrap();
            kv.put("k", b"v", None).unwrap();
            kv.compact().unwrap();
            kv.close().unwrap();
        }
        let ro = SledKV::open_read_only(dir.path()).unwrap();
        assert_eq!(ro.get("k").unwrap().unwrap().bytes, b"v");
    }
}
