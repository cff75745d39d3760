//! Request coalescing via fingerprint-keyed async mutexes (§4.5 step 4, §8
//! invariant 5, §9).
//!
//! [`NamedMutexTable`] is an explicitly injected component — one instance is
//! shared by an [`crate::client::OlpClient`] — rather than a process-wide
//! singleton, so multiple independent clients in the same process (e.g. in
//! tests) never coalesce each other's requests.
//!
//! The map holds one [`CoalesceEntry`] per fingerprint. A caller that loses
//! the race to acquire a fingerprint's mutex blocks until the winner
//! finishes. Late arrivals need to see the *same* outcome as the winner, and
//! a plain re-check of the cache only covers the success case, so the winner
//! also publishes its `Result<Bytes, OlpError>` into the entry for a short
//! grace window; a late arrival that finds a fresh publication reuses it
//! instead of repeating the network call (or the failure).

use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::Mutex as AsyncMutex;

use crate::error::OlpError;

/// A coalescing key: conventionally `"<catalog>::<service>::<resource_key>"`.
pub type Fingerprint = String;

/// How long a published result remains visible to late arrivals after the
/// winner that produced it releases the fingerprint's mutex.
pub const PUBLISH_GRACE: Duration = Duration::from_millis(500);

struct Published {
    at: Instant,
    result: Result<Bytes, OlpError>,
}

/// Per-fingerprint coalescing state: the mutex that serializes concurrent
/// callers, plus the most recently published outcome (if still fresh).
pub struct CoalesceEntry {
    mutex: AsyncMutex<()>,
    published: StdMutex<Option<Published>>,
}

impl CoalesceEntry {
    fn new() -> Self {
        CoalesceEntry {
            mutex: AsyncMutex::new(()),
            published: StdMutex::new(None),
        }
    }

    /// Acquire the fingerprint's mutex, serializing with any other holder.
    pub async fn lock(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.mutex.lock().await
    }

    /// The most recently published result, if it is still within
    /// [`PUBLISH_GRACE`] of when it was published.
    pub fn recent_result(&self) -> Option<Result<Bytes, OlpError>> {
        let published = self.published.lock().unwrap();
        published.as_ref().and_then(|p| {
            if p.at.elapsed() <= PUBLISH_GRACE {
                Some(p.result.clone())
            } else {
                None
            }
        })
    }

    /// Publish `result` for late arrivals to observe.
    pub fn publish(&self, result: Result<Bytes, OlpError>) {
        *self.published.lock().unwrap() = Some(Published {
            at: Instant::now(),
            result,
        });
    }
}

/// A table of per-fingerprint [`CoalesceEntry`] values used to collapse
/// concurrent identical requests into a single in-flight attempt.
pub struct NamedMutexTable {
    table: DashMap<Fingerprint, Arc<CoalesceEntry>>,
}

impl Default for NamedMutexTable {
    fn default() -> Self {
        NamedMutexTable::new()
    }
}

impl NamedMutexTable {
    /// Construct an empty table.
    pub fn new() -> Self {
        NamedMutexTable {
            table: DashMap::new(),
        }
    }

    /// Get (creating if absent) the coalescing entry guarding `fingerprint`.
    pub fn entry_for(&self, fingerprint: &str) -> Arc<CoalesceEntry> {
        if let Some(existing) = self.table.get(fingerprint) {
            return existing.clone();
        }
        self.table
            .entry(fingerprint.to_string())
            .or_insert_with(|| Arc::new(CoalesceEntry::new()))
            .clone()
    }

    /// Drop table entries that are no longer referenced by any in-flight
    /// caller and have no publication still within [`PUBLISH_GRACE`] — the
    /// latter check keeps an entry alive long enough for a late arrival to
    /// still observe the winner's published result after the winner itself
    /// has dropped its reference. Cheap, O(n) in the table size; callers
    /// invoke this periodically (e.g. after a request completes) rather than
    /// on every lookup, so the table doesn't grow unboundedly over a
    /// long-lived client's lifetime.
    pub fn garbage_collect(&self) {
        self.table
            .retain(|_, entry| Arc::strong_count(entry) > 1 || entry.recent_result().is_some());
    }

    /// Current number of tracked fingerprints, for tests and diagnostics.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// `true` if no fingerprints are currently tracked.
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn same_fingerprint_serializes_concurrent_callers() {
        let table = Arc::new(NamedMutexTable::new());
        let calls = Arc::new(AtomicU32::new(0));
        let concurrent_peak = Arc::new(AtomicU32::new(0));
        let in_flight = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let table = table.clone();
            let calls = calls.clone();
            let concurrent_peak = concurrent_peak.clone();
            let in_flight = in_flight.clone();
            handles.push(tokio::spawn(async move {
                let entry = table.entry_for("catalog::service::resource");
                let _guard = entry.lock().await;
                let now_in_flight = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                concurrent_peak.fetch_max(now_in_flight, Ordering::SeqCst);
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(calls.load(Ordering::SeqCst), 8);
        assert_eq!(concurrent_peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_fingerprints_run_concurrently() {
        let table = NamedMutexTable::new();
        let a = table.entry_for("a");
        let b = table.entry_for("b");
        let guard_a = a.lock().await;
        // A different fingerprint's entry is unaffected by `a` being held.
        let guard_b = b.mutex.try_lock();
        assert!(guard_b.is_ok());
        drop(guard_a);
    }

    #[tokio::test]
    async fn garbage_collect_drops_unreferenced_entries() {
        let table = NamedMutexTable::new();
        {
            let _entry = table.entry_for("transient");
        }
        assert_eq!(table.len(), 1);
        table.garbage_collect();
        assert_eq!(table.len(), 0);
    }

    #[tokio::test]
    async fn garbage_collect_keeps_referenced_entries() {
        let table = NamedMutexTable::new();
        let held = table.entry_for("kept");
        table.garbage_collect();
        assert_eq!(table.len(), 1);
        drop(held);
        table.garbage_collect();
        assert_eq!(table.len(), 0);
    }

    #[tokio::test]
    async fn published_result_is_visible_to_late_arrivals_within_grace() {
        let entry = CoalesceEntry::new();
        entry.publish(Ok(Bytes::from_static(b"v")));
        assert_eq!(entry.recent_result().unwrap().unwrap(), Bytes::from_static(b"v"));
    }

    #[tokio::test]
    async fn published_error_is_visible_to_late_arrivals() {
        let entry = CoalesceEntry::new();
        entry.publish(Err(OlpError::NotFound {
            message: "nope".into(),
        }));
        assert!(matches!(
            entry.recent_result().unwrap(),
            Err(OlpError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn garbage_collect_keeps_unreferenced_entry_with_fresh_publication() {
        let table = NamedMutexTable::new();
        {
            let entry = table.entry_for("winner-gone");
            entry.publish(Ok(Bytes::from_static(b"v")));
        }
        // No external `Arc` holds the entry anymore, but its publication is
        // still within `PUBLISH_GRACE`, so a late arrival must still be able
        // to observe it.
        table.garbage_collect();
        assert_eq!(table.len(), 1);
        let entry = table.entry_for("winner-gone");
        assert_eq!(entry.recent_result().unwrap().unwrap(), Bytes::from_static(b"v"));

        {
            let mut published = entry.published.lock().unwrap();
            published.as_mut().unwrap().at -= PUBLISH_GRACE * 2;
        }
        drop(entry);
        table.garbage_collect();
        assert_eq!(table.len(), 0);
    }

    #[tokio::test]
    async fn stale_publication_is_not_reused() {
        let entry = CoalesceEntry::new();
        entry.publish(Ok(Bytes::from_static(b"v")));
        {
            let mut published = entry.published.lock().unwrap();
            published.as_mut().unwrap().at -= PUBLISH_GRACE * 2;
        }
        assert!(entry.recent_result().is_none());
    }
}
