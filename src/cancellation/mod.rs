//! Hierarchical, thread-safe cooperative cancellation.
//!
//! [`CancellationContext`] is a cheap-to-clone handle shared across concurrent
//! tasks. It owns a set of detachable cancel handles plus a monotonic
//! "cancelled" flag: once set, the flag never clears, and every later
//! `attach` invokes its handle synchronously instead of storing it.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// A boxed, one-shot callback invoked when the owning context is cancelled.
///
/// Typical handles cancel an in-flight HTTP request or wake a parked sleep.
pub type CancelHandle = Box<dyn FnOnce() + Send + 'static>;

/// Id returned by [`CancellationContext::attach`], used to [`CancellationContext::detach`].
pub type AttachId = u64;

/// Error returned when attaching to an already-cancelled context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlreadyCancelled;

impl fmt::Display for AlreadyCancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "context already cancelled")
    }
}

impl std::error::Error for AlreadyCancelled {}

struct Inner {
    cancelled: std::sync::atomic::AtomicBool,
    next_id: AtomicU64,
    handles: Mutex<HashMap<AttachId, CancelHandle>>,
}

/// Hierarchical, cooperative cancellation token.
///
/// Cloning is cheap (an `Arc` bump) and all clones observe the same
/// cancellation state. A [`CancellationContext::child`] is cancelled whenever
/// its parent is cancelled, in addition to being cancellable independently —
/// this lets [`crate::client::OlpClient`] scope a sub-request (e.g. the
/// recursive API lookup call) without losing the caller's cancellation.
#[derive(Clone)]
pub struct CancellationContext {
    inner: Arc<Inner>,
}

impl Default for CancellationContext {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationContext {
    /// Create a fresh, not-yet-cancelled context with no parent.
    pub fn new() -> Self {
        CancellationContext {
            inner: Arc::new(Inner {
                cancelled: std::sync::atomic::AtomicBool::new(false),
                next_id: AtomicU64::new(1),
                handles: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Create a child context that is cancelled whenever `self` is cancelled
    /// (or is cancelled independently by calling `cancel()` on the child).
    pub fn child(&self) -> CancellationContext {
        let child = CancellationContext::new();
        let child_for_handle = child.clone();
        match self.attach(Box::new(move || child_for_handle.cancel())) {
            Ok(_id) => {}
            Err(AlreadyCancelled) => {
                // self.attach already invoked the handle synchronously,
                // cancelling the child. Nothing further to do.
            }
        }
        child
    }

    /// Atomically attach a cancel handle.
    ///
    /// If the context is already cancelled, `handle` is invoked synchronously
    /// (outside any lock) and [`AlreadyCancelled`] is returned — this ensures
    /// callers that pass e.g. "cancel this HTTP request" never leak the
    /// request just because cancellation raced ahead of the attach.
    pub fn attach(&self, handle: CancelHandle) -> Result<AttachId, AlreadyCancelled> {
        if self.inner.cancelled.load(Ordering::Acquire) {
            handle();
            return Err(AlreadyCancelled);
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let mut handles = self.inner.handles.lock();
        // Re-check under the lock: cancel() clears handles under the lock
        // after setting the flag, so if we observe cancelled==false but lost
        // the race, inserting here is still safe — cancel() will either have
        // already run (and we'd see cancelled==true) or will run after us and
        // pick up this handle.
        if self.inner.cancelled.load(Ordering::Acquire) {
            drop(handles);
            handle();
            return Err(AlreadyCancelled);
        }
        handles.insert(id, handle);
        Ok(id)
    }

    /// Remove a previously attached handle by id. Idempotent: detaching an
    /// unknown or already-fired id is a no-op.
    pub fn detach(&self, id: AttachId) {
        self.inner.handles.lock().remove(&id);
    }

    /// Run `operation`, attaching `handle` for its duration and detaching it
    /// afterwards regardless of how `operation` completes.
    pub fn execute_with<F, R>(&self, handle: CancelHandle, operation: F) -> R
    where
        F: FnOnce() -> R,
    {
        let attached = self.attach(handle).ok();
        let result = operation();
        if let Some(id) = attached {
            self.detach(id);
        }
        result
    }

    /// Set the cancelled flag (idempotent) and invoke every attached handle
    /// exactly once, outside the internal lock.
    ///
    /// `cancel()` is fire-and-forget: it does not wait for handles to finish
    /// running.
    pub fn cancel(&self) {
        if self
            .inner
            .cancelled
            .swap(true, Ordering::AcqRel)
        {
            // Already cancelled; idempotent no-op.
            return;
        }
        let drained: Vec<CancelHandle> = {
            let mut handles = self.inner.handles.lock();
            handles.drain().map(|(_, h)| h).collect()
        };
        for handle in drained {
            handle();
        }
    }

    /// Observe the cancelled flag without side effects.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Return `Err(OlpError::Cancelled)`-shaped unit if cancelled, for use at
    /// checkpoints ahead of a suspension point.
    pub fn check(&self) -> Result<(), crate::error::OlpError> {
        if self.is_cancelled() {
            Err(crate::error::OlpError::Cancelled)
        } else {
            Ok(())
        }
    }
}

impl fmt::Debug for CancellationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationContext")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn attach_then_cancel_invokes_handle_once() {
        let ctx = CancellationContext::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        ctx.attach(Box::new(move || {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();
        ctx.cancel();
        ctx.cancel(); // idempotent
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn attach_after_cancel_invokes_synchronously() {
        let ctx = CancellationContext::new();
        ctx.cancel();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let result = ctx.attach(Box::new(move || {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(result, Err(AlreadyCancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn detach_is_idempotent() {
        let ctx = CancellationContext::new();
        let id = ctx.attach(Box::new(|| {})).unwrap();
        ctx.detach(id);
        ctx.detach(id); // no panic
    }

    #[test]
    fn detached_handle_does_not_fire_on_cancel() {
        let ctx = CancellationContext::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let id = ctx
            .attach(Box::new(move || {
                calls_clone.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        ctx.detach(id);
        ctx.cancel();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn execute_with_detaches_after_completion() {
        let ctx = CancellationContext::new();
        let result = ctx.execute_with(Box::new(|| {}), || 42);
        assert_eq!(result, 42);
        ctx.cancel(); // should not panic / no leftover handle to invoke twice
    }

    #[test]
    fn child_cancelled_when_parent_cancelled() {
        let parent = CancellationContext::new();
        let child = parent.child();
        assert!(!child.is_cancelled());
        parent.cancel();
        assert!(child.is_cancelled());
    }

    #[test]
    fn child_survives_independent_cancel() {
        let parent = CancellationContext::new();
        let child = parent.child();
        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[test]
    fn concurrent_cancel_and_attach_never_loses_a_handle() {
        use std::thread;
        for _ in 0..200 {
            let ctx = CancellationContext::new();
            let calls = Arc::new(AtomicUsize::new(0));
            let calls_clone = calls.clone();
            let ctx2 = ctx.clone();
            let attacher = thread::spawn(move || {
                let _ = ctx2.attach(Box::new(move || {
                    calls_clone.fetch_add(1, Ordering::SeqCst);
                }));
            });
            let canceller = thread::spawn(move || ctx.cancel());
            attacher.join().unwrap();
            canceller.join().unwrap();
            assert_eq!(calls.load(Ordering::SeqCst), 1);
        }
    }
}
