//! Reference-counted element type for opaque record payloads.
//!
//! Ordinary samples (integers, floats, complex pairs) are moved through
//! the ring buffer by value and need no lifecycle management. Opaque
//! "record" samples are different: several downstream readers may hold
//! the same logical record, and the last one to finish with it must run
//! its destructor. [`RefCounted<T>`] gives the sample multiplexer
//! (`flowgraph::mux`) a place to do that accounting on `update` (see
//! invariant 9, "ref-count balance").

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// A record payload shared by up to `MAX_READERS` consumers.
///
/// Cloning increments the shared count; dropping the last clone drops
/// the inner `T`. This mirrors `Arc<T>` almost exactly, but exposes
/// `ref_count` and `add_refs`/`unref` directly so the mux can perform
/// the batched "ref by R-1 on produce, unref one per consume" dance
/// from the multiplexer's `update` contract without going through
/// `Arc::clone` in a loop on the hot path.
pub struct RefCounted<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    value: T,
    count: AtomicUsize,
}

impl<T> RefCounted<T> {
    /// Wraps `value` with an initial reference count of 1.
    pub fn new(value: T) -> Self {
        RefCounted { inner: Arc::new(Inner { value, count: AtomicUsize::new(1) }) }
    }

    /// Current reference count. Racy if other threads are concurrently
    /// `ref`/`unref`-ing; intended for tests and debug dumps only.
    pub fn ref_count(&self) -> usize {
        self.inner.count.load(Ordering::Acquire)
    }

    /// Adds `n` references without producing new handles, matching the
    /// "multiply the rc of each produced element so final rc equals R"
    /// rule: a writer produces one handle implicitly (count starts at
    /// 1) then calls `add_refs(r - 1)` for `r` downstream readers.
    pub fn add_refs(&self, n: usize) {
        if n == 0 {
            return;
        }
        self.inner.count.fetch_add(n, Ordering::AcqRel);
    }

    /// Releases one reference. Returns `true` if this was the last one,
    /// meaning `T`'s destructor has now run (dropped along with the
    /// final `Arc`).
    pub fn unref(self) -> bool {
        let inner = self.inner;
        let remaining = inner.count.fetch_sub(1, Ordering::AcqRel) - 1;
        drop(inner);
        remaining == 0
    }

    pub fn get(&self) -> &T {
        &self.inner.value
    }
}

impl<T> Clone for RefCounted<T> {
    fn clone(&self) -> Self {
        self.inner.count.fetch_add(1, Ordering::AcqRel);
        RefCounted { inner: Arc::clone(&self.inner) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

    #[test]
    fn single_owner_unrefs_to_zero() {
        let rc = RefCounted::new(42u32);
        assert_eq!(rc.ref_count(), 1);
        assert!(rc.unref());
    }

    #[test]
    fn add_refs_models_fan_out_to_readers() {
        let rc = RefCounted::new("record");
        rc.add_refs(2); // R = 3 downstream readers
        assert_eq!(rc.ref_count(), 3);

        let a = rc.clone();
        let b = rc.clone();
        assert_eq!(a.ref_count(), 5);

        assert!(!rc.unref());
        assert!(!a.unref());
        assert!(b.unref());
    }

    struct DropFlag<'a>(&'a AtomicBool);
    impl<'a> Drop for DropFlag<'a> {
        fn drop(&mut self) {
            self.0.store(true, AtomicOrdering::Release);
        }
    }

    #[test]
    fn destructor_runs_on_last_unref() {
        let dropped = AtomicBool::new(false);
        let rc = RefCounted::new(DropFlag(&dropped));
        let clone = rc.clone();
        assert!(!rc.unref());
        assert!(!dropped.load(AtomicOrdering::Acquire));
        assert!(clone.unref());
        assert!(dropped.load(AtomicOrdering::Acquire));
    }
}
