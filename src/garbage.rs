//! Deferred destruction bundle (spec §3 "Garbage", §4.4 GC, §5 concurrency
//! "Shared state").
//!
//! Crossing stage boundaries in Rust is ordinarily just an `Arc` moving
//! around — the borrow checker already guarantees a `Snapshot` outlives the
//! `DataRecord`s that point into it, *within one stage*. The problem the
//! spec's Garbage channel solves is that stage boundaries are thread
//! boundaries here: an upstream stage (the Template Manager, owned by the
//! Parser stage) may want to drop its last `Arc` to a superseded `Template`
//! while downstream stages still hold clones of that same `Arc` bound to
//! already-emitted records. As long as those clones exist the value isn't
//! freed — Garbage exists to *order* when the manager's own clone is
//! dropped relative to the messages that reference it, not to manage memory
//! Rust already manages.
//!
//! Each element also carries an optional destructor callback for the
//! non-memory cleanup the spec calls out (closing a lingering socket,
//! logging an eviction) that Rust's `Drop` can't express for a type-erased
//! bundle built one element at a time.

use std::any::Any;

pub struct GarbageItem {
    value: Box<dyn Any + Send + Sync>,
    on_drop: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Drop for GarbageItem {
    fn drop(&mut self) {
        if let Some(cb) = self.on_drop.take() {
            cb();
        }
    }
}

/// A heterogeneous bundle of evicted templates, snapshots, sessions, and
/// buffers (spec §3). Bundles accumulate in a Template Manager (or any
/// other stage) between calls to `take_garbage`, which drains the bundle
/// into a `Garbage` bus message and leaves the producer's bundle empty.
#[derive(Default)]
pub struct Garbage {
    items: Vec<GarbageItem>,
}

impl Garbage {
    pub fn new() -> Self {
        Garbage { items: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn push<T: Any + Send + Sync>(&mut self, value: T) {
        self.items.push(GarbageItem { value: Box::new(value), on_drop: None });
    }

    pub fn push_with_destructor<T: Any + Send + Sync>(&mut self, value: T, on_drop: impl FnOnce() + Send + Sync + 'static) {
        self.items.push(GarbageItem { value: Box::new(value), on_drop: Some(Box::new(on_drop)) });
    }

    /// Merge another bundle's items into this one, e.g. when an
    /// intermediate stage batches several upstream Garbage messages before
    /// forwarding (spec §5: "forwarded far enough downstream to meet
    /// referential safety").
    pub fn extend(&mut self, other: Garbage) {
        self.items.extend(other.items);
    }

    /// Drains the bundle into a standalone `Garbage`, resetting this one to
    /// empty (spec §4.4 `take_garbage`).
    pub fn take(&mut self) -> Garbage {
        Garbage { items: std::mem::take(&mut self.items) }
    }
}
