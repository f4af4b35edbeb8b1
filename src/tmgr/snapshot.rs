//! Template Snapshot (spec §3, §4.4).

use crate::ipfix::template::Template;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// `validity_end` of a snapshot that has not yet been superseded.
pub const OPEN_ENDED: i64 = i64::MAX;

/// Immutable, content-addressable view of all valid templates in one
/// `(Session, ODID, Stream)` namespace at one point in export time.
///
/// `validity_end` is the one mutable field: it starts `OPEN_ENDED` and is
/// closed in place (via an atomic, since `Arc<Snapshot>` clones are already
/// shared across stage threads) when a later definition supersedes this
/// snapshot. Nothing else about a `Snapshot` ever changes after
/// construction — readers that captured a reference keep seeing exactly the
/// templates that were current when they captured it (spec §3).
#[derive(Debug)]
pub struct Snapshot {
    pub templates: HashMap<u16, Arc<Template>>,
    pub validity_start: i64,
    validity_end: AtomicI64,
}

impl Snapshot {
    pub fn new(templates: HashMap<u16, Arc<Template>>, validity_start: i64) -> Self {
        Snapshot { templates, validity_start, validity_end: AtomicI64::new(OPEN_ENDED) }
    }

    pub fn validity_end(&self) -> i64 {
        self.validity_end.load(Ordering::Acquire)
    }

    /// Marks this snapshot superseded as of `at`; idempotent if called more
    /// than once (keeps the earliest close time).
    pub fn close(&self, at: i64) {
        let mut current = self.validity_end.load(Ordering::Acquire);
        while at < current {
            match self.validity_end.compare_exchange(current, at, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn covers(&self, export_time: i64) -> bool {
        export_time >= self.validity_start && export_time < self.validity_end()
    }

    pub fn get(&self, id: u16) -> Option<&Arc<Template>> {
        self.templates.get(&id)
    }

    /// Structural equality of the `template_id -> Template` mapping,
    /// ignoring validity interval — used to decide whether two consecutive
    /// snapshots should be shared rather than duplicated (spec §3).
    pub fn same_content(&self, other: &Snapshot) -> bool {
        self.content_equals(&other.templates)
    }

    pub fn content_equals(&self, other: &HashMap<u16, Arc<Template>>) -> bool {
        if self.templates.len() != other.len() {
            return false;
        }
        self.templates.iter().all(|(id, t)| match other.get(id) {
            Some(o) => t.same_definition(o),
            None => false,
        })
    }
}
