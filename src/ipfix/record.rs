//! Data Record (spec §3, §4.5): a byte range plus the Template and Snapshot
//! it was decoded under, plus a fixed-size extension area reserved by
//! downstream stages for per-record scratch data.

use crate::ipfix::template::Template;
use crate::tmgr::Snapshot;
use std::sync::Arc;

/// Producer/consumer keyed per-record scratch slot (spec §4.5 "Extension
/// area"). Registered once at pipeline build time; the parser reserves
/// `size` bytes per record for each declared extension.
#[derive(Debug, Clone)]
pub struct ExtensionDecl {
    pub name: &'static str,
    pub size: usize,
}

/// Byte range plus template/snapshot binding for one Data Record, decoded
/// from a Data Set whose Template ID matched a currently-known Template.
/// `template` is `None` when the Template ID was unresolved at parse time
/// (spec §4.5 "unknown Template ID is recorded but not fatal"); the raw
/// bytes are still preserved in the owning message's Data Set range so a
/// writer can still choose to emit the set verbatim.
#[derive(Debug, Clone)]
pub struct DataRecord {
    /// Byte offset of this record within the owning IPFIX Message's buffer.
    pub offset: usize,
    pub length: usize,
    /// Set ID of the Data Set this record came from — equal to the
    /// Template ID for a resolved record, but also kept for unresolved
    /// records so a writer can still regroup and re-frame the original
    /// Data Set it belonged to.
    pub set_id: u16,
    pub template: Option<Arc<Template>>,
    pub snapshot: Arc<Snapshot>,
    /// Scratch bytes for intermediate-stage extensions, laid out in
    /// declaration order; empty when no extensions were registered.
    pub extensions: Vec<u8>,
}

impl DataRecord {
    pub fn new(offset: usize, length: usize, set_id: u16, template: Option<Arc<Template>>, snapshot: Arc<Snapshot>, extension_bytes: usize) -> Self {
        DataRecord { offset, length, set_id, template, snapshot, extensions: vec![0u8; extension_bytes] }
    }

    pub fn is_resolved(&self) -> bool {
        self.template.is_some()
    }

    pub fn bytes<'a>(&self, message: &'a [u8]) -> &'a [u8] {
        &message[self.offset..self.offset + self.length]
    }
}
