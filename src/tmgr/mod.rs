//! Per-namespace Template Manager (spec §4.4).

pub mod manager;
pub mod snapshot;

pub use manager::TemplateManager;
pub use snapshot::Snapshot;
