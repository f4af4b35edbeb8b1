//! Output sinks (spec §4.7): the IPFIX file writer and the metrics endpoint.

pub mod metrics;
pub mod prometheus;
pub mod writer;

pub use metrics::Metrics;
pub use writer::Writer;
