//! NetFlow v5/v9 → IPFIX converters (spec §4.3).

pub mod v5;
pub mod v9;

pub use v5::V5Converter;
pub use v9::V9Converter;
