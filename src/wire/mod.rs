//! Endian-aware wire codecs for every IPFIX primitive type (spec §4.1).

pub mod codec;
pub mod time;
