//! IPFIX/NetFlow v5/v9 flow-record collector: a staged pipeline of pluggable
//! components ingesting over UDP and TCP/SCTP, parsing against dynamically
//! advertised templates, and writing out a canonical IPFIX file stream.

pub mod bus;
pub mod config;
pub mod error;
pub mod garbage;
pub mod ie;
pub mod input;
pub mod ipfix;
pub mod netflow;
pub mod output;
pub mod pipeline;
pub mod session;
pub mod tmgr;
pub mod wire;

pub use error::{Error, Result};
