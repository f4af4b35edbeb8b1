//! Pipeline bus message types (spec §4.6): a tagged union with
//! per-variant ownership matching the teacher's `mpsc::channel`-based
//! wiring in `main.rs`, generalized from a single `Box<dyn Flow>` payload
//! to the full set of inter-stage events this collector needs.

use crate::garbage::Garbage;
use crate::ipfix::Message as IpfixMessage;
use crate::session::Session;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEventKind {
    Open,
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateKind {
    /// Orderly shutdown requested by the operator.
    Shutdown,
    /// A downstream stage hit an unrecoverable error (spec §7 "allocation
    /// failure in an intermediate/output stage -> pipeline shuts down").
    Fatal,
}

/// One tagged bus message. `Ipfix` owns its buffer; `SessionEvent` shares
/// the `Session` by `Arc` (its lifetime already outlives the event per
/// spec §5); `Garbage` owns a bundle of deferred destructions; `Terminate`
/// is unit-like and carries only its reason.
pub enum BusMessage {
    Ipfix(IpfixMessage),
    SessionEvent(Arc<Session>, SessionEventKind),
    Garbage(Garbage),
    Periodic { seq: u64, created_ts: i64, last_processed_ts: i64 },
    Terminate(TerminateKind),
}

impl BusMessage {
    pub fn is_ipfix(&self) -> bool {
        matches!(self, BusMessage::Ipfix(_))
    }

    pub fn is_terminate(&self) -> bool {
        matches!(self, BusMessage::Terminate(_))
    }

    /// ODID of the carried IPFIX message, used by the fanout filter (spec
    /// §4.6 "a per-output ODID filter ... skips Ipfix messages not of
    /// interest to that output"). `None` for every other variant, which
    /// filters never drop.
    pub fn odid(&self) -> Option<u32> {
        match self {
            BusMessage::Ipfix(msg) => Some(msg.odid),
            _ => None,
        }
    }
}
