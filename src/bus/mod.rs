//! Inter-stage pipeline bus (spec §4.6).

pub mod channel;
pub mod message;

pub use channel::{Bus, FeedbackMsg, FeedbackQueue, FeedbackSender, OdidFilter};
pub use message::{BusMessage, SessionEventKind, TerminateKind};
