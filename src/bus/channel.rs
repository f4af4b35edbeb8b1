//! Bounded inter-stage channels with reference-counted fanout (spec §4.6).
//!
//! Each output's inbound queue is a bounded `mpsc::sync_channel`, giving
//! the "full queue blocks the producer" backpressure spec §5 requires.
//! Fanout to N outputs is expressed by cloning an `Arc<BusMessage>` into
//! each output whose per-output ODID filter accepts the message — `Arc`'s
//! own strong count IS the spec's delivery refcount, and Rust's ordinary
//! drop glue is "the last releaser destroys the payload" with no extra
//! bookkeeping required.

use crate::bus::message::BusMessage;
use crate::session::Session;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::Arc;
use std::time::Duration;

/// Per-output interest filter (spec §4.6 "none / allow-list / deny-list").
#[derive(Debug, Clone)]
pub enum OdidFilter {
    None,
    Allow(Vec<u32>),
    Deny(Vec<u32>),
}

impl OdidFilter {
    fn allows(&self, odid: u32) -> bool {
        match self {
            OdidFilter::None => true,
            OdidFilter::Allow(list) => list.contains(&odid),
            OdidFilter::Deny(list) => !list.contains(&odid),
        }
    }
}

/// One registered subscriber of a `Bus`: a bounded queue plus the filter
/// deciding which `Ipfix` messages it receives.
pub struct Subscriber {
    sender: SyncSender<Arc<BusMessage>>,
    filter: OdidFilter,
}

/// The fanout point feeding one or more downstream stages from a single
/// upstream producer (spec §4.6).
#[derive(Default)]
pub struct Bus {
    subscribers: Vec<Subscriber>,
}

impl Bus {
    pub fn new() -> Self {
        Bus { subscribers: Vec::new() }
    }

    /// Registers a new subscriber with inbound capacity `capacity` and
    /// returns the `Receiver` end to hand to that stage's thread.
    pub fn subscribe(&mut self, capacity: usize, filter: OdidFilter) -> Receiver<Arc<BusMessage>> {
        let (tx, rx) = mpsc::sync_channel(capacity);
        self.subscribers.push(Subscriber { sender: tx, filter });
        rx
    }

    /// Publishes one message to every subscriber whose filter accepts it
    /// (non-`Ipfix` messages always pass). Blocks on a full queue,
    /// providing the backpressure spec §5 requires; a subscriber whose
    /// receiver has been dropped is silently skipped (that stage has
    /// already exited).
    pub fn publish(&self, msg: BusMessage) {
        let msg = Arc::new(msg);
        for sub in &self.subscribers {
            if let Some(odid) = msg.odid() {
                if !sub.filter.allows(odid) {
                    continue;
                }
            }
            let _ = sub.sender.send(msg.clone());
        }
    }

    /// Broadcasts `Terminate` to every subscriber, used for ordered
    /// shutdown (spec §5 "Cancellation").
    pub fn terminate_all(&self, kind: crate::bus::message::TerminateKind) {
        self.publish(BusMessage::Terminate(kind));
    }
}

/// A downstream-to-upstream request to close a session (spec §4.6 "the
/// feedback edge"). Separate from the main bus because it flows the
/// opposite direction.
pub enum FeedbackMsg {
    CloseSession(Arc<Session>),
}

pub struct FeedbackQueue {
    sender: SyncSender<FeedbackMsg>,
    receiver: Receiver<FeedbackMsg>,
}

impl FeedbackQueue {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::sync_channel(capacity);
        FeedbackQueue { sender, receiver }
    }

    pub fn sender(&self) -> FeedbackSender {
        FeedbackSender { sender: self.sender.clone() }
    }

    /// Non-blocking drain used by the input stage at each get-iteration
    /// (spec §4.2 "the input observes and acts at the next get-iteration").
    pub fn try_recv_all(&self) -> Vec<FeedbackMsg> {
        let mut out = Vec::new();
        loop {
            match self.receiver.recv_timeout(Duration::from_millis(0)) {
                Ok(msg) => out.push(msg),
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        out
    }
}

#[derive(Clone)]
pub struct FeedbackSender {
    sender: SyncSender<FeedbackMsg>,
}

impl FeedbackSender {
    pub fn close_session(&self, session: Arc<Session>) {
        match self.sender.try_send(FeedbackMsg::CloseSession(session)) {
            Ok(()) | Err(TrySendError::Full(_)) => {}
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddr};

    fn net() -> crate::session::NetTuple {
        crate::session::NetTuple::new(SocketAddr::new(Ipv4Addr::new(1, 1, 1, 1).into(), 1), SocketAddr::new(Ipv4Addr::new(2, 2, 2, 2).into(), 2))
    }

    fn ipfix_message(odid: u32) -> crate::ipfix::Message {
        let header = crate::ipfix::Header { version: crate::ipfix::header::VERSION, length: crate::ipfix::Header::SIZE as u16, export_time: 0, seq_number: 0, domain_id: odid };
        let session = Arc::new(Session::new_udp(net(), 0, 0));
        crate::ipfix::Message::new(vec![0u8; crate::ipfix::Header::SIZE], header, session, odid, 0)
    }

    #[test]
    fn non_ipfix_messages_always_pass_every_filter() {
        let mut bus = Bus::new();
        let allow = bus.subscribe(4, OdidFilter::Allow(vec![5]));
        let deny = bus.subscribe(4, OdidFilter::Deny(vec![5]));
        let session = Arc::new(Session::new_udp(net(), 0, 0));
        bus.publish(BusMessage::SessionEvent(session.clone(), crate::bus::message::SessionEventKind::Open));
        assert!(allow.try_recv().is_ok());
        assert!(deny.try_recv().is_ok());
    }

    #[test]
    fn odid_filter_skips_disallowed_ipfix_messages() {
        let mut bus = Bus::new();
        let allow = bus.subscribe(4, OdidFilter::Allow(vec![5]));
        let deny = bus.subscribe(4, OdidFilter::Deny(vec![5]));
        bus.publish(BusMessage::Ipfix(ipfix_message(5)));
        assert!(allow.try_recv().is_ok());
        assert!(deny.try_recv().is_err());
    }

    #[test]
    fn feedback_queue_round_trips() {
        let fb = FeedbackQueue::new(4);
        let session = Arc::new(Session::new_tcp(net()));
        fb.sender().close_session(session.clone());
        let drained = fb.try_recv_all();
        assert_eq!(drained.len(), 1);
    }
}
