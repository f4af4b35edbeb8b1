//! Capability-set pipeline stage trait (spec §9 "Dynamic dispatch across
//! plugin kinds ... is represented as a capability-set trait: each
//! instance implements a subset of `{init, destroy, get, process,
//! session_close}`; the pipeline driver calls only the supported ones. No
//! RTTI, no inheritance.").
//!
//! Input stages drive themselves from `get()` in their own thread loop
//! (see `input::udp`/`input::tcp`, which predate the bus and have no
//! upstream to `process()` for); intermediate and output stages implement
//! `process()` and are driven generically by `pipeline::driver`.

use crate::bus::BusMessage;
use crate::error::Result;
use crate::session::Session;

pub trait Stage: Send {
    /// One-time setup before the stage's thread enters its loop.
    fn init(&mut self) -> Result<()> {
        Ok(())
    }

    /// Run on `Terminate`, after the loop exits: flush outputs, close
    /// sockets, drop resources.
    fn destroy(&mut self) {}

    /// Transforms one inbound message into zero or more outbound ones.
    /// Takes `msg` by reference because the bus fans a single `Arc` out to
    /// every accepting subscriber (see `bus::Bus::publish`) — a stage never
    /// owns an exclusive copy to consume. The default has no owned variant
    /// to hand onward, so it does nothing; `BusMessage` is not `Clone`
    /// because `Garbage`'s destructors must run exactly once, so a stage
    /// that wants to forward a message builds a fresh one of its own.
    fn process(&mut self, _msg: &BusMessage) -> Result<Vec<BusMessage>> {
        Ok(Vec::new())
    }

    /// Called for every `SessionClose` this stage observes, so it can
    /// release per-session state (e.g. the writer's per-ODID ownership).
    fn session_close(&mut self, _session: &Session) {}
}
