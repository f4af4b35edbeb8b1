//! Generic thread loop driving one `Stage` from its inbound bus receiver
//! (spec §5 "one dedicated thread per pipeline stage").
//!
//! Input stages don't use this: they have no upstream bus to read from and
//! instead drive themselves from `get()` inside `input::udp`/`input::tcp`.
//! This driver is for intermediate (parser) and output (writer, metrics)
//! stages, which only ever react to what arrives on the bus.

use crate::bus::{Bus, BusMessage, TerminateKind};
use crate::pipeline::stage::Stage;
use log::{error, warn};
use std::sync::mpsc::Receiver;
use std::sync::Arc;

/// Runs `stage` until a `Terminate` message arrives or `inbound` is
/// disconnected, publishing every message `process` returns onto `out`.
/// `name` is used only for log context, matching the teacher's
/// per-thread `log::info!("{name} ...")` convention.
pub fn run_stage(name: &str, inbound: Receiver<Arc<BusMessage>>, out: &Bus, mut stage: impl Stage) {
    if let Err(e) = stage.init() {
        error!("{name}: init failed: {e}, stage will not run");
        return;
    }

    loop {
        let msg = match inbound.recv() {
            Ok(msg) => msg,
            Err(_) => {
                warn!("{name}: upstream disconnected, shutting down");
                break;
            }
        };

        if let BusMessage::SessionEvent(session, crate::bus::message::SessionEventKind::Close) = msg.as_ref() {
            stage.session_close(session.as_ref());
        }

        let is_terminate = msg.is_terminate();

        match stage.process(&msg) {
            Ok(outputs) => {
                for out_msg in outputs {
                    out.publish(out_msg);
                }
            }
            Err(e) => {
                error!("{name}: stage error: {e}");
                out.terminate_all(TerminateKind::Fatal);
                break;
            }
        }

        if is_terminate {
            break;
        }
    }

    stage.destroy();
}
