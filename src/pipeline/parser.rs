//! Parser stage (spec §4.5, §4.6): binds each `(Session, ODID, Stream)`
//! namespace to its own `TemplateManager` and `SeqTracker`, turning a raw
//! `Ipfix` message from an input stage into one with resolved `sets`/
//! `records`, and forwards it downstream. A parse failure on a reliable
//! transport requests `close_session` via the feedback edge (spec §7); on
//! UDP it is logged and the message is dropped.

use crate::bus::{BusMessage, FeedbackSender};
use crate::config::TemplateManagerConfig;
use crate::error::Result;
use crate::ie::{DefaultIeManager, IeManager};
use crate::ipfix::message::Message as IpfixMessage;
use crate::ipfix::parser::{parse_message, SeqTracker};
use crate::ipfix::record::ExtensionDecl;
use crate::pipeline::Stage;
use crate::session::Session;
use crate::tmgr::TemplateManager;
use log::warn;
use std::collections::HashMap;
use std::sync::Arc;

struct Namespace {
    tmgr: TemplateManager,
    seq: SeqTracker,
}

/// Keys a namespace by session identity (not `Arc::ptr_eq`, since the key
/// must be `Hash`/`Eq` for `HashMap`) plus ODID and stream id (spec §3).
type NamespaceKey = (String, u32, u16);

pub struct ParserStage {
    ie_mgr: Arc<dyn IeManager>,
    extensions: Vec<ExtensionDecl>,
    snapshot_timeout_s: u32,
    namespaces: HashMap<NamespaceKey, Namespace>,
    feedback: FeedbackSender,
}

impl ParserStage {
    pub fn new(config: &TemplateManagerConfig, feedback: FeedbackSender) -> Self {
        ParserStage { ie_mgr: Arc::new(DefaultIeManager::default()), extensions: Vec::new(), snapshot_timeout_s: config.snapshot_timeout_s, namespaces: HashMap::new(), feedback }
    }

    /// Registers a producer/consumer scratch-byte extension (spec §4.5
    /// "Extension area"); must be called before the stage starts running.
    pub fn with_extension(mut self, decl: ExtensionDecl) -> Self {
        self.extensions.push(decl);
        self
    }

    fn key_for(session: &Session, odid: u32, stream: u16) -> NamespaceKey {
        (session.ident().to_string(), odid, stream)
    }
}

impl Stage for ParserStage {
    fn process(&mut self, msg: &BusMessage) -> Result<Vec<BusMessage>> {
        let message = match msg {
            BusMessage::Ipfix(m) => m,
            _ => return Ok(Vec::new()),
        };

        let key = Self::key_for(&message.session, message.odid, message.stream);
        let reliable = message.session.is_reliable();
        let snapshot_timeout_s = self.snapshot_timeout_s;
        let ns = self.namespaces.entry(key).or_insert_with(|| Namespace {
            tmgr: TemplateManager::new(reliable, message.session.template_lifetime_s(), message.session.opts_template_lifetime_s(), snapshot_timeout_s),
            seq: SeqTracker::new(),
        });

        let mut parsed = IpfixMessage::new(message.buf.clone(), message.header, message.session.clone(), message.odid, message.stream);
        match parse_message(&mut parsed, &mut ns.tmgr, self.ie_mgr.as_ref(), &self.extensions, &mut ns.seq, reliable) {
            Ok(report) => {
                if report.seq_delta != 0 {
                    warn!("{}: sequence number diverged by {}", message.session, report.seq_delta);
                }
                for id in &report.unknown_template_ids {
                    warn!("{}: unknown template id {} in data set", message.session, id);
                }
                let garbage = ns.tmgr.take_garbage();
                let mut out = vec![BusMessage::Ipfix(parsed)];
                if !garbage.is_empty() {
                    out.push(BusMessage::Garbage(garbage));
                }
                Ok(out)
            }
            Err(e) => {
                if reliable {
                    warn!("{}: {}, closing session", message.session, e);
                    self.feedback.close_session(message.session.clone());
                } else {
                    warn!("{}: malformed message dropped: {}", message.session, e);
                }
                Ok(Vec::new())
            }
        }
    }

    fn session_close(&mut self, session: &Session) {
        self.namespaces.retain(|(ident, _, _), _| ident != session.ident());
    }
}
