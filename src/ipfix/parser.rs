//! IPFIX Parser (spec §4.5): iterates Sets in a `Message`, binds Template
//! and Options Template Sets to a `TemplateManager`, and resolves Data Sets
//! into `DataRecord`s.

use crate::error::{Error, Result};
use crate::ie::IeManager;
use crate::ipfix::header::SetHeader;
use crate::ipfix::message::{Message, SetSpan};
use crate::ipfix::record::{DataRecord, ExtensionDecl};
use crate::ipfix::template::{read_template_record, OptionsTemplateKind, Template, TemplateKind};
use crate::tmgr::TemplateManager;
use log::warn;

/// Per `(session, odid, stream)` sequence-number tracker (spec §4.5
/// "Sequence-number validation").
#[derive(Debug, Default)]
pub struct SeqTracker {
    expected: Option<u32>,
}

impl SeqTracker {
    pub fn new() -> Self {
        SeqTracker { expected: None }
    }

    /// Returns the signed delta between the observed sequence number and
    /// what was expected (0 if this is the first message seen).
    pub fn observe(&mut self, observed: u32) -> i64 {
        let delta = match self.expected {
            Some(exp) => observed.wrapping_sub(exp) as i32 as i64,
            None => 0,
        };
        self.expected = Some(observed.wrapping_add(1));
        delta
    }

    /// Reconciles the expected counter after records are dropped from an
    /// outgoing message without having been received, e.g. an unknown
    /// Template ID omitted by the writer (spec §8 scenario 5: "seq_num is
    /// decremented by its record count").
    pub fn decrement_expected(&mut self, by: u32) {
        if let Some(exp) = self.expected {
            self.expected = Some(exp.wrapping_sub(by));
        }
    }
}

#[derive(Debug, Default)]
pub struct ParseReport {
    pub templates_added: u32,
    pub templates_withdrawn: u32,
    pub unknown_template_ids: Vec<u16>,
    pub seq_delta: i64,
}

fn resolve_fields(template: &mut Template, ie_mgr: &dyn IeManager) {
    for field in template.fields.iter_mut() {
        field.ie = ie_mgr.lookup(field.pen, field.id);
    }
}

fn read_records_of_set(set_buf: &[u8], kind: TemplateKind, reliable: bool) -> Result<Vec<(Template, usize)>> {
    let mut out = Vec::new();
    let mut offset = 0;
    while offset < set_buf.len() {
        match read_template_record(&set_buf[offset..], kind) {
            Ok((t, consumed)) => {
                out.push((t, offset));
                offset += consumed;
            }
            Err(e) => {
                if reliable {
                    return Err(e);
                }
                warn!("skipping malformed template record: {}", e);
                break;
            }
        }
    }
    Ok(out)
}

/// Applies every Template/Options Template record in a Template Set to
/// `tmgr`, in place. On a reliable transport a malformed record aborts the
/// whole message (the caller closes the session); on UDP the rest of the
/// set is skipped but already-applied records stand.
fn process_template_set(set_buf: &[u8], kind: TemplateKind, tmgr: &mut TemplateManager, ie_mgr: &dyn IeManager, reliable: bool, report: &mut ParseReport) -> Result<()> {
    let records = read_records_of_set(set_buf, kind, reliable)?;
    for (mut template, _) in records {
        if template.is_withdrawal() {
            // RFC 7011 §8.1: template id 2 in a Template Set (3 in an Options
            // Template Set) with zero fields is the withdraw-all sentinel,
            // not a literal withdrawal of that id (2/3 are reserved Set IDs,
            // never valid Template IDs).
            let withdraw_all = (kind == TemplateKind::Regular && template.id == 2) || (kind == TemplateKind::Options && template.id == 3);
            let result = if withdraw_all { tmgr.withdraw_all(Some(kind)) } else { tmgr.withdraw(template.id, kind) };
            match result {
                Ok(()) => report.templates_withdrawn += 1,
                Err(e) if !reliable => warn!("ignoring withdrawal on unreliable transport: {}", e),
                Err(e) => return Err(e),
            }
            continue;
        }
        resolve_fields(&mut template, ie_mgr);
        let id = template.id;
        tmgr.add(template)?;
        report.templates_added += 1;
        if kind == TemplateKind::Options {
            if let Some(t) = tmgr.get(id) {
                if t.options_kind == Some(OptionsTemplateKind::FlowKeys) {
                    // the bitmap itself lives in this Options Template's
                    // Data Records, applied when that Data Set is parsed.
                }
            }
        }
    }
    Ok(())
}

/// Scans a FlowKeys Options Template's Data Set and feeds each
/// `(templateId, flowKeyIndicator)` row back into the manager (spec §4.5
/// "feed FlowKeys templates back into the manager as flow-key
/// annotations").
fn apply_flow_key_records(buf: &[u8], set: SetSpan, opts_template: &Template, tmgr: &mut TemplateManager) {
    let scope_fields = &opts_template.fields[..opts_template.scope_field_count as usize];
    let body_fields = &opts_template.fields[opts_template.scope_field_count as usize..];
    let template_id_field = scope_fields.iter().find(|f| f.pen == 0 && f.id == 145);
    let indicator_field = body_fields.iter().find(|f| f.pen == 0 && f.id == 173);
    let (Some(tid_field), Some(ind_field)) = (template_id_field, indicator_field) else { return };
    let (Some(record_size), Some(tid_off), Some(ind_off)) = (opts_template.fixed_record_size, tid_field.offset, ind_field.offset) else { return };
    if record_size == 0 {
        return;
    }
    let content_start = set.offset + SetHeader::SIZE;
    let content_end = set.offset + set.length;
    let mut offset = content_start;
    while offset + record_size <= content_end {
        let tid_bytes = &buf[offset + tid_off..offset + tid_off + tid_field.length as usize];
        let ind_bytes = &buf[offset + ind_off..offset + ind_off + ind_field.length as usize];
        let template_id = be_uint(tid_bytes) as u16;
        let bitmap = be_uint(ind_bytes);
        let _ = tmgr.annotate_flow_keys(template_id, bitmap);
        offset += record_size;
    }
}

fn be_uint(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0u64, |acc, &b| (acc << 8) | b as u64)
}

/// Parses every Set in `msg`, mutating `tmgr` for Template/Options Template
/// Sets and populating `msg.sets`/`msg.records` for Data Sets.
pub fn parse_message(msg: &mut Message, tmgr: &mut TemplateManager, ie_mgr: &dyn IeManager, extensions: &[ExtensionDecl], seq: &mut SeqTracker, reliable: bool) -> Result<ParseReport> {
    tmgr.set_time(msg.export_time())?;
    let mut report = ParseReport { seq_delta: seq.observe(msg.seq_number()), ..Default::default() };

    let ext_bytes: usize = extensions.iter().map(|e| e.size).sum();
    let body = &msg.buf[..];
    let mut offset = crate::ipfix::header::Header::SIZE;
    let mut sets = Vec::new();
    let mut pending_data_sets: Vec<SetSpan> = Vec::new();

    while offset + SetHeader::SIZE <= body.len() {
        let header = SetHeader::read(&body[offset..])?;
        if offset + header.length as usize > body.len() {
            return Err(Error::Format(format!("set {} length {} overruns message", header.id, header.length)));
        }
        let span = SetSpan { id: header.id, offset, length: header.length as usize };
        let content = &body[offset + SetHeader::SIZE..offset + header.length as usize];

        if span.is_template_set() {
            process_template_set(content, TemplateKind::Regular, tmgr, ie_mgr, reliable, &mut report)?;
        } else if span.is_options_template_set() {
            process_template_set(content, TemplateKind::Options, tmgr, ie_mgr, reliable, &mut report)?;
        } else if span.is_data_set() {
            pending_data_sets.push(span);
        } else {
            return Err(Error::Format(format!("reserved set id {} used", header.id)));
        }

        sets.push(span);
        offset += header.length as usize;
    }

    let mut records = Vec::new();
    for span in pending_data_sets {
        let snapshot = tmgr.snapshot();
        let template = match tmgr.get(span.id) {
            Some(t) => t,
            None => {
                report.unknown_template_ids.push(span.id);
                let content_start = span.offset + SetHeader::SIZE;
                let content_len = span.length - SetHeader::SIZE;
                records.push(DataRecord::new(content_start, content_len, span.id, None, snapshot, ext_bytes));
                continue;
            }
        };

        if template.options_kind == Some(OptionsTemplateKind::FlowKeys) {
            apply_flow_key_records(body, span, &template, tmgr);
        }

        if let Some(record_size) = template.fixed_record_size {
            if record_size == 0 {
                continue;
            }
            let content_start = span.offset + SetHeader::SIZE;
            let content_end = span.offset + span.length;
            let mut rec_offset = content_start;
            while rec_offset + record_size <= content_end {
                records.push(DataRecord::new(rec_offset, record_size, span.id, Some(template.clone()), snapshot.clone(), ext_bytes));
                rec_offset += record_size;
            }
        } else {
            // variable-length records: not decomposed into individual
            // records here, preserved as one opaque span so a writer can
            // still re-emit the Data Set verbatim (spec §4.5).
            let content_start = span.offset + SetHeader::SIZE;
            let content_len = span.length - SetHeader::SIZE;
            records.push(DataRecord::new(content_start, content_len, span.id, Some(template.clone()), snapshot.clone(), ext_bytes));
        }
    }

    msg.sets = sets;
    msg.records = records;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipfix::header::Header;
    use crate::ipfix::message::Message;
    use crate::session::{NetTuple, Session};
    use std::net::{Ipv4Addr, SocketAddr};
    use std::sync::Arc;

    fn net() -> NetTuple {
        NetTuple::new(SocketAddr::new(Ipv4Addr::new(1, 1, 1, 1).into(), 1), SocketAddr::new(Ipv4Addr::new(2, 2, 2, 2).into(), 2))
    }

    fn build_message(export_time: u32, seq: u32, sets: &[u8]) -> Message {
        let mut buf = vec![0u8; Header::SIZE];
        let header = Header { version: crate::ipfix::header::VERSION, length: (Header::SIZE + sets.len()) as u16, export_time, seq_number: seq, domain_id: 0 };
        header.write(&mut buf).unwrap();
        buf.extend_from_slice(sets);
        let session = Arc::new(Session::new_udp(net(), 0, 0));
        Message::new(buf, header, session, 0, 0)
    }

    fn template_set(id: u16, fields: &[(u16, u16)]) -> Vec<u8> {
        let mut content = vec![];
        content.extend_from_slice(&id.to_be_bytes());
        content.extend_from_slice(&(fields.len() as u16).to_be_bytes());
        for (fid, len) in fields {
            content.extend_from_slice(&fid.to_be_bytes());
            content.extend_from_slice(&len.to_be_bytes());
        }
        let mut set = vec![];
        set.extend_from_slice(&SetHeader::TEMPLATE_SET_ID.to_be_bytes());
        set.extend_from_slice(&((SetHeader::SIZE + content.len()) as u16).to_be_bytes());
        set.extend_from_slice(&content);
        set
    }

    fn data_set(id: u16, record_bytes: &[u8]) -> Vec<u8> {
        let mut set = vec![];
        set.extend_from_slice(&id.to_be_bytes());
        set.extend_from_slice(&((SetHeader::SIZE + record_bytes.len()) as u16).to_be_bytes());
        set.extend_from_slice(record_bytes);
        set
    }

    #[test]
    fn template_set_installs_template_and_data_set_resolves() {
        let mut tset = template_set(300, &[(1, 4), (2, 4)]);
        let dset = data_set(300, &[0, 0, 0, 1, 0, 0, 0, 2]);
        tset.extend_from_slice(&dset);
        let mut msg = build_message(1000, 1, &tset);
        let mut tmgr = TemplateManager::new(false, Some(0), None, 5);
        let ie_mgr = crate::ie::DefaultIeManager::default();
        let mut seq = SeqTracker::new();
        let report = parse_message(&mut msg, &mut tmgr, &ie_mgr, &[], &mut seq, false).unwrap();
        assert_eq!(report.templates_added, 1);
        assert_eq!(msg.records.len(), 1);
        assert!(msg.records[0].is_resolved());
    }

    #[test]
    fn unknown_template_id_is_recorded_not_fatal() {
        let dset = data_set(300, &[0, 0, 0, 1]);
        let mut msg = build_message(1000, 1, &dset);
        let mut tmgr = TemplateManager::new(false, Some(0), None, 5);
        let ie_mgr = crate::ie::DefaultIeManager::default();
        let mut seq = SeqTracker::new();
        let report = parse_message(&mut msg, &mut tmgr, &ie_mgr, &[], &mut seq, false).unwrap();
        assert_eq!(report.unknown_template_ids, vec![300]);
        assert_eq!(msg.records.len(), 1);
        assert!(!msg.records[0].is_resolved());
        assert_eq!(msg.records[0].set_id, 300);
    }

    #[test]
    fn sequence_tracker_reports_delta() {
        let mut seq = SeqTracker::new();
        assert_eq!(seq.observe(10), 0);
        assert_eq!(seq.observe(11), 0);
        assert_eq!(seq.observe(20), 8);
    }

    #[test]
    fn malformed_template_on_reliable_transport_is_fatal() {
        let mut bad = vec![];
        bad.extend_from_slice(&SetHeader::TEMPLATE_SET_ID.to_be_bytes());
        bad.extend_from_slice(&6u16.to_be_bytes());
        bad.extend_from_slice(&[0x01, 0x2c]); // truncated template header
        let mut msg = build_message(1000, 1, &bad);
        let mut tmgr = TemplateManager::new(true, None, None, 5);
        let ie_mgr = crate::ie::DefaultIeManager::default();
        let mut seq = SeqTracker::new();
        assert!(parse_message(&mut msg, &mut tmgr, &ie_mgr, &[], &mut seq, true).is_err());
    }
}
