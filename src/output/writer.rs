//! IPFIX file writer (spec §4.7): the canonical output sink, producing a
//! stream of IPFIX files with its own per-ODID template-emission and
//! sequence-number bookkeeping, independent of whatever the source
//! exporter originally sent.

use crate::bus::BusMessage;
use crate::config::WriterConfig;
use crate::error::{Error, Result};
use crate::ipfix::header::{Header as IpfixHeader, SetHeader};
use crate::ipfix::message::Message as IpfixMessage;
use crate::ipfix::template::{write_template_record, Template, TemplateKind};
use crate::output::metrics::Metrics;
use crate::pipeline::Stage;
use crate::session::Session;
use chrono::{DateTime, Local, TimeZone, Utc};
use log::{info, warn};
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// RFC 7011 has no hard message-size limit, but most exporters and this
/// writer both target "fits in one unfragmented packet" (spec §4.7
/// "Templates are emitted in batches bounded by a 1400-byte ... limit").
const MAX_TEMPLATE_MESSAGE_SIZE: usize = 1400;

struct OdidState {
    owner: Arc<Session>,
    emitted_templates: HashSet<u16>,
    warned_collision: bool,
    next_seq: u32,
}

struct OpenFile {
    handle: File,
    path: PathBuf,
    window_start: i64,
}

pub struct Writer {
    config: WriterConfig,
    file: Option<OpenFile>,
    odids: HashMap<u32, OdidState>,
    metrics: Option<Arc<Metrics>>,
}

impl Writer {
    pub fn new(config: WriterConfig) -> Self {
        Writer { config, file: None, odids: HashMap::new(), metrics: None }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn window_start(&self, t: i64) -> i64 {
        if self.config.window_size_s == 0 {
            return 0;
        }
        if self.config.align_windows {
            t - t.rem_euclid(self.config.window_size_s as i64)
        } else {
            t
        }
    }

    fn wall_clock_secs() -> i64 {
        SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
    }

    fn filename_for(&self, t: i64) -> String {
        let utc = match Utc.timestamp_opt(t, 0) {
            chrono::LocalResult::Single(dt) => dt,
            _ => Utc.timestamp_opt(0, 0).unwrap(),
        };
        if self.config.use_local_time {
            let local: DateTime<Local> = DateTime::from(utc);
            local.format(&self.config.filename_pattern).to_string()
        } else {
            utc.format(&self.config.filename_pattern).to_string()
        }
    }

    /// Rotates the output file if the current window has elapsed (spec
    /// §4.7 step 1), clearing every ODID's "templates emitted" set so they
    /// get re-synthesized at the top of the new file.
    fn ensure_file(&mut self, message_export_time: i64) -> Result<()> {
        let clock_time = if self.config.rotate_on_export_time { message_export_time } else { Self::wall_clock_secs() };
        let window = self.window_start(clock_time);
        let due = match &self.file {
            None => true,
            Some(f) => self.config.window_size_s != 0 && window != f.window_start,
        };
        if !due {
            return Ok(());
        }
        if let Some(old) = self.file.take() {
            info!("rotated output file {}", old.path.display());
        }
        let path = PathBuf::from(self.filename_for(clock_time));
        let handle = File::create(&path).map_err(|e| Error::Denied(format!("cannot open output file {}: {}", path.display(), e)))?;
        info!("opened output file {}", path.display());
        self.file = Some(OpenFile { handle, path, window_start: window });
        for state in self.odids.values_mut() {
            state.emitted_templates.clear();
        }
        Ok(())
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let file = self.file.as_mut().ok_or_else(|| Error::Denied("no output file open".into()))?;
        file.handle.write_all(bytes).map_err(|e| Error::Denied(format!("write to output file failed: {}", e)))
    }

    /// Templates carry the ODID's current running sequence number but never
    /// advance it: per the canonical writer this is modeled on, "templates
    /// don't increase sequence numbers" (they contain no Data Records).
    fn flush_template_batch(&mut self, odid: u32, export_time: i64, seq: u32, batch: &mut Vec<u8>) -> Result<()> {
        let total = IpfixHeader::SIZE + batch.len();
        let header = IpfixHeader { version: crate::ipfix::header::VERSION, length: total as u16, export_time: export_time as u32, seq_number: seq, domain_id: odid };
        let mut out = vec![0u8; IpfixHeader::SIZE];
        header.write(&mut out)?;
        out.extend_from_slice(batch);
        self.write_bytes(&out)?;
        batch.clear();
        Ok(())
    }

    /// Synthesizes Template Sets for every not-yet-emitted template in
    /// `templates`, batched under the 1400-byte limit (spec §4.7 step 3).
    fn emit_templates(&mut self, odid: u32, export_time: i64, templates: Vec<Arc<Template>>) -> Result<()> {
        if templates.is_empty() {
            return Ok(());
        }
        let seq = self.odids.get(&odid).map(|s| s.next_seq).unwrap_or(0);
        let mut batch = Vec::new();
        let mut written_ids = Vec::new();

        for template in &templates {
            let mut buf = vec![0u8; 1024];
            let n = match write_template_record(&mut buf, template) {
                Ok(n) => n,
                Err(e) => {
                    warn!("failed to encode template {} for output: {}", template.id, e);
                    continue;
                }
            };
            buf.truncate(n);
            let set_id = match template.kind {
                TemplateKind::Regular => SetHeader::TEMPLATE_SET_ID,
                TemplateKind::Options => SetHeader::OPTIONS_TEMPLATE_SET_ID,
            };
            let mut set = vec![0u8; SetHeader::SIZE];
            SetHeader { id: set_id, length: (SetHeader::SIZE + buf.len()) as u16 }.write(&mut set)?;
            set.extend_from_slice(&buf);

            if IpfixHeader::SIZE + set.len() > MAX_TEMPLATE_MESSAGE_SIZE {
                warn!("template {} alone exceeds the {}-byte message limit, skipped", template.id, MAX_TEMPLATE_MESSAGE_SIZE);
                continue;
            }
            if IpfixHeader::SIZE + batch.len() + set.len() > MAX_TEMPLATE_MESSAGE_SIZE {
                self.flush_template_batch(odid, export_time, seq, &mut batch)?;
            }
            batch.extend_from_slice(&set);
            written_ids.push(template.id);
        }
        if !batch.is_empty() {
            self.flush_template_batch(odid, export_time, seq, &mut batch)?;
        }
        if let Some(state) = self.odids.get_mut(&odid) {
            state.emitted_templates.extend(written_ids);
        }
        Ok(())
    }
}

/// Reconstructs Data Sets from a message's resolved/unresolved records
/// (spec §4.7 step 4). Returns the concatenated Set bytes, the count of
/// records dropped because `preserve_original` is false and their Template
/// was unknown, and the total count of unresolved records seen (dropped or
/// not).
fn build_data_message(message: &IpfixMessage, preserve_original: bool) -> (Vec<u8>, u32, u32) {
    let mut sets = Vec::new();
    let mut dropped = 0u32;
    let mut unresolved = 0u32;
    let mut i = 0;
    while i < message.records.len() {
        let set_id = message.records[i].set_id;
        let mut content = Vec::new();
        let mut any_kept = false;
        let mut j = i;
        while j < message.records.len() && message.records[j].set_id == set_id {
            let rec = &message.records[j];
            if rec.is_resolved() {
                content.extend_from_slice(rec.bytes(&message.buf));
                any_kept = true;
            } else {
                unresolved += 1;
                if preserve_original {
                    content.extend_from_slice(rec.bytes(&message.buf));
                    any_kept = true;
                } else {
                    dropped += 1;
                }
            }
            j += 1;
        }
        if any_kept {
            let mut set = vec![0u8; SetHeader::SIZE];
            let set_header = SetHeader { id: set_id, length: (SetHeader::SIZE + content.len()) as u16 };
            if set_header.write(&mut set).is_ok() {
                set.extend_from_slice(&content);
                sets.extend_from_slice(&set);
            }
        }
        i = j;
    }
    (sets, dropped, unresolved)
}

impl Stage for Writer {
    fn process(&mut self, msg: &BusMessage) -> Result<Vec<BusMessage>> {
        let message = match msg {
            BusMessage::Ipfix(message) => message,
            _ => return Ok(Vec::new()),
        };

        self.ensure_file(message.export_time())?;
        let odid = message.odid;
        // Seed the running counter from this ODID's first message so the
        // output stream starts in step with the exporter, then the writer
        // owns it: later messages never recompute from the exporter's own
        // SN, since dropped records make that number meaningless (spec
        // §4.7 step 5).
        self.odids.entry(odid).or_insert_with(|| OdidState { owner: message.session.clone(), emitted_templates: HashSet::new(), warned_collision: false, next_seq: message.header.seq_number });

        let owner_matches = self.odids.get(&odid).map(|s| Arc::ptr_eq(&s.owner, &message.session)).unwrap_or(true);
        if !owner_matches {
            if let Some(state) = self.odids.get_mut(&odid) {
                if !state.warned_collision {
                    warn!("odid {} is already owned by {}, dropping messages from {} until it disconnects", odid, state.owner, message.session);
                    state.warned_collision = true;
                }
            }
            return Ok(Vec::new());
        }

        if let Some(m) = &self.metrics {
            Metrics::inc(&m.messages_in);
        }

        let missing: Vec<Arc<Template>> = {
            let state = self.odids.get(&odid).unwrap();
            let mut seen = HashSet::new();
            message.records.iter().filter_map(|r| r.template.clone()).filter(|t| !state.emitted_templates.contains(&t.id) && seen.insert(t.id)).collect()
        };
        let n_templates = missing.len() as u64;
        self.emit_templates(odid, message.export_time(), missing)?;
        if let Some(m) = &self.metrics {
            Metrics::add(&m.templates_emitted, n_templates);
        }

        let (set_bytes, dropped, unresolved) = build_data_message(message, self.config.preserve_original);
        if let Some(m) = &self.metrics {
            if unresolved > 0 {
                Metrics::add(&m.unknown_template_ids, unresolved as u64);
            }
        }
        if !set_bytes.is_empty() {
            let total = IpfixHeader::SIZE + set_bytes.len();
            let seq_number = self.odids.get(&odid).map(|s| s.next_seq).unwrap_or(0);
            let header = IpfixHeader { version: crate::ipfix::header::VERSION, length: total as u16, export_time: message.header.export_time, seq_number, domain_id: odid };
            let mut out = vec![0u8; IpfixHeader::SIZE];
            header.write(&mut out)?;
            out.extend_from_slice(&set_bytes);
            self.write_bytes(&out)?;
            let written = (message.records.len() as u32).saturating_sub(dropped);
            if let Some(state) = self.odids.get_mut(&odid) {
                state.next_seq = state.next_seq.wrapping_add(written);
            }
            if let Some(m) = &self.metrics {
                Metrics::inc(&m.messages_written);
                Metrics::add(&m.bytes_written, out.len() as u64);
                Metrics::add(&m.records_written, written as u64);
            }
        }
        if dropped > 0 {
            if let Some(m) = &self.metrics {
                Metrics::add(&m.records_dropped, dropped as u64);
            }
        }
        Ok(Vec::new())
    }

    fn session_close(&mut self, session: &Session) {
        self.odids.retain(|_, state| *state.owner != *session);
        if let Some(m) = &self.metrics {
            Metrics::inc(&m.sessions_closed);
        }
    }

    fn destroy(&mut self) {
        if let Some(file) = &mut self.file {
            let _ = file.handle.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipfix::template::FieldSpec;
    use crate::ipfix::record::DataRecord;
    use crate::session::NetTuple;
    use crate::tmgr::Snapshot;
    use std::collections::HashMap as StdHashMap;
    use std::net::{Ipv4Addr, SocketAddr};

    fn net() -> NetTuple {
        NetTuple::new(SocketAddr::new(Ipv4Addr::new(1, 1, 1, 1).into(), 1), SocketAddr::new(Ipv4Addr::new(2, 2, 2, 2).into(), 2))
    }

    fn template(id: u16) -> Arc<Template> {
        Arc::new(Template {
            id,
            kind: TemplateKind::Regular,
            scope_field_count: 0,
            options_kind: None,
            fields: vec![FieldSpec { pen: 0, id: 1, length: 4, offset: Some(0), is_last_occurrence: true, ie: None }],
            fixed_record_size: Some(4),
            raw: vec![],
            flow_key_bitmap: None,
            last_refresh: 0,
        })
    }

    fn message_with_one_record(odid: u32, set_id: u16, resolved: bool) -> IpfixMessage {
        let mut buf = vec![0u8; IpfixHeader::SIZE];
        let header = IpfixHeader { version: crate::ipfix::header::VERSION, length: (IpfixHeader::SIZE + 4) as u16, export_time: 1000, seq_number: 1, domain_id: odid };
        header.write(&mut buf).unwrap();
        buf.extend_from_slice(&[0, 0, 0, 7]);
        let session = Arc::new(Session::new_udp(net(), 0, 0));
        let snapshot = Arc::new(Snapshot::new(StdHashMap::new(), 0));
        let mut msg = IpfixMessage::new(buf, header, session, odid, 0);
        let tmpl = if resolved { Some(template(set_id)) } else { None };
        msg.records.push(DataRecord::new(IpfixHeader::SIZE, 4, set_id, tmpl, snapshot, 0));
        msg
    }

    #[test]
    fn first_message_emits_template_then_data() {
        let dir = std::env::temp_dir().join(format!("ipfixcol-writer-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let pattern = dir.join("out.ipfix").to_string_lossy().into_owned();
        let mut writer = Writer::new(WriterConfig { filename_pattern: pattern.clone(), window_size_s: 0, ..WriterConfig::default() });
        let msg = message_with_one_record(5, 300, true);
        writer.process(&BusMessage::Ipfix(msg)).unwrap();
        writer.destroy();

        let bytes = std::fs::read(&pattern).unwrap();
        let h1 = IpfixHeader::read(&bytes).unwrap();
        let set1 = SetHeader::read(&bytes[IpfixHeader::SIZE..]).unwrap();
        assert_eq!(set1.id, SetHeader::TEMPLATE_SET_ID);
        let second_offset = IpfixHeader::SIZE + h1.length as usize;
        let h2 = IpfixHeader::read(&bytes[second_offset..]).unwrap();
        let set2 = SetHeader::read(&bytes[second_offset + IpfixHeader::SIZE..]).unwrap();
        assert_eq!(set2.id, 300);
        assert_eq!(h2.seq_number, 1);
    }

    #[test]
    fn colliding_session_drops_after_first_warning() {
        let dir = std::env::temp_dir().join(format!("ipfixcol-writer-test-{}", std::process::id() + 1));
        std::fs::create_dir_all(&dir).unwrap();
        let pattern = dir.join("collide.ipfix").to_string_lossy().into_owned();
        let mut writer = Writer::new(WriterConfig { filename_pattern: pattern, window_size_s: 0, ..WriterConfig::default() });
        let first = message_with_one_record(5, 300, true);
        writer.process(&BusMessage::Ipfix(first)).unwrap();
        let second = message_with_one_record(5, 300, true); // different session, same odid
        let outputs = writer.process(&BusMessage::Ipfix(second)).unwrap();
        assert!(outputs.is_empty());
        assert!(writer.odids.get(&5).unwrap().warned_collision);
    }

    #[test]
    fn sequence_number_runs_independently_of_exporter_sn_across_drops() {
        let dir = std::env::temp_dir().join(format!("ipfixcol-writer-test-{}", std::process::id() + 2));
        std::fs::create_dir_all(&dir).unwrap();
        let pattern = dir.join("seq.ipfix").to_string_lossy().into_owned();
        let mut writer = Writer::new(WriterConfig { filename_pattern: pattern.clone(), window_size_s: 0, preserve_original: false, ..WriterConfig::default() });
        let session = Arc::new(Session::new_udp(net(), 0, 0));
        let snapshot = Arc::new(Snapshot::new(StdHashMap::new(), 0));

        // First message: exporter SN 10, two resolved records. Seeds the
        // running counter at 10, advances it to 12.
        let mut buf1 = vec![0u8; IpfixHeader::SIZE];
        let header1 = IpfixHeader { version: crate::ipfix::header::VERSION, length: (IpfixHeader::SIZE + 8) as u16, export_time: 1000, seq_number: 10, domain_id: 9 };
        header1.write(&mut buf1).unwrap();
        buf1.extend_from_slice(&[0, 0, 0, 7, 0, 0, 0, 7]);
        let mut msg1 = IpfixMessage::new(buf1, header1, session.clone(), 9, 0);
        msg1.records.push(DataRecord::new(IpfixHeader::SIZE, 4, 300, Some(template(300)), snapshot.clone(), 0));
        msg1.records.push(DataRecord::new(IpfixHeader::SIZE + 4, 4, 300, Some(template(300)), snapshot.clone(), 0));
        writer.process(&BusMessage::Ipfix(msg1)).unwrap();

        // Second message: exporter SN jumped to 40 (e.g. after an exporter
        // restart) but one record is unresolved and dropped. The output
        // must still continue the writer's own tally (12), not 40 and not
        // 40 - 1.
        let mut buf2 = vec![0u8; IpfixHeader::SIZE];
        let header2 = IpfixHeader { version: crate::ipfix::header::VERSION, length: (IpfixHeader::SIZE + 8) as u16, export_time: 1001, seq_number: 40, domain_id: 9 };
        header2.write(&mut buf2).unwrap();
        buf2.extend_from_slice(&[0, 0, 0, 7, 0, 0, 0, 7]);
        let mut msg2 = IpfixMessage::new(buf2, header2, session, 9, 0);
        msg2.records.push(DataRecord::new(IpfixHeader::SIZE, 4, 300, Some(template(300)), snapshot.clone(), 0));
        msg2.records.push(DataRecord::new(IpfixHeader::SIZE + 4, 4, 300, None, snapshot, 0));
        writer.process(&BusMessage::Ipfix(msg2)).unwrap();
        writer.destroy();

        let bytes = std::fs::read(&pattern).unwrap();
        let h_templates = IpfixHeader::read(&bytes).unwrap();
        let data1_offset = IpfixHeader::SIZE + h_templates.length as usize;
        let h_data1 = IpfixHeader::read(&bytes[data1_offset..]).unwrap();
        assert_eq!(h_data1.seq_number, 10);
        let data2_offset = data1_offset + IpfixHeader::SIZE + h_data1.length as usize;
        let h_data2 = IpfixHeader::read(&bytes[data2_offset..]).unwrap();
        assert_eq!(h_data2.seq_number, 12);
    }

    #[test]
    fn unresolved_record_dropped_when_not_preserving_original() {
        let msg = message_with_one_record(5, 300, false);
        let (set_bytes, dropped, unresolved) = build_data_message(&msg, false);
        assert!(set_bytes.is_empty());
        assert_eq!(dropped, 1);
        assert_eq!(unresolved, 1);
    }

    #[test]
    fn unresolved_record_kept_when_preserving_original() {
        let msg = message_with_one_record(5, 300, false);
        let (set_bytes, dropped, unresolved) = build_data_message(&msg, true);
        assert!(!set_bytes.is_empty());
        assert_eq!(dropped, 0);
        assert_eq!(unresolved, 1);
    }
}
