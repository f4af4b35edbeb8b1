//! NetFlow v9 → IPFIX converter (spec §4.3): "structurally similar to
//! IPFIX but with a different set header, different date IEs, and
//! Source ID instead of ODID."

use crate::error::{Error, Result};
use crate::ipfix::header::{Header as IpfixHeader, SetHeader};
use crate::ipfix::template::{classify_options_kind, write_template_record, FieldSpec, Template, TemplateKind};
use std::collections::{HashMap, HashSet};
use std::convert::TryInto;

pub const VERSION: u16 = 9;

const TEMPLATE_FLOWSET_ID: u16 = 0;
const OPTIONS_TEMPLATE_FLOWSET_ID: u16 = 1;
const MIN_DATA_FLOWSET_ID: u16 = 256;

/// v9 field types whose IPFIX-equivalent value is device-uptime-relative
/// milliseconds and must be translated to an absolute timestamp (spec
/// §4.3 "different date IEs"). `FIRST_SWITCHED` / `LAST_SWITCHED`.
const FIRST_SWITCHED: u16 = 22;
const LAST_SWITCHED: u16 = 21;
const FLOW_START_MS: u16 = 152;
const FLOW_END_MS: u16 = 153;

struct V9Header {
    count: u16,
    sys_uptime_ms: u32,
    unix_secs: u32,
    seq_number: u32,
    source_id: u32,
}

impl V9Header {
    const SIZE: usize = 20;

    fn read(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(Error::Format(format!("NetFlow v9 header needs {} bytes, got {}", Self::SIZE, buf.len())));
        }
        let version = u16::from_be_bytes(buf[0..2].try_into().unwrap());
        if version != VERSION {
            return Err(Error::Format(format!("unexpected NetFlow version {} on v9 path", version)));
        }
        Ok(V9Header {
            count: u16::from_be_bytes(buf[2..4].try_into().unwrap()),
            sys_uptime_ms: u32::from_be_bytes(buf[4..8].try_into().unwrap()),
            unix_secs: u32::from_be_bytes(buf[8..12].try_into().unwrap()),
            seq_number: u32::from_be_bytes(buf[12..16].try_into().unwrap()),
            source_id: u32::from_be_bytes(buf[16..20].try_into().unwrap()),
        })
    }
}

#[derive(Clone, Copy)]
enum FieldTransform {
    Copy { len: u16 },
    TranslateUptimeMs { in_len: u16 },
}

impl FieldTransform {
    fn in_len(&self) -> u16 {
        match self {
            FieldTransform::Copy { len } => *len,
            FieldTransform::TranslateUptimeMs { in_len } => *in_len,
        }
    }
    fn out_len(&self) -> u16 {
        match self {
            FieldTransform::Copy { len } => *len,
            FieldTransform::TranslateUptimeMs { .. } => 8,
        }
    }
}

/// One v9 template translated into its IPFIX equivalent, plus the
/// per-field transcoding plan used to rewrite Data FlowSets.
struct TemplateMapping {
    ipfix_template: Template,
    transforms: Vec<FieldTransform>,
    in_record_size: usize,
}

fn read_field_type_length(buf: &[u8]) -> Result<(u16, u16)> {
    if buf.len() < 4 {
        return Err(Error::Format("v9 field spec needs 4 bytes".into()));
    }
    Ok((u16::from_be_bytes(buf[0..2].try_into().unwrap()), u16::from_be_bytes(buf[2..4].try_into().unwrap())))
}

fn build_mapping(template_id: u16, raw_fields: &[(u16, u16)], kind: TemplateKind, scope_field_count: u16) -> TemplateMapping {
    let mut fields = Vec::with_capacity(raw_fields.len());
    let mut transforms = Vec::with_capacity(raw_fields.len());
    let mut in_record_size = 0usize;
    for &(ty, len) in raw_fields {
        let (ie_id, transform) = match ty {
            FIRST_SWITCHED => (FLOW_START_MS, FieldTransform::TranslateUptimeMs { in_len: len }),
            LAST_SWITCHED => (FLOW_END_MS, FieldTransform::TranslateUptimeMs { in_len: len }),
            other => (other, FieldTransform::Copy { len }),
        };
        in_record_size += len as usize;
        fields.push(FieldSpec { pen: 0, id: ie_id, length: transform.out_len(), offset: None, is_last_occurrence: true, ie: None });
        transforms.push(transform);
    }
    let fixed_record_size = fields.iter().map(|f| f.length as usize).sum();
    let options_kind = if kind == TemplateKind::Options && !fields.is_empty() { Some(classify_options_kind(scope_field_count, &fields)) } else { None };
    let ipfix_template = Template {
        id: template_id,
        kind,
        scope_field_count,
        options_kind,
        fields,
        fixed_record_size: Some(fixed_record_size),
        raw: Vec::new(),
        flow_key_bitmap: None,
        last_refresh: 0,
    };
    TemplateMapping { ipfix_template, transforms, in_record_size }
}

fn transcode_record(input: &[u8], mapping: &TemplateMapping, header: &V9Header, out: &mut Vec<u8>) {
    let mut offset = 0usize;
    for transform in &mapping.transforms {
        let in_len = transform.in_len() as usize;
        let raw = &input[offset..offset + in_len];
        match transform {
            FieldTransform::Copy { .. } => out.extend_from_slice(raw),
            FieldTransform::TranslateUptimeMs { .. } => {
                let uptime_relative = raw.iter().fold(0u64, |acc, &b| (acc << 8) | b as u64) as u32;
                let absolute_ms = header.unix_secs as i64 * 1000 + uptime_relative as i64 - header.sys_uptime_ms as i64;
                out.extend_from_slice(&(absolute_ms as u64).to_be_bytes());
            }
        }
        offset += in_len;
    }
}

/// Per-`(session, source id)` converter state (spec §4.3 "per-(session,
/// source-id) mapping of v9 templates to IPFIX templates").
#[derive(Default)]
pub struct V9Converter {
    templates: HashMap<u16, TemplateMapping>,
    emitted: HashSet<u16>,
    expected_seq: Option<u32>,
}

impl V9Converter {
    pub fn new() -> Self {
        V9Converter::default()
    }

    fn process_template_flowset(&mut self, content: &[u8]) -> Result<()> {
        let mut offset = 0;
        while offset + 4 <= content.len() {
            let template_id = u16::from_be_bytes(content[offset..offset + 2].try_into().unwrap());
            let field_count = u16::from_be_bytes(content[offset + 2..offset + 4].try_into().unwrap());
            offset += 4;
            let mut raw_fields = Vec::with_capacity(field_count as usize);
            for _ in 0..field_count {
                raw_fields.push(read_field_type_length(&content[offset..])?);
                offset += 4;
            }
            let mapping = build_mapping(template_id, &raw_fields, TemplateKind::Regular, 0);
            self.templates.insert(template_id, mapping);
            self.emitted.remove(&template_id); // redefinition re-triggers emission
        }
        Ok(())
    }

    fn process_options_template_flowset(&mut self, content: &[u8]) -> Result<()> {
        let mut offset = 0;
        while offset + 6 <= content.len() {
            let template_id = u16::from_be_bytes(content[offset..offset + 2].try_into().unwrap());
            let scope_len = u16::from_be_bytes(content[offset + 2..offset + 4].try_into().unwrap());
            let option_len = u16::from_be_bytes(content[offset + 4..offset + 6].try_into().unwrap());
            offset += 6;
            let scope_count = scope_len / 4;
            let option_count = option_len / 4;
            let mut raw_fields = Vec::with_capacity((scope_count + option_count) as usize);
            for _ in 0..(scope_count + option_count) {
                raw_fields.push(read_field_type_length(&content[offset..])?);
                offset += 4;
            }
            let mapping = build_mapping(template_id, &raw_fields, TemplateKind::Options, scope_count);
            self.templates.insert(template_id, mapping);
            self.emitted.remove(&template_id);
        }
        Ok(())
    }

    fn emit_template_set(&self, template: &Template) -> Result<Vec<u8>> {
        let mut tmplt_bytes = vec![0u8; 128];
        let n = write_template_record(&mut tmplt_bytes, template)?;
        tmplt_bytes.truncate(n);
        let header = SetHeader { id: SetHeader::TEMPLATE_SET_ID, length: (SetHeader::SIZE + tmplt_bytes.len()) as u16 };
        let mut set = vec![0u8; SetHeader::SIZE];
        header.write(&mut set)?;
        set.extend_from_slice(&tmplt_bytes);
        Ok(set)
    }

    /// Converts one NetFlow v9 message into a synthetic IPFIX Message,
    /// prepending Template Sets for any template used for the first time.
    /// Returns the IPFIX bytes and the sequence-number delta versus what
    /// was expected from this exporter (spec §4.3 translator semantics).
    pub fn convert(&mut self, datagram: &[u8]) -> Result<(Vec<u8>, i64)> {
        let header = V9Header::read(datagram)?;
        let seq_delta = match self.expected_seq {
            Some(exp) => header.seq_number.wrapping_sub(exp) as i32 as i64,
            None => 0,
        };
        self.expected_seq = Some(header.seq_number.wrapping_add(1));

        let mut offset = V9Header::SIZE;
        let mut out_sets: Vec<Vec<u8>> = Vec::new();

        for _ in 0..header.count {
            if offset + 4 > datagram.len() {
                break;
            }
            let flowset_id = u16::from_be_bytes(datagram[offset..offset + 2].try_into().unwrap());
            let length = u16::from_be_bytes(datagram[offset + 2..offset + 4].try_into().unwrap());
            if length < 4 || offset + length as usize > datagram.len() {
                return Err(Error::Format(format!("flowset {} length {} overruns datagram", flowset_id, length)));
            }
            let content = &datagram[offset + 4..offset + length as usize];

            match flowset_id {
                TEMPLATE_FLOWSET_ID => self.process_template_flowset(content)?,
                OPTIONS_TEMPLATE_FLOWSET_ID => self.process_options_template_flowset(content)?,
                id if id >= MIN_DATA_FLOWSET_ID => {
                    if let Some(mapping) = self.templates.get(&id) {
                        if !self.emitted.contains(&id) {
                            out_sets.push(self.emit_template_set(&mapping.ipfix_template)?);
                            self.emitted.insert(id);
                        }
                        if mapping.in_record_size > 0 {
                            let mut data_content = Vec::new();
                            let mut rec_offset = 0;
                            while rec_offset + mapping.in_record_size <= content.len() {
                                transcode_record(&content[rec_offset..rec_offset + mapping.in_record_size], mapping, &header, &mut data_content);
                                rec_offset += mapping.in_record_size;
                            }
                            let data_header = SetHeader { id, length: (SetHeader::SIZE + data_content.len()) as u16 };
                            let mut data_set = vec![0u8; SetHeader::SIZE];
                            data_header.write(&mut data_set)?;
                            data_set.extend_from_slice(&data_content);
                            out_sets.push(data_set);
                        }
                    }
                    // unresolved template id: Data FlowSet dropped, matching
                    // the IPFIX parser's "unknown Template ID is recorded
                    // but not fatal" policy (spec §4.5).
                }
                _ => {}
            }
            offset += length as usize;
        }

        let total_len = IpfixHeader::SIZE + out_sets.iter().map(Vec::len).sum::<usize>();
        let ipfix_header = IpfixHeader { version: crate::ipfix::header::VERSION, length: total_len as u16, export_time: header.unix_secs, seq_number: header.seq_number, domain_id: header.source_id };
        let mut out = vec![0u8; IpfixHeader::SIZE];
        ipfix_header.write(&mut out)?;
        for set in out_sets {
            out.extend_from_slice(&set);
        }
        Ok((out, seq_delta))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v9_header(count: u16, uptime_ms: u32, unix_secs: u32, seq: u32, source_id: u32) -> Vec<u8> {
        let mut buf = vec![0u8; V9Header::SIZE];
        buf[0..2].copy_from_slice(&VERSION.to_be_bytes());
        buf[2..4].copy_from_slice(&count.to_be_bytes());
        buf[4..8].copy_from_slice(&uptime_ms.to_be_bytes());
        buf[8..12].copy_from_slice(&unix_secs.to_be_bytes());
        buf[12..16].copy_from_slice(&seq.to_be_bytes());
        buf[16..20].copy_from_slice(&source_id.to_be_bytes());
        buf
    }

    fn template_flowset(template_id: u16, fields: &[(u16, u16)]) -> Vec<u8> {
        let mut content = vec![];
        content.extend_from_slice(&template_id.to_be_bytes());
        content.extend_from_slice(&(fields.len() as u16).to_be_bytes());
        for (ty, len) in fields {
            content.extend_from_slice(&ty.to_be_bytes());
            content.extend_from_slice(&len.to_be_bytes());
        }
        let mut set = vec![];
        set.extend_from_slice(&TEMPLATE_FLOWSET_ID.to_be_bytes());
        set.extend_from_slice(&((4 + content.len()) as u16).to_be_bytes());
        set.extend_from_slice(&content);
        set
    }

    fn data_flowset(template_id: u16, record_bytes: &[u8]) -> Vec<u8> {
        let mut set = vec![];
        set.extend_from_slice(&template_id.to_be_bytes());
        set.extend_from_slice(&((4 + record_bytes.len()) as u16).to_be_bytes());
        set.extend_from_slice(record_bytes);
        set
    }

    #[test]
    fn template_then_data_converts_and_translates_dates() {
        let mut msg = v9_header(2, 10001, 1562857357, 5, 777);
        msg.extend_from_slice(&template_flowset(300, &[(8, 4), (12, 4), (FIRST_SWITCHED, 4), (LAST_SWITCHED, 4)]));
        let mut record = vec![];
        record.extend_from_slice(&[8, 8, 8, 8]);
        record.extend_from_slice(&[1, 1, 1, 1]);
        record.extend_from_slice(&6501u32.to_be_bytes());
        record.extend_from_slice(&9000u32.to_be_bytes());
        msg.extend_from_slice(&data_flowset(300, &record));

        let mut conv = V9Converter::new();
        let (ipfix_bytes, seq_delta) = conv.convert(&msg).unwrap();
        assert_eq!(seq_delta, 0);
        let header = IpfixHeader::read(&ipfix_bytes).unwrap();
        assert_eq!(header.domain_id, 777); // source id substitutes for ODID

        let tmplt_set_header = SetHeader::read(&ipfix_bytes[IpfixHeader::SIZE..]).unwrap();
        assert_eq!(tmplt_set_header.id, SetHeader::TEMPLATE_SET_ID);
        let data_offset = IpfixHeader::SIZE + tmplt_set_header.length as usize;
        let data_header = SetHeader::read(&ipfix_bytes[data_offset..]).unwrap();
        assert_eq!(data_header.id, 300);
        let rec = &ipfix_bytes[data_offset + SetHeader::SIZE..];
        let start_ms = u64::from_be_bytes(rec[8..16].try_into().unwrap());
        let end_ms = u64::from_be_bytes(rec[16..24].try_into().unwrap());
        assert_eq!(start_ms, 1562857357000 + 6501 - 10001);
        assert_eq!(end_ms, 1562857357000 + 9000 - 10001);
    }

    #[test]
    fn template_not_reemitted_on_second_use() {
        let mut msg = v9_header(2, 0, 1, 1, 1);
        msg.extend_from_slice(&template_flowset(300, &[(8, 4)]));
        msg.extend_from_slice(&data_flowset(300, &[1, 2, 3, 4]));
        let mut conv = V9Converter::new();
        conv.convert(&msg).unwrap();

        let mut msg2 = v9_header(1, 0, 2, 2, 1);
        msg2.extend_from_slice(&data_flowset(300, &[5, 6, 7, 8]));
        let (out2, _) = conv.convert(&msg2).unwrap();
        let set_header = SetHeader::read(&out2[IpfixHeader::SIZE..]).unwrap();
        assert_ne!(set_header.id, SetHeader::TEMPLATE_SET_ID);
    }

    #[test]
    fn unknown_template_drops_data_flowset() {
        let msg = v9_header(1, 0, 1, 1, 1).into_iter().chain(data_flowset(999, &[1, 2, 3, 4])).collect::<Vec<u8>>();
        let mut conv = V9Converter::new();
        let (out, _) = conv.convert(&msg).unwrap();
        assert_eq!(out.len(), IpfixHeader::SIZE);
    }
}
