//! Template / Options Template records (spec §3 "Template").
//!
//! Generalizes the teacher's `TemplateHeader`/`TemplateField` (which only
//! understood IANA-space fields of fixed size) into the full RFC 7011 field
//! specifier grammar: enterprise-numbered fields (the high bit of the field
//! id) and variable-length fields (wire length `0xFFFF`).

use crate::error::{Error, Result};
use crate::ie::IeDescriptor;
use std::convert::TryInto;
use std::fmt;

/// Sentinel wire length meaning "variable, actual length is a 1- or 3-byte
/// prefix preceding each record's value" (RFC 7011 §7).
pub const VARLEN: u16 = 0xFFFF;

/// Bit 15 of a Field Specifier's id marks an enterprise-numbered element; a
/// 4-byte PEN follows the base id/length pair when set.
const ENTERPRISE_BIT: u16 = 0x8000;

#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    pub pen: u32,
    pub id: u16,
    /// Wire length, or `VARLEN` for variable-length fields.
    pub length: u16,
    /// Byte offset within a Data Record, if every preceding field (and this
    /// one) has a fixed length; `None` once any variable-length field has
    /// been seen (spec §3).
    pub offset: Option<usize>,
    /// Whether this is the last field in the template with this `(pen, id)`
    /// — RFC 7011 allows repeated IEs; only the last occurrence's value is
    /// semantically authoritative for most consumers (spec §3).
    pub is_last_occurrence: bool,
    pub ie: Option<IeDescriptor>,
}

impl FieldSpec {
    pub fn is_variable_length(&self) -> bool {
        self.length == VARLEN
    }

    /// Size in the wire-encoding, 4 bytes base plus 4 more if enterprise.
    pub fn spec_size(&self) -> usize {
        if self.pen == 0 { 4 } else { 8 }
    }
}

pub fn read_field_spec(buf: &[u8]) -> Result<(u16, u16, u32, usize)> {
    if buf.len() < 4 {
        return Err(Error::Format(format!("field specifier needs 4 bytes, got {}", buf.len())));
    }
    let raw_id = u16::from_be_bytes(buf[0..2].try_into().unwrap());
    let length = u16::from_be_bytes(buf[2..4].try_into().unwrap());
    if raw_id & ENTERPRISE_BIT != 0 {
        if buf.len() < 8 {
            return Err(Error::Format("enterprise field specifier needs 8 bytes".into()));
        }
        let id = raw_id & !ENTERPRISE_BIT;
        let pen = u32::from_be_bytes(buf[4..8].try_into().unwrap());
        Ok((id, length, pen, 8))
    } else {
        Ok((raw_id, length, 0, 4))
    }
}

pub fn write_field_spec(out: &mut [u8], field: &FieldSpec) -> Result<usize> {
    let size = field.spec_size();
    if out.len() < size {
        return Err(Error::Buffer { needed: size, available: out.len() });
    }
    let raw_id = if field.pen != 0 { field.id | ENTERPRISE_BIT } else { field.id };
    out[0..2].copy_from_slice(&raw_id.to_be_bytes());
    out[2..4].copy_from_slice(&field.length.to_be_bytes());
    if field.pen != 0 {
        out[4..8].copy_from_slice(&field.pen.to_be_bytes());
    }
    Ok(size)
}

/// Whether a template is a regular Data Template or an Options Template
/// (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateKind {
    Regular,
    Options,
}

/// Narrow classification of an Options Template by its scope fields and IE
/// ids (spec §4.5), used to route Options Template records to the right
/// manager operation (e.g. FlowKeys annotation feed-back).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionsTemplateKind {
    MeterStats,
    MeterReliability,
    ExporterReliability,
    FlowKeys,
    Unknown,
}

/// IANA element id used as the Options Template scope field that identifies
/// a FlowKeys record (RFC 7015 / common collector convention: templateId as
/// scope + flowKeyIndicator as the sole non-scope field).
const IE_TEMPLATE_ID: u16 = 145;
const IE_FLOW_KEY_INDICATOR: u16 = 173;
const IE_EXPORTING_PROCESS_ID: u16 = 144;
const IE_EXPORTED_MESSAGE_TOTAL_COUNT: u16 = 41;
const IE_OBSERVATION_DOMAIN_ID: u16 = 149;

pub(crate) fn classify_options_kind(scope_field_count: u16, fields: &[FieldSpec]) -> OptionsTemplateKind {
    let scope = &fields[..scope_field_count as usize];
    let body = &fields[scope_field_count as usize..];
    let has_ie = |set: &[FieldSpec], id: u16| set.iter().any(|f| f.pen == 0 && f.id == id);

    if has_ie(scope, IE_TEMPLATE_ID) && has_ie(body, IE_FLOW_KEY_INDICATOR) {
        OptionsTemplateKind::FlowKeys
    } else if has_ie(scope, IE_EXPORTING_PROCESS_ID) && has_ie(body, IE_EXPORTED_MESSAGE_TOTAL_COUNT) {
        OptionsTemplateKind::MeterStats
    } else if has_ie(scope, IE_OBSERVATION_DOMAIN_ID) {
        OptionsTemplateKind::ExporterReliability
    } else if !scope.is_empty() {
        OptionsTemplateKind::MeterReliability
    } else {
        OptionsTemplateKind::Unknown
    }
}

/// A parsed (Options) Template, with raw bytes retained for bit-exact
/// re-emission by the writer (spec §3).
#[derive(Debug, Clone)]
pub struct Template {
    pub id: u16,
    pub kind: TemplateKind,
    pub scope_field_count: u16,
    pub options_kind: Option<OptionsTemplateKind>,
    pub fields: Vec<FieldSpec>,
    /// `Some(size)` when every field has a fixed wire length.
    pub fixed_record_size: Option<usize>,
    pub raw: Vec<u8>,
    /// Flow-key bitmap discovered via a FlowKeys Options Template (spec
    /// §4.4); `None` until the manager annotates it.
    pub flow_key_bitmap: Option<u64>,
    /// Export time at which this exact definition was last (re-)installed;
    /// drives UDP per-template lifetime expiry (spec §4.4).
    pub last_refresh: i64,
}

impl Template {
    pub fn is_withdrawal(&self) -> bool {
        self.fields.is_empty()
    }

    /// Bytewise content equality ignoring `last_refresh`, used by the TCP/SCTP
    /// no-op-refresh rule (spec §4.4).
    pub fn same_definition(&self, other: &Template) -> bool {
        self.id == other.id && self.kind == other.kind && self.scope_field_count == other.scope_field_count && self.fields == other.fields
    }

    pub fn record_size_hint(&self) -> usize {
        self.fixed_record_size.unwrap_or(0)
    }
}

/// Parses a Template Record (regular or Options) starting at `buf[0]`.
/// Returns the parsed template plus the number of bytes consumed.
///
/// A zero-`field_count` record is a Template Withdrawal (spec §4.5): same
/// header shape, no field specifiers.
pub fn read_template_record(buf: &[u8], kind: TemplateKind) -> Result<(Template, usize)> {
    let header_size = match kind {
        TemplateKind::Regular => 4,
        TemplateKind::Options => 6,
    };
    if buf.len() < header_size {
        return Err(Error::Format(format!("template record needs {} header bytes, got {}", header_size, buf.len())));
    }

    let id = u16::from_be_bytes(buf[0..2].try_into().unwrap());
    let field_count = u16::from_be_bytes(buf[2..4].try_into().unwrap());
    let scope_field_count = match kind {
        TemplateKind::Regular => 0,
        TemplateKind::Options => u16::from_be_bytes(buf[4..6].try_into().unwrap()),
    };

    if kind == TemplateKind::Options && scope_field_count > field_count {
        return Err(Error::Format(format!("template {} scope field count {} exceeds field count {}", id, scope_field_count, field_count)));
    }

    let mut offset = header_size;
    let mut fields = Vec::with_capacity(field_count as usize);
    let mut running_offset = Some(0usize);
    let mut seen: std::collections::HashMap<(u32, u16), usize> = std::collections::HashMap::new();

    for _ in 0..field_count {
        let (fid, length, pen, consumed) = read_field_spec(&buf[offset..])?;
        let this_offset = running_offset;
        if length == VARLEN {
            running_offset = None;
        } else if let Some(o) = running_offset {
            running_offset = Some(o + length as usize);
        }
        fields.push(FieldSpec {
            pen,
            id: fid,
            length,
            offset: this_offset,
            is_last_occurrence: false, // fixed up below
            ie: None,
        });
        seen.insert((pen, fid), fields.len() - 1);
        offset += consumed;
    }

    for (_, idx) in seen {
        fields[idx].is_last_occurrence = true;
    }

    let fixed_record_size = running_offset;
    let options_kind = if kind == TemplateKind::Options && field_count > 0 {
        Some(classify_options_kind(scope_field_count, &fields))
    } else {
        None
    };

    let template = Template {
        id,
        kind,
        scope_field_count,
        options_kind,
        fields,
        fixed_record_size,
        raw: buf[..offset].to_vec(),
        flow_key_bitmap: None,
        last_refresh: 0,
    };

    Ok((template, offset))
}

/// Serializes a Template Record back onto the wire (used by the writer when
/// re-emitting templates at file rotation, spec §4.7). Withdrawals (empty
/// field lists) serialize to just the header.
pub fn write_template_record(out: &mut [u8], t: &Template) -> Result<usize> {
    let header_size = match t.kind {
        TemplateKind::Regular => 4,
        TemplateKind::Options => 6,
    };
    let total: usize = header_size + t.fields.iter().map(FieldSpec::spec_size).sum::<usize>();
    if out.len() < total {
        return Err(Error::Buffer { needed: total, available: out.len() });
    }
    out[0..2].copy_from_slice(&t.id.to_be_bytes());
    out[2..4].copy_from_slice(&(t.fields.len() as u16).to_be_bytes());
    let mut offset = 4;
    if t.kind == TemplateKind::Options {
        out[4..6].copy_from_slice(&t.scope_field_count.to_be_bytes());
        offset = 6;
    }
    for field in &t.fields {
        offset += write_field_spec(&mut out[offset..], field)?;
    }
    Ok(offset)
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Template#{} ({:?}, {} fields", self.id, self.kind, self.fields.len())?;
        if let Some(k) = self.options_kind {
            write!(f, ", options_kind={:?}", k)?;
        }
        write!(f, ")")
    }
}
