//! IPFIX Message wrapper (spec §3): owns one raw message buffer plus the
//! session/namespace it arrived on and the parser's resolved Sets/Records.

use crate::ipfix::header::{Header, SetHeader};
use crate::ipfix::record::DataRecord;
use crate::session::{Session, StreamId};
use std::sync::Arc;

#[derive(Debug, Clone, Copy)]
pub struct SetSpan {
    pub id: u16,
    /// Byte offset of the Set header within the message buffer.
    pub offset: usize,
    pub length: usize,
}

impl SetSpan {
    pub fn is_template_set(&self) -> bool {
        self.id == SetHeader::TEMPLATE_SET_ID
    }
    pub fn is_options_template_set(&self) -> bool {
        self.id == SetHeader::OPTIONS_TEMPLATE_SET_ID
    }
    pub fn is_data_set(&self) -> bool {
        self.id >= SetHeader::MIN_DATA_SET_ID
    }
}

/// One ingested IPFIX Message: the raw bytes plus everything the parser
/// resolved about it. Data Records borrow nothing from the buffer directly
/// (spec §3 "records never own their bytes; the owning IPFIX Message
/// does") — they carry byte ranges resolved against `buf` by the caller.
#[derive(Debug)]
pub struct Message {
    pub buf: Vec<u8>,
    pub header: Header,
    pub session: Arc<Session>,
    pub odid: u32,
    pub stream: StreamId,
    pub sets: Vec<SetSpan>,
    pub records: Vec<DataRecord>,
}

impl Message {
    pub fn new(buf: Vec<u8>, header: Header, session: Arc<Session>, odid: u32, stream: StreamId) -> Self {
        Message { buf, header, session, odid, stream, sets: Vec::new(), records: Vec::new() }
    }

    pub fn export_time(&self) -> i64 {
        self.header.export_time as i64
    }

    pub fn seq_number(&self) -> u32 {
        self.header.seq_number
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_span_classifies_by_id() {
        let tmplt = SetSpan { id: 2, offset: 16, length: 20 };
        let opts = SetSpan { id: 3, offset: 36, length: 20 };
        let data = SetSpan { id: 256, offset: 56, length: 20 };
        assert!(tmplt.is_template_set());
        assert!(opts.is_options_template_set());
        assert!(data.is_data_set());
        assert!(!data.is_template_set());
    }
}
