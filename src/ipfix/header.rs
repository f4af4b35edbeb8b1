//! IPFIX Message and Set headers (RFC 7011 §3.1/§3.3), generalized from the
//! teacher's `flow::ipfix::Header`/`SetHeader`.

use crate::error::{Error, Result};
use std::convert::TryInto;

pub const VERSION: u16 = 0x000A;

/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |       Version Number          |            Length             |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                           Export Time                         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                       Sequence Number                         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                    Observation Domain ID                      |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Clone, Copy)]
pub struct Header {
    pub version: u16,
    pub length: u16,
    pub export_time: u32,
    pub seq_number: u32,
    pub domain_id: u32,
}

impl Header {
    pub const SIZE: usize = 16;

    pub fn read(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(Error::Format(format!("IPFIX header needs {} bytes, got {}", Self::SIZE, buf.len())));
        }
        let version = u16::from_be_bytes(buf[0..2].try_into().unwrap());
        if version != VERSION {
            return Err(Error::Format(format!("unexpected IPFIX version 0x{:04x}", version)));
        }
        let length = u16::from_be_bytes(buf[2..4].try_into().unwrap());
        if (length as usize) < Self::SIZE {
            return Err(Error::Format(format!("IPFIX header length {} smaller than header size", length)));
        }
        Ok(Header {
            version,
            length,
            export_time: u32::from_be_bytes(buf[4..8].try_into().unwrap()),
            seq_number: u32::from_be_bytes(buf[8..12].try_into().unwrap()),
            domain_id: u32::from_be_bytes(buf[12..16].try_into().unwrap()),
        })
    }

    pub fn write(&self, out: &mut [u8]) -> Result<()> {
        if out.len() < Self::SIZE {
            return Err(Error::Buffer { needed: Self::SIZE, available: out.len() });
        }
        out[0..2].copy_from_slice(&self.version.to_be_bytes());
        out[2..4].copy_from_slice(&self.length.to_be_bytes());
        out[4..8].copy_from_slice(&self.export_time.to_be_bytes());
        out[8..12].copy_from_slice(&self.seq_number.to_be_bytes());
        out[12..16].copy_from_slice(&self.domain_id.to_be_bytes());
        Ok(())
    }
}

/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |          Set ID               |          Length               |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Clone, Copy)]
pub struct SetHeader {
    pub id: u16,
    pub length: u16,
}

impl SetHeader {
    pub const SIZE: usize = 4;
    pub const TEMPLATE_SET_ID: u16 = 2;
    pub const OPTIONS_TEMPLATE_SET_ID: u16 = 3;
    pub const MIN_DATA_SET_ID: u16 = 256;

    pub fn read(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(Error::Format(format!("Set header needs {} bytes, got {}", Self::SIZE, buf.len())));
        }
        let id = u16::from_be_bytes(buf[0..2].try_into().unwrap());
        let length = u16::from_be_bytes(buf[2..4].try_into().unwrap());
        if (length as usize) < Self::SIZE {
            return Err(Error::Format(format!("Set {} length {} smaller than set header size", id, length)));
        }
        Ok(SetHeader { id, length })
    }

    pub fn write(&self, out: &mut [u8]) -> Result<()> {
        if out.len() < Self::SIZE {
            return Err(Error::Buffer { needed: Self::SIZE, available: out.len() });
        }
        out[0..2].copy_from_slice(&self.id.to_be_bytes());
        out[2..4].copy_from_slice(&self.length.to_be_bytes());
        Ok(())
    }

    #[inline]
    pub fn content_size(&self) -> usize {
        self.length as usize - Self::SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    const HEADER_PAYLOAD: [u8; Header::SIZE] = hex!("00 0a 00 84 60 6c 55 89 df b2 ba d2 00 08 00 00");

    #[test]
    fn read_msg_header() {
        let header = Header::read(&HEADER_PAYLOAD).unwrap();
        assert_eq!(header.version, VERSION);
        assert_eq!(header.length, 132);
        assert_eq!(header.export_time, 1617712521);
        assert_eq!(header.seq_number, 3753032402);
        assert_eq!(header.domain_id, 524288);
    }

    #[test]
    fn rejects_bad_version() {
        let mut buf = HEADER_PAYLOAD;
        buf[1] = 0x09;
        assert!(Header::read(&buf).is_err());
    }

    #[test]
    fn write_then_read_roundtrips() {
        let h = Header { version: VERSION, export_time: 1, seq_number: 2, domain_id: 3, length: 20 };
        let mut buf = [0u8; Header::SIZE];
        h.write(&mut buf).unwrap();
        let back = Header::read(&buf).unwrap();
        assert_eq!(back.export_time, 1);
        assert_eq!(back.domain_id, 3);
    }
}
