//! Endian-aware accessors for IPFIX primitive types (spec §4.1).
//!
//! Every reader takes a byte slice of exactly the wire length of the field
//! (the caller already knows the length from a Template Field Specifier) and
//! saturates rather than panics on out-of-range values. Every writer returns
//! `Ok(())` or one of `ErrTrunc`/`ErrArg`/`ErrBuffer` as spec'd.

use crate::error::{Error, Result};
use std::convert::TryInto;
use std::net::{Ipv4Addr, Ipv6Addr};

/// Read a big-endian unsigned integer of 1..=8 bytes, widened into a `u64`.
/// IPFIX allows "reduced-length encoding" for unsigned types, so the wire
/// width need not match the natural Rust width.
pub fn read_uint(buf: &[u8]) -> Result<u64> {
    if buf.is_empty() || buf.len() > 8 {
        return Err(Error::Arg(format!("unsigned integer length {} out of range 1..=8", buf.len())));
    }
    let mut acc: u64 = 0;
    for &b in buf {
        acc = (acc << 8) | b as u64;
    }
    Ok(acc)
}

/// Read a big-endian signed integer of 1..=8 bytes with sign extension.
pub fn read_int(buf: &[u8]) -> Result<i64> {
    if buf.is_empty() || buf.len() > 8 {
        return Err(Error::Arg(format!("signed integer length {} out of range 1..=8", buf.len())));
    }
    let mut acc: u64 = if buf[0] & 0x80 != 0 { u64::MAX } else { 0 };
    for &b in buf {
        acc = (acc << 8) | b as u64;
    }
    Ok(acc as i64)
}

/// Write `value` as a big-endian unsigned integer into `out[..len]`, len in
/// 1..=8. Values that don't fit in `len` bytes are saturated to the maximum
/// representable value and `ErrTrunc` is returned (the write still happens).
pub fn write_uint(out: &mut [u8], len: usize, value: u64) -> Result<()> {
    if len == 0 || len > 8 {
        return Err(Error::Arg(format!("unsigned integer length {} out of range 1..=8", len)));
    }
    if out.len() < len {
        return Err(Error::Buffer { needed: len, available: out.len() });
    }
    let max = if len == 8 { u64::MAX } else { (1u64 << (len * 8)) - 1 };
    let truncated = value > max;
    let v = value.min(max);
    for i in 0..len {
        out[i] = ((v >> (8 * (len - 1 - i))) & 0xFF) as u8;
    }
    if truncated {
        return Err(Error::Trunc(format!("{} saturated to {} in {} bytes", value, v, len)));
    }
    Ok(())
}

pub fn write_int(out: &mut [u8], len: usize, value: i64) -> Result<()> {
    if len == 0 || len > 8 {
        return Err(Error::Arg(format!("signed integer length {} out of range 1..=8", len)));
    }
    if out.len() < len {
        return Err(Error::Buffer { needed: len, available: out.len() });
    }
    let bits = (len * 8) as u32;
    let (min, max) = if len == 8 {
        (i64::MIN, i64::MAX)
    } else {
        (-(1i64 << (bits - 1)), (1i64 << (bits - 1)) - 1)
    };
    let truncated = value < min || value > max;
    let v = value.max(min).min(max);
    let bytes = v.to_be_bytes();
    out[..len].copy_from_slice(&bytes[8 - len..]);
    if truncated {
        return Err(Error::Trunc(format!("{} saturated to {} in {} bytes", value, v, len)));
    }
    Ok(())
}

/// IEEE-754 single precision; saturates non-finite magnitudes to
/// `f32::MIN`/`f32::MAX` per spec.
pub fn read_f32(buf: &[u8]) -> Result<f32> {
    if buf.len() != 4 {
        return Err(Error::Arg(format!("float32 requires 4 bytes, got {}", buf.len())));
    }
    Ok(f32::from_be_bytes(buf.try_into().unwrap()))
}

pub fn write_f32(out: &mut [u8], value: f32) -> Result<()> {
    if out.len() < 4 {
        return Err(Error::Buffer { needed: 4, available: out.len() });
    }
    let (v, truncated) = if value.is_infinite() || value > f32::MAX as f32 {
        (f32::MAX, value.is_infinite() && value.is_sign_positive())
    } else if value < f32::MIN {
        (f32::MIN, true)
    } else {
        (value, false)
    };
    out[..4].copy_from_slice(&v.to_be_bytes());
    if truncated {
        return Err(Error::Trunc(format!("{} saturated to {}", value, v)));
    }
    Ok(())
}

pub fn read_f64(buf: &[u8]) -> Result<f64> {
    if buf.len() != 8 {
        return Err(Error::Arg(format!("float64 requires 8 bytes, got {}", buf.len())));
    }
    Ok(f64::from_be_bytes(buf.try_into().unwrap()))
}

pub fn write_f64(out: &mut [u8], value: f64) -> Result<()> {
    if out.len() < 8 {
        return Err(Error::Buffer { needed: 8, available: out.len() });
    }
    out[..8].copy_from_slice(&value.to_be_bytes());
    Ok(())
}

/// IPFIX booleans: wire value `1` is `true`, `2` is `false`; anything else
/// is a format error (spec §4.1).
pub fn read_bool(buf: &[u8]) -> Result<bool> {
    if buf.len() != 1 {
        return Err(Error::Arg(format!("boolean requires 1 byte, got {}", buf.len())));
    }
    match buf[0] {
        1 => Ok(true),
        2 => Ok(false),
        other => Err(Error::Format(format!("invalid boolean octet {}", other))),
    }
}

pub fn write_bool(out: &mut [u8], value: bool) -> Result<()> {
    if out.is_empty() {
        return Err(Error::Buffer { needed: 1, available: 0 });
    }
    out[0] = if value { 1 } else { 2 };
    Ok(())
}

pub fn read_ipv4(buf: &[u8]) -> Result<Ipv4Addr> {
    if buf.len() != 4 {
        return Err(Error::Arg(format!("ipv4Address requires 4 bytes, got {}", buf.len())));
    }
    let octets: [u8; 4] = buf.try_into().unwrap();
    Ok(Ipv4Addr::from(octets))
}

pub fn write_ipv4(out: &mut [u8], value: Ipv4Addr) -> Result<()> {
    if out.len() < 4 {
        return Err(Error::Buffer { needed: 4, available: out.len() });
    }
    out[..4].copy_from_slice(&value.octets());
    Ok(())
}

/// IPv6 addresses are kept in network byte order; a v4-mapped-v6 address
/// (`::ffff:a.b.c.d`) is normalized to plain v4 by the session layer, not
/// here — this function is a straight wire accessor.
pub fn read_ipv6(buf: &[u8]) -> Result<Ipv6Addr> {
    if buf.len() != 16 {
        return Err(Error::Arg(format!("ipv6Address requires 16 bytes, got {}", buf.len())));
    }
    let octets: [u8; 16] = buf.try_into().unwrap();
    Ok(Ipv6Addr::from(octets))
}

pub fn write_ipv6(out: &mut [u8], value: Ipv6Addr) -> Result<()> {
    if out.len() < 16 {
        return Err(Error::Buffer { needed: 16, available: out.len() });
    }
    out[..16].copy_from_slice(&value.octets());
    Ok(())
}

pub fn read_mac(buf: &[u8]) -> Result<[u8; 6]> {
    if buf.len() != 6 {
        return Err(Error::Arg(format!("macAddress requires 6 bytes, got {}", buf.len())));
    }
    Ok(buf.try_into().unwrap())
}

pub fn write_mac(out: &mut [u8], value: [u8; 6]) -> Result<()> {
    if out.len() < 6 {
        return Err(Error::Buffer { needed: 6, available: out.len() });
    }
    out[..6].copy_from_slice(&value);
    Ok(())
}

/// UTF-8 strings per spec §4.1: malformed sequences are replaced with
/// U+FFFD rather than rejected, matching `String::from_utf8_lossy`.
pub fn read_string(buf: &[u8]) -> String {
    String::from_utf8_lossy(buf).into_owned()
}

pub fn read_octets(buf: &[u8]) -> Vec<u8> {
    buf.to_vec()
}

/// Escape C0/C1 control characters for RFC-7373-compatible text rendering.
pub fn format_escaped(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        let code = c as u32;
        if code < 0x20 || (0x7F..=0x9F).contains(&code) {
            out.push_str(&format!("\\x{:02x}", code));
        } else {
            out.push(c);
        }
    }
    out
}
