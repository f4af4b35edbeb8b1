//! The four IPFIX timestamp precisions (spec §4.1).
//!
//! `seconds`/`milliseconds` are plain Unix-epoch counters. `microseconds` and
//! `nanoseconds` are NTP-style: 32-bit seconds since the NTP epoch
//! (1900-01-01) plus a 32-bit binary fraction of a second: bit `k` (counting
//! from the MSB, 0-indexed) of the fraction is worth `2^-(k+1)` seconds.
//! Microsecond precision clears the low 11 bits of the fraction, since a
//! microsecond (2^-20 s) needs only the top 21 fraction bits.
//!
//! Dates at or beyond 2036-02-07 06:28:16 UTC (when the 32-bit NTP seconds
//! field wraps) are out of scope (spec §1); callers must not rely on this
//! module for timestamps past that point.

use crate::error::{Error, Result};
use std::convert::TryInto;

const NTP_UNIX_EPOCH_DELTA: u64 = 2_208_988_800; // seconds, 1900-01-01 -> 1970-01-01
const FRAC_PER_SEC: f64 = 4_294_967_296.0; // 2^32

pub fn read_seconds(buf: &[u8]) -> Result<u32> {
    if buf.len() != 4 {
        return Err(Error::Arg(format!("dateTimeSeconds requires 4 bytes, got {}", buf.len())));
    }
    Ok(u32::from_be_bytes(buf.try_into().unwrap()))
}

pub fn write_seconds(out: &mut [u8], unix_secs: u32) -> Result<()> {
    if out.len() < 4 {
        return Err(Error::Buffer { needed: 4, available: out.len() });
    }
    out[..4].copy_from_slice(&unix_secs.to_be_bytes());
    Ok(())
}

pub fn read_millis(buf: &[u8]) -> Result<u64> {
    if buf.len() != 8 {
        return Err(Error::Arg(format!("dateTimeMilliseconds requires 8 bytes, got {}", buf.len())));
    }
    Ok(u64::from_be_bytes(buf.try_into().unwrap()))
}

pub fn write_millis(out: &mut [u8], unix_millis: u64) -> Result<()> {
    if out.len() < 8 {
        return Err(Error::Buffer { needed: 8, available: out.len() });
    }
    out[..8].copy_from_slice(&unix_millis.to_be_bytes());
    Ok(())
}

fn ntp_to_unix_nanos(seconds: u32, fraction: u32) -> u128 {
    let secs_since_unix = seconds as u64 - NTP_UNIX_EPOCH_DELTA;
    let frac_nanos = (fraction as f64 / FRAC_PER_SEC * 1_000_000_000.0).round() as u64;
    secs_since_unix as u128 * 1_000_000_000 + frac_nanos as u128
}

fn unix_nanos_to_ntp(unix_nanos: u128) -> (u32, u32) {
    let secs = (unix_nanos / 1_000_000_000) as u64 + NTP_UNIX_EPOCH_DELTA;
    let nanos_rem = (unix_nanos % 1_000_000_000) as f64;
    let frac = (nanos_rem / 1_000_000_000.0 * FRAC_PER_SEC).round() as u64;
    // a rounded fraction of 2^32 wraps into the next second
    let (secs, frac) = if frac >= 1u64 << 32 { (secs + 1, 0) } else { (secs, frac) };
    (secs as u32, frac as u32)
}

/// Returns Unix nanoseconds since epoch, truncated to microsecond precision.
pub fn read_micros(buf: &[u8]) -> Result<u64> {
    if buf.len() != 8 {
        return Err(Error::Arg(format!("dateTimeMicroseconds requires 8 bytes, got {}", buf.len())));
    }
    let seconds = u32::from_be_bytes(buf[0..4].try_into().unwrap());
    let fraction = u32::from_be_bytes(buf[4..8].try_into().unwrap());
    let nanos = ntp_to_unix_nanos(seconds, fraction);
    Ok((nanos / 1000) as u64)
}

pub fn write_micros(out: &mut [u8], unix_micros: u64) -> Result<()> {
    if out.len() < 8 {
        return Err(Error::Buffer { needed: 8, available: out.len() });
    }
    let (seconds, mut fraction) = unix_nanos_to_ntp(unix_micros as u128 * 1000);
    // clear the low 11 bits: microsecond precision only needs the top 21
    fraction &= !0x7FF;
    out[0..4].copy_from_slice(&seconds.to_be_bytes());
    out[4..8].copy_from_slice(&fraction.to_be_bytes());
    Ok(())
}

pub fn read_nanos(buf: &[u8]) -> Result<u64> {
    if buf.len() != 8 {
        return Err(Error::Arg(format!("dateTimeNanoseconds requires 8 bytes, got {}", buf.len())));
    }
    let seconds = u32::from_be_bytes(buf[0..4].try_into().unwrap());
    let fraction = u32::from_be_bytes(buf[4..8].try_into().unwrap());
    Ok(ntp_to_unix_nanos(seconds, fraction) as u64)
}

pub fn write_nanos(out: &mut [u8], unix_nanos: u64) -> Result<()> {
    if out.len() < 8 {
        return Err(Error::Buffer { needed: 8, available: out.len() });
    }
    let (seconds, fraction) = unix_nanos_to_ntp(unix_nanos as u128);
    out[0..4].copy_from_slice(&seconds.to_be_bytes());
    out[4..8].copy_from_slice(&fraction.to_be_bytes());
    Ok(())
}
