//! Transport Session identity (spec §3, §4.2).
//!
//! A `Session` is shared (`Arc`-wrapped by callers), immutable after
//! construction, and destroyed only by passing its `Arc` through a Garbage
//! message — mirroring the teacher's plain structs but adding the identity
//! and lifetime rules the spec requires across pipeline stages.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};

/// Normalizes a v4-mapped-v6 address (`::ffff:a.b.c.d`) down to plain v4, as
/// required by spec §3 ("v4-mapped-v6 is normalized to v4").
pub fn normalize_addr(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        v4 => v4,
    }
}

/// Source/destination endpoint pair of a Transport Session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NetTuple {
    pub src: SocketAddr,
    pub dst: SocketAddr,
}

impl NetTuple {
    pub fn new(src: SocketAddr, dst: SocketAddr) -> Self {
        NetTuple {
            src: SocketAddr::new(normalize_addr(src.ip()), src.port()),
            dst: SocketAddr::new(normalize_addr(dst.ip()), dst.port()),
        }
    }
}

impl fmt::Display for NetTuple {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}->{}", self.src, self.dst)
    }
}

/// 0-based stream identifier within a Transport Session; always 0 except for
/// SCTP (spec §3).
pub type StreamId = u16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Udp,
    Tcp,
    Sctp,
    File,
}

/// Transport Session identity, immutable after construction (spec §3).
#[derive(Debug)]
pub enum Session {
    Udp {
        net: NetTuple,
        tmplt_lifetime_s: u32,
        opts_lifetime_s: u32,
        ident: String,
    },
    Tcp {
        net: NetTuple,
        ident: String,
    },
    Sctp {
        net: NetTuple,
        ident: String,
    },
    File {
        path: String,
        ident: String,
    },
}

static SESSION_SEQ: AtomicU64 = AtomicU64::new(1);

impl Session {
    pub fn new_udp(net: NetTuple, tmplt_lifetime_s: u32, opts_lifetime_s: u32) -> Self {
        let id = SESSION_SEQ.fetch_add(1, Ordering::Relaxed);
        Session::Udp {
            net,
            tmplt_lifetime_s,
            opts_lifetime_s,
            ident: format!("udp#{}:{}", id, net),
        }
    }

    pub fn new_tcp(net: NetTuple) -> Self {
        let id = SESSION_SEQ.fetch_add(1, Ordering::Relaxed);
        Session::Tcp { net, ident: format!("tcp#{}:{}", id, net) }
    }

    pub fn new_sctp(net: NetTuple) -> Self {
        let id = SESSION_SEQ.fetch_add(1, Ordering::Relaxed);
        Session::Sctp { net, ident: format!("sctp#{}:{}", id, net) }
    }

    pub fn new_file(path: impl Into<String>) -> Self {
        let id = SESSION_SEQ.fetch_add(1, Ordering::Relaxed);
        let path = path.into();
        Session::File { ident: format!("file#{}:{}", id, path), path }
    }

    pub fn protocol(&self) -> Protocol {
        match self {
            Session::Udp { .. } => Protocol::Udp,
            Session::Tcp { .. } => Protocol::Tcp,
            Session::Sctp { .. } => Protocol::Sctp,
            Session::File { .. } => Protocol::File,
        }
    }

    pub fn ident(&self) -> &str {
        match self {
            Session::Udp { ident, .. } => ident,
            Session::Tcp { ident, .. } => ident,
            Session::Sctp { ident, .. } => ident,
            Session::File { ident, .. } => ident,
        }
    }

    pub fn net(&self) -> Option<NetTuple> {
        match self {
            Session::Udp { net, .. } => Some(*net),
            Session::Tcp { net, .. } => Some(*net),
            Session::Sctp { net, .. } => Some(*net),
            Session::File { .. } => None,
        }
    }

    /// Whether templates on this session are monotonic (TCP/SCTP: never
    /// redefined, only withdrawn) vs freely redefinable (UDP).
    pub fn is_reliable(&self) -> bool {
        matches!(self, Session::Tcp { .. } | Session::Sctp { .. })
    }

    pub fn template_lifetime_s(&self) -> Option<u32> {
        match self {
            Session::Udp { tmplt_lifetime_s, .. } => Some(*tmplt_lifetime_s),
            _ => None,
        }
    }

    pub fn opts_template_lifetime_s(&self) -> Option<u32> {
        match self {
            Session::Udp { opts_lifetime_s, .. } => Some(*opts_lifetime_s),
            _ => None,
        }
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.ident())
    }
}

// Sessions are compared and hashed by identity (pointer-equivalent via the
// monotonic ident), not by structural content: two sessions that happen to
// reuse the same 4-tuple after a reconnect are still distinct sessions.
impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        self.ident() == other.ident()
    }
}
impl Eq for Session {}

impl std::hash::Hash for Session {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.ident().hash(state);
    }
}
