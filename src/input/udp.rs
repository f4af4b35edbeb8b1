//! UDP input stage (spec §4.2): peer tracking by first-packet arrival,
//! aging after `connection_timeout_s` of silence, version dispatch across
//! IPFIX/NetFlow v5/v9, malformed-datagram handling that never closes a
//! session (UDP has no connection to close).

use crate::bus::{Bus, BusMessage, SessionEventKind};
use crate::config::UdpInputConfig;
use crate::ipfix::header::{Header as IpfixHeader, VERSION};
use crate::ipfix::message::Message;
use crate::netflow::{V5Converter, V9Converter};
use crate::session::{NetTuple, Session};
use log::{debug, error, warn};
use std::collections::HashMap;
use std::convert::TryInto;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::{Duration, Instant};

const MIN_HEADER_PROBE: usize = 16;

enum PeerKind {
    Ipfix,
    V5(V5Converter),
    V9(V9Converter),
}

struct Peer {
    session: Arc<Session>,
    kind: Option<PeerKind>,
    last_seen: Instant,
}

/// Reads one version-tagged IPFIX/NetFlow v5/v9 datagram loop, emitting
/// `SessionOpen`/`SessionClose` and `Ipfix` messages to `bus` (spec §4.2
/// `open`/`get`). Runs on its own thread; there is no `close_session`
/// feedback handling because UDP "has no state to drop beyond the peer
/// record" (spec §4.2).
pub struct UdpInput {
    socket: UdpSocket,
    config: UdpInputConfig,
    peers: HashMap<SocketAddr, Peer>,
    last_aging_sweep: Instant,
}

impl UdpInput {
    pub fn open(config: UdpInputConfig) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(config.listen)?;
        socket.set_read_timeout(Some(Duration::from_millis(500)))?;
        log::info!("udp input listening on {}", config.listen);
        Ok(UdpInput { socket, config, peers: HashMap::new(), last_aging_sweep: Instant::now() })
    }

    fn age_peers(&mut self, bus: &Bus) {
        if self.last_aging_sweep.elapsed() < crate::config::UDP_PEER_AGING_INTERVAL {
            return;
        }
        self.last_aging_sweep = Instant::now();
        let timeout = Duration::from_secs(self.config.connection_timeout_s);
        let expired: Vec<SocketAddr> = self.peers.iter().filter(|(_, p)| p.last_seen.elapsed() >= timeout).map(|(addr, _)| *addr).collect();
        for addr in expired {
            if let Some(peer) = self.peers.remove(&addr) {
                debug!("{}: aged out after {}s of silence", peer.session, self.config.connection_timeout_s);
                bus.publish(BusMessage::SessionEvent(peer.session, SessionEventKind::Close));
            }
        }
    }

    fn peer_for(&mut self, from: SocketAddr, bus: &Bus) -> &mut Peer {
        let local = self.socket.local_addr().unwrap_or(self.config.listen);
        let tmplt_lifetime_s = self.config.tmplt_lifetime_s;
        let opts_tmplt_lifetime_s = self.config.opts_tmplt_lifetime_s;
        self.peers.entry(from).or_insert_with(|| {
            let net = NetTuple::new(from, local);
            let session = Arc::new(Session::new_udp(net, tmplt_lifetime_s, opts_tmplt_lifetime_s));
            log::info!("{}: new UDP peer", session);
            bus.publish(BusMessage::SessionEvent(session.clone(), SessionEventKind::Open));
            Peer { session, kind: None, last_seen: Instant::now() }
        })
    }

    /// Reads and dispatches one datagram (spec §4.2 `get`); runs the
    /// peer-aging sweep first so it executes even on `WouldBlock` timeouts.
    pub fn get(&mut self, bus: &Bus) {
        self.age_peers(bus);

        let mut buf = [0u8; crate::config::MAX_UDP_DATAGRAM];
        let (len, from) = match self.socket.recv_from(&mut buf) {
            Ok(v) => v,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut => return,
            Err(e) => {
                error!("udp input recv error: {}", e);
                return;
            }
        };
        let datagram = &buf[..len];

        if len < 2 {
            warn!("{}: datagram too small ({} bytes), dropped", from, len);
            return;
        }
        let version = u16::from_be_bytes(datagram[0..2].try_into().unwrap());
        if !matches!(version, 5 | 9 | VERSION) {
            warn!("{}: unrecognized version {}, datagram dropped", from, version);
            return;
        }
        if version != 5 && len < MIN_HEADER_PROBE {
            warn!("{}: datagram too small for a version {} header, dropped", from, version);
            return;
        }

        let v5_template_id = self.config.v5_template_id;
        let v5_refresh_interval_s = self.config.v5_refresh_interval_s;
        let peer = self.peer_for(from, bus);
        peer.last_seen = Instant::now();
        let session = peer.session.clone();

        let converted = match version {
            5 => {
                let conv = match peer.kind.get_or_insert_with(|| PeerKind::V5(V5Converter::new(v5_template_id, v5_refresh_interval_s))) {
                    PeerKind::V5(c) => c,
                    _ => {
                        warn!("{}: switched NetFlow version mid-session, dropped", session);
                        return;
                    }
                };
                conv.convert(datagram)
            }
            9 => {
                let conv = match peer.kind.get_or_insert_with(|| PeerKind::V9(V9Converter::new())) {
                    PeerKind::V9(c) => c,
                    _ => {
                        warn!("{}: switched NetFlow version mid-session, dropped", session);
                        return;
                    }
                };
                conv.convert(datagram)
            }
            _ => {
                peer.kind.get_or_insert(PeerKind::Ipfix);
                Ok((datagram.to_vec(), 0))
            }
        };

        let ipfix_bytes = match converted {
            Ok((bytes, seq_delta)) => {
                if seq_delta != 0 {
                    warn!("{}: sequence number diverged by {}", session, seq_delta);
                }
                bytes
            }
            Err(e) => {
                warn!("{}: malformed datagram dropped: {}", session, e);
                return;
            }
        };

        let header = match IpfixHeader::read(&ipfix_bytes) {
            Ok(h) => h,
            Err(e) => {
                warn!("{}: malformed IPFIX header after conversion, dropped: {}", session, e);
                return;
            }
        };
        if header.length as usize != ipfix_bytes.len() {
            warn!("{}: IPFIX length {} does not match datagram size {}, dropped", session, header.length, ipfix_bytes.len());
            return;
        }

        let odid = header.domain_id;
        let message = Message::new(ipfix_bytes, header, session, odid, 0);
        bus.publish(BusMessage::Ipfix(message));
    }

    /// Drives `get()` in a loop until told to stop (spec §5 "input stages
    /// also run ... a timer thread for UDP peer aging" — folded into the
    /// same loop here since `recv_from`'s read timeout already provides the
    /// periodic wakeup the aging sweep needs). `bus` is shared with any
    /// other input stage feeding the same parser, hence the `Arc`.
    pub fn run(mut self, bus: Arc<Bus>, stop: impl Fn() -> bool) {
        while !stop() {
            self.get(&bus);
        }
    }
}
