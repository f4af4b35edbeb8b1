//! TCP/SCTP input stage (spec §4.2): a single acceptor plus a readiness
//! sweep over accepted connections, all driven from one stage thread (spec
//! §5 "within a stage, work is strictly single-threaded"). There is no
//! `mio`/`epoll` dependency in this stack, so the "epoll-like readiness
//! set" is approximated with non-blocking sockets polled on each `get()`
//! call — functionally equivalent for this collector's purposes, recorded
//! as a simplification in DESIGN.md.
//!
//! SCTP (spec REDESIGN FLAGS) binds over this same `TcpListener` code path;
//! its additional stream id is carried by `Connection::stream`, defaulting
//! to 0 for plain TCP.

use crate::bus::{Bus, BusMessage, FeedbackMsg, FeedbackQueue, SessionEventKind};
use crate::config::TcpInputConfig;
use crate::ipfix::header::{Header as IpfixHeader, VERSION};
use crate::ipfix::message::Message;
use crate::session::{NetTuple, Session, StreamId};
use log::{info, warn};
use std::collections::HashMap;
use std::io::{ErrorKind, Read};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};

enum Framing {
    /// Waiting for the 16-byte IPFIX header.
    Header { buf: Vec<u8> },
    /// Header parsed; waiting for the remaining `length - 16` bytes.
    Body { header_bytes: Vec<u8>, buf: Vec<u8>, remaining: usize },
}

struct Connection {
    stream: TcpStream,
    session: Arc<Session>,
    stream_id: StreamId,
    framing: Framing,
    last_activity: Instant,
}

/// Drives the acceptor plus per-connection framing (spec §4.2 `open`/`get`)
/// and the feedback edge's `close_session_request`.
pub struct TcpInput {
    listener: TcpListener,
    connections: HashMap<SocketAddr, Connection>,
}

impl TcpInput {
    pub fn open(config: TcpInputConfig) -> std::io::Result<Self> {
        let listener = TcpListener::bind(config.listen)?;
        listener.set_nonblocking(true)?;
        info!("tcp input listening on {}", config.listen);
        Ok(TcpInput { listener, connections: HashMap::new() })
    }

    fn accept_new(&mut self, bus: &Bus) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer_addr)) => {
                    if stream.set_nonblocking(true).is_err() {
                        continue;
                    }
                    let local = stream.local_addr().unwrap_or(peer_addr);
                    let net = NetTuple::new(peer_addr, local);
                    let session = Arc::new(Session::new_tcp(net));
                    info!("{}: accepted TCP connection", session);
                    bus.publish(BusMessage::SessionEvent(session.clone(), SessionEventKind::Open));
                    self.connections.insert(
                        peer_addr,
                        Connection { stream, session, stream_id: 0, framing: Framing::Header { buf: Vec::with_capacity(IpfixHeader::SIZE) }, last_activity: Instant::now() },
                    );
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("tcp input accept error: {}", e);
                    break;
                }
            }
        }
    }

    fn close(&mut self, addr: SocketAddr, bus: &Bus) {
        if let Some(conn) = self.connections.remove(&addr) {
            info!("{}: connection closed", conn.session);
            let _ = conn.stream.shutdown(std::net::Shutdown::Both);
            bus.publish(BusMessage::SessionEvent(conn.session, SessionEventKind::Close));
        }
    }

    /// Reads whatever is ready on each connection and emits a complete
    /// `Ipfix` message the moment one finishes framing; stops at the first
    /// such message per call, same contract as `UdpInput::get`.
    pub fn get(&mut self, bus: &Bus) {
        self.accept_new(bus);

        let addrs: Vec<SocketAddr> = self.connections.keys().cloned().collect();
        for addr in addrs {
            let timed_out = {
                let conn = match self.connections.get(&addr) {
                    Some(c) => c,
                    None => continue,
                };
                conn.last_activity.elapsed() > crate::config::TCP_RECEIVE_TIMEOUT && !matches!(conn.framing, Framing::Header { ref buf } if buf.is_empty())
            };
            if timed_out {
                warn!("tcp connection at {}: receive timeout mid-message", addr);
                self.close(addr, bus);
                continue;
            }

            if let Some(outcome) = self.read_one(&addr) {
                match outcome {
                    Ok(ipfix_bytes) => {
                        let conn = self.connections.get(&addr).unwrap();
                        let session = conn.session.clone();
                        let stream_id = conn.stream_id;
                        match IpfixHeader::read(&ipfix_bytes) {
                            Ok(header) => {
                                let odid = header.domain_id;
                                bus.publish(BusMessage::Ipfix(Message::new(ipfix_bytes, header, session, odid, stream_id)));
                                return;
                            }
                            Err(e) => {
                                warn!("{}: {}", session, e);
                                self.close(addr, bus);
                            }
                        }
                    }
                    Err(reason) => {
                        if let Some(conn) = self.connections.get(&addr) {
                            warn!("{}: {}", conn.session, reason);
                        }
                        self.close(addr, bus);
                    }
                }
            }
        }
    }

    /// Advances one connection's framing state machine by whatever bytes
    /// are currently available. Returns `None` if nothing completed this
    /// call, `Some(Ok(bytes))` for a finished message, `Some(Err(reason))`
    /// on a header validation failure (spec §4.2 "rejects version != 0x000A
    /// and length < 16 ... the session is terminated").
    fn read_one(&mut self, addr: &SocketAddr) -> Option<Result<Vec<u8>, String>> {
        let conn = self.connections.get_mut(addr)?;
        loop {
            match &mut conn.framing {
                Framing::Header { buf } => {
                    let mut chunk = [0u8; IpfixHeader::SIZE];
                    let need = IpfixHeader::SIZE - buf.len();
                    match conn.stream.read(&mut chunk[..need]) {
                        Ok(0) => return Some(Err("peer closed connection".into())),
                        Ok(n) => {
                            buf.extend_from_slice(&chunk[..n]);
                            conn.last_activity = Instant::now();
                            if buf.len() < IpfixHeader::SIZE {
                                return None;
                            }
                            let version = u16::from_be_bytes([buf[0], buf[1]]);
                            let length = u16::from_be_bytes([buf[2], buf[3]]);
                            if version != VERSION || length < IpfixHeader::SIZE as u16 {
                                return Some(Err(format!("invalid IPFIX header (version=0x{:04x}, length={})", version, length)));
                            }
                            let header_bytes = std::mem::take(buf);
                            let remaining = length as usize - IpfixHeader::SIZE;
                            conn.framing = Framing::Body { header_bytes, buf: Vec::with_capacity(remaining), remaining };
                        }
                        Err(e) if e.kind() == ErrorKind::WouldBlock => return None,
                        Err(e) => return Some(Err(format!("read error: {}", e))),
                    }
                }
                Framing::Body { header_bytes, buf, remaining } => {
                    if *remaining == 0 {
                        let mut out = std::mem::take(header_bytes);
                        out.append(buf);
                        conn.framing = Framing::Header { buf: Vec::with_capacity(IpfixHeader::SIZE) };
                        return Some(Ok(out));
                    }
                    let mut chunk = vec![0u8; *remaining];
                    match conn.stream.read(&mut chunk) {
                        Ok(0) => return Some(Err("peer closed mid-message".into())),
                        Ok(n) => {
                            buf.extend_from_slice(&chunk[..n]);
                            *remaining -= n;
                            conn.last_activity = Instant::now();
                        }
                        Err(e) if e.kind() == ErrorKind::WouldBlock => return None,
                        Err(e) => return Some(Err(format!("read error: {}", e))),
                    }
                }
            }
        }
    }

    /// Feedback edge (spec §4.2 `close_session_request`): TCP tears the
    /// socket down and emits `SessionClose`.
    pub fn handle_feedback(&mut self, feedback: &FeedbackQueue, bus: &Bus) {
        for msg in feedback.try_recv_all() {
            let FeedbackMsg::CloseSession(session) = msg;
            let addr = self.connections.iter().find(|(_, c)| Arc::ptr_eq(&c.session, &session)).map(|(addr, _)| *addr);
            if let Some(addr) = addr {
                self.close(addr, bus);
            }
        }
    }

    /// `bus` is shared with any other input stage feeding the same parser,
    /// hence the `Arc`.
    pub fn run(mut self, bus: Arc<Bus>, feedback: FeedbackQueue, stop: impl Fn() -> bool) {
        while !stop() {
            self.handle_feedback(&feedback, &bus);
            self.get(&bus);
            if self.connections.is_empty() {
                std::thread::sleep(Duration::from_millis(10));
            }
        }
    }
}
