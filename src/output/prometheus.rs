//! Metrics HTTP endpoint (SPEC_FULL.md §2), adapted from the teacher's
//! `threads/prometheus.rs`: same blocking-`TcpListener`-per-connection shape,
//! but serving the real counters in `Metrics` instead of a static page.

use crate::output::metrics::Metrics;
use log::{error, info};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;

pub fn listen(addr: SocketAddr, metrics: Arc<Metrics>, stop: impl Fn() -> bool) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr)?;
    listener.set_nonblocking(true)?;
    info!("prometheus metrics endpoint listening on {}", addr);

    while !stop() {
        match listener.accept() {
            Ok((stream, _)) => handle_connection(stream, &metrics),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(crate::config::EPOLL_WAIT);
            }
            Err(e) => error!("prometheus endpoint accept error: {}", e),
        }
    }
    Ok(())
}

fn handle_connection(mut stream: TcpStream, metrics: &Metrics) {
    let mut buf = [0u8; 1024];
    // We don't route on path or method: this endpoint serves exactly one
    // resource, so any request gets the same response.
    let _ = stream.read(&mut buf);

    let body = metrics.render();
    let response = format!("HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\n\r\n{}", body.len(), body);
    if let Err(e) = stream.write_all(response.as_bytes()) {
        error!("prometheus endpoint write error: {}", e);
    }
    let _ = stream.flush();
}
