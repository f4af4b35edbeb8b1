//! Pipeline configuration surface (SPEC_FULL.md §2 "Configuration
//! surface"). The real system is wired from an XML plugin graph; that
//! loader is out of scope (spec §1), so `PipelineConfig` is the value such
//! a loader would produce, built directly from CLI flags by `main.rs` or
//! from struct literals in tests.

use serde_derive::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// UDP peer aging interval (spec §5 Timeouts "~2s").
pub const UDP_PEER_AGING_INTERVAL: Duration = Duration::from_secs(2);

/// TCP per-message receive timeout once the 16-byte header is in hand
/// (spec §4.2, §5 "~500ms").
pub const TCP_RECEIVE_TIMEOUT: Duration = Duration::from_millis(500);

/// Acceptor/readiness poll interval (spec §5 "epoll wait ~10ms").
pub const EPOLL_WAIT: Duration = Duration::from_millis(10);

/// UDP datagrams larger than this cannot be a single IPFIX/NetFlow message
/// (spec §4.2 "max usable size 65000 bytes").
pub const MAX_UDP_DATAGRAM: usize = 65_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateManagerConfig {
    pub tmplt_lifetime_s: u32,
    pub opts_tmplt_lifetime_s: u32,
    pub snapshot_timeout_s: u32,
}

impl Default for TemplateManagerConfig {
    fn default() -> Self {
        TemplateManagerConfig { tmplt_lifetime_s: 1800, opts_tmplt_lifetime_s: 1800, snapshot_timeout_s: 5 }
    }
}

/// UDP-session aging and NetFlow-converter knobs (spec §4.2, §4.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UdpInputConfig {
    pub listen: SocketAddr,
    pub connection_timeout_s: u64,
    pub v5_template_id: u16,
    pub v5_refresh_interval_s: u32,
    /// Per-session Template/Options Template lifetimes (spec §4.4), carried
    /// on `Session::Udp` itself so the Template Manager never needs a
    /// back-reference to this config.
    pub tmplt_lifetime_s: u32,
    pub opts_tmplt_lifetime_s: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpInputConfig {
    pub listen: SocketAddr,
}

/// IPFIX-file writer options (spec §4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriterConfig {
    /// strftime pattern for output file names.
    pub filename_pattern: String,
    pub use_local_time: bool,
    pub window_size_s: u32,
    pub align_windows: bool,
    pub preserve_original: bool,
    pub rotate_on_export_time: bool,
}

impl Default for WriterConfig {
    fn default() -> Self {
        WriterConfig {
            filename_pattern: "%Y%m%d%H%M%S.ipfix".into(),
            use_local_time: false,
            window_size_s: 300,
            align_windows: true,
            preserve_original: false,
            rotate_on_export_time: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrometheusConfig {
    pub listen: SocketAddr,
}

/// The full plugin graph for one collector process: any number of input
/// stages feeding one parser/writer chain, plus an optional metrics sink.
/// `Serialize`/`Deserialize` let a future XML-or-otherwise config loader
/// populate this directly instead of hand-assembling it from CLI flags.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub udp_inputs: Vec<UdpInputConfig>,
    pub tcp_inputs: Vec<TcpInputConfig>,
    pub tmgr: TemplateManagerConfig,
    pub writer: WriterConfig,
    pub prometheus: Option<PrometheusConfig>,
    pub bus_capacity: usize,
}

impl PipelineConfig {
    pub fn new() -> Self {
        PipelineConfig { bus_capacity: 256, ..Default::default() }
    }
}
