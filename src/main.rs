use ipfixcol::bus::{Bus, FeedbackQueue, OdidFilter};
use ipfixcol::config::{PipelineConfig, PrometheusConfig, TcpInputConfig, UdpInputConfig, WriterConfig};
use ipfixcol::input::{TcpInput, UdpInput};
use ipfixcol::output::{Metrics, Writer};
use ipfixcol::pipeline::{run_stage, ParserStage};
use log::{info, LevelFilter};
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(name = "ipfixcol", about = "IPFIX/NetFlow v5/v9 flow-record collector")]
struct Opts {
    /// Log level to use
    #[structopt(long = "log-level", default_value = "info")]
    log_level: LevelFilter,

    /// IP:port for the UDP listener (IPFIX, NetFlow v5, NetFlow v9)
    #[structopt(short = "u", long = "udp-listen", default_value = "0.0.0.0:4739")]
    udp_listen: SocketAddr,

    /// Silence after which a UDP peer's session is aged out
    #[structopt(long = "udp-session-timeout", default_value = "3600")]
    udp_session_timeout_s: u64,

    /// IP:port for the TCP/SCTP listener; omit to disable reliable-transport input
    #[structopt(short = "t", long = "tcp-listen")]
    tcp_listen: Option<SocketAddr>,

    /// strftime pattern for output file names
    #[structopt(long = "output-pattern", default_value = "%Y%m%d%H%M%S.ipfix")]
    output_pattern: String,

    /// Output file rotation window, in seconds
    #[structopt(long = "window-size", default_value = "300")]
    window_size_s: u32,

    /// Keep records whose template could not be resolved instead of dropping them
    #[structopt(long = "preserve-original")]
    preserve_original: bool,

    /// IP:port to serve Prometheus metrics on; omit to disable
    #[structopt(short = "m", long = "metrics-listen")]
    metrics_listen: Option<SocketAddr>,

    /// Per-stage bus queue depth
    #[structopt(long = "bus-capacity", default_value = "256")]
    bus_capacity: usize,
}

fn build_config(opts: &Opts) -> PipelineConfig {
    let mut config = PipelineConfig::new();
    config.bus_capacity = opts.bus_capacity;
    config.udp_inputs.push(UdpInputConfig {
        listen: opts.udp_listen,
        connection_timeout_s: opts.udp_session_timeout_s,
        v5_template_id: 256,
        v5_refresh_interval_s: 60,
        tmplt_lifetime_s: config.tmgr.tmplt_lifetime_s,
        opts_tmplt_lifetime_s: config.tmgr.opts_tmplt_lifetime_s,
    });
    if let Some(listen) = opts.tcp_listen {
        config.tcp_inputs.push(TcpInputConfig { listen });
    }
    config.writer = WriterConfig { filename_pattern: opts.output_pattern.clone(), window_size_s: opts.window_size_s, preserve_original: opts.preserve_original, ..WriterConfig::default() };
    config.prometheus = opts.metrics_listen.map(|listen| PrometheusConfig { listen });
    config
}

fn main() {
    let opts = Opts::from_args();
    env_logger::Builder::new().format_timestamp_millis().filter(None, opts.log_level).init();
    info!("starting ipfixcol");

    let config = build_config(&opts);
    let metrics = Arc::new(Metrics::new());

    // input stages (UDP, TCP) -> parser
    let mut input_bus = Bus::new();
    let parser_rx = input_bus.subscribe(config.bus_capacity, OdidFilter::None);
    let input_bus = Arc::new(input_bus);

    // parser -> writer
    let mut parser_bus = Bus::new();
    let writer_rx = parser_bus.subscribe(config.bus_capacity, OdidFilter::None);

    let mut feedback = Some(FeedbackQueue::new(config.bus_capacity));
    let feedback_sender = feedback.as_ref().unwrap().sender();

    let mut threads = Vec::new();

    for udp_config in config.udp_inputs {
        let udp = match UdpInput::open(udp_config) {
            Ok(u) => u,
            Err(e) => {
                log::error!("failed to open UDP input: {}", e);
                continue;
            }
        };
        let bus = input_bus.clone();
        threads.push(thread::Builder::new().name("udp-input".into()).spawn(move || udp.run(bus, || false)).unwrap());
    }

    // `FeedbackQueue`'s receiver end is exclusive, so only the first TCP
    // input can be wired to the parser's close_session requests; additional
    // TCP listeners are an unusual deployment and get their own queue that
    // nothing ever sends on.
    let bus_capacity = config.bus_capacity;
    for tcp_config in config.tcp_inputs {
        let tcp = match TcpInput::open(tcp_config) {
            Ok(t) => t,
            Err(e) => {
                log::error!("failed to open TCP input: {}", e);
                continue;
            }
        };
        let bus = input_bus.clone();
        let feedback_queue = feedback.take().unwrap_or_else(|| FeedbackQueue::new(bus_capacity));
        threads.push(thread::Builder::new().name("tcp-input".into()).spawn(move || tcp.run(bus, feedback_queue, || false)).unwrap());
    }

    {
        let tmgr_config = config.tmgr.clone();
        threads.push(
            thread::Builder::new()
                .name("parser".into())
                .spawn(move || {
                    let stage = ParserStage::new(&tmgr_config, feedback_sender);
                    run_stage("parser", parser_rx, &parser_bus, stage);
                })
                .unwrap(),
        );
    }

    {
        let writer_config = config.writer.clone();
        let writer_metrics = metrics.clone();
        threads.push(
            thread::Builder::new()
                .name("writer".into())
                .spawn(move || {
                    let stage = Writer::new(writer_config).with_metrics(writer_metrics);
                    let terminal_bus = Bus::new();
                    run_stage("writer", writer_rx, &terminal_bus, stage);
                })
                .unwrap(),
        );
    }

    if let Some(prometheus_config) = config.prometheus {
        let prometheus_metrics = metrics.clone();
        threads.push(
            thread::Builder::new()
                .name("prometheus".into())
                .spawn(move || {
                    if let Err(e) = ipfixcol::output::prometheus::listen(prometheus_config.listen, prometheus_metrics, || false) {
                        log::error!("prometheus listener stopped: {}", e);
                    }
                })
                .unwrap(),
        );
    }

    for t in threads {
        let _ = t.join();
    }

    info!("closing ipfixcol");
}
