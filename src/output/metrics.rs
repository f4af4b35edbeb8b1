//! Pipeline counters exposed over the Prometheus text exposition format
//! (SPEC_FULL.md §2 ambient stack), generalized from the teacher's
//! `threads/prometheus.rs`, which served a static page with no real counters.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Metrics {
    pub messages_in: AtomicU64,
    pub messages_written: AtomicU64,
    pub records_written: AtomicU64,
    pub records_dropped: AtomicU64,
    pub bytes_written: AtomicU64,
    pub sessions_opened: AtomicU64,
    pub sessions_closed: AtomicU64,
    pub templates_emitted: AtomicU64,
    pub unknown_template_ids: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Metrics::default()
    }

    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Renders all counters in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let line = |out: &mut String, name: &str, help: &str, value: u64| {
            out.push_str(&format!("# HELP {name} {help}\n# TYPE {name} counter\n{name} {value}\n"));
        };
        line(&mut out, "ipfixcol_messages_in_total", "IPFIX messages received by the writer stage", self.messages_in.load(Ordering::Relaxed));
        line(&mut out, "ipfixcol_messages_written_total", "IPFIX messages written to output files", self.messages_written.load(Ordering::Relaxed));
        line(&mut out, "ipfixcol_records_written_total", "Data Records written to output files", self.records_written.load(Ordering::Relaxed));
        line(&mut out, "ipfixcol_records_dropped_total", "Data Records dropped (unresolved template, preserve_original=false)", self.records_dropped.load(Ordering::Relaxed));
        line(&mut out, "ipfixcol_bytes_written_total", "Bytes written to output files", self.bytes_written.load(Ordering::Relaxed));
        line(&mut out, "ipfixcol_sessions_opened_total", "Transport Sessions opened", self.sessions_opened.load(Ordering::Relaxed));
        line(&mut out, "ipfixcol_sessions_closed_total", "Transport Sessions closed", self.sessions_closed.load(Ordering::Relaxed));
        line(&mut out, "ipfixcol_templates_emitted_total", "Template records (re-)emitted by the writer", self.templates_emitted.load(Ordering::Relaxed));
        line(&mut out, "ipfixcol_unknown_template_ids_total", "Data Sets seen with an unresolved Template ID", self.unknown_template_ids.load(Ordering::Relaxed));
        out
    }
}
