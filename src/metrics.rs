use std::path::Path;

use anyhow::{Context, Result};
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

use crate::buffer::ConnEntry;
use crate::outcome;
use crate::prober::ProbeKind;

/// Counters for one probing run. Owned by the scheduler; rendered once at the
/// end for a node-exporter textfile collector.
pub struct RunMetrics {
    registry: Registry,
    started: IntCounterVec,
    results: IntCounterVec,
    latency: HistogramVec,
    in_flight: IntGauge,
}

impl RunMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let started = IntCounterVec::new(
            Opts::new("dial_probe_connections_started_total", "Connection attempts started"),
            &["protocol"],
        )?;
        let results = IntCounterVec::new(
            Opts::new("dial_probe_results_total", "Resolved connection attempts by outcome"),
            &["protocol", "result"],
        )?;
        let latency = HistogramVec::new(
            HistogramOpts::new(
                "dial_probe_connect_latency_seconds",
                "Dial time of successful connections in seconds",
            )
            .buckets(vec![
                0.0005, 0.001, 0.002, 0.005, 0.01, 0.02, 0.05, 0.1, 0.2, 0.5, 1.0, 2.0, 5.0, 10.0,
            ]),
            &["protocol"],
        )?;
        let in_flight = IntGauge::new("dial_probe_in_flight", "Connection attempts in progress")?;

        registry.register(Box::new(started.clone()))?;
        registry.register(Box::new(results.clone()))?;
        registry.register(Box::new(latency.clone()))?;
        registry.register(Box::new(in_flight.clone()))?;

        Ok(Self {
            registry,
            started,
            results,
            latency,
            in_flight,
        })
    }

    pub fn observe_start(&self, kind: ProbeKind) {
        self.started.with_label_values(&[kind_label(kind)]).inc();
    }

    pub fn observe_result(&self, kind: ProbeKind, entry: &ConnEntry) {
        self.results
            .with_label_values(&[kind_label(kind), outcome::label(entry.result)])
            .inc();
        if entry.result == outcome::SUCCESS {
            self.latency
                .with_label_values(&[kind_label(kind)])
                .observe(entry.elapsed_ns as f64 * 1e-9);
        }
    }

    pub fn set_in_flight(&self, n: usize) {
        self.in_flight.set(n as i64);
    }

    pub fn result_count(&self, kind: ProbeKind, code: u16) -> u64 {
        self.results
            .with_label_values(&[kind_label(kind), outcome::label(code)])
            .get()
    }

    pub fn render(&self) -> Result<Vec<u8>> {
        let encoder = TextEncoder::new();
        let mut buf = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buf)?;
        Ok(buf)
    }

    /// Write the rendered registry next to `path` and rename it into place,
    /// so a collector never reads a half-written file.
    pub fn write_textfile(&self, path: &Path) -> Result<()> {
        let tmp = path.with_extension("prom.tmp");
        std::fs::write(&tmp, self.render()?)
            .with_context(|| format!("writing {}", tmp.display()))?;
        std::fs::rename(&tmp, path).with_context(|| format!("renaming to {}", path.display()))?;
        Ok(())
    }
}

fn kind_label(kind: ProbeKind) -> &'static str {
    match kind {
        ProbeKind::Direct => "direct",
        ProbeKind::Socks5 => "socks5",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_results_and_renders() {
        let m = RunMetrics::new().unwrap();
        let mut ok = ConnEntry::new("127.0.0.1:80".parse().unwrap());
        ok.finish(outcome::SUCCESS, 2_000_000);
        let mut refused = ok;
        refused.finish(outcome::CONN_REFUSED, 10_000);

        m.observe_start(ProbeKind::Direct);
        m.observe_start(ProbeKind::Direct);
        m.observe_result(ProbeKind::Direct, &ok);
        m.observe_result(ProbeKind::Direct, &refused);
        m.set_in_flight(0);

        assert_eq!(m.result_count(ProbeKind::Direct, outcome::SUCCESS), 1);
        assert_eq!(m.result_count(ProbeKind::Direct, outcome::CONN_REFUSED), 1);

        let text = String::from_utf8(m.render().unwrap()).unwrap();
        assert!(text.contains("dial_probe_connections_started_total{protocol=\"direct\"} 2"));
        assert!(text.contains("dial_probe_results_total{protocol=\"direct\",result=\"refused\"} 1"));
        assert!(text.contains("dial_probe_connect_latency_seconds_count{protocol=\"direct\"} 1"));
    }
}
