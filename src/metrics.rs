//! Prometheus metrics for the restaking data service.

use prometheus::{Encoder, Gauge, IntGaugeVec, Opts, Registry, TextEncoder};

use crate::sync::{CycleSummary, SourceReport};

/// Names of the refresh sources, in summary order.
pub const SOURCES: [&str; 4] = ["restakers", "validators", "rewards", "slashes"];

/// Prometheus metrics for the restaking data service.
#[derive(Clone, Debug)]
pub struct PrometheusMetrics {
    registry: Registry,

    /// Wall-clock duration of the last refresh cycle, in seconds.
    pub cycle_duration: Gauge,
    /// Rows inserted by the last refresh cycle, per source.
    pub source_inserted: IntGaugeVec,
    /// Store write failures in the last refresh cycle, per source.
    pub source_errors: IntGaugeVec,
    /// Whether each source served live data in the last cycle (0 = fallback).
    pub source_live: IntGaugeVec,
}

impl Default for PrometheusMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl PrometheusMetrics {
    /// Create a new metrics instance with all gauges registered.
    pub fn new() -> Self {
        let registry = Registry::new();

        let cycle_duration = Gauge::with_opts(Opts::new(
            "cycle_duration_seconds",
            "Wall-clock duration of the last refresh cycle",
        ))
        .expect("failed to create cycle_duration gauge");
        registry
            .register(Box::new(cycle_duration.clone()))
            .expect("failed to register cycle_duration gauge");

        let source_inserted = IntGaugeVec::new(
            Opts::new(
                "source_inserted",
                "Rows inserted by the last refresh cycle, per source",
            ),
            &["source"],
        )
        .expect("failed to create source_inserted gauge");
        registry
            .register(Box::new(source_inserted.clone()))
            .expect("failed to register source_inserted gauge");

        let source_errors = IntGaugeVec::new(
            Opts::new(
                "source_errors",
                "Store write failures in the last refresh cycle, per source",
            ),
            &["source"],
        )
        .expect("failed to create source_errors gauge");
        registry
            .register(Box::new(source_errors.clone()))
            .expect("failed to register source_errors gauge");

        let source_live = IntGaugeVec::new(
            Opts::new(
                "source_live",
                "Whether each source served live data in the last cycle (0 = fallback)",
            ),
            &["source"],
        )
        .expect("failed to create source_live gauge");
        registry
            .register(Box::new(source_live.clone()))
            .expect("failed to register source_live gauge");

        Self {
            registry,
            cycle_duration,
            source_inserted,
            source_errors,
            source_live,
        }
    }

    /// Record the outcome of a completed refresh cycle.
    pub fn record_cycle(&self, summary: &CycleSummary) {
        self.cycle_duration.set(summary.duration.as_secs_f64());
        for (name, report) in SOURCES.into_iter().zip([
            &summary.restakers,
            &summary.validators,
            &summary.rewards,
            &summary.slashes,
        ]) {
            self.record_source(name, report);
        }
    }

    fn record_source(&self, name: &str, report: &SourceReport) {
        self.source_inserted
            .with_label_values(&[name])
            .set(report.inserted as i64);
        self.source_errors
            .with_label_values(&[name])
            .set(report.errors as i64);
        self.source_live
            .with_label_values(&[name])
            .set(if report.fallback { 0 } else { 1 });
    }
}

impl tide_disco::metrics::Metrics for PrometheusMetrics {
    type Error = prometheus::Error;

    fn export(&self) -> Result<String, Self::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = vec![];
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|err| {
            prometheus::Error::Msg(format!("metrics output is not valid UTF-8: {err}"))
        })
    }
}
