//! Process-wide telemetry: counters, gauges, histograms, and the textual
//! exposition served at `/metrics`.
//!
//! Series are registered exactly once; re-registering a name returns a handle
//! to the existing series. Handles are cheap to clone and safe to update
//! concurrently. Counters are monotone: negative deltas are ignored.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex, RwLock};

/// Histogram bucket upper bounds in seconds.
pub const HISTOGRAM_BUCKETS: [f64; 11] = [
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SeriesKind {
    Counter,
    Gauge,
    Histogram,
}

impl SeriesKind {
    fn type_name(&self) -> &'static str {
        match self {
            SeriesKind::Counter => "counter",
            SeriesKind::Gauge => "gauge",
            SeriesKind::Histogram => "histogram",
        }
    }
}

#[derive(Debug, Clone)]
enum Sample {
    Value(f64),
    Histogram {
        buckets: [u64; HISTOGRAM_BUCKETS.len()],
        sum: f64,
        count: u64,
    },
}

/// One registered series: name, help text, label schema, and samples keyed by
/// label values.
struct Series {
    name: String,
    kind: SeriesKind,
    help: String,
    label_names: Vec<String>,
    samples: Mutex<BTreeMap<Vec<String>, Sample>>,
}

impl Series {
    fn update(&self, label_values: &[&str], f: impl FnOnce(&mut Sample)) {
        if label_values.len() != self.label_names.len() {
            tracing::warn!(
                series = %self.name,
                expected = self.label_names.len(),
                got = label_values.len(),
                "label cardinality mismatch, sample dropped"
            );
            return;
        }
        let key: Vec<String> = label_values.iter().map(|s| s.to_string()).collect();
        let mut samples = self.samples.lock().expect("telemetry lock poisoned");
        let entry = samples.entry(key).or_insert_with(|| match self.kind {
            SeriesKind::Histogram => Sample::Histogram {
                buckets: [0; HISTOGRAM_BUCKETS.len()],
                sum: 0.0,
                count: 0,
            },
            _ => Sample::Value(0.0),
        });
        f(entry);
    }

    fn read(&self, label_values: &[&str]) -> Option<Sample> {
        let key: Vec<String> = label_values.iter().map(|s| s.to_string()).collect();
        self.samples
            .lock()
            .expect("telemetry lock poisoned")
            .get(&key)
            .cloned()
    }
}

/// Monotone counter handle.
#[derive(Clone)]
pub struct Counter(Arc<Series>);

impl Counter {
    /// Add `delta` to the sample for `labels`. Negative deltas are ignored.
    pub fn inc(&self, labels: &[&str], delta: f64) {
        if delta < 0.0 {
            return;
        }
        self.0.update(labels, |s| {
            if let Sample::Value(v) = s {
                *v += delta;
            }
        });
    }

    /// Current value for `labels`, 0 if never incremented.
    pub fn value(&self, labels: &[&str]) -> f64 {
        match self.0.read(labels) {
            Some(Sample::Value(v)) => v,
            _ => 0.0,
        }
    }
}

/// Freely mutable gauge handle.
#[derive(Clone)]
pub struct Gauge(Arc<Series>);

impl Gauge {
    pub fn set(&self, labels: &[&str], value: f64) {
        self.0.update(labels, |s| {
            if let Sample::Value(v) = s {
                *v = value;
            }
        });
    }

    /// Add `delta` (may be negative) to the sample for `labels`.
    pub fn add(&self, labels: &[&str], delta: f64) {
        self.0.update(labels, |s| {
            if let Sample::Value(v) = s {
                *v += delta;
            }
        });
    }

    pub fn value(&self, labels: &[&str]) -> f64 {
        match self.0.read(labels) {
            Some(Sample::Value(v)) => v,
            _ => 0.0,
        }
    }
}

/// Histogram handle with the fixed bucket schedule.
#[derive(Clone)]
pub struct Histogram(Arc<Series>);

impl Histogram {
    /// Record one observation in seconds.
    pub fn observe(&self, labels: &[&str], seconds: f64) {
        self.0.update(labels, |s| {
            if let Sample::Histogram {
                buckets,
                sum,
                count,
            } = s
            {
                for (i, bound) in HISTOGRAM_BUCKETS.iter().enumerate() {
                    if seconds <= *bound {
                        buckets[i] += 1;
                    }
                }
                *sum += seconds;
                *count += 1;
            }
        });
    }

    /// Total observation count for `labels`.
    pub fn count(&self, labels: &[&str]) -> u64 {
        match self.0.read(labels) {
            Some(Sample::Histogram { count, .. }) => count,
            _ => 0,
        }
    }
}

/// Registry of all telemetry series. One instance per process, constructed at
/// startup and passed down as a handle.
#[derive(Default)]
pub struct TelemetryRegistry {
    series: RwLock<BTreeMap<String, Arc<Series>>>,
}

impl TelemetryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(
        &self,
        name: &str,
        kind: SeriesKind,
        help: &str,
        label_names: &[&str],
    ) -> Arc<Series> {
        {
            let series = self.series.read().expect("telemetry lock poisoned");
            if let Some(existing) = series.get(name) {
                if existing.kind != kind {
                    tracing::warn!(
                        series = %name,
                        "re-registered with different kind, keeping original"
                    );
                }
                return existing.clone();
            }
        }
        let mut series = self.series.write().expect("telemetry lock poisoned");
        series
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(Series {
                    name: name.to_string(),
                    kind,
                    help: help.to_string(),
                    label_names: label_names.iter().map(|s| s.to_string()).collect(),
                    samples: Mutex::new(BTreeMap::new()),
                })
            })
            .clone()
    }

    pub fn counter(&self, name: &str, help: &str, labels: &[&str]) -> Counter {
        Counter(self.register(name, SeriesKind::Counter, help, labels))
    }

    pub fn gauge(&self, name: &str, help: &str, labels: &[&str]) -> Gauge {
        Gauge(self.register(name, SeriesKind::Gauge, help, labels))
    }

    pub fn histogram(&self, name: &str, help: &str, labels: &[&str]) -> Histogram {
        Histogram(self.register(name, SeriesKind::Histogram, help, labels))
    }

    /// Render every series in the Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(4096);
        let series = self.series.read().expect("telemetry lock poisoned");
        for s in series.values() {
            let _ = writeln!(out, "# HELP {} {}", s.name, s.help);
            let _ = writeln!(out, "# TYPE {} {}", s.name, s.kind.type_name());
            let samples = s.samples.lock().expect("telemetry lock poisoned");
            for (label_values, sample) in samples.iter() {
                match sample {
                    Sample::Value(v) => {
                        let _ = writeln!(
                            out,
                            "{}{} {}",
                            s.name,
                            format_labels(&s.label_names, label_values, None),
                            format_number(*v)
                        );
                    }
                    Sample::Histogram {
                        buckets,
                        sum,
                        count,
                    } => {
                        for (i, bound) in HISTOGRAM_BUCKETS.iter().enumerate() {
                            let _ = writeln!(
                                out,
                                "{}_bucket{} {}",
                                s.name,
                                format_labels(
                                    &s.label_names,
                                    label_values,
                                    Some(&format_number(*bound))
                                ),
                                buckets[i]
                            );
                        }
                        let _ = writeln!(
                            out,
                            "{}_bucket{} {}",
                            s.name,
                            format_labels(&s.label_names, label_values, Some("+Inf")),
                            count
                        );
                        let _ = writeln!(
                            out,
                            "{}_sum{} {}",
                            s.name,
                            format_labels(&s.label_names, label_values, None),
                            format_number(*sum)
                        );
                        let _ = writeln!(
                            out,
                            "{}_count{} {}",
                            s.name,
                            format_labels(&s.label_names, label_values, None),
                            count
                        );
                    }
                }
            }
        }
        out
    }
}

/// Format a `{k="v",…}` label block; `le` appends the histogram bucket bound.
fn format_labels(names: &[String], values: &[String], le: Option<&str>) -> String {
    let mut pairs: Vec<String> = names
        .iter()
        .zip(values.iter())
        .map(|(k, v)| format!("{}=\"{}\"", k, escape_label(v)))
        .collect();
    if let Some(bound) = le {
        pairs.push(format!("le=\"{}\"", bound));
    }
    if pairs.is_empty() {
        String::new()
    } else {
        format!("{{{}}}", pairs.join(","))
    }
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

/// Trim trailing zeros so counters render as integers.
fn format_number(v: f64) -> String {
    if v == v.trunc() && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        format!("{}", v)
    }
}

/// The standard gateway series, constructed once at startup.
#[derive(Clone)]
pub struct GatewayMetrics {
    pub requests_total: Counter,
    pub errors_total: Counter,
    pub request_duration_seconds: Histogram,
    pub active_requests: Gauge,
    pub server_status: Gauge,
    pub server_uptime_seconds: Gauge,
    pub server_restarts_total: Counter,
    pub streaming_requests_total: Counter,
    pub active_streams: Gauge,
    pub llm_requests_total: Counter,
    pub llm_requests_success_total: Counter,
    pub llm_requests_failed_total: Counter,
    pub llm_request_duration_seconds: Histogram,
    pub llm_latency_seconds: Gauge,
    pub llm_tokens_total: Counter,
    pub llm_errors_by_status: Counter,
    pub replicate_cache_hits_total: Counter,
    pub replicate_cache_misses_total: Counter,
    pub predictions_total: Counter,
}

impl GatewayMetrics {
    pub fn new(registry: &TelemetryRegistry) -> Self {
        GatewayMetrics {
            requests_total: registry.counter(
                "fluidmcp_requests_total",
                "JSON-RPC requests seen",
                &["server_id", "method", "status"],
            ),
            errors_total: registry.counter(
                "fluidmcp_errors_total",
                "Classified errors",
                &["server_id", "error_type"],
            ),
            request_duration_seconds: registry.histogram(
                "fluidmcp_request_duration_seconds",
                "Per-request latency",
                &["server_id", "method"],
            ),
            active_requests: registry.gauge(
                "fluidmcp_active_requests",
                "In-flight requests",
                &["server_id"],
            ),
            server_status: registry.gauge(
                "fluidmcp_server_status",
                "0 Stopped, 1 Starting, 2 Running, 3 Error, 4 Restarting",
                &["server_id"],
            ),
            server_uptime_seconds: registry.gauge(
                "fluidmcp_server_uptime_seconds",
                "Seconds since last start",
                &["server_id"],
            ),
            server_restarts_total: registry.counter(
                "fluidmcp_server_restarts_total",
                "Restart events",
                &["server_id", "reason"],
            ),
            streaming_requests_total: registry.counter(
                "fluidmcp_streaming_requests_total",
                "SSE stream terminations",
                &["server_id", "completion_status"],
            ),
            active_streams: registry.gauge(
                "fluidmcp_active_streams",
                "In-flight streams",
                &["server_id"],
            ),
            llm_requests_total: registry.counter(
                "fluidmcp_llm_requests_total",
                "LLM requests received",
                &["model", "provider"],
            ),
            llm_requests_success_total: registry.counter(
                "fluidmcp_llm_requests_success_total",
                "LLM requests completed successfully",
                &["model", "provider"],
            ),
            llm_requests_failed_total: registry.counter(
                "fluidmcp_llm_requests_failed_total",
                "LLM requests failed",
                &["model", "provider"],
            ),
            llm_request_duration_seconds: registry.histogram(
                "fluidmcp_llm_request_duration_seconds",
                "LLM request latency",
                &["model", "provider"],
            ),
            llm_latency_seconds: registry.gauge(
                "fluidmcp_llm_latency_seconds",
                "LLM latency statistics",
                &["model", "provider", "stat"],
            ),
            llm_tokens_total: registry.counter(
                "fluidmcp_llm_tokens_total",
                "Tokens processed",
                &["model", "provider", "type"],
            ),
            llm_errors_by_status: registry.counter(
                "fluidmcp_llm_errors_by_status",
                "LLM errors by HTTP status class",
                &["model", "provider", "status_class"],
            ),
            replicate_cache_hits_total: registry.counter(
                "fluidmcp_replicate_cache_hits_total",
                "Response cache hits",
                &["model"],
            ),
            replicate_cache_misses_total: registry.counter(
                "fluidmcp_replicate_cache_misses_total",
                "Response cache misses",
                &["model"],
            ),
            predictions_total: registry.counter(
                "fluidmcp_predictions_total",
                "Prediction jobs by terminal status",
                &["model", "status"],
            ),
        }
    }
}
