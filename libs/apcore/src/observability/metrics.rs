//! Metrics pillar: counters, histograms, and Prometheus export (spec
//! §4.9.2).

use std::collections::BTreeMap;
use std::fmt::Write as _;

use parking_lot::Mutex;
use serde_json::Value;

use crate::context::Context;
use crate::middleware::Middleware;

pub(crate) const DEFAULT_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

pub const CALLS_TOTAL: &str = "apcore_module_calls_total";
pub const ERRORS_TOTAL: &str = "apcore_module_errors_total";
pub const DURATION_SECONDS: &str = "apcore_module_duration_seconds";

/// Canonicalizes label pairs as `"k1=v1,k2=v2"` with keys sorted
/// alphabetically.
#[must_use]
pub fn canonical_labels(labels: &[(&str, &str)]) -> String {
    let mut sorted: Vec<(&str, &str)> = labels.to_vec();
    sorted.sort_by_key(|(k, _)| *k);
    sorted
        .into_iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

fn composite_key(name: &str, label_string: &str) -> String {
    format!("{name}|{label_string}")
}

#[derive(Debug, Clone, Default)]
struct Histogram {
    buckets: Vec<f64>,
    bucket_counts: Vec<u64>,
    sum: f64,
    count: u64,
}

impl Histogram {
    fn new(buckets: Vec<f64>) -> Self {
        let len = buckets.len();
        Self {
            buckets,
            bucket_counts: vec![0; len],
            sum: 0.0,
            count: 0,
        }
    }

    fn observe(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
        for (bucket, count) in self.buckets.iter().zip(self.bucket_counts.iter_mut()) {
            if value <= *bucket {
                *count += 1;
            }
        }
    }
}

/// Counters (composite key → count) and histograms (sums, counts,
/// per-bucket counts + `+Inf`).
pub struct MetricsCollector {
    buckets: Vec<f64>,
    counters: Mutex<BTreeMap<String, u64>>,
    histograms: Mutex<BTreeMap<String, Histogram>>,
}

impl MetricsCollector {
    #[must_use]
    pub fn new() -> Self {
        Self::with_buckets(DEFAULT_BUCKETS.to_vec())
    }

    /// Buckets are sorted ascending on construction.
    #[must_use]
    pub fn with_buckets(mut buckets: Vec<f64>) -> Self {
        buckets.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        Self {
            buckets,
            counters: Mutex::new(BTreeMap::new()),
            histograms: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn increment(&self, name: &str, labels: &[(&str, &str)], amount: u64) {
        let key = composite_key(name, &canonical_labels(labels));
        *self.counters.lock().entry(key).or_insert(0) += amount;
    }

    pub fn observe(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let key = composite_key(name, &canonical_labels(labels));
        self.histograms
            .lock()
            .entry(key)
            .or_insert_with(|| Histogram::new(self.buckets.clone()))
            .observe(value);
    }

    pub fn increment_calls(&self, module_id: &str, status: &str) {
        self.increment(CALLS_TOTAL, &[("module_id", module_id), ("status", status)], 1);
    }

    pub fn increment_errors(&self, module_id: &str, error_code: &str) {
        self.increment(
            ERRORS_TOTAL,
            &[("module_id", module_id), ("error_code", error_code)],
            1,
        );
    }

    pub fn observe_duration(&self, module_id: &str, seconds: f64) {
        self.observe(DURATION_SECONDS, &[("module_id", module_id)], seconds);
    }

    /// Reads the raw counter value for `name`/`labels`; `0` if unobserved.
    #[must_use]
    pub fn counter_value(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let key = composite_key(name, &canonical_labels(labels));
        self.counters.lock().get(&key).copied().unwrap_or(0)
    }

    /// Renders all counters and histograms as Prometheus exposition text.
    /// Empty collector returns an empty string.
    #[must_use]
    pub fn export_prometheus(&self) -> String {
        let mut out = String::new();
        let counters = self.counters.lock();
        let histograms = self.histograms.lock();
        if counters.is_empty() && histograms.is_empty() {
            return out;
        }

        let mut by_metric: BTreeMap<&str, Vec<(&str, u64)>> = BTreeMap::new();
        for (key, value) in counters.iter() {
            let (name, labels) = split_key(key);
            by_metric.entry(name).or_default().push((labels, *value));
        }
        for (name, entries) in &by_metric {
            let _ = writeln!(out, "# HELP {name} Counter metric {name}.");
            let _ = writeln!(out, "# TYPE {name} counter");
            let mut entries = entries.clone();
            entries.sort_by_key(|(labels, _)| *labels);
            for (labels, value) in entries {
                if labels.is_empty() {
                    let _ = writeln!(out, "{name} {value}");
                } else {
                    let _ = writeln!(out, "{name}{{{}}} {value}", render_labels(labels, None));
                }
            }
        }

        let mut by_hist: BTreeMap<&str, Vec<(&str, &Histogram)>> = BTreeMap::new();
        for (key, hist) in histograms.iter() {
            let (name, labels) = split_key(key);
            by_hist.entry(name).or_default().push((labels, hist));
        }
        for (name, entries) in &by_hist {
            let _ = writeln!(out, "# HELP {name} Histogram metric {name}.");
            let _ = writeln!(out, "# TYPE {name} histogram");
            let mut entries = entries.clone();
            entries.sort_by_key(|(labels, _)| *labels);
            for (labels, hist) in entries {
                let mut cumulative = 0u64;
                for (bucket, count) in hist.buckets.iter().zip(hist.bucket_counts.iter()) {
                    cumulative += count;
                    let le = format_bucket(*bucket);
                    let _ = writeln!(
                        out,
                        "{name}_bucket{{{}}} {cumulative}",
                        render_labels(labels, Some(&le))
                    );
                }
                let _ = writeln!(
                    out,
                    "{name}_bucket{{{}}} {}",
                    render_labels(labels, Some("+Inf")),
                    hist.count
                );
                if labels.is_empty() {
                    let _ = writeln!(out, "{name}_sum {}", hist.sum);
                    let _ = writeln!(out, "{name}_count {}", hist.count);
                } else {
                    let rendered = render_labels(labels, None);
                    let _ = writeln!(out, "{name}_sum{{{rendered}}} {}", hist.sum);
                    let _ = writeln!(out, "{name}_count{{{rendered}}} {}", hist.count);
                }
            }
        }

        out
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

fn split_key(key: &str) -> (&str, &str) {
    key.split_once('|').unwrap_or((key, ""))
}

fn format_bucket(bucket: f64) -> String {
    let mut s = format!("{bucket}");
    if !s.contains('.') && !s.contains('e') {
        s.push_str(".0");
    }
    s
}

/// Labels sorted with `le` last, per spec §4.9.2.
fn render_labels(labels: &str, le: Option<&str>) -> String {
    let mut pairs: Vec<(String, String)> = if labels.is_empty() {
        Vec::new()
    } else {
        labels
            .split(',')
            .filter_map(|pair| pair.split_once('='))
            .map(|(k, v)| (k.to_owned(), v.to_owned()))
            .collect()
    };
    pairs.sort();
    let mut rendered: Vec<String> = pairs
        .into_iter()
        .map(|(k, v)| format!("{k}=\"{v}\""))
        .collect();
    if let Some(le) = le {
        rendered.push(format!("le=\"{le}\""));
    }
    rendered.join(",")
}

const STARTS_KEY: &str = "_metrics_starts";

/// Records call counts and durations via the `apcore_module_*` standard
/// metric names, stacking start timestamps on `_metrics_starts`.
pub struct MetricsMiddleware {
    collector: std::sync::Arc<MetricsCollector>,
}

impl MetricsMiddleware {
    #[must_use]
    pub fn new(collector: std::sync::Arc<MetricsCollector>) -> Self {
        Self { collector }
    }

    fn pop_start(context: &Context) -> Option<f64> {
        context
            .data()
            .pop_stack(STARTS_KEY)
            .and_then(|v| v.as_f64())
    }
}

impl Middleware for MetricsMiddleware {
    fn name(&self) -> &str {
        "metrics"
    }

    fn before(
        &self,
        _module_id: &str,
        _inputs: &Value,
        context: &Context,
    ) -> Result<Option<Value>, apcore_errors::ApcoreError> {
        let now = chrono::Utc::now().timestamp_millis();
        #[expect(clippy::cast_precision_loss, reason = "millisecond timestamp precision loss is immaterial here")]
        let now_f = now as f64;
        context.data().push_stack(STARTS_KEY, Value::from(now_f));
        Ok(None)
    }

    fn after(&self, module_id: &str, _inputs: &Value, _output: &Value, context: &Context) -> Option<Value> {
        let start = Self::pop_start(context)?;
        let now = chrono::Utc::now().timestamp_millis();
        #[expect(clippy::cast_precision_loss, reason = "millisecond timestamp precision loss is immaterial here")]
        let elapsed_seconds = (now as f64 - start) / 1000.0;
        self.collector.increment_calls(module_id, "success");
        self.collector.observe_duration(module_id, elapsed_seconds.max(0.0));
        None
    }

    fn on_error(
        &self,
        module_id: &str,
        _inputs: &Value,
        error: &apcore_errors::ApcoreError,
        context: &Context,
    ) -> Option<Value> {
        let start = Self::pop_start(context);
        self.collector.increment_calls(module_id, "error");
        self.collector.increment_errors(module_id, error.code());
        if let Some(start) = start {
            let now = chrono::Utc::now().timestamp_millis();
            #[expect(clippy::cast_precision_loss, reason = "millisecond timestamp precision loss is immaterial here")]
            let elapsed_seconds = (now as f64 - start) / 1000.0;
            self.collector.observe_duration(module_id, elapsed_seconds.max(0.0));
        }
        None
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn labels_are_canonicalized_sorted() {
        assert_eq!(
            canonical_labels(&[("b", "2"), ("a", "1")]),
            "a=1,b=2"
        );
    }

    #[test]
    fn counter_conservation_after_n_successful_calls() {
        let collector = MetricsCollector::new();
        for _ in 0..5 {
            collector.increment_calls("math.add", "success");
        }
        assert_eq!(
            collector.counter_value(CALLS_TOTAL, &[("module_id", "math.add"), ("status", "success")]),
            5
        );
    }

    #[test]
    fn empty_collector_exports_empty_string() {
        let collector = MetricsCollector::new();
        assert_eq!(collector.export_prometheus(), "");
    }

    #[test]
    fn prometheus_export_includes_help_type_and_buckets() {
        let collector = MetricsCollector::new();
        collector.increment_calls("m", "success");
        collector.observe_duration("m", 0.2);
        let text = collector.export_prometheus();
        assert!(text.contains("# HELP apcore_module_calls_total"));
        assert!(text.contains("# TYPE apcore_module_duration_seconds histogram"));
        assert!(text.contains("le=\"+Inf\""));
        assert!(text.contains("apcore_module_duration_seconds_sum{module_id=\"m\"}"));
        assert!(text.contains("apcore_module_duration_seconds_count{module_id=\"m\"}"));
    }

    #[test]
    fn middleware_records_success_and_duration() {
        let collector = std::sync::Arc::new(MetricsCollector::new());
        let mw = MetricsMiddleware::new(collector.clone());
        let context = Context::root("t", None);
        mw.before("math.add", &Value::Null, &context).unwrap();
        mw.after("math.add", &Value::Null, &Value::Null, &context);
        assert_eq!(
            collector.counter_value(CALLS_TOTAL, &[("module_id", "math.add"), ("status", "success")]),
            1
        );
    }

    #[test]
    fn middleware_records_error_and_error_code() {
        let collector = std::sync::Arc::new(MetricsCollector::new());
        let mw = MetricsMiddleware::new(collector.clone());
        let context = Context::root("t", None);
        mw.before("m", &Value::Null, &context).unwrap();
        let err = apcore_errors::ApcoreError::invalid_input("boom");
        mw.on_error("m", &Value::Null, &err, &context);
        assert_eq!(
            collector.counter_value(ERRORS_TOTAL, &[("module_id", "m"), ("error_code", "INVALID_INPUT")]),
            1
        );
    }
}
