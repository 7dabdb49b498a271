//! Tracing pillar: spans, sampling strategies, and exporters (spec §4.9.1).

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use apcore_errors::ApcoreError;

use crate::context::Context;
use crate::middleware::Middleware;

/// Span status at completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpanStatus {
    Ok,
    Error,
}

/// One node in a distributed trace, bounded by a `before`/`after` pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Span {
    pub trace_id: String,
    pub span_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
    pub name: String,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub status: SpanStatus,
    pub attributes: Map<String, Value>,
    pub events: Vec<SpanEvent>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpanEvent {
    pub name: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

/// 8 random bytes, hex-encoded (16 chars).
fn new_span_id() -> String {
    let bytes: [u8; 8] = rand::rng().random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Sink a completed [`Span`] is handed off to.
pub trait SpanExporter: Send + Sync {
    fn export(&self, span: &Span);
}

/// Writes one JSON line per span to stdout.
#[derive(Default)]
pub struct StdoutSpanExporter;

impl SpanExporter for StdoutSpanExporter {
    fn export(&self, span: &Span) {
        if let Ok(line) = serde_json::to_string(span) {
            println!("{line}");
        }
    }
}

/// Bounded ring buffer of exported spans, FIFO eviction.
pub struct InMemorySpanExporter {
    capacity: usize,
    spans: Mutex<VecDeque<Span>>,
}

impl InMemorySpanExporter {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            spans: Mutex::new(VecDeque::new()),
        }
    }

    /// Defensive copy of the currently retained spans, oldest first.
    #[must_use]
    pub fn get_spans(&self) -> Vec<Span> {
        self.spans.lock().iter().cloned().collect()
    }

    pub fn clear(&self) {
        self.spans.lock().clear();
    }
}

impl Default for InMemorySpanExporter {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl SpanExporter for InMemorySpanExporter {
    fn export(&self, span: &Span) {
        let mut spans = self.spans.lock();
        if spans.len() >= self.capacity {
            spans.pop_front();
        }
        spans.push_back(span.clone());
    }
}

#[cfg(feature = "otlp")]
pub use otlp::OtlpSpanExporter;

#[cfg(feature = "otlp")]
mod otlp {
    use super::{Span, SpanExporter};
    use bytes::Bytes;
    use http_body_util::Full;
    use hyper_util::client::legacy::Client;
    use hyper_util::rt::TokioExecutor;
    use std::collections::HashMap;

    /// Fire-and-forget HTTP POST of an OTLP-over-JSON payload (spec §6).
    /// Errors are swallowed: exporters are write-only from the call path.
    pub struct OtlpSpanExporter {
        endpoint: String,
        headers: HashMap<String, String>,
        client: Client<hyper_rustls::HttpsConnector<hyper_util::client::legacy::connect::HttpConnector>, Full<Bytes>>,
    }

    impl OtlpSpanExporter {
        #[must_use]
        pub fn new(endpoint: impl Into<String>, headers: HashMap<String, String>) -> Self {
            let https = hyper_rustls::HttpsConnectorBuilder::new()
                .with_webpki_roots()
                .https_or_http()
                .enable_http1()
                .build();
            Self {
                endpoint: endpoint.into(),
                headers,
                client: Client::builder(TokioExecutor::new()).build(https),
            }
        }

        fn payload(span: &Span) -> serde_json::Value {
            let to_nanos = |t: chrono::DateTime<chrono::Utc>| {
                (t.timestamp() as i128 * 1_000_000_000 + i128::from(t.timestamp_subsec_nanos()))
                    .to_string()
            };
            let mut attributes: Vec<serde_json::Value> = span
                .attributes
                .iter()
                .map(|(k, v)| {
                    serde_json::json!({"key": k, "value": {"stringValue": value_as_string(v)}})
                })
                .collect();
            attributes.sort_by(|a, b| a["key"].as_str().cmp(&b["key"].as_str()));

            let mut span_json = serde_json::json!({
                "traceId": span.trace_id,
                "spanId": span.span_id,
                "name": span.name,
                "startTimeUnixNano": to_nanos(span.start_time),
                "status": {"code": if span.status == super::SpanStatus::Ok { 1 } else { 2 }},
                "attributes": attributes,
            });
            if let Some(parent) = &span.parent_span_id {
                span_json["parentSpanId"] = serde_json::Value::String(parent.clone());
            }
            if let Some(end) = span.end_time {
                span_json["endTimeUnixNano"] = serde_json::Value::String(to_nanos(end));
            }

            serde_json::json!({
                "resourceSpans": [{
                    "resource": {
                        "attributes": [{"key": "service.name", "value": {"stringValue": "apcore"}}]
                    },
                    "scopeSpans": [{"spans": [span_json]}]
                }]
            })
        }
    }

    fn value_as_string(v: &serde_json::Value) -> String {
        match v {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    impl SpanExporter for OtlpSpanExporter {
        fn export(&self, span: &Span) {
            let Ok(body) = serde_json::to_vec(&Self::payload(span)) else {
                return;
            };
            let mut builder = http::Request::builder()
                .method(http::Method::POST)
                .uri(&self.endpoint)
                .header(http::header::CONTENT_TYPE, "application/json");
            for (k, v) in &self.headers {
                builder = builder.header(k.as_str(), v.as_str());
            }
            let Ok(request) = builder.body(Full::new(Bytes::from(body))) else {
                return;
            };
            let client = self.client.clone();
            // Fire-and-forget: spawn on the ambient runtime, swallow errors.
            tokio::spawn(async move {
                let _ = client.request(request).await;
            });
        }
    }
}

/// How often [`TracingMiddleware`] exports spans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplingStrategy {
    Full,
    Proportional,
    ErrorFirst,
    Off,
}

impl SamplingStrategy {
    fn parse(name: &str) -> Result<Self, ApcoreError> {
        match name {
            "full" => Ok(Self::Full),
            "proportional" => Ok(Self::Proportional),
            "error_first" => Ok(Self::ErrorFirst),
            "off" => Ok(Self::Off),
            other => Err(ApcoreError::invalid_input(format!(
                "unknown sampling strategy '{other}'"
            ))),
        }
    }
}

const SPANS_STACK_KEY: &str = "_tracing_spans";
const SAMPLED_KEY: &str = "_tracing_sampled";

/// Tracing observability middleware: one span per call, nesting-safe via
/// the context's `_tracing_spans` stack.
pub struct TracingMiddleware {
    exporter: Arc<dyn SpanExporter>,
    sampling_rate: f64,
    strategy: SamplingStrategy,
}

impl TracingMiddleware {
    /// # Errors
    /// Returns `ApcoreError::InvalidInput` if `sampling_rate` is outside
    /// `[0,1]` or `strategy` is not one of `full`/`proportional`/
    /// `error_first`/`off`.
    pub fn new(
        exporter: Arc<dyn SpanExporter>,
        sampling_rate: f64,
        strategy: &str,
    ) -> Result<Self, ApcoreError> {
        if !(0.0..=1.0).contains(&sampling_rate) {
            return Err(ApcoreError::invalid_input(format!(
                "sampling_rate must be in [0,1], got {sampling_rate}"
            )));
        }
        Ok(Self {
            exporter,
            sampling_rate,
            strategy: SamplingStrategy::parse(strategy)?,
        })
    }

    fn decide_sampled(&self) -> bool {
        match self.strategy {
            SamplingStrategy::Full => true,
            SamplingStrategy::Off => false,
            SamplingStrategy::Proportional | SamplingStrategy::ErrorFirst => {
                rand::rng().random::<f64>() < self.sampling_rate
            }
        }
    }
}

fn span_from_value(value: Value) -> Option<Span> {
    serde_json::from_value(value).ok()
}

/// Pushes an `approval_decision` event onto the span currently on top of
/// `context`'s `_tracing_spans` stack, if one is on the stack (spec §4.7
/// step 6: "if a tracing span is on the stack"). A no-op when no span is
/// active, e.g. a top-level call with no enclosing traced call.
pub fn record_approval_decision(context: &Context, module_id: &str, status: &str, approval_id: Option<&str>) {
    let mut attributes = Map::new();
    attributes.insert("module_id".to_owned(), Value::String(module_id.to_owned()));
    attributes.insert("status".to_owned(), Value::String(status.to_owned()));
    if let Some(approval_id) = approval_id {
        attributes.insert("approval_id".to_owned(), Value::String(approval_id.to_owned()));
    }
    let event = SpanEvent {
        name: "approval_decision".to_owned(),
        timestamp: Utc::now(),
        attributes,
    };

    context.data().mutate_stack_top(SPANS_STACK_KEY, |top| {
        if let Some(mut span) = span_from_value(top.clone()) {
            span.events.push(event);
            if let Ok(updated) = serde_json::to_value(&span) {
                *top = updated;
            }
        }
    });
}

impl Middleware for TracingMiddleware {
    fn name(&self) -> &str {
        "tracing"
    }

    fn before(
        &self,
        module_id: &str,
        inputs: &Value,
        context: &Context,
    ) -> Result<Option<Value>, ApcoreError> {
        let sampled = match context.data().get(SAMPLED_KEY) {
            Some(Value::Bool(b)) => b,
            _ => {
                let decided = self.decide_sampled();
                context.data().set(SAMPLED_KEY, Value::Bool(decided));
                decided
            }
        };
        let _ = sampled;

        let parent_span_id = context
            .data()
            .get(SPANS_STACK_KEY)
            .and_then(|v| v.as_array().and_then(|a| a.last().cloned()))
            .and_then(span_from_value)
            .map(|s| s.span_id);

        let mut attributes = Map::new();
        attributes.insert("moduleId".to_owned(), Value::String(module_id.to_owned()));
        attributes.insert("method".to_owned(), Value::String("execute".to_owned()));
        attributes.insert(
            "callerId".to_owned(),
            context
                .caller_id()
                .map_or(Value::Null, |id| Value::String(id.to_string())),
        );

        let span = Span {
            trace_id: context.trace_id().to_owned(),
            span_id: new_span_id(),
            parent_span_id,
            name: "apcore.module.execute".to_owned(),
            start_time: Utc::now(),
            end_time: None,
            status: SpanStatus::Ok,
            attributes,
            events: Vec::new(),
        };

        context
            .data()
            .push_stack(SPANS_STACK_KEY, serde_json::to_value(span).unwrap_or(Value::Null));
        let _ = inputs;
        Ok(None)
    }

    fn after(&self, _module_id: &str, _inputs: &Value, _output: &Value, context: &Context) -> Option<Value> {
        let mut span = span_from_value(context.data().pop_stack(SPANS_STACK_KEY)?)?;
        let end = Utc::now();
        let duration_ms = (end - span.start_time).num_milliseconds();
        span.end_time = Some(end);
        span.status = SpanStatus::Ok;
        span.attributes.insert("duration_ms".to_owned(), Value::from(duration_ms));
        span.attributes.insert("success".to_owned(), Value::Bool(true));

        let sampled = matches!(context.data().get(SAMPLED_KEY), Some(Value::Bool(true)));
        if sampled {
            self.exporter.export(&span);
        }
        None
    }

    fn on_error(&self, _module_id: &str, _inputs: &Value, error: &ApcoreError, context: &Context) -> Option<Value> {
        let Some(mut span) = span_from_value(context.data().pop_stack(SPANS_STACK_KEY)?) else {
            return None;
        };
        let end = Utc::now();
        span.end_time = Some(end);
        span.status = SpanStatus::Error;
        span.attributes.insert("success".to_owned(), Value::Bool(false));
        span.attributes
            .insert("error_code".to_owned(), Value::String(error.code().to_owned()));

        let sampled = matches!(context.data().get(SAMPLED_KEY), Some(Value::Bool(true)));
        if sampled || self.strategy == SamplingStrategy::ErrorFirst {
            self.exporter.export(&span);
        }
        None
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::module::ModuleId;

    #[test]
    fn rejects_out_of_range_sampling_rate() {
        let exporter = Arc::new(InMemorySpanExporter::default());
        assert!(TracingMiddleware::new(exporter, 1.5, "full").is_err());
    }

    #[test]
    fn rejects_unknown_strategy() {
        let exporter = Arc::new(InMemorySpanExporter::default());
        assert!(TracingMiddleware::new(exporter, 1.0, "bogus").is_err());
    }

    #[test]
    fn full_strategy_always_exports_on_success() {
        let exporter = Arc::new(InMemorySpanExporter::default());
        let mw = TracingMiddleware::new(exporter.clone(), 1.0, "full").unwrap();
        let context = Context::root("t1", None);
        mw.before("m", &Value::Null, &context).unwrap();
        mw.after("m", &Value::Null, &Value::Null, &context);
        assert_eq!(exporter.get_spans().len(), 1);
        assert_eq!(exporter.get_spans()[0].status, SpanStatus::Ok);
    }

    #[test]
    fn off_strategy_never_exports() {
        let exporter = Arc::new(InMemorySpanExporter::default());
        let mw = TracingMiddleware::new(exporter.clone(), 1.0, "off").unwrap();
        let context = Context::root("t1", None);
        mw.before("m", &Value::Null, &context).unwrap();
        mw.after("m", &Value::Null, &Value::Null, &context);
        assert!(exporter.get_spans().is_empty());
    }

    #[test]
    fn error_first_always_exports_errors_even_when_off_rate() {
        let exporter = Arc::new(InMemorySpanExporter::default());
        let mw = TracingMiddleware::new(exporter.clone(), 0.0, "error_first").unwrap();
        let context = Context::root("t1", None);
        mw.before("m", &Value::Null, &context).unwrap();
        let err = ApcoreError::invalid_input("boom");
        mw.on_error("m", &Value::Null, &err, &context);
        assert_eq!(exporter.get_spans().len(), 1);
        assert_eq!(exporter.get_spans()[0].status, SpanStatus::Error);
    }

    #[test]
    fn nested_spans_share_parent_chain() {
        let exporter = Arc::new(InMemorySpanExporter::default());
        let mw = TracingMiddleware::new(exporter.clone(), 1.0, "full").unwrap();
        let root = Context::root("trace-1", None);
        mw.before("a", &Value::Null, &root).unwrap();
        let child = root.child(ModuleId::new("b").unwrap());
        mw.before("b", &Value::Null, &child).unwrap();
        mw.after("b", &Value::Null, &Value::Null, &child);
        mw.after("a", &Value::Null, &Value::Null, &root);

        let spans = exporter.get_spans();
        assert_eq!(spans.len(), 2);
        let span_b = spans.iter().find(|s| s.name == "apcore.module.execute" && s.attributes["moduleId"] == "b").unwrap();
        let span_a = spans.iter().find(|s| s.attributes["moduleId"] == "a").unwrap();
        assert_eq!(span_b.parent_span_id.as_deref(), Some(span_a.span_id.as_str()));
        assert_eq!(span_b.trace_id, span_a.trace_id);
    }

    #[test]
    fn approval_decision_is_recorded_as_event_on_active_span() {
        let exporter = Arc::new(InMemorySpanExporter::default());
        let mw = TracingMiddleware::new(exporter.clone(), 1.0, "full").unwrap();
        let context = Context::root("t1", None);
        mw.before("gatekeeper", &Value::Null, &context).unwrap();

        record_approval_decision(&context, "sensitive", "pending", Some("tok-abc"));

        mw.after("gatekeeper", &Value::Null, &Value::Null, &context);
        let spans = exporter.get_spans();
        assert_eq!(spans.len(), 1);
        let event = &spans[0].events[0];
        assert_eq!(event.name, "approval_decision");
        assert_eq!(event.attributes["module_id"], "sensitive");
        assert_eq!(event.attributes["status"], "pending");
        assert_eq!(event.attributes["approval_id"], "tok-abc");
    }

    #[test]
    fn approval_decision_is_a_no_op_with_no_active_span() {
        let context = Context::root("t1", None);
        // No middleware `before` has run, so `_tracing_spans` is empty.
        // This must not panic and must leave the stack empty.
        record_approval_decision(&context, "sensitive", "approved", None);
        assert!(context.data().get(SPANS_STACK_KEY).is_none());
    }

    #[test]
    fn ring_buffer_evicts_oldest() {
        let exporter = InMemorySpanExporter::new(2);
        for i in 0..3 {
            exporter.export(&Span {
                trace_id: "t".into(),
                span_id: i.to_string(),
                parent_span_id: None,
                name: "n".into(),
                start_time: Utc::now(),
                end_time: None,
                status: SpanStatus::Ok,
                attributes: Map::new(),
                events: Vec::new(),
            });
        }
        let spans = exporter.get_spans();
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].span_id, "1");
        assert_eq!(spans[1].span_id, "2");
    }
}
