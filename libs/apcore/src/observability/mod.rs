//! Observability pillars: tracing, metrics, structured logging — each
//! delivered as a [`crate::middleware::Middleware`] (spec §4.9).

pub mod logging;
pub mod metrics;
pub mod tracing;

pub use logging::{ContextLogger, LogFormat, LogLevel, LogSink, ObsLoggingMiddleware, StdoutSink};
pub use metrics::{MetricsCollector, MetricsMiddleware};
pub use tracing::{InMemorySpanExporter, SamplingStrategy, Span, SpanExporter, SpanStatus, StdoutSpanExporter, TracingMiddleware};
