//! Structured logging pillar: `ContextLogger` and `ObsLoggingMiddleware`
//! (spec §4.9.3).

use chrono::Utc;
use serde_json::{Map, Value, json};

use apcore_errors::ApcoreError;

use crate::context::Context;
use crate::middleware::Middleware;

/// Six levels, lowest to highest severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace = 0,
    Debug = 10,
    Info = 20,
    Warn = 30,
    Error = 40,
    Fatal = 50,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            Self::Trace => "TRACE",
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
            Self::Fatal => "FATAL",
        }
    }
}

/// Record output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Text,
}

/// Sink a rendered log line is written to.
pub trait LogSink: Send + Sync {
    fn write(&self, line: &str);
}

/// Writes each line to stdout.
#[derive(Default)]
pub struct StdoutSink;

impl LogSink for StdoutSink {
    fn write(&self, line: &str) {
        println!("{line}");
    }
}

/// Structured per-call logger: JSON or text, redacting `_secret_*` extra
/// keys by default.
pub struct ContextLogger {
    name: String,
    format: LogFormat,
    level: LogLevel,
    redact_sensitive: bool,
    output: std::sync::Arc<dyn LogSink>,
    trace_id: Option<String>,
    module_id: Option<String>,
    caller_id: Option<String>,
}

impl ContextLogger {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        format: LogFormat,
        level: LogLevel,
        redact_sensitive: bool,
        output: std::sync::Arc<dyn LogSink>,
    ) -> Self {
        Self {
            name: name.into(),
            format,
            level,
            redact_sensitive,
            output,
            trace_id: None,
            module_id: None,
            caller_id: None,
        }
    }

    /// Binds `trace_id`, the last-of-`callChain` as `module_id`, and
    /// `callerId` from `context`.
    #[must_use]
    pub fn from_context(context: &Context, name: impl Into<String>) -> LoggerBinding<'_> {
        LoggerBinding {
            context,
            name: name.into(),
        }
    }

    pub fn trace(&self, message: &str, extra: Map<String, Value>) {
        self.log(LogLevel::Trace, message, extra);
    }
    pub fn debug(&self, message: &str, extra: Map<String, Value>) {
        self.log(LogLevel::Debug, message, extra);
    }
    pub fn info(&self, message: &str, extra: Map<String, Value>) {
        self.log(LogLevel::Info, message, extra);
    }
    pub fn warn(&self, message: &str, extra: Map<String, Value>) {
        self.log(LogLevel::Warn, message, extra);
    }
    pub fn error(&self, message: &str, extra: Map<String, Value>) {
        self.log(LogLevel::Error, message, extra);
    }
    pub fn fatal(&self, message: &str, extra: Map<String, Value>) {
        self.log(LogLevel::Fatal, message, extra);
    }

    fn log(&self, level: LogLevel, message: &str, mut extra: Map<String, Value>) {
        if level < self.level {
            return;
        }
        if self.redact_sensitive {
            redact_in_place(&mut extra);
        }

        let line = match self.format {
            LogFormat::Json => {
                let record = json!({
                    "timestamp": Utc::now().to_rfc3339(),
                    "level": level.as_str(),
                    "message": message,
                    "trace_id": self.trace_id,
                    "module_id": self.module_id,
                    "caller_id": self.caller_id,
                    "logger": self.name,
                    "extra": extra,
                });
                record.to_string()
            }
            LogFormat::Text => {
                let mut out = format!(
                    "{} [{}] [trace={}] [module={}] {message}",
                    Utc::now().to_rfc3339(),
                    level.as_str(),
                    self.trace_id.as_deref().unwrap_or("-"),
                    self.module_id.as_deref().unwrap_or("-"),
                );
                for (k, v) in &extra {
                    out.push_str(&format!(" {k}={v}"));
                }
                out
            }
        };
        self.output.write(&line);
    }
}

/// Deferred binding returned by [`ContextLogger::from_context`]; call
/// [`LoggerBinding::build`] with the rest of the logger's configuration.
pub struct LoggerBinding<'a> {
    context: &'a Context,
    name: String,
}

impl LoggerBinding<'_> {
    #[must_use]
    pub fn build(
        self,
        format: LogFormat,
        level: LogLevel,
        redact_sensitive: bool,
        output: std::sync::Arc<dyn LogSink>,
    ) -> ContextLogger {
        ContextLogger {
            name: self.name,
            format,
            level,
            redact_sensitive,
            output,
            trace_id: Some(self.context.trace_id().to_owned()),
            module_id: self.context.call_chain().last().map(ToString::to_string),
            caller_id: self.context.caller_id().map(ToString::to_string),
        }
    }
}

/// Replaces any value under a key starting with `_secret_` with
/// `"***REDACTED***"`; other values pass through byte-identical.
fn redact_in_place(extra: &mut Map<String, Value>) {
    for (key, value) in extra.iter_mut() {
        if key.starts_with("_secret_") {
            *value = Value::String("***REDACTED***".to_owned());
        }
    }
}

const STARTS_KEY: &str = "_obs_logging_starts";

/// Emits lifecycle log lines at `before`/`after`/`onError`, using the
/// same stack discipline as the tracing/metrics middlewares.
pub struct ObsLoggingMiddleware {
    format: LogFormat,
    level: LogLevel,
    redact_sensitive: bool,
    output: std::sync::Arc<dyn LogSink>,
    log_inputs: bool,
    log_output: bool,
}

impl ObsLoggingMiddleware {
    #[must_use]
    pub fn new(
        format: LogFormat,
        level: LogLevel,
        redact_sensitive: bool,
        output: std::sync::Arc<dyn LogSink>,
        log_inputs: bool,
        log_output: bool,
    ) -> Self {
        Self {
            format,
            level,
            redact_sensitive,
            output,
            log_inputs,
            log_output,
        }
    }

    fn logger_for(&self, context: &Context) -> ContextLogger {
        ContextLogger::from_context(context, "apcore.observability").build(
            self.format,
            self.level,
            self.redact_sensitive,
            self.output.clone(),
        )
    }
}

impl Middleware for ObsLoggingMiddleware {
    fn name(&self) -> &str {
        "obs_logging"
    }

    fn before(
        &self,
        _module_id: &str,
        inputs: &Value,
        context: &Context,
    ) -> Result<Option<Value>, ApcoreError> {
        let now = Utc::now().timestamp_millis();
        context.data().push_stack(STARTS_KEY, Value::from(now));

        let mut extra = Map::new();
        if self.log_inputs {
            let logged = context.redacted_inputs().cloned().unwrap_or_else(|| inputs.clone());
            extra.insert("inputs".to_owned(), logged);
        }
        self.logger_for(context).info("Module call started", extra);
        Ok(None)
    }

    fn after(&self, _module_id: &str, _inputs: &Value, output: &Value, context: &Context) -> Option<Value> {
        let start = context.data().pop_stack(STARTS_KEY).and_then(|v| v.as_i64());
        let duration_ms = start.map(|s| Utc::now().timestamp_millis() - s).unwrap_or(0);

        let mut extra = Map::new();
        extra.insert("duration_ms".to_owned(), Value::from(duration_ms));
        if self.log_output {
            extra.insert("output".to_owned(), output.clone());
        }
        self.logger_for(context).info("Module call completed", extra);
        None
    }

    fn on_error(&self, _module_id: &str, _inputs: &Value, error: &ApcoreError, context: &Context) -> Option<Value> {
        context.data().pop_stack(STARTS_KEY);

        let mut extra = Map::new();
        extra.insert("error_type".to_owned(), Value::String(error.code().to_owned()));
        extra.insert(
            "error_message".to_owned(),
            Value::String(error.info().message.clone()),
        );
        self.logger_for(context).error("Module call failed", extra);
        None
    }
}
