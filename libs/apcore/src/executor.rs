//! The executor: the central call pipeline (spec §4.7).
//!
//! `Executor::call` resolves a module from a [`Registry`], enforces safety
//! limits and ACL, runs the approval gate, and wraps execution in the
//! middleware `before`/`after`/`onError` chain. It is the one place every
//! other subsystem in this crate (schema validation, ACL, approval,
//! middleware, observability) is wired together.

use std::sync::Arc;

use futures_core::stream::BoxStream;
use futures_util::stream;
use rand::Rng;
use serde_json::{Map, Value};

use apcore_errors::ApcoreError;

use crate::acl::{Acl, AclRequest};
use crate::approval::{self, ApprovalHandler};
use crate::config::RuntimeConfig;
use crate::context::Context;
use crate::middleware::{Middleware, MiddlewareManager};
use crate::module::ModuleId;
use crate::registry::Registry;
use crate::schema::{ValidationMode, Validator};

const EXTERNAL_CALLER: &str = "@external";
const SECRET_PREFIX: &str = "_secret_";

/// Safety limits enforced on every `call` (spec §4.7 step 3, §5 "Safety
/// limits").
#[derive(Debug, Clone, Copy)]
pub struct SafetyLimits {
    pub max_call_depth: usize,
    pub max_module_repeat: usize,
}

impl Default for SafetyLimits {
    fn default() -> Self {
        Self {
            max_call_depth: 50,
            max_module_repeat: 10,
        }
    }
}

impl From<&RuntimeConfig> for SafetyLimits {
    fn from(config: &RuntimeConfig) -> Self {
        Self {
            max_call_depth: config.max_call_depth,
            max_module_repeat: config.max_module_repeat,
        }
    }
}

/// Central dispatcher. Built once per runtime instance via [`Executor::builder`]
/// and shared behind an `Arc` so modules can call back into it (spec's
/// `context.executor`).
pub struct Executor {
    registry: Arc<Registry>,
    acl: Acl,
    middleware: MiddlewareManager,
    approval_handler: Option<Arc<dyn ApprovalHandler>>,
    validation_mode: ValidationMode,
    limits: SafetyLimits,
}

/// Builder for [`Executor`]. Grounded on the teacher's `RegistryBuilder`
/// (`examples/striped-zebra-dev-cyberfabric-core/libs/modkit/src/registry.rs`):
/// a plain struct accumulating optional collaborators before a final `build`.
pub struct ExecutorBuilder {
    registry: Arc<Registry>,
    acl: Option<Acl>,
    middleware: MiddlewareManager,
    approval_handler: Option<Arc<dyn ApprovalHandler>>,
    validation_mode: ValidationMode,
    limits: SafetyLimits,
}

impl ExecutorBuilder {
    #[must_use]
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            acl: None,
            middleware: MiddlewareManager::new(),
            approval_handler: None,
            validation_mode: ValidationMode::default(),
            limits: SafetyLimits::default(),
        }
    }

    #[must_use]
    pub fn acl(mut self, acl: Acl) -> Self {
        self.acl = Some(acl);
        self
    }

    #[must_use]
    pub fn middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middleware.add(middleware);
        self
    }

    #[must_use]
    pub fn approval_handler(mut self, handler: Arc<dyn ApprovalHandler>) -> Self {
        self.approval_handler = Some(handler);
        self
    }

    #[must_use]
    pub fn validation_mode(mut self, mode: ValidationMode) -> Self {
        self.validation_mode = mode;
        self
    }

    #[must_use]
    pub fn limits(mut self, limits: SafetyLimits) -> Self {
        self.limits = limits;
        self
    }

    #[must_use]
    pub fn build(self) -> Arc<Executor> {
        Arc::new(Executor {
            registry: self.registry,
            acl: self.acl.unwrap_or_else(|| Acl::new(Vec::new(), crate::acl::Effect::Allow)),
            middleware: self.middleware,
            approval_handler: self.approval_handler,
            validation_mode: self.validation_mode,
            limits: self.limits,
        })
    }
}

impl Executor {
    #[must_use]
    pub fn builder(registry: Arc<Registry>) -> ExecutorBuilder {
        ExecutorBuilder::new(registry)
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Runs the full 12-step pipeline for one module call (spec §4.7).
    /// `callAsync` in spec.md names the same operation; Rust has no
    /// sync/async split at the language level, so there is only this one
    /// `async fn`.
    ///
    /// # Errors
    /// Returns `ModuleNotFound`, a safety-limit error, `SchemaValidationError`,
    /// `ACLDenied`, an approval-gate error, `MiddlewareChainError`, or the
    /// module's own execution error — unless a middleware `onError` hook
    /// supplies a non-null recovery value, in which case that value is
    /// returned as success instead.
    pub async fn call(
        self: &Arc<Self>,
        module_id: &ModuleId,
        inputs: Option<Value>,
        context: Option<Context>,
    ) -> Result<Value, ApcoreError> {
        // 1. Resolve module.
        let module = self
            .registry
            .get(module_id)
            .ok_or_else(|| ApcoreError::module_not_found(module_id.as_str()))?;

        // 2. Default inputs/context.
        let mut inputs = inputs.unwrap_or_else(|| Value::Object(Map::new()));
        let context = context.unwrap_or_else(|| Context::root(new_trace_id(), Some(Arc::clone(self))));

        // 3. Safety checks against context.call_chain.
        let depth = context.call_chain().len() + 1;
        if depth > self.limits.max_call_depth {
            return Err(ApcoreError::call_depth_exceeded(module_id.as_str(), self.limits.max_call_depth));
        }
        if context.call_chain().contains(module_id) {
            return Err(ApcoreError::circular_call(module_id.as_str()));
        }
        let repeats = context.call_chain().iter().filter(|id| *id == module_id).count() + 1;
        if repeats > self.limits.max_module_repeat {
            return Err(ApcoreError::call_frequency_exceeded(module_id.as_str(), self.limits.max_module_repeat));
        }

        // 4. Validate input.
        let validator = Validator::new(self.validation_mode);
        inputs = validator.validate_input(module_id.as_str(), &inputs, module.input_schema())?;

        // 5. ACL check.
        let caller = context.caller_id().map_or(EXTERNAL_CALLER, ModuleId::as_str);
        self.acl.check(&AclRequest {
            caller,
            target: module_id.as_str(),
            identity: context.identity(),
            call_depth: depth,
        })?;

        // 6. Approval gate.
        let annotations = module.annotations();
        if annotations.requires_approval
            && let Some(handler) = &self.approval_handler
        {
            approval::run_gate(
                handler.as_ref(),
                module_id.as_str(),
                &mut inputs,
                annotations,
                module.description(),
                module.tags(),
                &context,
            )
            .await?;
        }

        // 7. Build child context with redacted inputs.
        let redacted = redact(&inputs);
        let child_context = context.child(module_id.clone()).with_redacted_inputs(redacted);

        // 8. Middleware before.
        let snapshot = self.middleware.snapshot();
        let (inputs_after_before, executed) =
            match MiddlewareManager::execute_before(&snapshot, module_id.as_str(), inputs.clone(), &child_context) {
                Ok(pair) => pair,
                Err(err) => {
                    let executed = executed_from_chain_error(&snapshot, &err);
                    return recover_or_raise(&executed, module_id.as_str(), &inputs, err, &child_context);
                }
            };

        // 9. Execute.
        let raw_output = match module.execute(inputs_after_before.clone(), child_context.clone()).await {
            Ok(v) => v,
            Err(err) => {
                return recover_or_raise(&executed, module_id.as_str(), &inputs_after_before, err, &child_context);
            }
        };
        let normalized = normalize_output(raw_output);

        // 10. Validate output.
        let validated = match validator.validate_output(module_id.as_str(), &normalized, module.output_schema()) {
            Ok(v) => v,
            Err(err) => {
                return recover_or_raise(&executed, module_id.as_str(), &inputs_after_before, err, &child_context);
            }
        };

        // 11. Middleware after.
        Ok(MiddlewareManager::execute_after(
            &executed,
            module_id.as_str(),
            &inputs_after_before,
            validated,
            &child_context,
        ))
    }

    /// Produces a lazy sequence of output chunks (spec §4.7 `stream`). The
    /// `Module` trait models one async call, not an async generator; every
    /// module — streaming-annotated or not — therefore yields exactly one
    /// chunk: the full output of one `call`. See `DESIGN.md` for why true
    /// chunked streaming is out of scope for this port.
    pub fn stream<'a>(
        self: &'a Arc<Self>,
        module_id: &'a ModuleId,
        inputs: Option<Value>,
        context: Option<Context>,
    ) -> BoxStream<'a, Result<Value, ApcoreError>> {
        Box::pin(stream::once(async move { self.call(module_id, inputs, context).await }))
    }
}

/// 16 random bytes, hex-encoded, used as a fresh root context's trace id.
fn new_trace_id() -> String {
    let bytes: [u8; 16] = rand::rng().random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Replaces every top-level key starting with `_secret_` with a redaction
/// marker; all other keys (and non-object inputs) pass through unchanged
/// (spec §4.7 step 7).
fn redact(inputs: &Value) -> Value {
    let Value::Object(map) = inputs else {
        return inputs.clone();
    };
    let redacted = map
        .iter()
        .map(|(k, v)| {
            if k.starts_with(SECRET_PREFIX) {
                (k.clone(), Value::String("***REDACTED***".to_owned()))
            } else {
                (k.clone(), v.clone())
            }
        })
        .collect();
    Value::Object(redacted)
}

/// Normalizes a module's return value (spec §8 testable property 12):
/// null → `{}`, a map passes through, anything else is wrapped as
/// `{result: v}`.
fn normalize_output(value: Value) -> Value {
    match value {
        Value::Null => Value::Object(Map::new()),
        Value::Object(map) => Value::Object(map),
        other => {
            let mut wrapped = Map::new();
            wrapped.insert("result".to_owned(), other);
            Value::Object(wrapped)
        }
    }
}

/// Recovers the `executedMiddlewares` sublist from a `MiddlewareChainError`
/// raised by `execute_before`, so `onError` can still unwind over exactly
/// the middlewares that ran before the failure (spec §8 testable property 5).
fn executed_from_chain_error(snapshot: &[Arc<dyn Middleware>], error: &ApcoreError) -> Vec<Arc<dyn Middleware>> {
    let names: Vec<&str> = error
        .info()
        .details
        .get("executed_middlewares")
        .and_then(Value::as_array)
        .map(|names| names.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();
    snapshot
        .iter()
        .filter(|m| names.contains(&m.name()))
        .cloned()
        .collect()
}

/// Runs `onError` in reverse over `executed`; a non-null recovery becomes
/// the call's successful output (the `after` phase is skipped, per spec
/// §7 propagation policy), otherwise the original error is re-raised.
fn recover_or_raise(
    executed: &[Arc<dyn Middleware>],
    module_id: &str,
    inputs: &Value,
    error: ApcoreError,
    context: &Context,
) -> Result<Value, ApcoreError> {
    match MiddlewareManager::execute_on_error(executed, module_id, inputs, &error, context) {
        Some(recovery) => Ok(recovery),
        None => Err(error),
    }
}
