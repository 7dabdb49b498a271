//! Per-call dispatch context.
//!
//! `Context` is the value threaded through every `Executor::call`: a trace id
//! stable for the whole call tree, the chain of module ids from root to the
//! current frame, the immediate caller's id, an optional identity, and a
//! scratch map shared between a parent context and every context derived
//! from it via [`Context::child`].

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{Map, Value};

use crate::executor::Executor;
use crate::module::ModuleId;

/// Reserved `context.data` key prefixes owned by core subsystems. User module
/// bodies must never read or write keys under these prefixes.
pub const RESERVED_PREFIXES: &[&str] = &[
    "_tracing_",
    "_metrics_",
    "_obs_logging_",
    "_approval_token",
];

/// Who or what is calling into the runtime.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Identity {
    pub id: String,
    #[serde(rename = "type")]
    pub identity_type: String,
    #[serde(default)]
    pub roles: BTreeSet<String>,
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

/// Shared, mutable per-call-tree scratch space.
///
/// Realizes spec's "`context.data`: mutable map ... shared between a parent
/// context and its children" as an `Arc<Mutex<..>>` clone, which is cheap to
/// pass down and keeps every descendant context looking at the same map.
#[derive(Clone, Default)]
pub struct SharedData(Arc<Mutex<Map<String, Value>>>);

impl SharedData {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.0.lock().get(key).cloned()
    }

    pub fn set(&self, key: impl Into<String>, value: Value) {
        self.0.lock().insert(key.into(), value);
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.0.lock().remove(key)
    }

    /// Push a value onto a JSON-array-backed stack stored at `key`.
    pub fn push_stack(&self, key: &str, value: Value) {
        let mut data = self.0.lock();
        match data.get_mut(key) {
            Some(Value::Array(arr)) => arr.push(value),
            _ => {
                data.insert(key.to_owned(), Value::Array(vec![value]));
            }
        }
    }

    /// Pop the last value off a JSON-array-backed stack stored at `key`.
    pub fn pop_stack(&self, key: &str) -> Option<Value> {
        let mut data = self.0.lock();
        if let Some(Value::Array(arr)) = data.get_mut(key) {
            return arr.pop();
        }
        None
    }

    /// Mutate the top element of a JSON-array-backed stack stored at `key`
    /// in place, without popping it. Returns whether the stack was non-empty.
    pub fn mutate_stack_top(&self, key: &str, f: impl FnOnce(&mut Value)) -> bool {
        let mut data = self.0.lock();
        if let Some(Value::Array(arr)) = data.get_mut(key)
            && let Some(top) = arr.last_mut()
        {
            f(top);
            return true;
        }
        false
    }
}

/// Value passed through every executor call.
#[derive(Clone)]
pub struct Context {
    trace_id: String,
    caller_id: Option<ModuleId>,
    call_chain: Vec<ModuleId>,
    identity: Option<Identity>,
    data: SharedData,
    executor: Option<Arc<Executor>>,
    redacted_inputs: Option<Value>,
}

impl Context {
    /// A fresh root context, as the executor builds by default when a caller
    /// does not supply one.
    #[must_use]
    pub fn root(trace_id: impl Into<String>, executor: Option<Arc<Executor>>) -> Self {
        Self {
            trace_id: trace_id.into(),
            caller_id: None,
            call_chain: Vec::new(),
            identity: None,
            data: SharedData::new(),
            executor,
            redacted_inputs: None,
        }
    }

    #[must_use]
    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    #[must_use]
    pub fn caller_id(&self) -> Option<&ModuleId> {
        self.caller_id.as_ref()
    }

    #[must_use]
    pub fn call_chain(&self) -> &[ModuleId] {
        &self.call_chain
    }

    #[must_use]
    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    #[must_use]
    pub fn data(&self) -> &SharedData {
        &self.data
    }

    #[must_use]
    pub fn executor(&self) -> Option<&Arc<Executor>> {
        self.executor.as_ref()
    }

    #[must_use]
    pub fn redacted_inputs(&self) -> Option<&Value> {
        self.redacted_inputs.as_ref()
    }

    #[must_use]
    pub fn with_identity(mut self, identity: Identity) -> Self {
        self.identity = Some(identity);
        self
    }

    #[must_use]
    pub fn with_redacted_inputs(mut self, redacted: Value) -> Self {
        self.redacted_inputs = Some(redacted);
        self
    }

    /// Returns a context with the same trace id and `data` reference, the
    /// caller id set to the current leaf of the call chain, and the call
    /// chain extended by `next_module_id`.
    #[must_use]
    pub fn child(&self, next_module_id: ModuleId) -> Self {
        let caller_id = self.call_chain.last().cloned();
        let mut call_chain = self.call_chain.clone();
        call_chain.push(next_module_id);
        Self {
            trace_id: self.trace_id.clone(),
            caller_id,
            call_chain,
            identity: self.identity.clone(),
            data: self.data.clone(),
            executor: self.executor.clone(),
            redacted_inputs: None,
        }
    }
}
