//! Middleware pipeline: onion-model composition with reverse unwinding
//! (spec §4.8).

use serde_json::Value;

use apcore_errors::ApcoreError;

use crate::context::Context;

/// A `before`/`after`/`onError` hook triple. `Ok(None)` means "pass through
/// unchanged", matching spec's `null`-means-passthrough contract.
pub trait Middleware: Send + Sync {
    /// A label used in `executed_middlewares`/error reporting.
    fn name(&self) -> &str;

    fn before(
        &self,
        _module_id: &str,
        _inputs: &Value,
        _context: &Context,
    ) -> Result<Option<Value>, ApcoreError> {
        Ok(None)
    }

    fn after(
        &self,
        _module_id: &str,
        _inputs: &Value,
        _output: &Value,
        _context: &Context,
    ) -> Option<Value> {
        None
    }

    fn on_error(
        &self,
        _module_id: &str,
        _inputs: &Value,
        _error: &ApcoreError,
        _context: &Context,
    ) -> Option<Value> {
        None
    }
}

/// Coordinates `before`/`after`/`onError` across a registered set of
/// middlewares in onion order.
#[derive(Default)]
pub struct MiddlewareManager {
    middlewares: Vec<std::sync::Arc<dyn Middleware>>,
}

impl MiddlewareManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, middleware: std::sync::Arc<dyn Middleware>) {
        self.middlewares.push(middleware);
    }

    /// Removes a middleware by reference identity. Returns whether it was
    /// found and removed.
    pub fn remove(&mut self, middleware: &std::sync::Arc<dyn Middleware>) -> bool {
        let before_len = self.middlewares.len();
        self.middlewares
            .retain(|m| !std::sync::Arc::ptr_eq(m, middleware));
        self.middlewares.len() != before_len
    }

    /// A defensive copy for stable iteration despite concurrent
    /// registration changes (spec §4.8 "Single-threaded cooperative
    /// execution ... `snapshot`").
    #[must_use]
    pub fn snapshot(&self) -> Vec<std::sync::Arc<dyn Middleware>> {
        self.middlewares.clone()
    }

    /// Runs `before` over `snapshot` in registration order, accumulating
    /// the list of middlewares that actually ran.
    ///
    /// # Errors
    /// Wraps any `before` failure in `MiddlewareChainError`, carrying the
    /// names of middlewares that ran before the failure.
    pub fn execute_before(
        snapshot: &[std::sync::Arc<dyn Middleware>],
        module_id: &str,
        inputs: Value,
        context: &Context,
    ) -> Result<(Value, Vec<std::sync::Arc<dyn Middleware>>), ApcoreError> {
        let mut current = inputs;
        let mut executed = Vec::with_capacity(snapshot.len());
        for middleware in snapshot {
            match middleware.before(module_id, &current, context) {
                Ok(Some(new_inputs)) => {
                    current = new_inputs;
                    executed.push(middleware.clone());
                }
                Ok(None) => executed.push(middleware.clone()),
                Err(err) => {
                    let names: Vec<String> = executed.iter().map(|m| m.name().to_owned()).collect();
                    return Err(ApcoreError::middleware_chain_error(&err, names));
                }
            }
        }
        Ok((current, executed))
    }

    /// Runs `after` over `executed` in reverse order.
    #[must_use]
    pub fn execute_after(
        executed: &[std::sync::Arc<dyn Middleware>],
        module_id: &str,
        inputs: &Value,
        output: Value,
        context: &Context,
    ) -> Value {
        let mut current = output;
        for middleware in executed.iter().rev() {
            if let Some(new_output) = middleware.after(module_id, inputs, &current, context) {
                current = new_output;
            }
        }
        current
    }

    /// Runs `onError` over `executed` in reverse order, returning the
    /// first non-null recovery value. Errors thrown inside `onError` are
    /// logged and swallowed.
    #[must_use]
    pub fn execute_on_error(
        executed: &[std::sync::Arc<dyn Middleware>],
        module_id: &str,
        inputs: &Value,
        error: &ApcoreError,
        context: &Context,
    ) -> Option<Value> {
        for middleware in executed.iter().rev() {
            let recovery = middleware.on_error(module_id, inputs, error, context);
            if recovery.is_some() {
                return recovery;
            }
        }
        None
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    struct TaggingMiddleware {
        name: String,
        log: Arc<Mutex<Vec<String>>>,
        fail_in_before: bool,
        recover_with: Option<Value>,
    }

    impl Middleware for TaggingMiddleware {
        fn name(&self) -> &str {
            &self.name
        }

        fn before(&self, _module_id: &str, inputs: &Value, _context: &Context) -> Result<Option<Value>, ApcoreError> {
            self.log.lock().push(format!("before:{}", self.name));
            if self.fail_in_before {
                return Err(ApcoreError::invalid_input("boom"));
            }
            Ok(Some(inputs.clone()))
        }

        fn after(&self, _module_id: &str, _inputs: &Value, output: &Value, _context: &Context) -> Option<Value> {
            self.log.lock().push(format!("after:{}", self.name));
            Some(output.clone())
        }

        fn on_error(&self, _module_id: &str, _inputs: &Value, _error: &ApcoreError, _context: &Context) -> Option<Value> {
            self.log.lock().push(format!("onError:{}", self.name));
            self.recover_with.clone()
        }
    }

    fn mw(name: &str, log: &Arc<Mutex<Vec<String>>>) -> Arc<dyn Middleware> {
        Arc::new(TaggingMiddleware {
            name: name.to_owned(),
            log: log.clone(),
            fail_in_before: false,
            recover_with: None,
        })
    }

    #[test]
    fn before_runs_in_order_after_in_reverse() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut manager = MiddlewareManager::new();
        manager.add(mw("A", &log));
        manager.add(mw("B", &log));
        manager.add(mw("C", &log));

        let snapshot = manager.snapshot();
        let context = Context::root("t", None);
        let (inputs, executed) =
            MiddlewareManager::execute_before(&snapshot, "m", Value::from(1), &context).unwrap();
        let _ = MiddlewareManager::execute_after(&executed, "m", &inputs, Value::from(2), &context);

        let entries = log.lock().clone();
        assert_eq!(entries, vec!["before:A", "before:B", "before:C", "after:C", "after:B", "after:A"]);
    }

    #[test]
    fn onion_unwind_stops_executed_list_at_failing_middleware() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut manager = MiddlewareManager::new();
        manager.add(mw("A", &log));
        manager.add(Arc::new(TaggingMiddleware {
            name: "B".into(),
            log: log.clone(),
            fail_in_before: true,
            recover_with: None,
        }));
        manager.add(mw("C", &log));

        let snapshot = manager.snapshot();
        let context = Context::root("t", None);
        let err = MiddlewareManager::execute_before(&snapshot, "m", Value::from(1), &context).unwrap_err();
        assert_eq!(err.code(), "MIDDLEWARE_CHAIN_ERROR");
        assert_eq!(err.info().details["executed_middlewares"], serde_json::json!(["A"]));
    }

    #[test]
    fn first_recovery_wins_later_in_executed_list() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let m1 = Arc::new(TaggingMiddleware {
            name: "m1".into(),
            log: log.clone(),
            fail_in_before: false,
            recover_with: Some(Value::String("recoveredBy:m1".into())),
        });
        let m2 = Arc::new(TaggingMiddleware {
            name: "m2".into(),
            log: log.clone(),
            fail_in_before: false,
            recover_with: Some(Value::String("recoveredBy:m2".into())),
        });
        let executed: Vec<Arc<dyn Middleware>> = vec![m1, m2];
        let context = Context::root("t", None);
        let err = ApcoreError::invalid_input("boom");
        let recovery =
            MiddlewareManager::execute_on_error(&executed, "m", &Value::Null, &err, &context);
        assert_eq!(recovery, Some(Value::String("recoveredBy:m2".into())));
    }

    #[test]
    fn remove_by_identity() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut manager = MiddlewareManager::new();
        let a = mw("A", &log);
        manager.add(a.clone());
        assert!(manager.remove(&a));
        assert!(manager.snapshot().is_empty());
    }
}
