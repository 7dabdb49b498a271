//! Error taxonomy for the apcore module execution runtime.
//!
//! Pure data, no dependency on any transport or framework: every variant
//! carries a stable `code`, a human `message`, a structured `details`
//! payload, and a `timestamp`. This mirrors the shape the dispatch engine's
//! error table requires, not the HTTP Problem+JSON shape used elsewhere in
//! this lineage — callers that need an HTTP representation convert at the
//! edge, outside this crate.
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};

/// Structured payload shared by every `ApcoreError` variant.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorInfo {
    pub code: &'static str,
    pub message: String,
    pub details: Value,
    pub timestamp: DateTime<Utc>,
}

impl ErrorInfo {
    fn new(code: &'static str, message: impl Into<String>, details: Value) -> Self {
        Self {
            code,
            message: message.into(),
            details,
            timestamp: Utc::now(),
        }
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

macro_rules! error_kinds {
    ($($variant:ident => $code:literal),+ $(,)?) => {
        /// Tagged set of failure kinds produced by the runtime.
        #[derive(Debug, Clone, thiserror::Error, Serialize)]
        #[serde(tag = "kind", content = "info")]
        pub enum ApcoreError {
            $(
                #[error("{0}")]
                $variant(ErrorInfo),
            )+
        }

        impl ApcoreError {
            #[must_use]
            pub fn code(&self) -> &'static str {
                match self {
                    $(Self::$variant(_) => $code,)+
                }
            }

            #[must_use]
            pub fn info(&self) -> &ErrorInfo {
                match self {
                    $(Self::$variant(info) => info,)+
                }
            }
        }
    };
}

error_kinds! {
    ModuleNotFound => "MODULE_NOT_FOUND",
    InvalidInput => "INVALID_INPUT",
    ModuleLoadError => "MODULE_LOAD_ERROR",
    CircularDependency => "CIRCULAR_DEPENDENCY",
    SchemaNotFound => "SCHEMA_NOT_FOUND",
    SchemaParseError => "SCHEMA_PARSE_ERROR",
    SchemaCircularRef => "SCHEMA_CIRCULAR_REF",
    SchemaValidationError => "SCHEMA_VALIDATION_ERROR",
    ACLDenied => "ACL_DENIED",
    ApprovalDenied => "APPROVAL_DENIED",
    ApprovalTimeout => "APPROVAL_TIMEOUT",
    ApprovalPending => "APPROVAL_PENDING",
    CallDepthExceeded => "CALL_DEPTH_EXCEEDED",
    CallFrequencyExceeded => "CALL_FREQUENCY_EXCEEDED",
    CircularCall => "CIRCULAR_CALL",
    MiddlewareChainError => "MIDDLEWARE_CHAIN_ERROR",
    BindingFileInvalid => "BINDING_FILE_INVALID",
    BindingInvalidTarget => "BINDING_INVALID_TARGET",
    BindingModuleNotFound => "BINDING_MODULE_NOT_FOUND",
    BindingCallableNotFound => "BINDING_CALLABLE_NOT_FOUND",
    BindingNotCallable => "BINDING_NOT_CALLABLE",
    ConfigError => "CONFIG_ERROR",
    ConfigNotFound => "CONFIG_NOT_FOUND",
}

impl ApcoreError {
    #[must_use]
    pub fn module_not_found(module_id: impl Into<String>) -> Self {
        let id = module_id.into();
        Self::ModuleNotFound(ErrorInfo::new(
            "MODULE_NOT_FOUND",
            format!("module '{id}' is not registered"),
            json!({ "module_id": id }),
        ))
    }

    #[must_use]
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(ErrorInfo::new("INVALID_INPUT", message, Value::Null))
    }

    #[must_use]
    pub fn module_load_error(path: impl Into<String>, reason: impl Into<String>) -> Self {
        let path = path.into();
        let reason = reason.into();
        Self::ModuleLoadError(ErrorInfo::new(
            "MODULE_LOAD_ERROR",
            format!("failed to load module from '{path}': {reason}"),
            json!({ "path": path, "reason": reason }),
        ))
    }

    #[must_use]
    pub fn circular_dependency(path: Vec<String>) -> Self {
        let joined = path.join(" -> ");
        Self::CircularDependency(ErrorInfo::new(
            "CIRCULAR_DEPENDENCY",
            format!("circular dependency: {joined}"),
            json!({ "path": path }),
        ))
    }

    #[must_use]
    pub fn schema_not_found(module_id: impl Into<String>) -> Self {
        let id = module_id.into();
        Self::SchemaNotFound(ErrorInfo::new(
            "SCHEMA_NOT_FOUND",
            format!("no schema found for module '{id}'"),
            json!({ "module_id": id }),
        ))
    }

    #[must_use]
    pub fn schema_parse_error(path: impl Into<String>, reason: impl Into<String>) -> Self {
        let path = path.into();
        let reason = reason.into();
        Self::SchemaParseError(ErrorInfo::new(
            "SCHEMA_PARSE_ERROR",
            format!("failed to parse schema '{path}': {reason}"),
            json!({ "path": path, "reason": reason }),
        ))
    }

    #[must_use]
    pub fn schema_circular_ref(chain: Vec<String>) -> Self {
        let joined = chain.join(" -> ");
        Self::SchemaCircularRef(ErrorInfo::new(
            "SCHEMA_CIRCULAR_REF",
            format!("circular $ref chain: {joined}"),
            json!({ "chain": chain }),
        ))
    }

    #[must_use]
    pub fn schema_validation_error(module_id: impl Into<String>, violations: Vec<Value>) -> Self {
        let id = module_id.into();
        Self::SchemaValidationError(ErrorInfo::new(
            "SCHEMA_VALIDATION_ERROR",
            format!("schema validation failed for '{id}'"),
            json!({ "module_id": id, "violations": violations }),
        ))
    }

    #[must_use]
    pub fn acl_denied(caller: impl Into<String>, target: impl Into<String>) -> Self {
        let caller = caller.into();
        let target = target.into();
        Self::ACLDenied(ErrorInfo::new(
            "ACL_DENIED",
            format!("caller '{caller}' is not allowed to call '{target}'"),
            json!({ "caller": caller, "target": target }),
        ))
    }

    #[must_use]
    pub fn approval_denied(module_id: impl Into<String>) -> Self {
        let id = module_id.into();
        Self::ApprovalDenied(ErrorInfo::new(
            "APPROVAL_DENIED",
            format!("approval for '{id}' was rejected"),
            json!({ "module_id": id }),
        ))
    }

    #[must_use]
    pub fn approval_timeout(module_id: impl Into<String>) -> Self {
        let id = module_id.into();
        Self::ApprovalTimeout(ErrorInfo::new(
            "APPROVAL_TIMEOUT",
            format!("approval for '{id}' timed out"),
            json!({ "module_id": id }),
        ))
    }

    #[must_use]
    pub fn approval_pending(module_id: impl Into<String>, approval_id: impl Into<String>) -> Self {
        let module_id = module_id.into();
        let approval_id = approval_id.into();
        Self::ApprovalPending(ErrorInfo::new(
            "APPROVAL_PENDING",
            format!("approval for '{module_id}' is pending ({approval_id})"),
            json!({ "module_id": module_id, "approval_id": approval_id }),
        ))
    }

    /// Extracts the `approval_id` carried by an `ApprovalPending` error, if any.
    #[must_use]
    pub fn approval_id(&self) -> Option<String> {
        match self {
            Self::ApprovalPending(info) => info
                .details
                .get("approval_id")
                .and_then(Value::as_str)
                .map(str::to_owned),
            _ => None,
        }
    }

    #[must_use]
    pub fn call_depth_exceeded(module_id: impl Into<String>, max_depth: usize) -> Self {
        let id = module_id.into();
        Self::CallDepthExceeded(ErrorInfo::new(
            "CALL_DEPTH_EXCEEDED",
            format!("call depth exceeded while calling '{id}' (max {max_depth})"),
            json!({ "module_id": id, "max_call_depth": max_depth }),
        ))
    }

    #[must_use]
    pub fn call_frequency_exceeded(module_id: impl Into<String>, max_repeat: usize) -> Self {
        let id = module_id.into();
        Self::CallFrequencyExceeded(ErrorInfo::new(
            "CALL_FREQUENCY_EXCEEDED",
            format!("call frequency exceeded for '{id}' (max {max_repeat})"),
            json!({ "module_id": id, "max_module_repeat": max_repeat }),
        ))
    }

    #[must_use]
    pub fn circular_call(module_id: impl Into<String>) -> Self {
        let id = module_id.into();
        Self::CircularCall(ErrorInfo::new(
            "CIRCULAR_CALL",
            format!("circular call detected: '{id}' is already on the call chain"),
            json!({ "module_id": id }),
        ))
    }

    #[must_use]
    pub fn middleware_chain_error(original: &ApcoreError, executed: Vec<String>) -> Self {
        Self::MiddlewareChainError(ErrorInfo::new(
            "MIDDLEWARE_CHAIN_ERROR",
            format!("middleware chain failed: {}", original.info().message),
            json!({ "original": original.info(), "executed_middlewares": executed }),
        ))
    }

    #[must_use]
    pub fn binding_file_invalid(path: impl Into<String>, reason: impl Into<String>) -> Self {
        let path = path.into();
        let reason = reason.into();
        Self::BindingFileInvalid(ErrorInfo::new(
            "BINDING_FILE_INVALID",
            format!("invalid binding file '{path}': {reason}"),
            json!({ "path": path, "reason": reason }),
        ))
    }

    #[must_use]
    pub fn binding_invalid_target(target: impl Into<String>) -> Self {
        let target = target.into();
        Self::BindingInvalidTarget(ErrorInfo::new(
            "BINDING_INVALID_TARGET",
            format!("invalid binding target '{target}'"),
            json!({ "target": target }),
        ))
    }

    #[must_use]
    pub fn binding_module_not_found(module_path: impl Into<String>) -> Self {
        let module_path = module_path.into();
        Self::BindingModuleNotFound(ErrorInfo::new(
            "BINDING_MODULE_NOT_FOUND",
            format!("binding target module '{module_path}' not found"),
            json!({ "module_path": module_path }),
        ))
    }

    #[must_use]
    pub fn binding_callable_not_found(target: impl Into<String>) -> Self {
        let target = target.into();
        Self::BindingCallableNotFound(ErrorInfo::new(
            "BINDING_CALLABLE_NOT_FOUND",
            format!("binding target callable '{target}' not found"),
            json!({ "target": target }),
        ))
    }

    #[must_use]
    pub fn binding_not_callable(target: impl Into<String>) -> Self {
        let target = target.into();
        Self::BindingNotCallable(ErrorInfo::new(
            "BINDING_NOT_CALLABLE",
            format!("binding target '{target}' is not callable"),
            json!({ "target": target }),
        ))
    }

    #[must_use]
    pub fn config_error(message: impl Into<String>) -> Self {
        Self::ConfigError(ErrorInfo::new("CONFIG_ERROR", message, Value::Null))
    }

    #[must_use]
    pub fn config_not_found(key: impl Into<String>) -> Self {
        let key = key.into();
        Self::ConfigNotFound(ErrorInfo::new(
            "CONFIG_NOT_FOUND",
            format!("configuration key '{key}' not found"),
            json!({ "key": key }),
        ))
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn module_not_found_carries_code_and_details() {
        let err = ApcoreError::module_not_found("math.add");
        assert_eq!(err.code(), "MODULE_NOT_FOUND");
        assert_eq!(err.info().details["module_id"], "math.add");
        assert!(err.to_string().contains("math.add"));
    }

    #[test]
    fn approval_pending_exposes_approval_id() {
        let err = ApcoreError::approval_pending("secret.op", "tok-abc");
        assert_eq!(err.approval_id().as_deref(), Some("tok-abc"));
    }

    #[test]
    fn approval_id_is_none_for_other_kinds() {
        let err = ApcoreError::acl_denied("@external", "secret.op");
        assert_eq!(err.approval_id(), None);
    }

    #[test]
    fn circular_dependency_path_round_trips_through_details() {
        let err = ApcoreError::circular_dependency(vec!["a".into(), "b".into(), "a".into()]);
        let path: Vec<String> =
            serde_json::from_value(err.info().details["path"].clone()).unwrap();
        assert_eq!(path, vec!["a", "b", "a"]);
    }

    #[test]
    fn middleware_chain_error_preserves_original_message() {
        let original = ApcoreError::invalid_input("boom");
        let wrapped = ApcoreError::middleware_chain_error(&original, vec!["m1".into()]);
        assert!(wrapped.to_string().contains("boom"));
        assert_eq!(wrapped.code(), "MIDDLEWARE_CHAIN_ERROR");
    }

    #[test]
    fn serializes_with_tagged_kind() {
        let err = ApcoreError::call_depth_exceeded("a.b", 10);
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "CallDepthExceeded");
        assert_eq!(json["info"]["details"]["max_call_depth"], 10);
    }
}
