//! The `Module` abstraction: a named, schema-validated computation unit.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use apcore_errors::ApcoreError;

use crate::context::Context;
use crate::schema::RuntimeSchema;

static MODULE_ID_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    #[expect(clippy::unwrap_used, reason = "pattern is a compile-time constant")]
    Regex::new(r"^[a-z_][a-z0-9_]*(\.[a-z_][a-z0-9_]*)*$").unwrap()
});

/// Canonical dotted module identifier, validated against
/// `[a-z_][a-z0-9_]*(\.[a-z_][a-z0-9_]*)*` at construction.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ModuleId(String);

impl ModuleId {
    /// # Errors
    /// Returns `ApcoreError::InvalidInput` if `id` does not match the
    /// canonical module-id pattern.
    pub fn new(id: impl Into<String>) -> Result<Self, ApcoreError> {
        let id = id.into();
        if !MODULE_ID_PATTERN.is_match(&id) {
            return Err(ApcoreError::invalid_input(format!(
                "invalid module id '{id}'"
            )));
        }
        Ok(Self(id))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ModuleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ModuleId {
    type Error = ApcoreError;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ModuleId> for String {
    fn from(value: ModuleId) -> Self {
        value.0
    }
}

/// Behavioral annotations describing a module's side effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Annotations {
    #[serde(default, alias = "readonly")]
    pub readonly: bool,
    #[serde(default, alias = "destructive")]
    pub destructive: bool,
    #[serde(default, alias = "idempotent")]
    pub idempotent: bool,
    #[serde(default, alias = "requires_approval")]
    pub requires_approval: bool,
    #[serde(default = "default_true", alias = "open_world")]
    pub open_world: bool,
    #[serde(default, alias = "streaming")]
    pub streaming: bool,
}

fn default_true() -> bool {
    true
}

impl Default for Annotations {
    fn default() -> Self {
        Self {
            readonly: false,
            destructive: false,
            idempotent: false,
            requires_approval: false,
            open_world: true,
            streaming: false,
        }
    }
}

/// A documented input/output example for a module.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleExample {
    pub title: String,
    pub inputs: Value,
    pub output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Dependency on another module, as declared in discovery metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyInfo {
    pub module_id: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub optional: bool,
}

/// Result of scanning a root directory for module sources.
#[derive(Debug, Clone)]
pub struct DiscoveredModule {
    pub file_path: std::path::PathBuf,
    pub canonical_id: String,
    pub meta_path: Option<std::path::PathBuf>,
    pub namespace: Option<String>,
}

/// The unit registered in the registry.
#[async_trait]
pub trait Module: Send + Sync {
    fn module_id(&self) -> &ModuleId;
    fn input_schema(&self) -> &RuntimeSchema;
    fn output_schema(&self) -> &RuntimeSchema;
    fn description(&self) -> &str;

    fn documentation(&self) -> Option<&str> {
        None
    }

    fn tags(&self) -> &[String] {
        &[]
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    fn annotations(&self) -> Annotations {
        Annotations::default()
    }

    fn examples(&self) -> &[ModuleExample] {
        &[]
    }

    fn metadata(&self) -> &BTreeMap<String, Value> {
        static EMPTY: LazyLock<BTreeMap<String, Value>> = LazyLock::new(BTreeMap::new);
        &EMPTY
    }

    async fn execute(&self, inputs: Value, context: Context) -> Result<Value, ApcoreError>;

    /// Called once after successful registration. Errors roll back the
    /// registration when raised from an explicit `register` call, and are
    /// logged-and-dropped when raised during discovery.
    async fn on_load(&self) -> Result<(), ApcoreError> {
        Ok(())
    }

    /// Called once on `unregister`. Errors are logged and never propagated.
    async fn on_unload(&self) -> Result<(), ApcoreError> {
        Ok(())
    }

    /// Custom markdown summary; the registry falls back to an
    /// auto-generated one when this returns `None`.
    fn describe(&self) -> Option<String> {
        None
    }
}

/// The merged view of a module plus its YAML companion metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleDescriptor {
    pub module_id: String,
    pub description: String,
    pub documentation: Option<String>,
    pub tags: Vec<String>,
    pub version: String,
    pub annotations: Annotations,
    pub examples: Vec<ModuleExample>,
    pub metadata: BTreeMap<String, Value>,
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn accepts_valid_ids() {
        assert!(ModuleId::new("math.add").is_ok());
        assert!(ModuleId::new("a").is_ok());
        assert!(ModuleId::new("a_b.c_1").is_ok());
    }

    #[test]
    fn rejects_invalid_ids() {
        assert!(ModuleId::new("Math.Add").is_err());
        assert!(ModuleId::new(".math").is_err());
        assert!(ModuleId::new("math.").is_err());
        assert!(ModuleId::new("").is_err());
        assert!(ModuleId::new("math..add").is_err());
    }

    #[test]
    fn annotations_default_open_world_true_rest_false() {
        let a = Annotations::default();
        assert!(a.open_world);
        assert!(!a.readonly && !a.destructive && !a.idempotent && !a.requires_approval);
        assert!(!a.streaming);
    }

    #[test]
    fn annotations_accept_snake_and_camel_case() {
        let camel: Annotations =
            serde_json::from_value(serde_json::json!({"requiresApproval": true})).unwrap();
        assert!(camel.requires_approval);

        let snake: Annotations =
            serde_json::from_value(serde_json::json!({"requires_approval": true})).unwrap();
        assert!(snake.requires_approval);
    }
}
