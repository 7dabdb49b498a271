//! Schema infrastructure: YAML loading, `$ref` resolution, JSON-Schema to
//! runtime-schema conversion, validation, multi-target export, and the
//! strict-mode transform.

pub mod convert;
pub mod export;
pub mod loader;
pub mod refs;
pub mod strict;
pub mod validate;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

pub use convert::json_schema_to_runtime;
pub use export::{ExportProfile, export_module};
pub use loader::{ResolutionStrategy, SchemaDefinition, SchemaLoader};
pub use refs::RefResolver;
pub use strict::{apply_llm_descriptions, strip_extensions, to_strict};
pub use validate::{ValidationMode, Validator, Violation};

/// A numeric/string constraint bag, kept optional-field-sparse because most
/// schemas only set a handful of these.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NumberConstraints {
    pub minimum: Option<f64>,
    pub maximum: Option<f64>,
    pub exclusive_minimum: Option<f64>,
    pub exclusive_maximum: Option<f64>,
    pub multiple_of: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StringConstraints {
    pub min_length: Option<u64>,
    pub max_length: Option<u64>,
    pub pattern: Option<String>,
    pub format: Option<String>,
}

/// Runtime-checkable schema produced by converting a JSON Schema document
/// (spec §4.5.3). This is the form the [`Validator`] walks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum RuntimeSchema {
    Object {
        properties: BTreeMap<String, RuntimeSchema>,
        required: BTreeSet<String>,
    },
    /// `object` with no `properties`: permissive map-of-anything.
    ObjectAny,
    Array(Box<RuntimeSchema>),
    /// `array` with no `items`: array-of-anything.
    ArrayAny,
    String(StringConstraints),
    Integer(NumberConstraints),
    Number(NumberConstraints),
    Boolean,
    Null,
    Enum(Vec<Value>),
    /// `oneOf` / `anyOf`.
    Union(Vec<RuntimeSchema>),
    /// `allOf`.
    Intersection(Vec<RuntimeSchema>),
    /// Anything unrecognized.
    Unknown,
}

impl RuntimeSchema {
    /// The permissive object schema used as a default when no schema is
    /// declared (binding loader fallback, empty-object default).
    #[must_use]
    pub fn empty_object() -> Self {
        Self::ObjectAny
    }
}

/// Which side of a module's contract a [`ResolvedSchema`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Input,
    Output,
}

/// A schema resolved for a given module and direction: the raw JSON-Schema
/// document plus its converted runtime-checkable form.
#[derive(Debug, Clone)]
pub struct ResolvedSchema {
    pub json_schema: Value,
    pub schema: RuntimeSchema,
    pub module_id: String,
    pub direction: Direction,
}
