//! Binding loader: wraps a compile-time-registered callable behind the
//! `Module` trait, described by a YAML binding file (spec §4.6).
//!
//! Spec §4.6 resolves `target` by dynamically importing a module path and
//! binding an export or an instance method. Rust has no dynamic `import()`;
//! per the same redesign principle as [`crate::discovery::entrypoint`],
//! callables register themselves at compile time via [`inventory::submit!`]
//! under the module path and export name they would have been imported
//! from, and `target` resolution becomes a lookup rather than a load. A
//! target naming a module path with no registered callable at all is
//! `BindingModuleNotFound`; a target naming a known module path but an
//! unregistered export or method is `BindingCallableNotFound`.
//! `BindingNotCallable` has no reachable case in this redesign — every
//! registered entry is, by construction, callable — and is kept only so the
//! error taxonomy stays a superset of spec's.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde::Deserialize;
use serde_json::{Map, Value};

use apcore_errors::ApcoreError;

use crate::context::Context;
use crate::module::{Module, ModuleId};
use crate::schema::{RuntimeSchema, json_schema_to_runtime};

const DEFAULT_PATTERN: &str = "*.binding.yaml";

/// A compile-time-registered binding callable's signature: inputs and a
/// call context in, a raw (not-yet-normalized) return value out.
pub type BindingFn = fn(Value, Context) -> BoxFuture<'static, Result<Value, ApcoreError>>;

/// One callable submitted with [`register_binding_callable!`], matched
/// against a binding's `target` by `module_path` then `export`.
pub struct BindingCallableEntry {
    pub module_path: &'static str,
    pub export: &'static str,
    pub call: BindingFn,
}

inventory::collect!(BindingCallableEntry);

/// Registers a callable reachable from binding files as
/// `"<module_path>:<export>"`. Most callers reach for this instead of
/// submitting a [`BindingCallableEntry`] directly.
#[macro_export]
macro_rules! register_binding_callable {
    ($module_path:expr, $export:expr, $call:expr) => {
        ::inventory::submit! {
            $crate::binding::BindingCallableEntry {
                module_path: $module_path,
                export: $export,
                call: $call,
            }
        }
    };
}

/// One entry of a binding file's `bindings` list.
#[derive(Debug, Clone, Deserialize)]
pub struct Binding {
    pub module_id: String,
    pub target: String,
    #[serde(default)]
    pub input_schema: Option<Value>,
    #[serde(default)]
    pub output_schema: Option<Value>,
    #[serde(default)]
    pub schema_ref: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct BindingFile {
    bindings: Vec<Binding>,
}

/// Loads YAML binding files and resolves each entry to a [`Module`] wrapping
/// its compile-time-registered callable.
pub struct BindingLoader;

impl BindingLoader {
    /// Parses one binding file and resolves every entry to a module.
    ///
    /// # Errors
    /// Returns `BindingFileInvalid` if the file cannot be read or parsed,
    /// or any per-entry error from target/schema resolution.
    pub fn load_file(path: &Path) -> Result<Vec<Arc<dyn Module>>, ApcoreError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ApcoreError::binding_file_invalid(path.display().to_string(), e.to_string()))?;
        let file: BindingFile = serde_saphyr::from_str(&raw)
            .map_err(|e| ApcoreError::binding_file_invalid(path.display().to_string(), e.to_string()))?;
        let dir = path.parent().unwrap_or_else(|| Path::new("."));

        file.bindings.iter().map(|entry| build_module(entry, dir)).collect()
    }

    /// Lists `dir`, selects entries whose name ends with the suffix after
    /// `pattern`'s `*` (default `*.binding.yaml` → suffix `.binding.yaml`),
    /// sorts ascending, and loads each file in order.
    ///
    /// # Errors
    /// Returns `BindingFileInvalid` if `dir` is missing or not a directory,
    /// or if any contained binding file fails to load.
    pub fn load_dir(dir: &Path, pattern: &str) -> Result<Vec<Arc<dyn Module>>, ApcoreError> {
        if !dir.is_dir() {
            return Err(ApcoreError::binding_file_invalid(
                dir.display().to_string(),
                "not a directory",
            ));
        }

        let suffix = pattern.split_once('*').map_or(pattern, |(_, after)| after);
        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
            .map_err(|e| ApcoreError::binding_file_invalid(dir.display().to_string(), e.to_string()))?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|p| {
                p.is_file()
                    && p.file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|name| name.ends_with(suffix))
            })
            .collect();
        paths.sort();

        let mut modules = Vec::new();
        for path in paths {
            modules.extend(Self::load_file(&path)?);
        }
        Ok(modules)
    }

    /// [`Self::load_dir`] with the default `*.binding.yaml` pattern.
    ///
    /// # Errors
    /// Same as [`Self::load_dir`].
    pub fn load_dir_default(dir: &Path) -> Result<Vec<Arc<dyn Module>>, ApcoreError> {
        Self::load_dir(dir, DEFAULT_PATTERN)
    }
}

fn build_module(entry: &Binding, binding_dir: &Path) -> Result<Arc<dyn Module>, ApcoreError> {
    let module_id = ModuleId::new(entry.module_id.clone())?;
    let call = resolve_target(&entry.target)?;
    let (input_schema, output_schema) = resolve_schemas(entry, binding_dir)?;

    Ok(Arc::new(BindingModule {
        module_id,
        input_schema,
        output_schema,
        description: entry.description.clone().unwrap_or_default(),
        tags: entry.tags.clone(),
        version: entry.version.clone().unwrap_or_else(|| "1.0.0".to_owned()),
        call,
    }))
}

/// Parses `"module-path:export"` and looks it up against the
/// [`BindingCallableEntry`] inventory.
///
/// # Errors
/// `BindingInvalidTarget` if `target` has no colon or an empty side;
/// `BindingModuleNotFound` if no entry registered that module path at all;
/// `BindingCallableNotFound` if the module path is known but the export is
/// not.
fn resolve_target(target: &str) -> Result<BindingFn, ApcoreError> {
    let Some((module_path, export)) = target.split_once(':') else {
        return Err(ApcoreError::binding_invalid_target(target));
    };
    if module_path.is_empty() || export.is_empty() {
        return Err(ApcoreError::binding_invalid_target(target));
    }

    let mut module_path_known = false;
    for entry in inventory::iter::<BindingCallableEntry>() {
        if entry.module_path == module_path {
            module_path_known = true;
            if entry.export == export {
                return Ok(entry.call);
            }
        }
    }

    if module_path_known {
        Err(ApcoreError::binding_callable_not_found(target))
    } else {
        Err(ApcoreError::binding_module_not_found(module_path))
    }
}

/// Resolves a binding's input/output schemas in spec §4.6 priority order:
/// inline schemas first (missing side defaults to permissive), then
/// `schema_ref` (an external YAML file read relative to the binding file,
/// `input_schema`/`output_schema` keys pulled from its top level), then
/// fully permissive.
fn resolve_schemas(entry: &Binding, binding_dir: &Path) -> Result<(RuntimeSchema, RuntimeSchema), ApcoreError> {
    if entry.input_schema.is_some() || entry.output_schema.is_some() {
        let input = entry.input_schema.as_ref().map_or_else(RuntimeSchema::empty_object, json_schema_to_runtime);
        let output = entry.output_schema.as_ref().map_or_else(RuntimeSchema::empty_object, json_schema_to_runtime);
        return Ok((input, output));
    }

    if let Some(schema_ref) = &entry.schema_ref {
        let path = binding_dir.join(schema_ref);
        let raw = std::fs::read_to_string(&path)
            .map_err(|e| ApcoreError::binding_file_invalid(path.display().to_string(), e.to_string()))?;
        let doc: Value = serde_saphyr::from_str(&raw)
            .map_err(|e| ApcoreError::binding_file_invalid(path.display().to_string(), e.to_string()))?;
        let input = doc.get("input_schema").map_or_else(RuntimeSchema::empty_object, json_schema_to_runtime);
        let output = doc.get("output_schema").map_or_else(RuntimeSchema::empty_object, json_schema_to_runtime);
        return Ok((input, output));
    }

    Ok((RuntimeSchema::empty_object(), RuntimeSchema::empty_object()))
}

/// A module whose body is a resolved binding callable.
struct BindingModule {
    module_id: ModuleId,
    input_schema: RuntimeSchema,
    output_schema: RuntimeSchema,
    description: String,
    tags: Vec<String>,
    version: String,
    call: BindingFn,
}

#[async_trait]
impl Module for BindingModule {
    fn module_id(&self) -> &ModuleId {
        &self.module_id
    }

    fn input_schema(&self) -> &RuntimeSchema {
        &self.input_schema
    }

    fn output_schema(&self) -> &RuntimeSchema {
        &self.output_schema
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn tags(&self) -> &[String] {
        &self.tags
    }

    fn version(&self) -> &str {
        &self.version
    }

    async fn execute(&self, inputs: Value, context: Context) -> Result<Value, ApcoreError> {
        let raw = (self.call)(inputs, context).await?;
        Ok(normalize_callable_return(raw))
    }
}

/// Normalizes a binding callable's raw return value at binding-construction
/// time (spec §9 design note 7): `null`/absent → `{}`, a map passes
/// through, anything else is wrapped as `{result: v}`. This duplicates
/// `executor::normalize_output`'s shape by design — the executor's own
/// output normalization is idempotent on an already-normalized map, so
/// applying both causes no double-transform.
fn normalize_callable_return(value: Value) -> Value {
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
