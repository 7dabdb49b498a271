//! YAML schema loading with a two-level cache and the three resolution
//! strategies (spec §4.5.1).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use apcore_errors::ApcoreError;

use super::RuntimeSchema;
use super::refs::RefResolver;
use crate::module::ModuleId;

/// Raw schema document loaded from `{id}.schema.yaml`, before conversion to
/// a [`RuntimeSchema`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaDefinition {
    #[serde(skip)]
    pub module_id: String,
    pub description: String,
    pub input_schema: Value,
    pub output_schema: Value,
    #[serde(default)]
    pub error_schema: Option<Value>,
    #[serde(default)]
    pub definitions: BTreeMap<String, Value>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub documentation: Option<String>,
    #[serde(rename = "$schema", default)]
    pub schema_url: Option<String>,
}

/// How [`SchemaLoader::get_schema`] reconciles a YAML-declared schema
/// against a native schema supplied by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResolutionStrategy {
    #[default]
    YamlFirst,
    NativeFirst,
    YamlOnly,
}

/// A pair of runtime-checkable schemas resolved for one module.
#[derive(Debug, Clone)]
pub struct ResolvedPair {
    pub input: RuntimeSchema,
    pub output: RuntimeSchema,
    pub input_json: Value,
    pub output_json: Value,
}

struct Cache {
    raw: BTreeMap<String, SchemaDefinition>,
    resolved: BTreeMap<String, ResolvedPair>,
}

/// Loads `{moduleId}.schema.yaml` files from a schemas root, resolving
/// `$ref`s and caching both the raw definition and the resolved pair.
pub struct SchemaLoader {
    schemas_root: PathBuf,
    ref_resolver: RefResolver,
    cache: RwLock<Cache>,
}

impl SchemaLoader {
    #[must_use]
    pub fn new(schemas_root: impl Into<PathBuf>) -> Self {
        let root = schemas_root.into();
        Self {
            ref_resolver: RefResolver::new(root.clone()),
            schemas_root: root,
            cache: RwLock::new(Cache {
                raw: BTreeMap::new(),
                resolved: BTreeMap::new(),
            }),
        }
    }

    fn schema_path(&self, module_id: &str) -> PathBuf {
        self.schemas_root
            .join(format!("{}.schema.yaml", module_id.replace('.', "/")))
    }

    /// Loads and caches the raw [`SchemaDefinition`] for `module_id`.
    ///
    /// # Errors
    /// Returns `SchemaNotFound` if the file does not exist, `SchemaParseError`
    /// if it cannot be parsed or fails YAML-level shape checks, and whatever
    /// [`RefResolver`] raises for `$ref` resolution.
    pub fn load_raw(&self, module_id: &str) -> Result<SchemaDefinition, ApcoreError> {
        if let Some(cached) = self.cache.read().unwrap_or_else(|e| e.into_inner()).raw.get(module_id) {
            return Ok(cached.clone());
        }

        let path = self.schema_path(module_id);
        if !path.is_file() {
            return Err(ApcoreError::schema_not_found(module_id));
        }
        let contents = std::fs::read_to_string(&path)
            .map_err(|e| ApcoreError::schema_parse_error(path.display().to_string(), e.to_string()))?;
        let mut raw: Value = serde_saphyr::from_str(&contents)
            .map_err(|e| ApcoreError::schema_parse_error(path.display().to_string(), e.to_string()))?;

        merge_defs(&mut raw);
        let resolved_doc = self.ref_resolver.resolve(&raw)?;

        let mut def: SchemaDefinition = serde_json::from_value(resolved_doc)
            .map_err(|e| ApcoreError::schema_parse_error(path.display().to_string(), e.to_string()))?;
        def.module_id = module_id.to_owned();

        self.cache
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .raw
            .insert(module_id.to_owned(), def.clone());
        Ok(def)
    }

    /// Resolves the input/output runtime schema pair for `module_id`
    /// following `strategy`, optionally falling back to or preferring a
    /// native schema pair supplied by the caller.
    ///
    /// # Errors
    /// Returns `SchemaNotFound` when neither YAML nor native schemas are
    /// available under the chosen strategy, and propagates loader/ref errors.
    pub fn get_schema(
        &self,
        module_id: &ModuleId,
        strategy: ResolutionStrategy,
        native: Option<(RuntimeSchema, RuntimeSchema)>,
    ) -> Result<ResolvedPair, ApcoreError> {
        let id = module_id.as_str();
        if let Some(cached) = self
            .cache
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .resolved
            .get(id)
        {
            return Ok(cached.clone());
        }

        let pair = match strategy {
            ResolutionStrategy::NativeFirst => {
                if let Some((input, output)) = native {
                    ResolvedPair {
                        input,
                        output,
                        input_json: Value::Null,
                        output_json: Value::Null,
                    }
                } else {
                    self.resolved_from_yaml(id)?
                }
            }
            ResolutionStrategy::YamlOnly => self.resolved_from_yaml(id)?,
            ResolutionStrategy::YamlFirst => match self.resolved_from_yaml(id) {
                Ok(pair) => pair,
                Err(ApcoreError::SchemaNotFound(_)) => {
                    if let Some((input, output)) = native {
                        ResolvedPair {
                            input,
                            output,
                            input_json: Value::Null,
                            output_json: Value::Null,
                        }
                    } else {
                        return Err(ApcoreError::schema_not_found(id));
                    }
                }
                Err(other) => return Err(other),
            },
        };

        self.cache
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .resolved
            .insert(id.to_owned(), pair.clone());
        Ok(pair)
    }

    fn resolved_from_yaml(&self, module_id: &str) -> Result<ResolvedPair, ApcoreError> {
        let def = self.load_raw(module_id)?;
        Ok(ResolvedPair {
            input: super::json_schema_to_runtime(&def.input_schema),
            output: super::json_schema_to_runtime(&def.output_schema),
            input_json: def.input_schema,
            output_json: def.output_schema,
        })
    }

    /// Clears both cache levels. Schema caches are monotonic otherwise
    /// (spec §5, "Schema caches are monotonic until `clearCache`").
    pub fn clear_cache(&self) {
        let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
        cache.raw.clear();
        cache.resolved.clear();
    }

    #[must_use]
    pub fn schemas_root(&self) -> &Path {
        &self.schemas_root
    }
}

/// Merges a top-level `$defs` map into `definitions`, per spec §4.5.1
/// ("May include `definitions`, `$defs` (merged)").
fn merge_defs(doc: &mut Value) {
    let Some(obj) = doc.as_object_mut() else {
        return;
    };
    let Some(defs) = obj.remove("$defs") else {
        return;
    };
    let Some(defs_obj) = defs.as_object() else {
        return;
    };
    let entry = obj
        .entry("definitions")
        .or_insert_with(|| Value::Object(serde_json::Map::new()));
    if let Some(entry_obj) = entry.as_object_mut() {
        for (k, v) in defs_obj {
            entry_obj.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use std::fs;

    fn write_schema(dir: &Path, id: &str, body: &str) {
        let path = dir.join(format!("{}.schema.yaml", id.replace('.', "/")));
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, body).unwrap();
    }

    #[test]
    fn loads_and_caches_raw_definition() {
        let dir = tempfile::tempdir().unwrap();
        write_schema(
            dir.path(),
            "math.add",
            "description: adds\ninput_schema:\n  type: object\noutput_schema:\n  type: object\n",
        );
        let loader = SchemaLoader::new(dir.path());
        let def = loader.load_raw("math.add").unwrap();
        assert_eq!(def.description, "adds");
        assert_eq!(def.module_id, "math.add");
        // second call hits cache
        let def2 = loader.load_raw("math.add").unwrap();
        assert_eq!(def2.description, def.description);
    }

    #[test]
    fn missing_schema_file_is_schema_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let loader = SchemaLoader::new(dir.path());
        let err = loader.load_raw("no.such.module").unwrap_err();
        assert_eq!(err.code(), "SCHEMA_NOT_FOUND");
    }

    #[test]
    fn defs_merge_into_definitions() {
        let dir = tempfile::tempdir().unwrap();
        write_schema(
            dir.path(),
            "m",
            "description: d\ninput_schema: {type: object}\noutput_schema: {type: object}\n$defs:\n  Foo:\n    type: string\n",
        );
        let loader = SchemaLoader::new(dir.path());
        let def = loader.load_raw("m").unwrap();
        assert!(def.definitions.contains_key("Foo"));
    }

    #[test]
    fn yaml_first_falls_back_to_native_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let loader = SchemaLoader::new(dir.path());
        let id = ModuleId::new("m.x").unwrap();
        let pair = loader
            .get_schema(
                &id,
                ResolutionStrategy::YamlFirst,
                Some((RuntimeSchema::ObjectAny, RuntimeSchema::ObjectAny)),
            )
            .unwrap();
        assert_eq!(pair.input, RuntimeSchema::ObjectAny);
    }

    #[test]
    fn yaml_only_ignores_native_and_fails_without_file() {
        let dir = tempfile::tempdir().unwrap();
        let loader = SchemaLoader::new(dir.path());
        let id = ModuleId::new("m.y").unwrap();
        let err = loader
            .get_schema(
                &id,
                ResolutionStrategy::YamlOnly,
                Some((RuntimeSchema::ObjectAny, RuntimeSchema::ObjectAny)),
            )
            .unwrap_err();
        assert_eq!(err.code(), "SCHEMA_NOT_FOUND");
    }

    #[test]
    fn native_first_prefers_native_over_yaml() {
        let dir = tempfile::tempdir().unwrap();
        write_schema(
            dir.path(),
            "m.z",
            "description: d\ninput_schema: {type: string}\noutput_schema: {type: object}\n",
        );
        let loader = SchemaLoader::new(dir.path());
        let id = ModuleId::new("m.z").unwrap();
        let pair = loader
            .get_schema(
                &id,
                ResolutionStrategy::NativeFirst,
                Some((RuntimeSchema::ObjectAny, RuntimeSchema::ObjectAny)),
            )
            .unwrap();
        assert_eq!(pair.input, RuntimeSchema::ObjectAny);
    }

    #[test]
    fn clear_cache_forces_reload() {
        let dir = tempfile::tempdir().unwrap();
        write_schema(
            dir.path(),
            "m",
            "description: d\ninput_schema: {type: object}\noutput_schema: {type: object}\n",
        );
        let loader = SchemaLoader::new(dir.path());
        loader.load_raw("m").unwrap();
        loader.clear_cache();
        assert!(loader.cache.read().unwrap().raw.is_empty());
    }
}
