//! `$ref` resolution for schema documents (spec §4.5.2).
//!
//! Supports `#/pointer`, `relative/path.yaml[#/pointer]`, and
//! `apcore://module.id/pointer/segments`. All file-based refs are resolved
//! relative to the schemas root and are guarded against escaping it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde_json::Value;

use apcore_errors::ApcoreError;

const DEFAULT_MAX_DEPTH: usize = 32;

pub struct RefResolver {
    schemas_root: PathBuf,
    max_depth: usize,
    file_cache: Mutex<HashMap<PathBuf, Value>>,
}

impl RefResolver {
    #[must_use]
    pub fn new(schemas_root: impl Into<PathBuf>) -> Self {
        Self {
            schemas_root: schemas_root.into(),
            max_depth: DEFAULT_MAX_DEPTH,
            file_cache: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Deep-copies `document`, then walks it resolving every `$ref` in place.
    ///
    /// # Errors
    /// Returns `SchemaCircularRef` on a ref cycle or excessive depth, and
    /// `SchemaParseError` if a referenced file cannot be read or parsed, or
    /// escapes the schemas root.
    pub fn resolve(&self, document: &Value) -> Result<Value, ApcoreError> {
        let mut chain = Vec::new();
        self.resolve_node(document, document, &self.schemas_root.clone(), &mut chain, 0)
    }

    fn resolve_node(
        &self,
        node: &Value,
        root_doc: &Value,
        base_dir: &Path,
        chain: &mut Vec<String>,
        depth: usize,
    ) -> Result<Value, ApcoreError> {
        if depth > self.max_depth {
            return Err(ApcoreError::schema_circular_ref(chain.clone()));
        }

        let Some(obj) = node.as_object() else {
            return match node {
                Value::Array(items) => {
                    let mut out = Vec::with_capacity(items.len());
                    for item in items {
                        out.push(self.resolve_node(item, root_doc, base_dir, chain, depth)?);
                    }
                    Ok(Value::Array(out))
                }
                other => Ok(other.clone()),
            };
        };

        if let Some(Value::String(ref_str)) = obj.get("$ref") {
            let resolved = self.follow_ref(ref_str, root_doc, base_dir, chain, depth)?;
            let mut merged = resolved;
            if let (Value::Object(merged_obj), true) = (&mut merged, obj.len() > 1) {
                for (k, v) in obj {
                    if k != "$ref" {
                        merged_obj.insert(k.clone(), v.clone());
                    }
                }
            }
            return Ok(merged);
        }

        let mut out = serde_json::Map::with_capacity(obj.len());
        for (k, v) in obj {
            out.insert(k.clone(), self.resolve_node(v, root_doc, base_dir, chain, depth)?);
        }
        Ok(Value::Object(out))
    }

    fn follow_ref(
        &self,
        ref_str: &str,
        root_doc: &Value,
        base_dir: &Path,
        chain: &mut Vec<String>,
        depth: usize,
    ) -> Result<Value, ApcoreError> {
        if chain.contains(&ref_str.to_owned()) {
            let mut full = chain.clone();
            full.push(ref_str.to_owned());
            return Err(ApcoreError::schema_circular_ref(full));
        }
        chain.push(ref_str.to_owned());

        let (target_doc, target_base, pointer) = if let Some(pointer) = ref_str.strip_prefix('#') {
            (root_doc.clone(), base_dir.to_path_buf(), pointer.to_owned())
        } else if let Some(rest) = ref_str.strip_prefix("apcore://") {
            let (module_id, pointer) = rest.split_once('/').unwrap_or((rest, ""));
            let rel = format!("{}.schema.yaml", module_id.replace('.', "/"));
            let path = self.guarded_path(&rel)?;
            (self.load_file(&path)?, path, format!("/{pointer}"))
        } else {
            let (file_part, pointer) = match ref_str.split_once('#') {
                Some((f, p)) => (f, p.to_owned()),
                None => (ref_str, String::new()),
            };
            let path = self.guarded_path(file_part)?;
            (self.load_file(&path)?, path, pointer)
        };

        let pointed = if pointer.is_empty() || pointer == "/" {
            target_doc.clone()
        } else {
            json_pointer_get(&target_doc, &pointer)?
        };

        let resolved = self.resolve_node(&pointed, &target_doc, &target_base, chain, depth + 1)?;
        chain.pop();
        Ok(resolved)
    }

    fn guarded_path(&self, relative: &str) -> Result<PathBuf, ApcoreError> {
        let joined = self.schemas_root.join(relative);
        let canonical_root = self
            .schemas_root
            .canonicalize()
            .map_err(|e| ApcoreError::schema_parse_error(self.schemas_root.display().to_string(), e.to_string()))?;
        let canonical = joined
            .canonicalize()
            .map_err(|e| ApcoreError::schema_parse_error(relative, e.to_string()))?;
        if !canonical.starts_with(&canonical_root) {
            return Err(ApcoreError::schema_parse_error(
                relative,
                "ref escapes the schemas root",
            ));
        }
        Ok(canonical)
    }

    fn load_file(&self, path: &Path) -> Result<Value, ApcoreError> {
        if let Some(cached) = self.file_cache.lock().get(path) {
            return Ok(cached.clone());
        }
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ApcoreError::schema_parse_error(path.display().to_string(), e.to_string()))?;
        let value: Value = serde_saphyr::from_str(&contents)
            .map_err(|e| ApcoreError::schema_parse_error(path.display().to_string(), e.to_string()))?;
        self.file_cache.lock().insert(path.to_path_buf(), value.clone());
        Ok(value)
    }
}

/// Decodes `~1` → `/` and `~0` → `~` and walks a JSON pointer into `doc`.
fn json_pointer_get(doc: &Value, pointer: &str) -> Result<Value, ApcoreError> {
    let mut current = doc;
    for raw_token in pointer.split('/').skip(if pointer.starts_with('/') { 1 } else { 0 }) {
        if raw_token.is_empty() && pointer == "/" {
            continue;
        }
        let token = raw_token.replace("~1", "/").replace("~0", "~");
        current = match current {
            Value::Object(map) => map
                .get(&token)
                .ok_or_else(|| ApcoreError::schema_parse_error(pointer, format!("no such key '{token}'")))?,
            Value::Array(arr) => {
                let idx: usize = token
                    .parse()
                    .map_err(|_| ApcoreError::schema_parse_error(pointer, format!("invalid array index '{token}'")))?;
                arr.get(idx)
                    .ok_or_else(|| ApcoreError::schema_parse_error(pointer, format!("index {idx} out of range")))?
            }
            _ => {
                return Err(ApcoreError::schema_parse_error(
                    pointer,
                    "cannot descend into scalar value",
                ));
            }
        };
    }
    Ok(current.clone())
}
