//! Compile-time module registration.
//!
//! Spec §4.4 describes resolving each discovered source file's entry point
//! by dynamically importing it and locating an exported class/function.
//! SPEC_FULL.md §9 redesigns this for a statically-typed, compiled runtime:
//! every `Module` impl registers itself at program start via
//! [`inventory::submit!`], tagged with the relative source path the
//! scanner would discover it under. Resolution becomes a lookup instead of
//! a load.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use apcore_errors::ApcoreError;

use crate::module::{DiscoveredModule, Module};

/// A compile-time-registered module factory, submitted next to its `Module`
/// impl with [`register_module!`].
pub struct ModuleEntry {
    /// Path of the source file the scanner would discover, relative to its
    /// scan root (forward-slash separated, e.g. `"math/add.ts"`).
    pub source_path: &'static str,
    pub factory: fn() -> Arc<dyn Module>,
}

inventory::collect!(ModuleEntry);

/// Registers a module factory under the given scanner-relative source
/// path. Most callers use the [`register_module!`] macro instead.
#[macro_export]
macro_rules! register_module {
    ($source_path:expr, $factory:expr) => {
        ::inventory::submit! {
            $crate::discovery::entrypoint::ModuleEntry {
                source_path: $source_path,
                factory: $factory,
            }
        }
    };
}

/// Resolves a [`DiscoveredModule`] to its registered factory and
/// constructs an instance.
///
/// # Errors
/// Returns `ApcoreError::ModuleLoadError` if no `ModuleEntry` was submitted
/// for the discovered file's path, or if more than one entry claims the
/// same path.
pub fn resolve(discovered: &DiscoveredModule) -> Result<Arc<dyn Module>, ApcoreError> {
    let mut matches = inventory::iter::<ModuleEntry>()
        .filter(|entry| path_matches(entry.source_path, &discovered.file_path));

    let Some(first) = matches.next() else {
        return Err(ApcoreError::module_load_error(
            discovered.file_path.display().to_string(),
            "no compiled module entry point registered for this source path",
        ));
    };
    if matches.next().is_some() {
        return Err(ApcoreError::module_load_error(
            discovered.file_path.display().to_string(),
            "more than one module entry point claims this source path",
        ));
    }

    Ok((first.factory)())
}

/// Compares a registered `source_path` (forward-slash separated) against a
/// discovered file path by normalized trailing components, so registration
/// does not need to match the scan root's absolute prefix exactly.
fn path_matches(registered: &str, discovered: &Path) -> bool {
    let registered_components: Vec<&str> = registered.split('/').filter(|s| !s.is_empty()).collect();
    let discovered_buf: PathBuf = discovered.into();
    let discovered_components: Vec<_> = discovered_buf
        .components()
        .filter_map(|c| c.as_os_str().to_str())
        .collect();

    if registered_components.len() > discovered_components.len() {
        return false;
    }
    let tail = &discovered_components[discovered_components.len() - registered_components.len()..];
    tail == registered_components.as_slice()
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::context::Context;
    use async_trait::async_trait;
    use serde_json::Value;

    struct Probe;

    #[async_trait]
    impl Module for Probe {
        fn module_id(&self) -> &crate::module::ModuleId {
            static ID: std::sync::LazyLock<crate::module::ModuleId> =
                std::sync::LazyLock::new(|| crate::module::ModuleId::new("entrypoint.probe").unwrap());
            &ID
        }
        fn input_schema(&self) -> &crate::schema::RuntimeSchema {
            static S: std::sync::LazyLock<crate::schema::RuntimeSchema> =
                std::sync::LazyLock::new(crate::schema::RuntimeSchema::empty_object);
            &S
        }
        fn output_schema(&self) -> &crate::schema::RuntimeSchema {
            self.input_schema()
        }
        fn description(&self) -> &str {
            "test probe"
        }
        async fn execute(&self, inputs: Value, _context: Context) -> Result<Value, ApcoreError> {
            Ok(inputs)
        }
    }

    fn probe_factory() -> Arc<dyn Module> {
        Arc::new(Probe)
    }

    crate::register_module!("entrypoint_fixtures/probe.ts", probe_factory);

    #[test]
    fn resolves_registered_entry_by_relative_path() {
        let discovered = DiscoveredModule {
            file_path: PathBuf::from("/tmp/scan-root/entrypoint_fixtures/probe.ts"),
            canonical_id: "entrypoint_fixtures.probe".to_owned(),
            meta_path: None,
            namespace: None,
        };
        let module = resolve(&discovered).unwrap();
        assert_eq!(module.module_id().as_str(), "entrypoint.probe");
    }

    #[test]
    fn missing_entry_is_a_load_error() {
        let discovered = DiscoveredModule {
            file_path: PathBuf::from("/tmp/nowhere/ghost.ts"),
            canonical_id: "ghost".to_owned(),
            meta_path: None,
            namespace: None,
        };
        let err = resolve(&discovered).unwrap_err();
        assert_eq!(err.code(), "MODULE_LOAD_ERROR");
    }

    #[test]
    fn path_matching_requires_full_component_match_not_substring() {
        assert!(!path_matches("bar/foo.ts", Path::new("/root/ar/foo.ts")));
        assert!(path_matches("bar/foo.ts", Path::new("/root/x/bar/foo.ts")));
    }
}
