//! Module discovery: filesystem scan → dependency ordering → compile-time
//! entry point resolution (spec §4.1-4.4).

pub mod deps;
pub mod entrypoint;
pub mod scanner;

pub use entrypoint::ModuleEntry;
pub use scanner::ScanOptions;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use apcore_errors::ApcoreError;

use crate::module::{DependencyInfo, DiscoveredModule, Module};

/// Metadata companion file next to a discovered module source, merged into
/// its runtime descriptor at registration time.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct ModuleMeta {
    #[serde(default)]
    pub dependencies: Vec<DependencyInfo>,
}

/// One resolved module, ready to hand to [`crate::registry::Registry`].
pub struct Resolved {
    pub discovered: DiscoveredModule,
    pub module: Arc<dyn Module>,
}

/// Scans `root`, reads each discovered module's companion metadata (if
/// any), orders the result so dependencies precede dependents, and
/// resolves each to its compile-time-registered instance.
///
/// # Errors
/// Propagates scanner I/O failures and dependency cycles. Entry-point
/// resolution failures are logged and the offending module is dropped from
/// the result unless `options.strict` is set, in which case the first such
/// failure aborts discovery.
pub fn discover(root: &Path, namespace: Option<&str>, options: &ScanOptions) -> Result<Vec<Resolved>, ApcoreError> {
    let discovered = scanner::scan(root, namespace, options)?;

    let mut by_id: BTreeMap<String, DiscoveredModule> = BTreeMap::new();
    let mut deps: BTreeMap<String, Vec<DependencyInfo>> = BTreeMap::new();

    for module in discovered {
        if let Some(meta_path) = &module.meta_path {
            let meta = load_meta(meta_path)?;
            if !meta.dependencies.is_empty() {
                deps.insert(module.canonical_id.clone(), meta.dependencies);
            }
        }
        by_id.insert(module.canonical_id.clone(), module);
    }

    let ids: Vec<String> = by_id.keys().cloned().collect();
    let order = deps::topological_order(&ids, &deps)?;

    let mut resolved = Vec::with_capacity(order.len());
    for id in order {
        let discovered = by_id.remove(&id).expect("id came from by_id's own keys");
        match entrypoint::resolve(&discovered) {
            Ok(module) => resolved.push(Resolved { discovered, module }),
            Err(error) if options.strict => return Err(error),
            Err(error) => {
                tracing::warn!(canonical_id = %discovered.canonical_id, %error, "entry point resolution failed, skipping");
            }
        }
    }
    Ok(resolved)
}

fn load_meta(path: &Path) -> Result<ModuleMeta, ApcoreError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| ApcoreError::module_load_error(path.display().to_string(), e.to_string()))?;
    serde_saphyr::from_str(&raw)
        .map_err(|e| ApcoreError::module_load_error(path.display().to_string(), e.to_string()))
}
