//! The module registry: storage, lifecycle events, and the discovery
//! pipeline (spec §4.1).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::RwLock;

use apcore_errors::ApcoreError;

use crate::discovery::{self, ScanOptions};
use crate::module::{Module, ModuleDescriptor, ModuleId};

/// Registration/unregistration notification delivered to [`Registry::on`]
/// listeners.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    Registered(ModuleId),
    Unregistered(ModuleId),
}

type Listener = Arc<dyn Fn(&RegistryEvent) + Send + Sync>;

struct Entry {
    module: Arc<dyn Module>,
}

/// Where [`Registry::discover`] looks for module sources and how it scans.
#[derive(Clone)]
pub struct DiscoverySource {
    pub root: PathBuf,
    pub namespace: Option<String>,
    pub options: ScanOptions,
}

/// Optional hook validating a module before it is admitted to the registry
/// (spec §4.1 `setValidator`); receives the descriptor that would be stored.
pub trait ModuleValidator: Send + Sync {
    fn validate(&self, descriptor: &ModuleDescriptor) -> Result<(), ApcoreError>;
}

/// Central store of live [`Module`] instances.
///
/// Grounded on the teacher's `ModuleRegistry`/`RegistryBuilder` split
/// (`examples/striped-zebra-dev-cyberfabric-core/libs/modkit/src/registry.rs`):
/// trait-object storage keyed by name, a discovery-and-build entry point,
/// and Kahn's-algorithm-ordered assembly — adapted here to hold live
/// `Arc<dyn Module>` handles directly (no pre-init/init/start phases; a
/// module is ready to call the moment it's registered) and to the spec's
/// richer `register`/`unregister`/watch/validate surface.
pub struct Registry {
    entries: RwLock<BTreeMap<String, Entry>>,
    listeners: RwLock<Vec<Listener>>,
    discoverer: RwLock<Option<DiscoverySource>>,
    validator: RwLock<Option<Arc<dyn ModuleValidator>>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            listeners: RwLock::new(Vec::new()),
            discoverer: RwLock::new(None),
            validator: RwLock::new(None),
        }
    }

    /// Registers `module`, running its `validator` (if set) and `on_load`
    /// hook first. On `on_load` failure the registration is rolled back.
    ///
    /// # Errors
    /// Returns the validator's error, the module's `on_load` error (module
    /// not admitted), or nothing if a module with the same id was already
    /// registered (idempotent overwrite, matching discovery's "first wins"
    /// semantics does not apply here — explicit `register` always replaces).
    pub async fn register(&self, module: Arc<dyn Module>) -> Result<(), ApcoreError> {
        let id = module.module_id().clone();

        if let Some(validator) = self.validator.read().clone() {
            let descriptor = describe_module(module.as_ref());
            validator.validate(&descriptor)?;
        }

        module.on_load().await?;

        self.entries
            .write()
            .insert(id.as_str().to_owned(), Entry { module });
        self.notify(&RegistryEvent::Registered(id));
        Ok(())
    }

    /// Removes a module, calling its `on_unload` hook (errors logged, never
    /// propagated, per [`crate::module::Module::on_unload`]'s contract).
    #[must_use]
    pub async fn unregister(&self, module_id: &ModuleId) -> bool {
        let removed = self.entries.write().remove(module_id.as_str());
        let Some(entry) = removed else { return false };

        if let Err(error) = entry.module.on_unload().await {
            tracing::warn!(module_id = %module_id, %error, "on_unload failed");
        }
        self.notify(&RegistryEvent::Unregistered(module_id.clone()));
        true
    }

    #[must_use]
    pub fn get(&self, module_id: &ModuleId) -> Option<Arc<dyn Module>> {
        self.entries
            .read()
            .get(module_id.as_str())
            .map(|entry| entry.module.clone())
    }

    #[must_use]
    pub fn has(&self, module_id: &ModuleId) -> bool {
        self.entries.read().contains_key(module_id.as_str())
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.entries.read().len()
    }

    /// Registered module ids, lexicographically sorted.
    #[must_use]
    pub fn module_ids(&self) -> Vec<ModuleId> {
        self.entries
            .read()
            .keys()
            .filter_map(|id| ModuleId::new(id.clone()).ok())
            .collect()
    }

    /// Currently-registered modules matching `filter`, lexicographically
    /// sorted by id. An empty/default filter matches everything.
    #[must_use]
    pub fn list(&self, filter: &ListFilter<'_>) -> Vec<Arc<dyn Module>> {
        self.entries
            .read()
            .values()
            .map(|e| e.module.clone())
            .filter(|m| filter.prefix.is_none_or(|p| m.module_id().as_str().starts_with(p)))
            .filter(|m| {
                filter.tags.is_none_or(|wanted| {
                    let have: std::collections::BTreeSet<&str> = m.tags().iter().map(String::as_str).collect();
                    wanted.iter().all(|t| have.contains(t.as_str()))
                })
            })
            .collect()
    }

    /// Same as `list(&ListFilter::default())`; named to mirror spec's
    /// `iter()` alongside `list()`.
    #[must_use]
    pub fn iter(&self) -> Vec<Arc<dyn Module>> {
        self.list(&ListFilter::default())
    }

    #[must_use]
    pub fn get_definition(&self, module_id: &ModuleId) -> Option<ModuleDescriptor> {
        self.get(module_id).map(|module| describe_module(module.as_ref()))
    }

    /// A markdown summary of `module_id`: the module's own [`Module::describe`]
    /// override if it provides one, otherwise an auto-generated summary built
    /// from its descriptor.
    #[must_use]
    pub fn describe(&self, module_id: &ModuleId) -> Option<String> {
        let module = self.get(module_id)?;
        Some(module.describe().unwrap_or_else(|| auto_describe(module.as_ref())))
    }

    /// Subscribes to registration/unregistration events, returning a handle
    /// usable to keep `listener`'s `Arc` alive for as long as it should fire
    /// (there is no explicit `off`; drop every clone of the returned `Arc`
    /// to stop delivery, matching event-emitter `on` without a removal API).
    pub fn on(&self, listener: impl Fn(&RegistryEvent) + Send + Sync + 'static) -> Arc<dyn Fn(&RegistryEvent) + Send + Sync> {
        let listener: Listener = Arc::new(listener);
        self.listeners.write().push(listener.clone());
        listener
    }

    fn notify(&self, event: &RegistryEvent) {
        for listener in self.listeners.read().iter() {
            listener(event);
        }
    }

    /// Sets the directory `discover()` scans when called without explicit
    /// arguments.
    pub fn set_discoverer(&self, source: DiscoverySource) {
        *self.discoverer.write() = Some(source);
    }

    pub fn set_validator(&self, validator: Arc<dyn ModuleValidator>) {
        *self.validator.write() = Some(validator);
    }

    /// Runs the 8-step discovery pipeline against the configured
    /// [`DiscoverySource`]: scan, dependency-order, resolve entry points,
    /// validate, load, register, and report skipped/failed entries.
    ///
    /// # Errors
    /// Returns `ApcoreError::ConfigError` if no discoverer was configured.
    /// Propagates scan I/O errors and dependency cycles; per-module
    /// resolution/validation/on_load failures are logged and skipped rather
    /// than aborting the whole pipeline (spec §4.1 step 4/7).
    pub async fn discover(&self) -> Result<DiscoveryReport, ApcoreError> {
        let source = self
            .discoverer
            .read()
            .clone()
            .ok_or_else(|| ApcoreError::config_error("no discovery source configured"))?;
        self.discover_from(&source).await
    }

    /// Runs discovery against an explicit source without changing the
    /// configured default.
    pub async fn discover_from(&self, source: &DiscoverySource) -> Result<DiscoveryReport, ApcoreError> {
        let resolved = discovery::discover(&source.root, source.namespace.as_deref(), &source.options)?;

        let mut report = DiscoveryReport::default();
        for item in resolved {
            let descriptor = describe_module(item.module.as_ref());
            if let Some(validator) = self.validator.read().clone()
                && let Err(error) = validator.validate(&descriptor)
            {
                tracing::warn!(module_id = %item.discovered.canonical_id, %error, "discovered module failed validation, skipping");
                report.skipped.push(item.discovered.canonical_id);
                continue;
            }

            match self.register(item.module).await {
                Ok(()) => report.registered.push(item.discovered.canonical_id),
                Err(error) => {
                    tracing::warn!(module_id = %item.discovered.canonical_id, %error, "discovered module failed to load, skipping");
                    report.skipped.push(item.discovered.canonical_id);
                }
            }
        }
        Ok(report)
    }

    /// Spawns a background poll loop comparing the discovery root's
    /// recursive max-mtime every `interval`; on change, re-runs `discover`.
    /// Per SPEC_FULL.md §9 (no `notify`-equivalent dependency introduced,
    /// polling is the chosen concrete policy for the spec's optional
    /// filesystem watcher).
    ///
    /// # Errors
    /// Returns `ApcoreError::ConfigError` if no discoverer is configured.
    pub fn watch(self: &Arc<Self>, interval: Duration) -> Result<WatchHandle, ApcoreError> {
        let source = self
            .discoverer
            .read()
            .clone()
            .ok_or_else(|| ApcoreError::config_error("no discovery source configured"))?;

        let registry = Arc::clone(self);
        let cancel = tokio_util::sync::CancellationToken::new();
        let task_cancel = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut last_mtime = directory_max_mtime(&source.root);
            loop {
                tokio::select! {
                    () = task_cancel.cancelled() => break,
                    () = tokio::time::sleep(interval) => {}
                }
                let current = directory_max_mtime(&source.root);
                if current != last_mtime {
                    last_mtime = current;
                    if let Err(error) = registry.discover_from(&source).await {
                        tracing::warn!(%error, "watch re-scan failed");
                    }
                }
            }
        });

        Ok(WatchHandle { cancel, handle: Some(handle) })
    }
}

/// Cancels a background [`Registry::watch`] loop on drop or explicit
/// [`WatchHandle::unwatch`].
pub struct WatchHandle {
    cancel: tokio_util::sync::CancellationToken,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl WatchHandle {
    pub fn unwatch(mut self) {
        self.cancel.cancel();
        self.handle.take();
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Recursive max-mtime of a directory tree, used as a cheap change signal
/// for the polling watcher. Missing/unreadable paths return `None`, which
/// compares unequal to any previous `Some` reading and so always triggers
/// a re-scan the next time the directory becomes readable.
fn directory_max_mtime(root: &Path) -> Option<SystemTime> {
    let mut latest: Option<SystemTime> = None;
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            return None;
        };
        for entry in entries.filter_map(Result::ok) {
            let Ok(metadata) = entry.metadata() else { continue };
            if let Ok(modified) = metadata.modified() {
                latest = Some(latest.map_or(modified, |l: SystemTime| l.max(modified)));
            }
            if metadata.is_dir() {
                stack.push(entry.path());
            }
        }
    }
    latest
}

/// Filter for [`Registry::list`]: `prefix` matches a module id's leading
/// substring, `tags` requires every listed tag to be present on the
/// module's code-level [`Module::tags`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ListFilter<'a> {
    pub prefix: Option<&'a str>,
    pub tags: Option<&'a [String]>,
}

fn auto_describe(module: &dyn Module) -> String {
    let mut out = format!("# {}\n\n{}\n", module.module_id(), module.description());
    out.push_str(&format!("\n**Version:** {}\n", module.version()));
    if !module.tags().is_empty() {
        out.push_str(&format!("**Tags:** {}\n", module.tags().join(", ")));
    }
    let a = module.annotations();
    out.push_str(&format!(
        "**Annotations:** readonly={}, destructive={}, idempotent={}, requiresApproval={}, openWorld={}, streaming={}\n",
        a.readonly, a.destructive, a.idempotent, a.requires_approval, a.open_world, a.streaming
    ));
    out
}

fn describe_module(module: &dyn Module) -> ModuleDescriptor {
    ModuleDescriptor {
        module_id: module.module_id().as_str().to_owned(),
        description: module.description().to_owned(),
        documentation: module.documentation().map(ToOwned::to_owned),
        tags: module.tags().to_vec(),
        version: module.version().to_owned(),
        annotations: module.annotations(),
        examples: module.examples().to_vec(),
        metadata: module.metadata().clone(),
    }
}

/// Outcome of a [`Registry::discover`] run: which canonical ids were
/// registered versus skipped (failed resolution/validation/load).
#[derive(Debug, Clone, Default)]
pub struct DiscoveryReport {
    pub registered: Vec<String>,
    pub skipped: Vec<String>,
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::schema::RuntimeSchema;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Echo {
        id: ModuleId,
        tags: Vec<String>,
    }

    #[async_trait]
    impl Module for Echo {
        fn module_id(&self) -> &ModuleId {
            &self.id
        }
        fn input_schema(&self) -> &RuntimeSchema {
            static S: std::sync::LazyLock<RuntimeSchema> = std::sync::LazyLock::new(RuntimeSchema::empty_object);
            &S
        }
        fn output_schema(&self) -> &RuntimeSchema {
            self.input_schema()
        }
        fn description(&self) -> &str {
            "echo"
        }
        fn tags(&self) -> &[String] {
            &self.tags
        }
        async fn execute(&self, inputs: Value, _context: Context) -> Result<Value, ApcoreError> {
            Ok(inputs)
        }
    }

    fn echo(id: &str) -> Arc<dyn Module> {
        Arc::new(Echo {
            id: ModuleId::new(id).unwrap(),
            tags: Vec::new(),
        })
    }

    fn echo_tagged(id: &str, tags: &[&str]) -> Arc<dyn Module> {
        Arc::new(Echo {
            id: ModuleId::new(id).unwrap(),
            tags: tags.iter().map(|t| (*t).to_owned()).collect(),
        })
    }

    #[tokio::test]
    async fn register_get_has_count_roundtrip() {
        let registry = Registry::new();
        let id = ModuleId::new("echo.one").unwrap();
        registry.register(echo("echo.one")).await.unwrap();

        assert!(registry.has(&id));
        assert_eq!(registry.count(), 1);
        assert!(registry.get(&id).is_some());
    }

    #[tokio::test]
    async fn unregister_removes_and_returns_false_when_absent() {
        let registry = Registry::new();
        let id = ModuleId::new("echo.one").unwrap();
        registry.register(echo("echo.one")).await.unwrap();

        assert!(registry.unregister(&id).await);
        assert!(!registry.has(&id));
        assert!(!registry.unregister(&id).await);
    }

    #[tokio::test]
    async fn module_ids_and_list_are_sorted() {
        let registry = Registry::new();
        registry.register(echo("z.last")).await.unwrap();
        registry.register(echo("a.first")).await.unwrap();

        let ids: Vec<String> = registry.module_ids().iter().map(ToString::to_string).collect();
        assert_eq!(ids, vec!["a.first", "z.last"]);
    }

    #[tokio::test]
    async fn listeners_receive_register_and_unregister_events() {
        let registry = Registry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let captured = seen.clone();
        let _handle = registry.on(move |event| captured.lock().push(event.clone()));

        let id = ModuleId::new("echo.one").unwrap();
        registry.register(echo("echo.one")).await.unwrap();
        registry.unregister(&id).await;

        let events = seen.lock();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], RegistryEvent::Registered(_)));
        assert!(matches!(events[1], RegistryEvent::Unregistered(_)));
    }

    struct RejectAll;
    impl ModuleValidator for RejectAll {
        fn validate(&self, descriptor: &ModuleDescriptor) -> Result<(), ApcoreError> {
            Err(ApcoreError::invalid_input(format!("rejected {}", descriptor.module_id)))
        }
    }

    #[tokio::test]
    async fn validator_rejection_prevents_registration() {
        let registry = Registry::new();
        registry.set_validator(Arc::new(RejectAll));
        let err = registry.register(echo("echo.one")).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_INPUT");
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn discover_without_discoverer_is_config_error() {
        let registry = Registry::new();
        let err = registry.discover().await.unwrap_err();
        assert_eq!(err.code(), "CONFIG_ERROR");
    }

    #[tokio::test]
    async fn discover_on_empty_directory_registers_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new();
        registry.set_discoverer(DiscoverySource {
            root: dir.path().to_path_buf(),
            namespace: None,
            options: ScanOptions::default(),
        });
        let report = registry.discover().await.unwrap();
        assert!(report.registered.is_empty());
        assert!(report.skipped.is_empty());
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn directory_max_mtime_changes_after_touch() {
        let dir = tempfile::tempdir().unwrap();
        let first = directory_max_mtime(dir.path());
        std::fs::write(dir.path().join("a.ts"), "x").unwrap();
        let second = directory_max_mtime(dir.path());
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn listener_call_count_matches_operations() {
        let registry = Registry::new();
        let count = Arc::new(AtomicUsize::new(0));
        let captured = count.clone();
        let _handle = registry.on(move |_event| {
            captured.fetch_add(1, Ordering::SeqCst);
        });
        registry.register(echo("a.one")).await.unwrap();
        registry.register(echo("a.two")).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn list_filters_by_prefix_and_tags() {
        let registry = Registry::new();
        registry.register(echo_tagged("math.add", &["arith"])).await.unwrap();
        registry.register(echo_tagged("math.sub", &["arith", "dangerous"])).await.unwrap();
        registry.register(echo_tagged("text.upper", &["string"])).await.unwrap();

        let by_prefix = registry.list(&ListFilter {
            prefix: Some("math."),
            tags: None,
        });
        assert_eq!(by_prefix.len(), 2);

        let by_tag = registry.list(&ListFilter {
            prefix: None,
            tags: Some(&["dangerous".to_owned()]),
        });
        assert_eq!(by_tag.len(), 1);
        assert_eq!(by_tag[0].module_id().as_str(), "math.sub");

        let combined = registry.list(&ListFilter {
            prefix: Some("math."),
            tags: Some(&["arith".to_owned()]),
        });
        assert_eq!(combined.len(), 2);
    }

    #[tokio::test]
    async fn describe_falls_back_to_auto_generated_markdown() {
        let registry = Registry::new();
        registry.register(echo("echo.one")).await.unwrap();
        let id = ModuleId::new("echo.one").unwrap();
        let markdown = registry.describe(&id).unwrap();
        assert!(markdown.contains("echo.one"));
        assert!(markdown.contains("echo"));
        assert!(registry.describe(&ModuleId::new("ghost.module").unwrap()).is_none());
    }
}
