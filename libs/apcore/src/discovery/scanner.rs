//! Filesystem scanner: walks a root directory producing [`DiscoveredModule`]
//! records (spec §4.2).

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use apcore_errors::ApcoreError;

use crate::module::DiscoveredModule;

const SKIPPED_DIR_NAMES: &[&str] = &["node_modules", "__pycache__"];
const MODULE_EXTENSIONS: &[&str] = &["ts", "js"];
const TEST_SUFFIXES: &[&str] = &[".d.ts", ".test.ts", ".test.js", ".spec.ts", ".spec.js"];

/// Scanner configuration.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub max_depth: usize,
    /// Whether to follow symlinked directories. Off by default (spec §9
    /// REDESIGN FLAGS: "never follow unless explicitly enabled").
    pub follow_symlinks: bool,
    /// When `true`, a discovered file with no matching compile-time entry
    /// point aborts discovery with `ModuleLoadError` instead of being
    /// logged and skipped (spec §9 "silent-drop vs hard fail", resolved as
    /// a configurable policy — see `discovery::discover`).
    pub strict: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            max_depth: 8,
            follow_symlinks: false,
            strict: false,
        }
    }
}

/// Walks `root` up to `options.max_depth`, producing one [`DiscoveredModule`]
/// per eligible source file, optionally prefixed with `namespace`.
///
/// # Errors
/// Returns `ApcoreError::ConfigError` if `root` cannot be read.
pub fn scan(
    root: &Path,
    namespace: Option<&str>,
    options: &ScanOptions,
) -> Result<Vec<DiscoveredModule>, ApcoreError> {
    let mut out = Vec::new();
    let mut seen_ids: HashSet<String> = HashSet::new();
    let mut seen_lowercase: HashSet<String> = HashSet::new();
    let mut visited_real_dirs: HashSet<PathBuf> = HashSet::new();

    if let Ok(canonical_root) = root.canonicalize() {
        visited_real_dirs.insert(canonical_root);
    }

    walk(
        root,
        root,
        namespace,
        options,
        0,
        &mut visited_real_dirs,
        &mut seen_ids,
        &mut seen_lowercase,
        &mut out,
    )?;

    out.sort_by(|a, b| a.canonical_id.cmp(&b.canonical_id));
    Ok(out)
}

#[expect(clippy::too_many_arguments, reason = "recursive walk threads all scanner state through")]
fn walk(
    root: &Path,
    dir: &Path,
    namespace: Option<&str>,
    options: &ScanOptions,
    depth: usize,
    visited_real_dirs: &mut HashSet<PathBuf>,
    seen_ids: &mut HashSet<String>,
    seen_lowercase: &mut HashSet<String>,
    out: &mut Vec<DiscoveredModule>,
) -> Result<(), ApcoreError> {
    if depth > options.max_depth {
        return Ok(());
    }

    let entries = std::fs::read_dir(dir)
        .map_err(|e| ApcoreError::config_error(format!("cannot read '{}': {e}", dir.display())))?;

    let mut paths: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|e| e.path())
        .collect();
    paths.sort();

    for path in paths {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.starts_with('.') || name.starts_with('_') {
            continue;
        }

        let metadata = std::fs::symlink_metadata(&path);
        let Ok(metadata) = metadata else { continue };

        if metadata.is_symlink() {
            if !options.follow_symlinks {
                continue;
            }
            let Ok(real) = path.canonicalize() else { continue };
            if !visited_real_dirs.insert(real.clone()) {
                continue;
            }
            if real.is_dir() {
                walk(
                    root,
                    &real,
                    namespace,
                    options,
                    depth + 1,
                    visited_real_dirs,
                    seen_ids,
                    seen_lowercase,
                    out,
                )?;
            }
            continue;
        }

        if metadata.is_dir() {
            if SKIPPED_DIR_NAMES.contains(&name) {
                continue;
            }
            walk(
                root,
                &path,
                namespace,
                options,
                depth + 1,
                visited_real_dirs,
                seen_ids,
                seen_lowercase,
                out,
            )?;
            continue;
        }

        if !metadata.is_file() {
            continue;
        }
        if !is_eligible_source_file(name) {
            continue;
        }

        let Ok(relative) = path.strip_prefix(root) else {
            continue;
        };
        let canonical_id = canonical_id_for(relative, namespace);

        if !seen_ids.insert(canonical_id.clone()) {
            tracing::warn!(canonical_id, path = %path.display(), "duplicate canonical module id, first wins");
            continue;
        }
        let lowercase = canonical_id.to_lowercase();
        if !seen_lowercase.insert(lowercase) {
            tracing::warn!(canonical_id, "case-insensitive canonical id collision");
        }

        let meta_path = companion_meta_path(&path);
        out.push(DiscoveredModule {
            file_path: path,
            canonical_id,
            meta_path,
            namespace: namespace.map(str::to_owned),
        });
    }

    Ok(())
}

fn is_eligible_source_file(name: &str) -> bool {
    if TEST_SUFFIXES.iter().any(|suffix| name.ends_with(suffix)) {
        return false;
    }
    let Some(ext) = name.rsplit('.').next() else {
        return false;
    };
    MODULE_EXTENSIONS.contains(&ext)
}

fn canonical_id_for(relative: &Path, namespace: Option<&str>) -> String {
    let without_ext = relative.with_extension("");
    let dotted = without_ext
        .components()
        .filter_map(|c| c.as_os_str().to_str())
        .collect::<Vec<_>>()
        .join(".");
    match namespace {
        Some(ns) => format!("{ns}.{dotted}"),
        None => dotted,
    }
}

fn companion_meta_path(source_path: &Path) -> Option<PathBuf> {
    let stem = source_path.file_stem()?.to_str()?;
    let meta = source_path.with_file_name(format!("{stem}_meta.yaml"));
    meta.is_file().then_some(meta)
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn finds_eligible_files_and_skips_tests_and_dotfiles() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("math.ts"), "").unwrap();
        fs::write(dir.path().join("math.test.ts"), "").unwrap();
        fs::write(dir.path().join(".hidden.ts"), "").unwrap();
        fs::write(dir.path().join("_private.ts"), "").unwrap();
        fs::write(dir.path().join("readme.md"), "").unwrap();

        let discovered = scan(dir.path(), None, &ScanOptions::default()).unwrap();
        assert_eq!(discovered.len(), 1);
        assert_eq!(discovered[0].canonical_id, "math");
    }

    #[test]
    fn nested_paths_become_dotted_ids() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("ns/sub")).unwrap();
        fs::write(dir.path().join("ns/sub/add.ts"), "").unwrap();

        let discovered = scan(dir.path(), None, &ScanOptions::default()).unwrap();
        assert_eq!(discovered[0].canonical_id, "ns.sub.add");
    }

    #[test]
    fn namespace_is_prefixed() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("add.ts"), "").unwrap();
        let discovered = scan(dir.path(), Some("extA"), &ScanOptions::default()).unwrap();
        assert_eq!(discovered[0].canonical_id, "extA.add");
    }

    #[test]
    fn detects_companion_meta_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("add.ts"), "").unwrap();
        fs::write(dir.path().join("add_meta.yaml"), "").unwrap();
        let discovered = scan(dir.path(), None, &ScanOptions::default()).unwrap();
        assert!(discovered[0].meta_path.is_some());
    }

    #[test]
    fn skips_node_modules_and_pycache_dirs() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("node_modules")).unwrap();
        fs::write(dir.path().join("node_modules/pkg.ts"), "").unwrap();
        fs::write(dir.path().join("real.ts"), "").unwrap();
        let discovered = scan(dir.path(), None, &ScanOptions::default()).unwrap();
        assert_eq!(discovered.len(), 1);
        assert_eq!(discovered[0].canonical_id, "real");
    }

    #[test]
    fn symlinked_dir_not_followed_by_default() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("real")).unwrap();
        fs::write(dir.path().join("real/add.ts"), "").unwrap();
        #[cfg(unix)]
        {
            std::os::unix::fs::symlink(dir.path().join("real"), dir.path().join("link")).unwrap();
            let discovered = scan(dir.path(), None, &ScanOptions::default()).unwrap();
            assert_eq!(discovered.len(), 1);
            assert_eq!(discovered[0].canonical_id, "real.add");
        }
    }
}
