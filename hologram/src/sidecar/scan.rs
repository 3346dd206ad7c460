//! Project file scanning for `query` requests that carry a project dir.
//!
//! Runs outside any session lock: it only reads the filesystem. Unchanged
//! files (same mtime) are served from a per-project content cache.

use globset::{Glob, GlobSet, GlobSetBuilder};
use lru::LruCache;
use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use crate::config::ProjectScanConfig;

/// Projects whose file contents are kept between scans.
pub const MAX_CACHED_PROJECTS: usize = 10;

/// Prefix of every scanned file key.
pub const PROJECT_KEY_PREFIX: &str = "project:";

const ALWAYS_SKIPPED_DIRS: &[&str] = &["node_modules", "__pycache__", ".git"];

#[derive(Clone)]
struct CachedFile {
    mtime: SystemTime,
    content: String,
}

type ProjectSnapshot = HashMap<String, CachedFile>;

/// Compiled include/exclude patterns.
struct ScanMatcher {
    include: GlobSet,
    include_names: GlobSet,
    exclude: GlobSet,
    exclude_names: GlobSet,
}

impl ScanMatcher {
    fn new(config: &ProjectScanConfig) -> Result<Self, globset::Error> {
        let (include, include_names) = build_sets(&config.patterns)?;
        let (exclude, exclude_names) = build_sets(&config.exclude)?;
        Ok(Self {
            include,
            include_names,
            exclude,
            exclude_names,
        })
    }

    fn includes(&self, rel_path: &str) -> bool {
        matches_any(&self.include, &self.include_names, rel_path)
    }

    fn excludes(&self, rel_path: &str) -> bool {
        matches_any(&self.exclude, &self.exclude_names, rel_path)
    }
}

/// Full-path set plus a set of slash-free patterns matched on file names.
fn build_sets(patterns: &[String]) -> Result<(GlobSet, GlobSet), globset::Error> {
    let mut full = GlobSetBuilder::new();
    let mut names = GlobSetBuilder::new();
    for pattern in patterns {
        full.add(Glob::new(pattern)?);
        if !pattern.contains('/') {
            names.add(Glob::new(pattern)?);
        }
    }
    Ok((full.build()?, names.build()?))
}

fn matches_any(full: &GlobSet, names: &GlobSet, rel_path: &str) -> bool {
    if full.is_match(rel_path) {
        return true;
    }
    let name = rel_path.rsplit('/').next().unwrap_or(rel_path);
    names.is_match(name)
}

/// Scanner with an LRU-bounded per-project content cache.
pub struct ProjectScanner {
    cache: Mutex<LruCache<PathBuf, ProjectSnapshot>>,
}

impl Default for ProjectScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl ProjectScanner {
    pub fn new() -> Self {
        let capacity = NonZeroUsize::new(MAX_CACHED_PROJECTS).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Number of projects currently cached.
    pub fn cached_projects(&self) -> usize {
        self.cache.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// Scan `project_dir`, returning `project:<relative path>` -> content.
    ///
    /// Invalid patterns or an unreadable root yield an empty map.
    pub fn scan(&self, project_dir: &Path, config: &ProjectScanConfig) -> BTreeMap<String, String> {
        let matcher = match ScanMatcher::new(config) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(error = %e, "Invalid project scan pattern");
                return BTreeMap::new();
            }
        };

        let root = std::fs::canonicalize(project_dir).unwrap_or_else(|_| project_dir.to_path_buf());
        let previous = self
            .cache
            .lock()
            .ok()
            .and_then(|mut c| c.get(&root).cloned())
            .unwrap_or_default();

        let mut snapshot = ProjectSnapshot::new();
        let mut result = BTreeMap::new();
        let mut stack = vec![(root.clone(), String::new())];

        'walk: while let Some((dir, rel_dir)) = stack.pop() {
            let mut entries: Vec<_> = match std::fs::read_dir(&dir) {
                Ok(rd) => rd.filter_map(Result::ok).collect(),
                Err(e) => {
                    tracing::warn!(dir = %dir.display(), error = %e, "Error scanning project directory");
                    continue;
                }
            };
            entries.sort_by_key(|e| e.file_name());

            let mut subdirs = Vec::new();
            for entry in entries {
                let name = entry.file_name().to_string_lossy().into_owned();
                let rel = if rel_dir.is_empty() {
                    name.clone()
                } else {
                    format!("{rel_dir}/{name}")
                };
                let Ok(file_type) = entry.file_type() else {
                    continue;
                };

                if file_type.is_dir() {
                    if name.starts_with('.')
                        || ALWAYS_SKIPPED_DIRS.contains(&name.as_str())
                        || matcher.excludes(&format!("{rel}/dummy"))
                    {
                        continue;
                    }
                    subdirs.push((entry.path(), rel));
                    continue;
                }

                if result.len() >= config.max_files {
                    break 'walk;
                }
                if !file_type.is_file() || !matcher.includes(&rel) || matcher.excludes(&rel) {
                    continue;
                }

                let key = format!("{PROJECT_KEY_PREFIX}{rel}");
                let Ok(mtime) = entry.metadata().and_then(|m| m.modified()) else {
                    continue;
                };

                let content = match previous.get(&key) {
                    Some(cached) if cached.mtime == mtime => cached.content.clone(),
                    _ => match std::fs::read(entry.path()) {
                        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                        Err(_) => continue,
                    },
                };

                snapshot.insert(
                    key.clone(),
                    CachedFile {
                        mtime,
                        content: content.clone(),
                    },
                );
                result.insert(key, content);
            }

            // Reverse so the stack pops directories in sorted order
            stack.extend(subdirs.into_iter().rev());
        }

        if let Ok(mut cache) = self.cache.lock() {
            cache.put(root.clone(), snapshot);
        }

        tracing::debug!(files = result.len(), project = %root.display(), "Scanned project files");
        result
    }
}
