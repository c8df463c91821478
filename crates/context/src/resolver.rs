use std::collections::{BTreeMap, HashSet, VecDeque};
use std::path::Path;

use serde::Serialize;

use crate::files::JS_TS_EXTS;
use crate::imports::extract_imports;
use crate::tsconfig::{alias_candidates, workspace_candidates, ResolverCaches};

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    pub depth: usize,
    pub max_files: usize,
    pub max_file_bytes: u64,
    pub enable_tsconfig_paths: bool,
    pub enable_workspaces: bool,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            depth: 2,
            max_files: 200,
            max_file_bytes: 512 * 1024,
            enable_tsconfig_paths: true,
            enable_workspaces: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    External,
    Missing,
    TooLarge,
    InvalidSpec,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::External => write!(f, "external"),
            SkipReason::Missing => write!(f, "missing"),
            SkipReason::TooLarge => write!(f, "too_large"),
            SkipReason::InvalidSpec => write!(f, "invalid_spec"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedImport {
    pub spec: String,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResolutionResult {
    /// Dependency closure in BFS discovery order (seeds excluded).
    pub resolved_files: Vec<String>,
    pub skipped_imports: Vec<SkippedImport>,
    pub diagnostics: BTreeMap<String, u64>,
    pub edges: Vec<(String, String)>,
}

/// Breadth-first dependency walk from the changed-file seed set, bounded by
/// `(depth, max_files)`. Deterministic: imports are visited in sorted order
/// per file and the closure is reported in discovery order. Never resolves
/// outside the repo root and never descends into external dependencies.
pub fn resolve_dependencies(
    root: &Path,
    seeds: &[String],
    config: &ResolverConfig,
    caches: &mut ResolverCaches,
) -> ResolutionResult {
    let mut diagnostics: BTreeMap<String, u64> = BTreeMap::new();
    for key in [
        "files_seen",
        "files_read",
        "imports_seen",
        "imports_resolved",
        "skipped_external",
        "skipped_missing",
        "skipped_too_large",
        "skipped_invalid_spec",
    ] {
        diagnostics.insert(key.to_string(), 0);
    }
    let bump = |d: &mut BTreeMap<String, u64>, key: &str| {
        *d.entry(key.to_string()).or_insert(0) += 1;
    };

    let mut resolved: Vec<String> = Vec::new();
    let mut skipped: BTreeMap<String, SkipReason> = BTreeMap::new();
    let mut edges: Vec<(String, String)> = Vec::new();

    let seeds: Vec<String> = seeds
        .iter()
        .filter(|s| !s.is_empty())
        .map(|s| s.replace('\\', "/"))
        .collect();
    let mut seen: HashSet<String> = seeds.iter().cloned().collect();
    let mut frontier: VecDeque<(String, usize)> =
        seeds.iter().map(|s| (s.clone(), 0)).collect();

    'walk: while let Some((rel, depth)) = frontier.pop_front() {
        if rel.starts_with("../") || depth >= config.depth {
            continue;
        }

        bump(&mut diagnostics, "files_seen");

        let source = match caches.sources.get(&rel) {
            Some(cached) => cached.clone(),
            None => {
                let loaded = read_source(root, &rel, config.max_file_bytes);
                caches.sources.insert(rel.clone(), loaded.clone());
                loaded
            }
        };

        let Some(source) = source else {
            let path = root.join(&rel);
            let too_large = path
                .metadata()
                .map(|m| m.len() > config.max_file_bytes)
                .unwrap_or(false);
            bump(
                &mut diagnostics,
                if too_large { "skipped_too_large" } else { "skipped_missing" },
            );
            continue;
        };

        bump(&mut diagnostics, "files_read");

        let imports = match caches.imports.get(&rel) {
            Some(cached) => cached.clone(),
            None => {
                let parsed = extract_imports(&rel, &source);
                caches.imports.insert(rel.clone(), parsed.clone());
                parsed
            }
        };

        for spec in imports {
            bump(&mut diagnostics, "imports_seen");

            let outcome = if rel.to_lowercase().ends_with(".py") {
                resolve_python(root, &spec, &rel)
            } else if is_js_ts(&rel) {
                resolve_js_ts(root, &spec, &rel, config, caches)
            } else {
                Err(SkipReason::InvalidSpec)
            };

            match outcome {
                Ok(target) => {
                    bump(&mut diagnostics, "imports_resolved");
                    edges.push((rel.clone(), target.clone()));
                    if seen.insert(target.clone()) {
                        resolved.push(target.clone());
                        frontier.push_back((target, depth + 1));
                        if seen.len() >= config.max_files {
                            tracing::warn!(max_files = config.max_files, "resolver hit max_files cap");
                            break 'walk;
                        }
                    }
                }
                Err(reason) => {
                    skipped.entry(spec).or_insert(reason);
                    let key = match reason {
                        SkipReason::External => "skipped_external",
                        SkipReason::Missing => "skipped_missing",
                        SkipReason::TooLarge => "skipped_too_large",
                        SkipReason::InvalidSpec => "skipped_invalid_spec",
                    };
                    bump(&mut diagnostics, key);
                }
            }
        }
    }

    ResolutionResult {
        resolved_files: resolved,
        skipped_imports: skipped
            .into_iter()
            .map(|(spec, reason)| SkippedImport { spec, reason })
            .collect(),
        diagnostics,
        edges,
    }
}

fn is_js_ts(rel: &str) -> bool {
    let lower = rel.to_lowercase();
    JS_TS_EXTS.iter().any(|ext| lower.ends_with(ext))
}

fn read_source(root: &Path, rel: &str, max_bytes: u64) -> Option<String> {
    let path = root.join(rel);
    let meta = path.metadata().ok()?;
    if !meta.is_file() || meta.len() > max_bytes {
        return None;
    }
    let data = std::fs::read(&path).ok()?;
    Some(String::from_utf8_lossy(&data).into_owned())
}

/// Lexically normalize a joined relative path. `..` components that would
/// climb above the root make the path unusable.
fn normalize_rel(path: &str) -> Option<String> {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop()?;
            }
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// Final containment gate on a candidate: exists, is a file, canonical form
/// stays under the canonical root, and no external dependency dir appears.
fn accept_candidate(root: &Path, candidate: &str) -> Option<String> {
    if candidate
        .split('/')
        .any(|p| p == "node_modules" || p == "site-packages" || p == "__pycache__")
    {
        return None;
    }
    let path = root.join(candidate);
    if !path.is_file() {
        return None;
    }
    let canonical = path.canonicalize().ok()?;
    let canonical_root = root.canonicalize().ok()?;
    if !canonical.starts_with(&canonical_root) {
        return None;
    }
    Some(candidate.to_string())
}

fn resolve_python(root: &Path, spec: &str, base_rel: &str) -> Result<String, SkipReason> {
    let spec = spec.trim();
    if spec.is_empty() {
        return Err(SkipReason::InvalidSpec);
    }

    let dots = spec.len() - spec.trim_start_matches('.').len();
    let module = spec.trim_start_matches('.');

    let candidates: Vec<String> = if dots > 0 {
        let mut base_dir = Path::new(base_rel)
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_default();
        for _ in 0..dots.saturating_sub(1) {
            base_dir = base_dir.parent().map(|p| p.to_path_buf()).unwrap_or_default();
        }
        let base = base_dir.to_string_lossy().replace('\\', "/");
        if module.is_empty() {
            if base.is_empty() {
                vec!["__init__.py".to_string()]
            } else {
                vec![format!("{base}/__init__.py")]
            }
        } else {
            let stem = module.replace('.', "/");
            let joined = if base.is_empty() { stem } else { format!("{base}/{stem}") };
            vec![format!("{joined}.py"), format!("{joined}/__init__.py")]
        }
    } else {
        let stem = module.replace('.', "/");
        vec![format!("{stem}.py"), format!("{stem}/__init__.py")]
    };

    for cand in candidates {
        let Some(normalized) = normalize_rel(&cand) else {
            continue;
        };
        if let Some(found) = accept_candidate(root, &normalized) {
            return Ok(found);
        }
    }

    // Bare modules that never resolve locally are external packages; a
    // relative import that misses is genuinely missing.
    Err(if dots > 0 { SkipReason::Missing } else { SkipReason::External })
}

fn resolve_js_ts(
    root: &Path,
    spec: &str,
    base_rel: &str,
    config: &ResolverConfig,
    caches: &mut ResolverCaches,
) -> Result<String, SkipReason> {
    let spec = spec.trim();
    if spec.is_empty() {
        return Err(SkipReason::InvalidSpec);
    }

    let bases: Vec<String> = if spec.starts_with("./") || spec.starts_with("../") {
        let base_dir = Path::new(base_rel)
            .parent()
            .map(|p| p.to_string_lossy().replace('\\', "/"))
            .unwrap_or_default();
        let joined = if base_dir.is_empty() {
            spec.to_string()
        } else {
            format!("{base_dir}/{spec}")
        };
        match normalize_rel(&joined) {
            Some(n) => vec![n],
            None => return Err(SkipReason::Missing),
        }
    } else if let Some(rooted) = spec.strip_prefix('/') {
        match normalize_rel(rooted) {
            Some(n) => vec![n],
            None => return Err(SkipReason::InvalidSpec),
        }
    } else {
        // Aliases and repo-local workspaces apply to bare specifiers only.
        let mut bases = Vec::new();
        if config.enable_tsconfig_paths {
            let options = caches.tsconfig(root).clone();
            bases.extend(alias_candidates(root, &options, spec));
        }
        if config.enable_workspaces {
            let mapping = caches.workspaces(root).clone();
            bases.extend(workspace_candidates(root, &mapping, spec));
        }
        if bases.is_empty() {
            return Err(SkipReason::External);
        }
        bases
    };

    for base in bases {
        let has_ext = JS_TS_EXTS.iter().any(|ext| base.to_lowercase().ends_with(ext));
        let mut candidates = Vec::new();
        if has_ext {
            candidates.push(base.clone());
        } else {
            for ext in JS_TS_EXTS {
                candidates.push(format!("{base}{ext}"));
            }
            for ext in JS_TS_EXTS {
                candidates.push(format!("{base}/index{ext}"));
            }
        }
        for cand in candidates {
            if let Some(found) = accept_candidate(root, &cand) {
                return Ok(found);
            }
        }
    }

    Err(SkipReason::Missing)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, content).unwrap();
    }

    fn resolve(root: &Path, seeds: &[&str]) -> ResolutionResult {
        let mut caches = ResolverCaches::default();
        resolve_dependencies(
            root,
            &seeds.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
            &ResolverConfig::default(),
            &mut caches,
        )
    }

    #[test]
    fn python_relative_imports_rebase_on_package_path() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "pkg/__init__.py", "");
        write(tmp.path(), "pkg/app.py", "from .util import helper\n");
        write(tmp.path(), "pkg/util.py", "import os\n");

        let result = resolve(tmp.path(), &["pkg/app.py"]);
        assert_eq!(result.resolved_files, vec!["pkg/util.py"]);
        // `os` is a bare module with no local counterpart
        assert!(result
            .skipped_imports
            .iter()
            .any(|s| s.spec == "os" && s.reason == SkipReason::External));
    }

    #[test]
    fn python_dotted_module_maps_to_file_or_package() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "main.py", "import lib.engine\n");
        write(tmp.path(), "lib/engine/__init__.py", "");

        let result = resolve(tmp.path(), &["main.py"]);
        assert_eq!(result.resolved_files, vec!["lib/engine/__init__.py"]);
    }

    #[test]
    fn js_relative_and_index_resolution() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "src/app.ts", "import {a} from './util';\nimport {b} from '../shared';\n");
        write(tmp.path(), "src/util.ts", "export const a = 1;\n");
        write(tmp.path(), "shared/index.ts", "export const b = 2;\n");

        let result = resolve(tmp.path(), &["src/app.ts"]);
        assert_eq!(result.resolved_files, vec!["src/util.ts", "shared/index.ts"]);
    }

    #[test]
    fn tsconfig_alias_resolves_and_node_modules_never_appears() {
        let tmp = TempDir::new().unwrap();
        write(
            tmp.path(),
            "tsconfig.json",
            r#"{"compilerOptions": {"paths": {"@/*": ["src/*"]}}}"#,
        );
        write(tmp.path(), "entry.ts", "import {f} from '@/foo';\nimport react from 'react';\n");
        write(tmp.path(), "src/foo.ts", "export const f = 1;\n");
        write(tmp.path(), "node_modules/react/index.js", "module.exports = {};\n");

        let result = resolve(tmp.path(), &["entry.ts"]);
        assert_eq!(result.resolved_files, vec!["src/foo.ts"]);
        assert!(result
            .resolved_files
            .iter()
            .all(|f| !f.contains("node_modules")));
        assert!(result
            .skipped_imports
            .iter()
            .any(|s| s.spec == "react" && s.reason == SkipReason::External));
    }

    #[test]
    fn cycles_terminate() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "a.py", "import b\n");
        write(tmp.path(), "b.py", "import a\n");

        let mut caches = ResolverCaches::default();
        let config = ResolverConfig {
            depth: 10,
            ..ResolverConfig::default()
        };
        let result = resolve_dependencies(
            tmp.path(),
            &["a.py".to_string()],
            &config,
            &mut caches,
        );
        assert_eq!(result.resolved_files, vec!["b.py"]);
    }

    #[test]
    fn depth_and_max_files_bound_the_walk() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "a.py", "import b\n");
        write(tmp.path(), "b.py", "import c\n");
        write(tmp.path(), "c.py", "import d\n");
        write(tmp.path(), "d.py", "");

        let mut caches = ResolverCaches::default();
        let config = ResolverConfig {
            depth: 2,
            ..ResolverConfig::default()
        };
        let result = resolve_dependencies(
            tmp.path(),
            &["a.py".to_string()],
            &config,
            &mut caches,
        );
        // depth 2: a (0) -> b (1) -> c (2, enqueued but not expanded)
        assert_eq!(result.resolved_files, vec!["b.py", "c.py"]);
    }

    #[test]
    fn escaping_relative_specifier_is_skipped() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "app.ts", "import {x} from '../../outside';\n");

        let result = resolve(tmp.path(), &["app.ts"]);
        assert!(result.resolved_files.is_empty());
        assert!(result
            .skipped_imports
            .iter()
            .any(|s| s.reason == SkipReason::Missing));
    }
}
