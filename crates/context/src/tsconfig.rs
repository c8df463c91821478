use std::collections::HashMap;
use std::path::Path;

use crate::files::{relative_to, JS_TS_EXTS};

/// compilerOptions subset the resolver honors: baseUrl plus paths with at
/// most one `*` per pattern.
#[derive(Debug, Clone, Default)]
pub struct TsconfigOptions {
    pub base_url: Option<String>,
    pub paths: Vec<(String, Vec<String>)>,
}

/// Per-run caches for the resolver. Read-mostly after warm-up; owned by one
/// run, passed explicitly rather than living in a global registry.
#[derive(Debug, Default)]
pub struct ResolverCaches {
    tsconfig: Option<TsconfigOptions>,
    workspaces: Option<HashMap<String, String>>,
    pub(crate) sources: HashMap<String, Option<String>>,
    pub(crate) imports: HashMap<String, Vec<String>>,
}

impl ResolverCaches {
    pub fn tsconfig(&mut self, root: &Path) -> &TsconfigOptions {
        if self.tsconfig.is_none() {
            self.tsconfig = Some(load_tsconfig(root));
        }
        self.tsconfig.as_ref().expect("tsconfig cache warmed")
    }

    pub fn workspaces(&mut self, root: &Path) -> &HashMap<String, String> {
        if self.workspaces.is_none() {
            self.workspaces = Some(load_workspace_map(root));
        }
        self.workspaces.as_ref().expect("workspace cache warmed")
    }
}

/// Good-enough JSONC handling for real tsconfig files: strip block and line
/// comments before parsing.
fn strip_jsonc(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    let mut in_string = false;
    let mut escaped = false;

    while let Some(c) = chars.next() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            '/' if chars.peek() == Some(&'/') => {
                for next in chars.by_ref() {
                    if next == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = ' ';
                for next in chars.by_ref() {
                    if prev == '*' && next == '/' {
                        break;
                    }
                    prev = next;
                }
            }
            _ => out.push(c),
        }
    }
    out
}

fn load_tsconfig(root: &Path) -> TsconfigOptions {
    for name in ["tsconfig.json", "jsconfig.json"] {
        let path = root.join(name);
        let Ok(raw) = std::fs::read_to_string(&path) else {
            continue;
        };
        let Ok(data) = serde_json::from_str::<serde_json::Value>(&strip_jsonc(&raw)) else {
            continue;
        };
        let compiler = &data["compilerOptions"];

        let base_url = compiler["baseUrl"].as_str().map(|s| s.to_string());
        let mut paths = Vec::new();
        if let Some(map) = compiler["paths"].as_object() {
            for (pattern, targets) in map {
                let Some(list) = targets.as_array() else {
                    continue;
                };
                let targets: Vec<String> = list
                    .iter()
                    .filter_map(|t| t.as_str().map(|s| s.to_string()))
                    .collect();
                if !targets.is_empty() {
                    paths.push((pattern.clone(), targets));
                }
            }
        }
        return TsconfigOptions { base_url, paths };
    }
    TsconfigOptions::default()
}

/// Candidate repo-relative bases for a bare specifier via tsconfig aliases,
/// deduped in pattern order. Only single-`*` wildcards are supported.
pub fn alias_candidates(root: &Path, options: &TsconfigOptions, spec: &str) -> Vec<String> {
    let mut out = Vec::new();

    let base_dir = match &options.base_url {
        Some(b) => root.join(b),
        None => root.to_path_buf(),
    };

    for (pattern, targets) in &options.paths {
        if pattern.is_empty() {
            continue;
        }
        if pattern.contains('*') {
            if pattern.matches('*').count() != 1 {
                continue;
            }
            let (prefix, suffix) = pattern.split_once('*').expect("single wildcard");
            if !spec.starts_with(prefix) || !spec.ends_with(suffix) {
                continue;
            }
            if spec.len() < prefix.len() + suffix.len() {
                continue;
            }
            let star = &spec[prefix.len()..spec.len() - suffix.len()];
            for target in targets {
                let candidate = if target.contains('*') {
                    target.replacen('*', star, 1)
                } else {
                    target.clone()
                };
                push_contained(&mut out, root, &base_dir.join(candidate));
            }
        } else if spec == pattern {
            for target in targets {
                push_contained(&mut out, root, &base_dir.join(target));
            }
        }
    }

    // Bare specifiers also resolve directly against baseUrl.
    if options.base_url.is_some()
        && !spec.starts_with("./")
        && !spec.starts_with("../")
        && !spec.starts_with('/')
    {
        push_contained(&mut out, root, &base_dir.join(spec));
    }

    dedupe(out)
}

fn push_contained(out: &mut Vec<String>, root: &Path, abs: &Path) {
    // Normalize without requiring existence: the resolver probes extension
    // candidates on top of these bases.
    let cleaned: std::path::PathBuf = abs
        .components()
        .filter(|c| !matches!(c, std::path::Component::CurDir))
        .collect();
    if let Some(rel) = relative_to(&cleaned, root) {
        if !rel.split('/').any(|p| p == "..") {
            out.push(rel);
        }
    }
}

fn load_workspace_map(root: &Path) -> HashMap<String, String> {
    let mut mapping = HashMap::new();

    let Ok(raw) = std::fs::read_to_string(root.join("package.json")) else {
        return mapping;
    };
    let Ok(data) = serde_json::from_str::<serde_json::Value>(&raw) else {
        return mapping;
    };

    let patterns: Vec<String> = match &data["workspaces"] {
        serde_json::Value::Array(list) => list
            .iter()
            .filter_map(|v| v.as_str().map(|s| s.to_string()))
            .collect(),
        serde_json::Value::Object(obj) => obj
            .get("packages")
            .and_then(|p| p.as_array())
            .map(|list| {
                list.iter()
                    .filter_map(|v| v.as_str().map(|s| s.to_string()))
                    .collect()
            })
            .unwrap_or_default(),
        _ => Vec::new(),
    };

    for pattern in patterns.iter().take(50) {
        let full = root.join(pattern);
        let Ok(entries) = glob::glob(&full.to_string_lossy()) else {
            continue;
        };
        for entry in entries.flatten() {
            if !entry.is_dir() {
                continue;
            }
            let Some(rel) = relative_to(&entry, root) else {
                continue;
            };
            if rel.split('/').any(|p| p == "node_modules") {
                continue;
            }
            let Ok(pkg_raw) = std::fs::read_to_string(entry.join("package.json")) else {
                continue;
            };
            let Ok(pkg) = serde_json::from_str::<serde_json::Value>(&pkg_raw) else {
                continue;
            };
            if let Some(name) = pkg["name"].as_str() {
                mapping.entry(name.to_string()).or_insert(rel);
            }
        }
    }

    mapping
}

/// Candidate bases for a bare specifier that names a repo-local workspace
/// package, optionally with a subpath.
pub fn workspace_candidates(
    root: &Path,
    mapping: &HashMap<String, String>,
    spec: &str,
) -> Vec<String> {
    if mapping.is_empty() {
        return Vec::new();
    }

    let (pkg_name, subpath) = if let Some(rest) = spec.strip_prefix('@') {
        let mut parts = rest.splitn(3, '/');
        let scope = parts.next().unwrap_or("");
        let name = parts.next().unwrap_or("");
        let sub = parts.next().unwrap_or("");
        (format!("@{scope}/{name}"), sub.to_string())
    } else {
        match spec.split_once('/') {
            Some((name, sub)) => (name.to_string(), sub.to_string()),
            None => (spec.to_string(), String::new()),
        }
    };

    let Some(pkg_dir) = mapping.get(&pkg_name) else {
        return Vec::new();
    };

    let mut out = Vec::new();

    if subpath.is_empty() {
        // Entry precedence: manifest fields, then src/index.*, then index.*.
        if let Ok(raw) = std::fs::read_to_string(root.join(pkg_dir).join("package.json")) {
            if let Ok(pkg) = serde_json::from_str::<serde_json::Value>(&raw) {
                for field in ["module", "main", "source"] {
                    if let Some(entry) = pkg[field].as_str() {
                        out.push(format!("{pkg_dir}/{}", entry.trim_start_matches("./")));
                    }
                }
            }
        }
        for ext in JS_TS_EXTS {
            out.push(format!("{pkg_dir}/src/index{ext}"));
        }
        for ext in JS_TS_EXTS {
            out.push(format!("{pkg_dir}/index{ext}"));
        }
    } else {
        out.push(format!("{pkg_dir}/{subpath}"));
        out.push(format!("{pkg_dir}/src/{subpath}"));
    }

    dedupe(out)
}

fn dedupe(items: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    items.into_iter().filter(|x| seen.insert(x.clone())).collect()
}
