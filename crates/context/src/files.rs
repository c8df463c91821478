use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    Javascript,
    Unknown,
}

impl Language {
    pub fn from_path(rel_path: &str) -> Self {
        let lower = rel_path.to_lowercase();
        if lower.ends_with(".py") {
            Language::Python
        } else if JS_TS_EXTS.iter().any(|ext| lower.ends_with(ext)) {
            Language::Javascript
        } else {
            Language::Unknown
        }
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Language::Python => write!(f, "python"),
            Language::Javascript => write!(f, "javascript"),
            Language::Unknown => write!(f, "unknown"),
        }
    }
}

pub const JS_TS_EXTS: &[&str] = &[".ts", ".tsx", ".js", ".jsx", ".mjs", ".cjs"];

/// One discovered source file. Paths are repo-relative and forward-slash
/// normalized regardless of platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileNode {
    pub rel_path: String,
    pub sha256: String,
    pub byte_size: u64,
    pub language: Language,
}

#[derive(Debug, Clone)]
pub struct WalkOptions {
    pub allowed_extensions: Vec<String>,
    pub ignore_dirs: Vec<String>,
}

impl Default for WalkOptions {
    fn default() -> Self {
        Self {
            allowed_extensions: vec![
                ".py".into(),
                ".js".into(),
                ".jsx".into(),
                ".ts".into(),
                ".tsx".into(),
                ".mjs".into(),
                ".cjs".into(),
            ],
            ignore_dirs: vec![
                ".git".into(),
                "__pycache__".into(),
                "node_modules".into(),
                ".venv".into(),
                "venv".into(),
                "dist".into(),
                "build".into(),
                "target".into(),
            ],
        }
    }
}

impl WalkOptions {
    pub fn matches_extension(&self, rel_path: &str) -> bool {
        let lower = rel_path.to_lowercase();
        self.allowed_extensions.iter().any(|ext| lower.ends_with(ext.as_str()))
    }

    pub fn is_ignored(&self, rel_path: &str) -> bool {
        rel_path
            .split('/')
            .any(|part| self.ignore_dirs.iter().any(|d| d == part))
    }
}

/// Recursively list allowed source files under `root`, sorted for stable
/// output. Directories on the deny list are never entered.
pub fn walk_files(root: &Path, opts: &WalkOptions) -> Vec<String> {
    let mut out = Vec::new();
    walk_dir(root, root, opts, &mut out);
    out.sort();
    out
}

fn walk_dir(root: &Path, dir: &Path, opts: &WalkOptions, out: &mut Vec<String>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => return,
    };

    for entry in entries.flatten() {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();

        if path.is_dir() {
            if opts.ignore_dirs.iter().any(|d| d == &name) {
                continue;
            }
            walk_dir(root, &path, opts, out);
        } else if let Some(rel) = relative_to(&path, root) {
            if opts.matches_extension(&rel) && !opts.is_ignored(&rel) {
                out.push(rel);
            }
        }
    }
}

pub fn relative_to(path: &Path, root: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let s = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

/// Read a file's text, capped at `max_bytes`. Oversized files are truncated
/// at the cap, never excluded. Returns None for unreadable paths.
pub fn read_capped(root: &Path, rel_path: &str, max_bytes: u64) -> Option<String> {
    let path = root.join(rel_path);
    let mut data = std::fs::read(&path).ok()?;
    if data.len() as u64 > max_bytes {
        data.truncate(max_bytes as usize);
    }
    Some(String::from_utf8_lossy(&data).into_owned())
}

pub fn file_node(root: &Path, rel_path: &str) -> Option<FileNode> {
    let path = root.join(rel_path);
    let data = std::fs::read(&path).ok()?;
    Some(FileNode {
        rel_path: rel_path.to_string(),
        sha256: hex_digest(&data),
        byte_size: data.len() as u64,
        language: Language::from_path(rel_path),
    })
}

pub fn hex_digest(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Majority vote over file extensions; ties and empty trees fall back to
/// Python, matching the verifier's default toolchain.
pub fn detect_language(files: &[String]) -> Language {
    let mut python = 0usize;
    let mut javascript = 0usize;
    for f in files {
        match Language::from_path(f) {
            Language::Python => python += 1,
            Language::Javascript => javascript += 1,
            Language::Unknown => {}
        }
    }
    if javascript > python {
        Language::Javascript
    } else {
        Language::Python
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn walk_skips_denied_dirs_and_foreign_extensions() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), "src/app.py", "print('x')");
        touch(tmp.path(), "src/util.ts", "export const x = 1;");
        touch(tmp.path(), "node_modules/pkg/index.js", "x");
        touch(tmp.path(), "README.md", "# readme");

        let files = walk_files(tmp.path(), &WalkOptions::default());
        assert_eq!(files, vec!["src/app.py", "src/util.ts"]);
    }

    #[test]
    fn read_capped_truncates_at_cap() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), "big.py", &"a".repeat(1000));
        let text = read_capped(tmp.path(), "big.py", 100).unwrap();
        assert_eq!(text.len(), 100);
    }

    #[test]
    fn language_majority_vote() {
        let files = vec!["a.py".to_string(), "b.ts".to_string(), "c.tsx".to_string()];
        assert_eq!(detect_language(&files), Language::Javascript);
        assert_eq!(detect_language(&["a.py".to_string()]), Language::Python);
        assert_eq!(detect_language(&[]), Language::Python);
    }

    #[test]
    fn file_node_hashes_content() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), "a.py", "x = 1\n");
        let node = file_node(tmp.path(), "a.py").unwrap();
        assert_eq!(node.byte_size, 6);
        assert_eq!(node.language, Language::Python);
        assert_eq!(node.sha256.len(), 64);
    }
}
