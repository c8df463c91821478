use std::path::{Path, PathBuf};

/// Bound on percent-decode passes; nested encodings beyond this are treated
/// as hostile.
const MAX_DECODE_ITERATIONS: usize = 3;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PathValidationError {
    #[error("path is empty")]
    Empty,

    #[error("path still percent-encoded after {MAX_DECODE_ITERATIONS} decode passes")]
    NestedEncoding,

    #[error("UNC or device path prefix rejected")]
    DevicePath,

    #[error("parent traversal component rejected")]
    Traversal,

    #[error("path escapes the configured root")]
    OutsideRoot,

    #[error("path could not be resolved: {0}")]
    Unresolvable(String),
}

/// Validates any path that crosses a trust boundary: CLI args, watcher
/// events, resolver outputs. Decode first, then reject, then resolve, then
/// contain.
#[derive(Debug, Default)]
pub struct PathValidator;

impl PathValidator {
    /// Validate `candidate` (absolute or root-relative) and return its
    /// canonical absolute form, guaranteed to live under `root`.
    pub fn validate(&self, candidate: &str, root: &Path) -> Result<PathBuf, PathValidationError> {
        if candidate.trim().is_empty() {
            return Err(PathValidationError::Empty);
        }

        let decoded = decode_bounded(candidate)?;

        if decoded.starts_with("\\\\") || decoded.starts_with("//?/") || decoded.starts_with("\\\\.\\") {
            return Err(PathValidationError::DevicePath);
        }

        let normalized = decoded.replace('\\', "/");
        if normalized.split('/').any(|part| part == "..") {
            return Err(PathValidationError::Traversal);
        }

        let joined = if Path::new(&normalized).is_absolute() {
            PathBuf::from(&normalized)
        } else {
            root.join(&normalized)
        };

        let canonical_root = root
            .canonicalize()
            .map_err(|e| PathValidationError::Unresolvable(e.to_string()))?;

        // Canonicalize resolves symlinks, which is exactly the escape we
        // must catch. For not-yet-existing paths, canonicalize the nearest
        // existing ancestor and re-append the remainder.
        let canonical = canonicalize_lenient(&joined)
            .map_err(|e| PathValidationError::Unresolvable(e.to_string()))?;

        if !canonical.starts_with(&canonical_root) {
            return Err(PathValidationError::OutsideRoot);
        }

        Ok(canonical)
    }

    /// Convenience check used where only a verdict is needed.
    pub fn is_safe(&self, candidate: &str, root: &Path) -> bool {
        self.validate(candidate, root).is_ok()
    }
}

fn decode_bounded(input: &str) -> Result<String, PathValidationError> {
    let mut current = input.to_string();
    for _ in 0..MAX_DECODE_ITERATIONS {
        let decoded = urlencoding::decode(&current)
            .map(|c| c.into_owned())
            .unwrap_or_else(|_| current.clone());
        if decoded == current {
            return Ok(current);
        }
        current = decoded;
    }
    if current.contains('%') && urlencoding::decode(&current).map(|c| c != current).unwrap_or(false)
    {
        return Err(PathValidationError::NestedEncoding);
    }
    Ok(current)
}

fn canonicalize_lenient(path: &Path) -> std::io::Result<PathBuf> {
    if path.exists() {
        return path.canonicalize();
    }
    let mut existing = path.to_path_buf();
    let mut tail = Vec::new();
    while !existing.exists() {
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                tail.push(name.to_os_string());
                existing = parent.to_path_buf();
            }
            _ => return path.canonicalize(),
        }
    }
    let mut out = existing.canonicalize()?;
    for part in tail.iter().rev() {
        out.push(part);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn accepts_plain_relative_paths() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("a.py"), "x").unwrap();
        let v = PathValidator;
        let p = v.validate("a.py", tmp.path()).unwrap();
        assert!(p.ends_with("a.py"));
    }

    #[test]
    fn rejects_traversal_even_when_encoded() {
        let tmp = TempDir::new().unwrap();
        let v = PathValidator;
        assert_eq!(
            v.validate("../etc/passwd", tmp.path()).unwrap_err(),
            PathValidationError::Traversal
        );
        // %2e%2e%2f = ../
        assert_eq!(
            v.validate("%2e%2e%2fetc/passwd", tmp.path()).unwrap_err(),
            PathValidationError::Traversal
        );
        // double-encoded
        assert_eq!(
            v.validate("%252e%252e%252fetc", tmp.path()).unwrap_err(),
            PathValidationError::Traversal
        );
    }

    #[test]
    fn rejects_unc_prefixes() {
        let tmp = TempDir::new().unwrap();
        let v = PathValidator;
        assert_eq!(
            v.validate("\\\\server\\share", tmp.path()).unwrap_err(),
            PathValidationError::DevicePath
        );
    }

    #[test]
    fn rejects_absolute_paths_outside_root() {
        let tmp = TempDir::new().unwrap();
        let v = PathValidator;
        assert_eq!(
            v.validate("/etc/passwd", tmp.path()).unwrap_err(),
            PathValidationError::OutsideRoot
        );
    }

    #[cfg(unix)]
    #[test]
    fn rejects_symlink_escape() {
        let tmp = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        std::fs::write(outside.path().join("secret.txt"), "s").unwrap();
        std::os::unix::fs::symlink(outside.path(), tmp.path().join("link")).unwrap();

        let v = PathValidator;
        assert_eq!(
            v.validate("link/secret.txt", tmp.path()).unwrap_err(),
            PathValidationError::OutsideRoot
        );
    }
}
