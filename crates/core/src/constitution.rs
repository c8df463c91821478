use std::path::{Path, PathBuf};

/// Constitution file names, in search order. The last entry is the legacy
/// name older projects still carry.
const CONSTITUTION_NAMES: &[&str] = &[
    ".tribunal/constitution.md",
    "constitution.txt",
    "PROGRAM_CONSTITUTION.md",
];

/// Locate and read the repo's constitution, if any. The spec passed on the
/// command line takes precedence; the constitution supplements it (and may
/// carry embedded scanner rules).
pub fn find_constitution(root: &Path) -> Option<(PathBuf, String)> {
    for name in CONSTITUTION_NAMES {
        let path = root.join(name);
        if path.is_file() {
            match std::fs::read_to_string(&path) {
                Ok(text) => {
                    tracing::info!(path = %path.display(), "loaded constitution");
                    return Some((path, text));
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "constitution unreadable");
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn search_order_prefers_tribunal_dir() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join(".tribunal")).unwrap();
        std::fs::write(tmp.path().join(".tribunal/constitution.md"), "primary").unwrap();
        std::fs::write(tmp.path().join("constitution.txt"), "secondary").unwrap();

        let (_, text) = find_constitution(tmp.path()).unwrap();
        assert_eq!(text, "primary");
    }

    #[test]
    fn legacy_name_is_honored() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("PROGRAM_CONSTITUTION.md"), "legacy").unwrap();
        let (_, text) = find_constitution(tmp.path()).unwrap();
        assert_eq!(text, "legacy");
    }

    #[test]
    fn absent_constitution_is_none() {
        let tmp = TempDir::new().unwrap();
        assert!(find_constitution(tmp.path()).is_none());
    }
}
