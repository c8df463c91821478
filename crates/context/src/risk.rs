use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::files::read_capped;
use crate::windowing::security_score;

pub const RISK_INDEX_DIR: &str = ".verdex";
pub const RISK_INDEX_FILE: &str = "risk_index.json";

/// Deterministic per-file risk scores, persisted by `verdex index` and
/// consumed by the windowing stage as an optional relevance boost. This is
/// the repo-local stand-in for the external semantic-search collaborator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RiskIndex {
    pub generated_at: String,
    pub files_scanned: usize,
    pub scores: BTreeMap<String, f64>,
}

impl RiskIndex {
    /// Security-pattern density per KiB, so large files do not dominate
    /// purely by volume.
    pub fn build(root: &Path, files: &[String], max_file_bytes: u64) -> Self {
        let mut scores = BTreeMap::new();
        for rel in files {
            let Some(content) = read_capped(root, rel, max_file_bytes) else {
                continue;
            };
            let hits = security_score(&content);
            if hits > 0.0 {
                let kib = (content.len() as f64 / 1024.0).max(1.0);
                scores.insert(rel.clone(), hits / kib);
            }
        }
        Self {
            generated_at: chrono::Utc::now().to_rfc3339(),
            files_scanned: files.len(),
            scores,
        }
    }

    pub fn index_path(root: &Path) -> std::path::PathBuf {
        root.join(RISK_INDEX_DIR).join(RISK_INDEX_FILE)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let dir = root.join(RISK_INDEX_DIR);
        std::fs::create_dir_all(&dir).context("Failed to create index directory")?;
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(Self::index_path(root), json).context("Failed to write risk index")?;
        Ok(())
    }

    /// Missing or unreadable index is simply absent; risk boosting is
    /// optional everywhere it is consumed.
    pub fn load(root: &Path) -> Option<Self> {
        let raw = std::fs::read_to_string(Self::index_path(root)).ok()?;
        serde_json::from_str(&raw).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn scores_only_files_with_security_patterns() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("hot.py"), "eval(user_input)\npassword = 'x'\n").unwrap();
        std::fs::write(tmp.path().join("cold.py"), "x = 1\n").unwrap();

        let index = RiskIndex::build(
            tmp.path(),
            &["hot.py".to_string(), "cold.py".to_string()],
            512 * 1024,
        );
        assert!(index.scores.contains_key("hot.py"));
        assert!(!index.scores.contains_key("cold.py"));
        assert_eq!(index.files_scanned, 2);
    }

    #[test]
    fn round_trips_through_disk() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("a.py"), "subprocess.run(cmd, shell=True)\n").unwrap();

        let index = RiskIndex::build(tmp.path(), &["a.py".to_string()], 512 * 1024);
        index.save(tmp.path()).unwrap();

        let loaded = RiskIndex::load(tmp.path()).unwrap();
        assert_eq!(loaded.scores.len(), index.scores.len());
        assert!(RiskIndex::load(&tmp.path().join("nope")).is_none());
    }
}
