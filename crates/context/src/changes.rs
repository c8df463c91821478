use std::collections::BTreeSet;
use std::path::Path;
use std::time::{Duration, SystemTime};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::files::{walk_files, WalkOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanMode {
    Diff,
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Detection {
    Git,
    Mtime,
    Full,
}

impl std::fmt::Display for Detection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Detection::Git => write!(f, "git"),
            Detection::Mtime => write!(f, "mtime"),
            Detection::Full => write!(f, "full"),
        }
    }
}

/// The seed of the resolver's breadth-first walk. `files` are sorted
/// repo-relative paths so a run is reproducible for a given tree state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeSet {
    pub mode: ScanMode,
    pub files: Vec<String>,
    pub detection: Detection,
}

pub fn is_git_repo(root: &Path) -> bool {
    root.join(".git").is_dir()
}

/// Detect the changed-file seed set. `full` walks everything; `diff` prefers
/// Git (working tree + untracked + staged vs HEAD via porcelain status) and
/// falls back to an mtime window when Git is absent or fails.
pub async fn detect_changes(
    root: &Path,
    mode: ScanMode,
    opts: &WalkOptions,
    mtime_window: Duration,
) -> Result<ChangeSet> {
    if mode == ScanMode::Full {
        return Ok(ChangeSet {
            mode,
            files: walk_files(root, opts),
            detection: Detection::Full,
        });
    }

    if is_git_repo(root) {
        match git_changed_files(root, opts).await {
            Ok(files) => {
                return Ok(ChangeSet {
                    mode,
                    files,
                    detection: Detection::Git,
                })
            }
            Err(e) => {
                tracing::warn!(error = %e, "git change detection failed, falling back to mtime");
            }
        }
    }

    Ok(ChangeSet {
        mode,
        files: mtime_changed_files(root, opts, mtime_window),
        detection: Detection::Mtime,
    })
}

/// `git status --porcelain` covers working-tree modifications, untracked
/// files and the index in one pass.
async fn git_changed_files(root: &Path, opts: &WalkOptions) -> Result<Vec<String>> {
    let output = tokio::process::Command::new("git")
        .arg("-C")
        .arg(root)
        .args(["status", "--porcelain", "--untracked-files=all"])
        .output()
        .await?;

    if !output.status.success() {
        anyhow::bail!(
            "git status exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut files = BTreeSet::new();

    for line in stdout.lines() {
        if line.len() < 4 {
            continue;
        }
        let status = &line[..2];
        if status == "!!" {
            continue;
        }
        let mut path = line[3..].trim().to_string();
        // Renames are reported as "old -> new"; the new path is the live one.
        if let Some((_, new_path)) = path.split_once(" -> ") {
            path = new_path.to_string();
        }
        let path = path.trim_matches('"').replace('\\', "/");
        if opts.matches_extension(&path) && !opts.is_ignored(&path) {
            files.insert(path);
        }
    }

    Ok(files.into_iter().collect())
}

fn mtime_changed_files(root: &Path, opts: &WalkOptions, window: Duration) -> Vec<String> {
    let now = SystemTime::now();
    walk_files(root, opts)
        .into_iter()
        .filter(|rel| {
            root.join(rel)
                .metadata()
                .and_then(|m| m.modified())
                .map(|modified| {
                    now.duration_since(modified).unwrap_or(Duration::ZERO) <= window
                })
                .unwrap_or(false)
        })
        .collect()
}
