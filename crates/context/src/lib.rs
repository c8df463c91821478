pub mod changes;
pub mod files;
pub mod imports;
pub mod packer;
pub mod pathsafe;
pub mod resolver;
pub mod risk;
pub mod tsconfig;
pub mod windowing;

pub use changes::{detect_changes, ChangeSet, Detection, ScanMode};
pub use files::{detect_language, walk_files, FileNode, Language, WalkOptions};
pub use packer::{estimate_tokens, CoverageKind, PackRequest, PackSection, ResolvedContext};
pub use pathsafe::{PathValidationError, PathValidator};
pub use resolver::{ResolutionResult, ResolverConfig, SkipReason, SkippedImport};
pub use risk::RiskIndex;
pub use tsconfig::ResolverCaches;

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct ContextOptions {
    pub token_budget: usize,
    pub max_file_bytes: u64,
    pub resolver_depth: usize,
    pub resolver_max_files: usize,
    pub mtime_window_seconds: u64,
    pub windowing_enabled: bool,
    pub walk: WalkOptions,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            token_budget: 8000,
            max_file_bytes: 512 * 1024,
            resolver_depth: 2,
            resolver_max_files: 200,
            mtime_window_seconds: 300,
            windowing_enabled: false,
            walk: WalkOptions::default(),
        }
    }
}

/// Everything downstream stages need from one context build.
#[derive(Debug, Clone)]
pub struct BuiltContext {
    pub change_set: ChangeSet,
    pub language: Language,
    pub resolution: ResolutionResult,
    pub context: ResolvedContext,
}

/// Assemble the judge context for a change set: detect changes, resolve the
/// repo-local dependency closure, optionally window changed files down to
/// their hunks, then pack within the token budget. Deterministic given the
/// tree state and options.
pub async fn build_context(
    root: &Path,
    mode: ScanMode,
    constitution: &str,
    invariant_keywords: &[String],
    opts: &ContextOptions,
) -> Result<BuiltContext> {
    let root = root
        .canonicalize()
        .with_context(|| format!("repository root not found: {}", root.display()))?;

    let mut change_set = detect_changes(
        &root,
        mode,
        &opts.walk,
        Duration::from_secs(opts.mtime_window_seconds),
    )
    .await?;

    // Change detection output crosses a trust boundary (git reports
    // arbitrary strings); anything that decodes or resolves outside the
    // root is dropped here, before any read.
    let validator = PathValidator;
    change_set.files.retain(|rel| {
        let safe = validator.is_safe(rel, &root);
        if !safe {
            tracing::warn!(path = %rel, "dropping unsafe changed path");
        }
        safe
    });

    tracing::info!(
        detection = %change_set.detection,
        changed = change_set.files.len(),
        "change detection complete"
    );

    let language = if change_set.files.is_empty() {
        detect_language(&walk_files(&root, &opts.walk))
    } else {
        detect_language(&change_set.files)
    };

    let mut caches = ResolverCaches::default();
    let resolver_config = ResolverConfig {
        depth: opts.resolver_depth,
        max_files: opts.resolver_max_files,
        max_file_bytes: opts.max_file_bytes,
        enable_tsconfig_paths: true,
        enable_workspaces: true,
    };
    let resolution =
        resolver::resolve_dependencies(&root, &change_set.files, &resolver_config, &mut caches);

    // Windowing reduces changed files to their expanded hunks. Git is the
    // only detection with line-accurate hunks; mtime/full changes go whole.
    let mut window_texts = std::collections::BTreeMap::new();
    if opts.windowing_enabled && change_set.detection == Detection::Git {
        if let Ok(hunks) = windowing::git_hunks(&root).await {
            let risk = RiskIndex::load(&root).unwrap_or_default();
            let windows = windowing::window_changed_files(
                &root,
                &hunks,
                language,
                invariant_keywords,
                &risk.scores,
                opts.max_file_bytes,
            );
            let pruned =
                windowing::prune_windows(windows, opts.token_budget / 2, 1.0);
            for rel in &change_set.files {
                if let Some(text) = windowing::merge_file_windows(rel, &pruned) {
                    window_texts.insert(rel.clone(), text);
                }
            }
        }
    }

    let changed_sections: Vec<PackSection> = change_set
        .files
        .iter()
        .filter_map(|rel| {
            if let Some(text) = window_texts.get(rel) {
                return Some(PackSection {
                    rel_path: rel.clone(),
                    content: text.clone(),
                    windowed: true,
                });
            }
            files::read_capped(&root, rel, opts.max_file_bytes).map(|content| PackSection {
                rel_path: rel.clone(),
                content,
                windowed: false,
            })
        })
        .collect();

    let import_sections: Vec<PackSection> = resolution
        .resolved_files
        .iter()
        .filter_map(|rel| {
            files::read_capped(&root, rel, opts.max_file_bytes).map(|content| PackSection {
                rel_path: rel.clone(),
                content,
                windowed: false,
            })
        })
        .collect();

    let mut context = packer::pack(PackRequest {
        changed: changed_sections,
        imports: import_sections,
        constitution: constitution.to_string(),
        token_budget: opts.token_budget,
    });
    context.skipped_imports = resolution.skipped_imports.clone();

    if context.partial {
        tracing::warn!(
            token_count = context.token_count,
            truncated = context.truncated_files.len(),
            "context is partial; judges will see reduced code"
        );
    }

    Ok(BuiltContext {
        change_set,
        language,
        resolution,
        context,
    })
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

    #[tokio::test]
    async fn full_build_packs_changed_then_imports_then_constitution() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "app.py", "from lib import util\nutil.run()\n");
        write(tmp.path(), "lib/__init__.py", "");
        write(tmp.path(), "lib/util.py", "def run():\n    pass\n");

        let built = build_context(
            tmp.path(),
            ScanMode::Full,
            "The project must not eval untrusted input.",
            &[],
            &ContextOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(built.change_set.detection, Detection::Full);
        assert_eq!(built.language, Language::Python);
        assert!(built.context.constitution_included);
        assert!(!built.context.partial);
        assert!(built.context.text.contains("## Changed: app.py"));
        assert!(built.context.text.contains("## Constitution"));
        // files already seeds are not re-listed as imports
        assert!(built
            .resolution
            .resolved_files
            .iter()
            .all(|f| f != "app.py"));
    }

    #[tokio::test]
    async fn every_included_path_stays_under_root() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "a.py", "import b\n");
        write(tmp.path(), "b.py", "x = 1\n");

        let built = build_context(
            tmp.path(),
            ScanMode::Full,
            "",
            &[],
            &ContextOptions::default(),
        )
        .await
        .unwrap();

        let validator = PathValidator;
        for rel in built
            .context
            .included_changed
            .iter()
            .chain(built.context.included_imports.iter())
        {
            assert!(validator.is_safe(rel, tmp.path()), "unsafe path: {rel}");
        }
    }

    #[tokio::test]
    async fn missing_root_is_an_error() {
        let err = build_context(
            Path::new("/definitely/not/a/real/root"),
            ScanMode::Full,
            "",
            &[],
            &ContextOptions::default(),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("repository root"));
    }
}
