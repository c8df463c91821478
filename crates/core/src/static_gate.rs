use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::Serialize;

use verdex_context::Language;

/// Per-tool subprocess budget. The gate is not cancellable; this is the
/// only bound on its runtime.
const TOOL_TIMEOUT: Duration = Duration::from_secs(60);

const CRITICAL_PYLINT_TYPES: &[&str] = &["error", "fatal"];
const CRITICAL_BANDIT_SEVERITIES: &[&str] = &["HIGH"];

#[derive(Debug, Clone, Serialize)]
pub struct StaticIssue {
    pub tool: String,
    pub file: String,
    pub line: u64,
    pub kind: String,
    pub message: String,
    pub critical: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolRun {
    pub tool: String,
    pub file: String,
    pub issues: Vec<StaticIssue>,
    pub severity_counts: BTreeMap<String, usize>,
    /// Tool missing or crashed; not a finding, recorded for the report.
    pub skipped: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StaticGateOutcome {
    pub runs: Vec<ToolRun>,
    pub total_issues: usize,
    pub critical_issues: Vec<StaticIssue>,
    pub aborted: bool,
}

/// Deterministic pre-tribunal gate: language-native linters over non-test
/// changed files, aborting the pipeline on fatal classes before any LLM
/// spend. Syntax errors make LLM judgment meaningless; HIGH security
/// findings deserve a human, not a vote.
pub async fn run_static_gate(
    root: &Path,
    files: &[String],
    language: Language,
    exclude_test_patterns: &[String],
    enabled: bool,
) -> StaticGateOutcome {
    let mut outcome = StaticGateOutcome::default();
    if !enabled {
        return outcome;
    }

    let candidates: Vec<&String> = files
        .iter()
        .filter(|f| !is_test_file(f, exclude_test_patterns))
        .filter(|f| Language::from_path(f) == language)
        .collect();

    for file in candidates {
        match language {
            Language::Python => {
                outcome.runs.push(run_pylint(root, file).await);
                outcome.runs.push(run_bandit(root, file).await);
            }
            Language::Javascript => {
                outcome.runs.push(run_eslint(root, file).await);
            }
            Language::Unknown => {}
        }
    }

    for run in &outcome.runs {
        outcome.total_issues += run.issues.len();
        outcome
            .critical_issues
            .extend(run.issues.iter().filter(|i| i.critical).cloned());
    }
    outcome.aborted = !outcome.critical_issues.is_empty();

    if outcome.aborted {
        tracing::error!(
            critical = outcome.critical_issues.len(),
            "static gate abort: critical findings before tribunal"
        );
    } else {
        tracing::info!(
            issues = outcome.total_issues,
            "static gate clean of critical findings"
        );
    }

    outcome
}

/// Test files are exempt from the gate; globs match the full relative path
/// or any single path segment.
pub fn is_test_file(rel_path: &str, patterns: &[String]) -> bool {
    patterns.iter().any(|raw| {
        let Ok(pattern) = glob::Pattern::new(raw) else {
            return false;
        };
        if pattern.matches(rel_path) {
            return true;
        }
        rel_path.split('/').any(|part| pattern.matches(part))
    })
}

async fn run_tool(root: &Path, program: &str, args: &[&str]) -> Result<std::process::Output, String> {
    let command = tokio::process::Command::new(program)
        .args(args)
        .current_dir(root)
        .output();

    match tokio::time::timeout(TOOL_TIMEOUT, command).await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(e)) => Err(format!("{program} not runnable: {e}")),
        Err(_) => Err(format!("{program} timed out after {}s", TOOL_TIMEOUT.as_secs())),
    }
}

async fn run_pylint(root: &Path, file: &str) -> ToolRun {
    let mut run = ToolRun {
        tool: "pylint".into(),
        file: file.to_string(),
        issues: Vec::new(),
        severity_counts: BTreeMap::new(),
        skipped: None,
    };

    let output = match run_tool(root, "pylint", &["--output-format=json", file]).await {
        Ok(o) => o,
        Err(reason) => {
            tracing::warn!(tool = "pylint", %reason, "static tool skipped");
            run.skipped = Some(reason);
            return run;
        }
    };

    // pylint exits non-zero whenever it has findings; the JSON body is the
    // signal either way.
    let stdout = String::from_utf8_lossy(&output.stdout);
    if let Ok(items) = serde_json::from_str::<Vec<serde_json::Value>>(&stdout) {
        for item in items {
            let kind = item["type"].as_str().unwrap_or("unknown").to_string();
            *run.severity_counts.entry(kind.clone()).or_insert(0) += 1;
            run.issues.push(StaticIssue {
                tool: "pylint".into(),
                file: file.to_string(),
                line: item["line"].as_u64().unwrap_or(0),
                critical: CRITICAL_PYLINT_TYPES.contains(&kind.as_str()),
                message: item["message"].as_str().unwrap_or("").to_string(),
                kind,
            });
        }
    }

    run
}

async fn run_bandit(root: &Path, file: &str) -> ToolRun {
    let mut run = ToolRun {
        tool: "bandit".into(),
        file: file.to_string(),
        issues: Vec::new(),
        severity_counts: BTreeMap::new(),
        skipped: None,
    };

    let output = match run_tool(root, "bandit", &["-f", "json", "-q", file]).await {
        Ok(o) => o,
        Err(reason) => {
            tracing::warn!(tool = "bandit", %reason, "static tool skipped");
            run.skipped = Some(reason);
            return run;
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    if let Ok(report) = serde_json::from_str::<serde_json::Value>(&stdout) {
        if let Some(results) = report["results"].as_array() {
            for item in results {
                let severity = item["issue_severity"].as_str().unwrap_or("LOW").to_string();
                *run.severity_counts.entry(severity.clone()).or_insert(0) += 1;
                run.issues.push(StaticIssue {
                    tool: "bandit".into(),
                    file: file.to_string(),
                    line: item["line_number"].as_u64().unwrap_or(0),
                    critical: CRITICAL_BANDIT_SEVERITIES.contains(&severity.as_str()),
                    message: item["issue_text"].as_str().unwrap_or("").to_string(),
                    kind: severity,
                });
            }
        }
    }

    run
}

async fn run_eslint(root: &Path, file: &str) -> ToolRun {
    let mut run = ToolRun {
        tool: "eslint".into(),
        file: file.to_string(),
        issues: Vec::new(),
        severity_counts: BTreeMap::new(),
        skipped: None,
    };

    let output = match run_tool(root, "eslint", &["-f", "json", file]).await {
        Ok(o) => o,
        Err(reason) => {
            tracing::warn!(tool = "eslint", %reason, "static tool skipped");
            run.skipped = Some(reason);
            return run;
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    if let Ok(reports) = serde_json::from_str::<Vec<serde_json::Value>>(&stdout) {
        for report in reports {
            if let Some(messages) = report["messages"].as_array() {
                for item in messages {
                    let severity = item["severity"].as_u64().unwrap_or(1);
                    let kind = if severity >= 2 { "error" } else { "warning" };
                    *run.severity_counts.entry(kind.to_string()).or_insert(0) += 1;
                    run.issues.push(StaticIssue {
                        tool: "eslint".into(),
                        file: file.to_string(),
                        line: item["line"].as_u64().unwrap_or(0),
                        critical: severity >= 2,
                        message: item["message"].as_str().unwrap_or("").to_string(),
                        kind: kind.to_string(),
                    });
                }
            }
        }
    }

    run
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_patterns() -> Vec<String> {
        vec![
            "test_*".into(),
            "*_test.*".into(),
            "tests/**".into(),
            "**/*.spec.*".into(),
        ]
    }

    #[test]
    fn test_globs_exclude_test_files_only() {
        let patterns = default_patterns();
        assert!(is_test_file("test_app.py", &patterns));
        assert!(is_test_file("src/test_util.py", &patterns));
        assert!(is_test_file("app_test.py", &patterns));
        assert!(is_test_file("tests/helpers.py", &patterns));
        assert!(is_test_file("src/widget.spec.ts", &patterns));
        assert!(!is_test_file("src/app.py", &patterns));
        assert!(!is_test_file("contested.py", &patterns));
    }

    #[tokio::test]
    async fn disabled_gate_is_a_noop() {
        let outcome = run_static_gate(
            Path::new("."),
            &["app.py".to_string()],
            Language::Python,
            &default_patterns(),
            false,
        )
        .await;
        assert!(!outcome.aborted);
        assert!(outcome.runs.is_empty());
    }

    #[tokio::test]
    async fn missing_tools_skip_instead_of_failing() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::write(tmp.path().join("app.py"), "print('ok')\n").unwrap();

        let outcome = run_static_gate(
            tmp.path(),
            &["app.py".to_string()],
            Language::Python,
            &default_patterns(),
            true,
        )
        .await;

        // Regardless of whether pylint/bandit exist in the environment, a
        // clean one-liner must not trip the gate.
        assert!(!outcome.aborted);
        for run in &outcome.runs {
            assert!(run.issues.iter().all(|i| !i.critical) || run.skipped.is_some());
        }
    }

    #[test]
    fn abort_condition_is_driven_by_critical_issues() {
        let mut outcome = StaticGateOutcome::default();
        outcome.runs.push(ToolRun {
            tool: "pylint".into(),
            file: "app.py".into(),
            issues: vec![StaticIssue {
                tool: "pylint".into(),
                file: "app.py".into(),
                line: 3,
                kind: "error".into(),
                message: "invalid syntax".into(),
                critical: true,
            }],
            severity_counts: BTreeMap::new(),
            skipped: None,
        });
        for run in &outcome.runs {
            outcome.total_issues += run.issues.len();
            outcome
                .critical_issues
                .extend(run.issues.iter().filter(|i| i.critical).cloned());
        }
        outcome.aborted = !outcome.critical_issues.is_empty();
        assert!(outcome.aborted);
        assert_eq!(outcome.total_issues, 1);
    }
}
