use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::tribunal::{CriterionResult, FailFastRecord, Telemetry, TribunalVerdict, Verdict, VetoRecord};

/// Temp-file-then-rename in the destination directory, so an external
/// observer never reads a torn artifact.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create {}", dir.display()))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .context("Failed to create temp file for atomic write")?;
    std::io::Write::write_all(&mut tmp, bytes).context("Failed to write temp file")?;
    tmp.persist(path)
        .with_context(|| format!("Failed to persist {}", path.display()))?;
    Ok(())
}

#[derive(Debug)]
pub struct SavedArtifacts {
    pub verdict_path: PathBuf,
    pub report_path: PathBuf,
    pub raw_verdicts_path: PathBuf,
}

/// Write the three run artifacts under `<artifacts_dir>/<run_id>/`.
pub fn save_outputs(verdict: &TribunalVerdict, artifacts_dir: &Path) -> Result<SavedArtifacts> {
    let run_dir = artifacts_dir.join(&verdict.run_id);

    let verdict_path = run_dir.join("verdict.json");
    write_atomic(
        &verdict_path,
        serde_json::to_string_pretty(verdict)?.as_bytes(),
    )?;

    let report_path = run_dir.join("REPORT.md");
    write_atomic(&report_path, render_report(verdict).as_bytes())?;

    let raw_verdicts_path = run_dir.join("tribunal_verdicts.json");
    let raw: Vec<serde_json::Value> = verdict
        .criteria
        .iter()
        .map(|c| {
            serde_json::json!({
                "category": c.category,
                "invariant_id": c.invariant.id,
                "verdicts": c.verdicts,
            })
        })
        .collect();
    write_atomic(
        &raw_verdicts_path,
        serde_json::to_string_pretty(&raw)?.as_bytes(),
    )?;

    tracing::info!(
        verdict = %verdict.overall_verdict,
        dir = %run_dir.display(),
        "run artifacts written"
    );

    Ok(SavedArtifacts {
        verdict_path,
        report_path,
        raw_verdicts_path,
    })
}

/// A run that aborts still leaves a verdict.json behind so downstream
/// consumers can rely on the artifact existing.
pub fn minimal_error_verdict(run_id: &str, stage: &str, message: &str) -> TribunalVerdict {
    TribunalVerdict {
        run_id: run_id.to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        overall_verdict: Verdict::Error,
        overall_score: 0.0,
        total_criteria: 0,
        passed_criteria: 0,
        failed_criteria: 0,
        static_analysis_issues: 0,
        veto: VetoRecord::default(),
        fail_fast: FailFastRecord {
            aborted: false,
            reason: Some(format!("{stage}: {message}")),
        },
        criteria: Vec::new(),
        telemetry: Telemetry::default(),
    }
}

fn verdict_banner(verdict: Verdict) -> &'static str {
    match verdict {
        Verdict::Pass => "PASS",
        Verdict::Fail => "FAIL",
        Verdict::Partial => "PARTIAL",
        Verdict::Error => "ERROR",
        Verdict::Veto => "VETO",
    }
}

/// Human-readable rendering of the verdict, one section per invariant.
pub fn render_report(verdict: &TribunalVerdict) -> String {
    let mut out = String::new();

    out.push_str("# Verification Report\n\n");
    out.push_str(&format!("- **Run**: `{}`\n", verdict.run_id));
    out.push_str(&format!("- **Timestamp**: {}\n", verdict.timestamp));
    out.push_str(&format!(
        "- **Verdict**: {}\n",
        verdict_banner(verdict.overall_verdict)
    ));
    out.push_str(&format!("- **Score**: {:.1}/10\n", verdict.overall_score));
    out.push_str(&format!(
        "- **Criteria**: {} passed / {} failed / {} total\n",
        verdict.passed_criteria, verdict.failed_criteria, verdict.total_criteria
    ));
    out.push_str(&format!(
        "- **Static analysis issues**: {}\n",
        verdict.static_analysis_issues
    ));

    if verdict.fail_fast.aborted {
        out.push_str(&format!(
            "\n> **Pipeline aborted by the static gate**: {}\n",
            verdict.fail_fast.reason.as_deref().unwrap_or("critical findings")
        ));
    }

    if verdict.veto.triggered {
        out.push_str(&format!(
            "\n> **VETO** by judge `{}` on invariant #{} (confidence {:.2})\n",
            verdict.veto.judge.as_deref().unwrap_or("?"),
            verdict.veto.invariant_id.unwrap_or(0),
            verdict.veto.confidence.unwrap_or(0.0),
        ));
    }

    let mut current_category = None;
    for criterion in &verdict.criteria {
        if current_category != Some(criterion.category) {
            current_category = Some(criterion.category);
            out.push_str(&format!("\n## {} requirements\n", criterion.category));
        }
        out.push_str(&render_criterion(criterion));
    }

    if !verdict.telemetry.skipped_imports.is_empty() {
        out.push_str("\n## Skipped imports\n\n");
        for skipped in &verdict.telemetry.skipped_imports {
            out.push_str(&format!("- `{}` ({})\n", skipped.spec, skipped.reason));
        }
    }

    if verdict.telemetry.partial {
        out.push_str("\n> Context was partial: some files were truncated or excluded to fit the token budget.\n");
    }

    out
}

fn render_criterion(criterion: &CriterionResult) -> String {
    let mut out = String::new();

    out.push_str(&format!(
        "\n### #{} {} — {}\n\n",
        criterion.invariant.id,
        criterion.invariant.desc,
        verdict_banner(criterion.consensus_verdict),
    ));
    out.push_str(&format!(
        "Severity: {} | avg {:.1} | weighted {:.1} | majority {:.0}%{}\n\n",
        criterion.invariant.severity,
        criterion.average_score,
        criterion.weighted_score,
        criterion.majority_ratio * 100.0,
        if criterion.unevaluated { " | UNEVALUATED" } else { "" },
    ));

    out.push_str("| Judge | Model | Score | Vote | Confidence |\n");
    out.push_str("|---|---|---|---|---|\n");
    for v in &criterion.verdicts {
        out.push_str(&format!(
            "| {} | {} | {} | {} | {:.2} |\n",
            v.judge_role,
            v.model,
            v.score,
            if !v.responded {
                "no response"
            } else if v.pass_verdict {
                "pass"
            } else {
                "fail"
            },
            v.confidence,
        ));
    }

    let issues: Vec<&String> = criterion
        .verdicts
        .iter()
        .flat_map(|v| v.issues.iter())
        .collect();
    if !issues.is_empty() {
        out.push_str("\nIssues raised:\n");
        for issue in issues {
            out.push_str(&format!("- {issue}\n"));
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invariants::{Category, Invariant, Severity};
    use crate::tribunal::JudgeVerdict;

    fn sample_verdict() -> TribunalVerdict {
        TribunalVerdict {
            run_id: "run-1".into(),
            timestamp: "2026-01-01T00:00:00Z".into(),
            overall_verdict: Verdict::Pass,
            overall_score: 8.5,
            total_criteria: 1,
            passed_criteria: 1,
            failed_criteria: 0,
            static_analysis_issues: 1,
            veto: VetoRecord::default(),
            fail_fast: FailFastRecord::default(),
            criteria: vec![CriterionResult {
                category: Category::Security,
                invariant: Invariant {
                    id: 1,
                    desc: "no eval on untrusted input".into(),
                    severity: Severity::Critical,
                },
                verdicts: vec![JudgeVerdict {
                    judge_role: "security".into(),
                    model: "mock/security".into(),
                    score: 9,
                    pass_verdict: true,
                    confidence: 0.9,
                    explanation: "clean".into(),
                    issues: vec![],
                    suggestions: vec![],
                    responded: true,
                }],
                average_score: 9.0,
                weighted_score: 9.0,
                majority_ratio: 1.0,
                consensus_verdict: Verdict::Pass,
                unevaluated: false,
                partial: false,
            }],
            telemetry: Telemetry::default(),
        }
    }

    #[test]
    fn report_contains_summary_and_criterion_sections() {
        let report = render_report(&sample_verdict());
        assert!(report.contains("# Verification Report"));
        assert!(report.contains("- **Verdict**: PASS"));
        assert!(report.contains("8.5/10"));
        assert!(report.contains("## security requirements"));
        assert!(report.contains("no eval on untrusted input"));
        assert!(report.contains("| security | mock/security | 9 | pass | 0.90 |"));
    }

    #[test]
    fn veto_banner_appears_when_triggered() {
        let mut verdict = sample_verdict();
        verdict.overall_verdict = Verdict::Veto;
        verdict.veto = VetoRecord {
            triggered: true,
            judge: Some("security".into()),
            invariant_id: Some(1),
            category: Some(Category::Security),
            confidence: Some(0.9),
        };
        let report = render_report(&verdict);
        assert!(report.contains("**VETO** by judge `security`"));
    }

    #[test]
    fn artifacts_land_under_run_id_and_parse_back() {
        let tmp = tempfile::TempDir::new().unwrap();
        let verdict = sample_verdict();
        let saved = save_outputs(&verdict, tmp.path()).unwrap();

        assert!(saved.verdict_path.ends_with("run-1/verdict.json"));
        let raw = std::fs::read_to_string(&saved.verdict_path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed["overall_verdict"], "PASS");
        assert_eq!(parsed["veto"]["triggered"], false);
        assert_eq!(parsed["criteria"][0]["invariant"]["id"], 1);

        assert!(saved.report_path.exists());
        assert!(saved.raw_verdicts_path.exists());
    }

    #[test]
    fn minimal_error_verdict_names_the_stage() {
        let verdict = minimal_error_verdict("run-2", "extraction", "model returned garbage");
        assert_eq!(verdict.overall_verdict, Verdict::Error);
        assert!(verdict.criteria.is_empty());
        assert!(verdict
            .fail_fast
            .reason
            .as_deref()
            .unwrap()
            .starts_with("extraction:"));
    }

    #[test]
    fn atomic_write_replaces_existing_content() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("out/verdict.json");
        write_atomic(&path, b"one").unwrap();
        write_atomic(&path, b"two").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "two");
    }
}
