use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use verdex_config::Config;
use verdex_context::{build_context, ContextOptions, ScanMode, WalkOptions};
use verdex_provider::router::{self, EnvHealthCheck, Lane, ProviderSpec, RouterRequest};
use verdex_provider::Provider;

use crate::constitution::find_constitution;
use crate::extractor::Extractor;
use crate::invariants::InvariantSet;
use crate::judges;
use crate::prompt_guard;
use crate::report::{self, SavedArtifacts};
use crate::scanner::{self, EscalationDecision, ScanResult};
use crate::static_gate::{run_static_gate, StaticGateOutcome};
use crate::tribunal::{
    FailFastRecord, RoutingRecord, Seat, Telemetry, Tribunal, TribunalSettings, TribunalVerdict,
    Verdict, VetoRecord,
};
use crate::VerifyError;

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub root: PathBuf,
    pub spec_path: PathBuf,
    pub mode: ScanMode,
    pub config: Config,
}

/// Injection seam for the LLM-facing pieces. Production passes
/// `PipelineDeps::default()` and everything is built from config;
/// tests supply scripted providers.
#[derive(Default)]
pub struct PipelineDeps {
    pub extractor: Option<(Arc<dyn Provider>, String)>,
    pub seats: Option<Vec<Seat>>,
    /// Shared across runs in watch mode so unchanged invariants hit the
    /// deterministic response cache instead of the provider.
    pub cache: Option<Arc<verdex_provider::cache::ResponseCache>>,
}

#[derive(Debug)]
pub struct PipelineOutcome {
    pub verdict: TribunalVerdict,
    pub artifacts: Option<SavedArtifacts>,
}

fn context_options(config: &Config) -> ContextOptions {
    ContextOptions {
        token_budget: config.context.token_budget,
        max_file_bytes: config.context.max_file_bytes,
        resolver_depth: config.context.resolver_depth,
        resolver_max_files: config.context.resolver_max_files,
        mtime_window_seconds: config.context.mtime_window_seconds,
        windowing_enabled: config.context.windowing_enabled,
        walk: WalkOptions {
            allowed_extensions: config.watcher.supported_extensions.clone(),
            ignore_dirs: config.watcher.ignore_patterns.clone(),
        },
    }
}

fn tribunal_settings(config: &Config) -> TribunalSettings {
    TribunalSettings {
        pass_score: config.thresholds.pass_score,
        consensus_ratio: config.thresholds.consensus_ratio,
        veto_confidence_threshold: config.veto.confidence_threshold,
        judge_timeout: Duration::from_secs(60),
        max_attempts: config.retry.max_attempts,
        backoff: Duration::from_secs(config.retry.backoff_seconds),
    }
}

/// Keywords for windowing relevance come from the invariant descriptions.
fn invariant_keywords(set: &InvariantSet) -> Vec<String> {
    let mut words: Vec<String> = set
        .iter_ordered()
        .iter()
        .flat_map(|(_, inv)| inv.desc.split_whitespace())
        .map(|w| {
            w.trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase()
        })
        .filter(|w| w.len() > 4)
        .collect();
    words.sort();
    words.dedup();
    words.truncate(50);
    words
}

/// Pick the extractor model: lane-routed when lanes are configured,
/// otherwise the configured role model. Returns the model spec plus the
/// routing record for telemetry.
fn route_extractor_model(config: &Config) -> Result<(String, RoutingRecord), VerifyError> {
    let lane2: Vec<ProviderSpec> = config
        .router
        .lane2
        .iter()
        .filter_map(|s| ProviderSpec::parse(s, Lane::Lane2))
        .collect();
    let lane3: Vec<ProviderSpec> = config
        .router
        .lane3
        .iter()
        .filter_map(|s| ProviderSpec::parse(s, Lane::Lane3))
        .collect();

    if lane2.is_empty() && lane3.is_empty() {
        let model = config.model_for_role("extractor");
        let provider = model.split('/').next().unwrap_or("").to_string();
        return Ok((
            model.clone(),
            RoutingRecord {
                role: "extractor".into(),
                provider,
                model,
                reason: "configured".into(),
            },
        ));
    }

    let decision = router::route(
        &RouterRequest {
            lane: Lane::Lane2,
            allow_escalation: config.router.allow_escalation,
            preferred_providers: Vec::new(),
        },
        &lane2,
        &lane3,
        &EnvHealthCheck,
    )
    .map_err(|e| VerifyError::ExtractionFailed(e.to_string()))?;

    tracing::info!(
        provider = %decision.provider,
        model = %decision.model,
        reason = %decision.reason,
        "extractor routed"
    );

    Ok((
        format!("{}/{}", decision.provider, decision.model),
        RoutingRecord {
            role: "extractor".into(),
            provider: decision.provider.clone(),
            model: decision.model.clone(),
            reason: decision.reason.clone(),
        },
    ))
}

fn build_seats(config: &Config) -> Result<Vec<Seat>, VerifyError> {
    let roster = judges::build_roster(config);
    let roles: Vec<&str> = roster.iter().map(|j| j.role.as_str()).collect();
    config.validate_credentials(&roles)?;

    let mut seats = Vec::with_capacity(roster.len());
    for spec in roster {
        let (provider, model_id) = verdex_provider::create_provider(&spec.model_spec)
            .map_err(|e| VerifyError::Other(anyhow::anyhow!(e)))?;
        seats.push(Seat {
            spec,
            provider: Arc::from(provider),
            model_id,
        });
    }
    Ok(seats)
}

/// Reuse the persisted invariant set when the spec hash matches; otherwise
/// run extraction and persist the fresh set.
async fn load_or_extract(
    opts: &PipelineOptions,
    deps: &PipelineDeps,
    routing: &mut Vec<RoutingRecord>,
) -> Result<InvariantSet, VerifyError> {
    let spec_text = std::fs::read_to_string(&opts.spec_path)
        .map_err(|_| VerifyError::SpecMissing(opts.spec_path.display().to_string()))?;

    let criteria_path = Path::new(&opts.config.output.artifacts_dir).join("criteria.json");
    if criteria_path.exists() {
        if let Ok(existing) = InvariantSet::load(&criteria_path) {
            if existing.spec_sha256 == crate::invariants::spec_hash(&spec_text)
                && existing.missing_categories(1).is_empty()
            {
                tracing::info!("spec unchanged; reusing persisted invariant set");
                return Ok(existing);
            }
        }
    }

    let set = match &deps.extractor {
        Some((provider, model_id)) => {
            let extractor = Extractor::new(
                provider.as_ref(),
                model_id.clone(),
                opts.config.thresholds.min_invariants_per_category,
                opts.config.retry.max_attempts,
                Duration::from_secs(opts.config.retry.backoff_seconds),
            );
            extractor.extract(&spec_text).await?
        }
        None => {
            let (model_spec, record) = route_extractor_model(&opts.config)?;
            routing.push(record);
            opts.config.validate_credentials(&["extractor"])?;
            let (provider, model_id) = verdex_provider::create_provider(&model_spec)
                .map_err(|e| VerifyError::Other(anyhow::anyhow!(e)))?;
            let extractor = Extractor::new(
                provider.as_ref(),
                model_id,
                opts.config.thresholds.min_invariants_per_category,
                opts.config.retry.max_attempts,
                Duration::from_secs(opts.config.retry.backoff_seconds),
            );
            extractor.extract(&spec_text).await?
        }
    };

    set.save(&criteria_path)
        .map_err(VerifyError::Other)?;
    Ok(set)
}

/// The full verification pipeline: extract, pack, gate, adjudicate, emit.
/// Any structural failure still leaves a minimal `verdict.json` naming the
/// failed stage, so consumers can rely on the artifact existing.
pub async fn run_verify(
    opts: &PipelineOptions,
    deps: &PipelineDeps,
) -> Result<PipelineOutcome, VerifyError> {
    let run_id = uuid::Uuid::new_v4().to_string();
    match run_verify_inner(opts, deps, &run_id).await {
        Ok(outcome) => Ok(outcome),
        Err(e) => {
            let minimal = report::minimal_error_verdict(&run_id, e.stage(), &e.to_string());
            let artifacts_dir = Path::new(&opts.config.output.artifacts_dir);
            if let Err(write_err) = report::save_outputs(&minimal, artifacts_dir) {
                tracing::error!(error = %write_err, "failed to write minimal error verdict");
            }
            Err(e)
        }
    }
}

async fn run_verify_inner(
    opts: &PipelineOptions,
    deps: &PipelineDeps,
    run_id: &str,
) -> Result<PipelineOutcome, VerifyError> {
    let start = Instant::now();
    let mut routing = Vec::new();

    tracing::info!(root = %opts.root.display(), mode = ?opts.mode, "verification run starting");

    // Stage 1: invariants.
    let invariants = load_or_extract(opts, deps, &mut routing).await?;

    // Stage 2: context. The spec is the constitution; a repo constitution
    // file supplements it.
    let spec_text = std::fs::read_to_string(&opts.spec_path)
        .map_err(|_| VerifyError::SpecMissing(opts.spec_path.display().to_string()))?;
    let constitution_text = match find_constitution(&opts.root) {
        Some((_, extra)) => format!("{spec_text}\n\n{extra}"),
        None => spec_text,
    };

    let built = build_context(
        &opts.root,
        opts.mode,
        &constitution_text,
        &invariant_keywords(&invariants),
        &context_options(&opts.config),
    )
    .await
    .map_err(|e| VerifyError::ContextBuild(e.to_string()))?;

    let threat = prompt_guard::analyze(&built.context.text);

    // Stage 3: fail-fast static gate, before any judge spend.
    let gate = run_static_gate(
        &opts.root,
        &built.change_set.files,
        built.language,
        &opts.config.fail_fast.exclude_test_patterns,
        opts.config.fail_fast.enabled,
    )
    .await;

    if gate.aborted {
        let verdict = fail_fast_verdict(run_id, &gate, telemetry(&built, &routing, &threat, start));
        let artifacts =
            report::save_outputs(&verdict, Path::new(&opts.config.output.artifacts_dir))
                .map_err(VerifyError::Other)?;
        return Ok(PipelineOutcome {
            verdict,
            artifacts: Some(artifacts),
        });
    }

    // Stage 4: tribunal adjudication.
    let seats = match &deps.seats {
        Some(seats) => seats.clone(),
        None => build_seats(&opts.config)?,
    };
    for seat in &seats {
        routing.push(RoutingRecord {
            role: seat.spec.role.clone(),
            provider: seat.provider.name().to_string(),
            model: seat.spec.model_spec.clone(),
            reason: "configured".into(),
        });
    }

    let mut tribunal = Tribunal::new(seats, tribunal_settings(&opts.config));
    if let Some(cache) = &deps.cache {
        tribunal = tribunal.with_cache(Arc::clone(cache));
    }
    let adjudication = tribunal
        .run(&invariants, &built.context.text, built.context.partial)
        .await;

    let verdict = assemble_verdict(
        run_id,
        adjudication,
        &gate,
        telemetry(&built, &routing, &threat, start),
    );

    let artifacts = report::save_outputs(&verdict, Path::new(&opts.config.output.artifacts_dir))
        .map_err(VerifyError::Other)?;

    tracing::info!(
        verdict = %verdict.overall_verdict,
        score = verdict.overall_score,
        duration_ms = verdict.telemetry.duration_ms,
        "verification run complete"
    );

    Ok(PipelineOutcome {
        verdict,
        artifacts: Some(artifacts),
    })
}

fn telemetry(
    built: &verdex_context::BuiltContext,
    routing: &[RoutingRecord],
    threat: &prompt_guard::ThreatAnalysis,
    start: Instant,
) -> Telemetry {
    let mut included_files = built.context.included_changed.clone();
    included_files.extend(built.context.included_imports.clone());
    Telemetry {
        detection: built.change_set.detection.to_string(),
        routing: routing.to_vec(),
        token_count: built.context.token_count,
        partial: built.context.partial,
        coverage_kinds: built.context.coverage_kinds.clone(),
        skip_reasons: built.context.skip_reasons.clone(),
        skipped_imports: built.context.skipped_imports.clone(),
        included_files,
        threat_level: threat.level.to_string(),
        duration_ms: start.elapsed().as_millis() as u64,
    }
}

/// The static gate fired: FAIL verdict, empty criteria, tribunal skipped.
pub fn fail_fast_verdict(
    run_id: &str,
    gate: &StaticGateOutcome,
    telemetry: Telemetry,
) -> TribunalVerdict {
    let reason = gate
        .critical_issues
        .first()
        .map(|i| format!("{}: {} ({}:{})", i.tool, i.message, i.file, i.line))
        .unwrap_or_else(|| "critical static findings".to_string());

    TribunalVerdict {
        run_id: run_id.to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        overall_verdict: Verdict::Fail,
        overall_score: 0.0,
        total_criteria: 0,
        passed_criteria: 0,
        failed_criteria: 0,
        static_analysis_issues: gate.total_issues,
        veto: VetoRecord::default(),
        fail_fast: FailFastRecord {
            aborted: true,
            reason: Some(reason),
        },
        criteria: Vec::new(),
        telemetry,
    }
}

pub fn assemble_verdict(
    run_id: &str,
    adjudication: crate::tribunal::Adjudication,
    gate: &StaticGateOutcome,
    telemetry: Telemetry,
) -> TribunalVerdict {
    TribunalVerdict {
        run_id: run_id.to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        overall_verdict: adjudication.overall_verdict,
        overall_score: adjudication.overall_score,
        total_criteria: adjudication.criteria.len(),
        passed_criteria: adjudication.passed_criteria,
        failed_criteria: adjudication.failed_criteria,
        static_analysis_issues: gate.total_issues,
        veto: adjudication.veto,
        fail_fast: FailFastRecord::default(),
        criteria: adjudication.criteria,
        telemetry,
    }
}

/// One cycle of layered continuous verification: cheap scan first, full
/// tribunal only past the risk threshold. Rate-limiting across cycles is
/// the caller's job (the CLI debounces).
pub struct WatchCycle {
    pub scan: ScanResult,
    pub decision: EscalationDecision,
    pub verdict: Option<TribunalVerdict>,
}

pub async fn run_watch_cycle(
    opts: &PipelineOptions,
    deps: &PipelineDeps,
) -> Result<WatchCycle, VerifyError> {
    let spec_text = std::fs::read_to_string(&opts.spec_path).unwrap_or_default();
    let constitution_text = match find_constitution(&opts.root) {
        Some((_, extra)) => format!("{spec_text}\n\n{extra}"),
        None => spec_text,
    };

    let context_opts = context_options(&opts.config);
    let change_set = verdex_context::detect_changes(
        &opts.root,
        ScanMode::Diff,
        &context_opts.walk,
        Duration::from_secs(opts.config.context.mtime_window_seconds),
    )
    .await
    .map_err(|e| VerifyError::ContextBuild(e.to_string()))?;

    let texts: Vec<(String, String)> = change_set
        .files
        .iter()
        .filter_map(|rel| {
            verdex_context::files::read_capped(&opts.root, rel, opts.config.context.max_file_bytes)
                .map(|text| (rel.clone(), text))
        })
        .collect();

    let mut rules = scanner::built_in_rules();
    let (spec_rules, unevaluated) = scanner::parse_constitution_rules(&constitution_text);
    rules.extend(spec_rules);

    let mut scan = scanner::scan_files(&texts, &rules);
    scan.unevaluated_rules = unevaluated;

    let decision = scanner::evaluate_escalation(&scan, opts.config.watcher.escalation_threshold);

    tracing::info!(
        files = scan.files_scanned,
        violations = scan.violations.len(),
        score = scan.total_risk_score,
        escalate = decision.should_escalate,
        "scan cycle complete"
    );

    let verdict = if decision.should_escalate {
        tracing::warn!(reason = %decision.reason, "escalating to full tribunal");
        Some(run_verify(opts, deps).await?.verdict)
    } else {
        None
    };

    Ok(WatchCycle {
        scan,
        decision,
        verdict,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::static_gate::{StaticIssue, ToolRun};

    fn gate_with_syntax_error() -> StaticGateOutcome {
        let issue = StaticIssue {
            tool: "pylint".into(),
            file: "app.py".into(),
            line: 3,
            kind: "error".into(),
            message: "invalid syntax".into(),
            critical: true,
        };
        StaticGateOutcome {
            runs: vec![ToolRun {
                tool: "pylint".into(),
                file: "app.py".into(),
                issues: vec![issue.clone()],
                severity_counts: Default::default(),
                skipped: None,
            }],
            total_issues: 1,
            critical_issues: vec![issue],
            aborted: true,
        }
    }

    #[test]
    fn fail_fast_verdict_skips_the_tribunal() {
        let verdict = fail_fast_verdict("run-x", &gate_with_syntax_error(), Telemetry::default());
        assert!(verdict.fail_fast.aborted);
        assert_eq!(verdict.overall_verdict, Verdict::Fail);
        assert!(verdict.criteria.is_empty());
        assert_eq!(verdict.static_analysis_issues, 1);
        assert!(verdict
            .fail_fast
            .reason
            .as_deref()
            .unwrap()
            .contains("invalid syntax"));
        assert_eq!(verdict.exit_code(), 1);
    }

    #[test]
    fn keywords_come_from_invariant_descriptions() {
        let mut set = InvariantSet::default();
        set.security.push(crate::invariants::Invariant {
            id: 1,
            desc: "Never pass untrusted input to eval".into(),
            severity: crate::invariants::Severity::Critical,
        });
        let keywords = invariant_keywords(&set);
        assert!(keywords.contains(&"untrusted".to_string()));
        assert!(keywords.contains(&"input".to_string()));
        // short words are dropped
        assert!(!keywords.contains(&"to".to_string()));
    }

    #[test]
    fn extractor_routing_defaults_to_configured_model() {
        let config = Config::default();
        let (model, record) = route_extractor_model(&config).unwrap();
        assert!(model.starts_with("gemini/"));
        assert_eq!(record.reason, "configured");
    }

    mod end_to_end {
        use super::super::*;
        use crate::tribunal::test_support::{judge_json, seat, MockJudge};
        use std::sync::Arc;

        fn extraction_json() -> String {
            serde_json::json!({
                "security": [{"id": 1, "desc": "must not call eval on untrusted input", "severity": "critical"}],
                "functionality": [{"id": 1, "desc": "reads the input file", "severity": "high"}],
                "style": [{"id": 1, "desc": "functions are documented", "severity": "low"}],
            })
            .to_string()
        }

        fn options(root: &std::path::Path) -> PipelineOptions {
            let mut config = Config::default();
            config.thresholds.min_invariants_per_category = 1;
            // the pipeline environment has no linters installed; the gate
            // path is covered by its own tests
            config.fail_fast.enabled = false;
            config.output.artifacts_dir = root
                .join("run_artifacts")
                .to_string_lossy()
                .to_string();
            PipelineOptions {
                root: root.to_path_buf(),
                spec_path: root.join("spec.txt"),
                mode: ScanMode::Full,
                config,
            }
        }

        fn deps(security_response: &str) -> PipelineDeps {
            PipelineDeps {
                extractor: Some((
                    Arc::new(MockJudge {
                        response: extraction_json(),
                        fail_call: false,
                    }),
                    "mock-extractor".into(),
                )),
                seats: Some(vec![
                    seat("architect", 1.0, false, &judge_json(8, 0.9)),
                    seat("security", 1.5, true, security_response),
                    seat("user_proxy", 1.0, false, &judge_json(8, 0.9)),
                ]),
                cache: None,
            }
        }

        fn write_project(root: &std::path::Path) {
            std::fs::write(root.join("spec.txt"), "Must not use eval on untrusted input.")
                .unwrap();
            std::fs::write(root.join("app.py"), "result = eval(user_input)\n").unwrap();
        }

        #[tokio::test]
        async fn mocked_security_failure_produces_a_veto_run() {
            let tmp = tempfile::TempDir::new().unwrap();
            write_project(tmp.path());

            let outcome = run_verify(&options(tmp.path()), &deps(&judge_json(2, 0.9)))
                .await
                .unwrap();

            assert_eq!(outcome.verdict.overall_verdict, Verdict::Veto);
            assert!(outcome.verdict.veto.triggered);
            assert_eq!(outcome.verdict.veto.judge.as_deref(), Some("security"));
            assert_eq!(outcome.verdict.exit_code(), 1);

            // artifact exists and parses back with the veto record
            let raw = std::fs::read_to_string(
                &outcome.artifacts.as_ref().unwrap().verdict_path,
            )
            .unwrap();
            let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
            assert_eq!(parsed["overall_verdict"], "VETO");
            assert_eq!(parsed["veto"]["judge"], "security");
            assert!(parsed["telemetry"]["token_count"].as_u64().unwrap() <= 8000);
        }

        #[tokio::test]
        async fn passing_judges_produce_a_pass_run_deterministically() {
            let tmp = tempfile::TempDir::new().unwrap();
            write_project(tmp.path());

            let one = run_verify(&options(tmp.path()), &deps(&judge_json(9, 0.9)))
                .await
                .unwrap();
            let two = run_verify(&options(tmp.path()), &deps(&judge_json(9, 0.9)))
                .await
                .unwrap();

            assert_eq!(one.verdict.overall_verdict, Verdict::Pass);
            assert_eq!(one.verdict.exit_code(), 0);

            // identical up to run ids and timings
            assert_eq!(one.verdict.overall_verdict, two.verdict.overall_verdict);
            assert_eq!(one.verdict.overall_score, two.verdict.overall_score);
            assert_eq!(one.verdict.total_criteria, two.verdict.total_criteria);
            assert_eq!(
                one.verdict.telemetry.token_count,
                two.verdict.telemetry.token_count
            );
            assert_eq!(
                serde_json::to_string(&one.verdict.criteria).unwrap(),
                serde_json::to_string(&two.verdict.criteria).unwrap()
            );
        }

        #[tokio::test]
        async fn missing_spec_aborts_but_still_writes_a_minimal_verdict() {
            let tmp = tempfile::TempDir::new().unwrap();
            std::fs::write(tmp.path().join("app.py"), "x = 1\n").unwrap();

            let opts = options(tmp.path());
            let err = run_verify(&opts, &deps(&judge_json(9, 0.9)))
                .await
                .unwrap_err();
            assert!(matches!(err, VerifyError::SpecMissing(_)));

            // the minimal artifact names the failing stage
            let artifacts_dir = std::path::Path::new(&opts.config.output.artifacts_dir);
            let run_dir = std::fs::read_dir(artifacts_dir)
                .unwrap()
                .next()
                .unwrap()
                .unwrap()
                .path();
            let raw = std::fs::read_to_string(run_dir.join("verdict.json")).unwrap();
            let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
            assert_eq!(parsed["overall_verdict"], "ERROR");
            assert!(parsed["fail_fast"]["reason"]
                .as_str()
                .unwrap()
                .starts_with("spec:"));
        }

        #[tokio::test]
        async fn watch_cycle_escalates_on_critical_pattern() {
            let tmp = tempfile::TempDir::new().unwrap();
            write_project(tmp.path());

            // app.py carries eval(); the built-in catalog flags it critical
            let cycle = run_watch_cycle(&options(tmp.path()), &deps(&judge_json(2, 0.9)))
                .await
                .unwrap();

            assert!(cycle.decision.should_escalate);
            assert!(cycle.decision.critical_count >= 1);
            let verdict = cycle.verdict.expect("escalation runs the tribunal");
            assert!(matches!(verdict.overall_verdict, Verdict::Fail | Verdict::Veto));
        }
    }
}
