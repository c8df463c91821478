use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use verdex_provider::cache::ResponseCache;
use verdex_provider::retry::{chat_with_retry, RetryPolicy};
use verdex_provider::{ChatRequest, Provider};

use crate::invariants::{Category, Invariant, InvariantSet};
use crate::judges::{self, JudgeSpec};

/// Float comparisons against the consensus ratio tolerate the 2/3 case.
const RATIO_EPSILON: f64 = 1e-6;

const UNEVALUATED_MARKER: &str = "unevaluated";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    Pass,
    Fail,
    Partial,
    Error,
    Veto,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Verdict::Pass => write!(f, "PASS"),
            Verdict::Fail => write!(f, "FAIL"),
            Verdict::Partial => write!(f, "PARTIAL"),
            Verdict::Error => write!(f, "ERROR"),
            Verdict::Veto => write!(f, "VETO"),
        }
    }
}

/// One judge's assessment of one invariant. Created once, never mutated.
#[derive(Debug, Clone, Serialize)]
pub struct JudgeVerdict {
    pub judge_role: String,
    pub model: String,
    pub score: u8,
    pub pass_verdict: bool,
    pub confidence: f64,
    pub explanation: String,
    pub issues: Vec<String>,
    pub suggestions: Vec<String>,
    /// False when the call itself failed (timeout, exhausted retries).
    pub responded: bool,
}

impl JudgeVerdict {
    fn failed(seat: &Seat, reason: &str) -> Self {
        Self {
            judge_role: seat.spec.role.clone(),
            model: seat.spec.model_spec.clone(),
            score: 5,
            pass_verdict: false,
            confidence: 0.0,
            explanation: format!("Judge call failed: {reason}"),
            issues: vec!["judge call failed".to_string()],
            suggestions: Vec::new(),
            responded: false,
        }
    }

    fn is_unevaluated(&self) -> bool {
        self.issues
            .iter()
            .any(|i| i.to_lowercase().contains(UNEVALUATED_MARKER))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CriterionResult {
    pub category: Category,
    pub invariant: Invariant,
    pub verdicts: Vec<JudgeVerdict>,
    pub average_score: f64,
    pub weighted_score: f64,
    pub majority_ratio: f64,
    pub consensus_verdict: Verdict,
    /// True when no judge could evaluate (missing context); excluded from
    /// the overall pass/fail denominators but still reported.
    pub unevaluated: bool,
    pub partial: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct VetoRecord {
    pub triggered: bool,
    pub judge: Option<String>,
    pub invariant_id: Option<u32>,
    pub category: Option<Category>,
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FailFastRecord {
    pub aborted: bool,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoutingRecord {
    pub role: String,
    pub provider: String,
    pub model: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Telemetry {
    pub detection: String,
    pub routing: Vec<RoutingRecord>,
    pub token_count: usize,
    pub partial: bool,
    pub coverage_kinds: BTreeMap<String, verdex_context::CoverageKind>,
    pub skip_reasons: BTreeMap<String, String>,
    pub skipped_imports: Vec<verdex_context::SkippedImport>,
    pub included_files: Vec<String>,
    pub threat_level: String,
    pub duration_ms: u64,
}

/// The top-level run artifact, serialized as `verdict.json`.
#[derive(Debug, Clone, Serialize)]
pub struct TribunalVerdict {
    pub run_id: String,
    pub timestamp: String,
    pub overall_verdict: Verdict,
    pub overall_score: f64,
    pub total_criteria: usize,
    pub passed_criteria: usize,
    pub failed_criteria: usize,
    pub static_analysis_issues: usize,
    pub veto: VetoRecord,
    pub fail_fast: FailFastRecord,
    pub criteria: Vec<CriterionResult>,
    pub telemetry: Telemetry,
}

impl TribunalVerdict {
    pub fn exit_code(&self) -> i32 {
        if self.overall_verdict == Verdict::Pass {
            0
        } else {
            1
        }
    }
}

#[derive(Debug, Clone)]
pub struct TribunalSettings {
    pub pass_score: f64,
    pub consensus_ratio: f64,
    pub veto_confidence_threshold: f64,
    pub judge_timeout: Duration,
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for TribunalSettings {
    fn default() -> Self {
        Self {
            pass_score: 7.0,
            consensus_ratio: 0.67,
            veto_confidence_threshold: 0.8,
            judge_timeout: Duration::from_secs(60),
            max_attempts: 3,
            backoff: Duration::from_secs(2),
        }
    }
}

/// One judge wired to a live transport.
#[derive(Clone)]
pub struct Seat {
    pub spec: JudgeSpec,
    pub provider: Arc<dyn Provider>,
    pub model_id: String,
}

pub struct Tribunal {
    seats: Vec<Seat>,
    settings: TribunalSettings,
    cache: Option<Arc<ResponseCache>>,
}

#[derive(Debug)]
pub struct Adjudication {
    pub criteria: Vec<CriterionResult>,
    pub veto: VetoRecord,
    pub overall_verdict: Verdict,
    pub overall_score: f64,
    pub passed_criteria: usize,
    pub failed_criteria: usize,
}

impl Tribunal {
    pub fn new(seats: Vec<Seat>, settings: TribunalSettings) -> Self {
        Self {
            seats,
            settings,
            cache: None,
        }
    }

    /// Share a deterministic response cache across runs: in watch mode the
    /// same (model, prefix, payload) triple recurs whenever an invariant's
    /// context is unchanged.
    pub fn with_cache(mut self, cache: Arc<ResponseCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.settings.max_attempts,
            base_backoff: self.settings.backoff,
            call_timeout: self.settings.judge_timeout,
        }
    }

    /// Adjudicate every invariant in ascending `(category, id)` order.
    /// Judges run in parallel per invariant; invariants run sequentially so
    /// report ordering and provider load stay predictable.
    pub async fn run(&self, invariants: &InvariantSet, packed_context: &str, context_partial: bool) -> Adjudication {
        let mut criteria = Vec::with_capacity(invariants.total());
        let mut veto = VetoRecord::default();

        for (category, invariant) in invariants.iter_ordered() {
            tracing::info!(
                category = %category,
                id = invariant.id,
                "adjudicating invariant"
            );
            let result = self
                .evaluate_invariant(category, &invariant, packed_context, context_partial)
                .await;

            self.apply_veto(&mut veto, &result);
            criteria.push(result);
        }

        let (overall_verdict, overall_score, passed, failed) =
            summarize(&criteria, veto.triggered);

        Adjudication {
            criteria,
            veto,
            overall_verdict,
            overall_score,
            passed_criteria: passed,
            failed_criteria: failed,
        }
    }

    async fn evaluate_invariant(
        &self,
        category: Category,
        invariant: &Invariant,
        packed_context: &str,
        context_partial: bool,
    ) -> CriterionResult {
        let policy = self.retry_policy();
        let payload = judges::user_payload(category, invariant, packed_context);

        let calls = self.seats.iter().map(|seat| {
            let request = ChatRequest::new(
                seat.model_id.clone(),
                judges::stable_prefix(&seat.spec, self.settings.pass_score),
                payload.clone(),
            )
            .with_temperature(0.0);
            let policy = policy.clone();
            let cache = self.cache.clone();
            async move {
                if let Some(cache) = &cache {
                    if let Some(hit) = cache.get(&request) {
                        return Ok::<verdex_provider::ChatResponse, verdex_provider::ProviderError>(hit);
                    }
                }
                let response = chat_with_retry(seat.provider.as_ref(), &request, &policy).await?;
                if let Some(cache) = &cache {
                    cache.put(&request, &response);
                }
                Ok(response)
            }
        });

        // Judges are independent; completion order is irrelevant. The whole
        // invariant is bounded by 1.5x the per-judge timeout.
        let deadline = self.settings.judge_timeout.mul_f64(1.5);
        let outcomes = tokio::time::timeout(deadline, futures::future::join_all(calls)).await;

        let verdicts: Vec<JudgeVerdict> = match outcomes {
            Ok(results) => self
                .seats
                .iter()
                .zip(results)
                .map(|(seat, result)| match result {
                    Ok(response) => {
                        let parsed =
                            judges::parse_judge_response(&response.content, self.settings.pass_score);
                        JudgeVerdict {
                            judge_role: seat.spec.role.clone(),
                            model: seat.spec.model_spec.clone(),
                            score: parsed.score,
                            pass_verdict: parsed.pass_verdict,
                            confidence: parsed.confidence,
                            explanation: parsed.explanation,
                            issues: parsed.issues,
                            suggestions: parsed.suggestions,
                            responded: true,
                        }
                    }
                    Err(e) => {
                        tracing::warn!(
                            judge = %seat.spec.role,
                            error = %e,
                            "judge call failed"
                        );
                        JudgeVerdict::failed(seat, &e.to_string())
                    }
                })
                .collect(),
            Err(_) => {
                tracing::warn!(
                    invariant = invariant.id,
                    "invariant deadline elapsed; all in-flight judge calls abandoned"
                );
                self.seats
                    .iter()
                    .map(|seat| JudgeVerdict::failed(seat, "invariant deadline elapsed"))
                    .collect()
            }
        };

        self.consensus(category, invariant.clone(), verdicts, context_partial)
    }

    /// Weighted consensus for one invariant. Judges that reported
    /// "unevaluated" leave the majority denominator; judges whose calls
    /// failed still count as failing votes.
    fn consensus(
        &self,
        category: Category,
        invariant: Invariant,
        verdicts: Vec<JudgeVerdict>,
        context_partial: bool,
    ) -> CriterionResult {
        let responded = verdicts.iter().filter(|v| v.responded).count();
        let evaluating: Vec<&JudgeVerdict> = verdicts
            .iter()
            .filter(|v| v.responded && !v.is_unevaluated())
            .collect();

        let average_score = if verdicts.is_empty() {
            0.0
        } else {
            verdicts.iter().map(|v| v.score as f64).sum::<f64>() / verdicts.len() as f64
        };

        let weight_of = |role: &str| {
            self.seats
                .iter()
                .find(|s| s.spec.role == role)
                .map(|s| s.spec.weight)
                .unwrap_or(1.0)
        };
        let total_weight: f64 = verdicts.iter().map(|v| weight_of(&v.judge_role)).sum();
        let weighted_score = if total_weight > 0.0 {
            verdicts
                .iter()
                .map(|v| v.score as f64 * weight_of(&v.judge_role))
                .sum::<f64>()
                / total_weight
        } else {
            0.0
        };

        let unevaluated = responded > 0 && evaluating.is_empty();

        let (majority_ratio, consensus_verdict) = if responded == 0 {
            (0.0, Verdict::Error)
        } else if unevaluated {
            (0.0, Verdict::Error)
        } else {
            let pass_votes = evaluating.iter().filter(|v| v.pass_verdict).count();
            let ratio = pass_votes as f64 / evaluating.len() as f64;
            let verdict = if weighted_score >= self.settings.pass_score
                && ratio + RATIO_EPSILON >= self.settings.consensus_ratio
            {
                Verdict::Pass
            } else if (1.0 - ratio) + RATIO_EPSILON >= self.settings.consensus_ratio {
                Verdict::Fail
            } else {
                Verdict::Partial
            };
            (ratio, verdict)
        };

        CriterionResult {
            category,
            invariant,
            verdicts,
            average_score,
            weighted_score,
            majority_ratio,
            consensus_verdict,
            unevaluated,
            partial: context_partial,
        }
    }

    /// The veto is absorbing: the first trigger is recorded and later ones
    /// only confirm it.
    fn apply_veto(&self, record: &mut VetoRecord, result: &CriterionResult) {
        if record.triggered {
            return;
        }
        for verdict in &result.verdicts {
            let Some(seat) = self.seats.iter().find(|s| s.spec.role == verdict.judge_role) else {
                continue;
            };
            if seat.spec.veto_enabled
                && verdict.responded
                && (verdict.score as f64) <= seat.spec.veto_threshold
                && !verdict.pass_verdict
                && verdict.confidence >= self.settings.veto_confidence_threshold
            {
                tracing::warn!(
                    judge = %verdict.judge_role,
                    invariant = result.invariant.id,
                    confidence = verdict.confidence,
                    "veto triggered"
                );
                *record = VetoRecord {
                    triggered: true,
                    judge: Some(verdict.judge_role.clone()),
                    invariant_id: Some(result.invariant.id),
                    category: Some(result.category),
                    confidence: Some(verdict.confidence),
                };
                return;
            }
        }
    }
}

/// Overall verdict from the per-invariant results. A veto dominates
/// everything; unevaluated invariants are reported but excluded here.
fn summarize(criteria: &[CriterionResult], vetoed: bool) -> (Verdict, f64, usize, usize) {
    let evaluated: Vec<&CriterionResult> =
        criteria.iter().filter(|c| !c.unevaluated).collect();

    let passed = evaluated
        .iter()
        .filter(|c| c.consensus_verdict == Verdict::Pass)
        .count();
    let failed = evaluated
        .iter()
        .filter(|c| c.consensus_verdict == Verdict::Fail)
        .count();

    let overall_score = if evaluated.is_empty() {
        0.0
    } else {
        evaluated.iter().map(|c| c.weighted_score).sum::<f64>() / evaluated.len() as f64
    };

    let overall = if vetoed {
        Verdict::Veto
    } else if evaluated.is_empty()
        || evaluated.iter().all(|c| c.consensus_verdict == Verdict::Error)
    {
        Verdict::Error
    } else if failed > 0 {
        Verdict::Fail
    } else if passed == evaluated.len() {
        Verdict::Pass
    } else {
        Verdict::Partial
    };

    (overall, overall_score, passed, failed)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use verdex_provider::{ChatResponse, ProviderError};

    /// Scripted judge: returns a fixed JSON verdict for every invariant.
    pub struct MockJudge {
        pub response: String,
        pub fail_call: bool,
    }

    #[async_trait::async_trait]
    impl Provider for MockJudge {
        fn name(&self) -> &str {
            "mock"
        }

        async fn chat(&self, _request: &ChatRequest) -> Result<ChatResponse, ProviderError> {
            if self.fail_call {
                return Err(ProviderError::QuotaExhausted("mock billing".into()));
            }
            Ok(ChatResponse {
                content: self.response.clone(),
                usage: None,
                latency_ms: 1,
            })
        }
    }

    pub fn seat(role: &str, weight: f64, veto: bool, response: &str) -> Seat {
        seat_with(role, weight, veto, response, false)
    }

    pub fn seat_with(role: &str, weight: f64, veto: bool, response: &str, fail_call: bool) -> Seat {
        Seat {
            spec: JudgeSpec {
                role: role.to_string(),
                model_spec: format!("mock/{role}"),
                weight,
                veto_enabled: veto,
                veto_threshold: 6.0,
            },
            provider: Arc::new(MockJudge {
                response: response.to_string(),
                fail_call,
            }),
            model_id: role.to_string(),
        }
    }

    pub fn judge_json(score: u8, confidence: f64) -> String {
        serde_json::json!({
            "score": score,
            "explanation": "mock",
            "issues": [],
            "suggestions": [],
            "confidence": confidence,
        })
        .to_string()
    }

    pub fn one_invariant_set() -> InvariantSet {
        let mut set = InvariantSet::default();
        set.security.push(Invariant {
            id: 1,
            desc: "must not use eval on untrusted input".into(),
            severity: crate::invariants::Severity::Critical,
        });
        set
    }
}
