use std::sync::OnceLock;
use std::time::{Duration, Instant};

use regex::Regex;
use serde::Serialize;

use crate::invariants::Severity;
use crate::prompt_guard;

/// One compiled scanner rule. Built-in catalog plus any `tribunal_rules`
/// declared in the constitution.
#[derive(Debug, Clone)]
pub struct ScanRule {
    pub id: String,
    pub regex: Regex,
    pub severity: Severity,
    pub message: String,
    pub suggested_fix: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Violation {
    pub rule_id: String,
    pub severity: Severity,
    pub file: String,
    pub line: usize,
    pub message: String,
    pub suggested_fix: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanResult {
    pub violations: Vec<Violation>,
    pub total_risk_score: u32,
    pub files_scanned: usize,
    pub scan_time_ms: u64,
    /// Rules this deterministic engine cannot evaluate (non-regex types,
    /// invalid patterns).
    pub unevaluated_rules: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EscalationDecision {
    pub should_escalate: bool,
    pub reason: String,
    pub score: u32,
    pub threshold: u32,
    pub critical_count: usize,
    pub high_count: usize,
}

pub fn severity_weight(severity: Severity) -> u32 {
    match severity {
        Severity::Critical => 10,
        Severity::High => 5,
        Severity::Medium => 2,
        Severity::Low => 1,
    }
}

/// Hard-won security smells cheap enough to run on every save.
pub fn built_in_rules() -> Vec<ScanRule> {
    static TABLE: OnceLock<Vec<(&'static str, &'static str, Severity, &'static str)>> =
        OnceLock::new();
    let table = TABLE.get_or_init(|| {
        vec![
            (
                "SEC001",
                r#"(?i)(?:api_key|apikey|secret_key|access_token)\s*=\s*["'][A-Za-z0-9_\-]{16,}["']"#,
                Severity::Critical,
                "Hard-coded credential assignment",
            ),
            (
                "SEC002",
                r"\beval\s*\(",
                Severity::Critical,
                "eval() on dynamic input",
            ),
            (
                "SEC003",
                r"\bexec\s*\(",
                Severity::High,
                "exec() on dynamic input",
            ),
            (
                "SEC004",
                r"(?i)subprocess\.(?:run|call|Popen)\([^)]*shell\s*=\s*True",
                Severity::High,
                "subprocess with shell=True",
            ),
            (
                "SEC005",
                r"pickle\.loads?\s*\(",
                Severity::High,
                "unsafe pickle deserialization",
            ),
            (
                "SEC006",
                r"(?i)\.innerHTML\s*=",
                Severity::High,
                "innerHTML assignment (XSS sink)",
            ),
            (
                "SEC007",
                r#"(?i)(?:md5|sha1)\s*\([^)]*(?:password|passwd|pwd)"#,
                Severity::High,
                "weak hash over a password",
            ),
            (
                "SEC008",
                r#"(?i)execute\s*\(\s*f?["'][^"']*(?:SELECT|INSERT|UPDATE|DELETE)[^"']*(?:\{|%s)"#,
                Severity::High,
                "SQL built by string interpolation",
            ),
            (
                "SEC009",
                r"(?i)debug\s*=\s*True",
                Severity::Medium,
                "debug mode enabled",
            ),
            (
                "SEC010",
                r"(?i)verify\s*=\s*False",
                Severity::Medium,
                "TLS verification disabled",
            ),
        ]
    });

    table
        .iter()
        .map(|(id, pattern, severity, message)| ScanRule {
            id: id.to_string(),
            regex: Regex::new(pattern).expect("static rule compiles"),
            severity: *severity,
            message: message.to_string(),
            suggested_fix: None,
        })
        .collect()
}

fn fenced_json_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"```json\s*(\{[\s\S]*?\})\s*```").unwrap())
}

/// Rules embedded in the constitution as a fenced JSON block with a
/// `tribunal_rules` list. Non-regex or uncompilable rules are surfaced as
/// unevaluated rather than dropped silently.
pub fn parse_constitution_rules(constitution: &str) -> (Vec<ScanRule>, Vec<String>) {
    let mut rules = Vec::new();
    let mut unevaluated = Vec::new();

    let Some(cap) = fenced_json_re().captures(constitution) else {
        return (rules, unevaluated);
    };
    let Ok(payload) = serde_json::from_str::<serde_json::Value>(&cap[1]) else {
        tracing::warn!("constitution rule block is not valid JSON");
        return (rules, unevaluated);
    };
    let Some(raw_rules) = payload["tribunal_rules"].as_array() else {
        return (rules, unevaluated);
    };

    for raw in raw_rules {
        let Some(rule_id) = raw["rule_id"].as_str().filter(|s| !s.is_empty()) else {
            continue;
        };
        if raw["type"].as_str() != Some("regex") {
            unevaluated.push(rule_id.to_string());
            continue;
        }
        let Some(pattern) = raw["pattern"].as_str().filter(|s| !s.is_empty()) else {
            unevaluated.push(rule_id.to_string());
            continue;
        };
        let Ok(regex) = Regex::new(pattern) else {
            tracing::warn!(rule = rule_id, "constitution rule pattern does not compile");
            unevaluated.push(rule_id.to_string());
            continue;
        };

        let severity = raw["severity"]
            .as_str()
            .and_then(Severity::parse)
            .unwrap_or(Severity::Medium);
        let message = prompt_guard::sanitize(
            raw["message"].as_str().unwrap_or("Rule violation"),
            2000,
        );
        let suggested_fix = raw["suggested_fix"]
            .as_str()
            .map(|s| prompt_guard::sanitize(s, 2000))
            .filter(|s| !s.is_empty());

        rules.push(ScanRule {
            id: rule_id.to_string(),
            regex,
            severity,
            message,
            suggested_fix,
        });
    }

    (rules, unevaluated)
}

/// Pure scan of file texts against a rule set. Safe to run on every save;
/// no I/O, no model calls.
pub fn scan_files(files: &[(String, String)], rules: &[ScanRule]) -> ScanResult {
    let start = Instant::now();
    let mut violations = Vec::new();

    for (rel_path, text) in files {
        for rule in rules {
            for m in rule.regex.find_iter(text) {
                let line = text[..m.start()].matches('\n').count() + 1;
                violations.push(Violation {
                    rule_id: rule.id.clone(),
                    severity: rule.severity,
                    file: rel_path.clone(),
                    line,
                    message: rule.message.clone(),
                    suggested_fix: rule.suggested_fix.clone(),
                });
            }
        }
    }

    let total_risk_score = violations.iter().map(|v| severity_weight(v.severity)).sum();

    ScanResult {
        violations,
        total_risk_score,
        files_scanned: files.len(),
        scan_time_ms: start.elapsed().as_millis() as u64,
        unevaluated_rules: Vec::new(),
    }
}

/// Escalate when the accumulated risk clears the threshold or anything
/// critical fires at all.
pub fn evaluate_escalation(result: &ScanResult, threshold: u32) -> EscalationDecision {
    let critical_count = result
        .violations
        .iter()
        .filter(|v| v.severity == Severity::Critical)
        .count();
    let high_count = result
        .violations
        .iter()
        .filter(|v| v.severity == Severity::High)
        .count();

    let (should_escalate, reason) = if critical_count > 0 {
        (true, format!("{critical_count} critical violation(s) detected"))
    } else if result.total_risk_score >= threshold {
        (
            true,
            format!(
                "risk score {} reached threshold {}",
                result.total_risk_score, threshold
            ),
        )
    } else {
        (false, "risk below threshold".to_string())
    };

    EscalationDecision {
        should_escalate,
        reason,
        score: result.total_risk_score,
        threshold,
        critical_count,
        high_count,
    }
}

/// Collapses bursts of change events into one evaluation: the window
/// restarts on every event and fires once quiet.
#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    last_event: Option<Instant>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_event: None,
        }
    }

    pub fn record_event(&mut self) {
        self.last_event = Some(Instant::now());
    }

    pub fn pending(&self) -> bool {
        self.last_event.is_some()
    }

    /// True once the quiet window has elapsed; consumes the pending state.
    pub fn try_fire(&mut self) -> bool {
        match self.last_event {
            Some(at) if at.elapsed() >= self.window => {
                self.last_event = None;
                true
            }
            _ => false,
        }
    }
}
