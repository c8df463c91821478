use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

use crate::invariants::{Category, Invariant};
use crate::prompt_guard;

/// One tribunal seat: a persona, a model and its vote weight. Security
/// carries extra weight and the veto bit by default.
#[derive(Debug, Clone, Serialize)]
pub struct JudgeSpec {
    pub role: String,
    pub model_spec: String,
    pub weight: f64,
    pub veto_enabled: bool,
    pub veto_threshold: f64,
}

const ARCHITECT_PROMPT: &str = "\
You are an expert software architect reviewing code against a single requirement.
Evaluate correctness of structure, separation of concerns, error handling and
whether the implementation actually satisfies the requirement. Judge only what
the provided code shows; do not assume unseen code is correct.";

const SECURITY_PROMPT: &str = "\
You are an expert security auditor reviewing code against a single requirement.
Look for injection vulnerabilities, unsafe eval/exec or subprocess usage,
hard-coded secrets, weak cryptography, path traversal, unsafe deserialization
and sensitive data exposure. A critical vulnerability must drive the score
down regardless of code quality elsewhere. Judge only what the provided code
shows; do not assume unseen code is safe.";

const USER_PROXY_PROMPT: &str = "\
You represent the end user of this software. Evaluate whether the code, as
written, delivers the behavior the requirement promises: correct results,
sensible failure modes, no surprising side effects. Judge only what the
provided code shows.";

fn role_prompt(role: &str) -> &'static str {
    match role {
        "security" => SECURITY_PROMPT,
        "user_proxy" => USER_PROXY_PROMPT,
        _ => ARCHITECT_PROMPT,
    }
}

/// Default roster, or the `judges` roster from config when present. The
/// veto threshold defaults to one point below the pass score.
pub fn build_roster(config: &verdex_config::Config) -> Vec<JudgeSpec> {
    let pass_score = config.thresholds.pass_score;
    let default_veto_threshold = pass_score - 1.0;

    if config.judges.is_empty() {
        return vec![
            JudgeSpec {
                role: "architect".into(),
                model_spec: config.model_for_role("architect"),
                weight: 1.0,
                veto_enabled: false,
                veto_threshold: default_veto_threshold,
            },
            JudgeSpec {
                role: "security".into(),
                model_spec: config.model_for_role("security"),
                weight: 1.5,
                veto_enabled: config.veto.enabled,
                veto_threshold: default_veto_threshold,
            },
            JudgeSpec {
                role: "user_proxy".into(),
                model_spec: config.model_for_role("user_proxy"),
                weight: 1.0,
                veto_enabled: false,
                veto_threshold: default_veto_threshold,
            },
        ];
    }

    config
        .judges
        .iter()
        .filter(|j| j.enabled.unwrap_or(true))
        .map(|j| JudgeSpec {
            role: j.role.clone(),
            model_spec: j
                .model
                .clone()
                .unwrap_or_else(|| config.model_for_role(&j.role)),
            weight: j.weight,
            veto_enabled: j.veto_enabled && config.veto.enabled,
            veto_threshold: j.veto_threshold.unwrap_or(default_veto_threshold),
        })
        .collect()
}

/// The stable prefix: persona, rubric and output schema. Kept first and
/// byte-identical across every invariant so providers can cache it.
pub fn stable_prefix(judge: &JudgeSpec, pass_score: f64) -> String {
    format!(
        "{}\n\n\
         SCORING RUBRIC (integer 1-10):\n\
         - 9-10: requirement clearly satisfied, no concerns\n\
         - {}-8: satisfied with minor concerns\n\
         - 4-{}: partially satisfied or significant concerns\n\
         - 1-3: requirement violated or seriously at risk\n\
         A score of {} or higher is a passing vote.\n\n\
         Respond with STRICT JSON only:\n\
         {{\"score\": <1-10>, \"explanation\": \"<brief assessment>\", \
         \"issues\": [\"<issue>\"], \"suggestions\": [\"<suggestion>\"], \
         \"confidence\": <0.0-1.0>}}\n\
         If the provided context is insufficient to evaluate the requirement, \
         set score no higher than {}, confidence accordingly, and include the \
         issue \"unevaluated: insufficient context\". Do not guess.",
        role_prompt(&judge.role),
        pass_score as i64,
        pass_score as i64 - 1,
        pass_score as i64,
        pass_score as i64 - 1,
    )
}

/// The variable payload: the invariant under judgment plus the packed code
/// context, both bracketed as data.
pub fn user_payload(category: Category, invariant: &Invariant, packed_context: &str) -> String {
    let requirement = format!(
        "Category: {category}\nSeverity: {}\nRequirement #{}: {}",
        invariant.severity, invariant.id, invariant.desc
    );
    format!(
        "{}\n\n{}",
        prompt_guard::bracket_data("REQUIREMENT", &requirement),
        prompt_guard::bracket_data("CODE_CONTEXT", packed_context),
    )
}

#[derive(Debug, Clone, Serialize)]
pub struct ParsedVerdict {
    pub score: u8,
    pub explanation: String,
    pub issues: Vec<String>,
    pub suggestions: Vec<String>,
    pub confidence: f64,
    pub pass_verdict: bool,
}

fn score_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)score[:\s]+(\d{1,2})").unwrap())
}

fn fenced_json_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"```(?:json)?\s*(\{[\s\S]*?\})\s*```").unwrap())
}

/// Recover a JSON object from a model response: the whole body, then a
/// fenced block, then the first balanced-brace object.
pub fn recover_json(text: &str) -> Option<serde_json::Value> {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(text.trim()) {
        if value.is_object() {
            return Some(value);
        }
    }

    if let Some(cap) = fenced_json_re().captures(text) {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(&cap[1]) {
            if value.is_object() {
                return Some(value);
            }
        }
    }

    // Balanced-brace scan from each opening brace.
    let bytes = text.as_bytes();
    for (start, &b) in bytes.iter().enumerate() {
        if b != b'{' {
            continue;
        }
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;
        for (offset, &c) in bytes[start..].iter().enumerate() {
            if in_string {
                if escaped {
                    escaped = false;
                } else if c == b'\\' {
                    escaped = true;
                } else if c == b'"' {
                    in_string = false;
                }
                continue;
            }
            match c {
                b'"' => in_string = true,
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        let candidate = &text[start..start + offset + 1];
                        if let Ok(value) = serde_json::from_str::<serde_json::Value>(candidate) {
                            if value.is_object() {
                                return Some(value);
                            }
                        }
                        break;
                    }
                }
                _ => {}
            }
        }
    }

    None
}

fn string_list(value: &serde_json::Value) -> Vec<String> {
    value
        .as_array()
        .map(|list| {
            list.iter()
                .filter_map(|v| match v {
                    serde_json::Value::String(s) => Some(s.clone()),
                    other => other.get("message").and_then(|m| m.as_str()).map(String::from),
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Parse one judge response. JSON first; a "Score: N" line as fallback; a
/// neutral failing default when neither is present.
pub fn parse_judge_response(text: &str, pass_score: f64) -> ParsedVerdict {
    if let Some(value) = recover_json(text) {
        let score = value["score"]
            .as_f64()
            .map(|s| s.round().clamp(1.0, 10.0) as u8)
            .unwrap_or(5);
        let confidence = value["confidence"].as_f64().unwrap_or(0.5).clamp(0.0, 1.0);
        return ParsedVerdict {
            score,
            explanation: value["explanation"].as_str().unwrap_or("").to_string(),
            issues: string_list(&value["issues"]),
            suggestions: string_list(&value["suggestions"]),
            confidence,
            pass_verdict: (score as f64) >= pass_score,
        };
    }

    if let Some(cap) = score_line_re().captures(text) {
        if let Ok(score) = cap[1].parse::<u8>() {
            let score = score.clamp(1, 10);
            return ParsedVerdict {
                score,
                explanation: prompt_guard::sanitize(text, 500),
                issues: Vec::new(),
                suggestions: Vec::new(),
                confidence: 0.5,
                pass_verdict: (score as f64) >= pass_score,
            };
        }
    }

    ParsedVerdict {
        score: 5,
        explanation: prompt_guard::sanitize(text, 500),
        issues: vec!["unparseable judge response".to_string()],
        suggestions: Vec::new(),
        confidence: 0.0,
        pass_verdict: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invariants::Severity;

    #[test]
    fn parses_plain_json_response() {
        let raw = r#"{"score": 8, "explanation": "solid", "issues": [], "suggestions": ["add tests"], "confidence": 0.9}"#;
        let parsed = parse_judge_response(raw, 7.0);
        assert_eq!(parsed.score, 8);
        assert!(parsed.pass_verdict);
        assert_eq!(parsed.suggestions, vec!["add tests"]);
        assert_eq!(parsed.confidence, 0.9);
    }

    #[test]
    fn parses_fenced_json_response() {
        let raw = "Here is my verdict:\n```json\n{\"score\": 3, \"explanation\": \"broken\", \"confidence\": 0.8}\n```\nThanks.";
        let parsed = parse_judge_response(raw, 7.0);
        assert_eq!(parsed.score, 3);
        assert!(!parsed.pass_verdict);
    }

    #[test]
    fn recovers_embedded_object_by_brace_scan() {
        let raw = "Some preamble {\"score\": 9, \"explanation\": \"fine \\\"quoted\\\"\", \"confidence\": 1.0} trailing";
        let parsed = parse_judge_response(raw, 7.0);
        assert_eq!(parsed.score, 9);
        assert!(parsed.pass_verdict);
    }

    #[test]
    fn falls_back_to_score_line() {
        let parsed = parse_judge_response("The code is well structured. Score: 9/10.", 7.0);
        assert_eq!(parsed.score, 9);
        assert!(parsed.pass_verdict);
    }

    #[test]
    fn defaults_to_failing_neutral_verdict() {
        let parsed = parse_judge_response("The code is okay.", 7.0);
        assert_eq!(parsed.score, 5);
        assert_eq!(parsed.confidence, 0.0);
        assert!(!parsed.pass_verdict);
    }

    #[test]
    fn default_roster_has_weighted_security_veto() {
        let config = verdex_config::Config::default();
        let roster = build_roster(&config);
        assert_eq!(roster.len(), 3);
        let security = roster.iter().find(|j| j.role == "security").unwrap();
        assert!(security.veto_enabled);
        assert_eq!(security.weight, 1.5);
        assert_eq!(security.veto_threshold, 6.0);
        assert!(roster.iter().filter(|j| j.role != "security").all(|j| !j.veto_enabled));
    }

    #[test]
    fn stable_prefix_is_identical_across_invariants() {
        let config = verdex_config::Config::default();
        let judge = &build_roster(&config)[0];
        let one = stable_prefix(judge, 7.0);
        let two = stable_prefix(judge, 7.0);
        assert_eq!(one, two);

        let inv_a = Invariant { id: 1, desc: "a".into(), severity: Severity::High };
        let inv_b = Invariant { id: 2, desc: "b".into(), severity: Severity::Low };
        let payload_a = user_payload(Category::Security, &inv_a, "ctx");
        let payload_b = user_payload(Category::Security, &inv_b, "ctx");
        assert_ne!(payload_a, payload_b);
    }
}
