use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Lane {
    Lane2,
    Lane3,
}

impl std::fmt::Display for Lane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Lane::Lane2 => write!(f, "lane2"),
            Lane::Lane3 => write!(f, "lane3"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSpec {
    pub provider: String,
    pub model: String,
    pub lane: Lane,
}

impl ProviderSpec {
    /// Parse a `provider/model` candidate string from config.
    pub fn parse(spec: &str, lane: Lane) -> Option<Self> {
        let (provider, model) = spec.split_once('/')?;
        if provider.is_empty() || model.is_empty() {
            return None;
        }
        Some(Self {
            provider: provider.to_string(),
            model: model.to_string(),
            lane,
        })
    }
}

#[derive(Debug, Clone)]
pub struct HealthResult {
    pub healthy: bool,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct RouterRequest {
    pub lane: Lane,
    pub allow_escalation: bool,
    pub preferred_providers: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FallbackEntry {
    pub provider: String,
    pub model: String,
    pub healthy: bool,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RouterDecision {
    pub lane_requested: Lane,
    pub lane_used: Lane,
    pub provider: String,
    pub model: String,
    pub reason: String,
    pub fallback_chain: Vec<FallbackEntry>,
}

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("no healthy providers for lane2 (and escalation not possible)")]
    Lane2Exhausted,

    #[error("no healthy providers for lane3")]
    Lane3Exhausted,
}

/// Health probes are injectable so routing is testable without a network.
pub trait HealthCheck: Send + Sync {
    fn check(&self, spec: &ProviderSpec) -> HealthResult;
}

/// Conservative, local-only default: a candidate is healthy when its model
/// string is non-empty and its credential env var is set.
pub struct EnvHealthCheck;

impl HealthCheck for EnvHealthCheck {
    fn check(&self, spec: &ProviderSpec) -> HealthResult {
        if spec.model.trim().is_empty() {
            return HealthResult { healthy: false, reason: "model_missing".into() };
        }
        match verdex_config::find_provider_def(&spec.provider) {
            None => HealthResult {
                healthy: false,
                reason: format!("unknown_provider:{}", spec.provider),
            },
            Some(def) if !def.env_var.is_empty() && std::env::var(def.env_var).is_err() => {
                HealthResult {
                    healthy: false,
                    reason: format!("auth_missing:{}", def.env_var),
                }
            }
            Some(_) => HealthResult { healthy: true, reason: "ok".into() },
        }
    }
}

fn first_healthy(
    candidates: &[ProviderSpec],
    preferred: &[String],
    health: &dyn HealthCheck,
    chain: &mut Vec<FallbackEntry>,
) -> Option<ProviderSpec> {
    let mut ordered: Vec<&ProviderSpec> = Vec::with_capacity(candidates.len());
    ordered.extend(candidates.iter().filter(|c| preferred.contains(&c.provider)));
    ordered.extend(candidates.iter().filter(|c| !preferred.contains(&c.provider)));

    for cand in ordered {
        let hr = health.check(cand);
        chain.push(FallbackEntry {
            provider: cand.provider.clone(),
            model: cand.model.clone(),
            healthy: hr.healthy,
            reason: hr.reason,
        });
        if chain.last().map(|e| e.healthy).unwrap_or(false) {
            return Some(cand.clone());
        }
    }
    None
}

/// Select a provider/model for the requested lane. Candidates are tried in
/// configured order (preferred providers first); lane2 falls over to lane3
/// when allowed. The fallback chain records every candidate probed.
pub fn route(
    request: &RouterRequest,
    lane2_candidates: &[ProviderSpec],
    lane3_candidates: &[ProviderSpec],
    health: &dyn HealthCheck,
) -> Result<RouterDecision, RouterError> {
    let mut chain = Vec::new();

    match request.lane {
        Lane::Lane2 => {
            if let Some(picked) =
                first_healthy(lane2_candidates, &request.preferred_providers, health, &mut chain)
            {
                return Ok(RouterDecision {
                    lane_requested: Lane::Lane2,
                    lane_used: Lane::Lane2,
                    provider: picked.provider,
                    model: picked.model,
                    reason: "lane2_selected".into(),
                    fallback_chain: chain,
                });
            }
            if request.allow_escalation {
                if let Some(picked) = first_healthy(
                    lane3_candidates,
                    &request.preferred_providers,
                    health,
                    &mut chain,
                ) {
                    return Ok(RouterDecision {
                        lane_requested: Lane::Lane2,
                        lane_used: Lane::Lane3,
                        provider: picked.provider,
                        model: picked.model,
                        reason: "escalated_to_lane3".into(),
                        fallback_chain: chain,
                    });
                }
            }
            Err(RouterError::Lane2Exhausted)
        }
        Lane::Lane3 => {
            if let Some(picked) =
                first_healthy(lane3_candidates, &request.preferred_providers, health, &mut chain)
            {
                return Ok(RouterDecision {
                    lane_requested: Lane::Lane3,
                    lane_used: Lane::Lane3,
                    provider: picked.provider,
                    model: picked.model,
                    reason: "lane3_selected".into(),
                    fallback_chain: chain,
                });
            }
            Err(RouterError::Lane3Exhausted)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedHealth(Vec<(&'static str, bool)>);

    impl HealthCheck for FixedHealth {
        fn check(&self, spec: &ProviderSpec) -> HealthResult {
            let healthy = self
                .0
                .iter()
                .find(|(p, _)| *p == spec.provider)
                .map(|(_, h)| *h)
                .unwrap_or(false);
            HealthResult {
                healthy,
                reason: if healthy { "ok".into() } else { "down".into() },
            }
        }
    }

    fn spec(provider: &str, lane: Lane) -> ProviderSpec {
        ProviderSpec {
            provider: provider.into(),
            model: "m".into(),
            lane,
        }
    }

    #[test]
    fn lane2_selected_when_healthy() {
        let decision = route(
            &RouterRequest {
                lane: Lane::Lane2,
                allow_escalation: true,
                preferred_providers: vec![],
            },
            &[spec("ollama", Lane::Lane2)],
            &[spec("anthropic", Lane::Lane3)],
            &FixedHealth(vec![("ollama", true)]),
        )
        .unwrap();
        assert_eq!(decision.lane_used, Lane::Lane2);
        assert_eq!(decision.reason, "lane2_selected");
        assert_eq!(decision.fallback_chain.len(), 1);
    }

    #[test]
    fn escalates_to_lane3_when_lane2_down() {
        let decision = route(
            &RouterRequest {
                lane: Lane::Lane2,
                allow_escalation: true,
                preferred_providers: vec![],
            },
            &[spec("ollama", Lane::Lane2)],
            &[spec("anthropic", Lane::Lane3)],
            &FixedHealth(vec![("ollama", false), ("anthropic", true)]),
        )
        .unwrap();
        assert_eq!(decision.lane_used, Lane::Lane3);
        assert_eq!(decision.reason, "escalated_to_lane3");
        // chain records the failed lane2 probe and the lane3 pick
        assert_eq!(decision.fallback_chain.len(), 2);
        assert!(!decision.fallback_chain[0].healthy);
    }

    #[test]
    fn escalation_disabled_errors_out() {
        let err = route(
            &RouterRequest {
                lane: Lane::Lane2,
                allow_escalation: false,
                preferred_providers: vec![],
            },
            &[spec("ollama", Lane::Lane2)],
            &[spec("anthropic", Lane::Lane3)],
            &FixedHealth(vec![]),
        )
        .unwrap_err();
        assert!(matches!(err, RouterError::Lane2Exhausted));
    }

    #[test]
    fn preferred_providers_probe_first() {
        let decision = route(
            &RouterRequest {
                lane: Lane::Lane3,
                allow_escalation: false,
                preferred_providers: vec!["gemini".into()],
            },
            &[],
            &[spec("anthropic", Lane::Lane3), spec("gemini", Lane::Lane3)],
            &FixedHealth(vec![("anthropic", true), ("gemini", true)]),
        )
        .unwrap();
        assert_eq!(decision.provider, "gemini");
    }
}
