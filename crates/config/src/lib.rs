use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing credential env var {env_var} for provider '{provider}' (required by judge '{role}')")]
    MissingCredential {
        provider: String,
        env_var: String,
        role: String,
    },

    #[error("unknown provider '{0}' in model spec")]
    UnknownProvider(String),

    #[error("invalid model spec '{0}': expected 'provider/model'")]
    InvalidModelSpec(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub llms: HashMap<String, LlmEntry>,
    #[serde(default)]
    pub thresholds: Thresholds,
    #[serde(default)]
    pub veto: VetoConfig,
    #[serde(default)]
    pub fail_fast: FailFastConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub watcher: WatcherConfig,
    #[serde(default)]
    pub output: OutputConfig,
    /// Optional roster overrides. Empty means the built-in tribunal
    /// (architect, security, user_proxy) is used.
    #[serde(default)]
    pub judges: Vec<JudgeEntry>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmEntry {
    pub model: String,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub cost_per_1k_input: f64,
    #[serde(default)]
    pub cost_per_1k_output: f64,
}

fn default_pass_score() -> f64 {
    7.0
}

fn default_consensus_ratio() -> f64 {
    0.67
}

fn default_min_invariants() -> usize {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thresholds {
    #[serde(default = "default_pass_score")]
    pub pass_score: f64,
    #[serde(default = "default_consensus_ratio")]
    pub consensus_ratio: f64,
    #[serde(default = "default_min_invariants")]
    pub min_invariants_per_category: usize,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            pass_score: default_pass_score(),
            consensus_ratio: default_consensus_ratio(),
            min_invariants_per_category: default_min_invariants(),
        }
    }
}

fn default_veto_confidence() -> f64 {
    0.8
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VetoConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_veto_confidence")]
    pub confidence_threshold: f64,
}

impl Default for VetoConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            confidence_threshold: default_veto_confidence(),
        }
    }
}

fn default_exclude_test_patterns() -> Vec<String> {
    vec![
        "test_*".to_string(),
        "*_test.*".to_string(),
        "tests/**".to_string(),
        "**/*.spec.*".to_string(),
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailFastConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_exclude_test_patterns")]
    pub exclude_test_patterns: Vec<String>,
}

impl Default for FailFastConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            exclude_test_patterns: default_exclude_test_patterns(),
        }
    }
}

fn default_token_budget() -> usize {
    8000
}

fn default_max_file_bytes() -> u64 {
    512 * 1024
}

fn default_resolver_depth() -> usize {
    2
}

fn default_resolver_max_files() -> usize {
    200
}

fn default_mtime_window() -> u64 {
    300
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    #[serde(default = "default_token_budget")]
    pub token_budget: usize,
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
    #[serde(default = "default_resolver_depth")]
    pub resolver_depth: usize,
    #[serde(default = "default_resolver_max_files")]
    pub resolver_max_files: usize,
    #[serde(default = "default_mtime_window")]
    pub mtime_window_seconds: u64,
    #[serde(default)]
    pub windowing_enabled: bool,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            token_budget: default_token_budget(),
            max_file_bytes: default_max_file_bytes(),
            resolver_depth: default_resolver_depth(),
            resolver_max_files: default_resolver_max_files(),
            mtime_window_seconds: default_mtime_window(),
            windowing_enabled: false,
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_seconds() -> u64 {
    2
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_seconds")]
    pub backoff_seconds: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_seconds: default_backoff_seconds(),
        }
    }
}

/// Lane candidates for the two-tier router: lane2 is the cheap/local tier,
/// lane3 the frontier tier. Each entry is a `provider/model` spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    #[serde(default = "default_true")]
    pub allow_escalation: bool,
    #[serde(default)]
    pub lane2: Vec<String>,
    #[serde(default)]
    pub lane3: Vec<String>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            allow_escalation: true,
            lane2: Vec::new(),
            lane3: Vec::new(),
        }
    }
}

fn default_debounce_seconds() -> u64 {
    15
}

fn default_poll_interval() -> u64 {
    5
}

fn default_escalation_threshold() -> u32 {
    20
}

fn default_supported_extensions() -> Vec<String> {
    vec![
        ".py".to_string(),
        ".js".to_string(),
        ".jsx".to_string(),
        ".ts".to_string(),
        ".tsx".to_string(),
        ".mjs".to_string(),
        ".cjs".to_string(),
    ]
}

fn default_ignore_patterns() -> Vec<String> {
    vec![
        ".git".to_string(),
        "__pycache__".to_string(),
        "node_modules".to_string(),
        ".venv".to_string(),
        "venv".to_string(),
        "dist".to_string(),
        "build".to_string(),
        "target".to_string(),
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherConfig {
    #[serde(default = "default_debounce_seconds")]
    pub debounce_seconds: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,
    #[serde(default = "default_escalation_threshold")]
    pub escalation_threshold: u32,
    #[serde(default = "default_supported_extensions")]
    pub supported_extensions: Vec<String>,
    #[serde(default = "default_ignore_patterns")]
    pub ignore_patterns: Vec<String>,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            debounce_seconds: default_debounce_seconds(),
            poll_interval_seconds: default_poll_interval(),
            escalation_threshold: default_escalation_threshold(),
            supported_extensions: default_supported_extensions(),
            ignore_patterns: default_ignore_patterns(),
        }
    }
}

fn default_artifacts_dir() -> String {
    "run_artifacts".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_artifacts_dir")]
    pub artifacts_dir: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            artifacts_dir: default_artifacts_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeEntry {
    pub role: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default)]
    pub veto_enabled: bool,
    #[serde(default)]
    pub veto_threshold: Option<f64>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

fn default_weight() -> f64 {
    1.0
}

fn default_true() -> bool {
    true
}

/// Static registry entry for a known provider. `env_var` is the only
/// credential source: the spec's contract is env-vars only.
#[derive(Debug, Clone)]
pub struct ProviderDef {
    pub id: &'static str,
    pub name: &'static str,
    pub env_var: &'static str,
    pub default_base_url: &'static str,
    pub api_style: &'static str,
}

pub const BUILT_IN_PROVIDERS: &[ProviderDef] = &[
    ProviderDef { id: "openai", name: "OpenAI", env_var: "OPENAI_API_KEY",
                  default_base_url: "https://api.openai.com/v1",
                  api_style: "openai" },
    ProviderDef { id: "anthropic", name: "Anthropic", env_var: "ANTHROPIC_API_KEY",
                  default_base_url: "https://api.anthropic.com/v1",
                  api_style: "anthropic" },
    ProviderDef { id: "gemini", name: "Google Gemini", env_var: "GEMINI_API_KEY",
                  default_base_url: "https://generativelanguage.googleapis.com/v1beta",
                  api_style: "gemini" },
    ProviderDef { id: "deepseek", name: "DeepSeek", env_var: "DEEPSEEK_API_KEY",
                  default_base_url: "https://api.deepseek.com/v1",
                  api_style: "openai" },
    ProviderDef { id: "groq", name: "Groq", env_var: "GROQ_API_KEY",
                  default_base_url: "https://api.groq.com/openai/v1",
                  api_style: "openai" },
    ProviderDef { id: "together", name: "Together AI", env_var: "TOGETHER_API_KEY",
                  default_base_url: "https://api.together.xyz/v1",
                  api_style: "openai" },
    ProviderDef { id: "ollama", name: "Ollama (local)", env_var: "",
                  default_base_url: "http://localhost:11434/v1",
                  api_style: "openai" },
];

pub fn find_provider_def(id: &str) -> Option<&'static ProviderDef> {
    BUILT_IN_PROVIDERS.iter().find(|p| p.id == id)
}

/// Split a `provider/model` spec. A bare model id is rejected so that
/// credential resolution is always unambiguous.
pub fn split_model_spec(spec: &str) -> Result<(&str, &str), ConfigError> {
    match spec.split_once('/') {
        Some((provider, model)) if !provider.is_empty() && !model.is_empty() => {
            Ok((provider, model))
        }
        _ => Err(ConfigError::InvalidModelSpec(spec.to_string())),
    }
}

impl Config {
    /// Load the effective config: user-level file (if any) merged under the
    /// project file (if any). Either missing is fine.
    pub fn load(project_path: Option<&Path>) -> Result<Self> {
        let user = Self::load_file(&Self::user_config_path())?;
        let project = match project_path {
            Some(p) => Self::load_file(p)?,
            None => Self::load_file(Path::new("config.yaml"))?,
        };

        Ok(match (user, project) {
            (Some(u), Some(p)) => Self::merge(&u, &p),
            (None, Some(p)) => p,
            (Some(u), None) => u,
            (None, None) => Self::default(),
        })
    }

    fn load_file(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        tracing::info!(path = %path.display(), "loaded configuration");
        Ok(Some(config))
    }

    pub fn user_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("verdex")
            .join("config.yaml")
    }

    /// Project values win per key; maps are unioned with project entries
    /// overriding user entries.
    pub fn merge(user: &Config, project: &Config) -> Config {
        let mut llms = user.llms.clone();
        for (role, entry) in &project.llms {
            llms.insert(role.clone(), entry.clone());
        }

        Config {
            llms,
            thresholds: project.thresholds.clone(),
            veto: project.veto.clone(),
            fail_fast: project.fail_fast.clone(),
            context: project.context.clone(),
            retry: project.retry.clone(),
            router: RouterConfig {
                allow_escalation: project.router.allow_escalation,
                lane2: if project.router.lane2.is_empty() {
                    user.router.lane2.clone()
                } else {
                    project.router.lane2.clone()
                },
                lane3: if project.router.lane3.is_empty() {
                    user.router.lane3.clone()
                } else {
                    project.router.lane3.clone()
                },
            },
            watcher: project.watcher.clone(),
            output: project.output.clone(),
            judges: if project.judges.is_empty() {
                user.judges.clone()
            } else {
                project.judges.clone()
            },
        }
    }

    /// Model spec for a role, falling back to the built-in defaults the
    /// tribunal ships with.
    pub fn model_for_role(&self, role: &str) -> String {
        if let Some(entry) = self.llms.get(role) {
            if !entry.model.is_empty() {
                return entry.model.clone();
            }
        }
        match role {
            "extractor" => "gemini/gemini-2.5-flash".to_string(),
            "architect" => "anthropic/claude-sonnet-4-20250514".to_string(),
            "security" => "deepseek/deepseek-chat".to_string(),
            "user_proxy" => "gemini/gemini-2.5-pro".to_string(),
            _ => "openai/gpt-4o-mini".to_string(),
        }
    }

    /// Verify every enabled role's provider credential is present. Hard
    /// error at startup so a run never dies mid-tribunal on a missing key.
    pub fn validate_credentials(&self, roles: &[&str]) -> Result<(), ConfigError> {
        for role in roles {
            let spec = self.model_for_role(role);
            let (provider, _) = split_model_spec(&spec)?;
            let def = find_provider_def(provider)
                .ok_or_else(|| ConfigError::UnknownProvider(provider.to_string()))?;
            if !def.env_var.is_empty() && std::env::var(def.env_var).is_err() {
                return Err(ConfigError::MissingCredential {
                    provider: provider.to_string(),
                    env_var: def.env_var.to_string(),
                    role: role.to_string(),
                });
            }
        }
        Ok(())
    }

    /// How many of the built-in providers have their credential configured.
    /// Only counts are exposed; never per-key presence.
    pub fn credential_counts() -> (usize, usize) {
        let keyed: Vec<_> = BUILT_IN_PROVIDERS
            .iter()
            .filter(|p| !p.env_var.is_empty())
            .collect();
        let present = keyed
            .iter()
            .filter(|p| std::env::var(p.env_var).is_ok())
            .count();
        (present, keyed.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let c = Config::default();
        assert_eq!(c.thresholds.pass_score, 7.0);
        assert_eq!(c.thresholds.consensus_ratio, 0.67);
        assert_eq!(c.thresholds.min_invariants_per_category, 3);
        assert!(c.veto.enabled);
        assert_eq!(c.veto.confidence_threshold, 0.8);
        assert!(c.fail_fast.enabled);
        assert_eq!(c.context.token_budget, 8000);
        assert_eq!(c.context.max_file_bytes, 512 * 1024);
        assert_eq!(c.watcher.debounce_seconds, 15);
        assert_eq!(c.watcher.escalation_threshold, 20);
    }

    #[test]
    fn parses_yaml_with_partial_sections() {
        let yaml = r#"
thresholds:
  pass_score: 8
llms:
  security:
    model: "deepseek/deepseek-chat"
    temperature: 0.0
"#;
        let c: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(c.thresholds.pass_score, 8.0);
        // untouched sections keep defaults
        assert_eq!(c.thresholds.consensus_ratio, 0.67);
        assert_eq!(c.llms["security"].model, "deepseek/deepseek-chat");
    }

    #[test]
    fn merge_prefers_project_llms() {
        let mut user = Config::default();
        user.llms.insert(
            "architect".into(),
            LlmEntry { model: "openai/gpt-4o".into(), ..Default::default() },
        );
        user.llms.insert(
            "extractor".into(),
            LlmEntry { model: "gemini/gemini-2.5-flash".into(), ..Default::default() },
        );

        let mut project = Config::default();
        project.llms.insert(
            "architect".into(),
            LlmEntry { model: "anthropic/claude-sonnet-4-20250514".into(), ..Default::default() },
        );

        let merged = Config::merge(&user, &project);
        assert_eq!(merged.llms["architect"].model, "anthropic/claude-sonnet-4-20250514");
        assert_eq!(merged.llms["extractor"].model, "gemini/gemini-2.5-flash");
    }

    #[test]
    fn split_model_spec_rejects_bare_ids() {
        assert!(split_model_spec("gpt-4o").is_err());
        assert!(split_model_spec("/x").is_err());
        assert!(split_model_spec("openai/").is_err());
        let (p, m) = split_model_spec("openai/gpt-4o-mini").unwrap();
        assert_eq!(p, "openai");
        assert_eq!(m, "gpt-4o-mini");
    }

    #[test]
    fn model_for_role_falls_back() {
        let c = Config::default();
        assert!(c.model_for_role("architect").starts_with("anthropic/"));
        assert!(c.model_for_role("nonsuch").starts_with("openai/"));
    }

    #[test]
    fn load_reads_a_project_file_and_defaults_when_absent() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("config.yaml");
        std::fs::write(&path, "thresholds:\n  pass_score: 9\n").unwrap();

        let c = Config::load(Some(&path)).unwrap();
        assert_eq!(c.thresholds.pass_score, 9.0);

        let missing = Config::load(Some(&tmp.path().join("nope.yaml"))).unwrap();
        assert_eq!(missing.thresholds.pass_score, 7.0);
    }
}
