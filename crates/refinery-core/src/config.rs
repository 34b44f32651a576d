use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{RefineryError, Result};

/// Top-level Refinery configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub model: ModelConfig,
    #[serde(default)]
    pub fallback_models: Vec<ModelConfig>,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub refine: RefineConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub web_search: Option<WebSearchConfig>,
    #[serde(default)]
    pub panel: PanelConfig,
}

/// Configuration used when no config file exists.
pub const DEFAULT_CONFIG: &str = r#"
[model]
provider = "openai"
model_id = "gpt-4o-mini"
api_key = "${OPENAI_API_KEY}"
"#;

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "Reading config file");
        let content = std::fs::read_to_string(path)
            .map_err(|_| RefineryError::ConfigNotFound(path.display().to_string()))?;
        Self::parse(&content)
    }

    /// Parse config text, expanding `${ENV_VAR}` references first.
    pub fn parse(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        toml::from_str(&expanded).map_err(|e| RefineryError::Config(e.to_string()))
    }

    /// Reject configurations that cannot run. Called before any node executes.
    pub fn validate(&self) -> Result<()> {
        self.model.validate()?;
        for fb in &self.fallback_models {
            fb.validate()?;
        }
        if self.pipeline.stages.is_empty() {
            return Err(RefineryError::Config("pipeline.stages is empty".into()));
        }
        if self.pipeline.max_attempts == 0 {
            return Err(RefineryError::Config(
                "pipeline.max_attempts must be at least 1".into(),
            ));
        }
        if self.pipeline.max_stage_attempts == 0 {
            return Err(RefineryError::Config(
                "pipeline.max_stage_attempts must be at least 1".into(),
            ));
        }
        if self.executor.max_steps == 0 {
            return Err(RefineryError::Config(
                "executor.max_steps must be at least 1".into(),
            ));
        }
        match self.sandbox.mode.as_str() {
            "process" | "docker" => {}
            other => {
                return Err(RefineryError::Config(format!(
                    "unknown sandbox mode '{}'",
                    other
                )))
            }
        }
        if let Some(ws) = &self.web_search {
            if ws.api_key.trim().is_empty() || ws.api_key.starts_with("${") {
                return Err(RefineryError::MissingCredential(ws.provider.clone()));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    pub model_id: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Per-request HTTP timeout.
    #[serde(default = "default_request_timeout")]
    pub timeout_secs: u64,
}

fn default_provider() -> String { "openai".to_string() }
fn default_max_tokens() -> u32 { 4096 }
fn default_temperature() -> f32 { 0.0 }
fn default_request_timeout() -> u64 { 120 }

impl ModelConfig {
    /// Providers that run locally and accept requests without a key.
    fn is_keyless(&self) -> bool {
        matches!(self.provider.as_str(), "ollama" | "vllm" | "local")
    }

    /// The API key, with unresolved `${VAR}` references treated as missing.
    pub fn resolved_api_key(&self) -> Option<&str> {
        self.api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty() && !k.starts_with("${"))
    }

    pub fn validate(&self) -> Result<()> {
        if self.model_id.trim().is_empty() {
            return Err(RefineryError::Config("model.model_id is empty".into()));
        }
        if !self.is_keyless() && self.resolved_api_key().is_none() {
            return Err(RefineryError::MissingCredential(self.provider.clone()));
        }
        Ok(())
    }
}

/// Retry configuration for oracle requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

fn default_max_retries() -> u32 { 3 }
fn default_initial_backoff() -> u64 { 1000 }
fn default_max_backoff() -> u64 { 30000 }

/// Multi-stage artifact pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Stage names in execution order.
    #[serde(default = "default_stages")]
    pub stages: Vec<String>,
    /// Bound on generate/execute attempts inside one stage visit.
    /// 10 suits interactive runs; batch runs typically raise it to 50.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// How many times a stage may be regenerated after critique.
    #[serde(default = "default_max_stage_attempts")]
    pub max_stage_attempts: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stages: default_stages(),
            max_attempts: default_max_attempts(),
            max_stage_attempts: default_max_stage_attempts(),
        }
    }
}

fn default_stages() -> Vec<String> {
    vec!["cleaner".into(), "transformer".into(), "extractor".into()]
}
fn default_max_attempts() -> u32 { 10 }
fn default_max_stage_attempts() -> u32 { 3 }

/// Group → critic → refine loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefineConfig {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
}

impl Default for RefineConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
        }
    }
}

fn default_max_iterations() -> u32 { 3 }

/// How node groups are dispatched.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// One member after another, in declared order.
    #[default]
    Sequential,
    /// Members run concurrently; results are merged in declared order.
    FanOut,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default)]
    pub mode: ExecutionMode,
    /// Upper bound on node executions per invocation.
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::default(),
            max_steps: default_max_steps(),
        }
    }
}

fn default_max_steps() -> usize { 1000 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// "process" runs the interpreter locally; "docker" runs it in a container.
    #[serde(default = "default_sandbox_mode")]
    pub mode: String,
    #[serde(default = "default_interpreter")]
    pub interpreter: String,
    #[serde(default = "default_sandbox_image")]
    pub image: String,
    #[serde(default = "default_sandbox_memory")]
    pub memory_mb: u64,
    #[serde(default = "default_sandbox_timeout")]
    pub timeout_secs: u64,
}

fn default_sandbox_mode() -> String { "process".to_string() }
fn default_interpreter() -> String { "python3".to_string() }
fn default_sandbox_image() -> String { "python:3.12-slim".to_string() }
fn default_sandbox_memory() -> u64 { 512 }
fn default_sandbox_timeout() -> u64 { 60 }

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            mode: default_sandbox_mode(),
            interpreter: default_interpreter(),
            image: default_sandbox_image(),
            memory_mb: default_sandbox_memory(),
            timeout_secs: default_sandbox_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSearchConfig {
    #[serde(default = "default_search_provider")]
    pub provider: String,
    pub api_key: String,
    #[serde(default = "default_search_results")]
    pub max_results: usize,
}

fn default_search_provider() -> String { "tavily".to_string() }
fn default_search_results() -> usize { 5 }

/// Expert panel layout: groups of named experts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PanelConfig {
    #[serde(default = "default_panel_groups")]
    pub groups: Vec<PanelGroupConfig>,
}

impl Default for PanelConfig {
    fn default() -> Self {
        Self {
            groups: default_panel_groups(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PanelGroupConfig {
    pub name: String,
    /// Display title used in prompts. Defaults to `name`.
    #[serde(default)]
    pub title: Option<String>,
    pub experts: Vec<ExpertConfig>,
}

impl PanelGroupConfig {
    pub fn title(&self) -> &str {
        self.title.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpertConfig {
    pub name: String,
    /// System instructions. A generic instruction naming the expert is used when absent.
    #[serde(default)]
    pub instructions: Option<String>,
}

fn group(name: &str, title: &str, experts: &[&str]) -> PanelGroupConfig {
    PanelGroupConfig {
        name: name.to_string(),
        title: Some(title.to_string()),
        experts: experts
            .iter()
            .map(|e| ExpertConfig {
                name: e.to_string(),
                instructions: None,
            })
            .collect(),
    }
}

fn default_panel_groups() -> Vec<PanelGroupConfig> {
    vec![
        group(
            "academic_quantitative",
            "Academic Quantitative",
            &[
                "econometrician",
                "empirical_economist",
                "normative_economist",
                "macroeconomist",
                "microeconomist",
            ],
        ),
        group(
            "behavioral_social",
            "Behavioral Social",
            &["behavioral_economist", "socio_economist"],
        ),
        group(
            "market_business",
            "Market Business",
            &[
                "corporate_management",
                "financial_economist",
                "international_economist",
                "logistics_expert",
                "trade_commerce_expert",
            ],
        ),
        group(
            "policy_innovation",
            "Policy Innovation",
            &[
                "digital_economy_expert",
                "environmental_economist",
                "public_policy_expert",
            ],
        ),
    ]
}

fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Left unexpanded; validate() reports it as a missing credential.
                Err(_) => {
                    debug!(var = %var_name, "Config references an unset environment variable");
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_REFINERY_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_REFINERY_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_REFINERY_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_REFINERY_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_REFINERY_VAR}\"");
    }

    #[test]
    fn test_defaults_from_minimal_toml() {
        let config = AppConfig::parse(
            r#"
[model]
model_id = "gpt-4o-mini"
api_key = "sk-test"
"#,
        )
        .unwrap();
        assert_eq!(config.model.provider, "openai");
        assert_eq!(config.pipeline.stages, vec!["cleaner", "transformer", "extractor"]);
        assert_eq!(config.pipeline.max_attempts, 10);
        assert_eq!(config.pipeline.max_stage_attempts, 3);
        assert_eq!(config.refine.max_iterations, 3);
        assert_eq!(config.executor.mode, ExecutionMode::Sequential);
        assert_eq!(config.executor.max_steps, 1000);
        assert_eq!(config.sandbox.mode, "process");
        assert_eq!(config.panel.groups.len(), 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_credential_is_rejected() {
        let config = AppConfig::parse(
            r#"
[model]
model_id = "gpt-4o-mini"
api_key = "${NONEXISTENT_REFINERY_KEY}"
"#,
        )
        .unwrap();
        assert!(matches!(
            config.validate(),
            Err(RefineryError::MissingCredential(p)) if p == "openai"
        ));
    }

    #[test]
    fn test_local_provider_needs_no_key() {
        let config = AppConfig::parse(
            r#"
[model]
provider = "ollama"
model_id = "llama3"
base_url = "http://localhost:11434/v1/chat/completions"
"#,
        )
        .unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_batch_pipeline_and_fan_out() {
        let config = AppConfig::parse(
            r#"
[model]
model_id = "m"
api_key = "k"

[pipeline]
stages = ["cleaner", "extractor"]
max_attempts = 50

[executor]
mode = "fan_out"
"#,
        )
        .unwrap();
        assert_eq!(config.pipeline.stages, vec!["cleaner", "extractor"]);
        assert_eq!(config.pipeline.max_attempts, 50);
        assert_eq!(config.executor.mode, ExecutionMode::FanOut);
    }

    #[test]
    fn test_invalid_pipeline_values() {
        let mut config = AppConfig::parse("[model]\nmodel_id = \"m\"\napi_key = \"k\"\n").unwrap();
        config.pipeline.max_attempts = 0;
        assert!(config.validate().is_err());

        config.pipeline.max_attempts = 1;
        config.sandbox.mode = "vm".into();
        assert!(config.validate().unwrap_err().to_string().contains("vm"));
    }

    #[test]
    fn test_custom_panel() {
        let config = AppConfig::parse(
            r#"
[model]
model_id = "m"
api_key = "k"

[[panel.groups]]
name = "risk"
experts = [{ name = "actuary", instructions = "Assess tail risk." }, { name = "auditor" }]
"#,
        )
        .unwrap();
        assert_eq!(config.panel.groups.len(), 1);
        let g = &config.panel.groups[0];
        assert_eq!(g.title(), "risk");
        assert_eq!(g.experts[0].instructions.as_deref(), Some("Assess tail risk."));
        assert!(g.experts[1].instructions.is_none());
    }
}
