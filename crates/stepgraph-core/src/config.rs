use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, StepGraphError};

/// Top-level StepGraph configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub model: ModelConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub checkpoint: Option<CheckpointConfig>,
    #[serde(default)]
    pub agents: AgentsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    pub model_id: String,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Full chat-completions URL for OpenAI-compatible providers.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Azure resource endpoint, e.g. `https://myres.openai.azure.com`.
    #[serde(default)]
    pub azure_endpoint: Option<String>,
    #[serde(default)]
    pub azure_deployment: Option<String>,
    #[serde(default)]
    pub azure_api_version: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

fn default_provider() -> String { "openai".to_string() }
fn default_max_tokens() -> u32 { 4096 }
fn default_temperature() -> f32 { 0.0 }

/// Retry configuration for model requests.
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

/// Execution budgets and concurrency limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Maximum node steps per run before `RecursionLimitExceeded`.
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    /// Maximum propose/execute iterations inside one tool loop node.
    #[serde(default = "default_max_tool_iterations")]
    pub max_tool_iterations: usize,
    /// Maximum concurrently running fan-out children.
    #[serde(default = "default_fanout_concurrency")]
    pub fanout_concurrency: usize,
    /// Run the tool calls of one batch concurrently.
    #[serde(default = "default_parallel_tools")]
    pub parallel_tools: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            max_tool_iterations: default_max_tool_iterations(),
            fanout_concurrency: default_fanout_concurrency(),
            parallel_tools: default_parallel_tools(),
        }
    }
}

fn default_max_steps() -> usize { 30 }
fn default_max_tool_iterations() -> usize { 10 }
fn default_fanout_concurrency() -> usize { 8 }
fn default_parallel_tools() -> bool { true }

/// Checkpoint / resume configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Enable checkpointing (default: true when section is present).
    #[serde(default = "default_checkpoint_enabled")]
    pub enabled: bool,
    /// SQLite file for snapshots. Default: ~/.stepgraph/checkpoints.db
    #[serde(default)]
    pub path: Option<String>,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
        }
    }
}

fn default_checkpoint_enabled() -> bool { true }

impl CheckpointConfig {
    /// Resolve the database path (expand ~).
    pub fn db_path(&self) -> PathBuf {
        match self.path.as_deref() {
            Some(p) => expand_home(p),
            None => dirs_home()
                .map(|h| h.join(".stepgraph"))
                .unwrap_or_else(|| PathBuf::from(".stepgraph"))
                .join("checkpoints.db"),
        }
    }
}

/// Settings shared by the built-in agent templates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentsConfig {
    /// System preamble prepended to model requests.
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Reply that ends a human review loop (case/whitespace-insensitive).
    #[serde(default = "default_review_terminal_token")]
    pub review_terminal_token: String,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            system_prompt: None,
            review_terminal_token: default_review_terminal_token(),
        }
    }
}

fn default_review_terminal_token() -> String { "end".to_string() }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| StepGraphError::ConfigNotFound(path.display().to_string()))?;

        Self::parse(&content)
    }

    /// Parse config from TOML text, with env var expansion.
    pub fn parse(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        let config: Self =
            toml::from_str(&expanded).map_err(|e| StepGraphError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.executor.max_steps == 0 {
            return Err(StepGraphError::Config("executor.max_steps must be at least 1".into()));
        }
        if self.executor.max_tool_iterations == 0 {
            return Err(StepGraphError::Config(
                "executor.max_tool_iterations must be at least 1".into(),
            ));
        }
        if self.executor.fanout_concurrency == 0 {
            return Err(StepGraphError::Config(
                "executor.fanout_concurrency must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
