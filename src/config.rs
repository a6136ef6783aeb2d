use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use crate::agent::{AgentConfig, AgentError};
use crate::browser::BrowserConfig;
use crate::gemini::GeminiConfig;
use crate::policy::PolicyConfig;

/// Smallest page budget that still leaves room for a useful reduction.
pub const MIN_CHARS_PER_CHUNK: usize = 256;

#[derive(Debug, Clone)]
pub struct Config {
    pub agent: AgentConfig,
    pub browser: BrowserConfig,
    pub gemini: GeminiConfig,
    pub policy: PolicyConfig,
    pub server: ServerConfig,
    /// Run history and screenshots are persisted here when set.
    pub runs_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub max_concurrent_runs: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: env_or("CART_PILOT_BIND", "127.0.0.1:8000".to_string()),
            max_concurrent_runs: env_or("CART_PILOT_MAX_CONCURRENT_RUNS", 2),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            agent: AgentConfig::default(),
            browser: BrowserConfig::default(),
            gemini: GeminiConfig::default(),
            policy: PolicyConfig::default(),
            server: ServerConfig::default(),
            runs_dir: env::var("CART_PILOT_RUNS_DIR")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::default()
    }

    pub fn validate(&self) -> Result<(), AgentError> {
        if self.agent.max_steps == 0 {
            return Err(AgentError::Config("MAX_STEPS must be at least 1".into()));
        }
        if self.agent.max_chars_per_chunk < MIN_CHARS_PER_CHUNK {
            return Err(AgentError::Config(format!(
                "MAX_CHARS_PER_CHUNK must be at least {MIN_CHARS_PER_CHUNK}"
            )));
        }
        if self.agent.retry.max_attempts == 0 {
            return Err(AgentError::Config(
                "CART_PILOT_MODEL_ATTEMPTS must be at least 1".into(),
            ));
        }
        if self.policy.allowed_domains.is_empty() {
            return Err(AgentError::Config(
                "CART_PILOT_ALLOWED_DOMAINS must name at least one domain".into(),
            ));
        }
        if self.server.max_concurrent_runs == 0 {
            return Err(AgentError::Config(
                "CART_PILOT_MAX_CONCURRENT_RUNS must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Parses `key` from the environment, falling back to `default` when unset or invalid.
pub(crate) fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

pub(crate) fn env_flag(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

pub(crate) fn env_list(key: &str, default: &[&str]) -> Vec<String> {
    match env::var(key) {
        Ok(v) if !v.trim().is_empty() => v
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        _ => default.iter().map(|s| s.to_string()).collect(),
    }
}
