// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use crate::error::{JudgeError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Connection and default sampling configuration for a judge
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JudgeConfig {
    /// Inference endpoint root (e.g., "http://localhost:8000")
    pub base_url: String,

    /// Model identifier; auto-detected from the endpoint when absent
    #[serde(default)]
    pub model: Option<String>,

    #[serde(default = "default_api_key")]
    pub api_key: String,

    /// Use /v1/chat/completions instead of /v1/completions
    #[serde(default = "default_use_chat_api")]
    pub use_chat_api: bool,

    /// Per-request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: f64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay for exponential backoff between retries
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: f64,

    #[serde(default)]
    pub temperature: f64,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Maximum in-flight model calls during batch evaluation
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

fn default_base_url() -> String {
    "http://localhost:8000".to_string()
}

fn default_api_key() -> String {
    "dummy".to_string()
}

fn default_use_chat_api() -> bool {
    true
}

fn default_timeout_secs() -> f64 {
    30.0
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_secs() -> f64 {
    1.0
}

fn default_max_tokens() -> u32 {
    256
}

fn default_max_concurrent() -> usize {
    50
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: None,
            api_key: default_api_key(),
            use_chat_api: default_use_chat_api(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            retry_delay_secs: default_retry_delay_secs(),
            temperature: 0.0,
            max_tokens: default_max_tokens(),
            max_concurrent: default_max_concurrent(),
        }
    }
}

/// Validate the scheme and strip a trailing slash and `/v1` suffix
pub fn normalize_base_url(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    if !(trimmed.starts_with("http://") || trimmed.starts_with("https://")) {
        return Err(JudgeError::Configuration(
            "base_url must start with http:// or https://".to_string(),
        ));
    }
    url::Url::parse(trimmed)
        .map_err(|e| JudgeError::Configuration(format!("invalid base_url '{}': {}", trimmed, e)))?;

    let mut url = trimmed.trim_end_matches('/').to_string();
    if let Some(stripped) = url.strip_suffix("/v1") {
        url = stripped.to_string();
    }
    Ok(url)
}

fn check_seconds(field: &str, secs: f64) -> Result<()> {
    if secs.is_finite() && secs >= 0.0 {
        Ok(())
    } else {
        Err(JudgeError::Configuration(format!(
            "{} must be a finite, non-negative number of seconds (got {})",
            field, secs
        )))
    }
}

impl JudgeConfig {
    /// Create a config for an endpoint, validating the URL
    pub fn new(base_url: impl AsRef<str>, model: Option<String>) -> Result<Self> {
        let config = Self {
            base_url: base_url.as_ref().to_string(),
            model,
            ..Self::default()
        };
        config.normalized()
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_timeout(mut self, secs: f64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_retry_delay(mut self, secs: f64) -> Self {
        self.retry_delay_secs = secs;
        self
    }

    pub fn with_chat_api(mut self, enabled: bool) -> Self {
        self.use_chat_api = enabled;
        self
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    /// Re-run URL normalization and range checks, returning the cleaned config
    pub fn normalized(mut self) -> Result<Self> {
        self.base_url = normalize_base_url(&self.base_url)?;
        check_seconds("timeout_secs", self.timeout_secs)?;
        check_seconds("retry_delay_secs", self.retry_delay_secs)?;
        Ok(self)
    }

    /// Default sampling overlay sent with every request
    pub fn sampling_params(&self) -> Map<String, Value> {
        let mut params = Map::new();
        params.insert("temperature".to_string(), json!(self.temperature));
        params.insert("max_tokens".to_string(), json!(self.max_tokens));
        params
    }

    pub fn timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.timeout_secs)
            .unwrap_or_else(|_| Duration::from_secs_f64(default_timeout_secs()))
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            JudgeError::Configuration(format!("failed to read {}: {}", path.display(), e))
        })?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| JudgeError::Configuration(format!("invalid config file: {}", e)))?;
        config.normalized()
    }

    /// Load configuration from environment variables
    ///
    /// Supported environment variables:
    /// - VLLM_JUDGE_BASE_URL: Endpoint root (default: http://localhost:8000)
    /// - VLLM_JUDGE_MODEL: Model identifier (default: auto-detect)
    /// - VLLM_JUDGE_API_KEY: Bearer token (default: dummy)
    /// - VLLM_JUDGE_TIMEOUT: Request timeout in seconds (default: 30)
    /// - VLLM_JUDGE_MAX_CONCURRENT: Batch concurrency cap (default: 50)
    /// - VLLM_JUDGE_MAX_RETRIES: Retry attempts (default: 3)
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env();
        config.normalized()
    }

    /// Load configuration with priority: file > env > defaults
    pub fn load(config_file: Option<PathBuf>) -> Result<Self> {
        let mut config = Self::default();
        config.apply_env();

        if let Some(path) = config_file {
            if path.exists() {
                tracing::info!("Loading configuration from file: {:?}", path);
                config = Self::from_file(&path)?;
            } else {
                tracing::warn!("Config file not found: {:?}, using environment", path);
            }
        }

        config.normalized()
    }

    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("VLLM_JUDGE_BASE_URL") {
            self.base_url = url;
        }

        if let Ok(model) = std::env::var("VLLM_JUDGE_MODEL") {
            if !model.is_empty() {
                self.model = Some(model);
            }
        }

        if let Ok(key) = std::env::var("VLLM_JUDGE_API_KEY") {
            self.api_key = key;
        }

        if let Ok(timeout) = std::env::var("VLLM_JUDGE_TIMEOUT") {
            if let Ok(val) = timeout.parse() {
                self.timeout_secs = val;
            }
        }

        if let Ok(max) = std::env::var("VLLM_JUDGE_MAX_CONCURRENT") {
            if let Ok(val) = max.parse() {
                self.max_concurrent = val;
            }
        }

        if let Ok(retries) = std::env::var("VLLM_JUDGE_MAX_RETRIES") {
            if let Ok(val) = retries.parse() {
                self.max_retries = val;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = JudgeConfig::default();
        assert_eq!(config.api_key, "dummy");
        assert!(config.use_chat_api);
        assert_eq!(config.max_tokens, 256);
        assert_eq!(config.max_concurrent, 50);
    }

    #[test]
    fn test_url_normalization() {
        let config = JudgeConfig::new("http://localhost:8000/v1/", None).unwrap();
        assert_eq!(config.base_url, "http://localhost:8000");

        let config = JudgeConfig::new("https://judge.example.com/", None).unwrap();
        assert_eq!(config.base_url, "https://judge.example.com");
    }

    #[test]
    fn test_url_without_scheme_rejected() {
        let err = JudgeConfig::new("localhost:8000", None).unwrap_err();
        assert!(matches!(err, JudgeError::Configuration(_)));
    }

    #[test]
    fn test_non_finite_durations_rejected() {
        let base = JudgeConfig::new("http://localhost:8000", None).unwrap();

        let err = base.clone().with_timeout(f64::INFINITY).normalized().unwrap_err();
        assert!(err.to_string().contains("timeout_secs"));
        assert!(base.clone().with_timeout(-1.0).normalized().is_err());
        assert!(base.clone().with_retry_delay(f64::NAN).normalized().is_err());

        let config = base.with_timeout(2.5).normalized().unwrap();
        assert_eq!(config.timeout(), Duration::from_millis(2500));
    }

    #[test]
    fn test_sampling_params() {
        let params = JudgeConfig::default().sampling_params();
        assert_eq!(params["temperature"], json!(0.0));
        assert_eq!(params["max_tokens"], json!(256));
    }

    #[test]
    fn test_from_file() {
        let path = std::env::temp_dir().join("vllm_judge_config_test.toml");
        std::fs::write(
            &path,
            "base_url = \"http://vllm.internal:8080/v1\"\nmodel = \"qwen2\"\nmax_concurrent = 8\n",
        )
        .unwrap();

        let config = JudgeConfig::from_file(&path).unwrap();
        assert_eq!(config.base_url, "http://vllm.internal:8080");
        assert_eq!(config.model.as_deref(), Some("qwen2"));
        assert_eq!(config.max_concurrent, 8);
        assert_eq!(config.timeout_secs, 30.0);

        std::fs::remove_file(&path).ok();
    }
}
