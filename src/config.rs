//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::durable::RetryPolicy;
use crate::error::ConfigError;
use crate::llm::{DEFAULT_BASE_URL, LlmConfig};
use crate::workflow::WorkflowOptions;

/// Service configuration, read from `AGENT_JOBS_*` environment variables.
#[derive(Debug, Clone)]
pub struct JobsConfig {
    pub db_path: PathBuf,
    /// `ANTHROPIC_API_KEY`. Only the binary requires it.
    pub api_key: Option<SecretString>,
    pub model: String,
    pub llm_base_url: String,
    pub max_tokens: u32,
    /// Step ceiling for the tool loop.
    pub max_steps: u32,
    pub retry: RetryPolicy,
    /// Timeout for every step except execution.
    pub step_timeout: Duration,
    pub execute_timeout: Duration,
    pub http_port: u16,
    /// `None` disables the cron ticker.
    pub cron_interval: Option<Duration>,
    /// Age after which a `running` run is considered orphaned at startup.
    /// Zero means every `running` run, since no other process can own it.
    /// Anything else must outlast the longest possible run.
    pub recover_after: Duration,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/agent-jobs.db"),
            api_key: None,
            model: "claude-sonnet-4-20250514".to_string(),
            llm_base_url: DEFAULT_BASE_URL.to_string(),
            max_tokens: 4096,
            max_steps: 15,
            retry: RetryPolicy::default(),
            step_timeout: Duration::from_secs(300), // 5 minutes
            execute_timeout: Duration::from_secs(600), // 10 minutes
            http_port: 8080,
            cron_interval: Some(Duration::from_secs(60)),
            recover_after: Duration::ZERO,
        }
    }
}

impl JobsConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source. Unset variables take defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let max_attempts: u32 = parse_or(&get, "AGENT_JOBS_MAX_ATTEMPTS", defaults.retry.max_attempts)?;
        if max_attempts == 0 {
            return Err(invalid("AGENT_JOBS_MAX_ATTEMPTS", "must be at least 1"));
        }
        let backoff_coefficient: f64 = parse_or(
            &get,
            "AGENT_JOBS_BACKOFF_COEFFICIENT",
            defaults.retry.backoff_coefficient,
        )?;
        if backoff_coefficient.is_nan() || backoff_coefficient < 1.0 {
            return Err(invalid("AGENT_JOBS_BACKOFF_COEFFICIENT", "must be >= 1.0"));
        }
        let initial_ms: u64 = parse_or(&get, "AGENT_JOBS_BACKOFF_INITIAL_MS", 1000)?;
        let max_ms: u64 = parse_or(&get, "AGENT_JOBS_BACKOFF_MAX_MS", 30_000)?;

        let max_steps: u32 = parse_or(&get, "AGENT_JOBS_MAX_STEPS", defaults.max_steps)?;
        if max_steps == 0 {
            return Err(invalid("AGENT_JOBS_MAX_STEPS", "must be at least 1"));
        }

        let step_secs: u64 = parse_or(&get, "AGENT_JOBS_STEP_TIMEOUT_SECS", 300)?;
        let execute_secs: u64 = parse_or(&get, "AGENT_JOBS_EXECUTE_TIMEOUT_SECS", 600)?;
        if step_secs == 0 || execute_secs == 0 {
            return Err(invalid("AGENT_JOBS_*_TIMEOUT_SECS", "timeouts must be non-zero"));
        }
        let cron_secs: u64 = parse_or(&get, "AGENT_JOBS_CRON_INTERVAL_SECS", 60)?;
        let recover_secs: u64 = parse_or(&get, "AGENT_JOBS_RECOVER_AFTER_SECS", 0)?;

        let config = Self {
            db_path: get("AGENT_JOBS_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            api_key: get("ANTHROPIC_API_KEY").map(SecretString::from),
            model: get("AGENT_JOBS_MODEL").unwrap_or(defaults.model),
            llm_base_url: get("AGENT_JOBS_LLM_BASE_URL").unwrap_or(defaults.llm_base_url),
            max_tokens: parse_or(&get, "AGENT_JOBS_MAX_TOKENS", defaults.max_tokens)?,
            max_steps,
            retry: RetryPolicy {
                max_attempts,
                initial_interval: Duration::from_millis(initial_ms),
                backoff_coefficient,
                max_interval: Duration::from_millis(max_ms),
            },
            step_timeout: Duration::from_secs(step_secs),
            execute_timeout: Duration::from_secs(execute_secs),
            http_port: parse_or(&get, "AGENT_JOBS_HTTP_PORT", defaults.http_port)?,
            cron_interval: (cron_secs > 0).then(|| Duration::from_secs(cron_secs)),
            recover_after: Duration::from_secs(recover_secs),
        };

        let longest_run = config.workflow_options().worst_case_run_duration();
        if !config.recover_after.is_zero() && config.recover_after < longest_run {
            return Err(invalid(
                "AGENT_JOBS_RECOVER_AFTER_SECS",
                &format!(
                    "must be 0 or at least {}s, the longest a run can stay running",
                    longest_run.as_secs()
                ),
            ));
        }
        Ok(config)
    }

    /// Provider settings. Fails when no API key is configured.
    pub fn llm_config(&self) -> Result<LlmConfig, ConfigError> {
        let api_key = self
            .api_key
            .clone()
            .ok_or_else(|| ConfigError::MissingEnvVar("ANTHROPIC_API_KEY".to_string()))?;
        Ok(LlmConfig {
            api_key,
            model: self.model.clone(),
            base_url: self.llm_base_url.clone(),
            max_tokens: self.max_tokens,
        })
    }

    pub fn workflow_options(&self) -> WorkflowOptions {
        WorkflowOptions::new(self.retry.clone(), self.step_timeout, self.execute_timeout)
    }
}

fn parse_or<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match get(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| invalid(key, &e.to_string())),
        None => Ok(default),
    }
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}
