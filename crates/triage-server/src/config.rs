//! Process configuration, read once from the environment at startup.

use secrecy::SecretString;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use triage_github::{AppCredentials, GITHUB_API_URL};
use triage_runtime::{LoopLimits, DEFAULT_GEMINI_MODEL, DEFAULT_MODEL_TIMEOUT, DEFAULT_TEMPERATURE};

use crate::run_trace::{LangfuseConfig, DEFAULT_LANGFUSE_HOST};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(String),

    #[error("invalid value for {name}: {reason}")]
    Invalid { name: String, reason: String },
}

impl ConfigError {
    fn invalid(name: &str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug)]
pub struct TriageConfig {
    pub listen_addr: SocketAddr,
    pub webhook_secret: SecretString,
    pub app: AppCredentials,
    pub github_api_url: String,
    pub gemini_api_key: SecretString,
    pub llm_model: String,
    pub llm_temperature: f32,
    pub gemini_api_url: Option<String>,
    pub llm_timeout: Duration,
    pub limits: LoopLimits,
    /// Run-trace export, enabled when both Langfuse keys are set.
    pub langfuse: Option<LangfuseConfig>,
}

impl TriageConfig {
    /// Load from the process environment after applying an optional `.env` file.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);

        let port: u16 = env.parsed("PORT", 3000)?;
        let bind: IpAddr = env.parsed("BIND_ADDR", IpAddr::from([0, 0, 0, 0]))?;

        let llm_temperature: f32 = env.parsed("LLM_TEMPERATURE", DEFAULT_TEMPERATURE)?;
        if !(0.0..=2.0).contains(&llm_temperature) {
            return Err(ConfigError::invalid("LLM_TEMPERATURE", "expected a value between 0 and 2"));
        }

        let llm_timeout_secs = env.positive(
            "LLM_TIMEOUT_SECS",
            DEFAULT_MODEL_TIMEOUT.as_secs() as usize,
        )?;

        let langfuse = match (
            env.optional("LANGFUSE_PUBLIC_KEY"),
            env.optional("LANGFUSE_SECRET_KEY"),
        ) {
            (None, None) => None,
            (Some(public_key), Some(secret_key)) => Some(LangfuseConfig {
                public_key,
                secret_key: SecretString::from(secret_key),
                host: env
                    .optional("LANGFUSE_HOST")
                    .unwrap_or_else(|| DEFAULT_LANGFUSE_HOST.to_string()),
            }),
            (Some(_), None) => return Err(ConfigError::Missing("LANGFUSE_SECRET_KEY".into())),
            (None, Some(_)) => return Err(ConfigError::Missing("LANGFUSE_PUBLIC_KEY".into())),
        };

        let limits = LoopLimits {
            max_messages: env.positive("TRIAGE_MAX_MESSAGES", LoopLimits::default().max_messages)?,
            max_steps: env.positive("TRIAGE_MAX_STEPS", LoopLimits::default().max_steps)?,
        };

        Ok(Self {
            listen_addr: SocketAddr::new(bind, port),
            webhook_secret: SecretString::from(env.required("GITHUB_WEBHOOK_SECRET")?),
            app: AppCredentials {
                app_id: env.required("GITHUB_APP_ID")?,
                installation_id: env.required("GITHUB_INSTALLATION_ID")?,
                private_key: SecretString::from(expand_newlines(&env.required("GITHUB_PRIVATE_KEY")?)),
            },
            github_api_url: env.optional("GITHUB_API_URL").unwrap_or_else(|| GITHUB_API_URL.to_string()),
            gemini_api_key: SecretString::from(env.required("GEMINI_API_KEY")?),
            llm_model: env.optional("LLM_MODEL").unwrap_or_else(|| DEFAULT_GEMINI_MODEL.to_string()),
            llm_temperature,
            gemini_api_url: env.optional("GEMINI_API_URL"),
            llm_timeout: Duration::from_secs(llm_timeout_secs as u64),
            limits,
            langfuse,
        })
    }
}

// Keys pasted into a single-line variable carry `\n` literally.
fn expand_newlines(key: &str) -> String {
    key.replace("\\n", "\n")
}

struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn optional(&self, name: &str) -> Option<String> {
        (self.0)(name)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn required(&self, name: &str) -> Result<String, ConfigError> {
        self.optional(name)
            .ok_or_else(|| ConfigError::Missing(name.to_string()))
    }

    fn parsed<T>(&self, name: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.optional(name) {
            Some(raw) => raw
                .parse()
                .map_err(|err: T::Err| ConfigError::invalid(name, format!("{raw:?}: {err}"))),
            None => Ok(default),
        }
    }

    fn positive(&self, name: &str, default: usize) -> Result<usize, ConfigError> {
        let value: usize = self.parsed(name, default)?;
        if value == 0 {
            return Err(ConfigError::invalid(name, "must be at least 1"));
        }
        Ok(value)
    }
}
