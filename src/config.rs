//! Configuration types, built from environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;
use tracing::warn;

use crate::error::ConfigError;

/// Default model used for proposal analysis.
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";

/// Top-level engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub database_path: PathBuf,
    /// Daily-rotated log files are written here when set.
    pub log_dir: Option<PathBuf>,
    /// `None` when mailbox credentials are incomplete; ingestion is disabled.
    pub mailbox: Option<MailboxConfig>,
    pub llm: LlmConfig,
    pub analysis: AnalysisConfig,
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let database_path = lookup("RFP_ENGINE_DB_PATH")
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./data/rfp-engine.db"));
        let log_dir = lookup("RFP_ENGINE_LOG_DIR")
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from);

        Ok(Self {
            database_path,
            log_dir,
            mailbox: MailboxConfig::from_lookup(&lookup)?,
            llm: LlmConfig::from_lookup(&lookup)?,
            analysis: AnalysisConfig::from_lookup(&lookup)?,
        })
    }
}

// ── Mailbox ─────────────────────────────────────────────────────────

/// IMAP mailbox polling configuration.
#[derive(Debug, Clone)]
pub struct MailboxConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    /// Folder to poll.
    pub folder: String,
    pub poll_interval: Duration,
}

impl MailboxConfig {
    pub fn new(
        host: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port: 993,
            username: username.into(),
            password: SecretString::from(password.into()),
            folder: "INBOX".to_string(),
            poll_interval: Duration::from_secs(60),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Returns `Ok(None)` if host, user, or password is missing.
    pub fn from_lookup(
        lookup: &impl Fn(&str) -> Option<String>,
    ) -> Result<Option<Self>, ConfigError> {
        let host = non_empty(lookup("IMAP_HOST"));
        let username = non_empty(lookup("IMAP_USER"));
        let password = non_empty(lookup("IMAP_PASSWORD"));

        let (Some(host), Some(username), Some(password)) = (host, username, password) else {
            warn!("IMAP_HOST, IMAP_USER or IMAP_PASSWORD not set; mailbox polling disabled");
            return Ok(None);
        };

        let port: u16 = parse_or(lookup, "IMAP_PORT", 993)?;
        let interval_ms: u64 = parse_or(lookup, "IMAP_POLL_INTERVAL_MS", 60_000)?;
        if interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "IMAP_POLL_INTERVAL_MS".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        let folder = non_empty(lookup("IMAP_FOLDER")).unwrap_or_else(|| "INBOX".to_string());

        Ok(Some(Self {
            host,
            port,
            username,
            password: SecretString::from(password),
            folder,
            poll_interval: Duration::from_millis(interval_ms),
        }))
    }
}

// ── LLM ─────────────────────────────────────────────────────────────

/// Which provider the analyzer talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmBackend {
    Anthropic,
    OpenAi,
}

impl LlmBackend {
    /// Environment variable holding the API key for this backend.
    pub fn api_key_var(&self) -> &'static str {
        match self {
            Self::Anthropic => "ANTHROPIC_API_KEY",
            Self::OpenAi => "OPENAI_API_KEY",
        }
    }
}

impl std::fmt::Display for LlmBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Anthropic => write!(f, "anthropic"),
            Self::OpenAi => write!(f, "openai"),
        }
    }
}

impl FromStr for LlmBackend {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "anthropic" => Ok(Self::Anthropic),
            "openai" => Ok(Self::OpenAi),
            other => Err(format!("unknown LLM backend '{other}'")),
        }
    }
}

/// LLM provider configuration.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub backend: LlmBackend,
    pub api_key: SecretString,
    pub model: String,
}

impl LlmConfig {
    pub fn from_lookup(lookup: &impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let backend = match non_empty(lookup("RFP_ENGINE_LLM_BACKEND")) {
            Some(raw) => raw.parse().map_err(|message| ConfigError::InvalidValue {
                key: "RFP_ENGINE_LLM_BACKEND".to_string(),
                message,
            })?,
            None => LlmBackend::Anthropic,
        };

        let key_var = backend.api_key_var();
        let api_key = non_empty(lookup(key_var))
            .ok_or_else(|| ConfigError::MissingEnvVar(key_var.to_string()))?;

        let model = non_empty(lookup("RFP_ENGINE_MODEL")).unwrap_or_else(|| DEFAULT_MODEL.to_string());

        Ok(Self {
            backend,
            api_key: SecretString::from(api_key),
            model,
        })
    }
}

// ── Analysis ────────────────────────────────────────────────────────

/// Background analysis settings.
#[derive(Debug, Clone)]
pub struct AnalysisConfig {
    /// Number of concurrent analysis workers.
    pub workers: usize,
    /// Jobs beyond this many waiting are rejected.
    pub queue_capacity: usize,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            queue_capacity: 64,
            max_tokens: 2000,
            temperature: 0.2,
        }
    }
}

impl AnalysisConfig {
    pub fn from_lookup(lookup: &impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            workers: parse_or(lookup, "ANALYSIS_WORKERS", defaults.workers)?,
            queue_capacity: parse_or(lookup, "ANALYSIS_QUEUE_CAPACITY", defaults.queue_capacity)?,
            max_tokens: parse_or(lookup, "ANALYSIS_MAX_TOKENS", defaults.max_tokens)?,
            temperature: parse_or(lookup, "ANALYSIS_TEMPERATURE", defaults.temperature)?,
        };

        if config.workers == 0 {
            return Err(ConfigError::InvalidValue {
                key: "ANALYSIS_WORKERS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if config.queue_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                key: "ANALYSIS_QUEUE_CAPACITY".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        Ok(config)
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn parse_or<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match non_empty(lookup(key)) {
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use secrecy::ExposeSecret;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_with_only_api_key() {
        let config = EngineConfig::from_lookup(lookup_from(&[("ANTHROPIC_API_KEY", "sk-test")])).unwrap();
        assert_eq!(config.database_path, PathBuf::from("./data/rfp-engine.db"));
        assert!(config.mailbox.is_none());
        assert_eq!(config.llm.backend, LlmBackend::Anthropic);
        assert_eq!(config.llm.model, DEFAULT_MODEL);
        assert_eq!(config.llm.api_key.expose_secret(), "sk-test");
        assert_eq!(config.analysis.workers, 2);
        assert_eq!(config.analysis.max_tokens, 2000);
    }

    #[test]
    fn missing_api_key_is_an_error() {
        let err = EngineConfig::from_lookup(lookup_from(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(ref v) if v == "ANTHROPIC_API_KEY"));
    }

    #[test]
    fn openai_backend_reads_its_own_key() {
        let config = LlmConfig::from_lookup(&lookup_from(&[
            ("RFP_ENGINE_LLM_BACKEND", "OpenAI"),
            ("OPENAI_API_KEY", "sk-oa"),
            ("RFP_ENGINE_MODEL", "gpt-4o"),
        ]))
        .unwrap();
        assert_eq!(config.backend, LlmBackend::OpenAi);
        assert_eq!(config.model, "gpt-4o");
    }

    #[test]
    fn mailbox_requires_all_credentials() {
        let partial = MailboxConfig::from_lookup(&lookup_from(&[
            ("IMAP_HOST", "imap.example.com"),
            ("IMAP_USER", "rfp@example.com"),
        ]))
        .unwrap();
        assert!(partial.is_none());

        let full = MailboxConfig::from_lookup(&lookup_from(&[
            ("IMAP_HOST", "imap.example.com"),
            ("IMAP_USER", "rfp@example.com"),
            ("IMAP_PASSWORD", "hunter2"),
            ("IMAP_POLL_INTERVAL_MS", "5000"),
        ]))
        .unwrap()
        .unwrap();
        assert_eq!(full.port, 993);
        assert_eq!(full.folder, "INBOX");
        assert_eq!(full.poll_interval, Duration::from_secs(5));
    }

    #[test]
    fn invalid_numbers_are_rejected() {
        let err = AnalysisConfig::from_lookup(&lookup_from(&[("ANALYSIS_WORKERS", "many")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "ANALYSIS_WORKERS"));

        let err = AnalysisConfig::from_lookup(&lookup_from(&[("ANALYSIS_QUEUE_CAPACITY", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }
}
