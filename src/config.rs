//! Configuration types.
//!
//! Everything is read from the environment once at startup. Defaults match
//! the production deployment; only provider keys are mandatory in practice.

use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::llm::{LlmBackend, LlmConfig};

const DEFAULT_ANTHROPIC_MODEL: &str = "claude-sonnet-4-20250514";
const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";

/// Core configuration.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Idle time after which a session (and any sticky handler) expires.
    pub session_timeout: Duration,
    /// Classifications at or below this confidence get a clarification reply.
    pub confidence_threshold: f64,
    /// Image classifications below this confidence get the unsupported-image menu.
    pub image_confidence_threshold: f64,
    /// Number of recent messages served as short-term memory.
    pub short_term_window: usize,
    /// Per-call timeout for intent and field classification.
    pub classifier_timeout: Duration,
    /// Per-call timeout for consultation and vision calls.
    pub generation_timeout: Duration,
    /// Providers in priority order.
    pub providers: Vec<LlmConfig>,
    /// libSQL database file.
    pub db_path: String,
    /// Port for the HTTP surface.
    pub http_port: u16,
    /// Telegram bot token; the Telegram transport is off when unset.
    pub telegram_bot_token: Option<SecretString>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            session_timeout: Duration::from_secs(60 * 60),
            confidence_threshold: 0.3,
            image_confidence_threshold: 0.5,
            short_term_window: 5,
            classifier_timeout: Duration::from_secs(10),
            generation_timeout: Duration::from_secs(30),
            providers: Vec::new(),
            db_path: "./data/coach.db".to_string(),
            http_port: 8080,
            telegram_bot_token: None,
        }
    }
}

impl CoreConfig {
    /// Build a configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let session_timeout = match lookup("COACH_SESSION_TIMEOUT_MIN") {
            Some(raw) => Duration::from_secs(parse_number::<u64>("COACH_SESSION_TIMEOUT_MIN", &raw)? * 60),
            None => defaults.session_timeout,
        };

        let confidence_threshold = match lookup("COACH_CONFIDENCE_THRESHOLD") {
            Some(raw) => parse_unit_interval("COACH_CONFIDENCE_THRESHOLD", &raw)?,
            None => defaults.confidence_threshold,
        };

        let image_confidence_threshold = match lookup("COACH_IMAGE_CONFIDENCE_THRESHOLD") {
            Some(raw) => parse_unit_interval("COACH_IMAGE_CONFIDENCE_THRESHOLD", &raw)?,
            None => defaults.image_confidence_threshold,
        };

        let short_term_window = match lookup("COACH_SHORT_TERM_WINDOW") {
            Some(raw) => {
                let n = parse_number::<usize>("COACH_SHORT_TERM_WINDOW", &raw)?;
                if n == 0 {
                    return Err(ConfigError::InvalidValue {
                        key: "COACH_SHORT_TERM_WINDOW".into(),
                        message: "must be at least 1".into(),
                    });
                }
                n
            }
            None => defaults.short_term_window,
        };

        let http_port = match lookup("COACH_HTTP_PORT") {
            Some(raw) => parse_number::<u16>("COACH_HTTP_PORT", &raw)?,
            None => defaults.http_port,
        };

        let providers = parse_providers(&lookup)?;

        Ok(Self {
            session_timeout,
            confidence_threshold,
            image_confidence_threshold,
            short_term_window,
            providers,
            db_path: lookup("COACH_DB_PATH").unwrap_or(defaults.db_path),
            http_port,
            telegram_bot_token: lookup("TELEGRAM_BOT_TOKEN")
                .filter(|t| !t.trim().is_empty())
                .map(SecretString::from),
            ..defaults
        })
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse::<T>().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("'{raw}' is not a valid number"),
    })
}

fn parse_unit_interval(key: &str, raw: &str) -> Result<f64, ConfigError> {
    let value = parse_number::<f64>(key, raw)?;
    if !(0.0..=1.0).contains(&value) {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{value} is outside 0.0..=1.0"),
        });
    }
    Ok(value)
}

/// Resolve `COACH_PROVIDERS` (default `anthropic,openai`) into ordered
/// provider configs. Providers without an API key are skipped.
fn parse_providers<F>(lookup: &F) -> Result<Vec<LlmConfig>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let order = lookup("COACH_PROVIDERS").unwrap_or_else(|| "anthropic,openai".to_string());

    let mut providers = Vec::new();
    for name in order.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let backend: LlmBackend = name.parse().map_err(|_| ConfigError::InvalidValue {
            key: "COACH_PROVIDERS".into(),
            message: format!("unknown provider '{name}'"),
        })?;

        let (key_var, model_var, default_model) = match backend {
            LlmBackend::Anthropic => ("ANTHROPIC_API_KEY", "COACH_ANTHROPIC_MODEL", DEFAULT_ANTHROPIC_MODEL),
            LlmBackend::OpenAi => ("OPENAI_API_KEY", "COACH_OPENAI_MODEL", DEFAULT_OPENAI_MODEL),
        };

        let Some(api_key) = lookup(key_var).filter(|k| !k.trim().is_empty()) else {
            tracing::warn!(provider = name, "{key_var} not set; provider skipped");
            continue;
        };

        providers.push(LlmConfig {
            backend,
            api_key: SecretString::from(api_key),
            model: lookup(model_var).unwrap_or_else(|| default_model.to_string()),
        });
    }

    Ok(providers)
}
