use std::env;
use std::time::Duration;

use crate::error::ConfigError;

pub const DEFAULT_FALLBACK_MESSAGE: &str =
    "Disculpa, no estoy seguro de haber entendido. ¿Puedes decirlo de otra forma o escribir \"operador\" para hablar con una persona?";
pub const DEFAULT_LAB_HOURS: &str =
    "Lunes a viernes de 7:00 a 18:00 y sábados de 7:00 a 12:00 (toma de muestras hasta 10:00).";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Clone)]
pub struct NluConfig {
    pub base_url: String,
    pub api_key: String,
    pub language: String,
    /// Upper bound for one detect-intent call; past it the turn falls back
    /// to local matching.
    pub timeout: Duration,
}

/// Knobs the bot consults on every turn.
#[derive(Debug, Clone)]
pub struct ChatConfig {
    pub confidence_threshold: f64,
    pub fallback_message: String,
    pub lab_hours: String,
    pub booking_lookahead_days: i64,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.7,
            fallback_message: DEFAULT_FALLBACK_MESSAGE.to_string(),
            lab_hours: DEFAULT_LAB_HOURS.to_string(),
            booking_lookahead_days: 14,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub store_backend: StoreBackend,
    pub database_url: String,
    pub nlu: Option<NluConfig>,
    pub chat: ChatConfig,
    /// Shared secret of the external auth service. Empty means dev mode.
    pub identity_secret: String,
    pub notify_webhook_url: Option<String>,
    pub notify_timeout: Duration,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let port = match get("PORT") {
            Some(raw) => raw
                .parse::<u16>()
                .map_err(|_| ConfigError::Invalid { key: "PORT", value: raw })?,
            None => 4000,
        };

        let store_backend = match get("STORE_BACKEND").as_deref() {
            None | Some("postgres") => StoreBackend::Postgres,
            Some("memory") => StoreBackend::Memory,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    key: "STORE_BACKEND",
                    value: other.to_string(),
                })
            }
        };

        let nlu_timeout = millis(&get, "NLU_TIMEOUT_MS", 5_000)?;
        let nlu = get("NLU_URL").map(|base_url| NluConfig {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: get("NLU_API_KEY").unwrap_or_default(),
            language: get("NLU_LANGUAGE").unwrap_or_else(|| "es".to_string()),
            timeout: nlu_timeout,
        });

        let mut chat = ChatConfig::default();
        if let Some(raw) = get("NLU_CONFIDENCE_THRESHOLD") {
            chat.confidence_threshold = raw
                .parse::<f64>()
                .ok()
                .filter(|value| (0.0..=1.0).contains(value))
                .ok_or(ConfigError::Invalid {
                    key: "NLU_CONFIDENCE_THRESHOLD",
                    value: raw,
                })?;
        }
        if let Some(message) = get("BOT_FALLBACK_MESSAGE") {
            chat.fallback_message = message;
        }
        if let Some(hours) = get("LAB_HOURS") {
            chat.lab_hours = hours;
        }
        if let Some(raw) = get("BOOKING_LOOKAHEAD_DAYS") {
            chat.booking_lookahead_days = raw
                .parse::<i64>()
                .ok()
                .filter(|days| *days > 0)
                .ok_or(ConfigError::Invalid {
                    key: "BOOKING_LOOKAHEAD_DAYS",
                    value: raw,
                })?;
        }

        Ok(Self {
            port,
            store_backend,
            database_url: resolve_database_url(&get),
            nlu,
            chat,
            identity_secret: get("IDENTITY_SECRET").unwrap_or_default(),
            notify_webhook_url: get("NOTIFY_WEBHOOK_URL"),
            notify_timeout: millis(&get, "NOTIFY_TIMEOUT_MS", 3_000)?,
        })
    }
}

fn millis(
    get: &dyn Fn(&str) -> Option<String>,
    key: &'static str,
    default: u64,
) -> Result<Duration, ConfigError> {
    match get(key) {
        Some(raw) => raw
            .parse::<u64>()
            .ok()
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .ok_or(ConfigError::Invalid { key, value: raw }),
        None => Ok(Duration::from_millis(default)),
    }
}

fn resolve_database_url(get: &dyn Fn(&str) -> Option<String>) -> String {
    if let Some(url) = get("DATABASE_URL") {
        return url;
    }
    let host = get("POSTGRES_HOST")
        .or_else(|| get("PGHOST"))
        .unwrap_or_else(|| "localhost".to_string());
    let port = get("POSTGRES_PORT")
        .or_else(|| get("PGPORT"))
        .unwrap_or_else(|| "5432".to_string());
    let user = get("POSTGRES_USER")
        .or_else(|| get("PGUSER"))
        .unwrap_or_else(|| "postgres".to_string());
    let password = get("POSTGRES_PASSWORD")
        .or_else(|| get("PGPASSWORD"))
        .unwrap_or_default();
    let db = get("POSTGRES_DB")
        .or_else(|| get("PGDATABASE"))
        .unwrap_or_else(|| "lab_chat".to_string());
    format!("postgres://{user}:{password}@{host}:{port}/{db}")
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from(pairs: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let vars = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>();
        AppConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.port, 4000);
        assert_eq!(config.store_backend, StoreBackend::Postgres);
        assert!(config.nlu.is_none());
        assert_eq!(config.chat.confidence_threshold, 0.7);
        assert_eq!(config.chat.booking_lookahead_days, 14);
        assert_eq!(
            config.database_url,
            "postgres://postgres:@localhost:5432/lab_chat"
        );
    }

    #[test]
    fn database_url_wins_over_parts() {
        let config = config_from(&[
            ("DATABASE_URL", "postgres://a:b@db/lab"),
            ("POSTGRES_HOST", "ignored"),
        ])
        .unwrap();
        assert_eq!(config.database_url, "postgres://a:b@db/lab");
    }

    #[test]
    fn nlu_section_and_threshold() {
        let config = config_from(&[
            ("NLU_URL", "https://nlu.example.com/v1/"),
            ("NLU_API_KEY", "k"),
            ("NLU_CONFIDENCE_THRESHOLD", "0.55"),
        ])
        .unwrap();
        let nlu = config.nlu.unwrap();
        assert_eq!(nlu.base_url, "https://nlu.example.com/v1");
        assert_eq!(nlu.language, "es");
        assert_eq!(nlu.timeout, Duration::from_secs(5));
        assert_eq!(config.chat.confidence_threshold, 0.55);
    }

    #[test]
    fn outbound_timeouts_are_configurable() {
        let config = config_from(&[
            ("NLU_URL", "https://nlu.example.com"),
            ("NLU_TIMEOUT_MS", "1500"),
            ("NOTIFY_TIMEOUT_MS", "250"),
        ])
        .unwrap();
        assert_eq!(config.nlu.unwrap().timeout, Duration::from_millis(1500));
        assert_eq!(config.notify_timeout, Duration::from_millis(250));
        assert!(config_from(&[("NLU_TIMEOUT_MS", "0")]).is_err());
        assert!(config_from(&[("NOTIFY_TIMEOUT_MS", "soon")]).is_err());
    }

    #[test]
    fn rejects_out_of_range_threshold() {
        let err = config_from(&[("NLU_CONFIDENCE_THRESHOLD", "1.5")]).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                key: "NLU_CONFIDENCE_THRESHOLD",
                ..
            }
        ));
    }

    #[test]
    fn rejects_unknown_backend_and_bad_port() {
        assert!(config_from(&[("STORE_BACKEND", "redis")]).is_err());
        assert!(config_from(&[("PORT", "http")]).is_err());
        let memory = config_from(&[("STORE_BACKEND", "memory")]).unwrap();
        assert_eq!(memory.store_backend, StoreBackend::Memory);
    }
}
