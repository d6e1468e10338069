use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Production,
}

impl Environment {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "production" | "prod" => Some(Self::Production),
            "development" | "dev" => Some(Self::Development),
            _ => None,
        }
    }

    pub fn is_production(self) -> bool {
        self == Self::Production
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct PollSettings {
    pub interval_ms: Option<u64>,
    pub max_wait_secs: Option<u64>,
    pub retry_budget: Option<u32>,
}

/// Values baked into the binary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConfigDefaults {
    pub api_base_url: Option<String>,
    pub environment: Environment,
    pub poll: PollSettings,
    pub response_cache: bool,
    pub metrics: bool,
}

impl Default for ConfigDefaults {
    fn default() -> Self {
        Self {
            api_base_url: Some("http://127.0.0.1:8000".into()),
            environment: Environment::Development,
            poll: PollSettings {
                interval_ms: Some(1500),
                max_wait_secs: Some(60),
                retry_budget: Some(5),
            },
            response_cache: true,
            metrics: true,
        }
    }
}

/// Values read from the process environment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct EnvSettings {
    pub api_base_url: Option<String>,
    pub environment: Option<Environment>,
    pub poll: Option<PollSettings>,
    pub response_cache: Option<bool>,
    pub metrics: Option<bool>,
}

impl EnvSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let poll = PollSettings {
            interval_ms: lookup("CHAT_POLL_INTERVAL_MS").and_then(|v| v.parse().ok()),
            max_wait_secs: lookup("CHAT_POLL_MAX_WAIT_SECS").and_then(|v| v.parse().ok()),
            retry_budget: lookup("CHAT_POLL_RETRY_BUDGET").and_then(|v| v.parse().ok()),
        };
        Self {
            api_base_url: lookup("ASSISTANT_API_BASE_URL")
                .filter(|v| !v.trim().is_empty())
                .or_else(|| lookup("API_BASE_URL").filter(|v| !v.trim().is_empty())),
            environment: lookup("APP_ENV").as_deref().and_then(Environment::parse),
            poll: (poll != PollSettings::default()).then_some(poll),
            response_cache: lookup("RESPONSE_CACHE").as_deref().and_then(parse_flag),
            metrics: lookup("METRICS").as_deref().and_then(parse_flag),
        }
    }
}

/// Values passed on the command line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct CliOverrides {
    pub api_base_url: Option<String>,
    pub environment: Option<Environment>,
    pub poll: Option<PollSettings>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectiveSettings {
    pub api_base_url: String,
    pub environment: Environment,
    pub poll_interval: Duration,
    pub poll_max_wait: Duration,
    pub poll_retry_budget: u32,
    pub response_cache: bool,
    pub metrics: bool,
}

impl EffectiveSettings {
    /// Filter used when `RUST_LOG` is not set.
    pub fn default_log_filter(&self) -> &'static str {
        if self.environment.is_production() { "info" } else { "debug" }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("no backend base URL configured (set ASSISTANT_API_BASE_URL or API_BASE_URL)")]
    MissingBaseUrl,
    #[error("invalid backend base URL {url:?}: {source}")]
    InvalidBaseUrl { url: String, source: url::ParseError },
}

pub fn resolve_effective_settings(
    defaults: &ConfigDefaults,
    env: &EnvSettings,
    cli: &CliOverrides,
) -> Result<EffectiveSettings, SettingsError> {
    let api_base_url = cli
        .api_base_url
        .clone()
        .or_else(|| env.api_base_url.clone())
        .or_else(|| defaults.api_base_url.clone())
        .ok_or(SettingsError::MissingBaseUrl)?;
    url::Url::parse(&api_base_url).map_err(|source| SettingsError::InvalidBaseUrl {
        url: api_base_url.clone(),
        source,
    })?;

    let environment = cli
        .environment
        .or(env.environment)
        .unwrap_or(defaults.environment);

    let interval_ms = cli
        .poll
        .as_ref()
        .and_then(|p| p.interval_ms)
        .or_else(|| env.poll.as_ref().and_then(|p| p.interval_ms))
        .or(defaults.poll.interval_ms)
        .unwrap_or(1500);
    let max_wait_secs = cli
        .poll
        .as_ref()
        .and_then(|p| p.max_wait_secs)
        .or_else(|| env.poll.as_ref().and_then(|p| p.max_wait_secs))
        .or(defaults.poll.max_wait_secs)
        .unwrap_or(60);
    let retry_budget = cli
        .poll
        .as_ref()
        .and_then(|p| p.retry_budget)
        .or_else(|| env.poll.as_ref().and_then(|p| p.retry_budget))
        .or(defaults.poll.retry_budget)
        .unwrap_or(5);

    Ok(EffectiveSettings {
        api_base_url: api_base_url.trim_end_matches('/').to_string(),
        environment,
        poll_interval: Duration::from_millis(interval_ms.max(1)),
        poll_max_wait: Duration::from_secs(max_wait_secs),
        poll_retry_budget: retry_budget.max(1),
        response_cache: env.response_cache.unwrap_or(defaults.response_cache),
        metrics: env.metrics.unwrap_or(defaults.metrics),
    })
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn api_base_url_is_read_as_a_fallback() {
        let vars: HashMap<&str, &str> = HashMap::from([("API_BASE_URL", "https://legacy.example.com")]);
        let env = EnvSettings::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(env.api_base_url.as_deref(), Some("https://legacy.example.com"));

        let vars: HashMap<&str, &str> =
            HashMap::from([("API_BASE_URL", "https://legacy.example.com"), ("ASSISTANT_API_BASE_URL", "https://new.example.com")]);
        let env = EnvSettings::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(env.api_base_url.as_deref(), Some("https://new.example.com"));

        let vars: HashMap<&str, &str> = HashMap::from([("API_BASE_URL", "https://legacy.example.com"), ("ASSISTANT_API_BASE_URL", " ")]);
        let env = EnvSettings::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(env.api_base_url.as_deref(), Some("https://legacy.example.com"));
    }

    #[test]
    fn precedence_cli_over_env_over_defaults() {
        let defaults = ConfigDefaults::default();

        let vars: HashMap<&str, &str> = HashMap::from([
            ("ASSISTANT_API_BASE_URL", "https://env.example.com/"),
            ("APP_ENV", "production"),
            ("CHAT_POLL_INTERVAL_MS", "500"),
            ("CHAT_POLL_RETRY_BUDGET", "9"),
            ("RESPONSE_CACHE", "off"),
        ]);
        let env = EnvSettings::from_lookup(|k| vars.get(k).map(|v| v.to_string()));

        let cli = CliOverrides {
            api_base_url: None,
            environment: None,
            poll: Some(PollSettings {
                interval_ms: None,
                max_wait_secs: None,
                retry_budget: Some(2),
            }),
        };

        let eff = resolve_effective_settings(&defaults, &env, &cli).unwrap();

        assert_eq!(eff.api_base_url, "https://env.example.com"); // from env, trailing slash dropped
        assert_eq!(eff.environment, Environment::Production); // from env
        assert_eq!(eff.poll_interval, Duration::from_millis(500)); // from env
        assert_eq!(eff.poll_max_wait, Duration::from_secs(60)); // from defaults
        assert_eq!(eff.poll_retry_budget, 2); // from cli
        assert!(!eff.response_cache); // from env
        assert!(eff.metrics); // from defaults
        assert_eq!(eff.default_log_filter(), "info");
    }

    #[test]
    fn cli_base_url_wins_and_is_validated() {
        let defaults = ConfigDefaults::default();
        let env = EnvSettings::default();
        let cli = CliOverrides {
            api_base_url: Some("not a url".into()),
            ..Default::default()
        };
        let err = resolve_effective_settings(&defaults, &env, &cli).unwrap_err();
        assert!(matches!(err, SettingsError::InvalidBaseUrl { .. }));
    }

    #[test]
    fn missing_base_url_everywhere_is_an_error() {
        let defaults = ConfigDefaults { api_base_url: None, ..Default::default() };
        let err = resolve_effective_settings(&defaults, &EnvSettings::default(), &CliOverrides::default()).unwrap_err();
        assert!(matches!(err, SettingsError::MissingBaseUrl));
    }

    #[test]
    fn unrecognised_values_fall_through() {
        let env = EnvSettings::from_lookup(|k| match k {
            "APP_ENV" => Some("staging".into()),
            "METRICS" => Some("maybe".into()),
            "CHAT_POLL_INTERVAL_MS" => Some("fast".into()),
            _ => None,
        });
        assert_eq!(env.environment, None);
        assert_eq!(env.metrics, None);
        assert_eq!(env.poll, None);
    }
}
