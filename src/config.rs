// =============================================================================
// Runtime Configuration — environment-driven gateway settings
// =============================================================================
//
// Every tunable lives here so main.rs reads the environment exactly once and
// the rest of the system receives a plain struct.  TLS termination is assumed
// external; the SSL_* variables are accepted and logged so operators see what
// the front proxy is expected to serve.
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Deployment environment; controls the default log level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppEnv {
    Development,
    Staging,
    Production,
}

impl AppEnv {
    fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "production" => Self::Production,
            "staging" => Self::Staging,
            _ => Self::Development,
        }
    }

    /// Default tracing filter when LOG_LEVEL is unset.
    pub fn default_log_level(&self) -> &'static str {
        match self {
            Self::Development => "debug",
            Self::Staging | Self::Production => "info",
        }
    }
}

impl std::fmt::Display for AppEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Development => write!(f, "development"),
            Self::Staging => write!(f, "staging"),
            Self::Production => write!(f, "production"),
        }
    }
}

/// Gateway configuration assembled from the environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub env: AppEnv,
    /// TCP port the HTTP listener binds.
    pub port: u16,
    /// SQLite database path.
    pub database_url: String,
    /// Explicit log filter; falls back to the env default when empty.
    pub log_level: Option<String>,
    /// HTTPS expected at the front proxy (informational).
    pub enable_ssl: bool,
    pub ssl_cert_dir: Option<String>,
    pub ssl_domain: Option<String>,
    /// Skip the startup connectivity probe against each exchange —
    /// offline bring-up and tests.
    pub skip_exchange_test: bool,
    /// Seconds between reconciliation passes per account.
    pub reconcile_interval_secs: u64,
    /// Seconds between cancel-queue polls.
    pub cancel_queue_interval_secs: u64,
    /// Per-account budget inside a webhook fan-out.
    pub webhook_account_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            env: AppEnv::Development,
            port: 8080,
            database_url: "signalgate.db".to_string(),
            log_level: None,
            enable_ssl: false,
            ssl_cert_dir: None,
            ssl_domain: None,
            skip_exchange_test: false,
            reconcile_interval_secs: 10,
            cancel_queue_interval_secs: 2,
            webhook_account_timeout_secs: 10,
        }
    }
}

impl Config {
    /// Build from process environment. Unparseable values fall back to the
    /// default with a warning rather than aborting startup.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let env = std::env::var("APP_ENV")
            .map(|v| AppEnv::parse(&v))
            .unwrap_or(defaults.env);

        Self {
            env,
            port: env_parse("PORT", defaults.port),
            database_url: std::env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            log_level: std::env::var("LOG_LEVEL").ok().filter(|s| !s.is_empty()),
            enable_ssl: env_parse("ENABLE_SSL", defaults.enable_ssl),
            ssl_cert_dir: std::env::var("SSL_CERT_DIR").ok(),
            ssl_domain: std::env::var("SSL_DOMAIN").ok(),
            skip_exchange_test: env_parse("SKIP_EXCHANGE_TEST", defaults.skip_exchange_test),
            reconcile_interval_secs: env_parse(
                "RECONCILE_INTERVAL_SECS",
                defaults.reconcile_interval_secs,
            ),
            cancel_queue_interval_secs: env_parse(
                "CANCEL_QUEUE_INTERVAL_SECS",
                defaults.cancel_queue_interval_secs,
            ),
            webhook_account_timeout_secs: env_parse(
                "WEBHOOK_ACCOUNT_TIMEOUT_SECS",
                defaults.webhook_account_timeout_secs,
            ),
        }
    }

    /// Effective tracing filter string.
    pub fn log_filter(&self) -> String {
        self.log_level
            .clone()
            .unwrap_or_else(|| self.env.default_log_level().to_string())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.parse() {
            Ok(v) => v,
            Err(_) => {
                warn!(key, value = %raw, "unparseable env value — using default");
                default
            }
        },
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.reconcile_interval_secs, 10);
        assert!(!cfg.enable_ssl);
    }

    #[test]
    fn env_default_log_levels() {
        assert_eq!(AppEnv::Development.default_log_level(), "debug");
        assert_eq!(AppEnv::Production.default_log_level(), "info");
    }

    #[test]
    fn app_env_parse_is_lenient() {
        assert_eq!(AppEnv::parse("PRODUCTION"), AppEnv::Production);
        assert_eq!(AppEnv::parse("weird"), AppEnv::Development);
    }

    #[test]
    fn explicit_log_level_wins() {
        let cfg = Config {
            log_level: Some("trace".into()),
            ..Config::default()
        };
        assert_eq!(cfg.log_filter(), "trace");
    }
}
