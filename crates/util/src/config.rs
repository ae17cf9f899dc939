use std::{env, fmt, net::SocketAddr};

use super::{server_bind_address, DEFAULT_DATABASE_URL, DEFAULT_FRONTEND_URL};

/// Application runtime environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
    Test,
}

impl Environment {
    fn from_str(value: &str) -> Result<Self, ConfigError> {
        match value {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            "test" => Ok(Self::Test),
            other => Err(ConfigError::InvalidEnvironment(other.to_string())),
        }
    }

    /// Returns `true` when the current environment should behave as development.
    pub fn is_development(self) -> bool {
        matches!(self, Self::Development)
    }

    /// Returns the canonical name used for logging/metrics labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Test => "test",
        }
    }
}

/// Which Polar API server the outbound client talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolarEnvironment {
    Sandbox,
    Production,
}

impl PolarEnvironment {
    fn from_str(value: &str) -> Result<Self, ConfigError> {
        match value {
            "sandbox" => Ok(Self::Sandbox),
            "production" => Ok(Self::Production),
            other => Err(ConfigError::InvalidPolarEnvironment(other.to_string())),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sandbox => "sandbox",
            Self::Production => "production",
        }
    }
}

/// Runtime configuration resolved from environment variables.
///
/// Built exactly once at startup and passed by injection; nothing below the
/// composition root reads process environment state.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub environment: Environment,
    pub database_url: String,
    pub frontend_url: String,
    pub polar_webhook_secret: Option<String>,
    pub polar_access_token: Option<String>,
    pub polar_environment: PolarEnvironment,
    pub api_auth_token: Option<String>,
}

impl AppConfig {
    /// Constructs the configuration by reading and validating environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let env_value = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());
        let environment = Environment::from_str(&env_value)?;
        let bind_addr = server_bind_address().map_err(ConfigError::BindAddress)?;

        let database_url =
            env::var("DATABASE_URL").unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string());
        let frontend_url =
            env::var("FRONTEND_URL").unwrap_or_else(|_| DEFAULT_FRONTEND_URL.to_string());

        let polar_webhook_secret = env::var("POLAR_WEBHOOK_SECRET").ok().filter(|s| !s.is_empty());
        let polar_access_token = env::var("POLAR_ACCESS_TOKEN").ok().filter(|s| !s.is_empty());
        let api_auth_token = env::var("API_AUTH_TOKEN").ok().filter(|s| !s.is_empty());

        // APP_ENV=production implies the production Polar server unless
        // POLAR_ENVIRONMENT says otherwise.
        let polar_env_value = env::var("POLAR_ENVIRONMENT").unwrap_or_else(|_| {
            if environment == Environment::Production {
                "production".to_string()
            } else {
                "sandbox".to_string()
            }
        });
        let polar_environment = PolarEnvironment::from_str(&polar_env_value)?;

        Ok(Self {
            bind_addr,
            environment,
            database_url,
            frontend_url,
            polar_webhook_secret,
            polar_access_token,
            polar_environment,
            api_auth_token,
        })
    }
}

/// Errors that can occur during configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    InvalidEnvironment(String),
    InvalidPolarEnvironment(String),
    BindAddress(std::net::AddrParseError),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEnvironment(value) => write!(
                f,
                "APP_ENV must be one of 'development', 'production', or 'test' (got {value})"
            ),
            Self::InvalidPolarEnvironment(value) => write!(
                f,
                "POLAR_ENVIRONMENT must be 'sandbox' or 'production' (got {value})"
            ),
            Self::BindAddress(err) => write!(f, "invalid APP_BIND_ADDR value: {err}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_env::ENV_GUARD;
    use crate::DEFAULT_BIND_ADDR;

    fn clear_env() {
        for key in [
            "APP_ENV",
            "APP_BIND_ADDR",
            "DATABASE_URL",
            "FRONTEND_URL",
            "POLAR_WEBHOOK_SECRET",
            "POLAR_ACCESS_TOKEN",
            "POLAR_ENVIRONMENT",
            "API_AUTH_TOKEN",
        ] {
            env::remove_var(key);
        }
    }

    #[test]
    fn loads_defaults_in_development() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_env();

        let config = AppConfig::from_env().expect("config should load with defaults");
        assert_eq!(config.environment, Environment::Development);
        assert_eq!(config.bind_addr.to_string(), DEFAULT_BIND_ADDR);
        assert_eq!(config.polar_environment, PolarEnvironment::Sandbox);
        assert!(config.polar_webhook_secret.is_none());
        assert!(config.polar_access_token.is_none());
        assert!(config.api_auth_token.is_none());
    }

    #[test]
    fn reads_api_auth_token() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_env();
        env::set_var("API_AUTH_TOKEN", "svc-token");

        let config = AppConfig::from_env().expect("config should load");
        assert_eq!(config.api_auth_token.as_deref(), Some("svc-token"));

        clear_env();
    }

    #[test]
    fn rejects_invalid_environment() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_env();
        env::set_var("APP_ENV", "invalid");

        let err = AppConfig::from_env().expect_err("invalid env should error");
        assert!(matches!(err, ConfigError::InvalidEnvironment(value) if value == "invalid"));

        env::remove_var("APP_ENV");
    }

    #[test]
    fn production_defaults_to_production_polar_server() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_env();
        env::set_var("APP_ENV", "production");
        env::set_var("POLAR_WEBHOOK_SECRET", "whsec_c2VjcmV0");

        let config = AppConfig::from_env().expect("config should load");
        assert_eq!(config.environment, Environment::Production);
        assert_eq!(config.polar_environment, PolarEnvironment::Production);
        assert_eq!(config.polar_webhook_secret.as_deref(), Some("whsec_c2VjcmV0"));

        clear_env();
    }

    #[test]
    fn sandbox_override_wins_in_production() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_env();
        env::set_var("APP_ENV", "production");
        env::set_var("POLAR_ENVIRONMENT", "sandbox");

        let config = AppConfig::from_env().expect("config should load");
        assert_eq!(config.polar_environment, PolarEnvironment::Sandbox);

        clear_env();
    }
}
