use secrecy::{ExposeSecret, Secret};
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;

use crate::services::jwt::MIN_SIGNING_KEY_BYTES;

pub const DEFAULT_TOTP_ISSUER: &str = "Industrial Secure API";

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub common: core_config::Config,
    pub environment: Environment,
    pub service_name: String,
    pub service_version: String,
    pub database: DatabaseConfig,
    pub jwt: JwtConfig,
    pub totp: TotpConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Environment {
    Dev,
    Prod,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: Secret<String>,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct JwtConfig {
    /// HS256 shared key
    pub signing_key: Secret<String>,
    pub issuer: String,
    pub audience: String,
}

#[derive(Debug, Clone)]
pub struct TotpConfig {
    /// Issuer label shown in authenticator apps
    pub issuer: String,
}

impl Default for TotpConfig {
    fn default() -> Self {
        Self {
            issuer: DEFAULT_TOTP_ISSUER.to_string(),
        }
    }
}

impl SessionConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common_config = core_config::Config::load()?;

        let env_str = env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string());
        let environment: Environment = env_str
            .parse()
            .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?;

        let is_prod = environment == Environment::Prod;

        let config = SessionConfig {
            common: common_config,
            environment,
            service_name: get_env("SERVICE_NAME", Some("session-service"), is_prod)?,
            service_version: get_env("SERVICE_VERSION", Some(env!("CARGO_PKG_VERSION")), is_prod)?,
            database: DatabaseConfig {
                url: Secret::new(get_env("DATABASE_URL", None, is_prod)?),
                max_connections: parse_env("DATABASE_MAX_CONNECTIONS", "10", is_prod)?,
                min_connections: parse_env("DATABASE_MIN_CONNECTIONS", "1", is_prod)?,
                acquire_timeout_seconds: parse_env("DATABASE_ACQUIRE_TIMEOUT_SECONDS", "30", is_prod)?,
            },
            // No defaults for token settings in any environment
            jwt: JwtConfig {
                signing_key: Secret::new(get_env("JWT_SIGNING_KEY", None, true)?),
                issuer: get_env("JWT_ISSUER", None, true)?,
                audience: get_env("JWT_AUDIENCE", None, true)?,
            },
            totp: TotpConfig {
                issuer: get_env("TOTP_ISSUER", Some(DEFAULT_TOTP_ISSUER), is_prod)?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), AppError> {
        if self.jwt.signing_key.expose_secret().len() < MIN_SIGNING_KEY_BYTES {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "JWT_SIGNING_KEY must be at least {} bytes",
                MIN_SIGNING_KEY_BYTES
            )));
        }

        if self.jwt.issuer.trim().is_empty() || self.jwt.audience.trim().is_empty() {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "JWT_ISSUER and JWT_AUDIENCE must not be empty"
            )));
        }

        if self.database.max_connections == 0
            || self.database.min_connections > self.database.max_connections
        {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "DATABASE_MIN_CONNECTIONS must not exceed a positive DATABASE_MAX_CONNECTIONS"
            )));
        }

        Ok(())
    }
}

fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required in production but not set",
                    key
                ))))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required but not set",
                    key
                ))))
            }
        }
    }
}

fn parse_env<T>(key: &str, default: &str, is_prod: bool) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    get_env(key, Some(default), is_prod)?
        .parse()
        .map_err(|e: T::Err| AppError::ConfigError(anyhow::anyhow!("{}: {}", key, e)))
}

impl std::str::FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dev" => Ok(Environment::Dev),
            "prod" => Ok(Environment::Prod),
            _ => Err(format!("Invalid environment: {}", s)),
        }
    }
}
