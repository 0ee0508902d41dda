use crate::error::AppError;
use config::{Config as Cfg, File};
use serde::Deserialize;

/// Settings shared by every service: logging and trace export.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub otlp_endpoint: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            otlp_endpoint: None,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, AppError> {
        dotenvy::dotenv().ok();

        let config = Cfg::builder()
            .add_source(File::with_name("configuration").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"))
            .build()?;

        Ok(config.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn load_uses_defaults_without_sources() {
        // SAFETY: serialised with every other test touching the environment.
        unsafe {
            std::env::remove_var("APP__LOG_LEVEL");
            std::env::remove_var("APP__OTLP_ENDPOINT");
        }

        let config = Config::load().expect("defaults should deserialize");
        assert_eq!(config.log_level, "info");
        assert!(config.otlp_endpoint.is_none());
    }

    #[test]
    #[serial]
    fn load_reads_prefixed_environment() {
        // SAFETY: serialised with every other test touching the environment.
        unsafe {
            std::env::set_var("APP__LOG_LEVEL", "debug");
            std::env::set_var("APP__OTLP_ENDPOINT", "http://tempo:4317");
        }

        let config = Config::load().expect("environment should deserialize");

        unsafe {
            std::env::remove_var("APP__LOG_LEVEL");
            std::env::remove_var("APP__OTLP_ENDPOINT");
        }

        assert_eq!(config.log_level, "debug");
        assert_eq!(config.otlp_endpoint.as_deref(), Some("http://tempo:4317"));
    }
}
