//! session-service: credential and session lifecycle plus transactional
//! audit capture for the industrial API.
pub mod config;
pub mod dtos;
pub mod models;
pub mod services;

use std::sync::Arc;

use service_core::error::AppError;

use crate::config::SessionConfig;
use crate::services::{
    Database, EntityStore, IdentityStore, InMemoryStore, RefreshTokenStore, SensorReadingService,
    ServiceError, SessionService, TokenIssuer,
};

/// Wired services sharing one store.
#[derive(Clone)]
pub struct AppState {
    pub config: SessionConfig,
    pub sessions: SessionService,
    pub sensors: SensorReadingService,
}

impl AppState {
    /// Build the services over any store implementing every storage seam.
    ///
    /// Token configuration faults surface here, before anything is served.
    pub fn with_store<S>(config: SessionConfig, store: Arc<S>) -> Result<Self, AppError>
    where
        S: EntityStore + IdentityStore + RefreshTokenStore + 'static,
    {
        let tokens = TokenIssuer::new(&config.jwt).map_err(ServiceError::from)?;

        let identity: Arc<dyn IdentityStore> = store.clone();
        let refresh_tokens: Arc<dyn RefreshTokenStore> = store.clone();
        let entities: Arc<dyn EntityStore> = store;

        Ok(Self {
            sessions: SessionService::new(tokens, &config.totp, identity, refresh_tokens),
            sensors: SensorReadingService::new(entities),
            config,
        })
    }

    /// Connect to Postgres, apply migrations and wire the services.
    pub async fn connect(config: SessionConfig) -> Result<Self, AppError> {
        let db = Database::connect(&config.database).await?;
        db.run_migrations().await?;
        db.health_check().await?;

        tracing::info!(
            service = %config.service_name,
            version = %config.service_version,
            environment = ?config.environment,
            "Session services ready"
        );

        Self::with_store(config, Arc::new(db))
    }

    /// Process startup: load configuration, install tracing, connect.
    ///
    /// Any configuration fault stops startup here.
    pub async fn bootstrap() -> Result<Self, AppError> {
        let config = SessionConfig::from_env()?;

        service_core::observability::init_tracing(
            &config.service_name,
            &config.common.log_level,
            config.common.otlp_endpoint.as_deref(),
        )?;

        Self::connect(config).await
    }

    /// Services over a fresh in-process store.
    pub fn in_memory(config: SessionConfig) -> Result<(Self, Arc<InMemoryStore>), AppError> {
        let store = Arc::new(InMemoryStore::new());
        let state = Self::with_store(config, store.clone())?;
        Ok((state, store))
    }
}
