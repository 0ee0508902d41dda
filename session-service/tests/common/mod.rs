//! Common test utilities for session-service integration tests.

#![allow(dead_code)]

use secrecy::Secret;
use service_core::config::Config as CommonConfig;
use session_service::config::{DatabaseConfig, Environment, JwtConfig, SessionConfig, TotpConfig};
use session_service::models::UserCredentialProfile;
use session_service::services::{AccessClaims, Database, InMemoryStore, SecondFactorVerifier};
use session_service::AppState;
use std::sync::{Arc, Once};
use totp_rs::{Algorithm, Secret as TotpSecret, TOTP};

static INIT: Once = Once::new();

pub const TEST_SIGNING_KEY: &str = "session-service-test-signing-key-0123456789";
pub const TEST_ISSUER: &str = "plant-api-test";
pub const TEST_AUDIENCE: &str = "plant-clients-test";

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("info,session_service=debug,sqlx=warn")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

pub fn test_config(database_url: &str, issuer: &str) -> SessionConfig {
    SessionConfig {
        common: CommonConfig::default(),
        environment: Environment::Dev,
        service_name: "session-service-test".to_string(),
        service_version: "test".to_string(),
        database: DatabaseConfig {
            url: Secret::new(database_url.to_string()),
            max_connections: 8,
            min_connections: 1,
            acquire_timeout_seconds: 5,
        },
        jwt: JwtConfig {
            signing_key: Secret::new(TEST_SIGNING_KEY.to_string()),
            issuer: issuer.to_string(),
            audience: TEST_AUDIENCE.to_string(),
        },
        totp: TotpConfig::default(),
    }
}

/// Services over a fresh in-memory store.
pub fn memory_app() -> (AppState, Arc<InMemoryStore>) {
    init_tracing();
    AppState::in_memory(test_config("postgres://unused", TEST_ISSUER))
        .expect("in-memory app should build")
}

pub fn seed_user(
    store: &InMemoryStore,
    user_name: &str,
    email: &str,
    roles: &[&str],
) -> UserCredentialProfile {
    let user = UserCredentialProfile::new(user_name, email);
    store.insert_user(&user).expect("Failed to seed user");
    for role in roles {
        store.assign_role(user.id, role).expect("Failed to assign role");
    }
    user
}

/// Services over the database named by `TEST_DATABASE_URL`, migrated.
pub async fn spawn_pg_app() -> (AppState, Database) {
    init_tracing();
    dotenvy::dotenv().ok();

    let database_url = std::env::var("TEST_DATABASE_URL")
        .expect("TEST_DATABASE_URL must be set to run database tests");
    let config = test_config(&database_url, TEST_ISSUER);

    let db = Database::connect(&config.database)
        .await
        .expect("Failed to connect to test database");
    db.run_migrations().await.expect("Failed to run migrations");

    let state = AppState::with_store(config, Arc::new(db.clone())).expect("Failed to build app");
    (state, db)
}

/// Code an authenticator app would show right now.
pub fn current_code(secret: &str) -> String {
    let bytes = TotpSecret::Encoded(secret.to_string())
        .to_bytes()
        .expect("secret should be base32");
    TOTP::new_unchecked(Algorithm::SHA1, 6, 1, 30, bytes)
        .generate_current()
        .expect("system clock should be after the epoch")
}

/// A code for `secret` that is not valid in any accepted window.
pub fn wrong_code(secret: &str) -> String {
    let verifier = SecondFactorVerifier::new();
    (0..1_000_000u32)
        .map(|n| format!("{:06}", n))
        .find(|candidate| !verifier.validate_code(secret, candidate))
        .expect("some code must be wrong")
}

/// Claims as the access-token validator would return them.
pub fn claims_for(user: &UserCredentialProfile, roles: &[&str]) -> AccessClaims {
    AccessClaims {
        sub: user.id.to_string(),
        name: user.user_name.clone(),
        email: user.email.clone(),
        roles: roles.iter().map(|r| r.to_string()).collect(),
        iss: TEST_ISSUER.to_string(),
        aud: TEST_AUDIENCE.to_string(),
        iat: 0,
        exp: i64::MAX,
    }
}
