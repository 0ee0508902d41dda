//! Postgres store for refresh tokens, identity data and audited entities.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::ExposeSecret;
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::models::{AuditAction, AuditEntry, RefreshTokenRecord, UserCredentialProfile};
use crate::services::audit::{AuditError, ChangeSet, EntityStore, EntityWrite, Snapshot};
use crate::services::error::StoreError;
use crate::services::identity::{ActorContext, IdentityStore};
use crate::services::refresh_store::RefreshTokenStore;

/// Tables that audited change sets may write.
const ENTITY_TABLES: &[&str] = &["users", "sensor_readings"];

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(config), fields(service = "session-service"))]
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, AppError> {
        info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_seconds))
            .idle_timeout(Duration::from_secs(600))
            .connect(config.url.expose_secret())
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;
        Ok(())
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    /// Create a user with its roles, bypassing change tracking.
    #[instrument(skip(self, user), fields(user_name = %user.user_name))]
    pub async fn insert_user(
        &self,
        user: &UserCredentialProfile,
        roles: &[&str],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO users (id, user_name, email, totp_secret, totp_enabled)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(user.id)
        .bind(&user.user_name)
        .bind(&user.email)
        .bind(&user.totp_secret)
        .bind(user.totp_enabled)
        .execute(&mut *tx)
        .await
        .map_err(|e| conflict_on_unique(e, "user name already taken"))?;

        for role in roles {
            sqlx::query(
                r#"
                INSERT INTO user_roles (user_id, role_id)
                SELECT $1, id FROM roles WHERE name = $2
                "#,
            )
            .bind(user.id)
            .bind(*role)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

fn conflict_on_unique(e: sqlx::Error, what: &str) -> StoreError {
    match e {
        sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
            StoreError::Conflict(what.to_string())
        }
        other => StoreError::Database(other),
    }
}

/// Quote a column or table name. Only plain snake_case identifiers pass.
fn quoted(ident: &str) -> Result<String, StoreError> {
    let valid = !ident.is_empty()
        && ident
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_');
    if valid {
        Ok(format!("\"{}\"", ident))
    } else {
        Err(StoreError::Corrupt(format!("invalid identifier: {}", ident)))
    }
}

fn entity_table(table: &str) -> Result<String, StoreError> {
    if ENTITY_TABLES.contains(&table) {
        quoted(table)
    } else {
        Err(StoreError::Corrupt(format!("table {} is not writable", table)))
    }
}

fn column_list(row: &Snapshot, skip_key: bool) -> Result<String, StoreError> {
    let columns = row
        .columns()
        .filter(|c| !(skip_key && *c == "id"))
        .map(quoted)
        .collect::<Result<Vec<_>, _>>()?;
    if columns.is_empty() {
        return Err(StoreError::Corrupt("row image has no columns".to_string()));
    }
    Ok(columns.join(", "))
}

fn missing_row(write: &EntityWrite) -> StoreError {
    StoreError::Conflict(format!(
        "{} of {} {} does not match stored state",
        write.action, write.table, write.key
    ))
}

async fn write_entity(
    tx: &mut Transaction<'_, Postgres>,
    write: &EntityWrite,
) -> Result<(), StoreError> {
    let table = entity_table(write.table)?;

    let affected = match (write.action, &write.row) {
        (AuditAction::Added, Some(row)) => {
            let columns = column_list(row, false)?;
            let sql = format!(
                "INSERT INTO {table} ({columns}) SELECT {columns} FROM jsonb_populate_record(NULL::{table}, $1)"
            );
            sqlx::query(&sql)
                .bind(row.to_value())
                .execute(&mut **tx)
                .await
                .map_err(|e| conflict_on_unique(e, "row already exists"))?
                .rows_affected()
        }
        (AuditAction::Modified, Some(row)) => {
            let columns = column_list(row, true)?;
            let sql = format!(
                "UPDATE {table} SET ({columns}) = (SELECT {columns} FROM jsonb_populate_record(NULL::{table}, $1)) WHERE id = $2"
            );
            sqlx::query(&sql)
                .bind(row.to_value())
                .bind(write.key)
                .execute(&mut **tx)
                .await?
                .rows_affected()
        }
        (AuditAction::Deleted, None) => {
            let sql = format!("DELETE FROM {table} WHERE id = $1");
            sqlx::query(&sql)
                .bind(write.key)
                .execute(&mut **tx)
                .await?
                .rows_affected()
        }
        _ => return Err(missing_row(write)),
    };

    if affected != 1 {
        return Err(missing_row(write));
    }
    Ok(())
}

async fn append_audit(
    tx: &mut Transaction<'_, Postgres>,
    entry: &AuditEntry,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO audit_entries (id, actor, action, entity, occurred_at, old_values, new_values)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(entry.id)
    .bind(&entry.actor)
    .bind(entry.action.as_str())
    .bind(&entry.entity)
    .bind(entry.occurred_at)
    .bind(&entry.old_values)
    .bind(&entry.new_values)
    .execute(&mut **tx)
    .await
    .map_err(|e| conflict_on_unique(e, "audit entry already recorded"))?;
    Ok(())
}

fn audit_entry_from_row(row: &PgRow) -> Result<AuditEntry, StoreError> {
    let action: String = row.try_get("action")?;
    Ok(AuditEntry {
        id: row.try_get("id")?,
        actor: row.try_get("actor")?,
        action: action.parse().map_err(StoreError::Corrupt)?,
        entity: row.try_get("entity")?,
        occurred_at: row.try_get("occurred_at")?,
        old_values: row.try_get("old_values")?,
        new_values: row.try_get("new_values")?,
    })
}

#[async_trait]
impl EntityStore for Database {
    #[instrument(skip(self, writes, audit), fields(writes = writes.len(), audit_entries = audit.len()))]
    async fn apply(&self, writes: &[EntityWrite], audit: &[AuditEntry]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        for write in writes {
            if let Err(e) = write_entity(&mut tx, write).await {
                warn!(error = %e, table = write.table, key = %write.key, "Rolling back change set");
                return Err(e);
            }
        }
        for entry in audit {
            append_audit(&mut tx, entry).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn load(&self, table: &str, key: Uuid) -> Result<Option<Snapshot>, StoreError> {
        let sql = format!("SELECT to_jsonb(t) FROM {} t WHERE id = $1", entity_table(table)?);
        let value: Option<serde_json::Value> = sqlx::query_scalar(&sql)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        value
            .map(|v| {
                Snapshot::from_value(v)
                    .ok_or_else(|| StoreError::Corrupt(format!("{} {} is not an object", table, key)))
            })
            .transpose()
    }

    #[instrument(skip(self))]
    async fn audit_entries_for(&self, entity: &str) -> Result<Vec<AuditEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, actor, action, entity, occurred_at, old_values, new_values
            FROM audit_entries
            WHERE entity = $1
            ORDER BY occurred_at, seq
            "#,
        )
        .bind(entity)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(audit_entry_from_row).collect()
    }
}

#[async_trait]
impl RefreshTokenStore for Database {
    #[instrument(skip(self, token_value), fields(user_id = %user_id))]
    async fn save(
        &self,
        user_id: Uuid,
        token_value: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<RefreshTokenRecord, StoreError> {
        let record = RefreshTokenRecord::new(user_id, token_value, expires_at);

        let saved = sqlx::query_as::<_, RefreshTokenRecord>(
            r#"
            INSERT INTO refresh_tokens (id, user_id, token_hash, expires_at, created_at, revoked)
            VALUES ($1, $2, $3, $4, $5, FALSE)
            RETURNING id, user_id, token_hash, expires_at, created_at, revoked, revoked_at
            "#,
        )
        .bind(record.id)
        .bind(record.user_id)
        .bind(&record.token_hash)
        .bind(record.expires_at)
        .bind(record.created_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| conflict_on_unique(e, "refresh token already stored"))?;

        Ok(saved)
    }

    #[instrument(skip(self, token_value))]
    async fn fetch_usable(
        &self,
        token_value: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<RefreshTokenRecord>, StoreError> {
        let record = sqlx::query_as::<_, RefreshTokenRecord>(
            r#"
            SELECT id, user_id, token_hash, expires_at, created_at, revoked, revoked_at
            FROM refresh_tokens
            WHERE token_hash = $1 AND revoked = FALSE AND expires_at > $2
            "#,
        )
        .bind(RefreshTokenRecord::hash_token(token_value))
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    #[instrument(skip(self, token_value))]
    async fn revoke(&self, token_value: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE refresh_tokens
            SET revoked = TRUE, revoked_at = NOW()
            WHERE token_hash = $1 AND revoked = FALSE
            "#,
        )
        .bind(RefreshTokenRecord::hash_token(token_value))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn revoke_all_for_user(&self, user_id: Uuid) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE refresh_tokens
            SET revoked = TRUE, revoked_at = NOW()
            WHERE user_id = $1 AND revoked = FALSE
            "#,
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl IdentityStore for Database {
    #[instrument(skip(self))]
    async fn find_user_by_name(
        &self,
        user_name: &str,
    ) -> Result<Option<UserCredentialProfile>, StoreError> {
        let user = sqlx::query_as::<_, UserCredentialProfile>(
            r#"
            SELECT id, user_name, email, totp_secret, totp_enabled
            FROM users
            WHERE user_name = $1
            "#,
        )
        .bind(user_name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(user)
    }

    #[instrument(skip(self))]
    async fn find_user_by_id(&self, id: Uuid) -> Result<Option<UserCredentialProfile>, StoreError> {
        let user = sqlx::query_as::<_, UserCredentialProfile>(
            r#"
            SELECT id, user_name, email, totp_secret, totp_enabled
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(user)
    }

    #[instrument(skip(self))]
    async fn get_roles(&self, user_id: Uuid) -> Result<BTreeSet<String>, StoreError> {
        let roles: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT r.name
            FROM roles r
            JOIN user_roles ur ON ur.role_id = r.id
            WHERE ur.user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(roles.into_iter().collect())
    }

    #[instrument(skip(self, user, actor), fields(user_id = %user.id))]
    async fn update_user(
        &self,
        user: &UserCredentialProfile,
        actor: &dyn ActorContext,
    ) -> Result<(), AuditError> {
        let before = self
            .find_user_by_id(user.id)
            .await?
            .ok_or_else(|| StoreError::Conflict(format!("user {} no longer exists", user.id)))?;

        let mut changes = ChangeSet::new();
        changes.stage_update(&before, user);
        changes.commit(self, actor).await?;
        Ok(())
    }

    #[instrument(skip(self, secret))]
    async fn set_pending_secret(&self, user_id: Uuid, secret: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE users
            SET totp_secret = $2
            WHERE id = $1 AND (totp_secret IS NULL OR totp_secret = '')
            "#,
        )
        .bind(user_id)
        .bind(secret)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_are_restricted() {
        assert_eq!(quoted("sensor_readings").unwrap(), "\"sensor_readings\"");
        assert!(quoted("users; DROP TABLE users").is_err());
        assert!(quoted("Users").is_err());
        assert!(quoted("").is_err());
    }

    #[test]
    fn only_entity_tables_are_writable() {
        assert!(entity_table("sensor_readings").is_ok());
        assert!(entity_table("users").is_ok());
        assert!(entity_table("refresh_tokens").is_err());
        assert!(entity_table("audit_entries").is_err());
    }

    #[test]
    fn update_columns_skip_the_key() {
        let row = Snapshot::new()
            .field("id", &Uuid::nil())
            .and_then(|s| s.field("tag", "TT-101"))
            .and_then(|s| s.finite("value", 1.0))
            .unwrap();

        assert_eq!(column_list(&row, false).unwrap(), "\"id\", \"tag\", \"value\"");
        assert_eq!(column_list(&row, true).unwrap(), "\"tag\", \"value\"");
    }
}
