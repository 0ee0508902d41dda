//! In-process store used by tests and local tooling.
//!
//! Implements every persistence seam over mutex-guarded maps with the same
//! atomicity guarantees as the Postgres store.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{AuditAction, AuditEntry, RefreshTokenRecord, UserCredentialProfile};
use crate::services::audit::{AuditError, Auditable, ChangeSet, EntityStore, EntityWrite, Snapshot};
use crate::services::error::StoreError;
use crate::services::identity::{ActorContext, IdentityStore};
use crate::services::refresh_store::RefreshTokenStore;

type Tables = HashMap<String, BTreeMap<Uuid, Snapshot>>;

const USERS_TABLE: &str = "users";

#[derive(Default)]
pub struct InMemoryStore {
    refresh_tokens: Mutex<HashMap<String, RefreshTokenRecord>>,
    tables: Mutex<Tables>,
    audit_log: Mutex<Vec<AuditEntry>>,
    roles: Mutex<HashMap<Uuid, BTreeSet<String>>>,
}

fn guard<'a, T>(mutex: &'a Mutex<T>, what: &str) -> Result<MutexGuard<'a, T>, StoreError> {
    mutex
        .lock()
        .map_err(|e| StoreError::Unavailable(format!("In-memory {} mutex poisoned: {}", what, e)))
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a user directly, bypassing change tracking.
    pub fn insert_user(&self, user: &UserCredentialProfile) -> Result<(), StoreError> {
        let row = user
            .snapshot()
            .map_err(|e| StoreError::Corrupt(format!("user {}: {}", user.id, e)))?;
        guard(&self.tables, "tables")?
            .entry(USERS_TABLE.to_string())
            .or_default()
            .insert(user.id, row);
        Ok(())
    }

    pub fn assign_role(&self, user_id: Uuid, role: &str) -> Result<(), StoreError> {
        guard(&self.roles, "roles")?
            .entry(user_id)
            .or_default()
            .insert(role.to_string());
        Ok(())
    }

    /// Every committed audit entry, oldest first.
    pub fn audit_entries(&self) -> Result<Vec<AuditEntry>, StoreError> {
        Ok(guard(&self.audit_log, "audit log")?.clone())
    }

    /// Raw stored record, usable or not.
    pub fn refresh_record(&self, token_value: &str) -> Result<Option<RefreshTokenRecord>, StoreError> {
        let hash = RefreshTokenRecord::hash_token(token_value);
        Ok(guard(&self.refresh_tokens, "refresh token")?.get(&hash).cloned())
    }

    fn users(&self) -> Result<Vec<UserCredentialProfile>, StoreError> {
        let tables = guard(&self.tables, "tables")?;
        let Some(rows) = tables.get(USERS_TABLE) else {
            return Ok(Vec::new());
        };
        rows.values()
            .map(|row| row.decode().map_err(|e| StoreError::Corrupt(e.to_string())))
            .collect()
    }
}

fn apply_write(tables: &mut Tables, write: &EntityWrite) -> Result<(), StoreError> {
    let rows = tables.entry(write.table.to_string()).or_default();
    let exists = rows.contains_key(&write.key);

    match (write.action, &write.row) {
        (AuditAction::Added, Some(row)) if !exists => {
            rows.insert(write.key, row.clone());
        }
        (AuditAction::Modified, Some(row)) if exists => {
            rows.insert(write.key, row.clone());
        }
        (AuditAction::Deleted, None) if exists => {
            rows.remove(&write.key);
        }
        (action, _) => {
            return Err(StoreError::Conflict(format!(
                "{} of {} {} does not match stored state",
                action, write.table, write.key
            )));
        }
    }
    Ok(())
}

#[async_trait]
impl EntityStore for InMemoryStore {
    async fn apply(&self, writes: &[EntityWrite], audit: &[AuditEntry]) -> Result<(), StoreError> {
        let mut tables = guard(&self.tables, "tables")?;
        let mut audit_log = guard(&self.audit_log, "audit log")?;

        let mut staged = tables.clone();
        for write in writes {
            apply_write(&mut staged, write)?;
        }

        *tables = staged;
        audit_log.extend_from_slice(audit);
        Ok(())
    }

    async fn load(&self, table: &str, key: Uuid) -> Result<Option<Snapshot>, StoreError> {
        let tables = guard(&self.tables, "tables")?;
        Ok(tables.get(table).and_then(|rows| rows.get(&key)).cloned())
    }

    async fn audit_entries_for(&self, entity: &str) -> Result<Vec<AuditEntry>, StoreError> {
        let audit_log = guard(&self.audit_log, "audit log")?;
        Ok(audit_log
            .iter()
            .filter(|e| e.entity == entity)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl RefreshTokenStore for InMemoryStore {
    async fn save(
        &self,
        user_id: Uuid,
        token_value: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<RefreshTokenRecord, StoreError> {
        let record = RefreshTokenRecord::new(user_id, token_value, expires_at);
        let mut tokens = guard(&self.refresh_tokens, "refresh token")?;
        if tokens.contains_key(&record.token_hash) {
            return Err(StoreError::Conflict("refresh token already stored".to_string()));
        }
        tokens.insert(record.token_hash.clone(), record.clone());
        Ok(record)
    }

    async fn fetch_usable(
        &self,
        token_value: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<RefreshTokenRecord>, StoreError> {
        let hash = RefreshTokenRecord::hash_token(token_value);
        let tokens = guard(&self.refresh_tokens, "refresh token")?;
        Ok(tokens.get(&hash).filter(|r| r.is_usable_at(now)).cloned())
    }

    async fn revoke(&self, token_value: &str) -> Result<bool, StoreError> {
        let hash = RefreshTokenRecord::hash_token(token_value);
        let mut tokens = guard(&self.refresh_tokens, "refresh token")?;
        match tokens.get_mut(&hash) {
            Some(record) if !record.revoked => {
                record.revoke(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn revoke_all_for_user(&self, user_id: Uuid) -> Result<u64, StoreError> {
        let now = Utc::now();
        let mut tokens = guard(&self.refresh_tokens, "refresh token")?;
        let mut count = 0;
        for record in tokens
            .values_mut()
            .filter(|r| r.user_id == user_id && !r.revoked)
        {
            record.revoke(now);
            count += 1;
        }
        Ok(count)
    }
}

#[async_trait]
impl IdentityStore for InMemoryStore {
    async fn find_user_by_name(
        &self,
        user_name: &str,
    ) -> Result<Option<UserCredentialProfile>, StoreError> {
        Ok(self.users()?.into_iter().find(|u| u.user_name == user_name))
    }

    async fn find_user_by_id(&self, id: Uuid) -> Result<Option<UserCredentialProfile>, StoreError> {
        match self.load(USERS_TABLE, id).await? {
            Some(row) => row
                .decode()
                .map(Some)
                .map_err(|e| StoreError::Corrupt(e.to_string())),
            None => Ok(None),
        }
    }

    async fn get_roles(&self, user_id: Uuid) -> Result<BTreeSet<String>, StoreError> {
        Ok(guard(&self.roles, "roles")?
            .get(&user_id)
            .cloned()
            .unwrap_or_default())
    }

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

    async fn set_pending_secret(&self, user_id: Uuid, secret: &str) -> Result<bool, StoreError> {
        let mut tables = guard(&self.tables, "tables")?;
        let Some(row) = tables.get_mut(USERS_TABLE).and_then(|rows| rows.get_mut(&user_id)) else {
            return Ok(false);
        };

        let mut user: UserCredentialProfile = row
            .decode()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        if user.active_secret().is_some() {
            return Ok(false);
        }

        user.totp_secret = Some(secret.to_string());
        *row = user
            .snapshot()
            .map_err(|e| StoreError::Corrupt(format!("user {}: {}", user_id, e)))?;
        Ok(true)
    }
}
