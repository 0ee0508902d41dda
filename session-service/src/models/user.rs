//! User credential profile - the identity store's record as seen by this core.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::services::audit::{Auditable, EntityKind, Snapshot, SnapshotError};

/// Identity-store user, reduced to what session issuance needs.
///
/// `totp_secret` is present once enrollment has started; `totp_enabled`
/// flips only after a code has been confirmed against it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct UserCredentialProfile {
    pub id: Uuid,
    pub user_name: String,
    pub email: String,
    pub totp_secret: Option<String>,
    pub totp_enabled: bool,
}

impl UserCredentialProfile {
    /// Create a profile without a second factor.
    pub fn new(user_name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_name: user_name.into(),
            email: email.into(),
            totp_secret: None,
            totp_enabled: false,
        }
    }

    /// The secret to challenge against, if second factor is fully enabled.
    pub fn active_second_factor(&self) -> Option<&str> {
        if self.totp_enabled {
            self.totp_secret.as_deref().filter(|s| !s.is_empty())
        } else {
            None
        }
    }

    /// The stored secret, whether or not second factor is enabled yet.
    pub fn active_secret(&self) -> Option<&str> {
        self.totp_secret.as_deref().filter(|s| !s.is_empty())
    }

    /// Label shown in authenticator apps.
    pub fn account_label(&self) -> &str {
        if self.email.is_empty() {
            &self.user_name
        } else {
            &self.email
        }
    }
}

impl Auditable for UserCredentialProfile {
    fn entity_name(&self) -> &'static str {
        "UserCredentialProfile"
    }

    fn table_name(&self) -> &'static str {
        "users"
    }

    fn kind(&self) -> EntityKind {
        EntityKind::IdentityInternal
    }

    fn key(&self) -> Uuid {
        self.id
    }

    fn snapshot(&self) -> Result<Snapshot, SnapshotError> {
        Snapshot::new()
            .field("id", &self.id)?
            .field("user_name", &self.user_name)?
            .field("email", &self.email)?
            .field("totp_secret", &self.totp_secret)?
            .field("totp_enabled", &self.totp_enabled)
    }
}
