//! Identity store seam and acting-user resolution.

use std::collections::BTreeSet;

use async_trait::async_trait;
use uuid::Uuid;

use crate::models::UserCredentialProfile;
use crate::services::audit::AuditError;
use crate::services::error::StoreError;
use crate::services::jwt::AccessClaims;

/// Supplies the label of the user on whose behalf changes are made.
pub trait ActorContext: Send + Sync {
    fn current_actor_label(&self) -> Option<String>;
}

/// Actor taken from the authenticated request, if any.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestActor {
    label: Option<String>,
}

impl RequestActor {
    pub fn anonymous() -> Self {
        Self { label: None }
    }

    pub fn named(label: impl Into<String>) -> Self {
        Self {
            label: Some(label.into()),
        }
    }

    /// Actor for a validated access token; the label is the user name.
    pub fn from_claims(claims: &AccessClaims) -> Self {
        Self::named(claims.name.clone())
    }
}

impl ActorContext for RequestActor {
    fn current_actor_label(&self) -> Option<String> {
        self.label.clone()
    }
}

/// Read and update access to user credential profiles and role membership.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn find_user_by_name(
        &self,
        user_name: &str,
    ) -> Result<Option<UserCredentialProfile>, StoreError>;

    async fn find_user_by_id(&self, id: Uuid) -> Result<Option<UserCredentialProfile>, StoreError>;

    /// Role names for a user; empty when the user has none.
    async fn get_roles(&self, user_id: Uuid) -> Result<BTreeSet<String>, StoreError>;

    /// Persist a changed profile through an audited change set.
    ///
    /// Fails with [`StoreError::Conflict`] if the user no longer exists.
    async fn update_user(
        &self,
        user: &UserCredentialProfile,
        actor: &dyn ActorContext,
    ) -> Result<(), AuditError>;

    /// Store a pending second-factor secret unless the user already has one.
    ///
    /// `false` when another secret was already in place or the user is gone;
    /// the stored secret is never replaced.
    async fn set_pending_secret(&self, user_id: Uuid, secret: &str) -> Result<bool, StoreError>;
}
