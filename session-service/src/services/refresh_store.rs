//! Refresh token persistence seam.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::RefreshTokenRecord;
use crate::services::error::StoreError;

/// Store for refresh tokens, addressed by raw token value.
///
/// Implementations keep only the SHA-256 hash of the value. `revoke` must be
/// an atomic compare-and-set: of any number of concurrent calls for the same
/// usable token, exactly one returns `true`.
#[async_trait]
pub trait RefreshTokenStore: Send + Sync {
    async fn save(
        &self,
        user_id: Uuid,
        token_value: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<RefreshTokenRecord, StoreError>;

    /// The record for `token_value` if it is neither revoked nor expired at `now`.
    async fn fetch_usable(
        &self,
        token_value: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<RefreshTokenRecord>, StoreError>;

    /// Revoke a not-yet-revoked token. `false` if it was unknown or already revoked.
    async fn revoke(&self, token_value: &str) -> Result<bool, StoreError>;

    /// Revoke every live token of a user, returning how many were revoked.
    async fn revoke_all_for_user(&self, user_id: Uuid) -> Result<u64, StoreError>;
}
