use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::FromRow;
use uuid::Uuid;

/// Lifetime of a refresh token from issuance.
pub const REFRESH_TOKEN_LIFETIME_DAYS: i64 = 7;

/// Persisted refresh token. Only the SHA-256 hash of the opaque value is
/// stored; the raw value leaves the service exactly once, in the response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct RefreshTokenRecord {
    pub id: Uuid,

    pub user_id: Uuid,

    /// SHA-256 hex digest of the token value
    pub token_hash: String,

    pub expires_at: DateTime<Utc>,

    pub created_at: DateTime<Utc>,

    /// Set exactly once, by rotation or logout
    #[serde(default)]
    pub revoked: bool,

    pub revoked_at: Option<DateTime<Utc>>,
}

impl RefreshTokenRecord {
    pub fn new(user_id: Uuid, token: &str, expires_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            token_hash: Self::hash_token(token),
            expires_at,
            created_at: Utc::now(),
            revoked: false,
            revoked_at: None,
        }
    }

    /// Expiry for a token issued at `now`.
    pub fn default_expiry(now: DateTime<Utc>) -> DateTime<Utc> {
        now + Duration::days(REFRESH_TOKEN_LIFETIME_DAYS)
    }

    /// Hash a token value using SHA-256
    pub fn hash_token(token: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(token.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Usable means neither revoked nor expired.
    pub fn is_usable_at(&self, now: DateTime<Utc>) -> bool {
        !self.revoked && !self.is_expired_at(now)
    }

    pub fn revoke(&mut self, at: DateTime<Utc>) {
        self.revoked = true;
        self.revoked_at = Some(at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_stores_hash_not_value() {
        let now = Utc::now();
        let record = RefreshTokenRecord::new(Uuid::new_v4(), "token_abc", now + Duration::days(7));

        assert_ne!(record.token_hash, "token_abc");
        assert_eq!(record.token_hash.len(), 64);
        assert_eq!(record.token_hash, RefreshTokenRecord::hash_token("token_abc"));
        assert!(!record.revoked);
        assert!(record.is_usable_at(now));
    }

    #[test]
    fn test_expiry_boundary_is_exclusive() {
        let now = Utc::now();
        let record = RefreshTokenRecord::new(Uuid::new_v4(), "token_abc", now);

        assert!(record.is_usable_at(now - Duration::seconds(1)));
        assert!(!record.is_usable_at(now));
    }

    #[test]
    fn test_revoke_marks_timestamp() {
        let now = Utc::now();
        let mut record =
            RefreshTokenRecord::new(Uuid::new_v4(), "token_abc", RefreshTokenRecord::default_expiry(now));

        record.revoke(now);
        assert!(record.revoked);
        assert_eq!(record.revoked_at, Some(now));
        assert!(!record.is_usable_at(now));
    }

    #[test]
    fn test_default_expiry_is_seven_days() {
        let now = Utc::now();
        assert_eq!(RefreshTokenRecord::default_expiry(now) - now, Duration::days(7));
    }
}
