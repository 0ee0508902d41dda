use std::collections::BTreeSet;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::{rngs::OsRng, RngCore};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::config::JwtConfig;
use crate::models::UserCredentialProfile;

pub const ACCESS_TOKEN_LIFETIME_MINUTES: i64 = 15;
/// Raw entropy behind each refresh token value.
pub const REFRESH_TOKEN_BYTES: usize = 64;
/// HS256 keys shorter than the hash output are rejected.
pub const MIN_SIGNING_KEY_BYTES: usize = 32;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("JWT signing key is not configured")]
    MissingSigningKey,

    #[error("JWT signing key must be at least {MIN_SIGNING_KEY_BYTES} bytes")]
    WeakSigningKey,

    #[error("JWT issuer is not configured")]
    MissingIssuer,

    #[error("JWT audience is not configured")]
    MissingAudience,

    #[error("Failed to encode access token: {0}")]
    Encode(#[from] jsonwebtoken::errors::Error),
}

impl TokenError {
    pub fn is_configuration(&self) -> bool {
        !matches!(self, TokenError::Encode(_))
    }
}

/// Identity facts baked into an access token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimSet {
    pub subject: Uuid,
    pub name: String,
    pub email: String,
    pub roles: BTreeSet<String>,
}

impl ClaimSet {
    pub fn for_user(user: &UserCredentialProfile, roles: BTreeSet<String>) -> Self {
        Self {
            subject: user.id,
            name: user.user_name.clone(),
            email: user.email.clone(),
            roles,
        }
    }
}

/// Claims carried by access tokens
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessClaims {
    /// Subject (user ID)
    pub sub: String,
    /// User name
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub roles: Vec<String>,
    pub iss: String,
    pub aud: String,
    /// Issued at (Unix timestamp)
    pub iat: i64,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
}

impl AccessClaims {
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    pub fn user_id(&self) -> Option<Uuid> {
        Uuid::parse_str(&self.sub).ok()
    }
}

/// A signed access token and the claims inside it.
#[derive(Debug, Clone)]
pub struct IssuedAccessToken {
    pub token: String,
    pub claims: AccessClaims,
}

/// Issues and validates HS256 access tokens and opaque refresh values.
#[derive(Clone)]
pub struct TokenIssuer {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    issuer: String,
    audience: String,
}

impl TokenIssuer {
    /// Fails when the key, issuer or audience is missing, or the key is weak.
    pub fn new(config: &JwtConfig) -> Result<Self, TokenError> {
        let key = config.signing_key.expose_secret();
        if key.trim().is_empty() {
            return Err(TokenError::MissingSigningKey);
        }
        if key.len() < MIN_SIGNING_KEY_BYTES {
            return Err(TokenError::WeakSigningKey);
        }
        if config.issuer.trim().is_empty() {
            return Err(TokenError::MissingIssuer);
        }
        if config.audience.trim().is_empty() {
            return Err(TokenError::MissingAudience);
        }

        tracing::info!(issuer = %config.issuer, audience = %config.audience, "Token issuer initialized with HS256 key");

        Ok(Self {
            encoding_key: EncodingKey::from_secret(key.as_bytes()),
            decoding_key: DecodingKey::from_secret(key.as_bytes()),
            issuer: config.issuer.clone(),
            audience: config.audience.clone(),
        })
    }

    pub fn issue_access_token(&self, claims: &ClaimSet) -> Result<IssuedAccessToken, TokenError> {
        self.issue_access_token_at(claims, Utc::now())
    }

    pub fn issue_access_token_at(
        &self,
        claims: &ClaimSet,
        now: DateTime<Utc>,
    ) -> Result<IssuedAccessToken, TokenError> {
        let exp = now + Duration::minutes(ACCESS_TOKEN_LIFETIME_MINUTES);

        let claims = AccessClaims {
            sub: claims.subject.to_string(),
            name: claims.name.clone(),
            email: claims.email.clone(),
            roles: claims.roles.iter().cloned().collect(),
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            iat: now.timestamp(),
            exp: exp.timestamp(),
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)?;

        Ok(IssuedAccessToken { token, claims })
    }

    /// Opaque refresh value: 64 random bytes, standard base64.
    pub fn issue_refresh_token_value(&self) -> String {
        let mut bytes = [0u8; REFRESH_TOKEN_BYTES];
        OsRng.fill_bytes(&mut bytes);
        STANDARD.encode(bytes)
    }

    /// Validate signature, issuer, audience and lifetime. Any failure is `None`.
    pub fn validate_access_token(&self, token: &str) -> Option<AccessClaims> {
        self.validate_access_token_at(token, Utc::now())
    }

    pub fn validate_access_token_at(&self, token: &str, now: DateTime<Utc>) -> Option<AccessClaims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        // Expiry is checked against `now` below, with no clock-skew allowance.
        validation.validate_exp = false;
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[&self.audience]);
        validation.set_required_spec_claims(&["exp", "iss", "aud", "sub"]);

        let data = match decode::<AccessClaims>(token, &self.decoding_key, &validation) {
            Ok(data) => data,
            Err(e) => {
                tracing::debug!(error = %e, "Access token rejected");
                return None;
            }
        };

        if now.timestamp() >= data.claims.exp {
            tracing::debug!(exp = data.claims.exp, "Access token expired");
            return None;
        }

        Some(data.claims)
    }

    /// Access token lifetime in seconds (for client info)
    pub fn access_token_expiry_seconds(&self) -> i64 {
        ACCESS_TOKEN_LIFETIME_MINUTES * 60
    }
}
