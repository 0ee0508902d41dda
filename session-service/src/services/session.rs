//! Session orchestration: session start, refresh rotation, second factor,
//! sign-out and access-token authentication.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::config::TotpConfig;
use crate::dtos::auth::{
    ConfirmSecondFactorRequest, LogoutRequest, RefreshRequest, SecondFactorEnrollmentResponse,
    StartSessionRequest, TokenResponse, VerifySecondFactorRequest,
};
use crate::models::{RefreshTokenRecord, UserCredentialProfile};
use crate::services::error::{ServiceError, StoreError};
use crate::services::identity::{ActorContext, IdentityStore};
use crate::services::jwt::{AccessClaims, ClaimSet, TokenIssuer};
use crate::services::refresh_store::RefreshTokenStore;
use crate::services::totp::SecondFactorVerifier;

const ENROLLMENT_MESSAGE: &str = "Scan the QR code with your authenticator app";

/// Coordinates the token issuer, second-factor verifier and stores.
/// Holds no session state of its own.
#[derive(Clone)]
pub struct SessionService {
    tokens: TokenIssuer,
    verifier: SecondFactorVerifier,
    totp_issuer: String,
    identity: Arc<dyn IdentityStore>,
    refresh_tokens: Arc<dyn RefreshTokenStore>,
}

impl SessionService {
    pub fn new(
        tokens: TokenIssuer,
        totp: &TotpConfig,
        identity: Arc<dyn IdentityStore>,
        refresh_tokens: Arc<dyn RefreshTokenStore>,
    ) -> Self {
        Self {
            tokens,
            verifier: SecondFactorVerifier::new(),
            totp_issuer: totp.issuer.clone(),
            identity,
            refresh_tokens,
        }
    }

    pub fn token_issuer(&self) -> &TokenIssuer {
        &self.tokens
    }

    /// Complete a login whose password was checked by the identity store.
    ///
    /// Users with second factor enabled must present a valid code.
    #[instrument(skip_all, fields(user_name = %request.username))]
    pub async fn start_session(
        &self,
        request: &StartSessionRequest,
    ) -> Result<TokenResponse, ServiceError> {
        request.validate()?;

        let user = self
            .identity
            .find_user_by_name(&request.username)
            .await
            .map_err(storage_failure)?
            .ok_or_else(|| {
                warn!("Session start for unknown user");
                ServiceError::Unauthorized
            })?;

        if user.totp_enabled {
            let verified = match (user.active_second_factor(), request.code.as_deref()) {
                (Some(secret), Some(code)) => self.verifier.validate_code(secret, code),
                _ => false,
            };
            if !verified {
                warn!(user_id = %user.id, "Second factor missing or invalid at session start");
                return Err(ServiceError::Unauthorized);
            }
        }

        let response = self.issue_session(&user).await?;
        info!(user_id = %user.id, "Session started");
        Ok(response)
    }

    /// Exchange a refresh token for a new pair. The presented token is
    /// revoked before anything is issued; losing a concurrent rotation is
    /// an authentication failure.
    #[instrument(skip_all)]
    pub async fn refresh(&self, request: &RefreshRequest) -> Result<TokenResponse, ServiceError> {
        request.validate()?;

        let record = self
            .refresh_tokens
            .fetch_usable(&request.refresh_token, Utc::now())
            .await
            .map_err(storage_failure)?
            .ok_or_else(|| {
                warn!("Refresh token unknown, revoked or expired");
                ServiceError::Unauthorized
            })?;

        let revoked = self
            .refresh_tokens
            .revoke(&request.refresh_token)
            .await
            .map_err(storage_failure)?;
        if !revoked {
            warn!(user_id = %record.user_id, "Refresh token consumed by a concurrent rotation");
            return Err(ServiceError::Unauthorized);
        }

        let user = self
            .identity
            .find_user_by_id(record.user_id)
            .await
            .map_err(storage_failure)?
            .ok_or_else(|| {
                warn!(user_id = %record.user_id, "Refresh token owner no longer exists");
                ServiceError::Unauthorized
            })?;

        let response = self.issue_session(&user).await?;
        info!(user_id = %user.id, "Refresh token rotated");
        Ok(response)
    }

    /// Roles are read fresh on every issuance.
    async fn issue_session(&self, user: &UserCredentialProfile) -> Result<TokenResponse, ServiceError> {
        let roles = self
            .identity
            .get_roles(user.id)
            .await
            .map_err(storage_failure)?;

        let access = self.tokens.issue_access_token(&ClaimSet::for_user(user, roles))?;
        let refresh_value = self.tokens.issue_refresh_token_value();

        self.refresh_tokens
            .save(
                user.id,
                &refresh_value,
                RefreshTokenRecord::default_expiry(Utc::now()),
            )
            .await
            .map_err(storage_failure)?;

        Ok(TokenResponse::bearer(access.token, refresh_value))
    }

    /// Start enrollment. A secret is generated and stored only if the user
    /// has none; second factor stays disabled until confirmed.
    #[instrument(skip(self, actor))]
    pub async fn enable_second_factor(
        &self,
        user_id: Uuid,
        actor: &dyn ActorContext,
    ) -> Result<SecondFactorEnrollmentResponse, ServiceError> {
        let mut user = self.require_user(user_id).await?;

        if user.active_secret().is_none() {
            let generated = self.verifier.generate_secret();
            let stored = self
                .identity
                .set_pending_secret(user.id, &generated)
                .await
                .map_err(storage_failure)?;
            if stored {
                let actor = actor.current_actor_label().unwrap_or_else(|| "system".to_string());
                info!(user_id = %user.id, actor = %actor, "Second factor secret generated");
            }
            // A concurrent enrollment may have stored its secret first.
            user = self.require_user(user_id).await?;
        }

        let secret = user
            .active_secret()
            .map(str::to_string)
            .ok_or_else(|| {
                warn!(user_id = %user.id, "Second factor secret missing after enrollment");
                ServiceError::Unauthorized
            })?;

        let qr_code_uri =
            self.verifier
                .build_enrollment_uri(user.account_label(), &secret, &self.totp_issuer);

        Ok(SecondFactorEnrollmentResponse {
            secret,
            qr_code_uri,
            message: ENROLLMENT_MESSAGE.to_string(),
        })
    }

    /// Turn second factor on once a code validates against the pending secret.
    #[instrument(skip(self, request, actor))]
    pub async fn confirm_second_factor(
        &self,
        user_id: Uuid,
        request: &ConfirmSecondFactorRequest,
        actor: &dyn ActorContext,
    ) -> Result<(), ServiceError> {
        request.validate()?;

        let mut user = self.require_user(user_id).await?;

        let valid = user
            .totp_secret
            .as_deref()
            .filter(|s| !s.is_empty())
            .is_some_and(|secret| self.verifier.validate_code(secret, &request.code));
        if !valid {
            warn!(user_id = %user.id, "Second factor confirmation rejected");
            return Err(ServiceError::Unauthorized);
        }

        if !user.totp_enabled {
            user.totp_enabled = true;
            self.identity.update_user(&user, actor).await?;
            info!(user_id = %user.id, "Second factor enabled");
        }
        Ok(())
    }

    /// Challenge a user's second factor. Every negative outcome is the same
    /// `Unauthorized`.
    #[instrument(skip_all, fields(user_name = %request.username))]
    pub async fn verify_second_factor(
        &self,
        request: &VerifySecondFactorRequest,
    ) -> Result<(), ServiceError> {
        request.validate()?;

        let user = self
            .identity
            .find_user_by_name(&request.username)
            .await
            .map_err(storage_failure)?;

        let verified = user
            .as_ref()
            .and_then(|u| u.active_second_factor())
            .is_some_and(|secret| self.verifier.validate_code(secret, &request.code));

        if !verified {
            warn!("Second factor challenge rejected");
            return Err(ServiceError::Unauthorized);
        }
        Ok(())
    }

    /// Revoke one refresh token. `false` if it was already unusable.
    ///
    /// Access tokens already issued stay valid until they expire.
    #[instrument(skip_all)]
    pub async fn end_session(&self, request: &LogoutRequest) -> Result<bool, ServiceError> {
        request.validate()?;

        let revoked = self
            .refresh_tokens
            .revoke(&request.refresh_token)
            .await
            .map_err(storage_failure)?;
        if revoked {
            info!("Session ended");
        }
        Ok(revoked)
    }

    /// Revoke every live refresh token of a user.
    #[instrument(skip(self))]
    pub async fn end_all_sessions(&self, user_id: Uuid) -> Result<u64, ServiceError> {
        let count = self
            .refresh_tokens
            .revoke_all_for_user(user_id)
            .await
            .map_err(storage_failure)?;
        info!(user_id = %user_id, revoked = count, "All sessions ended");
        Ok(count)
    }

    pub fn authenticate(&self, access_token: &str) -> Result<AccessClaims, ServiceError> {
        self.tokens
            .validate_access_token(access_token)
            .ok_or(ServiceError::Unauthorized)
    }

    async fn require_user(&self, user_id: Uuid) -> Result<UserCredentialProfile, ServiceError> {
        self.identity
            .find_user_by_id(user_id)
            .await
            .map_err(storage_failure)?
            .ok_or_else(|| {
                warn!(user_id = %user_id, "Authenticated user no longer exists");
                ServiceError::Unauthorized
            })
    }
}

pub fn require_role(claims: &AccessClaims, role: &str) -> Result<(), ServiceError> {
    if claims.has_role(role) {
        Ok(())
    } else {
        warn!(user = %claims.name, role, "Missing required role");
        Err(ServiceError::Forbidden(role.to_string()))
    }
}

fn storage_failure(e: StoreError) -> ServiceError {
    error!(error = %e, "Storage failure");
    ServiceError::Storage(e)
}

/// Run `operation` unless `cancel` fires first.
///
/// A token already cancelled wins before the operation is first polled, so
/// nothing is written. Cancellation after the store acknowledged a write
/// does not undo it.
pub async fn run_cancellable<F, T>(cancel: &CancellationToken, operation: F) -> Result<T, ServiceError>
where
    F: Future<Output = Result<T, ServiceError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ServiceError::Cancelled),
        result = operation => result,
    }
}

pub async fn run_with_deadline<F, T>(deadline: Duration, operation: F) -> Result<T, ServiceError>
where
    F: Future<Output = Result<T, ServiceError>>,
{
    tokio::time::timeout(deadline, operation)
        .await
        .map_err(|_| ServiceError::Cancelled)?
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claims(roles: &[&str]) -> AccessClaims {
        AccessClaims {
            sub: Uuid::new_v4().to_string(),
            name: "op1".to_string(),
            email: "op1@plant.io".to_string(),
            roles: roles.iter().map(|r| r.to_string()).collect(),
            iss: "plant-api".to_string(),
            aud: "plant-clients".to_string(),
            iat: 0,
            exp: 0,
        }
    }

    #[test]
    fn require_role_checks_membership() {
        assert!(require_role(&claims(&["Operator"]), "Operator").is_ok());
        assert!(matches!(
            require_role(&claims(&["Operator"]), "Manager"),
            Err(ServiceError::Forbidden(role)) if role == "Manager"
        ));
        assert!(require_role(&claims(&[]), "Operator").is_err());
    }

    #[tokio::test]
    async fn cancelled_token_wins_before_first_poll() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let polled = std::sync::atomic::AtomicBool::new(false);
        let result = run_cancellable(&cancel, async {
            polled.store(true, std::sync::atomic::Ordering::SeqCst);
            Ok::<_, ServiceError>(())
        })
        .await;

        assert!(matches!(result, Err(ServiceError::Cancelled)));
        assert!(!polled.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn uncancelled_operation_completes() {
        let cancel = CancellationToken::new();
        let result = run_cancellable(&cancel, async { Ok::<_, ServiceError>(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn deadline_elapses_into_cancelled() {
        let result = run_with_deadline(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, ServiceError>(())
        })
        .await;
        assert!(matches!(result, Err(ServiceError::Cancelled)));
    }
}
