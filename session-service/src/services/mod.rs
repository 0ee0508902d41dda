//! Services layer for session-service.
//!
//! Token issuance, second factor, refresh rotation, audit capture and the
//! storage adapters behind them.

pub mod audit;
mod database;
pub mod error;
pub mod identity;
pub mod jwt;
mod memory;
pub mod refresh_store;
pub mod sensors;
pub mod session;
pub mod totp;

pub use audit::{
    AuditError, AuditInterceptor, Auditable, ChangeSet, CommitSummary, EntityKind, EntityStore,
    EntityWrite, Snapshot, SnapshotError, SYSTEM_ACTOR,
};
pub use database::Database;
pub use error::{ServiceError, StoreError};
pub use identity::{ActorContext, IdentityStore, RequestActor};
pub use jwt::{AccessClaims, ClaimSet, IssuedAccessToken, TokenError, TokenIssuer};
pub use memory::InMemoryStore;
pub use refresh_store::RefreshTokenStore;
pub use sensors::{SensorReadingService, MANAGER_ROLE, OPERATOR_ROLE};
pub use session::{require_role, run_cancellable, run_with_deadline, SessionService};
pub use totp::SecondFactorVerifier;
