pub mod audit_entry;
pub mod refresh_token;
pub mod sensor_reading;
pub mod user;

pub use audit_entry::{AuditAction, AuditEntry};
pub use refresh_token::{RefreshTokenRecord, REFRESH_TOKEN_LIFETIME_DAYS};
pub use sensor_reading::SensorReading;
pub use user::UserCredentialProfile;
