//! Time-based one-time password (RFC 6238) enrollment and verification.

use std::time::{SystemTime, UNIX_EPOCH};

use rand::{rngs::OsRng, RngCore};
use totp_rs::{Algorithm, Secret, TOTP};

/// 160-bit shared secrets.
pub const SECRET_BYTES: usize = 20;
pub const TIME_STEP_SECONDS: u64 = 30;
const DIGITS: usize = 6;
/// Adjacent windows accepted on either side of the current one.
const SKEW: u8 = 1;

#[derive(Debug, Clone, Copy, Default)]
pub struct SecondFactorVerifier;

impl SecondFactorVerifier {
    pub fn new() -> Self {
        Self
    }

    /// Fresh base32 secret from the OS RNG.
    pub fn generate_secret(&self) -> String {
        let mut bytes = [0u8; SECRET_BYTES];
        OsRng.fill_bytes(&mut bytes);
        Secret::Raw(bytes.to_vec()).to_encoded().to_string()
    }

    /// A clock set before the epoch never validates.
    pub fn validate_code(&self, secret: &str, code: &str) -> bool {
        match unix_now() {
            Some(now) => self.validate_code_at(secret, code, now),
            None => false,
        }
    }

    /// Check `code` against the windows around `timestamp`.
    ///
    /// Malformed secrets and codes are a mismatch, never an error.
    pub fn validate_code_at(&self, secret: &str, code: &str, timestamp: u64) -> bool {
        let code = code.trim();
        if code.len() != DIGITS || !code.bytes().all(|b| b.is_ascii_digit()) {
            return false;
        }
        // The earliest accepted window would precede the epoch.
        if timestamp / TIME_STEP_SECONDS < u64::from(SKEW) {
            return false;
        }
        match build_totp(secret) {
            Some(totp) => totp.check(code, timestamp),
            None => false,
        }
    }

    /// Provisioning URI for authenticator apps.
    pub fn build_enrollment_uri(&self, account_label: &str, secret: &str, issuer_label: &str) -> String {
        let issuer = urlencoding::encode(issuer_label);
        format!(
            "otpauth://totp/{issuer}:{account}?secret={secret}&issuer={issuer}",
            account = urlencoding::encode(account_label),
        )
    }
}

fn build_totp(secret: &str) -> Option<TOTP> {
    let normalized: String = secret
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '=')
        .collect::<String>()
        .to_ascii_uppercase();
    if normalized.is_empty() {
        return None;
    }
    let bytes = Secret::Encoded(normalized).to_bytes().ok()?;
    Some(TOTP::new_unchecked(
        Algorithm::SHA1,
        DIGITS,
        SKEW,
        TIME_STEP_SECONDS,
        bytes,
    ))
}

fn unix_now() -> Option<u64> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .ok()
        .map(|d| d.as_secs())
}
