//! One-time-passcode challenge engine.
//!
//! A challenge binds a numeric code to a `(target, purpose)` pair with an
//! expiry and an attempt bound. At most one challenge per pair is pending at
//! any time: re-issuing invalidates the predecessor so a requester cannot
//! keep guessing against an older, still-unexpired code.

use anyhow::Result;
use chrono::Duration;
use rand::{rngs::OsRng, Rng};
use serde_json::json;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::AuthConfig;
use crate::models::OtpPurpose;
use crate::store::{AuthStore, NewNotification, NewOtpChallenge};
use crate::utils::hash_otp_code;

#[derive(Debug, Error)]
pub enum OtpError {
    #[error("no pending challenge")]
    NotFound,
    #[error("challenge expired")]
    Expired,
    #[error("attempt limit reached")]
    Exhausted,
    #[error("code mismatch")]
    Mismatch,
    #[error("challenge operation failed")]
    Internal(#[source] anyhow::Error),
}

/// Client-facing result of issuing a challenge. The raw code goes only to
/// the notification outbox, never to the caller.
#[derive(Debug, Clone, Copy)]
pub struct CreatedChallenge {
    pub expires_in_seconds: i64,
}

pub struct OtpEngine {
    store: Arc<dyn AuthStore>,
    clock: Arc<dyn Clock>,
    config: AuthConfig,
}

impl OtpEngine {
    #[must_use]
    pub fn new(store: Arc<dyn AuthStore>, clock: Arc<dyn Clock>, config: AuthConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    /// Issue a fresh challenge for `(target, purpose)`, invalidating any
    /// prior pending one, and enqueue its notification in the same store
    /// transaction.
    ///
    /// # Errors
    /// Returns `OtpError::Internal` if code generation or the store fails.
    pub async fn create(
        &self,
        target: &str,
        purpose: OtpPurpose,
        user_id: Option<Uuid>,
    ) -> Result<CreatedChallenge, OtpError> {
        let policy = self.config.otp_policy(purpose);
        let code = generate_code(policy.code_length).map_err(OtpError::Internal)?;
        let now = self.clock.now();

        let challenge = NewOtpChallenge {
            id: Uuid::new_v4(),
            user_id,
            target: target.to_string(),
            purpose,
            code_hash: hash_otp_code(&code),
            expires_at: now + Duration::seconds(policy.ttl_seconds),
            created_at: now,
        };
        let notification = NewNotification {
            target: target.to_string(),
            template: template_for(purpose).to_string(),
            payload: json!({
                "code": code,
                "expires_in_seconds": policy.ttl_seconds,
            }),
        };

        self.store
            .replace_pending_otp(&challenge, &notification)
            .await
            .map_err(OtpError::Internal)?;

        Ok(CreatedChallenge {
            expires_in_seconds: policy.ttl_seconds,
        })
    }

    /// Verify a supplied code against the latest pending challenge.
    ///
    /// The attempt counter is bumped through a single atomic store update
    /// *before* the bound check, so two concurrent guesses cannot both slip
    /// under the limit. With `max_attempts = N`, wrong guesses 1..=N report
    /// `Mismatch` and the (N+1)-th reports `Exhausted`.
    ///
    /// # Errors
    /// Returns the challenge's terminal or mismatch state; store failures
    /// surface as `OtpError::Internal`.
    pub async fn verify(
        &self,
        target: &str,
        purpose: OtpPurpose,
        supplied_code: &str,
    ) -> Result<(), OtpError> {
        let policy = self.config.otp_policy(purpose);
        let now = self.clock.now();

        let challenge = self
            .store
            .find_latest_pending_otp(target, purpose)
            .await
            .map_err(OtpError::Internal)?
            .ok_or(OtpError::NotFound)?;

        if challenge.expires_at <= now {
            // Terminal transition on first observation of expiry.
            self.store
                .mark_otp_consumed(challenge.id, now, false)
                .await
                .map_err(OtpError::Internal)?;
            return Err(OtpError::Expired);
        }

        let attempts = self
            .store
            .increment_otp_attempts(challenge.id)
            .await
            .map_err(OtpError::Internal)?;
        if attempts > policy.max_attempts {
            warn!(challenge_id = %challenge.id, "otp attempt limit exceeded");
            return Err(OtpError::Exhausted);
        }

        let supplied_hash = hash_otp_code(supplied_code);
        if !bool::from(supplied_hash.as_slice().ct_eq(challenge.code_hash.as_slice())) {
            return Err(OtpError::Mismatch);
        }

        self.store
            .mark_otp_consumed(challenge.id, now, true)
            .await
            .map_err(OtpError::Internal)?;
        Ok(())
    }
}

fn template_for(purpose: OtpPurpose) -> &'static str {
    match purpose {
        OtpPurpose::LoginSms => "otp_login_sms",
        OtpPurpose::LoginEmail => "otp_login_email",
        OtpPurpose::PasswordReset => "otp_password_reset",
        OtpPurpose::AccountDeletion => "otp_account_deletion",
    }
}

/// Generate a numeric code from the OS entropy source.
fn generate_code(length: usize) -> Result<String> {
    let mut rng = OsRng;
    let mut code = String::with_capacity(length);
    for _ in 0..length {
        let digit: u8 = rng.gen_range(0..10);
        code.push(char::from(b'0' + digit));
    }
    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::{generate_code, CreatedChallenge, OtpEngine, OtpError};
    use crate::clock::ManualClock;
    use crate::config::{AuthConfig, OtpPolicy};
    use crate::models::OtpPurpose;
    use crate::store::MemoryStore;
    use anyhow::{Context, Result};
    use secrecy::SecretString;
    use std::sync::Arc;

    const NOW: i64 = 1_700_000_000;

    struct Harness {
        engine: OtpEngine,
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(NOW));
        let config = AuthConfig::new(SecretString::from("test-key".to_string()))
            .with_otp_policy(OtpPurpose::LoginSms, OtpPolicy::new(6, 300, 3));
        let engine = OtpEngine::new(
            Arc::clone(&store) as Arc<dyn crate::store::AuthStore>,
            Arc::clone(&clock) as Arc<dyn crate::clock::Clock>,
            config,
        );
        Harness {
            engine,
            store,
            clock,
        }
    }

    async fn latest_code(store: &MemoryStore) -> Result<String> {
        let outbox = store.outbox().await;
        let entry = outbox.last().context("outbox is empty")?;
        let code = entry
            .payload
            .get("code")
            .and_then(serde_json::Value::as_str)
            .context("payload missing code")?;
        Ok(code.to_string())
    }

    #[test]
    fn generated_codes_are_numeric_with_length() {
        for length in [4, 6, 8] {
            let code = generate_code(length).expect("generate code");
            assert_eq!(code.len(), length);
            assert!(code.chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[tokio::test]
    async fn create_and_verify_round_trip() -> Result<()> {
        let h = harness();
        let CreatedChallenge { expires_in_seconds } = h
            .engine
            .create("+14155550123", OtpPurpose::LoginSms, None)
            .await?;
        assert_eq!(expires_in_seconds, 300);

        let code = latest_code(&h.store).await?;
        h.engine
            .verify("+14155550123", OtpPurpose::LoginSms, &code)
            .await?;

        // Verified challenges are consumed; a second verify finds nothing.
        let result = h
            .engine
            .verify("+14155550123", OtpPurpose::LoginSms, &code)
            .await;
        assert!(matches!(result, Err(OtpError::NotFound)));
        Ok(())
    }

    #[tokio::test]
    async fn verify_without_challenge_is_not_found() {
        let h = harness();
        let result = h
            .engine
            .verify("+14155550123", OtpPurpose::LoginSms, "123456")
            .await;
        assert!(matches!(result, Err(OtpError::NotFound)));
    }

    #[tokio::test]
    async fn expired_challenge_is_terminal() -> Result<()> {
        let h = harness();
        h.engine
            .create("+14155550123", OtpPurpose::LoginSms, None)
            .await?;
        let code = latest_code(&h.store).await?;

        h.clock.advance(300);
        let result = h
            .engine
            .verify("+14155550123", OtpPurpose::LoginSms, &code)
            .await;
        assert!(matches!(result, Err(OtpError::Expired)));

        // The expiry transition consumed the challenge.
        let result = h
            .engine
            .verify("+14155550123", OtpPurpose::LoginSms, &code)
            .await;
        assert!(matches!(result, Err(OtpError::NotFound)));
        Ok(())
    }

    #[tokio::test]
    async fn attempt_bound_has_off_by_one_semantics() -> Result<()> {
        let h = harness();
        h.engine
            .create("+14155550123", OtpPurpose::LoginSms, None)
            .await?;
        let code = latest_code(&h.store).await?;
        let wrong = if code == "000000" { "111111" } else { "000000" };

        // max_attempts = 3: the first three wrong guesses are mismatches.
        for _ in 0..3 {
            let result = h
                .engine
                .verify("+14155550123", OtpPurpose::LoginSms, wrong)
                .await;
            assert!(matches!(result, Err(OtpError::Mismatch)));
        }

        // The fourth call reports exhaustion, even with the right code.
        let result = h
            .engine
            .verify("+14155550123", OtpPurpose::LoginSms, &code)
            .await;
        assert!(matches!(result, Err(OtpError::Exhausted)));
        Ok(())
    }

    #[tokio::test]
    async fn reissue_invalidates_prior_challenge() -> Result<()> {
        let h = harness();
        h.engine
            .create("a@example.com", OtpPurpose::LoginSms, None)
            .await?;
        let first_code = latest_code(&h.store).await?;

        h.engine
            .create("a@example.com", OtpPurpose::LoginSms, None)
            .await?;
        let second_code = latest_code(&h.store).await?;

        // The older code now verifies against the newer challenge's hash and
        // cannot succeed; when codes collide the challenge is simply the new
        // one, so use mismatching codes for the assertion.
        if first_code != second_code {
            let result = h
                .engine
                .verify("a@example.com", OtpPurpose::LoginSms, &first_code)
                .await;
            assert!(matches!(result, Err(OtpError::Mismatch)));
        }

        h.engine
            .verify("a@example.com", OtpPurpose::LoginSms, &second_code)
            .await?;
        Ok(())
    }

    #[tokio::test]
    async fn purposes_are_independent() -> Result<()> {
        let h = harness();
        h.engine
            .create("a@example.com", OtpPurpose::LoginEmail, None)
            .await?;
        let login_code = latest_code(&h.store).await?;

        h.engine
            .create("a@example.com", OtpPurpose::PasswordReset, None)
            .await?;

        // The login challenge is untouched by the password-reset issuance.
        h.engine
            .verify("a@example.com", OtpPurpose::LoginEmail, &login_code)
            .await?;
        Ok(())
    }
}
