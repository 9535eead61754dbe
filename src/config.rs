//! Engine configuration: token TTLs, OTP policy, and admission quotas.

use secrecy::SecretString;
use std::collections::HashMap;

use crate::models::OtpPurpose;
use crate::rate_limit::RateCategory;

const DEFAULT_ISSUER: &str = "aliro";
const DEFAULT_ACCESS_TOKEN_TTL_SECONDS: i64 = 15 * 60;
const DEFAULT_REFRESH_TOKEN_TTL_SECONDS: i64 = 30 * 24 * 60 * 60;
const DEFAULT_OTP_LENGTH: usize = 6;
const DEFAULT_OTP_TTL_SECONDS: i64 = 5 * 60;
const DEFAULT_OTP_MAX_ATTEMPTS: i32 = 5;
const DEFAULT_RESET_OTP_TTL_SECONDS: i64 = 10 * 60;

/// Per-purpose one-time-code policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OtpPolicy {
    pub code_length: usize,
    pub ttl_seconds: i64,
    pub max_attempts: i32,
}

impl OtpPolicy {
    #[must_use]
    pub fn new(code_length: usize, ttl_seconds: i64, max_attempts: i32) -> Self {
        Self {
            code_length,
            ttl_seconds,
            max_attempts,
        }
    }
}

/// Per-category admission quota: `capacity` requests per fixed `window_seconds`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateQuota {
    pub capacity: u32,
    pub window_seconds: i64,
}

impl RateQuota {
    #[must_use]
    pub fn new(capacity: u32, window_seconds: i64) -> Self {
        Self {
            capacity,
            window_seconds,
        }
    }
}

#[derive(Clone, Debug)]
pub struct AuthConfig {
    signing_key: SecretString,
    issuer: String,
    access_token_ttl_seconds: i64,
    refresh_token_ttl_seconds: i64,
    otp_policies: HashMap<OtpPurpose, OtpPolicy>,
    rate_quotas: HashMap<RateCategory, RateQuota>,
}

impl AuthConfig {
    #[must_use]
    pub fn new(signing_key: SecretString) -> Self {
        let mut otp_policies = HashMap::new();
        otp_policies.insert(
            OtpPurpose::LoginSms,
            OtpPolicy::new(
                DEFAULT_OTP_LENGTH,
                DEFAULT_OTP_TTL_SECONDS,
                DEFAULT_OTP_MAX_ATTEMPTS,
            ),
        );
        otp_policies.insert(
            OtpPurpose::LoginEmail,
            OtpPolicy::new(
                DEFAULT_OTP_LENGTH,
                DEFAULT_OTP_TTL_SECONDS,
                DEFAULT_OTP_MAX_ATTEMPTS,
            ),
        );
        otp_policies.insert(
            OtpPurpose::PasswordReset,
            OtpPolicy::new(
                DEFAULT_OTP_LENGTH,
                DEFAULT_RESET_OTP_TTL_SECONDS,
                DEFAULT_OTP_MAX_ATTEMPTS,
            ),
        );
        otp_policies.insert(
            OtpPurpose::AccountDeletion,
            OtpPolicy::new(
                DEFAULT_OTP_LENGTH,
                DEFAULT_RESET_OTP_TTL_SECONDS,
                DEFAULT_OTP_MAX_ATTEMPTS,
            ),
        );

        let mut rate_quotas = HashMap::new();
        rate_quotas.insert(RateCategory::Auth, RateQuota::new(5, 60));
        rate_quotas.insert(RateCategory::Otp, RateQuota::new(3, 60));
        rate_quotas.insert(RateCategory::General, RateQuota::new(100, 60));

        Self {
            signing_key,
            issuer: DEFAULT_ISSUER.to_string(),
            access_token_ttl_seconds: DEFAULT_ACCESS_TOKEN_TTL_SECONDS,
            refresh_token_ttl_seconds: DEFAULT_REFRESH_TOKEN_TTL_SECONDS,
            otp_policies,
            rate_quotas,
        }
    }

    #[must_use]
    pub fn with_issuer(mut self, issuer: String) -> Self {
        self.issuer = issuer;
        self
    }

    #[must_use]
    pub fn with_access_token_ttl_seconds(mut self, seconds: i64) -> Self {
        self.access_token_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_refresh_token_ttl_seconds(mut self, seconds: i64) -> Self {
        self.refresh_token_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_otp_policy(mut self, purpose: OtpPurpose, policy: OtpPolicy) -> Self {
        self.otp_policies.insert(purpose, policy);
        self
    }

    #[must_use]
    pub fn with_rate_quota(mut self, category: RateCategory, quota: RateQuota) -> Self {
        self.rate_quotas.insert(category, quota);
        self
    }

    pub(crate) fn signing_key(&self) -> &SecretString {
        &self.signing_key
    }

    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    #[must_use]
    pub fn access_token_ttl_seconds(&self) -> i64 {
        self.access_token_ttl_seconds
    }

    #[must_use]
    pub fn refresh_token_ttl_seconds(&self) -> i64 {
        self.refresh_token_ttl_seconds
    }

    /// Policy lookup never fails: unknown purposes fall back to the login
    /// defaults so a misconfigured override cannot disable the attempt bound.
    #[must_use]
    pub fn otp_policy(&self, purpose: OtpPurpose) -> OtpPolicy {
        self.otp_policies.get(&purpose).copied().unwrap_or(OtpPolicy::new(
            DEFAULT_OTP_LENGTH,
            DEFAULT_OTP_TTL_SECONDS,
            DEFAULT_OTP_MAX_ATTEMPTS,
        ))
    }

    #[must_use]
    pub fn rate_quota(&self, category: RateCategory) -> RateQuota {
        self.rate_quotas
            .get(&category)
            .copied()
            .unwrap_or(RateQuota::new(5, 60))
    }
}

#[cfg(test)]
mod tests {
    use super::{AuthConfig, OtpPolicy, RateQuota};
    use crate::models::OtpPurpose;
    use crate::rate_limit::RateCategory;
    use secrecy::SecretString;

    fn config() -> AuthConfig {
        AuthConfig::new(SecretString::from("test-signing-key".to_string()))
    }

    #[test]
    fn defaults_and_overrides() {
        let config = config();
        assert_eq!(config.issuer(), "aliro");
        assert_eq!(config.access_token_ttl_seconds(), 15 * 60);
        assert_eq!(config.refresh_token_ttl_seconds(), 30 * 24 * 60 * 60);

        let config = config
            .with_issuer("auth.test".to_string())
            .with_access_token_ttl_seconds(120)
            .with_refresh_token_ttl_seconds(3600);
        assert_eq!(config.issuer(), "auth.test");
        assert_eq!(config.access_token_ttl_seconds(), 120);
        assert_eq!(config.refresh_token_ttl_seconds(), 3600);
    }

    #[test]
    fn password_reset_gets_longer_ttl_by_default() {
        let config = config();
        let login = config.otp_policy(OtpPurpose::LoginSms);
        let reset = config.otp_policy(OtpPurpose::PasswordReset);
        assert_eq!(login.ttl_seconds, 5 * 60);
        assert_eq!(reset.ttl_seconds, 10 * 60);
        assert_eq!(login.max_attempts, reset.max_attempts);
    }

    #[test]
    fn otp_policy_override_applies() {
        let config = config().with_otp_policy(OtpPurpose::LoginSms, OtpPolicy::new(8, 60, 3));
        let policy = config.otp_policy(OtpPurpose::LoginSms);
        assert_eq!(policy.code_length, 8);
        assert_eq!(policy.max_attempts, 3);
    }

    #[test]
    fn rate_quota_tiers() {
        let config = config();
        assert!(
            config.rate_quota(RateCategory::Otp).capacity
                < config.rate_quota(RateCategory::Auth).capacity
        );
        assert!(
            config.rate_quota(RateCategory::Auth).capacity
                < config.rate_quota(RateCategory::General).capacity
        );

        let config = config.with_rate_quota(RateCategory::Auth, RateQuota::new(2, 30));
        assert_eq!(config.rate_quota(RateCategory::Auth).capacity, 2);
        assert_eq!(config.rate_quota(RateCategory::Auth).window_seconds, 30);
    }
}
