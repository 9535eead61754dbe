//! Domain records persisted through the credential store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{postgres::PgRow, FromRow, Row};
use uuid::Uuid;

/// Closed role enumeration carried in access-token claims.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    User,
    ServiceProvider,
    Admin,
    Support,
    ItAdmin,
}

impl Role {
    /// Parse the persisted `users.role` textual value into a typed enum.
    pub(crate) fn from_db(value: &str) -> Result<Self, sqlx::Error> {
        match value {
            "user" => Ok(Self::User),
            "service_provider" => Ok(Self::ServiceProvider),
            "admin" => Ok(Self::Admin),
            "support" => Ok(Self::Support),
            "it_admin" => Ok(Self::ItAdmin),
            _ => Err(sqlx::Error::Decode(Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid users.role value: {value}"),
            )))),
        }
    }

    pub(crate) fn as_db(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::ServiceProvider => "service_provider",
            Self::Admin => "admin",
            Self::Support => "support",
            Self::ItAdmin => "it_admin",
        }
    }
}

/// Purpose tag binding a one-time code to the flow that requested it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OtpPurpose {
    LoginSms,
    LoginEmail,
    PasswordReset,
    AccountDeletion,
}

impl OtpPurpose {
    pub(crate) fn from_db(value: &str) -> Result<Self, sqlx::Error> {
        match value {
            "login_sms" => Ok(Self::LoginSms),
            "login_email" => Ok(Self::LoginEmail),
            "password_reset" => Ok(Self::PasswordReset),
            "account_deletion" => Ok(Self::AccountDeletion),
            _ => Err(sqlx::Error::Decode(Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid otp_challenges.purpose value: {value}"),
            )))),
        }
    }

    pub(crate) fn as_db(self) -> &'static str {
        match self {
            Self::LoginSms => "login_sms",
            Self::LoginEmail => "login_email",
            Self::PasswordReset => "password_reset",
            Self::AccountDeletion => "account_deletion",
        }
    }
}

/// Identity record. Users are never hard-deleted; deactivation flips
/// `is_active` and leaves the row in place.
#[derive(Debug, Clone)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub phone: Option<String>,
    /// Absent for federated-only accounts.
    pub password_hash: Option<String>,
    /// Post-verification federated subject, when the account is linked.
    pub federated_subject: Option<String>,
    pub role: Role,
    pub is_active: bool,
    pub email_verified: bool,
    pub phone_verified: bool,
    pub last_login_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for User {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let role: String = row.try_get("role")?;
        Ok(Self {
            id: row.try_get("id")?,
            email: row.try_get("email")?,
            phone: row.try_get("phone")?,
            password_hash: row.try_get("password_hash")?,
            federated_subject: row.try_get("federated_subject")?,
            role: Role::from_db(&role)?,
            is_active: row.try_get("is_active")?,
            email_verified: row.try_get("email_verified")?,
            phone_verified: row.try_get("phone_verified")?,
            last_login_at: row.try_get("last_login_at")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

/// Persisted refresh token. Only the SHA-256 digest of the raw token is
/// stored; `rotated_to` marks rows that were superseded by rotation and is
/// what distinguishes reuse from an ordinary logout-revoked token.
#[derive(Debug, Clone)]
pub struct RefreshTokenRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub token_hash: Vec<u8>,
    pub session_id: Option<Uuid>,
    pub expires_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub rotated_to: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl RefreshTokenRecord {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.revoked_at.is_none() && self.expires_at > now
    }
}

impl<'r> FromRow<'r, PgRow> for RefreshTokenRecord {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            token_hash: row.try_get("token_hash")?,
            session_id: row.try_get("session_id")?,
            expires_at: row.try_get("expires_at")?,
            revoked_at: row.try_get("revoked_at")?,
            rotated_to: row.try_get("rotated_to")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

/// One-time challenge bound to a `(target, purpose)` pair.
///
/// A challenge is pending while `consumed_at` is unset and the expiry has not
/// passed; `attempts` only ever increases.
#[derive(Debug, Clone)]
pub struct OtpChallenge {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub target: String,
    pub purpose: OtpPurpose,
    pub code_hash: Vec<u8>,
    pub attempts: i32,
    pub expires_at: DateTime<Utc>,
    pub consumed_at: Option<DateTime<Utc>>,
    pub verified_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for OtpChallenge {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let purpose: String = row.try_get("purpose")?;
        Ok(Self {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            target: row.try_get("target")?,
            purpose: OtpPurpose::from_db(&purpose)?,
            code_hash: row.try_get("code_hash")?,
            attempts: row.try_get("attempts")?,
            expires_at: row.try_get("expires_at")?,
            consumed_at: row.try_get("consumed_at")?,
            verified_at: row.try_get("verified_at")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

/// Device metadata captured when a session is opened.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceMeta {
    pub device_id: String,
    pub platform: Option<String>,
    pub device_name: Option<String>,
}

/// Per-device session. A session is valid iff `is_active` and its linked
/// refresh token (when present) is still active.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub device_id: String,
    pub refresh_token_id: Option<Uuid>,
    pub platform: Option<String>,
    pub device_name: Option<String>,
    pub is_trusted: bool,
    pub is_active: bool,
    pub last_activity_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for SessionRecord {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            device_id: row.try_get("device_id")?,
            refresh_token_id: row.try_get("refresh_token_id")?,
            platform: row.try_get("platform")?,
            device_name: row.try_get("device_name")?,
            is_trusted: row.try_get("is_trusted")?,
            is_active: row.try_get("is_active")?,
            last_activity_at: row.try_get("last_activity_at")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

/// Device trust record, independent of session churn.
#[derive(Debug, Clone)]
pub struct TrustedDevice {
    pub id: Uuid,
    pub user_id: Uuid,
    pub device_id: String,
    pub is_active: bool,
    pub last_used_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for TrustedDevice {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            device_id: row.try_get("device_id")?,
            is_active: row.try_get("is_active")?,
            last_used_at: row.try_get("last_used_at")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{OtpPurpose, RefreshTokenRecord, Role};
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    #[test]
    fn role_db_round_trip() {
        for role in [
            Role::User,
            Role::ServiceProvider,
            Role::Admin,
            Role::Support,
            Role::ItAdmin,
        ] {
            assert_eq!(Role::from_db(role.as_db()).ok(), Some(role));
        }
        assert!(Role::from_db("superuser").is_err());
    }

    #[test]
    fn role_serializes_screaming_snake() {
        let json = serde_json::to_string(&Role::ServiceProvider).expect("serialize role");
        assert_eq!(json, "\"SERVICE_PROVIDER\"");
    }

    #[test]
    fn otp_purpose_db_round_trip() {
        for purpose in [
            OtpPurpose::LoginSms,
            OtpPurpose::LoginEmail,
            OtpPurpose::PasswordReset,
            OtpPurpose::AccountDeletion,
        ] {
            assert_eq!(OtpPurpose::from_db(purpose.as_db()).ok(), Some(purpose));
        }
        assert!(OtpPurpose::from_db("magic_link").is_err());
    }

    #[test]
    fn refresh_token_active_window() {
        let now = Utc::now();
        let record = RefreshTokenRecord {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            token_hash: vec![1, 2, 3],
            session_id: None,
            expires_at: now + Duration::hours(1),
            revoked_at: None,
            rotated_to: None,
            created_at: now,
        };
        assert!(record.is_active(now));
        assert!(!record.is_active(now + Duration::hours(2)));

        let revoked = RefreshTokenRecord {
            revoked_at: Some(now),
            ..record
        };
        assert!(!revoked.is_active(now));
    }
}
