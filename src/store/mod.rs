//! Credential store contract.
//!
//! The store is the single arbiter of concurrent mutation: rotation claims
//! and attempt increments are single atomic conditional updates here, never
//! read-then-write sequences in the engines. "Not found" is always an
//! `Option`/typed outcome, never an error.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{
    DeviceMeta, OtpChallenge, OtpPurpose, RefreshTokenRecord, SessionRecord, TrustedDevice, User,
};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Outcome of inserting a new user row.
#[derive(Debug)]
pub enum UserInsert {
    Created,
    Conflict,
}

/// Outcome of the atomic revoke-and-fetch on a presented refresh token.
///
/// Exactly one concurrent caller per token observes `Claimed`; everyone else
/// sees the token's terminal state.
#[derive(Debug)]
pub enum RevokeOutcome {
    /// Token was active and has now been revoked by this call.
    Claimed(RefreshTokenRecord),
    /// Token was already revoked; `rotated_to` distinguishes rotation reuse
    /// from an ordinary logout/admin revocation.
    AlreadyRevoked(RefreshTokenRecord),
    /// Token was past expiry; the row is revoked as a side effect.
    Expired(RefreshTokenRecord),
    NotFound,
}

/// Outcome of the atomic rotate: claim the presented token and install its
/// successor in one store transaction.
#[derive(Debug)]
pub enum RotateOutcome {
    /// The presented token was active; it is now revoked and the successor
    /// row exists, linked to the same user and session.
    Rotated { previous: RefreshTokenRecord },
    /// The token was already rotated (a successor exists): a reuse signal.
    Reused(RefreshTokenRecord),
    /// The token was revoked without a successor (logout/admin action).
    Revoked(RefreshTokenRecord),
    /// The token was past expiry; the row is revoked as a side effect.
    Expired(RefreshTokenRecord),
    NotFound,
}

/// Successor row installed by the atomic rotate. The user and session links
/// are inherited from the presented token inside the store transaction.
#[derive(Debug, Clone)]
pub struct SuccessorToken {
    pub id: Uuid,
    pub token_hash: Vec<u8>,
    pub expires_at: DateTime<Utc>,
}

/// Parameters for a new refresh-token row.
#[derive(Debug, Clone)]
pub struct NewRefreshToken {
    pub id: Uuid,
    pub user_id: Uuid,
    pub token_hash: Vec<u8>,
    /// Session this token backs; when set, the session row is re-pointed at
    /// this token in the same transaction.
    pub session_id: Option<Uuid>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Parameters for a new OTP challenge row.
#[derive(Debug, Clone)]
pub struct NewOtpChallenge {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub target: String,
    pub purpose: OtpPurpose,
    pub code_hash: Vec<u8>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Outbound notification row; delivery transport is external to this crate.
#[derive(Debug, Clone)]
pub struct NewNotification {
    pub target: String,
    pub template: String,
    pub payload: serde_json::Value,
}

/// Parameters for opening or reactivating a session.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub user_id: Uuid,
    pub device: DeviceMeta,
    pub is_trusted: bool,
    pub now: DateTime<Utc>,
}

#[async_trait]
pub trait AuthStore: Send + Sync {
    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>>;
    async fn find_user_by_phone(&self, phone: &str) -> Result<Option<User>>;
    async fn find_user_by_id(&self, id: Uuid) -> Result<Option<User>>;
    /// Insert a new user; duplicate email/phone reports `Conflict`.
    async fn insert_user(&self, user: &User) -> Result<UserInsert>;
    async fn update_user(&self, user: &User) -> Result<()>;
    async fn record_login(&self, user_id: Uuid, at: DateTime<Utc>) -> Result<()>;

    async fn insert_refresh_token(&self, token: &NewRefreshToken) -> Result<()>;
    /// Atomic rotation step: revoke the presented token iff currently
    /// active and install the successor in the same transaction. Exactly one
    /// concurrent caller per token observes `Rotated`; all others land on a
    /// terminal state with the successor link already visible, so the reuse
    /// path is never missed.
    async fn rotate_refresh_token(
        &self,
        token_hash: &[u8],
        successor: &SuccessorToken,
        now: DateTime<Utc>,
    ) -> Result<RotateOutcome>;
    /// Single atomic conditional update: revoke iff currently active, and
    /// report the row's prior state. Used by logout-style revocation.
    async fn atomic_revoke_and_fetch(
        &self,
        token_hash: &[u8],
        now: DateTime<Utc>,
    ) -> Result<RevokeOutcome>;
    /// Bulk-revoke a user's active refresh tokens, optionally sparing the
    /// token linked to one device's session. Returns rows affected.
    async fn revoke_refresh_tokens_for_user(
        &self,
        user_id: Uuid,
        except_device: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<u64>;

    /// Invalidate any pending challenge for the same `(target, purpose)`,
    /// insert the new one, and enqueue its notification, all in one
    /// transaction.
    async fn replace_pending_otp(
        &self,
        challenge: &NewOtpChallenge,
        notification: &NewNotification,
    ) -> Result<()>;
    /// Latest non-consumed challenge for the pair; expiry is judged by the
    /// caller so it can apply the terminal transition.
    async fn find_latest_pending_otp(
        &self,
        target: &str,
        purpose: OtpPurpose,
    ) -> Result<Option<OtpChallenge>>;
    /// Atomic increment; returns the post-increment attempt count.
    async fn increment_otp_attempts(&self, id: Uuid) -> Result<i32>;
    /// Terminal transition: consume the challenge, marking it verified when
    /// the presented code matched.
    async fn mark_otp_consumed(&self, id: Uuid, now: DateTime<Utc>, verified: bool) -> Result<()>;

    /// Create or reactivate the session for `(user, device)`.
    async fn upsert_session(&self, session: &NewSession) -> Result<SessionRecord>;
    /// Best-effort activity bump; reports whether the session exists.
    async fn touch_session(&self, session_id: Uuid, now: DateTime<Utc>) -> Result<bool>;
    async fn list_active_sessions(&self, user_id: Uuid) -> Result<Vec<SessionRecord>>;
    /// Deactivate one session and revoke its linked refresh token.
    async fn revoke_session(&self, session_id: Uuid, now: DateTime<Utc>) -> Result<bool>;
    /// Deactivate a user's sessions (optionally sparing one device) and
    /// revoke their linked refresh tokens. Returns sessions affected.
    async fn revoke_sessions_for_user(
        &self,
        user_id: Uuid,
        except_device: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<u64>;

    async fn upsert_trusted_device(
        &self,
        user_id: Uuid,
        device_id: &str,
        now: DateTime<Utc>,
    ) -> Result<()>;
    async fn deactivate_trusted_device(&self, user_id: Uuid, device_id: &str) -> Result<bool>;
    async fn is_device_trusted(&self, user_id: Uuid, device_id: &str) -> Result<bool>;
    async fn list_trusted_devices(&self, user_id: Uuid) -> Result<Vec<TrustedDevice>>;

    /// Garbage-collect expired/consumed/revoked rows. Returns rows removed.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64>;
}
