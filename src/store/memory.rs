//! In-memory credential store.
//!
//! All state sits behind one async mutex, so every contract operation is
//! atomic by construction. Suitable for tests and single-process
//! deployments; anything multi-instance belongs on [`super::PgStore`].

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::models::{
    OtpChallenge, OtpPurpose, RefreshTokenRecord, SessionRecord, TrustedDevice, User,
};

use super::{
    AuthStore, NewNotification, NewOtpChallenge, NewRefreshToken, NewSession, RevokeOutcome,
    RotateOutcome, SuccessorToken, UserInsert,
};

#[derive(Default)]
struct Inner {
    users: HashMap<Uuid, User>,
    refresh_tokens: HashMap<Uuid, RefreshTokenRecord>,
    otp_challenges: HashMap<Uuid, OtpChallenge>,
    sessions: HashMap<Uuid, SessionRecord>,
    trusted_devices: HashMap<Uuid, TrustedDevice>,
    outbox: Vec<NewNotification>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queued notifications, oldest first. Delivery is out of scope; tests
    /// and single-process deployments drain this directly.
    pub async fn outbox(&self) -> Vec<NewNotification> {
        self.inner.lock().await.outbox.clone()
    }
}

#[async_trait]
impl AuthStore for MemoryStore {
    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let inner = self.inner.lock().await;
        Ok(inner.users.values().find(|u| u.email == email).cloned())
    }

    async fn find_user_by_phone(&self, phone: &str) -> Result<Option<User>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .users
            .values()
            .find(|u| u.phone.as_deref() == Some(phone))
            .cloned())
    }

    async fn find_user_by_id(&self, id: Uuid) -> Result<Option<User>> {
        let inner = self.inner.lock().await;
        Ok(inner.users.get(&id).cloned())
    }

    async fn insert_user(&self, user: &User) -> Result<UserInsert> {
        let mut inner = self.inner.lock().await;
        let conflict = inner.users.values().any(|existing| {
            existing.email == user.email
                || (user.phone.is_some() && existing.phone == user.phone)
        });
        if conflict {
            return Ok(UserInsert::Conflict);
        }
        inner.users.insert(user.id, user.clone());
        Ok(UserInsert::Created)
    }

    async fn update_user(&self, user: &User) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if !inner.users.contains_key(&user.id) {
            return Err(anyhow!("user {} not found", user.id));
        }
        inner.users.insert(user.id, user.clone());
        Ok(())
    }

    async fn record_login(&self, user_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let user = inner
            .users
            .get_mut(&user_id)
            .with_context(|| format!("user {user_id} not found"))?;
        user.last_login_at = Some(at);
        Ok(())
    }

    async fn insert_refresh_token(&self, token: &NewRefreshToken) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(session_id) = token.session_id {
            if let Some(session) = inner.sessions.get_mut(&session_id) {
                session.refresh_token_id = Some(token.id);
            }
        }
        inner.refresh_tokens.insert(
            token.id,
            RefreshTokenRecord {
                id: token.id,
                user_id: token.user_id,
                token_hash: token.token_hash.clone(),
                session_id: token.session_id,
                expires_at: token.expires_at,
                revoked_at: None,
                rotated_to: None,
                created_at: token.created_at,
            },
        );
        Ok(())
    }

    async fn rotate_refresh_token(
        &self,
        token_hash: &[u8],
        successor: &SuccessorToken,
        now: DateTime<Utc>,
    ) -> Result<RotateOutcome> {
        // One lock hold covers claim, successor insert, and session relink,
        // so no interleaving can observe a revoked token without its
        // successor.
        let mut inner = self.inner.lock().await;
        let Some(record) = inner
            .refresh_tokens
            .values_mut()
            .find(|r| r.token_hash == token_hash)
        else {
            return Ok(RotateOutcome::NotFound);
        };

        if record.revoked_at.is_some() {
            let record = record.clone();
            return Ok(if record.rotated_to.is_some() {
                RotateOutcome::Reused(record)
            } else {
                RotateOutcome::Revoked(record)
            });
        }
        if record.expires_at <= now {
            record.revoked_at = Some(now);
            return Ok(RotateOutcome::Expired(record.clone()));
        }

        record.revoked_at = Some(now);
        record.rotated_to = Some(successor.id);
        let previous = record.clone();

        inner.refresh_tokens.insert(
            successor.id,
            RefreshTokenRecord {
                id: successor.id,
                user_id: previous.user_id,
                token_hash: successor.token_hash.clone(),
                session_id: previous.session_id,
                expires_at: successor.expires_at,
                revoked_at: None,
                rotated_to: None,
                created_at: now,
            },
        );
        if let Some(session_id) = previous.session_id {
            if let Some(session) = inner.sessions.get_mut(&session_id) {
                session.refresh_token_id = Some(successor.id);
            }
        }
        Ok(RotateOutcome::Rotated { previous })
    }

    async fn atomic_revoke_and_fetch(
        &self,
        token_hash: &[u8],
        now: DateTime<Utc>,
    ) -> Result<RevokeOutcome> {
        let mut inner = self.inner.lock().await;
        let Some(record) = inner
            .refresh_tokens
            .values_mut()
            .find(|r| r.token_hash == token_hash)
        else {
            return Ok(RevokeOutcome::NotFound);
        };

        // Revoked takes precedence over expired so a rotated token that has
        // since expired still trips reuse detection.
        if record.revoked_at.is_some() {
            return Ok(RevokeOutcome::AlreadyRevoked(record.clone()));
        }
        if record.expires_at <= now {
            record.revoked_at = Some(now);
            return Ok(RevokeOutcome::Expired(record.clone()));
        }
        record.revoked_at = Some(now);
        Ok(RevokeOutcome::Claimed(record.clone()))
    }

    async fn revoke_refresh_tokens_for_user(
        &self,
        user_id: Uuid,
        except_device: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let spared_sessions: Vec<Uuid> = match except_device {
            Some(device_id) => inner
                .sessions
                .values()
                .filter(|s| s.user_id == user_id && s.device_id == device_id)
                .map(|s| s.id)
                .collect(),
            None => Vec::new(),
        };

        let mut affected = 0;
        for record in inner.refresh_tokens.values_mut() {
            if record.user_id != user_id || record.revoked_at.is_some() {
                continue;
            }
            if let Some(session_id) = record.session_id {
                if spared_sessions.contains(&session_id) {
                    continue;
                }
            }
            record.revoked_at = Some(now);
            affected += 1;
        }
        Ok(affected)
    }

    async fn replace_pending_otp(
        &self,
        challenge: &NewOtpChallenge,
        notification: &NewNotification,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        for existing in inner.otp_challenges.values_mut() {
            if existing.target == challenge.target
                && existing.purpose == challenge.purpose
                && existing.consumed_at.is_none()
            {
                existing.consumed_at = Some(challenge.created_at);
            }
        }
        inner.otp_challenges.insert(
            challenge.id,
            OtpChallenge {
                id: challenge.id,
                user_id: challenge.user_id,
                target: challenge.target.clone(),
                purpose: challenge.purpose,
                code_hash: challenge.code_hash.clone(),
                attempts: 0,
                expires_at: challenge.expires_at,
                consumed_at: None,
                verified_at: None,
                created_at: challenge.created_at,
            },
        );
        inner.outbox.push(notification.clone());
        Ok(())
    }

    async fn find_latest_pending_otp(
        &self,
        target: &str,
        purpose: OtpPurpose,
    ) -> Result<Option<OtpChallenge>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .otp_challenges
            .values()
            .filter(|c| c.target == target && c.purpose == purpose && c.consumed_at.is_none())
            .max_by_key(|c| c.created_at)
            .cloned())
    }

    async fn increment_otp_attempts(&self, id: Uuid) -> Result<i32> {
        let mut inner = self.inner.lock().await;
        let challenge = inner
            .otp_challenges
            .get_mut(&id)
            .with_context(|| format!("otp challenge {id} not found"))?;
        challenge.attempts += 1;
        Ok(challenge.attempts)
    }

    async fn mark_otp_consumed(&self, id: Uuid, now: DateTime<Utc>, verified: bool) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let challenge = inner
            .otp_challenges
            .get_mut(&id)
            .with_context(|| format!("otp challenge {id} not found"))?;
        challenge.consumed_at = Some(now);
        if verified {
            challenge.verified_at = Some(now);
        }
        Ok(())
    }

    async fn upsert_session(&self, session: &NewSession) -> Result<SessionRecord> {
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner
            .sessions
            .values_mut()
            .find(|s| s.user_id == session.user_id && s.device_id == session.device.device_id)
        {
            existing.is_active = true;
            existing.is_trusted = session.is_trusted;
            existing.refresh_token_id = None;
            existing.platform = session.device.platform.clone();
            existing.device_name = session.device.device_name.clone();
            existing.last_activity_at = session.now;
            return Ok(existing.clone());
        }

        let record = SessionRecord {
            id: Uuid::new_v4(),
            user_id: session.user_id,
            device_id: session.device.device_id.clone(),
            refresh_token_id: None,
            platform: session.device.platform.clone(),
            device_name: session.device.device_name.clone(),
            is_trusted: session.is_trusted,
            is_active: true,
            last_activity_at: session.now,
            created_at: session.now,
        };
        inner.sessions.insert(record.id, record.clone());
        Ok(record)
    }

    async fn touch_session(&self, session_id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        match inner.sessions.get_mut(&session_id) {
            Some(session) => {
                session.last_activity_at = now;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_active_sessions(&self, user_id: Uuid) -> Result<Vec<SessionRecord>> {
        let inner = self.inner.lock().await;
        let mut sessions: Vec<SessionRecord> = inner
            .sessions
            .values()
            .filter(|s| s.user_id == user_id && s.is_active)
            .cloned()
            .collect();
        sessions.sort_by_key(|s| std::cmp::Reverse(s.last_activity_at));
        Ok(sessions)
    }

    async fn revoke_session(&self, session_id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let Some(session) = inner.sessions.get_mut(&session_id) else {
            return Ok(false);
        };
        session.is_active = false;
        let linked = session.refresh_token_id;
        if let Some(token_id) = linked {
            if let Some(token) = inner.refresh_tokens.get_mut(&token_id) {
                if token.revoked_at.is_none() {
                    token.revoked_at = Some(now);
                }
            }
        }
        Ok(true)
    }

    async fn revoke_sessions_for_user(
        &self,
        user_id: Uuid,
        except_device: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let mut affected = 0;
        let mut linked_tokens = Vec::new();
        for session in inner.sessions.values_mut() {
            if session.user_id != user_id || !session.is_active {
                continue;
            }
            if except_device == Some(session.device_id.as_str()) {
                continue;
            }
            session.is_active = false;
            if let Some(token_id) = session.refresh_token_id {
                linked_tokens.push(token_id);
            }
            affected += 1;
        }
        for token_id in linked_tokens {
            if let Some(token) = inner.refresh_tokens.get_mut(&token_id) {
                if token.revoked_at.is_none() {
                    token.revoked_at = Some(now);
                }
            }
        }
        Ok(affected)
    }

    async fn upsert_trusted_device(
        &self,
        user_id: Uuid,
        device_id: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner
            .trusted_devices
            .values_mut()
            .find(|d| d.user_id == user_id && d.device_id == device_id)
        {
            existing.is_active = true;
            existing.last_used_at = now;
            return Ok(());
        }
        let record = TrustedDevice {
            id: Uuid::new_v4(),
            user_id,
            device_id: device_id.to_string(),
            is_active: true,
            last_used_at: now,
            created_at: now,
        };
        inner.trusted_devices.insert(record.id, record);
        Ok(())
    }

    async fn deactivate_trusted_device(&self, user_id: Uuid, device_id: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        match inner
            .trusted_devices
            .values_mut()
            .find(|d| d.user_id == user_id && d.device_id == device_id && d.is_active)
        {
            Some(device) => {
                device.is_active = false;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn is_device_trusted(&self, user_id: Uuid, device_id: &str) -> Result<bool> {
        let inner = self.inner.lock().await;
        Ok(inner
            .trusted_devices
            .values()
            .any(|d| d.user_id == user_id && d.device_id == device_id && d.is_active))
    }

    async fn list_trusted_devices(&self, user_id: Uuid) -> Result<Vec<TrustedDevice>> {
        let inner = self.inner.lock().await;
        let mut devices: Vec<TrustedDevice> = inner
            .trusted_devices
            .values()
            .filter(|d| d.user_id == user_id && d.is_active)
            .cloned()
            .collect();
        devices.sort_by_key(|d| std::cmp::Reverse(d.last_used_at));
        Ok(devices)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let mut removed = 0u64;

        let before = inner.otp_challenges.len();
        inner
            .otp_challenges
            .retain(|_, c| c.consumed_at.is_none() && c.expires_at > now);
        removed += (before - inner.otp_challenges.len()) as u64;

        // Revoked-but-unexpired refresh rows are retained so reuse detection
        // keeps working for the remainder of their lifetime.
        let before = inner.refresh_tokens.len();
        inner.refresh_tokens.retain(|_, t| t.expires_at > now);
        removed += (before - inner.refresh_tokens.len()) as u64;

        let before = inner.sessions.len();
        inner.sessions.retain(|_, s| s.is_active);
        removed += (before - inner.sessions.len()) as u64;

        Ok(removed)
    }
}
