//! Postgres-backed credential store.
//!
//! Row-level conditional updates are the concurrency arbiter here: the
//! rotation claim and the OTP attempt increment are single statements, so
//! concurrent callers serialize on the row without advisory locks.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::Instrument;
use uuid::Uuid;

use crate::models::{
    OtpChallenge, OtpPurpose, RefreshTokenRecord, SessionRecord, TrustedDevice, User,
};
use crate::utils::is_unique_violation;

use super::{
    AuthStore, NewNotification, NewOtpChallenge, NewRefreshToken, NewSession, RevokeOutcome,
    RotateOutcome, SuccessorToken, UserInsert,
};

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn query_span(operation: &str, statement: &str) -> tracing::Span {
    tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = operation,
        db.statement = statement
    )
}

#[async_trait]
impl AuthStore for PgStore {
    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let query = "SELECT * FROM users WHERE email = $1";
        sqlx::query_as::<_, User>(query)
            .bind(email)
            .fetch_optional(&self.pool)
            .instrument(query_span("SELECT", query))
            .await
            .context("failed to lookup user by email")
    }

    async fn find_user_by_phone(&self, phone: &str) -> Result<Option<User>> {
        let query = "SELECT * FROM users WHERE phone = $1";
        sqlx::query_as::<_, User>(query)
            .bind(phone)
            .fetch_optional(&self.pool)
            .instrument(query_span("SELECT", query))
            .await
            .context("failed to lookup user by phone")
    }

    async fn find_user_by_id(&self, id: Uuid) -> Result<Option<User>> {
        let query = "SELECT * FROM users WHERE id = $1";
        sqlx::query_as::<_, User>(query)
            .bind(id)
            .fetch_optional(&self.pool)
            .instrument(query_span("SELECT", query))
            .await
            .context("failed to lookup user by id")
    }

    async fn insert_user(&self, user: &User) -> Result<UserInsert> {
        let query = r"
            INSERT INTO users
                (id, email, phone, password_hash, federated_subject, role,
                 is_active, email_verified, phone_verified, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        ";
        let result = sqlx::query(query)
            .bind(user.id)
            .bind(&user.email)
            .bind(&user.phone)
            .bind(&user.password_hash)
            .bind(&user.federated_subject)
            .bind(user.role.as_db())
            .bind(user.is_active)
            .bind(user.email_verified)
            .bind(user.phone_verified)
            .bind(user.created_at)
            .execute(&self.pool)
            .instrument(query_span("INSERT", query))
            .await;

        match result {
            Ok(_) => Ok(UserInsert::Created),
            Err(err) if is_unique_violation(&err) => Ok(UserInsert::Conflict),
            Err(err) => Err(err).context("failed to insert user"),
        }
    }

    async fn update_user(&self, user: &User) -> Result<()> {
        let query = r"
            UPDATE users
            SET email = $2, phone = $3, password_hash = $4, federated_subject = $5,
                role = $6, is_active = $7, email_verified = $8, phone_verified = $9
            WHERE id = $1
        ";
        sqlx::query(query)
            .bind(user.id)
            .bind(&user.email)
            .bind(&user.phone)
            .bind(&user.password_hash)
            .bind(&user.federated_subject)
            .bind(user.role.as_db())
            .bind(user.is_active)
            .bind(user.email_verified)
            .bind(user.phone_verified)
            .execute(&self.pool)
            .instrument(query_span("UPDATE", query))
            .await
            .context("failed to update user")?;
        Ok(())
    }

    async fn record_login(&self, user_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let query = "UPDATE users SET last_login_at = $2 WHERE id = $1";
        sqlx::query(query)
            .bind(user_id)
            .bind(at)
            .execute(&self.pool)
            .instrument(query_span("UPDATE", query))
            .await
            .context("failed to record login")?;
        Ok(())
    }

    async fn insert_refresh_token(&self, token: &NewRefreshToken) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("begin refresh token transaction")?;

        let query = r"
            INSERT INTO refresh_tokens
                (id, user_id, token_hash, session_id, expires_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
        ";
        sqlx::query(query)
            .bind(token.id)
            .bind(token.user_id)
            .bind(&token.token_hash)
            .bind(token.session_id)
            .bind(token.expires_at)
            .bind(token.created_at)
            .execute(&mut *tx)
            .instrument(query_span("INSERT", query))
            .await
            .context("failed to insert refresh token")?;

        if let Some(session_id) = token.session_id {
            let query = "UPDATE user_sessions SET refresh_token_id = $1 WHERE id = $2";
            sqlx::query(query)
                .bind(token.id)
                .bind(session_id)
                .execute(&mut *tx)
                .instrument(query_span("UPDATE", query))
                .await
                .context("failed to link session refresh token")?;
        }

        tx.commit().await.context("commit refresh token transaction")
    }

    async fn rotate_refresh_token(
        &self,
        token_hash: &[u8],
        successor: &SuccessorToken,
        now: DateTime<Utc>,
    ) -> Result<RotateOutcome> {
        let mut tx = self.pool.begin().await.context("begin rotation")?;

        // Conditional claim: only an active, unexpired row matches. A
        // concurrent loser blocks on the row lock here and then matches
        // nothing, after the winner's successor link is already committed.
        let query = r"
            UPDATE refresh_tokens
            SET revoked_at = $2
            WHERE token_hash = $1
              AND revoked_at IS NULL
              AND expires_at > $2
            RETURNING *
        ";
        let claimed = sqlx::query_as::<_, RefreshTokenRecord>(query)
            .bind(token_hash)
            .bind(now)
            .fetch_optional(&mut *tx)
            .instrument(query_span("UPDATE", query))
            .await
            .context("failed to claim refresh token for rotation")?;

        if let Some(previous) = claimed {
            let query = r"
                INSERT INTO refresh_tokens
                    (id, user_id, token_hash, session_id, expires_at, created_at)
                VALUES ($1, $2, $3, $4, $5, $6)
            ";
            sqlx::query(query)
                .bind(successor.id)
                .bind(previous.user_id)
                .bind(&successor.token_hash)
                .bind(previous.session_id)
                .bind(successor.expires_at)
                .bind(now)
                .execute(&mut *tx)
                .instrument(query_span("INSERT", query))
                .await
                .context("failed to insert successor refresh token")?;

            let query = "UPDATE refresh_tokens SET rotated_to = $1 WHERE id = $2";
            sqlx::query(query)
                .bind(successor.id)
                .bind(previous.id)
                .execute(&mut *tx)
                .instrument(query_span("UPDATE", query))
                .await
                .context("failed to link superseded refresh token")?;

            if let Some(session_id) = previous.session_id {
                let query = "UPDATE user_sessions SET refresh_token_id = $1 WHERE id = $2";
                sqlx::query(query)
                    .bind(successor.id)
                    .bind(session_id)
                    .execute(&mut *tx)
                    .instrument(query_span("UPDATE", query))
                    .await
                    .context("failed to relink session refresh token")?;
            }

            tx.commit().await.context("commit rotation")?;
            return Ok(RotateOutcome::Rotated { previous });
        }

        // Losing path: lock the row and report its terminal state.
        let query = "SELECT * FROM refresh_tokens WHERE token_hash = $1 FOR UPDATE";
        let record = sqlx::query_as::<_, RefreshTokenRecord>(query)
            .bind(token_hash)
            .fetch_optional(&mut *tx)
            .instrument(query_span("SELECT", query))
            .await
            .context("failed to fetch refresh token state")?;

        let Some(record) = record else {
            tx.commit().await.context("commit rotation lookup")?;
            return Ok(RotateOutcome::NotFound);
        };

        if record.revoked_at.is_some() {
            tx.commit().await.context("commit rotation lookup")?;
            return Ok(if record.rotated_to.is_some() {
                RotateOutcome::Reused(record)
            } else {
                RotateOutcome::Revoked(record)
            });
        }

        // Active but expired: revoke as a side effect of presentation.
        let query = "UPDATE refresh_tokens SET revoked_at = $2 WHERE id = $1 RETURNING *";
        let record = sqlx::query_as::<_, RefreshTokenRecord>(query)
            .bind(record.id)
            .bind(now)
            .fetch_one(&mut *tx)
            .instrument(query_span("UPDATE", query))
            .await
            .context("failed to revoke expired refresh token")?;

        tx.commit().await.context("commit expired revocation")?;
        Ok(RotateOutcome::Expired(record))
    }

    async fn atomic_revoke_and_fetch(
        &self,
        token_hash: &[u8],
        now: DateTime<Utc>,
    ) -> Result<RevokeOutcome> {
        let mut tx = self.pool.begin().await.context("begin rotation claim")?;

        // Conditional revoke: only an active, unexpired row matches, so
        // exactly one concurrent caller gets a row back.
        let query = r"
            UPDATE refresh_tokens
            SET revoked_at = $2
            WHERE token_hash = $1
              AND revoked_at IS NULL
              AND expires_at > $2
            RETURNING *
        ";
        let claimed = sqlx::query_as::<_, RefreshTokenRecord>(query)
            .bind(token_hash)
            .bind(now)
            .fetch_optional(&mut *tx)
            .instrument(query_span("UPDATE", query))
            .await
            .context("failed to claim refresh token")?;

        if let Some(record) = claimed {
            tx.commit().await.context("commit rotation claim")?;
            return Ok(RevokeOutcome::Claimed(record));
        }

        // Losing path: lock the row and report its terminal state.
        let query = "SELECT * FROM refresh_tokens WHERE token_hash = $1 FOR UPDATE";
        let record = sqlx::query_as::<_, RefreshTokenRecord>(query)
            .bind(token_hash)
            .fetch_optional(&mut *tx)
            .instrument(query_span("SELECT", query))
            .await
            .context("failed to fetch refresh token state")?;

        let Some(record) = record else {
            tx.commit().await.context("commit rotation lookup")?;
            return Ok(RevokeOutcome::NotFound);
        };

        if record.revoked_at.is_some() {
            tx.commit().await.context("commit rotation lookup")?;
            return Ok(RevokeOutcome::AlreadyRevoked(record));
        }

        // Active but expired: revoke as a side effect of presentation.
        let query = "UPDATE refresh_tokens SET revoked_at = $2 WHERE id = $1 RETURNING *";
        let record = sqlx::query_as::<_, RefreshTokenRecord>(query)
            .bind(record.id)
            .bind(now)
            .fetch_one(&mut *tx)
            .instrument(query_span("UPDATE", query))
            .await
            .context("failed to revoke expired refresh token")?;

        tx.commit().await.context("commit expired revocation")?;
        Ok(RevokeOutcome::Expired(record))
    }

    async fn revoke_refresh_tokens_for_user(
        &self,
        user_id: Uuid,
        except_device: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let query = r"
            UPDATE refresh_tokens
            SET revoked_at = $2
            WHERE user_id = $1
              AND revoked_at IS NULL
              AND ($3::text IS NULL
                   OR session_id IS NULL
                   OR session_id NOT IN (
                       SELECT id FROM user_sessions
                       WHERE user_id = $1 AND device_id = $3))
        ";
        let result = sqlx::query(query)
            .bind(user_id)
            .bind(now)
            .bind(except_device)
            .execute(&self.pool)
            .instrument(query_span("UPDATE", query))
            .await
            .context("failed to bulk revoke refresh tokens")?;
        Ok(result.rows_affected())
    }

    async fn replace_pending_otp(
        &self,
        challenge: &NewOtpChallenge,
        notification: &NewNotification,
    ) -> Result<()> {
        // One transaction keeps challenge replacement and the outbox row
        // consistent even if something fails.
        let mut tx = self.pool.begin().await.context("begin otp transaction")?;

        let query = r"
            UPDATE otp_challenges
            SET consumed_at = $3
            WHERE target = $1 AND purpose = $2 AND consumed_at IS NULL
        ";
        sqlx::query(query)
            .bind(&challenge.target)
            .bind(challenge.purpose.as_db())
            .bind(challenge.created_at)
            .execute(&mut *tx)
            .instrument(query_span("UPDATE", query))
            .await
            .context("failed to invalidate prior otp challenges")?;

        let query = r"
            INSERT INTO otp_challenges
                (id, user_id, target, purpose, code_hash, attempts, expires_at, created_at)
            VALUES ($1, $2, $3, $4, $5, 0, $6, $7)
        ";
        sqlx::query(query)
            .bind(challenge.id)
            .bind(challenge.user_id)
            .bind(&challenge.target)
            .bind(challenge.purpose.as_db())
            .bind(&challenge.code_hash)
            .bind(challenge.expires_at)
            .bind(challenge.created_at)
            .execute(&mut *tx)
            .instrument(query_span("INSERT", query))
            .await
            .context("failed to insert otp challenge")?;

        let payload_text = serde_json::to_string(&notification.payload)
            .context("failed to serialize notification payload")?;
        let query = r"
            INSERT INTO notification_outbox (target, template, payload_json)
            VALUES ($1, $2, $3::jsonb)
        ";
        sqlx::query(query)
            .bind(&notification.target)
            .bind(&notification.template)
            .bind(payload_text)
            .execute(&mut *tx)
            .instrument(query_span("INSERT", query))
            .await
            .context("failed to insert notification outbox row")?;

        tx.commit().await.context("commit otp transaction")
    }

    async fn find_latest_pending_otp(
        &self,
        target: &str,
        purpose: OtpPurpose,
    ) -> Result<Option<OtpChallenge>> {
        let query = r"
            SELECT * FROM otp_challenges
            WHERE target = $1 AND purpose = $2 AND consumed_at IS NULL
            ORDER BY created_at DESC
            LIMIT 1
        ";
        sqlx::query_as::<_, OtpChallenge>(query)
            .bind(target)
            .bind(purpose.as_db())
            .fetch_optional(&self.pool)
            .instrument(query_span("SELECT", query))
            .await
            .context("failed to lookup pending otp challenge")
    }

    async fn increment_otp_attempts(&self, id: Uuid) -> Result<i32> {
        let query = r"
            UPDATE otp_challenges
            SET attempts = attempts + 1
            WHERE id = $1
            RETURNING attempts
        ";
        let row = sqlx::query(query)
            .bind(id)
            .fetch_one(&self.pool)
            .instrument(query_span("UPDATE", query))
            .await
            .context("failed to increment otp attempts")?;
        Ok(row.get("attempts"))
    }

    async fn mark_otp_consumed(&self, id: Uuid, now: DateTime<Utc>, verified: bool) -> Result<()> {
        let query = r"
            UPDATE otp_challenges
            SET consumed_at = $2,
                verified_at = CASE WHEN $3 THEN $2 ELSE verified_at END
            WHERE id = $1
        ";
        sqlx::query(query)
            .bind(id)
            .bind(now)
            .bind(verified)
            .execute(&self.pool)
            .instrument(query_span("UPDATE", query))
            .await
            .context("failed to consume otp challenge")?;
        Ok(())
    }

    async fn upsert_session(&self, session: &NewSession) -> Result<SessionRecord> {
        let query = r"
            INSERT INTO user_sessions
                (id, user_id, device_id, refresh_token_id, platform, device_name,
                 is_trusted, is_active, last_activity_at, created_at)
            VALUES ($1, $2, $3, NULL, $4, $5, $6, TRUE, $7, $7)
            ON CONFLICT (user_id, device_id) DO UPDATE
            SET is_active = TRUE,
                is_trusted = EXCLUDED.is_trusted,
                refresh_token_id = NULL,
                platform = EXCLUDED.platform,
                device_name = EXCLUDED.device_name,
                last_activity_at = EXCLUDED.last_activity_at
            RETURNING *
        ";
        sqlx::query_as::<_, SessionRecord>(query)
            .bind(Uuid::new_v4())
            .bind(session.user_id)
            .bind(&session.device.device_id)
            .bind(&session.device.platform)
            .bind(&session.device.device_name)
            .bind(session.is_trusted)
            .bind(session.now)
            .fetch_one(&self.pool)
            .instrument(query_span("INSERT", query))
            .await
            .context("failed to upsert session")
    }

    async fn touch_session(&self, session_id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let query = "UPDATE user_sessions SET last_activity_at = $2 WHERE id = $1";
        let result = sqlx::query(query)
            .bind(session_id)
            .bind(now)
            .execute(&self.pool)
            .instrument(query_span("UPDATE", query))
            .await
            .context("failed to touch session")?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_active_sessions(&self, user_id: Uuid) -> Result<Vec<SessionRecord>> {
        let query = r"
            SELECT * FROM user_sessions
            WHERE user_id = $1 AND is_active
            ORDER BY last_activity_at DESC
        ";
        sqlx::query_as::<_, SessionRecord>(query)
            .bind(user_id)
            .fetch_all(&self.pool)
            .instrument(query_span("SELECT", query))
            .await
            .context("failed to list active sessions")
    }

    async fn revoke_session(&self, session_id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let mut tx = self.pool.begin().await.context("begin session revocation")?;

        let query = r"
            UPDATE user_sessions
            SET is_active = FALSE
            WHERE id = $1
            RETURNING refresh_token_id
        ";
        let row = sqlx::query(query)
            .bind(session_id)
            .fetch_optional(&mut *tx)
            .instrument(query_span("UPDATE", query))
            .await
            .context("failed to revoke session")?;

        let Some(row) = row else {
            tx.commit().await.context("commit session revocation")?;
            return Ok(false);
        };

        if let Some(token_id) = row.get::<Option<Uuid>, _>("refresh_token_id") {
            let query =
                "UPDATE refresh_tokens SET revoked_at = $2 WHERE id = $1 AND revoked_at IS NULL";
            sqlx::query(query)
                .bind(token_id)
                .bind(now)
                .execute(&mut *tx)
                .instrument(query_span("UPDATE", query))
                .await
                .context("failed to revoke session refresh token")?;
        }

        tx.commit().await.context("commit session revocation")?;
        Ok(true)
    }

    async fn revoke_sessions_for_user(
        &self,
        user_id: Uuid,
        except_device: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let mut tx = self.pool.begin().await.context("begin bulk session revocation")?;

        let query = r"
            UPDATE user_sessions
            SET is_active = FALSE
            WHERE user_id = $1
              AND is_active
              AND ($2::text IS NULL OR device_id <> $2)
            RETURNING refresh_token_id
        ";
        let rows = sqlx::query(query)
            .bind(user_id)
            .bind(except_device)
            .fetch_all(&mut *tx)
            .instrument(query_span("UPDATE", query))
            .await
            .context("failed to bulk revoke sessions")?;

        let token_ids: Vec<Uuid> = rows
            .iter()
            .filter_map(|row| row.get::<Option<Uuid>, _>("refresh_token_id"))
            .collect();
        let affected = rows.len() as u64;

        if !token_ids.is_empty() {
            let query = r"
                UPDATE refresh_tokens
                SET revoked_at = $2
                WHERE id = ANY($1) AND revoked_at IS NULL
            ";
            sqlx::query(query)
                .bind(&token_ids)
                .bind(now)
                .execute(&mut *tx)
                .instrument(query_span("UPDATE", query))
                .await
                .context("failed to revoke session refresh tokens")?;
        }

        tx.commit().await.context("commit bulk session revocation")?;
        Ok(affected)
    }

    async fn upsert_trusted_device(
        &self,
        user_id: Uuid,
        device_id: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let query = r"
            INSERT INTO trusted_devices (id, user_id, device_id, is_active, last_used_at, created_at)
            VALUES ($1, $2, $3, TRUE, $4, $4)
            ON CONFLICT (user_id, device_id) DO UPDATE
            SET is_active = TRUE, last_used_at = EXCLUDED.last_used_at
        ";
        sqlx::query(query)
            .bind(Uuid::new_v4())
            .bind(user_id)
            .bind(device_id)
            .bind(now)
            .execute(&self.pool)
            .instrument(query_span("INSERT", query))
            .await
            .context("failed to upsert trusted device")?;
        Ok(())
    }

    async fn deactivate_trusted_device(&self, user_id: Uuid, device_id: &str) -> Result<bool> {
        let query = r"
            UPDATE trusted_devices
            SET is_active = FALSE
            WHERE user_id = $1 AND device_id = $2 AND is_active
        ";
        let result = sqlx::query(query)
            .bind(user_id)
            .bind(device_id)
            .execute(&self.pool)
            .instrument(query_span("UPDATE", query))
            .await
            .context("failed to deactivate trusted device")?;
        Ok(result.rows_affected() > 0)
    }

    async fn is_device_trusted(&self, user_id: Uuid, device_id: &str) -> Result<bool> {
        let query = r"
            SELECT 1 AS present FROM trusted_devices
            WHERE user_id = $1 AND device_id = $2 AND is_active
            LIMIT 1
        ";
        let row = sqlx::query(query)
            .bind(user_id)
            .bind(device_id)
            .fetch_optional(&self.pool)
            .instrument(query_span("SELECT", query))
            .await
            .context("failed to check device trust")?;
        Ok(row.is_some())
    }

    async fn list_trusted_devices(&self, user_id: Uuid) -> Result<Vec<TrustedDevice>> {
        let query = r"
            SELECT * FROM trusted_devices
            WHERE user_id = $1 AND is_active
            ORDER BY last_used_at DESC
        ";
        sqlx::query_as::<_, TrustedDevice>(query)
            .bind(user_id)
            .fetch_all(&self.pool)
            .instrument(query_span("SELECT", query))
            .await
            .context("failed to list trusted devices")
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut tx = self.pool.begin().await.context("begin purge transaction")?;
        let mut removed = 0u64;

        let query = "DELETE FROM otp_challenges WHERE consumed_at IS NOT NULL OR expires_at <= $1";
        let result = sqlx::query(query)
            .bind(now)
            .execute(&mut *tx)
            .instrument(query_span("DELETE", query))
            .await
            .context("failed to purge otp challenges")?;
        removed += result.rows_affected();

        let query = "DELETE FROM user_sessions WHERE NOT is_active";
        let result = sqlx::query(query)
            .execute(&mut *tx)
            .instrument(query_span("DELETE", query))
            .await
            .context("failed to purge sessions")?;
        removed += result.rows_affected();

        // Revoked-but-unexpired rows stay for reuse detection; expiry is the
        // point at which a row stops carrying any signal.
        let query = "DELETE FROM refresh_tokens WHERE expires_at <= $1";
        let result = sqlx::query(query)
            .bind(now)
            .execute(&mut *tx)
            .instrument(query_span("DELETE", query))
            .await
            .context("failed to purge refresh tokens")?;
        removed += result.rows_affected();

        tx.commit().await.context("commit purge transaction")?;
        Ok(removed)
    }
}
