//! Refresh-token rotation with reuse detection.
//!
//! Rotation is single-use: exchanging a refresh token revokes it and mints a
//! successor linked to the same user and session. Presenting an
//! already-rotated token is treated as theft and revokes the whole chain for
//! that user. The store's conditional revoke is the serialization point, so
//! two concurrent rotations of one token can never both win.

use anyhow::{anyhow, Context, Result};
use chrono::Duration;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::clock::Clock;
use crate::models::User;
use crate::store::{AuthStore, NewRefreshToken, RevokeOutcome, RotateOutcome, SuccessorToken};
use crate::token::{TokenCodec, TokenType};
use crate::utils::{generate_opaque_token, hash_opaque_token};

#[derive(Debug, Error)]
pub enum RotateError {
    #[error("unknown refresh token")]
    NotFound,
    #[error("refresh token expired")]
    Expired,
    #[error("refresh token already rotated")]
    AlreadyRotated,
    #[error("refresh token revoked")]
    Revoked,
    #[error("account disabled")]
    AccountDisabled,
    #[error("rotation failed")]
    Internal(#[source] anyhow::Error),
}

/// Result of a successful rotation or initial issuance.
#[derive(Debug)]
pub struct RotatedTokens {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in_seconds: i64,
    pub user: User,
    pub session_id: Option<Uuid>,
}

pub struct RefreshEngine {
    store: Arc<dyn AuthStore>,
    clock: Arc<dyn Clock>,
    codec: TokenCodec,
    refresh_ttl_seconds: i64,
}

impl RefreshEngine {
    #[must_use]
    pub fn new(
        store: Arc<dyn AuthStore>,
        clock: Arc<dyn Clock>,
        codec: TokenCodec,
        refresh_ttl_seconds: i64,
    ) -> Self {
        Self {
            store,
            clock,
            codec,
            refresh_ttl_seconds,
        }
    }

    /// Mint the initial refresh token for a fresh login.
    ///
    /// # Errors
    /// Returns an error if token generation or the store insert fails.
    pub async fn issue_initial(&self, user_id: Uuid, session_id: Option<Uuid>) -> Result<String> {
        let token = generate_opaque_token()?;
        let now = self.clock.now();
        let record = NewRefreshToken {
            id: Uuid::new_v4(),
            user_id,
            token_hash: hash_opaque_token(&token),
            session_id,
            expires_at: now + Duration::seconds(self.refresh_ttl_seconds),
            created_at: now,
        };
        self.store
            .insert_refresh_token(&record)
            .await
            .context("failed to insert refresh token")?;
        Ok(token)
    }

    /// Exchange a presented refresh token for a new access/refresh pair.
    ///
    /// # Errors
    /// - `NotFound` / `Expired` / `Revoked` for tokens outside the active
    ///   window (expired tokens are revoked as a side effect of presentation)
    /// - `AlreadyRotated` when a superseded token is replayed; every refresh
    ///   token of the owning user is revoked before this is returned
    /// - `AccountDisabled` when the owning account was deactivated
    pub async fn rotate(&self, presented: &str) -> Result<RotatedTokens, RotateError> {
        let now = self.clock.now();
        let token_hash = hash_opaque_token(presented);

        // Successor material is generated up front so the store can install
        // it in the same transaction that claims the presented token.
        let refresh_token = generate_opaque_token().map_err(RotateError::Internal)?;
        let successor = SuccessorToken {
            id: Uuid::new_v4(),
            token_hash: hash_opaque_token(&refresh_token),
            expires_at: now + Duration::seconds(self.refresh_ttl_seconds),
        };

        let outcome = self
            .store
            .rotate_refresh_token(&token_hash, &successor, now)
            .await
            .map_err(RotateError::Internal)?;

        let previous = match outcome {
            RotateOutcome::NotFound => return Err(RotateError::NotFound),
            RotateOutcome::Expired(_) => return Err(RotateError::Expired),
            RotateOutcome::Reused(record) => {
                // Reuse signal: a successor exists, so someone is replaying
                // a consumed token. Assume compromise.
                warn!(user_id = %record.user_id, "refresh token reuse detected");
                self.store
                    .revoke_refresh_tokens_for_user(record.user_id, None, now)
                    .await
                    .map_err(RotateError::Internal)?;
                return Err(RotateError::AlreadyRotated);
            }
            RotateOutcome::Revoked(_) => return Err(RotateError::Revoked),
            RotateOutcome::Rotated { previous } => previous,
        };

        let user = self
            .store
            .find_user_by_id(previous.user_id)
            .await
            .map_err(RotateError::Internal)?
            .ok_or_else(|| {
                RotateError::Internal(anyhow!("refresh token owner {} missing", previous.user_id))
            })?;
        if !user.is_active {
            // The presented token is already consumed and the successor dies
            // with the rest of the chain: fail closed for disabled accounts.
            self.store
                .revoke_refresh_tokens_for_user(user.id, None, now)
                .await
                .map_err(RotateError::Internal)?;
            return Err(RotateError::AccountDisabled);
        }

        let access_token = self
            .codec
            .issue(
                user.id,
                &user.email,
                user.role,
                TokenType::Access,
                now.timestamp(),
            )
            .map_err(|err| RotateError::Internal(err.into()))?;

        Ok(RotatedTokens {
            access_token,
            refresh_token,
            expires_in_seconds: self.codec.expiry_seconds(TokenType::Access),
            user,
            session_id: previous.session_id,
        })
    }

    /// Revoke a presented token (logout). Idempotent: unknown or already
    /// terminal tokens are not an error. When the token backed a session,
    /// that session is deactivated as well.
    ///
    /// # Errors
    /// Returns an error only when the store fails.
    pub async fn revoke_presented(&self, presented: &str) -> Result<()> {
        let now = self.clock.now();
        let token_hash = hash_opaque_token(presented);
        let outcome = self
            .store
            .atomic_revoke_and_fetch(&token_hash, now)
            .await
            .context("failed to revoke presented refresh token")?;

        if let RevokeOutcome::Claimed(record) = outcome {
            if let Some(session_id) = record.session_id {
                self.store
                    .revoke_session(session_id, now)
                    .await
                    .context("failed to revoke session on logout")?;
            }
        }
        Ok(())
    }

    /// Revoke every refresh token of a user (logout-everywhere, theft response).
    ///
    /// # Errors
    /// Returns an error when the store fails.
    pub async fn revoke_all(&self, user_id: Uuid) -> Result<u64> {
        self.store
            .revoke_refresh_tokens_for_user(user_id, None, self.clock.now())
            .await
    }

    /// Revoke every refresh token of a user except the one backing the given
    /// device's session.
    ///
    /// # Errors
    /// Returns an error when the store fails.
    pub async fn revoke_all_except_device(&self, user_id: Uuid, device_id: &str) -> Result<u64> {
        self.store
            .revoke_refresh_tokens_for_user(user_id, Some(device_id), self.clock.now())
            .await
    }
}
