//! Service facade: credential checks, token issuance, and the session and
//! device management surface, behind per-category admission control.
//!
//! Enumeration posture is uniform: login-class paths and OTP requests never
//! reveal whether an account exists. Management paths (`revoke_session`,
//! `untrust_device`) return a distinct not-found signal instead.

use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::AuthConfig;
use crate::error::AuthError;
use crate::models::{DeviceMeta, OtpPurpose, Role, SessionRecord, TrustedDevice, User};
use crate::otp::OtpEngine;
use crate::password::{hash_password, verify_password};
use crate::rate_limit::{RateCategory, RateLimitDecision, RateLimiter};
use crate::refresh::RefreshEngine;
use crate::session::SessionManager;
use crate::store::{AuthStore, UserInsert};
use crate::token::{TokenCodec, TokenType};
use crate::utils::{normalize_email, valid_email, valid_phone};

const MIN_PASSWORD_LENGTH: usize = 8;

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub phone: Option<String>,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PasswordCredentials {
    pub email: String,
    pub password: String,
}

/// Post-verification claims from a federated identity provider. The redirect
/// handshake happens upstream; this engine only consumes its outcome.
#[derive(Debug, Clone, Deserialize)]
pub struct FederatedClaims {
    pub provider: String,
    pub subject: String,
    pub email: String,
    pub email_verified: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserSummary {
    pub id: Uuid,
    pub email: String,
    pub role: Role,
    pub email_verified: bool,
    pub phone_verified: bool,
}

impl From<&User> for UserSummary {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            email: user.email.clone(),
            role: user.role,
            email_verified: user.email_verified,
            phone_verified: user.phone_verified,
        }
    }
}

/// Issued credential pair plus the backing session.
#[derive(Debug, Serialize)]
pub struct IssuedTokens {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in_seconds: i64,
    pub session_id: Option<Uuid>,
    pub user: UserSummary,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct OtpRequested {
    pub expires_in_seconds: i64,
}

pub struct AuthService {
    store: Arc<dyn AuthStore>,
    clock: Arc<dyn Clock>,
    limiter: Arc<dyn RateLimiter>,
    codec: TokenCodec,
    config: AuthConfig,
    otp: OtpEngine,
    refresh_engine: RefreshEngine,
    sessions: SessionManager,
}

impl AuthService {
    #[must_use]
    pub fn new(
        store: Arc<dyn AuthStore>,
        clock: Arc<dyn Clock>,
        limiter: Arc<dyn RateLimiter>,
        config: AuthConfig,
    ) -> Self {
        let codec = TokenCodec::from_config(&config);
        let otp = OtpEngine::new(Arc::clone(&store), Arc::clone(&clock), config.clone());
        let refresh_engine = RefreshEngine::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            codec.clone(),
            config.refresh_token_ttl_seconds(),
        );
        let sessions = SessionManager::new(Arc::clone(&store), Arc::clone(&clock));
        Self {
            store,
            clock,
            limiter,
            codec,
            config,
            otp,
            refresh_engine,
            sessions,
        }
    }

    /// Register a password account. The password is hashed before it touches
    /// the store; the raw value is dropped with this call frame.
    ///
    /// # Errors
    /// `InvalidRequest` for malformed input, `AlreadyExists` on conflict.
    pub async fn register(&self, request: RegisterRequest) -> Result<UserSummary, AuthError> {
        let email = normalize_email(&request.email);
        if !valid_email(&email) {
            return Err(AuthError::InvalidRequest("invalid email".to_string()));
        }
        if let Some(phone) = request.phone.as_deref() {
            if !valid_phone(phone) {
                return Err(AuthError::InvalidRequest("invalid phone".to_string()));
            }
        }
        if request.password.len() < MIN_PASSWORD_LENGTH {
            return Err(AuthError::InvalidRequest("password too short".to_string()));
        }

        let password_hash = hash_password(&request.password)?;
        let user = User {
            id: Uuid::new_v4(),
            email,
            phone: request.phone,
            password_hash: Some(password_hash),
            federated_subject: None,
            role: Role::User,
            is_active: true,
            email_verified: false,
            phone_verified: false,
            last_login_at: None,
            created_at: self.clock.now(),
        };

        match self.store.insert_user(&user).await? {
            UserInsert::Created => {
                info!(user_id = %user.id, "user registered");
                Ok(UserSummary::from(&user))
            }
            UserInsert::Conflict => Err(AuthError::AlreadyExists),
        }
    }

    /// Password login: admission, credential check, token issuance, session.
    ///
    /// # Errors
    /// `RateLimited`, `InvalidCredentials` (uniform for unknown accounts,
    /// wrong passwords, and password-less accounts), or `AccountDisabled`.
    pub async fn login_password(
        &self,
        credentials: PasswordCredentials,
        device: DeviceMeta,
        client_key: &str,
    ) -> Result<IssuedTokens, AuthError> {
        self.admit(client_key, RateCategory::Auth)?;

        let email = normalize_email(&credentials.email);
        let Some(user) = self.store.find_user_by_email(&email).await? else {
            return Err(AuthError::InvalidCredentials);
        };
        // Federated-only accounts have no hash; same uniform failure.
        let Some(stored_hash) = user.password_hash.as_deref() else {
            return Err(AuthError::InvalidCredentials);
        };
        if !verify_password(&credentials.password, stored_hash) {
            return Err(AuthError::InvalidCredentials);
        }
        if !user.is_active {
            return Err(AuthError::AccountDisabled);
        }

        self.complete_login(user, &device).await
    }

    /// OTP login against a previously requested login challenge.
    ///
    /// # Errors
    /// `RateLimited`, `InvalidRequest` for non-login purposes,
    /// `InvalidCredentials` (covering every challenge failure uniformly), or
    /// `AccountDisabled`.
    pub async fn login_otp(
        &self,
        target: &str,
        purpose: OtpPurpose,
        code: &str,
        device: DeviceMeta,
        client_key: &str,
    ) -> Result<IssuedTokens, AuthError> {
        self.admit(client_key, RateCategory::Auth)?;

        if !matches!(purpose, OtpPurpose::LoginSms | OtpPurpose::LoginEmail) {
            return Err(AuthError::InvalidRequest(
                "purpose is not a login purpose".to_string(),
            ));
        }

        let target = match purpose {
            OtpPurpose::LoginEmail => normalize_email(target),
            _ => target.to_string(),
        };
        if let Err(err) = self.otp.verify(&target, purpose, code).await {
            return Err(match err {
                crate::otp::OtpError::Internal(source) => AuthError::Internal(source),
                // Challenge state never leaks through a login path.
                _ => AuthError::InvalidCredentials,
            });
        }

        let user = match purpose {
            OtpPurpose::LoginSms => self.store.find_user_by_phone(&target).await?,
            _ => self.store.find_user_by_email(&target).await?,
        };
        let Some(mut user) = user else {
            return Err(AuthError::InvalidCredentials);
        };
        if !user.is_active {
            return Err(AuthError::AccountDisabled);
        }

        // A completed challenge proves the contact point.
        let newly_verified = match purpose {
            OtpPurpose::LoginSms if !user.phone_verified => {
                user.phone_verified = true;
                true
            }
            OtpPurpose::LoginEmail if !user.email_verified => {
                user.email_verified = true;
                true
            }
            _ => false,
        };
        if newly_verified {
            self.store.update_user(&user).await?;
        }

        self.complete_login(user, &device).await
    }

    /// Login with post-verification federated claims; creates the account on
    /// first use and links the federated subject to an existing one.
    ///
    /// # Errors
    /// `RateLimited`, `InvalidRequest` for malformed claims, or
    /// `AccountDisabled`.
    pub async fn login_federated(
        &self,
        claims: FederatedClaims,
        device: DeviceMeta,
        client_key: &str,
    ) -> Result<IssuedTokens, AuthError> {
        self.admit(client_key, RateCategory::Auth)?;

        let email = normalize_email(&claims.email);
        if !valid_email(&email) || claims.subject.is_empty() {
            return Err(AuthError::InvalidRequest("invalid federated claims".to_string()));
        }
        let subject = format!("{}:{}", claims.provider, claims.subject);

        let user = match self.store.find_user_by_email(&email).await? {
            Some(mut user) => {
                if !user.is_active {
                    return Err(AuthError::AccountDisabled);
                }
                if user.federated_subject.is_none() {
                    user.federated_subject = Some(subject);
                    self.store.update_user(&user).await?;
                }
                user
            }
            None => {
                let user = User {
                    id: Uuid::new_v4(),
                    email,
                    phone: None,
                    password_hash: None,
                    federated_subject: Some(subject),
                    role: Role::User,
                    is_active: true,
                    email_verified: claims.email_verified,
                    phone_verified: false,
                    last_login_at: None,
                    created_at: self.clock.now(),
                };
                match self.store.insert_user(&user).await? {
                    UserInsert::Created => user,
                    // Lost a concurrent first-login race; the row exists now.
                    UserInsert::Conflict => self
                        .store
                        .find_user_by_email(&user.email)
                        .await?
                        .ok_or_else(|| {
                            AuthError::Internal(anyhow!("federated user vanished after conflict"))
                        })?,
                }
            }
        };

        self.complete_login(user, &device).await
    }

    /// Exchange a refresh token for a new access/refresh pair.
    ///
    /// # Errors
    /// `RateLimited`, `TokenInvalid`, `TokenReused` (reuse detected; the
    /// whole chain is revoked), or `AccountDisabled`.
    pub async fn refresh(
        &self,
        refresh_token: &str,
        client_key: &str,
    ) -> Result<IssuedTokens, AuthError> {
        self.admit(client_key, RateCategory::Auth)?;

        let rotated = self.refresh_engine.rotate(refresh_token).await?;
        if let Some(session_id) = rotated.session_id {
            self.sessions.touch(session_id).await;
        }

        Ok(IssuedTokens {
            access_token: rotated.access_token,
            refresh_token: rotated.refresh_token,
            expires_in_seconds: rotated.expires_in_seconds,
            session_id: rotated.session_id,
            user: UserSummary::from(&rotated.user),
        })
    }

    /// Validate an access token; pure computation, no store round trip.
    ///
    /// # Errors
    /// Propagates the codec failure (`Malformed`/`InvalidSignature`/
    /// `Expired`/`UnsupportedType`) as `TokenInvalid`.
    pub fn verify_access_token(&self, token: &str) -> Result<crate::token::Claims, AuthError> {
        self.codec
            .verify(token, self.clock.now_unix())
            .map_err(|_| AuthError::TokenInvalid)
    }

    /// Issue a one-time code for `(target, purpose)`. Output is shaped the
    /// same whether or not the target resolves to an account.
    ///
    /// # Errors
    /// `RateLimited` or `InvalidRequest` for malformed targets.
    pub async fn request_otp(
        &self,
        target: &str,
        purpose: OtpPurpose,
        client_key: &str,
    ) -> Result<OtpRequested, AuthError> {
        self.admit(client_key, RateCategory::Otp)?;

        let policy = self.config.otp_policy(purpose);
        let (target, user) = match purpose {
            OtpPurpose::LoginSms => {
                if !valid_phone(target) {
                    return Err(AuthError::InvalidRequest("invalid phone".to_string()));
                }
                (
                    target.to_string(),
                    self.store.find_user_by_phone(target).await?,
                )
            }
            _ => {
                let email = normalize_email(target);
                if !valid_email(&email) {
                    return Err(AuthError::InvalidRequest("invalid email".to_string()));
                }
                let user = self.store.find_user_by_email(&email).await?;
                (email, user)
            }
        };

        // Unknown or disabled targets get the success shape without a
        // challenge; anything else is an account-existence oracle.
        let Some(user) = user.filter(|user| user.is_active) else {
            return Ok(OtpRequested {
                expires_in_seconds: policy.ttl_seconds,
            });
        };

        let created = self.otp.create(&target, purpose, Some(user.id)).await?;
        Ok(OtpRequested {
            expires_in_seconds: created.expires_in_seconds,
        })
    }

    /// Verify a one-time code outside a login flow (password reset, account
    /// deletion confirmation).
    ///
    /// # Errors
    /// `RateLimited` or the typed challenge failure.
    pub async fn verify_otp(
        &self,
        target: &str,
        purpose: OtpPurpose,
        code: &str,
        client_key: &str,
    ) -> Result<(), AuthError> {
        self.admit(client_key, RateCategory::Otp)?;
        let target = match purpose {
            OtpPurpose::LoginSms => target.to_string(),
            _ => normalize_email(target),
        };
        self.otp.verify(&target, purpose, code).await?;
        Ok(())
    }

    /// Revoke the presented refresh token and its session. Idempotent.
    ///
    /// # Errors
    /// Internal store failures only.
    pub async fn logout(&self, refresh_token: &str) -> Result<(), AuthError> {
        self.refresh_engine
            .revoke_presented(refresh_token)
            .await
            .context("logout failed")?;
        Ok(())
    }

    /// Revoke every session and refresh token of a user.
    ///
    /// # Errors
    /// Internal store failures only.
    pub async fn logout_everywhere(&self, user_id: Uuid) -> Result<(), AuthError> {
        self.sessions.revoke_all(user_id).await?;
        // Sessions cascade to their linked tokens; this sweep also catches
        // tokens that never had a session.
        self.refresh_engine.revoke_all(user_id).await?;
        Ok(())
    }

    /// Like [`Self::logout_everywhere`] but keeps the given device signed in.
    ///
    /// # Errors
    /// Internal store failures only.
    pub async fn logout_other_devices(
        &self,
        user_id: Uuid,
        device_id: &str,
    ) -> Result<(), AuthError> {
        self.sessions.revoke_all_except(user_id, device_id).await?;
        self.refresh_engine
            .revoke_all_except_device(user_id, device_id)
            .await?;
        Ok(())
    }

    /// Active sessions for a "manage devices" view.
    ///
    /// # Errors
    /// Internal store failures only.
    pub async fn list_sessions(&self, user_id: Uuid) -> Result<Vec<SessionRecord>, AuthError> {
        Ok(self.sessions.list_active(user_id).await?)
    }

    /// # Errors
    /// `NotFound` when the session does not exist.
    pub async fn revoke_session(&self, session_id: Uuid) -> Result<(), AuthError> {
        if self.sessions.revoke(session_id).await? {
            Ok(())
        } else {
            Err(AuthError::NotFound)
        }
    }

    /// Best-effort session activity bump.
    pub async fn touch_session(&self, session_id: Uuid) {
        self.sessions.touch(session_id).await;
    }

    /// # Errors
    /// Internal store failures only.
    pub async fn trust_device(&self, user_id: Uuid, device_id: &str) -> Result<(), AuthError> {
        Ok(self.sessions.trust(user_id, device_id).await?)
    }

    /// # Errors
    /// `NotFound` when no active trust record exists for the device.
    pub async fn untrust_device(&self, user_id: Uuid, device_id: &str) -> Result<(), AuthError> {
        if self.sessions.untrust(user_id, device_id).await? {
            Ok(())
        } else {
            Err(AuthError::NotFound)
        }
    }

    /// # Errors
    /// Internal store failures only.
    pub async fn is_device_trusted(
        &self,
        user_id: Uuid,
        device_id: &str,
    ) -> Result<bool, AuthError> {
        Ok(self.sessions.is_trusted(user_id, device_id).await?)
    }

    /// # Errors
    /// Internal store failures only.
    pub async fn list_trusted_devices(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<TrustedDevice>, AuthError> {
        Ok(self.sessions.list_trusted_devices(user_id).await?)
    }

    /// Garbage-collect expired/consumed/revoked rows; returns rows removed.
    /// Intended to run from a periodic maintenance task owned by the caller.
    ///
    /// # Errors
    /// Internal store failures only.
    pub async fn sweep_expired(&self) -> Result<u64, AuthError> {
        Ok(self.store.purge_expired(self.clock.now()).await?)
    }

    fn admit(&self, client_key: &str, category: RateCategory) -> Result<(), AuthError> {
        match self.limiter.try_consume(client_key, category) {
            RateLimitDecision::Allowed => Ok(()),
            RateLimitDecision::Limited => Err(AuthError::RateLimited),
        }
    }

    async fn complete_login(
        &self,
        user: User,
        device: &DeviceMeta,
    ) -> Result<IssuedTokens, AuthError> {
        let now = self.clock.now();
        let session = self.sessions.open_session(user.id, device).await?;
        let refresh_token = self
            .refresh_engine
            .issue_initial(user.id, Some(session.id))
            .await?;
        let access_token = self
            .codec
            .issue(
                user.id,
                &user.email,
                user.role,
                TokenType::Access,
                now.timestamp(),
            )
            .map_err(|err| AuthError::Internal(err.into()))?;
        self.store.record_login(user.id, now).await?;
        info!(user_id = %user.id, device_id = %device.device_id, "login completed");

        Ok(IssuedTokens {
            access_token,
            refresh_token,
            expires_in_seconds: self.codec.expiry_seconds(TokenType::Access),
            session_id: Some(session.id),
            user: UserSummary::from(&user),
        })
    }
}
