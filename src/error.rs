//! Error taxonomy surfaced by the service facade.

use crate::otp::OtpError;
use crate::refresh::RotateError;
use thiserror::Error;

/// Typed failures returned to callers of [`crate::service::AuthService`].
///
/// Login-class paths never reveal whether an account exists: missing users,
/// wrong passwords, and absent password hashes all collapse into
/// `InvalidCredentials`. Session/device management paths return `NotFound`
/// for absent targets instead.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("account disabled")]
    AccountDisabled,
    #[error("account already exists")]
    AlreadyExists,
    #[error("invalid or expired token")]
    TokenInvalid,
    #[error("refresh token reuse detected")]
    TokenReused,
    #[error("rate limited")]
    RateLimited,
    #[error(transparent)]
    Otp(OtpError),
    #[error("not found")]
    NotFound,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("internal error")]
    Internal(#[source] anyhow::Error),
}

impl From<OtpError> for AuthError {
    fn from(err: OtpError) -> Self {
        match err {
            // Store failures stay internal; callers must not mistake them for
            // a challenge outcome.
            OtpError::Internal(source) => Self::Internal(source),
            other => Self::Otp(other),
        }
    }
}

impl From<RotateError> for AuthError {
    fn from(err: RotateError) -> Self {
        match err {
            RotateError::NotFound | RotateError::Revoked => Self::TokenInvalid,
            RotateError::Expired => Self::TokenInvalid,
            RotateError::AlreadyRotated => Self::TokenReused,
            RotateError::AccountDisabled => Self::AccountDisabled,
            RotateError::Internal(source) => Self::Internal(source),
        }
    }
}

impl From<anyhow::Error> for AuthError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err)
    }
}

#[cfg(test)]
mod tests {
    use super::AuthError;
    use crate::otp::OtpError;
    use crate::refresh::RotateError;

    #[test]
    fn otp_store_failures_map_to_internal() {
        let err: AuthError = OtpError::Internal(anyhow::anyhow!("connection reset")).into();
        assert!(matches!(err, AuthError::Internal(_)));

        let err: AuthError = OtpError::Mismatch.into();
        assert!(matches!(err, AuthError::Otp(OtpError::Mismatch)));
    }

    #[test]
    fn rotation_failures_map_per_taxonomy() {
        assert!(matches!(
            AuthError::from(RotateError::NotFound),
            AuthError::TokenInvalid
        ));
        assert!(matches!(
            AuthError::from(RotateError::AlreadyRotated),
            AuthError::TokenReused
        ));
        assert!(matches!(
            AuthError::from(RotateError::AccountDisabled),
            AuthError::AccountDisabled
        ));
    }

    #[test]
    fn messages_never_echo_secrets() {
        // Display output is part of the caller contract; it must stay generic.
        assert_eq!(AuthError::InvalidCredentials.to_string(), "invalid credentials");
        assert_eq!(AuthError::TokenReused.to_string(), "refresh token reuse detected");
    }
}
