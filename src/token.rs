//! Compact signed access-token codec.
//!
//! Tokens are self-contained: verification is a pure function of the token
//! and the supplied time, with no store lookup. Deactivating a user therefore
//! does not invalidate access tokens that are already in flight; callers that
//! need instant revocation must check the user's active flag out-of-band.

use base64ct::{Base64UrlUnpadded, Encoding};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use uuid::Uuid;

use crate::config::AuthConfig;
use crate::models::Role;

type HmacSha256 = Hmac<Sha256>;

/// Token class carried in the `typ` claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TokenType {
    Access,
    Refresh,
}

impl TokenType {
    fn from_claim(value: &str) -> Option<Self> {
        match value {
            "ACCESS" => Some(Self::Access),
            "REFRESH" => Some(Self::Refresh),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct TokenHeader {
    alg: String,
    typ: String,
}

impl TokenHeader {
    fn hs256() -> Self {
        Self {
            alg: "HS256".to_string(),
            typ: "JWT".to_string(),
        }
    }
}

/// Verified claim set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claims {
    pub subject: String,
    pub user_id: Uuid,
    pub role: Role,
    pub token_type: TokenType,
    pub issued_at: i64,
    pub expires_at: i64,
    pub issuer: String,
}

/// Wire shape of the claim segment. `typ` stays a string until validated so
/// unknown types surface as `UnsupportedType` rather than a decode error.
#[derive(Debug, Serialize, Deserialize)]
struct RawClaims {
    sub: String,
    uid: Uuid,
    role: Role,
    typ: String,
    iat: i64,
    exp: i64,
    iss: String,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid token format")]
    TokenFormat,
    #[error("invalid base64url encoding")]
    Base64,
    #[error("invalid json")]
    Json(#[from] serde_json::Error),
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlg(String),
    #[error("unsupported token type: {0}")]
    UnsupportedType(String),
    #[error("failed to initialize signing key")]
    Key,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("token expired")]
    Expired,
    #[error("invalid issuer")]
    InvalidIssuer,
}

fn b64e_json<T: Serialize>(value: &T) -> Result<String, Error> {
    let json = serde_json::to_vec(value)?;
    Ok(Base64UrlUnpadded::encode_string(&json))
}

fn b64d_json<T: for<'de> Deserialize<'de>>(s: &str) -> Result<T, Error> {
    let bytes = Base64UrlUnpadded::decode_vec(s).map_err(|_| Error::Base64)?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Stateless HS256 codec for access tokens.
#[derive(Clone)]
pub struct TokenCodec {
    signing_key: SecretString,
    issuer: String,
    access_ttl_seconds: i64,
    refresh_ttl_seconds: i64,
}

impl TokenCodec {
    #[must_use]
    pub fn new(
        signing_key: SecretString,
        issuer: String,
        access_ttl_seconds: i64,
        refresh_ttl_seconds: i64,
    ) -> Self {
        Self {
            signing_key,
            issuer,
            access_ttl_seconds,
            refresh_ttl_seconds,
        }
    }

    #[must_use]
    pub fn from_config(config: &AuthConfig) -> Self {
        Self::new(
            config.signing_key().clone(),
            config.issuer().to_string(),
            config.access_token_ttl_seconds(),
            config.refresh_token_ttl_seconds(),
        )
    }

    /// Configured TTL for client-facing `expires_in` reporting.
    #[must_use]
    pub fn expiry_seconds(&self, token_type: TokenType) -> i64 {
        match token_type {
            TokenType::Access => self.access_ttl_seconds,
            TokenType::Refresh => self.refresh_ttl_seconds,
        }
    }

    /// Build, sign, and encode a token for the given identity.
    ///
    /// # Errors
    ///
    /// Returns an error if claim/header JSON cannot be encoded or the signing
    /// key cannot be initialized.
    pub fn issue(
        &self,
        user_id: Uuid,
        email: &str,
        role: Role,
        token_type: TokenType,
        now_unix_seconds: i64,
    ) -> Result<String, Error> {
        let claims = RawClaims {
            sub: email.to_string(),
            uid: user_id,
            role,
            typ: match token_type {
                TokenType::Access => "ACCESS".to_string(),
                TokenType::Refresh => "REFRESH".to_string(),
            },
            iat: now_unix_seconds,
            exp: now_unix_seconds + self.expiry_seconds(token_type),
            iss: self.issuer.clone(),
        };

        let header_b64 = b64e_json(&TokenHeader::hs256())?;
        let claims_b64 = b64e_json(&claims)?;
        let signing_input = format!("{header_b64}.{claims_b64}");
        let signature_b64 = Base64UrlUnpadded::encode_string(&self.sign(signing_input.as_bytes())?);

        Ok(format!("{signing_input}.{signature_b64}"))
    }

    /// Verify a token and return its decoded claims.
    ///
    /// The signature is checked before the claim segment is decoded; claims
    /// from a token with a bad signature are never read.
    ///
    /// # Errors
    ///
    /// Returns an error if the token is malformed, the algorithm or token
    /// type is unsupported, the signature does not match, the issuer is
    /// wrong, or the token is past its expiry.
    pub fn verify(&self, token: &str, now_unix_seconds: i64) -> Result<Claims, Error> {
        let mut parts = token.split('.');
        let header_b64 = parts.next().ok_or(Error::TokenFormat)?;
        let claims_b64 = parts.next().ok_or(Error::TokenFormat)?;
        let sig_b64 = parts.next().ok_or(Error::TokenFormat)?;
        if parts.next().is_some() {
            return Err(Error::TokenFormat);
        }

        let header: TokenHeader = b64d_json(header_b64)?;
        if header.alg != "HS256" {
            return Err(Error::UnsupportedAlg(header.alg));
        }

        let signing_input = format!("{header_b64}.{claims_b64}");
        let signature = Base64UrlUnpadded::decode_vec(sig_b64).map_err(|_| Error::Base64)?;
        let mut mac = HmacSha256::new_from_slice(self.signing_key.expose_secret().as_bytes())
            .map_err(|_| Error::Key)?;
        mac.update(signing_input.as_bytes());
        // verify_slice is constant-time over the MAC comparison.
        mac.verify_slice(&signature)
            .map_err(|_| Error::InvalidSignature)?;

        let raw: RawClaims = b64d_json(claims_b64)?;
        let token_type =
            TokenType::from_claim(&raw.typ).ok_or_else(|| Error::UnsupportedType(raw.typ.clone()))?;
        if raw.iss != self.issuer {
            return Err(Error::InvalidIssuer);
        }
        if raw.exp <= now_unix_seconds {
            return Err(Error::Expired);
        }

        Ok(Claims {
            subject: raw.sub,
            user_id: raw.uid,
            role: raw.role,
            token_type,
            issued_at: raw.iat,
            expires_at: raw.exp,
            issuer: raw.iss,
        })
    }

    fn sign(&self, input: &[u8]) -> Result<Vec<u8>, Error> {
        let mut mac = HmacSha256::new_from_slice(self.signing_key.expose_secret().as_bytes())
            .map_err(|_| Error::Key)?;
        mac.update(input);
        Ok(mac.finalize().into_bytes().to_vec())
    }
}
