//! # Aliro (Credential Issuance & Session Lifecycle Engine)
//!
//! `aliro` authenticates users by password, one-time passcode, or federated
//! identity; issues short-lived signed access tokens and long-lived rotating
//! refresh tokens; tracks per-device sessions and device trust; and admits
//! requests under per-category rate limits. Transport (HTTP routing,
//! notification delivery) lives outside this crate.
//!
//! ## Tokens
//!
//! Access tokens are stateless HS256 credentials: verification is a pure
//! function of the token and the current time, so it never touches the
//! store. The flip side is documented on [`token::TokenCodec::verify`]:
//! deactivating a user does not recall tokens already in flight.
//!
//! Refresh tokens are opaque, store-backed, and single-use: each exchange
//! revokes the presented token and mints a successor. Replaying a consumed
//! token is treated as theft and revokes the user's whole chain.
//!
//! ## Challenges
//!
//! One-time codes are one entity parameterized by purpose (SMS login, email
//! login, password reset, account deletion) with per-purpose TTL and attempt
//! bounds. Re-issuing a code invalidates the previous one; at most one
//! challenge per `(target, purpose)` is ever pending.
//!
//! ## Store
//!
//! The [`store::AuthStore`] trait is the single arbiter of concurrent
//! mutation. [`store::PgStore`] maps it onto Postgres row-level conditional
//! updates; [`store::MemoryStore`] keeps everything behind one mutex for
//! tests and single-process use. Rate-limit state is process-local by
//! design; substitute a [`rate_limit::RateLimiter`] implementation to share
//! limits across instances.

pub mod clock;
pub mod config;
pub mod error;
pub mod models;
pub mod otp;
pub mod password;
pub mod rate_limit;
pub mod refresh;
pub mod service;
pub mod session;
pub mod store;
pub mod token;

mod utils;

pub use clock::{Clock, SystemClock};
pub use config::{AuthConfig, OtpPolicy, RateQuota};
pub use error::AuthError;
pub use models::{DeviceMeta, OtpPurpose, Role};
pub use rate_limit::{NoopRateLimiter, RateCategory, RateLimiter, TokenBucketLimiter};
pub use service::{
    AuthService, FederatedClaims, IssuedTokens, PasswordCredentials, RegisterRequest, UserSummary,
};
pub use store::{AuthStore, MemoryStore, PgStore};
pub use token::{Claims, TokenCodec, TokenType};
