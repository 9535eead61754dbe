//! End-to-end flows over the in-memory store: the full register → login →
//! refresh → logout lifecycle, rotation under contention, and the
//! brute-force bound on one-time codes.

use aliro::clock::ManualClock;
use aliro::models::DeviceMeta;
use aliro::otp::{OtpEngine, OtpError};
use aliro::refresh::{RefreshEngine, RotateError};
use aliro::store::AuthStore;
use aliro::token::TokenCodec;
use aliro::{
    AuthConfig, AuthError, AuthService, Clock, MemoryStore, NoopRateLimiter, OtpPolicy,
    OtpPurpose, PasswordCredentials, RegisterRequest,
};
use anyhow::{Context, Result};
use secrecy::SecretString;
use std::sync::Arc;

const NOW: i64 = 1_700_000_000;

fn device(id: &str) -> DeviceMeta {
    DeviceMeta {
        device_id: id.to_string(),
        platform: Some("ios".to_string()),
        device_name: Some("test device".to_string()),
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn service_harness() -> (Arc<AuthService>, Arc<MemoryStore>, Arc<ManualClock>) {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(NOW));
    let config = AuthConfig::new(SecretString::from("integration-test-key".to_string()))
        .with_otp_policy(OtpPurpose::LoginSms, OtpPolicy::new(6, 300, 3));
    let service = Arc::new(AuthService::new(
        Arc::clone(&store) as Arc<dyn AuthStore>,
        Arc::clone(&clock) as Arc<dyn Clock>,
        Arc::new(NoopRateLimiter),
        config,
    ));
    (service, store, clock)
}

async fn latest_code(store: &MemoryStore) -> Result<String> {
    let outbox = store.outbox().await;
    let entry = outbox.last().context("outbox is empty")?;
    let code = entry
        .payload
        .get("code")
        .and_then(serde_json::Value::as_str)
        .context("payload missing code")?;
    Ok(code.to_string())
}

#[tokio::test]
async fn full_credential_lifecycle() -> Result<()> {
    let (service, _store, clock) = service_harness();

    // Register and log in.
    let summary = service
        .register(RegisterRequest {
            email: "a@x.com".to_string(),
            phone: None,
            password: "Passw0rd1".to_string(),
        })
        .await?;

    let issued = service
        .login_password(
            PasswordCredentials {
                email: "a@x.com".to_string(),
                password: "Passw0rd1".to_string(),
            },
            device("phone-1"),
            "198.51.100.7",
        )
        .await?;
    assert_eq!(issued.user.id, summary.id);

    let claims = service.verify_access_token(&issued.access_token)?;
    assert_eq!(claims.subject, "a@x.com");
    assert_eq!(claims.expires_at - claims.issued_at, 15 * 60);

    // Rotate twice: each successor keeps working.
    let first = issued.refresh_token;
    let rotated = service.refresh(&first, "198.51.100.7").await?;
    let second = rotated.refresh_token;
    let rotated = service.refresh(&second, "198.51.100.7").await?;
    let third = rotated.refresh_token;

    // Replaying the first token is a reuse signal that kills the chain.
    let result = service.refresh(&first, "198.51.100.7").await;
    assert!(matches!(result, Err(AuthError::TokenReused)));
    let result = service.refresh(&third, "198.51.100.7").await;
    assert!(matches!(result, Err(AuthError::TokenInvalid)));

    // Access tokens issued earlier stay valid until expiry (stateless), then
    // lapse.
    service.verify_access_token(&issued.access_token)?;
    clock.advance(15 * 60);
    let result = service.verify_access_token(&issued.access_token);
    assert!(matches!(result, Err(AuthError::TokenInvalid)));

    // Fresh login, then logout: the revoked token stops refreshing.
    let issued = service
        .login_password(
            PasswordCredentials {
                email: "a@x.com".to_string(),
                password: "Passw0rd1".to_string(),
            },
            device("phone-1"),
            "198.51.100.7",
        )
        .await?;
    service.logout(&issued.refresh_token).await?;
    let result = service.refresh(&issued.refresh_token, "198.51.100.7").await;
    assert!(matches!(result, Err(AuthError::TokenInvalid)));

    // Logout deactivated the session too.
    assert!(service.list_sessions(summary.id).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn trust_survives_logout_everywhere() -> Result<()> {
    let (service, _store, _clock) = service_harness();
    let summary = service
        .register(RegisterRequest {
            email: "a@x.com".to_string(),
            phone: None,
            password: "Passw0rd1".to_string(),
        })
        .await?;
    let credentials = PasswordCredentials {
        email: "a@x.com".to_string(),
        password: "Passw0rd1".to_string(),
    };

    service
        .login_password(credentials.clone(), device("phone-1"), "198.51.100.7")
        .await?;
    service.trust_device(summary.id, "phone-1").await?;
    service.logout_everywhere(summary.id).await?;

    assert!(service.list_sessions(summary.id).await?.is_empty());
    // Trust is untouched by session revocation; the next login from the
    // device opens a fresh session already marked trusted.
    assert!(service.is_device_trusted(summary.id, "phone-1").await?);
    service
        .login_password(credentials, device("phone-1"), "198.51.100.7")
        .await?;
    let sessions = service.list_sessions(summary.id).await?;
    assert_eq!(sessions.len(), 1);
    assert!(sessions[0].is_trusted);
    Ok(())
}

#[tokio::test]
async fn concurrent_rotation_has_exactly_one_winner() -> Result<()> {
    let (service, store, clock) = service_harness();
    let summary = service
        .register(RegisterRequest {
            email: "a@x.com".to_string(),
            phone: None,
            password: "Passw0rd1".to_string(),
        })
        .await?;

    let codec = TokenCodec::new(
        SecretString::from("integration-test-key".to_string()),
        "aliro".to_string(),
        900,
        3600,
    );
    let engine = Arc::new(RefreshEngine::new(
        Arc::clone(&store) as Arc<dyn AuthStore>,
        clock as Arc<dyn Clock>,
        codec,
        3600,
    ));
    let token = engine.issue_initial(summary.id, None).await?;

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let engine = Arc::clone(&engine);
            let token = token.clone();
            tokio::spawn(async move { engine.rotate(&token).await })
        })
        .collect();

    let mut wins = 0;
    let mut reuse_failures = 0;
    for handle in handles {
        match handle.await? {
            Ok(_) => wins += 1,
            Err(RotateError::AlreadyRotated) => reuse_failures += 1,
            Err(other) => panic!("unexpected rotation outcome: {other:?}"),
        }
    }
    assert_eq!(wins, 1);
    assert_eq!(reuse_failures, 7);
    Ok(())
}

#[tokio::test]
async fn concurrent_otp_guesses_cannot_exceed_attempt_bound() -> Result<()> {
    let (_service, store, _clock) = service_harness();
    let clock = Arc::new(ManualClock::new(NOW));
    let config = AuthConfig::new(SecretString::from("integration-test-key".to_string()))
        .with_otp_policy(OtpPurpose::LoginSms, OtpPolicy::new(6, 300, 3));
    let engine = Arc::new(OtpEngine::new(
        Arc::clone(&store) as Arc<dyn AuthStore>,
        clock as Arc<dyn Clock>,
        config,
    ));

    engine
        .create("+14155550123", OtpPurpose::LoginSms, None)
        .await?;
    let code = latest_code(&store).await?;
    let wrong = Arc::new(if code == "000000" {
        "111111".to_string()
    } else {
        "000000".to_string()
    });

    let handles: Vec<_> = (0..10)
        .map(|_| {
            let engine = Arc::clone(&engine);
            let wrong = Arc::clone(&wrong);
            tokio::spawn(async move {
                engine
                    .verify("+14155550123", OtpPurpose::LoginSms, &wrong)
                    .await
            })
        })
        .collect();

    let mut mismatches = 0;
    let mut exhausted = 0;
    for handle in handles {
        match handle.await? {
            Err(OtpError::Mismatch) => mismatches += 1,
            Err(OtpError::Exhausted) => exhausted += 1,
            other => panic!("unexpected otp outcome: {other:?}"),
        }
    }
    // The atomic increment caps code comparisons at max_attempts, no matter
    // how the guesses interleave.
    assert_eq!(mismatches, 3);
    assert_eq!(exhausted, 7);

    // Even the right code is dead once the bound is hit.
    let result = engine
        .verify("+14155550123", OtpPurpose::LoginSms, &code)
        .await;
    assert!(matches!(result, Err(OtpError::Exhausted)));
    Ok(())
}
