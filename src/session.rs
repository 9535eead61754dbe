//! Per-device sessions and device trust.
//!
//! Sessions are keyed by `(user, device)` and reactivated on repeat logins.
//! Trust is a separate record that outlives session churn: revoking every
//! session leaves the user's trusted devices in place.

use anyhow::Result;
use std::sync::Arc;
use tracing::error;
use uuid::Uuid;

use crate::clock::Clock;
use crate::models::{DeviceMeta, SessionRecord, TrustedDevice};
use crate::store::{AuthStore, NewSession};

pub struct SessionManager {
    store: Arc<dyn AuthStore>,
    clock: Arc<dyn Clock>,
}

impl SessionManager {
    #[must_use]
    pub fn new(store: Arc<dyn AuthStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Create or reactivate the session for this device. The session's trust
    /// flag mirrors the device's current trust state at open time; a login
    /// from a trusted device also refreshes the trust record's last-used
    /// marker.
    ///
    /// # Errors
    /// Returns an error when the store fails.
    pub async fn open_session(&self, user_id: Uuid, device: &DeviceMeta) -> Result<SessionRecord> {
        let now = self.clock.now();
        let trusted = self
            .store
            .is_device_trusted(user_id, &device.device_id)
            .await?;

        let session = self
            .store
            .upsert_session(&NewSession {
                user_id,
                device: device.clone(),
                is_trusted: trusted,
                now,
            })
            .await?;

        if trusted {
            self.store
                .upsert_trusted_device(user_id, &device.device_id, now)
                .await?;
        }
        Ok(session)
    }

    /// Best-effort activity bump; failures are logged, never surfaced.
    pub async fn touch(&self, session_id: Uuid) {
        let now = self.clock.now();
        if let Err(err) = self.store.touch_session(session_id, now).await {
            error!("Failed to touch session: {err}");
        }
    }

    /// Deactivate one session, revoking its linked refresh token. Reports
    /// whether the session existed.
    ///
    /// # Errors
    /// Returns an error when the store fails.
    pub async fn revoke(&self, session_id: Uuid) -> Result<bool> {
        self.store.revoke_session(session_id, self.clock.now()).await
    }

    /// Deactivate every session of a user; linked refresh tokens cascade to
    /// revoked. Trust records are untouched.
    ///
    /// # Errors
    /// Returns an error when the store fails.
    pub async fn revoke_all(&self, user_id: Uuid) -> Result<u64> {
        self.store
            .revoke_sessions_for_user(user_id, None, self.clock.now())
            .await
    }

    /// Like [`Self::revoke_all`] but spares the given device's session.
    ///
    /// # Errors
    /// Returns an error when the store fails.
    pub async fn revoke_all_except(&self, user_id: Uuid, device_id: &str) -> Result<u64> {
        self.store
            .revoke_sessions_for_user(user_id, Some(device_id), self.clock.now())
            .await
    }

    /// Mark a device trusted for this user.
    ///
    /// # Errors
    /// Returns an error when the store fails.
    pub async fn trust(&self, user_id: Uuid, device_id: &str) -> Result<()> {
        self.store
            .upsert_trusted_device(user_id, device_id, self.clock.now())
            .await
    }

    /// Withdraw trust from a device. Reports whether an active trust record
    /// existed.
    ///
    /// # Errors
    /// Returns an error when the store fails.
    pub async fn untrust(&self, user_id: Uuid, device_id: &str) -> Result<bool> {
        self.store.deactivate_trusted_device(user_id, device_id).await
    }

    /// # Errors
    /// Returns an error when the store fails.
    pub async fn is_trusted(&self, user_id: Uuid, device_id: &str) -> Result<bool> {
        self.store.is_device_trusted(user_id, device_id).await
    }

    /// Active sessions for a "manage devices" view, most recent first.
    ///
    /// # Errors
    /// Returns an error when the store fails.
    pub async fn list_active(&self, user_id: Uuid) -> Result<Vec<SessionRecord>> {
        self.store.list_active_sessions(user_id).await
    }

    /// # Errors
    /// Returns an error when the store fails.
    pub async fn list_trusted_devices(&self, user_id: Uuid) -> Result<Vec<TrustedDevice>> {
        self.store.list_trusted_devices(user_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::SessionManager;
    use crate::clock::{Clock, ManualClock};
    use crate::models::DeviceMeta;
    use crate::store::{AuthStore, MemoryStore, NewRefreshToken, RevokeOutcome};
    use anyhow::Result;
    use chrono::Duration;
    use std::sync::Arc;
    use uuid::Uuid;

    const NOW: i64 = 1_700_000_000;

    struct Harness {
        manager: SessionManager,
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(NOW));
        let manager = SessionManager::new(
            Arc::clone(&store) as Arc<dyn AuthStore>,
            Arc::clone(&clock) as Arc<dyn Clock>,
        );
        Harness {
            manager,
            store,
            clock,
        }
    }

    fn device(id: &str) -> DeviceMeta {
        DeviceMeta {
            device_id: id.to_string(),
            platform: Some("ios".to_string()),
            device_name: Some("Alice's phone".to_string()),
        }
    }

    #[tokio::test]
    async fn open_session_reactivates_by_device() -> Result<()> {
        let h = harness();
        let user_id = Uuid::new_v4();

        let first = h.manager.open_session(user_id, &device("phone-1")).await?;
        h.manager.revoke(first.id).await?;

        let second = h.manager.open_session(user_id, &device("phone-1")).await?;
        assert_eq!(second.id, first.id);
        assert!(second.is_active);

        let other = h.manager.open_session(user_id, &device("phone-2")).await?;
        assert_ne!(other.id, first.id);
        assert_eq!(h.manager.list_active(user_id).await?.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn revoke_cascades_to_linked_refresh_token() -> Result<()> {
        let h = harness();
        let user_id = Uuid::new_v4();
        let session = h.manager.open_session(user_id, &device("phone-1")).await?;

        let now = h.clock.now();
        h.store
            .insert_refresh_token(&NewRefreshToken {
                id: Uuid::new_v4(),
                user_id,
                token_hash: vec![1, 2, 3],
                session_id: Some(session.id),
                expires_at: now + Duration::hours(1),
                created_at: now,
            })
            .await?;

        assert!(h.manager.revoke(session.id).await?);
        assert!(matches!(
            h.store.atomic_revoke_and_fetch(&[1, 2, 3], now).await?,
            RevokeOutcome::AlreadyRevoked(_)
        ));
        assert!(h.manager.list_active(user_id).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn revoke_missing_session_reports_false() -> Result<()> {
        let h = harness();
        assert!(!h.manager.revoke(Uuid::new_v4()).await?);
        Ok(())
    }

    #[tokio::test]
    async fn trust_survives_session_revocation() -> Result<()> {
        let h = harness();
        let user_id = Uuid::new_v4();

        h.manager.trust(user_id, "phone-1").await?;
        h.manager.open_session(user_id, &device("phone-1")).await?;
        h.manager.revoke_all(user_id).await?;

        // Trust outlives the session; a new login lands trusted.
        assert!(h.manager.is_trusted(user_id, "phone-1").await?);
        let session = h.manager.open_session(user_id, &device("phone-1")).await?;
        assert!(session.is_trusted);

        assert!(h.manager.untrust(user_id, "phone-1").await?);
        assert!(!h.manager.is_trusted(user_id, "phone-1").await?);
        let session = h.manager.open_session(user_id, &device("phone-1")).await?;
        assert!(!session.is_trusted);
        Ok(())
    }

    #[tokio::test]
    async fn revoke_all_except_spares_one_device() -> Result<()> {
        let h = harness();
        let user_id = Uuid::new_v4();
        h.manager.open_session(user_id, &device("phone-1")).await?;
        h.manager.open_session(user_id, &device("laptop-1")).await?;

        assert_eq!(h.manager.revoke_all_except(user_id, "phone-1").await?, 1);
        let active = h.manager.list_active(user_id).await?;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].device_id, "phone-1");
        Ok(())
    }

    #[tokio::test]
    async fn touch_updates_activity_and_ignores_missing() -> Result<()> {
        let h = harness();
        let user_id = Uuid::new_v4();
        let session = h.manager.open_session(user_id, &device("phone-1")).await?;

        h.clock.advance(60);
        h.manager.touch(session.id).await;
        let active = h.manager.list_active(user_id).await?;
        assert_eq!(active[0].last_activity_at, h.clock.now());

        // Unknown session ids are a no-op.
        h.manager.touch(Uuid::new_v4()).await;
        Ok(())
    }
}
