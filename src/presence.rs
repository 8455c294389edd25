use crate::bus::{now_ms, CacheBus};
use crate::db::{now_ts, Db};
use crate::error::ApiError;
use crate::events::{ServerEvent, STATUS_TOPIC};
use crate::models::UserStatus;
use crate::sessions::SessionRegistry;

/// Seconds a user may be socketless before being marked offline.
const OFFLINE_GRACE_SECS: u64 = 10;

/// How often lapsed presence entries are swept out of the set.
const PRUNE_INTERVAL_SECS: u64 = 30;

/// Derives online/offline/away from active sessions and heartbeats, and
/// publishes `user-status` transitions on the global status topic.
#[derive(Clone)]
pub struct PresenceTracker {
    db: Db,
    bus: CacheBus,
    registry: SessionRegistry,
}

impl PresenceTracker {
    pub fn new(db: Db, bus: CacheBus, registry: SessionRegistry) -> Self {
        PresenceTracker { db, bus, registry }
    }

    /// Called when a gateway accepts a socket. Publishes `online` only on
    /// the offline→online edge (first connected device).
    pub async fn on_connect(&self, user_id: &str) -> Result<(), ApiError> {
        let was_online = self.bus.presence_is_online(user_id).await.unwrap_or(false);
        self.bus.presence_heartbeat(user_id, now_ms()).await?;
        if !was_online {
            self.db.update_presence(user_id, UserStatus::Online, None)?;
            self.publish_status(user_id, UserStatus::Online, None).await;
        }
        Ok(())
    }

    /// Called after the gateway detaches a socket. If no device reconnects
    /// within the grace period the user goes offline. Synchronous so drop
    /// guards can call it; the grace wait runs on its own task.
    pub fn on_disconnect(&self, user_id: &str) {
        let tracker = self.clone();
        let user_id = user_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(OFFLINE_GRACE_SECS)).await;
            if tracker.has_connected_session(&user_id).await {
                return;
            }
            let last_seen = now_ts();
            if let Err(e) = tracker.bus.presence_remove(&user_id).await {
                eprintln!("⚠️ presence remove failed: {e}");
            }
            if let Err(e) =
                tracker
                    .db
                    .update_presence(&user_id, UserStatus::Offline, Some(&last_seen))
            {
                eprintln!("⚠️ presence store update failed: {e}");
                return;
            }
            tracker
                .publish_status(&user_id, UserStatus::Offline, Some(last_seen))
                .await;
        });
    }

    pub async fn on_heartbeat(&self, user_id: &str) -> Result<(), ApiError> {
        self.bus.presence_heartbeat(user_id, now_ms()).await
    }

    pub async fn is_online(&self, user_id: &str) -> bool {
        self.bus.presence_is_online(user_id).await.unwrap_or(false)
    }

    /// User-initiated away state.
    pub async fn set_away(&self, user_id: &str) -> Result<(), ApiError> {
        self.db.update_presence(user_id, UserStatus::Away, None)?;
        self.publish_status(user_id, UserStatus::Away, None).await;
        Ok(())
    }

    async fn has_connected_session(&self, user_id: &str) -> bool {
        self.registry
            .list_active(user_id)
            .await
            .map(|sessions| sessions.iter().any(|s| s.socket_id.is_some()))
            .unwrap_or(false)
    }

    async fn publish_status(&self, user_id: &str, status: UserStatus, last_seen_at: Option<String>) {
        let event = ServerEvent::UserStatus {
            user_id: user_id.to_string(),
            status,
            last_seen_at,
        };
        if let Err(e) = self.bus.publish(STATUS_TOPIC, &event).await {
            eprintln!("⚠️ status publish failed: {e}");
        }
    }
}

/// Background sweep dropping presence entries whose heartbeat lapsed.
pub fn spawn_presence_pruner(bus: CacheBus) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(std::time::Duration::from_secs(PRUNE_INTERVAL_SECS)).await;
            if let Err(e) = bus.presence_prune().await {
                eprintln!("⚠️ presence prune failed: {e}");
            }
        }
    });
}
