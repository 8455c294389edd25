mod memory;
mod redis_backend;

pub use memory::MemoryBus;
pub use redis_backend::RedisBus;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::ApiError;
use crate::events::ServerEvent;
use crate::models::Session;
use crate::rate_limit::RateLimitInfo;

/// Name of the durable delivery stream and its consumer group.
pub const DELIVERY_STREAM: &str = "delivery-stream";
pub const DELIVERY_GROUP: &str = "delivery-workers";

/// Presence entries older than this are considered offline.
pub const PRESENCE_MAX_AGE_MS: i64 = 90_000;

/// Session cache entries live at most an hour (callers further bound by the
/// session's remaining life).
pub const SESSION_CACHE_MAX_TTL_SECS: i64 = 3600;

/// A fan-out job on the durable delivery stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryJob {
    pub message_id: String,
    pub chat_id: String,
    pub recipients: Vec<String>,
    pub attempts: u32,
    pub created_at: String,
}

/// A claimed stream entry: the job plus its stream id and how many times it
/// has been handed to a consumer.
#[derive(Debug, Clone)]
pub struct StreamEntry {
    pub id: String,
    pub job: DeliveryJob,
    pub attempts: u32,
}

/// An event observed on a pub/sub topic. Every backend funnels received
/// events into one node-local broadcast channel; socket loops subscribe
/// there and filter by the rooms they joined.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub topic: String,
    pub event: ServerEvent,
}

/// The cache/bus: session cache, presence set, pub/sub fan-out, durable
/// delivery stream and rate-limit windows. Two backends: in-process for a
/// single node (and tests), Redis for multi-node deployments.
#[derive(Clone)]
pub enum CacheBus {
    Memory(MemoryBus),
    Redis(RedisBus),
}

impl CacheBus {
    pub fn memory() -> CacheBus {
        CacheBus::Memory(MemoryBus::new())
    }

    pub async fn connect(url: &str) -> Result<CacheBus, ApiError> {
        if url.starts_with("memory://") {
            Ok(CacheBus::memory())
        } else {
            Ok(CacheBus::Redis(RedisBus::connect(url).await?))
        }
    }

    // --- Session cache ---

    /// Writes all three key patterns (`session:byId`, `session:byRefresh`,
    /// `session:byUser`) for the session.
    pub async fn cache_session(&self, session: &Session, ttl_secs: i64) -> Result<(), ApiError> {
        match self {
            CacheBus::Memory(b) => b.cache_session(session, ttl_secs),
            CacheBus::Redis(b) => b.cache_session(session, ttl_secs).await,
        }
    }

    pub async fn session_by_id(&self, session_id: &str) -> Result<Option<Session>, ApiError> {
        match self {
            CacheBus::Memory(b) => b.session_by_id(session_id),
            CacheBus::Redis(b) => b.session_by_id(session_id).await,
        }
    }

    pub async fn session_by_refresh(&self, secret: &str) -> Result<Option<Session>, ApiError> {
        match self {
            CacheBus::Memory(b) => b.session_by_refresh(secret),
            CacheBus::Redis(b) => b.session_by_refresh(secret).await,
        }
    }

    pub async fn session_ids_for_user(&self, user_id: &str) -> Result<Vec<String>, ApiError> {
        match self {
            CacheBus::Memory(b) => b.session_ids_for_user(user_id),
            CacheBus::Redis(b) => b.session_ids_for_user(user_id).await,
        }
    }

    /// One round-trip for the id set, one batched fetch for the blobs.
    pub async fn sessions_by_ids(&self, ids: &[String]) -> Result<Vec<Session>, ApiError> {
        match self {
            CacheBus::Memory(b) => b.sessions_by_ids(ids),
            CacheBus::Redis(b) => b.sessions_by_ids(ids).await,
        }
    }

    pub async fn evict_session(&self, session: &Session) -> Result<(), ApiError> {
        match self {
            CacheBus::Memory(b) => b.evict_session(session),
            CacheBus::Redis(b) => b.evict_session(session).await,
        }
    }

    // --- Presence ---

    pub async fn presence_heartbeat(&self, user_id: &str, at_ms: i64) -> Result<(), ApiError> {
        match self {
            CacheBus::Memory(b) => b.presence_heartbeat(user_id, at_ms),
            CacheBus::Redis(b) => b.presence_heartbeat(user_id, at_ms).await,
        }
    }

    pub async fn presence_remove(&self, user_id: &str) -> Result<(), ApiError> {
        match self {
            CacheBus::Memory(b) => b.presence_remove(user_id),
            CacheBus::Redis(b) => b.presence_remove(user_id).await,
        }
    }

    pub async fn presence_is_online(&self, user_id: &str) -> Result<bool, ApiError> {
        match self {
            CacheBus::Memory(b) => b.presence_is_online(user_id, PRESENCE_MAX_AGE_MS),
            CacheBus::Redis(b) => b.presence_is_online(user_id, PRESENCE_MAX_AGE_MS).await,
        }
    }

    /// Drops presence entries past the heartbeat horizon.
    pub async fn presence_prune(&self) -> Result<(), ApiError> {
        match self {
            CacheBus::Memory(b) => b.presence_prune(PRESENCE_MAX_AGE_MS),
            CacheBus::Redis(b) => b.presence_prune(PRESENCE_MAX_AGE_MS).await,
        }
    }

    // --- Pub/sub ---

    /// Best-effort publish; loss is compensated by the delivery stream.
    pub async fn publish(&self, topic: &str, event: &ServerEvent) -> Result<(), ApiError> {
        match self {
            CacheBus::Memory(b) => b.publish(topic, event),
            CacheBus::Redis(b) => b.publish(topic, event).await,
        }
    }

    /// Node-local subscription to everything this node receives.
    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        match self {
            CacheBus::Memory(b) => b.subscribe(),
            CacheBus::Redis(b) => b.subscribe(),
        }
    }

    // --- Delivery stream ---

    pub async fn enqueue_delivery(&self, job: &DeliveryJob) -> Result<(), ApiError> {
        match self {
            CacheBus::Memory(b) => b.enqueue_delivery(job),
            CacheBus::Redis(b) => b.enqueue_delivery(job).await,
        }
    }

    /// Reads up to `count` new entries for the consumer, blocking up to
    /// `block_ms` when the stream is empty.
    pub async fn read_delivery_jobs(
        &self,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<StreamEntry>, ApiError> {
        match self {
            CacheBus::Memory(b) => b.read_delivery_jobs(count, block_ms).await,
            CacheBus::Redis(b) => b.read_delivery_jobs(consumer, count, block_ms).await,
        }
    }

    pub async fn ack_delivery(&self, entry_id: &str) -> Result<(), ApiError> {
        match self {
            CacheBus::Memory(b) => b.ack_delivery(entry_id),
            CacheBus::Redis(b) => b.ack_delivery(entry_id).await,
        }
    }

    /// Re-claims pending entries idle for longer than `min_idle_ms`,
    /// incrementing their attempt count.
    pub async fn claim_stale_jobs(
        &self,
        consumer: &str,
        min_idle_ms: u64,
    ) -> Result<Vec<StreamEntry>, ApiError> {
        match self {
            CacheBus::Memory(b) => b.claim_stale_jobs(min_idle_ms),
            CacheBus::Redis(b) => b.claim_stale_jobs(consumer, min_idle_ms).await,
        }
    }

    // --- Rate limits ---

    pub async fn rate_check(
        &self,
        key: &str,
        max: usize,
        window_secs: u64,
    ) -> Result<RateLimitInfo, ApiError> {
        match self {
            CacheBus::Memory(b) => Ok(b.rate_check(key, max, window_secs)),
            CacheBus::Redis(b) => b.rate_check(key, max, window_secs).await,
        }
    }

    /// Drops a rate window; auth limits skip successful requests.
    pub async fn rate_clear(&self, key: &str) -> Result<(), ApiError> {
        match self {
            CacheBus::Memory(b) => {
                b.rate_clear(key);
                Ok(())
            }
            CacheBus::Redis(b) => b.rate_clear(key).await,
        }
    }
}

pub(crate) fn session_id_key(id: &str) -> String {
    format!("session:byId:{id}")
}

pub(crate) fn session_refresh_key(secret: &str) -> String {
    format!("session:byRefresh:{secret}")
}

pub(crate) fn session_user_key(user_id: &str) -> String {
    format!("session:byUser:{user_id}")
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
