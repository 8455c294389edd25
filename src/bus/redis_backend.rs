use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::{cmd, Client};
use tokio::sync::broadcast;

use super::{
    now_ms, session_id_key, session_refresh_key, session_user_key, DeliveryJob, Envelope,
    StreamEntry, DELIVERY_GROUP, DELIVERY_STREAM, SESSION_CACHE_MAX_TTL_SECS,
};
use crate::error::ApiError;
use crate::events::ServerEvent;
use crate::models::Session;
use crate::rate_limit::RateLimitInfo;

const PRESENCE_KEY: &str = "presence:online";

/// Redis-backed cache/bus for multi-node deployments. One multiplexed
/// connection per role: commands, publishing, stream consumption, plus a
/// dedicated pub/sub connection owned by the subscriber task.
#[derive(Clone)]
pub struct RedisBus {
    commands: ConnectionManager,
    publisher: ConnectionManager,
    stream: ConnectionManager,
    tx: broadcast::Sender<Envelope>,
}

impl RedisBus {
    pub async fn connect(url: &str) -> Result<RedisBus, ApiError> {
        let client = Client::open(url).map_err(ApiError::from)?;
        let mut commands = client.get_connection_manager().await?;
        let publisher = client.get_connection_manager().await?;
        let stream = client.get_connection_manager().await?;

        // Consumer group creation is idempotent; BUSYGROUP means it exists.
        let created: Result<(), redis::RedisError> = cmd("XGROUP")
            .arg("CREATE")
            .arg(DELIVERY_STREAM)
            .arg(DELIVERY_GROUP)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut commands)
            .await;
        if let Err(e) = created {
            if !e.to_string().contains("BUSYGROUP") {
                return Err(e.into());
            }
        }

        let (tx, _) = broadcast::channel(1024);
        spawn_subscriber(client, tx.clone());

        Ok(RedisBus {
            commands,
            publisher,
            stream,
            tx,
        })
    }

    // --- Session cache ---

    pub async fn cache_session(&self, session: &Session, ttl_secs: i64) -> Result<(), ApiError> {
        if ttl_secs <= 0 {
            return Ok(());
        }
        let blob = serde_json::to_string(session)
            .map_err(|e| ApiError::Internal(e.to_string()))?;
        let mut conn = self.commands.clone();
        let _: () = cmd("SET")
            .arg(session_id_key(&session.id))
            .arg(&blob)
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut conn)
            .await?;
        let _: () = cmd("SET")
            .arg(session_refresh_key(&session.refresh_secret))
            .arg(&blob)
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut conn)
            .await?;
        let _: i64 = cmd("SADD")
            .arg(session_user_key(&session.user_id))
            .arg(&session.id)
            .query_async(&mut conn)
            .await?;
        let _: i64 = cmd("EXPIRE")
            .arg(session_user_key(&session.user_id))
            .arg(SESSION_CACHE_MAX_TTL_SECS)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn session_by_id(&self, session_id: &str) -> Result<Option<Session>, ApiError> {
        self.fetch_session(&session_id_key(session_id)).await
    }

    pub async fn session_by_refresh(&self, secret: &str) -> Result<Option<Session>, ApiError> {
        self.fetch_session(&session_refresh_key(secret)).await
    }

    async fn fetch_session(&self, key: &str) -> Result<Option<Session>, ApiError> {
        let mut conn = self.commands.clone();
        let blob: Option<String> = cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(blob.and_then(|b| serde_json::from_str(&b).ok()))
    }

    pub async fn session_ids_for_user(&self, user_id: &str) -> Result<Vec<String>, ApiError> {
        let mut conn = self.commands.clone();
        let ids: Vec<String> = cmd("SMEMBERS")
            .arg(session_user_key(user_id))
            .query_async(&mut conn)
            .await?;
        Ok(ids)
    }

    pub async fn sessions_by_ids(&self, ids: &[String]) -> Result<Vec<Session>, ApiError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.commands.clone();
        let mut fetch = cmd("MGET");
        for id in ids {
            fetch.arg(session_id_key(id));
        }
        let blobs: Vec<Option<String>> = fetch.query_async(&mut conn).await?;
        Ok(blobs
            .into_iter()
            .flatten()
            .filter_map(|b| serde_json::from_str(&b).ok())
            .collect())
    }

    pub async fn evict_session(&self, session: &Session) -> Result<(), ApiError> {
        let mut conn = self.commands.clone();
        let _: i64 = cmd("DEL")
            .arg(session_id_key(&session.id))
            .arg(session_refresh_key(&session.refresh_secret))
            .query_async(&mut conn)
            .await?;
        let _: i64 = cmd("SREM")
            .arg(session_user_key(&session.user_id))
            .arg(&session.id)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    // --- Presence ---

    pub async fn presence_heartbeat(&self, user_id: &str, at_ms: i64) -> Result<(), ApiError> {
        let mut conn = self.commands.clone();
        let _: i64 = cmd("ZADD")
            .arg(PRESENCE_KEY)
            .arg(at_ms)
            .arg(user_id)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn presence_remove(&self, user_id: &str) -> Result<(), ApiError> {
        let mut conn = self.commands.clone();
        let _: i64 = cmd("ZREM")
            .arg(PRESENCE_KEY)
            .arg(user_id)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn presence_is_online(
        &self,
        user_id: &str,
        max_age_ms: i64,
    ) -> Result<bool, ApiError> {
        let mut conn = self.commands.clone();
        let score: Option<f64> = cmd("ZSCORE")
            .arg(PRESENCE_KEY)
            .arg(user_id)
            .query_async(&mut conn)
            .await?;
        Ok(score.is_some_and(|at| now_ms() - at as i64 <= max_age_ms))
    }

    pub async fn presence_prune(&self, max_age_ms: i64) -> Result<(), ApiError> {
        let mut conn = self.commands.clone();
        let _: i64 = cmd("ZREMRANGEBYSCORE")
            .arg(PRESENCE_KEY)
            .arg("-inf")
            .arg(now_ms() - max_age_ms)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    // --- Pub/sub ---

    pub async fn publish(&self, topic: &str, event: &ServerEvent) -> Result<(), ApiError> {
        let payload =
            serde_json::to_string(event).map_err(|e| ApiError::Internal(e.to_string()))?;
        let mut conn = self.publisher.clone();
        let _: i64 = cmd("PUBLISH")
            .arg(topic)
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.tx.subscribe()
    }

    // --- Delivery stream ---

    pub async fn enqueue_delivery(&self, job: &DeliveryJob) -> Result<(), ApiError> {
        let payload = serde_json::to_string(job).map_err(|e| ApiError::Internal(e.to_string()))?;
        let mut conn = self.commands.clone();
        let _: String = cmd("XADD")
            .arg(DELIVERY_STREAM)
            .arg("*")
            .arg("job")
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn read_delivery_jobs(
        &self,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<StreamEntry>, ApiError> {
        type Fields = Vec<(String, String)>;
        type Entries = Vec<(String, Fields)>;
        type Reply = Option<Vec<(String, Entries)>>;

        let mut conn = self.stream.clone();
        let reply: Reply = cmd("XREADGROUP")
            .arg("GROUP")
            .arg(DELIVERY_GROUP)
            .arg(consumer)
            .arg("COUNT")
            .arg(count)
            .arg("BLOCK")
            .arg(block_ms)
            .arg("STREAMS")
            .arg(DELIVERY_STREAM)
            .arg(">")
            .query_async(&mut conn)
            .await?;

        let mut out = Vec::new();
        if let Some(keys) = reply {
            for (_, entries) in keys {
                for (id, fields) in entries {
                    if let Some(job) = decode_job(&fields) {
                        out.push(StreamEntry { id, job, attempts: 1 });
                    }
                }
            }
        }
        Ok(out)
    }

    pub async fn ack_delivery(&self, entry_id: &str) -> Result<(), ApiError> {
        let mut conn = self.commands.clone();
        let _: i64 = cmd("XACK")
            .arg(DELIVERY_STREAM)
            .arg(DELIVERY_GROUP)
            .arg(entry_id)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// XPENDING (with the IDLE filter) supplies the delivery count, XCLAIM
    /// hands the entries to this consumer and bumps that count.
    pub async fn claim_stale_jobs(
        &self,
        consumer: &str,
        min_idle_ms: u64,
    ) -> Result<Vec<StreamEntry>, ApiError> {
        let mut conn = self.commands.clone();
        let pending: Vec<(String, String, i64, i64)> = cmd("XPENDING")
            .arg(DELIVERY_STREAM)
            .arg(DELIVERY_GROUP)
            .arg("IDLE")
            .arg(min_idle_ms)
            .arg("-")
            .arg("+")
            .arg(100)
            .query_async(&mut conn)
            .await?;
        if pending.is_empty() {
            return Ok(Vec::new());
        }

        let mut claim = cmd("XCLAIM");
        claim
            .arg(DELIVERY_STREAM)
            .arg(DELIVERY_GROUP)
            .arg(consumer)
            .arg(min_idle_ms);
        for (id, _, _, _) in &pending {
            claim.arg(id);
        }
        let claimed: Vec<(String, Vec<(String, String)>)> =
            claim.query_async(&mut conn).await?;

        let attempts_by_id: std::collections::HashMap<&str, i64> = pending
            .iter()
            .map(|(id, _, _, count)| (id.as_str(), *count))
            .collect();

        let mut out = Vec::new();
        for (id, fields) in claimed {
            if let Some(job) = decode_job(&fields) {
                // XCLAIM itself counts as one more delivery.
                let attempts = attempts_by_id.get(id.as_str()).copied().unwrap_or(1) + 1;
                out.push(StreamEntry { id, job, attempts: attempts as u32 });
            }
        }
        Ok(out)
    }

    // --- Rate limits ---

    pub async fn rate_check(
        &self,
        key: &str,
        max: usize,
        window_secs: u64,
    ) -> Result<RateLimitInfo, ApiError> {
        let redis_key = format!("rl:{key}");
        let mut conn = self.commands.clone();
        let count: i64 = cmd("INCR").arg(&redis_key).query_async(&mut conn).await?;
        if count == 1 {
            let _: i64 = cmd("EXPIRE")
                .arg(&redis_key)
                .arg(window_secs)
                .query_async(&mut conn)
                .await?;
        }
        if count as usize > max {
            let ttl: i64 = cmd("TTL").arg(&redis_key).query_async(&mut conn).await?;
            return Ok(RateLimitInfo {
                allowed: false,
                limit: max,
                remaining: 0,
                retry_after_secs: ttl.max(1) as u64,
            });
        }
        Ok(RateLimitInfo {
            allowed: true,
            limit: max,
            remaining: max.saturating_sub(count as usize),
            retry_after_secs: 0,
        })
    }

    pub async fn rate_clear(&self, key: &str) -> Result<(), ApiError> {
        let mut conn = self.commands.clone();
        let _: i64 = cmd("DEL")
            .arg(format!("rl:{key}"))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

fn decode_job(fields: &[(String, String)]) -> Option<DeliveryJob> {
    fields
        .iter()
        .find(|(name, _)| name == "job")
        .and_then(|(_, payload)| serde_json::from_str(payload).ok())
}

/// Receives every `chat:*`, `user:*` and `status:*` publication and re-emits
/// it on the node-local broadcast channel. A dropped pub/sub connection is
/// retried forever; stream recovery covers anything missed.
fn spawn_subscriber(client: Client, tx: broadcast::Sender<Envelope>) {
    tokio::spawn(async move {
        loop {
            match client.get_async_pubsub().await {
                Ok(mut pubsub) => {
                    let subscribed = async {
                        pubsub.psubscribe("chat:*").await?;
                        pubsub.psubscribe("user:*").await?;
                        pubsub.psubscribe("status:*").await?;
                        Ok::<(), redis::RedisError>(())
                    }
                    .await;
                    if let Err(e) = subscribed {
                        eprintln!("⚠️ bus subscriber: psubscribe failed: {e}");
                        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                        continue;
                    }
                    let mut messages = pubsub.on_message();
                    while let Some(msg) = messages.next().await {
                        let topic = msg.get_channel_name().to_string();
                        let payload: String = match msg.get_payload() {
                            Ok(p) => p,
                            Err(_) => continue,
                        };
                        match serde_json::from_str::<ServerEvent>(&payload) {
                            Ok(event) => {
                                let _ = tx.send(Envelope { topic, event });
                            }
                            Err(e) => {
                                eprintln!("⚠️ bus subscriber: undecodable event on {topic}: {e}");
                            }
                        }
                    }
                    eprintln!("⚠️ bus subscriber: pub/sub connection closed, reconnecting");
                }
                Err(e) => {
                    eprintln!("⚠️ bus subscriber: connect failed: {e}");
                }
            }
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        }
    });
}
