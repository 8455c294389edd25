use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::broadcast;

use super::{now_ms, DeliveryJob, Envelope, StreamEntry};
use crate::error::ApiError;
use crate::events::ServerEvent;
use crate::models::Session;
use crate::rate_limit::{RateLimitInfo, RateLimiter};

/// In-process cache/bus for single-node deployments and tests. Pub/sub is a
/// broadcast channel; the delivery stream is a queue plus a pending map that
/// mirrors consumer-group claim/ack semantics.
#[derive(Clone)]
pub struct MemoryBus {
    inner: Arc<Inner>,
}

struct Inner {
    tx: broadcast::Sender<Envelope>,
    sessions: Mutex<SessionCache>,
    presence: Mutex<HashMap<String, i64>>,
    stream: Mutex<StreamState>,
    limiter: RateLimiter,
}

#[derive(Default)]
struct SessionCache {
    by_id: HashMap<String, (Session, Instant)>,
    by_refresh: HashMap<String, String>,
    by_user: HashMap<String, HashSet<String>>,
}

#[derive(Default)]
struct StreamState {
    next_seq: u64,
    fresh: VecDeque<StreamEntry>,
    pending: HashMap<String, PendingEntry>,
}

struct PendingEntry {
    job: DeliveryJob,
    claimed_at: Instant,
    attempts: u32,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        MemoryBus {
            inner: Arc::new(Inner {
                tx,
                sessions: Mutex::new(SessionCache::default()),
                presence: Mutex::new(HashMap::new()),
                stream: Mutex::new(StreamState::default()),
                limiter: RateLimiter::new(),
            }),
        }
    }

    fn sessions(&self) -> MutexGuard<'_, SessionCache> {
        self.inner.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn stream(&self) -> MutexGuard<'_, StreamState> {
        self.inner.stream.lock().unwrap_or_else(|e| e.into_inner())
    }

    // --- Session cache ---

    pub fn cache_session(&self, session: &Session, ttl_secs: i64) -> Result<(), ApiError> {
        if ttl_secs <= 0 {
            return Ok(());
        }
        let expires = Instant::now() + Duration::from_secs(ttl_secs as u64);
        let mut cache = self.sessions();
        cache
            .by_id
            .insert(session.id.clone(), (session.clone(), expires));
        cache
            .by_refresh
            .insert(session.refresh_secret.clone(), session.id.clone());
        cache
            .by_user
            .entry(session.user_id.clone())
            .or_default()
            .insert(session.id.clone());
        Ok(())
    }

    pub fn session_by_id(&self, session_id: &str) -> Result<Option<Session>, ApiError> {
        let mut cache = self.sessions();
        match cache.by_id.get(session_id) {
            Some((session, expires)) if *expires > Instant::now() => Ok(Some(session.clone())),
            Some(_) => {
                // Expired entry: evict lazily.
                if let Some((session, _)) = cache.by_id.remove(session_id) {
                    cache.by_refresh.remove(&session.refresh_secret);
                    if let Some(set) = cache.by_user.get_mut(&session.user_id) {
                        set.remove(session_id);
                    }
                }
                Ok(None)
            }
            None => Ok(None),
        }
    }

    pub fn session_by_refresh(&self, secret: &str) -> Result<Option<Session>, ApiError> {
        let session_id = {
            let cache = self.sessions();
            cache.by_refresh.get(secret).cloned()
        };
        match session_id {
            Some(id) => self.session_by_id(&id),
            None => Ok(None),
        }
    }

    pub fn session_ids_for_user(&self, user_id: &str) -> Result<Vec<String>, ApiError> {
        let cache = self.sessions();
        Ok(cache
            .by_user
            .get(user_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    pub fn sessions_by_ids(&self, ids: &[String]) -> Result<Vec<Session>, ApiError> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(session) = self.session_by_id(id)? {
                out.push(session);
            }
        }
        Ok(out)
    }

    pub fn evict_session(&self, session: &Session) -> Result<(), ApiError> {
        let mut cache = self.sessions();
        cache.by_id.remove(&session.id);
        cache.by_refresh.remove(&session.refresh_secret);
        if let Some(set) = cache.by_user.get_mut(&session.user_id) {
            set.remove(&session.id);
            if set.is_empty() {
                cache.by_user.remove(&session.user_id);
            }
        }
        Ok(())
    }

    // --- Presence ---

    pub fn presence_heartbeat(&self, user_id: &str, at_ms: i64) -> Result<(), ApiError> {
        let mut presence = self.inner.presence.lock().unwrap_or_else(|e| e.into_inner());
        presence.insert(user_id.to_string(), at_ms);
        Ok(())
    }

    pub fn presence_remove(&self, user_id: &str) -> Result<(), ApiError> {
        let mut presence = self.inner.presence.lock().unwrap_or_else(|e| e.into_inner());
        presence.remove(user_id);
        Ok(())
    }

    pub fn presence_is_online(&self, user_id: &str, max_age_ms: i64) -> Result<bool, ApiError> {
        let presence = self.inner.presence.lock().unwrap_or_else(|e| e.into_inner());
        Ok(presence
            .get(user_id)
            .is_some_and(|at| now_ms() - at <= max_age_ms))
    }

    pub fn presence_prune(&self, max_age_ms: i64) -> Result<(), ApiError> {
        let cutoff = now_ms() - max_age_ms;
        let mut presence = self.inner.presence.lock().unwrap_or_else(|e| e.into_inner());
        presence.retain(|_, at| *at > cutoff);
        Ok(())
    }

    // --- Pub/sub ---

    pub fn publish(&self, topic: &str, event: &ServerEvent) -> Result<(), ApiError> {
        // Ignore send errors (no subscribers)
        let _ = self.inner.tx.send(Envelope {
            topic: topic.to_string(),
            event: event.clone(),
        });
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.inner.tx.subscribe()
    }

    // --- Delivery stream ---

    pub fn enqueue_delivery(&self, job: &DeliveryJob) -> Result<(), ApiError> {
        let mut stream = self.stream();
        stream.next_seq += 1;
        let id = format!("{}-0", stream.next_seq);
        stream.fresh.push_back(StreamEntry {
            id,
            job: job.clone(),
            attempts: 1,
        });
        Ok(())
    }

    pub async fn read_delivery_jobs(
        &self,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<StreamEntry>, ApiError> {
        let mut waited = false;
        loop {
            let claimed = {
                let mut stream = self.stream();
                let mut claimed = Vec::new();
                while claimed.len() < count {
                    match stream.fresh.pop_front() {
                        Some(entry) => {
                            stream.pending.insert(
                                entry.id.clone(),
                                PendingEntry {
                                    job: entry.job.clone(),
                                    claimed_at: Instant::now(),
                                    attempts: entry.attempts,
                                },
                            );
                            claimed.push(entry);
                        }
                        None => break,
                    }
                }
                claimed
            };
            if !claimed.is_empty() || waited || block_ms == 0 {
                return Ok(claimed);
            }
            tokio::time::sleep(Duration::from_millis(block_ms)).await;
            waited = true;
        }
    }

    pub fn ack_delivery(&self, entry_id: &str) -> Result<(), ApiError> {
        let mut stream = self.stream();
        stream.pending.remove(entry_id);
        Ok(())
    }

    pub fn claim_stale_jobs(&self, min_idle_ms: u64) -> Result<Vec<StreamEntry>, ApiError> {
        let min_idle = Duration::from_millis(min_idle_ms);
        let now = Instant::now();
        let mut stream = self.stream();
        let mut claimed = Vec::new();
        for (id, pending) in stream.pending.iter_mut() {
            if now.duration_since(pending.claimed_at) >= min_idle {
                pending.attempts += 1;
                pending.claimed_at = now;
                claimed.push(StreamEntry {
                    id: id.clone(),
                    job: pending.job.clone(),
                    attempts: pending.attempts,
                });
            }
        }
        Ok(claimed)
    }

    // --- Rate limits ---

    pub fn rate_check(&self, key: &str, max: usize, window_secs: u64) -> RateLimitInfo {
        self.inner.limiter.check(key, max, window_secs)
    }

    pub fn rate_clear(&self, key: &str) {
        self.inner.limiter.clear(key);
    }
}
