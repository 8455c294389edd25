use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::bus::{CacheBus, DeliveryJob, StreamEntry};
use crate::db::{now_ts, Db};
use crate::error::ApiError;
use crate::events::{user_topic, ServerEvent};
use crate::presence::PresenceTracker;

/// Entries read per consumer iteration.
const READ_COUNT: usize = 10;
/// Stream read block.
const READ_BLOCK_MS: u64 = 1000;
/// Pending entries idle this long are re-claimed.
const PENDING_IDLE_MS: u64 = 60_000;
/// Attempts after which an entry is dead-lettered (acked and logged).
const MAX_ATTEMPTS: u32 = 5;
/// Reconciliation sweep cadence and grace before a `sent` row is considered
/// stale.
const RECONCILE_INTERVAL_SECS: u64 = 300;
const RECONCILE_GRACE_SECS: i64 = 120;
/// A reconciled message is not re-enqueued again for this long, so offline
/// recipients don't generate a job per sweep.
const RECONCILE_SUPPRESS_SECS: u64 = 900;
/// Offline replay bound per reconnect cycle.
pub const REPLAY_LIMIT: i64 = 100;

/// Consumer name identifying this node in the delivery-workers group.
pub fn consumer_name() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "node".to_string());
    format!("{host}:{}", std::process::id())
}

/// Orchestrates durable at-least-once fan-out: claims jobs from the
/// delivery stream, pushes `new-message` to online recipients, flips
/// delivery rows, re-claims stalled entries and reconciles rows whose jobs
/// were lost. One engine per node.
#[derive(Clone)]
pub struct DeliveryEngine {
    db: Db,
    bus: CacheBus,
    presence: PresenceTracker,
    consumer: String,
    reconciled: Arc<Mutex<HashMap<String, Instant>>>,
}

impl DeliveryEngine {
    pub fn new(db: Db, bus: CacheBus, presence: PresenceTracker) -> Self {
        DeliveryEngine {
            db,
            bus,
            presence,
            consumer: consumer_name(),
            reconciled: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Starts the consumer loop and the reconciliation sweep. Errors never
    /// terminate either loop; they are logged and the loop proceeds.
    pub fn spawn(self) {
        let consumer = self.clone();
        tokio::spawn(async move {
            println!("📬 delivery worker {} started", consumer.consumer);
            loop {
                if let Err(e) = consumer.run_iteration().await {
                    eprintln!("⚠️ delivery worker: {e}");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        });
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(RECONCILE_INTERVAL_SECS)).await;
                if let Err(e) = self.reconcile().await {
                    eprintln!("⚠️ delivery reconciliation: {e}");
                }
            }
        });
    }

    /// One consumer pass: claim new entries, deliver, then sweep the
    /// pending list for stalled claims.
    pub async fn run_iteration(&self) -> Result<usize, ApiError> {
        let mut handled = 0;

        let fresh = self
            .bus
            .read_delivery_jobs(&self.consumer, READ_COUNT, READ_BLOCK_MS)
            .await?;
        for entry in fresh {
            self.process_entry(&entry).await;
            handled += 1;
        }

        handled += self.sweep_pending(PENDING_IDLE_MS).await?;
        Ok(handled)
    }

    /// Re-claims entries another consumer left hanging. Entries past the
    /// attempt cap are acknowledged away and logged as dead letters.
    async fn sweep_pending(&self, min_idle_ms: u64) -> Result<usize, ApiError> {
        let mut handled = 0;
        let stale = self.bus.claim_stale_jobs(&self.consumer, min_idle_ms).await?;
        for entry in stale {
            if entry.attempts > MAX_ATTEMPTS {
                eprintln!(
                    "💀 delivery job for message {} dead-lettered after {} attempts",
                    entry.job.message_id, entry.attempts
                );
                self.bus.ack_delivery(&entry.id).await?;
                continue;
            }
            self.process_entry(&entry).await;
            handled += 1;
        }
        Ok(handled)
    }

    /// Delivers one job to every recipient still in `sent`, then
    /// acknowledges. Individual recipient failures leave the entry
    /// unacknowledged so the pending sweep retries it; recipients already
    /// `delivered` are skipped on retry.
    async fn process_entry(&self, entry: &StreamEntry) {
        match self.deliver_job(&entry.job).await {
            Ok(()) => {
                if let Err(e) = self.bus.ack_delivery(&entry.id).await {
                    eprintln!("⚠️ ack failed for {}: {e}", entry.id);
                }
            }
            Err(e) => {
                eprintln!(
                    "⚠️ delivery of message {} failed (attempt {}): {e}",
                    entry.job.message_id, entry.attempts
                );
            }
        }
    }

    async fn deliver_job(&self, job: &DeliveryJob) -> Result<(), ApiError> {
        let pending = self.db.pending_recipients(&job.message_id)?;
        if pending.is_empty() {
            return Ok(());
        }
        let message = match self.db.find_message_by_id(&job.message_id)? {
            Some(m) if !m.deleted => m,
            // Deleted or vanished: nothing to push, terminal skip.
            _ => return Ok(()),
        };

        for recipient in pending {
            if !self.presence.is_online(&recipient).await {
                // Stays `sent`; the offline path delivers on reconnect.
                continue;
            }
            self.bus
                .publish(
                    &user_topic(&recipient),
                    &ServerEvent::NewMessage { message: message.clone() },
                )
                .await?;
            if self.db.mark_delivered_if_sent(&job.message_id, &recipient)? {
                self.notify_delivered(&message.sender_id, &job.message_id, &job.chat_id, &recipient)
                    .await;
            }
        }
        Ok(())
    }

    /// Offline path: on reconnect, replay undelivered messages in
    /// `(created_at, id)` order before flipping their rows.
    pub async fn replay_for_user(&self, user_id: &str) -> Result<usize, ApiError> {
        let messages = self.db.undelivered_for_user(user_id, REPLAY_LIMIT)?;
        let mut replayed = 0;
        for message in messages {
            self.bus
                .publish(
                    &user_topic(user_id),
                    &ServerEvent::NewMessage { message: message.clone() },
                )
                .await?;
            if self.db.mark_delivered_if_sent(&message.id, user_id)? {
                self.notify_delivered(&message.sender_id, &message.id, &message.chat_id, user_id)
                    .await;
                replayed += 1;
            }
        }
        Ok(replayed)
    }

    async fn notify_delivered(
        &self,
        sender_id: &Option<String>,
        message_id: &str,
        chat_id: &str,
        recipient: &str,
    ) {
        if let Some(sender) = sender_id {
            let event = ServerEvent::MessageDelivered {
                message_id: message_id.to_string(),
                chat_id: chat_id.to_string(),
                delivered_to: recipient.to_string(),
            };
            if let Err(e) = self.bus.publish(&user_topic(sender), &event).await {
                eprintln!("⚠️ delivered notification failed for {message_id}: {e}");
            }
        }
    }

    /// Re-enqueues jobs for rows stuck in `sent` past the grace window
    /// (bounded to 24h by the store query). Duplicate jobs are harmless,
    /// delivery rows make processing idempotent, but each message is
    /// suppressed for a while so offline recipients don't churn the stream.
    pub async fn reconcile(&self) -> Result<usize, ApiError> {
        let stale = self.db.stale_sent_messages(RECONCILE_GRACE_SECS, 100)?;
        let mut enqueued = 0;
        for (message_id, chat_id, recipients) in stale {
            if !self.should_reconcile(&message_id) {
                continue;
            }
            let job = DeliveryJob {
                message_id: message_id.clone(),
                chat_id,
                recipients,
                attempts: 0,
                created_at: now_ts(),
            };
            self.bus.enqueue_delivery(&job).await?;
            enqueued += 1;
        }
        if enqueued > 0 {
            println!("🧹 reconciliation re-enqueued {enqueued} delivery jobs");
        }
        Ok(enqueued)
    }

    fn should_reconcile(&self, message_id: &str) -> bool {
        let mut seen = self.reconciled.lock().unwrap_or_else(|e| e.into_inner());
        let suppress = Duration::from_secs(RECONCILE_SUPPRESS_SECS);
        let now = Instant::now();
        seen.retain(|_, at| now.duration_since(*at) < suppress);
        match seen.get(message_id) {
            Some(_) => false,
            None => {
                seen.insert(message_id.to_string(), now);
                true
            }
        }
    }
}
