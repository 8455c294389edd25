use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

use crate::bus::{CacheBus, DeliveryJob};
use crate::db::{now_ts, Db};
use crate::error::ApiError;
use crate::events::{chat_topic, user_topic, ServerEvent};
use crate::models::*;
use crate::sanitize::sanitize_body;

/// Business rules for messages, read receipts, reactions and search.
/// Persists through the store, fans out through the bus; every call takes an
/// explicit caller.
#[derive(Clone)]
pub struct MessageService {
    db: Db,
    bus: CacheBus,
    sends_per_sec: usize,
}

impl MessageService {
    pub fn new(db: Db, bus: CacheBus, sends_per_sec: usize) -> Self {
        MessageService { db, bus, sends_per_sec }
    }

    /// Validate, sanitize, persist, enqueue the fan-out job, broadcast.
    /// The enqueue is deliberately outside the persistence transaction;
    /// duplicates are idempotent and losses are swept up by reconciliation.
    pub async fn send(
        &self,
        caller: &Caller,
        chat_id: &str,
        request: SendMessageRequest,
    ) -> Result<Message, ApiError> {
        if !self.db.is_active_participant(chat_id, &caller.user_id)? {
            return Err(ApiError::Forbidden("not a participant".to_string()));
        }

        let rate = self
            .bus
            .rate_check(&format!("send:{}", caller.user_id), self.sends_per_sec, 1)
            .await?;
        if !rate.allowed {
            return Err(ApiError::RateLimited {
                retry_after_secs: rate.retry_after_secs,
            });
        }

        let body = request.body.trim();
        if body.is_empty() {
            return Err(ApiError::InvalidInput("body must not be empty".to_string()));
        }
        if body.chars().count() > MAX_BODY_CHARS {
            return Err(ApiError::TooLarge(format!(
                "body exceeds {MAX_BODY_CHARS} characters"
            )));
        }

        let kind = request.kind.unwrap_or(MessageKind::Text);
        if kind == MessageKind::System {
            return Err(ApiError::InvalidInput(
                "system messages are server-generated".to_string(),
            ));
        }

        let metadata = request.metadata.unwrap_or_else(|| serde_json::json!({}));
        let attachments = if kind == MessageKind::Image {
            parse_image_descriptors(&metadata)?
        } else {
            Vec::new()
        };

        if let Some(reply_to) = request.reply_to_id.as_deref() {
            let target = self
                .db
                .find_message_by_id(reply_to)?
                .filter(|m| m.chat_id == chat_id);
            if target.is_none() {
                return Err(ApiError::InvalidInput(
                    "reply_to_id does not reference a message in this chat".to_string(),
                ));
            }
        }

        let body = sanitize_body(body);
        let recipients: Vec<String> = self
            .db
            .list_active_participant_ids(chat_id)?
            .into_iter()
            .filter(|id| id != &caller.user_id)
            .collect();

        let message = self.db.persist_message(
            chat_id,
            Some(&caller.user_id),
            &body,
            kind,
            metadata,
            request.reply_to_id.as_deref(),
            &recipients,
            &attachments,
        )?;

        self.fan_out(&message, recipients).await;
        Ok(message)
    }

    /// Server-generated system message ("created the group", ...). Skips
    /// rate limiting and sanitization; the body is server-authored.
    pub async fn send_system(
        &self,
        actor_id: &str,
        chat_id: &str,
        body: &str,
    ) -> Result<Message, ApiError> {
        let recipients: Vec<String> = self
            .db
            .list_active_participant_ids(chat_id)?
            .into_iter()
            .filter(|id| id != actor_id)
            .collect();
        let message = self.db.persist_message(
            chat_id,
            Some(actor_id),
            body,
            MessageKind::System,
            serde_json::json!({}),
            None,
            &recipients,
            &[],
        )?;
        self.fan_out(&message, recipients).await;
        Ok(message)
    }

    async fn fan_out(&self, message: &Message, recipients: Vec<String>) {
        let job = DeliveryJob {
            message_id: message.id.clone(),
            chat_id: message.chat_id.clone(),
            recipients,
            attempts: 0,
            created_at: now_ts(),
        };
        if let Err(e) = self.bus.enqueue_delivery(&job).await {
            // The message is persisted; the reconciliation sweep recovers.
            eprintln!("⚠️ delivery enqueue failed for {}: {e}", message.id);
        }
        let event = ServerEvent::NewMessage { message: message.clone() };
        if let Err(e) = self.bus.publish(&chat_topic(&message.chat_id), &event).await {
            eprintln!("⚠️ chat broadcast failed for {}: {e}", message.id);
        }
    }

    pub async fn edit(
        &self,
        caller: &Caller,
        message_id: &str,
        new_body: &str,
    ) -> Result<Message, ApiError> {
        let message = self.require_message(message_id)?;
        if message.sender_id.as_deref() != Some(caller.user_id.as_str()) {
            return Err(ApiError::Forbidden(
                "only the sender can edit this message".to_string(),
            ));
        }
        let body = new_body.trim();
        if body.is_empty() {
            return Err(ApiError::InvalidInput("body must not be empty".to_string()));
        }
        if body.chars().count() > MAX_BODY_CHARS {
            return Err(ApiError::TooLarge(format!(
                "body exceeds {MAX_BODY_CHARS} characters"
            )));
        }
        let body = sanitize_body(body);
        let message = self.db.edit_message(message_id, &body)?;
        let event = ServerEvent::MessageEdited { message: message.clone() };
        if let Err(e) = self.bus.publish(&chat_topic(&message.chat_id), &event).await {
            eprintln!("⚠️ edit broadcast failed for {message_id}: {e}");
        }
        Ok(message)
    }

    pub async fn delete(&self, caller: &Caller, message_id: &str) -> Result<Message, ApiError> {
        let message = self.require_message(message_id)?;
        if message.sender_id.as_deref() != Some(caller.user_id.as_str()) {
            return Err(ApiError::Forbidden(
                "only the sender can delete this message".to_string(),
            ));
        }
        let message = self.db.soft_delete_message(message_id)?;
        let event = ServerEvent::MessageDeleted {
            message_id: message.id.clone(),
            chat_id: message.chat_id.clone(),
        };
        if let Err(e) = self.bus.publish(&chat_topic(&message.chat_id), &event).await {
            eprintln!("⚠️ delete broadcast failed for {message_id}: {e}");
        }
        Ok(message)
    }

    /// Visible to active participants, the sender, and past recipients
    /// (messages received before leaving remain readable).
    pub fn get(&self, caller: &Caller, message_id: &str) -> Result<Message, ApiError> {
        let message = self
            .db
            .find_message_by_id(message_id)?
            .ok_or_else(|| ApiError::NotFound("message not found".to_string()))?;
        let visible = message.sender_id.as_deref() == Some(caller.user_id.as_str())
            || self.db.is_active_participant(&message.chat_id, &caller.user_id)?
            || self.db.has_delivery(message_id, &caller.user_id)?;
        if !visible {
            return Err(ApiError::Forbidden("not a participant".to_string()));
        }
        Ok(message)
    }

    pub fn list(
        &self,
        caller: &Caller,
        chat_id: &str,
        limit: i64,
        cursor: Option<&str>,
    ) -> Result<MessagePage, ApiError> {
        if !self.db.is_active_participant(chat_id, &caller.user_id)? {
            return Err(ApiError::Forbidden("not a participant".to_string()));
        }
        let decoded = cursor.map(decode_cursor).transpose()?;
        let limit = limit.clamp(1, 100);
        let messages = self.db.list_messages_by_chat(
            chat_id,
            limit,
            decoded.as_ref().map(|(ts, id)| (ts.as_str(), id.as_str())),
        )?;
        let next_cursor = if messages.len() as i64 == limit {
            messages.last().map(|m| encode_cursor(&m.created_at, &m.id))
        } else {
            None
        };
        Ok(MessagePage { messages, next_cursor })
    }

    pub fn edit_history(&self, caller: &Caller, message_id: &str) -> Result<Vec<EditEntry>, ApiError> {
        self.get(caller, message_id)?;
        self.db.list_edit_entries(message_id)
    }

    // --- Read receipts ---

    /// Monotonic single-message receipt. Emits `message-read` on the
    /// sender's user topic when the row actually transitioned.
    pub async fn mark_read(&self, caller: &Caller, message_id: &str) -> Result<(), ApiError> {
        let (changed, chat_id, sender_id) = self.db.mark_read(message_id, &caller.user_id)?;
        if changed {
            if let Some(sender) = sender_id {
                self.emit_read(&sender, message_id, &chat_id, &caller.user_id).await;
            }
        }
        Ok(())
    }

    /// Marks the whole chat read; one receipt per transitioned row.
    pub async fn mark_chat_read(&self, caller: &Caller, chat_id: &str) -> Result<usize, ApiError> {
        if !self.db.is_active_participant(chat_id, &caller.user_id)? {
            return Err(ApiError::Forbidden("not a participant".to_string()));
        }
        let affected = self.db.bulk_mark_read(chat_id, &caller.user_id, None)?;
        let count = affected.len();
        for (message_id, sender_id) in affected {
            if let Some(sender) = sender_id {
                self.emit_read(&sender, &message_id, chat_id, &caller.user_id).await;
            }
        }
        Ok(count)
    }

    async fn emit_read(&self, sender: &str, message_id: &str, chat_id: &str, read_by: &str) {
        let event = ServerEvent::MessageRead {
            message_id: message_id.to_string(),
            chat_id: chat_id.to_string(),
            read_by: read_by.to_string(),
        };
        if let Err(e) = self.bus.publish(&user_topic(sender), &event).await {
            eprintln!("⚠️ read receipt publish failed for {message_id}: {e}");
        }
    }

    // --- Reactions ---

    pub async fn add_reaction(
        &self,
        caller: &Caller,
        message_id: &str,
        glyph: &str,
    ) -> Result<Reaction, ApiError> {
        let glyph = glyph.trim();
        if glyph.is_empty() || glyph.chars().count() > MAX_GLYPH_CHARS {
            return Err(ApiError::InvalidInput(format!(
                "glyph must be 1-{MAX_GLYPH_CHARS} characters"
            )));
        }
        let message = self.require_message(message_id)?;
        if !self.db.is_active_participant(&message.chat_id, &caller.user_id)? {
            return Err(ApiError::Forbidden("not a participant".to_string()));
        }
        let reaction = self
            .db
            .add_reaction(message_id, &message.chat_id, &caller.user_id, glyph)?;
        let event = ServerEvent::ReactionAdded { reaction: reaction.clone() };
        if let Err(e) = self.bus.publish(&chat_topic(&message.chat_id), &event).await {
            eprintln!("⚠️ reaction broadcast failed for {message_id}: {e}");
        }
        Ok(reaction)
    }

    /// `expect_message` guards the REST path where the reaction id is
    /// addressed under a message; a mismatch is treated as unknown.
    pub async fn remove_reaction(
        &self,
        caller: &Caller,
        reaction_id: &str,
        expect_message: Option<&str>,
    ) -> Result<(), ApiError> {
        let reaction = self
            .db
            .find_reaction(reaction_id)?
            .filter(|r| expect_message.is_none_or(|m| m == r.message_id))
            .ok_or_else(|| ApiError::NotFound("reaction not found".to_string()))?;
        if reaction.user_id != caller.user_id {
            return Err(ApiError::Forbidden(
                "only the reacting user can remove it".to_string(),
            ));
        }
        self.db.remove_reaction(reaction_id)?;
        let event = ServerEvent::ReactionRemoved { reaction: reaction.clone() };
        if let Err(e) = self.bus.publish(&chat_topic(&reaction.chat_id), &event).await {
            eprintln!("⚠️ reaction broadcast failed for {reaction_id}: {e}");
        }
        Ok(())
    }

    pub fn list_reactions(&self, caller: &Caller, message_id: &str) -> Result<Vec<Reaction>, ApiError> {
        self.get(caller, message_id)?;
        self.db.list_reactions(message_id)
    }

    // --- Search ---

    pub fn search(
        &self,
        caller: &Caller,
        query: &str,
        chat_id: Option<&str>,
        limit: i64,
    ) -> Result<Vec<SearchHit>, ApiError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(ApiError::InvalidInput("query must not be empty".to_string()));
        }
        self.db
            .full_text_search(&caller.user_id, query, chat_id, limit.clamp(1, 100))
    }

    fn require_message(&self, message_id: &str) -> Result<Message, ApiError> {
        match self.db.find_message_by_id(message_id)? {
            Some(m) if !m.deleted => Ok(m),
            _ => Err(ApiError::NotFound("message not found".to_string())),
        }
    }
}

fn parse_image_descriptors(
    metadata: &serde_json::Value,
) -> Result<Vec<AttachmentDescriptor>, ApiError> {
    let images = metadata
        .get("images")
        .and_then(|v| v.as_array())
        .filter(|a| !a.is_empty())
        .ok_or_else(|| {
            ApiError::InvalidInput("image messages require metadata.images".to_string())
        })?;
    images
        .iter()
        .map(|v| {
            serde_json::from_value::<AttachmentDescriptor>(v.clone()).map_err(|e| {
                ApiError::InvalidInput(format!("malformed attachment descriptor: {e}"))
            })
        })
        .collect()
}

/// Pagination cursor: base64 of the `(created_at, id)` tuple of the last
/// returned message.
pub fn encode_cursor(created_at: &str, id: &str) -> String {
    URL_SAFE_NO_PAD.encode(format!("{created_at}|{id}"))
}

fn decode_cursor(cursor: &str) -> Result<(String, String), ApiError> {
    let invalid = || ApiError::InvalidInput("malformed cursor".to_string());
    let raw = URL_SAFE_NO_PAD
        .decode(cursor)
        .ok()
        .and_then(|b| String::from_utf8(b).ok())
        .ok_or_else(invalid)?;
    let (ts, id) = raw.split_once('|').ok_or_else(invalid)?;
    Ok((ts.to_string(), id.to_string()))
}
