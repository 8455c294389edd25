use crate::bus::CacheBus;
use crate::db::Db;
use crate::error::ApiError;
use crate::events::{chat_topic, user_topic, ServerEvent};
use crate::messages::MessageService;
use crate::models::*;

/// Business rules for chat creation and membership. Direct chats are
/// idempotent per user pair; groups are capped at 300 active members.
#[derive(Clone)]
pub struct ChatService {
    db: Db,
    bus: CacheBus,
    messages: MessageService,
}

impl ChatService {
    pub fn new(db: Db, bus: CacheBus, messages: MessageService) -> Self {
        ChatService { db, bus, messages }
    }

    /// Idempotent: both orderings of the pair land on the same chat. The
    /// contact workflow is an external collaborator; any registered user is
    /// reachable here.
    pub async fn create_direct(
        &self,
        caller: &Caller,
        contact_id: &str,
    ) -> Result<(Chat, bool), ApiError> {
        if contact_id == caller.user_id {
            return Err(ApiError::InvalidInput(
                "cannot open a direct chat with yourself".to_string(),
            ));
        }
        let other = self
            .db
            .find_user_by_id(contact_id)?
            .ok_or_else(|| ApiError::NotFound("user not found".to_string()))?;

        let (chat, created) = self.db.create_direct_chat(&caller.user_id, &other.id)?;
        if created {
            for user_id in [caller.user_id.as_str(), other.id.as_str()] {
                self.publish_to_user(user_id, ServerEvent::ChatAdded { chat: chat.clone() })
                    .await;
            }
        }
        Ok((chat, created))
    }

    /// Creates a group with the actor as owner, emits the "created the
    /// group" system message and notifies every member.
    pub async fn create_group(
        &self,
        caller: &Caller,
        name: &str,
        participant_ids: &[String],
    ) -> Result<Chat, ApiError> {
        let name = name.trim();
        if name.is_empty() || name.chars().count() > 100 {
            return Err(ApiError::InvalidInput(
                "group name must be 1-100 characters".to_string(),
            ));
        }
        let mut members: Vec<String> = Vec::new();
        for id in participant_ids {
            if id != &caller.user_id && !members.contains(id) {
                members.push(id.clone());
            }
        }
        if members.is_empty() || members.len() > MAX_GROUP_PARTICIPANTS - 1 {
            return Err(ApiError::InvalidInput(format!(
                "groups take 1-{} other participants",
                MAX_GROUP_PARTICIPANTS - 1
            )));
        }
        for id in &members {
            if self.db.find_user_by_id(id)?.is_none() {
                return Err(ApiError::NotFound(format!("user {id} not found")));
            }
        }

        let chat = self.db.create_group_chat(name, &caller.user_id, &members)?;
        self.messages
            .send_system(&caller.user_id, &chat.id, "created the group")
            .await?;

        self.publish_to_user(&caller.user_id, ServerEvent::ChatAdded { chat: chat.clone() })
            .await;
        for member in &members {
            self.publish_to_user(member, ServerEvent::ChatAdded { chat: chat.clone() })
                .await;
        }
        Ok(chat)
    }

    /// Owner/admin only. The cap check is transactional with the inserts.
    pub async fn add_participants(
        &self,
        caller: &Caller,
        chat_id: &str,
        user_ids: &[String],
    ) -> Result<Vec<String>, ApiError> {
        let chat = self.require_group(chat_id)?;
        let role = self
            .db
            .participant_role(chat_id, &caller.user_id)?
            .ok_or_else(|| ApiError::Forbidden("not a participant".to_string()))?;
        if !role.can_manage_participants() {
            return Err(ApiError::Forbidden(
                "only owners and admins can add participants".to_string(),
            ));
        }
        if user_ids.is_empty() {
            return Err(ApiError::InvalidInput("no users given".to_string()));
        }
        for id in user_ids {
            if self.db.find_user_by_id(id)?.is_none() {
                return Err(ApiError::NotFound(format!("user {id} not found")));
            }
        }

        let added = self
            .db
            .add_participants(chat_id, user_ids, MAX_GROUP_PARTICIPANTS)?;
        for user_id in &added {
            let handle = self.handle_of(user_id)?;
            self.messages
                .send_system(&caller.user_id, chat_id, &format!("added {handle}"))
                .await?;
            self.publish_to_chat(
                chat_id,
                ServerEvent::ParticipantAdded {
                    chat_id: chat_id.to_string(),
                    user_id: user_id.clone(),
                },
            )
            .await;
            self.publish_to_user(user_id, ServerEvent::ChatAdded { chat: chat.clone() })
                .await;
        }
        Ok(added)
    }

    /// A member leaves, or an owner/admin removes them. Owners cannot leave
    /// while they still own the group.
    pub async fn remove_participant(
        &self,
        caller: &Caller,
        chat_id: &str,
        user_id: &str,
    ) -> Result<(), ApiError> {
        self.require_group(chat_id)?;
        let target_role = self
            .db
            .participant_role(chat_id, user_id)?
            .ok_or_else(|| ApiError::NotFound("not a participant".to_string()))?;

        let leaving = caller.user_id == user_id;
        if leaving {
            if target_role == Role::Owner {
                return Err(ApiError::Forbidden(
                    "owners must delete the group or transfer ownership first".to_string(),
                ));
            }
        } else {
            let actor_role = self
                .db
                .participant_role(chat_id, &caller.user_id)?
                .ok_or_else(|| ApiError::Forbidden("not a participant".to_string()))?;
            if !actor_role.can_manage_participants() || target_role == Role::Owner {
                return Err(ApiError::Forbidden(
                    "not allowed to remove this participant".to_string(),
                ));
            }
        }

        self.db.remove_participant(chat_id, user_id)?;
        let handle = self.handle_of(user_id)?;
        let body = if leaving {
            "left the group".to_string()
        } else {
            format!("removed {handle}")
        };
        self.messages
            .send_system(&caller.user_id, chat_id, &body)
            .await?;
        self.publish_to_chat(
            chat_id,
            ServerEvent::ParticipantRemoved {
                chat_id: chat_id.to_string(),
                user_id: user_id.to_string(),
            },
        )
        .await;
        self.publish_to_user(
            user_id,
            ServerEvent::ChatRemoved { chat_id: chat_id.to_string() },
        )
        .await;
        Ok(())
    }

    /// Owner/admin rename or avatar change; groups only (direct chats have
    /// no name).
    pub fn update_chat(
        &self,
        caller: &Caller,
        chat_id: &str,
        name: Option<&str>,
        avatar_ref: Option<&str>,
    ) -> Result<Chat, ApiError> {
        self.require_group(chat_id)?;
        let role = self
            .db
            .participant_role(chat_id, &caller.user_id)?
            .ok_or_else(|| ApiError::Forbidden("not a participant".to_string()))?;
        if !role.can_manage_participants() {
            return Err(ApiError::Forbidden(
                "only owners and admins can update the chat".to_string(),
            ));
        }
        if let Some(name) = name {
            let len = name.chars().count();
            if len == 0 || len > 100 {
                return Err(ApiError::InvalidInput(
                    "group name must be 1-100 characters".to_string(),
                ));
            }
        }
        self.db.update_chat(chat_id, name, avatar_ref)
    }

    /// Owner-only soft delete of a group.
    pub async fn delete_group(&self, caller: &Caller, chat_id: &str) -> Result<(), ApiError> {
        self.require_group(chat_id)?;
        let role = self
            .db
            .participant_role(chat_id, &caller.user_id)?
            .ok_or_else(|| ApiError::Forbidden("not a participant".to_string()))?;
        if role != Role::Owner {
            return Err(ApiError::Forbidden("only the owner can delete the group".to_string()));
        }
        let members = self.db.list_active_participant_ids(chat_id)?;
        self.db.soft_delete_chat(chat_id)?;
        for user_id in members {
            self.publish_to_user(
                &user_id,
                ServerEvent::ChatRemoved { chat_id: chat_id.to_string() },
            )
            .await;
        }
        Ok(())
    }

    pub fn list_chats(&self, caller: &Caller) -> Result<Vec<ChatSummary>, ApiError> {
        self.db.list_user_chats(&caller.user_id)
    }

    pub fn get_chat(&self, caller: &Caller, chat_id: &str) -> Result<Chat, ApiError> {
        let chat = self
            .db
            .find_chat_by_id(chat_id)?
            .filter(|c| !c.deleted)
            .ok_or_else(|| ApiError::NotFound("chat not found".to_string()))?;
        if !self.db.is_active_participant(chat_id, &caller.user_id)? {
            return Err(ApiError::Forbidden("not a participant".to_string()));
        }
        Ok(chat)
    }

    pub fn list_participants(
        &self,
        caller: &Caller,
        chat_id: &str,
    ) -> Result<Vec<Participant>, ApiError> {
        self.get_chat(caller, chat_id)?;
        self.db.list_active_participants(chat_id)
    }

    fn require_group(&self, chat_id: &str) -> Result<Chat, ApiError> {
        let chat = self
            .db
            .find_chat_by_id(chat_id)?
            .filter(|c| !c.deleted)
            .ok_or_else(|| ApiError::NotFound("chat not found".to_string()))?;
        if chat.kind != ChatKind::Group {
            return Err(ApiError::InvalidInput(
                "membership of a direct chat is fixed".to_string(),
            ));
        }
        Ok(chat)
    }

    fn handle_of(&self, user_id: &str) -> Result<String, ApiError> {
        Ok(self
            .db
            .find_user_by_id(user_id)?
            .map(|u| u.handle)
            .unwrap_or_else(|| user_id.to_string()))
    }

    async fn publish_to_chat(&self, chat_id: &str, event: ServerEvent) {
        if let Err(e) = self.bus.publish(&chat_topic(chat_id), &event).await {
            eprintln!("⚠️ chat publish failed for {chat_id}: {e}");
        }
    }

    async fn publish_to_user(&self, user_id: &str, event: ServerEvent) {
        if let Err(e) = self.bus.publish(&user_topic(user_id), &event).await {
            eprintln!("⚠️ user publish failed for {user_id}: {e}");
        }
    }
}
