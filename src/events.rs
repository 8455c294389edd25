use serde::{Deserialize, Serialize};

use crate::models::{Chat, Message, MessageKind, Reaction, UserStatus};

/// Global topic for presence transitions.
pub const STATUS_TOPIC: &str = "status:global";

pub fn chat_topic(chat_id: &str) -> String {
    format!("chat:{chat_id}")
}

pub fn user_topic(user_id: &str) -> String {
    format!("user:{user_id}")
}

/// Server→client events. The wire shape is `{"event": ..., "data": ...}`,
/// identical on the WebSocket, the SSE fallback and the cross-node bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    NewMessage {
        message: Message,
    },
    MessageEdited {
        message: Message,
    },
    MessageDeleted {
        message_id: String,
        chat_id: String,
    },
    MessageDelivered {
        message_id: String,
        chat_id: String,
        delivered_to: String,
    },
    MessageRead {
        message_id: String,
        chat_id: String,
        read_by: String,
    },
    ReactionAdded {
        reaction: Reaction,
    },
    ReactionRemoved {
        reaction: Reaction,
    },
    TypingStart {
        chat_id: String,
        user_id: String,
    },
    TypingStop {
        chat_id: String,
        user_id: String,
    },
    UserStatus {
        user_id: String,
        status: UserStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        last_seen_at: Option<String>,
    },
    ChatAdded {
        chat: Chat,
    },
    ChatRemoved {
        chat_id: String,
    },
    ParticipantAdded {
        chat_id: String,
        user_id: String,
    },
    ParticipantRemoved {
        chat_id: String,
        user_id: String,
    },
    ServerShutdown,
    /// Socket-local only; never crosses the bus.
    MessageError {
        #[serde(skip_serializing_if = "Option::is_none")]
        client_ref: Option<String>,
        kind: String,
        message: String,
    },
}

impl ServerEvent {
    /// Event name as emitted on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::NewMessage { .. } => "new-message",
            ServerEvent::MessageEdited { .. } => "message-edited",
            ServerEvent::MessageDeleted { .. } => "message-deleted",
            ServerEvent::MessageDelivered { .. } => "message-delivered",
            ServerEvent::MessageRead { .. } => "message-read",
            ServerEvent::ReactionAdded { .. } => "reaction-added",
            ServerEvent::ReactionRemoved { .. } => "reaction-removed",
            ServerEvent::TypingStart { .. } => "typing-start",
            ServerEvent::TypingStop { .. } => "typing-stop",
            ServerEvent::UserStatus { .. } => "user-status",
            ServerEvent::ChatAdded { .. } => "chat-added",
            ServerEvent::ChatRemoved { .. } => "chat-removed",
            ServerEvent::ParticipantAdded { .. } => "participant-added",
            ServerEvent::ParticipantRemoved { .. } => "participant-removed",
            ServerEvent::ServerShutdown => "server-shutdown",
            ServerEvent::MessageError { .. } => "message-error",
        }
    }
}

/// Client→server events received on the socket.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    Send {
        chat_id: String,
        body: String,
        #[serde(default)]
        kind: Option<MessageKind>,
        #[serde(default)]
        metadata: Option<serde_json::Value>,
        #[serde(default)]
        reply_to_id: Option<String>,
        #[serde(default)]
        client_ref: Option<String>,
    },
    Edit {
        message_id: String,
        body: String,
        #[serde(default)]
        client_ref: Option<String>,
    },
    Delete {
        message_id: String,
        #[serde(default)]
        client_ref: Option<String>,
    },
    ReactionAdd {
        message_id: String,
        glyph: String,
        #[serde(default)]
        client_ref: Option<String>,
    },
    ReactionRemove {
        reaction_id: String,
        #[serde(default)]
        client_ref: Option<String>,
    },
    TypingStart {
        chat_id: String,
    },
    TypingStop {
        chat_id: String,
    },
    MarkRead {
        message_id: String,
        #[serde(default)]
        client_ref: Option<String>,
    },
    MarkChatRead {
        chat_id: String,
        #[serde(default)]
        client_ref: Option<String>,
    },
    PresenceHeartbeat,
}
