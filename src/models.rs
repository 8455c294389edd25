use serde::{Deserialize, Serialize};

/// Body substituted when a message is soft-deleted.
pub const TOMBSTONE: &str = "[deleted]";

pub const MAX_BODY_CHARS: usize = 10_000;
pub const MAX_GROUP_PARTICIPANTS: usize = 300;
pub const MAX_GLYPH_CHARS: usize = 10;

// --- Caller ---

/// Explicit caller identity passed into every service call.
#[derive(Debug, Clone)]
pub struct Caller {
    pub user_id: String,
    pub session_id: String,
}

// --- Users ---

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    Online,
    Offline,
    Away,
}

impl UserStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserStatus::Online => "online",
            UserStatus::Offline => "offline",
            UserStatus::Away => "away",
        }
    }

    pub fn parse(s: &str) -> Option<UserStatus> {
        match s {
            "online" => Some(UserStatus::Online),
            "offline" => Some(UserStatus::Offline),
            "away" => Some(UserStatus::Away),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct User {
    pub id: String,
    pub handle: String,
    pub display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_ref: Option<String>,
    pub status: UserStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// User row joined with its credential hash; never serialized to the wire.
#[derive(Debug, Clone)]
pub struct UserAuth {
    pub user: User,
    pub credential_hash: String,
}

// --- Sessions ---

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub refresh_secret: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    pub active: bool,
    pub last_activity_at: String,
    pub created_at: String,
    pub expires_at: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeviceMeta {
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub device_kind: Option<String>,
    #[serde(default)]
    pub device_label: Option<String>,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
}

// --- Chats ---

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChatKind {
    Direct,
    Group,
}

impl ChatKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatKind::Direct => "direct",
            ChatKind::Group => "group",
        }
    }

    pub fn parse(s: &str) -> Option<ChatKind> {
        match s {
            "direct" => Some(ChatKind::Direct),
            "group" => Some(ChatKind::Group),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Chat {
    pub id: String,
    pub kind: ChatKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slug: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message_at: Option<String>,
    pub deleted: bool,
}

/// Chat joined with the viewer's unread count and the latest message, as
/// returned by `list_user_chats` in a single query.
#[derive(Debug, Serialize, Clone)]
pub struct ChatSummary {
    #[serde(flatten)]
    pub chat: Chat,
    pub unread_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message: Option<Message>,
}

// --- Participants ---

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Owner,
    Admin,
    Member,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Owner => "owner",
            Role::Admin => "admin",
            Role::Member => "member",
        }
    }

    pub fn parse(s: &str) -> Option<Role> {
        match s {
            "owner" => Some(Role::Owner),
            "admin" => Some(Role::Admin),
            "member" => Some(Role::Member),
            _ => None,
        }
    }

    pub fn can_manage_participants(&self) -> bool {
        matches!(self, Role::Owner | Role::Admin)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Participant {
    pub id: String,
    pub chat_id: String,
    pub user_id: String,
    pub role: Role,
    pub joined_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub left_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_read_message_id: Option<String>,
    pub unread_count: i64,
}

// --- Messages ---

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Image,
    System,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Image => "image",
            MessageKind::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<MessageKind> {
        match s {
            "text" => Some(MessageKind::Text),
            "image" => Some(MessageKind::Image),
            "system" => Some(MessageKind::System),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Message {
    pub id: String,
    pub chat_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
    pub body: String,
    pub kind: MessageKind,
    pub metadata: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<String>,
    pub edited: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<String>,
    pub deleted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct EditEntry {
    pub id: String,
    pub message_id: String,
    pub prior_body: String,
    pub prior_metadata: serde_json::Value,
    pub edited_at: String,
}

// --- Deliveries ---

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Sent,
    Delivered,
    Read,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Read => "read",
        }
    }

    pub fn parse(s: &str) -> Option<DeliveryStatus> {
        match s {
            "sent" => Some(DeliveryStatus::Sent),
            "delivered" => Some(DeliveryStatus::Delivered),
            "read" => Some(DeliveryStatus::Read),
            _ => None,
        }
    }

    /// Ordering rank for the monotonic transition rule: sent < delivered < read.
    pub fn rank(&self) -> u8 {
        match self {
            DeliveryStatus::Sent => 0,
            DeliveryStatus::Delivered => 1,
            DeliveryStatus::Read => 2,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Delivery {
    pub id: String,
    pub message_id: String,
    pub user_id: String,
    pub status: DeliveryStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_at: Option<String>,
}

// --- Reactions ---

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Reaction {
    pub id: String,
    pub message_id: String,
    pub chat_id: String,
    pub user_id: String,
    pub glyph: String,
    pub created_at: String,
}

// --- Attachments ---

/// Blob keys and URLs are supplied by the external blob service; the core
/// records them verbatim and never touches image bytes.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Attachment {
    pub id: String,
    pub message_id: String,
    pub file_name: String,
    pub mime_type: String,
    pub byte_size: i64,
    pub original_ref: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub medium_ref: Option<String>,
    pub original_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub medium_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<i64>,
    pub created_at: String,
}

/// Attachment descriptor carried in `metadata.images[]` of an image message.
#[derive(Debug, Deserialize, Clone)]
pub struct AttachmentDescriptor {
    pub file_name: String,
    pub mime_type: String,
    pub byte_size: i64,
    pub original_ref: String,
    #[serde(default)]
    pub thumbnail_ref: Option<String>,
    #[serde(default)]
    pub medium_ref: Option<String>,
    pub original_url: String,
    #[serde(default)]
    pub thumbnail_url: Option<String>,
    #[serde(default)]
    pub medium_url: Option<String>,
    #[serde(default)]
    pub width: Option<i64>,
    #[serde(default)]
    pub height: Option<i64>,
}

// --- Search ---

#[derive(Debug, Serialize, Clone)]
pub struct SearchHit {
    pub message: Message,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_name: Option<String>,
    pub rank: f64,
}

// --- Request bodies ---

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub handle: String,
    pub password: String,
    pub password_confirm: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(flatten)]
    pub device: DeviceMeta,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub handle: String,
    pub password: String,
    #[serde(flatten)]
    pub device: DeviceMeta,
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_credential: String,
}

#[derive(Debug, Deserialize)]
pub struct LogoutRequest {
    #[serde(default)]
    pub refresh_credential: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateProfileRequest {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub avatar_ref: Option<String>,
    #[serde(default)]
    pub status: Option<UserStatus>,
}

#[derive(Debug, Deserialize)]
pub struct CreateDirectRequest {
    pub contact_id: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateGroupRequest {
    pub name: String,
    pub participant_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct AddParticipantsRequest {
    pub user_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateChatRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub avatar_ref: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub body: String,
    #[serde(default)]
    pub kind: Option<MessageKind>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub reply_to_id: Option<String>,
    /// Client-side correlation id echoed back on errors so optimistic
    /// messages can be marked failed.
    #[serde(default)]
    pub client_ref: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EditMessageRequest {
    pub body: String,
}

#[derive(Debug, Deserialize)]
pub struct AddReactionRequest {
    pub glyph: String,
}

// --- Responses ---

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub access_credential: String,
    pub refresh_credential: String,
    pub session_id: String,
    pub user: User,
}

#[derive(Debug, Serialize)]
pub struct MessagePage {
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

// --- Validation helpers ---

/// Handles are 3–50 chars, alphanumeric plus underscore.
pub fn valid_handle(handle: &str) -> bool {
    let len = handle.chars().count();
    (3..=50).contains(&len) && handle.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}
