use rocket::http::Status;
use rocket::serde::json::Json;
use rocket::{delete, get, patch, post, State};

use super::Authed;
use crate::chats::ChatService;
use crate::error::ApiError;
use crate::messages::MessageService;
use crate::models::*;

#[get("/chats")]
pub fn list_chats(
    chats: &State<ChatService>,
    authed: Authed,
) -> Result<Json<Vec<ChatSummary>>, ApiError> {
    Ok(Json(chats.list_chats(&authed.caller)?))
}

/// Idempotent: 201 on first creation, 200 with the same chat thereafter,
/// whichever side asks.
#[post("/chats/direct", format = "json", data = "<body>")]
pub async fn create_direct_chat(
    chats: &State<ChatService>,
    authed: Authed,
    body: Json<CreateDirectRequest>,
) -> Result<(Status, Json<Chat>), ApiError> {
    let (chat, created) = chats
        .create_direct(&authed.caller, body.contact_id.trim())
        .await?;
    let status = if created { Status::Created } else { Status::Ok };
    Ok((status, Json(chat)))
}

#[post("/chats/group", format = "json", data = "<body>")]
pub async fn create_group_chat(
    chats: &State<ChatService>,
    authed: Authed,
    body: Json<CreateGroupRequest>,
) -> Result<(Status, Json<Chat>), ApiError> {
    let chat = chats
        .create_group(&authed.caller, &body.name, &body.participant_ids)
        .await?;
    Ok((Status::Created, Json(chat)))
}

#[get("/chats/<chat_id>")]
pub fn get_chat(
    chats: &State<ChatService>,
    authed: Authed,
    chat_id: &str,
) -> Result<Json<Chat>, ApiError> {
    Ok(Json(chats.get_chat(&authed.caller, chat_id)?))
}

#[patch("/chats/<chat_id>", format = "json", data = "<body>")]
pub fn update_chat(
    chats: &State<ChatService>,
    authed: Authed,
    chat_id: &str,
    body: Json<UpdateChatRequest>,
) -> Result<Json<Chat>, ApiError> {
    Ok(Json(chats.update_chat(
        &authed.caller,
        chat_id,
        body.name.as_deref().map(str::trim),
        body.avatar_ref.as_deref(),
    )?))
}

#[delete("/chats/<chat_id>")]
pub async fn delete_chat(
    chats: &State<ChatService>,
    authed: Authed,
    chat_id: &str,
) -> Result<Status, ApiError> {
    chats.delete_group(&authed.caller, chat_id).await?;
    Ok(Status::NoContent)
}

#[get("/chats/<chat_id>/participants")]
pub fn list_chat_participants(
    chats: &State<ChatService>,
    authed: Authed,
    chat_id: &str,
) -> Result<Json<Vec<Participant>>, ApiError> {
    Ok(Json(chats.list_participants(&authed.caller, chat_id)?))
}

#[post("/chats/<chat_id>/participants", format = "json", data = "<body>")]
pub async fn add_chat_participants(
    chats: &State<ChatService>,
    authed: Authed,
    chat_id: &str,
    body: Json<AddParticipantsRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let added = chats
        .add_participants(&authed.caller, chat_id, &body.user_ids)
        .await?;
    Ok(Json(serde_json::json!({ "added": added })))
}

/// Removing yourself is leaving; owners/admins may remove members.
#[delete("/chats/<chat_id>/participants/<user_id>")]
pub async fn remove_chat_participant(
    chats: &State<ChatService>,
    authed: Authed,
    chat_id: &str,
    user_id: &str,
) -> Result<Status, ApiError> {
    chats
        .remove_participant(&authed.caller, chat_id, user_id)
        .await?;
    Ok(Status::NoContent)
}

#[get("/chats/<chat_id>/messages?<limit>&<cursor>")]
pub fn list_chat_messages(
    messages: &State<MessageService>,
    authed: Authed,
    chat_id: &str,
    limit: Option<i64>,
    cursor: Option<&str>,
) -> Result<Json<MessagePage>, ApiError> {
    Ok(Json(messages.list(
        &authed.caller,
        chat_id,
        limit.unwrap_or(50),
        cursor,
    )?))
}

#[post("/chats/<chat_id>/messages", format = "json", data = "<body>")]
pub async fn send_chat_message(
    messages: &State<MessageService>,
    authed: Authed,
    chat_id: &str,
    body: Json<SendMessageRequest>,
) -> Result<(Status, Json<Message>), ApiError> {
    let message = messages
        .send(&authed.caller, chat_id, body.into_inner())
        .await?;
    Ok((Status::Created, Json(message)))
}

/// REST twin of the socket's `mark-chat-read`.
#[post("/chats/<chat_id>/read")]
pub async fn mark_chat_read(
    messages: &State<MessageService>,
    authed: Authed,
    chat_id: &str,
) -> Result<Json<serde_json::Value>, ApiError> {
    let marked = messages.mark_chat_read(&authed.caller, chat_id).await?;
    Ok(Json(serde_json::json!({ "marked_read": marked })))
}

#[get("/search?<q>&<chat_id>&<limit>")]
pub fn search_messages(
    messages: &State<MessageService>,
    authed: Authed,
    q: &str,
    chat_id: Option<&str>,
    limit: Option<i64>,
) -> Result<Json<Vec<SearchHit>>, ApiError> {
    Ok(Json(messages.search(
        &authed.caller,
        q,
        chat_id,
        limit.unwrap_or(50),
    )?))
}
