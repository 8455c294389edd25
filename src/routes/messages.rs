use rocket::http::Status;
use rocket::serde::json::Json;
use rocket::{delete, get, patch, post, State};

use super::Authed;
use crate::error::ApiError;
use crate::messages::MessageService;
use crate::models::*;

#[get("/messages/<message_id>")]
pub fn get_message(
    messages: &State<MessageService>,
    authed: Authed,
    message_id: &str,
) -> Result<Json<Message>, ApiError> {
    Ok(Json(messages.get(&authed.caller, message_id)?))
}

#[patch("/messages/<message_id>", format = "json", data = "<body>")]
pub async fn edit_message(
    messages: &State<MessageService>,
    authed: Authed,
    message_id: &str,
    body: Json<EditMessageRequest>,
) -> Result<Json<Message>, ApiError> {
    Ok(Json(
        messages.edit(&authed.caller, message_id, &body.body).await?,
    ))
}

/// Soft delete; the response carries the tombstoned message.
#[delete("/messages/<message_id>")]
pub async fn delete_message(
    messages: &State<MessageService>,
    authed: Authed,
    message_id: &str,
) -> Result<Json<Message>, ApiError> {
    Ok(Json(messages.delete(&authed.caller, message_id).await?))
}

#[get("/messages/<message_id>/edits")]
pub fn get_edit_history(
    messages: &State<MessageService>,
    authed: Authed,
    message_id: &str,
) -> Result<Json<Vec<EditEntry>>, ApiError> {
    Ok(Json(messages.edit_history(&authed.caller, message_id)?))
}

#[get("/messages/<message_id>/reactions")]
pub fn get_reactions(
    messages: &State<MessageService>,
    authed: Authed,
    message_id: &str,
) -> Result<Json<Vec<Reaction>>, ApiError> {
    Ok(Json(messages.list_reactions(&authed.caller, message_id)?))
}

#[post("/messages/<message_id>/reactions", format = "json", data = "<body>")]
pub async fn add_reaction(
    messages: &State<MessageService>,
    authed: Authed,
    message_id: &str,
    body: Json<AddReactionRequest>,
) -> Result<(Status, Json<Reaction>), ApiError> {
    let reaction = messages
        .add_reaction(&authed.caller, message_id, &body.glyph)
        .await?;
    Ok((Status::Created, Json(reaction)))
}

#[delete("/messages/<message_id>/reactions/<reaction_id>")]
pub async fn remove_reaction(
    messages: &State<MessageService>,
    authed: Authed,
    message_id: &str,
    reaction_id: &str,
) -> Result<Status, ApiError> {
    messages
        .remove_reaction(&authed.caller, reaction_id, Some(message_id))
        .await?;
    Ok(Status::NoContent)
}

/// REST twin of the socket's `mark-read`.
#[post("/messages/<message_id>/read")]
pub async fn mark_message_read(
    messages: &State<MessageService>,
    authed: Authed,
    message_id: &str,
) -> Result<Status, ApiError> {
    messages.mark_read(&authed.caller, message_id).await?;
    Ok(Status::NoContent)
}
