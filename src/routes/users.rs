use rocket::serde::json::Json;
use rocket::{get, put, State};

use super::Authed;
use crate::db::Db;
use crate::error::ApiError;
use crate::models::*;
use crate::presence::PresenceTracker;

#[get("/users/me")]
pub fn get_me(db: &State<Db>, authed: Authed) -> Result<Json<User>, ApiError> {
    db.find_user_by_id(&authed.caller.user_id)?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound("user not found".to_string()))
}

#[put("/users/me", format = "json", data = "<body>")]
pub async fn update_me(
    db: &State<Db>,
    presence: &State<PresenceTracker>,
    authed: Authed,
    body: Json<UpdateProfileRequest>,
) -> Result<Json<User>, ApiError> {
    if let Some(name) = body.display_name.as_deref() {
        let len = name.trim().chars().count();
        if len == 0 || len > 100 {
            return Err(ApiError::InvalidInput(
                "display name must be 1-100 characters".to_string(),
            ));
        }
    }
    let user = db.update_user(
        &authed.caller.user_id,
        body.display_name.as_deref().map(str::trim),
        body.avatar_ref.as_deref(),
        body.status,
    )?;
    // Away is a published presence transition, not just a profile field.
    if body.status == Some(UserStatus::Away) {
        presence.set_away(&authed.caller.user_id).await?;
    }
    Ok(Json(user))
}

#[get("/users/search?<q>&<limit>")]
pub fn search_users(
    db: &State<Db>,
    _authed: Authed,
    q: &str,
    limit: Option<i64>,
) -> Result<Json<Vec<User>>, ApiError> {
    let prefix = q.trim();
    if prefix.is_empty() {
        return Err(ApiError::InvalidInput("query must not be empty".to_string()));
    }
    Ok(Json(db.search_users_by_handle(prefix, limit.unwrap_or(20))?))
}

/// Visible to the user themself and to anyone sharing a chat with them
/// (the contact workflow is an external collaborator).
#[get("/users/<user_id>")]
pub fn get_user(db: &State<Db>, authed: Authed, user_id: &str) -> Result<Json<User>, ApiError> {
    let user = db
        .find_user_by_id(user_id)?
        .ok_or_else(|| ApiError::NotFound("user not found".to_string()))?;
    if user_id != authed.caller.user_id && !db.shares_chat_with(&authed.caller.user_id, user_id)? {
        return Err(ApiError::Forbidden("profile not visible".to_string()));
    }
    Ok(Json(user))
}
