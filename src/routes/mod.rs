// Route module decomposition: each domain area in its own file.
// Shared request guards live here; route functions in submodules.

mod auth;
mod chats;
mod messages;
mod socket;
mod stream;
mod system;
mod users;

pub use auth::{login, logout, refresh, register};
pub use chats::{
    add_chat_participants, create_direct_chat, create_group_chat, delete_chat, get_chat,
    list_chat_messages, list_chat_participants, list_chats, mark_chat_read,
    remove_chat_participant, search_messages, send_chat_message, update_chat,
};
pub use messages::{
    add_reaction, delete_message, edit_message, get_edit_history, get_message, get_reactions,
    mark_message_read, remove_reaction,
};
pub use socket::socket as socket_handler;
pub use stream::event_stream;
pub use system::{
    bad_request, conflict, forbidden, health, internal_error, not_found, payload_too_large,
    too_many_requests, unauthorized, unprocessable,
};
pub use users::{get_me, get_user, search_users, update_me};

use rocket::http::Status;
use rocket::request::{FromRequest, Outcome, Request};

use crate::models::{Caller, Session};
use crate::sessions::SessionRegistry;

// --- Access credential guard ---

/// Resolved caller for endpoints requiring a valid access credential
/// (`Authorization: Bearer <token>`).
pub struct Authed {
    pub caller: Caller,
    pub session: Session,
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for Authed {
    type Error = ();

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let token = match req
            .headers()
            .get_one("Authorization")
            .and_then(|auth| auth.strip_prefix("Bearer "))
        {
            Some(token) => token,
            None => return Outcome::Error((Status::Unauthorized, ())),
        };
        let registry = match req.rocket().state::<SessionRegistry>() {
            Some(registry) => registry,
            None => return Outcome::Error((Status::InternalServerError, ())),
        };
        match registry.resolve_access(token).await {
            Ok((caller, session)) => Outcome::Success(Authed { caller, session }),
            Err(_) => Outcome::Error((Status::Unauthorized, ())),
        }
    }
}
