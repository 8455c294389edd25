use rocket::{get, State};
use rocket_ws as ws;

use crate::gateway::Gateway;

/// Bidirectional client connection. The access credential rides in the
/// handshake query string; everything after that is the gateway loop.
#[get("/socket?<token>")]
pub fn socket(
    ws: ws::WebSocket,
    token: &str,
    gateway: &State<Gateway>,
    shutdown: rocket::Shutdown,
) -> ws::Channel<'static> {
    let gateway = gateway.inner().clone();
    let token = token.to_string();
    ws.channel(move |stream| {
        Box::pin(async move { gateway.run_socket(stream, token, shutdown).await })
    })
}
