use rocket::response::stream::{Event, EventStream};
use rocket::{get, State};
use tokio::time::{interval, Duration};

use crate::db::now_ts;
use crate::events::ServerEvent;
use crate::gateway::{ConnectionGuard, Gateway};

const HEARTBEAT_SECS: u64 = 25;

/// Long-polling fallback transport: the same server events as the socket,
/// downstream only, as SSE. Client actions go through the REST surface.
#[get("/stream?<token>")]
pub fn event_stream(
    gateway: &State<Gateway>,
    token: &str,
    mut shutdown: rocket::Shutdown,
) -> EventStream![Event + 'static] {
    let gateway = gateway.inner().clone();
    let token = token.to_string();

    EventStream! {
        match gateway.accept(&token).await {
            Err(e) => {
                yield Event::json(&serde_json::json!({
                    "error": e.to_string(),
                    "kind": e.kind(),
                }))
                .event("error");
            }
            Ok((caller, _socket_id, mut rooms)) => {
                // Dropped when the client disconnects: detaches the socket
                // and starts the offline grace.
                let _guard = ConnectionGuard {
                    registry: gateway.registry.clone(),
                    presence: gateway.presence.clone(),
                    session_id: caller.session_id.clone(),
                    user_id: caller.user_id.clone(),
                };

                // Subscribe before replaying so nothing falls between.
                let mut bus_rx = gateway.bus.subscribe();
                if let Err(e) = gateway.engine.replay_for_user(&caller.user_id).await {
                    eprintln!("⚠️ offline replay failed for {}: {e}", caller.user_id);
                }

                let mut heartbeat = interval(Duration::from_secs(HEARTBEAT_SECS));
                heartbeat.tick().await; // first tick is immediate

                loop {
                    tokio::select! {
                        envelope = bus_rx.recv() => {
                            match envelope {
                                Ok(envelope) => {
                                    gateway.adjust_rooms(&mut rooms, &caller.user_id, &envelope);
                                    if gateway.should_forward(&rooms, &caller.user_id, &envelope) {
                                        yield Event::json(&envelope.event).event(envelope.event.name());
                                    }
                                }
                                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                                _ => {} // lagged
                            }
                        }
                        _ = heartbeat.tick() => {
                            yield Event::json(&serde_json::json!({"time": now_ts()})).event("heartbeat");
                        }
                        _ = &mut shutdown => {
                            yield Event::json(&ServerEvent::ServerShutdown).event("server-shutdown");
                            break;
                        }
                    }
                }
            }
        }
    }
}
