use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use rocket_ws as ws;

use crate::bus::{CacheBus, Envelope};
use crate::db::{new_id, Db};
use crate::delivery::DeliveryEngine;
use crate::error::ApiError;
use crate::events::{chat_topic, user_topic, ClientEvent, ServerEvent, STATUS_TOPIC};
use crate::messages::MessageService;
use crate::models::{Caller, SendMessageRequest};
use crate::presence::PresenceTracker;
use crate::sessions::SessionRegistry;

/// Budget for the connection handshake (credential resolution, socket
/// attach, presence, room build); a stalled store or cache drops the
/// connection instead of holding it open.
const HANDSHAKE_TIMEOUT_SECS: u64 = 45;

/// Server→client ping cadence and the silence threshold after which a
/// socket is considered dead.
const KEEPALIVE_SECS: u64 = 25;
const SOCKET_TIMEOUT_SECS: u64 = 60;

/// `typing-stop` is auto-emitted after this much inactivity.
const TYPING_TTL_SECS: u64 = 10;
const TYPING_SWEEP_SECS: u64 = 2;

/// Everything a socket loop needs: authentication, room membership, client
/// event dispatch and cross-node event forwarding. One instance per node,
/// shared by the WebSocket and SSE transports.
#[derive(Clone)]
pub struct Gateway {
    pub db: Db,
    pub bus: CacheBus,
    pub registry: SessionRegistry,
    pub presence: PresenceTracker,
    pub messages: MessageService,
    pub engine: DeliveryEngine,
    pub typing: TypingTracker,
}

impl Gateway {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Db,
        bus: CacheBus,
        registry: SessionRegistry,
        presence: PresenceTracker,
        messages: MessageService,
        engine: DeliveryEngine,
        typing: TypingTracker,
    ) -> Self {
        Gateway { db, bus, registry, presence, messages, engine, typing }
    }

    /// Handshake: resolve the access credential, attach a socket id to the
    /// session, mark presence. Returns the caller and its initial rooms.
    /// Bounded at 45s; on expiry the connection is refused.
    pub async fn accept(&self, token: &str) -> Result<(Caller, String, HashSet<String>), ApiError> {
        match tokio::time::timeout(
            Duration::from_secs(HANDSHAKE_TIMEOUT_SECS),
            self.handshake(token),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ApiError::Unavailable(
                "connection handshake timed out".to_string(),
            )),
        }
    }

    async fn handshake(&self, token: &str) -> Result<(Caller, String, HashSet<String>), ApiError> {
        let (caller, session) = self.registry.resolve_access(token).await?;
        let socket_id = new_id();
        self.registry.attach_socket(&session.id, Some(&socket_id)).await?;
        self.presence.on_connect(&caller.user_id).await?;

        let mut rooms: HashSet<String> = HashSet::new();
        rooms.insert(user_topic(&caller.user_id));
        for chat_id in self.db.list_user_chat_ids(&caller.user_id)? {
            rooms.insert(chat_topic(&chat_id));
        }
        Ok((caller, socket_id, rooms))
    }

    /// Should this envelope be forwarded to the given connection?
    /// Room events need membership; status events are filtered to users the
    /// viewer shares a chat with; a user's own typing is not echoed back.
    pub fn should_forward(&self, rooms: &HashSet<String>, viewer: &str, envelope: &Envelope) -> bool {
        match &envelope.event {
            ServerEvent::MessageError { .. } => false,
            ServerEvent::UserStatus { user_id, .. } => {
                envelope.topic == STATUS_TOPIC
                    && user_id != viewer
                    && self.db.shares_chat_with(viewer, user_id).unwrap_or(false)
            }
            ServerEvent::TypingStart { user_id, .. } | ServerEvent::TypingStop { user_id, .. } => {
                user_id != viewer && rooms.contains(&envelope.topic)
            }
            _ => rooms.contains(&envelope.topic),
        }
    }

    /// Keeps the room set in step with membership changes delivered on the
    /// viewer's user topic.
    pub fn adjust_rooms(&self, rooms: &mut HashSet<String>, viewer: &str, envelope: &Envelope) {
        if envelope.topic != user_topic(viewer) {
            return;
        }
        match &envelope.event {
            ServerEvent::ChatAdded { chat } => {
                rooms.insert(chat_topic(&chat.id));
            }
            ServerEvent::ChatRemoved { chat_id } => {
                rooms.remove(&chat_topic(chat_id));
            }
            _ => {}
        }
    }

    /// Dispatches one client event. Returns the error event to emit on the
    /// originating socket when the action fails.
    pub async fn dispatch(&self, caller: &Caller, event: ClientEvent) -> Option<ServerEvent> {
        let (result, client_ref) = match event {
            ClientEvent::Send { chat_id, body, kind, metadata, reply_to_id, client_ref } => {
                let request = SendMessageRequest {
                    body,
                    kind,
                    metadata,
                    reply_to_id,
                    client_ref: client_ref.clone(),
                };
                (
                    self.messages.send(caller, &chat_id, request).await.map(|_| ()),
                    client_ref,
                )
            }
            ClientEvent::Edit { message_id, body, client_ref } => (
                self.messages.edit(caller, &message_id, &body).await.map(|_| ()),
                client_ref,
            ),
            ClientEvent::Delete { message_id, client_ref } => (
                self.messages.delete(caller, &message_id).await.map(|_| ()),
                client_ref,
            ),
            ClientEvent::ReactionAdd { message_id, glyph, client_ref } => (
                self.messages
                    .add_reaction(caller, &message_id, &glyph)
                    .await
                    .map(|_| ()),
                client_ref,
            ),
            ClientEvent::ReactionRemove { reaction_id, client_ref } => (
                self.messages.remove_reaction(caller, &reaction_id, None).await,
                client_ref,
            ),
            ClientEvent::TypingStart { chat_id } => (self.typing_start(caller, &chat_id).await, None),
            ClientEvent::TypingStop { chat_id } => (self.typing_stop(caller, &chat_id).await, None),
            ClientEvent::MarkRead { message_id, client_ref } => (
                self.messages.mark_read(caller, &message_id).await,
                client_ref,
            ),
            ClientEvent::MarkChatRead { chat_id, client_ref } => (
                self.messages.mark_chat_read(caller, &chat_id).await.map(|_| ()),
                client_ref,
            ),
            ClientEvent::PresenceHeartbeat => (
                self.presence.on_heartbeat(&caller.user_id).await,
                None,
            ),
        };
        result.err().map(|e| ServerEvent::MessageError {
            client_ref,
            kind: e.kind().to_string(),
            message: e.to_string(),
        })
    }

    /// Typing indicators are never persisted; they only cross the bus.
    async fn typing_start(&self, caller: &Caller, chat_id: &str) -> Result<(), ApiError> {
        if !self.db.is_active_participant(chat_id, &caller.user_id)? {
            return Err(ApiError::Forbidden("not a participant".to_string()));
        }
        self.typing.start(chat_id, &caller.user_id);
        self.bus
            .publish(
                &chat_topic(chat_id),
                &ServerEvent::TypingStart {
                    chat_id: chat_id.to_string(),
                    user_id: caller.user_id.clone(),
                },
            )
            .await
    }

    async fn typing_stop(&self, caller: &Caller, chat_id: &str) -> Result<(), ApiError> {
        if self.typing.stop(chat_id, &caller.user_id) {
            self.bus
                .publish(
                    &chat_topic(chat_id),
                    &ServerEvent::TypingStop {
                        chat_id: chat_id.to_string(),
                        user_id: caller.user_id.clone(),
                    },
                )
                .await?;
        }
        Ok(())
    }

    /// The WebSocket connection loop: FIFO client event processing, bus
    /// forwarding, keep-alive, shutdown notice, cleanup on disconnect.
    pub async fn run_socket(
        &self,
        mut stream: ws::stream::DuplexStream,
        token: String,
        mut shutdown: rocket::Shutdown,
    ) -> ws::result::Result<()> {
        let (caller, _socket_id, mut rooms) = match self.accept(&token).await {
            Ok(accepted) => accepted,
            Err(e) => {
                let refusal = ServerEvent::MessageError {
                    client_ref: None,
                    kind: e.kind().to_string(),
                    message: e.to_string(),
                };
                let _ = stream.send(event_frame(&refusal)).await;
                let _ = stream.close(None).await;
                return Ok(());
            }
        };

        let _guard = ConnectionGuard {
            registry: self.registry.clone(),
            presence: self.presence.clone(),
            session_id: caller.session_id.clone(),
            user_id: caller.user_id.clone(),
        };

        // Subscribe before replaying so nothing falls between.
        let mut bus_rx = self.bus.subscribe();
        if let Err(e) = self.engine.replay_for_user(&caller.user_id).await {
            eprintln!("⚠️ offline replay failed for {}: {e}", caller.user_id);
        }

        let mut keepalive = tokio::time::interval(Duration::from_secs(KEEPALIVE_SECS));
        keepalive.tick().await; // first tick is immediate
        let mut last_activity = Instant::now();

        loop {
            tokio::select! {
                frame = stream.next() => {
                    match frame {
                        Some(Ok(ws::Message::Text(text))) => {
                            last_activity = Instant::now();
                            match serde_json::from_str::<ClientEvent>(&text) {
                                Ok(event) => {
                                    if let Some(error) = self.dispatch(&caller, event).await {
                                        stream.send(event_frame(&error)).await?;
                                    }
                                }
                                Err(e) => {
                                    let error = ServerEvent::MessageError {
                                        client_ref: None,
                                        kind: "invalid-input".to_string(),
                                        message: format!("unparseable event: {e}"),
                                    };
                                    stream.send(event_frame(&error)).await?;
                                }
                            }
                        }
                        Some(Ok(ws::Message::Close(_))) | None => break,
                        Some(Ok(_)) => {
                            // Ping/pong/binary count as liveness.
                            last_activity = Instant::now();
                        }
                        Some(Err(_)) => break,
                    }
                }
                envelope = bus_rx.recv() => {
                    match envelope {
                        Ok(envelope) => {
                            self.adjust_rooms(&mut rooms, &caller.user_id, &envelope);
                            if self.should_forward(&rooms, &caller.user_id, &envelope) {
                                stream.send(event_frame(&envelope.event)).await?;
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            eprintln!("⚠️ socket for {} lagged, missed {n} events", caller.user_id);
                        }
                    }
                }
                _ = keepalive.tick() => {
                    if last_activity.elapsed() > Duration::from_secs(SOCKET_TIMEOUT_SECS) {
                        break;
                    }
                    stream.send(ws::Message::Ping(Vec::new())).await?;
                }
                _ = &mut shutdown => {
                    let _ = stream.send(event_frame(&ServerEvent::ServerShutdown)).await;
                    break;
                }
            }
        }

        let _ = stream.close(None).await;
        Ok(())
    }
}

fn event_frame(event: &ServerEvent) -> ws::Message {
    ws::Message::Text(serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string()))
}

/// Detaches the socket and starts the offline grace when the connection
/// loop ends, however it ends.
pub struct ConnectionGuard {
    pub registry: SessionRegistry,
    pub presence: PresenceTracker,
    pub session_id: String,
    pub user_id: String,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let registry = self.registry.clone();
        let session_id = self.session_id.clone();
        tokio::spawn(async move {
            if let Err(e) = registry.attach_socket(&session_id, None).await {
                eprintln!("⚠️ socket detach failed for {session_id}: {e}");
            }
        });
        self.presence.on_disconnect(&self.user_id);
    }
}

// --- Typing tracker ---

/// Last `typing-start` per (chat, user); the sweeper emits `typing-stop`
/// once the entry goes quiet.
#[derive(Clone, Default)]
pub struct TypingTracker {
    inner: Arc<Mutex<HashMap<(String, String), Instant>>>,
}

impl TypingTracker {
    pub fn start(&self, chat_id: &str, user_id: &str) {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.insert((chat_id.to_string(), user_id.to_string()), Instant::now());
    }

    /// Returns whether the user was actually marked as typing.
    pub fn stop(&self, chat_id: &str, user_id: &str) -> bool {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.remove(&(chat_id.to_string(), user_id.to_string())).is_some()
    }

    /// Removes and returns entries older than the TTL.
    pub fn expired(&self, ttl: Duration) -> Vec<(String, String)> {
        let now = Instant::now();
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let lapsed: Vec<(String, String)> = map
            .iter()
            .filter(|(_, at)| now.duration_since(**at) >= ttl)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &lapsed {
            map.remove(key);
        }
        lapsed
    }
}

/// Emits `typing-stop` for entries with no `typing-start` refresh in 10s.
pub fn spawn_typing_sweeper(bus: CacheBus, typing: TypingTracker) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(TYPING_SWEEP_SECS)).await;
            for (chat_id, user_id) in typing.expired(Duration::from_secs(TYPING_TTL_SECS)) {
                let event = ServerEvent::TypingStop {
                    chat_id: chat_id.clone(),
                    user_id,
                };
                if let Err(e) = bus.publish(&chat_topic(&chat_id), &event).await {
                    eprintln!("⚠️ typing sweep publish failed: {e}");
                }
            }
        }
    });
}
