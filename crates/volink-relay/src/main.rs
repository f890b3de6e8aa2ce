//! Volink WebSocket Relay Server
//!
//! Orders the commands of every room and broadcasts them back to all members,
//! the publisher included. Each room keeps a replica so late joiners start
//! from the current state.
//!
//! ## Protocol
//!
//! Messages are JSON with the following format:
//! ```json
//! { "type": "join", "room": "brain", "participant_id": "p1" }
//! { "type": "command", "command": { "type": "select_slice", "slice_index": 5, "origin_id": "p1" } }
//! { "type": "leave" }
//! ```

mod config;
mod room;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use dashmap::DashMap;
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info, warn};
use uuid::Uuid;
use volink_core::sync::{ClientMessage, ServerMessage};
use volink_core::ParticipantId;

use config::RelayConfig;
use room::{Membership, RoomError, RoomEvent, RoomHandle};

#[derive(Debug, Error)]
enum RelayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Shared application state
struct AppState {
    config: RelayConfig,
    /// Active rooms. A room shuts itself down once idle and empty.
    rooms: DashMap<String, RoomHandle>,
}

impl AppState {
    fn new(config: RelayConfig) -> Self {
        Self {
            config,
            rooms: DashMap::new(),
        }
    }

    fn spawn_room(&self, name: &str) -> RoomHandle {
        RoomHandle::spawn(
            name,
            self.config.tick_interval(),
            self.config.room_idle,
            self.config.channel_capacity,
        )
    }

    /// Get or create a room, replacing one that has shut down
    fn room(&self, name: &str) -> RoomHandle {
        let mut entry = self
            .rooms
            .entry(name.to_string())
            .or_insert_with(|| self.spawn_room(name));
        if entry.is_closed() {
            *entry = self.spawn_room(name);
        }
        entry.clone()
    }

    /// Join a room. A room that shuts down while the request is in flight
    /// is replaced once.
    async fn join(&self, name: &str, participant: &ParticipantId) -> Result<(RoomHandle, Membership), RoomError> {
        let handle = self.room(name);
        match handle.join(participant.clone()).await {
            Err(RoomError::Closed(_)) => {
                let handle = self.room(name);
                let membership = handle.join(participant.clone()).await?;
                Ok((handle, membership))
            }
            result => result.map(|membership| (handle, membership)),
        }
    }

    /// Drop registry entries of rooms that have shut down.
    fn prune_rooms(&self) -> usize {
        let before = self.rooms.len();
        self.rooms.retain(|_, handle| !handle.is_closed());
        before - self.rooms.len()
    }
}

#[tokio::main]
async fn main() -> Result<(), RelayError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "volink_relay=info,tower_http=info".into()),
        )
        .init();

    let config = RelayConfig::from_env();
    let addr = config.addr;
    info!("Ticking rooms at {} Hz", config.ticks_per_second);
    let state = Arc::new(AppState::new(config));
    tokio::spawn(prune_rooms(Arc::clone(&state)));

    let app = Router::new()
        .route("/", get(index))
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    info!("Volink relay listening on {}", addr);
    info!("WebSocket endpoint: ws://{}/ws", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

/// Periodically forget rooms that have shut down.
async fn prune_rooms(state: Arc<AppState>) {
    let mut interval = tokio::time::interval(state.config.room_idle.max(Duration::from_secs(1)));
    loop {
        interval.tick().await;
        let pruned = state.prune_rooms();
        if pruned > 0 {
            debug!("Pruned {} idle rooms, {} remain", pruned, state.rooms.len());
        }
    }
}

/// Index page
async fn index() -> &'static str {
    "Volink Relay Server - Connect via WebSocket at /ws"
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
    rooms: usize,
}

/// Health check
async fn health(State(state): State<Arc<AppState>>) -> Json<Health> {
    Json(Health {
        status: "ok",
        rooms: state.rooms.len(),
    })
}

/// WebSocket upgrade handler
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

type Sender = SplitSink<WebSocket, Message>;

/// Send a message to this client. Returns false once the socket is gone.
async fn send_message(sender: &mut Sender, msg: &ServerMessage) -> bool {
    match serde_json::to_string(msg) {
        Ok(json) => sender.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!("Failed to encode {:?}: {}", msg, e);
            true
        }
    }
}

async fn send_error(sender: &mut Sender, message: String) -> bool {
    send_message(sender, &ServerMessage::Error { message }).await
}

/// The room a connection has joined, and as whom.
struct Joined {
    room: RoomHandle,
    participant: ParticipantId,
    events: broadcast::Receiver<RoomEvent>,
}

impl Joined {
    async fn leave(self) {
        let name = self.room.name().to_string();
        if let Err(e) = self.room.leave(self.participant).await {
            warn!("Leaving room {}: {}", name, e);
        }
    }
}

/// Handle a WebSocket connection
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let connection_id = Uuid::new_v4();
    info!("New connection: {}", connection_id);

    let (mut sender, mut receiver) = socket.split();
    let mut joined: Option<Joined> = None;

    loop {
        tokio::select! {
            // Handle incoming messages from client
            msg = receiver.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        warn!("WebSocket error for {}: {}", connection_id, e);
                        break;
                    }
                };

                let client_msg = match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(client_msg) => client_msg,
                    Err(e) => {
                        warn!("Invalid message from {}: {}", connection_id, e);
                        if !send_error(&mut sender, format!("Invalid message: {}", e)).await {
                            break;
                        }
                        continue;
                    }
                };

                match client_msg {
                    ClientMessage::Join { room, participant_id } => {
                        if let Some(previous) = joined.take() {
                            previous.leave().await;
                        }
                        let (handle, membership) = match state.join(&room, &participant_id).await {
                            Ok(entry) => entry,
                            Err(e) => {
                                if !send_error(&mut sender, e.to_string()).await {
                                    break;
                                }
                                continue;
                            }
                        };
                        let confirmation = ServerMessage::Joined {
                            room: room.clone(),
                            peer_count: membership.peer_count,
                            seq: membership.seq,
                            snapshot: membership.snapshot,
                        };
                        joined = Some(Joined {
                            room: handle,
                            participant: participant_id.clone(),
                            events: membership.events,
                        });
                        if !send_message(&mut sender, &confirmation).await {
                            break;
                        }
                        info!("Connection {} joined room {} as {}", connection_id, room, participant_id);
                    }
                    ClientMessage::Leave => {
                        if let Some(previous) = joined.take() {
                            previous.leave().await;
                        }
                    }
                    ClientMessage::Command { command } => {
                        let Some(current) = joined.as_ref() else {
                            if !send_error(&mut sender, "Not in a room".to_string()).await {
                                break;
                            }
                            continue;
                        };
                        if let Err(e) = command.validate() {
                            debug!("Rejected {} from {}: {}", command.kind(), current.participant, e);
                            if !send_error(&mut sender, format!("Rejected {}: {}", command.kind(), e)).await {
                                break;
                            }
                            continue;
                        }
                        if let Err(e) = current.room.publish(command).await {
                            warn!("Publish to room {} failed: {}", current.room.name(), e);
                            break;
                        }
                    }
                }
            }

            // Handle broadcast events from the room
            event = async {
                match joined.as_mut() {
                    Some(current) => current.events.recv().await,
                    None => std::future::pending().await,
                }
            } => {
                match event {
                    Ok(event) => {
                        let for_me = joined.as_ref().is_some_and(|j| event.is_for(&j.participant));
                        if for_me && !send_message(&mut sender, &event.message).await {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        // A gap in the order cannot be repaired in place; the
                        // client resyncs from a snapshot when it rejoins.
                        warn!("Connection {} lagged by {} events, closing", connection_id, missed);
                        break;
                    }
                    Err(RecvError::Closed) => {
                        warn!("Room closed under connection {}", connection_id);
                        break;
                    }
                }
            }
        }
    }

    // Cleanup on disconnect
    if let Some(current) = joined.take() {
        current.leave().await;
    }
    info!("Connection closed: {}", connection_id);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(room_idle: Duration) -> AppState {
        AppState::new(RelayConfig {
            ticks_per_second: 100,
            room_idle,
            ..RelayConfig::default()
        })
    }

    #[tokio::test]
    async fn test_same_name_shares_room() {
        let state = state(Duration::from_secs(60));
        let (_, first) = state.join("brain", &ParticipantId::from("a")).await.unwrap();
        let (_, second) = state.join("brain", &ParticipantId::from("b")).await.unwrap();
        assert_eq!(first.peer_count, 1);
        assert_eq!(second.peer_count, 2);
        assert_eq!(state.rooms.len(), 1);
    }

    #[tokio::test]
    async fn test_idle_room_pruned_and_replaced() {
        let state = state(Duration::from_millis(30));
        let (room, _) = state.join("brain", &ParticipantId::from("a")).await.unwrap();
        room.leave(ParticipantId::from("a")).await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while !room.is_closed() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("room did not shut down");

        // A later join gets a fresh room under the same name.
        let (fresh, membership) = state.join("brain", &ParticipantId::from("b")).await.unwrap();
        assert!(!fresh.is_closed());
        assert_eq!(membership.peer_count, 1);

        fresh.leave(ParticipantId::from("b")).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while !fresh.is_closed() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("room did not shut down");
        assert_eq!(state.prune_rooms(), 1);
        assert!(state.rooms.is_empty());
    }
}
