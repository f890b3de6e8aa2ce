//! Relay wire protocol and the WebSocket ordering channel.
//!
//! Clients join a room and publish commands. The relay stamps every command
//! with a room-wide sequence number and broadcasts it, once per tick, to all
//! room members including the publisher.

use serde::{Deserialize, Serialize};

use crate::events::{Command, ParticipantId};
use crate::replica::SessionState;

/// Messages sent to the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Join a room
    Join { room: String, participant_id: ParticipantId },
    /// Leave current room
    Leave,
    /// Publish a command for ordering
    Command { command: Command },
}

/// A command with its position in the room's total order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderedCommand {
    pub seq: u64,
    pub command: Command,
}

/// Messages received from the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Confirm room join with the room's current state
    Joined {
        room: String,
        peer_count: usize,
        /// Sequence number of the last command folded into `snapshot`
        seq: u64,
        snapshot: SessionState,
    },
    PeerJoined { participant_id: ParticipantId },
    PeerLeft { participant_id: ParticipantId },
    /// Commands ordered during one tick
    Tick { commands: Vec<OrderedCommand> },
    Error { message: String },
}

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Socket open, waiting for `Joined`
    Connected,
    /// Joined a room; commands flow
    Joined,
    Error,
}

// ============================================================================
// Native WebSocket Client
// ============================================================================

#[cfg(not(target_arch = "wasm32"))]
mod native_client {
    use super::*;
    use crate::channel::{ChannelError, ChannelEvent, CommandSink, OrderingChannel};
    use std::sync::mpsc::{channel, Receiver, Sender, TryRecvError};
    use std::thread::{self, JoinHandle};
    use std::time::Duration;
    use tungstenite::{connect, Message};
    use url::Url;

    /// Commands sent to the socket thread.
    enum WsCommand {
        Send(String),
        Close,
    }

    /// What the socket thread reports.
    #[derive(Debug)]
    enum WireEvent {
        Connected,
        Message(ServerMessage),
        Disconnected,
        Failed(String),
    }

    /// Ordering channel backed by a relay connection.
    ///
    /// The socket runs on a background thread; `poll_events` drains what it
    /// received and translates relay messages into channel events.
    pub struct NativeWebSocket {
        state: ConnectionState,
        events: Vec<ChannelEvent>,
        peer_count: usize,
        cmd_tx: Option<Sender<WsCommand>>,
        event_rx: Option<Receiver<WireEvent>>,
        _thread: Option<JoinHandle<()>>,
    }

    impl NativeWebSocket {
        pub fn new() -> Self {
            Self {
                state: ConnectionState::Disconnected,
                events: Vec::new(),
                peer_count: 0,
                cmd_tx: None,
                event_rx: None,
                _thread: None,
            }
        }

        /// Connect to a relay and join `room` as `participant`.
        pub fn connect(
            &mut self,
            url: &str,
            room: &str,
            participant: &ParticipantId,
        ) -> Result<(), ChannelError> {
            if self.cmd_tx.is_some() {
                return Err(ChannelError::AlreadyConnected);
            }

            let parsed_url = Url::parse(url).map_err(|e| ChannelError::InvalidUrl(e.to_string()))?;
            if parsed_url.scheme() != "ws" && parsed_url.scheme() != "wss" {
                return Err(ChannelError::InvalidUrl(format!(
                    "unsupported scheme: {}",
                    parsed_url.scheme()
                )));
            }

            let join = serde_json::to_string(&ClientMessage::Join {
                room: room.to_string(),
                participant_id: participant.clone(),
            })?;

            self.state = ConnectionState::Connecting;

            let (cmd_tx, cmd_rx) = channel::<WsCommand>();
            let (event_tx, event_rx) = channel::<WireEvent>();
            let url = url.to_string();

            let handle = thread::spawn(move || run_socket(&url, join, &cmd_rx, &event_tx));

            self.cmd_tx = Some(cmd_tx);
            self.event_rx = Some(event_rx);
            self._thread = Some(handle);
            Ok(())
        }

        /// Leave the room and close the socket.
        pub fn disconnect(&mut self) {
            if let Some(tx) = self.cmd_tx.take() {
                if let Ok(leave) = serde_json::to_string(&ClientMessage::Leave) {
                    let _ = tx.send(WsCommand::Send(leave));
                }
                let _ = tx.send(WsCommand::Close);
            }
            self.event_rx = None;
            self._thread = None;
            if self.state == ConnectionState::Joined {
                self.events.push(ChannelEvent::Unsynced);
            }
            self.state = ConnectionState::Disconnected;
        }

        pub fn state(&self) -> ConnectionState {
            self.state
        }

        /// Room members as of the last join or peer change.
        pub fn peer_count(&self) -> usize {
            self.peer_count
        }

        fn absorb(&mut self, event: WireEvent) {
            match event {
                WireEvent::Connected => self.state = ConnectionState::Connected,
                WireEvent::Disconnected => {
                    if self.state == ConnectionState::Joined {
                        self.events.push(ChannelEvent::Unsynced);
                    }
                    self.state = ConnectionState::Disconnected;
                    self.cmd_tx = None;
                }
                WireEvent::Failed(message) => {
                    log::warn!("Relay connection failed: {}", message);
                    if self.state == ConnectionState::Joined {
                        self.events.push(ChannelEvent::Unsynced);
                    }
                    self.state = ConnectionState::Error;
                    self.cmd_tx = None;
                }
                WireEvent::Message(message) => self.absorb_message(message),
            }
        }

        fn absorb_message(&mut self, message: ServerMessage) {
            match message {
                ServerMessage::Joined { room, peer_count, seq, snapshot } => {
                    log::info!("Joined room {} at seq {} ({} peers)", room, seq, peer_count);
                    self.state = ConnectionState::Joined;
                    self.peer_count = peer_count;
                    self.events.push(ChannelEvent::Synced { seq, snapshot: Some(snapshot) });
                }
                ServerMessage::PeerJoined { participant_id } => {
                    self.peer_count += 1;
                    log::info!("Peer {} joined", participant_id);
                }
                ServerMessage::PeerLeft { participant_id } => {
                    self.peer_count = self.peer_count.saturating_sub(1);
                    log::info!("Peer {} left", participant_id);
                }
                ServerMessage::Tick { commands } => {
                    if self.state != ConnectionState::Joined {
                        log::debug!("Dropping tick received before join");
                        return;
                    }
                    self.events.extend(commands.into_iter().map(|ordered| ChannelEvent::Delivered {
                        seq: ordered.seq,
                        command: ordered.command,
                    }));
                }
                ServerMessage::Error { message } => log::warn!("Relay error: {}", message),
            }
        }
    }

    impl Default for NativeWebSocket {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Drop for NativeWebSocket {
        fn drop(&mut self) {
            self.disconnect();
        }
    }

    impl CommandSink for NativeWebSocket {
        fn publish(&mut self, command: Command) -> Result<(), ChannelError> {
            if self.state != ConnectionState::Joined {
                return Err(ChannelError::NotConnected);
            }
            let tx = self.cmd_tx.as_ref().ok_or(ChannelError::NotConnected)?;
            let msg = serde_json::to_string(&ClientMessage::Command { command })?;
            tx.send(WsCommand::Send(msg))
                .map_err(|e| ChannelError::Send(e.to_string()))
        }

        fn is_synced(&self) -> bool {
            self.state == ConnectionState::Joined
        }
    }

    impl OrderingChannel for NativeWebSocket {
        fn poll_events(&mut self) -> Vec<ChannelEvent> {
            let mut received = Vec::new();
            if let Some(ref rx) = self.event_rx {
                while let Ok(event) = rx.try_recv() {
                    received.push(event);
                }
            }
            for event in received {
                self.absorb(event);
            }
            std::mem::take(&mut self.events)
        }
    }

    fn run_socket(url: &str, join: String, cmd_rx: &Receiver<WsCommand>, event_tx: &Sender<WireEvent>) {
        log::info!("WebSocket thread: connecting to {}", url);

        let (mut socket, response) = match connect(url) {
            Ok(connected) => connected,
            Err(e) => {
                log::error!("WebSocket connection failed: {}", e);
                let _ = event_tx.send(WireEvent::Failed(e.to_string()));
                return;
            }
        };
        log::info!("WebSocket connected, status: {}", response.status());
        let _ = event_tx.send(WireEvent::Connected);

        // Short read timeout keeps the loop responsive to outgoing commands.
        if let tungstenite::stream::MaybeTlsStream::Plain(tcp) = socket.get_mut() {
            let _ = tcp.set_read_timeout(Some(Duration::from_millis(20)));
            let _ = tcp.set_write_timeout(Some(Duration::from_secs(5)));
        }

        if let Err(e) = socket.send(Message::Text(join)) {
            log::error!("WebSocket join failed: {}", e);
            let _ = event_tx.send(WireEvent::Failed(e.to_string()));
            return;
        }

        loop {
            match cmd_rx.try_recv() {
                Ok(WsCommand::Send(msg)) => {
                    if let Err(e) = socket.send(Message::Text(msg)) {
                        log::error!("WebSocket send error: {}", e);
                        break;
                    }
                }
                Ok(WsCommand::Close) => {
                    let _ = socket.close(None);
                    break;
                }
                Err(TryRecvError::Disconnected) => break,
                Err(TryRecvError::Empty) => {}
            }

            match socket.read() {
                Ok(Message::Text(txt)) => match serde_json::from_str::<ServerMessage>(&txt) {
                    Ok(message) => {
                        let _ = event_tx.send(WireEvent::Message(message));
                    }
                    Err(e) => log::warn!("Failed to parse relay message: {}", e),
                },
                Ok(Message::Ping(data)) => {
                    let _ = socket.send(Message::Pong(data));
                }
                Ok(Message::Close(_)) => {
                    log::info!("WebSocket received close frame");
                    break;
                }
                Ok(_) => {}
                Err(tungstenite::Error::Io(ref e))
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) => {
                    log::error!("WebSocket read error: {}", e);
                    break;
                }
            }
        }

        log::info!("WebSocket thread exiting");
        let _ = event_tx.send(WireEvent::Disconnected);
    }

}

#[cfg(not(target_arch = "wasm32"))]
pub use native_client::NativeWebSocket;
