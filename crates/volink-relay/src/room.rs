//! Per-room sequencer.
//!
//! Each room runs as one tokio task that owns the room's replica. Joins,
//! leaves, and published commands arrive over an mpsc queue and are handled
//! one at a time, so the order in which the task drains the queue is the
//! room's total order. Commands are collected between ticks and broadcast
//! as one `Tick`, to every member including the publisher.
//!
//! A room left without members for the idle period shuts down; its handle
//! then reports `is_closed` and the registry drops it.

use std::collections::BTreeSet;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use volink_core::sync::{OrderedCommand, ServerMessage};
use volink_core::{Command, ParticipantId, SessionState};

#[derive(Debug, Error)]
pub enum RoomError {
    #[error("Room {0} is closed")]
    Closed(String),
    #[error("Participant id must not be empty")]
    EmptyParticipant,
}

/// A broadcast from the room. `skip` names the member it is not meant for.
#[derive(Debug, Clone)]
pub struct RoomEvent {
    pub skip: Option<ParticipantId>,
    pub message: ServerMessage,
}

impl RoomEvent {
    pub fn is_for(&self, participant: &ParticipantId) -> bool {
        self.skip.as_ref() != Some(participant)
    }
}

/// What a joiner receives: the state it starts from and the stream of
/// everything ordered after it.
pub struct Membership {
    pub snapshot: SessionState,
    pub seq: u64,
    pub peer_count: usize,
    pub events: broadcast::Receiver<RoomEvent>,
}

enum RoomRequest {
    Join {
        participant: ParticipantId,
        reply: oneshot::Sender<Membership>,
    },
    Leave {
        participant: ParticipantId,
    },
    Publish {
        command: Command,
    },
}

/// Cheap handle to a room task.
#[derive(Clone)]
pub struct RoomHandle {
    name: String,
    tx: mpsc::Sender<RoomRequest>,
}

impl RoomHandle {
    /// Start the sequencer task for a new, empty room.
    pub fn spawn(name: &str, tick: Duration, idle: Duration, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        let (events, _) = broadcast::channel(capacity);
        let sequencer = Sequencer {
            name: name.to_string(),
            replica: SessionState::new(),
            seq: 0,
            pending: Vec::new(),
            members: BTreeSet::new(),
            events,
        };
        tokio::spawn(sequencer.run(rx, tick, idle));
        info!("Room {} created", name);
        Self { name: name.to_string(), tx }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// True once the sequencer task has shut down.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub async fn join(&self, participant: ParticipantId) -> Result<Membership, RoomError> {
        if participant.is_empty() {
            return Err(RoomError::EmptyParticipant);
        }
        let (reply, response) = oneshot::channel();
        self.send(RoomRequest::Join { participant, reply }).await?;
        response.await.map_err(|_| self.closed())
    }

    pub async fn leave(&self, participant: ParticipantId) -> Result<(), RoomError> {
        self.send(RoomRequest::Leave { participant }).await
    }

    /// Queue a command for the next tick. Callers validate first.
    pub async fn publish(&self, command: Command) -> Result<(), RoomError> {
        self.send(RoomRequest::Publish { command }).await
    }

    async fn send(&self, request: RoomRequest) -> Result<(), RoomError> {
        self.tx.send(request).await.map_err(|_| self.closed())
    }

    fn closed(&self) -> RoomError {
        RoomError::Closed(self.name.clone())
    }
}

struct Sequencer {
    name: String,
    replica: SessionState,
    seq: u64,
    pending: Vec<Command>,
    members: BTreeSet<ParticipantId>,
    events: broadcast::Sender<RoomEvent>,
}

impl Sequencer {
    async fn run(mut self, mut rx: mpsc::Receiver<RoomRequest>, tick: Duration, idle: Duration) {
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut idle_since = Some(Instant::now());

        loop {
            tokio::select! {
                request = rx.recv() => match request {
                    Some(request) => self.handle(request),
                    None => break,
                },
                now = interval.tick() => {
                    self.flush();
                    if !self.members.is_empty() || !self.pending.is_empty() {
                        idle_since = None;
                    } else if now.duration_since(*idle_since.get_or_insert(now)) >= idle {
                        break;
                    }
                }
            }
        }
        // Requests still queued are dropped with the receiver; their senders
        // see the room as closed.
        info!("Room {} closed at seq {}", self.name, self.seq);
    }

    fn handle(&mut self, request: RoomRequest) {
        match request {
            RoomRequest::Join { participant, reply } => {
                // Subscribing here, between ticks, ties the snapshot to the
                // first tick the joiner will see.
                let events = self.events.subscribe();
                self.members.insert(participant.clone());
                let membership = Membership {
                    snapshot: self.replica.clone(),
                    seq: self.seq,
                    peer_count: self.members.len(),
                    events,
                };
                if reply.send(membership).is_err() {
                    self.members.remove(&participant);
                    return;
                }
                info!("Peer {} joined room {} at seq {}", participant, self.name, self.seq);
                self.broadcast(
                    Some(participant.clone()),
                    ServerMessage::PeerJoined { participant_id: participant },
                );
            }
            RoomRequest::Leave { participant } => {
                if self.members.remove(&participant) {
                    info!("Peer {} left room {}", participant, self.name);
                    self.broadcast(
                        Some(participant.clone()),
                        ServerMessage::PeerLeft { participant_id: participant },
                    );
                }
            }
            RoomRequest::Publish { command } => self.pending.push(command),
        }
    }

    /// Order, apply, and broadcast everything queued since the last tick.
    fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let mut commands = Vec::with_capacity(self.pending.len());
        for command in std::mem::take(&mut self.pending) {
            if let Err(e) = self.replica.apply(&command) {
                warn!("Room {} dropped {} command: {}", self.name, command.kind(), e);
                continue;
            }
            self.seq += 1;
            commands.push(OrderedCommand { seq: self.seq, command });
        }
        if commands.is_empty() {
            return;
        }
        debug!("Room {} tick: {} commands, seq {}", self.name, commands.len(), self.seq);
        self.broadcast(None, ServerMessage::Tick { commands });
    }

    fn broadcast(&self, skip: Option<ParticipantId>, message: ServerMessage) {
        // No receivers just means nobody is in the room.
        let _ = self.events.send(RoomEvent { skip, message });
    }
}
