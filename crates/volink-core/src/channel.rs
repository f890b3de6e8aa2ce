//! Ordering channel abstraction.
//!
//! The session depends on a channel that delivers every published command to
//! every participant, the publisher included, in one total order. Delivery
//! is polled: the owner drains `poll_events` once per step.

use std::cell::RefCell;
use std::rc::Rc;

use thiserror::Error;

use crate::events::{Command, ParticipantId};
use crate::replica::SessionState;

/// Channel errors.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Not connected")]
    NotConnected,
    #[error("Already connected")]
    AlreadyConnected,
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    #[error("Encoding error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("Send failed: {0}")]
    Send(String),
}

/// What a channel delivers to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// The channel is (again) in sync. Carries the authoritative state when
    /// the local replica has to be replaced, e.g. on joining late.
    Synced {
        seq: u64,
        snapshot: Option<SessionState>,
    },
    /// A command in its final order.
    Delivered { seq: u64, command: Command },
    /// The channel lost its connection; nothing is delivered until the next
    /// `Synced`.
    Unsynced,
}

/// Publishing side of the channel.
pub trait CommandSink {
    fn publish(&mut self, command: Command) -> Result<(), ChannelError>;

    /// Whether published commands will be ordered and delivered.
    fn is_synced(&self) -> bool;
}

/// A full ordering channel.
pub trait OrderingChannel: CommandSink {
    /// Drain events delivered since the last call.
    fn poll_events(&mut self) -> Vec<ChannelEvent>;
}

// ============================================================================
// In-process reflector
// ============================================================================

struct Endpoint {
    participant: ParticipantId,
    connected: bool,
    inbox: Vec<ChannelEvent>,
}

#[derive(Default)]
struct ReflectorCore {
    seq: u64,
    queue: Vec<Command>,
    endpoints: Vec<Endpoint>,
    replica: SessionState,
}

impl ReflectorCore {
    fn sync_endpoint(&mut self, slot: usize) {
        let event = ChannelEvent::Synced {
            seq: self.seq,
            snapshot: Some(self.replica.clone()),
        };
        let endpoint = &mut self.endpoints[slot];
        endpoint.connected = true;
        endpoint.inbox.push(event);
    }

    fn slot_of(&self, participant: &ParticipantId) -> Option<usize> {
        self.endpoints.iter().position(|e| &e.participant == participant)
    }
}

/// An in-process sequencer.
///
/// Commands published by any endpoint are queued; each `tick` orders the
/// queue and delivers it to every connected endpoint. The reflector keeps
/// its own replica so that endpoints joining or reconnecting receive the
/// current state.
#[derive(Clone, Default)]
pub struct LocalReflector {
    core: Rc<RefCell<ReflectorCore>>,
}

impl LocalReflector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a participant. The first event on the returned channel is
    /// `Synced` with the current state.
    pub fn connect(&self, participant: ParticipantId) -> LocalChannel {
        let mut core = self.core.borrow_mut();
        let slot = match core.slot_of(&participant) {
            Some(slot) => slot,
            None => {
                core.endpoints.push(Endpoint {
                    participant,
                    connected: false,
                    inbox: Vec::new(),
                });
                core.endpoints.len() - 1
            }
        };
        core.sync_endpoint(slot);
        LocalChannel {
            core: Rc::clone(&self.core),
            slot,
        }
    }

    /// Simulate a connection loss for one participant.
    pub fn disconnect(&self, participant: &ParticipantId) {
        let mut core = self.core.borrow_mut();
        if let Some(slot) = core.slot_of(participant) {
            let endpoint = &mut core.endpoints[slot];
            if endpoint.connected {
                endpoint.connected = false;
                endpoint.inbox.push(ChannelEvent::Unsynced);
                log::info!("Participant {} disconnected", participant);
            }
        }
    }

    /// Restore a lost connection.
    pub fn reconnect(&self, participant: &ParticipantId) {
        let mut core = self.core.borrow_mut();
        if let Some(slot) = core.slot_of(participant) {
            if !core.endpoints[slot].connected {
                core.sync_endpoint(slot);
                log::info!("Participant {} reconnected", participant);
            }
        }
    }

    /// Order and deliver everything published since the last tick.
    /// Returns the number of commands delivered.
    pub fn tick(&self) -> usize {
        let mut core = self.core.borrow_mut();
        let queue = std::mem::take(&mut core.queue);
        let mut delivered = 0;

        for command in queue {
            if let Err(e) = core.replica.apply(&command) {
                log::warn!("Dropping {} command: {}", command.kind(), e);
                continue;
            }
            core.seq += 1;
            let seq = core.seq;
            for endpoint in core.endpoints.iter_mut().filter(|e| e.connected) {
                endpoint.inbox.push(ChannelEvent::Delivered {
                    seq,
                    command: command.clone(),
                });
            }
            delivered += 1;
        }

        delivered
    }

    /// Sequence number of the last delivered command.
    pub fn seq(&self) -> u64 {
        self.core.borrow().seq
    }

    /// Copy of the reflector's replica.
    pub fn replica(&self) -> SessionState {
        self.core.borrow().replica.clone()
    }
}

/// One participant's endpoint on a `LocalReflector`.
pub struct LocalChannel {
    core: Rc<RefCell<ReflectorCore>>,
    slot: usize,
}

impl CommandSink for LocalChannel {
    fn publish(&mut self, command: Command) -> Result<(), ChannelError> {
        let mut core = self.core.borrow_mut();
        if !core.endpoints[self.slot].connected {
            return Err(ChannelError::NotConnected);
        }
        core.queue.push(command);
        Ok(())
    }

    fn is_synced(&self) -> bool {
        self.core.borrow().endpoints[self.slot].connected
    }
}

impl OrderingChannel for LocalChannel {
    fn poll_events(&mut self) -> Vec<ChannelEvent> {
        std::mem::take(&mut self.core.borrow_mut().endpoints[self.slot].inbox)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::SliceSelection;

    fn select(slice: u32, origin: &str) -> Command {
        Command::SelectSlice(SliceSelection {
            slice_index: slice,
            origin_id: ParticipantId::from(origin),
        })
    }

    #[test]
    fn test_connect_starts_synced() {
        let reflector = LocalReflector::new();
        let mut channel = reflector.connect(ParticipantId::from("a"));
        assert!(channel.is_synced());
        let events = channel.poll_events();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], ChannelEvent::Synced { seq: 0, snapshot: Some(_) }));
    }

    #[test]
    fn test_delivers_to_everyone_in_order() {
        let reflector = LocalReflector::new();
        let mut a = reflector.connect(ParticipantId::from("a"));
        let mut b = reflector.connect(ParticipantId::from("b"));
        a.poll_events();
        b.poll_events();

        a.publish(select(1, "a")).unwrap();
        b.publish(select(2, "b")).unwrap();
        a.publish(select(3, "a")).unwrap();

        // Nothing is delivered before the tick.
        assert!(a.poll_events().is_empty());
        assert_eq!(reflector.tick(), 3);

        let seen_a = a.poll_events();
        let seen_b = b.poll_events();
        assert_eq!(seen_a, seen_b);
        assert_eq!(seen_a.len(), 3);
        assert!(matches!(&seen_a[2], ChannelEvent::Delivered { seq: 3, .. }));
        assert_eq!(reflector.replica().active_slice(), Some(3));
    }

    #[test]
    fn test_invalid_commands_dropped() {
        let reflector = LocalReflector::new();
        let mut a = reflector.connect(ParticipantId::from("a"));
        a.publish(Command::EndStroke { participant_id: ParticipantId::from("") }).unwrap();
        assert_eq!(reflector.tick(), 0);
        assert_eq!(reflector.seq(), 0);
    }

    #[test]
    fn test_disconnect_and_reconnect() {
        let reflector = LocalReflector::new();
        let mut a = reflector.connect(ParticipantId::from("a"));
        let mut b = reflector.connect(ParticipantId::from("b"));
        a.poll_events();
        b.poll_events();

        reflector.disconnect(&ParticipantId::from("b"));
        assert!(!b.is_synced());
        assert!(matches!(b.publish(select(9, "b")), Err(ChannelError::NotConnected)));

        a.publish(select(4, "a")).unwrap();
        reflector.tick();
        assert_eq!(b.poll_events(), vec![ChannelEvent::Unsynced]);

        reflector.reconnect(&ParticipantId::from("b"));
        match b.poll_events().as_slice() {
            [ChannelEvent::Synced { seq, snapshot: Some(state) }] => {
                assert_eq!(*seq, 1);
                assert_eq!(state.active_slice(), Some(4));
            }
            other => panic!("Unexpected events: {:?}", other),
        }
    }
}
