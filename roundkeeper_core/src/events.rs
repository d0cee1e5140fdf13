//! Session-scoped connection lifecycle events.
//!
//! Components subscribe to get a [`ListenerId`] and drain their own queue
//! from the session's update loop. Unsubscribing drops the queue, so nothing
//! is ever delivered to a component after its teardown.

use roundkeeper_env::PeerId;
use std::collections::{BTreeMap, VecDeque};

/// Identifies one connection of one peer. A reconnecting peer gets a new id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

/// Subscription handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected { peer: PeerId, connection: ConnectionId },
    Disconnected { peer: PeerId, connection: ConnectionId },
}

impl ConnectionEvent {
    pub fn peer(&self) -> PeerId {
        match self {
            ConnectionEvent::Connected { peer, .. } | ConnectionEvent::Disconnected { peer, .. } => *peer,
        }
    }

    pub fn connection(&self) -> ConnectionId {
        match self {
            ConnectionEvent::Connected { connection, .. }
            | ConnectionEvent::Disconnected { connection, .. } => *connection,
        }
    }
}

/// Fan-out queue of connection events.
#[derive(Debug, Default)]
pub struct ConnectionEvents {
    next_listener: u64,
    next_connection: u64,
    listeners: BTreeMap<ListenerId, VecDeque<ConnectionEvent>>,
}

impl ConnectionEvents {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a fresh connection id.
    pub fn next_connection_id(&mut self) -> ConnectionId {
        self.next_connection += 1;
        ConnectionId(self.next_connection)
    }

    /// Registers a listener. Only events emitted afterwards are delivered.
    pub fn subscribe(&mut self) -> ListenerId {
        let id = ListenerId(self.next_listener);
        self.next_listener += 1;
        self.listeners.insert(id, VecDeque::new());
        id
    }

    /// Removes a listener and discards its undelivered events.
    pub fn unsubscribe(&mut self, listener: ListenerId) -> bool {
        self.listeners.remove(&listener).is_some()
    }

    pub fn is_subscribed(&self, listener: ListenerId) -> bool {
        self.listeners.contains_key(&listener)
    }

    /// Delivers an event to every current listener.
    pub fn emit(&mut self, event: ConnectionEvent) {
        for queue in self.listeners.values_mut() {
            queue.push_back(event);
        }
    }

    /// Takes the pending events for one listener.
    pub fn drain(&mut self, listener: ListenerId) -> Vec<ConnectionEvent> {
        self.listeners
            .get_mut(&listener)
            .map(|q| q.drain(..).collect())
            .unwrap_or_default()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}
