//! Replication primitives - host-writable, everyone-readable state.
//!
//! The host owns the only writable copy of every replicated value. Peers
//! receive the changes as [`ReplicationEvent`]s and keep read-only mirrors
//! (see `PeerView`). Writes bump a version so the host can tell what has not
//! been mirrored yet.

use serde::{Deserialize, Serialize};

use crate::catalog::TemplateIndex;
use crate::entity::{EntityId, Vitals};
use crate::geometry::Pose;

/// A named scalar mirrored from host to peers.
#[derive(Debug, Clone)]
pub struct ReplicatedValue<T> {
    name: &'static str,
    value: Option<T>,
    version: u64,
}

impl<T: Clone> ReplicatedValue<T> {
    /// Creates an unset value.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            value: None,
            version: 0,
        }
    }

    /// Replaces the value and bumps the version.
    pub fn set(&mut self, value: T) {
        self.value = Some(value);
        self.version += 1;
    }

    /// Current value, `None` until the first write.
    pub fn get(&self) -> Option<&T> {
        self.value.as_ref()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// A named, append-only ordered list mirrored from host to peers.
///
/// Readers keep a cursor and call [`ReplicatedList::since`] to pick up
/// everything appended after it.
#[derive(Debug, Clone)]
pub struct ReplicatedList<T> {
    name: &'static str,
    items: Vec<T>,
}

impl<T> ReplicatedList<T> {
    /// Creates an empty list.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            items: Vec::new(),
        }
    }

    /// Appends an item and returns its position.
    pub fn push(&mut self, item: T) -> usize {
        self.items.push(item);
        self.items.len() - 1
    }

    /// Items appended at or after `cursor`.
    pub fn since(&self, cursor: usize) -> &[T] {
        self.items.get(cursor..).unwrap_or(&[])
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// The replicated countdown: enough for any peer to derive the remaining time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CountdownState {
    /// Session-clock seconds at which the countdown started
    pub start_secs: f64,

    /// Whether the countdown is running
    pub active: bool,
}

/// One entry of the ordered replication log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReplicationEvent {
    /// A replicated entity came into existence.
    Spawned {
        entity: EntityId,
        template: TemplateIndex,
        pose: Pose,
        scene: String,
    },

    /// `entity` now follows `parent` at a fixed local offset.
    Attached {
        entity: EntityId,
        parent: EntityId,
        offset: Pose,
    },

    /// The entity no longer exists.
    Despawned { entity: EntityId },

    /// Vital resource changed (elimination or revival).
    Vitals { entity: EntityId, vitals: Vitals },

    /// The round countdown changed.
    Countdown(CountdownState),
}

impl ReplicationEvent {
    /// The entity this event refers to, if any.
    pub fn entity(&self) -> Option<EntityId> {
        match self {
            ReplicationEvent::Spawned { entity, .. }
            | ReplicationEvent::Attached { entity, .. }
            | ReplicationEvent::Despawned { entity }
            | ReplicationEvent::Vitals { entity, .. } => Some(*entity),
            ReplicationEvent::Countdown(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_unset_until_written() {
        let mut value: ReplicatedValue<CountdownState> = ReplicatedValue::new("countdown");
        assert!(value.get().is_none());
        assert_eq!(value.version(), 0);

        value.set(CountdownState { start_secs: 2.0, active: true });
        assert_eq!(value.get().map(|c| c.start_secs), Some(2.0));
        assert_eq!(value.version(), 1);
    }

    #[test]
    fn test_list_since_cursor() {
        let mut list = ReplicatedList::new("log");
        list.push(1);
        list.push(2);
        let cursor = list.len();
        list.push(3);

        assert_eq!(list.since(cursor), &[3]);
        assert_eq!(list.since(0), &[1, 2, 3]);
        assert!(list.since(10).is_empty());
    }
}
