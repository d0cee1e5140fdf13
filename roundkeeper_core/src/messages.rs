//! Wire messages between the host and its peers.
//!
//! The host never sends directly: components push [`Outbound`] messages into
//! the session's [`Outbox`], and whatever drives the session (the simulation
//! world, or a network pump in production) drains it and hands each message
//! to a `NetworkTransport`. Recipients of a broadcast are fixed at the moment
//! it is queued, so a peer admitted later never receives traffic that
//! predates its connection.

use roundkeeper_env::{EnvError, PacketEnvelope, PeerId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::catalog::TemplateIndex;
use crate::entity::EntityId;
use crate::geometry::Pose;
use crate::replication::ReplicationEvent;

/// How a scene load treats already loaded scenes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadMode {
    /// Replace everything currently loaded
    #[default]
    Single,

    /// Load alongside what is already loaded
    Additive,
}

/// Visual cue bracketing a scene transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CueKind {
    Close,
    Open,
}

/// Host → peer directives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HostMessage {
    /// Mirror of one replication log entry
    Replication(ReplicationEvent),

    /// Destroy any placeholder marker still present locally
    RemovePlaceholders,

    /// Create a local, visual-only instance of an already spawned object
    ReplaySpawn { template: TemplateIndex, pose: Pose },

    /// Clear the eliminated state of the receiver's controlled entity
    ReviveEntity { entity: EntityId },

    /// Load a scene; answer with `PeerMessage::SceneLoaded`
    LoadScene { scene: String, mode: LoadMode },

    /// Play a transition cue
    Cue { kind: CueKind },
}

/// Peer → host requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerMessage {
    /// Ask the host to end the running countdown now
    RequestEndRoundEarly,

    /// The sender finished loading `scene`
    SceneLoaded { scene: String },
}

/// Addressing of an outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// Every peer connected when the message was queued
    All,

    /// One peer
    Peer(PeerId),
}

/// A queued host → peer message.
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub target: Target,

    /// Concrete recipients, resolved when queued
    pub recipients: Vec<PeerId>,

    pub message: HostMessage,
}

/// Host outgoing queue plus the current audience for broadcasts.
#[derive(Debug, Default)]
pub struct Outbox {
    audience: Vec<PeerId>,
    queue: Vec<Outbound>,
    total_queued: u64,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a peer to the broadcast audience.
    pub fn admit(&mut self, peer: PeerId) {
        if !self.audience.contains(&peer) {
            self.audience.push(peer);
        }
    }

    /// Removes a peer from the broadcast audience.
    pub fn dismiss(&mut self, peer: PeerId) {
        self.audience.retain(|p| *p != peer);
    }

    pub fn audience(&self) -> &[PeerId] {
        &self.audience
    }

    /// Queues a message for every currently admitted peer.
    pub fn broadcast(&mut self, message: HostMessage) {
        self.total_queued += 1;
        self.queue.push(Outbound {
            target: Target::All,
            recipients: self.audience.clone(),
            message,
        });
    }

    /// Queues a message for a single peer.
    pub fn send_to(&mut self, peer: PeerId, message: HostMessage) {
        self.total_queued += 1;
        self.queue.push(Outbound {
            target: Target::Peer(peer),
            recipients: vec![peer],
            message,
        });
    }

    /// Takes everything queued so far.
    pub fn drain(&mut self) -> Vec<Outbound> {
        std::mem::take(&mut self.queue)
    }

    /// Messages waiting to be drained.
    pub fn pending(&self) -> &[Outbound] {
        &self.queue
    }

    /// Messages queued over the outbox's lifetime.
    pub fn total_queued(&self) -> u64 {
        self.total_queued
    }
}

/// Encodes a message into a transport envelope.
pub fn encode<M: Serialize>(message: &M, timestamp_ms: u64) -> Result<PacketEnvelope, EnvError> {
    let payload = serde_json::to_vec(message).map_err(EnvError::serialization)?;
    Ok(PacketEnvelope::new(payload, timestamp_ms))
}

/// Decodes a message from a transport envelope.
pub fn decode<M: DeserializeOwned>(envelope: &PacketEnvelope) -> Result<M, EnvError> {
    serde_json::from_slice(&envelope.payload).map_err(EnvError::serialization)
}
