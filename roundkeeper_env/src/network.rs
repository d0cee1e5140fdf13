//! Network transport abstraction between the host and its peers.

use async_trait::async_trait;
use crate::error::EnvError;
use crate::types::{PeerId, PacketEnvelope};

/// Abstraction for reliable, ordered message delivery between peers.
///
/// # Implementations
///
/// - **Production**: Wraps a reliable socket / session layer
/// - **Simulation**: Channel-based with configurable latency/partitions
///
/// # Packet Flow
///
/// ```text
/// Host                       Network                    Peer B
///   |                           |                          |
///   |-- send(B, packet) ------->|                          |
///   |                           |-- [latency, FIFO] ------>|
///   |                           |                          |-- recv() -> packet
/// ```
///
/// Delivery between one sender and one receiver is FIFO: a spawn
/// notification is always observed before an attach or despawn that
/// references the same entity.
#[async_trait]
pub trait NetworkTransport: Send + Sync + 'static {
    /// Sends a packet to a target peer.
    ///
    /// # Returns
    /// * `Ok(())` - Packet queued for delivery
    /// * `Err(EnvError::NetworkError)` - Immediate send failure (e.g., channel closed)
    ///
    /// # Note
    /// Sending is fire-and-forget: success means queued, not acknowledged.
    async fn send(&self, target: PeerId, packet: PacketEnvelope) -> Result<(), EnvError>;

    /// Receives the next packet addressed to this peer.
    ///
    /// # Returns
    /// * `Some((sender, packet))` - A packet was received
    /// * `None` - The channel was closed (shutdown)
    async fn recv(&self) -> Option<(PeerId, PacketEnvelope)>;

    /// Broadcasts a packet to all connected peers.
    ///
    /// # Returns
    /// Number of peers the packet was sent to.
    async fn broadcast(&self, packet: PacketEnvelope) -> usize;

    /// Returns this peer's ID.
    fn local_id(&self) -> PeerId;
}

/// Marker trait for network controllers in simulation.
///
/// Allows injecting faults like partitions and latency.
pub trait NetworkController: Send + Sync {
    /// Creates a network partition between two peer sets.
    fn partition(&self, group_a: &[PeerId], group_b: &[PeerId]);

    /// Heals all partitions.
    fn heal_all(&self);

    /// Sets latency for a specific link.
    fn set_link_latency(&self, from: PeerId, to: PeerId, latency_ms: u64);
}
