//! Simulated network transport with fault injection.
//!
//! Every endpoint pushes into one central router channel. The router
//! (owned by the world) applies partitions and latency and hands packets
//! to the recipient's inbox once they are due. Links are FIFO: a packet
//! never overtakes an earlier packet on the same `(from, to)` link.

use async_trait::async_trait;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use roundkeeper_env::{EnvError, NetworkController, NetworkTransport, PacketEnvelope, PeerId};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Simulated network interface for one endpoint.
pub struct SimNetwork {
    /// This endpoint's ID
    local_id: PeerId,

    /// Sender to central router
    tx: mpsc::UnboundedSender<NetworkMessage>,

    /// Receiver for incoming packets (behind tokio mutex for async)
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<(PeerId, PacketEnvelope)>>>,

    /// Endpoints reachable by broadcast
    known_peers: Arc<Mutex<Vec<PeerId>>>,
}

/// Internal message to the network router.
#[derive(Debug, Clone)]
pub struct NetworkMessage {
    pub from: PeerId,
    pub to: PeerId,
    pub packet: PacketEnvelope,
}

impl SimNetwork {
    /// Creates a new simulated network interface.
    pub fn new(
        local_id: PeerId,
        tx: mpsc::UnboundedSender<NetworkMessage>,
        rx: mpsc::UnboundedReceiver<(PeerId, PacketEnvelope)>,
    ) -> Self {
        Self {
            local_id,
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
            known_peers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Creates a stub network for testing (doesn't actually send/receive).
    pub fn new_stub(local_id: PeerId) -> Self {
        let (tx, _) = mpsc::unbounded_channel();
        let (_, rx) = mpsc::unbounded_channel();
        Self::new(local_id, tx, rx)
    }

    /// Makes `peer` a broadcast target.
    pub fn add_known_peer(&self, peer: PeerId) {
        let mut peers = self.known_peers.lock().unwrap();
        if peer != self.local_id && !peers.contains(&peer) {
            peers.push(peer);
        }
    }

    pub fn remove_known_peer(&self, peer: PeerId) {
        self.known_peers.lock().unwrap().retain(|p| *p != peer);
    }

    /// Queues a packet without awaiting. The simulation loop is synchronous.
    pub fn send_now(&self, target: PeerId, packet: PacketEnvelope) -> Result<(), EnvError> {
        let msg = NetworkMessage {
            from: self.local_id,
            to: target,
            packet,
        };
        self.tx.send(msg).map_err(|_| EnvError::network("Channel closed"))
    }

    /// Takes one delivered packet, if any.
    pub fn try_recv(&self) -> Option<(PeerId, PacketEnvelope)> {
        self.rx.try_lock().ok()?.try_recv().ok()
    }

    /// Takes every delivered packet in arrival order.
    pub fn drain_inbox(&self) -> Vec<(PeerId, PacketEnvelope)> {
        let mut packets = Vec::new();
        while let Some(packet) = self.try_recv() {
            packets.push(packet);
        }
        packets
    }
}

#[async_trait]
impl NetworkTransport for SimNetwork {
    async fn send(&self, target: PeerId, packet: PacketEnvelope) -> Result<(), EnvError> {
        self.send_now(target, packet)
    }

    async fn recv(&self) -> Option<(PeerId, PacketEnvelope)> {
        let mut rx = self.rx.lock().await;
        rx.recv().await
    }

    async fn broadcast(&self, packet: PacketEnvelope) -> usize {
        let peers = self.known_peers.lock().unwrap().clone();
        peers
            .into_iter()
            .filter(|peer| self.send_now(*peer, packet.clone()).is_ok())
            .count()
    }

    fn local_id(&self) -> PeerId {
        self.local_id
    }
}

/// Network controller for fault injection.
pub struct SimNetworkController {
    /// Latency for links without an override, in milliseconds
    base_latency_ms: u64,

    /// Per-link latency in milliseconds
    link_latency: Arc<Mutex<HashMap<(PeerId, PeerId), u64>>>,

    /// Active partitions (endpoints that cannot communicate)
    partitions: Arc<Mutex<Vec<(Vec<PeerId>, Vec<PeerId>)>>>,
}

impl SimNetworkController {
    /// Creates a new network controller.
    pub fn new() -> Self {
        Self::with_base_latency(0)
    }

    pub fn with_base_latency(base_latency_ms: u64) -> Self {
        Self {
            base_latency_ms,
            link_latency: Arc::new(Mutex::new(HashMap::new())),
            partitions: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Checks if two endpoints can communicate (not partitioned).
    pub fn can_communicate(&self, from: PeerId, to: PeerId) -> bool {
        let partitions = self.partitions.lock().unwrap();

        for (group_a, group_b) in partitions.iter() {
            let from_in_a = group_a.contains(&from);
            let from_in_b = group_b.contains(&from);
            let to_in_a = group_a.contains(&to);
            let to_in_b = group_b.contains(&to);

            if (from_in_a && to_in_b) || (from_in_b && to_in_a) {
                return false;
            }
        }

        true
    }

    /// Gets the latency for a link.
    pub fn get_latency(&self, from: PeerId, to: PeerId) -> u64 {
        let latencies = self.link_latency.lock().unwrap();
        *latencies.get(&(from, to)).unwrap_or(&self.base_latency_ms)
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.lock().unwrap().len()
    }
}

impl Default for SimNetworkController {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkController for SimNetworkController {
    fn partition(&self, group_a: &[PeerId], group_b: &[PeerId]) {
        let mut partitions = self.partitions.lock().unwrap();
        partitions.push((group_a.to_vec(), group_b.to_vec()));
    }

    fn heal_all(&self) {
        self.partitions.lock().unwrap().clear();
    }

    fn set_link_latency(&self, from: PeerId, to: PeerId, latency_ms: u64) {
        let mut latencies = self.link_latency.lock().unwrap();
        latencies.insert((from, to), latency_ms);
    }
}

/// Routing counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStats {
    pub routed: u64,
    pub delivered: u64,
    pub dropped_partition: u64,
    pub dropped_unknown: u64,
}

/// Central router: holds packets in flight until their delivery time.
pub struct SimRouter {
    rx: mpsc::UnboundedReceiver<NetworkMessage>,
    tx: mpsc::UnboundedSender<NetworkMessage>,
    inboxes: HashMap<PeerId, mpsc::UnboundedSender<(PeerId, PacketEnvelope)>>,
    in_flight: BTreeMap<(Duration, u64), NetworkMessage>,

    /// Latest scheduled delivery per link
    link_tail: HashMap<(PeerId, PeerId), Duration>,
    jitter_ms: u64,
    rng: ChaCha8Rng,
    seq: u64,
    stats: RouterStats,
}

impl SimRouter {
    pub fn new(jitter_ms: u64, rng: ChaCha8Rng) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            rx,
            tx,
            inboxes: HashMap::new(),
            in_flight: BTreeMap::new(),
            link_tail: HashMap::new(),
            jitter_ms,
            rng,
            seq: 0,
            stats: RouterStats::default(),
        }
    }

    /// Creates an endpoint attached to this router.
    pub fn endpoint(&mut self, id: PeerId) -> SimNetwork {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        self.inboxes.insert(id, inbox_tx);
        SimNetwork::new(id, self.tx.clone(), inbox_rx)
    }

    /// Detaches an endpoint. Packets still in flight to it are dropped on arrival.
    pub fn detach(&mut self, id: PeerId) {
        self.inboxes.remove(&id);
    }

    /// Moves newly sent packets into flight.
    pub fn route(&mut self, now: Duration, controller: &SimNetworkController) {
        while let Ok(msg) = self.rx.try_recv() {
            self.stats.routed += 1;
            if !controller.can_communicate(msg.from, msg.to) {
                self.stats.dropped_partition += 1;
                continue;
            }

            let mut latency = controller.get_latency(msg.from, msg.to);
            if self.jitter_ms > 0 && latency > 0 {
                latency += self.rng.gen_range(0..=self.jitter_ms);
            }
            let link = (msg.from, msg.to);
            let earliest = self.link_tail.get(&link).copied().unwrap_or(Duration::ZERO);
            let deliver_at = (now + Duration::from_millis(latency)).max(earliest);
            self.link_tail.insert(link, deliver_at);

            self.in_flight.insert((deliver_at, self.seq), msg);
            self.seq += 1;
        }
    }

    /// Hands every due packet to its recipient. Returns the number delivered.
    pub fn deliver_due(&mut self, now: Duration) -> usize {
        let mut delivered = 0;
        while let Some(entry) = self.in_flight.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let msg = entry.remove();
            match self.inboxes.get(&msg.to) {
                Some(inbox) if inbox.send((msg.from, msg.packet)).is_ok() => {
                    self.stats.delivered += 1;
                    delivered += 1;
                }
                _ => self.stats.dropped_unknown += 1,
            }
        }
        delivered
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn stats(&self) -> RouterStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_network_controller_partition() {
        let controller = SimNetworkController::new();

        let a = PeerId::from_seed(1);
        let b = PeerId::from_seed(2);
        let c = PeerId::from_seed(3);

        assert!(controller.can_communicate(a, b));
        assert!(controller.can_communicate(a, c));

        // Partition: {a} vs {b, c}
        controller.partition(&[a], &[b, c]);
        assert!(!controller.can_communicate(a, b));
        assert!(!controller.can_communicate(c, a));
        assert!(controller.can_communicate(b, c));

        controller.heal_all();
        assert!(controller.can_communicate(a, b));
    }

    #[test]
    fn test_network_controller_latency() {
        let controller = SimNetworkController::with_base_latency(20);

        let a = PeerId::from_seed(1);
        let b = PeerId::from_seed(2);

        assert_eq!(controller.get_latency(a, b), 20);

        controller.set_link_latency(a, b, 100);
        assert_eq!(controller.get_latency(a, b), 100);

        // Reverse direction is separate
        assert_eq!(controller.get_latency(b, a), 20);
    }

    #[test]
    fn test_router_delivers_after_latency() {
        let controller = SimNetworkController::with_base_latency(50);
        let mut router = SimRouter::new(0, ChaCha8Rng::seed_from_u64(1));
        let a = router.endpoint(PeerId::from_seed(1));
        let b = router.endpoint(PeerId::from_seed(2));

        a.send_now(b.local_id(), PacketEnvelope::new(vec![1], 0)).unwrap();
        router.route(Duration::ZERO, &controller);

        assert_eq!(router.deliver_due(Duration::from_millis(49)), 0);
        assert!(b.try_recv().is_none());
        assert_eq!(router.deliver_due(Duration::from_millis(50)), 1);
        assert_eq!(b.try_recv().map(|(from, _)| from), Some(a.local_id()));
    }

    #[test]
    fn test_router_keeps_link_order_under_jitter() {
        let controller = SimNetworkController::with_base_latency(30);
        let mut router = SimRouter::new(40, ChaCha8Rng::seed_from_u64(9));
        let a = router.endpoint(PeerId::from_seed(1));
        let b = router.endpoint(PeerId::from_seed(2));

        for i in 0..50u8 {
            a.send_now(b.local_id(), PacketEnvelope::new(vec![i], 0)).unwrap();
            router.route(Duration::from_millis(i as u64), &controller);
        }
        router.deliver_due(Duration::from_secs(1));

        let order: Vec<u8> = b.drain_inbox().into_iter().map(|(_, p)| p.payload[0]).collect();
        assert_eq!(order, (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn test_router_drops_partitioned() {
        let controller = SimNetworkController::new();
        let mut router = SimRouter::new(0, ChaCha8Rng::seed_from_u64(1));
        let a = router.endpoint(PeerId::from_seed(1));
        let b = router.endpoint(PeerId::from_seed(2));
        controller.partition(&[a.local_id()], &[b.local_id()]);

        a.send_now(b.local_id(), PacketEnvelope::new(vec![1], 0)).unwrap();
        router.route(Duration::ZERO, &controller);
        router.deliver_due(Duration::ZERO);

        assert!(b.try_recv().is_none());
        assert_eq!(router.stats().dropped_partition, 1);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_known_peers() {
        let controller = SimNetworkController::new();
        let mut router = SimRouter::new(0, ChaCha8Rng::seed_from_u64(1));
        let server = router.endpoint(PeerId::from_seed(100));
        let a = router.endpoint(PeerId::from_seed(1));
        let b = router.endpoint(PeerId::from_seed(2));
        server.add_known_peer(a.local_id());
        server.add_known_peer(b.local_id());
        server.add_known_peer(server.local_id());

        let sent = server.broadcast(PacketEnvelope::new(vec![7], 0)).await;
        assert_eq!(sent, 2);

        router.route(Duration::ZERO, &controller);
        router.deliver_due(Duration::ZERO);
        assert_eq!(a.recv().await.map(|(_, p)| p.payload), Some(vec![7]));
        assert_eq!(b.drain_inbox().len(), 1);
    }
}
