//! SimWorld - The simulation harness container.
//!
//! One host session, one [`PeerView`] per simulated player, a ground-truth
//! oracle moving the players and a router carrying every packet between
//! them. A tick runs in a fixed order so a seed always produces the same
//! history:
//!
//! 1. advance the virtual clock and the oracle, push poses to the host
//! 2. deliver due packets to peers; peers apply them and answer
//! 3. deliver due packets to the host; the host handles them
//! 4. run host timers and observe new round resolutions
//! 5. send everything the host queued

use crate::context::SimContext;
use crate::network::{RouterStats, SimNetwork, SimNetworkController, SimRouter};
use crate::oracle::{Intent, PlayerOracle};

use nalgebra::{Point3, Vector3};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use roundkeeper_core::config::{CatalogEntryConfig, CompositeConfig};
use roundkeeper_core::messages::encode;
use roundkeeper_core::placement::PlacementState;
use roundkeeper_core::{
    Handoff, HostSession, PeerView, Placeholder, Pose, RoundOrchestrator, RoundSummary, SessionConfig,
    SessionError, SurvivalRegion,
};
use roundkeeper_env::{NetworkController, NetworkTransport, PeerId, SessionContext};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Endpoint id of the host process. The host's own player is peer 0.
pub const SERVER_SEED: u64 = u64::MAX;

/// Configuration for a simulation run.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Master seed for determinism
    pub seed: u64,

    /// Number of players, the host's own player included
    pub num_peers: usize,

    /// Tick rate in Hz
    pub tick_rate_hz: u32,

    /// One-way latency between the host and a remote peer (ms)
    pub latency_ms: u64,

    /// Extra random latency per packet (ms)
    pub jitter_ms: u64,

    /// Player movement speed (m/s)
    pub player_speed: f64,

    /// Install an orchestrator that transitions to the destination scene
    pub orchestrated: bool,

    /// Placeholders staged in the play scene
    pub placeholders: Vec<Placeholder>,

    /// Host session configuration
    pub session: SessionConfig,
}

impl Default for SimConfig {
    fn default() -> Self {
        let mut session = SessionConfig::default();
        session.round.region = Some(SurvivalRegion::aabb(Point3::origin(), Vector3::new(20.0, 10.0, 20.0)));
        for item in ["crate", "barrel"] {
            session.catalog.entries.push(CatalogEntryConfig {
                item_id: item.to_string(),
                anchors: vec![],
            });
        }

        Self {
            seed: 42,
            num_peers: 4,
            tick_rate_hz: 30,
            latency_ms: 40,
            jitter_ms: 10,
            player_speed: 4.0,
            orchestrated: false,
            placeholders: vec![
                Placeholder::new("crate", Pose::at(3.0, 0.0, -2.0)),
                Placeholder::new("barrel", Pose::at(-6.0, 0.0, 4.0)),
                Placeholder::new("crate", Pose::at(12.0, 0.0, 9.0)),
                Placeholder::new("unlisted_prop", Pose::at(0.0, 0.0, 15.0)),
                Placeholder::new("barrel", Pose::at(1.0, 0.0, 1.0)).inactive(),
            ],
            session,
        }
    }
}

impl SimConfig {
    /// Adds a composite structure to the session config.
    pub fn with_composite(mut self, composite: CompositeConfig) -> Self {
        self.session.composite = Some(composite);
        self
    }
}

/// Orchestrator used by orchestrated runs: always moves on to `destination`.
pub struct LobbyOrchestrator {
    destination: String,
    rounds_seen: u64,
}

impl LobbyOrchestrator {
    pub fn new(destination: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            rounds_seen: 0,
        }
    }

    pub fn rounds_seen(&self) -> u64 {
        self.rounds_seen
    }
}

impl RoundOrchestrator for LobbyOrchestrator {
    fn complete_round(&mut self, summary: &RoundSummary) -> Handoff {
        self.rounds_seen += 1;
        debug!(
            "Orchestrator: round {} done, {} eliminated",
            summary.round,
            summary.eliminated.len()
        );
        Handoff::Transition(self.destination.clone())
    }
}

/// Handle to a simulated player process.
pub struct SimPeer {
    pub id: PeerId,

    /// Network interface for this player
    pub network: SimNetwork,

    /// Everything this player has observed
    pub view: PeerView,

    pub connected: bool,
}

/// One round resolution as seen by the harness.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundObservation {
    /// 1-based resolution counter
    pub index: u64,
    pub started_at_secs: Option<f64>,
    pub resolved_at_secs: f64,
    pub ended_early: bool,

    /// Owners of the entities the host eliminated
    pub eliminated: BTreeSet<PeerId>,

    /// Owners the oracle placed outside the region at resolution
    pub expected: BTreeSet<PeerId>,

    /// Players the host could not resolve
    pub skipped: Vec<PeerId>,
    pub revived_at_secs: Option<f64>,
}

impl RoundObservation {
    pub fn matches_oracle(&self) -> bool {
        self.eliminated == self.expected
    }
}

/// Aggregate counters for a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorldStats {
    pub ticks: u64,
    pub players_connected: usize,
    pub entities: usize,
    pub host_messages: u64,
    pub packets_routed: u64,
    pub packets_delivered: u64,
    pub packets_dropped: u64,
    pub ordering_violations: u64,
    pub decode_errors: u64,
}

/// The SimWorld - container for the entire simulation.
pub struct SimWorld {
    /// Configuration
    pub config: SimConfig,

    /// Shared simulation context (virtual clock)
    pub context: Arc<SimContext>,

    /// Ground truth oracle
    pub oracle: PlayerOracle,

    /// Network controller for fault injection
    pub network_controller: SimNetworkController,

    /// The authoritative host
    pub session: HostSession<SimContext>,

    /// Player processes in join order; index 0 is the host's own player
    pub peers: Vec<SimPeer>,

    router: SimRouter,
    server: SimNetwork,
    observations: Vec<RoundObservation>,
    seen_resolutions: u64,
    seen_handoffs: usize,
    decode_errors: u64,

    /// Notable events since the last `take_events`
    events: Vec<String>,

    /// Current tick count
    tick_count: u64,
}

impl SimWorld {
    /// Creates a new SimWorld with the given configuration.
    pub fn new(config: SimConfig) -> Result<Self, SessionError> {
        // Derive separate seeds for different subsystems
        let context_seed = config.seed;
        let physics_seed = config.seed.wrapping_mul(0x9e3779b97f4a7c15);
        let network_seed = config.seed.wrapping_mul(0x517cc1b727220a95);

        let context = SimContext::shared(context_seed);
        let oracle = PlayerOracle::new(physics_seed, config.session.round.region.clone(), config.player_speed);
        let network_controller = SimNetworkController::with_base_latency(config.latency_ms);
        let mut router = SimRouter::new(config.jitter_ms, ChaCha8Rng::seed_from_u64(network_seed));

        let host = PeerId::from_seed(0);
        let server = router.endpoint(PeerId::from_seed(SERVER_SEED));

        // Host and its own player share a process.
        network_controller.set_link_latency(server.local_id(), host, 0);
        network_controller.set_link_latency(host, server.local_id(), 0);

        let mut session = HostSession::from_config(context.clone(), config.session.clone(), host)?;
        if config.orchestrated {
            session = session.with_orchestrator(Box::new(LobbyOrchestrator::new(
                config.session.round.destination_scene.clone(),
            )));
        }
        for placeholder in &config.placeholders {
            session.stage_placeholder(placeholder.clone());
        }

        Ok(Self {
            config,
            context,
            oracle,
            network_controller,
            session,
            peers: Vec::new(),
            router,
            server,
            observations: Vec::new(),
            seen_resolutions: 0,
            seen_handoffs: 0,
            decode_errors: 0,
            events: Vec::new(),
            tick_count: 0,
        })
    }

    /// Connects the configured players and issues the play-scene load.
    pub fn start(&mut self) -> Result<(), SessionError> {
        for _ in 0..self.config.num_peers.max(1) {
            self.add_peer()?;
        }
        self.session.start()?;
        info!(
            "Simulation started (seed {}, {} players, {}ms latency)",
            self.config.seed,
            self.peers.len(),
            self.config.latency_ms
        );
        Ok(())
    }

    /// Connects one more player with a random intent.
    pub fn add_peer(&mut self) -> Result<PeerId, SessionError> {
        let id = PeerId::from_seed(self.peers.len() as u64);
        let pose = self.oracle.spawn_random(id);
        self.connect(id, pose)
    }

    /// Connects one more player with the given intent.
    pub fn add_peer_with_intent(&mut self, intent: Intent) -> Result<PeerId, SessionError> {
        let id = PeerId::from_seed(self.peers.len() as u64);
        let pose = self.oracle.spawn(id, intent);
        self.connect(id, pose)
    }

    fn connect(&mut self, id: PeerId, pose: Pose) -> Result<PeerId, SessionError> {
        let network = self.router.endpoint(id);
        self.server.add_known_peer(id);

        self.session.connect_peer(id, Some(pose))?;
        self.peers.push(SimPeer {
            id,
            network,
            view: PeerView::new(id),
            connected: true,
        });
        self.events.push(format!("{} connected", id));
        self.flush_host();
        Ok(id)
    }

    /// Drops a player: its link is cut and the host forgets it.
    pub fn disconnect_peer(&mut self, id: PeerId) -> Result<(), SessionError> {
        let server = self.server.local_id();
        self.network_controller.partition(&[id], &[server]);
        self.server.remove_known_peer(id);
        self.router.detach(id);
        self.oracle.deactivate(id);
        if let Some(peer) = self.peers.iter_mut().find(|p| p.id == id) {
            peer.connected = false;
        }

        self.session.disconnect_peer(id)?;
        self.events.push(format!("{} disconnected", id));
        self.flush_host();
        Ok(())
    }

    /// Has a player ask the host to end the round. Travels over the network.
    pub fn request_end_early(&mut self, id: PeerId) -> bool {
        match self.peers.iter_mut().find(|p| p.id == id && p.connected) {
            Some(peer) => {
                peer.view.request_end_early();
                true
            }
            None => false,
        }
    }

    /// Advances simulation by one tick.
    pub fn step(&mut self) {
        let dt = 1.0 / self.config.tick_rate_hz.max(1) as f64;
        self.context.advance_time(Duration::from_secs_f64(dt));
        let now = self.context.now();

        // 1. Ground truth moves; the host learns the new poses.
        self.oracle.step(dt);
        for player in self.oracle.active_players() {
            if let Err(e) = self.session.move_player(player.peer, player.pose()) {
                debug!("No pose update for {}: {}", player.peer, e);
            }
        }

        // 2. Peers receive and answer.
        self.router.route(now, &self.network_controller);
        self.router.deliver_due(now);
        let server = self.server.local_id();
        let timestamp_ms = self.context.timestamp_ms();
        let play_scene = self.config.session.round.play_scene.as_str();
        // Once converted, the level data's markers are already gone host-side.
        let markers = if self.session.placement().state() == PlacementState::Converted {
            &[][..]
        } else {
            self.config.placeholders.as_slice()
        };
        for peer in self.peers.iter_mut().filter(|p| p.connected) {
            for (_, packet) in peer.network.drain_inbox() {
                let was_in_play = peer.view.active_scene() == Some(play_scene);
                if let Err(e) = peer.view.apply_packet(&packet) {
                    warn!("{} could not decode host packet: {}", peer.id, e);
                    self.decode_errors += 1;
                }
                // Level data: markers appear with the scene.
                if !was_in_play && peer.view.active_scene() == Some(play_scene) {
                    for placeholder in markers {
                        peer.view.place_marker(placeholder.clone());
                    }
                }
            }
            for message in peer.view.take_outgoing() {
                match encode(&message, timestamp_ms) {
                    Ok(packet) => {
                        if let Err(e) = peer.network.send_now(server, packet) {
                            warn!("{} send failed: {}", peer.id, e);
                        }
                    }
                    Err(e) => warn!("{} could not encode {:?}: {}", peer.id, message, e),
                }
            }
        }

        // 3. Host receives.
        self.router.route(now, &self.network_controller);
        self.router.deliver_due(now);
        for (from, packet) in self.server.drain_inbox() {
            if let Err(e) = self.session.handle_packet(from, &packet) {
                warn!("Host rejected packet from {}: {}", from, e);
                self.decode_errors += 1;
            }
        }

        // 4. Timers.
        self.session.update();
        self.observe();

        // 5. Host sends.
        self.flush_host();
        self.tick_count += 1;
    }

    /// Runs for `secs` of virtual time.
    pub fn run_for(&mut self, secs: f64) {
        let ticks = (secs * self.config.tick_rate_hz.max(1) as f64).ceil() as u64;
        for _ in 0..ticks {
            self.step();
        }
    }

    /// Steps until `predicate` holds or `max_secs` of virtual time pass.
    pub fn run_until(&mut self, max_secs: f64, mut predicate: impl FnMut(&SimWorld) -> bool) -> bool {
        let deadline = self.time() + max_secs;
        while self.time() < deadline {
            if predicate(self) {
                return true;
            }
            self.step();
        }
        predicate(self)
    }

    /// Records new resolutions and hand-offs.
    fn observe(&mut self) {
        let round = self.session.round();
        let now = self.time();

        if round.resolutions() > self.seen_resolutions {
            self.seen_resolutions = round.resolutions();
            if let Some(resolution) = round.last_resolution() {
                let eliminated: BTreeSet<PeerId> = resolution
                    .eliminated
                    .iter()
                    .filter_map(|id| self.session.registry().get(*id).and_then(|e| e.owner))
                    .collect();
                let expected: BTreeSet<PeerId> = self
                    .oracle
                    .expected_eliminated()
                    .into_iter()
                    .filter(|peer| !resolution.skipped.contains(peer))
                    .collect();

                let observation = RoundObservation {
                    index: self.seen_resolutions,
                    started_at_secs: round.started_at().map(|t| t.as_secs_f64()),
                    resolved_at_secs: now,
                    ended_early: resolution.ended_early,
                    eliminated,
                    expected,
                    skipped: resolution.skipped.clone(),
                    revived_at_secs: None,
                };
                if !observation.matches_oracle() {
                    warn!(
                        "Resolution {} disagrees with oracle: host {:?}, oracle {:?}",
                        observation.index, observation.eliminated, observation.expected
                    );
                }
                self.events.push(format!(
                    "round {} resolved: {} eliminated{}",
                    observation.index,
                    observation.eliminated.len(),
                    if observation.ended_early { " (ended early)" } else { "" }
                ));
                self.observations.push(observation);
            }
        }

        let handoffs = self.session.completed_rounds().len();
        if handoffs > self.seen_handoffs {
            self.seen_handoffs = handoffs;
            if let Some(last) = self.observations.last_mut() {
                last.revived_at_secs = Some(now);
            }
            self.events.push(format!("round {} handed off", handoffs));
        }
    }

    /// Sends every queued host message to its fixed recipients.
    fn flush_host(&mut self) {
        let now = self.context.now();
        for outbound in self.session.drain_outbox() {
            let packet = match self.session.encode(&outbound) {
                Ok(packet) => packet,
                Err(e) => {
                    warn!("Host could not encode {:?}: {}", outbound.message, e);
                    continue;
                }
            };
            for recipient in &outbound.recipients {
                if let Err(e) = self.server.send_now(*recipient, packet.clone()) {
                    warn!("Host send to {} failed: {}", recipient, e);
                }
            }
        }
        self.router.route(now, &self.network_controller);
    }

    /// Round resolutions observed so far.
    pub fn observations(&self) -> &[RoundObservation] {
        &self.observations
    }

    pub fn peer(&self, id: PeerId) -> Option<&SimPeer> {
        self.peers.iter().find(|p| p.id == id)
    }

    pub fn connected_peers(&self) -> impl Iterator<Item = &SimPeer> {
        self.peers.iter().filter(|p| p.connected)
    }

    pub fn host_peer(&self) -> PeerId {
        self.session.host_peer()
    }

    /// Takes notable events recorded since the last call.
    pub fn take_events(&mut self) -> Vec<String> {
        std::mem::take(&mut self.events)
    }

    /// Packets still travelling.
    pub fn in_flight(&self) -> usize {
        self.router.in_flight()
    }

    pub fn router_stats(&self) -> RouterStats {
        self.router.stats()
    }

    pub fn stats(&self) -> WorldStats {
        let router = self.router.stats();
        WorldStats {
            ticks: self.tick_count,
            players_connected: self.session.roster().len(),
            entities: self.session.registry().len(),
            host_messages: self.session.total_messages(),
            packets_routed: router.routed,
            packets_delivered: router.delivered,
            packets_dropped: router.dropped_partition + router.dropped_unknown,
            ordering_violations: self.peers.iter().map(|p| p.view.ordering_violations()).sum(),
            decode_errors: self.decode_errors,
        }
    }

    /// Returns the current simulation time in seconds.
    pub fn time(&self) -> f64 {
        self.context.now().as_secs_f64()
    }

    /// Returns the current tick count.
    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roundkeeper_core::round::RoundPhase;
    use roundkeeper_core::CueKind;

    fn quick_config(seed: u64) -> SimConfig {
        let mut config = SimConfig {
            seed,
            ..Default::default()
        };
        config.session.round.timeout_secs = 20.0;
        config
    }

    #[test]
    fn test_sim_world_creation() {
        let world = SimWorld::new(SimConfig::default()).unwrap();
        assert_eq!(world.time(), 0.0);
        assert_eq!(world.tick_count(), 0);
        assert!(world.peers.is_empty());
    }

    #[test]
    fn test_sim_world_tick() {
        let mut world = SimWorld::new(SimConfig::default()).unwrap();
        world.start().unwrap();

        for _ in 0..30 {
            world.step();
        }

        assert_eq!(world.tick_count(), 30);
        assert!((world.time() - 1.0).abs() < 0.001);
        assert_eq!(world.session.round().phase(), RoundPhase::CountingDown);
    }

    #[test]
    fn test_round_resolves_against_oracle() {
        let mut world = SimWorld::new(quick_config(5)).unwrap();
        world.start().unwrap();
        world.run_for(30.0);

        let observations = world.observations();
        assert_eq!(observations.len(), 1);
        assert!(observations[0].matches_oracle());
        assert!(!observations[0].ended_early);

        let revived = observations[0].revived_at_secs.unwrap();
        assert!((revived - observations[0].resolved_at_secs - 3.0).abs() < 0.05);
        assert_eq!(world.stats().ordering_violations, 0);
    }

    #[test]
    fn test_peers_see_replicated_state() {
        let mut world = SimWorld::new(SimConfig::default()).unwrap();
        world.start().unwrap();
        world.run_for(3.0);

        let host_entities = world.session.registry().len();
        for peer in world.connected_peers() {
            assert_eq!(peer.view.entity_count(), host_entities);
            assert_eq!(peer.view.active_scene(), Some("arena"));
            assert!(peer.view.placeholders().is_empty());
            assert!(peer.view.countdown_display(world.time(), &world.config.session.round).is_some());
        }
    }

    #[test]
    fn test_end_early_travels_over_network() {
        let mut world = SimWorld::new(SimConfig::default()).unwrap();
        world.start().unwrap();
        world.run_for(2.0);

        let guest = world.peers[1].id;
        assert!(world.request_end_early(guest));
        world.run_for(1.0);

        assert_eq!(world.observations().len(), 1);
        assert!(world.observations()[0].ended_early);
    }

    #[test]
    fn test_orchestrated_handoff_plays_cues() {
        let mut config = quick_config(9);
        config.orchestrated = true;
        let mut world = SimWorld::new(config).unwrap();
        world.start().unwrap();
        world.run_for(30.0);

        let host = world.peer(world.host_peer()).unwrap();
        assert_eq!(host.view.cues(), &[CueKind::Close, CueKind::Open]);
        assert_eq!(host.view.active_scene(), Some("lobby"));
        assert_eq!(world.session.loaded_scenes(), &["lobby".to_string()]);
    }

    #[test]
    fn test_sim_world_determinism() {
        let run = |seed| {
            let mut world = SimWorld::new(quick_config(seed)).unwrap();
            world.start().unwrap();
            world.run_for(25.0);
            (world.observations().to_vec(), world.stats())
        };

        assert_eq!(run(77), run(77));
    }
}
