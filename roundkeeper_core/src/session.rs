//! The host session: explicit context object owning every host component.
//!
//! There is no global state. A [`HostSession`] owns the entity registry, the
//! scheduler, the outbox, the player roster and the session-scoped
//! connection events, and lends them to components as a [`HostServices`]
//! bundle for the duration of one call. Time is read from the injected
//! [`SessionContext`]; the session never sleeps.
//!
//! # Driving a session
//!
//! ```ignore
//! let mut session = HostSession::from_config(ctx, config, host_peer)?;
//! session.connect_peer(host_peer, Some(spawn_pose))?;
//! session.start()?;
//! loop {
//!     for (from, packet) in transport.incoming() {
//!         session.handle_packet(from, &packet)?;
//!     }
//!     session.update();
//!     for outbound in session.drain_outbox() {
//!         transport.deliver(outbound);
//!     }
//! }
//! ```

use roundkeeper_env::{PacketEnvelope, PeerId, SessionContext};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::catalog::{EntityCatalog, StaticCatalog};
use crate::composite::{CompositeReport, CompositeSpawner};
use crate::config::SessionConfig;
use crate::entity::{EntityId, EntityRegistry, EntitySpec, Vitals};
use crate::error::{SessionError, SessionResult};
use crate::events::{ConnectionEvent, ConnectionEvents, ConnectionId};
use crate::geometry::Pose;
use crate::messages::{decode, encode, CueKind, HostMessage, LoadMode, Outbound, Outbox, PeerMessage};
use crate::placement::{Placeholder, PlacementReplicator, PlacementState};
use crate::replication::ReplicationEvent;
use crate::round::{EndEarlyOutcome, RoundController, RoundSummary};
use crate::scheduler::Scheduler;
use crate::transition::{TransitionChoreographer, TransitionPhase};

/// Work the host scheduler can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerTask {
    RoundTimeout,
    ReviveDue,
    PlacementSettled,
    CueHoldElapsed,
}

/// Shared host state lent to a component for one call.
pub struct HostServices<'a> {
    /// Session time of the call (a timer's due instant when firing timers)
    pub now: Duration,
    pub scheduler: &'a mut Scheduler<TimerTask>,
    pub registry: &'a mut EntityRegistry,
    pub outbox: &'a mut Outbox,
    pub catalog: &'a dyn EntityCatalog,
    pub roster: &'a Roster,
}

/// One connected player.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlayerSlot {
    pub peer: PeerId,
    pub connection: ConnectionId,

    /// Controlled entity, if one was spawned
    pub entity: Option<EntityId>,
}

/// Connected players in connection order.
#[derive(Debug, Clone, Default)]
pub struct Roster {
    slots: Vec<PlayerSlot>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a player. Returns false if the peer is already present.
    pub fn insert(&mut self, peer: PeerId, connection: ConnectionId) -> bool {
        if self.contains(peer) {
            return false;
        }
        self.slots.push(PlayerSlot {
            peer,
            connection,
            entity: None,
        });
        true
    }

    pub fn remove(&mut self, peer: PeerId) -> Option<PlayerSlot> {
        let index = self.slots.iter().position(|s| s.peer == peer)?;
        Some(self.slots.remove(index))
    }

    pub fn set_entity(&mut self, peer: PeerId, entity: Option<EntityId>) -> bool {
        match self.slots.iter_mut().find(|s| s.peer == peer) {
            Some(slot) => {
                slot.entity = entity;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, peer: PeerId) -> Option<&PlayerSlot> {
        self.slots.iter().find(|s| s.peer == peer)
    }

    pub fn contains(&self, peer: PeerId) -> bool {
        self.get(peer).is_some()
    }

    /// `(peer, controlled entity)` for every connected player.
    pub fn controlled(&self) -> impl Iterator<Item = (PeerId, Option<EntityId>)> + '_ {
        self.slots.iter().map(|s| (s.peer, s.entity))
    }

    pub fn iter(&self) -> impl Iterator<Item = &PlayerSlot> {
        self.slots.iter()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// What to do once a round has finished reviving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handoff {
    /// Run a choreographed transition to this scene
    Transition(String),

    /// Remain in the current scene
    Stay,
}

/// External authority that decides what follows a round.
pub trait RoundOrchestrator: Send {
    /// Whether this orchestrator is the host-side authority. A
    /// non-authoritative orchestrator is bypassed in favour of the fallback.
    fn is_authoritative(&self) -> bool {
        true
    }

    fn complete_round(&mut self, summary: &RoundSummary) -> Handoff;
}

macro_rules! services {
    ($session:ident, $now:expr) => {
        HostServices {
            now: $now,
            scheduler: &mut $session.scheduler,
            registry: &mut $session.registry,
            outbox: &mut $session.outbox,
            catalog: $session.catalog.as_ref(),
            roster: &$session.roster,
        }
    };
}

/// Authoritative host for one multiplayer session.
pub struct HostSession<C: SessionContext> {
    context: Arc<C>,
    config: SessionConfig,
    host_peer: PeerId,
    catalog: Box<dyn EntityCatalog>,
    orchestrator: Option<Box<dyn RoundOrchestrator>>,

    scheduler: Scheduler<TimerTask>,
    registry: EntityRegistry,
    outbox: Outbox,
    roster: Roster,
    events: ConnectionEvents,

    round: RoundController,
    placement: PlacementReplicator,
    transition: TransitionChoreographer,
    composite: Option<CompositeSpawner>,

    /// Replication log entries already mirrored to peers
    log_cursor: usize,

    /// Scenes the host has confirmed loaded, oldest first
    loaded_scenes: Vec<String>,

    /// Loads issued but not yet confirmed by the host, in issue order
    pending_loads: Vec<(String, LoadMode)>,

    completed_rounds: Vec<RoundSummary>,
}

impl<C: SessionContext> HostSession<C> {
    /// Creates a session with an injected catalog.
    ///
    /// Fails if the config is invalid or the placement fallback item is not
    /// in the catalog.
    pub fn new(
        context: Arc<C>,
        config: SessionConfig,
        host_peer: PeerId,
        catalog: Box<dyn EntityCatalog>,
    ) -> SessionResult<Self> {
        config.validate()?;
        catalog.resolve(&config.placement.fallback_item)?;

        let play_scene = config.round.play_scene.clone();
        let composite = config
            .composite
            .clone()
            .map(|c| CompositeSpawner::new(c, play_scene.clone()));

        info!(
            "Host session created (host {}, seed {}, {} templates)",
            host_peer,
            context.seed(),
            catalog.len()
        );

        Ok(Self {
            round: RoundController::new(config.round.clone()),
            placement: PlacementReplicator::new(config.placement.clone(), play_scene),
            transition: TransitionChoreographer::new(config.transition.clone()),
            composite,
            context,
            config,
            host_peer,
            catalog,
            orchestrator: None,
            scheduler: Scheduler::new(),
            registry: EntityRegistry::new(),
            outbox: Outbox::new(),
            roster: Roster::new(),
            events: ConnectionEvents::new(),
            log_cursor: 0,
            loaded_scenes: Vec::new(),
            pending_loads: Vec::new(),
            completed_rounds: Vec::new(),
        })
    }

    /// Creates a session whose catalog comes from the config.
    pub fn from_config(context: Arc<C>, config: SessionConfig, host_peer: PeerId) -> SessionResult<Self> {
        let catalog = StaticCatalog::from_config(&config.catalog)?;
        Self::new(context, config, host_peer, Box::new(catalog))
    }

    /// Installs the orchestrator that decides what follows each round.
    pub fn with_orchestrator(mut self, orchestrator: Box<dyn RoundOrchestrator>) -> Self {
        self.orchestrator = Some(orchestrator);
        self
    }

    /// Issues the initial load of the play scene. The host peer must be connected.
    pub fn start(&mut self) -> SessionResult<()> {
        if !self.roster.contains(self.host_peer) {
            return Err(SessionError::UnknownPeer(self.host_peer));
        }
        let scene = self.config.round.play_scene.clone();
        self.load_scene(&scene, LoadMode::Single);
        Ok(())
    }

    /// Adds a level-data placeholder to the play scene.
    pub fn stage_placeholder(&mut self, placeholder: Placeholder) {
        self.placement.stage(placeholder);
    }

    /// Connects a peer and brings it up to date.
    ///
    /// The peer receives the loaded scenes, a snapshot of every live entity
    /// and the countdown before anything newer, followed by any transition
    /// cue and scene load still in flight. With a spawn pose, a player entity
    /// is created for it.
    pub fn connect_peer(&mut self, peer: PeerId, spawn: Option<Pose>) -> SessionResult<ConnectionId> {
        if self.roster.contains(peer) {
            return Err(SessionError::AlreadyConnected(peer));
        }

        // Older log entries go to the existing audience only.
        self.flush();

        let connection = self.events.next_connection_id();
        self.roster.insert(peer, connection);
        self.outbox.admit(peer);

        for (i, scene) in self.loaded_scenes.iter().enumerate() {
            let mode = if i == 0 { LoadMode::Single } else { LoadMode::Additive };
            self.outbox.send_to(peer, HostMessage::LoadScene { scene: scene.clone(), mode });
        }
        for event in self.registry.snapshot() {
            self.outbox.send_to(peer, HostMessage::Replication(event));
        }
        if let Some(countdown) = self.round.countdown() {
            self.outbox
                .send_to(peer, HostMessage::Replication(ReplicationEvent::Countdown(*countdown)));
        }
        if self.transition.phase() != TransitionPhase::Idle {
            self.outbox.send_to(peer, HostMessage::Cue { kind: CueKind::Close });
        }
        for (scene, mode) in &self.pending_loads {
            self.outbox.send_to(peer, HostMessage::LoadScene { scene: scene.clone(), mode: *mode });
        }

        if let Some(pose) = spawn {
            let entity = self.spawn_player(peer, pose);
            self.roster.set_entity(peer, entity);
        }

        self.events.emit(ConnectionEvent::Connected { peer, connection });
        let now = self.context.now();
        let mut svc = services!(self, now);
        self.placement.process_connections(&mut self.events, &mut svc);
        self.flush();

        info!("Peer {} connected ({:?}, {} players)", peer, connection, self.roster.len());
        Ok(connection)
    }

    /// Disconnects a peer and despawns its controlled entity.
    pub fn disconnect_peer(&mut self, peer: PeerId) -> SessionResult<()> {
        let slot = self.roster.remove(peer).ok_or(SessionError::UnknownPeer(peer))?;

        self.flush();
        self.outbox.dismiss(peer);

        if let Some(entity) = slot.entity {
            if let Err(e) = self.registry.despawn(entity) {
                debug!("Entity of {} already gone: {}", peer, e);
            }
        }
        self.events.emit(ConnectionEvent::Disconnected {
            peer,
            connection: slot.connection,
        });
        self.flush();

        info!("Peer {} disconnected ({} players)", peer, self.roster.len());
        Ok(())
    }

    /// Decodes and handles one packet from a peer.
    pub fn handle_packet(&mut self, from: PeerId, packet: &PacketEnvelope) -> SessionResult<()> {
        let message: PeerMessage = decode(packet)?;
        self.handle_peer_message(from, message);
        Ok(())
    }

    /// Handles one request from a peer. Requests from unknown peers are dropped.
    pub fn handle_peer_message(&mut self, from: PeerId, message: PeerMessage) {
        if !self.roster.contains(from) {
            warn!("Dropping {:?} from unknown peer {}", message, from);
            return;
        }

        let now = self.context.now();
        match message {
            PeerMessage::RequestEndRoundEarly => {
                let mut svc = services!(self, now);
                match self.round.request_end_early(&mut svc) {
                    EndEarlyOutcome::Resolved(resolution) => info!(
                        "Peer {} ended the round early: {} eliminated",
                        from,
                        resolution.eliminated.len()
                    ),
                    EndEarlyOutcome::Ignored => debug!("End-early from {} ignored", from),
                }
            }
            PeerMessage::SceneLoaded { scene } => {
                if from == self.host_peer {
                    self.on_host_scene_loaded(&scene, now);
                }
                let host = self.host_peer;
                let mut svc = services!(self, now);
                self.transition.on_scene_loaded(from, host, &scene, &mut svc);
            }
        }
        self.flush();
    }

    /// Starts a choreographed transition.
    pub fn begin_transition(&mut self, destination: &str) -> SessionResult<()> {
        let now = self.context.now();
        let mut svc = services!(self, now);
        self.transition.begin(destination, &mut svc)?;
        Ok(())
    }

    /// Issues a networked scene load without transition cues.
    pub fn load_scene(&mut self, scene: &str, mode: LoadMode) {
        self.track_load(scene.to_string(), mode);
        self.outbox.broadcast(HostMessage::LoadScene {
            scene: scene.to_string(),
            mode,
        });
        debug!("Load of '{}' issued ({:?})", scene, mode);
    }

    /// Runs due timers and mirrors new replication entries.
    ///
    /// Timers fire in due order and each sees its own due instant as "now",
    /// so a late update does not stretch chained delays.
    pub fn update(&mut self) {
        let now = self.context.now();

        while let Some(due) = self.scheduler.pop_due(now) {
            let at = due.due_at;
            match due.task {
                TimerTask::RoundTimeout => {
                    let mut svc = services!(self, at);
                    self.round.on_timeout(due.handle, &mut svc);
                }
                TimerTask::ReviveDue => {
                    let mut svc = services!(self, at);
                    if let Some(summary) = self.round.on_revive_due(due.handle, &mut svc) {
                        self.hand_off(summary, at);
                    }
                }
                TimerTask::PlacementSettled => {
                    let mut svc = services!(self, at);
                    self.placement.on_settled(due.handle, &mut svc);
                }
                TimerTask::CueHoldElapsed => {
                    let mut svc = services!(self, at);
                    if let Some((scene, mode)) = self.transition.on_hold_elapsed(due.handle, &mut svc) {
                        self.track_load(scene, mode);
                    }
                }
            }
            self.flush();
        }

        let mut svc = services!(self, now);
        self.placement.process_connections(&mut self.events, &mut svc);
        self.flush();
    }

    /// Moves an entity (and anything attached to it).
    pub fn set_entity_pose(&mut self, entity: EntityId, pose: Pose) -> SessionResult<()> {
        self.registry.set_pose(entity, pose)?;
        Ok(())
    }

    /// Moves a player's controlled entity.
    pub fn move_player(&mut self, peer: PeerId, pose: Pose) -> SessionResult<()> {
        let entity = self
            .roster
            .get(peer)
            .and_then(|s| s.entity)
            .ok_or(SessionError::UnknownPeer(peer))?;
        self.set_entity_pose(entity, pose)
    }

    /// Takes every queued outbound message.
    pub fn drain_outbox(&mut self) -> Vec<Outbound> {
        self.flush();
        self.outbox.drain()
    }

    /// Encodes an outbound message with the session's wall clock.
    pub fn encode(&self, outbound: &Outbound) -> SessionResult<PacketEnvelope> {
        Ok(encode(&outbound.message, self.context.timestamp_ms())?)
    }

    pub fn context(&self) -> &Arc<C> {
        &self.context
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn host_peer(&self) -> PeerId {
        self.host_peer
    }

    pub fn catalog(&self) -> &dyn EntityCatalog {
        self.catalog.as_ref()
    }

    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn round(&self) -> &RoundController {
        &self.round
    }

    pub fn placement(&self) -> &PlacementReplicator {
        &self.placement
    }

    pub fn transition(&self) -> &TransitionChoreographer {
        &self.transition
    }

    pub fn composite_report(&self) -> Option<&CompositeReport> {
        self.composite.as_ref().and_then(|c| c.report())
    }

    pub fn loaded_scenes(&self) -> &[String] {
        &self.loaded_scenes
    }

    /// Rounds completed so far, oldest first.
    pub fn completed_rounds(&self) -> &[RoundSummary] {
        &self.completed_rounds
    }

    pub fn pending_timers(&self) -> usize {
        self.scheduler.len()
    }

    pub fn connection_listeners(&self) -> usize {
        self.events.listener_count()
    }

    /// Messages queued over the session's lifetime.
    pub fn total_messages(&self) -> u64 {
        self.outbox.total_queued()
    }

    fn spawn_player(&mut self, peer: PeerId, pose: Pose) -> Option<EntityId> {
        let template = match self.catalog.resolve(&self.config.round.player_item) {
            Ok(t) => t.index,
            Err(e) => {
                warn!("No player entity for {}: {}", peer, e);
                return None;
            }
        };
        let scene = self
            .loaded_scenes
            .last()
            .cloned()
            .unwrap_or_else(|| self.config.round.play_scene.clone());

        let id = self.registry.spawn(
            EntitySpec::new(template, pose, scene)
                .owned_by(peer, Vitals::full(self.config.round.player_max_health)),
        );
        Some(id)
    }

    fn on_host_scene_loaded(&mut self, scene: &str, now: Duration) {
        let mode = match self.pending_loads.iter().position(|(s, _)| s == scene) {
            Some(index) => self.pending_loads.remove(index).1,
            None => LoadMode::default(),
        };
        let play_scene = self.config.round.play_scene.clone();

        match mode {
            LoadMode::Single => {
                for old in std::mem::take(&mut self.loaded_scenes) {
                    if old == scene {
                        continue;
                    }
                    if old == play_scene {
                        let mut svc = services!(self, now);
                        self.placement.teardown(&mut self.events, &mut svc);
                        self.round.abort(&mut svc);
                    }
                    let removed = self.registry.unload_scene(&old);
                    debug!("Unloaded '{}' ({} entities)", old, removed.len());
                }
                self.loaded_scenes = vec![scene.to_string()];
            }
            LoadMode::Additive => {
                if !self.loaded_scenes.iter().any(|s| s == scene) {
                    self.loaded_scenes.push(scene.to_string());
                }
            }
        }
        info!("Host entered '{}' ({:?})", scene, mode);

        if scene != play_scene {
            return;
        }

        if let Some(composite) = self.composite.as_mut() {
            if !composite.is_spawned() {
                let mut svc = services!(self, now);
                if let Err(e) = composite.spawn(&mut svc) {
                    error!("Composite spawn failed: {}", e);
                }
            }
        }

        if self.placement.state() == PlacementState::Converted {
            self.placement.resume(&mut self.events);
        } else {
            let mut svc = services!(self, now);
            self.placement.arm(&mut self.events, &mut svc);
        }

        let mut svc = services!(self, now);
        self.round.on_scene_entered(scene, &mut svc);
    }

    /// Remembers an issued load until the host confirms it. Reissuing a
    /// scene replaces its earlier entry.
    fn track_load(&mut self, scene: String, mode: LoadMode) {
        self.pending_loads.retain(|(s, _)| *s != scene);
        self.pending_loads.push((scene, mode));
    }

    fn hand_off(&mut self, summary: RoundSummary, now: Duration) {
        let handoff = match self.orchestrator.as_mut() {
            Some(orchestrator) if orchestrator.is_authoritative() => Some(orchestrator.complete_round(&summary)),
            Some(_) => {
                warn!("Orchestrator is not authoritative; using fallback hand-off");
                None
            }
            None => None,
        };

        match handoff {
            Some(Handoff::Transition(destination)) => {
                let mut svc = services!(self, now);
                if let Err(e) = self.transition.begin(&destination, &mut svc) {
                    warn!("Hand-off transition not started: {}", e);
                }
            }
            Some(Handoff::Stay) => debug!("Orchestrator keeps the current scene"),
            None => {
                let destination = self.config.round.destination_scene.clone();
                warn!("No round orchestrator; loading '{}' directly", destination);
                self.load_scene(&destination, LoadMode::Single);
            }
        }

        self.round.finish_handoff();
        self.completed_rounds.push(summary);
    }

    /// Mirrors replication log entries appended since the last flush.
    fn flush(&mut self) {
        let log = self.registry.log();
        for event in log.since(self.log_cursor) {
            self.outbox.broadcast(HostMessage::Replication(event.clone()));
        }
        self.log_cursor = log.len();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::SurvivalRegion;
    use crate::messages::{CueKind, Target};
    use crate::peer::PeerView;
    use crate::round::RoundPhase;
    use async_trait::async_trait;
    use nalgebra::{Point3, Vector3};
    use std::future::Future;
    use std::sync::Mutex;
    use std::time::SystemTime;

    struct ManualClock {
        now: Mutex<Duration>,
    }

    impl ManualClock {
        fn new() -> Arc<Self> {
            Arc::new(Self { now: Mutex::new(Duration::ZERO) })
        }

        fn set(&self, secs: f64) {
            *self.now.lock().unwrap() = Duration::from_secs_f64(secs);
        }
    }

    #[async_trait]
    impl SessionContext for ManualClock {
        fn now(&self) -> Duration {
            *self.now.lock().unwrap()
        }

        fn system_time(&self) -> SystemTime {
            SystemTime::UNIX_EPOCH + self.now()
        }

        async fn sleep(&self, duration: Duration) {
            *self.now.lock().unwrap() += duration;
        }

        fn spawn<F>(&self, _name: &str, _future: F)
        where
            F: Future<Output = ()> + Send + 'static,
        {
        }

        fn seed(&self) -> u64 {
            0
        }
    }

    struct FixedOrchestrator {
        destination: &'static str,
        authoritative: bool,
        calls: Arc<Mutex<u32>>,
    }

    impl RoundOrchestrator for FixedOrchestrator {
        fn is_authoritative(&self) -> bool {
            self.authoritative
        }

        fn complete_round(&mut self, _summary: &RoundSummary) -> Handoff {
            *self.calls.lock().unwrap() += 1;
            Handoff::Transition(self.destination.to_string())
        }
    }

    fn config() -> SessionConfig {
        let mut config = SessionConfig::default();
        config.round.region = Some(SurvivalRegion::aabb(Point3::origin(), Vector3::repeat(10.0)));
        config
    }

    fn host() -> PeerId {
        PeerId::from_seed(0)
    }

    /// Session with the host connected and settled in the play scene at T=0.
    fn started(clock: &Arc<ManualClock>) -> HostSession<ManualClock> {
        let mut session = HostSession::from_config(clock.clone(), config(), host()).unwrap();
        session.stage_placeholder(Placeholder::new("fallback", Pose::at(1.0, 0.0, 1.0)));
        session.connect_peer(host(), Some(Pose::at(0.0, 0.0, 0.0))).unwrap();
        session.start().unwrap();
        session.handle_peer_message(host(), PeerMessage::SceneLoaded { scene: "arena".to_string() });
        session
    }

    fn sent_to(outbound: &[Outbound], peer: PeerId) -> Vec<HostMessage> {
        outbound
            .iter()
            .filter(|o| o.recipients.contains(&peer))
            .map(|o| o.message.clone())
            .collect()
    }

    #[test]
    fn test_missing_fallback_rejected() {
        let mut config = config();
        config.placement.fallback_item = "nothing".to_string();
        let result = HostSession::from_config(ManualClock::new(), config, host());
        assert!(matches!(result, Err(SessionError::Catalog(_))));
    }

    #[test]
    fn test_start_requires_host_connected() {
        let mut session = HostSession::from_config(ManualClock::new(), config(), host()).unwrap();
        assert!(matches!(session.start(), Err(SessionError::UnknownPeer(_))));
    }

    #[test]
    fn test_host_entry_starts_round_and_arms_placement() {
        let clock = ManualClock::new();
        let session = started(&clock);

        assert_eq!(session.round().phase(), RoundPhase::CountingDown);
        assert_eq!(session.placement().state(), PlacementState::Armed);
        assert_eq!(session.loaded_scenes(), &["arena".to_string()]);
        assert_eq!(session.connection_listeners(), 1);
    }

    #[test]
    fn test_full_round_with_fallback_handoff() {
        let clock = ManualClock::new();
        let mut session = started(&clock);
        let guest = PeerId::from_seed(1);
        session.connect_peer(guest, Some(Pose::at(50.0, 0.0, 0.0))).unwrap();
        session.drain_outbox();

        clock.set(1.0);
        session.update();
        assert_eq!(session.placement().state(), PlacementState::Converted);

        clock.set(300.0);
        session.update();
        assert_eq!(session.round().phase(), RoundPhase::Reviving);
        let guest_entity = session.roster().get(guest).and_then(|s| s.entity).unwrap();
        assert_eq!(session.round().eliminated(), &[guest_entity]);

        // The update that runs late still revives at the due instant.
        clock.set(310.0);
        session.update();
        assert_eq!(session.round().phase(), RoundPhase::Idle);
        assert_eq!(session.completed_rounds().len(), 1);

        let out = session.drain_outbox();
        assert!(sent_to(&out, guest).contains(&HostMessage::ReviveEntity { entity: guest_entity }));
        assert!(!sent_to(&out, host()).contains(&HostMessage::ReviveEntity { entity: guest_entity }));
        assert!(out.iter().any(|o| o.message
            == HostMessage::LoadScene { scene: "lobby".to_string(), mode: LoadMode::Single }));
    }

    #[test]
    fn test_orchestrator_drives_handoff() {
        let clock = ManualClock::new();
        let calls = Arc::new(Mutex::new(0));
        let mut session = HostSession::from_config(clock.clone(), config(), host())
            .unwrap()
            .with_orchestrator(Box::new(FixedOrchestrator {
                destination: "podium",
                authoritative: true,
                calls: calls.clone(),
            }));
        session.connect_peer(host(), Some(Pose::identity())).unwrap();
        session.start().unwrap();
        session.handle_peer_message(host(), PeerMessage::SceneLoaded { scene: "arena".to_string() });

        session.handle_peer_message(host(), PeerMessage::RequestEndRoundEarly);
        clock.set(3.0);
        session.update();

        assert_eq!(*calls.lock().unwrap(), 1);
        assert_eq!(session.transition().destination(), Some("podium"));
        let out = session.drain_outbox();
        assert!(out.iter().any(|o| o.message == HostMessage::Cue { kind: CueKind::Close }));
        assert!(!out.iter().any(|o| matches!(o.message, HostMessage::LoadScene { ref scene, .. } if scene == "lobby")));
    }

    #[test]
    fn test_non_authoritative_orchestrator_bypassed() {
        let clock = ManualClock::new();
        let calls = Arc::new(Mutex::new(0));
        let mut session = HostSession::from_config(clock.clone(), config(), host())
            .unwrap()
            .with_orchestrator(Box::new(FixedOrchestrator {
                destination: "podium",
                authoritative: false,
                calls: calls.clone(),
            }));
        session.connect_peer(host(), None).unwrap();
        session.start().unwrap();
        session.handle_peer_message(host(), PeerMessage::SceneLoaded { scene: "arena".to_string() });
        session.handle_peer_message(host(), PeerMessage::RequestEndRoundEarly);
        clock.set(3.0);
        session.update();

        assert_eq!(*calls.lock().unwrap(), 0);
        assert!(!session.transition().is_in_flight());
    }

    #[test]
    fn test_late_joiner_catch_up_order() {
        let clock = ManualClock::new();
        let mut session = started(&clock);
        clock.set(1.0);
        session.update();
        session.drain_outbox();

        clock.set(60.0);
        let late = PeerId::from_seed(9);
        let connection = session.connect_peer(late, Some(Pose::at(2.0, 0.0, 0.0))).unwrap();
        let out = sent_to(&session.drain_outbox(), late);

        assert_eq!(
            out[0],
            HostMessage::LoadScene { scene: "arena".to_string(), mode: LoadMode::Single }
        );
        // Snapshot: host player + one converted placeholder, then the countdown.
        assert!(matches!(out[1], HostMessage::Replication(ReplicationEvent::Spawned { .. })));
        assert!(out
            .iter()
            .any(|m| matches!(m, HostMessage::Replication(ReplicationEvent::Countdown(c)) if c.active)));
        let replays = out.iter().filter(|m| matches!(m, HostMessage::ReplaySpawn { .. })).count();
        assert_eq!(replays, session.placement().records().len());
        assert_eq!(session.roster().get(late).map(|s| s.connection), Some(connection));
    }

    #[test]
    fn test_late_joiner_misses_older_broadcasts() {
        let clock = ManualClock::new();
        let mut session = started(&clock);
        clock.set(1.0);
        session.update();

        let late = PeerId::from_seed(5);
        session.connect_peer(late, None).unwrap();
        let out = session.drain_outbox();
        let remove = out
            .iter()
            .find(|o| o.message == HostMessage::RemovePlaceholders)
            .unwrap();
        assert!(!remove.recipients.contains(&late));
        assert_eq!(remove.target, Target::All);
    }

    #[test]
    fn test_disconnect_mid_round_is_skipped() {
        let clock = ManualClock::new();
        let mut session = started(&clock);
        let guest = PeerId::from_seed(3);
        session.connect_peer(guest, Some(Pose::at(80.0, 0.0, 0.0))).unwrap();

        clock.set(100.0);
        session.update();
        session.disconnect_peer(guest).unwrap();
        assert!(matches!(session.disconnect_peer(guest), Err(SessionError::UnknownPeer(_))));

        clock.set(300.0);
        session.update();
        assert!(session.round().eliminated().is_empty());
        assert_eq!(session.round().last_resolution().map(|r| r.survivors.len()), Some(1));
    }

    #[test]
    fn test_unknown_peer_request_dropped() {
        let clock = ManualClock::new();
        let mut session = started(&clock);
        session.handle_peer_message(PeerId::from_seed(77), PeerMessage::RequestEndRoundEarly);
        assert_eq!(session.round().phase(), RoundPhase::CountingDown);
    }

    #[test]
    fn test_single_load_unloads_previous_scene() {
        let clock = ManualClock::new();
        let mut session = started(&clock);
        clock.set(1.0);
        session.update();
        let converted = session.placement().converted().to_vec();
        assert!(!converted.is_empty());

        session.begin_transition("lobby").unwrap();
        assert!(session.begin_transition("arena").is_err());
        clock.set(3.0);
        session.update();
        session.handle_peer_message(host(), PeerMessage::SceneLoaded { scene: "lobby".to_string() });

        assert!(!session.transition().is_in_flight());
        assert!(converted.iter().all(|id| !session.registry().contains(*id)));
        assert_eq!(session.connection_listeners(), 0);
        assert_eq!(session.loaded_scenes(), &["lobby".to_string()]);
    }

    #[test]
    fn test_packet_roundtrip_through_session() {
        let clock = ManualClock::new();
        let mut session = started(&clock);
        let packet = encode(&PeerMessage::RequestEndRoundEarly, 0).unwrap();
        session.handle_packet(host(), &packet).unwrap();
        assert_eq!(session.round().phase(), RoundPhase::Reviving);

        let garbage = PacketEnvelope::new(vec![0xff], 0);
        assert!(matches!(session.handle_packet(host(), &garbage), Err(SessionError::Wire(_))));
    }

    #[test]
    fn test_join_before_host_confirms_load() {
        let clock = ManualClock::new();
        let mut session = HostSession::from_config(clock.clone(), config(), host()).unwrap();
        session.connect_peer(host(), Some(Pose::identity())).unwrap();
        session.start().unwrap();
        session.drain_outbox();

        let guest = PeerId::from_seed(4);
        session.connect_peer(guest, Some(Pose::at(1.0, 0.0, 0.0))).unwrap();
        session.handle_peer_message(host(), PeerMessage::SceneLoaded { scene: "arena".to_string() });

        assert_eq!(session.round().phase(), RoundPhase::CountingDown);
        let out = sent_to(&session.drain_outbox(), guest);
        let loads: Vec<_> = out.iter().filter(|m| matches!(m, HostMessage::LoadScene { .. })).collect();
        assert_eq!(
            loads,
            vec![&HostMessage::LoadScene { scene: "arena".to_string(), mode: LoadMode::Single }]
        );
        assert!(out
            .iter()
            .any(|m| matches!(m, HostMessage::Replication(ReplicationEvent::Countdown(c)) if c.active)));
    }

    #[test]
    fn test_join_during_transition_load() {
        let clock = ManualClock::new();
        let mut session = started(&clock);
        session.begin_transition("lobby").unwrap();
        clock.set(3.0);
        session.update();
        session.drain_outbox();

        let guest = PeerId::from_seed(6);
        session.connect_peer(guest, None).unwrap();
        let out = sent_to(&session.drain_outbox(), guest);
        let close = out.iter().position(|m| *m == HostMessage::Cue { kind: CueKind::Close });
        let arena = out.iter().position(|m| {
            *m == HostMessage::LoadScene { scene: "arena".to_string(), mode: LoadMode::Single }
        });
        let lobby = out.iter().position(|m| {
            *m == HostMessage::LoadScene { scene: "lobby".to_string(), mode: LoadMode::Single }
        });
        assert!(close.is_some());
        assert!(arena.is_none());
        assert!(close < lobby);

        // Once the host lands, nothing is pending for the next joiner.
        session.handle_peer_message(host(), PeerMessage::SceneLoaded { scene: "lobby".to_string() });
        session.drain_outbox();
        let next = PeerId::from_seed(7);
        session.connect_peer(next, None).unwrap();
        let out = sent_to(&session.drain_outbox(), next);
        let loads: Vec<_> = out.iter().filter(|m| matches!(m, HostMessage::LoadScene { .. })).collect();
        assert_eq!(
            loads,
            vec![&HostMessage::LoadScene { scene: "lobby".to_string(), mode: LoadMode::Single }]
        );
        assert!(!out.iter().any(|m| matches!(m, HostMessage::Cue { .. })));
    }

    #[test]
    fn test_play_scene_reentry_converts_again() {
        let clock = ManualClock::new();
        let mut session = started(&clock);
        clock.set(1.0);
        session.update();
        let first = session.placement().converted().to_vec();
        assert_eq!(first.len(), 1);

        session.load_scene("lobby", LoadMode::Single);
        session.handle_peer_message(host(), PeerMessage::SceneLoaded { scene: "lobby".to_string() });
        assert!(first.iter().all(|id| !session.registry().contains(*id)));
        assert_eq!(session.placement().state(), PlacementState::Idle);
        assert!(session.placement().records().is_empty());

        clock.set(10.0);
        session.load_scene("arena", LoadMode::Single);
        session.handle_peer_message(host(), PeerMessage::SceneLoaded { scene: "arena".to_string() });
        assert_eq!(session.placement().state(), PlacementState::Armed);
        assert_eq!(session.round().phase(), RoundPhase::CountingDown);

        clock.set(11.0);
        session.update();
        let second = session.placement().converted().to_vec();
        assert_eq!(second.len(), 1);
        assert!(second.iter().all(|id| session.registry().contains(*id)));
        session.drain_outbox();

        let late = PeerId::from_seed(8);
        session.connect_peer(late, None).unwrap();
        let out = sent_to(&session.drain_outbox(), late);
        let replays = out.iter().filter(|m| matches!(m, HostMessage::ReplaySpawn { .. })).count();
        assert_eq!(replays, 1);
        assert_eq!(session.placement().replayed_connections(), 1);
    }

    #[test]
    fn test_late_joiner_mirror_tracks_converted_entities() {
        let clock = ManualClock::new();
        let mut session = started(&clock);
        clock.set(1.0);
        session.update();
        session.drain_outbox();

        let late = PeerId::from_seed(9);
        session.connect_peer(late, None).unwrap();
        let mut view = PeerView::new(late);
        for message in sent_to(&session.drain_outbox(), late) {
            view.apply(&message);
        }
        assert_eq!(view.visual_instances().len(), 1);
        assert_eq!(view.entity_count(), session.registry().len());

        // The mirror entry is what lets the later despawn apply in order.
        session.load_scene("lobby", LoadMode::Single);
        session.handle_peer_message(host(), PeerMessage::SceneLoaded { scene: "lobby".to_string() });
        for message in sent_to(&session.drain_outbox(), late) {
            view.apply(&message);
        }
        assert_eq!(view.ordering_violations(), 0);
        assert_eq!(view.entity_count(), session.registry().len());
        assert!(view.visual_instances().is_empty());
    }
}
