//! Placeholder conversion and late-joiner replay.
//!
//! Level data places local placeholder markers. Once the host has settled
//! into the play scene, every marker is converted into a replicated entity
//! and each conversion is remembered as a [`SpawnRecord`]. Peers that connect
//! afterwards get those records replayed to them alone, keyed by their
//! connection id so no connection is ever replayed twice.
//!
//! Records live as long as the entities they describe. When leaving the play
//! scene destroys the converted entities, the replicator forgets them and
//! re-stages the level data, so the next entry converts afresh.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, info, warn};

use crate::catalog::{CatalogError, EntityCatalog, Template, TemplateIndex};
use crate::config::PlacementConfig;
use crate::entity::{EntityId, EntitySpec};
use crate::events::{ConnectionEvent, ConnectionEvents, ConnectionId, ListenerId};
use crate::geometry::Pose;
use crate::messages::HostMessage;
use crate::scheduler::TimerHandle;
use crate::session::{HostServices, TimerTask};

/// A local marker placed by level data, existing only until conversion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Placeholder {
    pub item_id: String,
    pub pose: Pose,

    /// Inactive markers are converted too
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl Placeholder {
    pub fn new(item_id: impl Into<String>, pose: Pose) -> Self {
        Self {
            item_id: item_id.into(),
            pose,
            active: true,
        }
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }
}

/// Host-only memory of one conversion, replayed to late joiners.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpawnRecord {
    pub template: TemplateIndex,
    pub pose: Pose,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlacementState {
    /// Not armed
    Idle,

    /// Waiting for the settle delay
    Armed,

    /// Placeholders converted; replaying to new connections
    Converted,
}

/// Converts placeholders and replays conversions to late joiners.
#[derive(Debug)]
pub struct PlacementReplicator {
    config: PlacementConfig,
    scene: String,

    /// Every marker the level data staged, kept for re-entry
    level_data: Vec<Placeholder>,
    placeholders: Vec<Placeholder>,
    records: Vec<SpawnRecord>,
    converted: Vec<EntityId>,
    state: PlacementState,
    settle: Option<TimerHandle>,
    listener: Option<ListenerId>,
    replayed: HashSet<ConnectionId>,
    replays_sent: u64,
}

impl PlacementReplicator {
    /// Creates a replicator for placeholders in `scene`.
    pub fn new(config: PlacementConfig, scene: impl Into<String>) -> Self {
        Self {
            config,
            scene: scene.into(),
            level_data: Vec::new(),
            placeholders: Vec::new(),
            records: Vec::new(),
            converted: Vec::new(),
            state: PlacementState::Idle,
            settle: None,
            listener: None,
            replayed: HashSet::new(),
            replays_sent: 0,
        }
    }

    /// Places a marker. Ignored once conversion has happened.
    pub fn stage(&mut self, placeholder: Placeholder) {
        if self.state == PlacementState::Converted {
            warn!("Placeholder '{}' staged after conversion; ignored", placeholder.item_id);
            return;
        }
        self.level_data.push(placeholder.clone());
        self.placeholders.push(placeholder);
    }

    pub fn state(&self) -> PlacementState {
        self.state
    }

    /// Markers not yet converted.
    pub fn placeholders(&self) -> &[Placeholder] {
        &self.placeholders
    }

    /// Accumulated spawn records.
    pub fn records(&self) -> &[SpawnRecord] {
        &self.records
    }

    /// Entities created by conversion.
    pub fn converted(&self) -> &[EntityId] {
        &self.converted
    }

    /// `ReplaySpawn` directives sent so far.
    pub fn replays_sent(&self) -> u64 {
        self.replays_sent
    }

    /// Connections that have been replayed to.
    pub fn replayed_connections(&self) -> usize {
        self.replayed.len()
    }

    /// Host entered the scene: listen for connections and schedule conversion.
    ///
    /// Returns false if already armed or converted.
    pub fn arm(&mut self, events: &mut ConnectionEvents, svc: &mut HostServices<'_>) -> bool {
        if self.state != PlacementState::Idle {
            debug!("Placement already {:?}; arm ignored", self.state);
            return false;
        }

        self.listener = Some(events.subscribe());
        self.settle = Some(svc.scheduler.schedule(
            svc.now,
            self.config.settle_delay(),
            TimerTask::PlacementSettled,
        ));
        self.state = PlacementState::Armed;
        debug!(
            "Placement armed: {} placeholders, settle {:.1}s",
            self.placeholders.len(),
            self.config.settle_delay_secs
        );
        true
    }

    /// The settle delay elapsed: convert every placeholder.
    pub fn on_settled(&mut self, handle: TimerHandle, svc: &mut HostServices<'_>) -> Vec<EntityId> {
        if self.settle != Some(handle) || self.state != PlacementState::Armed {
            return Vec::new();
        }
        self.settle = None;

        let mut spawned = Vec::with_capacity(self.placeholders.len());
        for placeholder in std::mem::take(&mut self.placeholders) {
            let template = match self.resolve(svc.catalog, &placeholder.item_id) {
                Ok(t) => t,
                Err(e) => {
                    warn!("Placeholder '{}' dropped: {}", placeholder.item_id, e);
                    continue;
                }
            };

            let id = svc.registry.spawn(
                EntitySpec::new(template.index, placeholder.pose, &self.scene)
                    .destroy_with_scene(self.config.destroy_with_scene),
            );
            self.records.push(SpawnRecord {
                template: template.index,
                pose: placeholder.pose,
            });
            spawned.push(id);
        }

        self.converted.extend(spawned.iter().copied());
        self.state = PlacementState::Converted;
        svc.outbox.broadcast(HostMessage::RemovePlaceholders);

        info!("Converted {} placeholders", spawned.len());
        spawned
    }

    /// Handles connection events received since the last call.
    ///
    /// Returns the number of `ReplaySpawn` directives queued.
    pub fn process_connections(
        &mut self,
        events: &mut ConnectionEvents,
        svc: &mut HostServices<'_>,
    ) -> usize {
        let Some(listener) = self.listener else {
            return 0;
        };

        let mut sent = 0;
        for event in events.drain(listener) {
            let ConnectionEvent::Connected { peer, connection } = event else {
                continue;
            };
            if self.state != PlacementState::Converted {
                debug!("Peer {} connected before conversion; nothing to replay", peer);
                continue;
            }
            if !self.replayed.insert(connection) {
                debug!("Connection {:?} already replayed", connection);
                continue;
            }

            for record in &self.records {
                svc.outbox.send_to(
                    peer,
                    HostMessage::ReplaySpawn {
                        template: record.template,
                        pose: record.pose,
                    },
                );
            }
            sent += self.records.len();
            debug!("Replayed {} spawns to {}", self.records.len(), peer);
        }

        self.replays_sent += sent as u64;
        sent
    }

    /// Host left the scene: stop listening and cancel a pending conversion.
    ///
    /// Converted entities that are destroyed with the scene take their spawn
    /// records with them; the level data is staged again and the next `arm`
    /// converts anew. Entities that outlive the scene keep their records, and
    /// `resume` replays them on re-entry.
    pub fn teardown(&mut self, events: &mut ConnectionEvents, svc: &mut HostServices<'_>) {
        if let Some(listener) = self.listener.take() {
            events.unsubscribe(listener);
        }
        if let Some(handle) = self.settle.take() {
            svc.scheduler.cancel(handle);
        }
        match self.state {
            PlacementState::Armed => self.state = PlacementState::Idle,
            PlacementState::Converted if self.config.destroy_with_scene => {
                debug!("Forgetting {} spawn records with the scene", self.records.len());
                self.records.clear();
                self.converted.clear();
                self.replayed.clear();
                self.placeholders = self.level_data.clone();
                self.state = PlacementState::Idle;
            }
            _ => {}
        }
        debug!("Placement torn down ({:?})", self.state);
    }

    /// Re-arms a converted replicator so it listens for connections again.
    pub fn resume(&mut self, events: &mut ConnectionEvents) {
        if self.state == PlacementState::Converted && self.listener.is_none() {
            self.listener = Some(events.subscribe());
        }
    }

    pub fn is_listening(&self) -> bool {
        self.listener.is_some()
    }

    fn resolve<'c>(
        &self,
        catalog: &'c dyn EntityCatalog,
        item_id: &str,
    ) -> Result<&'c Template, CatalogError> {
        catalog.resolve(item_id).or_else(|e| {
            warn!("{}; using fallback '{}'", e, self.config.fallback_item);
            catalog.resolve(&self.config.fallback_item)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::StaticCatalog;
    use crate::entity::EntityRegistry;
    use crate::messages::{Outbox, Target};
    use crate::scheduler::Scheduler;
    use crate::session::Roster;
    use roundkeeper_env::PeerId;
    use std::time::Duration;

    struct Fixture {
        scheduler: Scheduler<TimerTask>,
        registry: EntityRegistry,
        outbox: Outbox,
        catalog: StaticCatalog,
        roster: Roster,
        events: ConnectionEvents,
    }

    impl Fixture {
        fn new() -> Self {
            let mut catalog = StaticCatalog::new();
            catalog.register("fallback", vec![]).unwrap();
            catalog.register("barrel", vec![]).unwrap();
            catalog.register("crate", vec![]).unwrap();
            Self {
                scheduler: Scheduler::new(),
                registry: EntityRegistry::new(),
                outbox: Outbox::new(),
                catalog,
                roster: Roster::new(),
                events: ConnectionEvents::new(),
            }
        }

        fn svc(&mut self, now: Duration) -> (HostServices<'_>, &mut ConnectionEvents) {
            (
                HostServices {
                    now,
                    scheduler: &mut self.scheduler,
                    registry: &mut self.registry,
                    outbox: &mut self.outbox,
                    catalog: &self.catalog,
                    roster: &self.roster,
                },
                &mut self.events,
            )
        }

        fn connect(&mut self, seed: u64) -> (PeerId, ConnectionId) {
            let peer = PeerId::from_seed(seed);
            let connection = self.events.next_connection_id();
            self.events.emit(ConnectionEvent::Connected { peer, connection });
            (peer, connection)
        }

        fn settle(&mut self, placement: &mut PlacementReplicator, now: Duration) {
            while let Some(due) = self.scheduler.pop_due(now) {
                if due.task == TimerTask::PlacementSettled {
                    let (mut svc, _) = self.svc(due.due_at);
                    placement.on_settled(due.handle, &mut svc);
                }
            }
        }

        fn replays_to(&mut self, peer: PeerId) -> usize {
            self.outbox
                .drain()
                .iter()
                .filter(|o| {
                    o.target == Target::Peer(peer)
                        && matches!(o.message, HostMessage::ReplaySpawn { .. })
                })
                .count()
        }
    }

    fn staged() -> PlacementReplicator {
        let mut placement = PlacementReplicator::new(PlacementConfig::default(), "arena");
        placement.stage(Placeholder::new("barrel", Pose::at(1.0, 0.0, 0.0)));
        placement.stage(Placeholder::new("crate", Pose::at(2.0, 0.0, 0.0)).inactive());
        placement.stage(Placeholder::new("mystery", Pose::at(3.0, 0.0, 0.0)));
        placement
    }

    #[test]
    fn test_conversion_after_settle_delay() {
        let mut fx = Fixture::new();
        let mut placement = staged();
        let (mut svc, events) = fx.svc(Duration::ZERO);
        assert!(placement.arm(events, &mut svc));

        fx.settle(&mut placement, Duration::from_millis(999));
        assert_eq!(placement.state(), PlacementState::Armed);
        assert!(fx.registry.is_empty());

        fx.settle(&mut placement, Duration::from_secs(1));
        assert_eq!(placement.state(), PlacementState::Converted);
        assert_eq!(placement.records().len(), 3);
        assert!(placement.placeholders().is_empty());
        assert_eq!(fx.registry.len(), 3);

        // Unknown item falls back.
        let fallback = fx.catalog.resolve("fallback").unwrap().index;
        assert_eq!(placement.records()[2].template, fallback);

        assert!(fx
            .outbox
            .pending()
            .iter()
            .any(|o| o.message == HostMessage::RemovePlaceholders));
    }

    #[test]
    fn test_late_joiner_replay_count_matches_records() {
        let mut fx = Fixture::new();
        let mut placement = staged();
        let (mut svc, events) = fx.svc(Duration::ZERO);
        placement.arm(events, &mut svc);
        fx.settle(&mut placement, Duration::from_secs(1));
        fx.outbox.drain();

        let (peer, _) = fx.connect(7);
        let (mut svc, events) = fx.svc(Duration::from_secs(2));
        assert_eq!(placement.process_connections(events, &mut svc), 3);
        assert_eq!(fx.replays_to(peer), 3);
    }

    #[test]
    fn test_connection_replayed_once() {
        let mut fx = Fixture::new();
        let mut placement = staged();
        let (mut svc, events) = fx.svc(Duration::ZERO);
        placement.arm(events, &mut svc);
        fx.settle(&mut placement, Duration::from_secs(1));

        let (peer, connection) = fx.connect(7);
        fx.events.emit(ConnectionEvent::Connected { peer, connection });
        let (mut svc, events) = fx.svc(Duration::from_secs(2));
        assert_eq!(placement.process_connections(events, &mut svc), 3);
        assert_eq!(placement.replayed_connections(), 1);

        // Reconnecting is a new connection and is replayed again.
        fx.connect(7);
        let (mut svc, events) = fx.svc(Duration::from_secs(3));
        assert_eq!(placement.process_connections(events, &mut svc), 3);
    }

    #[test]
    fn test_connection_before_conversion_gets_nothing() {
        let mut fx = Fixture::new();
        let mut placement = staged();
        let (mut svc, events) = fx.svc(Duration::ZERO);
        placement.arm(events, &mut svc);

        let (peer, _) = fx.connect(3);
        let (mut svc, events) = fx.svc(Duration::from_millis(500));
        assert_eq!(placement.process_connections(events, &mut svc), 0);

        fx.settle(&mut placement, Duration::from_secs(1));
        let (mut svc, events) = fx.svc(Duration::from_secs(2));
        assert_eq!(placement.process_connections(events, &mut svc), 0);
        assert_eq!(fx.replays_to(peer), 0);
    }

    #[test]
    fn test_teardown_stops_listening_and_cancels() {
        let mut fx = Fixture::new();
        let mut placement = staged();
        let (mut svc, events) = fx.svc(Duration::ZERO);
        placement.arm(events, &mut svc);

        let (mut svc, events) = fx.svc(Duration::from_millis(200));
        placement.teardown(events, &mut svc);
        assert_eq!(fx.events.listener_count(), 0);
        assert!(fx.scheduler.is_empty());

        fx.settle(&mut placement, Duration::from_secs(5));
        assert!(fx.registry.is_empty());
        assert_eq!(placement.state(), PlacementState::Idle);
        assert_eq!(placement.placeholders().len(), 3);
    }

    #[test]
    fn test_teardown_with_scene_forgets_records() {
        let mut fx = Fixture::new();
        let mut placement = staged();
        let (mut svc, events) = fx.svc(Duration::ZERO);
        placement.arm(events, &mut svc);
        fx.settle(&mut placement, Duration::from_secs(1));

        let (mut svc, events) = fx.svc(Duration::from_secs(2));
        placement.teardown(events, &mut svc);
        assert_eq!(fx.registry.unload_scene("arena").len(), 3);
        assert_eq!(placement.state(), PlacementState::Idle);
        assert!(placement.records().is_empty());
        assert!(placement.converted().is_empty());
        assert_eq!(placement.placeholders().len(), 3);

        // Re-entry converts the level data again.
        let (mut svc, events) = fx.svc(Duration::from_secs(10));
        assert!(placement.arm(events, &mut svc));
        fx.settle(&mut placement, Duration::from_secs(11));
        assert_eq!(placement.state(), PlacementState::Converted);
        assert_eq!(placement.records().len(), 3);
        assert_eq!(fx.registry.len(), 3);
        assert!(placement.converted().iter().all(|id| fx.registry.contains(*id)));
        fx.outbox.drain();

        let (late, _) = fx.connect(11);
        let (mut svc, events) = fx.svc(Duration::from_secs(12));
        assert_eq!(placement.process_connections(events, &mut svc), 3);
        assert_eq!(fx.replays_to(late), 3);
    }

    #[test]
    fn test_no_replay_after_teardown() {
        let mut fx = Fixture::new();
        let config = PlacementConfig {
            destroy_with_scene: false,
            ..PlacementConfig::default()
        };
        let mut placement = PlacementReplicator::new(config, "arena");
        placement.stage(Placeholder::new("barrel", Pose::at(1.0, 0.0, 0.0)));
        placement.stage(Placeholder::new("crate", Pose::at(2.0, 0.0, 0.0)).inactive());
        placement.stage(Placeholder::new("mystery", Pose::at(3.0, 0.0, 0.0)));
        let (mut svc, events) = fx.svc(Duration::ZERO);
        placement.arm(events, &mut svc);
        fx.settle(&mut placement, Duration::from_secs(1));

        let (mut svc, events) = fx.svc(Duration::from_secs(2));
        placement.teardown(events, &mut svc);
        let (peer, _) = fx.connect(9);
        let (mut svc, events) = fx.svc(Duration::from_secs(3));
        assert_eq!(placement.process_connections(events, &mut svc), 0);
        assert_eq!(fx.replays_to(peer), 0);

        // Resuming only sees connections made afterwards.
        placement.resume(&mut fx.events);
        let (late, _) = fx.connect(10);
        let (mut svc, events) = fx.svc(Duration::from_secs(4));
        assert_eq!(placement.process_connections(events, &mut svc), 3);
        assert_eq!(fx.replays_to(late), 3);
    }
}
