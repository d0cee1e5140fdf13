//! Scenario runner - executes round lifecycle test scenarios.

use crate::exporter::{SimExport, SimFrame};
use crate::oracle::Intent;
use crate::scenarios::ScenarioId;
use crate::world::{SimConfig, SimWorld};

use nalgebra::{Point3, UnitQuaternion};
use roundkeeper_core::config::{CatalogEntryConfig, CompositeConfig, PartConfig};
use roundkeeper_core::round::RoundPhase;
use roundkeeper_core::transition::TransitionPhase;
use roundkeeper_core::{countdown_text, Anchor, CueKind, LoadMode, Pose, SessionError};
use roundkeeper_env::PeerId;
use serde::Serialize;
use tracing::{debug, info, warn};

/// Results from running a scenario.
#[derive(Debug, Clone)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: u64,

    /// Whether scenario passed all assertions
    pub passed: bool,

    /// Total ticks executed
    pub total_ticks: u64,

    /// Final simulation time in seconds
    pub final_time_secs: f64,

    /// Number of live replicated entities at end
    pub final_entity_count: usize,

    /// Failure message if any
    pub failure_reason: Option<String>,

    /// Metrics collected during run
    pub metrics: ScenarioMetrics,
}

/// Metrics collected during scenario execution.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScenarioMetrics {
    /// Packets handed to the router
    pub packets_sent: u64,

    /// Packets dropped by partitions or detached endpoints
    pub packets_dropped: u64,

    /// Host messages queued
    pub host_messages: u64,

    pub rounds_resolved: u64,
    pub players_eliminated: u64,

    /// `ReplaySpawn` directives sent to late joiners
    pub replays_sent: u64,

    /// Replication events peers could not apply in order
    pub ordering_violations: u64,
    pub decode_errors: u64,
}

impl ScenarioMetrics {
    fn from_world(world: &SimWorld) -> Self {
        let stats = world.stats();
        Self {
            packets_sent: stats.packets_routed,
            packets_dropped: stats.packets_dropped,
            host_messages: stats.host_messages,
            rounds_resolved: world.observations().len() as u64,
            players_eliminated: world.observations().iter().map(|o| o.eliminated.len() as u64).sum(),
            replays_sent: world.session.placement().replays_sent(),
            ordering_violations: stats.ordering_violations,
            decode_errors: stats.decode_errors,
        }
    }
}

/// Steps a world, capturing frames when exporting.
pub struct Trace {
    export: Option<SimExport>,
    frame_every: u64,
}

impl Trace {
    /// No frames captured.
    pub fn disabled() -> Self {
        Self {
            export: None,
            frame_every: 1,
        }
    }

    /// Captures one frame every `frame_every` ticks.
    pub fn recording(scenario: ScenarioId, seed: u64, frame_every: u64) -> Self {
        Self {
            export: Some(SimExport::new(scenario.name(), seed)),
            frame_every: frame_every.max(1),
        }
    }

    pub fn step(&mut self, world: &mut SimWorld) {
        world.step();
        if let Some(export) = self.export.as_mut() {
            if world.tick_count() % self.frame_every == 0 {
                export.add_frame(SimFrame::capture(world));
            }
        }
    }

    pub fn run_for(&mut self, world: &mut SimWorld, secs: f64) {
        let ticks = (secs * world.config.tick_rate_hz.max(1) as f64).ceil() as u64;
        for _ in 0..ticks {
            self.step(world);
        }
    }

    /// Steps until `predicate` holds or `max_secs` pass. Returns whether it held.
    pub fn run_until(
        &mut self,
        world: &mut SimWorld,
        max_secs: f64,
        mut predicate: impl FnMut(&SimWorld) -> bool,
    ) -> bool {
        let deadline = world.time() + max_secs;
        while world.time() < deadline {
            if predicate(world) {
                return true;
            }
            self.step(world);
        }
        predicate(world)
    }

    fn into_export(self) -> Option<SimExport> {
        self.export
    }
}

/// Collected assertion failures.
#[derive(Debug, Default)]
struct Checks {
    failures: Vec<String>,
}

impl Checks {
    fn check(&mut self, ok: bool, what: impl Into<String>) {
        if !ok {
            let what = what.into();
            warn!("Check failed: {}", what);
            self.failures.push(what);
        }
    }
}

type Outcome = Result<(SimWorld, Checks), SessionError>;

/// Runs round lifecycle scenarios.
pub struct ScenarioRunner {
    /// Configuration seed
    seed: u64,

    /// Number of players, host's own included
    num_peers: usize,

    /// Tick rate in Hz
    tick_rate_hz: u32,

    /// Longest a scenario waits for any one milestone, in seconds
    max_duration_secs: f64,

    latency_ms: u64,
    jitter_ms: u64,

    /// Countdown length override
    round_timeout_secs: Option<f64>,
}

impl ScenarioRunner {
    /// Creates a new scenario runner.
    pub fn new(seed: u64, num_peers: usize) -> Self {
        Self {
            seed,
            num_peers: num_peers.max(1),
            tick_rate_hz: 30,
            max_duration_secs: 330.0,
            latency_ms: 40,
            jitter_ms: 10,
            round_timeout_secs: None,
        }
    }

    /// Sets the tick rate.
    pub fn with_tick_rate(mut self, hz: u32) -> Self {
        self.tick_rate_hz = hz.max(1);
        self
    }

    /// Sets the maximum wait per milestone.
    pub fn with_duration(mut self, secs: f64) -> Self {
        self.max_duration_secs = secs;
        self
    }

    /// Sets one-way latency and jitter for remote peers.
    pub fn with_latency(mut self, latency_ms: u64, jitter_ms: u64) -> Self {
        self.latency_ms = latency_ms;
        self.jitter_ms = jitter_ms;
        self
    }

    /// Overrides the countdown length.
    pub fn with_round_timeout(mut self, secs: f64) -> Self {
        self.round_timeout_secs = Some(secs);
        self
    }

    /// Runs a scenario and returns the result.
    pub fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        self.execute(scenario, &mut Trace::disabled())
    }

    /// Runs a scenario and also returns a frame trace.
    pub fn run_with_export(&self, scenario: ScenarioId, frame_every: u64) -> (ScenarioResult, SimExport) {
        let mut trace = Trace::recording(scenario, self.seed, frame_every);
        let result = self.execute(scenario, &mut trace);
        let mut export = trace
            .into_export()
            .unwrap_or_else(|| SimExport::new(scenario.name(), self.seed));
        export.finalize(result.passed, result.failure_reason.clone());
        (result, export)
    }

    fn execute(&self, scenario: ScenarioId, trace: &mut Trace) -> ScenarioResult {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.seed);

        let outcome = match scenario {
            ScenarioId::StandardRound => self.run_standard_round(trace),
            ScenarioId::EarlyEnd => self.run_early_end(trace),
            ScenarioId::LateJoin => self.run_late_join(trace),
            ScenarioId::DisconnectMidRound => self.run_disconnect_mid_round(trace),
            ScenarioId::TransitionSpam => self.run_transition_spam(trace),
            ScenarioId::MissingRegion => self.run_missing_region(trace),
            ScenarioId::CompositeAnchors => self.run_composite_anchors(trace),
            ScenarioId::Reentry => self.run_reentry(trace),
            ScenarioId::SecondRound => self.run_second_round(trace),
            ScenarioId::JoinDuringLoad => self.run_join_during_load(trace),
        };

        match outcome {
            Ok((world, mut checks)) => {
                checks.check(
                    world.stats().ordering_violations == 0,
                    format!("{} out-of-order replication events", world.stats().ordering_violations),
                );
                checks.check(
                    world.stats().decode_errors == 0,
                    format!("{} undecodable packets", world.stats().decode_errors),
                );
                let passed = checks.failures.is_empty();
                if passed {
                    info!("✓ {} passed at t={:.1}s", scenario.name(), world.time());
                }
                ScenarioResult {
                    scenario,
                    seed: self.seed,
                    passed,
                    total_ticks: world.tick_count(),
                    final_time_secs: world.time(),
                    final_entity_count: world.session.registry().len(),
                    failure_reason: if passed { None } else { Some(checks.failures.join("; ")) },
                    metrics: ScenarioMetrics::from_world(&world),
                }
            }
            Err(e) => ScenarioResult {
                scenario,
                seed: self.seed,
                passed: false,
                total_ticks: 0,
                final_time_secs: 0.0,
                final_entity_count: 0,
                failure_reason: Some(format!("Session error: {}", e)),
                metrics: ScenarioMetrics::default(),
            },
        }
    }

    fn config(&self) -> SimConfig {
        let mut config = SimConfig {
            seed: self.seed,
            num_peers: self.num_peers,
            tick_rate_hz: self.tick_rate_hz,
            latency_ms: self.latency_ms,
            jitter_ms: self.jitter_ms,
            ..Default::default()
        };
        config.session.tick_rate_hz = self.tick_rate_hz;
        if let Some(timeout) = self.round_timeout_secs {
            config.session.round.timeout_secs = timeout;
        }
        config
    }

    /// Timing tolerance: two ticks, in seconds.
    fn slack(&self) -> f64 {
        2.0 / self.tick_rate_hz as f64
    }

    fn started_world(&self, config: SimConfig) -> Result<SimWorld, SessionError> {
        let mut world = SimWorld::new(config)?;
        world.start()?;
        Ok(world)
    }

    /// Waits for the next resolution and its revive, then lets the revive
    /// directives reach the peers.
    fn await_round(&self, trace: &mut Trace, world: &mut SimWorld, rounds: usize) -> bool {
        let done = trace.run_until(world, self.max_duration_secs, |w| {
            w.observations().len() >= rounds
                && w.observations()[rounds - 1].revived_at_secs.is_some()
        });
        trace.run_for(world, 1.0);
        done
    }

    /// Checks the latest resolution against the oracle and its timing.
    fn check_resolution(&self, world: &SimWorld, checks: &mut Checks, ended_early: bool) {
        let Some(obs) = world.observations().last() else {
            checks.check(false, "no resolution observed");
            return;
        };
        checks.check(
            obs.matches_oracle(),
            format!("host eliminated {:?}, oracle expected {:?}", obs.eliminated, obs.expected),
        );
        checks.check(obs.ended_early == ended_early, format!("ended_early was {}", obs.ended_early));

        let round = &world.config.session.round;
        if !ended_early {
            if let Some(started) = obs.started_at_secs {
                let took = obs.resolved_at_secs - started;
                checks.check(
                    (took - round.timeout_secs).abs() <= self.slack(),
                    format!("resolved {:.3}s after start, expected {:.1}s", took, round.timeout_secs),
                );
            }
        }
        if let Some(revived) = obs.revived_at_secs {
            let delay = revived - obs.resolved_at_secs;
            checks.check(
                (delay - round.revive_delay_secs).abs() <= self.slack(),
                format!("revived {:.3}s after resolution, expected {:.1}s", delay, round.revive_delay_secs),
            );
        }

        // Revives are addressed to the owner only.
        for peer in world.connected_peers() {
            let own = world.session.roster().get(peer.id).and_then(|s| s.entity);
            checks.check(
                peer.view.revives().iter().all(|e| Some(*e) == own),
                format!("{} received someone else's revive", peer.id),
            );
            if obs.revived_at_secs.is_some() && obs.eliminated.contains(&peer.id) {
                checks.check(
                    own.is_some_and(|e| peer.view.revives().contains(&e)),
                    format!("{} was eliminated but never revived", peer.id),
                );
            }
        }
    }

    /// DST-001: StandardRound - full countdown through fallback hand-off.
    fn run_standard_round(&self, trace: &mut Trace) -> Outcome {
        info!("DST-001: StandardRound - full round lifecycle");

        let config = self.config();
        let timeout = config.session.round.timeout_secs;
        let destination = config.session.round.destination_scene.clone();
        let mut world = self.started_world(config)?;
        let mut checks = Checks::default();

        // Halfway: every peer shows what the host would show.
        trace.run_for(&mut world, timeout / 2.0);
        let now = world.time();
        let round_config = world.config.session.round.clone();
        let expected = countdown_text(
            &round_config,
            Some(round_config.play_scene.as_str()),
            world.session.round().countdown(),
            now,
        );
        checks.check(expected.is_some(), "host countdown not active mid-round");
        for peer in world.connected_peers() {
            let shown = peer.view.countdown_display(now, &round_config);
            checks.check(shown == expected, format!("{} shows {:?}, host {:?}", peer.id, shown, expected));
        }

        let done = self.await_round(trace, &mut world, 1);
        checks.check(done, "round never revived");
        self.check_resolution(&world, &mut checks, false);

        // Fallback hand-off: no orchestrator, straight load of the destination.
        trace.run_until(&mut world, 5.0, |w| w.session.loaded_scenes() == [destination.clone()]);
        trace.run_for(&mut world, 1.0);
        checks.check(
            world.session.loaded_scenes() == [destination.clone()],
            format!("host scenes {:?}", world.session.loaded_scenes()),
        );
        for peer in world.connected_peers() {
            checks.check(
                peer.view.active_scene() == Some(destination.as_str()),
                format!("{} still in {:?}", peer.id, peer.view.active_scene()),
            );
            checks.check(peer.view.cues().is_empty(), format!("{} saw cues without a transition", peer.id));
        }
        checks.check(world.session.round().phase() == RoundPhase::Idle, "round not idle after hand-off");
        checks.check(
            world.session.placement().converted().iter().all(|id| !world.session.registry().contains(*id)),
            "converted placeholders outlived the play scene",
        );
        checks.check(world.session.placement().records().is_empty(), "spawn records outlived the play scene");

        info!(
            "✓ StandardRound: {} of {} eliminated",
            world.observations().first().map(|o| o.eliminated.len()).unwrap_or(0),
            world.peers.len()
        );
        Ok((world, checks))
    }

    /// DST-002: EarlyEnd - a peer ends the round; repeats are ignored.
    fn run_early_end(&self, trace: &mut Trace) -> Outcome {
        info!("DST-002: EarlyEnd - end-early request over the network");

        let mut config = self.config();
        config.num_peers = config.num_peers.max(3);
        let mut world = self.started_world(config)?;
        let mut checks = Checks::default();

        trace.run_for(&mut world, 10.0);
        let requester = world.peers[1].id;
        let requested_at = world.time();
        checks.check(world.request_end_early(requester), "requester not connected");

        let resolved = trace.run_until(&mut world, 5.0, |w| !w.observations().is_empty());
        checks.check(resolved, "end-early request never resolved the round");
        if let Some(obs) = world.observations().first() {
            let trip = obs.resolved_at_secs - requested_at;
            debug!("End-early resolved {:.3}s after request", trip);
            checks.check(trip < 1.0, format!("end-early took {:.3}s", trip));
        }

        // While reviving, a second request is ignored.
        let second = world.peers[2].id;
        world.request_end_early(second);
        trace.run_for(&mut world, 0.5);
        checks.check(world.observations().len() == 1, "second end-early resolved again");

        let done = self.await_round(trace, &mut world, 1);
        checks.check(done, "round never revived");
        self.check_resolution(&world, &mut checks, true);

        // After hand-off nothing is counting down: a third request changes nothing.
        world.request_end_early(requester);
        trace.run_for(&mut world, 1.0);
        checks.check(world.observations().len() == 1, "end-early outside a countdown resolved");

        info!("✓ EarlyEnd: resolved early, repeats ignored");
        Ok((world, checks))
    }

    /// DST-003: LateJoin - replay to players joining after conversion.
    fn run_late_join(&self, trace: &mut Trace) -> Outcome {
        info!("DST-003: LateJoin - replay for late joiners");

        let mut world = self.started_world(self.config())?;
        let mut checks = Checks::default();
        let early: Vec<PeerId> = world.peers.iter().map(|p| p.id).collect();

        trace.run_for(&mut world, 5.0);
        let records = world.session.placement().records().len();
        checks.check(records > 0, "nothing was converted");

        let late = vec![
            world.add_peer_with_intent(Intent::Inside)?,
            world.add_peer_with_intent(Intent::Inside)?,
        ];
        trace.run_for(&mut world, 2.0);

        let host_entities = world.session.registry().len();
        let now = world.time();
        let round_config = world.config.session.round.clone();
        for id in &late {
            let Some(peer) = world.peer(*id) else { continue };
            checks.check(
                peer.view.visual_instances().len() == records,
                format!("{} got {} replays for {} records", id, peer.view.visual_instances().len(), records),
            );
            checks.check(
                peer.view.entity_count() == host_entities,
                format!("{} mirrors {} of {} entities", id, peer.view.entity_count(), host_entities),
            );
            checks.check(peer.view.placeholders().is_empty(), format!("{} has placeholder markers", id));
            checks.check(
                peer.view.countdown_display(now, &round_config).is_some(),
                format!("{} shows no countdown", id),
            );
        }
        for id in &early {
            if let Some(peer) = world.peer(*id) {
                checks.check(peer.view.visual_instances().is_empty(), format!("{} got replays", id));
                checks.check(peer.view.placeholders().is_empty(), format!("{} kept placeholder markers", id));
            }
        }

        let placement = world.session.placement();
        checks.check(
            placement.replays_sent() == (records * late.len()) as u64,
            format!("{} replays sent, expected {}", placement.replays_sent(), records * late.len()),
        );
        checks.check(placement.replayed_connections() == late.len(), "replay set size");

        let done = self.await_round(trace, &mut world, 1);
        checks.check(done, "round never revived");
        self.check_resolution(&world, &mut checks, false);
        if let Some(obs) = world.observations().first() {
            checks.check(
                late.iter().all(|id| !obs.eliminated.contains(id)),
                "late joiner inside the region was eliminated",
            );
        }

        info!("✓ LateJoin: {} records replayed to {} joiners", records, late.len());
        Ok((world, checks))
    }

    /// DST-004: DisconnectMidRound - players leave while counting down.
    fn run_disconnect_mid_round(&self, trace: &mut Trace) -> Outcome {
        info!("DST-004: DisconnectMidRound - departures before resolution");

        let mut config = self.config();
        config.num_peers = config.num_peers.max(4);
        let timeout = config.session.round.timeout_secs;
        let mut world = self.started_world(config)?;
        let mut checks = Checks::default();

        trace.run_for(&mut world, timeout * 0.3);
        let leaving: Vec<PeerId> = world.peers[1..3].iter().map(|p| p.id).collect();
        let mut entities = Vec::new();
        for id in &leaving {
            entities.extend(world.session.roster().get(*id).and_then(|s| s.entity));
            world.disconnect_peer(*id)?;
        }
        trace.run_for(&mut world, 1.0);

        for entity in &entities {
            checks.check(!world.session.registry().contains(*entity), format!("{} not despawned", entity));
            for peer in world.connected_peers() {
                checks.check(peer.view.entity(*entity).is_none(), format!("{} still mirrors {}", peer.id, entity));
            }
        }

        let done = self.await_round(trace, &mut world, 1);
        checks.check(done, "round never revived");
        self.check_resolution(&world, &mut checks, false);
        if let Some(obs) = world.observations().first() {
            checks.check(
                leaving.iter().all(|id| !obs.eliminated.contains(id)),
                "departed player was eliminated",
            );
            checks.check(obs.skipped.is_empty(), format!("skipped {:?}", obs.skipped));
        }

        info!("✓ DisconnectMidRound: {} players left mid-round", leaving.len());
        Ok((world, checks))
    }

    /// DST-005: TransitionSpam - one transition at a time.
    fn run_transition_spam(&self, trace: &mut Trace) -> Outcome {
        info!("DST-005: TransitionSpam - overlapping transition requests");

        let mut config = self.config();
        config.orchestrated = true;
        let destination = config.session.round.destination_scene.clone();
        let play = config.session.round.play_scene.clone();
        let mut world = self.started_world(config)?;
        let mut checks = Checks::default();

        // The orchestrator starts a transition as the round hands off.
        let handed_off = trace.run_until(&mut world, self.max_duration_secs, |w| w.session.transition().is_in_flight());
        checks.check(handed_off, "orchestrator never started a transition");

        let mut rejected = 0;
        for scene in ["podium", play.as_str()] {
            match world.session.begin_transition(scene) {
                Err(SessionError::Transition(e)) => {
                    debug!("Rejected as expected: {}", e);
                    rejected += 1;
                }
                other => checks.check(false, format!("overlapping transition to {} gave {:?}", scene, other)),
            }
        }
        checks.check(rejected == 2, "overlapping transitions were accepted");

        let landed = trace.run_until(&mut world, 10.0, |w| !w.session.transition().is_in_flight());
        checks.check(landed, "transition to destination never completed");
        self.check_resolution(&world, &mut checks, false);
        checks.check(
            world.session.loaded_scenes() == [destination.clone()],
            format!("host scenes {:?}", world.session.loaded_scenes()),
        );

        // Back to the play scene: a second, sequential transition is fine.
        world.session.begin_transition(&play)?;
        let restarted = trace.run_until(&mut world, 10.0, |w| {
            !w.session.transition().is_in_flight() && w.session.round().phase() == RoundPhase::CountingDown
        });
        checks.check(restarted, "return to the play scene did not start a round");
        trace.run_for(&mut world, 1.0);

        let expected = [CueKind::Close, CueKind::Open, CueKind::Close, CueKind::Open];
        for peer in world.connected_peers() {
            checks.check(
                peer.view.cues() == expected,
                format!("{} saw cues {:?}", peer.id, peer.view.cues()),
            );
            checks.check(peer.view.active_scene() == Some(play.as_str()), format!("{} not back in play", peer.id));
        }
        checks.check(world.session.transition().completed() == 2, "transition count");

        info!("✓ TransitionSpam: {} overlapping requests rejected", rejected);
        Ok((world, checks))
    }

    /// DST-006: MissingRegion - fail closed.
    fn run_missing_region(&self, trace: &mut Trace) -> Outcome {
        info!("DST-006: MissingRegion - no survival region configured");

        let mut config = self.config();
        config.session.round.region = None;
        let mut world = self.started_world(config)?;
        let mut checks = Checks::default();

        let done = self.await_round(trace, &mut world, 1);
        checks.check(done, "round never revived");
        self.check_resolution(&world, &mut checks, false);

        let everyone: Vec<PeerId> = world.connected_peers().map(|p| p.id).collect();
        if let Some(obs) = world.observations().first() {
            checks.check(
                everyone.iter().all(|id| obs.eliminated.contains(id)),
                format!("only {} of {} eliminated", obs.eliminated.len(), everyone.len()),
            );
        }

        info!("✓ MissingRegion: all {} players eliminated", everyone.len());
        Ok((world, checks))
    }

    /// DST-007: CompositeAnchors - parts follow the root.
    fn run_composite_anchors(&self, trace: &mut Trace) -> Outcome {
        info!("DST-007: CompositeAnchors - root with mounted parts");

        let mut config = self.config();
        let anchors = vec![
            Anchor { name: "left".to_string(), local: Pose::at(-4.0, 2.0, 0.0) },
            Anchor { name: "right".to_string(), local: Pose::at(4.0, 2.0, 0.0) },
            Anchor { name: "top".to_string(), local: Pose::at(0.0, 6.0, 0.0) },
        ];
        config.session.catalog.entries.push(CatalogEntryConfig {
            item_id: "stage".to_string(),
            anchors: anchors.clone(),
        });
        config.session.catalog.entries.push(CatalogEntryConfig {
            item_id: "speaker".to_string(),
            anchors: vec![],
        });
        let root_pose = Pose::new(
            Point3::new(10.0, 0.0, 10.0),
            UnitQuaternion::from_euler_angles(0.0, std::f32::consts::FRAC_PI_2, 0.0),
        );
        let part = |anchor: &str, item: &str| PartConfig {
            anchor: anchor.to_string(),
            item: item.to_string(),
            destroy_with_scene: false,
        };
        let config = config.with_composite(CompositeConfig {
            root_item: "stage".to_string(),
            root_pose,
            root_destroy_with_scene: false,
            fallback_item: None,
            parts: vec![
                part("left", "speaker"),
                part("right", "speaker"),
                part("top", "not_in_catalog"),
                part("backstage", "speaker"),
            ],
        });

        let mut world = self.started_world(config)?;
        let mut checks = Checks::default();
        trace.run_for(&mut world, 2.0);

        let Some(report) = world.session.composite_report().cloned() else {
            checks.check(false, "composite was not spawned");
            return Ok((world, checks));
        };
        checks.check(report.spawned.len() == 2, format!("{} parts spawned", report.spawned.len()));
        checks.check(
            report.skipped == ["top".to_string(), "backstage".to_string()],
            format!("skipped {:?}", report.skipped),
        );

        let close = |a: &Pose, b: &Pose| (a.position - b.position).norm() < 1e-3;
        for (anchor, id) in &report.spawned {
            let Some(local) = anchors.iter().find(|a| &a.name == anchor).map(|a| a.local) else {
                continue;
            };
            let expected = root_pose.compose(&local);
            let host_pose = world.session.registry().get(*id).map(|e| e.pose);
            checks.check(
                host_pose.is_some_and(|p| close(&p, &expected)),
                format!("part on '{}' misplaced on host", anchor),
            );
            for peer in world.connected_peers() {
                let mirrored = peer.view.entity(*id);
                checks.check(
                    mirrored.is_some_and(|e| e.parent == Some(report.root) && close(&e.pose, &expected)),
                    format!("{} mirrors part on '{}' wrongly", peer.id, anchor),
                );
            }
        }

        // Moving the root carries the parts.
        let moved = Pose::at(-5.0, 1.0, 3.0);
        world.session.set_entity_pose(report.root, moved)?;
        for (anchor, id) in &report.spawned {
            if let Some(local) = anchors.iter().find(|a| &a.name == anchor).map(|a| a.local) {
                let host_pose = world.session.registry().get(*id).map(|e| e.pose);
                checks.check(
                    host_pose.is_some_and(|p| close(&p, &moved.compose(&local))),
                    format!("part on '{}' did not follow the root", anchor),
                );
            }
        }

        info!("✓ CompositeAnchors: {} parts, {} skipped", report.spawned.len(), report.skipped.len());
        Ok((world, checks))
    }

    /// DST-008: Reentry - the play scene reloads mid-countdown.
    fn run_reentry(&self, trace: &mut Trace) -> Outcome {
        info!("DST-008: Reentry - play scene reloaded mid-round");

        let config = self.config();
        let timeout = config.session.round.timeout_secs;
        let play = config.session.round.play_scene.clone();
        let mut world = self.started_world(config)?;
        let mut checks = Checks::default();

        trace.run_for(&mut world, timeout * 0.25);
        let first_start = world.session.round().started_at();
        let converted = world.session.placement().converted().to_vec();
        world.session.load_scene(&play, LoadMode::Single);

        let restarted = trace.run_until(&mut world, 5.0, |w| w.session.round().started_at() != first_start);
        checks.check(restarted, "re-entry did not restart the countdown");
        let second_start = world.session.round().started_at().map(|t| t.as_secs_f64());

        trace.run_for(&mut world, 1.0);
        for peer in world.connected_peers() {
            let start = peer.view.countdown().filter(|c| c.active).map(|c| c.start_secs);
            checks.check(start == second_start, format!("{} countdown start {:?}", peer.id, start));
        }
        checks.check(
            converted.iter().all(|id| world.session.registry().contains(*id)),
            "converted entities lost on re-entry",
        );
        checks.check(world.session.connection_listeners() == 1, "placement listener count");

        let done = self.await_round(trace, &mut world, 1);
        checks.check(done, "round never revived");
        checks.check(world.observations().len() == 1, "superseded countdown also resolved");
        self.check_resolution(&world, &mut checks, false);

        info!("✓ Reentry: countdown restarted at {:?}", second_start);
        Ok((world, checks))
    }

    /// DST-009: SecondRound - play, lobby, play again, then a late joiner.
    fn run_second_round(&self, trace: &mut Trace) -> Outcome {
        info!("DST-009: SecondRound - placement after returning to the play scene");

        let mut config = self.config();
        config.orchestrated = true;
        let destination = config.session.round.destination_scene.clone();
        let play = config.session.round.play_scene.clone();
        let mut world = self.started_world(config)?;
        let mut checks = Checks::default();

        let done = self.await_round(trace, &mut world, 1);
        checks.check(done, "first round never revived");
        let first = world.session.placement().converted().to_vec();

        let in_lobby = trace.run_until(&mut world, 10.0, |w| {
            !w.session.transition().is_in_flight() && w.session.loaded_scenes() == [destination.clone()]
        });
        checks.check(in_lobby, "hand-off never reached the destination");
        checks.check(
            first.iter().all(|id| !world.session.registry().contains(*id)),
            "placed entities outlived the play scene",
        );
        checks.check(world.session.placement().records().is_empty(), "records outlived the play scene");

        world.session.begin_transition(&play)?;
        let back = trace.run_until(&mut world, 10.0, |w| {
            !w.session.transition().is_in_flight() && w.session.round().phase() == RoundPhase::CountingDown
        });
        checks.check(back, "return to the play scene did not start a round");
        let settle = world.config.session.placement.settle_delay_secs;
        trace.run_for(&mut world, settle + 1.0);

        let placement = world.session.placement();
        let records = placement.records().len();
        checks.check(records > 0, "nothing was converted in the second round");
        checks.check(
            placement.converted().iter().all(|id| world.session.registry().contains(*id)),
            "second-round placed entities missing on host",
        );
        let host_entities = world.session.registry().len();
        for peer in world.connected_peers() {
            checks.check(peer.view.placeholders().is_empty(), format!("{} kept placeholder markers", peer.id));
            checks.check(
                peer.view.entity_count() == host_entities,
                format!("{} mirrors {} of {} entities", peer.id, peer.view.entity_count(), host_entities),
            );
        }

        let replays_before = world.session.placement().replays_sent();
        let late = world.add_peer_with_intent(Intent::Inside)?;
        trace.run_for(&mut world, 2.0);
        let replays = world.session.placement().replays_sent() - replays_before;
        checks.check(replays == records as u64, format!("{} replays for {} records", replays, records));
        if let Some(peer) = world.peer(late) {
            checks.check(
                peer.view.visual_instances().len() == records,
                format!("late joiner shows {} of {} placed objects", peer.view.visual_instances().len(), records),
            );
            checks.check(
                peer.view.entity_count() == world.session.registry().len(),
                "late joiner mirror out of step",
            );
        }

        let done = self.await_round(trace, &mut world, 2);
        checks.check(done, "second round never revived");
        self.check_resolution(&world, &mut checks, false);

        info!("✓ SecondRound: {} records replayed after re-entry", records);
        Ok((world, checks))
    }

    /// DST-010: JoinDuringLoad - a player connects while a transition loads.
    fn run_join_during_load(&self, trace: &mut Trace) -> Outcome {
        info!("DST-010: JoinDuringLoad - connection mid-transition");

        let mut config = self.config();
        config.orchestrated = true;
        let destination = config.session.round.destination_scene.clone();
        let mut world = self.started_world(config)?;
        let mut checks = Checks::default();

        let loading = trace.run_until(&mut world, self.max_duration_secs, |w| {
            w.session.transition().phase() == TransitionPhase::Loading
        });
        checks.check(loading, "transition never reached its load");
        let joiner = world.add_peer_with_intent(Intent::Inside)?;

        let landed = trace.run_until(&mut world, 10.0, |w| !w.session.transition().is_in_flight());
        checks.check(landed, "transition never completed");
        trace.run_for(&mut world, 1.0);

        checks.check(
            world.session.loaded_scenes() == [destination.clone()],
            format!("host scenes {:?}", world.session.loaded_scenes()),
        );
        let host_entities = world.session.registry().len();
        if let Some(peer) = world.peer(joiner) {
            checks.check(
                peer.view.active_scene() == Some(destination.as_str()),
                format!("joiner stuck in {:?}", peer.view.active_scene()),
            );
            checks.check(
                peer.view.cues() == [CueKind::Close, CueKind::Open],
                format!("joiner saw cues {:?}", peer.view.cues()),
            );
            checks.check(peer.view.visual_instances().is_empty(), "joiner kept play-scene visuals");
            checks.check(peer.view.entity_count() == host_entities, "joiner mirror out of step");
        }

        info!("✓ JoinDuringLoad: joiner landed in {}", destination);
        Ok((world, checks))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner(seed: u64) -> ScenarioRunner {
        ScenarioRunner::new(seed, 4).with_round_timeout(20.0).with_duration(60.0)
    }

    #[test]
    fn test_standard_round_passes() {
        let result = runner(42).run(ScenarioId::StandardRound);
        assert!(result.passed, "{:?}", result.failure_reason);
        assert_eq!(result.metrics.rounds_resolved, 1);
    }

    #[test]
    fn test_early_end_passes() {
        let result = runner(7).run(ScenarioId::EarlyEnd);
        assert!(result.passed, "{:?}", result.failure_reason);
    }

    #[test]
    fn test_late_join_passes() {
        let result = runner(3).run(ScenarioId::LateJoin);
        assert!(result.passed, "{:?}", result.failure_reason);
        assert!(result.metrics.replays_sent > 0);
    }

    #[test]
    fn test_second_round_replays_fresh_records() {
        let result = runner(21).run(ScenarioId::SecondRound);
        assert!(result.passed, "{:?}", result.failure_reason);
        assert_eq!(result.metrics.rounds_resolved, 2);
    }

    #[test]
    fn test_join_during_load_passes() {
        let result = runner(8).run(ScenarioId::JoinDuringLoad);
        assert!(result.passed, "{:?}", result.failure_reason);
    }

    #[test]
    fn test_all_scenarios_pass_short_rounds() {
        for scenario in ScenarioId::all() {
            let result = runner(11).run(scenario);
            assert!(result.passed, "{}: {:?}", scenario, result.failure_reason);
        }
    }

    #[test]
    fn test_export_has_frames() {
        let (result, export) = runner(5).run_with_export(ScenarioId::MissingRegion, 30);
        assert!(result.passed, "{:?}", result.failure_reason);
        assert!(!export.frames.is_empty());
        assert_eq!(export.passed, result.passed);
        assert_eq!(export.scenario, "missing_region");
    }

    #[test]
    fn test_same_seed_same_metrics() {
        let a = runner(99).run(ScenarioId::DisconnectMidRound);
        let b = runner(99).run(ScenarioId::DisconnectMidRound);
        assert_eq!(a.total_ticks, b.total_ticks);
        assert_eq!(a.metrics.players_eliminated, b.metrics.players_eliminated);
        assert_eq!(a.metrics.packets_sent, b.metrics.packets_sent);
    }
}
