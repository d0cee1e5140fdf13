//! Round lifecycle: countdown, survival check, elimination, delayed revival.
//!
//! ```text
//!   Idle ──scene entered──► CountingDown ──timeout / end early──► Resolving
//!    ▲                                                               │
//!    │                                                          (immediate)
//!    │                                                               ▼
//!  HandingOff ◄──────────────── revive delay elapsed ───────────── Reviving
//! ```
//!
//! Only the host runs this state machine. Peers see the replicated
//! [`CountdownState`] and derive the remaining time themselves with
//! [`countdown_text`].

use roundkeeper_env::PeerId;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::RoundConfig;
use crate::entity::EntityId;
use crate::messages::HostMessage;
use crate::replication::{CountdownState, ReplicatedValue, ReplicationEvent};
use crate::scheduler::TimerHandle;
use crate::session::{HostServices, TimerTask};

/// Host-side round phase. Never replicated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoundPhase {
    Idle,
    CountingDown,
    Resolving,
    Reviving,
    HandingOff,
}

/// Result of the survival check.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resolution {
    /// Entities outside the region, now at zero health
    pub eliminated: Vec<EntityId>,

    /// Entities inside the region, untouched
    pub survivors: Vec<EntityId>,

    /// Players whose entity could not be resolved
    pub skipped: Vec<PeerId>,

    /// Triggered by an end-early request rather than the timeout
    pub ended_early: bool,
}

/// What happened to an end-early request.
#[derive(Debug, Clone, PartialEq)]
pub enum EndEarlyOutcome {
    /// The countdown was cancelled and the round resolved
    Resolved(Resolution),

    /// Not counting down; nothing changed
    Ignored,
}

/// Handed to the orchestrator (or logged by the fallback) when a round ends.
#[derive(Debug, Clone, PartialEq)]
pub struct RoundSummary {
    /// 1-based round counter
    pub round: u64,
    pub eliminated: Vec<EntityId>,
    pub revived: Vec<EntityId>,
    pub ended_early: bool,
}

/// Owns the round state machine.
#[derive(Debug)]
pub struct RoundController {
    config: RoundConfig,
    phase: RoundPhase,
    started_at: Option<Duration>,
    timeout: Option<TimerHandle>,
    revive: Option<TimerHandle>,
    eliminated: Vec<EntityId>,
    ended_early: bool,
    countdown: ReplicatedValue<CountdownState>,
    rounds_completed: u64,
    resolutions: u64,
    last_resolution: Option<Resolution>,
}

impl RoundController {
    pub fn new(config: RoundConfig) -> Self {
        Self {
            config,
            phase: RoundPhase::Idle,
            started_at: None,
            timeout: None,
            revive: None,
            eliminated: Vec::new(),
            ended_early: false,
            countdown: ReplicatedValue::new("round_countdown"),
            rounds_completed: 0,
            resolutions: 0,
            last_resolution: None,
        }
    }

    pub fn phase(&self) -> RoundPhase {
        self.phase
    }

    pub fn config(&self) -> &RoundConfig {
        &self.config
    }

    /// Replicated countdown, `None` before the first round starts.
    pub fn countdown(&self) -> Option<&CountdownState> {
        self.countdown.get()
    }

    /// When the current countdown started.
    pub fn started_at(&self) -> Option<Duration> {
        self.started_at
    }

    /// Entities eliminated this round and not yet revived.
    pub fn eliminated(&self) -> &[EntityId] {
        &self.eliminated
    }

    pub fn rounds_completed(&self) -> u64 {
        self.rounds_completed
    }

    /// Survival checks run so far.
    pub fn resolutions(&self) -> u64 {
        self.resolutions
    }

    pub fn last_resolution(&self) -> Option<&Resolution> {
        self.last_resolution.as_ref()
    }

    /// Host confirmed it entered `scene`. Starts the countdown in the play scene.
    ///
    /// Entering the play scene mid-round supersedes the running round: its
    /// timers are cancelled and anyone still eliminated is revived first.
    pub fn on_scene_entered(&mut self, scene: &str, svc: &mut HostServices<'_>) -> bool {
        if scene != self.config.play_scene {
            return false;
        }

        if self.phase != RoundPhase::Idle {
            warn!("Play scene re-entered during {:?}; superseding the running round", self.phase);
            self.cancel_timers(svc);
            self.revive_all(svc);
        }

        self.started_at = Some(svc.now);
        self.ended_early = false;
        self.phase = RoundPhase::CountingDown;
        self.timeout = Some(svc.scheduler.schedule(
            svc.now,
            self.config.timeout(),
            TimerTask::RoundTimeout,
        ));
        self.publish_countdown(
            CountdownState {
                start_secs: svc.now.as_secs_f64(),
                active: true,
            },
            svc,
        );

        info!(
            "Round {} countdown started ({:.0}s)",
            self.rounds_completed + 1,
            self.config.timeout_secs
        );
        true
    }

    /// The countdown timer fired.
    pub fn on_timeout(&mut self, handle: TimerHandle, svc: &mut HostServices<'_>) -> Option<Resolution> {
        if self.timeout != Some(handle) || self.phase != RoundPhase::CountingDown {
            debug!("Ignoring stale round timeout");
            return None;
        }
        self.timeout = None;
        Some(self.resolve(false, svc))
    }

    /// Ends the countdown now. Must run on the host.
    pub fn request_end_early(&mut self, svc: &mut HostServices<'_>) -> EndEarlyOutcome {
        if self.phase != RoundPhase::CountingDown {
            debug!("End-early request ignored during {:?}", self.phase);
            return EndEarlyOutcome::Ignored;
        }

        if let Some(handle) = self.timeout.take() {
            svc.scheduler.cancel(handle);
        }
        info!("Round ended early");
        EndEarlyOutcome::Resolved(self.resolve(true, svc))
    }

    /// The revive delay elapsed. Returns the summary to hand off with.
    pub fn on_revive_due(&mut self, handle: TimerHandle, svc: &mut HostServices<'_>) -> Option<RoundSummary> {
        if self.revive != Some(handle) || self.phase != RoundPhase::Reviving {
            debug!("Ignoring stale revive timer");
            return None;
        }
        self.revive = None;

        let eliminated = self.eliminated.clone();
        let revived = self.revive_all(svc);

        self.rounds_completed += 1;
        self.phase = RoundPhase::HandingOff;
        info!("Round {} complete; handing off", self.rounds_completed);

        Some(RoundSummary {
            round: self.rounds_completed,
            eliminated,
            revived,
            ended_early: self.ended_early,
        })
    }

    /// The play scene went away: stop without resolving.
    ///
    /// Pending timers are cancelled and anyone still eliminated is revived.
    pub fn abort(&mut self, svc: &mut HostServices<'_>) {
        if self.phase == RoundPhase::Idle {
            return;
        }
        warn!("Round aborted during {:?}", self.phase);

        self.cancel_timers(svc);
        self.revive_all(svc);
        if let Some(start) = self.countdown.get().filter(|c| c.active).map(|c| c.start_secs) {
            self.publish_countdown(CountdownState { start_secs: start, active: false }, svc);
        }
        self.phase = RoundPhase::Idle;
        self.started_at = None;
    }

    /// The session finished the hand-off.
    pub fn finish_handoff(&mut self) {
        if self.phase == RoundPhase::HandingOff {
            self.phase = RoundPhase::Idle;
            self.started_at = None;
        }
    }

    /// Survival check. Runs synchronously from `Resolving` into `Reviving`.
    fn resolve(&mut self, ended_early: bool, svc: &mut HostServices<'_>) -> Resolution {
        // A previous sequence's revive timer must not fire into this one.
        if let Some(handle) = self.revive.take() {
            svc.scheduler.cancel(handle);
        }

        self.phase = RoundPhase::Resolving;
        self.ended_early = ended_early;
        if let Some(start) = self.countdown.get().map(|c| c.start_secs) {
            self.publish_countdown(CountdownState { start_secs: start, active: false }, svc);
        }

        let region = self.config.region.as_ref();
        if region.is_none() {
            warn!("No survival region configured; every player is treated as outside");
        }

        let mut resolution = Resolution {
            ended_early,
            ..Resolution::default()
        };

        for (peer, entity) in svc.roster.controlled() {
            let Some(id) = entity else {
                debug!("Peer {} has no controlled entity; skipped", peer);
                resolution.skipped.push(peer);
                continue;
            };
            let Some(current) = svc.registry.get(id).and_then(|e| e.vitals.map(|v| (e.pose, v))) else {
                debug!("Entity {} of peer {} is gone; skipped", id, peer);
                resolution.skipped.push(peer);
                continue;
            };
            let (pose, vitals) = current;

            let inside = region.map_or(false, |r| r.contains(&pose.position));
            if inside {
                resolution.survivors.push(id);
                continue;
            }

            match svc.registry.set_vitals(id, vitals.eliminated()) {
                Ok(()) => {
                    info!("Eliminated {} (peer {})", id, peer);
                    resolution.eliminated.push(id);
                }
                Err(e) => warn!("Could not eliminate {}: {}", id, e),
            }
        }

        self.eliminated = resolution.eliminated.clone();
        self.resolutions += 1;
        self.last_resolution = Some(resolution.clone());

        self.phase = RoundPhase::Reviving;
        self.revive = Some(svc.scheduler.schedule(
            svc.now,
            self.config.revive_delay(),
            TimerTask::ReviveDue,
        ));
        resolution
    }

    /// Restores every recorded entity that still exists and tells its owner.
    fn revive_all(&mut self, svc: &mut HostServices<'_>) -> Vec<EntityId> {
        let mut revived = Vec::new();
        for id in std::mem::take(&mut self.eliminated) {
            let Some((owner, vitals)) = svc
                .registry
                .get(id)
                .and_then(|e| e.vitals.map(|v| (e.owner, v)))
            else {
                debug!("Eliminated entity {} left before revival", id);
                continue;
            };

            if let Err(e) = svc.registry.set_vitals(id, vitals.revived()) {
                warn!("Could not revive {}: {}", id, e);
                continue;
            }
            if let Some(owner) = owner {
                svc.outbox.send_to(owner, HostMessage::ReviveEntity { entity: id });
            }
            revived.push(id);
        }
        revived
    }

    fn cancel_timers(&mut self, svc: &mut HostServices<'_>) {
        if let Some(handle) = self.timeout.take() {
            svc.scheduler.cancel(handle);
        }
        if let Some(handle) = self.revive.take() {
            svc.scheduler.cancel(handle);
        }
    }

    fn publish_countdown(&mut self, state: CountdownState, svc: &mut HostServices<'_>) {
        self.countdown.set(state);
        svc.outbox
            .broadcast(HostMessage::Replication(ReplicationEvent::Countdown(state)));
    }
}

/// Formats whole seconds as `MM:SS` (minutes may exceed 59).
pub fn format_mm_ss(remaining: Duration) -> String {
    let total = remaining.as_secs();
    format!("{:02}:{:02}", total / 60, total % 60)
}

/// Countdown text a peer shows, or `None` when nothing should be displayed.
///
/// Works from replicated data only and tolerates it being absent.
pub fn countdown_text(
    config: &RoundConfig,
    observed_scene: Option<&str>,
    countdown: Option<&CountdownState>,
    now_secs: f64,
) -> Option<String> {
    let scene = observed_scene?;
    if !config.is_tracked(scene) {
        return None;
    }
    let countdown = countdown.filter(|c| c.active)?;

    let elapsed = (now_secs - countdown.start_secs).max(0.0);
    let remaining = (config.timeout_secs - elapsed).max(0.0);
    Some(format_mm_ss(Duration::try_from_secs_f64(remaining).unwrap_or(Duration::ZERO)))
}
