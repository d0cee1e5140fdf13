//! Scene transition choreography: close cue, networked load, open cue.
//!
//! The closing cue holds for a configured duration before the load is
//! issued, so every peer has finished covering the screen by the time the
//! scene swaps. The opening cue is sent once the host itself reports the
//! destination loaded; completion notices from other peers do not reopen.

use roundkeeper_env::PeerId;
use tracing::{debug, info};

use crate::config::TransitionConfig;
use crate::error::TransitionError;
use crate::messages::{CueKind, HostMessage, LoadMode};
use crate::scheduler::TimerHandle;
use crate::session::{HostServices, TimerTask};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionPhase {
    Idle,

    /// Close cue sent; holding before the load
    Closing,

    /// Load issued; waiting for the host's completion notice
    Loading,
}

/// Runs one transition at a time.
#[derive(Debug)]
pub struct TransitionChoreographer {
    config: TransitionConfig,
    phase: TransitionPhase,
    destination: Option<String>,
    mode: LoadMode,
    hold: Option<TimerHandle>,
    completed: u64,
}

impl TransitionChoreographer {
    pub fn new(config: TransitionConfig) -> Self {
        let mode = config.load_mode;
        Self {
            config,
            phase: TransitionPhase::Idle,
            destination: None,
            mode,
            hold: None,
            completed: 0,
        }
    }

    pub fn phase(&self) -> TransitionPhase {
        self.phase
    }

    pub fn is_in_flight(&self) -> bool {
        self.phase != TransitionPhase::Idle
    }

    /// Destination of the in-flight transition.
    pub fn destination(&self) -> Option<&str> {
        self.destination.as_deref()
    }

    /// Transitions completed this session.
    pub fn completed(&self) -> u64 {
        self.completed
    }

    /// Starts a transition using the configured load mode.
    pub fn begin(&mut self, destination: &str, svc: &mut HostServices<'_>) -> Result<(), TransitionError> {
        self.begin_with_mode(destination, self.config.load_mode, svc)
    }

    /// Starts a transition. Rejected while another one is in flight.
    pub fn begin_with_mode(
        &mut self,
        destination: &str,
        mode: LoadMode,
        svc: &mut HostServices<'_>,
    ) -> Result<(), TransitionError> {
        if destination.is_empty() {
            return Err(TransitionError::EmptyDestination);
        }
        if let Some(current) = &self.destination {
            return Err(TransitionError::InFlight(current.clone()));
        }

        svc.outbox.broadcast(HostMessage::Cue { kind: CueKind::Close });
        self.hold = Some(svc.scheduler.schedule(
            svc.now,
            self.config.cue_duration(),
            TimerTask::CueHoldElapsed,
        ));
        self.destination = Some(destination.to_string());
        self.mode = mode;
        self.phase = TransitionPhase::Closing;

        info!("Transition to '{}' started ({:?})", destination, mode);
        Ok(())
    }

    /// The close cue finished holding: issue the load.
    ///
    /// Returns the scene and mode that were broadcast.
    pub fn on_hold_elapsed(
        &mut self,
        handle: TimerHandle,
        svc: &mut HostServices<'_>,
    ) -> Option<(String, LoadMode)> {
        if self.hold != Some(handle) || self.phase != TransitionPhase::Closing {
            return None;
        }
        self.hold = None;

        let scene = self.destination.clone()?;
        svc.outbox.broadcast(HostMessage::LoadScene {
            scene: scene.clone(),
            mode: self.mode,
        });
        self.phase = TransitionPhase::Loading;
        debug!("Load of '{}' issued", scene);
        Some((scene, self.mode))
    }

    /// A peer finished loading `scene`. Only the host's own notice for the
    /// destination completes the transition.
    pub fn on_scene_loaded(
        &mut self,
        from: PeerId,
        host: PeerId,
        scene: &str,
        svc: &mut HostServices<'_>,
    ) -> bool {
        if self.phase != TransitionPhase::Loading || from != host {
            return false;
        }
        if self.destination.as_deref() != Some(scene) {
            return false;
        }

        svc.outbox.broadcast(HostMessage::Cue { kind: CueKind::Open });
        self.phase = TransitionPhase::Idle;
        self.destination = None;
        self.completed += 1;
        info!("Transition to '{}' complete", scene);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::StaticCatalog;
    use crate::entity::EntityRegistry;
    use crate::messages::{Outbound, Outbox};
    use crate::scheduler::Scheduler;
    use crate::session::Roster;
    use std::time::Duration;

    struct Fixture {
        scheduler: Scheduler<TimerTask>,
        registry: EntityRegistry,
        outbox: Outbox,
        catalog: StaticCatalog,
        roster: Roster,
    }

    impl Fixture {
        fn new() -> Self {
            let mut outbox = Outbox::new();
            outbox.admit(PeerId::from_seed(0));
            outbox.admit(PeerId::from_seed(1));
            Self {
                scheduler: Scheduler::new(),
                registry: EntityRegistry::new(),
                outbox,
                catalog: StaticCatalog::new(),
                roster: Roster::new(),
            }
        }

        fn svc(&mut self, now: Duration) -> HostServices<'_> {
            HostServices {
                now,
                scheduler: &mut self.scheduler,
                registry: &mut self.registry,
                outbox: &mut self.outbox,
                catalog: &self.catalog,
                roster: &self.roster,
            }
        }

        fn advance(&mut self, transition: &mut TransitionChoreographer, now: Duration) {
            while let Some(due) = self.scheduler.pop_due(now) {
                let mut svc = self.svc(due.due_at);
                transition.on_hold_elapsed(due.handle, &mut svc);
            }
        }
    }

    fn messages(outbound: Vec<Outbound>) -> Vec<HostMessage> {
        outbound.into_iter().map(|o| o.message).collect()
    }

    #[test]
    fn test_close_hold_load_open() {
        let mut fx = Fixture::new();
        let host = PeerId::from_seed(0);
        let mut transition = TransitionChoreographer::new(TransitionConfig::default());

        transition.begin("lobby", &mut fx.svc(Duration::ZERO)).unwrap();
        assert_eq!(messages(fx.outbox.drain()), vec![HostMessage::Cue { kind: CueKind::Close }]);

        // No load before the cue has held for 1.5s.
        fx.advance(&mut transition, Duration::from_millis(1499));
        assert!(fx.outbox.pending().is_empty());

        fx.advance(&mut transition, Duration::from_millis(1500));
        assert_eq!(
            messages(fx.outbox.drain()),
            vec![HostMessage::LoadScene { scene: "lobby".to_string(), mode: LoadMode::Single }]
        );
        assert_eq!(transition.phase(), TransitionPhase::Loading);

        assert!(transition.on_scene_loaded(host, host, "lobby", &mut fx.svc(Duration::from_secs(2))));
        assert_eq!(messages(fx.outbox.drain()), vec![HostMessage::Cue { kind: CueKind::Open }]);
        assert!(!transition.is_in_flight());
        assert_eq!(transition.completed(), 1);
    }

    #[test]
    fn test_second_begin_rejected() {
        let mut fx = Fixture::new();
        let mut transition = TransitionChoreographer::new(TransitionConfig::default());

        transition.begin("lobby", &mut fx.svc(Duration::ZERO)).unwrap();
        assert_eq!(
            transition.begin("arena", &mut fx.svc(Duration::from_millis(100))),
            Err(TransitionError::InFlight("lobby".to_string()))
        );
        assert_eq!(transition.destination(), Some("lobby"));
        assert_eq!(fx.scheduler.len(), 1);
    }

    #[test]
    fn test_only_host_notice_reopens() {
        let mut fx = Fixture::new();
        let host = PeerId::from_seed(0);
        let guest = PeerId::from_seed(1);
        let mut transition = TransitionChoreographer::new(TransitionConfig::default());

        transition.begin("lobby", &mut fx.svc(Duration::ZERO)).unwrap();
        fx.advance(&mut transition, Duration::from_secs(2));
        fx.outbox.drain();

        assert!(!transition.on_scene_loaded(guest, host, "lobby", &mut fx.svc(Duration::from_secs(3))));
        assert!(!transition.on_scene_loaded(host, host, "arena", &mut fx.svc(Duration::from_secs(3))));
        assert!(transition.on_scene_loaded(host, host, "lobby", &mut fx.svc(Duration::from_secs(3))));
        // A late duplicate does not reopen twice.
        assert!(!transition.on_scene_loaded(host, host, "lobby", &mut fx.svc(Duration::from_secs(4))));

        let opens = fx
            .outbox
            .drain()
            .into_iter()
            .filter(|o| o.message == HostMessage::Cue { kind: CueKind::Open })
            .count();
        assert_eq!(opens, 1);
    }

    #[test]
    fn test_notice_during_hold_ignored() {
        let mut fx = Fixture::new();
        let host = PeerId::from_seed(0);
        let mut transition = TransitionChoreographer::new(TransitionConfig::default());

        transition.begin("lobby", &mut fx.svc(Duration::ZERO)).unwrap();
        assert!(!transition.on_scene_loaded(host, host, "lobby", &mut fx.svc(Duration::from_millis(10))));
        assert_eq!(transition.phase(), TransitionPhase::Closing);
    }

    #[test]
    fn test_empty_destination() {
        let mut fx = Fixture::new();
        let mut transition = TransitionChoreographer::new(TransitionConfig::default());
        assert_eq!(
            transition.begin("", &mut fx.svc(Duration::ZERO)),
            Err(TransitionError::EmptyDestination)
        );
    }
}
