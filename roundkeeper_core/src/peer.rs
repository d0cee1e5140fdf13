//! Peer-side observer of the host.
//!
//! A [`PeerView`] applies host messages in arrival order and keeps a
//! read-only mirror of the replicated state, the local visual-only replay
//! instances and the local placeholder markers. It never decides anything
//! the host owns; its only outputs are scene-load acknowledgements and
//! end-early requests.

use roundkeeper_env::{EnvError, PacketEnvelope, PeerId};
use std::collections::BTreeMap;
use tracing::debug;

use crate::catalog::TemplateIndex;
use crate::config::RoundConfig;
use crate::entity::{EntityId, Vitals};
use crate::geometry::Pose;
use crate::messages::{decode, CueKind, HostMessage, LoadMode, PeerMessage};
use crate::placement::Placeholder;
use crate::replication::{CountdownState, ReplicationEvent};
use crate::round::countdown_text;

/// A peer's copy of a replicated entity.
#[derive(Debug, Clone, PartialEq)]
pub struct MirroredEntity {
    pub id: EntityId,
    pub template: TemplateIndex,
    pub pose: Pose,
    pub scene: String,
    pub parent: Option<EntityId>,
    pub vitals: Option<Vitals>,
}

/// Local, visual-only object created by a `ReplaySpawn`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VisualInstance {
    pub template: TemplateIndex,
    pub pose: Pose,
}

/// Everything one peer has observed.
#[derive(Debug, Clone)]
pub struct PeerView {
    peer: PeerId,
    entities: BTreeMap<EntityId, MirroredEntity>,
    visual_instances: Vec<VisualInstance>,
    placeholders: Vec<Placeholder>,
    scenes: Vec<String>,
    countdown: Option<CountdownState>,
    cues: Vec<CueKind>,
    revives: Vec<EntityId>,
    ordering_violations: u64,
    messages_applied: u64,
    outgoing: Vec<PeerMessage>,
}

impl PeerView {
    pub fn new(peer: PeerId) -> Self {
        Self {
            peer,
            entities: BTreeMap::new(),
            visual_instances: Vec::new(),
            placeholders: Vec::new(),
            scenes: Vec::new(),
            countdown: None,
            cues: Vec::new(),
            revives: Vec::new(),
            ordering_violations: 0,
            messages_applied: 0,
            outgoing: Vec::new(),
        }
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// Places a local placeholder marker (level data).
    pub fn place_marker(&mut self, placeholder: Placeholder) {
        self.placeholders.push(placeholder);
    }

    /// Decodes and applies one packet.
    pub fn apply_packet(&mut self, packet: &PacketEnvelope) -> Result<(), EnvError> {
        let message: HostMessage = decode(packet)?;
        self.apply(&message);
        Ok(())
    }

    /// Applies one host message.
    pub fn apply(&mut self, message: &HostMessage) {
        self.messages_applied += 1;
        match message {
            HostMessage::Replication(event) => self.apply_replication(event),
            HostMessage::RemovePlaceholders => {
                debug!("{}: removing {} placeholders", self.peer, self.placeholders.len());
                self.placeholders.clear();
            }
            HostMessage::ReplaySpawn { template, pose } => {
                self.visual_instances.push(VisualInstance {
                    template: *template,
                    pose: *pose,
                });
            }
            HostMessage::ReviveEntity { entity } => {
                if let Some(vitals) = self.entities.get_mut(entity).and_then(|e| e.vitals.as_mut()) {
                    *vitals = vitals.revived();
                }
                self.revives.push(*entity);
            }
            HostMessage::LoadScene { scene, mode } => {
                match mode {
                    LoadMode::Single => {
                        self.scenes = vec![scene.clone()];
                        self.visual_instances.clear();
                        self.placeholders.clear();
                    }
                    LoadMode::Additive => {
                        if !self.scenes.contains(scene) {
                            self.scenes.push(scene.clone());
                        }
                    }
                }
                self.outgoing.push(PeerMessage::SceneLoaded { scene: scene.clone() });
            }
            HostMessage::Cue { kind } => self.cues.push(*kind),
        }
    }

    fn apply_replication(&mut self, event: &ReplicationEvent) {
        match event {
            ReplicationEvent::Spawned { entity, template, pose, scene } => {
                if self.entities.contains_key(entity) {
                    self.violation(event);
                }
                self.entities.insert(
                    *entity,
                    MirroredEntity {
                        id: *entity,
                        template: *template,
                        pose: *pose,
                        scene: scene.clone(),
                        parent: None,
                        vitals: None,
                    },
                );
            }
            ReplicationEvent::Attached { entity, parent, offset } => {
                let parent_pose = self.entities.get(parent).map(|p| p.pose);
                match parent_pose {
                    Some(parent_pose) if self.entities.contains_key(entity) => {
                        if let Some(child) = self.entities.get_mut(entity) {
                            child.parent = Some(*parent);
                            child.pose = parent_pose.compose(offset);
                        }
                    }
                    _ => self.violation(event),
                }
            }
            ReplicationEvent::Despawned { entity } => {
                if self.entities.remove(entity).is_none() {
                    self.violation(event);
                }
            }
            ReplicationEvent::Vitals { entity, vitals } => match self.entities.get_mut(entity) {
                Some(e) => e.vitals = Some(*vitals),
                None => self.violation(event),
            },
            ReplicationEvent::Countdown(state) => self.countdown = Some(*state),
        }
    }

    fn violation(&mut self, event: &ReplicationEvent) {
        debug!("{}: out-of-order replication {:?}", self.peer, event);
        self.ordering_violations += 1;
    }

    /// Asks the host to end the countdown now.
    pub fn request_end_early(&mut self) {
        self.outgoing.push(PeerMessage::RequestEndRoundEarly);
    }

    /// Takes messages waiting to go to the host.
    pub fn take_outgoing(&mut self) -> Vec<PeerMessage> {
        std::mem::take(&mut self.outgoing)
    }

    /// Countdown text to show at session time `now_secs`.
    pub fn countdown_display(&self, now_secs: f64, config: &RoundConfig) -> Option<String> {
        countdown_text(config, self.active_scene(), self.countdown.as_ref(), now_secs)
    }

    /// Most recently loaded scene.
    pub fn active_scene(&self) -> Option<&str> {
        self.scenes.last().map(String::as_str)
    }

    pub fn scenes(&self) -> &[String] {
        &self.scenes
    }

    pub fn entity(&self, id: EntityId) -> Option<&MirroredEntity> {
        self.entities.get(&id)
    }

    pub fn entities(&self) -> impl Iterator<Item = &MirroredEntity> {
        self.entities.values()
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn visual_instances(&self) -> &[VisualInstance] {
        &self.visual_instances
    }

    pub fn placeholders(&self) -> &[Placeholder] {
        &self.placeholders
    }

    pub fn countdown(&self) -> Option<&CountdownState> {
        self.countdown.as_ref()
    }

    pub fn cues(&self) -> &[CueKind] {
        &self.cues
    }

    pub fn last_cue(&self) -> Option<CueKind> {
        self.cues.last().copied()
    }

    /// Revive directives received, in order.
    pub fn revives(&self) -> &[EntityId] {
        &self.revives
    }

    /// Replication events that referenced an entity in an impossible state.
    pub fn ordering_violations(&self) -> u64 {
        self.ordering_violations
    }

    pub fn messages_applied(&self) -> u64 {
        self.messages_applied
    }
}
