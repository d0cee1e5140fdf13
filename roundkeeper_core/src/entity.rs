//! Host-side registry of replicated entities.
//!
//! Every spawn, attach, despawn and vitals change goes through the registry,
//! which appends a [`ReplicationEvent`] to its log in the order the
//! operations happen. Because attach/despawn of an unknown id is rejected,
//! the log never references an entity before its `Spawned` entry.

use roundkeeper_env::PeerId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::debug;

use crate::catalog::TemplateIndex;
use crate::geometry::Pose;
use crate::replication::{ReplicatedList, ReplicationEvent};

/// Host-assigned entity id; never reused within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(pub u64);

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "e{}", self.0)
    }
}

/// Vital resource of a player-controlled entity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Vitals {
    pub health: f32,
    pub max_health: f32,
    pub eliminated: bool,
}

impl Vitals {
    /// Full health, not eliminated.
    pub fn full(max_health: f32) -> Self {
        Self {
            health: max_health,
            max_health,
            eliminated: false,
        }
    }

    /// Health forced to zero.
    pub fn eliminated(self) -> Self {
        Self {
            health: 0.0,
            eliminated: true,
            ..self
        }
    }

    /// Health restored to max.
    pub fn revived(self) -> Self {
        Self::full(self.max_health)
    }
}

/// Kinematic link to a parent entity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Attachment {
    pub parent: EntityId,

    /// Pose relative to the parent, fixed at attach time
    pub offset: Pose,
}

/// What to spawn.
#[derive(Debug, Clone)]
pub struct EntitySpec {
    pub template: TemplateIndex,
    pub pose: Pose,
    pub scene: String,
    pub destroy_with_scene: bool,
    pub owner: Option<PeerId>,
    pub vitals: Option<Vitals>,
}

impl EntitySpec {
    /// A scene object with no owner and no vitals.
    pub fn new(template: TemplateIndex, pose: Pose, scene: impl Into<String>) -> Self {
        Self {
            template,
            pose,
            scene: scene.into(),
            destroy_with_scene: false,
            owner: None,
            vitals: None,
        }
    }

    pub fn destroy_with_scene(mut self, flag: bool) -> Self {
        self.destroy_with_scene = flag;
        self
    }

    pub fn owned_by(mut self, owner: PeerId, vitals: Vitals) -> Self {
        self.owner = Some(owner);
        self.vitals = Some(vitals);
        self
    }
}

/// A live replicated entity.
#[derive(Debug, Clone)]
pub struct ReplicatedEntity {
    pub id: EntityId,
    pub template: TemplateIndex,
    pub pose: Pose,
    pub scene: String,
    pub destroy_with_scene: bool,
    pub owner: Option<PeerId>,
    pub attachment: Option<Attachment>,
    pub vitals: Option<Vitals>,
}

/// Registry errors. All of them are caller errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("Unknown entity: {0}")]
    UnknownEntity(EntityId),

    #[error("Entity {0} has no vitals")]
    NoVitals(EntityId),

    #[error("Attaching {child} to {parent} would create a cycle")]
    AttachCycle { child: EntityId, parent: EntityId },
}

/// Owns every replicated entity on the host.
#[derive(Debug)]
pub struct EntityRegistry {
    entities: BTreeMap<EntityId, ReplicatedEntity>,
    next_id: u64,
    log: ReplicatedList<ReplicationEvent>,
}

impl EntityRegistry {
    /// Creates an empty registry. Ids start at 1.
    pub fn new() -> Self {
        Self {
            entities: BTreeMap::new(),
            next_id: 1,
            log: ReplicatedList::new("replication_log"),
        }
    }

    /// Spawns an entity and records the `Spawned` notification.
    pub fn spawn(&mut self, spec: EntitySpec) -> EntityId {
        let id = EntityId(self.next_id);
        self.next_id += 1;

        self.log.push(ReplicationEvent::Spawned {
            entity: id,
            template: spec.template,
            pose: spec.pose,
            scene: spec.scene.clone(),
        });
        if let Some(vitals) = spec.vitals {
            self.log.push(ReplicationEvent::Vitals { entity: id, vitals });
        }

        self.entities.insert(
            id,
            ReplicatedEntity {
                id,
                template: spec.template,
                pose: spec.pose,
                scene: spec.scene,
                destroy_with_scene: spec.destroy_with_scene,
                owner: spec.owner,
                attachment: None,
                vitals: spec.vitals,
            },
        );

        debug!("Spawned {} (template {})", id, spec.template);
        id
    }

    /// Attaches `child` to `parent` at their current relative pose.
    pub fn attach(&mut self, child: EntityId, parent: EntityId) -> Result<(), RegistryError> {
        let parent_pose = self.get(parent).ok_or(RegistryError::UnknownEntity(parent))?.pose;
        if !self.entities.contains_key(&child) {
            return Err(RegistryError::UnknownEntity(child));
        }
        if child == parent || self.is_ancestor(child, parent) {
            return Err(RegistryError::AttachCycle { child, parent });
        }

        let entity = self
            .entities
            .get_mut(&child)
            .ok_or(RegistryError::UnknownEntity(child))?;
        let offset = entity.pose.relative_to(&parent_pose);
        entity.attachment = Some(Attachment { parent, offset });

        self.log.push(ReplicationEvent::Attached { entity: child, parent, offset });
        Ok(())
    }

    /// Moves an entity; attached descendants follow.
    ///
    /// Transforms are driven by the entity's own simulation, so this does not
    /// append to the replication log.
    pub fn set_pose(&mut self, id: EntityId, pose: Pose) -> Result<(), RegistryError> {
        let entity = self.entities.get_mut(&id).ok_or(RegistryError::UnknownEntity(id))?;
        entity.pose = pose;

        let mut stack = vec![(id, pose)];
        while let Some((parent, parent_pose)) = stack.pop() {
            for child in self.children_of(parent) {
                if let Some(entity) = self.entities.get_mut(&child) {
                    if let Some(attachment) = entity.attachment {
                        entity.pose = parent_pose.compose(&attachment.offset);
                        stack.push((child, entity.pose));
                    }
                }
            }
        }
        Ok(())
    }

    /// Replaces an entity's vitals and records the change.
    pub fn set_vitals(&mut self, id: EntityId, vitals: Vitals) -> Result<(), RegistryError> {
        let entity = self.entities.get_mut(&id).ok_or(RegistryError::UnknownEntity(id))?;
        if entity.vitals.is_none() {
            return Err(RegistryError::NoVitals(id));
        }
        entity.vitals = Some(vitals);
        self.log.push(ReplicationEvent::Vitals { entity: id, vitals });
        Ok(())
    }

    /// Despawns an entity and everything attached to it (children first).
    ///
    /// Returns the despawned ids in notification order.
    pub fn despawn(&mut self, id: EntityId) -> Result<Vec<EntityId>, RegistryError> {
        if !self.entities.contains_key(&id) {
            return Err(RegistryError::UnknownEntity(id));
        }

        let mut order = Vec::new();
        self.collect_subtree(id, &mut order);
        for &entity in &order {
            self.entities.remove(&entity);
            self.log.push(ReplicationEvent::Despawned { entity });
        }
        Ok(order)
    }

    /// Despawns every `destroy_with_scene` entity owned by `scene`.
    pub fn unload_scene(&mut self, scene: &str) -> Vec<EntityId> {
        let doomed: Vec<EntityId> = self
            .entities
            .values()
            .filter(|e| e.destroy_with_scene && e.scene == scene)
            .map(|e| e.id)
            .collect();

        let mut removed = Vec::new();
        for id in doomed {
            // Already gone if it was attached under an earlier one.
            if let Ok(ids) = self.despawn(id) {
                removed.extend(ids);
            }
        }
        removed
    }

    pub fn get(&self, id: EntityId) -> Option<&ReplicatedEntity> {
        self.entities.get(&id)
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.entities.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ReplicatedEntity> {
        self.entities.values()
    }

    /// The full replication log.
    pub fn log(&self) -> &ReplicatedList<ReplicationEvent> {
        &self.log
    }

    /// Notifications that recreate the current state on a fresh peer:
    /// every `Spawned` first, then attachments, then vitals.
    pub fn snapshot(&self) -> Vec<ReplicationEvent> {
        let mut events = Vec::with_capacity(self.entities.len());
        for e in self.entities.values() {
            events.push(ReplicationEvent::Spawned {
                entity: e.id,
                template: e.template,
                pose: e.pose,
                scene: e.scene.clone(),
            });
        }
        for e in self.entities.values() {
            if let Some(a) = e.attachment {
                events.push(ReplicationEvent::Attached {
                    entity: e.id,
                    parent: a.parent,
                    offset: a.offset,
                });
            }
        }
        for e in self.entities.values() {
            if let Some(vitals) = e.vitals {
                events.push(ReplicationEvent::Vitals { entity: e.id, vitals });
            }
        }
        events
    }

    fn children_of(&self, parent: EntityId) -> Vec<EntityId> {
        self.entities
            .values()
            .filter(|e| e.attachment.map(|a| a.parent) == Some(parent))
            .map(|e| e.id)
            .collect()
    }

    fn is_ancestor(&self, candidate: EntityId, of: EntityId) -> bool {
        let mut current = self.get(of).and_then(|e| e.attachment).map(|a| a.parent);
        while let Some(id) = current {
            if id == candidate {
                return true;
            }
            current = self.get(id).and_then(|e| e.attachment).map(|a| a.parent);
        }
        false
    }

    /// Post-order: descendants before `id`.
    fn collect_subtree(&self, id: EntityId, out: &mut Vec<EntityId>) {
        for child in self.children_of(id) {
            self.collect_subtree(child, out);
        }
        out.push(id);
    }
}

impl Default for EntityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Point3;

    fn spec(x: f32) -> EntitySpec {
        EntitySpec::new(TemplateIndex(0), Pose::at(x, 0.0, 0.0), "arena")
    }

    #[test]
    fn test_ids_are_monotonic() {
        let mut registry = EntityRegistry::new();
        let a = registry.spawn(spec(0.0));
        let b = registry.spawn(spec(1.0));
        registry.despawn(a).unwrap();
        let c = registry.spawn(spec(2.0));

        assert!(a < b && b < c);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_attached_child_follows_parent() {
        let mut registry = EntityRegistry::new();
        let root = registry.spawn(spec(0.0));
        let part = registry.spawn(spec(2.0));
        registry.attach(part, root).unwrap();

        registry.set_pose(root, Pose::at(10.0, 1.0, 0.0)).unwrap();

        let moved = registry.get(part).unwrap().pose.position;
        assert_relative_eq!(moved, Point3::new(12.0, 1.0, 0.0), epsilon = 1e-5);
    }

    #[test]
    fn test_attach_unknown_is_rejected() {
        let mut registry = EntityRegistry::new();
        let root = registry.spawn(spec(0.0));
        assert_eq!(
            registry.attach(EntityId(99), root),
            Err(RegistryError::UnknownEntity(EntityId(99)))
        );
        assert_eq!(registry.log().len(), 1);
    }

    #[test]
    fn test_attach_cycle_is_rejected() {
        let mut registry = EntityRegistry::new();
        let a = registry.spawn(spec(0.0));
        let b = registry.spawn(spec(1.0));
        registry.attach(b, a).unwrap();
        assert!(matches!(registry.attach(a, b), Err(RegistryError::AttachCycle { .. })));
    }

    #[test]
    fn test_despawn_children_first() {
        let mut registry = EntityRegistry::new();
        let root = registry.spawn(spec(0.0));
        let part = registry.spawn(spec(1.0));
        registry.attach(part, root).unwrap();

        let order = registry.despawn(root).unwrap();
        assert_eq!(order, vec![part, root]);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_log_never_references_before_spawn() {
        let mut registry = EntityRegistry::new();
        let root = registry.spawn(spec(0.0));
        let part = registry.spawn(spec(1.0));
        registry.attach(part, root).unwrap();
        registry.despawn(root).unwrap();

        let mut seen = std::collections::HashSet::new();
        for event in registry.log().iter() {
            match event {
                ReplicationEvent::Spawned { entity, .. } => {
                    seen.insert(*entity);
                }
                other => {
                    if let Some(id) = other.entity() {
                        assert!(seen.contains(&id), "{:?} before spawn", other);
                    }
                }
            }
        }
    }

    #[test]
    fn test_unload_scene_respects_flag() {
        let mut registry = EntityRegistry::new();
        let keep = registry.spawn(spec(0.0));
        let doomed = registry.spawn(spec(1.0).destroy_with_scene(true));
        let other = registry.spawn(
            EntitySpec::new(TemplateIndex(0), Pose::identity(), "lobby").destroy_with_scene(true),
        );

        let removed = registry.unload_scene("arena");
        assert_eq!(removed, vec![doomed]);
        assert!(registry.contains(keep));
        assert!(registry.contains(other));
    }

    #[test]
    fn test_vitals_require_player_entity() {
        let mut registry = EntityRegistry::new();
        let prop = registry.spawn(spec(0.0));
        let player = registry.spawn(spec(1.0).owned_by(PeerId::from_seed(1), Vitals::full(100.0)));

        assert_eq!(
            registry.set_vitals(prop, Vitals::full(1.0)),
            Err(RegistryError::NoVitals(prop))
        );
        let dead = Vitals::full(100.0).eliminated();
        registry.set_vitals(player, dead).unwrap();
        assert_eq!(registry.get(player).unwrap().vitals, Some(dead));
    }

    #[test]
    fn test_snapshot_orders_spawns_first() {
        let mut registry = EntityRegistry::new();
        let part = registry.spawn(spec(1.0));
        let root = registry.spawn(spec(0.0));
        registry.attach(part, root).unwrap();

        let snapshot = registry.snapshot();
        assert!(matches!(snapshot[0], ReplicationEvent::Spawned { .. }));
        assert!(matches!(snapshot[1], ReplicationEvent::Spawned { .. }));
        assert!(matches!(snapshot[2], ReplicationEvent::Attached { .. }));
    }
}
