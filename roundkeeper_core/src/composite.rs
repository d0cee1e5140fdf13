//! Composite structures: a root entity with parts mounted on named anchors.
//!
//! Anchors come from the root template's catalog entry, so the spawner
//! resolves them against the freshly spawned root's pose. Each part is
//! spawned at its anchor's world pose and then kinematically attached, which
//! makes it follow the root from then on.

use tracing::{debug, info, warn};

use crate::catalog::{EntityCatalog, Template};
use crate::config::CompositeConfig;
use crate::entity::{EntityId, EntityRegistry, EntitySpec, RegistryError};
use crate::error::SpawnError;
use crate::session::HostServices;

/// What a composite spawn produced.
#[derive(Debug, Clone, PartialEq)]
pub struct CompositeReport {
    pub root: EntityId,

    /// `(anchor, part)` in configuration order
    pub spawned: Vec<(String, EntityId)>,

    /// Anchors that did not resolve on the root, or whose part item did not
    pub skipped: Vec<String>,
}

/// Spawns one composite structure per session.
#[derive(Debug)]
pub struct CompositeSpawner {
    config: CompositeConfig,
    scene: String,
    report: Option<CompositeReport>,
}

impl CompositeSpawner {
    /// Creates a spawner that places the structure in `scene`.
    pub fn new(config: CompositeConfig, scene: impl Into<String>) -> Self {
        Self {
            config,
            scene: scene.into(),
            report: None,
        }
    }

    /// Report of the completed spawn, if any.
    pub fn report(&self) -> Option<&CompositeReport> {
        self.report.as_ref()
    }

    pub fn is_spawned(&self) -> bool {
        self.report.is_some()
    }

    /// Spawns the root and every resolvable part.
    ///
    /// A second call fails with [`SpawnError::AlreadySpawned`] and spawns
    /// nothing. Failure to resolve the root's item (and its fallback) is an
    /// error; part-level gaps are skipped with a warning.
    pub fn spawn(&mut self, svc: &mut HostServices<'_>) -> Result<CompositeReport, SpawnError> {
        if self.report.is_some() {
            return Err(SpawnError::AlreadySpawned);
        }

        let root_template = self.lookup(svc.catalog, &self.config.root_item)?;
        let root_pose = self.config.root_pose;
        let root = svc.registry.spawn(
            EntitySpec::new(root_template.index, root_pose, &self.scene)
                .destroy_with_scene(self.config.root_destroy_with_scene),
        );
        info!("Composite root {} spawned from '{}'", root, root_template.item_id);

        let mut report = CompositeReport {
            root,
            spawned: Vec::new(),
            skipped: Vec::new(),
        };

        for part in &self.config.parts {
            let Some(anchor) = root_template.anchor(&part.anchor) else {
                warn!(
                    "Anchor '{}' not found on '{}'; part '{}' skipped",
                    part.anchor, root_template.item_id, part.item
                );
                report.skipped.push(part.anchor.clone());
                continue;
            };

            let part_template = match self.lookup(svc.catalog, &part.item) {
                Ok(t) => t,
                Err(e) => {
                    warn!("Part for anchor '{}' skipped: {}", part.anchor, e);
                    report.skipped.push(part.anchor.clone());
                    continue;
                }
            };

            let world = root_pose.compose(&anchor.local);
            let spec = EntitySpec::new(part_template.index, world, &self.scene)
                .destroy_with_scene(part.destroy_with_scene);
            let id = match mount(svc.registry, root, spec) {
                Ok(id) => id,
                Err(e) => {
                    warn!("Part for anchor '{}' not mounted: {}", part.anchor, e);
                    report.skipped.push(part.anchor.clone());
                    continue;
                }
            };

            debug!("Part {} mounted on anchor '{}'", id, part.anchor);
            report.spawned.push((part.anchor.clone(), id));
        }

        info!(
            "Composite complete: {} parts, {} skipped",
            report.spawned.len(),
            report.skipped.len()
        );
        self.report = Some(report.clone());
        Ok(report)
    }

    /// Resolves an item, trying the configured fallback item second.
    fn lookup<'c>(
        &self,
        catalog: &'c dyn EntityCatalog,
        item: &str,
    ) -> Result<&'c Template, SpawnError> {
        match catalog.resolve(item) {
            Ok(template) => Ok(template),
            Err(e) => match &self.config.fallback_item {
                Some(fallback) => {
                    warn!("{}; using fallback '{}'", e, fallback);
                    Ok(catalog.resolve(fallback)?)
                }
                None => Err(e.into()),
            },
        }
    }
}

/// Spawns a part and attaches it to `root`. A part that cannot be attached
/// is despawned again so no free-floating piece is left behind.
fn mount(registry: &mut EntityRegistry, root: EntityId, spec: EntitySpec) -> Result<EntityId, RegistryError> {
    let id = registry.spawn(spec);
    if let Err(e) = registry.attach(id, root) {
        if let Err(cleanup) = registry.despawn(id) {
            debug!("Unmounted part {} already gone: {}", id, cleanup);
        }
        return Err(e);
    }
    Ok(id)
}
