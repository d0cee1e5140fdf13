//! Roundkeeper Core - server-authoritative round lifecycle for multiplayer sessions
//!
//! One host owns every replicated entity and every timer; peers observe.
//! This library covers four pieces that have to agree across the network:
//! 1. **Round lifecycle**: countdown, survival-region check, elimination, delayed revival
//! 2. **Composite structures**: a root entity with parts kinematically mounted on anchors
//! 3. **Placement replication**: placeholder conversion plus late-joiner replay
//! 4. **Scene transitions**: close cue, networked load, open cue
//!
//! Everything is synchronous. [`HostSession`] is the explicit context object;
//! time comes from a `roundkeeper_env::SessionContext`.

pub mod catalog;
pub mod composite;
pub mod config;
pub mod entity;
pub mod error;
pub mod events;
pub mod geometry;
pub mod messages;
pub mod peer;
pub mod placement;
pub mod replication;
pub mod round;
pub mod scheduler;
pub mod session;
pub mod transition;

// Re-export key types for convenience
pub use catalog::{Anchor, CatalogError, EntityCatalog, StaticCatalog, Template, TemplateIndex};
pub use composite::{CompositeReport, CompositeSpawner};
pub use config::{ConfigError, SessionConfig};
pub use entity::{EntityId, EntityRegistry, EntitySpec, RegistryError, Vitals};
pub use error::{SessionError, SpawnError, TransitionError};
pub use events::{ConnectionEvent, ConnectionEvents, ConnectionId, ListenerId};
pub use geometry::{Pose, SurvivalRegion};
pub use messages::{CueKind, HostMessage, LoadMode, Outbound, PeerMessage, Target};
pub use peer::PeerView;
pub use placement::{Placeholder, PlacementReplicator, SpawnRecord};
pub use replication::{CountdownState, ReplicationEvent};
pub use round::{countdown_text, EndEarlyOutcome, RoundController, RoundPhase, RoundSummary};
pub use scheduler::{Scheduler, TimerHandle};
pub use session::{Handoff, HostSession, RoundOrchestrator};
pub use transition::TransitionChoreographer;
