//! Error types for host components and the session.

use roundkeeper_env::{EnvError, PeerId};
use thiserror::Error;

use crate::catalog::CatalogError;
use crate::config::ConfigError;
use crate::entity::RegistryError;

/// Composite spawning failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SpawnError {
    #[error("Composite structure already spawned this session")]
    AlreadySpawned,

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
}

/// Scene transition failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("Transition to {0} already in flight")]
    InFlight(String),

    #[error("Transition destination is empty")]
    EmptyDestination,
}

/// Errors surfaced by [`crate::session::HostSession`].
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Spawn error: {0}")]
    Spawn(#[from] SpawnError),

    #[error("Transition error: {0}")]
    Transition(#[from] TransitionError),

    #[error("Wire error: {0}")]
    Wire(#[from] EnvError),

    #[error("Peer {0} is not connected")]
    UnknownPeer(PeerId),

    #[error("Peer {0} is already connected")]
    AlreadyConnected(PeerId),
}

/// Result alias for session operations.
pub type SessionResult<T> = Result<T, SessionError>;
