//! Roundkeeper Deterministic Simulation Testing (DST) Harness
//!
//! Runs a host session and its peers inside a controlled world where every
//! source of non-determinism is owned by the harness.
//!
//! # Core Principle
//!
//! - **Time**: a virtual clock that only moves when the world steps
//! - **Network**: a router with per-link latency, jitter and partitions
//! - **Players**: an oracle that knows where every player truly is
//! - **Randomness**: all entropy derived from a single 64-bit seed
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                        SimWorld                          │
//! │  ┌────────────────────────────────────────────────────┐  │
//! │  │ SimContext (virtual clock)                         │  │
//! │  └────────────────────────────────────────────────────┘  │
//! │        │                          │                      │
//! │  ┌─────▼───────┐   SimRouter   ┌──▼──────┐               │
//! │  │ HostSession │◄─────────────►│ PeerView│  ...          │
//! │  └─────────────┘               └─────────┘               │
//! │        ▲                                                 │
//! │  ┌─────┴──────────────────────┐                          │
//! │  │ PlayerOracle (true poses)  │                          │
//! │  └────────────────────────────┘                          │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use roundkeeper_sim::{ScenarioRunner, scenarios::ScenarioId};
//!
//! let result = ScenarioRunner::new(42, 4)
//!     .with_round_timeout(20.0)
//!     .run(ScenarioId::StandardRound);
//! assert!(result.passed);
//! ```

mod context;
pub mod exporter;
mod network;
pub mod oracle;
pub mod runner;
pub mod scenarios;
pub mod world;

pub use context::SimContext;
pub use exporter::{PlayerFrame, SimEvent, SimExport, SimFrame};
pub use network::{NetworkMessage, RouterStats, SimNetwork, SimNetworkController, SimRouter};
pub use oracle::{Intent, PlayerOracle, SimPlayer};
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRunner, Trace};
pub use world::{LobbyOrchestrator, RoundObservation, SimConfig, SimPeer, SimWorld, WorldStats};
