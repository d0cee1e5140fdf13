//! Roundkeeper Environment Abstraction Layer
//!
//! This crate provides the "Sans-IO" abstraction allowing the round host
//! to run in both **Production** (tokio) and **Simulation** (virtual clock)
//! environments.
//!
//! # Core Concept: The Reactor Pattern
//!
//! The host never touches a clock or a socket directly. Everything that
//! would introduce non-determinism goes through this crate:
//! - Time (`now()`, `sleep()`)
//! - Network (`send()`, `recv()`, `broadcast()`)
//! - Task spawning (`spawn()`)
//!
//! Round timers, revive delays and cue holds are all measured against
//! `SessionContext::now()`, so a simulation can fast-forward a 300 second
//! countdown in microseconds.
//!
//! # Example
//!
//! ```ignore
//! use roundkeeper_env::{SessionContext, NetworkTransport};
//!
//! async fn host_loop<Ctx: SessionContext, Net: NetworkTransport>(
//!     ctx: &Ctx,
//!     net: &Net,
//! ) {
//!     loop {
//!         tokio::select! {
//!             packet = net.recv() => handle_packet(packet),
//!             _ = ctx.sleep(Duration::from_millis(33)) => tick(),
//!         }
//!     }
//! }
//! ```

mod context;
mod network;
mod types;
mod error;
mod tokio_impl;

pub use context::SessionContext;
pub use network::{NetworkTransport, NetworkController};
pub use types::{PeerId, PacketEnvelope};
pub use error::EnvError;
pub use tokio_impl::TokioContext;
