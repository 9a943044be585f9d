//! `sim_shared`
//!
//! Simulation core used by both client and server.
//!
//! Design goals:
//! - One tick thread owns the world; everything else hands work across
//!   through staging queues and the inbound buffer.
//! - Startup validates the whole configuration (systems, channels, sync
//!   policies) and fails fast.
//! - Traits at the collaborator seams (transport, collision, input,
//!   persistence).
//! - No `unsafe`.

pub mod channel;
pub mod components;
pub mod config;
pub mod ecs;
pub mod error;
pub mod inbound;
pub mod index;
pub mod math;
pub mod net;
pub mod queues;
pub mod replication;
pub mod resources;
pub mod schedule;
pub mod services;
pub mod sim;
pub mod sync;
pub mod transport;

pub mod prelude {
    //! Commonly used exports.

    pub use crate::channel::*;
    pub use crate::components::*;
    pub use crate::config::*;
    pub use crate::ecs::*;
    pub use crate::error::*;
    pub use crate::index::*;
    pub use crate::math::*;
    pub use crate::net::*;
    pub use crate::queues::*;
    pub use crate::schedule::*;
    pub use crate::sim::*;
    pub use crate::sync::*;
}
