//! `sim_server`
//!
//! Server-side systems:
//! - Session lifecycle (login, map loaded, leave) driven by staging queues
//! - Client input drained from the inbound buffer with stale-sequence rejection
//! - Authoritative movement, combat, vitals, teleports, NPCs
//! - Persistence worker feeding a repository off the tick thread

pub mod gameplay;
pub mod persistence;
pub mod pipeline;
pub mod server;
pub mod session;

pub use persistence::PersistenceWorker;
pub use server::GameServer;
