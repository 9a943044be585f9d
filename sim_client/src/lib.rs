//! `sim_client`
//!
//! Client-side systems:
//! - Replication apply for server packets, keyed by a server -> local index
//! - Per-tick input sampling sent through the input sync policy
//! - Position history for interpolation
//! - Prediction and smoothing extension points (no-op by default)

pub mod client;
pub mod input;
pub mod interp;
pub mod replicate;

pub use client::{ClientHooks, ClientState, GameClient};
