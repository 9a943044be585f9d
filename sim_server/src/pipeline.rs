//! Server registration table.

use sim_shared::{
    schedule::{Stage, SystemMeta},
    sim::Simulation,
};

use crate::{gameplay, session};

/// Adds every server system to `sim`. Call before `build`.
pub fn register_server_systems(sim: &mut Simulation) {
    sim.add_system_fn(
        SystemMeta::new("handle_logins", Stage::Input).server_only(),
        session::handle_logins,
    )
    .add_system_fn(
        SystemMeta::new("drain_inbound", Stage::Input)
            .order(10)
            .server_only()
            .after("handle_logins"),
        session::drain_inbound,
    )
    .add_system_fn(
        SystemMeta::new("handle_map_loaded", Stage::Input)
            .order(20)
            .server_only()
            .after("handle_logins"),
        session::handle_map_loaded,
    )
    .add_system_fn(
        SystemMeta::new("handle_leaves", Stage::Input)
            .order(30)
            .server_only()
            .after("drain_inbound"),
        session::handle_leaves,
    )
    .add_system_fn(
        SystemMeta::new("apply_teleports", Stage::Logic).server_only(),
        gameplay::apply_teleports,
    )
    .add_system_fn(
        SystemMeta::new("combat", Stage::Logic)
            .order(10)
            .server_only()
            .after("drain_inbound"),
        gameplay::combat,
    )
    .add_system_fn(
        SystemMeta::new("npc_wander", Stage::Logic)
            .order(20)
            .server_only(),
        gameplay::npc_wander,
    )
    .add_system_fn(
        SystemMeta::new("vitals_regen", Stage::Logic)
            .order(30)
            .server_only()
            .after("combat"),
        gameplay::vitals_regen,
    )
    .add_system_fn(
        SystemMeta::new("movement", Stage::Physics)
            .server_only()
            .after("apply_teleports"),
        gameplay::movement,
    )
    .add_system_fn(
        SystemMeta::new("death_cleanup", Stage::Cleanup).server_only(),
        gameplay::death_cleanup,
    )
    .add_system_fn(
        SystemMeta::new("autosave", Stage::Cleanup)
            .order(10)
            .server_only()
            .after("death_cleanup"),
        gameplay::autosave,
    );
}

/// Execution order the server pipeline compiles to.
pub const SERVER_ORDER: [&str; 12] = [
    "handle_logins",
    "drain_inbound",
    "handle_map_loaded",
    "handle_leaves",
    "apply_teleports",
    "combat",
    "npc_wander",
    "vitals_regen",
    "movement",
    sim_shared::sim::SYNC_SYSTEM,
    "death_cleanup",
    "autosave",
];
