//! Applies server packets to the client world.
//!
//! The client keeps its own entity handles. [`NetIndex`] maps each server
//! entity to the local one; every local despawn goes through it so a stale
//! server id never resolves.

use sim_shared::{
    components::{DisplayName, Facing, Npc, PlayerId, Position, Vitals},
    ecs::Entity,
    inbound::InboundBuffer,
    index::EntityIndex,
    math::Vec2,
    net::{AttackEvent, MapData, NpcState, Packet, PlayerState},
    schedule::TickContext,
};
use tracing::{debug, info};

use crate::interp::PositionHistory;

/// Server entity -> local entity.
pub type NetIndex = EntityIndex<Entity>;

/// Local entity of the character this client controls.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalPlayer(pub Option<Entity>);

/// What the server told us when we joined.
#[derive(Debug, Default, Clone)]
pub struct ServerSession {
    pub map: Option<MapData>,
    pub player_id: Option<PlayerId>,
    /// Our character's id on the server.
    pub server_entity: Option<Entity>,
}

/// Attacks received during the current tick, server ids.
#[derive(Debug, Default, Clone)]
pub struct RecentAttacks(pub Vec<AttackEvent>);

/// Local entity for a server entity, if known and alive.
pub fn resolve(ctx: &TickContext<'_>, server: Entity) -> Option<Entity> {
    ctx.resources.get::<NetIndex>()?.try_get(&*ctx.world, server)
}

pub fn apply_inbound(ctx: &mut TickContext<'_>) -> anyhow::Result<()> {
    let inbound = ctx.resources.expect::<InboundBuffer>()?.clone();
    ctx.resources.expect_mut::<RecentAttacks>()?.0.clear();

    for (_, envelope) in inbound.drain() {
        match envelope.packet {
            Packet::PlayerJoin(join) => {
                let local = upsert_player(ctx, &join.you)?;
                info!(map = %join.map.name, player = ?join.you.player_id, ?local, "Joined world");
                *ctx.resources.expect_mut::<ServerSession>()? = ServerSession {
                    map: Some(join.map),
                    player_id: Some(join.you.player_id),
                    server_entity: Some(join.you.entity),
                };
                ctx.resources.insert(LocalPlayer(Some(local)));
            }
            Packet::PlayerSpawn(spawn) => {
                for state in &spawn.players {
                    upsert_player(ctx, state)?;
                }
            }
            Packet::NpcSpawn(spawn) => {
                for state in &spawn.npcs {
                    upsert_npc(ctx, state)?;
                }
            }
            Packet::Transform(packet) => {
                for t in packet.transforms {
                    if let Some(local) = resolve(ctx, t.entity) {
                        ctx.world.insert(local, Position(t.position));
                        ctx.resources
                            .expect_mut::<PositionHistory>()?
                            .record(local, ctx.tick, t.position);
                    }
                }
            }
            Packet::Vitals(packet) => {
                for snapshot in packet.vitals {
                    if let Some(local) = resolve(ctx, snapshot.entity) {
                        ctx.world.insert(local, Vitals::from(snapshot));
                    }
                }
            }
            Packet::Teleport(t) => {
                if let Some(local) = resolve(ctx, t.entity) {
                    ctx.world.insert(local, Position(t.position));
                    ctx.world.insert(local, Facing(t.facing));
                    let history = ctx.resources.expect_mut::<PositionHistory>()?;
                    history.forget(local);
                    history.record(local, ctx.tick, t.position);
                }
            }
            Packet::Left(packet) => {
                for server in packet.entities {
                    remove(ctx, server)?;
                }
            }
            Packet::Attack(packet) => {
                ctx.resources
                    .expect_mut::<RecentAttacks>()?
                    .0
                    .extend(packet.attacks);
            }
            Packet::PlayerInput(_) => debug!("Ignoring input echoed by server"),
        }
    }
    Ok(())
}

fn spawn_or_resolve(ctx: &mut TickContext<'_>, server: Entity) -> anyhow::Result<Entity> {
    if let Some(local) = resolve(ctx, server) {
        return Ok(local);
    }
    let local = ctx.world.spawn();
    ctx.resources
        .expect_mut::<NetIndex>()?
        .register(&*ctx.world, local, server);
    debug!(?server, ?local, "Replicated entity spawned");
    Ok(local)
}

fn upsert_player(ctx: &mut TickContext<'_>, state: &PlayerState) -> anyhow::Result<Entity> {
    let local = spawn_or_resolve(ctx, state.entity)?;
    ctx.world.insert(local, state.player_id);
    ctx.world.insert(local, DisplayName(state.name.clone()));
    place(ctx, local, state.position, state.facing)?;
    ctx.world.insert(local, Vitals::from(state.vitals));
    Ok(local)
}

fn upsert_npc(ctx: &mut TickContext<'_>, state: &NpcState) -> anyhow::Result<Entity> {
    let local = spawn_or_resolve(ctx, state.entity)?;
    ctx.world.insert(local, Npc { kind: state.kind });
    place(ctx, local, state.position, state.facing)?;
    ctx.world.insert(local, Vitals::from(state.vitals));
    Ok(local)
}

fn place(ctx: &mut TickContext<'_>, local: Entity, position: Vec2, facing: Vec2) -> anyhow::Result<()> {
    ctx.world.insert(local, Position(position));
    ctx.world.insert(local, Facing(facing));
    ctx.resources
        .expect_mut::<PositionHistory>()?
        .record(local, ctx.tick, position);
    Ok(())
}

fn remove(ctx: &mut TickContext<'_>, server: Entity) -> anyhow::Result<()> {
    let Some(local) = resolve(ctx, server) else {
        return Ok(());
    };
    ctx.resources
        .expect_mut::<NetIndex>()?
        .unregister(&*ctx.world, local);
    ctx.resources.expect_mut::<PositionHistory>()?.forget(local);
    let player = ctx.resources.expect_mut::<LocalPlayer>()?;
    if player.0 == Some(local) {
        player.0 = None;
    }
    ctx.despawn(local);
    debug!(?server, ?local, "Replicated entity removed");
    Ok(())
}
