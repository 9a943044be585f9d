//! Connection lifecycle systems.
//!
//! Everything here runs in the input stage. Connection tasks never touch the
//! world; they enqueue [`LoginRequest`]s, map-loaded notices, and leave
//! requests, and push raw client packets into the [`InboundBuffer`].

use std::collections::BTreeSet;

use anyhow::Context;
use sim_shared::{
    components::{
        AttackCooldown, DisplayName, Facing, InputFlags, InputState, Npc, Owner, PlayerId,
        Position, Velocity, Vitals,
    },
    ecs::{Entity, World},
    inbound::{InboundBuffer, InputSequencer},
    index::{EntityIndex, PlayerIndex},
    math::Vec2,
    net::{
        channels, LeftPacket, MapData, NpcSpawnPacket, NpcState, Packet, PeerId, PlayerInputMessage,
        PlayerJoinPacket, PlayerSpawnPacket, PlayerState,
    },
    queues::{LoginRequest, MapLoaded, PlayerLeave, PlayerLogin},
    replication::vitals_snapshot,
    schedule::TickContext,
};
use tracing::{debug, info, warn};

/// Connected peer -> its character.
pub type PeerIndex = EntityIndex<PeerId>;

/// Peers that finished loading the map before their login was handled.
#[derive(Debug, Default)]
pub struct AwaitingLogin(pub BTreeSet<PeerId>);

pub const PLAYER_MAX_HEALTH: i32 = 100;
pub const PLAYER_MAX_MANA: i32 = 50;

/// The hosted map and where new characters appear.
#[derive(Debug, Clone)]
pub struct WorldMap {
    pub data: MapData,
    pub spawn: Vec2,
}

impl WorldMap {
    pub fn new(name: &str, width: u32, height: u32, spawn: Vec2) -> Self {
        Self {
            data: MapData {
                name: name.to_string(),
                width,
                height,
            },
            spawn,
        }
    }
}

pub fn player_state(world: &World, entity: Entity) -> Option<PlayerState> {
    Some(PlayerState {
        entity,
        player_id: *world.get::<PlayerId>(entity)?,
        name: world
            .get::<DisplayName>(entity)
            .map(|n| n.0.clone())
            .unwrap_or_default(),
        position: world.get::<Position>(entity)?.0,
        facing: world.get::<Facing>(entity).copied().unwrap_or_default().0,
        vitals: vitals_snapshot(entity, world.get::<Vitals>(entity)?),
    })
}

pub fn npc_state(world: &World, entity: Entity) -> Option<NpcState> {
    Some(NpcState {
        entity,
        kind: world.get::<Npc>(entity)?.kind,
        position: world.get::<Position>(entity)?.0,
        facing: world.get::<Facing>(entity).copied().unwrap_or_default().0,
        vitals: vitals_snapshot(entity, world.get::<Vitals>(entity)?),
    })
}

/// Character of a connected peer, if it has one.
pub fn peer_entity(ctx: &TickContext<'_>, peer: PeerId) -> Option<Entity> {
    ctx.resources
        .get::<PeerIndex>()?
        .try_get(&*ctx.world, peer)
}

/// Applies client packets received since the last tick.
pub fn drain_inbound(ctx: &mut TickContext<'_>) -> anyhow::Result<()> {
    let inbound = ctx.resources.expect::<InboundBuffer>()?.clone();
    for (peer, envelope) in inbound.drain() {
        match envelope.packet {
            Packet::PlayerInput(msg) => apply_input(ctx, peer, msg),
            other => debug!(?peer, packet = other.kind(), "Ignoring client packet"),
        }
    }
    Ok(())
}

fn apply_input(ctx: &mut TickContext<'_>, peer: PeerId, msg: PlayerInputMessage) {
    let Some(entity) = peer_entity(ctx, peer) else {
        debug!(?peer, seq = msg.sequence, "Input from peer without a character");
        return;
    };
    let accepted = ctx
        .resources
        .get_mut::<InputSequencer>()
        .map_or(true, |seq| seq.accept(peer, msg.sequence));
    if !accepted {
        return;
    }
    let look = msg.look.normalize_or_zero();
    ctx.world.insert(
        entity,
        InputState {
            movement: msg.movement.clamp_unit(),
            look,
            flags: InputFlags::from_bits_truncate(msg.flags),
            sequence: msg.sequence,
        },
    );
    if look != Vec2::ZERO {
        ctx.world.insert(entity, Facing(look));
    }
}

/// Spawns characters for new logins and announces them.
pub fn handle_logins(ctx: &mut TickContext<'_>) -> anyhow::Result<()> {
    for request in ctx.queues.drain::<PlayerLogin>() {
        login(ctx, request)?;
    }
    Ok(())
}

fn login(ctx: &mut TickContext<'_>, request: LoginRequest) -> anyhow::Result<()> {
    let map = ctx.resources.expect::<WorldMap>()?.clone();
    if let Some(existing) = ctx
        .resources
        .expect::<PlayerIndex>()?
        .try_get(&*ctx.world, request.player_id)
    {
        warn!(player = ?request.player_id, peer = ?request.peer, ?existing, "Player already online; login rejected");
        return Ok(());
    }
    if let Some(existing) = peer_entity(ctx, request.peer) {
        warn!(player = ?request.player_id, peer = ?request.peer, ?existing, "Peer already has a character; login rejected");
        return Ok(());
    }

    let entity = ctx.world.spawn();
    let position = request.position.unwrap_or(map.spawn);
    ctx.world.insert(entity, request.player_id);
    ctx.world.insert(entity, Owner(request.peer));
    ctx.world.insert(entity, DisplayName(request.name.clone()));
    ctx.world.insert(entity, Position(position));
    ctx.world.insert(entity, Velocity::default());
    ctx.world.insert(entity, Facing::default());
    ctx.world.insert(entity, Vitals::full(PLAYER_MAX_HEALTH, PLAYER_MAX_MANA));
    ctx.world.insert(entity, InputState::default());
    ctx.world.insert(entity, AttackCooldown::default());

    ctx.resources
        .expect_mut::<PlayerIndex>()?
        .register(&*ctx.world, entity, request.player_id);
    ctx.resources
        .expect_mut::<PeerIndex>()?
        .register(&*ctx.world, entity, request.peer);
    if let Some(seq) = ctx.resources.get_mut::<InputSequencer>() {
        seq.forget(request.peer);
    }
    ctx.channels.connect_peer(request.peer);

    let you = player_state(&*ctx.world, entity).context("state of freshly spawned player")?;
    let session = ctx.endpoint(channels::SESSION)?;
    session.send_to_one_reliable(
        request.peer,
        Packet::PlayerJoin(PlayerJoinPacket {
            map: map.data,
            you: you.clone(),
        }),
    );
    for peer in ctx.channels.peers() {
        if peer != request.peer {
            session.send_to_one_reliable(
                peer,
                Packet::PlayerSpawn(PlayerSpawnPacket {
                    players: vec![you.clone()],
                }),
            );
        }
    }
    info!(player = ?request.player_id, peer = ?request.peer, ?entity, name = %request.name, "Player joined");
    Ok(())
}

/// Sends the current population to peers that finished loading the map.
///
/// A notice can be drained before the same peer's login. Such peers wait in
/// [`AwaitingLogin`] and are served on the first tick they have a character.
pub fn handle_map_loaded(ctx: &mut TickContext<'_>) -> anyhow::Result<()> {
    let mut peers = std::mem::take(&mut ctx.resources.expect_mut::<AwaitingLogin>()?.0);
    peers.extend(ctx.queues.drain::<MapLoaded>().into_iter().map(|n| n.peer));
    if peers.is_empty() {
        return Ok(());
    }
    let session = ctx.endpoint(channels::SESSION)?;
    let mut waiting = BTreeSet::new();
    for peer in peers {
        let Some(own) = peer_entity(ctx, peer) else {
            debug!(?peer, "Map loaded before login; holding population");
            waiting.insert(peer);
            continue;
        };
        let world: &World = &*ctx.world;
        let players: Vec<PlayerState> = world
            .iter::<PlayerId>()
            .filter(|(e, _)| *e != own)
            .filter_map(|(e, _)| player_state(world, e))
            .collect();
        let npcs: Vec<NpcState> = world
            .iter::<Npc>()
            .filter_map(|(e, _)| npc_state(world, e))
            .collect();
        debug!(?peer, players = players.len(), npcs = npcs.len(), "Map loaded; sending population");
        if !players.is_empty() {
            session.send_to_one_reliable(peer, Packet::PlayerSpawn(PlayerSpawnPacket { players }));
        }
        if !npcs.is_empty() {
            session.send_to_one_reliable(peer, Packet::NpcSpawn(NpcSpawnPacket { npcs }));
        }
    }
    ctx.resources.expect_mut::<AwaitingLogin>()?.0 = waiting;
    Ok(())
}

/// Removes characters of departing peers and tells everyone else.
pub fn handle_leaves(ctx: &mut TickContext<'_>) -> anyhow::Result<()> {
    for request in ctx.queues.drain::<PlayerLeave>() {
        let entity = peer_entity(ctx, request.peer);
        ctx.channels.disconnect_peer(request.peer);
        if let Some(seq) = ctx.resources.get_mut::<InputSequencer>() {
            seq.forget(request.peer);
        }
        if let Some(awaiting) = ctx.resources.get_mut::<AwaitingLogin>() {
            awaiting.0.remove(&request.peer);
        }
        let Some(entity) = entity else {
            debug!(peer = ?request.peer, "Leave from peer without a character");
            continue;
        };
        if let Some(index) = ctx.resources.get_mut::<PeerIndex>() {
            index.unregister(&*ctx.world, entity);
        }
        ctx.despawn(entity);
        ctx.endpoint(channels::SESSION)?
            .send_to_all_reliable(Packet::Left(LeftPacket {
                entities: vec![entity],
            }));
        info!(peer = ?request.peer, ?entity, reason = %request.reason, "Player left");
    }
    Ok(())
}
