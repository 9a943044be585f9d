//! Authoritative gameplay systems.

use std::{any::TypeId, sync::Arc};

use rand::{rngs::StdRng, Rng};
use sim_shared::{
    components::{
        AttackCooldown, Facing, InputFlags, InputState, Npc, PlayerId, Position, Velocity, Vitals,
    },
    ecs::{Entity, World},
    math::Vec2,
    net::{channels, AttackEvent, AttackPacket, LeftPacket, Packet, TeleportMessage},
    queues::{PersistenceSave, SaveRequest, Teleports},
    schedule::TickContext,
    services::CollisionService,
};
use tracing::{debug, info, trace};

use crate::session::WorldMap;

pub const PLAYER_SPEED: f32 = 4.0;
pub const SPRINT_FACTOR: f32 = 1.5;
pub const NPC_SPEED: f32 = 1.5;
pub const ATTACK_RANGE: f32 = 1.5;
pub const ATTACK_DAMAGE: i32 = 10;
pub const ATTACK_COOLDOWN_TICKS: u32 = 10;
pub const REGEN_INTERVAL_TICKS: u64 = 30;
pub const NPC_WANDER_INTERVAL_TICKS: u64 = 45;

/// Collision service consulted by movement.
pub struct Collision(pub Arc<dyn CollisionService>);

/// Seeded randomness for NPC behaviour.
pub struct NpcRng(pub StdRng);

/// Ticks between periodic saves; 0 disables.
#[derive(Debug, Clone, Copy)]
pub struct Autosave {
    pub every_ticks: u64,
}

/// Applies queued teleports and tells every client.
pub fn apply_teleports(ctx: &mut TickContext<'_>) -> anyhow::Result<()> {
    let requests = ctx.queues.drain::<Teleports>();
    if requests.is_empty() {
        return Ok(());
    }
    let session = ctx.endpoint(channels::SESSION)?;
    for req in requests {
        if !ctx.world.is_alive(req.entity) {
            debug!(entity = ?req.entity, "Teleport target gone");
            continue;
        }
        ctx.world.insert(req.entity, Position(req.position));
        ctx.world.insert(req.entity, Facing(req.facing));
        ctx.world.insert(req.entity, Velocity::default());
        session.send_to_all_reliable(Packet::Teleport(TeleportMessage {
            entity: req.entity,
            position: req.position,
            facing: req.facing,
        }));
    }
    Ok(())
}

/// Resolves attacks from entities holding the attack button.
pub fn combat(ctx: &mut TickContext<'_>) -> anyhow::Result<()> {
    for (_, cooldown) in ctx.world.iter_mut::<AttackCooldown>() {
        cooldown.0 = cooldown.0.saturating_sub(1);
    }

    let attackers: Vec<Entity> = ctx
        .world
        .iter::<InputState>()
        .filter(|(_, input)| input.flags.contains(InputFlags::ATTACK))
        .map(|(e, _)| e)
        .collect();

    let mut events = Vec::new();
    for attacker in attackers {
        if ctx
            .world
            .get::<AttackCooldown>(attacker)
            .is_some_and(|c| c.0 > 0)
        {
            continue;
        }
        let Some(origin) = ctx.world.get::<Position>(attacker).map(|p| p.0) else {
            continue;
        };
        let facing = ctx.world.get::<Facing>(attacker).copied().unwrap_or_default().0;
        let target = nearest_target(&*ctx.world, attacker, origin);
        if let Some(vitals) = target.and_then(|t| ctx.world.get_mut::<Vitals>(t)) {
            vitals.health = (vitals.health - ATTACK_DAMAGE).max(0);
        }
        ctx.world.insert(attacker, AttackCooldown(ATTACK_COOLDOWN_TICKS));
        events.push(AttackEvent {
            attacker,
            target,
            damage: if target.is_some() { ATTACK_DAMAGE } else { 0 },
            facing,
        });
    }

    if !events.is_empty() {
        trace!(tick = ctx.tick, attacks = events.len(), "Attacks resolved");
        ctx.endpoint(channels::COMBAT)?
            .send_to_all_reliable(Packet::Attack(AttackPacket { attacks: events }));
    }
    Ok(())
}

fn nearest_target(world: &World, attacker: Entity, origin: Vec2) -> Option<Entity> {
    world
        .entities_with(&[TypeId::of::<Vitals>(), TypeId::of::<Position>()])
        .into_iter()
        .filter(|e| *e != attacker && world.get::<Vitals>(*e).is_some_and(|v| !v.is_dead()))
        .filter_map(|e| {
            world
                .get::<Position>(e)
                .map(|p| (e, p.0.sub(origin).len_sq()))
        })
        .filter(|(_, d)| *d <= ATTACK_RANGE * ATTACK_RANGE)
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(e, _)| e)
}

/// Picks a new heading for every NPC at a fixed interval.
pub fn npc_wander(ctx: &mut TickContext<'_>) -> anyhow::Result<()> {
    if ctx.tick % NPC_WANDER_INTERVAL_TICKS != 0 {
        return Ok(());
    }
    let npcs: Vec<Entity> = ctx.world.iter::<Npc>().map(|(e, _)| e).collect();
    let rng = &mut ctx.resources.expect_mut::<NpcRng>()?.0;
    for npc in npcs {
        let heading = if rng.gen_bool(0.25) {
            Vec2::ZERO
        } else {
            let angle: f32 = rng.gen_range(0.0..std::f32::consts::TAU);
            Vec2::new(angle.cos(), angle.sin())
        };
        ctx.world.insert(npc, Velocity(heading.scale(NPC_SPEED)));
        if heading != Vec2::ZERO {
            ctx.world.insert(npc, Facing(heading));
        }
    }
    Ok(())
}

pub fn vitals_regen(ctx: &mut TickContext<'_>) -> anyhow::Result<()> {
    if ctx.tick == 0 || ctx.tick % REGEN_INTERVAL_TICKS != 0 {
        return Ok(());
    }
    for (_, vitals) in ctx.world.iter_mut::<Vitals>() {
        if vitals.is_dead() {
            continue;
        }
        vitals.health = (vitals.health + 1).min(vitals.max_health);
        vitals.mana = (vitals.mana + 1).min(vitals.max_mana);
    }
    Ok(())
}

/// Integrates input or velocity, refusing steps into blocked cells.
pub fn movement(ctx: &mut TickContext<'_>) -> anyhow::Result<()> {
    let collision = ctx.resources.expect::<Collision>()?.0.clone();
    let movers = ctx
        .world
        .entities_with(&[TypeId::of::<Position>(), TypeId::of::<Velocity>()]);
    for entity in movers {
        let velocity = match ctx.world.get::<InputState>(entity) {
            Some(input) => {
                let speed = if input.flags.contains(InputFlags::SPRINT) {
                    PLAYER_SPEED * SPRINT_FACTOR
                } else {
                    PLAYER_SPEED
                };
                input.movement.clamp_unit().scale(speed)
            }
            None => ctx
                .world
                .get::<Velocity>(entity)
                .map(|v| v.0)
                .unwrap_or_default(),
        };
        if velocity == Vec2::ZERO {
            continue;
        }
        let Some(from) = ctx.world.get::<Position>(entity).map(|p| p.0) else {
            continue;
        };
        let to = from.add(velocity.scale(ctx.dt));
        if to.cell() != from.cell() && !collision.can_enter_cell(entity, to.cell()) {
            trace!(?entity, cell = ?to.cell(), "Move blocked");
            continue;
        }
        ctx.world.insert(entity, Position(to));
    }
    Ok(())
}

/// Respawns dead players at the map spawn and removes dead NPCs.
pub fn death_cleanup(ctx: &mut TickContext<'_>) -> anyhow::Result<()> {
    let dead: Vec<Entity> = ctx
        .world
        .iter::<Vitals>()
        .filter(|(_, v)| v.is_dead())
        .map(|(e, _)| e)
        .collect();
    if dead.is_empty() {
        return Ok(());
    }
    let spawn = ctx.resources.expect::<WorldMap>()?.spawn;
    let session = ctx.endpoint(channels::SESSION)?;
    let mut left = Vec::new();
    for entity in dead {
        if ctx.world.has::<PlayerId>(entity) {
            let facing = Facing::default();
            if let Some(vitals) = ctx.world.get_mut::<Vitals>(entity) {
                *vitals = Vitals::full(vitals.max_health, vitals.max_mana);
            }
            ctx.world.insert(entity, Position(spawn));
            ctx.world.insert(entity, facing);
            session.send_to_all_reliable(Packet::Teleport(TeleportMessage {
                entity,
                position: spawn,
                facing: facing.0,
            }));
            info!(?entity, "Player died; respawned");
        } else if ctx.despawn(entity) {
            left.push(entity);
        }
    }
    if !left.is_empty() {
        session.send_to_all_reliable(Packet::Left(LeftPacket { entities: left }));
    }
    Ok(())
}

/// Stages a save for every online player character. Returns how many.
pub fn stage_saves(ctx: &TickContext<'_>) -> usize {
    let world: &World = &*ctx.world;
    let mut staged = 0;
    for (entity, _) in world.iter::<PlayerId>() {
        if let Some(save) = SaveRequest::capture(world, entity, ctx.tick) {
            ctx.queues.enqueue::<PersistenceSave>(save);
            staged += 1;
        }
    }
    staged
}

pub fn autosave(ctx: &mut TickContext<'_>) -> anyhow::Result<()> {
    let every = ctx
        .resources
        .get::<Autosave>()
        .map_or(0, |a| a.every_ticks);
    if every == 0 || ctx.tick == 0 || ctx.tick % every != 0 {
        return Ok(());
    }
    let staged = stage_saves(ctx);
    debug!(tick = ctx.tick, staged, "Autosave staged");
    Ok(())
}
