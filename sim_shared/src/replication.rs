//! Which components replicate, how, and as which packets.

use std::collections::HashMap;

use crate::{
    components::{InputState, Position, Vitals},
    ecs::Entity,
    error::ConfigError,
    net::{
        channels, PlayerInputMessage, Packet, TransformPacket, TransformSnapshot, VitalsPacket,
        VitalsSnapshot,
    },
    schedule::Side,
    sync::{ComponentSyncEngine, SyncPolicy, SyncTrigger, Synced},
};

impl Synced for Position {
    const NAME: &'static str = "position";

    fn packets(batch: Vec<(Entity, Self)>) -> Vec<Packet> {
        vec![Packet::Transform(TransformPacket {
            transforms: batch
                .into_iter()
                .map(|(entity, p)| TransformSnapshot {
                    entity,
                    position: p.0,
                })
                .collect(),
        })]
    }
}

impl Synced for Vitals {
    const NAME: &'static str = "vitals";

    fn packets(batch: Vec<(Entity, Self)>) -> Vec<Packet> {
        vec![Packet::Vitals(VitalsPacket {
            vitals: batch
                .into_iter()
                .map(|(entity, v)| vitals_snapshot(entity, &v))
                .collect(),
        })]
    }
}

impl Synced for InputState {
    const NAME: &'static str = "input_state";

    // Input is per controlled entity and carries its own sequence; no batching.
    fn packets(batch: Vec<(Entity, Self)>) -> Vec<Packet> {
        batch
            .into_iter()
            .map(|(_, input)| {
                Packet::PlayerInput(PlayerInputMessage {
                    movement: input.movement,
                    look: input.look,
                    flags: input.flags.bits(),
                    sequence: input.sequence,
                })
            })
            .collect()
    }
}

impl From<VitalsSnapshot> for Vitals {
    fn from(s: VitalsSnapshot) -> Self {
        Self {
            health: s.health,
            max_health: s.max_health,
            mana: s.mana,
            max_mana: s.max_mana,
        }
    }
}

pub fn vitals_snapshot(entity: Entity, v: &Vitals) -> VitalsSnapshot {
    VitalsSnapshot {
        entity,
        health: v.health,
        max_health: v.max_health,
        mana: v.mana,
        max_mana: v.max_mana,
    }
}

/// Settled positions are resent this often, since `transform` may drop packets.
pub const POSITION_KEYFRAME_TICKS: u32 = 30;

/// Registers the stock policy table, applying per-component rate overrides.
pub fn register_default_policies(
    sync: &mut ComponentSyncEngine,
    rate_overrides: &HashMap<String, u32>,
) -> Result<(), ConfigError> {
    let rate = |name: &str, default: u32| rate_overrides.get(name).copied().unwrap_or(default);

    sync.register::<Position>(
        SyncPolicy::new(Side::Server, SyncTrigger::OnChange, channels::TRANSFORM)
            .rate(rate(Position::NAME, 0))
            .keyframe(POSITION_KEYFRAME_TICKS),
    )?;
    sync.register::<Vitals>(
        SyncPolicy::new(Side::Server, SyncTrigger::OnChange, channels::VITALS)
            .rate(rate(Vitals::NAME, 3)),
    )?;
    sync.register::<InputState>(
        SyncPolicy::new(Side::Client, SyncTrigger::OnTick, channels::INPUT)
            .rate(rate(InputState::NAME, 0)),
    )?;
    Ok(())
}
