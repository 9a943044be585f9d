//! Gameplay components shared by server and client worlds.

use serde::{Deserialize, Serialize};

use crate::{math::Vec2, net::PeerId};

/// Stable domain identifier of a player character (persistence key).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PlayerId(pub u64);

/// Connection that controls this entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Owner(pub PeerId);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayName(pub String);

/// Non-player character archetype.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Npc {
    pub kind: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Position(pub Vec2);

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Velocity(pub Vec2);

/// Unit look direction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Facing(pub Vec2);

impl Default for Facing {
    fn default() -> Self {
        Self(Vec2::new(0.0, 1.0))
    }
}

/// Health/mana pool.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Vitals {
    pub health: i32,
    pub max_health: i32,
    pub mana: i32,
    pub max_mana: i32,
}

impl Vitals {
    pub fn full(max_health: i32, max_mana: i32) -> Self {
        Self {
            health: max_health,
            max_health,
            mana: max_mana,
            max_mana,
        }
    }

    pub fn is_dead(&self) -> bool {
        self.health <= 0
    }
}

bitflags::bitflags! {
    /// Buttons held during an input sample.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct InputFlags: u8 {
        const ATTACK = 1 << 0;
        const INTERACT = 1 << 1;
        const SPRINT = 1 << 2;
    }
}

/// Latest input applied to a controlled entity.
///
/// Client-authoritative: written by the client's sampling system and synced
/// upstream; the server writes its own copy only after sequence validation.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct InputState {
    pub movement: Vec2,
    pub look: Vec2,
    pub flags: InputFlags,
    pub sequence: u32,
}

/// Ticks until the entity may attack again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AttackCooldown(pub u32);
