//! Packet schema and codec.
//!
//! Every outbound message is an [`Envelope`]: routing metadata plus one typed
//! [`Packet`]. Serialization is JSON into [`Bytes`]; the byte layout is not a
//! contract, the logical schema is. Sockets live outside this crate.

use std::fmt;

use anyhow::{ensure, Context};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{components::PlayerId, ecs::Entity, math::Vec2};

/// Protocol version stamped on every envelope.
pub const PROTOCOL_VERSION: u32 = 3;

/// Well-known channel names.
pub mod channels {
    /// Join/spawn/leave/teleport events.
    pub const SESSION: &str = "session";
    /// Continuous position updates.
    pub const TRANSFORM: &str = "transform";
    /// Health/mana snapshots.
    pub const VITALS: &str = "vitals";
    /// One-shot combat events.
    pub const COMBAT: &str = "combat";
    /// Client input stream.
    pub const INPUT: &str = "input";
}

/// Identifies a connected peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub u32);

/// Logical channel identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelId(pub String);

impl ChannelId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Delivery guarantee of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Delivery {
    /// Ordered per peer, retransmitted, no loss.
    Reliable,
    /// Best effort; may drop or reorder.
    Unreliable,
}

/// A channel identifier bound to its delivery mode.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NetworkChannel {
    pub id: ChannelId,
    pub delivery: Delivery,
}

impl NetworkChannel {
    pub fn reliable(name: impl Into<String>) -> Self {
        Self {
            id: ChannelId::new(name),
            delivery: Delivery::Reliable,
        }
    }

    pub fn unreliable(name: impl Into<String>) -> Self {
        Self {
            id: ChannelId::new(name),
            delivery: Delivery::Unreliable,
        }
    }
}

/// Routing target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Target {
    Broadcast,
    Peer(PeerId),
}

/// Versioned, routed packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub version: u32,
    pub channel: ChannelId,
    pub target: Target,
    /// Per-(channel, peer) sequence on reliable channels.
    pub seq: Option<u32>,
    pub packet: Packet,
}

/// Packet families.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Packet {
    PlayerInput(PlayerInputMessage),
    Attack(AttackPacket),
    Vitals(VitalsPacket),
    PlayerJoin(PlayerJoinPacket),
    PlayerSpawn(PlayerSpawnPacket),
    NpcSpawn(NpcSpawnPacket),
    Left(LeftPacket),
    Teleport(TeleportMessage),
    Transform(TransformPacket),
}

impl Packet {
    /// Short family name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Packet::PlayerInput(_) => "player_input",
            Packet::Attack(_) => "attack",
            Packet::Vitals(_) => "vitals",
            Packet::PlayerJoin(_) => "player_join",
            Packet::PlayerSpawn(_) => "player_spawn",
            Packet::NpcSpawn(_) => "npc_spawn",
            Packet::Left(_) => "left",
            Packet::Teleport(_) => "teleport",
            Packet::Transform(_) => "transform",
        }
    }
}

/// Client -> server: one input sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlayerInputMessage {
    pub movement: Vec2,
    pub look: Vec2,
    /// [`crate::components::InputFlags`] bits.
    pub flags: u8,
    /// Monotonic per peer.
    pub sequence: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AttackEvent {
    pub attacker: Entity,
    pub target: Option<Entity>,
    pub damage: i32,
    pub facing: Vec2,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttackPacket {
    pub attacks: Vec<AttackEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VitalsSnapshot {
    pub entity: Entity,
    pub health: i32,
    pub max_health: i32,
    pub mana: i32,
    pub max_mana: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VitalsPacket {
    pub vitals: Vec<VitalsSnapshot>,
}

/// Map description handed to a joining client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapData {
    pub name: String,
    pub width: u32,
    pub height: u32,
}

/// Full state of one player character.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerState {
    pub entity: Entity,
    pub player_id: PlayerId,
    pub name: String,
    pub position: Vec2,
    pub facing: Vec2,
    pub vitals: VitalsSnapshot,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NpcState {
    pub entity: Entity,
    pub kind: u16,
    pub position: Vec2,
    pub facing: Vec2,
    pub vitals: VitalsSnapshot,
}

/// Server -> joining client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerJoinPacket {
    pub map: MapData,
    pub you: PlayerState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerSpawnPacket {
    pub players: Vec<PlayerState>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NpcSpawnPacket {
    pub npcs: Vec<NpcState>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeftPacket {
    pub entities: Vec<Entity>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TeleportMessage {
    pub entity: Entity,
    pub position: Vec2,
    pub facing: Vec2,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TransformSnapshot {
    pub entity: Entity,
    pub position: Vec2,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformPacket {
    pub transforms: Vec<TransformSnapshot>,
}

pub fn encode_to_bytes(env: &Envelope) -> anyhow::Result<Bytes> {
    let payload = serde_json::to_vec(env).context("serialize envelope")?;
    Ok(Bytes::from(payload))
}

pub fn decode_from_bytes(b: &[u8]) -> anyhow::Result<Envelope> {
    let env: Envelope = serde_json::from_slice(b).context("deserialize envelope")?;
    ensure!(
        env.version == PROTOCOL_VERSION,
        "protocol mismatch: got {}, expected {}",
        env.version,
        PROTOCOL_VERSION
    );
    Ok(env)
}
