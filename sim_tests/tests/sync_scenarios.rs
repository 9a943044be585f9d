//! Replication behaviour of the stock policy table.

use std::{collections::HashMap, sync::Arc};

use sim_shared::{
    channel::ChannelDispatcher,
    components::{InputState, Position, Vitals},
    config::EngineConfig,
    ecs::World,
    math::Vec2,
    net::{Packet, PeerId, VitalsSnapshot},
    replication::{register_default_policies, POSITION_KEYFRAME_TICKS},
    schedule::Side,
    sync::ComponentSyncEngine,
    transport::LoopbackTransport,
};

fn engine(side: Side, overrides: &[(&str, u32)]) -> (Arc<LoopbackTransport>, ComponentSyncEngine) {
    let transport = Arc::new(LoopbackTransport::new());
    let channels = Arc::new(ChannelDispatcher::new(transport.clone()));
    for ch in &EngineConfig::for_role(side).channels {
        channels.create_or_get(&ch.to_channel()).unwrap();
    }
    channels.connect_peer(PeerId(1));
    let mut sync = ComponentSyncEngine::new(side, channels);
    let overrides: HashMap<String, u32> =
        overrides.iter().map(|(k, v)| (k.to_string(), *v)).collect();
    register_default_policies(&mut sync, &overrides).unwrap();
    (transport, sync)
}

fn vitals_sent(t: &LoopbackTransport) -> Vec<Vec<VitalsSnapshot>> {
    t.take_envelopes()
        .into_iter()
        .filter_map(|(_, _, env)| match env.packet {
            Packet::Vitals(p) => Some(p.vitals),
            _ => None,
        })
        .collect()
}

#[test]
fn consecutive_changes_each_send_once_with_latest_value() {
    let (t, mut sync) = engine(Side::Server, &[("vitals", 0)]);
    let mut world = World::default();
    let e = world.spawn();

    let v1 = Vitals::full(100, 10);
    world.insert(e, v1);
    sync.flush(&world, 10);
    let first = vitals_sent(&t);
    assert_eq!(first.len(), 1);
    assert_eq!(first[0][0].health, 100);

    let v2 = Vitals { health: 80, ..v1 };
    world.insert(e, v2);
    sync.flush(&world, 11);
    let second = vitals_sent(&t);
    assert_eq!(second.len(), 1, "exactly one packet for the tick-11 change");
    assert_eq!(second[0].len(), 1);
    assert_eq!(Vitals::from(second[0][0]), v2);
}

#[test]
fn stock_vitals_rate_holds_changes() {
    let (t, mut sync) = engine(Side::Server, &[]);
    let mut world = World::default();
    let e = world.spawn();
    world.insert(e, Vitals::full(100, 10));

    let mut sent_at = Vec::new();
    for tick in 0..10u64 {
        if let Some(v) = world.get_mut::<Vitals>(e) {
            v.health -= 1;
        }
        if sync.flush(&world, tick).sent > 0 {
            sent_at.push(tick);
        }
    }
    assert_eq!(sent_at, vec![0, 3, 6, 9]);
    // The held change is the latest one, not the one that was throttled first.
    let last = vitals_sent(&t).pop().unwrap();
    assert_eq!(last[0].health, 90);
}

#[test]
fn unchanged_position_is_not_resent() {
    let (t, mut sync) = engine(Side::Server, &[]);
    let mut world = World::default();
    let e = world.spawn();
    world.insert(e, Position(Vec2::new(1.0, 2.0)));

    let stats: Vec<_> = (0..3).map(|tick| sync.flush(&world, tick).sent).collect();
    assert_eq!(stats, vec![1, 0, 0]);
    let transforms = t
        .take_envelopes()
        .into_iter()
        .filter(|(_, _, env)| matches!(env.packet, Packet::Transform(_)))
        .count();
    assert_eq!(transforms, 1);
}

#[test]
fn settled_position_is_repaired_after_a_lost_update() {
    let (t, mut sync) = engine(Side::Server, &[]);
    let mut world = World::default();
    let e = world.spawn();
    world.insert(e, Position(Vec2::ZERO));
    sync.flush(&world, 0);

    // The last move before the entity stops never arrives.
    world.insert(e, Position(Vec2::new(3.0, 1.0)));
    sync.flush(&world, 1);
    t.take();

    let keyframe = u64::from(POSITION_KEYFRAME_TICKS);
    for tick in 2..=keyframe {
        assert_eq!(sync.flush(&world, tick).sent, 0, "tick {tick}");
    }
    assert_eq!(sync.flush(&world, keyframe + 1).sent, 1);
    let resent: Vec<Vec2> = t
        .take_envelopes()
        .into_iter()
        .filter_map(|(_, _, env)| match env.packet {
            Packet::Transform(p) => Some(p.transforms[0].position),
            _ => None,
        })
        .collect();
    assert_eq!(resent, vec![Vec2::new(3.0, 1.0)]);
}

#[test]
fn client_input_goes_out_every_tick_and_server_state_does_not() {
    let (t, mut sync) = engine(Side::Client, &[]);
    let mut world = World::default();
    let e = world.spawn();
    world.insert(e, InputState::default());
    world.insert(e, Position(Vec2::ZERO));
    world.insert(e, Vitals::full(10, 0));

    for tick in 0..3 {
        assert_eq!(sync.flush(&world, tick).sent, 1);
    }
    let kinds: Vec<_> = t
        .take_envelopes()
        .into_iter()
        .map(|(_, _, env)| env.packet.kind())
        .collect();
    assert_eq!(kinds.len(), 3);
    assert!(kinds.iter().all(|k| *k == "player_input"), "{kinds:?}");
}

#[test]
fn despawned_entity_stops_replicating() {
    let (t, mut sync) = engine(Side::Server, &[]);
    let mut world = World::default();
    let e = world.spawn();
    world.insert(e, Position(Vec2::ZERO));
    sync.flush(&world, 0);
    t.take();

    sync.forget(e);
    world.despawn(e);
    let reused = world.spawn();
    world.insert(reused, Position(Vec2::ZERO));
    // A reused slot comes back with a new generation and starts fresh.
    assert_eq!(sync.flush(&world, 1).sent, 1);
    assert_eq!(t.take().len(), 1);
}
