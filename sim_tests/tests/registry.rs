//! Channel endpoints, staging queues, and the entity index seen from outside.

use std::sync::Arc;

use sim_shared::{
    channel::ChannelDispatcher,
    components::PlayerId,
    ecs::World,
    error::ConfigError,
    index::PlayerIndex,
    net::{Delivery, NetworkChannel},
    queues::{OverflowPolicy, StagingQueue, StagingQueues},
    transport::LoopbackTransport,
};

struct Names;

impl StagingQueue for Names {
    type Item = &'static str;
    const NAME: &'static str = "names";
}

struct Other;

impl StagingQueue for Other {
    type Item = &'static str;
    const NAME: &'static str = "other";
}

#[test]
fn create_or_get_returns_the_same_endpoint() {
    let dispatcher = ChannelDispatcher::new(Arc::new(LoopbackTransport::new()));
    let first = dispatcher
        .create_or_get(&NetworkChannel::reliable("chat"))
        .unwrap();
    let second = dispatcher
        .create_or_get(&NetworkChannel::reliable("chat"))
        .unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(dispatcher.channel_count(), 1);

    match dispatcher.create_or_get(&NetworkChannel::unreliable("chat")) {
        Err(ConfigError::ChannelModeConflict {
            existing, requested, ..
        }) => {
            assert_eq!(existing, Delivery::Reliable);
            assert_eq!(requested, Delivery::Unreliable);
        }
        other => panic!("expected a mode conflict, got {:?}", other.map(|e| e.id().clone())),
    }
}

#[test]
fn queues_are_fifo_per_name() {
    let queues = StagingQueues::unbounded();
    for item in ["a", "b", "c"] {
        queues.enqueue::<Names>(item);
    }
    queues.enqueue::<Other>("x");

    let got: Vec<_> = (0..3).filter_map(|_| queues.try_dequeue::<Names>()).collect();
    assert_eq!(got, vec!["a", "b", "c"]);
    assert_eq!(queues.try_dequeue::<Names>(), None);
    assert_eq!(queues.drain::<Other>(), vec!["x"]);
}

#[test]
fn bounded_queue_applies_overflow_policy() {
    let oldest = StagingQueues::new(2, OverflowPolicy::DropOldest);
    let newest = StagingQueues::new(2, OverflowPolicy::DropNewest);
    for item in ["a", "b", "c"] {
        oldest.enqueue::<Names>(item);
        newest.enqueue::<Names>(item);
    }
    assert_eq!(oldest.drain::<Names>(), vec!["b", "c"]);
    assert_eq!(newest.drain::<Names>(), vec!["a", "b"]);
    assert_eq!(oldest.dropped::<Names>(), 1);
    assert_eq!(newest.dropped::<Names>(), 1);
}

#[tokio::test]
async fn next_waits_for_an_item() {
    let queues = Arc::new(StagingQueues::unbounded());
    let waiter = tokio::spawn({
        let queues = queues.clone();
        async move { queues.next::<Names>().await }
    });
    tokio::task::yield_now().await;
    queues.enqueue::<Names>("late");
    assert_eq!(waiter.await.unwrap(), "late");
}

#[test]
fn index_never_resolves_dead_or_unregistered_entities() {
    let mut world = World::default();
    let mut index = PlayerIndex::new();

    let e = world.spawn();
    assert!(index.register(&world, e, PlayerId(1)));
    index.unregister(&world, e);
    assert_eq!(index.try_get(&world, PlayerId(1)), None);

    let dead = world.spawn();
    world.despawn(dead);
    assert!(!index.register(&world, dead, PlayerId(2)));
    assert_eq!(index.try_get(&world, PlayerId(2)), None);

    let live = world.spawn();
    index.register(&world, live, PlayerId(3));
    world.despawn(live);
    assert_eq!(index.try_get(&world, PlayerId(3)), None);
}
