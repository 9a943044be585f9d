//! Save staging from the tick thread through the worker to a repository.

use std::sync::Arc;

use sim_server::{server::GameServer, session::WorldMap, PersistenceWorker};
use sim_shared::{
    components::{PlayerId, Position},
    config::EngineConfig,
    math::Vec2,
    net::PeerId,
    queues::{LoginRequest, PersistenceSave},
    services::{InMemoryRepository, OpenField},
    transport::LoopbackTransport,
};

fn server() -> GameServer {
    GameServer::new(
        EngineConfig::default(),
        Arc::new(LoopbackTransport::new()),
        Arc::new(OpenField),
        WorldMap::new("test", 16, 16, Vec2::new(0.5, 0.5)),
    )
    .unwrap()
}

fn login(server: &GameServer, peer: u32, player: u64, at: Vec2) {
    server.login(LoginRequest {
        peer: PeerId(peer),
        player_id: PlayerId(player),
        name: format!("p{player}"),
        position: Some(at),
    });
}

#[test]
fn leave_stages_last_state_before_the_index_forgets() {
    let mut server = server();
    login(&server, 1, 100, Vec2::new(3.0, 4.0));
    server.step().unwrap();
    let entity = server.player_entity(PlayerId(100)).unwrap();
    server
        .sim_mut()
        .world_mut()
        .insert(entity, Position(Vec2::new(5.0, 6.0)));

    server.leave(PeerId(1), "quit");
    let report = server.step().unwrap();
    assert!(report.is_clean());

    assert_eq!(server.player_entity(PlayerId(100)), None);
    let save = server.queues().try_dequeue::<PersistenceSave>().unwrap();
    assert_eq!(save.player_id, PlayerId(100));
    assert_eq!(save.position, Vec2::new(5.0, 6.0));
    assert!(save.vitals.is_some());
    assert!(server.queues().try_dequeue::<PersistenceSave>().is_none());
}

#[tokio::test]
async fn saves_reach_the_repository_in_staging_order() -> anyhow::Result<()> {
    let mut server = server();
    let repo = Arc::new(InMemoryRepository::new());
    let worker = PersistenceWorker::spawn(server.queues(), repo.clone());

    login(&server, 1, 100, Vec2::new(1.0, 1.0));
    login(&server, 2, 200, Vec2::new(2.0, 2.0));
    server.step()?;
    server.leave(PeerId(2), "quit");
    server.step()?;
    assert_eq!(server.save_all(), 1);

    assert_eq!(worker.shutdown().await?, 2);
    assert_eq!(repo.history(), vec![PlayerId(200), PlayerId(100)]);
    assert_eq!(
        repo.latest(PlayerId(200)).map(|s| s.position),
        Some(Vec2::new(2.0, 2.0))
    );
    Ok(())
}

#[test]
fn autosave_stages_every_online_player_on_schedule() {
    let mut cfg = EngineConfig::default();
    cfg.autosave_ticks = 5;
    let mut server = GameServer::new(
        cfg,
        Arc::new(LoopbackTransport::new()),
        Arc::new(OpenField),
        WorldMap::new("test", 16, 16, Vec2::new(0.5, 0.5)),
    )
    .unwrap();
    login(&server, 1, 100, Vec2::ZERO);
    login(&server, 2, 200, Vec2::ZERO);
    for _ in 0..10 {
        server.step().unwrap();
    }
    let staged = server.queues().drain::<PersistenceSave>();
    assert!(!staged.is_empty());
    assert_eq!(staged.len() % 2, 0, "both players are saved together");
}
