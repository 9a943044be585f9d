//! Persistence worker.
//!
//! A tokio task that waits on the save queue and hands each request to the
//! repository. Failures are logged and never reach the simulation. On
//! shutdown the queue is drained so requests staged by the last ticks are
//! still written.

use std::sync::Arc;

use anyhow::Context;
use sim_shared::{
    queues::{PersistenceSave, SaveRequest, StagingQueues},
    services::PersistenceRepository,
};
use tokio::{sync::oneshot, task::JoinHandle};
use tracing::{debug, error, info};

pub struct PersistenceWorker {
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<usize>,
}

impl PersistenceWorker {
    /// Starts the worker on the current runtime.
    pub fn spawn(queues: Arc<StagingQueues>, repo: Arc<dyn PersistenceRepository>) -> Self {
        let (tx, mut rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let mut saved = 0usize;
            loop {
                tokio::select! {
                    request = queues.next::<PersistenceSave>() => {
                        if store(repo.as_ref(), request).await {
                            saved += 1;
                        }
                    }
                    _ = &mut rx => break,
                }
            }
            for request in queues.drain::<PersistenceSave>() {
                if store(repo.as_ref(), request).await {
                    saved += 1;
                }
            }
            info!(saved, "Persistence worker stopped");
            saved
        });
        Self {
            shutdown: Some(tx),
            handle,
        }
    }

    /// Stops the worker after flushing the queue. Returns how many saves succeeded.
    pub async fn shutdown(mut self) -> anyhow::Result<usize> {
        if let Some(tx) = self.shutdown.take() {
            // The task may already be gone; the join below reports that.
            let _ = tx.send(());
        }
        self.handle.await.context("persistence worker panicked")
    }
}

async fn store(repo: &dyn PersistenceRepository, request: SaveRequest) -> bool {
    let player = request.player_id;
    let tick = request.tick;
    match repo.save(request).await {
        Ok(()) => {
            debug!(?player, tick, "Saved");
            true
        }
        Err(e) => {
            error!(?player, tick, error = %e, "Save failed");
            false
        }
    }
}
