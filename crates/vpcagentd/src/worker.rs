//! Reconcile loop.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vpc_models::ModelSets;
use vpc_ovnutil::NbDatabase;

use crate::apihelper::SnapshotReceiver;
use crate::error::{AgentError, AgentResult};
use crate::keeper::{self, KeeperStats};

/// Reconciles the northbound database against each published snapshot,
/// and again on a fixed re-check interval.
pub struct Reconciler {
    db: Arc<dyn NbDatabase>,
    snapshots: SnapshotReceiver,
    resync: Duration,
}

impl Reconciler {
    pub fn new(db: Arc<dyn NbDatabase>, snapshots: SnapshotReceiver, resync: Duration) -> Self {
        Self {
            db,
            snapshots,
            resync,
        }
    }

    /// Runs until cancelled or the snapshot source goes away.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut recheck = interval_at(Instant::now() + self.resync, self.resync);
        recheck.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(resync_secs = self.resync.as_secs(), "Reconcile loop started");

        loop {
            let trigger = tokio::select! {
                _ = cancel.cancelled() => break,
                changed = self.snapshots.changed() => {
                    if changed.is_err() {
                        info!("Snapshot source closed");
                        break;
                    }
                    "snapshot"
                }
                _ = recheck.tick() => "recheck",
            };

            let Some(sets) = self.snapshots.borrow_and_update().clone() else {
                debug!(trigger, "No snapshot published yet");
                continue;
            };

            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                result = run_pass(self.db.clone(), sets) => result,
            };
            match result {
                Ok(stats) => debug!(trigger, ?stats, "Reconcile pass complete"),
                Err(e) => warn!(
                    trigger,
                    error = %e,
                    retryable = e.is_retryable(),
                    "Reconcile pass failed"
                ),
            }
        }
        info!("Reconcile loop stopped");
    }
}

/// Runs one keeper pass on its own task so that a panic anywhere inside it
/// surfaces as [`AgentError::Panicked`].
pub async fn run_pass(db: Arc<dyn NbDatabase>, sets: Arc<ModelSets>) -> AgentResult<KeeperStats> {
    let handle = tokio::spawn(async move { keeper::reconcile(db, &sets).await });
    match handle.await {
        Ok(result) => result,
        Err(e) if e.is_panic() => {
            let payload = e.into_panic();
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            Err(AgentError::Panicked { message })
        }
        Err(e) => Err(AgentError::internal(format!("reconcile task failed: {}", e))),
    }
}
