//! Periodic model sync.
//!
//! Each cycle pulls every collection incrementally into a copy of the
//! accumulated records, joins a detached copy of the result and publishes
//! it only when the join is correct and something changed.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use vpc_models::{ModelDiff, ModelSet, ModelSets, Resource};

use crate::apihelper::client::{ListQuery, ResourceLister};
use crate::error::AgentResult;

/// Receiving half of the snapshot hand-off.
pub type SnapshotReceiver = watch::Receiver<Option<Arc<ModelSets>>>;

/// Pulls every record of `R` changed since the set's watermark.
///
/// Stops on an empty page, a short page, or once the reported total is
/// reached. Returns the number of records applied.
pub async fn fetch_all<R: Resource>(
    lister: &dyn ResourceLister,
    set: &mut ModelSet<R>,
    batch_size: usize,
) -> AgentResult<usize> {
    let since = set.watermark();
    let mut offset = 0;
    loop {
        let query = ListQuery {
            offset,
            limit: batch_size,
            since,
        };
        let page = lister.list(R::KIND, &query).await?;
        let count = page.data.len();
        for value in &page.data {
            set.add_record(value)?;
        }
        offset += count;
        if count == 0 || count < batch_size || page.total.is_some_and(|t| offset >= t) {
            break;
        }
    }
    if offset > 0 {
        debug!(kind = R::KIND, fetched = offset, "Fetched records");
    }
    Ok(offset)
}

/// Result of one sync cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    /// A new snapshot was handed off.
    Published(ModelDiff),
    /// The join was correct but nothing changed.
    Unchanged,
    /// The join found unresolved references; nothing was published.
    Incorrect,
}

/// Owns the accumulated records and the published snapshot.
pub struct SyncEngine {
    lister: Arc<dyn ResourceLister>,
    batch_size: usize,
    interval: Duration,
    accumulated: ModelSets,
    published: Option<Arc<ModelSets>>,
    tx: watch::Sender<Option<Arc<ModelSets>>>,
}

impl SyncEngine {
    pub fn new(lister: Arc<dyn ResourceLister>, batch_size: usize, interval: Duration) -> Self {
        let (tx, _) = watch::channel(None);
        Self {
            lister,
            batch_size,
            interval,
            accumulated: ModelSets::new(),
            published: None,
            tx,
        }
    }

    /// New receiver for published snapshots.
    pub fn subscribe(&self) -> SnapshotReceiver {
        self.tx.subscribe()
    }

    /// The last published snapshot.
    pub fn published(&self) -> Option<Arc<ModelSets>> {
        self.published.clone()
    }

    /// Runs one fetch/join/publish cycle.
    ///
    /// On error or an incorrect join, the accumulated records and the
    /// published snapshot are left untouched so the next cycle retries from
    /// the same watermarks.
    #[instrument(skip_all)]
    pub async fn run_once(&mut self) -> AgentResult<SyncOutcome> {
        let mut next = self.accumulated.copy_detached();
        let lister = self.lister.as_ref();
        let batch = self.batch_size;

        // Owners before dependents.
        fetch_all(lister, &mut next.vpcs, batch).await?;
        fetch_all(lister, &mut next.route_tables, batch).await?;
        fetch_all(lister, &mut next.subnets, batch).await?;
        fetch_all(lister, &mut next.hosts, batch).await?;
        fetch_all(lister, &mut next.secgroups, batch).await?;
        fetch_all(lister, &mut next.secgroup_rules, batch).await?;
        fetch_all(lister, &mut next.instances, batch).await?;
        fetch_all(lister, &mut next.instance_secgroups, batch).await?;
        fetch_all(lister, &mut next.floating_ips, batch).await?;
        fetch_all(lister, &mut next.nics, batch).await?;
        fetch_all(lister, &mut next.dns_records, batch).await?;
        fetch_all(lister, &mut next.network_addresses, batch).await?;
        fetch_all(lister, &mut next.group_guests, batch).await?;
        fetch_all(lister, &mut next.group_networks, batch).await?;
        fetch_all(lister, &mut next.loadbalancer_acls, batch).await?;
        fetch_all(lister, &mut next.loadbalancer_networks, batch).await?;
        fetch_all(lister, &mut next.loadbalancer_listeners, batch).await?;

        let mut candidate = next.copy_detached();
        if !candidate.join(self.published.as_deref()) {
            warn!("Model graph has unresolved references, keeping previous snapshot");
            return Ok(SyncOutcome::Incorrect);
        }
        self.accumulated = next;

        let diff = match &self.published {
            Some(previous) => {
                let diff = candidate.diff(previous);
                if !diff.changed() {
                    debug!("Model graph unchanged");
                    return Ok(SyncOutcome::Unchanged);
                }
                diff
            }
            None => candidate.diff(&ModelSets::new()),
        };

        let total = diff.total();
        info!(
            records = candidate.len(),
            added = total.added,
            updated = total.updated,
            removed = total.removed,
            "Publishing model snapshot"
        );
        let snapshot = Arc::new(candidate);
        self.published = Some(snapshot.clone());
        self.tx.send_replace(Some(snapshot));
        Ok(SyncOutcome::Published(diff))
    }

    /// Runs cycles immediately and then every interval until cancelled.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_secs = self.interval.as_secs(), "Sync loop started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.run_once() => result,
            };
            if let Err(e) = result {
                warn!(error = %e, retryable = e.is_retryable(), "Sync cycle failed");
            }
        }
        info!("Sync loop stopped");
    }
}
