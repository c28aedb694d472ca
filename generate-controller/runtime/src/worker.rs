use crate::{
    queue::WorkQueue,
    sync::{Syncer, UpdateRequests},
};
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info_span, Instrument};

/// The number of times a key is requeued after failing to sync before it is
/// dropped.
pub const MAX_REQUEUES: u32 = 10;

/// Syncs keys from the queue until it is shut down.
///
/// Keys popped while this replica does not hold the lease are dropped; they
/// are queued again when the lease is acquired.
pub async fn run(queue: Arc<WorkQueue>, syncer: Arc<Syncer>, is_leader: impl Fn() -> bool) {
    while let Some(key) = queue.next().await {
        if !is_leader() {
            tracing::trace!(%key, "Not the leader; dropping");
            queue.forget(&key);
            queue.done(&key);
            continue;
        }

        let result = syncer
            .sync(&key)
            .instrument(info_span!("sync", ur = %key))
            .await;
        handle_result(&queue, &syncer, &key, result);
        queue.done(&key);
    }
    tracing::debug!("Queue shut down");
}

fn handle_result(queue: &Arc<WorkQueue>, syncer: &Syncer, key: &str, result: Result<()>) {
    let error = match result {
        Ok(()) => {
            queue.forget(key);
            return;
        }
        Err(error) => error,
    };

    let requeues = queue.num_requeues(key);
    if requeues < MAX_REQUEUES {
        tracing::warn!(%key, requeues, %error, "Failed to sync update request");
        syncer.metrics().requeued();
        queue.add_rate_limited(key);
    } else {
        tracing::error!(%key, %error, "Dropping update request after repeated failures");
        syncer.metrics().dropped();
        queue.forget(key);
    }
}

/// Queues every known update request each time this replica becomes the
/// lease holder.
pub async fn requeue_on_claim(
    mut claims: watch::Receiver<Arc<kubert::lease::Claim>>,
    hostname: String,
    requests: Arc<dyn UpdateRequests>,
    queue: Arc<WorkQueue>,
) {
    let mut leading = false;
    loop {
        let current = claims.borrow_and_update().is_current_for(&hostname);
        if current && !leading {
            let names = requests.names();
            tracing::info!(requests = names.len(), "Acquired lease");
            for name in names {
                queue.add(name);
            }
        } else if !current && leading {
            tracing::info!("Lost lease");
        }
        leading = current;

        if claims.changed().await.is_err() {
            return;
        }
    }
}
