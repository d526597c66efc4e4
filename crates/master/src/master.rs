use std::sync::Arc;

use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

use orchestrator::{Orchestrator, OrchestratorError};
use store::backoff::Backoff;
use store::{lease, Collection, Event, Store, StoreError};

use crate::pipeline::{synthesize_legacy_input, PipelineRecord};

pub const PIPELINES_PREFIX: &str = "pipelines";

const MASTER_LEASE: &str = "pipeline-master";

#[derive(Error, Debug)]
pub enum MasterError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
}

/// Singleton reconciler for pipeline worker controllers.
///
/// `run` acquires the master lease, then consumes a watch of non-stopped
/// pipeline records: each `Put` upserts the pipeline's worker controller and
/// each `Delete` removes it. Both operations are idempotent, so replaying
/// events after a reconnect converges on the same state. Any watch failure
/// surrenders the lease and starts over with backoff, letting another
/// replica take the lease in the meantime.
pub struct PipelineMaster {
    store: Store,
    pipelines: Collection<PipelineRecord>,
    orchestrator: Arc<dyn Orchestrator>,
    lease_ttl_secs: u64,
}

impl PipelineMaster {
    pub fn new(
        store: Store,
        root_prefix: &str,
        orchestrator: Arc<dyn Orchestrator>,
        lease_ttl_secs: u64,
    ) -> Self {
        let pipelines = Collection::new(&store, format!("{root_prefix}/{PIPELINES_PREFIX}"));
        PipelineMaster {
            store,
            pipelines,
            orchestrator,
            lease_ttl_secs,
        }
    }

    /// Run until `shutdown` flips to true. Safe to run on every replica; the
    /// lease arbitrates which one does the work.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = Backoff::new();
        loop {
            if *shutdown.borrow() {
                return;
            }
            let held = tokio::select! {
                held = lease::acquire(&self.store, MASTER_LEASE, self.lease_ttl_secs) => match held {
                    Ok(held) => held,
                    Err(err) => {
                        let delay = backoff.next_delay();
                        warn!(error = %err, ?delay, "failed to acquire master lease, retrying");
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                },
                _ = shutdown.changed() => return,
            };
            info!("acquired the pipeline master lease");

            let result = tokio::select! {
                result = self.reconcile() => result,
                _ = shutdown.changed() => Ok(()),
            };
            held.release().await;

            match result {
                Ok(()) => return,
                Err(err) => {
                    let delay = backoff.next_delay();
                    warn!(error = %err, ?delay, "pipeline master failed, restarting");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Consume the pipeline watch until it fails. Never returns Ok.
    async fn reconcile(&self) -> Result<(), MasterError> {
        let mut watcher = self.pipelines.watch_by_index(|record| !record.stopped);
        loop {
            match watcher.recv().await {
                Some(Event::Put { value, .. }) => {
                    let mut record = self.pipelines.decode(&value)?;
                    if record.input.is_none() {
                        record.input = synthesize_legacy_input(&record.inputs);
                    }
                    info!(pipeline = %record.name, version = record.version,
                        "creating/updating workers for pipeline");
                    self.orchestrator
                        .upsert_worker_controller(record.worker_spec())
                        .await?;
                }
                Some(Event::Delete { key, .. }) => {
                    info!(pipeline = %key, "deleting workers for pipeline");
                    self.orchestrator.delete_worker_controller(&key).await?;
                }
                Some(Event::Error { message }) => {
                    return Err(StoreError::Watch(message).into());
                }
                None => return Err(StoreError::WatchClosed.into()),
            }
        }
    }
}
