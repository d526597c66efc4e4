use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::{
    EndpointWatch, Endpoints, Orchestrator, Result, WorkerControllerSpec,
};

struct EndpointWatchHandle {
    service: String,
    tx: mpsc::UnboundedSender<Endpoints>,
}

#[derive(Default)]
struct State {
    endpoints: HashMap<String, Endpoints>,
    controllers: HashMap<String, WorkerControllerSpec>,
    watchers: Vec<EndpointWatchHandle>,
}

/// In-process orchestrator. Endpoint lists are set by the embedding process
/// (or by tests); controller upserts and deletes mutate a plain map.
#[derive(Default)]
pub struct LocalOrchestrator {
    state: Mutex<State>,
}

impl LocalOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the endpoint list of a service and fan the update out to every
    /// watcher of that service.
    pub fn set_endpoints(&self, service: &str, endpoints: Endpoints) {
        let mut state = self.state.lock();
        state
            .endpoints
            .insert(service.to_string(), endpoints.clone());
        state
            .watchers
            .retain(|w| w.service != service || w.tx.send(endpoints.clone()).is_ok());
    }
}

#[async_trait]
impl Orchestrator for LocalOrchestrator {
    async fn watch_endpoints(&self, service: &str) -> Result<EndpointWatch> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        let current = state.endpoints.get(service).cloned().unwrap_or_default();
        let _ = tx.send(current);
        state.watchers.push(EndpointWatchHandle {
            service: service.to_string(),
            tx,
        });
        Ok(EndpointWatch::new(rx))
    }

    async fn upsert_worker_controller(&self, spec: WorkerControllerSpec) -> Result<()> {
        debug!(pipeline = %spec.pipeline, version = spec.version, "upserting worker controller");
        self.state
            .lock()
            .controllers
            .insert(spec.pipeline.clone(), spec);
        Ok(())
    }

    async fn delete_worker_controller(&self, pipeline: &str) -> Result<()> {
        debug!(pipeline = %pipeline, "deleting worker controller");
        self.state.lock().controllers.remove(pipeline);
        Ok(())
    }

    async fn list_worker_controllers(&self) -> Result<Vec<WorkerControllerSpec>> {
        let mut controllers: Vec<WorkerControllerSpec> =
            self.state.lock().controllers.values().cloned().collect();
        controllers.sort_by(|a, b| a.pipeline.cmp(&b.pipeline));
        Ok(controllers)
    }
}
