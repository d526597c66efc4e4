//! Interface to the container orchestrator.
//!
//! The control plane consumes two slices of the orchestrator API: the
//! endpoint list of a service (for sizing the worker connection pool) and
//! create/update/delete of worker replication controllers (for the pipeline
//! master). The orchestrator itself is external; [`LocalOrchestrator`] is the
//! in-process implementation used by tests and single-node runs.

mod local;

use std::collections::BTreeSet;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

pub use local::LocalOrchestrator;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("unknown service: {0}")]
    UnknownService(String),

    #[error("orchestrator call failed: {0}")]
    Api(String),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointAddress {
    pub ip: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointPort {
    pub port: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointSubset {
    pub addresses: Vec<EndpointAddress>,
    pub ports: Vec<EndpointPort>,
}

/// Endpoint list of one service. The full set of reachable endpoints is the
/// cross product of addresses and ports within each subset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Endpoints {
    pub subsets: Vec<EndpointSubset>,
}

impl Endpoints {
    pub fn flatten(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        for subset in &self.subsets {
            for address in &subset.addresses {
                for port in &subset.ports {
                    out.insert(format!("{}:{}", address.ip, port.port));
                }
            }
        }
        out
    }
}

/// Desired worker replication controller for one pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerControllerSpec {
    pub pipeline: String,
    pub version: u64,
    pub replicas: u32,
    pub image: String,
}

/// Stream of endpoint updates for one service: the current state first, then
/// every subsequent change.
pub struct EndpointWatch {
    rx: mpsc::UnboundedReceiver<Endpoints>,
}

impl EndpointWatch {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<Endpoints>) -> Self {
        EndpointWatch { rx }
    }

    pub async fn recv(&mut self) -> Option<Endpoints> {
        self.rx.recv().await
    }
}

#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Watch the endpoint list of a service selected by its service label.
    async fn watch_endpoints(&self, service: &str) -> Result<EndpointWatch>;

    /// Create or update the worker controller for a pipeline. Idempotent.
    async fn upsert_worker_controller(&self, spec: WorkerControllerSpec) -> Result<()>;

    /// Delete the worker controller for a pipeline. Deleting an absent
    /// controller is not an error.
    async fn delete_worker_controller(&self, pipeline: &str) -> Result<()>;

    async fn list_worker_controllers(&self) -> Result<Vec<WorkerControllerSpec>>;
}
