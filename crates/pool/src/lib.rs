//! Pool of RPC channels into a worker service.
//!
//! The pool tracks one channel per `ip:port` endpoint of the service, keeps
//! the set in step with the orchestrator's endpoint watch, and routes each
//! call to the channel with the fewest outstanding requests. Channels are
//! dialed lazily, on the first call that selects them.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::task::JoinHandle;
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, warn};

use orchestrator::{Endpoints, Orchestrator};

/// Dropped endpoints keep their channel alive this long, so calls in flight
/// when the orchestrator shrinks the service can drain instead of being cut.
const DRAIN_GRACE: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("no endpoints found")]
    NoEndpoints,

    #[error("invalid endpoint address \"{0}\": {1}")]
    InvalidAddress(String, tonic::transport::Error),

    #[error("endpoint watch failed: {0}")]
    Watch(#[from] orchestrator::OrchestratorError),

    #[error(transparent)]
    Task(#[from] anyhow::Error),
}

struct ConnEntry {
    channel: Option<Channel>,
    outstanding: Arc<AtomicI64>,
}

#[derive(Default)]
struct Conns {
    entries: HashMap<String, ConnEntry>,
    draining: Vec<(Channel, tokio::time::Instant)>,
}

/// Decrements the chosen entry's outstanding count on every exit path,
/// including panics inside the call.
struct OutstandingGuard(Arc<AtomicI64>);

impl OutstandingGuard {
    fn acquire(counter: &Arc<AtomicI64>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        OutstandingGuard(counter.clone())
    }
}

impl Drop for OutstandingGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct Pool {
    conns: Arc<Mutex<Conns>>,
    watcher: JoinHandle<()>,
}

impl Pool {
    /// Build a pool tracking the endpoints of `service`.
    pub async fn new(orchestrator: Arc<dyn Orchestrator>, service: &str) -> Result<Pool, PoolError> {
        let mut watch = orchestrator.watch_endpoints(service).await?;
        let conns: Arc<Mutex<Conns>> = Arc::new(Mutex::new(Conns::default()));
        let watcher_conns = conns.clone();
        let service = service.to_string();
        let watcher = tokio::spawn(async move {
            let mut tick = tokio::time::interval(DRAIN_GRACE / 2);
            loop {
                tokio::select! {
                    update = watch.recv() => match update {
                        Some(endpoints) => update_addresses(&watcher_conns, &endpoints),
                        None => {
                            warn!(service = %service, "endpoint watch closed, pool membership is frozen");
                            return;
                        }
                    },
                    _ = tick.tick() => drop_drained(&watcher_conns),
                }
            }
        });
        Ok(Pool { conns, watcher })
    }

    /// Run `f` against the least-loaded channel. An endpoint that has never
    /// been dialed is picked first (its outstanding count is necessarily
    /// zero). Errors from `f` are returned as-is.
    pub async fn do_with<T, F, Fut>(&self, f: F) -> Result<T, PoolError>
    where
        F: FnOnce(Channel) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let (channel, _guard) = {
            let mut conns = self.conns.lock();

            // An endpoint that was never dialed wins outright: its count is
            // zero, which nothing can beat.
            let undialed = conns
                .entries
                .iter()
                .find(|(_, entry)| entry.channel.is_none())
                .map(|(addr, _)| addr.clone());

            let (channel, counter) = if let Some(addr) = undialed {
                let endpoint = Endpoint::from_shared(format!("http://{addr}"))
                    .map_err(|err| PoolError::InvalidAddress(addr.clone(), err))?;
                let channel = endpoint.connect_lazy();
                let entry = match conns.entries.get_mut(&addr) {
                    Some(entry) => entry,
                    None => return Err(PoolError::NoEndpoints),
                };
                entry.channel = Some(channel.clone());
                (channel, entry.outstanding.clone())
            } else {
                let mut best: Option<(Channel, Arc<AtomicI64>, i64)> = None;
                for entry in conns.entries.values() {
                    if let Some(channel) = &entry.channel {
                        let count = entry.outstanding.load(Ordering::SeqCst);
                        if best.as_ref().map_or(true, |(_, _, c)| count < *c) {
                            best = Some((channel.clone(), entry.outstanding.clone(), count));
                        }
                    }
                }
                match best {
                    Some((channel, counter, _)) => (channel, counter),
                    None => return Err(PoolError::NoEndpoints),
                }
            };

            let guard = OutstandingGuard::acquire(&counter);
            (channel, guard)
        };

        f(channel).await.map_err(PoolError::Task)
    }

    /// Outstanding-call counts per endpoint address.
    pub fn outstanding(&self) -> BTreeMap<String, i64> {
        self.conns
            .lock()
            .entries
            .iter()
            .map(|(addr, entry)| (addr.clone(), entry.outstanding.load(Ordering::SeqCst)))
            .collect()
    }

    /// Stop the endpoint watcher and drop every channel.
    pub fn close(&self) {
        self.watcher.abort();
        let mut conns = self.conns.lock();
        conns.entries.clear();
        conns.draining.clear();
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}

fn update_addresses(conns: &Mutex<Conns>, endpoints: &Endpoints) {
    let addresses = endpoints.flatten();
    let mut conns = conns.lock();
    let mut next: HashMap<String, ConnEntry> = HashMap::with_capacity(addresses.len());
    for addr in addresses {
        match conns.entries.remove(&addr) {
            Some(entry) => {
                next.insert(addr, entry);
            }
            None => {
                // Dialing happens on first use; there is nowhere to surface a
                // dial error from here.
                next.insert(
                    addr,
                    ConnEntry {
                        channel: None,
                        outstanding: Arc::new(AtomicI64::new(0)),
                    },
                );
            }
        }
    }
    let now = tokio::time::Instant::now();
    let dropped: Vec<Channel> = conns
        .entries
        .drain()
        .filter_map(|(_, entry)| entry.channel)
        .collect();
    for channel in dropped {
        conns.draining.push((channel, now));
    }
    conns.entries = next;
    debug!(endpoints = conns.entries.len(), "updated pool endpoints");
}

fn drop_drained(conns: &Mutex<Conns>) {
    let now = tokio::time::Instant::now();
    conns
        .lock()
        .draining
        .retain(|(_, since)| now.duration_since(*since) < DRAIN_GRACE);
}
