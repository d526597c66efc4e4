use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use store::backoff::retry_forever;
use store::{Collection, Event, StoreError};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::types::MAGIC_USER;

/// In-memory mirror of the admins collection.
///
/// A dedicated worker keeps the set consistent with the store through a
/// list-then-watch feed, reconnecting with backoff on any failure. The store
/// stays the source of truth; this cache only answers the hot-path reads
/// every request performs. The mutex is never held across a store call.
pub struct AdminCache {
    admins: Arc<Mutex<HashSet<String>>>,
    watcher: JoinHandle<()>,
}

impl AdminCache {
    /// Start mirroring `collection`. Requires a running tokio runtime.
    pub fn spawn(collection: Collection<bool>) -> Self {
        let admins = Arc::new(Mutex::new(HashSet::new()));
        let watcher = tokio::spawn(watch_admins(collection, admins.clone()));
        AdminCache { admins, watcher }
    }

    /// Auth is activated exactly when the cluster has at least one admin.
    pub fn is_activated(&self) -> bool {
        !self.admins.lock().is_empty()
    }

    pub fn is_admin(&self, username: &str) -> bool {
        if username == MAGIC_USER {
            return true;
        }
        self.admins.lock().contains(username)
    }

    /// Snapshot of the admin set, sorted for stable output. Does not include
    /// the implicit admin.
    pub fn admins(&self) -> Vec<String> {
        let mut out: Vec<String> = self.admins.lock().iter().cloned().collect();
        out.sort();
        out
    }

    /// Simulate a modification against the current set, as request
    /// validation does before committing admin changes.
    pub fn simulate_modification(&self, add: &[String], remove: &[String]) -> HashSet<String> {
        let mut set = self.admins.lock().clone();
        for user in add {
            set.insert(user.clone());
        }
        for user in remove {
            set.remove(user);
        }
        set
    }
}

impl Drop for AdminCache {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}

async fn watch_admins(collection: Collection<bool>, admins: Arc<Mutex<HashSet<String>>>) {
    retry_forever(
        || {
            let collection = collection.clone();
            let admins = admins.clone();
            async move {
                let mut watcher = collection.watch();
                loop {
                    match watcher.recv().await {
                        Some(Event::Put { key, .. }) => {
                            admins.lock().insert(key);
                        }
                        Some(Event::Delete { key, .. }) => {
                            admins.lock().remove(&key);
                        }
                        Some(Event::Error { message }) => {
                            return Err(StoreError::Watch(message));
                        }
                        None => return Err(StoreError::WatchClosed),
                    }
                }
            }
        },
        |err: &StoreError, delay| {
            warn!(error = %err, ?delay, "admin watch failed, reconnecting");
        },
    )
    .await
}
