use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::stm::{Txn, WriteOp};
use crate::watch::{Event, Watcher};

struct Row {
    value: Vec<u8>,
    mod_revision: u64,
    expires_at: Option<Instant>,
}

impl Row {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

struct WatchHandle {
    prefix: String,
    tx: mpsc::UnboundedSender<Event>,
}

struct State {
    rows: BTreeMap<String, Row>,
    revision: u64,
    watchers: Vec<WatchHandle>,
}

/// In-process strongly consistent KV engine with revisions, TTL keys,
/// list-then-watch change feeds, and optimistic transactions.
///
/// All rows live under `/`-joined prefixes; typed access goes through
/// [`crate::Collection`]. Within a single key, event order equals commit
/// order; across keys no order is guaranteed.
#[derive(Clone)]
pub struct Store {
    state: Arc<Mutex<State>>,
}

impl Store {
    pub fn new() -> Self {
        Store {
            state: Arc::new(Mutex::new(State {
                rows: BTreeMap::new(),
                revision: 0,
                watchers: Vec::new(),
            })),
        }
    }

    /// Drop expired rows, delivering `Delete` events to watchers. Expired
    /// rows are already invisible to reads; this only matters for watch
    /// consumers and is called internally before every locked operation.
    pub fn sweep_expired(&self) {
        let mut state = self.state.lock();
        purge_expired(&mut state);
    }

    pub(crate) fn read_raw(&self, key: &str) -> Option<(Vec<u8>, u64)> {
        let mut state = self.state.lock();
        purge_expired(&mut state);
        state
            .rows
            .get(key)
            .map(|row| (row.value.clone(), row.mod_revision))
    }

    pub(crate) fn snapshot_prefix(&self, prefix: &str) -> Vec<(String, Vec<u8>, u64)> {
        let mut state = self.state.lock();
        purge_expired(&mut state);
        rows_under(&state, prefix)
            .map(|(key, row)| (key.clone(), row.value.clone(), row.mod_revision))
            .collect()
    }

    pub(crate) fn put_raw(&self, key: &str, value: Vec<u8>, ttl_secs: Option<u64>) {
        let mut state = self.state.lock();
        purge_expired(&mut state);
        state.revision += 1;
        let revision = state.revision;
        apply_put(&mut state, key, value, ttl_secs, revision);
    }

    pub(crate) fn delete_raw(&self, key: &str) {
        let mut state = self.state.lock();
        purge_expired(&mut state);
        if state.rows.contains_key(key) {
            state.revision += 1;
            let revision = state.revision;
            apply_delete(&mut state, key, revision);
        }
    }

    pub(crate) fn delete_prefix_raw(&self, prefix: &str) {
        let mut state = self.state.lock();
        purge_expired(&mut state);
        let keys: Vec<String> = rows_under(&state, prefix).map(|(k, _)| k.clone()).collect();
        if keys.is_empty() {
            return;
        }
        state.revision += 1;
        let revision = state.revision;
        for key in keys {
            apply_delete(&mut state, &key, revision);
        }
    }

    /// Open a watch over every key under `prefix`: a synthetic `Put` for each
    /// live row first, then live events in commit order.
    pub(crate) fn watch_prefix(&self, prefix: &str) -> Watcher {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        purge_expired(&mut state);
        for (key, row) in rows_under(&state, prefix) {
            let _ = tx.send(Event::Put {
                key: key.clone(),
                value: row.value.clone(),
                revision: row.mod_revision,
            });
        }
        state.watchers.push(WatchHandle {
            prefix: format!("{}/", prefix),
            tx,
        });
        Watcher::new(rx, prefix)
    }

    /// Run `f` as an optimistic transaction. `f` reads and writes through the
    /// supplied [`Txn`] handle; on commit conflict it is re-run against fresh
    /// state, so it must be pure with respect to external side effects. An
    /// `Err` from `f` aborts the transaction without retrying.
    pub async fn stm<R, E, F>(&self, mut f: F) -> std::result::Result<R, E>
    where
        F: FnMut(&mut Txn) -> std::result::Result<R, E>,
    {
        loop {
            let mut txn = Txn::new(self.clone());
            let out = f(&mut txn)?;
            if self.try_commit(&txn) {
                return Ok(out);
            }
            tokio::task::yield_now().await;
        }
    }

    /// Validate the transaction's read set against current state and, if
    /// nothing moved underneath it, apply its buffered writes at a single
    /// new revision. Returns false on conflict.
    fn try_commit(&self, txn: &Txn) -> bool {
        let mut state = self.state.lock();
        purge_expired(&mut state);
        for (key, seen_revision) in &txn.reads {
            let current = state.rows.get(key).map(|r| r.mod_revision).unwrap_or(0);
            if current != *seen_revision {
                return false;
            }
        }
        if txn.writes.is_empty() && txn.range_deletes.is_empty() {
            return true;
        }
        state.revision += 1;
        let revision = state.revision;
        for prefix in &txn.range_deletes {
            let keys: Vec<String> = rows_under(&state, prefix).map(|(k, _)| k.clone()).collect();
            for key in keys {
                apply_delete(&mut state, &key, revision);
            }
        }
        for (key, op) in &txn.writes {
            match op {
                WriteOp::Put { value, ttl_secs } => {
                    apply_put(&mut state, key, value.clone(), *ttl_secs, revision);
                }
                WriteOp::Delete => {
                    apply_delete(&mut state, key, revision);
                }
            }
        }
        true
    }
}

impl Default for Store {
    fn default() -> Self {
        Store::new()
    }
}

fn rows_under<'a>(
    state: &'a State,
    prefix: &'a str,
) -> impl Iterator<Item = (&'a String, &'a Row)> {
    let from = format!("{}/", prefix);
    state
        .rows
        .range(from.clone()..)
        .take_while(move |(key, _)| key.starts_with(&from))
}

fn apply_put(state: &mut State, key: &str, value: Vec<u8>, ttl_secs: Option<u64>, revision: u64) {
    let expires_at = ttl_secs.map(|secs| Instant::now() + Duration::from_secs(secs));
    let event = Event::Put {
        key: key.to_string(),
        value: value.clone(),
        revision,
    };
    state.rows.insert(
        key.to_string(),
        Row {
            value,
            mod_revision: revision,
            expires_at,
        },
    );
    notify(state, event);
}

fn apply_delete(state: &mut State, key: &str, revision: u64) {
    if state.rows.remove(key).is_some() {
        notify(
            state,
            Event::Delete {
                key: key.to_string(),
                revision,
            },
        );
    }
}

fn purge_expired(state: &mut State) {
    let now = Instant::now();
    let expired: Vec<String> = state
        .rows
        .iter()
        .filter(|(_, row)| row.expired(now))
        .map(|(key, _)| key.clone())
        .collect();
    for key in expired {
        state.revision += 1;
        let revision = state.revision;
        apply_delete(state, &key, revision);
    }
}

fn notify(state: &mut State, event: Event) {
    let key = match event.key() {
        Some(key) => key.to_string(),
        None => return,
    };
    state
        .watchers
        .retain(|w| !key.starts_with(&w.prefix) || w.tx.send(event.clone()).is_ok());
}
