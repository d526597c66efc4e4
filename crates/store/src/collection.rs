use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Result, StoreError};
use crate::stm::{Txn, TxnView};
use crate::store::Store;
use crate::watch::{Event, Watcher};

/// Typed view of every key under one store prefix.
///
/// Values are serde-encoded. A `get` of a missing (or expired) key fails with
/// [`StoreError::NotFound`].
pub struct Collection<T> {
    store: Store,
    prefix: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Collection<T> {
    fn clone(&self) -> Self {
        Collection {
            store: self.store.clone(),
            prefix: self.prefix.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> Collection<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(store: &Store, prefix: impl Into<String>) -> Self {
        Collection {
            store: store.clone(),
            prefix: prefix.into(),
            _marker: PhantomData,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn key(&self, key: &str) -> String {
        format!("{}/{}", self.prefix, key)
    }

    pub async fn get(&self, key: &str) -> Result<T> {
        let full = self.key(key);
        match self.store.read_raw(&full) {
            Some((bytes, _)) => Ok(serde_json::from_slice(&bytes)?),
            None => Err(StoreError::NotFound(full)),
        }
    }

    pub async fn put(&self, key: &str, value: &T) -> Result<()> {
        self.store
            .put_raw(&self.key(key), serde_json::to_vec(value)?, None);
        Ok(())
    }

    /// Write a row that disappears `ttl_secs` after the write commits.
    pub async fn put_ttl(&self, key: &str, value: &T, ttl_secs: u64) -> Result<()> {
        self.store
            .put_raw(&self.key(key), serde_json::to_vec(value)?, Some(ttl_secs));
        Ok(())
    }

    /// Delete a row. Deleting an absent row is not an error.
    pub async fn delete(&self, key: &str) -> Result<()> {
        self.store.delete_raw(&self.key(key));
        Ok(())
    }

    pub async fn delete_all(&self) -> Result<()> {
        self.store.delete_prefix_raw(&self.prefix);
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<(String, T)>> {
        let strip = format!("{}/", self.prefix);
        let mut out = Vec::new();
        for (key, bytes, _) in self.store.snapshot_prefix(&self.prefix) {
            let name = key.strip_prefix(&strip).unwrap_or(&key).to_string();
            out.push((name, serde_json::from_slice(&bytes)?));
        }
        Ok(out)
    }

    /// Open a list-then-watch feed over the collection. Keys in delivered
    /// events are relative to the collection prefix.
    pub fn watch(&self) -> Watcher {
        self.store.watch_prefix(&self.prefix)
    }

    /// Like [`Collection::watch`], but `Put` events are delivered only when
    /// the decoded value matches `pred`. `Delete` and `Error` events always
    /// pass (a deleted row no longer has a value to index).
    pub fn watch_by_index<F>(&self, pred: F) -> Watcher
    where
        F: Fn(&T) -> bool + Send + 'static,
        T: 'static,
    {
        self.store
            .watch_prefix(&self.prefix)
            .with_filter(move |event| match event {
                Event::Put { value, .. } => match serde_json::from_slice::<T>(value) {
                    Ok(decoded) => pred(&decoded),
                    Err(_) => true,
                },
                Event::Delete { .. } | Event::Error { .. } => true,
            })
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Typed read-write view of this collection inside an STM transaction.
    pub fn txn<'a>(&self, txn: &'a mut Txn) -> TxnView<'a, T> {
        TxnView::new(txn, &self.prefix)
    }
}
