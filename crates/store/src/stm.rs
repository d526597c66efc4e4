use std::collections::{BTreeMap, HashMap};
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Result, StoreError};
use crate::store::Store;

#[derive(Debug, Clone)]
pub(crate) enum WriteOp {
    Put {
        value: Vec<u8>,
        ttl_secs: Option<u64>,
    },
    Delete,
}

/// Transaction handle passed to [`Store::stm`] closures.
///
/// Reads record the revision they observed; writes are buffered and become
/// visible atomically on commit. The closure owning this handle may run more
/// than once, so it must not perform external side effects.
pub struct Txn {
    store: Store,
    pub(crate) reads: HashMap<String, u64>,
    pub(crate) writes: BTreeMap<String, WriteOp>,
    pub(crate) range_deletes: Vec<String>,
}

impl Txn {
    pub(crate) fn new(store: Store) -> Self {
        Txn {
            store,
            reads: HashMap::new(),
            writes: BTreeMap::new(),
            range_deletes: Vec::new(),
        }
    }

    fn get_raw(&mut self, key: &str) -> Option<Vec<u8>> {
        if let Some(op) = self.writes.get(key) {
            return match op {
                WriteOp::Put { value, .. } => Some(value.clone()),
                WriteOp::Delete => None,
            };
        }
        if self
            .range_deletes
            .iter()
            .any(|prefix| key.starts_with(&format!("{}/", prefix)))
        {
            return None;
        }
        match self.store.read_raw(key) {
            Some((value, revision)) => {
                self.reads.insert(key.to_string(), revision);
                Some(value)
            }
            None => {
                self.reads.insert(key.to_string(), 0);
                None
            }
        }
    }

    fn put_raw(&mut self, key: &str, value: Vec<u8>, ttl_secs: Option<u64>) {
        self.writes
            .insert(key.to_string(), WriteOp::Put { value, ttl_secs });
    }

    fn delete_raw(&mut self, key: &str) {
        self.writes.insert(key.to_string(), WriteOp::Delete);
    }

    fn delete_prefix_raw(&mut self, prefix: &str) {
        self.writes
            .retain(|key, _| !key.starts_with(&format!("{}/", prefix)));
        self.range_deletes.push(prefix.to_string());
    }
}

/// Typed view of one collection inside a transaction.
pub struct TxnView<'a, T> {
    txn: &'a mut Txn,
    prefix: String,
    _marker: PhantomData<fn() -> T>,
}

impl<'a, T> TxnView<'a, T>
where
    T: Serialize + DeserializeOwned,
{
    pub(crate) fn new(txn: &'a mut Txn, prefix: &str) -> Self {
        TxnView {
            txn,
            prefix: prefix.to_string(),
            _marker: PhantomData,
        }
    }

    fn key(&self, key: &str) -> String {
        format!("{}/{}", self.prefix, key)
    }

    pub fn get(&mut self, key: &str) -> Result<T> {
        let full = self.key(key);
        match self.txn.get_raw(&full) {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Err(StoreError::NotFound(full)),
        }
    }

    pub fn put(&mut self, key: &str, value: &T) -> Result<()> {
        let full = self.key(key);
        self.txn.put_raw(&full, serde_json::to_vec(value)?, None);
        Ok(())
    }

    pub fn put_ttl(&mut self, key: &str, value: &T, ttl_secs: u64) -> Result<()> {
        let full = self.key(key);
        self.txn
            .put_raw(&full, serde_json::to_vec(value)?, Some(ttl_secs));
        Ok(())
    }

    /// Buffer a delete. Deleting an absent key is not an error.
    pub fn delete(&mut self, key: &str) {
        let full = self.key(key);
        self.txn.delete_raw(&full);
    }

    pub fn delete_all(&mut self) {
        self.txn.delete_prefix_raw(&self.prefix);
    }
}
