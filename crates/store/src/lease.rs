//! Store-backed lease for singleton control loops.
//!
//! Acquisition is an insert-if-absent of a TTL'd owner id. The holder renews
//! at a third of the TTL, so a crashed holder frees the lease within one TTL
//! without any explicit cleanup.

use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::collection::Collection;
use crate::error::{Result, StoreError};
use crate::store::Store;

const LEASES_PREFIX: &str = "leases";

/// A currently held lease. Dropping it stops renewal; the row then lapses by
/// TTL. Call [`HeldLease::release`] for an immediate handoff.
pub struct HeldLease {
    store: Store,
    name: String,
    id: String,
    renew: JoinHandle<()>,
}

impl HeldLease {
    /// Stop renewing and delete the lease row if this holder still owns it.
    pub async fn release(self) {
        self.renew.abort();
        let leases: Collection<String> = Collection::new(&self.store, LEASES_PREFIX);
        let name = self.name.clone();
        let id = self.id.clone();
        let res: Result<()> = self
            .store
            .stm(|txn| {
                let mut view = leases.txn(txn);
                match view.get(&name) {
                    Ok(owner) if owner == id => {
                        view.delete(&name);
                        Ok(())
                    }
                    Ok(_) | Err(StoreError::NotFound(_)) => Ok(()),
                    Err(err) => Err(err),
                }
            })
            .await;
        if let Err(err) = res {
            warn!(lease = %self.name, error = %err, "failed to release lease");
        } else {
            debug!(lease = %self.name, "released lease");
        }
    }
}

impl Drop for HeldLease {
    fn drop(&mut self) {
        self.renew.abort();
    }
}

/// Block until the named lease is free, then take it for `ttl_secs`.
pub async fn acquire(store: &Store, name: &str, ttl_secs: u64) -> Result<HeldLease> {
    let leases: Collection<String> = Collection::new(store, LEASES_PREFIX);
    let id = Uuid::new_v4().simple().to_string();
    let poll = Duration::from_secs((ttl_secs / 3).max(1));
    loop {
        let taken = try_acquire(store, &leases, name, &id, ttl_secs).await?;
        if taken {
            debug!(lease = %name, "acquired lease");
            let renew = tokio::spawn(renew_loop(
                store.clone(),
                name.to_string(),
                id.clone(),
                ttl_secs,
            ));
            return Ok(HeldLease {
                store: store.clone(),
                name: name.to_string(),
                id,
                renew,
            });
        }
        tokio::time::sleep(poll).await;
    }
}

async fn try_acquire(
    store: &Store,
    leases: &Collection<String>,
    name: &str,
    id: &str,
    ttl_secs: u64,
) -> Result<bool> {
    store
        .stm(|txn| {
            let mut view = leases.txn(txn);
            match view.get(name) {
                Ok(_) => Ok(false),
                Err(StoreError::NotFound(_)) => {
                    view.put_ttl(name, &id.to_string(), ttl_secs)?;
                    Ok(true)
                }
                Err(err) => Err(err),
            }
        })
        .await
}

async fn renew_loop(store: Store, name: String, id: String, ttl_secs: u64) {
    let leases: Collection<String> = Collection::new(&store, LEASES_PREFIX);
    let interval = Duration::from_secs((ttl_secs / 3).max(1));
    loop {
        tokio::time::sleep(interval).await;
        let res: Result<bool> = store
            .stm(|txn| {
                let mut view = leases.txn(txn);
                match view.get(&name) {
                    Ok(owner) if owner == id => {
                        view.put_ttl(&name, &id, ttl_secs)?;
                        Ok(true)
                    }
                    Ok(_) | Err(StoreError::NotFound(_)) => Ok(false),
                    Err(err) => Err(err),
                }
            })
            .await;
        match res {
            Ok(true) => {}
            Ok(false) => {
                warn!(lease = %name, "lease lost to another holder, stopping renewal");
                return;
            }
            Err(err) => {
                warn!(lease = %name, error = %err, "lease renewal failed, will retry");
            }
        }
    }
}
