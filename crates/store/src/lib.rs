//! Control-plane key-value store.
//!
//! The store is the single source of truth for cluster state. It offers typed
//! prefix collections with point reads and writes, TTL'd keys, list-then-watch
//! change feeds, optimistic transactions, and a TTL'd lease used to elect
//! singleton control loops.

pub mod backoff;
mod collection;
mod error;
pub mod lease;
mod stm;
mod store;
mod watch;

pub use collection::Collection;
pub use error::{Result, StoreError};
pub use lease::HeldLease;
pub use stm::{Txn, TxnView};
pub use store::Store;
pub use watch::{Event, Watcher};
