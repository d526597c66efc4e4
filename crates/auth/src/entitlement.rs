use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::OnceCell;

/// Licensing state reported by the entitlement service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntitlementState {
    None,
    Active,
    Expired,
}

/// Remote entitlement status oracle. Consulted on every request whose
/// authorization predicates on licensing; failures surface as request-level
/// errors.
#[async_trait]
pub trait EntitlementOracle: Send + Sync {
    async fn get_state(&self) -> anyhow::Result<EntitlementState>;
}

type OracleFactory =
    Box<dyn Fn() -> BoxFuture<'static, anyhow::Result<Arc<dyn EntitlementOracle>>> + Send + Sync>;

/// Oracle that constructs its underlying client on first use and reuses it
/// afterwards. Construction failures are returned to the caller and retried
/// on the next request.
pub struct LazyOracle {
    factory: OracleFactory,
    client: OnceCell<Arc<dyn EntitlementOracle>>,
}

impl LazyOracle {
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn() -> BoxFuture<'static, anyhow::Result<Arc<dyn EntitlementOracle>>>
            + Send
            + Sync
            + 'static,
    {
        LazyOracle {
            factory: Box::new(factory),
            client: OnceCell::new(),
        }
    }
}

#[async_trait]
impl EntitlementOracle for LazyOracle {
    async fn get_state(&self) -> anyhow::Result<EntitlementState> {
        let client = self
            .client
            .get_or_try_init(|| (self.factory)())
            .await?;
        client.get_state().await
    }
}

/// Fixed-state oracle for tests and single-node runs where no entitlement
/// service is deployed.
pub struct StaticOracle {
    state: Mutex<EntitlementState>,
}

impl StaticOracle {
    pub fn new(state: EntitlementState) -> Self {
        StaticOracle {
            state: Mutex::new(state),
        }
    }

    pub fn set_state(&self, state: EntitlementState) {
        *self.state.lock() = state;
    }
}

#[async_trait]
impl EntitlementOracle for StaticOracle {
    async fn get_state(&self) -> anyhow::Result<EntitlementState> {
        Ok(*self.state.lock())
    }
}
