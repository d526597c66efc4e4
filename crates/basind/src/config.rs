use std::env;

use anyhow::{bail, Context};
use auth::EntitlementState;

/// Daemon configuration, read from the environment (a `.env` file is loaded
/// first when present).
#[derive(Debug, Clone)]
pub struct Config {
    /// Root prefix for every control-plane collection in the store.
    pub store_prefix: String,
    /// Service label of the pipeline worker endpoints the pool tracks.
    pub worker_service: String,
    /// TTL of the pipeline-master lease.
    pub master_lease_ttl_secs: u64,
    /// Base URL of the identity provider API.
    pub identity_api: String,
    /// Entitlement state reported until a remote entitlement service is
    /// wired in. Single-node runs default to active.
    pub entitlement_state: EntitlementState,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let store_prefix =
            env::var("BASIN_STORE_PREFIX").unwrap_or_else(|_| "basin".to_string());
        let worker_service =
            env::var("BASIN_WORKER_SERVICE").unwrap_or_else(|_| "basin-worker".to_string());
        let master_lease_ttl_secs = match env::var("BASIN_MASTER_LEASE_TTL_SECS") {
            Ok(raw) => raw
                .parse()
                .with_context(|| format!("invalid BASIN_MASTER_LEASE_TTL_SECS: {raw}"))?,
            Err(_) => 30,
        };
        let identity_api =
            env::var("BASIN_IDENTITY_API").unwrap_or_else(|_| "https://api.github.com".to_string());
        let entitlement_state = match env::var("BASIN_ENTITLEMENT_STATE").as_deref() {
            Ok("active") | Err(_) => EntitlementState::Active,
            Ok("expired") => EntitlementState::Expired,
            Ok("none") => EntitlementState::None,
            Ok(other) => bail!("invalid BASIN_ENTITLEMENT_STATE: {other}"),
        };
        Ok(Config {
            store_prefix,
            worker_service,
            master_lease_ttl_secs,
            identity_api,
            entitlement_state,
        })
    }
}
