//! Cluster authentication and authorization.
//!
//! Access control for the whole cluster hinges on one fact: the set of
//! administrator usernames recorded in the store. A non-empty set means auth
//! is activated. The service exchanges identity-provider credentials for
//! bearer tokens, evaluates per-repository authorization against stored ACLs,
//! and mints non-expiring capabilities for pipeline processes.

mod admins;
mod entitlement;
mod error;
mod hash;
mod identity;
mod logging;
mod repos;
mod service;
mod types;

pub use admins::AdminCache;
pub use entitlement::{EntitlementOracle, EntitlementState, LazyOracle, StaticOracle};
pub use error::{AuthError, Result};
pub use hash::hash_token;
pub use identity::{GithubIdentityProvider, IdentityProvider, AUTH_DISABLED_ENV};
pub use repos::{RepoCatalog, StaticRepoCatalog};
pub use service::AuthService;
pub use types::{
    Acl, AuthenticateRequest, AuthorizeRequest, GetScopeRequest, ModifyAdminsRequest,
    RequestMetadata, Scope, SetAclRequest, SetScopeRequest, User, UserType, MAGIC_USER,
    TOKEN_METADATA_KEY,
};
