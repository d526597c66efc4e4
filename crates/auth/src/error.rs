use thiserror::Error;

use crate::types::Scope;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("the auth service is not activated")]
    NotActivated,

    #[error("the auth service is already activated")]
    AlreadyActivated,

    #[error("{required:?} access to repo \"{repo}\" is required")]
    NotAuthorized { repo: String, required: Scope },

    #[error("must be a cluster admin to {0}")]
    AdminRequired(&'static str),

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("token not found")]
    TokenNotFound,

    #[error("invalid request: {0}")]
    InvalidArgument(String),

    #[error("the cluster entitlement is not active; {0}")]
    EntitlementInactive(&'static str),

    #[error("repo \"{0}\" not found")]
    RepoNotFound(String),

    #[error("could not reach the entitlement service: {0}")]
    Entitlement(String),

    #[error("could not resolve identity: {0}")]
    Identity(String),

    #[error("could not query the repo catalog: {0}")]
    Catalog(String),

    #[error(transparent)]
    Store(#[from] store::StoreError),
}

impl AuthError {
    /// NotActivated is expected and frequent wherever auth is simply turned
    /// off; the request logger demotes it to debug.
    pub fn is_not_activated(&self) -> bool {
        matches!(self, AuthError::NotActivated)
    }
}

pub type Result<T> = std::result::Result<T, AuthError>;
