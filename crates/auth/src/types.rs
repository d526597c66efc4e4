use std::collections::BTreeMap;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Metadata key under which bearer tokens travel with each request.
pub const TOKEN_METADATA_KEY: &str = "basin-auth-token";

/// Unrevokable implicit cluster administrator. It is impossible to log in as
/// this user, but capabilities minted before activation point at it so that
/// pre-activation pipelines keep working once auth is on. The value must be
/// identical across replicas and restarts, so it is a compile-time constant.
pub const MAGIC_USER: &str = "mGc0TqyoyJd7VDLfK1hJf4dVXYyPPpPeGzfJ5Bp0vo4";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserType {
    Human,
    Pipeline,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    pub user_type: UserType,
}

/// Access level on a repository. The derived order is the authorization
/// order: a caller holding some scope is authorized for any request at that
/// scope or below.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum Scope {
    #[default]
    None,
    Reader,
    Writer,
    Owner,
}

/// Per-repository access control list. An absent ACL row and an ACL with no
/// entries are interchangeable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acl {
    pub entries: BTreeMap<String, Scope>,
}

impl Acl {
    pub fn scope_of(&self, username: &str) -> Scope {
        self.entries.get(username).copied().unwrap_or_default()
    }
}

/// Request metadata, the transport-agnostic equivalent of RPC metadata.
/// Bearer tokens travel here under [`TOKEN_METADATA_KEY`].
#[derive(Debug, Clone, Default)]
pub struct RequestMetadata {
    entries: HashMap<String, String>,
}

impl RequestMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(token: &str) -> Self {
        let mut md = Self::new();
        md.insert(TOKEN_METADATA_KEY, token);
        md
    }

    pub fn insert(&mut self, key: &str, value: &str) {
        self.entries.insert(key.to_string(), value.to_string());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }
}

#[derive(Debug, Clone, Default)]
pub struct AuthenticateRequest {
    /// Access credential issued by the external identity provider.
    pub provider_token: String,
    /// Username the caller claims. Required in test mode; optional in
    /// production, where it must then match the resolved identity.
    pub username: String,
}

#[derive(Debug, Clone)]
pub struct AuthorizeRequest {
    pub repo: String,
    pub scope: Scope,
}

#[derive(Debug, Clone, Default)]
pub struct ModifyAdminsRequest {
    pub add: Vec<String>,
    pub remove: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct GetScopeRequest {
    pub repos: Vec<String>,
    /// When set, ask about this user instead of the caller.
    pub username: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SetScopeRequest {
    pub repo: String,
    pub username: String,
    pub scope: Scope,
}

#[derive(Debug, Clone)]
pub struct SetAclRequest {
    pub repo: String,
    /// The full replacement ACL. Empty entries delete the row.
    pub acl: Acl,
}
