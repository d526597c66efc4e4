use std::sync::Arc;
use std::time::Instant;

use store::{Collection, Store, StoreError};
use uuid::Uuid;

use crate::admins::AdminCache;
use crate::entitlement::{EntitlementOracle, EntitlementState};
use crate::error::{AuthError, Result};
use crate::hash::hash_token;
use crate::identity::{IdentityProvider, AUTH_DISABLED_ENV};
use crate::logging;
use crate::repos::RepoCatalog;
use crate::types::{
    Acl, AuthenticateRequest, AuthorizeRequest, GetScopeRequest, ModifyAdminsRequest,
    RequestMetadata, Scope, SetAclRequest, SetScopeRequest, User, UserType, MAGIC_USER,
    TOKEN_METADATA_KEY,
};

const TOKENS_PREFIX: &str = "tokens";
const ACLS_PREFIX: &str = "acls";
const ADMINS_PREFIX: &str = "admins";

/// Two weeks. Authenticate-issued tokens lapse on their own; capabilities
/// never do.
const DEFAULT_TOKEN_TTL_SECS: u64 = 14 * 24 * 60 * 60;

struct Inner {
    store: Store,
    tokens: Collection<User>,
    acls: Collection<Acl>,
    admins: Collection<bool>,
    admin_cache: AdminCache,
    entitlement: Arc<dyn EntitlementOracle>,
    identity: Arc<dyn IdentityProvider>,
    repos: Arc<dyn RepoCatalog>,
}

/// The cluster auth API.
///
/// Every operation except `get_capability` requires the service to be
/// activated. All store mutations happen inside a single transaction per
/// request, so the admin-floor invariant and ACL updates are atomic.
#[derive(Clone)]
pub struct AuthService {
    inner: Arc<Inner>,
}

impl AuthService {
    /// Build the service over `root_prefix` in the store and start the admin
    /// cache watcher. Requires a running tokio runtime.
    pub fn new(
        store: Store,
        root_prefix: &str,
        entitlement: Arc<dyn EntitlementOracle>,
        identity: Arc<dyn IdentityProvider>,
        repos: Arc<dyn RepoCatalog>,
    ) -> Self {
        let tokens = Collection::new(&store, format!("{root_prefix}/{TOKENS_PREFIX}"));
        let acls = Collection::new(&store, format!("{root_prefix}/{ACLS_PREFIX}"));
        let admins: Collection<bool> =
            Collection::new(&store, format!("{root_prefix}/{ADMINS_PREFIX}"));
        let admin_cache = AdminCache::spawn(admins.clone());
        AuthService {
            inner: Arc::new(Inner {
                store,
                tokens,
                acls,
                admins,
                admin_cache,
                entitlement,
                identity,
                repos,
            }),
        }
    }

    pub fn is_activated(&self) -> bool {
        self.inner.admin_cache.is_activated()
    }

    pub fn is_admin(&self, username: &str) -> bool {
        self.inner.admin_cache.is_admin(username)
    }

    /// Turn cluster auth on, seeding the admin set. Anyone may call this on a
    /// deactivated cluster; once admins exist, re-activation is refused so
    /// nobody can seed themselves in.
    pub async fn activate(&self, admins: Vec<String>) -> Result<()> {
        logging::request("Activate", &admins);
        let started = Instant::now();
        let res = self.activate_inner(admins).await;
        logging::response("Activate", &res, started.elapsed());
        res
    }

    async fn activate_inner(&self, admins: Vec<String>) -> Result<()> {
        if self.entitlement_state().await? != EntitlementState::Active {
            return Err(AuthError::EntitlementInactive(
                "auth is an entitled feature; activate the cluster entitlement first",
            ));
        }
        if self.inner.admin_cache.is_activated() {
            return Err(AuthError::AlreadyActivated);
        }
        if admins.is_empty() {
            return Err(AuthError::InvalidArgument(
                "at least one admin is required to activate".to_string(),
            ));
        }
        validate_usernames(&admins)?;
        self.inner
            .store
            .stm(|txn| {
                let mut view = self.inner.admins.txn(txn);
                for user in &admins {
                    view.put(user, &true)?;
                }
                Ok(())
            })
            .await
    }

    /// Turn cluster auth off, wiping tokens, ACLs, and admins.
    pub async fn deactivate(&self, md: &RequestMetadata) -> Result<()> {
        logging::request("Deactivate", &"");
        let started = Instant::now();
        let res = self.deactivate_inner(md).await;
        logging::response("Deactivate", &res, started.elapsed());
        res
    }

    async fn deactivate_inner(&self, md: &RequestMetadata) -> Result<()> {
        self.require_activated()?;
        let user = self.authenticated_user(md).await?;
        if !self.inner.admin_cache.is_admin(&user.username) {
            return Err(AuthError::AdminRequired("disable cluster auth"));
        }
        self.inner
            .store
            .stm(|txn| {
                self.inner.acls.txn(txn).delete_all();
                self.inner.tokens.txn(txn).delete_all();
                self.inner.admins.txn(txn).delete_all();
                Ok::<(), AuthError>(())
            })
            .await
    }

    /// List cluster admins. Any authenticated user may ask; otherwise nobody
    /// would know whom to ask for access.
    pub async fn get_admins(&self, md: &RequestMetadata) -> Result<Vec<String>> {
        logging::request("GetAdmins", &"");
        let started = Instant::now();
        let res = self.get_admins_inner(md).await;
        logging::response("GetAdmins", &res, started.elapsed());
        res
    }

    async fn get_admins_inner(&self, md: &RequestMetadata) -> Result<Vec<String>> {
        self.require_activated()?;
        self.authenticated_user(md).await?;
        Ok(self.inner.admin_cache.admins())
    }

    pub async fn modify_admins(
        &self,
        md: &RequestMetadata,
        req: ModifyAdminsRequest,
    ) -> Result<()> {
        logging::request("ModifyAdmins", &req);
        let started = Instant::now();
        let res = self.modify_admins_inner(md, req).await;
        logging::response("ModifyAdmins", &res, started.elapsed());
        res
    }

    async fn modify_admins_inner(
        &self,
        md: &RequestMetadata,
        req: ModifyAdminsRequest,
    ) -> Result<()> {
        self.require_activated()?;
        let user = self.authenticated_user(md).await?;
        if !self.inner.admin_cache.is_admin(&user.username) {
            return Err(AuthError::AdminRequired("modify the set of cluster admins"));
        }
        validate_usernames(req.add.iter().chain(req.remove.iter()))?;
        let after = self
            .inner
            .admin_cache
            .simulate_modification(&req.add, &req.remove);
        if after.is_empty() {
            return Err(AuthError::InvalidArgument(
                "cannot remove all cluster admins while auth is active; the cluster would be unfixable"
                    .to_string(),
            ));
        }
        self.inner
            .store
            .stm(|txn| {
                let mut view = self.inner.admins.txn(txn);
                for user in &req.add {
                    view.put(user, &true)?;
                }
                for user in &req.remove {
                    view.delete(user);
                }
                Ok(())
            })
            .await
    }

    /// Exchange an identity-provider credential for a bearer token bound to a
    /// human user. The token lapses after two weeks.
    pub async fn authenticate(&self, req: AuthenticateRequest) -> Result<String> {
        // The request carries credentials; log the response only.
        let started = Instant::now();
        let res = self.authenticate_inner(req).await;
        logging::response("Authenticate", &res, started.elapsed());
        res
    }

    async fn authenticate_inner(&self, req: AuthenticateRequest) -> Result<String> {
        self.require_activated()?;
        if req.username == MAGIC_USER {
            return Err(AuthError::InvalidArgument("invalid user".to_string()));
        }

        let username = if auth_disabled_for_testing() {
            // Test mode: the caller authenticates as whoever they claim.
            if req.username.is_empty() {
                return Err(AuthError::InvalidArgument(
                    "username must be set when authentication is disabled for testing".to_string(),
                ));
            }
            req.username.clone()
        } else {
            let resolved = self
                .inner
                .identity
                .resolve(&req.provider_token)
                .await
                .map_err(|err| AuthError::Identity(err.to_string()))?;
            if !req.username.is_empty() && req.username != resolved {
                return Err(AuthError::AuthenticationFailed(format!(
                    "attempted to authenticate as \"{}\", but the provider credential does not \
                     belong to that account",
                    req.username
                )));
            }
            resolved
        };

        // With a lapsed entitlement only admins may log in.
        if self.entitlement_state().await? != EntitlementState::Active
            && !self.inner.admin_cache.is_admin(&username)
        {
            return Err(AuthError::EntitlementInactive(
                "only cluster admins can authenticate until the entitlement is reactivated",
            ));
        }

        let token = Uuid::new_v4().simple().to_string();
        let user = User {
            username,
            user_type: UserType::Human,
        };
        self.inner
            .store
            .stm(|txn| {
                self.inner
                    .tokens
                    .txn(txn)
                    .put_ttl(&hash_token(&token), &user, DEFAULT_TOKEN_TTL_SECS)?;
                Ok::<(), AuthError>(())
            })
            .await?;
        Ok(token)
    }

    /// Is the caller allowed to act on `repo` at the requested scope?
    pub async fn authorize(&self, md: &RequestMetadata, req: AuthorizeRequest) -> Result<bool> {
        logging::request("Authorize", &req);
        let started = Instant::now();
        let res = self.authorize_inner(md, req).await;
        logging::response("Authorize", &res, started.elapsed());
        res
    }

    async fn authorize_inner(&self, md: &RequestMetadata, req: AuthorizeRequest) -> Result<bool> {
        self.require_activated()?;
        let user = self.authenticated_user(md).await?;

        if self.inner.admin_cache.is_admin(&user.username) {
            return Ok(true);
        }

        // With a lapsed entitlement only admins and pipelines get as far as
        // the ACL check; pipelines must keep running regardless of licensing.
        if self.entitlement_state().await? != EntitlementState::Active
            && user.user_type != UserType::Pipeline
        {
            return Err(AuthError::EntitlementInactive(
                "only cluster admins and pipelines can authorize until the entitlement is \
                 reactivated",
            ));
        }

        let acl = self.acl_or_empty(&req.repo).await?;
        Ok(req.scope <= acl.scope_of(&user.username))
    }

    pub async fn who_am_i(&self, md: &RequestMetadata) -> Result<String> {
        logging::request("WhoAmI", &"");
        let started = Instant::now();
        let res = self.who_am_i_inner(md).await;
        logging::response("WhoAmI", &res, started.elapsed());
        res
    }

    async fn who_am_i_inner(&self, md: &RequestMetadata) -> Result<String> {
        self.require_activated()?;
        let user = self.authenticated_user(md).await?;
        Ok(user.username)
    }

    /// Scope of the caller (or of `req.username`) on each requested repo.
    /// Admin override is deliberately not reflected: callers want to know
    /// what the ACL says, e.g. what would happen if admin rights were
    /// revoked.
    pub async fn get_scope(&self, md: &RequestMetadata, req: GetScopeRequest) -> Result<Vec<Scope>> {
        logging::request("GetScope", &req);
        let started = Instant::now();
        let res = self.get_scope_inner(md, req).await;
        logging::response("GetScope", &res, started.elapsed());
        res
    }

    async fn get_scope_inner(
        &self,
        md: &RequestMetadata,
        req: GetScopeRequest,
    ) -> Result<Vec<Scope>> {
        self.require_activated()?;
        let caller = self.authenticated_user(md).await?;
        let caller_is_admin = self.inner.admin_cache.is_admin(&caller.username);
        if !caller_is_admin && self.entitlement_state().await? != EntitlementState::Active {
            return Err(AuthError::EntitlementInactive(
                "only cluster admins can inspect scopes until the entitlement is reactivated",
            ));
        }

        let mut scopes = Vec::with_capacity(req.repos.len());
        for repo in &req.repos {
            let acl = self.acl_or_empty(repo).await?;
            match &req.username {
                None => scopes.push(acl.scope_of(&caller.username)),
                Some(target) => {
                    if !caller_is_admin && acl.scope_of(&caller.username) < Scope::Reader {
                        return Err(AuthError::NotAuthorized {
                            repo: repo.clone(),
                            required: Scope::Reader,
                        });
                    }
                    scopes.push(acl.scope_of(target));
                }
            }
        }
        Ok(scopes)
    }

    /// Grant, change, or remove one user's scope on a repo.
    pub async fn set_scope(&self, md: &RequestMetadata, req: SetScopeRequest) -> Result<()> {
        logging::request("SetScope", &req);
        let started = Instant::now();
        let res = self.set_scope_inner(md, req).await;
        logging::response("SetScope", &res, started.elapsed());
        res
    }

    async fn set_scope_inner(&self, md: &RequestMetadata, req: SetScopeRequest) -> Result<()> {
        self.require_activated()?;
        if req.repo.is_empty() {
            return Err(AuthError::InvalidArgument("must set repo".to_string()));
        }
        validate_usernames([&req.username])?;
        let caller = self.authenticated_user(md).await?;
        let caller_is_admin = self.inner.admin_cache.is_admin(&caller.username);

        // Prerequisites are fetched up front; the transaction body must stay
        // pure because it can run more than once.
        let mut repo_exists = false;
        if !caller_is_admin {
            if self.entitlement_state().await? != EntitlementState::Active {
                return Err(AuthError::EntitlementInactive(
                    "only cluster admins can set a scope until the entitlement is reactivated",
                ));
            }
            repo_exists = self
                .inner
                .repos
                .repo_exists(&req.repo)
                .await
                .map_err(|err| AuthError::Catalog(err.to_string()))?;
        }

        self.inner
            .store
            .stm(|txn| {
                let mut acls = self.inner.acls.txn(txn);
                let mut acl = match acls.get(&req.repo) {
                    Ok(acl) => acl,
                    Err(StoreError::NotFound(_)) => Acl::default(),
                    Err(err) => return Err(err.into()),
                };
                if !caller_is_admin {
                    if !acl.entries.is_empty() {
                        // The repo has an ACL; only its owners may change it.
                        if acl.scope_of(&caller.username) != Scope::Owner {
                            return Err(AuthError::NotAuthorized {
                                repo: req.repo.clone(),
                                required: Scope::Owner,
                            });
                        }
                    } else if repo_exists {
                        // Existing repo without an ACL: nobody short of an
                        // admin may claim it.
                        return Err(AuthError::NotAuthorized {
                            repo: req.repo.clone(),
                            required: Scope::Owner,
                        });
                    } else if req.username != caller.username || req.scope != Scope::Owner {
                        return Err(AuthError::RepoNotFound(req.repo.clone()));
                    }
                    // Remaining case: the repo is being created and the
                    // caller is making themselves its owner.
                }
                if req.scope != Scope::None {
                    acl.entries.insert(req.username.clone(), req.scope);
                } else {
                    acl.entries.remove(&req.username);
                }
                if acl.entries.is_empty() {
                    acls.delete(&req.repo);
                } else {
                    acls.put(&req.repo, &acl)?;
                }
                Ok(())
            })
            .await
    }

    pub async fn get_acl(&self, md: &RequestMetadata, repo: &str) -> Result<Acl> {
        logging::request("GetACL", &repo);
        let started = Instant::now();
        let res = self.get_acl_inner(md, repo).await;
        logging::response("GetACL", &res, started.elapsed());
        res
    }

    async fn get_acl_inner(&self, md: &RequestMetadata, repo: &str) -> Result<Acl> {
        self.require_activated()?;
        if repo.is_empty() {
            return Err(AuthError::InvalidArgument(
                "must provide the name of the repo whose ACL to read".to_string(),
            ));
        }
        let caller = self.authenticated_user(md).await?;
        let caller_is_admin = self.inner.admin_cache.is_admin(&caller.username);
        if !caller_is_admin && self.entitlement_state().await? != EntitlementState::Active {
            return Err(AuthError::EntitlementInactive(
                "only cluster admins can read ACLs until the entitlement is reactivated",
            ));
        }
        let acl = self.acl_or_empty(repo).await?;
        // Reading repo metadata, ACL included, takes reader access.
        if !caller_is_admin && acl.scope_of(&caller.username) < Scope::Reader {
            return Err(AuthError::NotAuthorized {
                repo: repo.to_string(),
                required: Scope::Reader,
            });
        }
        Ok(acl)
    }

    /// Replace a repo's ACL wholesale. An empty replacement deletes the row.
    pub async fn set_acl(&self, md: &RequestMetadata, req: SetAclRequest) -> Result<()> {
        logging::request("SetACL", &req);
        let started = Instant::now();
        let res = self.set_acl_inner(md, req).await;
        logging::response("SetACL", &res, started.elapsed());
        res
    }

    async fn set_acl_inner(&self, md: &RequestMetadata, req: SetAclRequest) -> Result<()> {
        self.require_activated()?;
        if req.repo.is_empty() {
            return Err(AuthError::InvalidArgument(
                "must provide the name of the repo to modify".to_string(),
            ));
        }
        validate_usernames(req.acl.entries.keys())?;
        let caller = self.authenticated_user(md).await?;
        let caller_is_admin = self.inner.admin_cache.is_admin(&caller.username);
        if !caller_is_admin && self.entitlement_state().await? != EntitlementState::Active {
            return Err(AuthError::EntitlementInactive(
                "only cluster admins can set an ACL until the entitlement is reactivated",
            ));
        }

        self.inner
            .store
            .stm(|txn| {
                let mut acls = self.inner.acls.txn(txn);
                let current = match acls.get(&req.repo) {
                    Ok(acl) => acl,
                    Err(StoreError::NotFound(_)) => Acl::default(),
                    Err(err) => return Err(err.into()),
                };
                if !caller_is_admin && current.scope_of(&caller.username) < Scope::Owner {
                    return Err(AuthError::NotAuthorized {
                        repo: req.repo.clone(),
                        required: Scope::Owner,
                    });
                }
                if req.acl.entries.is_empty() {
                    acls.delete(&req.repo);
                } else {
                    acls.put(&req.repo, &req.acl)?;
                }
                Ok(())
            })
            .await
    }

    /// Mint a non-expiring capability bound to a pipeline user. This is the
    /// one operation that works before activation: pipelines created on an
    /// unsecured cluster get capabilities owned by the implicit admin, so
    /// they keep working once auth is turned on.
    pub async fn get_capability(&self, md: &RequestMetadata) -> Result<String> {
        logging::request("GetCapability", &"");
        let started = Instant::now();
        let res = self.get_capability_inner(md).await;
        logging::response("GetCapability", &res, started.elapsed());
        res
    }

    async fn get_capability_inner(&self, md: &RequestMetadata) -> Result<String> {
        let user = if !self.inner.admin_cache.is_activated() {
            User {
                username: MAGIC_USER.to_string(),
                user_type: UserType::Pipeline,
            }
        } else {
            let mut user = self.authenticated_user(md).await?;
            user.user_type = UserType::Pipeline;
            user
        };

        let capability = Uuid::new_v4().simple().to_string();
        self.inner
            .store
            .stm(|txn| {
                self.inner
                    .tokens
                    .txn(txn)
                    .put(&hash_token(&capability), &user)?;
                Ok::<(), AuthError>(())
            })
            .await?;
        Ok(capability)
    }

    /// Revoke a pipeline token. Any authenticated caller may revoke any
    /// pipeline token; human tokens are not revocable here, and revoking a
    /// token that does not exist succeeds.
    pub async fn revoke_token(&self, md: &RequestMetadata, token: &str) -> Result<()> {
        // The request names a credential; log the response only.
        let started = Instant::now();
        let res = self.revoke_token_inner(md, token).await;
        logging::response("RevokeAuthToken", &res, started.elapsed());
        res
    }

    async fn revoke_token_inner(&self, md: &RequestMetadata, token: &str) -> Result<()> {
        self.require_activated()?;
        self.authenticated_user(md).await?;

        let hashed = hash_token(token);
        self.inner
            .store
            .stm(|txn| {
                let mut tokens = self.inner.tokens.txn(txn);
                let user = match tokens.get(&hashed) {
                    Ok(user) => user,
                    Err(StoreError::NotFound(_)) => return Ok(()),
                    Err(err) => return Err(err.into()),
                };
                if user.user_type != UserType::Pipeline {
                    return Err(AuthError::InvalidArgument(
                        "cannot revoke a non-pipeline auth token".to_string(),
                    ));
                }
                tokens.delete(&hashed);
                Ok(())
            })
            .await
    }

    fn require_activated(&self) -> Result<()> {
        if self.inner.admin_cache.is_activated() {
            Ok(())
        } else {
            Err(AuthError::NotActivated)
        }
    }

    async fn entitlement_state(&self) -> Result<EntitlementState> {
        self.inner
            .entitlement
            .get_state()
            .await
            .map_err(|err| AuthError::Entitlement(err.to_string()))
    }

    async fn acl_or_empty(&self, repo: &str) -> Result<Acl> {
        match self.inner.acls.get(repo).await {
            Ok(acl) => Ok(acl),
            Err(StoreError::NotFound(_)) => Ok(Acl::default()),
            Err(err) => Err(err.into()),
        }
    }

    /// Look up the caller behind the bearer token in the request metadata.
    async fn authenticated_user(&self, md: &RequestMetadata) -> Result<User> {
        let token = md.get(TOKEN_METADATA_KEY).ok_or_else(|| {
            AuthError::AuthenticationFailed("no auth token in request metadata".to_string())
        })?;
        match self.inner.tokens.get(&hash_token(token)).await {
            Ok(user) => Ok(user),
            Err(StoreError::NotFound(_)) => Err(AuthError::TokenNotFound),
            Err(err) => Err(err.into()),
        }
    }
}

fn auth_disabled_for_testing() -> bool {
    std::env::var(AUTH_DISABLED_ENV).as_deref() == Ok("true")
}

fn validate_usernames<'a, I>(users: I) -> Result<()>
where
    I: IntoIterator<Item = &'a String>,
{
    for user in users {
        if user.is_empty() {
            return Err(AuthError::InvalidArgument("must set username".to_string()));
        }
        if user == MAGIC_USER {
            return Err(AuthError::InvalidArgument(format!(
                "\"{user}\" is a reserved username"
            )));
        }
    }
    Ok(())
}
