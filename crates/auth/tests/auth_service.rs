//! End-to-end exercises of the auth service against an in-process store,
//! with identity resolution in test mode (callers authenticate as whoever
//! they claim to be).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use auth::{
    Acl, AuthError, AuthService, AuthenticateRequest, AuthorizeRequest, EntitlementState,
    GetScopeRequest, IdentityProvider, ModifyAdminsRequest, RequestMetadata, Scope,
    SetAclRequest, SetScopeRequest, StaticOracle, StaticRepoCatalog, MAGIC_USER,
    AUTH_DISABLED_ENV,
};
use store::Store;

const ROOT: &str = "basin";

/// Identity resolution never happens in test mode; fail loudly if it does.
struct NoIdentity;

#[async_trait]
impl IdentityProvider for NoIdentity {
    async fn resolve(&self, _access_token: &str) -> anyhow::Result<String> {
        anyhow::bail!("the identity provider must not be called in test mode")
    }
}

struct Cluster {
    svc: AuthService,
    entitlement: Arc<StaticOracle>,
    repos: Arc<StaticRepoCatalog>,
}

fn cluster() -> Cluster {
    std::env::set_var(AUTH_DISABLED_ENV, "true");
    let store = Store::new();
    let entitlement = Arc::new(StaticOracle::new(EntitlementState::Active));
    let repos = Arc::new(StaticRepoCatalog::new());
    let svc = AuthService::new(
        store,
        ROOT,
        entitlement.clone(),
        Arc::new(NoIdentity),
        repos.clone(),
    );
    Cluster {
        svc,
        entitlement,
        repos,
    }
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

async fn activate(cluster: &Cluster, admins: &[&str]) {
    cluster
        .svc
        .activate(admins.iter().map(|s| s.to_string()).collect())
        .await
        .unwrap();
    let svc = cluster.svc.clone();
    wait_until(move || svc.is_activated()).await;
}

async fn login(svc: &AuthService, username: &str) -> RequestMetadata {
    let token = svc
        .authenticate(AuthenticateRequest {
            provider_token: String::new(),
            username: username.to_string(),
        })
        .await
        .unwrap();
    RequestMetadata::with_token(&token)
}

#[tokio::test]
async fn bootstrap_a_fresh_cluster() {
    let cluster = cluster();
    assert!(!cluster.svc.is_activated());

    activate(&cluster, &["alice"]).await;

    let alice = login(&cluster.svc, "alice").await;
    assert_eq!(
        cluster.svc.get_admins(&alice).await.unwrap(),
        vec!["alice".to_string()]
    );
    assert_eq!(cluster.svc.who_am_i(&alice).await.unwrap(), "alice");

    // Re-activation would let anyone make themselves an admin.
    let res = cluster.svc.activate(vec!["mallory".to_string()]).await;
    assert!(matches!(res, Err(AuthError::AlreadyActivated)));
}

#[tokio::test]
async fn activation_requires_an_active_entitlement() {
    let cluster = cluster();
    cluster.entitlement.set_state(EntitlementState::Expired);
    let res = cluster.svc.activate(vec!["alice".to_string()]).await;
    assert!(matches!(res, Err(AuthError::EntitlementInactive(_))));
    assert!(!cluster.svc.is_activated());
}

#[tokio::test]
async fn requests_before_activation_are_refused() {
    let cluster = cluster();
    let md = RequestMetadata::new();
    let res = cluster
        .svc
        .authorize(
            &md,
            AuthorizeRequest {
                repo: "r".to_string(),
                scope: Scope::Reader,
            },
        )
        .await;
    assert!(matches!(res, Err(AuthError::NotActivated)));
}

#[tokio::test]
async fn capabilities_minted_before_activation_survive_it() {
    let cluster = cluster();

    // No activation yet: the capability is minted for the implicit admin.
    let capability = cluster
        .svc
        .get_capability(&RequestMetadata::new())
        .await
        .unwrap();

    activate(&cluster, &["alice"]).await;

    let pipeline_md = RequestMetadata::with_token(&capability);
    assert_eq!(
        cluster.svc.who_am_i(&pipeline_md).await.unwrap(),
        MAGIC_USER
    );
    let authorized = cluster
        .svc
        .authorize(
            &pipeline_md,
            AuthorizeRequest {
                repo: "r".to_string(),
                scope: Scope::Owner,
            },
        )
        .await
        .unwrap();
    assert!(authorized, "the implicit admin owns every repo");
}

#[tokio::test]
async fn scopes_gate_authorization() {
    let cluster = cluster();
    activate(&cluster, &["alice"]).await;
    let alice = login(&cluster.svc, "alice").await;

    cluster
        .svc
        .set_scope(
            &alice,
            SetScopeRequest {
                repo: "r".to_string(),
                username: "bob".to_string(),
                scope: Scope::Reader,
            },
        )
        .await
        .unwrap();

    let bob = login(&cluster.svc, "bob").await;
    let read = cluster
        .svc
        .authorize(
            &bob,
            AuthorizeRequest {
                repo: "r".to_string(),
                scope: Scope::Reader,
            },
        )
        .await
        .unwrap();
    assert!(read);
    let write = cluster
        .svc
        .authorize(
            &bob,
            AuthorizeRequest {
                repo: "r".to_string(),
                scope: Scope::Writer,
            },
        )
        .await
        .unwrap();
    assert!(!write);

    // A repo nobody ever mentioned behaves like one with an empty ACL.
    let elsewhere = cluster
        .svc
        .authorize(
            &bob,
            AuthorizeRequest {
                repo: "untouched".to_string(),
                scope: Scope::Reader,
            },
        )
        .await
        .unwrap();
    assert!(!elsewhere);
}

#[tokio::test]
async fn set_scope_round_trips_and_none_removes_the_entry() {
    let cluster = cluster();
    activate(&cluster, &["alice"]).await;
    let alice = login(&cluster.svc, "alice").await;

    for (user, scope) in [("bob", Scope::Reader), ("carol", Scope::Writer)] {
        cluster
            .svc
            .set_scope(
                &alice,
                SetScopeRequest {
                    repo: "r".to_string(),
                    username: user.to_string(),
                    scope,
                },
            )
            .await
            .unwrap();
    }

    let scopes = cluster
        .svc
        .get_scope(
            &alice,
            GetScopeRequest {
                repos: vec!["r".to_string()],
                username: Some("bob".to_string()),
            },
        )
        .await
        .unwrap();
    assert_eq!(scopes, vec![Scope::Reader]);

    cluster
        .svc
        .set_scope(
            &alice,
            SetScopeRequest {
                repo: "r".to_string(),
                username: "bob".to_string(),
                scope: Scope::None,
            },
        )
        .await
        .unwrap();
    let scopes = cluster
        .svc
        .get_scope(
            &alice,
            GetScopeRequest {
                repos: vec!["r".to_string()],
                username: Some("bob".to_string()),
            },
        )
        .await
        .unwrap();
    assert_eq!(scopes, vec![Scope::None]);

    let acl = cluster.svc.get_acl(&alice, "r").await.unwrap();
    assert!(!acl.entries.contains_key("bob"));
    assert_eq!(acl.entries.get("carol"), Some(&Scope::Writer));
}

#[tokio::test]
async fn repo_creation_bootstrap() {
    let cluster = cluster();
    activate(&cluster, &["alice"]).await;

    // The repo has no ACL and does not exist: carol may create it and claim
    // ownership of it in one step.
    let carol = login(&cluster.svc, "carol").await;
    cluster
        .svc
        .set_scope(
            &carol,
            SetScopeRequest {
                repo: "new".to_string(),
                username: "carol".to_string(),
                scope: Scope::Owner,
            },
        )
        .await
        .unwrap();
    let scopes = cluster
        .svc
        .get_scope(
            &carol,
            GetScopeRequest {
                repos: vec!["new".to_string()],
                username: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(scopes, vec![Scope::Owner]);

    // An existing repo without an ACL cannot be claimed.
    cluster.repos.add("existing");
    let dave = login(&cluster.svc, "dave").await;
    let res = cluster
        .svc
        .set_scope(
            &dave,
            SetScopeRequest {
                repo: "existing".to_string(),
                username: "dave".to_string(),
                scope: Scope::Owner,
            },
        )
        .await;
    assert!(matches!(res, Err(AuthError::NotAuthorized { .. })));

    // The bootstrap only covers a caller claiming ownership for themselves.
    let res = cluster
        .svc
        .set_scope(
            &dave,
            SetScopeRequest {
                repo: "someone-elses".to_string(),
                username: "carol".to_string(),
                scope: Scope::Owner,
            },
        )
        .await;
    assert!(matches!(res, Err(AuthError::RepoNotFound(_))));
}

#[tokio::test]
async fn the_last_admin_cannot_be_removed() {
    let cluster = cluster();
    activate(&cluster, &["alice"]).await;
    let alice = login(&cluster.svc, "alice").await;

    let res = cluster
        .svc
        .modify_admins(
            &alice,
            ModifyAdminsRequest {
                add: vec![],
                remove: vec!["alice".to_string()],
            },
        )
        .await;
    assert!(matches!(res, Err(AuthError::InvalidArgument(_))));

    // Replacing the whole set in one request is fine.
    cluster
        .svc
        .modify_admins(
            &alice,
            ModifyAdminsRequest {
                add: vec!["bob".to_string()],
                remove: vec!["alice".to_string()],
            },
        )
        .await
        .unwrap();
    let svc = cluster.svc.clone();
    wait_until(move || svc.is_admin("bob") && !svc.is_admin("alice")).await;
}

#[tokio::test]
async fn expired_entitlement_leaves_admins_and_pipelines_working() {
    let cluster = cluster();
    activate(&cluster, &["alice"]).await;
    let alice = login(&cluster.svc, "alice").await;
    let bob = login(&cluster.svc, "bob").await;
    // Bob's pipeline capability, minted while everything was licensed.
    let capability = cluster.svc.get_capability(&bob).await.unwrap();
    cluster
        .svc
        .set_scope(
            &alice,
            SetScopeRequest {
                repo: "r".to_string(),
                username: "bob".to_string(),
                scope: Scope::Reader,
            },
        )
        .await
        .unwrap();

    cluster.entitlement.set_state(EntitlementState::Expired);

    // Non-admin humans are locked out of ACL changes.
    let res = cluster
        .svc
        .set_acl(
            &bob,
            SetAclRequest {
                repo: "r".to_string(),
                acl: Acl::default(),
            },
        )
        .await;
    assert!(matches!(res, Err(AuthError::EntitlementInactive(_))));
    let res = cluster
        .svc
        .authorize(
            &bob,
            AuthorizeRequest {
                repo: "r".to_string(),
                scope: Scope::Reader,
            },
        )
        .await;
    assert!(matches!(res, Err(AuthError::EntitlementInactive(_))));

    // Admins keep full control.
    cluster
        .svc
        .set_acl(
            &alice,
            SetAclRequest {
                repo: "r".to_string(),
                acl: Acl {
                    entries: [("bob".to_string(), Scope::Reader)].into_iter().collect(),
                },
            },
        )
        .await
        .unwrap();

    // Pipelines keep running.
    let pipeline_md = RequestMetadata::with_token(&capability);
    let authorized = cluster
        .svc
        .authorize(
            &pipeline_md,
            AuthorizeRequest {
                repo: "r".to_string(),
                scope: Scope::Reader,
            },
        )
        .await
        .unwrap();
    assert!(authorized);
}

#[tokio::test]
async fn only_pipeline_tokens_can_be_revoked() {
    let cluster = cluster();
    activate(&cluster, &["alice"]).await;
    let alice = login(&cluster.svc, "alice").await;

    let bob = login(&cluster.svc, "bob").await;
    let capability = cluster.svc.get_capability(&bob).await.unwrap();

    // Human tokens are not revocable through this endpoint.
    let bob_token = cluster
        .svc
        .authenticate(AuthenticateRequest {
            provider_token: String::new(),
            username: "bob".to_string(),
        })
        .await
        .unwrap();
    let res = cluster.svc.revoke_token(&alice, &bob_token).await;
    assert!(matches!(res, Err(AuthError::InvalidArgument(_))));

    cluster.svc.revoke_token(&alice, &capability).await.unwrap();
    let res = cluster
        .svc
        .who_am_i(&RequestMetadata::with_token(&capability))
        .await;
    assert!(matches!(res, Err(AuthError::TokenNotFound)));

    // Revoking a token that is already gone succeeds.
    cluster.svc.revoke_token(&alice, &capability).await.unwrap();
}

#[tokio::test]
async fn acl_reads_require_reader_access() {
    let cluster = cluster();
    activate(&cluster, &["alice"]).await;
    let alice = login(&cluster.svc, "alice").await;
    cluster
        .svc
        .set_scope(
            &alice,
            SetScopeRequest {
                repo: "r".to_string(),
                username: "bob".to_string(),
                scope: Scope::Reader,
            },
        )
        .await
        .unwrap();

    let bob = login(&cluster.svc, "bob").await;
    let acl = cluster.svc.get_acl(&bob, "r").await.unwrap();
    assert_eq!(acl.entries.get("bob"), Some(&Scope::Reader));

    let mallory = login(&cluster.svc, "mallory").await;
    let res = cluster.svc.get_acl(&mallory, "r").await;
    assert!(matches!(
        res,
        Err(AuthError::NotAuthorized {
            required: Scope::Reader,
            ..
        })
    ));
}

#[tokio::test]
async fn owners_replace_acls_and_empty_acls_delete_the_row() {
    let cluster = cluster();
    activate(&cluster, &["alice"]).await;

    let carol = login(&cluster.svc, "carol").await;
    cluster
        .svc
        .set_scope(
            &carol,
            SetScopeRequest {
                repo: "mine".to_string(),
                username: "carol".to_string(),
                scope: Scope::Owner,
            },
        )
        .await
        .unwrap();

    cluster
        .svc
        .set_acl(
            &carol,
            SetAclRequest {
                repo: "mine".to_string(),
                acl: Acl {
                    entries: [
                        ("carol".to_string(), Scope::Owner),
                        ("bob".to_string(), Scope::Writer),
                    ]
                    .into_iter()
                    .collect(),
                },
            },
        )
        .await
        .unwrap();

    // Writers may not replace the ACL.
    let bob = login(&cluster.svc, "bob").await;
    let res = cluster
        .svc
        .set_acl(
            &bob,
            SetAclRequest {
                repo: "mine".to_string(),
                acl: Acl::default(),
            },
        )
        .await;
    assert!(matches!(
        res,
        Err(AuthError::NotAuthorized {
            required: Scope::Owner,
            ..
        })
    ));

    // An empty replacement deletes the row, after which the repo reads as
    // having an empty ACL.
    cluster
        .svc
        .set_acl(
            &carol,
            SetAclRequest {
                repo: "mine".to_string(),
                acl: Acl::default(),
            },
        )
        .await
        .unwrap();
    let alice = login(&cluster.svc, "alice").await;
    let acl = cluster.svc.get_acl(&alice, "mine").await.unwrap();
    assert!(acl.entries.is_empty());
}

#[tokio::test]
async fn deactivation_wipes_the_cluster() {
    let cluster = cluster();
    activate(&cluster, &["alice"]).await;
    let alice = login(&cluster.svc, "alice").await;

    let bob = login(&cluster.svc, "bob").await;
    let res = cluster.svc.deactivate(&bob).await;
    assert!(matches!(res, Err(AuthError::AdminRequired(_))));

    cluster.svc.deactivate(&alice).await.unwrap();
    let svc = cluster.svc.clone();
    wait_until(move || !svc.is_activated()).await;

    let res = cluster.svc.who_am_i(&alice).await;
    assert!(matches!(res, Err(AuthError::NotActivated)));

    // Capabilities can still be minted on a deactivated cluster.
    cluster
        .svc
        .get_capability(&RequestMetadata::new())
        .await
        .unwrap();
}

#[tokio::test]
async fn the_magic_user_cannot_log_in_or_be_named() {
    let cluster = cluster();
    activate(&cluster, &["alice"]).await;

    let res = cluster
        .svc
        .authenticate(AuthenticateRequest {
            provider_token: String::new(),
            username: MAGIC_USER.to_string(),
        })
        .await;
    assert!(matches!(res, Err(AuthError::InvalidArgument(_))));

    let alice = login(&cluster.svc, "alice").await;
    let res = cluster
        .svc
        .modify_admins(
            &alice,
            ModifyAdminsRequest {
                add: vec![MAGIC_USER.to_string()],
                remove: vec![],
            },
        )
        .await;
    assert!(matches!(res, Err(AuthError::InvalidArgument(_))));

    let res = cluster
        .svc
        .set_scope(
            &alice,
            SetScopeRequest {
                repo: "r".to_string(),
                username: MAGIC_USER.to_string(),
                scope: Scope::Reader,
            },
        )
        .await;
    assert!(matches!(res, Err(AuthError::InvalidArgument(_))));
}

#[tokio::test]
async fn requests_without_a_token_fail_authentication() {
    let cluster = cluster();
    activate(&cluster, &["alice"]).await;

    let res = cluster.svc.get_admins(&RequestMetadata::new()).await;
    assert!(matches!(res, Err(AuthError::AuthenticationFailed(_))));

    let res = cluster
        .svc
        .who_am_i(&RequestMetadata::with_token("no-such-token"))
        .await;
    assert!(matches!(res, Err(AuthError::TokenNotFound)));
}
