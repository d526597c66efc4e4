use async_trait::async_trait;
use serde::Deserialize;

/// When this environment variable is the string "true", the service skips the
/// identity provider entirely and authenticates callers as whatever username
/// they claim. Test clusters only.
pub const AUTH_DISABLED_ENV: &str = "PACHYDERM_AUTHENTICATION_DISABLED_FOR_TESTING";

/// Exchanges an external access credential for a canonical username. The
/// provider is a black box whose only failure mode is "cannot determine
/// user".
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn resolve(&self, access_token: &str) -> anyhow::Result<String>;
}

#[derive(Deserialize)]
struct GithubUser {
    login: String,
}

/// Production resolver backed by the GitHub users API. Returns the account's
/// stable `login` handle; the display name is mutable and may be empty, so it
/// is never used as an identity.
pub struct GithubIdentityProvider {
    http: reqwest::Client,
    api_base: String,
}

impl GithubIdentityProvider {
    pub fn new() -> Self {
        Self::with_api_base("https://api.github.com")
    }

    pub fn with_api_base(api_base: impl Into<String>) -> Self {
        GithubIdentityProvider {
            http: reqwest::Client::new(),
            api_base: api_base.into(),
        }
    }
}

impl Default for GithubIdentityProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IdentityProvider for GithubIdentityProvider {
    async fn resolve(&self, access_token: &str) -> anyhow::Result<String> {
        let user: GithubUser = self
            .http
            .get(format!("{}/user", self.api_base))
            .bearer_auth(access_token)
            .header(reqwest::header::USER_AGENT, "basin-auth")
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if user.login.is_empty() {
            anyhow::bail!("identity provider returned an empty login");
        }
        Ok(user.login)
    }
}
