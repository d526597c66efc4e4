use std::collections::HashSet;

use async_trait::async_trait;
use parking_lot::Mutex;

/// Repository inventory of the data-plane engine. Consulted only by the
/// repo-creation bootstrap rule in `SetScope`: a caller may make themselves
/// owner of a repo that has neither an ACL nor an existing repo record.
#[async_trait]
pub trait RepoCatalog: Send + Sync {
    async fn repo_exists(&self, repo: &str) -> anyhow::Result<bool>;
}

/// Catalog over a plain set of names, for tests and single-node runs.
#[derive(Default)]
pub struct StaticRepoCatalog {
    repos: Mutex<HashSet<String>>,
}

impl StaticRepoCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, repo: &str) {
        self.repos.lock().insert(repo.to_string());
    }
}

#[async_trait]
impl RepoCatalog for StaticRepoCatalog {
    async fn repo_exists(&self, repo: &str) -> anyhow::Result<bool> {
        Ok(self.repos.lock().contains(repo))
    }
}
