//! Ordering of commit-hash revisions.
//!
//! Decimal revisions order by value. A hexadecimal hash has no order of its
//! own, so it is mapped to its commit timestamp by a [`RevisionResolver`].

use anyhow::Result;
use std::cell::RefCell;
use std::collections::HashMap;

use super::http;
use crate::config::{RevisionResolverSettings, RunDescriptor};
use crate::error::NimpError;

/// Maps a commit hash to a sortable Unix timestamp.
pub trait RevisionResolver {
    fn commit_timestamp(&self, revision: &str) -> Option<u64>;
}

pub fn is_decimal(revision: &str) -> bool {
    !revision.is_empty() && revision.bytes().all(|b| b.is_ascii_digit())
}

pub fn is_hex(revision: &str) -> bool {
    !revision.is_empty() && revision.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Sort key of `revision`: decimal revisions bypass the resolver, hashes
/// go through it, anything else has no order.
pub fn sort_key(revision: &str, resolver: Option<&dyn RevisionResolver>) -> Option<u64> {
    if is_decimal(revision) {
        return revision.parse().ok();
    }
    match resolver {
        Some(resolver) if is_hex(revision) => resolver.commit_timestamp(revision),
        _ => None,
    }
}

/// Resolver backed by a Gitea-style hosting API
/// (`<host>/repos/<owner>/<repo>/git/commits/<sha>`).
pub struct GiteaResolver {
    host: String,
    token: String,
    owner: String,
    repo: String,
    cache: RefCell<HashMap<String, Option<u64>>>,
}

impl GiteaResolver {
    /// Resolver for the run's branch, if the configuration enables one.
    pub fn from_run(run: &RunDescriptor) -> Result<Option<Self>> {
        let Some(settings) = &run.settings().revision_resolver else {
            return Ok(None);
        };
        let Some(branch) = run.branch() else {
            return Ok(None);
        };
        if !settings.branches.iter().any(|b| b == branch) {
            return Ok(None);
        }
        Self::from_settings(settings).map(Some)
    }

    pub fn from_settings(settings: &RevisionResolverSettings) -> Result<Self> {
        let require = |value: &Option<String>, key: &str| {
            value.clone().ok_or_else(|| {
                NimpError::config(format!("Please configure revision_resolver.{} in project conf", key))
            })
        };
        Ok(Self {
            host: require(&settings.host, "host")?.trim_end_matches('/').to_string(),
            token: require(&settings.access_token, "access_token")?,
            owner: require(&settings.repo_owner, "repo_owner")?,
            repo: require(&settings.repo_name, "repo_name")?,
            cache: RefCell::new(HashMap::new()),
        })
    }

    pub fn commit_url(&self, sha: &str) -> String {
        format!("{}/repos/{}/{}/git/commits/{}", self.host, self.owner, self.repo, sha)
    }

    fn fetch(&self, sha: &str) -> Option<u64> {
        let url = self.commit_url(sha);
        let response = match http::block_on(http::get_json(&url, &self.token)) {
            Ok(Ok(response)) => response,
            Ok(Err(e)) | Err(e) => {
                tracing::debug!("[REVISION] {}@{}@{} {:#}", self.owner, self.repo, sha, e);
                return None;
            }
        };
        let timestamp = response.and_then(|json| committer_timestamp(&json));
        if timestamp.is_none() {
            tracing::debug!("[REVISION] {}@{}@{} not found", self.owner, self.repo, sha);
        }
        timestamp
    }
}

impl RevisionResolver for GiteaResolver {
    fn commit_timestamp(&self, revision: &str) -> Option<u64> {
        if let Some(cached) = self.cache.borrow().get(revision) {
            return *cached;
        }
        let timestamp = self.fetch(revision);
        self.cache.borrow_mut().insert(revision.to_string(), timestamp);
        timestamp
    }
}

/// `commit.committer.date` of a commit response, as Unix seconds.
pub fn committer_timestamp(json: &serde_json::Value) -> Option<u64> {
    let date = json["commit"]["committer"]["date"].as_str()?;
    let parsed = chrono::DateTime::parse_from_rfc3339(date).ok()?;
    u64::try_from(parsed.timestamp()).ok()
}
