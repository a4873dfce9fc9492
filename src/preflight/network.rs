//! Network connectivity check.
//!
//! Verifies an HTTP artifact repository answers before downloads start.

use std::time::Duration;

use super::CheckResult;
use crate::artifact::http;

/// HEAD `url` with a short timeout.
pub async fn check_network(url: &str, timeout: Duration) -> CheckResult {
    if http::is_reachable(url, timeout).await {
        CheckResult::pass("Network", format!("Artifact repository reachable ({})", host(url)))
    } else {
        CheckResult::fail(
            "Network",
            format!("Artifact repository unreachable ({})", host(url)),
            "Check your network connection or artifact_repository_source",
        )
    }
}

/// Host part of `url` for display.
fn host(url: &str) -> &str {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    rest.split('/').next().unwrap_or(rest)
}
