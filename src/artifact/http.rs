//! HTTP access to artifact repositories served as directory listings.
//!
//! The requests are async; the synchronous pipeline drives each one on a
//! current-thread runtime built for the call.

use anyhow::{Context, Result};
use regex::Regex;
use std::fs::File;
use std::future::Future;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use crate::error::NimpError;

pub fn is_http(uri: &str) -> bool {
    uri.starts_with("http://") || uri.starts_with("https://")
}

/// Run `future` to completion on a runtime scoped to this call.
pub fn block_on<F: Future>(future: F) -> Result<F::Output> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start HTTP runtime")?;
    Ok(runtime.block_on(future))
}

fn client() -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(30))
        .build()
        .map_err(NimpError::from)?)
}

async fn get(url: &str) -> Result<reqwest::Response> {
    let response = client()?
        .get(url)
        .send()
        .await
        .map_err(|e| NimpError::Network(format!("GET {} failed: {}", url, e)))?;
    if !response.status().is_success() {
        return Err(NimpError::Network(format!("GET {} returned {}", url, response.status())).into());
    }
    Ok(response)
}

/// Entry names of a directory listing page; directories keep their `/`.
pub fn parse_listing(html: &str) -> Result<Vec<String>> {
    let anchor = Regex::new(r#"<a href="(?P<file_name>[^"/\\?]+/?)">"#)?;
    Ok(html
        .lines()
        .filter_map(|line| anchor.captures(line))
        .map(|captures| captures["file_name"].to_string())
        .filter(|name| name != "../" && name != "./")
        .collect())
}

pub async fn list_directory(url: &str) -> Result<Vec<String>> {
    let body = get(url)
        .await?
        .text()
        .await
        .map_err(|e| NimpError::Network(format!("Reading {} failed: {}", url, e)))?;
    parse_listing(&body)
}

/// Stream `url` into `output`.
pub async fn download(url: &str, output: &Path) -> Result<()> {
    let mut response = get(url).await?;
    let mut file = File::create(output)
        .with_context(|| format!("Failed to create {}", output.display()))?;
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| NimpError::Network(format!("Downloading {} failed: {}", url, e)))?
    {
        file.write_all(&chunk)?;
    }
    file.flush()?;
    Ok(())
}

/// Whether `url` answers a HEAD request with a success status in time.
pub async fn is_reachable(url: &str, timeout: Duration) -> bool {
    let Ok(client) = reqwest::Client::builder().timeout(timeout).build() else {
        return false;
    };
    matches!(client.head(url).send().await, Ok(response) if response.status().is_success())
}

/// GET `url` with a token and decode the JSON body.
pub async fn get_json(url: &str, token: &str) -> Result<Option<serde_json::Value>> {
    let response = client()?
        .get(url)
        .header("Authorization", format!("token {}", token))
        .send()
        .await
        .map_err(|e| NimpError::Network(format!("GET {} failed: {}", url, e)))?;
    if response.status() == reqwest::StatusCode::NOT_FOUND {
        return Ok(None);
    }
    if !response.status().is_success() {
        return Err(NimpError::Network(format!("GET {} returned {}", url, response.status())).into());
    }
    Ok(Some(response.json().await.map_err(NimpError::from)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_listing() {
        let html = r#"<html><body>
<a href="../">../</a>
<a href="1234/">1234/</a>
<a href="1235.zip">1235.zip</a>
<a href="?C=M;O=A">sort</a>
</body></html>"#;
        assert_eq!(parse_listing(html).unwrap(), vec!["1234/", "1235.zip"]);
    }

    #[test]
    fn test_is_http() {
        assert!(is_http("https://artifacts/binaries"));
        assert!(!is_http("//share/artifacts"));
    }

    #[test]
    fn test_block_on() {
        assert_eq!(block_on(async { 2 + 2 }).unwrap(), 4);
    }
}
