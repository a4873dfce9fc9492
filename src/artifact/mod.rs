//! Artifact store.
//!
//! Artifacts are filesets published under a URI pattern containing
//! `{revision}`, either as a directory tree or as a single zip, on a
//! filesystem share or behind an HTTP directory listing.
//!
//! - `archive` - zip writing, CRC verification and extraction
//! - `torrent` - BitTorrent metainfo sidecars
//! - `hash` - digest sidecars
//! - `http` - directory listings and downloads over HTTP
//! - `resolver` - ordering of commit-hash revisions

pub mod archive;
pub mod hash;
pub mod http;
pub mod resolver;
pub mod torrent;

use anyhow::{bail, Context, Result};
use regex::Regex;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::config::RunDescriptor;
use crate::error::NimpError;
use crate::fileset::FileMapper;
use crate::fsutil::{self, standardize_path};
use crate::retry::{self, RetryPolicy};
use crate::status::{TrackKind, WorkspaceStatus};

pub use hash::HashMethod;
pub use resolver::{GiteaResolver, RevisionResolver};

/// A published artifact found by [`list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub revision: String,
    /// `None` for hash revisions without a resolver; those only match
    /// exactly.
    pub sort_key: Option<u64>,
    pub uri: String,
}

/// Regex matching artifact names for the basename of a pattern.
pub fn name_pattern(basename: &str) -> Result<Regex> {
    let escaped = regex::escape(basename);
    let placeholder = regex::escape("{revision}");
    let with_group = escaped.replacen(&placeholder, "(?P<revision>[a-zA-Z0-9]+)", 1);
    let with_group = with_group.replace(&placeholder, "[a-zA-Z0-9]+");
    Ok(Regex::new(&format!(r"^{}(\.zip)?$", with_group))?)
}

fn split_uri(uri: &str) -> (&str, &str) {
    match uri.rfind('/') {
        Some(index) => (&uri[..index], &uri[index + 1..]),
        None => (".", uri),
    }
}

/// Entries of a directory, filesystem or HTTP. Directories end with `/`.
pub fn list_files(source: &str, recursive: bool) -> Result<Vec<String>> {
    let source = source.trim_end_matches('/');
    let mut all = Vec::new();

    if http::is_http(source) {
        for name in http::block_on(http::list_directory(&format!("{}/", source)))?? {
            let path = format!("{}/{}", source, name);
            let is_dir = path.ends_with('/');
            all.push(path.clone());
            if recursive && is_dir {
                all.extend(list_files(&path, true)?);
            }
        }
        return Ok(all);
    }

    let mut entries: Vec<_> = fs::read_dir(source)
        .with_context(|| format!("Failed to list {}", source))?
        .filter_map(|entry| entry.ok())
        .collect();
    entries.sort_by_key(|entry| entry.file_name());
    for entry in entries {
        let path = format!("{}/{}", source, entry.file_name().to_string_lossy());
        if entry.path().is_dir() {
            all.push(format!("{}/", path));
            if recursive {
                all.extend(list_files(&path, true)?);
            }
        } else {
            all.push(path);
        }
    }
    Ok(all)
}

/// Artifacts published under `pattern` (already formatted except for
/// `{revision}`).
pub fn list(pattern: &str, resolver: Option<&dyn RevisionResolver>) -> Result<Vec<Artifact>> {
    let pattern = standardize_path(pattern);
    let (source, basename) = split_uri(&pattern);
    let matcher = name_pattern(basename)?;

    let mut artifacts = Vec::new();
    for uri in list_files(source, false)? {
        let name = uri.trim_end_matches('/').rsplit('/').next().unwrap_or_default();
        let Some(captures) = matcher.captures(name) else {
            continue;
        };
        let revision = captures["revision"].to_string();
        let sort_key = resolver::sort_key(&revision, resolver);
        if resolver.is_some() && resolver::is_hex(&revision) && sort_key.is_none() {
            continue;
        }
        artifacts.push(Artifact {
            revision,
            sort_key,
            uri,
        });
    }
    Ok(artifacts)
}

/// Revision constraints for [`select`].
#[derive(Debug, Clone, Default)]
pub struct RevisionQuery {
    pub exact: Option<String>,
    pub min: Option<String>,
    pub max: Option<String>,
}

impl RevisionQuery {
    fn is_empty(&self) -> bool {
        self.exact.is_none() && self.min.is_none() && self.max.is_none()
    }
}

/// Latest artifact satisfying `query`.
pub fn select(
    mut artifacts: Vec<Artifact>,
    query: &RevisionQuery,
    resolver: Option<&dyn RevisionResolver>,
) -> Result<Artifact> {
    artifacts.sort_by(|a, b| {
        b.sort_key
            .cmp(&a.sort_key)
            .then_with(|| b.revision.cmp(&a.revision))
    });

    let resolve = |r: &Option<String>| r.as_deref().and_then(|r| resolver::sort_key(r, resolver));
    let (exact, min, max) = (resolve(&query.exact), resolve(&query.min), resolve(&query.max));
    if resolver.is_some() && !query.is_empty() && exact.is_none() && min.is_none() && max.is_none() {
        bail!(NimpError::NotFound("Searched commit not found on the revision resolver".to_string()));
    }

    let found = if let Some(wanted) = &query.exact {
        artifacts
            .into_iter()
            .find(|a| &a.revision == wanted || (exact.is_some() && a.sort_key == exact))
    } else if query.min.is_some() || query.max.is_some() {
        artifacts.into_iter().find(|a| match a.sort_key {
            Some(key) => min.map_or(true, |m| key >= m) && max.map_or(true, |m| key <= m),
            None => false,
        })
    } else {
        artifacts.into_iter().next()
    };
    found.ok_or_else(|| NimpError::NotFound("Matching artifact not found".to_string()).into())
}

/// Local download directory for an artifact URI.
pub fn download_path(root_dir: &Path, uri: &str) -> PathBuf {
    let name = uri.trim_end_matches('/').rsplit('/').next().unwrap_or_default();
    let name = name.strip_suffix(".zip").unwrap_or(name);
    let digest = hex::encode(Sha256::digest(name.as_bytes()));
    root_dir.join(".nimp").join("downloads").join(&digest[..10])
}

fn download_file(uri: &str, output: &Path) -> Result<()> {
    if output.exists() {
        fs::remove_file(output)?;
    }
    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent)?;
    }
    if http::is_http(uri) {
        http::block_on(http::download(uri, output))?
    } else {
        fs::copy(uri, output).with_context(|| format!("Failed to copy {} to {}", uri, output.display()))?;
        Ok(())
    }
}

/// Fetch an artifact into `<root>/.nimp/downloads/` and return the local
/// directory.
pub fn download(root_dir: &Path, uri: &str) -> Result<PathBuf> {
    let local = download_path(root_dir, uri);
    let local_zip = local.with_extension("zip");
    if local_zip.exists() {
        fs::remove_file(&local_zip)?;
    }
    if local.exists() {
        fs::remove_dir_all(&local)?;
    }

    if uri.ends_with(".zip") {
        download_file(uri, &local_zip)?;
        archive::extract(&local_zip, &local)?;
        fs::remove_file(&local_zip)?;
    } else {
        let base = format!("{}/", uri.trim_end_matches('/'));
        for file_uri in list_files(&base, true)?.into_iter().filter(|u| !u.ends_with('/')) {
            let relative = &file_uri[base.len()..];
            download_file(&file_uri, &local.join(relative))?;
        }
        fs::create_dir_all(&local)?;
    }
    Ok(local)
}

/// Move every file of `artifact` into `destination`, replacing existing
/// files.
pub fn install(artifact: &Path, destination: &Path) -> Result<()> {
    if !artifact.exists() {
        bail!(NimpError::NotFound(format!("Artifact does not exist: {}", artifact.display())));
    }
    for entry in WalkDir::new(artifact).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry.path().strip_prefix(artifact).unwrap_or(entry.path());
        let target = destination.join(relative);
        tracing::debug!("Installing {} to {}", entry.path().display(), target.display());
        fsutil::move_file(entry.path(), &target)?;
        if cfg!(unix) && fsutil::is_executable_content(&target) {
            if let Err(e) = fsutil::make_executable(&target) {
                tracing::warn!("Failed to make file executable: {} ({})", e, target.display());
            }
        }
    }
    Ok(())
}

fn exists(artifact_path: &str) -> bool {
    Path::new(&format!("{}.zip", artifact_path)).is_file() || Path::new(artifact_path).is_dir()
}

/// Publish `files` (`(source, destination)`) at `artifact_path`, through a
/// `.tmp` sibling renamed into place.
pub fn create(artifact_path: &str, files: &[(String, String)], archive: bool, compress: bool, dry_run: bool) -> Result<()> {
    if exists(artifact_path) {
        bail!(NimpError::config(format!("Artifact already exists: {}", artifact_path)));
    }

    if dry_run {
        for (source, destination) in files {
            if !Path::new(source).is_dir() {
                tracing::debug!("Adding {} as {}", source, destination);
            }
        }
        return Ok(());
    }

    let zip_tmp = PathBuf::from(format!("{}.zip.tmp", artifact_path));
    let dir_tmp = PathBuf::from(format!("{}.tmp", artifact_path));
    if zip_tmp.is_file() {
        fs::remove_file(&zip_tmp)?;
    }
    if dir_tmp.is_dir() {
        fs::remove_dir_all(&dir_tmp)?;
    }

    let (temporary, target) = if archive {
        archive::write(&zip_tmp, files, compress)?;
        archive::verify(&zip_tmp)?;
        (zip_tmp, PathBuf::from(format!("{}.zip", artifact_path)))
    } else {
        for (source, destination) in files {
            if Path::new(source).is_dir() {
                continue;
            }
            tracing::debug!("Adding {} as {}", source, destination);
            let target = dir_tmp.join(destination);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(source, &target).with_context(|| format!("Failed to copy {}", source))?;
        }
        (dir_tmp, PathBuf::from(artifact_path))
    };

    tracing::debug!("Renaming {} to {}", temporary.display(), target.display());
    retry::try_execute(RetryPolicy::RENAME, retry::is_transient, || {
        fs::rename(&temporary, &target)
            .with_context(|| format!("Failed to rename {} to {}", temporary.display(), target.display()))
    })
}

/// Options of `upload-fileset`.
#[derive(Debug, Clone, Default)]
pub struct UploadOptions {
    pub archive: bool,
    pub compress: bool,
    pub torrent: bool,
    pub hash: Option<HashMethod>,
    pub force: bool,
    /// `(index, count)` of a sliced job.
    pub slice: Option<(u32, u32)>,
}

fn collection_pattern(run: &RunDescriptor, fileset: &str) -> Result<String> {
    run.settings()
        .artifact_collection
        .get(fileset)
        .cloned()
        .ok_or_else(|| NimpError::config(format!("No artifact_collection entry for fileset \"{}\"", fileset)).into())
}

/// Publish a fileset to `{artifact_repository_destination}`; returns the
/// artifact path.
pub fn upload_fileset(run: &RunDescriptor, fileset: &str, options: &UploadOptions) -> Result<String> {
    run.require_parameter("artifact_repository_destination")?;
    let mut pattern = format!("{{artifact_repository_destination}}/{}", collection_pattern(run, fileset)?);
    if let Some((index, count)) = options.slice {
        pattern = format!("{}/slice-{}-of-{}", pattern, index, count);
    }
    let artifact_path = standardize_path(&run.format(&pattern)?);

    if exists(&artifact_path) {
        if !options.force {
            bail!(NimpError::config(format!("Artifact already exists: {}", artifact_path)));
        }
        for stale in [
            format!("{}.torrent", artifact_path),
            format!("{}.zip.hash", artifact_path),
            format!("{}.zip", artifact_path),
            artifact_path.clone(),
        ] {
            fsutil::try_remove(&stale, run.dry_run())?;
        }
    }

    tracing::info!("Listing files for {}", artifact_path);
    let mapper = FileMapper::load(run, fileset, &BTreeMap::new())?;
    let files = mapper.to_list(&run.root_dir().to_string_lossy(), ".")?;
    if files.is_empty() {
        bail!(NimpError::NotFound("Found no files to upload".to_string()));
    }

    tracing::info!("Uploading to {}", artifact_path);
    if !run.dry_run() {
        if let Some(parent) = Path::new(&artifact_path).parent() {
            fs::create_dir_all(parent)?;
        }
    }
    retry::try_execute(RetryPolicy::NETWORK, retry::is_transient, || {
        create(&artifact_path, &files, options.archive, options.compress, run.dry_run())
    })?;

    if options.torrent {
        tracing::info!("Creating torrent for {}", artifact_path);
        let announce = run.parameter("torrent_tracker_announce");
        retry::try_execute(RetryPolicy::NETWORK, retry::is_transient, || {
            torrent::create(&artifact_path, announce, run.dry_run())
        })?;
    }
    if let Some(method) = options.hash {
        tracing::info!("Creating hash for {}", artifact_path);
        hash::create(&artifact_path, method, run.dry_run())?;
    }
    Ok(artifact_path)
}

/// Options of `download-fileset`.
#[derive(Debug, Clone, Default)]
pub struct DownloadOptions {
    pub query: RevisionQuery,
    /// Relative to the root directory.
    pub destination: Option<String>,
    pub track: Option<TrackKind>,
}

/// Find, download and install a published fileset; returns the artifact
/// that was installed.
pub fn download_fileset(run: &RunDescriptor, fileset: &str, options: &DownloadOptions) -> Result<Artifact> {
    run.require_parameter("artifact_repository_source")?;
    let resolver = GiteaResolver::from_run(run)?;
    let resolver = resolver.as_ref().map(|r| r as &dyn RevisionResolver);

    let overlay = BTreeMap::from([("revision".to_string(), "{revision}".to_string())]);
    let template = format!("{{artifact_repository_source}}/{}", collection_pattern(run, fileset)?);
    let pattern = run.format_with(&template, &overlay)?;
    tracing::info!("Searching {}", pattern.replace("{revision}", "*"));

    let artifacts = retry::try_execute(RetryPolicy::NETWORK, retry::is_transient, || list(&pattern, resolver))?;
    let artifact = select(artifacts, &options.query, resolver)?;

    let mut install_directory = run.root_dir().to_path_buf();
    if let Some(destination) = &options.destination {
        install_directory = install_directory.join(run.format(destination)?);
    }

    let simulation = if run.dry_run() { " (simulation)" } else { "" };
    tracing::info!("Downloading {}{}", artifact.uri, simulation);
    tracing::info!("Installing {} in {}{}", artifact.uri, install_directory.display(), simulation);
    if !run.dry_run() {
        let local = retry::try_execute(RetryPolicy::NETWORK, retry::is_transient, || {
            download(run.root_dir(), &artifact.uri)
        })?;
        install(&local, &install_directory)?;
        fsutil::remove_best_effort(&local);
    }

    if let Some(kind) = options.track {
        let mut status = WorkspaceStatus::load(run.root_dir())?;
        status.track(kind, run.platform().name(), &artifact.revision, run.variant(), &artifact.uri);
        status.save(run.root_dir())?;
    }
    Ok(artifact)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigFile;
    use crate::platform::Platform;
    use tempfile::TempDir;

    struct Timestamps;

    impl RevisionResolver for Timestamps {
        fn commit_timestamp(&self, revision: &str) -> Option<u64> {
            match revision {
                "aaa111" => Some(100),
                "bbb222" => Some(200),
                "ccc333" => Some(300),
                _ => None,
            }
        }
    }

    fn artifact(revision: &str, key: Option<u64>) -> Artifact {
        Artifact {
            revision: revision.to_string(),
            sort_key: key,
            uri: format!("//share/{}", revision),
        }
    }

    fn decimal_set() -> Vec<Artifact> {
        ["10", "12", "9", "15"]
            .iter()
            .map(|r| artifact(r, r.parse().ok()))
            .collect()
    }

    fn query(exact: Option<&str>, min: Option<&str>, max: Option<&str>) -> RevisionQuery {
        RevisionQuery {
            exact: exact.map(str::to_string),
            min: min.map(str::to_string),
            max: max.map(str::to_string),
        }
    }

    #[test]
    fn test_name_pattern() {
        let re = name_pattern("Game-{revision}-win64").unwrap();
        assert_eq!(&re.captures("Game-1234-win64.zip").unwrap()["revision"], "1234");
        assert!(re.is_match("Game-abc-win64"));
        assert!(!re.is_match("Game-1234-win64.tar"));
        assert!(!re.is_match("Game-12.34-win64"));
    }

    #[test]
    fn test_select_latest_and_bounds() {
        assert_eq!(select(decimal_set(), &RevisionQuery::default(), None).unwrap().revision, "15");
        assert_eq!(select(decimal_set(), &query(None, None, Some("11")), None).unwrap().revision, "10");
        assert_eq!(select(decimal_set(), &query(None, Some("11"), Some("14")), None).unwrap().revision, "12");
        assert_eq!(select(decimal_set(), &query(Some("9"), None, None), None).unwrap().revision, "9");
        let err = select(decimal_set(), &query(None, Some("16"), None), None).unwrap_err();
        assert!(err.to_string().contains("Matching artifact not found"));
    }

    #[test]
    fn test_select_hashes_through_resolver() {
        let set: Vec<Artifact> = ["aaa111", "ccc333", "bbb222"]
            .iter()
            .map(|r| artifact(r, resolver::sort_key(r, Some(&Timestamps))))
            .collect();
        assert_eq!(select(set.clone(), &RevisionQuery::default(), Some(&Timestamps)).unwrap().revision, "ccc333");
        assert_eq!(
            select(set.clone(), &query(None, None, Some("bbb222")), Some(&Timestamps)).unwrap().revision,
            "bbb222"
        );
        assert!(select(set, &query(Some("fff999"), None, None), Some(&Timestamps)).is_err());
    }

    #[test]
    fn test_hash_without_resolver_matches_exactly() {
        let set = vec![artifact("abc123", None), artifact("def456", None)];
        assert_eq!(select(set.clone(), &query(Some("def456"), None, None), None).unwrap().revision, "def456");
        assert!(select(set, &query(None, Some("1"), None), None).is_err());
    }

    #[test]
    fn test_list_filesystem() {
        let dir = TempDir::new().unwrap();
        let store = dir.path().join("binaries-win64");
        fs::create_dir_all(store.join("100")).unwrap();
        fs::write(store.join("101.zip"), b"").unwrap();
        fs::write(store.join("101.zip.hash"), b"").unwrap();
        fs::write(store.join("notes.txt"), b"").unwrap();

        let pattern = format!("{}/{{revision}}", store.display());
        let found = list(&pattern, None).unwrap();
        let revisions: Vec<&str> = found.iter().map(|a| a.revision.as_str()).collect();
        assert_eq!(revisions, vec!["100", "101"]);
        assert!(found[0].uri.ends_with("100/"));
    }

    #[test]
    fn test_create_refuses_existing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("1").to_string_lossy().into_owned();
        fs::create_dir_all(&path).unwrap();
        assert!(create(&path, &[], false, false, false).is_err());
    }

    #[test]
    fn test_dry_run_creates_nothing() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("a.txt");
        fs::write(&src, b"a").unwrap();
        let path = dir.path().join("1").to_string_lossy().into_owned();
        create(&path, &[(src.to_string_lossy().into_owned(), "a.txt".into())], true, true, true).unwrap();
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    fn workspace() -> (TempDir, TempDir, RunDescriptor) {
        let root = TempDir::new().unwrap();
        let store = TempDir::new().unwrap();
        let r = root.path();
        fs::create_dir_all(r.join(".nimp/filesets")).unwrap();
        fs::create_dir_all(r.join("Binaries/Win64")).unwrap();
        fs::write(r.join("Binaries/Win64/Game.exe"), b"MZ-game").unwrap();
        fs::write(r.join("Binaries/Win64/Core.dll"), b"MZ-core").unwrap();
        fs::write(
            r.join(".nimp/filesets/binaries.toml"),
            "[[rule]]\nsteps = [{ glob = \"Binaries/**\" }, \"files\"]\n",
        )
        .unwrap();

        let settings: ConfigFile =
            toml::from_str("[artifact_collection]\nbinaries = \"binaries-{platform}/{revision}\"\n").unwrap();
        let store_path = standardize_path(&store.path().to_string_lossy());
        let run = RunDescriptor::builder(r)
            .platform(Platform::Win64)
            .revision("1234")
            .settings(settings)
            .parameter("artifact_repository_destination", store_path.clone())
            .parameter("artifact_repository_source", store_path)
            .build();
        (root, store, run)
    }

    fn round_trip(archive: bool) {
        let (root, _store, run) = workspace();
        let options = UploadOptions {
            archive,
            compress: archive,
            hash: archive.then_some(HashMethod::Sha256),
            ..Default::default()
        };
        let path = upload_fileset(&run, "binaries", &options).unwrap();
        assert!(path.ends_with("binaries-win64/1234"));
        assert!(upload_fileset(&run, "binaries", &options).is_err());
        upload_fileset(&run, "binaries", &UploadOptions { force: true, ..options.clone() }).unwrap();

        fs::remove_dir_all(root.path().join("Binaries")).unwrap();
        let downloaded = download_fileset(
            &run,
            "binaries",
            &DownloadOptions {
                track: Some(TrackKind::Binaries),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(downloaded.revision, "1234");
        assert_eq!(fs::read(root.path().join("Binaries/Win64/Game.exe")).unwrap(), b"MZ-game");
        assert_eq!(fs::read(root.path().join("Binaries/Win64/Core.dll")).unwrap(), b"MZ-core");
        let status = WorkspaceStatus::load(root.path()).unwrap();
        assert_eq!(status.revision(TrackKind::Binaries, "win64"), Some("1234"));
    }

    #[test]
    fn test_directory_round_trip() {
        round_trip(false);
    }

    #[test]
    fn test_archive_round_trip() {
        round_trip(true);
    }

    #[test]
    fn test_install_replaces_and_marks_scripts() {
        let dir = TempDir::new().unwrap();
        let artifact = dir.path().join("artifact");
        let dest = dir.path().join("dest");
        fs::create_dir_all(artifact.join("bin")).unwrap();
        fs::create_dir_all(dest.join("bin")).unwrap();
        fs::write(artifact.join("bin/run.sh"), b"#!/bin/sh\n").unwrap();
        fs::write(dest.join("bin/run.sh"), b"old").unwrap();

        install(&artifact, &dest).unwrap();
        assert_eq!(fs::read(dest.join("bin/run.sh")).unwrap(), b"#!/bin/sh\n");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(dest.join("bin/run.sh")).unwrap().permissions().mode();
            assert_ne!(mode & 0o111, 0);
        }
    }
}
