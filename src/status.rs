//! Workspace status: which revision of each tracked kind is installed.
//!
//! Stored as `.nimp/workspace_status.json` under the root directory. Each
//! kind maps a canonical platform name to a revision; `package` and
//! `staged` also carry `variant`, `path` and `name`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::NimpError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Binaries,
    Symbols,
    Package,
    Staged,
}

impl TrackKind {
    pub fn name(self) -> &'static str {
        match self {
            TrackKind::Binaries => "binaries",
            TrackKind::Symbols => "symbols",
            TrackKind::Package => "package",
            TrackKind::Staged => "staged",
        }
    }
}

impl FromStr for TrackKind {
    type Err = NimpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "binaries" => Ok(TrackKind::Binaries),
            "symbols" => Ok(TrackKind::Symbols),
            "package" => Ok(TrackKind::Package),
            "staged" => Ok(TrackKind::Staged),
            other => Err(NimpError::config(format!("Unknown track kind \"{}\"", other))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceStatus {
    pub binaries: BTreeMap<String, String>,
    pub symbols: BTreeMap<String, String>,
    pub package: BTreeMap<String, String>,
    pub staged: BTreeMap<String, String>,
}

impl WorkspaceStatus {
    pub fn path(root_dir: &Path) -> PathBuf {
        root_dir.join(".nimp").join("workspace_status.json")
    }

    /// Load the status file, or an empty status when there is none.
    pub fn load(root_dir: &Path) -> Result<Self> {
        let path = Self::path(root_dir);
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let status = serde_json::from_str(&content)
            .map_err(NimpError::from)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(status)
    }

    pub fn save(&self, root_dir: &Path) -> Result<()> {
        let path = Self::path(root_dir);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self).map_err(NimpError::from)?;
        fs::write(&path, content).with_context(|| format!("Failed to write {}", path.display()))
    }

    pub fn kind(&self, kind: TrackKind) -> &BTreeMap<String, String> {
        match kind {
            TrackKind::Binaries => &self.binaries,
            TrackKind::Symbols => &self.symbols,
            TrackKind::Package => &self.package,
            TrackKind::Staged => &self.staged,
        }
    }

    fn kind_mut(&mut self, kind: TrackKind) -> &mut BTreeMap<String, String> {
        match kind {
            TrackKind::Binaries => &mut self.binaries,
            TrackKind::Symbols => &mut self.symbols,
            TrackKind::Package => &mut self.package,
            TrackKind::Staged => &mut self.staged,
        }
    }

    pub fn revision(&self, kind: TrackKind, platform: &str) -> Option<&str> {
        self.kind(kind).get(platform).map(String::as_str)
    }

    /// Record an installed revision. Package kinds also remember where
    /// the artifact came from.
    pub fn track(&mut self, kind: TrackKind, platform: &str, revision: &str, variant: Option<&str>, uri: &str) {
        let old = self.revision(kind, platform).map(str::to_string);
        tracing::info!(
            "Tracking for {} {}: {} => {}",
            kind.name(),
            platform,
            old.as_deref().unwrap_or("None"),
            revision
        );
        let entry = self.kind_mut(kind);
        entry.insert(platform.to_string(), revision.to_string());
        if matches!(kind, TrackKind::Package | TrackKind::Staged) {
            if let Some(variant) = variant {
                entry.insert("variant".to_string(), variant.to_string());
            }
            let path = crate::fsutil::standardize_path(uri);
            let name = path.trim_end_matches('/').rsplit('/').next().unwrap_or_default().to_string();
            entry.insert("path".to_string(), path);
            entry.insert("name".to_string(), name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_is_empty_status() {
        let dir = TempDir::new().unwrap();
        assert_eq!(WorkspaceStatus::load(dir.path()).unwrap(), WorkspaceStatus::default());
    }

    #[test]
    fn test_track_and_reload() {
        let dir = TempDir::new().unwrap();
        let mut status = WorkspaceStatus::default();
        status.track(TrackKind::Binaries, "win64", "1234", None, "//share/bin/1234");
        status.track(TrackKind::Package, "ps5", "99", Some("Retail"), "//share/pkg/Game-99.zip");
        status.save(dir.path()).unwrap();

        let loaded = WorkspaceStatus::load(dir.path()).unwrap();
        assert_eq!(loaded.revision(TrackKind::Binaries, "win64"), Some("1234"));
        assert!(!loaded.binaries.contains_key("path"));
        assert_eq!(loaded.package["variant"], "Retail");
        assert_eq!(loaded.package["name"], "Game-99.zip");
    }

    #[test]
    fn test_track_kind_parsing() {
        assert_eq!("staged".parse::<TrackKind>().unwrap(), TrackKind::Staged);
        assert!("other".parse::<TrackKind>().is_err());
    }
}
