//! Active variant overlay (`Config/Variants/Active`).
//!
//! Engines newer than 4.24 read the variant configuration from a copy of
//! `Config/Variants/<variant>`. The copy lives exactly as long as the
//! [`VariantOverlay`] guard.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::RunDescriptor;
use crate::error::NimpError;
use crate::fsutil;
use crate::platform::Platform;
use crate::status::{TrackKind, WorkspaceStatus};

const GENERAL_PROJECT_SETTINGS: &str = "EngineSettings.GeneralProjectSettings";
const PROJECT_REVISION_SETTINGS: &str = "DNEEngineVersion.DNEEngineVersion";

/// Scoped `Config/Variants/Active` directory, removed on drop.
#[derive(Debug)]
pub struct VariantOverlay {
    active: PathBuf,
    source: Option<PathBuf>,
    title_configuration: Option<PathBuf>,
    enabled: bool,
    dry_run: bool,
}

impl VariantOverlay {
    /// Remove any stale overlay, then copy the run's variant in place.
    pub fn acquire(run: &RunDescriptor, project_directory: &Path, write_revisions: bool) -> Result<Self> {
        let enabled = run.engine().is_some_and(|v| !v.older_than(4, 25));
        let mut overlay = Self {
            active: project_directory.join("Config/Variants/Active"),
            source: None,
            title_configuration: None,
            enabled,
            dry_run: run.dry_run(),
        };
        if !enabled {
            return Ok(overlay);
        }

        fsutil::try_remove(&overlay.active, overlay.dry_run)?;
        let Some(variant) = run.variant() else {
            return Ok(overlay);
        };

        let source = project_directory.join("Config/Variants").join(variant);
        if !source.is_dir() {
            bail!(NimpError::config(format!(
                "Unknown variant \"{}\" ({} not found)",
                variant,
                source.display()
            )));
        }
        overlay.source = Some(source.clone());
        tracing::info!("Configuring variant {} in {}", variant, overlay.active.display());
        if overlay.dry_run {
            return Ok(overlay);
        }

        fsutil::copy_tree(&source, &overlay.active)
            .with_context(|| format!("Failed to copy variant {}", variant))?;
        for name in ["DefaultEngine.ini", "DefaultGame.ini"] {
            let path = overlay.active.join(name);
            if !path.exists() {
                fs::write(&path, "")?;
            }
        }
        if write_revisions {
            write_project_revisions(run, &overlay.active)?;
        }

        if run.platform() == Platform::PS5 {
            let build = project_directory.join("Platforms/PS5/Build");
            let variant_title = build.join("Variants").join(variant).join("TitleConfiguration.json");
            if variant_title.is_file() {
                let destination = build.join("TitleConfiguration.json");
                tracing::info!("Copying {} to {}", variant_title.display(), destination.display());
                overlay.title_configuration = Some(destination.clone());
                fs::copy(&variant_title, &destination)
                    .with_context(|| format!("Failed to copy {}", variant_title.display()))?;
            }
        }
        Ok(overlay)
    }

    /// Directory the variant configuration is read from while the overlay
    /// is held. In dry-run the overlay is not written, so the variant
    /// source is returned instead.
    pub fn configuration_directory(&self) -> Option<PathBuf> {
        let source = self.source.as_ref()?;
        Some(if self.dry_run { source.clone() } else { self.active.clone() })
    }
}

impl Drop for VariantOverlay {
    fn drop(&mut self) {
        if !self.enabled || self.dry_run {
            return;
        }
        fsutil::remove_best_effort(&self.active);
        if let Some(title) = self.title_configuration.take() {
            fsutil::remove_best_effort(title);
        }
    }
}

/// Rewrite `DefaultGame.ini` with the project version and the binary and
/// content revisions.
fn write_project_revisions(run: &RunDescriptor, active: &Path) -> Result<()> {
    let path = active.join("DefaultGame.ini");
    tracing::info!("Updating {}", path.display());
    let content = fs::read_to_string(&path).with_context(|| format!("Failed to read {}", path.display()))?;

    let version = content
        .lines()
        .find_map(|line| line.strip_prefix("ProjectVersion="))
        .map(|v| v.trim_end_matches('\r').to_string())
        .unwrap_or_else(|| {
            tracing::warn!("Failed to get project version, defaulting to 1.0.0.0");
            "1.0.0.0".to_string()
        });
    let content = insert_ini_settings(&content, &[("ProjectVersion", version)], GENERAL_PROJECT_SETTINGS);

    let mut revisions = Vec::new();
    let status = WorkspaceStatus::load(run.root_dir())?;
    match status.revision(TrackKind::Binaries, Platform::host().name()) {
        Some(revision) => revisions.push(("ProjectBinaryRevision", revision.to_string())),
        None => tracing::warn!("Failed to get binary revision"),
    }
    match run.revision() {
        Some(revision) => revisions.push(("ProjectContentRevision", revision.to_string())),
        None => tracing::warn!("Failed to get content revision"),
    }
    let content = insert_ini_settings(&content, &revisions, PROJECT_REVISION_SETTINGS);

    fs::write(&path, content).with_context(|| format!("Failed to write {}", path.display()))
}

/// Set `settings` under `[/Script/<category>]`: existing lines for the
/// keys are dropped anywhere in the file and a missing section is
/// inserted at the top.
pub fn insert_ini_settings(content: &str, settings: &[(&str, String)], category: &str) -> String {
    for (key, value) in settings {
        tracing::info!("{}: {}", key, value);
    }
    let mut lines: Vec<String> = content
        .lines()
        .filter(|line| !settings.iter().any(|(key, _)| line.starts_with(&format!("{}=", key))))
        .map(str::to_string)
        .collect();

    let header = format!("[/Script/{}]", category);
    let index = match lines.iter().position(|line| line.trim_end() == header) {
        Some(index) => index,
        None => {
            lines.insert(0, String::new());
            lines.insert(0, header);
            0
        }
    };
    for (offset, (key, value)) in settings.iter().enumerate() {
        lines.insert(index + 1 + offset, format!("{}={}", key, value));
    }
    lines.join("\n")
}
