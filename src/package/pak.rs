//! PAK assembly with UnrealPak.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use super::PackageConfiguration;
use crate::config::RunDescriptor;
use crate::error::NimpError;
use crate::fileset::FileMapper;
use crate::fsutil;
use crate::platform::Platform;
use crate::process::Cmd;

/// What [`create_pak_file`] produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PakOutcome {
    /// `content_pak` listed nothing for this PAK.
    Empty,
    Created { path: PathBuf, is_patch: bool },
}

/// `<project>-<cook_platform>[-<pak>]`
pub fn pak_file_name(project: &str, cook_platform: &str, pak_name: Option<&str>) -> String {
    match pak_name {
        Some(name) if !name.is_empty() => format!("{}-{}-{}", project, cook_platform, name),
        _ => format!("{}-{}", project, cook_platform),
    }
}

/// A PAK is built as a patch only for patch package types and only when
/// the baseline contains the same PAK. Removing a baseline PAK forces a
/// full replacement.
pub fn is_patch(configuration: &PackageConfiguration, patch_base: &Path, file_name: &str) -> bool {
    configuration.package_type.is_patch() && patch_base.join(format!("{}.pak", file_name)).is_file()
}

/// Extra UnrealPak options per target platform.
fn platform_options(platform: Platform) -> &'static [&'static str] {
    match platform {
        Platform::Win64 => &["-PatchPaddingAlign=2048"],
        Platform::PS4 => &["-BlockSize=256MB", "-PatchPaddingAlign=65536"],
        Platform::XboxOne => &["-BlockSize=4KB", "-BitWindow=12"],
        _ => &[],
    }
}

fn lower_if(path: PathBuf, lower: bool) -> PathBuf {
    if lower {
        PathBuf::from(path.to_string_lossy().to_lowercase())
    } else {
        path
    }
}

/// Manifest line: `"<abs src>" "../../../<dst>" [-Compress]`.
fn manifest_line(configuration: &PackageConfiguration, source: &str, destination: &str) -> String {
    let file_name = Path::new(source)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let compress = configuration.pak_compression && !configuration.pak_compression_exclusions.contains(&file_name);
    format!(
        "\"{}\" \"../../../{}\" {}\n",
        fsutil::absolute(source),
        destination,
        if compress { "-Compress" } else { "" }
    )
}

/// Build one PAK of the collection into `destination`.
pub fn create_pak_file(
    run: &RunDescriptor,
    configuration: &PackageConfiguration,
    pak_name: Option<&str>,
    patch_base: &Path,
    destination: &Path,
) -> Result<PakOutcome> {
    let worker = configuration.worker_platform;
    let exe = if worker == Platform::Win64 { ".exe" } else { "" };
    let pak_tool = configuration
        .engine_directory
        .join("Binaries")
        .join(worker.unreal_name())
        .join(format!("UnrealPak{}", exe));

    let file_name = pak_file_name(&configuration.project, &configuration.cook_platform, pak_name);
    let patch = is_patch(configuration, patch_base, &file_name);
    let lower = configuration.target_platform == Platform::PS4;
    let destination = lower_if(destination.to_path_buf(), lower);
    let pak_path = destination.join(format!("{}{}.pak", file_name, if patch { "_P" } else { "" }));
    let manifest_path = destination.join(format!("{}.pak.txt", file_name));
    let (pak_path, manifest_path) = (lower_if(pak_path, lower), lower_if(manifest_path, lower));
    let patch_base = lower_if(patch_base.to_path_buf(), lower);
    let order_path = configuration
        .project_directory
        .join("Build")
        .join(&configuration.cook_platform)
        .join("FileOpenOrder/GameOpenOrder.log");

    if !run.dry_run() {
        fs::create_dir_all(&destination)
            .with_context(|| format!("Failed to create {}", destination.display()))?;
    }

    tracing::info!("Listing files for pak {}", file_name);
    let overlay = BTreeMap::from([("pak_name".to_string(), pak_name.unwrap_or_default().to_string())]);
    let mapper = FileMapper::load(run, "content_pak", &overlay)?;
    let files = mapper.to_list(&run.root_dir().to_string_lossy(), ".")?;
    if files.is_empty() {
        tracing::warn!("No files for {}", file_name);
        return Ok(PakOutcome::Empty);
    }

    tracing::info!("Creating manifest for pak {}", file_name);
    if !run.dry_run() {
        let manifest: String = files
            .iter()
            .map(|(source, destination)| manifest_line(configuration, source, destination))
            .collect();
        fs::write(&manifest_path, manifest)
            .with_context(|| format!("Failed to write {}", manifest_path.display()))?;
    }

    tracing::info!("Creating pak {}", file_name);
    let absolute = |path: &Path| fsutil::absolute(&path.to_string_lossy());
    let mut cmd = Cmd::new(pak_tool.to_string_lossy())
        .arg(absolute(&pak_path))
        .arg(format!("-Create={}", absolute(&manifest_path)))
        .arg(format!("-Order={}", absolute(&order_path)))
        .args(platform_options(configuration.target_platform).iter().copied());
    if patch {
        let baseline = patch_base.join(format!("{}.pak", file_name));
        cmd = cmd.arg(format!("-GeneratePatch={}", absolute(&baseline)));
    }

    let code = cmd.dry_run(run.dry_run()).call()?;
    if code != 0 {
        return Err(anyhow::Error::new(NimpError::tool("UnrealPak", code)).context("Pak creation failed"));
    }
    Ok(PakOutcome::Created {
        path: pak_path,
        is_patch: patch,
    })
}
