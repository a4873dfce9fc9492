//! Package phase: turn the stage directory into platform packages.

use anyhow::{bail, Context, Result};
use regex::Regex;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use super::layout::{filter_param_json, rewrite_gp5_for_dlc};
use super::{PackageConfiguration, PackageType};
use crate::config::RunDescriptor;
use crate::error::NimpError;
use crate::fileset::{self, FileMapper};
use crate::fsutil;
use crate::platform::Platform;
use crate::process::{self, Cmd};

/// Files AutomationTool leaves in the package directory.
const UAT_PACKAGE_EXTENSIONS: &[&str] = &["pkg", "nsp", "msixvc", "xvc", "zip", "ekb"];

/// Manifests the packer generates or reads under a well-known name.
const WELL_KNOWN_MANIFESTS: &[&str] = &["microsoftgame.config", "appxmanifest.xml", "appdata.bin"];

pub fn package_for_platform(run: &RunDescriptor, configuration: &mut PackageConfiguration) -> Result<()> {
    tracing::info!(
        "Packaging for {} (Source: {}, Destination: {})",
        configuration.target_platform.name(),
        configuration.stage_directory.display(),
        configuration.package_directory.display()
    );

    let existing = existing_outputs(configuration)?;
    if !existing.is_empty() {
        if !configuration.force {
            bail!(NimpError::config(format!(
                "{} already exists, use --force to package again",
                existing[0].display()
            )));
        }
        for path in &existing {
            fsutil::try_remove(path, run.dry_run())?;
        }
    }

    let platform = configuration.target_platform;
    match platform {
        Platform::Win64 if configuration.msixvc => package_for_windows_msixvc(configuration, run.dry_run()),
        Platform::Linux | Platform::Mac | Platform::Win32 | Platform::Win64 => package_for_desktop(run, configuration),
        Platform::PS4 => package_for_ps4(configuration, run.dry_run()),
        Platform::XboxOne => package_for_xboxone(configuration, run.dry_run()),
        Platform::PS5 => {
            prepare_ps5(configuration, run.dry_run())?;
            if configuration.package_type == PackageType::Entitlement {
                return Ok(());
            }
            package_with_uat(configuration, run.dry_run())
        }
        _ if platform.is_sony() || platform.is_microsoft() || platform.is_nintendo() => {
            if !configuration.package_type.is_application() {
                return Ok(());
            }
            package_with_uat(configuration, run.dry_run())
        }
        _ => {
            tracing::warn!("Nothing to package for {}", platform.name());
            Ok(())
        }
    }
}

/// Destination directories of the platform's packager, or the loose
/// package files AutomationTool writes, that already exist.
fn existing_outputs(configuration: &PackageConfiguration) -> Result<Vec<PathBuf>> {
    let suffix = configuration.final_suffix();
    let directory = &configuration.package_directory;
    let candidates: Vec<PathBuf> = match configuration.target_platform {
        Platform::Win64 if configuration.msixvc => configuration
            .binary_configurations
            .iter()
            .map(|cfg| directory.join(format!("MSIXVC-{}{}", cfg, suffix)))
            .collect(),
        Platform::Linux | Platform::Mac | Platform::Win32 | Platform::Win64 => {
            vec![directory.join(format!("Default{}", suffix))]
        }
        Platform::PS4 => configuration
            .ps4_title_collection
            .iter()
            .flat_map(|title| {
                configuration
                    .binary_configurations
                    .iter()
                    .map(move |cfg| directory.join(format!("{}-{}{}", title.region(), cfg, suffix)))
            })
            .collect(),
        Platform::XboxOne => configuration
            .binary_configurations
            .iter()
            .map(|cfg| directory.join(format!("{}{}", cfg, suffix)))
            .collect(),
        _ => {
            if !directory.is_dir() {
                return Ok(Vec::new());
            }
            let mut files = Vec::new();
            for entry in fs::read_dir(directory)? {
                let path = entry?.path();
                let is_package = path.extension().is_some_and(|ext| {
                    UAT_PACKAGE_EXTENSIONS
                        .iter()
                        .any(|known| ext.eq_ignore_ascii_case(known))
                });
                if is_package {
                    files.push(path);
                }
            }
            files.sort();
            files
        }
    };
    Ok(candidates.into_iter().filter(|path| path.exists()).collect())
}

/// Copy the `stage_to_package` fileset into `Default[-Final]`.
fn package_for_desktop(run: &RunDescriptor, configuration: &PackageConfiguration) -> Result<()> {
    let destination = configuration
        .package_directory
        .join(format!("Default{}", configuration.final_suffix()));
    fsutil::try_remove(&destination, run.dry_run())?;
    fsutil::try_create_directory(&destination, run.dry_run())?;

    tracing::info!("Listing package files");
    let mapper = FileMapper::load(run, "stage_to_package", &BTreeMap::new())?;
    let files = mapper.to_list(
        &configuration.stage_directory.to_string_lossy(),
        &destination.to_string_lossy(),
    )?;
    for (source, destination) in files {
        fsutil::copy_file(&source, &destination, run.dry_run())?;
    }
    Ok(())
}

/// AutomationTool `BuildCookRun -Package`.
fn package_with_uat(configuration: &PackageConfiguration, dry_run: bool) -> Result<()> {
    let mut cmd = Cmd::new(configuration.automation_tool().to_string_lossy())
        .arg("BuildCookRun")
        .arg(format!("-UE{}exe={}", configuration.engine.major, configuration.editor_cmd_exe))
        .arg("-UTF8Output")
        .arg(format!("-Project={}", configuration.project))
        .arg(format!("-TargetPlatform={}", configuration.target_platform.unreal_name()))
        .arg(format!("-ClientConfig={}", configuration.binary_configuration()))
        .args(["-SkipCook", "-SkipStage", "-Package"]);
    if configuration.no_compile_packaging {
        cmd = cmd.arg("-NoCompile");
    }
    for option in &configuration.extra_options {
        cmd = cmd.args(process::split_options(option)?);
    }

    let code = cmd.dry_run(dry_run).call()?;
    if code != 0 {
        return Err(anyhow::Error::new(NimpError::tool("AutomationTool", code)).context("Package failed"));
    }
    Ok(())
}

fn require_package_tool(configuration: &PackageConfiguration) -> Result<&Path> {
    match &configuration.package_tool_path {
        Some(path) => Ok(path),
        None => bail!(NimpError::NotFound(format!(
            "package tool for {}",
            configuration.target_platform.name()
        ))),
    }
}

fn package_for_ps4(configuration: &PackageConfiguration, dry_run: bool) -> Result<()> {
    let tool = require_package_tool(configuration)?;
    let stage = &configuration.stage_directory;

    for title in &configuration.ps4_title_collection {
        for binary_configuration in &configuration.binary_configurations {
            let destination = configuration.package_directory.join(format!(
                "{}-{}{}",
                title.region(),
                binary_configuration,
                configuration.final_suffix()
            ));
            let temporary = PathBuf::from(format!("{}-Temporary", destination.display()));
            let layout = stage.join(format!(
                "{}-{}-{}.{}",
                configuration.project,
                title.region(),
                binary_configuration,
                configuration.layout_file_extension
            ));

            let mut output_format = String::from("pkg");
            if configuration.is_final_submission {
                if configuration.package_type == PackageType::Application && title.storage_type().starts_with("bd") {
                    output_format.push_str("+iso");
                }
                output_format.push_str("+subitem");
            }

            fsutil::try_remove(&destination, dry_run)?;
            fsutil::try_remove(&temporary, dry_run)?;
            fsutil::try_create_directory(&destination, dry_run)?;
            fsutil::try_create_directory(&temporary, dry_run)?;

            let code = Cmd::new(tool.to_string_lossy())
                .args(["img_create", "--no_progress_bar", "--tmp_path"])
                .arg_path(&temporary)
                .arg("--oformat")
                .arg(output_format)
                .arg_path(&layout)
                .arg_path(&destination)
                .dry_run(dry_run)
                .call()?;
            if code != 0 {
                return Err(anyhow::Error::new(NimpError::tool("img_create", code))
                    .context(format!("Package generation failed for {}", destination.display())));
            }

            fsutil::try_remove(&temporary, dry_run)?;
        }
    }
    Ok(())
}

/// Copies the per-configuration manifests to their well-known names for
/// the packer and removes them, with the generated `appdata.bin`, when
/// dropped.
struct WellKnownManifests {
    stage: PathBuf,
    dry_run: bool,
}

impl WellKnownManifests {
    fn install(stage: &Path, binary_configuration: &str, dry_run: bool) -> Result<Self> {
        let guard = Self {
            stage: stage.to_path_buf(),
            dry_run,
        };
        if dry_run {
            return Ok(guard);
        }
        let pairs = [
            (format!("AppxManifest-{}.xml", binary_configuration), "AppxManifest.xml"),
            (format!("MicrosoftGame-{}.config", binary_configuration), "MicrosoftGame.config"),
        ];
        for (source, destination) in pairs {
            let source = stage.join(source);
            if source.is_file() {
                fs::copy(&source, stage.join(destination))
                    .with_context(|| format!("Failed to copy {}", source.display()))?;
            }
        }
        Ok(guard)
    }
}

impl Drop for WellKnownManifests {
    fn drop(&mut self) {
        if self.dry_run {
            return;
        }
        for name in ["AppxManifest.xml", "MicrosoftGame.config", "appdata.bin"] {
            fsutil::remove_best_effort(self.stage.join(name));
        }
    }
}

fn package_for_xboxone(configuration: &PackageConfiguration, dry_run: bool) -> Result<()> {
    let tool = require_package_tool(configuration)?;
    let stage = &configuration.stage_directory;
    let (Some(product_id), Some(content_id)) = (&configuration.xbox_product_id, &configuration.xbox_content_id) else {
        bail!(NimpError::config("XboxOne packaging requires ProductId and ContentId"));
    };

    for binary_configuration in &configuration.binary_configurations {
        let destination = configuration
            .package_directory
            .join(format!("{}{}", binary_configuration, configuration.final_suffix()));
        let layout = stage.join(format!("{}-{}.xml", configuration.project, binary_configuration));
        verify_msixvc_files(stage, &layout)?;

        let mut cmd = Cmd::new(tool.to_string_lossy())
            .args(["pack", "/v", "/f"])
            .arg_path(&layout)
            .arg("/d")
            .arg_path(stage)
            .arg("/pd")
            .arg_path(&destination)
            .arg("/productid")
            .arg(product_id.as_str())
            .arg("/contentid")
            .arg(content_id.as_str());
        if configuration.is_final_submission {
            cmd = cmd.arg("/lt");
        }
        cmd = cmd.args(["/updcompat", "3"]);
        if configuration.package_type.is_application() {
            cmd = cmd.args(["/genappdata", "/gameos"]).arg_path(stage.join("era.xvd"));
        }

        fsutil::try_remove(&destination, dry_run)?;
        fsutil::try_create_directory(&destination, dry_run)?;

        let code = {
            let _manifests = WellKnownManifests::install(stage, binary_configuration, dry_run)?;
            cmd.dry_run(dry_run).call()?
        };
        if code != 0 {
            return Err(anyhow::Error::new(NimpError::tool("MakePkg", code))
                .context(format!("Package generation failed for {}", binary_configuration)));
        }
    }
    Ok(())
}

fn package_for_windows_msixvc(configuration: &PackageConfiguration, dry_run: bool) -> Result<()> {
    let tool = require_package_tool(configuration)?;
    let stage = &configuration.stage_directory;

    for binary_configuration in &configuration.binary_configurations {
        let destination = configuration
            .package_directory
            .join(format!("MSIXVC-{}{}", binary_configuration, configuration.final_suffix()));
        let layout = stage.join(format!("{}-{}.xml", configuration.project, binary_configuration));
        verify_msixvc_files(stage, &layout)?;

        let mut cmd = Cmd::new(tool.to_string_lossy())
            .args(["pack", "/v", "/pc", "/f"])
            .arg_path(&layout)
            .arg("/d")
            .arg_path(stage)
            .arg("/pd")
            .arg_path(&destination);
        if configuration.is_final_submission {
            cmd = cmd.arg("/l");
        }

        fsutil::try_remove(&destination, dry_run)?;
        fsutil::try_create_directory(&destination, dry_run)?;

        let code = {
            let _manifests = WellKnownManifests::install(stage, binary_configuration, dry_run)?;
            cmd.dry_run(dry_run).call()?
        };
        if code != 0 {
            return Err(anyhow::Error::new(NimpError::tool("MakePkg", code))
                .context(format!("Package generation failed for {}", binary_configuration)));
        }
    }
    Ok(())
}

/// Every `Chunk/FileGroup` of the layout must match at least one staged
/// file. Each missing group is logged before failing.
pub fn verify_msixvc_files(stage: &Path, layout: &Path) -> Result<()> {
    let content = fs::read_to_string(layout)
        .with_context(|| format!("Failed to read layout {}", layout.display()))?;
    let chunk = Regex::new(r"(?s)<Chunk\b[^>]*>(.*?)</Chunk>")?;
    let file_group = Regex::new(r"<FileGroup\b([^>]*)/?>")?;
    let attribute = |attributes: &str, name: &str| -> Result<Option<String>> {
        let pattern = Regex::new(&format!(r#"\b{}\s*=\s*"([^"]*)""#, name))?;
        Ok(pattern.captures(attributes).map(|c| c[1].to_string()))
    };

    let mut missing = Vec::new();
    for chunk in chunk.captures_iter(&content) {
        for group in file_group.captures_iter(&chunk[1]) {
            let attributes = &group[1];
            let include = attribute(attributes, "Include")?.unwrap_or_default();
            if WELL_KNOWN_MANIFESTS.contains(&include.to_lowercase().as_str()) {
                continue;
            }
            let source = attribute(attributes, "SourcePath")?.unwrap_or_default();
            let pattern = format!(
                "{}/{}/{}",
                stage.to_string_lossy(),
                source.replace('\\', "/"),
                include.replace('\\', "/")
            );
            if fileset::expand_glob(&pattern)?.is_empty() {
                tracing::error!("Files not found: '{}'", pattern);
                missing.push(pattern);
            }
        }
    }
    if !missing.is_empty() {
        bail!(NimpError::NotFound(format!("{} file group(s) of {}", missing.len(), layout.display())));
    }
    Ok(())
}

/// PS5 additional content and patch preparation before AutomationTool
/// packages the stage.
fn prepare_ps5(configuration: &mut PackageConfiguration, dry_run: bool) -> Result<()> {
    if configuration.package_type.is_dlc() && configuration.stage_directory.is_dir() {
        let mut projects = Vec::new();
        for entry in walkdir::WalkDir::new(&configuration.stage_directory).sort_by_file_name() {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_lowercase();
            let rewritten: fn(&str) -> Result<String> = if name.ends_with(".gp5") {
                projects.push(entry.path().to_path_buf());
                rewrite_gp5_for_dlc
            } else if name.starts_with("param") && name.ends_with(".json") {
                filter_param_json
            } else {
                continue;
            };

            tracing::info!("Configuring {} as additional content", entry.path().display());
            let content = fs::read_to_string(entry.path())
                .with_context(|| format!("Failed to read {}", entry.path().display()))?;
            let content = rewritten(&content)?;
            if !dry_run {
                fs::write(entry.path(), content)
                    .with_context(|| format!("Failed to write {}", entry.path().display()))?;
            }
        }
        if let [project] = projects.as_slice() {
            configuration.layout_file_path = Some(project.clone());
        }
    }

    if configuration.package_type.is_patch() {
        let path = configuration
            .project_directory
            .join("Platforms/PS5/Build/TitleConfiguration.json");
        let format = title_configuration_format(&path)?;
        if format.as_deref() != Some("nwonly") {
            let message = format!(
                "PS5 patches must use the nwonly format ({} has {})",
                path.display(),
                format.as_deref().unwrap_or("none")
            );
            if configuration.for_distribution {
                bail!(NimpError::config(message));
            }
            tracing::error!("{}", message);
        }
    }
    Ok(())
}

fn title_configuration_format(path: &Path) -> Result<Option<String>> {
    if !path.is_file() {
        return Ok(None);
    }
    let content = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let json: serde_json::Value = serde_json::from_str(&content)
        .map_err(NimpError::from)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    Ok(json.get("format").and_then(|f| f.as_str()).map(str::to_string))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineVersion;
    use crate::package::tests::project;
    use crate::package::PackageOptions;
    use tempfile::TempDir;

    fn desktop(dir: &Path, force: bool) -> (RunDescriptor, PackageConfiguration) {
        let run = project(dir, Platform::Linux, EngineVersion::new(5, 1, 0));
        fs::create_dir_all(dir.join(".nimp/filesets")).unwrap();
        fs::write(
            dir.join(".nimp/filesets/stage_to_package.toml"),
            "[[rule]]\nsteps = [{ glob = [\"**/*\"] }, \"files\"]\n",
        )
        .unwrap();
        let options = PackageOptions {
            force,
            ..Default::default()
        };
        let configuration = PackageConfiguration::new(&run, &options).unwrap();
        fs::create_dir_all(configuration.stage_directory.join("Game/Content/Paks")).unwrap();
        fs::write(configuration.stage_directory.join("Game/Content/Paks/Game-Linux.pak"), b"pak").unwrap();
        (run, configuration)
    }

    #[test]
    fn test_desktop_package_copies_stage() {
        let dir = TempDir::new().unwrap();
        let (run, mut configuration) = desktop(dir.path(), false);
        package_for_platform(&run, &mut configuration).unwrap();
        let packaged = configuration.package_directory.join("Default/Game/Content/Paks/Game-Linux.pak");
        assert_eq!(fs::read(packaged).unwrap(), b"pak");
    }

    #[test]
    fn test_repackage_requires_force() {
        let dir = TempDir::new().unwrap();
        let (run, mut configuration) = desktop(dir.path(), false);
        package_for_platform(&run, &mut configuration).unwrap();
        let err = package_for_platform(&run, &mut configuration).unwrap_err();
        assert!(err.to_string().contains("--force"));

        configuration.force = true;
        package_for_platform(&run, &mut configuration).unwrap();
    }

    #[test]
    fn test_verify_msixvc_files() {
        let dir = TempDir::new().unwrap();
        let stage = dir.path();
        fs::create_dir_all(stage.join("Game/Content")).unwrap();
        fs::write(stage.join("Game/Content/a.pak"), b"").unwrap();
        let layout = stage.join("Game-Development.xml");
        fs::write(
            &layout,
            r#"<Package>
  <Chunk Id="1000" Marker="Launch">
    <FileGroup DestinationPath="\" SourcePath="\" Include="AppxManifest.xml"/>
    <FileGroup DestinationPath="\Game\Content" SourcePath="Game\Content" Include="*.pak"/>
  </Chunk>
</Package>"#,
        )
        .unwrap();
        verify_msixvc_files(stage, &layout).unwrap();

        fs::write(
            &layout,
            r#"<Package><Chunk Id="1"><FileGroup SourcePath="Game\Movies" Include="*.bk2"/></Chunk></Package>"#,
        )
        .unwrap();
        assert!(verify_msixvc_files(stage, &layout).is_err());
    }

    #[test]
    fn test_ps5_dlc_rewrites_stage() {
        let dir = TempDir::new().unwrap();
        let run = project(dir.path(), Platform::PS5, EngineVersion::new(5, 1, 0));
        let options = PackageOptions {
            dlc: true,
            ..Default::default()
        };
        let mut configuration = PackageConfiguration::new(&run, &options).unwrap();
        let sce_sys = configuration.stage_directory.join("sce_sys");
        fs::create_dir_all(&sce_sys).unwrap();
        let gp5 = configuration.stage_directory.join("Game.gp5");
        fs::write(&gp5, "<volume type=\"prospero_app\">\n<file targ_path=\"eboot.bin\"/>\n</volume>").unwrap();
        fs::write(sce_sys.join("param.json"), r#"{"titleId": "PPSA00001", "bootAnimation": "x"}"#).unwrap();

        prepare_ps5(&mut configuration, false).unwrap();
        let rewritten = fs::read_to_string(&gp5).unwrap();
        assert!(rewritten.contains("prospero_ac"));
        assert!(!rewritten.contains("eboot"));
        let param = fs::read_to_string(sce_sys.join("param.json")).unwrap();
        assert!(!param.contains("bootAnimation"));
        assert_eq!(configuration.layout_file_path.as_deref(), Some(gp5.as_path()));
    }

    #[test]
    fn test_ps5_patch_format() {
        let dir = TempDir::new().unwrap();
        let run = project(dir.path(), Platform::PS5, EngineVersion::new(5, 1, 0));
        let options = PackageOptions {
            patch: true,
            distribution: true,
            ..Default::default()
        };
        let mut configuration = PackageConfiguration::new(&run, &options).unwrap();
        let build = configuration.project_directory.join("Platforms/PS5/Build");
        fs::create_dir_all(&build).unwrap();
        fs::write(build.join("TitleConfiguration.json"), r#"{"format": "standard"}"#).unwrap();
        assert!(prepare_ps5(&mut configuration, false).is_err());

        configuration.for_distribution = false;
        prepare_ps5(&mut configuration, false).unwrap();

        configuration.for_distribution = true;
        fs::write(build.join("TitleConfiguration.json"), r#"{"format": "nwonly"}"#).unwrap();
        prepare_ps5(&mut configuration, false).unwrap();
    }
}
