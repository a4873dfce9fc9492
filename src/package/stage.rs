//! Stage phase: gather everything the packager needs into the stage
//! directory.
//!
//! AutomationTool stages applications. Engines older than 4.24 also get
//! binaries, title files, layouts and PAKs staged here.

use anyhow::{bail, Context, Result};
use regex::Regex;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use super::layout::{executable_name, transform};
use super::pak::create_pak_file;
use super::{PackageConfiguration, PackageType};
use crate::config::RunDescriptor;
use crate::error::NimpError;
use crate::fileset::FileMapper;
use crate::fsutil;
use crate::hooks::{self, Hook};
use crate::platform::Platform;
use crate::process::{self, Cmd};

const STAGE_HEARTBEAT_SECS: u64 = 60;

pub fn stage(run: &RunDescriptor, configuration: &PackageConfiguration) -> Result<()> {
    if configuration.package_type == PackageType::ApplicationPatch && !configuration.patch_base_directory.is_dir() {
        bail!(NimpError::config(format!(
            "Patch staging requires a staged application in {}",
            configuration.patch_base_directory.display()
        )));
    }

    tracing::info!(
        "Staging package files for {} (Destination: {})",
        configuration.target_platform.name(),
        configuration.stage_directory.display()
    );
    hooks::execute(Hook::PreStage, run)?;

    for log in uat_logs(&configuration.uat_logs_directory)? {
        fsutil::try_remove(&log, run.dry_run())?;
    }
    fsutil::try_remove(&configuration.stage_directory, run.dry_run())?;
    fsutil::try_create_directory(&configuration.stage_directory, run.dry_run())?;

    if configuration.package_type.is_application() {
        stage_with_uat(run, configuration)?;
    }

    stage_uat_logs(configuration, run.dry_run())?;
    if configuration.engine.older_than(4, 24) {
        stage_binaries(configuration, run.dry_run())?;
        stage_title_files(configuration, run.dry_run())?;
        stage_layout(configuration, run.dry_run())?;
        stage_content(run, configuration)?;

        if configuration.msixvc && !run.dry_run() {
            // Placeholders for empty chunks
            for name in ["LaunchChunk.bin", "AlignmentChunk.bin"] {
                fs::write(configuration.stage_directory.join(name), b"\0")?;
            }
        }
    }

    hooks::execute(Hook::PostStage, run)
}

fn stage_with_uat(run: &RunDescriptor, configuration: &PackageConfiguration) -> Result<()> {
    let mut cmd = Cmd::new(configuration.automation_tool().to_string_lossy())
        .arg("BuildCookRun")
        .arg(format!("-UE{}exe={}", configuration.engine.major, configuration.editor_cmd_exe))
        .arg("-UTF8Output")
        .arg(format!("-Project={}", configuration.project))
        .arg(format!("-TargetPlatform={}", configuration.target_platform.unreal_name()))
        .arg(format!("-ClientConfig={}", configuration.binary_configuration()))
        .args(["-SkipCook", "-Stage", "-Pak", "-Prereqs", "-CrashReporter"]);
    if configuration.no_compile_packaging {
        cmd = cmd.arg("-NoCompile");
    }
    if configuration.for_distribution {
        cmd = cmd.arg("-distribution");
    }
    for option in &configuration.extra_options {
        cmd = cmd.args(process::split_options(option)?);
    }
    if configuration.engine.older_than(4, 22) {
        cmd = cmd.arg("-SkipPak");
    }

    let code = cmd
        .heartbeat(STAGE_HEARTBEAT_SECS)
        .dry_run(run.dry_run())
        .call()?;
    if code != 0 {
        return Err(anyhow::Error::new(NimpError::tool("AutomationTool", code)).context("Stage failed"));
    }
    Ok(())
}

/// `*.txt` files directly under the AutomationTool log directory.
fn uat_logs(directory: &Path) -> Result<Vec<PathBuf>> {
    if !directory.is_dir() {
        return Ok(Vec::new());
    }
    let mut logs = Vec::new();
    for entry in fs::read_dir(directory)? {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "txt") {
            logs.push(path);
        }
    }
    logs.sort();
    Ok(logs)
}

fn stage_uat_logs(configuration: &PackageConfiguration, dry_run: bool) -> Result<()> {
    for log in uat_logs(&configuration.uat_logs_directory)? {
        let Some(name) = log.file_name() else { continue };
        let destination = Path::new("UATLogs").join(name);
        stage_file(&configuration.stage_directory, &log, &destination, dry_run)?;
    }
    Ok(())
}

/// Copy a file or a directory tree to `<stage>/<destination>`.
pub(super) fn stage_file(stage_directory: &Path, source: &Path, destination: &Path, dry_run: bool) -> Result<()> {
    tracing::info!("Staging {} as {}", source.display(), destination.display());
    let target = stage_directory.join(destination);
    if source.is_dir() {
        if !dry_run {
            fsutil::copy_tree(source, &target)?;
        }
    } else if source.is_file() {
        if !dry_run {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(source, &target)
                .with_context(|| format!("Failed to stage {}", source.display()))?;
        }
    } else {
        bail!(NimpError::NotFound(source.display().to_string()));
    }
    Ok(())
}

fn stage_and_transform(
    stage_directory: &Path,
    source: &Path,
    destination: &str,
    parameters: &BTreeMap<String, String>,
    dry_run: bool,
) -> Result<()> {
    tracing::info!("Staging {} as {}", source.display(), destination);
    let content = fs::read_to_string(source)
        .with_context(|| format!("Failed to read {}", source.display()))?;
    let content = transform(&content, parameters)
        .with_context(|| format!("Failed to transform {}", source.display()))?;
    if !dry_run {
        fs::write(stage_directory.join(destination), content)
            .with_context(|| format!("Failed to write {}", destination))?;
    }
    Ok(())
}

fn transform_parameters(configuration: &PackageConfiguration, binary_configuration: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            "executable_name".to_string(),
            executable_name(
                &configuration.project,
                configuration.target_platform.unreal_name(),
                binary_configuration,
            ),
        ),
        ("configuration".to_string(), binary_configuration.to_string()),
    ])
}

/// PDBs next to the executables AutomationTool staged.
fn stage_binaries(configuration: &PackageConfiguration, dry_run: bool) -> Result<()> {
    if !configuration.package_type.is_application()
        || !matches!(configuration.target_platform, Platform::Win64 | Platform::XboxOne)
    {
        return Ok(());
    }
    let platform = configuration.target_platform.unreal_name();
    let source = configuration.project_directory.join("Binaries").join(platform);
    let destination = Path::new(&configuration.project).join("Binaries").join(platform);
    for binary_configuration in &configuration.binary_configurations {
        let pdb = format!("{}.pdb", executable_name(&configuration.project, platform, binary_configuration));
        stage_file(&configuration.stage_directory, &source.join(&pdb), &destination.join(&pdb), dry_run)?;
    }
    Ok(())
}

fn stage_title_files(configuration: &PackageConfiguration, dry_run: bool) -> Result<()> {
    let stage = &configuration.stage_directory;
    match configuration.target_platform {
        Platform::PS4 => {
            // AutomationTool stages the title files of applications.
            if configuration.package_type.is_application() {
                return Ok(());
            }
            let build = configuration.project_directory.join("Build/PS4");
            for title in &configuration.ps4_title_collection {
                let directory = &title.title_directory;
                let lower = directory.to_lowercase();
                stage_file(
                    stage,
                    &build.join("sce_sys").join(directory),
                    &Path::new("sce_sys").join(&lower),
                    dry_run,
                )?;
                stage_file(
                    stage,
                    &build.join("titledata").join(directory).join("title.json"),
                    &Path::new(&lower).join("title.json"),
                    dry_run,
                )?;
            }
        }
        Platform::XboxOne => {
            if configuration.package_type.is_application() && !dry_run {
                for name in ["AppxManifest.xml", "appdata.bin", "resources.pri", "Resources"] {
                    fsutil::try_remove(stage.join(name), false)?;
                }
            }

            let manifest = configuration.configuration_directory.join("XboxOne/AppxManifest.xml");
            for binary_configuration in &configuration.binary_configurations {
                stage_and_transform(
                    stage,
                    &manifest,
                    &format!("AppxManifest-{}.xml", binary_configuration),
                    &transform_parameters(configuration, binary_configuration),
                    dry_run,
                )?;
            }
            stage_resources(configuration, dry_run)?;

            let xdk = std::env::var("DurangoXDK").unwrap_or_else(|_| "/".to_string());
            Cmd::new(Path::new(&xdk).join("bin/MakePri.exe").to_string_lossy())
                .args(["new", "/ProjectRoot"])
                .arg_path(stage)
                .arg("/ConfigXml")
                .arg_path(configuration.project_directory.join("Build/XboxOne/PriConfig.xml"))
                .arg("/Manifest")
                .arg_path(&manifest)
                .arg("/OutputFile")
                .arg_path(stage.join("resources.pri"))
                .arg("/IndexLog")
                .arg_path(stage.join("resources.log.xml"))
                .dry_run(dry_run)
                .check()?;
        }
        Platform::Win64 if configuration.msixvc => {
            let windows = configuration.configuration_directory.join("Windows");
            let (manifest, pattern) = if windows.join("AppxManifest.xml").exists() {
                (windows.join("AppxManifest.xml"), "AppxManifest-{}.xml")
            } else if windows.join("MicrosoftGame.config").exists() {
                (windows.join("MicrosoftGame.config"), "MicrosoftGame-{}.config")
            } else {
                bail!(NimpError::NotFound(
                    "MSIXVC packaging requires AppxManifest.xml or MicrosoftGame.config".to_string()
                ));
            };
            for binary_configuration in &configuration.binary_configurations {
                stage_and_transform(
                    stage,
                    &manifest,
                    &pattern.replace("{}", binary_configuration),
                    &transform_parameters(configuration, binary_configuration),
                    dry_run,
                )?;
            }
            stage_resources(configuration, dry_run)?;

            let sdk = std::env::var("GamingSDK").unwrap_or_else(|_| "/".to_string());
            Cmd::new(Path::new(&sdk).join("bin/MakePri.exe").to_string_lossy())
                .args(["new", "/ProjectRoot"])
                .arg_path(stage)
                .arg("/ConfigXml")
                .arg_path(configuration.project_directory.join("Build/Win64/PriConfig.xml"))
                .arg("/IndexName")
                .arg(identity_name(&manifest)?)
                .arg("/OutputFile")
                .arg_path(stage.join("resources.pri"))
                .arg("/IndexLog")
                .arg_path(stage.join("resources.log.xml"))
                .dry_run(dry_run)
                .check()?;
        }
        _ => {}
    }
    Ok(())
}

/// `*.png` and `*.resw` under the resource directory, into `Resources/`.
fn stage_resources(configuration: &PackageConfiguration, dry_run: bool) -> Result<()> {
    let root = &configuration.resource_directory;
    if !root.is_dir() {
        return Ok(());
    }
    for entry in walkdir::WalkDir::new(root).sort_by_file_name() {
        let entry = entry?;
        let path = entry.path();
        let is_resource = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("png") || ext.eq_ignore_ascii_case("resw"));
        if !entry.file_type().is_file() || !is_resource {
            continue;
        }
        let relative = path.strip_prefix(root)?;
        stage_file(&configuration.stage_directory, path, &Path::new("Resources").join(relative), dry_run)?;
    }
    Ok(())
}

/// `Name` attribute of the manifest's `<Identity>` element.
fn identity_name(manifest: &Path) -> Result<String> {
    let content = fs::read_to_string(manifest)
        .with_context(|| format!("Failed to read {}", manifest.display()))?;
    let pattern = Regex::new(r#"<Identity\b[^>]*?\bName\s*=\s*"([^"]*)""#)?;
    match pattern.captures(&content) {
        Some(captures) => Ok(captures[1].to_string()),
        None => bail!(NimpError::config(format!("No Identity Name in {}", manifest.display()))),
    }
}

fn stage_layout(configuration: &PackageConfiguration, dry_run: bool) -> Result<()> {
    let is_ps4 = configuration.target_platform == Platform::PS4;
    if !is_ps4 && !configuration.msixvc {
        return Ok(());
    }
    let Some(source) = &configuration.layout_file_path else {
        bail!(NimpError::config(format!(
            "No layout file for {}",
            configuration.target_platform.name()
        )));
    };

    for binary_configuration in &configuration.binary_configurations {
        let mut parameters = transform_parameters(configuration, binary_configuration);
        if !is_ps4 {
            let destination = format!("{}-{}.xml", configuration.project, binary_configuration);
            stage_and_transform(&configuration.stage_directory, source, &destination, &parameters, dry_run)?;
            continue;
        }

        for title in &configuration.ps4_title_collection {
            parameters.extend(title.fields.clone());
            parameters.insert("title_directory".to_string(), title.title_directory.to_lowercase());
            parameters.insert("region".to_string(), title.region().to_lowercase());
            parameters.insert(
                "executable_name".to_string(),
                executable_name(&configuration.project, configuration.target_platform.unreal_name(), binary_configuration)
                    .to_lowercase(),
            );
            parameters.insert("configuration".to_string(), binary_configuration.to_lowercase());
            let destination = format!(
                "{}-{}-{}.{}",
                configuration.project,
                title.region(),
                binary_configuration,
                configuration.layout_file_extension
            )
            .to_lowercase();
            stage_and_transform(&configuration.stage_directory, source, &destination, &parameters, dry_run)?;
        }
    }
    Ok(())
}

/// `content_other` files, then the PAK collection.
fn stage_content(run: &RunDescriptor, configuration: &PackageConfiguration) -> Result<()> {
    if configuration.package_type == PackageType::Entitlement {
        return Ok(());
    }

    match FileMapper::load(run, "content_other", &BTreeMap::new()) {
        Ok(mapper) => {
            for (source, destination) in mapper.to_list(&run.root_dir().to_string_lossy(), ".")? {
                let destination = if configuration.target_platform == Platform::PS4 {
                    destination.to_lowercase()
                } else {
                    destination
                };
                stage_file(
                    &configuration.stage_directory,
                    Path::new(&source),
                    Path::new(&destination),
                    run.dry_run(),
                )?;
            }
        }
        Err(e) if matches!(e.downcast_ref::<NimpError>(), Some(NimpError::NotFound(_))) => {
            tracing::debug!("No content_other fileset");
        }
        Err(e) => return Err(e),
    }

    let patch_base = configuration
        .patch_base_directory
        .join(&configuration.project)
        .join("Content/Paks");
    let destination = configuration
        .stage_directory
        .join(&configuration.project)
        .join("Content/Paks");
    for pak_name in &configuration.pak_collection {
        create_pak_file(run, configuration, pak_name.as_deref(), &patch_base, &destination)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineVersion;
    use crate::package::tests::project;
    use crate::package::PackageOptions;
    use tempfile::TempDir;

    #[test]
    fn test_patch_requires_patch_base() {
        let dir = TempDir::new().unwrap();
        let run = project(dir.path(), Platform::Win64, EngineVersion::new(5, 1, 0));
        let options = PackageOptions {
            patch: true,
            ..Default::default()
        };
        let configuration = PackageConfiguration::new(&run, &options).unwrap();
        let err = stage(&run, &configuration).unwrap_err();
        assert!(err.to_string().contains("Patch staging requires"));
        assert!(!configuration.stage_directory.exists());
    }

    #[test]
    fn test_stage_file_missing_source() {
        let dir = TempDir::new().unwrap();
        let err = stage_file(dir.path(), &dir.path().join("missing"), Path::new("x"), false).unwrap_err();
        assert!(matches!(err.downcast_ref::<NimpError>(), Some(NimpError::NotFound(_))));
    }

    #[test]
    fn test_identity_name() {
        let dir = TempDir::new().unwrap();
        let manifest = dir.path().join("AppxManifest.xml");
        fs::write(&manifest, "<Package>\n  <Identity Publisher=\"CN=X\" Name=\"Studio.Game\" Version=\"1.0.0.0\"/>\n</Package>").unwrap();
        assert_eq!(identity_name(&manifest).unwrap(), "Studio.Game");
    }

    #[test]
    fn test_legacy_ps4_dlc_stage() {
        let dir = TempDir::new().unwrap();
        let run = project(dir.path(), Platform::PS4, EngineVersion::new(4, 23, 0));
        let game = run.uproject_dir().unwrap().to_path_buf();

        let build = game.join("Build/PS4");
        fs::create_dir_all(build.join("sce_sys/CUSA00001")).unwrap();
        fs::write(build.join("sce_sys/CUSA00001/icon0.png"), b"png").unwrap();
        fs::create_dir_all(build.join("titledata/CUSA00001")).unwrap();
        fs::write(
            build.join("titledata/CUSA00001/title.json"),
            r#"{"region": "scea", "storagetype": "digital25", "title_passcode": "x"}"#,
        )
        .unwrap();
        fs::write(
            build.join("Layout.gp4"),
            "<psproject>{title_directory} {region} {executable_name}<!-- #if Debug --><debug/><!-- #endif Debug --></psproject>",
        )
        .unwrap();
        fs::create_dir_all(dir.path().join(".nimp/filesets")).unwrap();
        fs::write(
            dir.path().join(".nimp/filesets/content_pak.toml"),
            "[[rule]]\nsteps = [{ src = \"{uproject_dir}/Missing\" }, { glob = [\"*\"] }]\n",
        )
        .unwrap();

        let options = PackageOptions {
            dlc: true,
            ps4_titles: vec!["CUSA00001".to_string()],
            layout: Some(build.join("Layout.gp4").to_string_lossy().into_owned()),
            ..Default::default()
        };
        let mut configuration = PackageConfiguration::new(&run, &options).unwrap();
        configuration.load_platform_data().unwrap();
        stage(&run, &configuration).unwrap();

        let stage = &configuration.stage_directory;
        assert!(stage.join("sce_sys/cusa00001/icon0.png").is_file());
        assert!(stage.join("cusa00001/title.json").is_file());
        let development = fs::read_to_string(stage.join("game-scea-development.gp4")).unwrap();
        assert_eq!(development, "<psproject>cusa00001 scea game<debug/></psproject>");
        let shipping = fs::read_to_string(stage.join("game-scea-shipping.gp4")).unwrap();
        assert_eq!(shipping, "<psproject>cusa00001 scea game-ps4-shipping</psproject>");
    }

    #[test]
    fn test_uat_logs_staged() {
        let dir = TempDir::new().unwrap();
        let run = project(dir.path(), Platform::Linux, EngineVersion::new(5, 1, 0));
        let configuration = PackageConfiguration::new(&run, &PackageOptions::default()).unwrap();
        fs::create_dir_all(&configuration.uat_logs_directory).unwrap();
        fs::write(configuration.uat_logs_directory.join("Log.txt"), "log").unwrap();
        fs::write(configuration.uat_logs_directory.join("Other.json"), "{}").unwrap();
        fs::create_dir_all(&configuration.stage_directory).unwrap();

        stage_uat_logs(&configuration, false).unwrap();
        assert!(configuration.stage_directory.join("UATLogs/Log.txt").is_file());
        assert!(!configuration.stage_directory.join("UATLogs/Other.json").exists());
    }
}
