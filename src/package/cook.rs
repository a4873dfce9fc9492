//! Cook phase.

use anyhow::{Context, Result};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use super::{PackageConfiguration, PackageType};
use crate::config::RunDescriptor;
use crate::error::NimpError;
use crate::fsutil;
use crate::hooks::{self, Hook};
use crate::process::{self, Cmd};
use crate::retry::{self, RetryPolicy};

const COOK_HEARTBEAT_SECS: u64 = 60;

const CONSOLE_VARIABLES: &[&str] = &[
    "r.DumpShaderDebugInfo=1",
    "r.DumpShaderDebugShortNames=1",
    "r.PS4ShaderSDBMode=1",
    "r.PS4DumpShaderSDB=1",
    "r.PS4SDBZip=0",
    "r.PS5ShaderDebugMode=1",
    "r.PS5DumpShaderDebug=1",
    "r.PS5ShaderDebugZip=0",
];

/// Build the project content for the target platform.
pub fn cook(run: &RunDescriptor, configuration: &PackageConfiguration) -> Result<()> {
    if configuration.package_type == PackageType::Entitlement {
        return Ok(());
    }
    tracing::info!("Cooking content for {}", configuration.target_platform.name());

    if !configuration.iterative_cook {
        fsutil::try_remove(&configuration.cook_directory, run.dry_run())?;
        fsutil::try_create_directory(&configuration.cook_directory, run.dry_run())?;
    }

    hooks::execute(Hook::PreCook, run)?;

    let mut cmd = Cmd::new(configuration.editor_path.to_string_lossy())
        .arg(configuration.project.as_str())
        .arg("-Run=Cook")
        .arg(format!("-TargetPlatform={}", configuration.cook_platform))
        .args(["-BuildMachine", "-Unattended", "-StdOut", "-UTF8Output"]);
    if configuration.engine.major >= 5 {
        cmd = cmd.arg("-unversioned");
    }
    if configuration.iterative_cook {
        cmd = cmd.args(["-Iterate", "-IterateHash"]);
    }
    for option in &configuration.extra_options {
        cmd = cmd.args(process::split_options(option)?);
    }

    {
        let _shader_debug_info = if configuration.shader_debug_info && !run.dry_run() {
            Some(ShaderDebugInfo::enable(configuration)?)
        } else {
            None
        };

        // Background shader compilation can stay silent for a long time.
        let code = cmd
            .heartbeat(COOK_HEARTBEAT_SECS)
            .dry_run(run.dry_run())
            .call()?;
        if code != 0 {
            return Err(anyhow::Error::new(NimpError::tool("Cook", code)).context("Cook failed"));
        }
    }

    if !run.dry_run() {
        backup_uat_logs(&configuration.uat_logs_directory)?;
    }

    hooks::execute(Hook::PostCook, run)
}

/// `DefaultEngine.ini` with the shader debug stanzas appended. The
/// original file is restored on drop.
struct ShaderDebugInfo {
    ini: PathBuf,
    backup: PathBuf,
}

impl ShaderDebugInfo {
    fn enable(configuration: &PackageConfiguration) -> Result<Self> {
        let pdb_root = configuration
            .project_directory
            .join("Saved/ShaderDebugInfo")
            .join(configuration.target_platform.unreal_name());
        fs::create_dir_all(&pdb_root)
            .with_context(|| format!("Failed to create {}", pdb_root.display()))?;

        let ini = configuration.configuration_directory.join("DefaultEngine.ini");
        let backup = PathBuf::from(format!("{}.nimp.bak", ini.display()));
        fsutil::try_remove(&backup, false)?;
        fs::rename(&ini, &backup).with_context(|| format!("Failed to back up {}", ini.display()))?;
        let guard = Self { ini, backup };
        fs::copy(&guard.backup, &guard.ini)
            .with_context(|| format!("Failed to restore {}", guard.ini.display()))?;

        let mut stanzas = String::from("\n[ConsoleVariables]\n");
        for variable in CONSOLE_VARIABLES {
            stanzas.push_str(variable);
            stanzas.push('\n');
        }
        stanzas.push_str("\n[DevOptions.Shaders]\n");
        stanzas.push_str(&format!(
            "ShaderPDBRoot={}\n\n",
            fsutil::absolute(&pdb_root.to_string_lossy())
        ));

        tracing::info!("Enabling shader debug info in {}", guard.ini.display());
        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(&guard.ini)
            .with_context(|| format!("Failed to open {}", guard.ini.display()))?;
        file.write_all(stanzas.as_bytes())?;
        Ok(guard)
    }
}

impl Drop for ShaderDebugInfo {
    fn drop(&mut self) {
        fsutil::remove_best_effort(&self.ini);
        if let Err(e) = fs::rename(&self.backup, &self.ini) {
            tracing::warn!("Failed to restore {}: {}", self.ini.display(), e);
        }
    }
}

/// Keep the cook's AutomationTool logs apart from the stage's.
fn backup_uat_logs(logs: &Path) -> Result<()> {
    if !logs.is_dir() {
        return Ok(());
    }
    let backup = PathBuf::from(format!("{}-Cook", logs.display()));
    fsutil::try_remove(&backup, false)?;
    retry::try_execute(RetryPolicy::RENAME, retry::is_transient, || {
        fs::rename(logs, &backup)
            .with_context(|| format!("Failed to move {} to {}", logs.display(), backup.display()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineVersion;
    use crate::package::tests::project;
    use crate::package::PackageOptions;
    use crate::platform::Platform;
    use tempfile::TempDir;

    fn setup(dir: &Path) -> (RunDescriptor, PackageConfiguration) {
        let run = project(dir, Platform::Linux, EngineVersion::new(5, 1, 0));
        let options = PackageOptions {
            shader_debug_info: true,
            ..Default::default()
        };
        let configuration = PackageConfiguration::new(&run, &options).unwrap();
        fs::write(configuration.configuration_directory.join("DefaultEngine.ini"), "[Core]\nA=1\n").unwrap();
        (run, configuration)
    }

    #[cfg(unix)]
    fn editor(configuration: &mut PackageConfiguration, script: &str) {
        let path = configuration.project_directory.join("FakeEditor");
        fs::write(&path, script).unwrap();
        fsutil::make_executable(&path).unwrap();
        configuration.editor_path = path;
    }

    #[cfg(unix)]
    #[test]
    fn test_shader_debug_info_restored_after_cook() {
        let dir = TempDir::new().unwrap();
        let (run, mut configuration) = setup(dir.path());
        let ini = configuration.configuration_directory.join("DefaultEngine.ini");
        editor(
            &mut configuration,
            &format!("#!/bin/sh\ngrep -q ShaderPDBRoot '{}' || exit 5\n", ini.display()),
        );

        cook(&run, &configuration).unwrap();
        assert_eq!(fs::read_to_string(&ini).unwrap(), "[Core]\nA=1\n");
        assert!(!dir.path().join("Game/Config/DefaultEngine.ini.nimp.bak").exists());
        assert!(dir.path().join("Game/Saved/ShaderDebugInfo/Linux").is_dir());
    }

    #[cfg(unix)]
    #[test]
    fn test_failed_cook_restores_ini() {
        let dir = TempDir::new().unwrap();
        let (run, mut configuration) = setup(dir.path());
        editor(&mut configuration, "#!/bin/sh\nexit 1\n");

        let err = cook(&run, &configuration).unwrap_err();
        assert!(format!("{:#}", err).contains("Cook failed"));
        let ini = configuration.configuration_directory.join("DefaultEngine.ini");
        assert_eq!(fs::read_to_string(ini).unwrap(), "[Core]\nA=1\n");
    }

    #[cfg(unix)]
    #[test]
    fn test_uat_logs_moved_after_cook() {
        let dir = TempDir::new().unwrap();
        let (run, mut configuration) = setup(dir.path());
        configuration.shader_debug_info = false;
        editor(&mut configuration, "#!/bin/sh\nexit 0\n");
        fs::create_dir_all(&configuration.uat_logs_directory).unwrap();
        fs::write(configuration.uat_logs_directory.join("Log.txt"), "log").unwrap();
        let backup = PathBuf::from(format!("{}-Cook", configuration.uat_logs_directory.display()));
        fs::create_dir_all(&backup).unwrap();
        fs::write(backup.join("Stale.txt"), "old").unwrap();

        cook(&run, &configuration).unwrap();
        assert!(!configuration.uat_logs_directory.exists());
        assert!(backup.join("Log.txt").is_file());
        assert!(!backup.join("Stale.txt").exists());
        assert!(configuration.cook_directory.is_dir());
    }

    #[test]
    fn test_entitlement_skips_cook() {
        let dir = TempDir::new().unwrap();
        let (run, mut configuration) = setup(dir.path());
        configuration.package_type = PackageType::Entitlement;
        cook(&run, &configuration).unwrap();
        assert!(!configuration.cook_directory.exists());
    }
}
