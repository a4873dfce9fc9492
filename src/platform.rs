//! Platform registry.
//!
//! Every target nimp knows about is a variant of [`Platform`]. Lookup goes
//! through canonical names and aliases; an unknown name yields
//! [`Platform::Null`], which reports `is_valid() == false` so callers can
//! decide whether that is fatal.
//!
//! SDK tool locations are resolved from the environment at call time
//! (`SCE_ROOT_DIR`, `SCE_PROSPERO_SDK_DIR`, `GameDK`, `DurangoXDK`,
//! `GamingSDK`).

use anyhow::{bail, Context, Result};
use regex::Regex;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::RunDescriptor;
use crate::error::NimpError;
use crate::process::Cmd;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Platform {
    Null,
    Win32,
    Win64,
    Linux,
    Mac,
    PS4,
    PS5,
    XboxOne,
    XSX,
    WinGDK,
    Switch,
    Android,
    IOS,
}

impl Platform {
    /// Every valid platform, in registry order.
    pub const ALL: [Platform; 12] = [
        Platform::Win32,
        Platform::Win64,
        Platform::Linux,
        Platform::Mac,
        Platform::PS4,
        Platform::PS5,
        Platform::XboxOne,
        Platform::XSX,
        Platform::WinGDK,
        Platform::Switch,
        Platform::Android,
        Platform::IOS,
    ];

    /// Look up by canonical name or alias, case-insensitively.
    pub fn from_name(name: &str) -> Self {
        let lower = name.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|p| p.name() == lower || p.aliases().contains(&lower.as_str()))
            .unwrap_or(Platform::Null)
    }

    /// Look up by Engine name (`Win64`, `PS4`, ...).
    pub fn from_unreal_name(name: &str) -> Self {
        Self::ALL
            .into_iter()
            .find(|p| p.unreal_name().eq_ignore_ascii_case(name))
            .unwrap_or(Platform::Null)
    }

    /// Like [`Platform::from_name`] but unknown names are a configuration error.
    pub fn require(name: &str) -> Result<Self> {
        let platform = Self::from_name(name);
        if !platform.is_valid() {
            bail!(NimpError::config(format!("Unknown platform \"{}\"", name)));
        }
        Ok(platform)
    }

    /// The platform nimp is running on.
    pub fn host() -> Self {
        if cfg!(windows) {
            Platform::Win64
        } else if cfg!(target_os = "macos") {
            Platform::Mac
        } else {
            Platform::Linux
        }
    }

    pub fn is_valid(self) -> bool {
        self != Platform::Null
    }

    pub fn name(self) -> &'static str {
        match self {
            Platform::Null => "null",
            Platform::Win32 => "win32",
            Platform::Win64 => "win64",
            Platform::Linux => "linux",
            Platform::Mac => "mac",
            Platform::PS4 => "ps4",
            Platform::PS5 => "ps5",
            Platform::XboxOne => "xboxone",
            Platform::XSX => "xsx",
            Platform::WinGDK => "wingdk",
            Platform::Switch => "switch",
            Platform::Android => "android",
            Platform::IOS => "ios",
        }
    }

    pub fn aliases(self) -> &'static [&'static str] {
        match self {
            Platform::Win32 => &["pcconsole"],
            Platform::Win64 => &["pc", "windows"],
            Platform::Mac => &["macos", "osx"],
            Platform::PS4 => &["orbis"],
            Platform::PS5 => &["prospero"],
            Platform::XboxOne => &["xone"],
            Platform::XSX => &["scarlett"],
            Platform::Switch => &["nintendo", "nx"],
            _ => &[],
        }
    }

    pub fn unreal_name(self) -> &'static str {
        match self {
            Platform::Null => "Null",
            Platform::Win32 => "Win32",
            Platform::Win64 => "Win64",
            Platform::Linux => "Linux",
            Platform::Mac => "Mac",
            Platform::PS4 => "PS4",
            Platform::PS5 => "PS5",
            Platform::XboxOne => "XboxOne",
            Platform::XSX => "XSX",
            Platform::WinGDK => "WinGDK",
            Platform::Switch => "Switch",
            Platform::Android => "Android",
            Platform::IOS => "IOS",
        }
    }

    /// Name of the platform's `Config/<name>` directory.
    pub fn config_name(self) -> &'static str {
        match self {
            Platform::Win32 | Platform::Win64 => "Windows",
            other => other.unreal_name(),
        }
    }

    /// Cooked content directory name. Engine 5 dropped the `NoEditor` suffix.
    pub fn cook_name(self, engine_major: u32) -> &'static str {
        let ue5 = engine_major >= 5;
        match self {
            Platform::Win32 | Platform::Win64 if ue5 => "Windows",
            Platform::Win32 | Platform::Win64 => "WindowsNoEditor",
            Platform::Linux if ue5 => "Linux",
            Platform::Linux => "LinuxNoEditor",
            Platform::Mac if ue5 => "Mac",
            Platform::Mac => "MacNoEditor",
            other => other.unreal_name(),
        }
    }

    pub fn is_microsoft(self) -> bool {
        matches!(
            self,
            Platform::Win32 | Platform::Win64 | Platform::XboxOne | Platform::XSX | Platform::WinGDK
        )
    }

    pub fn is_sony(self) -> bool {
        matches!(self, Platform::PS4 | Platform::PS5)
    }

    pub fn is_nintendo(self) -> bool {
        self == Platform::Switch
    }

    pub fn is_mobile(self) -> bool {
        matches!(self, Platform::Android | Platform::IOS)
    }

    pub fn is_desktop(self) -> bool {
        matches!(self, Platform::Win32 | Platform::Win64 | Platform::Linux | Platform::Mac)
    }

    /// Extension of the packaging layout file.
    pub fn layout_extension(self) -> &'static str {
        match self {
            Platform::PS4 => "gp4",
            Platform::PS5 => "gp5",
            Platform::Win64 | Platform::XboxOne | Platform::XSX | Platform::WinGDK => "xml",
            _ => "txt",
        }
    }

    /// Packaged output directory, as a placeholder pattern.
    pub fn package_directory_pattern(self) -> &'static str {
        match self {
            Platform::XSX => "{uproject_dir}/Binaries/XSX",
            Platform::Switch => "{uproject_dir}/Binaries/Switch",
            _ => "{uproject_dir}/Saved/Packages/{cook_platform}",
        }
    }

    /// Console packaging tool, when the platform has one.
    pub fn package_tool_path(self) -> Option<PathBuf> {
        let var = |name: &str| env::var(name).ok().filter(|v| !v.is_empty());
        match self {
            Platform::Win64 => Some(
                PathBuf::from(var("GamingSDK").unwrap_or_else(|| ".".into()))
                    .join("bin")
                    .join("MakePkg.exe"),
            ),
            Platform::PS4 => Some(
                PathBuf::from(var("SCE_ROOT_DIR").unwrap_or_else(|| ".".into()))
                    .join("ORBIS/Tools/Publishing Tools/bin/orbis-pub-cmd.exe"),
            ),
            Platform::PS5 => Some(match (var("SCE_PROSPERO_SDK_DIR"), var("SCE_ROOT_DIR")) {
                (Some(sdk), _) => {
                    PathBuf::from(sdk).join("../Tools/Publishing Tools/bin/prospero-pub-cmd.exe")
                }
                (None, root) => PathBuf::from(root.unwrap_or_else(|| ".".into()))
                    .join("PROSPERO/Tools/Publishing Tools/bin/prospero-pub-cmd.exe"),
            }),
            Platform::XboxOne => Some(
                PathBuf::from(var("DurangoXDK").unwrap_or_else(|| ".".into()))
                    .join("bin")
                    .join("MakePkg.exe"),
            ),
            Platform::XSX | Platform::WinGDK => Some(gdk_dir().join("bin").join("MakePkg.exe")),
            _ => None,
        }
    }

    /// Environment variables the platform's SDK needs.
    pub fn sdk_environment(self) -> &'static [&'static str] {
        match self {
            Platform::PS4 => &["SCE_ROOT_DIR"],
            Platform::PS5 => &["SCE_PROSPERO_SDK_DIR"],
            Platform::XboxOne => &["DurangoXDK"],
            Platform::XSX | Platform::WinGDK => &["GameDK"],
            _ => &[],
        }
    }

    /// Install a package built under `directory` on the run's device.
    pub fn install_package(self, directory: &Path, run: &RunDescriptor) -> Result<bool> {
        let device = run.parameter("device");
        match self {
            Platform::PS5 => {
                let config = run.primary_unreal_configuration()?;
                let pkg = single_file(directory, &format!("{}.pkg", config))?;
                let mut cmd = Cmd::new(prospero_tool("prospero-ctrl.exe").to_string_lossy())
                    .args(["package", "install"])
                    .arg_path(&pkg);
                if let Some(ip) = device {
                    cmd = cmd.arg(format!("/target:{}", ip));
                }
                Ok(cmd.dry_run(run.dry_run()).call()? == 0)
            }
            Platform::XSX => {
                let xvc = single_file(directory, ".xvc")?;
                let mut cmd = Cmd::new(gdk_tool("xbapp.exe").to_string_lossy())
                    .arg("install")
                    .arg_path(&xvc);
                if let Some(ip) = device {
                    cmd = cmd.arg(format!("/X:{}", ip));
                }
                Ok(cmd.dry_run(run.dry_run()).call()? == 0)
            }
            Platform::WinGDK => {
                let msixvc = single_file(directory, ".msixvc")?;
                let cmd = Cmd::new(gdk_tool("wdapp.exe").to_string_lossy())
                    .arg("install")
                    .arg_path(&msixvc);
                Ok(cmd.dry_run(run.dry_run()).call()? == 0)
            }
            other => {
                tracing::error!("Installing packages is not supported on {}", other.name());
                Ok(false)
            }
        }
    }

    /// Launch an installed package. Without a name, the project's own
    /// title is looked up.
    pub fn launch_package(self, name: Option<&str>, run: &RunDescriptor) -> Result<bool> {
        let device = run.parameter("device");
        match self {
            Platform::PS5 => {
                let title_id = match name {
                    Some(name) => pick_ps5_title(&ps5_installed_titles(device)?, name)?,
                    None => match ps5_title_id_from_json(run.uproject_dir()?, run.variant())? {
                        Some(id) => id,
                        None => pick_ps5_title(&ps5_installed_titles(device)?, run.uproject()?)?,
                    },
                };
                let mut cmd = Cmd::new(prospero_tool("prospero-run.exe").to_string_lossy());
                if let Some(ip) = device {
                    cmd = cmd.arg(format!("/target:{}", ip));
                }
                Ok(cmd.args(["-app", &title_id]).dry_run(run.dry_run()).call()? == 0)
            }
            Platform::XSX => {
                let package_name = match name {
                    Some(name) => name.to_string(),
                    None => project_name_from_ini(run.uproject_dir()?, run.variant())?,
                };
                let mut list = Cmd::new(gdk_tool("xbapp.exe").to_string_lossy()).arg("list");
                if let Some(ip) = device {
                    list = list.arg(format!("/x:{}", ip));
                }
                let output = list.hide_output().capture()?;
                if !output.success() {
                    bail!(NimpError::tool("xbapp", output.code));
                }
                let installed = parse_xbapp_list(&output.stdout);
                let config = run.primary_unreal_configuration()?;
                let package = pick_xbox_package(&installed, &package_name, config)?;
                let mut cmd = Cmd::new(gdk_tool("xbapp.exe").to_string_lossy())
                    .args(["launch", &package]);
                if let Some(ip) = device {
                    cmd = cmd.arg(format!("/X:{}", ip));
                }
                Ok(cmd.dry_run(run.dry_run()).call()? == 0)
            }
            Platform::WinGDK => {
                let package_name = match name {
                    Some(name) => name.to_string(),
                    None => project_name_from_ini(run.uproject_dir()?, run.variant())?,
                };
                let cmd = Cmd::new(gdk_tool("wdapp.exe").to_string_lossy())
                    .args(["launch", &package_name]);
                Ok(cmd.dry_run(run.dry_run()).call()? == 0)
            }
            other => {
                tracing::error!("Launching packages is not supported on {}", other.name());
                Ok(false)
            }
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

fn gdk_dir() -> PathBuf {
    env::var("GameDK")
        .ok()
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(r"C:\Program Files (x86)\Microsoft GDK"))
}

fn gdk_tool(name: &str) -> PathBuf {
    gdk_dir().join("bin").join(name)
}

/// Target Manager tools live next to the SDK, not inside it.
fn prospero_tool(name: &str) -> PathBuf {
    let sdk = env::var("SCE_PROSPERO_SDK_DIR")
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| r"C:\Program Files (x86)\SCE\Prospero SDKs\2.000".to_string());
    PathBuf::from(sdk)
        .join("../../Prospero/Tools/Target Manager Server/bin")
        .join(name)
}

/// The one file in `directory` whose name ends with `suffix`.
fn single_file(directory: &Path, suffix: &str) -> Result<PathBuf> {
    let mut matches: Vec<PathBuf> = fs::read_dir(directory)
        .with_context(|| format!("Failed to list {}", directory.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.is_file()
                && path
                    .file_name()
                    .is_some_and(|n| n.to_string_lossy().ends_with(suffix))
        })
        .collect();
    matches.sort();
    match matches.len() {
        0 => bail!(NimpError::NotFound(format!(
            "No *{} file in {}",
            suffix,
            directory.display()
        ))),
        1 => Ok(matches.remove(0)),
        _ => {
            tracing::info!("Found packages:");
            for path in &matches {
                tracing::info!("\t\t{}", path.display());
            }
            bail!(NimpError::config(format!(
                "Multiple *{} files in {}",
                suffix,
                directory.display()
            )))
        }
    }
}

fn ps5_installed_titles(device: Option<&str>) -> Result<Vec<(String, String)>> {
    let mut cmd = Cmd::new(prospero_tool("prospero-ctrl.exe").to_string_lossy())
        .args(["package", "list"]);
    if let Some(ip) = device {
        cmd = cmd.arg(format!("/target:{}", ip));
    }
    let output = cmd.hide_output().capture()?;
    if !output.success() {
        bail!(NimpError::tool("prospero-ctrl", output.code));
    }
    parse_ps5_package_list(&output.stdout)
}

/// `(title name, title id)` pairs from `prospero-ctrl package list`.
fn parse_ps5_package_list(output: &str) -> Result<Vec<(String, String)>> {
    let mut titles = Vec::new();
    let mut last_id: Option<String> = None;
    for line in output.lines() {
        if let Some(id) = line.strip_prefix("- TitleId: ") {
            last_id = Some(id.trim().to_string());
        } else if let Some(name) = line.strip_prefix("  TitleName: ") {
            let Some(id) = last_id.take() else {
                bail!("Parsing error: missing TitleId before TitleName");
            };
            titles.push((name.trim().to_string(), id));
        }
    }
    Ok(titles)
}

fn pick_ps5_title(installed: &[(String, String)], package_name: &str) -> Result<String> {
    let matching: Vec<&String> = installed
        .iter()
        .filter(|(name, _)| name.contains(package_name))
        .map(|(_, id)| id)
        .collect();
    if matching.len() == 1 {
        return Ok(matching[0].clone());
    }
    tracing::info!("Installed packages:");
    for (name, _) in installed {
        tracing::info!("\t\t{}", name);
    }
    if matching.is_empty() {
        bail!(NimpError::NotFound(format!("Package {}", package_name)));
    }
    bail!(NimpError::config(format!("Multiple packages found for {}", package_name)))
}

/// Title id embedded in the variant's `DefaultContentID`.
fn ps5_title_id_from_json(project_dir: &Path, variant: Option<&str>) -> Result<Option<String>> {
    let path = project_dir
        .join("Platforms/PS5/Build/Variants")
        .join(variant.unwrap_or("BaseGame"))
        .join("TitleConfiguration.json");
    if !path.is_file() {
        tracing::error!(
            "Missing file: {}, the BaseGame variant and its configuration is required to exist.",
            path.display()
        );
        return Ok(None);
    }
    let content: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path)?)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    let Some(content_id) = content.get("DefaultContentID").and_then(|v| v.as_str()) else {
        tracing::warn!("No \"DefaultContentID\" in {}, looking for package name instead", path.display());
        return Ok(None);
    };
    Ok(title_id_from_content_id(content_id))
}

fn title_id_from_content_id(content_id: &str) -> Option<String> {
    let pattern = Regex::new(r"^[A-Z]{2}[0-9]{4}-([A-Z]{4}[0-9]{5})_00-[A-Z0-9]{16}").ok()?;
    pattern
        .captures(content_id)
        .map(|captures| captures[1].to_string())
}

fn project_name_from_ini(project_dir: &Path, variant: Option<&str>) -> Result<String> {
    let ini = match variant {
        Some(variant) => project_dir.join("Config/Variants").join(variant).join("DefaultGame.ini"),
        None => project_dir.join("Config/DefaultGame.ini"),
    };
    crate::fsutil::ini_value(&ini, "ProjectName")
}

fn parse_xbapp_list(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.strip_prefix("        "))
        .map(str::trim_end)
        .filter(|name| !name.is_empty() && !name.contains(char::is_whitespace))
        .map(str::to_string)
        .collect()
}

fn pick_xbox_package(installed: &[String], package_name: &str, configuration: &str) -> Result<String> {
    let matching: Vec<&String> = installed
        .iter()
        .filter(|candidate| candidate.contains(package_name) && candidate.contains(configuration))
        .collect();
    if matching.len() == 1 {
        return Ok(matching[0].clone());
    }
    tracing::info!("Installed packages:");
    for pkg in installed {
        tracing::info!("\t\t{}", pkg);
    }
    if matching.is_empty() {
        bail!(NimpError::NotFound(format!(
            "Package {} for configuration {}",
            package_name, configuration
        )));
    }
    bail!(NimpError::config(format!(
        "Multiple packages found for {} for configuration {}",
        package_name, configuration
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_aliases_resolve_to_canonical() {
        for name in ["pc", "windows", "win64", "WIN64"] {
            assert_eq!(Platform::from_name(name), Platform::Win64);
        }
        assert_eq!(Platform::from_name("orbis"), Platform::PS4);
        assert_eq!(Platform::from_name("prospero"), Platform::PS5);
        assert_eq!(Platform::from_name("osx"), Platform::Mac);
    }

    #[test]
    fn test_unknown_platform_is_null() {
        let platform = Platform::from_name("dreamcast");
        assert!(!platform.is_valid());
        assert!(Platform::require("dreamcast").is_err());
    }

    #[test]
    fn test_cook_names_per_engine_major() {
        assert_eq!(Platform::Win64.cook_name(4), "WindowsNoEditor");
        assert_eq!(Platform::Win64.cook_name(5), "Windows");
        assert_eq!(Platform::Linux.cook_name(4), "LinuxNoEditor");
        assert_eq!(Platform::PS5.cook_name(5), "PS5");
    }

    #[test]
    fn test_families() {
        assert!(Platform::XSX.is_microsoft());
        assert!(Platform::PS5.is_sony());
        assert!(Platform::Switch.is_nintendo());
        assert!(Platform::Android.is_mobile());
        assert!(!Platform::Linux.is_microsoft());
    }

    #[test]
    fn test_package_directory_pattern() {
        assert_eq!(Platform::XSX.package_directory_pattern(), "{uproject_dir}/Binaries/XSX");
        assert_eq!(
            Platform::PS4.package_directory_pattern(),
            "{uproject_dir}/Saved/Packages/{cook_platform}"
        );
    }

    #[test]
    fn test_unreal_name_round_trip() {
        for platform in Platform::ALL {
            assert_eq!(Platform::from_unreal_name(platform.unreal_name()), platform);
        }
    }

    #[test]
    fn test_title_id_from_content_id() {
        assert_eq!(
            title_id_from_content_id("EP1234-PPSA01234_00-ABCDEFGHIJKLMNOP").as_deref(),
            Some("PPSA01234")
        );
        assert_eq!(title_id_from_content_id("garbage"), None);
    }

    #[test]
    fn test_parse_ps5_package_list() {
        let output = "- TitleId: PPSA00001\n  TitleName: Game Demo\n- TitleId: PPSA00002\n  TitleName: Other\n";
        let titles = parse_ps5_package_list(output).unwrap();
        assert_eq!(pick_ps5_title(&titles, "Game").unwrap(), "PPSA00001");
        assert!(pick_ps5_title(&titles, "Missing").is_err());
        assert!(parse_ps5_package_list("  TitleName: orphan\n").is_err());
    }

    #[test]
    fn test_pick_xbox_package() {
        let installed = parse_xbapp_list(
            "Installed:\n        Game_Development_1.0_x64__abc\n        Game_Shipping_1.0_x64__abc\n",
        );
        assert_eq!(installed.len(), 2);
        assert_eq!(
            pick_xbox_package(&installed, "Game", "Shipping").unwrap(),
            "Game_Shipping_1.0_x64__abc"
        );
        assert!(pick_xbox_package(&installed, "Game", "Test").is_err());
    }

    #[test]
    fn test_single_file() {
        let dir = TempDir::new().unwrap();
        assert!(single_file(dir.path(), ".xvc").is_err());
        fs::write(dir.path().join("a.xvc"), b"").unwrap();
        assert_eq!(single_file(dir.path(), ".xvc").unwrap(), dir.path().join("a.xvc"));
        fs::write(dir.path().join("b.xvc"), b"").unwrap();
        assert!(single_file(dir.path(), ".xvc").is_err());
    }

    #[test]
    fn test_default_install_fails() {
        let dir = TempDir::new().unwrap();
        let run = RunDescriptor::builder(dir.path()).platform(Platform::Linux).build();
        assert!(!Platform::Linux.install_package(dir.path(), &run).unwrap());
        assert!(!Platform::Linux.launch_package(None, &run).unwrap());
    }
}
