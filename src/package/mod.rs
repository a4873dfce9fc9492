//! Packaging pipeline: Cook → Stage → Package → Verify.
//!
//! A [`PackageConfiguration`] is derived once from the [`RunDescriptor`]
//! and the `package` flags, then each requested phase runs in order inside
//! a [`VariantOverlay`] scope so the active variant configuration is
//! removed whatever happens.
//!
//! # Example
//!
//! ```rust,ignore
//! let options = PackageOptions { steps: vec![Step::Cook, Step::Stage], ..Default::default() };
//! package::run(&run, &options)?;
//! ```

mod cook;
mod layout;
mod pack;
mod pak;
mod stage;
mod variant;
mod verify;

pub use layout::{executable_name, transform};
pub use pak::{is_patch, pak_file_name, PakOutcome};
pub use variant::{insert_ini_settings, VariantOverlay};
pub use verify::{parse_validator, ValidatorEntry};

use anyhow::{bail, Context, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::config::{EngineVersion, RunDescriptor};
use crate::error::NimpError;
use crate::fsutil::{self, ini_value};
use crate::hooks::{self, Hook};
use crate::platform::Platform;
use crate::preflight::PreflightChecker;
use crate::Timer;

/// Pipeline phase selectable with `--steps`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Step {
    Cook,
    Stage,
    Package,
    Verify,
}

impl Step {
    pub const DEFAULT: [Step; 3] = [Step::Cook, Step::Stage, Step::Package];

    pub fn name(self) -> &'static str {
        match self {
            Step::Cook => "cook",
            Step::Stage => "stage",
            Step::Package => "package",
            Step::Verify => "verify",
        }
    }
}

impl FromStr for Step {
    type Err = NimpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cook" => Ok(Step::Cook),
            "stage" => Ok(Step::Stage),
            "package" => Ok(Step::Package),
            "verify" => Ok(Step::Verify),
            other => Err(NimpError::config(format!(
                "Unknown step \"{}\" (cook, stage, package, verify)",
                other
            ))),
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageType {
    Application,
    ApplicationPatch,
    Dlc,
    DlcPatch,
    Entitlement,
}

impl PackageType {
    pub fn name(self) -> &'static str {
        match self {
            PackageType::Application => "application",
            PackageType::ApplicationPatch => "application_patch",
            PackageType::Dlc => "dlc",
            PackageType::DlcPatch => "dlc_patch",
            PackageType::Entitlement => "entitlement",
        }
    }

    /// Types AutomationTool stages and packages itself.
    pub fn is_application(self) -> bool {
        matches!(self, PackageType::Application | PackageType::ApplicationPatch)
    }

    pub fn is_patch(self) -> bool {
        matches!(self, PackageType::ApplicationPatch | PackageType::DlcPatch)
    }

    pub fn is_dlc(self) -> bool {
        matches!(self, PackageType::Dlc | PackageType::DlcPatch)
    }
}

impl FromStr for PackageType {
    type Err = NimpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "application" => Ok(PackageType::Application),
            "application_patch" => Ok(PackageType::ApplicationPatch),
            "dlc" => Ok(PackageType::Dlc),
            "dlc_patch" => Ok(PackageType::DlcPatch),
            "entitlement" => Ok(PackageType::Entitlement),
            other => Err(NimpError::config(format!("Unknown package type \"{}\"", other))),
        }
    }
}

/// `package` command flags.
#[derive(Debug, Clone)]
pub struct PackageOptions {
    pub steps: Vec<Step>,
    pub iterate: bool,
    pub compress: bool,
    pub final_submission: bool,
    pub dlc: bool,
    pub patch: bool,
    pub distribution: bool,
    pub msixvc: bool,
    pub shader_debug_info: bool,
    pub write_project_revisions: bool,
    pub trackloadpackage: bool,
    pub force: bool,
    pub extra_options: Vec<String>,
    pub ps4_regions: Vec<String>,
    pub ps4_titles: Vec<String>,
    pub layout: Option<String>,
}

impl Default for PackageOptions {
    fn default() -> Self {
        Self {
            steps: Step::DEFAULT.to_vec(),
            iterate: false,
            compress: false,
            final_submission: false,
            dlc: false,
            patch: false,
            distribution: false,
            msixvc: false,
            shader_debug_info: false,
            write_project_revisions: false,
            trackloadpackage: false,
            force: false,
            extra_options: Vec::new(),
            ps4_regions: Vec::new(),
            ps4_titles: Vec::new(),
            layout: None,
        }
    }
}

/// One PS4 title, read from `Build/PS4/titledata/<dir>/title.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ps4Title {
    pub title_directory: String,
    /// Every scalar field of `title.json`; `region` is uppercased.
    pub fields: BTreeMap<String, String>,
}

impl Ps4Title {
    pub fn load(path: &Path, title_directory: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let json: serde_json::Value = serde_json::from_str(&content)
            .map_err(NimpError::from)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        let Some(object) = json.as_object() else {
            bail!(NimpError::config(format!("{} is not a JSON object", path.display())));
        };

        let mut fields = BTreeMap::new();
        for (key, value) in object {
            let value = match value {
                serde_json::Value::String(s) => s.clone(),
                serde_json::Value::Object(_) | serde_json::Value::Array(_) => continue,
                other => other.to_string(),
            };
            fields.insert(key.clone(), value);
        }
        let region = fields
            .get("region")
            .map(|r| r.to_ascii_uppercase())
            .ok_or_else(|| NimpError::config(format!("No region in {}", path.display())))?;
        fields.insert("region".to_string(), region);
        fields.insert("title_directory".to_string(), title_directory.to_string());
        Ok(Self {
            title_directory: title_directory.to_string(),
            fields,
        })
    }

    pub fn region(&self) -> &str {
        self.fields.get("region").map(String::as_str).unwrap_or_default()
    }

    pub fn storage_type(&self) -> &str {
        self.fields.get("storagetype").map(String::as_str).unwrap_or_default()
    }

    pub fn passcode(&self) -> &str {
        self.fields.get("title_passcode").map(String::as_str).unwrap_or_default()
    }
}

/// The run projected onto one packaging run.
#[derive(Debug, Clone)]
pub struct PackageConfiguration {
    pub engine_directory: PathBuf,
    pub uat_directory: PathBuf,
    pub project_directory: PathBuf,
    pub configuration_directory: PathBuf,
    pub resource_directory: PathBuf,
    pub cook_directory: PathBuf,
    pub patch_base_directory: PathBuf,
    pub stage_directory: PathBuf,
    pub package_directory: PathBuf,
    pub uat_logs_directory: PathBuf,
    pub editor_path: PathBuf,
    pub editor_cmd_exe: String,
    pub package_tool_path: Option<PathBuf>,

    pub project: String,
    pub engine: EngineVersion,
    pub binary_configurations: Vec<String>,
    pub worker_platform: Platform,
    pub cook_platform: String,
    pub target_platform: Platform,
    pub package_type: PackageType,
    pub pak_collection: Vec<Option<String>>,
    pub pak_compression: bool,
    pub pak_compression_exclusions: Vec<String>,
    pub layout_file_path: Option<PathBuf>,
    pub layout_file_extension: String,
    pub ignored_errors: BTreeSet<String>,
    pub ignored_warnings: BTreeSet<String>,
    pub is_final_submission: bool,
    pub for_distribution: bool,
    pub no_compile_packaging: bool,
    pub iterative_cook: bool,
    pub shader_debug_info: bool,
    pub extra_options: Vec<String>,
    pub msixvc: bool,
    pub force: bool,
    pub write_project_revisions: bool,

    /// Title directories to load `ps4_title_collection` from.
    pub ps4_title_directories: Vec<String>,
    pub ps4_title_collection: Vec<Ps4Title>,
    pub xbox_product_id: Option<String>,
    pub xbox_content_id: Option<String>,
}

impl PackageConfiguration {
    pub fn new(run: &RunDescriptor, options: &PackageOptions) -> Result<Self> {
        let platform = run.platform();
        if !platform.is_valid() {
            bail!(NimpError::config(format!("Invalid platform {}", platform.name())));
        }
        let engine = run.require_engine()?;
        let project = run.uproject()?.to_string();
        let project_directory = PathBuf::from(fsutil::standardize_path(&run.uproject_dir()?.to_string_lossy()));
        let engine_directory = PathBuf::from(fsutil::standardize_path(&run.unreal_dir()?.join("Engine").to_string_lossy()));

        let mut uat_directory = engine_directory.join("Binaries/DotNET");
        if engine.major >= 5 {
            uat_directory.push("AutomationTool");
        }

        let cook_platform = platform.cook_name(engine.major).to_string();
        let layout_file_extension = if options.msixvc {
            "xml".to_string()
        } else {
            platform.layout_extension().to_string()
        };

        let mut configuration_directory = project_directory.join("Config");
        let mut resource_directory = project_directory
            .join("Build")
            .join(platform.unreal_name())
            .join("Resources");
        if let Some(variant) = run.variant() {
            let active = configuration_directory.join("Variants/Active");
            if active.exists() {
                configuration_directory = active;
            }
            let variant_resources = resource_directory.join("Variants").join(variant);
            if variant_resources.exists() {
                resource_directory = variant_resources;
            }
        }

        let worker_platform = Platform::host();
        let editor_name = run.editor_name();
        let exe = if worker_platform == Platform::Win64 { ".exe" } else { "" };
        let mut editor_path = engine_directory
            .join("Binaries")
            .join(worker_platform.unreal_name())
            .join(format!("{}{}", editor_name, exe));
        if !editor_path.exists() {
            editor_path = project_directory
                .join("Binaries")
                .join(worker_platform.unreal_name())
                .join(format!("{}Editor{}", project, exe));
        }
        let mut editor_cmd_exe = format!("{}-Cmd.exe", editor_name);
        if !engine_directory.join("Binaries/Win64").join(&editor_cmd_exe).exists() {
            editor_cmd_exe = format!("{}Editor-Cmd.exe", project);
        }

        let settings = &run.settings().package;
        let mut configuration = Self {
            uat_logs_directory: engine_directory.join("Programs/AutomationTool/Saved/Logs"),
            cook_directory: project_directory.join("Saved/Cooked").join(&cook_platform),
            patch_base_directory: project_directory
                .join("Saved/StagedBuilds")
                .join(format!("{}-PatchBase", cook_platform)),
            stage_directory: project_directory.join("Saved/StagedBuilds").join(&cook_platform),
            package_directory: PathBuf::from(fsutil::standardize_path(
                &run.format(platform.package_directory_pattern())?,
            )),
            engine_directory,
            uat_directory,
            project_directory,
            configuration_directory,
            resource_directory,
            editor_path,
            editor_cmd_exe,
            package_tool_path: platform.package_tool_path(),
            project,
            engine,
            binary_configurations: run.unreal_configurations()?.into_iter().map(str::to_string).collect(),
            worker_platform,
            cook_platform,
            target_platform: platform,
            package_type: PackageType::Application,
            pak_collection: vec![None],
            pak_compression: options.compress,
            pak_compression_exclusions: Vec::new(),
            layout_file_path: None,
            layout_file_extension,
            ignored_errors: BTreeSet::new(),
            ignored_warnings: BTreeSet::new(),
            is_final_submission: options.final_submission,
            for_distribution: options.distribution,
            no_compile_packaging: settings.no_compile_packaging,
            iterative_cook: options.iterate,
            shader_debug_info: options.shader_debug_info,
            extra_options: options.extra_options.clone(),
            msixvc: options.msixvc || platform == Platform::XboxOne,
            force: options.force,
            write_project_revisions: options.write_project_revisions,
            ps4_title_directories: Vec::new(),
            ps4_title_collection: Vec::new(),
            xbox_product_id: None,
            xbox_content_id: None,
        };

        if engine.older_than(4, 24) && !settings.variants.is_empty() {
            configuration.apply_legacy_variant(run, options)?;
        } else {
            configuration.apply_settings(run, options)?;
        }

        if let Some(layout) = &options.layout {
            configuration.layout_file_path = Some(PathBuf::from(layout));
        }
        if !options.ps4_titles.is_empty() {
            configuration.ps4_title_directories = options.ps4_titles.clone();
        }
        if options.trackloadpackage {
            configuration.extra_options.push("-TrackLoadPackage".to_string());
        }

        let mut overlay = BTreeMap::new();
        overlay.insert("layout_file_extension".to_string(), configuration.layout_file_extension.clone());
        if let Some(layout) = &configuration.layout_file_path {
            let formatted = run.format_with(&layout.to_string_lossy(), &overlay)?;
            configuration.layout_file_path = Some(PathBuf::from(formatted));
        }
        configuration.ps4_title_directories = configuration
            .ps4_title_directories
            .iter()
            .map(|title| run.format(title))
            .collect::<Result<_>>()?;

        Ok(configuration)
    }

    /// Per-variant settings of pre-4.24 projects.
    fn apply_legacy_variant(&mut self, run: &RunDescriptor, options: &PackageOptions) -> Result<()> {
        let Some(variant) = run.variant() else {
            bail!(NimpError::config("Variant parameter is required"));
        };
        let Some(settings) = run.settings().package.variants.get(variant) else {
            bail!(NimpError::config(format!("Unknown variant \"{}\"", variant)));
        };

        if let Some(package_type) = &settings.package_type {
            self.package_type = package_type.parse()?;
        }
        if let Some(paks) = &settings.content_paks {
            self.pak_collection = paks.iter().cloned().map(Some).collect();
        }
        if let Some(exclusions) = &settings.content_compression_exclusions {
            self.pak_compression_exclusions = exclusions.clone();
        }
        if let Some(layout) = &settings.layout {
            self.layout_file_path = Some(PathBuf::from(layout));
        }
        if !settings.ps4_titles.is_empty() {
            self.ps4_title_directories = options
                .ps4_regions
                .iter()
                .map(|region| {
                    settings.ps4_titles.get(region).cloned().ok_or_else(|| {
                        anyhow::Error::new(NimpError::config(format!(
                            "No PS4 title for region {} in variant {}",
                            region, variant
                        )))
                    })
                })
                .collect::<Result<_>>()?;
        }
        self.ignored_errors = settings.ignored_errors.iter().cloned().collect();
        self.ignored_warnings = settings.ignored_warnings.iter().cloned().collect();
        Ok(())
    }

    fn apply_settings(&mut self, run: &RunDescriptor, options: &PackageOptions) -> Result<()> {
        let settings = &run.settings().package;
        self.package_type = match (options.dlc, options.patch) {
            (true, true) => PackageType::DlcPatch,
            (true, false) => PackageType::Dlc,
            (false, true) => PackageType::ApplicationPatch,
            (false, false) => PackageType::Application,
        };
        if !settings.content_paks.is_empty() {
            self.pak_collection = settings.content_paks.iter().cloned().map(Some).collect();
        }
        self.pak_compression_exclusions = settings.content_compression_exclusions.clone();

        if run.variant().is_some() && matches!(self.target_platform, Platform::PS4 | Platform::XboxOne) {
            let name = if options.patch { "PatchLayout" } else { "PackageLayout" };
            self.layout_file_path = Some(PathBuf::from(format!(
                "{{uproject_dir}}/Build/{{unreal_platform}}/{}.{{variant}}.{{layout_file_extension}}",
                name
            )));
        }
        Ok(())
    }

    /// Read title and product identifiers from the project files. Runs once
    /// the variant overlay is in place.
    pub fn load_platform_data(&mut self) -> Result<()> {
        match self.target_platform {
            Platform::PS4 => {
                let platform = self.target_platform.unreal_name();
                if self.ps4_title_directories.is_empty() {
                    let ini = self
                        .configuration_directory
                        .join(platform)
                        .join(format!("{}Engine.ini", platform));
                    self.ps4_title_directories = vec![ini_value(&ini, "TitleID")?];
                }
                self.ps4_title_collection = self
                    .ps4_title_directories
                    .iter()
                    .map(|directory| {
                        let path = self
                            .project_directory
                            .join("Build")
                            .join(platform)
                            .join("titledata")
                            .join(directory)
                            .join("title.json");
                        Ps4Title::load(&path, directory)
                    })
                    .collect::<Result<_>>()?;
            }
            Platform::XboxOne => {
                let ini = self.configuration_directory.join("XboxOne/XboxOneEngine.ini");
                self.xbox_product_id = Some(ini_value(&ini, "ProductId")?);
                self.xbox_content_id = Some(ini_value(&ini, "ContentId")?);
            }
            _ => {}
        }
        Ok(())
    }

    /// `+`-joined Engine configuration names.
    pub fn binary_configuration(&self) -> String {
        self.binary_configurations.join("+")
    }

    pub fn automation_tool(&self) -> PathBuf {
        self.uat_directory.join("AutomationTool.exe")
    }

    /// `-Final` suffix of final-submission output directories.
    pub fn final_suffix(&self) -> &'static str {
        if self.is_final_submission {
            "-Final"
        } else {
            ""
        }
    }
}

/// Pipeline position, logged on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Cooking,
    Staging,
    Packaging,
    Verifying,
    Done,
    Failed,
}

impl PipelineState {
    fn for_step(step: Step) -> Self {
        match step {
            Step::Cook => PipelineState::Cooking,
            Step::Stage => PipelineState::Staging,
            Step::Package => PipelineState::Packaging,
            Step::Verify => PipelineState::Verifying,
        }
    }
}

/// Sequential state machine over the requested steps.
pub struct Pipeline<'a> {
    run: &'a RunDescriptor,
    configuration: PackageConfiguration,
    steps: Vec<Step>,
    state: PipelineState,
}

impl<'a> Pipeline<'a> {
    pub fn new(run: &'a RunDescriptor, configuration: PackageConfiguration, steps: &[Step]) -> Self {
        let mut steps = steps.to_vec();
        steps.sort();
        steps.dedup();
        Self {
            run,
            configuration,
            steps,
            state: PipelineState::Idle,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn configuration(&self) -> &PackageConfiguration {
        &self.configuration
    }

    fn transition(&mut self, next: PipelineState) {
        tracing::debug!("Pipeline {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Run every step under the variant overlay. The overlay is released
    /// on every path out of this function.
    pub fn execute(&mut self) -> Result<()> {
        let overlay = VariantOverlay::acquire(
            self.run,
            &self.configuration.project_directory,
            self.configuration.write_project_revisions,
        )?;
        if let Some(directory) = overlay.configuration_directory() {
            self.configuration.configuration_directory = directory;
        }

        let result = self.execute_steps();
        drop(overlay);
        if result.is_err() {
            self.transition(PipelineState::Failed);
        }
        result
    }

    fn execute_steps(&mut self) -> Result<()> {
        self.configuration.load_platform_data()?;
        hooks::execute(Hook::PreBuild, self.run)?;

        for step in self.steps.clone() {
            self.transition(PipelineState::for_step(step));
            tracing::info!("=== {} ===", capitalize(step.name()));
            let timer = Timer::start(capitalize(step.name()));
            match step {
                Step::Cook => cook::cook(self.run, &self.configuration)?,
                Step::Stage => stage::stage(self.run, &self.configuration)?,
                Step::Package => pack::package_for_platform(self.run, &mut self.configuration)?,
                Step::Verify => verify::verify(self.run, &self.configuration)?,
            }
            timer.finish();
        }

        hooks::execute(Hook::PostBuild, self.run)?;
        self.transition(PipelineState::Done);
        Ok(())
    }
}

fn capitalize(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Entry point of the `package` command.
pub fn run(run: &RunDescriptor, options: &PackageOptions) -> Result<()> {
    let configuration = PackageConfiguration::new(run, options)?;

    if !run.dry_run() {
        let report = PreflightChecker::new(run).for_package(&configuration, &options.steps).run()?;
        if !report.is_ok() {
            for check in report.errors() {
                tracing::error!("{}: {}", check.name, check.message);
            }
            bail!(NimpError::config(format!(
                "Preflight checks failed: {} of {} passed",
                report.passed_count(),
                report.total_count()
            )));
        }
    }

    let mut pipeline = Pipeline::new(run, configuration, &options.steps);
    pipeline.execute()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::EngineVersion;
    use tempfile::TempDir;

    /// Project tree with an engine `Build.version`, inside `dir`.
    pub(crate) fn project(dir: &Path, platform: Platform, version: EngineVersion) -> RunDescriptor {
        let unreal = dir.join("UE");
        let game = dir.join("Game");
        fs::create_dir_all(unreal.join("Engine/Build")).unwrap();
        fs::create_dir_all(game.join("Config")).unwrap();
        RunDescriptor::builder(dir)
            .uproject("Game")
            .uproject_dir(&game)
            .unreal_dir(&unreal)
            .engine(version)
            .platform(platform)
            .configuration("devel+shipping")
            .build()
    }

    #[test]
    fn test_paths_follow_engine_version() {
        let dir = TempDir::new().unwrap();
        let run = project(dir.path(), Platform::Win64, EngineVersion::new(5, 1, 0));
        let config = PackageConfiguration::new(&run, &PackageOptions::default()).unwrap();

        assert!(config.uat_directory.ends_with("Engine/Binaries/DotNET/AutomationTool"));
        assert!(config.cook_directory.ends_with("Game/Saved/Cooked/Windows"));
        assert!(config.patch_base_directory.ends_with("Saved/StagedBuilds/Windows-PatchBase"));
        assert!(config.package_directory.ends_with("Game/Saved/Packages/Windows"));
        assert_eq!(config.binary_configuration(), "Development+Shipping");
        assert_eq!(config.editor_cmd_exe, "GameEditor-Cmd.exe");
        assert_eq!(config.pak_collection, vec![None]);
    }

    #[test]
    fn test_package_type_from_flags() {
        let dir = TempDir::new().unwrap();
        let run = project(dir.path(), Platform::PS5, EngineVersion::new(4, 27, 2));
        let options = PackageOptions {
            dlc: true,
            patch: true,
            ..Default::default()
        };
        let config = PackageConfiguration::new(&run, &options).unwrap();
        assert_eq!(config.package_type, PackageType::DlcPatch);
        assert_eq!(config.cook_platform, "PS5");
        assert_eq!(config.layout_file_extension, "gp5");
    }

    #[test]
    fn test_xboxone_is_always_msixvc() {
        let dir = TempDir::new().unwrap();
        let run = project(dir.path(), Platform::XboxOne, EngineVersion::new(4, 27, 0));
        let config = PackageConfiguration::new(&run, &PackageOptions::default()).unwrap();
        assert!(config.msixvc);
    }

    #[test]
    fn test_legacy_variant_required() {
        let dir = TempDir::new().unwrap();
        let settings: crate::config::ConfigFile =
            toml::from_str("[package.variants.Retail]\ntype = \"dlc\"\ncontent_paks = [\"core\"]\n").unwrap();
        let base = project(dir.path(), Platform::PS4, EngineVersion::new(4, 21, 0));
        let run = RunDescriptor::builder(dir.path())
            .uproject("Game")
            .uproject_dir(base.uproject_dir().unwrap())
            .unreal_dir(base.unreal_dir().unwrap())
            .engine(EngineVersion::new(4, 21, 0))
            .platform(Platform::PS4)
            .settings(settings.clone())
            .build();
        let err = PackageConfiguration::new(&run, &PackageOptions::default()).unwrap_err();
        assert!(err.to_string().contains("Variant parameter is required"));

        let run = RunDescriptor::builder(dir.path())
            .uproject("Game")
            .uproject_dir(base.uproject_dir().unwrap())
            .unreal_dir(base.unreal_dir().unwrap())
            .engine(EngineVersion::new(4, 21, 0))
            .platform(Platform::PS4)
            .variant("Retail")
            .settings(settings)
            .build();
        let config = PackageConfiguration::new(&run, &PackageOptions::default()).unwrap();
        assert_eq!(config.package_type, PackageType::Dlc);
        assert_eq!(config.pak_collection, vec![Some("core".to_string())]);
    }

    #[test]
    fn test_ps4_title_loading() {
        let dir = TempDir::new().unwrap();
        let run = project(dir.path(), Platform::PS4, EngineVersion::new(4, 27, 0));
        let game = run.uproject_dir().unwrap().to_path_buf();
        fs::create_dir_all(game.join("Config/PS4")).unwrap();
        fs::write(game.join("Config/PS4/PS4Engine.ini"), "[Settings]\nTitleID=CUSA00001\n").unwrap();
        let titledata = game.join("Build/PS4/titledata/CUSA00001");
        fs::create_dir_all(&titledata).unwrap();
        fs::write(
            titledata.join("title.json"),
            r#"{"region": "scea", "storagetype": "bd50", "title_passcode": "abc", "nested": {"x": 1}}"#,
        )
        .unwrap();

        let mut config = PackageConfiguration::new(&run, &PackageOptions::default()).unwrap();
        config.load_platform_data().unwrap();
        let title = &config.ps4_title_collection[0];
        assert_eq!(title.region(), "SCEA");
        assert_eq!(title.storage_type(), "bd50");
        assert_eq!(title.passcode(), "abc");
        assert_eq!(title.fields["title_directory"], "CUSA00001");
        assert!(!title.fields.contains_key("nested"));
    }

    #[test]
    fn test_step_parsing() {
        assert_eq!("Verify".parse::<Step>().unwrap(), Step::Verify);
        assert!("deploy".parse::<Step>().is_err());
    }

    #[test]
    fn test_pipeline_dry_run_leaves_no_overlay() {
        let dir = TempDir::new().unwrap();
        let base = project(dir.path(), Platform::Linux, EngineVersion::new(5, 2, 0));
        let game = base.uproject_dir().unwrap().to_path_buf();
        fs::create_dir_all(game.join("Config/Variants/Retail")).unwrap();
        fs::write(game.join("Config/Variants/Retail/DefaultGame.ini"), "[Game]\n").unwrap();
        let run = RunDescriptor::builder(dir.path())
            .uproject("Game")
            .uproject_dir(&game)
            .unreal_dir(base.unreal_dir().unwrap())
            .engine(EngineVersion::new(5, 2, 0))
            .platform(Platform::Linux)
            .variant("Retail")
            .dry_run(true)
            .build();

        let config = PackageConfiguration::new(&run, &PackageOptions::default()).unwrap();
        let mut pipeline = Pipeline::new(&run, config, &[Step::Cook, Step::Stage]);
        pipeline.execute().unwrap();
        assert_eq!(pipeline.state(), PipelineState::Done);
        assert!(!game.join("Config/Variants/Active").exists());
        assert!(!game.join("Saved").exists());
    }

    #[test]
    fn test_failed_pipeline_releases_overlay() {
        let dir = TempDir::new().unwrap();
        let base = project(dir.path(), Platform::Linux, EngineVersion::new(5, 2, 0));
        let game = base.uproject_dir().unwrap().to_path_buf();
        fs::create_dir_all(game.join("Config/Variants/Retail")).unwrap();
        let run = RunDescriptor::builder(dir.path())
            .uproject("Game")
            .uproject_dir(&game)
            .unreal_dir(base.unreal_dir().unwrap())
            .engine(EngineVersion::new(5, 2, 0))
            .platform(Platform::Linux)
            .variant("Retail")
            .build();

        let options = PackageOptions {
            patch: true,
            ..Default::default()
        };
        let config = PackageConfiguration::new(&run, &options).unwrap();
        // Patch staging without a patch base fails before any tool runs.
        let mut pipeline = Pipeline::new(&run, config, &[Step::Stage]);
        assert!(pipeline.execute().is_err());
        assert_eq!(pipeline.state(), PipelineState::Failed);
        assert!(!game.join("Config/Variants/Active").exists());
    }
}
