//! Layered configuration and the immutable run descriptor.
//!
//! Configuration comes from, in increasing priority:
//!
//! 1. built-in defaults
//! 2. the root `.nimp.toml`, found by walking up from the working directory
//! 3. `<uproject_dir>/.nimp.toml`
//! 4. `--user-config <file>`
//! 5. command-line flags
//! 6. free `key=value` parameters
//!
//! The merged result is frozen into a [`RunDescriptor`] which every other
//! module receives by reference. Placeholder formatting only reads its
//! [`Variables`].
//!
//! # Example
//!
//! ```rust,ignore
//! let run = RunDescriptor::load(&std::env::current_dir()?, &options)?;
//! let dir = run.format("{uproject_dir}/Saved/Cooked/{cook_platform}")?;
//! ```

mod file;
mod format;

pub use file::{
    merge_tables, ConfigFile, PackageSettings, ProjectSection, RevisionResolverSettings,
    SymbolServerSettings, SymbolStoreEntry, VariantSettings,
};
pub use format::format as format_template;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::NimpError;
use crate::fsutil::{join, standardize_path};
use crate::platform::Platform;

/// Configuration file looked up in the root and project directories.
pub const CONFIG_FILE_NAME: &str = ".nimp.toml";

/// Accepted build configurations, in canonical spelling.
pub const CONFIGURATIONS: [&str; 5] = ["debug", "devel", "release", "test", "shipping"];

/// Accepted target kinds.
pub const TARGETS: [&str; 3] = ["game", "editor", "tools"];

/// Canonical configuration, or an empty string when unknown. Empty
/// entries are rejected when the Engine name is needed.
pub fn sanitize_configuration(config: &str) -> String {
    let lower = config.trim().to_ascii_lowercase();
    if CONFIGURATIONS.contains(&lower.as_str()) {
        lower
    } else {
        String::new()
    }
}

/// Engine spelling of a canonical configuration.
pub fn unreal_configuration(config: &str) -> Option<&'static str> {
    match config {
        "debug" => Some("Debug"),
        "devel" => Some("Development"),
        "test" => Some("Test"),
        "shipping" => Some("Shipping"),
        _ => None,
    }
}

/// String variables bound to `{placeholders}`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Variables(BTreeMap<String, String>);

impl Variables {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Truthiness used by fileset `when`/`unless` conditions. Missing
    /// variables are false.
    pub fn is_true(&self, key: &str) -> bool {
        match self.get(key) {
            Some(value) => {
                let value = value.trim().to_ascii_lowercase();
                !value.is_empty() && value != "false" && value != "0" && value != "no"
            }
            None => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    /// Copy with `overlay` applied and derived variables recomputed.
    pub fn overlay<'a>(&self, overlay: impl IntoIterator<Item = (&'a String, &'a String)>) -> Self {
        let mut vars = self.clone();
        for (key, value) in overlay {
            vars.set(key.clone(), value.clone());
        }
        vars.derive();
        vars
    }

    /// Recompute the variables that follow from `platform`,
    /// `configuration` and `unreal_major`.
    pub fn derive(&mut self) {
        let platform = Platform::from_name(self.get("platform").unwrap_or_default());
        let major: u32 = self
            .get("unreal_major")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        for p in Platform::ALL {
            self.set(format!("is_{}", p.name()), (p == platform).to_string());
        }
        self.set("is_microsoft_platform", platform.is_microsoft().to_string());
        self.set("is_sony_platform", platform.is_sony().to_string());
        self.set("is_nintendo_platform", platform.is_nintendo().to_string());
        self.set("is_mobile_platform", platform.is_mobile().to_string());
        self.set("is_desktop_platform", platform.is_desktop().to_string());
        if platform.is_valid() {
            self.set("platform", platform.name());
            self.set("unreal_platform", platform.unreal_name());
            self.set("unreal_config_platform", platform.config_name());
            self.set("cook_platform", platform.cook_name(major));
        }

        let configuration = self.get("configuration").unwrap_or_default().to_string();
        let configs: Vec<&str> = configuration.split('+').collect();
        for config in CONFIGURATIONS {
            self.set(format!("is_{}", config), configs.contains(&config).to_string());
        }
        let unreal: Option<Vec<&str>> = configs.iter().map(|c| unreal_configuration(c)).collect();
        if let Some(names) = unreal {
            self.set("unreal_config", names.join("+"));
        }

        self.set("is_ue4", (major == 4).to_string());
        self.set("is_ue5", (major == 5).to_string());
        self.set("unreal_host_platform", Platform::host().unreal_name());
    }
}

/// Engine version read from `Engine/Build/Build.version`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
pub struct EngineVersion {
    #[serde(rename = "MajorVersion")]
    pub major: u32,
    #[serde(rename = "MinorVersion")]
    pub minor: u32,
    #[serde(rename = "PatchVersion")]
    pub patch: u32,
}

impl EngineVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }

    pub fn read(unreal_dir: &Path) -> Result<Self> {
        let path = unreal_dir.join("Engine/Build/Build.version");
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let version: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(version)
    }

    /// Composite `X.Y` value used for version gates.
    pub fn as_float(self) -> f64 {
        format!("{}.{}", self.major, self.minor).parse().unwrap_or(0.0)
    }

    /// Whether this is strictly older than `major.minor`.
    pub fn older_than(self, major: u32, minor: u32) -> bool {
        (self.major, self.minor) < (major, minor)
    }
}

impl std::fmt::Display for EngineVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Command-line inputs to [`RunDescriptor::load`].
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub user_config: Option<PathBuf>,
    pub uproject: Option<String>,
    pub platform: Option<String>,
    pub configuration: Option<String>,
    pub target: Option<String>,
    pub variant: Option<String>,
    pub revision: Option<String>,
    pub branch: Option<String>,
    pub dry_run: bool,
    /// Free `key=value` parameters.
    pub parameters: Vec<String>,
}

/// Everything one invocation needs, frozen after loading.
#[derive(Debug, Clone)]
pub struct RunDescriptor {
    root_dir: PathBuf,
    uproject: Option<String>,
    uproject_dir: Option<PathBuf>,
    unreal_dir: Option<PathBuf>,
    engine: Option<EngineVersion>,
    platform: Platform,
    configuration: String,
    target: String,
    variant: Option<String>,
    revision: Option<String>,
    branch: Option<String>,
    dry_run: bool,
    settings: ConfigFile,
    vars: Variables,
}

impl RunDescriptor {
    pub fn builder(root_dir: impl Into<PathBuf>) -> RunDescriptorBuilder {
        RunDescriptorBuilder::new(root_dir.into())
    }

    /// Load every configuration layer starting from `cwd`.
    pub fn load(cwd: &Path, options: &LoadOptions) -> Result<Self> {
        let root_config = find_upwards(cwd, CONFIG_FILE_NAME);
        let root_dir = root_config
            .as_ref()
            .and_then(|path| path.parent().map(Path::to_path_buf))
            .unwrap_or_else(|| cwd.to_path_buf());

        let mut table = toml::Table::new();
        if let Some(path) = &root_config {
            tracing::debug!("Loading {}", path.display());
            merge_tables(&mut table, load_table(path)?);
        } else {
            tracing::debug!("No {} found above {}", CONFIG_FILE_NAME, cwd.display());
        }

        let mut project = project_section(&table)?;
        let uproject = options
            .uproject
            .as_deref()
            .map(uproject_name)
            .or(project.uproject.clone());
        let unreal_dir = project
            .unreal_dir
            .clone()
            .map(PathBuf::from)
            .or_else(|| {
                find_upwards(&root_dir, "Engine/Build/Build.version")
                    .and_then(|p| p.parent()?.parent()?.parent().map(Path::to_path_buf))
            });
        let uproject_dir = project
            .uproject_dir
            .clone()
            .map(PathBuf::from)
            .or_else(|| discover_uproject_dir(&root_dir, unreal_dir.as_deref(), uproject.as_deref()));

        if let Some(dir) = &uproject_dir {
            let project_config = dir.join(CONFIG_FILE_NAME);
            if project_config.is_file() && Some(&project_config) != root_config.as_ref() {
                tracing::debug!("Loading {}", project_config.display());
                merge_tables(&mut table, load_table(&project_config)?);
            }
        }
        if let Some(path) = &options.user_config {
            tracing::debug!("Loading {}", path.display());
            merge_tables(&mut table, load_table(path)?);
        }

        let settings: ConfigFile = toml::Value::Table(table.clone())
            .try_into()
            .map_err(NimpError::from)
            .context("Invalid nimp configuration")?;
        project = settings.project.clone();

        let uproject = options
            .uproject
            .as_deref()
            .map(uproject_name)
            .or(project.uproject.clone())
            .or(uproject);
        let unreal_dir = project.unreal_dir.clone().map(PathBuf::from).or(unreal_dir);
        let uproject_dir = project.uproject_dir.clone().map(PathBuf::from).or(uproject_dir);
        let engine = match &unreal_dir {
            Some(dir) if dir.join("Engine/Build/Build.version").is_file() => Some(EngineVersion::read(dir)?),
            _ => None,
        };

        // Flags, then free parameters, through the variable bag so that
        // `platform=ps4` and `-p ps4` behave the same.
        let mut bag: BTreeMap<String, String> = settings
            .parameters
            .iter()
            .map(|(k, v)| (k.clone(), file::value_to_string(v)))
            .collect();
        let flags = [
            ("platform", &options.platform),
            ("configuration", &options.configuration),
            ("target", &options.target),
            ("variant", &options.variant),
            ("revision", &options.revision),
            ("branch", &options.branch),
        ];
        for (key, value) in flags {
            if let Some(value) = value {
                bag.insert(key.to_string(), value.clone());
            }
        }
        for parameter in &options.parameters {
            let (key, value) = parse_parameter(parameter)?;
            bag.insert(key, value);
        }

        let platform = match bag.remove("platform") {
            Some(name) => Platform::require(&name)?,
            None => Platform::host(),
        };
        let configuration = bag.remove("configuration").unwrap_or_else(|| "devel".to_string());
        let target = match bag.remove("target") {
            Some(target) => {
                let lower = target.to_ascii_lowercase();
                if !TARGETS.contains(&lower.as_str()) {
                    bail!(NimpError::config(format!("Unknown target \"{}\"", target)));
                }
                lower
            }
            None if platform.is_desktop() => "editor".to_string(),
            None => "game".to_string(),
        };

        let mut builder = RunDescriptor::builder(root_dir)
            .platform(platform)
            .configuration(&configuration)
            .target(&target)
            .dry_run(options.dry_run)
            .settings(settings);
        if let Some(name) = uproject {
            builder = builder.uproject(name);
        }
        if let Some(dir) = uproject_dir {
            builder = builder.uproject_dir(dir);
        }
        if let Some(dir) = unreal_dir {
            builder = builder.unreal_dir(dir);
        }
        if let Some(version) = engine {
            builder = builder.engine(version);
        }
        for key in ["variant", "revision", "branch"] {
            if let Some(value) = bag.remove(key).filter(|v| !v.is_empty()) {
                builder = match key {
                    "variant" => builder.variant(value),
                    "revision" => builder.revision(value),
                    _ => builder.branch(value),
                };
            }
        }
        for (key, value) in bag {
            builder = builder.parameter(key, value);
        }
        let run = builder.build();
        run.log_summary();
        Ok(run)
    }

    fn log_summary(&self) {
        match (&self.engine, &self.unreal_dir) {
            (Some(version), Some(dir)) => {
                tracing::info!("Found Unreal engine {} in {}", version, dir.display())
            }
            _ => tracing::info!("No Unreal engine loaded"),
        }
        match (&self.uproject, &self.uproject_dir) {
            (Some(name), Some(dir)) => tracing::info!("Found Unreal project {} in {}", name, dir.display()),
            _ => tracing::info!("No Unreal project loaded"),
        }
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    pub fn uproject(&self) -> Result<&str> {
        self.uproject
            .as_deref()
            .ok_or_else(|| NimpError::config("No Unreal project loaded").into())
    }

    pub fn uproject_dir(&self) -> Result<&Path> {
        self.uproject_dir
            .as_deref()
            .ok_or_else(|| NimpError::config("No Unreal project directory configured").into())
    }

    pub fn unreal_dir(&self) -> Result<&Path> {
        self.unreal_dir
            .as_deref()
            .ok_or_else(|| NimpError::config("No Unreal engine found").into())
    }

    pub fn engine(&self) -> Option<EngineVersion> {
        self.engine
    }

    pub fn require_engine(&self) -> Result<EngineVersion> {
        self.engine.ok_or_else(|| {
            NimpError::config("Engine/Build/Build.version not found. It is a nimp requirement.").into()
        })
    }

    pub fn engine_major(&self) -> u32 {
        self.engine.map(|v| v.major).unwrap_or(0)
    }

    pub fn is_ue4(&self) -> bool {
        self.engine_major() == 4
    }

    pub fn is_ue5(&self) -> bool {
        self.engine_major() == 5
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    /// `+`-joined canonical configurations.
    pub fn configuration(&self) -> &str {
        &self.configuration
    }

    /// Engine names of every configuration; any unknown entry is an error.
    pub fn unreal_configurations(&self) -> Result<Vec<&'static str>> {
        self.configuration
            .split('+')
            .map(|config| {
                unreal_configuration(config).ok_or_else(|| {
                    NimpError::config(format!("Invalid configuration \"{}\"", self.configuration)).into()
                })
            })
            .collect()
    }

    pub fn primary_unreal_configuration(&self) -> Result<&'static str> {
        let configs = self.unreal_configurations()?;
        Ok(configs[0])
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn variant(&self) -> Option<&str> {
        self.variant.as_deref()
    }

    pub fn revision(&self) -> Option<&str> {
        self.revision.as_deref()
    }

    pub fn branch(&self) -> Option<&str> {
        self.branch.as_deref()
    }

    pub fn dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn settings(&self) -> &ConfigFile {
        &self.settings
    }

    pub fn vars(&self) -> &Variables {
        &self.vars
    }

    /// Free parameter, from `[parameters]` or the command line.
    pub fn parameter(&self, key: &str) -> Option<&str> {
        self.vars.get(key).filter(|v| !v.is_empty())
    }

    pub fn require_parameter(&self, key: &str) -> Result<&str> {
        self.parameter(key).ok_or_else(|| {
            NimpError::config(format!(
                "Required configuration value \"{}\" was not found. Check your {}.",
                key, CONFIG_FILE_NAME
            ))
            .into()
        })
    }

    /// Expand placeholders and date directives.
    pub fn format(&self, template: &str) -> Result<String> {
        format::format(template, &self.vars)
    }

    /// Format with extra variables bound on top of the run's.
    pub fn format_with(&self, template: &str, overlay: &BTreeMap<String, String>) -> Result<String> {
        format::format(template, &self.vars.overlay(overlay.iter()))
    }

    /// Editor executable base name.
    pub fn editor_name(&self) -> String {
        match &self.settings.project.editor_name {
            Some(name) => name.clone(),
            None if self.is_ue5() => "UnrealEditor".to_string(),
            None => "UE4Editor".to_string(),
        }
    }

    /// Export `[environment]` to the process environment.
    pub fn apply_environment(&self) {
        for (key, value) in &self.settings.environment {
            tracing::debug!("Setting {}={}", key, value);
            std::env::set_var(key, value);
        }
    }
}

/// Builds a [`RunDescriptor`]; used by [`RunDescriptor::load`] and tests.
#[derive(Debug, Clone)]
pub struct RunDescriptorBuilder {
    run: RunDescriptor,
    parameters: BTreeMap<String, String>,
}

impl RunDescriptorBuilder {
    fn new(root_dir: PathBuf) -> Self {
        Self {
            run: RunDescriptor {
                root_dir,
                uproject: None,
                uproject_dir: None,
                unreal_dir: None,
                engine: None,
                platform: Platform::host(),
                configuration: "devel".to_string(),
                target: "game".to_string(),
                variant: None,
                revision: None,
                branch: None,
                dry_run: false,
                settings: ConfigFile::default(),
                vars: Variables::default(),
            },
            parameters: BTreeMap::new(),
        }
    }

    pub fn uproject(mut self, name: impl Into<String>) -> Self {
        self.run.uproject = Some(name.into());
        self
    }

    pub fn uproject_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.run.uproject_dir = Some(dir.into());
        self
    }

    pub fn unreal_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.run.unreal_dir = Some(dir.into());
        self
    }

    pub fn engine(mut self, version: EngineVersion) -> Self {
        self.run.engine = Some(version);
        self
    }

    pub fn platform(mut self, platform: Platform) -> Self {
        self.run.platform = platform;
        self
    }

    /// `+`-joined configurations; each entry is sanitized.
    pub fn configuration(mut self, configuration: &str) -> Self {
        self.run.configuration = configuration
            .split('+')
            .map(sanitize_configuration)
            .collect::<Vec<_>>()
            .join("+");
        self
    }

    pub fn target(mut self, target: &str) -> Self {
        self.run.target = target.to_string();
        self
    }

    pub fn variant(mut self, variant: impl Into<String>) -> Self {
        self.run.variant = Some(variant.into());
        self
    }

    pub fn revision(mut self, revision: impl Into<String>) -> Self {
        self.run.revision = Some(revision.into());
        self
    }

    pub fn branch(mut self, branch: impl Into<String>) -> Self {
        self.run.branch = Some(branch.into());
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.run.dry_run = dry_run;
        self
    }

    pub fn settings(mut self, settings: ConfigFile) -> Self {
        self.run.settings = settings;
        self
    }

    pub fn parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> RunDescriptor {
        let mut run = self.run;
        let path_var = |path: &Path| standardize_path(&path.to_string_lossy());

        let mut vars = Variables::default();
        for (key, value) in self.parameters {
            vars.set(key, value);
        }
        vars.set("root_dir", path_var(&run.root_dir));
        vars.set("uproject", run.uproject.clone().unwrap_or_default());
        if let Some(dir) = &run.uproject_dir {
            vars.set("uproject_dir", path_var(dir));
        }
        if let Some(dir) = &run.unreal_dir {
            vars.set("unreal_dir", path_var(dir));
        }
        if let Some(version) = run.engine {
            vars.set("unreal_major", version.major.to_string());
            vars.set("unreal_minor", version.minor.to_string());
            vars.set("unreal_patch", version.patch.to_string());
            vars.set("unreal_version", version.as_float().to_string());
            vars.set("unreal_full_version", version.to_string());
        }
        vars.set("platform", run.platform.name());
        vars.set("configuration", run.configuration.clone());
        vars.set("target", run.target.clone());
        vars.set("variant", run.variant.clone().unwrap_or_default());
        vars.set("revision", run.revision.clone().unwrap_or_default());
        vars.set("branch", run.branch.clone().unwrap_or_default());
        vars.set("dry_run", run.dry_run.to_string());
        vars.derive();
        run.vars = vars;
        run
    }
}

/// Directory containing `relative`, searching `start` and its parents.
/// Returns the full path of the match.
pub fn find_upwards(start: &Path, relative: &str) -> Option<PathBuf> {
    start
        .ancestors()
        .map(|dir| dir.join(relative))
        .find(|candidate| candidate.exists())
}

/// `GAME/GAME.uproject`, `Game.uproject` and `Game` all name `Game`.
fn uproject_name(value: &str) -> String {
    let file = value.replace('\\', "/");
    let file = file.rsplit('/').next().unwrap_or(&file).to_string();
    file.strip_suffix(".uproject").unwrap_or(&file).to_string()
}

fn parse_parameter(parameter: &str) -> Result<(String, String)> {
    match parameter.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => bail!(NimpError::config(format!(
            "Invalid parameter \"{}\", expected key=value",
            parameter
        ))),
    }
}

/// Parse one configuration file, resolving `project` directories relative
/// to the file.
fn load_table(path: &Path) -> Result<toml::Table> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Unable to open configuration file {}", path.display()))?;
    let mut table: toml::Table = toml::from_str(&content)
        .map_err(NimpError::from)
        .with_context(|| format!("Unable to load configuration file {}", path.display()))?;

    let base = path
        .parent()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default();
    if let Some(toml::Value::Table(project)) = table.get_mut("project") {
        for key in ["uproject_dir", "unreal_dir"] {
            if let Some(toml::Value::String(value)) = project.get_mut(key) {
                *value = standardize_path(&join(&base, value));
            }
        }
    }
    Ok(table)
}

fn project_section(table: &toml::Table) -> Result<ProjectSection> {
    match table.get("project") {
        Some(value) => Ok(value
            .clone()
            .try_into()
            .map_err(NimpError::from)
            .context("Invalid [project] section")?),
        None => Ok(ProjectSection::default()),
    }
}

/// Find the project directory from `*.uprojectdirs` search roots, or a
/// `<root>/<name>/<name>.uproject` layout.
fn discover_uproject_dir(root_dir: &Path, unreal_dir: Option<&Path>, uproject: Option<&str>) -> Option<PathBuf> {
    if let Some(name) = uproject {
        let direct = root_dir.join(name);
        if direct.join(format!("{}.uproject", name)).is_file() {
            return Some(direct);
        }
    }

    let unreal_dir = unreal_dir?;
    let mut search_roots: Vec<PathBuf> = Vec::new();
    for entry in fs::read_dir(unreal_dir).ok()?.flatten() {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "uprojectdirs") {
            let content = fs::read_to_string(&path).unwrap_or_default();
            for line in content.lines() {
                let line = line.trim();
                if !line.is_empty() && !line.starts_with(';') {
                    search_roots.push(unreal_dir.join(line));
                }
            }
        }
    }

    let mut candidates: Vec<(String, PathBuf)> = Vec::new();
    for search_root in search_roots {
        let Ok(entries) = fs::read_dir(&search_root) else {
            continue;
        };
        for entry in entries.flatten() {
            let dir = entry.path();
            let Ok(files) = fs::read_dir(&dir) else {
                continue;
            };
            for file in files.flatten() {
                let path = file.path();
                if path.extension().is_some_and(|ext| ext == "uproject") {
                    if let Some(stem) = path.file_stem() {
                        candidates.push((stem.to_string_lossy().into_owned(), dir.clone()));
                    }
                }
            }
        }
    }
    candidates.sort();

    if let Some(name) = uproject {
        return candidates.into_iter().find(|(stem, _)| stem == name).map(|(_, dir)| dir);
    }
    // Templates and engine tests are never the default project.
    let is_template = |stem: &str| ["TP_", "FP_", "EngineTest"].iter().any(|p| stem.contains(p));
    candidates
        .iter()
        .find(|(stem, _)| !is_template(stem))
        .or(candidates.first())
        .map(|(_, dir)| dir.clone())
}
