//! Preflight checks for packaging prerequisites.
//!
//! This module validates that the toolchain and the workspace are usable
//! BEFORE starting expensive operations like cooking or packaging.
//!
//! # Checks Performed
//!
//! - **Tools**: editor, AutomationTool and console packager exist
//! - **SDK environment**: the target platform's SDK variables are set
//! - **Disk space**: enough free space on the project drive
//! - **Network**: an HTTP artifact repository is reachable
//!
//! # Usage
//!
//! ```rust,ignore
//! use nimp::preflight::PreflightChecker;
//!
//! let report = PreflightChecker::new(&run)
//!     .for_package(&configuration, &options.steps)
//!     .run()?;
//!
//! if !report.is_ok() {
//!     for error in report.errors() {
//!         tracing::error!("{}: {}", error.name, error.message);
//!     }
//! }
//! ```

mod disk_space;
mod host_tools;
mod network;

pub use disk_space::{available_space, check_disk_space};
pub use host_tools::{check_sdk_environment, check_tool};
pub use network::check_network;

use anyhow::Result;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::artifact::http;
use crate::config::RunDescriptor;
use crate::hooks::{self, Hook};
use crate::package::{PackageConfiguration, Step};
use crate::platform::Platform;

const NETWORK_TIMEOUT: Duration = Duration::from_secs(10);

/// Result of a single preflight check.
#[derive(Debug, Clone)]
pub struct CheckResult {
    /// Name of the check
    pub name: String,
    /// Whether the check passed
    pub passed: bool,
    /// Passed, but with something worth reporting
    pub warning: bool,
    /// Human-readable message
    pub message: String,
    /// Optional suggestion for fixing the issue
    pub suggestion: Option<String>,
}

impl CheckResult {
    pub fn pass(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: true,
            warning: false,
            message: message.into(),
            suggestion: None,
        }
    }

    pub fn fail(name: impl Into<String>, message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: false,
            warning: false,
            message: message.into(),
            suggestion: Some(suggestion.into()),
        }
    }

    /// Create a warning check result (passes but with a note).
    pub fn warn(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: true,
            warning: true,
            message: message.into(),
            suggestion: None,
        }
    }
}

/// Comprehensive preflight report.
#[derive(Debug, Default)]
pub struct PreflightReport {
    pub checks: Vec<CheckResult>,
}

impl PreflightReport {
    /// Check if all preflight checks passed.
    pub fn is_ok(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }

    /// Get all failing checks.
    pub fn errors(&self) -> Vec<&CheckResult> {
        self.checks.iter().filter(|c| !c.passed).collect()
    }

    pub fn passed_count(&self) -> usize {
        self.checks.iter().filter(|c| c.passed).count()
    }

    pub fn total_count(&self) -> usize {
        self.checks.len()
    }

    /// Log every check, then the totals.
    pub fn print_summary(&self) {
        for check in &self.checks {
            if !check.passed {
                tracing::error!("[FAIL] {}: {}", check.name, check.message);
            } else if check.warning {
                tracing::warn!("[WARN] {}: {}", check.name, check.message);
            } else {
                tracing::info!("[OK] {}: {}", check.name, check.message);
            }
            if let Some(suggestion) = &check.suggestion {
                tracing::info!("     Suggestion: {}", suggestion);
            }
        }

        if self.is_ok() {
            tracing::info!("All preflight checks passed ({}/{})", self.passed_count(), self.total_count());
        } else {
            tracing::error!(
                "Preflight checks failed: {} of {} passed",
                self.passed_count(),
                self.total_count()
            );
        }
    }
}

/// A file the run needs, and why.
#[derive(Debug, Clone)]
struct RequiredTool {
    name: String,
    path: PathBuf,
    purpose: String,
}

/// Preflight checker for one run.
pub struct PreflightChecker<'a> {
    run: &'a RunDescriptor,
    tools: Vec<RequiredTool>,
    sdk_platform: Option<Platform>,
    disk_path: PathBuf,
    min_free_space_gb: u64,
    network_url: Option<String>,
}

impl<'a> PreflightChecker<'a> {
    /// Disk and network checks for `run`.
    pub fn new(run: &'a RunDescriptor) -> Self {
        let disk_path = run
            .uproject_dir()
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| run.root_dir().to_path_buf());
        let network_url = run
            .parameter("artifact_repository_source")
            .filter(|source| source.starts_with("http://") || source.starts_with("https://"))
            .map(str::to_string);
        Self {
            run,
            tools: Vec::new(),
            sdk_platform: None,
            disk_path,
            min_free_space_gb: run.settings().package.min_free_space_gb,
            network_url,
        }
    }

    /// Add the tools the requested packaging steps invoke.
    pub fn for_package(mut self, configuration: &PackageConfiguration, steps: &[Step]) -> Self {
        let platform = configuration.target_platform;
        let mut require = |name: &str, path: &Path, purpose: &str| {
            self.tools.push(RequiredTool {
                name: name.to_string(),
                path: path.to_path_buf(),
                purpose: purpose.to_string(),
            });
        };

        let automation_tool = configuration.automation_tool();
        if steps.contains(&Step::Cook) {
            require("Editor", &configuration.editor_path, "cook content");
        }
        if steps.contains(&Step::Stage) && configuration.package_type.is_application() {
            require("AutomationTool", &automation_tool, "stage");
        }
        if steps.contains(&Step::Package) {
            let uat_packaging = !platform.is_desktop()
                && !matches!(platform, Platform::PS4 | Platform::XboxOne)
                && (platform == Platform::PS5 || configuration.package_type.is_application());
            if uat_packaging {
                require("AutomationTool", &automation_tool, "package");
            }
            let packager = matches!(platform, Platform::PS4 | Platform::XboxOne)
                || (platform == Platform::Win64 && configuration.msixvc);
            if let (true, Some(tool)) = (packager, &configuration.package_tool_path) {
                require("Package tool", tool, "package");
            }
        }
        if steps.contains(&Step::Verify) && platform == Platform::PS4 {
            if let Some(tool) = &configuration.package_tool_path {
                require("Package tool", tool, "verify");
            }
        }

        if !platform.sdk_environment().is_empty() {
            self.sdk_platform = Some(platform);
        }
        self
    }

    /// Run all checks on a scoped runtime.
    pub fn run(&self) -> Result<PreflightReport> {
        http::block_on(self.run_all())
    }

    /// Run all checks and return a comprehensive report.
    pub async fn run_all(&self) -> PreflightReport {
        let mut report = PreflightReport::default();

        for tool in &self.tools {
            report.checks.push(check_tool(&tool.name, &tool.path, &tool.purpose));
        }
        if let Some(platform) = self.sdk_platform {
            report.checks.extend(check_sdk_environment(platform));
        }

        let disk = check_disk_space(&self.disk_path, self.min_free_space_gb);
        if disk.warning {
            if let Err(e) = hooks::execute(Hook::DiskFull, self.run) {
                tracing::warn!("{:#}", e);
            }
        }
        report.checks.push(disk);

        if let Some(url) = &self.network_url {
            report.checks.push(check_network(url, NETWORK_TIMEOUT).await);
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineVersion;
    use crate::package::PackageOptions;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_check_result_pass() {
        let result = CheckResult::pass("test", "passed");
        assert!(result.passed);
        assert!(result.suggestion.is_none());
    }

    #[test]
    fn test_check_result_fail() {
        let result = CheckResult::fail("test", "failed", "fix it");
        assert!(!result.passed);
        assert!(result.suggestion.is_some());
    }

    #[test]
    fn test_preflight_report_is_ok() {
        let mut report = PreflightReport::default();
        assert!(report.is_ok());

        report.checks.push(CheckResult::warn("test1", "low"));
        assert!(report.is_ok());

        report.checks.push(CheckResult::fail("test2", "bad", "fix"));
        assert!(!report.is_ok());
        assert_eq!(report.passed_count(), 1);
        assert_eq!(report.errors()[0].name, "test2");
    }

    fn run(dir: &Path) -> RunDescriptor {
        let game = dir.join("Game");
        fs::create_dir_all(game.join("Config")).unwrap();
        fs::create_dir_all(dir.join("UE/Engine/Build")).unwrap();
        RunDescriptor::builder(dir)
            .uproject("Game")
            .uproject_dir(&game)
            .unreal_dir(dir.join("UE"))
            .engine(EngineVersion::new(5, 1, 0))
            .platform(Platform::Linux)
            .build()
    }

    #[test]
    fn test_missing_editor_fails_cook() {
        let dir = TempDir::new().unwrap();
        let run = run(dir.path());
        let configuration = PackageConfiguration::new(&run, &PackageOptions::default()).unwrap();

        let report = PreflightChecker::new(&run)
            .for_package(&configuration, &[Step::Cook])
            .run()
            .unwrap();
        assert!(!report.is_ok());
        assert!(report.errors().iter().any(|c| c.name == "Editor"));
    }

    #[test]
    fn test_desktop_package_needs_no_tools() {
        let dir = TempDir::new().unwrap();
        let run = run(dir.path());
        let configuration = PackageConfiguration::new(&run, &PackageOptions::default()).unwrap();

        let checker = PreflightChecker::new(&run).for_package(&configuration, &[Step::Package]);
        assert!(checker.tools.is_empty());
        assert!(checker.sdk_platform.is_none());
        assert!(checker.network_url.is_none());
    }
}
