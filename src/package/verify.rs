//! Verify phase. Validation problems are reported as warnings; only
//! missing tools and unreadable directories fail the phase.

use anyhow::{bail, Context, Result};
use regex::Regex;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use super::PackageConfiguration;
use crate::config::RunDescriptor;
use crate::error::NimpError;
use crate::fsutil;
use crate::platform::Platform;
use crate::process::Cmd;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidatorSeverity {
    Failure,
    Warning,
}

/// One `failure` or `warning` of a `Validator_*.xml` report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatorEntry {
    pub component: String,
    pub severity: ValidatorSeverity,
    pub message: String,
}

pub fn verify(run: &RunDescriptor, configuration: &PackageConfiguration) -> Result<()> {
    tracing::info!("Verifying packages (Path: {})", configuration.package_directory.display());
    let suffix = configuration.final_suffix();
    match configuration.target_platform {
        Platform::PS4 => verify_ps4(run, configuration),
        Platform::XboxOne => {
            for binary_configuration in &configuration.binary_configurations {
                let directory = configuration
                    .package_directory
                    .join(format!("{}{}", binary_configuration, suffix));
                verify_msixvc(&directory, &configuration.ignored_errors, &configuration.ignored_warnings)?;
            }
            Ok(())
        }
        Platform::Win64 if configuration.msixvc => {
            for binary_configuration in &configuration.binary_configurations {
                let directory = configuration
                    .package_directory
                    .join(format!("MSIXVC-{}{}", binary_configuration, suffix));
                verify_msixvc(&directory, &configuration.ignored_errors, &configuration.ignored_warnings)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn verify_ps4(run: &RunDescriptor, configuration: &PackageConfiguration) -> Result<()> {
    let Some(tool) = &configuration.package_tool_path else {
        bail!(NimpError::NotFound("PS4 package tool (SCE_ROOT_DIR not set)".to_string()));
    };

    for title in &configuration.ps4_title_collection {
        for binary_configuration in &configuration.binary_configurations {
            let directory = configuration.package_directory.join(format!(
                "{}-{}{}",
                title.region(),
                binary_configuration,
                configuration.final_suffix()
            ));
            let temporary = PathBuf::from(format!("{}-Temporary", directory.display()));
            fsutil::try_remove(&temporary, run.dry_run())?;
            fsutil::try_create_directory(&temporary, run.dry_run())?;

            let mut cmd = Cmd::new(tool.to_string_lossy())
                .args(["img_verify", "--no_progress_bar", "--tmp_path"])
                .arg_path(&temporary)
                .arg("--passcode")
                .arg(title.passcode());
            for package in files_with_extension(&directory, "pkg")? {
                cmd = cmd.arg(fsutil::standardize_path(&package.to_string_lossy()));
            }
            if cmd.dry_run(run.dry_run()).call()? != 0 {
                tracing::warn!("Package validation failed");
            }

            fsutil::try_remove(&temporary, run.dry_run())?;
        }
    }
    Ok(())
}

fn files_with_extension(directory: &Path, extension: &str) -> Result<Vec<PathBuf>> {
    if !directory.is_dir() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in fs::read_dir(directory).with_context(|| format!("Failed to list {}", directory.display()))? {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case(extension)) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Report every entry of the directory's validator logs that is not
/// ignored. Returns whether the package passed.
pub fn verify_msixvc(
    directory: &Path,
    ignored_errors: &BTreeSet<String>,
    ignored_warnings: &BTreeSet<String>,
) -> Result<bool> {
    let mut success = true;
    let reports = files_with_extension(directory, "xml")?
        .into_iter()
        .filter(|path| {
            path.file_name()
                .is_some_and(|name| name.to_string_lossy().starts_with("Validator_"))
        });
    for report in reports {
        tracing::info!("Reading {}", report.display());
        let content = fs::read_to_string(&report)
            .with_context(|| format!("Failed to read {}", report.display()))?;
        let entries = match parse_validator(&content) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!("{}: {:#}", report.display(), e);
                success = false;
                continue;
            }
        };
        for entry in entries {
            match entry.severity {
                ValidatorSeverity::Failure if !ignored_errors.contains(&entry.message) => {
                    tracing::error!("{}: {}", entry.component, entry.message);
                    success = false;
                }
                ValidatorSeverity::Warning if !ignored_warnings.contains(&entry.message) => {
                    tracing::warn!("{}: {}", entry.component, entry.message);
                    success = false;
                }
                _ => {}
            }
        }
    }
    if !success {
        tracing::warn!("Package validation failed");
    }
    Ok(success)
}

/// Entries of `testresults/testresult`, in document order.
pub fn parse_validator(content: &str) -> Result<Vec<ValidatorEntry>> {
    let results = Regex::new(r"(?s)<testresults\b[^>]*>(.*?)</testresults>")?;
    let Some(results) = results.captures(content) else {
        bail!(NimpError::Verification("no testresults element".to_string()));
    };

    let test_result = Regex::new(r"(?s)<testresult\b[^>]*>(.*?)</testresult>")?;
    let component = Regex::new(r"(?s)<component\b[^>]*>(.*?)</component>")?;
    let messages = Regex::new(r"(?s)<(failure|warning)\b[^>]*>(.*?)</(?:failure|warning)>")?;

    let mut entries = Vec::new();
    for result in test_result.captures_iter(&results[1]) {
        let body = &result[1];
        let component = component
            .captures(body)
            .map(|c| unescape(c[1].trim()))
            .unwrap_or_default();
        for message in messages.captures_iter(body) {
            let severity = if &message[1] == "failure" {
                ValidatorSeverity::Failure
            } else {
                ValidatorSeverity::Warning
            };
            entries.push(ValidatorEntry {
                component: component.clone(),
                severity,
                message: unescape(message[2].trim()),
            });
        }
    }
    Ok(entries)
}

fn unescape(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const REPORT: &str = r#"<?xml version="1.0"?>
<validator>
  <testresults>
    <testresult id="1">
      <component>Manifest</component>
      <failures><failure>Missing logo &amp; splash</failure></failures>
      <warnings><warning>Deprecated element</warning></warnings>
    </testresult>
    <testresult id="2">
      <component>Files</component>
      <warnings><warning>Large file</warning></warnings>
    </testresult>
  </testresults>
</validator>"#;

    #[test]
    fn test_parse_validator() {
        let entries = parse_validator(REPORT).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].component, "Manifest");
        assert_eq!(entries[0].severity, ValidatorSeverity::Failure);
        assert_eq!(entries[0].message, "Missing logo & splash");
        assert_eq!(entries[2].component, "Files");
        assert_eq!(entries[2].severity, ValidatorSeverity::Warning);
    }

    #[test]
    fn test_parse_validator_without_results() {
        assert!(parse_validator("<validator/>").is_err());
    }

    #[test]
    fn test_ignored_entries_pass() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("Validator_1.xml"), REPORT).unwrap();
        fs::write(dir.path().join("Other.xml"), "not a report").unwrap();

        let errors: BTreeSet<String> = ["Missing logo & splash".to_string()].into();
        let warnings: BTreeSet<String> = ["Deprecated element".to_string(), "Large file".to_string()].into();
        assert!(verify_msixvc(dir.path(), &errors, &warnings).unwrap());
        assert!(!verify_msixvc(dir.path(), &errors, &BTreeSet::new()).unwrap());
    }

    #[test]
    fn test_missing_package_directory_passes() {
        let dir = TempDir::new().unwrap();
        assert!(verify_msixvc(&dir.path().join("missing"), &BTreeSet::new(), &BTreeSet::new()).unwrap());
    }
}
