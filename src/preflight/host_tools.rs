//! Toolchain validation.
//!
//! Checks that the executables a run will launch exist and that the
//! console SDK environment is set.

use std::env;
use std::path::Path;

use super::CheckResult;
use crate::platform::Platform;
use crate::process::which;

/// Check a single tool by path, falling back to `PATH` for bare names.
pub fn check_tool(name: &str, path: &Path, purpose: &str) -> CheckResult {
    let found = if path.is_file() {
        Some(path.to_path_buf())
    } else if path.components().count() == 1 {
        which(&path.to_string_lossy())
    } else {
        None
    };
    match found {
        Some(path) => CheckResult::pass(name, format!("Found at {} ({})", path.display(), purpose)),
        None => CheckResult::fail(
            name,
            format!("{} not found (needed to {})", path.display(), purpose),
            "Build the tool or check the Engine and SDK installation",
        ),
    }
}

/// One result per SDK variable of `platform`.
pub fn check_sdk_environment(platform: Platform) -> Vec<CheckResult> {
    platform
        .sdk_environment()
        .iter()
        .map(|var| {
            let name = format!("{} environment", var);
            match env::var(var) {
                Ok(value) if !value.is_empty() => CheckResult::pass(name, value),
                _ => CheckResult::fail(
                    name,
                    format!("{} is not set", var),
                    format!("Install the {} SDK and set {}", platform.name(), var),
                ),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_check_tool_by_path() {
        let dir = TempDir::new().unwrap();
        let tool = dir.path().join("UnrealPak");
        assert!(!check_tool("UnrealPak", &tool, "pak").passed);
        std::fs::write(&tool, b"").unwrap();
        assert!(check_tool("UnrealPak", &tool, "pak").passed);
    }

    #[cfg(unix)]
    #[test]
    fn test_check_tool_on_path() {
        assert!(check_tool("sh", Path::new("sh"), "run hooks").passed);
        assert!(!check_tool("missing", Path::new("definitely_not_a_real_command_12345"), "x").passed);
    }

    #[test]
    fn test_desktop_needs_no_sdk() {
        assert!(check_sdk_environment(Platform::Linux).is_empty());
        assert_eq!(check_sdk_environment(Platform::PS5).len(), 1);
    }
}
