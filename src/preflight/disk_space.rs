//! Disk space check.
//!
//! Cooked content, the stage and the packages are each the size of the
//! game; running out halfway leaves all three unusable.

use std::path::Path;

use super::CheckResult;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Compare the free space under `path` with `min_gb`. Low space is a
/// warning, not a failure.
pub fn check_disk_space(path: &Path, min_gb: u64) -> CheckResult {
    let required = min_gb.saturating_mul(1024 * 1024 * 1024);
    match available_space(path) {
        Some(available) if available >= required => CheckResult::pass(
            "Disk space",
            format!("{:.1} GB available (need {} GB)", available as f64 / GIB, min_gb),
        ),
        Some(available) => CheckResult::warn(
            "Disk space",
            format!("Only {:.1} GB available, need {} GB", available as f64 / GIB, min_gb),
        ),
        None => CheckResult::warn("Disk space", format!("Failed to check free space of {}", path.display())),
    }
}

/// Nearest existing ancestor, since the check may run before the
/// directory is created.
fn existing_ancestor(path: &Path) -> Option<&Path> {
    path.ancestors().find(|p| p.exists())
}

/// Available bytes on the volume holding `path`.
#[cfg(unix)]
pub fn available_space(path: &Path) -> Option<u64> {
    use crate::process::Cmd;

    let path = existing_ancestor(path)?;
    let output = Cmd::new("df")
        .args(["--output=avail", "-B1"])
        .arg_path(path)
        .hide_output()
        .capture()
        .ok()
        .filter(|output| output.success())?;
    // Skip header line, get first number
    output.stdout.lines().nth(1).and_then(|line| line.trim().parse::<u64>().ok())
}

#[cfg(windows)]
pub fn available_space(path: &Path) -> Option<u64> {
    use std::os::windows::ffi::OsStrExt;
    use windows_sys::Win32::Storage::FileSystem::GetDiskFreeSpaceExW;

    let path = existing_ancestor(path)?;
    let wide: Vec<u16> = path.as_os_str().encode_wide().chain(std::iter::once(0)).collect();
    let mut available = 0u64;
    // SAFETY: `wide` is NUL-terminated and outlives the call.
    let ok = unsafe {
        GetDiskFreeSpaceExW(wide.as_ptr(), &mut available, std::ptr::null_mut(), std::ptr::null_mut())
    };
    (ok != 0).then_some(available)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_available_space() {
        let space = available_space(Path::new("."));
        assert!(space.is_some_and(|s| s > 0));
    }

    #[test]
    fn test_missing_directory_uses_ancestor() {
        let dir = TempDir::new().unwrap();
        assert!(available_space(&dir.path().join("not/yet/created")).is_some());
    }

    #[test]
    fn test_low_space_is_a_warning() {
        let result = check_disk_space(Path::new("."), u64::MAX / 2);
        assert!(result.passed);
        assert!(result.warning);
        assert!(!check_disk_space(Path::new("."), 0).warning);
    }
}
