//! Filesystem helpers shared by the pipeline, the artifact store and the
//! symbol stores.
//!
//! Every mutating helper takes a `dry_run` flag and logs what it would do.
//! Paths inside nimp are carried as `/`-separated strings so the same
//! fileset produces the same output on every host.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::Path;

use crate::error::NimpError;
use crate::retry::{self, RetryPolicy};

/// Normalize a path string: `\` becomes `/`, `.` and duplicate separators
/// are dropped and `..` is collapsed where possible. A leading `//`
/// (UNC share) is preserved.
pub fn standardize_path(path: &str) -> String {
    if path.is_empty() {
        return String::new();
    }
    let unified = path.replace('\\', "/");
    let prefix = if unified.starts_with("//") {
        "//"
    } else if unified.starts_with('/') {
        "/"
    } else {
        ""
    };

    let mut parts: Vec<&str> = Vec::new();
    for part in unified.split('/') {
        match part {
            "" | "." => {}
            ".." => match parts.last() {
                Some(last) if *last != ".." => {
                    parts.pop();
                }
                _ if prefix.is_empty() => parts.push(".."),
                _ => {}
            },
            other => parts.push(other),
        }
    }

    let joined = parts.join("/");
    if joined.is_empty() {
        if prefix.is_empty() {
            ".".to_string()
        } else {
            prefix.to_string()
        }
    } else {
        format!("{}{}", prefix, joined)
    }
}

/// Join two `/` path strings. An absolute `child` replaces `base`.
pub fn join(base: &str, child: &str) -> String {
    if child.is_empty() {
        return base.to_string();
    }
    if base.is_empty() || is_absolute(child) {
        return child.to_string();
    }
    if base.ends_with('/') {
        format!("{}{}", base, child)
    } else {
        format!("{}/{}", base, child)
    }
}

/// Absolute on any host: `/x`, `\\x`, or a drive letter.
pub fn is_absolute(path: &str) -> bool {
    let bytes = path.as_bytes();
    path.starts_with('/')
        || path.starts_with('\\')
        || (bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':')
}

/// Absolute, standardized form of `path` relative to the current directory.
pub fn absolute(path: &str) -> String {
    if is_absolute(path) {
        return standardize_path(path);
    }
    match std::env::current_dir() {
        Ok(cwd) => standardize_path(&join(&cwd.to_string_lossy(), path)),
        Err(_) => standardize_path(path),
    }
}

/// Remove a file or directory tree, retrying while handles are held.
pub fn try_remove(path: impl AsRef<Path>, dry_run: bool) -> Result<()> {
    let path = path.as_ref();
    if !path.exists() && !path.is_symlink() {
        return Ok(());
    }
    tracing::info!("Removing {}", path.display());
    if dry_run {
        return Ok(());
    }
    retry::try_execute(RetryPolicy::FILESYSTEM, retry::is_transient, || {
        remove_now(path).with_context(|| format!("Failed to remove {}", path.display()))
    })
}

/// Remove a path and only warn on failure. Used on cleanup paths that
/// must not mask the original error.
pub fn remove_best_effort(path: impl AsRef<Path>) {
    let path = path.as_ref();
    if !path.exists() && !path.is_symlink() {
        return;
    }
    tracing::info!("Removing {}", path.display());
    if let Err(e) = remove_now(path) {
        tracing::warn!("Failed to remove {}: {}", path.display(), e);
    }
}

fn remove_now(path: &Path) -> std::io::Result<()> {
    if path.is_dir() && !path.is_symlink() {
        clear_readonly(path);
        fs::remove_dir_all(path)
    } else {
        let mut perms = fs::metadata(path)?.permissions();
        if perms.readonly() {
            #[allow(clippy::permissions_set_readonly_false)]
            perms.set_readonly(false);
            let _ = fs::set_permissions(path, perms);
        }
        fs::remove_file(path)
    }
}

/// Read-only files (Perforce checkouts) block `remove_dir_all` on Windows.
fn clear_readonly(root: &Path) {
    if !cfg!(windows) {
        return;
    }
    for entry in walkdir::WalkDir::new(root).into_iter().flatten() {
        if let Ok(metadata) = entry.metadata() {
            let mut perms = metadata.permissions();
            if perms.readonly() {
                #[allow(clippy::permissions_set_readonly_false)]
                perms.set_readonly(false);
                let _ = fs::set_permissions(entry.path(), perms);
            }
        }
    }
}

/// Create a directory and its parents, retrying while handles are held.
pub fn try_create_directory(path: impl AsRef<Path>, dry_run: bool) -> Result<()> {
    let path = path.as_ref();
    if path.is_dir() || dry_run {
        return Ok(());
    }
    retry::try_execute(RetryPolicy::FILESYSTEM, retry::is_transient, || {
        fs::create_dir_all(path)
            .with_context(|| format!("Failed to create directory {}", path.display()))
    })
}

/// Copy one file (or create one directory) to `destination`.
pub fn copy_file(source: impl AsRef<Path>, destination: impl AsRef<Path>, dry_run: bool) -> Result<()> {
    let source = source.as_ref();
    let destination = destination.as_ref();
    tracing::info!("Copying {} to {}", source.display(), destination.display());
    if source.is_dir() {
        if !dry_run {
            fs::create_dir_all(destination)?;
        }
    } else if source.is_file() {
        if !dry_run {
            if let Some(parent) = destination.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(source, destination).with_context(|| {
                format!("Failed to copy {} to {}", source.display(), destination.display())
            })?;
        }
    } else {
        bail!(NimpError::NotFound(source.display().to_string()));
    }
    Ok(())
}

/// Copy a directory tree. Files are copied by content, symlinks are
/// recreated on Unix and followed elsewhere.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    if !src.exists() {
        bail!(NimpError::NotFound(src.display().to_string()));
    }

    if src.is_file() {
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(src, dst)?;
        return Ok(());
    }

    fs::create_dir_all(dst)?;

    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());

        #[cfg(unix)]
        if src_path.is_symlink() {
            let target = fs::read_link(&src_path)?;
            if dst_path.exists() || dst_path.is_symlink() {
                fs::remove_file(&dst_path)?;
            }
            std::os::unix::fs::symlink(&target, &dst_path)?;
            continue;
        }

        if src_path.is_dir() {
            copy_tree(&src_path, &dst_path)?;
        } else {
            fs::copy(&src_path, &dst_path).with_context(|| {
                format!("Failed to copy {} to {}", src_path.display(), dst_path.display())
            })?;
        }
    }

    Ok(())
}

/// Move a file, replacing the destination. Falls back to copy+delete when
/// the rename crosses devices.
pub fn move_file(source: &Path, destination: &Path) -> Result<()> {
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent)?;
    }
    if destination.is_file() {
        fs::remove_file(destination)?;
    }
    if fs::rename(source, destination).is_err() {
        fs::copy(source, destination).with_context(|| {
            format!("Failed to move {} to {}", source.display(), destination.display())
        })?;
        fs::remove_file(source)?;
    }
    Ok(())
}

/// Set the executable bits on Unix; no-op elsewhere.
pub fn make_executable(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(path)?.permissions();
        perms.set_mode(perms.mode() | 0o111);
        fs::set_permissions(path, perms)?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

/// Whether a file looks like a native executable or a script
/// (ELF, Mach-O, PE or a `#!` line).
pub fn is_executable_content(path: &Path) -> bool {
    use std::io::Read;

    let mut magic = [0u8; 4];
    let read = fs::File::open(path).and_then(|mut f| f.read(&mut magic));
    match read {
        Ok(n) if n >= 2 => {
            magic.starts_with(b"#!")
                || (n == 4 && &magic == b"\x7fELF")
                || (n == 4 && matches!(magic, [0xcf, 0xfa, 0xed, 0xfe] | [0xfe, 0xed, 0xfa, 0xcf] | [0xca, 0xfe, 0xba, 0xbe]))
                || magic.starts_with(b"MZ")
        }
        _ => false,
    }
}

/// Read a `key=value` line from an ini file.
pub fn ini_value(path: &Path, key: &str) -> Result<String> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let pattern = regex::Regex::new(&format!(r"(?m)^{}=(?P<value>.*?)\r?$", regex::escape(key)))?;
    match pattern.captures(&content) {
        Some(captures) => Ok(captures["value"].to_string()),
        None => bail!(NimpError::config(format!(
            "Key {} was not found in {}",
            key,
            path.display()
        ))),
    }
}
