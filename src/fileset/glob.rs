//! Filesystem glob expansion with recursive `**`, hidden files included.

use anyhow::{Context, Result};
use globset::{GlobBuilder, GlobMatcher};
use std::path::Path;
use walkdir::WalkDir;

use crate::fsutil::standardize_path;

const META: &[char] = &['*', '?', '[', '{'];

/// Every existing path matching `pattern`, sorted. `*` stops at `/`,
/// `**` spans any number of directories.
pub fn expand(pattern: &str) -> Result<Vec<String>> {
    let pattern = standardize_path(pattern);
    let (prefix, rest) = split_root(&pattern);
    let components: Vec<&str> = rest.split('/').filter(|c| !c.is_empty()).collect();

    let Some(first_meta) = components.iter().position(|c| c.contains(META)) else {
        return Ok(if Path::new(&pattern).exists() {
            vec![pattern]
        } else {
            Vec::new()
        });
    };

    let base = format!("{}{}", prefix, components[..first_meta].join("/"));
    let remainder = components[first_meta..].join("/");
    let matcher = compile(&remainder)?;
    let max_depth = if remainder.contains("**") {
        usize::MAX
    } else {
        components.len() - first_meta
    };

    let walk_root = if base.is_empty() { ".".to_string() } else { base.clone() };
    let mut matches: Vec<String> = WalkDir::new(&walk_root)
        .min_depth(1)
        .max_depth(max_depth)
        .follow_links(false)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let relative = entry.path().strip_prefix(&walk_root).ok()?;
            let relative = relative.to_string_lossy().replace('\\', "/");
            matcher.is_match(&relative).then(|| {
                if base.is_empty() {
                    relative
                } else {
                    crate::fsutil::join(&base, &relative)
                }
            })
        })
        .collect();
    matches.sort();
    Ok(matches)
}

fn compile(pattern: &str) -> Result<GlobMatcher> {
    Ok(GlobBuilder::new(pattern)
        .literal_separator(true)
        .backslash_escape(false)
        .build()
        .with_context(|| format!("Invalid glob pattern \"{}\"", pattern))?
        .compile_matcher())
}

/// Split off `/`, `//` or a drive letter so the rest is relative.
fn split_root(path: &str) -> (&str, &str) {
    if let Some(rest) = path.strip_prefix("//") {
        return ("//", rest);
    }
    if let Some(rest) = path.strip_prefix('/') {
        return ("/", rest);
    }
    let bytes = path.as_bytes();
    if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        let split = if bytes.get(2) == Some(&b'/') { 3 } else { 2 };
        return path.split_at(split);
    }
    ("", path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn tree() -> TempDir {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("foo/bar")).unwrap();
        fs::write(root.join("qux.ext1"), b"").unwrap();
        fs::write(root.join("foo/quux.ext1"), b"").unwrap();
        fs::write(root.join("foo/bar/corge.ext1"), b"").unwrap();
        fs::write(root.join("foo/bar/corge.ext2"), b"").unwrap();
        fs::write(root.join(".hidden"), b"").unwrap();
        dir
    }

    fn rel(dir: &TempDir, paths: Vec<String>) -> Vec<String> {
        let base = standardize_path(&dir.path().to_string_lossy());
        paths
            .into_iter()
            .map(|p| p.strip_prefix(&format!("{}/", base)).unwrap().to_string())
            .collect()
    }

    #[test]
    fn test_star_does_not_cross_directories() {
        let dir = tree();
        let pattern = format!("{}/*.ext1", dir.path().display());
        assert_eq!(rel(&dir, expand(&pattern).unwrap()), vec!["qux.ext1"]);
    }

    #[test]
    fn test_double_star_is_recursive() {
        let dir = tree();
        let pattern = format!("{}/**/*.ext1", dir.path().display());
        assert_eq!(
            rel(&dir, expand(&pattern).unwrap()),
            vec!["foo/bar/corge.ext1", "foo/quux.ext1", "qux.ext1"]
        );
    }

    #[test]
    fn test_hidden_files_included() {
        let dir = tree();
        let pattern = format!("{}/*", dir.path().display());
        assert!(rel(&dir, expand(&pattern).unwrap()).contains(&".hidden".to_string()));
    }

    #[test]
    fn test_literal_path() {
        let dir = tree();
        let existing = format!("{}/foo/quux.ext1", dir.path().display());
        assert_eq!(expand(&existing).unwrap().len(), 1);
        let missing = format!("{}/foo/none", dir.path().display());
        assert!(expand(&missing).unwrap().is_empty());
    }

    #[test]
    fn test_split_root() {
        assert_eq!(split_root("//share/x"), ("//", "share/x"));
        assert_eq!(split_root("C:/x"), ("C:/", "x"));
        assert_eq!(split_root("a/b"), ("", "a/b"));
    }
}
