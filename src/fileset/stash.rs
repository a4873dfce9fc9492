//! Fileset commands that act on the mapped sources: list, delete, and
//! stash/unstash (move the files out of the way and back).

use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use super::FileMapper;
use crate::config::RunDescriptor;
use crate::error::NimpError;
use crate::fsutil;

const STASH_INDEX: &str = ".stash.txt";

/// Write the mapping as `format` lines (`{src}`, `{dst}` placeholders) to
/// `destination`, or log it.
pub fn list(run: &RunDescriptor, mapper: &FileMapper, format: &str, destination: Option<&Path>) -> Result<()> {
    let root = run.root_dir().to_string_lossy().into_owned();
    let lines: Vec<String> = mapper
        .to_list(&root, ".")?
        .into_iter()
        .map(|(src, dst)| format.replace("{src}", &src).replace("{dst}", &dst))
        .collect();

    match destination {
        Some(path) => {
            let mut file = fs::File::create(path)
                .with_context(|| format!("Failed to create {}", path.display()))?;
            for line in &lines {
                writeln!(file, "{}", line)?;
            }
        }
        None => lines.iter().for_each(|line| tracing::info!("{}", line)),
    }
    Ok(())
}

/// Remove every mapped source.
pub fn delete(run: &RunDescriptor, mapper: &FileMapper) -> Result<()> {
    for (src, _) in sources(run, mapper)? {
        tracing::info!("Deleting {}", src);
        fsutil::try_remove(&src, run.dry_run())?;
    }
    Ok(())
}

/// `{fileset}-{platform}-{target}-{configuration}`
pub fn stash_name(run: &RunDescriptor, fileset: &str) -> Result<String> {
    let overlay = BTreeMap::from([("fileset".to_string(), fileset.to_string())]);
    run.format_with("{fileset}-{platform}-{target}-{configuration}", &overlay)
}

pub fn stash_directory(run: &RunDescriptor, name: &str) -> PathBuf {
    run.root_dir().join(".nimp").join("stash").join(name)
}

fn digest(path: &str) -> String {
    let hash = hex::encode(Sha256::digest(path.as_bytes()));
    hash[..32].to_string()
}

/// Move every regular source file into the stash directory.
pub fn stash(run: &RunDescriptor, mapper: &FileMapper, fileset: &str) -> Result<()> {
    let name = stash_name(run, fileset)?;
    let directory = stash_directory(run, &name);

    if directory.exists() {
        tracing::info!("Removing previous stash {}", name);
        fsutil::try_remove(&directory, false)?;
    }

    tracing::info!("Creating stash {}", name);
    fs::create_dir_all(&directory)
        .with_context(|| format!("Failed to create {}", directory.display()))?;

    let mut index = String::new();
    for (src, _) in sources(run, mapper)? {
        if !Path::new(&src).is_file() {
            continue;
        }
        let hash = digest(&src);
        tracing::info!("Stashing {} as {}", src, hash);
        fsutil::move_file(Path::new(&src), &directory.join(&hash))?;
        index.push_str(&format!("{} {}\n", hash, src));
    }
    fs::write(directory.join(STASH_INDEX), &index)?;
    Ok(())
}

/// Move stashed files back to where they came from and drop the stash.
pub fn unstash(run: &RunDescriptor, fileset: &str) -> Result<()> {
    let name = stash_name(run, fileset)?;
    let directory = stash_directory(run, &name);
    if !directory.exists() {
        bail!(NimpError::NotFound(format!("stash {}", name)));
    }

    tracing::info!("Applying stash {}", name);
    let index_path = directory.join(STASH_INDEX);
    let index = fs::read_to_string(&index_path)
        .with_context(|| format!("Failed to read {}", index_path.display()))?;

    let mut success = true;
    for line in index.lines().filter(|l| !l.trim().is_empty()) {
        let Some((hash, dst)) = line.trim().split_once(' ') else {
            tracing::error!("Invalid stash entry \"{}\"", line);
            success = false;
            continue;
        };
        tracing::info!("Unstashing {} as {}", hash, dst);
        if let Err(e) = fsutil::move_file(&directory.join(hash), Path::new(dst)) {
            tracing::error!("{:#}", e);
            success = false;
        }
    }

    if !success {
        bail!(NimpError::Filesystem(format!("Unstash of {} failed", name)));
    }

    tracing::info!("Removing stash {}", name);
    fsutil::try_remove(&directory, false)
}

fn sources(run: &RunDescriptor, mapper: &FileMapper) -> Result<Vec<(String, Option<String>)>> {
    let root = run.root_dir().to_string_lossy().into_owned();
    mapper.collect(Some(&root), Some("."))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::Platform;
    use tempfile::TempDir;

    fn setup() -> (TempDir, RunDescriptor) {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join(".nimp/filesets")).unwrap();
        fs::create_dir_all(root.join("Saved/Logs")).unwrap();
        fs::write(root.join("Saved/Logs/a.log"), b"a").unwrap();
        fs::write(root.join("Saved/Logs/b.log"), b"b").unwrap();
        fs::write(
            root.join(".nimp/filesets/logs.toml"),
            "[[rule]]\nsteps = [{ glob = \"Saved/**/*.log\" }]\n",
        )
        .unwrap();
        let run = RunDescriptor::builder(root)
            .platform(Platform::Win64)
            .configuration("devel")
            .target("game")
            .build();
        (dir, run)
    }

    fn mapper(run: &RunDescriptor) -> FileMapper {
        FileMapper::load(run, "logs", &BTreeMap::new()).unwrap()
    }

    #[test]
    fn test_stash_name() {
        let (_dir, run) = setup();
        assert_eq!(stash_name(&run, "logs").unwrap(), "logs-win64-game-devel");
    }

    #[test]
    fn test_stash_then_unstash_restores_files() {
        let (dir, run) = setup();
        stash(&run, &mapper(&run), "logs").unwrap();
        assert!(!dir.path().join("Saved/Logs/a.log").exists());
        let stashed = stash_directory(&run, "logs-win64-game-devel");
        let index = fs::read_to_string(stashed.join(STASH_INDEX)).unwrap();
        assert_eq!(index.lines().count(), 2);

        unstash(&run, "logs").unwrap();
        assert_eq!(fs::read(dir.path().join("Saved/Logs/b.log")).unwrap(), b"b");
        assert!(!stashed.exists());
    }

    #[test]
    fn test_unstash_missing_stash_fails() {
        let (_dir, run) = setup();
        assert!(unstash(&run, "logs").is_err());
    }

    #[test]
    fn test_list_to_file() {
        let (dir, run) = setup();
        let out = dir.path().join("list.txt");
        list(&run, &mapper(&run), "{src} => {dst}", Some(&out)).unwrap();
        let content = fs::read_to_string(&out).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("Saved/Logs/a.log => Saved/Logs/a.log"));
    }

    #[test]
    fn test_delete_removes_sources() {
        let (dir, run) = setup();
        delete(&run, &mapper(&run)).unwrap();
        assert!(!dir.path().join("Saved/Logs/a.log").exists());
        assert!(dir.path().join("Saved/Logs").exists());
    }
}
