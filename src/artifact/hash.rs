//! `<artifact>.hash` sidecars: `{"<method>": "<hex digest>"}`.

use anyhow::{bail, Context, Result};
use sha2::Digest;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::NimpError;

const BLOCK_SIZE: usize = 65536;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashMethod {
    Sha1,
    Sha256,
    Sha512,
}

impl HashMethod {
    pub fn name(self) -> &'static str {
        match self {
            HashMethod::Sha1 => "sha1",
            HashMethod::Sha256 => "sha256",
            HashMethod::Sha512 => "sha512",
        }
    }
}

impl FromStr for HashMethod {
    type Err = NimpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sha1" => Ok(HashMethod::Sha1),
            "sha256" => Ok(HashMethod::Sha256),
            "sha512" => Ok(HashMethod::Sha512),
            other => Err(NimpError::config(format!("Unsupported hash method \"{}\"", other))),
        }
    }
}

fn digest_reader<D: Digest>(mut reader: impl Read) -> Result<String> {
    let mut hasher = D::new();
    let mut buffer = vec![0u8; BLOCK_SIZE];
    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Hex digest of a file, read in blocks.
pub fn file_hash(path: &Path, method: HashMethod) -> Result<String> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let digest = match method {
        HashMethod::Sha1 => digest_reader::<sha1::Sha1>(file)?,
        HashMethod::Sha256 => digest_reader::<sha2::Sha256>(file)?,
        HashMethod::Sha512 => digest_reader::<sha2::Sha512>(file)?,
    };
    tracing::debug!("{} {}: {}", path.display(), method.name(), digest);
    Ok(digest)
}

/// `<path>.zip` if it exists, else `<path>` if it is a directory.
pub fn find_artifact(artifact_path: &str) -> Option<PathBuf> {
    let zip = PathBuf::from(format!("{}.zip", artifact_path));
    if zip.is_file() {
        return Some(zip);
    }
    let directory = PathBuf::from(artifact_path);
    directory.is_dir().then_some(directory)
}

/// Write the hash sidecar of an archived artifact.
pub fn create(artifact_path: &str, method: HashMethod, dry_run: bool) -> Result<()> {
    let Some(artifact) = find_artifact(artifact_path) else {
        bail!(NimpError::NotFound(format!("Artifact not found: {}", artifact_path)));
    };
    if artifact.is_dir() {
        bail!(NimpError::config(format!(
            "Hashing needs an archived artifact, {} is a directory",
            artifact.display()
        )));
    }

    let digest = file_hash(&artifact, method)?;
    if dry_run {
        return Ok(());
    }

    let sidecar = PathBuf::from(format!("{}.hash", artifact.display()));
    let temporary = PathBuf::from(format!("{}.hash.tmp", artifact.display()));
    for stale in [&temporary, &sidecar] {
        if stale.is_file() {
            fs::remove_file(stale)?;
        }
    }
    let content = serde_json::to_string(&BTreeMap::from([(method.name(), digest)])).map_err(NimpError::from)?;
    fs::write(&temporary, content).with_context(|| format!("Failed to write {}", temporary.display()))?;
    fs::rename(&temporary, &sidecar)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_file_hash_known_values() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("abc");
        fs::write(&path, b"abc").unwrap();
        assert_eq!(
            file_hash(&path, HashMethod::Sha1).unwrap(),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
        assert_eq!(
            file_hash(&path, HashMethod::Sha256).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_sidecar() {
        let dir = TempDir::new().unwrap();
        let artifact = dir.path().join("1234");
        fs::write(dir.path().join("1234.zip"), b"abc").unwrap();
        create(&artifact.to_string_lossy(), HashMethod::Sha1, false).unwrap();
        let content = fs::read_to_string(dir.path().join("1234.zip.hash")).unwrap();
        assert_eq!(content, r#"{"sha1":"a9993e364706816aba3e25717850c26c9cd0d89d"}"#);
    }

    #[test]
    fn test_method_parsing() {
        assert_eq!("SHA256".parse::<HashMethod>().unwrap(), HashMethod::Sha256);
        assert!("md4".parse::<HashMethod>().is_err());
    }
}
