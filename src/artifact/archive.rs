//! Zip artifacts: writing, CRC verification and extraction.

use anyhow::{Context, Result};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter};
use std::path::Path;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::NimpError;

/// Write `files` (`(source, name in archive)`) to a new zip at `path`.
/// Directory sources are skipped.
pub fn write(path: &Path, files: &[(String, String)], compress: bool) -> Result<()> {
    let out = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    let mut zip = ZipWriter::new(BufWriter::new(out));
    let method = if compress {
        CompressionMethod::Deflated
    } else {
        CompressionMethod::Stored
    };

    for (source, destination) in files {
        let source = Path::new(source);
        if source.is_dir() {
            continue;
        }
        tracing::debug!("Adding {} as {}", source.display(), destination);
        let size = fs::metadata(source)
            .with_context(|| format!("Failed to read {}", source.display()))?
            .len();
        let options = FileOptions::default()
            .compression_method(method)
            .large_file(size >= u64::from(u32::MAX));
        zip.start_file(destination.as_str(), options).map_err(NimpError::from)?;
        let mut input = BufReader::new(File::open(source)?);
        io::copy(&mut input, &mut zip)
            .with_context(|| format!("Failed to archive {}", source.display()))?;
    }

    zip.finish().map_err(NimpError::from)?;
    Ok(())
}

/// Re-read every entry so the CRC of each one is checked.
pub fn verify(path: &Path) -> Result<()> {
    let mut archive = open(path)?;
    for index in 0..archive.len() {
        let mut entry = archive.by_index(index).map_err(NimpError::from)?;
        let name = entry.name().to_string();
        io::copy(&mut entry, &mut io::sink()).map_err(|e| {
            NimpError::Verification(format!("Archive {} is corrupted ({}: {})", path.display(), name, e))
        })?;
    }
    Ok(())
}

fn open(path: &Path) -> Result<ZipArchive<BufReader<File>>> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    Ok(ZipArchive::new(BufReader::new(file)).map_err(NimpError::from)?)
}

/// Extract `archive` into `output`. An archive made only of zips is a
/// package of archives: each inner zip is extracted in place and removed.
pub fn extract(archive_path: &Path, output: &Path) -> Result<()> {
    if output.exists() {
        fs::remove_dir_all(output)?;
    }
    let mut archive = open(archive_path)?;
    let names: Vec<String> = archive.file_names().map(str::to_string).collect();
    let is_package = !names.is_empty() && names.iter().all(|name| name.ends_with(".zip"));
    archive.extract(output).map_err(NimpError::from)?;

    if is_package {
        for name in names {
            let inner = output.join(&name);
            open(&inner)?.extract(output).map_err(NimpError::from)?;
            fs::remove_file(&inner)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fixture(dir: &Path) -> Vec<(String, String)> {
        fs::create_dir_all(dir.join("src/sub")).unwrap();
        fs::write(dir.join("src/a.txt"), b"alpha").unwrap();
        fs::write(dir.join("src/sub/b.txt"), b"beta").unwrap();
        vec![
            (dir.join("src/a.txt").to_string_lossy().into_owned(), "a.txt".to_string()),
            (dir.join("src/sub").to_string_lossy().into_owned(), "sub".to_string()),
            (dir.join("src/sub/b.txt").to_string_lossy().into_owned(), "sub/b.txt".to_string()),
        ]
    }

    #[test]
    fn test_write_verify_extract() {
        let dir = TempDir::new().unwrap();
        let files = fixture(dir.path());
        let zip_path = dir.path().join("out.zip");
        write(&zip_path, &files, true).unwrap();
        verify(&zip_path).unwrap();

        let out = dir.path().join("out");
        extract(&zip_path, &out).unwrap();
        assert_eq!(fs::read(out.join("a.txt")).unwrap(), b"alpha");
        assert_eq!(fs::read(out.join("sub/b.txt")).unwrap(), b"beta");
    }

    #[test]
    fn test_corrupted_archive_fails_verification() {
        let dir = TempDir::new().unwrap();
        let files = fixture(dir.path());
        let zip_path = dir.path().join("out.zip");
        write(&zip_path, &files, false).unwrap();

        let mut bytes = fs::read(&zip_path).unwrap();
        let offset = bytes.windows(5).position(|w| w == b"alpha").unwrap();
        bytes[offset] = b'A';
        fs::write(&zip_path, bytes).unwrap();
        assert!(verify(&zip_path).is_err());
    }

    #[test]
    fn test_nested_archives_are_unpacked() {
        let dir = TempDir::new().unwrap();
        let files = fixture(dir.path());
        let inner = dir.path().join("inner.zip");
        write(&inner, &files, false).unwrap();
        let outer = dir.path().join("outer.zip");
        write(&outer, &[(inner.to_string_lossy().into_owned(), "part1.zip".to_string())], false).unwrap();

        let out = dir.path().join("out");
        extract(&outer, &out).unwrap();
        assert!(out.join("a.txt").is_file());
        assert!(!out.join("part1.zip").exists());
    }
}
