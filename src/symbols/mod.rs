//! Program and shader symbol stores.
//!
//! A store is configured per kind under `[symbol_servers]`:
//!
//! ```toml
//! [symbol_servers]
//! expiration = 30
//! program = { path = "//share/symbols/{project}", expiration = 10 }
//! shaders = "//share/shaders/{platform}"
//! ```
//!
//! Program stores use the symstore layout (`<name>.pdb/<id>/<name>.pdb`)
//! and are filled by the platform uploader. Shader stores are plain
//! directory copies of the cooker's debug output.

pub mod store;

pub use store::{SymStore, UploadOptions};

use anyhow::{Context, Result};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{Duration, SystemTime};
use walkdir::WalkDir;

use crate::config::RunDescriptor;
use crate::error::NimpError;
use crate::fileset::expand_glob;
use crate::fsutil::{self, standardize_path};
use crate::platform::Platform;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Which store the command targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    Program,
    Shaders,
}

impl SymbolKind {
    pub fn name(self) -> &'static str {
        match self {
            SymbolKind::Program => "program",
            SymbolKind::Shaders => "shaders",
        }
    }
}

impl fmt::Display for SymbolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SymbolKind {
    type Err = NimpError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "program" => Ok(SymbolKind::Program),
            "shaders" => Ok(SymbolKind::Shaders),
            other => Err(NimpError::config(format!(
                "Unknown symbol server '{}', expected program or shaders",
                other
            ))),
        }
    }
}

/// One configured store.
#[derive(Debug, Clone)]
pub struct SymbolServer {
    pub kind: SymbolKind,
    pub path: PathBuf,
    pub platform: Platform,
    pub expiration: Duration,
}

impl SymbolServer {
    /// Resolve the `kind` store from the run's configuration.
    pub fn configure(run: &RunDescriptor, kind: SymbolKind) -> Result<Self> {
        let settings = run
            .settings()
            .symbol_servers
            .as_ref()
            .ok_or_else(|| NimpError::config("Symbol servers are not configured"))?;
        let entry = match kind {
            SymbolKind::Program => settings.program.as_ref(),
            SymbolKind::Shaders => settings.shaders.as_ref(),
        }
        .ok_or_else(|| NimpError::config(format!("No '{}' symbol server in [symbol_servers]", kind)))?;

        let path = standardize_path(&run.format(entry.path())?);
        Ok(Self {
            kind,
            path: PathBuf::from(path),
            platform: run.platform(),
            expiration: DAY * entry.expiration(settings.expiration) as u32,
        })
    }

    /// Every entry in the store, sorted. Program entries are the
    /// `<name>.<ext>/<id>` directories; shader entries are files.
    pub fn list(&self) -> Result<Vec<PathBuf>> {
        let root = self.path.to_string_lossy();
        let mut symbols: Vec<String> = Vec::new();
        match self.kind {
            SymbolKind::Program => {
                for extension in ["exe", "dll", "pdb"] {
                    symbols.extend(expand_glob(&format!("{}/*.{}/*", root, extension))?);
                }
            }
            SymbolKind::Shaders => {
                let mut extensions: Vec<&str> = Vec::new();
                if self.platform.is_sony() {
                    extensions.extend(["sdb", "agsd"]);
                }
                if self.platform.is_microsoft() {
                    extensions.push("pdb");
                }
                if self.platform.is_nintendo() {
                    extensions.push("glslcoutput");
                }
                for extension in extensions {
                    symbols.extend(expand_glob(&format!("{}/**/*.{}", root, extension))?);
                }
            }
        }
        symbols.sort();
        symbols.dedup();
        Ok(symbols.into_iter().map(PathBuf::from).collect())
    }

    /// Entries of `all` past retention. Program entries with no files are
    /// always expired.
    pub fn list_to_clean(&self, all: &[PathBuf]) -> Result<Vec<PathBuf>> {
        self.list_to_clean_at(all, SystemTime::now())
    }

    fn list_to_clean_at(&self, all: &[PathBuf], now: SystemTime) -> Result<Vec<PathBuf>> {
        let expired = |path: &Path| -> Result<bool> {
            let modified = fs::metadata(path)
                .and_then(|metadata| metadata.modified())
                .with_context(|| format!("Failed to read modification time of {}", path.display()))?;
            Ok(now.duration_since(modified).unwrap_or_default() > self.expiration)
        };

        let mut to_clean = Vec::new();
        for symbol in all {
            let clean = match self.kind {
                SymbolKind::Program => match first_entry(symbol)? {
                    None => true,
                    Some(first) => expired(&first)?,
                },
                SymbolKind::Shaders => expired(symbol)?,
            };
            if clean {
                tracing::debug!("Adding for delete: {}", symbol.display());
                to_clean.push(symbol.clone());
            }
        }
        Ok(to_clean)
    }

    /// Remove `symbols`. Dry-run only logs.
    pub fn clean(&self, symbols: &[PathBuf], dry_run: bool) -> Result<()> {
        for symbol in symbols {
            fsutil::try_remove(symbol, dry_run)?;
        }
        Ok(())
    }

    /// Copy every file under `source` into the store, keeping the
    /// relative layout.
    pub fn copy_into(&self, source: &Path, dry_run: bool) -> Result<usize> {
        tracing::info!(
            "Uploading from {} to {}{}",
            source.display(),
            self.path.display(),
            if dry_run { " (Simulation)" } else { "" }
        );
        if !source.is_dir() {
            return Err(NimpError::NotFound(source.display().to_string()).into());
        }
        let mut count = 0;
        for entry in WalkDir::new(source).sort_by_file_name() {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry.path().strip_prefix(source)?;
            fsutil::copy_file(entry.path(), self.path.join(relative), dry_run)?;
            count += 1;
        }
        Ok(count)
    }
}

/// First entry of a program symbol directory, by name.
fn first_entry(directory: &Path) -> Result<Option<PathBuf>> {
    if !directory.is_dir() {
        return Ok(None);
    }
    let mut entries = fs::read_dir(directory)
        .with_context(|| format!("Failed to list {}", directory.display()))?
        .map(|entry| entry.map(|entry| entry.path()))
        .collect::<std::io::Result<Vec<_>>>()?;
    entries.sort();
    Ok(entries.into_iter().next())
}

/// Where the cooker writes shader debug info for the run's platform.
pub fn shader_source(run: &RunDescriptor) -> Result<PathBuf> {
    let platform = run.platform();
    let subdirectory = if platform == Platform::PS4 {
        "SF_PS4/sdb"
    } else {
        platform.unreal_name()
    };
    Ok(run.uproject_dir()?.join("Saved/ShaderDebugInfo").join(subdirectory))
}

/// Default program symbol source: the project's binaries for the platform.
pub fn program_source(run: &RunDescriptor) -> Result<PathBuf> {
    Ok(run.uproject_dir()?.join("Binaries").join(run.platform().unreal_name()))
}

/// Executables, libraries and PDBs under `source`, sorted.
pub fn program_symbols(source: &Path) -> Vec<PathBuf> {
    let mut symbols: Vec<PathBuf> = WalkDir::new(source)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            entry
                .path()
                .extension()
                .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
                .is_some_and(|ext| matches!(ext.as_str(), "exe" | "dll" | "pdb"))
        })
        .map(|entry| entry.into_path())
        .collect();
    symbols.sort();
    symbols
}

/// `symbol-server status`.
pub fn status(run: &RunDescriptor, kind: SymbolKind) -> Result<usize> {
    let server = SymbolServer::configure(run, kind)?;
    tracing::info!("Status for symbol server at {}", server.path.display());
    let count = server.list()?.len();
    tracing::info!("Symbol count: {}", count);
    Ok(count)
}

/// `symbol-server update`. `source` overrides the default location.
pub fn update(run: &RunDescriptor, kind: SymbolKind, source: Option<&Path>, options: &UploadOptions) -> Result<()> {
    let server = SymbolServer::configure(run, kind)?;
    let before = server.list()?.len();
    match kind {
        SymbolKind::Shaders => {
            let source = match source {
                Some(source) => source.to_path_buf(),
                None => shader_source(run)?,
            };
            server
                .copy_into(&source, run.dry_run())
                .context("Failed to update shader symbols")?;
        }
        SymbolKind::Program => {
            let source = match source {
                Some(source) => source.to_path_buf(),
                None => program_source(run)?,
            };
            let symbols = program_symbols(&source);
            tracing::info!(
                "Uploading {} symbol files from {} to {}",
                symbols.len(),
                source.display(),
                server.path.display()
            );
            SymStore::for_platform(server.platform)?
                .upload(&symbols, &server.path, options, run.dry_run())
                .context("Failed to update program symbols")?;
        }
    }
    tracing::info!("Symbol count: {} => {}", before, server.list()?.len());
    Ok(())
}

/// `symbol-server clean`. Returns the number of removed entries.
pub fn clean(run: &RunDescriptor, kind: SymbolKind) -> Result<usize> {
    let server = SymbolServer::configure(run, kind)?;
    tracing::info!(
        "Cleaning symbol server at {}{}",
        server.path.display(),
        if run.dry_run() { " (Simulation)" } else { "" }
    );
    let all = server.list()?;
    let to_clean = server.list_to_clean(&all)?;
    server.clean(&to_clean, run.dry_run())?;
    tracing::info!("Symbol count: {} => {}", all.len(), all.len() - to_clean.len());
    Ok(to_clean.len())
}
