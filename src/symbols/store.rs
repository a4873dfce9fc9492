//! Platform symbol store uploaders.
//!
//! Microsoft platforms ingest through the Debugging Tools `symstore.exe`,
//! PS5 through the SDK's `prospero-symupload.exe`. Both read the file list
//! from a response file.

use anyhow::{bail, Context, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use rayon::prelude::*;
use std::env;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::NimpError;
use crate::fileset::expand_glob;
use crate::fsutil;
use crate::platform::Platform;
use crate::process::Cmd;
use crate::retry::{self, RetryPolicy};

/// CAB compression corrupts sources past 2 GB; keep a margin.
pub const CAB_SOURCE_SIZE_LIMIT: u64 = 1_500_000_000;

/// Exit codes symstore returns when the share drops the connection.
const TRANSIENT_EXIT_CODES: &[i32] = &[32, 80];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Microsoft,
    Ps5,
}

/// Optional symstore metadata.
#[derive(Debug, Clone, Default)]
pub struct UploadOptions {
    pub product: Option<String>,
    pub comment: Option<String>,
    pub version: Option<String>,
    /// PS5 only.
    pub tag: Option<String>,
    pub compress: bool,
    /// Two-tier `index2.txt` layout.
    pub use_index2: bool,
}

/// A located uploader executable.
#[derive(Debug, Clone)]
pub struct SymStore {
    kind: StoreKind,
    tool: PathBuf,
    retry: RetryPolicy,
}

impl SymStore {
    /// Uploader for `platform`, or a configuration error when the platform
    /// has none or the tool cannot be found.
    pub fn for_platform(platform: Platform) -> Result<Self> {
        let kind = match platform {
            Platform::Win64 | Platform::XSX => StoreKind::Microsoft,
            Platform::PS5 => StoreKind::Ps5,
            other => bail!(NimpError::config(format!(
                "No program symbol store for {}, platform must be win64, xsx or ps5",
                other.name()
            ))),
        };
        let tool = match kind {
            StoreKind::Microsoft => microsoft_tool_path(),
            StoreKind::Ps5 => ps5_tool_path(),
        }
        .ok_or_else(|| NimpError::NotFound(format!("symbol store executable for {}", platform.name())))?;
        Ok(Self::with_tool(kind, tool))
    }

    pub fn with_tool(kind: StoreKind, tool: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            tool: tool.into(),
            retry: RetryPolicy::SYMSTORE,
        }
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn tool(&self) -> &Path {
        &self.tool
    }

    /// Upload `symbols` into `store`. Empty input is a no-op.
    pub fn upload(&self, symbols: &[PathBuf], store: &Path, options: &UploadOptions, dry_run: bool) -> Result<()> {
        if symbols.is_empty() {
            tracing::info!("No symbols were provided");
            return Ok(());
        }
        match self.kind {
            StoreKind::Microsoft => self.upload_microsoft(symbols, store, options, dry_run),
            StoreKind::Ps5 => self.upload_ps5(symbols, store, options, dry_run),
        }
    }

    fn microsoft_command(&self, store: &Path, options: &UploadOptions) -> Cmd {
        let mut cmd = Cmd::new(self.tool.to_string_lossy())
            .args(["add", "/r", "/s"])
            .arg_path(store)
            .args(["/o", "-:NOFORCECOPY"]);
        if options.use_index2 {
            cmd = cmd.arg("/3");
        }
        if let Some(product) = &options.product {
            cmd = cmd.args(["/t", product.as_str()]);
        }
        if let Some(comment) = &options.comment {
            cmd = cmd.args(["/c", comment.as_str()]);
        }
        if let Some(version) = &options.version {
            cmd = cmd.args(["/v", version.as_str()]);
        }
        cmd
    }

    fn upload_microsoft(&self, symbols: &[PathBuf], store: &Path, options: &UploadOptions, dry_run: bool) -> Result<()> {
        if !options.compress {
            return self.ingest(self.microsoft_command(store, options), symbols, &[], dry_run);
        }

        let (small, large) = split_by_size(symbols, CAB_SOURCE_SIZE_LIMIT);
        if !small.is_empty() {
            self.ingest(self.microsoft_command(store, options), &small, &["/compress"], dry_run)?;
        }
        if !large.is_empty() {
            tracing::info!(
                "{} symbol files exceed the CAB limit, compressing them with gzip",
                large.len()
            );
            let scratch = ScratchDir::new("nimp-symbols")?;
            let compressed = gzip_all(&large, scratch.path(), dry_run)?;
            self.ingest(self.microsoft_command(store, options), &compressed, &[], dry_run)?;
        }
        Ok(())
    }

    fn upload_ps5(&self, symbols: &[PathBuf], store: &Path, options: &UploadOptions, dry_run: bool) -> Result<()> {
        let rsp = ResponseFile::write(symbols)?;
        let mut cmd = Cmd::new(self.tool.to_string_lossy())
            .args(["add", "/r", "/f"])
            .arg(rsp.argument())
            .arg("/s")
            .arg_path(store)
            .arg("/o");
        if let Some(tag) = &options.tag {
            cmd = cmd.args(["/tag", tag.as_str()]);
        }
        if options.compress {
            cmd = cmd.arg("/compress");
        }
        cmd.dry_run(dry_run)
            .check()
            .context("Failed to upload symbols")
    }

    /// Run `base /f @rsp extra` with the symstore retry policy.
    fn ingest(&self, base: Cmd, symbols: &[PathBuf], extra: &[&str], dry_run: bool) -> Result<()> {
        let rsp = ResponseFile::write(symbols)?;
        let cmd = base.arg("/f").arg(rsp.argument()).args(extra.iter().copied()).dry_run(dry_run);
        retry::try_execute(self.retry, retry::on_exit_codes(TRANSIENT_EXIT_CODES), || cmd.check())
            .context("Failed to generate IndexFile")
    }
}

/// Split into files under and at-or-over `limit`. Missing files are dropped.
fn split_by_size(symbols: &[PathBuf], limit: u64) -> (Vec<PathBuf>, Vec<PathBuf>) {
    let mut small = Vec::new();
    let mut large = Vec::new();
    for symbol in symbols {
        match fs::metadata(symbol) {
            Ok(metadata) if metadata.len() >= limit => large.push(symbol.clone()),
            Ok(_) => small.push(symbol.clone()),
            Err(_) => tracing::warn!("Skipping missing symbol file {}", symbol.display()),
        }
    }
    (small, large)
}

/// Gzip every file into `output` as `<name>.gz`, on `cpu_count - 1`
/// workers. Returns the compressed paths in input order.
fn gzip_all(files: &[PathBuf], output: &Path, dry_run: bool) -> Result<Vec<PathBuf>> {
    let targets: Vec<(PathBuf, PathBuf)> = files
        .iter()
        .map(|file| {
            let name = file
                .file_name()
                .map(|name| format!("{}.gz", name.to_string_lossy()))
                .unwrap_or_else(|| "symbol.gz".to_string());
            (file.clone(), output.join(name))
        })
        .collect();
    if dry_run {
        return Ok(targets.into_iter().map(|(_, target)| target).collect());
    }

    let workers = std::thread::available_parallelism()
        .map(|n| n.get().saturating_sub(1).max(1))
        .unwrap_or(1);
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .build()
        .context("Failed to start compression workers")?;
    pool.install(|| {
        targets
            .par_iter()
            .map(|(source, target)| -> Result<PathBuf> {
                gzip_file(source, target)?;
                Ok(target.clone())
            })
            .collect()
    })
}

fn gzip_file(source: &Path, target: &Path) -> Result<()> {
    tracing::debug!("Compressing {} to {}", source.display(), target.display());
    let mut input = BufReader::new(
        File::open(source).with_context(|| format!("Failed to open {}", source.display()))?,
    );
    let output = File::create(target).with_context(|| format!("Failed to create {}", target.display()))?;
    let mut encoder = GzEncoder::new(BufWriter::new(output), Compression::default());
    io::copy(&mut input, &mut encoder)?;
    encoder.finish()?.flush()?;
    Ok(())
}

/// Temporary file listing one symbol path per line. Removed on drop.
struct ResponseFile {
    path: PathBuf,
}

impl ResponseFile {
    fn write(symbols: &[PathBuf]) -> Result<Self> {
        let path = unique_temp_path("nimp-symbols", "rsp");
        let mut writer = BufWriter::new(
            File::create(&path).with_context(|| format!("Failed to create {}", path.display()))?,
        );
        for symbol in symbols {
            tracing::debug!("Adding {} to response file {}", symbol.display(), path.display());
            writeln!(writer, "{}", symbol.display())?;
        }
        writer.flush()?;
        Ok(Self { path })
    }

    fn argument(&self) -> String {
        format!("@{}", self.path.display())
    }
}

impl Drop for ResponseFile {
    fn drop(&mut self) {
        fsutil::remove_best_effort(&self.path);
    }
}

/// Temporary directory removed on drop.
struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    fn new(prefix: &str) -> Result<Self> {
        let path = unique_temp_path(prefix, "d");
        fs::create_dir_all(&path).with_context(|| format!("Failed to create {}", path.display()))?;
        Ok(Self { path })
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        fsutil::remove_best_effort(&self.path);
    }
}

fn unique_temp_path(prefix: &str, extension: &str) -> PathBuf {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    env::temp_dir().join(format!("{}-{}-{}.{}", prefix, std::process::id(), n, extension))
}

/// `$UE_SDKS_ROOT/HostWin64/<platform>` when it exists.
fn autosdk_for_platform(platform: &str) -> Option<PathBuf> {
    let root = env::var_os("UE_SDKS_ROOT")?;
    let path = Path::new(&root).join("HostWin64").join(platform);
    path.exists().then_some(path)
}

/// AutoSDK first, then the default Windows Kits install.
fn microsoft_tool_path() -> Option<PathBuf> {
    const SUBPATH: &str = "Windows Kits/10/Debuggers/x64/symstore.exe";
    autosdk_for_platform("Win64")
        .map(|sdk| sdk.join(SUBPATH))
        .filter(|candidate| candidate.exists())
        .or_else(|| {
            let candidate = Path::new("C:/Program Files (x86)").join(SUBPATH);
            candidate.exists().then_some(candidate)
        })
}

/// Newest SDK first across AutoSDK and `$SCE_PROSPERO_SDK_DIR`.
fn ps5_tool_path() -> Option<PathBuf> {
    const SUBPATH: &str = "NotForLicensees/*/host_tools/bin/prospero-symupload.exe";
    let mut candidates = Vec::new();
    if let Some(sdk) = autosdk_for_platform("PS5") {
        candidates.extend(expand_glob(&format!("{}/*/{}", sdk.display(), SUBPATH)).unwrap_or_default());
    }
    if let Some(root) = env::var_os("SCE_PROSPERO_SDK_DIR") {
        candidates.extend(expand_glob(&format!("{}/{}", Path::new(&root).display(), SUBPATH)).unwrap_or_default());
    }
    newest_sdk(candidates.into_iter().map(PathBuf::from).collect())
}

/// Candidates look like `<root>/<sdk version>/NotForLicensees/<short>/host_tools/bin/<exe>`.
fn newest_sdk(mut candidates: Vec<PathBuf>) -> Option<PathBuf> {
    candidates.sort_by_key(|path| std::cmp::Reverse(sdk_version(path)));
    candidates.into_iter().next()
}

/// SDK versions come as `1.000`, `2.00.00.09` or `2.000.009`.
fn sdk_version(path: &Path) -> Vec<u64> {
    path.ancestors()
        .nth(5)
        .and_then(Path::file_name)
        .map(|name| {
            name.to_string_lossy()
                .split('.')
                .map(|part| part.parse().unwrap_or(0))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_unsupported_platform() {
        let err = SymStore::for_platform(Platform::Switch).unwrap_err();
        assert!(err.to_string().contains("win64, xsx or ps5"));
    }

    #[test]
    fn test_sdk_version_ordering() {
        let candidates = vec![
            PathBuf::from("/sdk/2.000.009/NotForLicensees/2.000/host_tools/bin/prospero-symupload.exe"),
            PathBuf::from("/sdk/4.00.00.40/NotForLicensees/4.000/host_tools/bin/prospero-symupload.exe"),
            PathBuf::from("/sdk/1.000/NotForLicensees/1.000/host_tools/bin/prospero-symupload.exe"),
        ];
        let newest = newest_sdk(candidates).unwrap();
        assert!(newest.to_string_lossy().contains("4.00.00.40"));
        assert_eq!(sdk_version(&newest), vec![4, 0, 0, 40]);
    }

    #[test]
    fn test_split_by_size() {
        let dir = TempDir::new().unwrap();
        let small = dir.path().join("Game.pdb");
        let large = dir.path().join("Huge.pdb");
        fs::write(&small, b"tiny").unwrap();
        fs::write(&large, vec![0u8; 64]).unwrap();

        let (under, over) = split_by_size(&[small.clone(), large.clone(), dir.path().join("gone.pdb")], 32);
        assert_eq!(under, vec![small]);
        assert_eq!(over, vec![large]);
    }

    #[test]
    fn test_gzip_all() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("out");
        fs::create_dir(&out).unwrap();
        let source = dir.path().join("Game.pdb");
        fs::write(&source, b"program database").unwrap();

        let compressed = gzip_all(&[source], &out, false).unwrap();
        assert_eq!(compressed, vec![out.join("Game.pdb.gz")]);

        let mut decoded = String::new();
        GzDecoder::new(File::open(&compressed[0]).unwrap())
            .read_to_string(&mut decoded)
            .unwrap();
        assert_eq!(decoded, "program database");
    }

    #[test]
    fn test_response_file_removed_on_drop() {
        let rsp = ResponseFile::write(&[PathBuf::from("a.pdb"), PathBuf::from("b.exe")]).unwrap();
        let path = rsp.path.clone();
        assert_eq!(fs::read_to_string(&path).unwrap(), "a.pdb\nb.exe\n");
        assert!(rsp.argument().starts_with('@'));
        drop(rsp);
        assert!(!path.exists());
    }

    #[test]
    fn test_microsoft_command_line() {
        let store = SymStore::with_tool(StoreKind::Microsoft, "symstore.exe");
        let options = UploadOptions {
            product: Some("Game".to_string()),
            version: Some("1234".to_string()),
            use_index2: true,
            ..Default::default()
        };
        let cmd = store.microsoft_command(Path::new("//share/symbols"), &options);
        assert_eq!(
            cmd.get_args(),
            ["add", "/r", "/s", "//share/symbols", "/o", "-:NOFORCECOPY", "/3", "/t", "Game", "/v", "1234"]
        );
    }

    #[cfg(unix)]
    fn fake_tool(dir: &Path, body: &str) -> PathBuf {
        let tool = dir.join("symstore.sh");
        fs::write(&tool, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fsutil::make_executable(&tool).unwrap();
        tool
    }

    #[cfg(unix)]
    #[test]
    fn test_upload_passes_response_file() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("args.txt");
        let tool = fake_tool(
            dir.path(),
            &format!(
                "for a in \"$@\"; do case $a in @*) cat \"${{a#@}}\" >> {0};; *) echo \"$a\" >> {0};; esac; done",
                log.display()
            ),
        );
        let symbol = dir.path().join("Game.pdb");
        fs::write(&symbol, b"pdb").unwrap();

        SymStore::with_tool(StoreKind::Microsoft, &tool)
            .upload(
                std::slice::from_ref(&symbol),
                Path::new("/store"),
                &UploadOptions {
                    compress: true,
                    ..Default::default()
                },
                false,
            )
            .unwrap();

        let logged = fs::read_to_string(&log).unwrap();
        assert!(logged.contains(&symbol.display().to_string()));
        assert!(logged.contains("/compress"));
        assert!(logged.contains("-:NOFORCECOPY"));
    }

    #[cfg(unix)]
    #[test]
    fn test_transient_exit_code_is_retried() {
        let dir = TempDir::new().unwrap();
        let counter = dir.path().join("count");
        let tool = fake_tool(
            dir.path(),
            &format!("echo x >> {0}; [ $(wc -l < {0}) -ge 2 ] && exit 0; exit 32", counter.display()),
        );
        let symbol = dir.path().join("Game.exe");
        fs::write(&symbol, b"exe").unwrap();

        SymStore::with_tool(StoreKind::Microsoft, &tool)
            .retry_policy(RetryPolicy::new(3, Duration::ZERO))
            .upload(&[symbol], Path::new("/store"), &UploadOptions::default(), false)
            .unwrap();
        assert_eq!(fs::read_to_string(&counter).unwrap().lines().count(), 2);
    }

    #[cfg(unix)]
    #[test]
    fn test_other_exit_code_fails_immediately() {
        let dir = TempDir::new().unwrap();
        let tool = fake_tool(dir.path(), "exit 5");
        let symbol = dir.path().join("Game.exe");
        fs::write(&symbol, b"exe").unwrap();

        let err = SymStore::with_tool(StoreKind::Ps5, &tool)
            .upload(&[symbol], Path::new("/store"), &UploadOptions::default(), false)
            .unwrap_err();
        assert_eq!(crate::error::tool_exit_code(&err), Some(5));
    }

    #[test]
    fn test_empty_upload_is_noop() {
        let store = SymStore::with_tool(StoreKind::Microsoft, "/does/not/exist");
        store
            .upload(&[], Path::new("/store"), &UploadOptions::default(), false)
            .unwrap();
    }
}
