//! BitTorrent metainfo for uploaded artifacts.

use anyhow::{bail, Context, Result};
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::error::NimpError;

pub const PIECE_LENGTH: usize = 256 * 1024;

/// Bencoded value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Bencode {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<Bencode>),
    Dict(BTreeMap<Vec<u8>, Bencode>),
}

impl Bencode {
    pub fn string(value: &str) -> Self {
        Bencode::Bytes(value.as_bytes().to_vec())
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Bencode::Int(value) => out.extend_from_slice(format!("i{}e", value).as_bytes()),
            Bencode::Bytes(bytes) => {
                out.extend_from_slice(format!("{}:", bytes.len()).as_bytes());
                out.extend_from_slice(bytes);
            }
            Bencode::List(items) => {
                out.push(b'l');
                items.iter().for_each(|item| item.encode_into(out));
                out.push(b'e');
            }
            Bencode::Dict(entries) => {
                out.push(b'd');
                for (key, value) in entries {
                    Bencode::Bytes(key.clone()).encode_into(out);
                    value.encode_into(out);
                }
                out.push(b'e');
            }
        }
    }
}

fn dict<const N: usize>(entries: [(&str, Bencode); N]) -> Bencode {
    Bencode::Dict(entries.into_iter().map(|(k, v)| (k.as_bytes().to_vec(), v)).collect())
}

/// Concatenated SHA-1 of each piece of the files, read back to back.
struct PieceHasher {
    pieces: Vec<u8>,
    current: Sha1,
    filled: usize,
}

impl PieceHasher {
    fn new() -> Self {
        Self {
            pieces: Vec::new(),
            current: Sha1::new(),
            filled: 0,
        }
    }

    fn update(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let take = (PIECE_LENGTH - self.filled).min(data.len());
            self.current.update(&data[..take]);
            self.filled += take;
            data = &data[take..];
            if self.filled == PIECE_LENGTH {
                self.flush();
            }
        }
    }

    fn flush(&mut self) {
        let digest = std::mem::replace(&mut self.current, Sha1::new()).finalize();
        self.pieces.extend_from_slice(&digest);
        self.filled = 0;
    }

    fn hash_file(&mut self, path: &Path) -> Result<u64> {
        let mut file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
        let mut buffer = vec![0u8; 64 * 1024];
        let mut total = 0u64;
        loop {
            let read = file.read(&mut buffer)?;
            if read == 0 {
                return Ok(total);
            }
            self.update(&buffer[..read]);
            total += read as u64;
        }
    }

    fn finish(mut self) -> Vec<u8> {
        if self.filled > 0 {
            self.flush();
        }
        self.pieces
    }
}

/// Metainfo for `artifact_path` (`<path>.zip` when present, otherwise the
/// `<path>` directory).
pub fn metainfo(artifact_path: &str, announce: Option<&str>) -> Result<Bencode> {
    let zip = PathBuf::from(format!("{}.zip", artifact_path));
    let directory = PathBuf::from(artifact_path);
    let mut hasher = PieceHasher::new();

    let (name, layout) = if zip.is_file() {
        let name = file_name(&zip);
        let length = hasher.hash_file(&zip)?;
        (name, ("length", Bencode::Int(length as i64)))
    } else if directory.is_dir() {
        let mut files = Vec::new();
        for entry in WalkDir::new(&directory).sort_by_file_name() {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let length = hasher.hash_file(entry.path())?;
            let relative = entry.path().strip_prefix(&directory).unwrap_or(entry.path());
            let path = relative
                .components()
                .map(|c| Bencode::string(&c.as_os_str().to_string_lossy()))
                .collect();
            files.push(dict([("length", Bencode::Int(length as i64)), ("path", Bencode::List(path))]));
        }
        (file_name(&directory), ("files", Bencode::List(files)))
    } else {
        bail!(NimpError::NotFound(format!("Artifact not found: {}", artifact_path)));
    };

    let info = dict([
        ("name", Bencode::string(&name)),
        ("piece length", Bencode::Int(PIECE_LENGTH as i64)),
        ("pieces", Bencode::Bytes(hasher.finish())),
        layout,
    ]);
    let mut root = BTreeMap::new();
    root.insert(b"info".to_vec(), info);
    if let Some(announce) = announce {
        root.insert(b"announce".to_vec(), Bencode::string(announce));
    }
    Ok(Bencode::Dict(root))
}

fn file_name(path: &Path) -> String {
    path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default()
}

/// Write `<artifact>.torrent` through a `.tmp` file.
pub fn create(artifact_path: &str, announce: Option<&str>, dry_run: bool) -> Result<()> {
    let torrent = PathBuf::from(format!("{}.torrent", artifact_path));
    let temporary = PathBuf::from(format!("{}.torrent.tmp", artifact_path));
    if !dry_run {
        for stale in [&temporary, &torrent] {
            if stale.is_file() {
                fs::remove_file(stale)?;
            }
        }
    }

    let encoded = metainfo(artifact_path, announce)?.encode();
    if dry_run {
        return Ok(());
    }
    fs::write(&temporary, encoded).with_context(|| format!("Failed to write {}", temporary.display()))?;
    fs::rename(&temporary, &torrent)?;
    Ok(())
}
