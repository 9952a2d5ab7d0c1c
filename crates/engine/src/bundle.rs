//! Bundle descriptors
//!
//! A bundle descriptor is a standard bencoded torrent file describing the
//! staged content of one playlist: file list, piece layout and announce
//! endpoints.

use crate::bencode::{BencodeError, DictBuilder, Value};
use sha1::{Digest, Sha1};
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use url::Url;

/// Value written to the `created by` field
pub const CREATED_BY: &str = "Tapeswarm";

#[derive(Debug, Error)]
pub enum BundleError {
    #[error("Bencode parse error: {0}")]
    Bencode(#[from] BencodeError),
    #[error("Missing required field: {0}")]
    MissingField(&'static str),
    #[error("Invalid bundle structure: {0}")]
    InvalidStructure(&'static str),
    #[error("No content files found in {0}")]
    EmptyContent(PathBuf),
    #[error("Invalid announce endpoint: {0}")]
    InvalidAnnounce(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A file within a bundle
#[derive(Debug, Clone, PartialEq)]
pub struct BundleFile {
    /// Path relative to the content root
    pub path: PathBuf,
    pub length: u64,
    /// Offset in the concatenated content stream
    pub offset: u64,
}

/// Parsed bundle descriptor
#[derive(Debug, Clone)]
pub struct BundleDescriptor {
    /// SHA1 of the bencoded info dictionary
    pub info_hash: [u8; 20],
    pub name: String,
    pub piece_length: u64,
    pub pieces: Vec<[u8; 20]>,
    pub files: Vec<BundleFile>,
    pub total_size: u64,
    /// Announce endpoints, primary first
    pub announce: Vec<String>,
    pub created_by: Option<String>,
    pub creation_date: Option<i64>,
}

impl BundleDescriptor {
    pub fn read(path: &Path) -> Result<Self, BundleError> {
        let data = std::fs::read(path)?;
        Self::from_bytes(&data)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, BundleError> {
        let root = Value::decode(data)?;
        let info = root.get("info").ok_or(BundleError::MissingField("info"))?;
        if !matches!(info, Value::Dict(_)) {
            return Err(BundleError::InvalidStructure("info is not a dictionary"));
        }
        let info_hash: [u8; 20] = Sha1::digest(info.encode()).into();

        let name = info
            .get("name")
            .and_then(Value::as_str)
            .ok_or(BundleError::MissingField("name"))?
            .to_string();

        let piece_length = info
            .get("piece length")
            .and_then(Value::as_int)
            .filter(|&n| n > 0)
            .ok_or(BundleError::MissingField("piece length"))? as u64;

        let raw_pieces = info
            .get("pieces")
            .and_then(Value::as_bytes)
            .ok_or(BundleError::MissingField("pieces"))?;
        if raw_pieces.len() % 20 != 0 {
            return Err(BundleError::InvalidStructure("pieces length not a multiple of 20"));
        }
        let pieces: Vec<[u8; 20]> = raw_pieces
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();

        let files = if let Some(length) = info.get("length") {
            let length = length
                .as_int()
                .filter(|&n| n >= 0)
                .ok_or(BundleError::InvalidStructure("negative length"))?;
            vec![BundleFile {
                path: safe_relative_path(std::iter::once(name.as_str()))?,
                length: length as u64,
                offset: 0,
            }]
        } else {
            let entries = info
                .get("files")
                .and_then(Value::as_list)
                .ok_or(BundleError::MissingField("length or files"))?;
            let mut files = Vec::with_capacity(entries.len());
            let mut offset = 0u64;
            for entry in entries {
                let length = entry
                    .get("length")
                    .and_then(Value::as_int)
                    .filter(|&n| n >= 0)
                    .ok_or(BundleError::MissingField("file length"))? as u64;
                let parts = entry
                    .get("path")
                    .and_then(Value::as_list)
                    .ok_or(BundleError::MissingField("file path"))?;
                let parts = parts
                    .iter()
                    .map(|p| p.as_str().ok_or(BundleError::InvalidStructure("non-utf8 path")))
                    .collect::<Result<Vec<_>, _>>()?;
                files.push(BundleFile {
                    path: safe_relative_path(parts.into_iter())?,
                    length,
                    offset,
                });
                offset += length;
            }
            files
        };

        let total_size: u64 = files.iter().map(|f| f.length).sum();
        let expected_pieces = total_size.div_ceil(piece_length) as usize;
        if pieces.len() != expected_pieces {
            return Err(BundleError::InvalidStructure("piece count does not match content size"));
        }

        let mut announce: Vec<String> = root
            .get("announce")
            .and_then(Value::as_str)
            .map(|s| vec![s.to_string()])
            .unwrap_or_default();
        if let Some(tiers) = root.get("announce-list").and_then(Value::as_list) {
            for url in tiers
                .iter()
                .filter_map(Value::as_list)
                .flatten()
                .filter_map(Value::as_str)
            {
                if !announce.iter().any(|a| a == url) {
                    announce.push(url.to_string());
                }
            }
        }

        Ok(BundleDescriptor {
            info_hash,
            name,
            piece_length,
            pieces,
            files,
            total_size,
            announce,
            created_by: root.get("created by").and_then(Value::as_str).map(String::from),
            creation_date: root.get("creation date").and_then(Value::as_int),
        })
    }

    /// Hex info hash, used as the bundle fingerprint
    pub fn fingerprint(&self) -> String {
        hex::encode(self.info_hash)
    }

    pub fn num_pieces(&self) -> usize {
        self.pieces.len()
    }

    /// Expected size of a piece; the last one may be short
    pub fn piece_size(&self, index: usize) -> u64 {
        let start = index as u64 * self.piece_length;
        self.piece_length.min(self.total_size.saturating_sub(start))
    }
}

/// Reject absolute paths and parent traversal coming from a descriptor
fn safe_relative_path<'a>(parts: impl Iterator<Item = &'a str>) -> Result<PathBuf, BundleError> {
    let path: PathBuf = parts.collect();
    let safe = path.components().count() > 0
        && path.components().all(|c| matches!(c, Component::Normal(_)));
    if safe {
        Ok(path)
    } else {
        Err(BundleError::InvalidStructure("unsafe file path"))
    }
}

/// Regular, non-hidden files at the top level of `dir`, sorted by name
pub fn content_files(dir: &Path) -> std::io::Result<Vec<(String, u64)>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if name.starts_with('.') || !entry.file_type()?.is_file() {
            continue;
        }
        files.push((name, entry.metadata()?.len()));
    }
    files.sort();
    Ok(files)
}

/// Rolling SHA1 over fixed-size pieces of a concatenated stream
struct PieceHasher {
    piece_length: usize,
    buffer: Vec<u8>,
    hashes: Vec<u8>,
}

impl PieceHasher {
    fn new(piece_length: usize) -> Self {
        Self {
            piece_length,
            buffer: Vec::with_capacity(piece_length),
            hashes: Vec::new(),
        }
    }

    fn update(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let take = (self.piece_length - self.buffer.len()).min(data.len());
            self.buffer.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.buffer.len() == self.piece_length {
                self.hashes.extend_from_slice(&Sha1::digest(&self.buffer));
                self.buffer.clear();
            }
        }
    }

    fn finish(mut self) -> Vec<u8> {
        if !self.buffer.is_empty() {
            self.hashes.extend_from_slice(&Sha1::digest(&self.buffer));
        }
        self.hashes
    }
}

/// Hash every content file in `dir` and encode a multi-file descriptor.
///
/// Blocking: reads all content. Run it on a blocking thread.
pub fn create_descriptor(
    dir: &Path,
    announce: &[String],
    piece_length: u64,
) -> Result<Vec<u8>, BundleError> {
    if piece_length == 0 {
        return Err(BundleError::InvalidStructure("piece length must be positive"));
    }
    let primary = announce
        .first()
        .ok_or_else(|| BundleError::InvalidAnnounce("no announce endpoint configured".into()))?;
    for endpoint in announce {
        Url::parse(endpoint).map_err(|e| BundleError::InvalidAnnounce(format!("{}: {}", endpoint, e)))?;
    }

    let name = dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or(BundleError::InvalidStructure("content root has no name"))?;

    let files = content_files(dir)?;
    if files.is_empty() {
        return Err(BundleError::EmptyContent(dir.to_path_buf()));
    }

    let mut hasher = PieceHasher::new(piece_length as usize);
    let mut buffer = vec![0u8; 64 * 1024];
    let mut entries = Vec::with_capacity(files.len());

    for (file_name, _) in &files {
        let mut file = std::fs::File::open(dir.join(file_name))?;
        let mut length = 0u64;
        loop {
            let n = file.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
            length += n as u64;
        }
        // Lengths come from what was actually hashed, not the earlier stat
        entries.push(
            DictBuilder::new()
                .insert("length", Value::Int(length as i64))
                .insert("path", Value::List(vec![Value::str(file_name)]))
                .build(),
        );
    }

    let info = DictBuilder::new()
        .insert("name", Value::str(&name))
        .insert("piece length", Value::Int(piece_length as i64))
        .insert("pieces", Value::Bytes(hasher.finish()))
        .insert("files", Value::List(entries))
        .build();

    let mut root = DictBuilder::new()
        .insert("announce", Value::str(primary))
        .insert("created by", Value::str(CREATED_BY))
        .insert("creation date", Value::Int(unix_now()))
        .insert("info", info);
    if announce.len() > 1 {
        let tiers = announce
            .iter()
            .map(|url| Value::List(vec![Value::str(url)]))
            .collect();
        root = root.insert("announce-list", Value::List(tiers));
    }

    Ok(root.build().encode())
}

fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
