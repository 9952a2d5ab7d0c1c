//! `metadata.json`: creator-authored metadata travelling inside the bundle
//!
//! File paths recorded here are only meaningful as base names; readers never
//! trust the directory part.

use crate::error::{Error, Result};
use bridge::{PlaylistEntity, TrackEntity};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct SidecarTrack {
    pub title: String,
    pub file_path: Option<String>,
    pub duration_seconds: u64,
    pub size_bytes: u64,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub cover_image_path: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Sidecar {
    pub id: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub author: Option<String>,
    pub cover_image_path: Option<String>,
    pub tracks: Vec<SidecarTrack>,
}

impl Sidecar {
    /// Describe `playlist` using the staged file names in `staged`, which is
    /// parallel to `playlist.tracks`.
    pub fn for_playlist(playlist: &PlaylistEntity, staged: &[Option<String>], cover: Option<String>) -> Self {
        let tracks = playlist
            .tracks
            .iter()
            .zip(staged.iter().chain(std::iter::repeat(&None)))
            .map(|(track, staged_name)| SidecarTrack {
                title: track.title.clone(),
                file_path: staged_name.clone(),
                duration_seconds: track.duration_seconds,
                size_bytes: track.size_bytes,
                artist: track.artist.clone(),
                album: track.album.clone(),
                cover_image_path: None,
            })
            .collect();

        Self {
            id: Some(playlist.id.clone()),
            name: Some(playlist.name.clone()),
            description: Some(playlist.description.clone()),
            author: playlist.author.clone(),
            cover_image_path: cover,
            tracks,
        }
    }

    /// `Ok(None)` when the file has not arrived yet
    pub fn read(path: &Path) -> Result<Option<Self>> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|reason| Error::SidecarParse {
                path: path.to_path_buf(),
                reason,
            })
    }

    /// Write unless an identical sidecar is already there. Returns whether
    /// the file was written.
    pub fn write(&self, path: &Path) -> Result<bool> {
        let bytes = serde_json::to_vec_pretty(self)?;
        if std::fs::read(path).map(|old| old == bytes).unwrap_or(false) {
            return Ok(false);
        }
        std::fs::write(path, bytes)?;
        Ok(true)
    }
}

impl SidecarTrack {
    /// Local track pointing at `<content_root>/<base name>`
    pub fn localize(&self, content_root: &Path) -> TrackEntity {
        let name = self
            .file_path
            .as_deref()
            .and_then(base_name)
            .or_else(|| base_name(&self.title))
            .unwrap_or_else(|| PathBuf::from("untitled"));
        let file_path = content_root.join(name);
        TrackEntity {
            title: self.title.clone(),
            file_path,
            duration_seconds: self.duration_seconds,
            size_bytes: self.size_bytes,
            artist: self.artist.clone(),
            album: self.album.clone(),
            cover_image_path: None,
        }
    }
}

/// Last component of a path authored on another machine. Both separators
/// are honored since the creator may run a different OS.
pub fn base_name(recorded: &str) -> Option<PathBuf> {
    let name = recorded.rsplit(['/', '\\']).next()?;
    if name.is_empty() || name == "." || name == ".." {
        None
    } else {
        Some(PathBuf::from(name))
    }
}
