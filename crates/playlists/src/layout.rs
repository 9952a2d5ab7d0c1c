//! On-disk layout shared by every peer
//!
//! ```text
//! <data_root>/staging/<sanitized name>_<id>/   content root, sidecar at its top
//! <data_root>/bundles/<id>.bundle              bundle descriptor
//! <data_root>/playlists.json                   local playlist store
//! ```

use bridge::PlaylistEntity;
use std::path::{Path, PathBuf};

pub const SIDECAR_FILE: &str = "metadata.json";
pub const BUNDLE_EXTENSION: &str = "bundle";
const STORE_FILE: &str = "playlists.json";

#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn staging_root(&self) -> PathBuf {
        self.root.join("staging")
    }

    pub fn bundles_root(&self) -> PathBuf {
        self.root.join("bundles")
    }

    pub fn store_path(&self) -> PathBuf {
        self.root.join(STORE_FILE)
    }

    /// Content root for a playlist. Stable for the lifetime of the playlist.
    pub fn staging_dir(&self, playlist: &PlaylistEntity) -> PathBuf {
        self.staging_root()
            .join(staging_dir_name(&playlist.name, &playlist.id))
    }

    pub fn sidecar_path(&self, playlist: &PlaylistEntity) -> PathBuf {
        self.staging_dir(playlist).join(SIDECAR_FILE)
    }

    pub fn bundle_path(&self, playlist_id: &str) -> PathBuf {
        self.bundles_root()
            .join(format!("{}.{}", playlist_id, BUNDLE_EXTENSION))
    }
}

/// Whitespace runs collapse to a single `_`, then `_<id>` is appended
pub fn staging_dir_name(name: &str, id: &str) -> String {
    let mut out = String::with_capacity(name.len() + id.len() + 1);
    let mut in_space = false;
    for c in name.chars() {
        if matches!(c, ' ' | '\t' | '\n' | '\x0B' | '\x0C' | '\r') {
            if !in_space {
                out.push('_');
            }
            in_space = true;
        } else {
            out.push(c);
            in_space = false;
        }
    }
    out.push('_');
    out.push_str(id);
    out
}

/// Keep ASCII alphanumerics, `.` and `-`; everything else becomes `_`.
/// The source's extension is appended.
pub fn staged_file_name(title: &str, source: &Path) -> String {
    let mut name: String = title
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if let Some(ext) = source.extension() {
        name.push('.');
        name.push_str(&ext.to_string_lossy());
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_staging_dir_name() {
        assert_eq!(staging_dir_name("Road  Trip\tMix", "42"), "Road_Trip_Mix_42");
        assert_eq!(staging_dir_name(" x", "1"), "_x_1");
        assert_eq!(staging_dir_name("Déjà vu", "7"), "Déjà_vu_7");
    }

    #[test]
    fn test_staged_file_name() {
        assert_eq!(
            staged_file_name("Song A (live)", Path::new("/music/a b/Song A.mp3")),
            "Song_A__live_.mp3"
        );
        assert_eq!(staged_file_name("intro.v2", Path::new("/x/intro")), "intro.v2");
    }

    #[test]
    fn test_paths() {
        let layout = Layout::new("/data");
        let mut p = PlaylistEntity::new("Chill Out", "");
        p.id = "abc".into();
        assert_eq!(layout.staging_dir(&p), PathBuf::from("/data/staging/Chill_Out_abc"));
        assert_eq!(layout.sidecar_path(&p), PathBuf::from("/data/staging/Chill_Out_abc/metadata.json"));
        assert_eq!(layout.bundle_path("abc"), PathBuf::from("/data/bundles/abc.bundle"));
    }
}
