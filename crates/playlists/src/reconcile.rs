//! Merge creator-authored sidecar metadata into a local playlist record

use crate::layout::Layout;
use crate::sidecar::{base_name, Sidecar};
use bridge::PlaylistEntity;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct Reconciliation {
    pub playlist: PlaylistEntity,
    /// Whether any field differs from the input; persist only when set
    pub changed: bool,
}

#[derive(Debug, Clone)]
pub struct MetadataReconciler {
    layout: Layout,
}

impl MetadataReconciler {
    pub fn new(layout: Layout) -> Self {
        Self { layout }
    }

    /// Read-only with respect to the sidecar. A missing or unreadable sidecar
    /// returns the playlist unchanged.
    pub fn reconcile(&self, playlist: &PlaylistEntity) -> Reconciliation {
        let unchanged = || Reconciliation {
            playlist: playlist.clone(),
            changed: false,
        };

        let path = self.layout.sidecar_path(playlist);
        let sidecar = match Sidecar::read(&path) {
            Ok(Some(sidecar)) => sidecar,
            Ok(None) => return unchanged(),
            Err(e) => {
                warn!("Ignoring sidecar for '{}': {}", playlist.name, e);
                return unchanged();
            }
        };

        let staging_dir = self.layout.staging_dir(playlist);
        let mut updated = playlist.clone();

        if updated.tracks.is_empty() {
            updated.tracks = sidecar
                .tracks
                .iter()
                .map(|t| t.localize(&staging_dir))
                .collect();
        } else {
            for track in &mut updated.tracks {
                let Some(remote) = sidecar.tracks.iter().find(|t| t.title == track.title) else {
                    continue;
                };
                // Copied as-is: a creator who cleared a field clears it here
                if remote.artist != track.artist {
                    track.artist = remote.artist.clone();
                }
                if remote.album != track.album {
                    track.album = remote.album.clone();
                }
            }
        }

        if let Some(cover) = sidecar.cover_image_path.as_deref().and_then(base_name) {
            let local = staging_dir.join(cover);
            if local.is_file() {
                updated.cover_image_path = Some(local);
            }
        }

        if updated.author.is_none() && sidecar.author.is_some() {
            updated.author = sidecar.author.clone();
        }

        let changed = updated != *playlist;
        if changed {
            debug!("Sidecar updated metadata for '{}'", playlist.name);
        }
        Reconciliation {
            playlist: updated,
            changed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sidecar::SidecarTrack;
    use bridge::TrackEntity;
    use std::path::Path;

    fn write_sidecar(layout: &Layout, playlist: &PlaylistEntity, sidecar: &Sidecar) {
        std::fs::create_dir_all(layout.staging_dir(playlist)).unwrap();
        sidecar.write(&layout.sidecar_path(playlist)).unwrap();
    }

    fn remote_track(title: &str, path: &str, artist: &str) -> SidecarTrack {
        SidecarTrack {
            title: title.into(),
            file_path: Some(path.into()),
            artist: Some(artist.into()),
            album: Some("Remote Album".into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_no_sidecar_is_unchanged() {
        let tmp = tempfile::tempdir().unwrap();
        let reconciler = MetadataReconciler::new(Layout::new(tmp.path()));
        let playlist = PlaylistEntity::new("Mix", "");
        let result = reconciler.reconcile(&playlist);
        assert!(!result.changed);
        assert_eq!(result.playlist, playlist);
    }

    #[test]
    fn test_imported_playlist_adopts_tracks() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = Layout::new(tmp.path());
        let reconciler = MetadataReconciler::new(layout.clone());
        let playlist = PlaylistEntity::new("Imported", "");
        let sidecar = Sidecar {
            tracks: vec![remote_track("Song A", "/creator/machine/Song A.mp3", "Ann")],
            ..Default::default()
        };
        write_sidecar(&layout, &playlist, &sidecar);

        let first = reconciler.reconcile(&playlist);
        assert!(first.changed);
        assert_eq!(first.playlist.tracks.len(), 1);
        assert_eq!(
            first.playlist.tracks[0].file_path,
            layout.staging_dir(&playlist).join("Song A.mp3")
        );
        assert_eq!(first.playlist.tracks[0].artist.as_deref(), Some("Ann"));

        let second = reconciler.reconcile(&first.playlist);
        assert!(!second.changed);
        assert_eq!(second.playlist, first.playlist);
    }

    #[test]
    fn test_merge_by_title_only_touches_matches() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = Layout::new(tmp.path());
        let reconciler = MetadataReconciler::new(layout.clone());
        let mut playlist = PlaylistEntity::new("Mix", "");
        playlist.tracks.push(TrackEntity::new("Song A", "/local/a.mp3"));
        playlist.tracks.push(TrackEntity::new("Song B", "/local/b.mp3"));
        let sidecar = Sidecar {
            tracks: vec![
                remote_track("Song A", "a.mp3", "Ann"),
                remote_track("Song C", "c.mp3", "Cid"),
            ],
            ..Default::default()
        };
        write_sidecar(&layout, &playlist, &sidecar);

        let result = reconciler.reconcile(&playlist);
        assert!(result.changed);
        let tracks = &result.playlist.tracks;
        assert_eq!(tracks.len(), 2);
        assert_eq!(tracks[0].artist.as_deref(), Some("Ann"));
        assert_eq!(tracks[0].album.as_deref(), Some("Remote Album"));
        assert_eq!(tracks[0].file_path, Path::new("/local/a.mp3"));
        assert_eq!(tracks[1], playlist.tracks[1]);
    }

    #[test]
    fn test_cleared_sidecar_fields_clear_local_ones() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = Layout::new(tmp.path());
        let reconciler = MetadataReconciler::new(layout.clone());
        let mut playlist = PlaylistEntity::new("Mix", "");
        let mut local = TrackEntity::new("Song A", "/local/a.mp3");
        local.artist = Some("Guess".into());
        local.album = Some("Remote Album".into());
        playlist.tracks.push(local);
        let mut remote = remote_track("Song A", "a.mp3", "unused");
        remote.artist = None;
        let sidecar = Sidecar {
            tracks: vec![remote],
            ..Default::default()
        };
        write_sidecar(&layout, &playlist, &sidecar);

        let result = reconciler.reconcile(&playlist);
        assert!(result.changed);
        assert_eq!(result.playlist.tracks[0].artist, None);
        assert_eq!(result.playlist.tracks[0].album.as_deref(), Some("Remote Album"));
        assert!(!reconciler.reconcile(&result.playlist).changed);
    }

    #[test]
    fn test_cover_and_author() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = Layout::new(tmp.path());
        let reconciler = MetadataReconciler::new(layout.clone());
        let playlist = PlaylistEntity::new("Mix", "");
        let sidecar = Sidecar {
            author: Some("dj".into()),
            cover_image_path: Some(r"C:\art\cover.png".into()),
            ..Default::default()
        };
        write_sidecar(&layout, &playlist, &sidecar);

        // Cover not transferred yet: only the author is adopted
        let first = reconciler.reconcile(&playlist);
        assert!(first.changed);
        assert_eq!(first.playlist.author.as_deref(), Some("dj"));
        assert_eq!(first.playlist.cover_image_path, None);

        let cover = layout.staging_dir(&playlist).join("cover.png");
        std::fs::write(&cover, b"png").unwrap();
        let second = reconciler.reconcile(&first.playlist);
        assert!(second.changed);
        assert_eq!(second.playlist.cover_image_path, Some(cover));

        // A local author is never replaced
        let mut own = second.playlist.clone();
        own.author = Some("me".into());
        let third = reconciler.reconcile(&own);
        assert!(!third.changed);
        assert_eq!(third.playlist.author.as_deref(), Some("me"));
    }

    #[test]
    fn test_malformed_sidecar_is_ignored() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = Layout::new(tmp.path());
        let reconciler = MetadataReconciler::new(layout.clone());
        let playlist = PlaylistEntity::new("Mix", "");
        std::fs::create_dir_all(layout.staging_dir(&playlist)).unwrap();
        std::fs::write(layout.sidecar_path(&playlist), b"{\"tracks\": [{\"tit").unwrap();

        let result = reconciler.reconcile(&playlist);
        assert!(!result.changed);
        assert_eq!(result.playlist, playlist);
    }
}
