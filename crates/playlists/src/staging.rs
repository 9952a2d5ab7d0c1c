//! Content staging
//!
//! Materializes a playlist's files into its content root so they can be
//! bundled. Staging never overwrites or deletes anything already staged.

use crate::error::{Error, Result};
use crate::layout::{staged_file_name, Layout};
use bridge::PlaylistEntity;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

/// How a staged file came to exist
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagedVia {
    /// Already present from an earlier run
    Existing,
    HardLink,
    Copy,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StagedFile {
    pub title: String,
    /// File name inside the content root
    pub name: String,
    pub via: StagedVia,
}

#[derive(Debug)]
pub struct StagingFailure {
    pub title: String,
    pub error: Error,
}

#[derive(Debug)]
pub struct StagingReport {
    pub directory: PathBuf,
    /// Parallel to the playlist's tracks; `None` where staging failed
    pub track_files: Vec<Option<String>>,
    pub staged: Vec<StagedFile>,
    pub failed: Vec<StagingFailure>,
    /// Staged name of the playlist cover, if it has one and it was staged
    pub cover_file: Option<String>,
}

/// Creates `target` as a hard link to `source`
type LinkFn = fn(&Path, &Path) -> std::io::Result<()>;

#[derive(Debug, Clone)]
pub struct ContentStager {
    layout: Layout,
    link: LinkFn,
}

impl ContentStager {
    pub fn new(layout: Layout) -> Self {
        Self {
            layout,
            link: |source, target| std::fs::hard_link(source, target),
        }
    }

    #[cfg(test)]
    fn with_link(mut self, link: LinkFn) -> Self {
        self.link = link;
        self
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Stage every track (and the cover) of `playlist`. Missing or unreadable
    /// sources are recorded in the report and skipped.
    pub async fn stage(&self, playlist: &PlaylistEntity) -> Result<StagingReport> {
        let directory = self.layout.staging_dir(playlist);
        fs::create_dir_all(&directory).await?;

        let mut report = StagingReport {
            directory: directory.clone(),
            track_files: Vec::with_capacity(playlist.tracks.len()),
            staged: Vec::new(),
            failed: Vec::new(),
            cover_file: None,
        };

        for track in &playlist.tracks {
            let name = staged_file_name(&track.title, &track.file_path);
            match ensure_staged(self.link, &track.file_path, &directory.join(&name)).await {
                Ok(via) => {
                    report.track_files.push(Some(name.clone()));
                    report.staged.push(StagedFile {
                        title: track.title.clone(),
                        name,
                        via,
                    });
                }
                Err(reason) => {
                    let error = Error::StagingIo {
                        source_path: track.file_path.clone(),
                        reason,
                    };
                    warn!("Skipping track '{}': {}", track.title, error);
                    report.track_files.push(None);
                    report.failed.push(StagingFailure {
                        title: track.title.clone(),
                        error,
                    });
                }
            }
        }

        if let Some(cover) = &playlist.cover_image_path {
            let stem = cover
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "cover".to_string());
            let name = staged_file_name(&stem, cover);
            match ensure_staged(self.link, cover, &directory.join(&name)).await {
                Ok(_) => report.cover_file = Some(name),
                Err(e) => warn!("Skipping cover {}: {}", cover.display(), e),
            }
        }

        info!(
            "Staged {}/{} tracks for '{}' in {}",
            report.staged.len(),
            playlist.tracks.len(),
            playlist.name,
            directory.display()
        );
        Ok(report)
    }
}

/// Make sure `target` exists, linking or copying from `source` if needed
async fn ensure_staged(link: LinkFn, source: &Path, target: &Path) -> std::io::Result<StagedVia> {
    if fs::try_exists(target).await? {
        return Ok(StagedVia::Existing);
    }
    if !fs::metadata(source).await?.is_file() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "source is not a regular file",
        ));
    }

    let (from, to) = (source.to_path_buf(), target.to_path_buf());
    let linked = tokio::task::spawn_blocking(move || link(&from, &to))
        .await
        .map_err(std::io::Error::other)?;
    match linked {
        Ok(()) => Ok(StagedVia::HardLink),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(StagedVia::Existing),
        Err(e) => {
            // Cross-device or unsupported by the filesystem
            debug!("Hard link {} failed ({}), copying", source.display(), e);
            fs::copy(source, target).await?;
            Ok(StagedVia::Copy)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge::TrackEntity;
    use std::collections::BTreeSet;

    fn names(dir: &Path) -> BTreeSet<String> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect()
    }

    #[tokio::test]
    async fn test_stage_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let music = tmp.path().join("music");
        std::fs::create_dir(&music).unwrap();
        std::fs::write(music.join("one.mp3"), b"first").unwrap();
        std::fs::write(music.join("two.ogg"), b"second").unwrap();

        let mut playlist = PlaylistEntity::new("Road Trip", "");
        playlist.tracks.push(TrackEntity::new("One!", music.join("one.mp3")));
        playlist.tracks.push(TrackEntity::new("Two", music.join("two.ogg")));

        let stager = ContentStager::new(Layout::new(tmp.path().join("data")));
        let first = stager.stage(&playlist).await.unwrap();
        assert!(first.failed.is_empty());
        assert!(first.staged.iter().all(|f| f.via != StagedVia::Existing));
        let before = names(&first.directory);
        assert_eq!(before, BTreeSet::from(["One_.mp3".to_string(), "Two.ogg".to_string()]));

        let second = stager.stage(&playlist).await.unwrap();
        assert!(second.staged.iter().all(|f| f.via == StagedVia::Existing));
        assert_eq!(names(&second.directory), before);
        assert_eq!(second.track_files, first.track_files);
    }

    #[tokio::test]
    async fn test_missing_source_is_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let present = tmp.path().join("here.flac");
        std::fs::write(&present, b"data").unwrap();

        let mut playlist = PlaylistEntity::new("Mix", "");
        playlist.tracks.push(TrackEntity::new("gone", tmp.path().join("gone.flac")));
        playlist.tracks.push(TrackEntity::new("here", &present));

        let stager = ContentStager::new(Layout::new(tmp.path().join("data")));
        let report = stager.stage(&playlist).await.unwrap();
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].title, "gone");
        assert!(matches!(report.failed[0].error, Error::StagingIo { .. }));
        assert_eq!(report.track_files, vec![None, Some("here.flac".to_string())]);
    }

    #[tokio::test]
    async fn test_existing_staged_file_is_not_overwritten() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("a.mp3");
        std::fs::write(&source, b"new bytes").unwrap();
        let mut playlist = PlaylistEntity::new("Mix", "");
        playlist.tracks.push(TrackEntity::new("a", &source));

        let stager = ContentStager::new(Layout::new(tmp.path().join("data")));
        let dir = stager.layout().staging_dir(&playlist);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("a.mp3"), b"old bytes").unwrap();

        stager.stage(&playlist).await.unwrap();
        assert_eq!(std::fs::read(dir.join("a.mp3")).unwrap(), b"old bytes");
    }

    #[tokio::test]
    async fn test_cover_is_staged() {
        let tmp = tempfile::tempdir().unwrap();
        let cover = tmp.path().join("my cover.png");
        std::fs::write(&cover, b"png").unwrap();
        let mut playlist = PlaylistEntity::new("Mix", "");
        playlist.cover_image_path = Some(cover);

        let stager = ContentStager::new(Layout::new(tmp.path().join("data")));
        let report = stager.stage(&playlist).await.unwrap();
        assert_eq!(report.cover_file.as_deref(), Some("my_cover.png"));
        assert!(report.directory.join("my_cover.png").exists());
    }

    #[tokio::test]
    async fn test_failed_link_falls_back_to_copy() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("a.mp3");
        std::fs::write(&source, b"track bytes").unwrap();
        let mut playlist = PlaylistEntity::new("Mix", "");
        playlist.tracks.push(TrackEntity::new("a", &source));

        let stager = ContentStager::new(Layout::new(tmp.path().join("data"))).with_link(|_, _| {
            Err(std::io::Error::new(std::io::ErrorKind::Unsupported, "other volume"))
        });
        let report = stager.stage(&playlist).await.unwrap();
        assert_eq!(report.staged[0].via, StagedVia::Copy);
        let staged = report.directory.join("a.mp3");
        assert_eq!(std::fs::read(&staged).unwrap(), b"track bytes");

        // A copy, not a second name for the source
        std::fs::write(&source, b"edited").unwrap();
        assert_eq!(std::fs::read(&staged).unwrap(), b"track bytes");
    }

    #[tokio::test]
    async fn test_link_is_preferred() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("a.mp3");
        std::fs::write(&source, b"track bytes").unwrap();
        let mut playlist = PlaylistEntity::new("Mix", "");
        playlist.tracks.push(TrackEntity::new("a", &source));

        let report = ContentStager::new(Layout::new(tmp.path().join("data")))
            .stage(&playlist)
            .await
            .unwrap();
        assert_eq!(report.staged[0].via, StagedVia::HardLink);
    }
}
