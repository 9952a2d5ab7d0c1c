//! Playlist flows: create, import, play, retention toggles and delete
//!
//! Composes the store, stager, builder, sessions, reconciler and policy.
//! Every mutation goes through the store before sessions are touched, so a
//! crash leaves at worst a stopped session for a persisted playlist, which
//! the next policy pass restarts.

use crate::bundle::BundleBuilder;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::layout::Layout;
use crate::policy::{PolicyReport, SeedingPolicy};
use crate::reconcile::MetadataReconciler;
use crate::session::{SessionManager, StartOutcome};
use crate::sidecar::Sidecar;
use crate::staging::ContentStager;
use crate::store::PlaylistStore;
use bridge::{PlaylistEntity, PlaylistStatus, StatusSnapshot, TrackEntity, TransferState};
use chrono::{DateTime, Utc};
use engine::{BundleDescriptor, TransferEngine};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

pub struct PlaylistService {
    layout: Layout,
    store: Arc<dyn PlaylistStore>,
    stager: ContentStager,
    builder: BundleBuilder,
    reconciler: MetadataReconciler,
    sessions: SessionManager,
}

impl PlaylistService {
    pub fn new(config: &Config, engine: Arc<dyn TransferEngine>, store: Arc<dyn PlaylistStore>) -> Self {
        let layout = Layout::new(&config.data_root);
        Self::with_sessions(config, SessionManager::new(engine, layout), store)
    }

    /// A service that only edits the store. Session starts come back as
    /// `StartOutcome::Deferred` and are left to the serving process.
    pub fn detached(config: &Config, store: Arc<dyn PlaylistStore>) -> Self {
        let layout = Layout::new(&config.data_root);
        Self::with_sessions(config, SessionManager::detached(layout), store)
    }

    fn with_sessions(config: &Config, sessions: SessionManager, store: Arc<dyn PlaylistStore>) -> Self {
        let layout = Layout::new(&config.data_root);
        Self {
            stager: ContentStager::new(layout.clone()),
            builder: BundleBuilder::new(layout.clone(), config.announce_urls.clone(), config.piece_length),
            reconciler: MetadataReconciler::new(layout.clone()),
            sessions,
            layout,
            store,
        }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub async fn playlists(&self) -> Result<Vec<PlaylistEntity>> {
        self.store.get_all().await
    }

    pub async fn playlist(&self, id: &str) -> Result<PlaylistEntity> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| Error::PlaylistNotFound(id.to_string()))
    }

    /// Stage `files`, write the sidecar, build the bundle, persist and start
    /// seeding. Nothing is persisted unless the bundle was built.
    pub async fn create_playlist(&self, name: &str, description: &str, files: &[PathBuf]) -> Result<PlaylistEntity> {
        let mut playlist = PlaylistEntity::new(name, description);
        for file in files {
            let title = file
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| file.display().to_string());
            let mut track = TrackEntity::new(title, file);
            track.size_bytes = tokio::fs::metadata(file).await.map(|m| m.len()).unwrap_or(0);
            playlist.tracks.push(track);
        }

        let report = self.stager.stage(&playlist).await?;
        if report.staged.is_empty() {
            return Err(Error::EmptyContent(report.directory));
        }

        let sidecar = Sidecar::for_playlist(&playlist, &report.track_files, report.cover_file.clone());
        let sidecar_path = self.layout.sidecar_path(&playlist);
        tokio::task::spawn_blocking(move || sidecar.write(&sidecar_path))
            .await
            .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))??;

        let built = self.builder.build(&playlist, &report.directory).await?;
        playlist.attach_bundle(built.path, built.fingerprint);
        self.store.save(&playlist).await?;
        info!("Created playlist '{}' with {} tracks", playlist.name, playlist.tracks.len());

        self.seed_logged(&playlist);
        Ok(playlist)
    }

    /// Adopt a bundle received from another peer. Tracks arrive later through
    /// the sidecar once the content is transferred.
    pub async fn import_bundle(&self, descriptor_path: &Path) -> Result<PlaylistEntity> {
        let bytes = tokio::fs::read(descriptor_path).await?;
        let descriptor = BundleDescriptor::from_bytes(&bytes)?;

        let name = descriptor_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| descriptor.name.clone());
        let file_name = descriptor_path
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut playlist = PlaylistEntity::new(name, format!("Imported from {}", file_name));

        let target = self.layout.bundle_path(&playlist.id);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, &bytes).await?;
        playlist.attach_bundle(target, descriptor.fingerprint());
        self.store.save(&playlist).await?;
        info!(
            "Imported bundle {} as '{}'",
            descriptor.fingerprint(),
            playlist.name
        );

        self.seed_logged(&playlist);
        Ok(playlist)
    }

    /// Start a session for listening and mark the playlist as played. Local
    /// content is seeded; anything else is streamed in order.
    pub async fn play(&self, id: &str) -> Result<StartOutcome> {
        let playlist = self.playlist(id).await?;
        let local = match playlist.first_track_path() {
            Some(path) => tokio::fs::try_exists(path).await.unwrap_or(false),
            None => false,
        };

        let playlist = self.touch(id, Utc::now()).await?;

        info!("Playing '{}' ({})", playlist.name, if local { "local" } else { "remote" });
        if local {
            self.sessions.start_seeding(&playlist)
        } else {
            self.sessions.start_streaming(&playlist)
        }
    }

    pub async fn update_last_played(&self, id: &str, now: DateTime<Utc>) -> Result<()> {
        let playlist = self.touch(id, now).await?;
        if self.sessions.status_of(id).state == TransferState::Stopped {
            self.seed_logged(&playlist);
        }
        Ok(())
    }

    pub async fn set_permanent_seeding(&self, id: &str, permanent: bool) -> Result<PolicyReport> {
        let playlist = self
            .store
            .update(id, Box::new(move |p: &mut PlaylistEntity| p.permanently_seeded = permanent))
            .await?
            .ok_or_else(|| Error::PlaylistNotFound(id.to_string()))?;
        info!("Permanent seeding for '{}' set to {}", playlist.name, permanent);
        self.enforce_policy().await
    }

    async fn touch(&self, id: &str, now: DateTime<Utc>) -> Result<PlaylistEntity> {
        self.store
            .update(id, Box::new(move |p: &mut PlaylistEntity| p.last_played_at = now))
            .await?
            .ok_or_else(|| Error::PlaylistNotFound(id.to_string()))
    }

    /// `None` when the playlist is unknown
    pub async fn restart_seeding(&self, id: &str) -> Result<Option<StartOutcome>> {
        match self.store.get(id).await? {
            Some(playlist) => self.sessions.start_seeding(&playlist).map(Some),
            None => {
                warn!("Cannot restart seeding for unknown playlist {}", id);
                Ok(None)
            }
        }
    }

    pub async fn export_bundle(&self, id: &str, destination: &Path) -> Result<()> {
        let playlist = self.playlist(id).await?;
        let source = playlist.bundle_ref.ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("playlist {} has no bundle", id),
            ))
        })?;
        tokio::fs::copy(&source, destination).await?;
        info!("Exported '{}' to {}", playlist.name, destination.display());
        Ok(())
    }

    /// Upsert. An attached bundle is never replaced or detached.
    pub async fn update_playlist(&self, playlist: &PlaylistEntity) -> Result<()> {
        let next = playlist.clone();
        let replaced = self
            .store
            .update(
                &playlist.id,
                Box::new(move |stored: &mut PlaylistEntity| {
                    let bundle = stored.bundle_ref.take().map(|r| (r, stored.bundle_fingerprint.take()));
                    *stored = next;
                    if let Some((bundle_ref, fingerprint)) = bundle {
                        stored.bundle_ref = Some(bundle_ref);
                        stored.bundle_fingerprint = fingerprint;
                    }
                }),
            )
            .await?;
        if replaced.is_none() {
            self.store.save(playlist).await?;
        }
        Ok(())
    }

    /// Stops the session before the record goes away
    pub async fn delete_playlist(&self, id: &str) -> Result<()> {
        self.sessions.stop(id);
        self.store.delete(id).await?;
        info!("Deleted playlist {}", id);
        Ok(())
    }

    /// Reconcile one playlist with its sidecar; returns whether it changed
    pub async fn refresh_metadata(&self, id: &str) -> Result<bool> {
        let playlist = self.playlist(id).await?;
        Ok(self.refresh(vec![playlist]).await? == 1)
    }

    /// Reconcile every playlist; returns how many changed
    pub async fn refresh_all_metadata(&self) -> Result<usize> {
        let playlists = self.store.get_all().await?;
        self.refresh(playlists).await
    }

    async fn refresh(&self, playlists: Vec<PlaylistEntity>) -> Result<usize> {
        let reconciler = self.reconciler.clone();
        let results = tokio::task::spawn_blocking(move || {
            playlists
                .iter()
                .map(|p| reconciler.reconcile(p))
                .collect::<Vec<_>>()
        })
        .await
        .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;

        // Only the sidecar-owned fields are written back, onto the current
        // record, so edits made while reconciling survive.
        let mut changed = 0;
        for result in results.into_iter().filter(|r| r.changed) {
            let reconciled = result.playlist;
            let id = reconciled.id.clone();
            let merged = self
                .store
                .update(
                    &id,
                    Box::new(move |stored: &mut PlaylistEntity| {
                        stored.tracks = reconciled.tracks;
                        stored.cover_image_path = reconciled.cover_image_path;
                        stored.author = reconciled.author;
                    }),
                )
                .await?;
            if let Some(playlist) = merged {
                info!("Updated metadata for '{}'", playlist.name);
                changed += 1;
            }
        }
        Ok(changed)
    }

    pub async fn enforce_policy(&self) -> Result<PolicyReport> {
        self.enforce_policy_at(Utc::now()).await
    }

    pub async fn enforce_policy_at(&self, now: DateTime<Utc>) -> Result<PolicyReport> {
        let playlists = self.store.get_all().await?;
        Ok(SeedingPolicy::new(&self.sessions).enforce(&playlists, now))
    }

    pub fn status(&self, id: &str) -> StatusSnapshot {
        self.sessions.status_of(id)
    }

    pub async fn statuses(&self) -> Result<Vec<PlaylistStatus>> {
        Ok(self
            .store
            .get_all()
            .await?
            .into_iter()
            .map(|p| PlaylistStatus {
                status: self.sessions.status_of(&p.id),
                id: p.id,
                name: p.name,
            })
            .collect())
    }

    pub fn shutdown(&self) {
        self.sessions.stop_all();
    }

    /// Seeding failures are left to the next policy pass
    fn seed_logged(&self, playlist: &PlaylistEntity) {
        if let Err(e) = self.sessions.start_seeding(playlist) {
            warn!("Could not start seeding '{}': {}", playlist.name, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::{bundled_playlist, settle, FakeEngine};
    use crate::store::MemoryStore;
    use bridge::PieceStrategy;
    use chrono::Duration;

    struct Fixture {
        _tmp: tempfile::TempDir,
        music: PathBuf,
        engine: Arc<FakeEngine>,
        store: Arc<MemoryStore>,
        service: PlaylistService,
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let music = tmp.path().join("music");
        std::fs::create_dir(&music).unwrap();
        let config = Config {
            data_root: tmp.path().join("data"),
            piece_length: 1024,
            ..Default::default()
        };
        let engine = Arc::new(FakeEngine::default());
        let store = Arc::new(MemoryStore::new());
        let service = PlaylistService::new(&config, engine.clone(), store.clone());
        Fixture {
            _tmp: tmp,
            music,
            engine,
            store,
            service,
        }
    }

    fn song(dir: &Path, name: &str, len: usize) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, vec![7u8; len]).unwrap();
        path
    }

    #[tokio::test]
    async fn test_create_playlist() {
        let f = fixture();
        let files = vec![song(&f.music, "Song A.mp3", 3000), song(&f.music, "b-side.ogg", 500)];
        let playlist = f.service.create_playlist("Road Trip", "summer", &files).await.unwrap();

        assert_eq!(playlist.tracks[0].title, "Song A");
        assert_eq!(playlist.tracks[0].size_bytes, 3000);
        let bundle = playlist.bundle_ref.clone().unwrap();
        assert_eq!(bundle, f.service.layout().bundle_path(&playlist.id));

        let descriptor = BundleDescriptor::read(&bundle).unwrap();
        assert_eq!(playlist.bundle_fingerprint, Some(descriptor.fingerprint()));
        let names: Vec<_> = descriptor.files.iter().map(|f| f.path.clone()).collect();
        assert_eq!(names.len(), 3);
        assert!(names.iter().any(|p| p.ends_with("metadata.json")));

        let sidecar = Sidecar::read(&f.service.layout().sidecar_path(&playlist)).unwrap().unwrap();
        assert_eq!(sidecar.tracks[0].file_path.as_deref(), Some("Song_A.mp3"));

        assert_eq!(f.store.get_all().await.unwrap(), vec![playlist.clone()]);
        assert_eq!(f.service.sessions().strategy_of(&playlist.id), Some(PieceStrategy::RarestFirst));
    }

    #[tokio::test]
    async fn test_create_without_content_saves_nothing() {
        let f = fixture();
        let err = f
            .service
            .create_playlist("Ghost", "", &[f.music.join("missing.mp3")])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::EmptyContent(_)));
        assert!(f.store.get_all().await.unwrap().is_empty());
        assert!(f.engine.built().is_empty());
    }

    #[tokio::test]
    async fn test_delete_active_playlist() {
        let f = fixture();
        let files = vec![song(&f.music, "a.mp3", 100)];
        let playlist = f.service.create_playlist("Mix", "", &files).await.unwrap();
        assert!(f.service.sessions().is_active(&playlist.id));

        f.service.delete_playlist(&playlist.id).await.unwrap();
        assert!(!f.service.sessions().is_active(&playlist.id));
        assert!(f.store.get_all().await.unwrap().is_empty());
        assert_eq!(f.engine.live(), 0);
        assert_eq!(f.service.status(&playlist.id), StatusSnapshot::stopped());
    }

    #[tokio::test]
    async fn test_import_then_reconcile() {
        let creator = fixture();
        let files = vec![song(&creator.music, "Song A.mp3", 2000), song(&creator.music, "Song B.mp3", 10)];
        let original = creator.service.create_playlist("Shared", "", &files).await.unwrap();
        let exported = creator.music.join("Shared Mix.bundle");
        creator.service.export_bundle(&original.id, &exported).await.unwrap();

        let leecher = fixture();
        let imported = leecher.service.import_bundle(&exported).await.unwrap();
        assert_eq!(imported.name, "Shared Mix");
        assert_eq!(imported.description, "Imported from Shared Mix.bundle");
        assert_eq!(imported.bundle_fingerprint, original.bundle_fingerprint);
        assert_eq!(imported.bundle_ref, Some(leecher.service.layout().bundle_path(&imported.id)));
        assert!(imported.tracks.is_empty());
        assert_eq!(leecher.engine.last().content_root, leecher.service.layout().staging_dir(&imported));

        // Nothing transferred yet
        assert!(!leecher.service.refresh_metadata(&imported.id).await.unwrap());

        // Simulate the transfer completing
        let from = creator.service.layout().staging_dir(&original);
        let to = leecher.service.layout().staging_dir(&imported);
        std::fs::create_dir_all(&to).unwrap();
        for entry in std::fs::read_dir(&from).unwrap() {
            let entry = entry.unwrap();
            std::fs::copy(entry.path(), to.join(entry.file_name())).unwrap();
        }

        assert_eq!(leecher.service.refresh_all_metadata().await.unwrap(), 1);
        let refreshed = leecher.service.playlist(&imported.id).await.unwrap();
        let titles: Vec<_> = refreshed.tracks.iter().map(|t| t.title.as_str()).collect();
        assert_eq!(titles, ["Song A", "Song B"]);
        assert_eq!(refreshed.tracks[0].file_path, to.join("Song_A.mp3"));
        assert!(refreshed.tracks[0].file_path.exists());
        assert_eq!(leecher.service.refresh_all_metadata().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_import_malformed_bundle() {
        let f = fixture();
        let path = f.music.join("bad.bundle");
        std::fs::write(&path, b"d4:infoi3ee").unwrap();
        assert!(f.service.import_bundle(&path).await.is_err());
        assert!(f.store.get_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_play_picks_strategy_from_first_track() {
        let f = fixture();
        let mut local = bundled_playlist("Local");
        local.tracks.push(TrackEntity::new("a", song(&f.music, "a.mp3", 10)));
        let mut remote = bundled_playlist("Remote");
        remote.tracks.push(TrackEntity::new("b", f.music.join("not-here.mp3")));
        let stale = Utc::now() - Duration::days(30);
        local.last_played_at = stale;
        f.store.save(&local).await.unwrap();
        f.store.save(&remote).await.unwrap();

        assert_eq!(f.service.play(&local.id).await.unwrap(), StartOutcome::Started);
        assert_eq!(f.service.sessions().strategy_of(&local.id), Some(PieceStrategy::RarestFirst));
        assert!(f.service.playlist(&local.id).await.unwrap().last_played_at > stale);

        f.service.play(&remote.id).await.unwrap();
        assert_eq!(f.service.sessions().strategy_of(&remote.id), Some(PieceStrategy::Sequential));

        assert!(matches!(f.service.play("nope").await, Err(Error::PlaylistNotFound(_))));
    }

    #[tokio::test]
    async fn test_permanent_toggle_runs_policy() {
        let f = fixture();
        let mut p = bundled_playlist("Old");
        p.last_played_at = Utc::now() - Duration::days(10);
        f.store.save(&p).await.unwrap();

        let report = f.service.set_permanent_seeding(&p.id, true).await.unwrap();
        assert_eq!(report.started, vec![p.id.clone()]);
        assert!(f.service.playlist(&p.id).await.unwrap().permanently_seeded);

        let report = f.service.set_permanent_seeding(&p.id, false).await.unwrap();
        assert_eq!(report.stopped, vec![p.id.clone()]);
        assert!(!f.service.sessions().is_active(&p.id));
    }

    #[tokio::test]
    async fn test_update_last_played_starts_seeding() {
        let f = fixture();
        let mut p = bundled_playlist("Old");
        p.last_played_at = Utc::now() - Duration::days(10);
        f.store.save(&p).await.unwrap();
        assert!(f.service.enforce_policy().await.unwrap().is_empty());

        let now = Utc::now();
        f.service.update_last_played(&p.id, now).await.unwrap();
        assert_eq!(f.service.playlist(&p.id).await.unwrap().last_played_at, now);
        assert!(f.service.sessions().is_active(&p.id));
        settle().await;
        assert_eq!(f.service.statuses().await.unwrap()[0].status.state, TransferState::Initializing);
    }

    #[tokio::test]
    async fn test_restart_and_update() {
        let f = fixture();
        let p = bundled_playlist("Mix");
        f.store.save(&p).await.unwrap();
        assert_eq!(f.service.restart_seeding("unknown").await.unwrap(), None);
        assert_eq!(f.service.restart_seeding(&p.id).await.unwrap(), Some(StartOutcome::Started));
        assert_eq!(f.service.restart_seeding(&p.id).await.unwrap(), Some(StartOutcome::AlreadyActive));

        let mut edited = p.clone();
        edited.name = "Renamed".into();
        edited.bundle_ref = None;
        f.service.update_playlist(&edited).await.unwrap();
        let stored = f.service.playlist(&p.id).await.unwrap();
        assert_eq!(stored.name, "Renamed");
        assert_eq!(stored.bundle_ref, p.bundle_ref);
    }

    #[tokio::test]
    async fn test_export_unbuilt_playlist_fails() {
        let f = fixture();
        let p = PlaylistEntity::new("Draft", "");
        f.store.save(&p).await.unwrap();
        assert!(f.service.export_bundle(&p.id, &f.music.join("out.bundle")).await.is_err());
        assert!(matches!(
            f.service.export_bundle("nope", &f.music.join("out.bundle")).await,
            Err(Error::PlaylistNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_refresh_keeps_edits_made_while_reconciling() {
        let f = fixture();
        let mut p = bundled_playlist("Imported");
        p.last_played_at = Utc::now() - Duration::days(10);
        f.store.save(&p).await.unwrap();
        let sidecar = Sidecar {
            author: Some("dj".into()),
            ..Default::default()
        };
        std::fs::create_dir_all(f.service.layout().staging_dir(&p)).unwrap();
        sidecar.write(&f.service.layout().sidecar_path(&p)).unwrap();

        // Read before the play and the pin land
        let snapshot = f.store.get_all().await.unwrap();
        let now = Utc::now();
        f.service.update_last_played(&p.id, now).await.unwrap();
        f.service.set_permanent_seeding(&p.id, true).await.unwrap();

        assert_eq!(f.service.refresh(snapshot).await.unwrap(), 1);
        let stored = f.service.playlist(&p.id).await.unwrap();
        assert_eq!(stored.author.as_deref(), Some("dj"));
        assert_eq!(stored.last_played_at, now);
        assert!(stored.permanently_seeded);
        assert!(f.service.enforce_policy().await.unwrap().stopped.is_empty());
    }

    #[tokio::test]
    async fn test_detached_service_leaves_sessions_to_server() {
        let f = fixture();
        let config = Config {
            data_root: f.service.layout().root().to_path_buf(),
            ..Default::default()
        };
        let cli = PlaylistService::detached(&config, f.store.clone());
        let mut p = bundled_playlist("Old");
        p.last_played_at = Utc::now() - Duration::days(10);
        f.store.save(&p).await.unwrap();

        assert_eq!(cli.play(&p.id).await.unwrap(), StartOutcome::Deferred);
        assert!(cli.sessions().active_ids().is_empty());
        assert!(f.engine.built().is_empty());

        let report = f.service.enforce_policy().await.unwrap();
        assert_eq!(report.started, vec![p.id.clone()]);
        cli.shutdown();
        assert!(f.service.sessions().is_active(&p.id));
    }
}
