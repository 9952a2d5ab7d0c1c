//! Playlist persistence behind a key-by-id interface

use crate::error::{Error, Result};
use async_trait::async_trait;
use bridge::PlaylistEntity;
use parking_lot::Mutex;
use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// In-place edit applied by [`PlaylistStore::update`]
pub type Edit = Box<dyn FnOnce(&mut PlaylistEntity) + Send>;

#[async_trait]
pub trait PlaylistStore: Send + Sync {
    /// Every playlist, in insertion order
    async fn get_all(&self) -> Result<Vec<PlaylistEntity>>;
    /// Insert, or replace the playlist with the same id in place
    async fn save(&self, playlist: &PlaylistEntity) -> Result<()>;
    /// No-op for an unknown id
    async fn delete(&self, id: &str) -> Result<()>;
    /// Apply `edit` to the current record atomically. `None` for an unknown id.
    async fn update(&self, id: &str, edit: Edit) -> Result<Option<PlaylistEntity>>;

    async fn get(&self, id: &str) -> Result<Option<PlaylistEntity>> {
        Ok(self.get_all().await?.into_iter().find(|p| p.id == id))
    }
}

fn upsert(playlists: &mut Vec<PlaylistEntity>, playlist: &PlaylistEntity) {
    match playlists.iter_mut().find(|p| p.id == playlist.id) {
        Some(existing) => *existing = playlist.clone(),
        None => playlists.push(playlist.clone()),
    }
}

fn apply(playlists: &mut [PlaylistEntity], id: &str, edit: Edit) -> Option<PlaylistEntity> {
    let playlist = playlists.iter_mut().find(|p| p.id == id)?;
    edit(playlist);
    Some(playlist.clone())
}

#[derive(Default)]
pub struct MemoryStore {
    playlists: Mutex<Vec<PlaylistEntity>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PlaylistStore for MemoryStore {
    async fn get_all(&self) -> Result<Vec<PlaylistEntity>> {
        Ok(self.playlists.lock().clone())
    }

    async fn save(&self, playlist: &PlaylistEntity) -> Result<()> {
        upsert(&mut self.playlists.lock(), playlist);
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.playlists.lock().retain(|p| p.id != id);
        Ok(())
    }

    async fn update(&self, id: &str, edit: Edit) -> Result<Option<PlaylistEntity>> {
        Ok(apply(&mut self.playlists.lock(), id, edit))
    }
}

const LOCK_RETRY: Duration = Duration::from_millis(10);
const LOCK_TIMEOUT: Duration = Duration::from_secs(5);
/// A lock file older than this was left by a crashed writer
const STALE_LOCK: Duration = Duration::from_secs(30);

/// Whole-file JSON store shared by every process using the same data root.
///
/// Reads go to disk each time. Writes re-read the file under a lock file
/// (`playlists.json.lock`), apply the change and replace the file through a
/// rename, so concurrent processes never drop each other's records and
/// readers never see a partial file. All file work runs on the blocking pool.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    /// Fails with `Error::Store` if an existing file does not parse
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let playlists = read_file(&path)?;
        debug!("Opened {} with {} playlists", path.display(), playlists.len());
        Ok(Self { path })
    }

    async fn blocking<T, F>(&self, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Path) -> Result<T> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || work(&path))
            .await
            .map_err(|e| Error::Store(format!("store task failed: {}", e)))?
    }

    /// Read-modify-write under the lock file
    async fn modify<T, F>(&self, change: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Vec<PlaylistEntity>) -> (T, bool) + Send + 'static,
    {
        self.blocking(move |path| {
            let _lock = StoreLock::acquire(path)?;
            let mut playlists = read_file(path)?;
            let (out, dirty) = change(&mut playlists);
            if dirty {
                write_file(path, &playlists)?;
            }
            Ok(out)
        })
        .await
    }
}

#[async_trait]
impl PlaylistStore for JsonFileStore {
    async fn get_all(&self) -> Result<Vec<PlaylistEntity>> {
        self.blocking(read_file).await
    }

    async fn save(&self, playlist: &PlaylistEntity) -> Result<()> {
        let playlist = playlist.clone();
        self.modify(move |all| {
            upsert(all, &playlist);
            ((), true)
        })
        .await
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.modify(move |all| {
            let before = all.len();
            all.retain(|p| p.id != id);
            ((), all.len() != before)
        })
        .await
    }

    async fn update(&self, id: &str, edit: Edit) -> Result<Option<PlaylistEntity>> {
        let id = id.to_string();
        self.modify(move |all| {
            let updated = apply(all, &id, edit);
            let dirty = updated.is_some();
            (updated, dirty)
        })
        .await
    }
}

fn read_file(path: &Path) -> Result<Vec<PlaylistEntity>> {
    match std::fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map_err(|e| Error::Store(format!("{}: {}", path.display(), e))),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

fn write_file(path: &Path, playlists: &[PlaylistEntity]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension(format!("json.{}.tmp", std::process::id()));
    std::fs::write(&tmp, serde_json::to_vec_pretty(playlists)?)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Exclusive writer lock, held while the guard lives
struct StoreLock {
    path: PathBuf,
}

impl StoreLock {
    fn acquire(store: &Path) -> Result<Self> {
        if let Some(parent) = store.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let path = store.with_extension("json.lock");
        let deadline = Instant::now() + LOCK_TIMEOUT;
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => return Ok(Self { path }),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if is_stale(&path) {
                        warn!("Removing stale store lock {}", path.display());
                        let _ = std::fs::remove_file(&path);
                        continue;
                    }
                    if Instant::now() >= deadline {
                        return Err(Error::Store(format!("timed out waiting for {}", path.display())));
                    }
                    std::thread::sleep(LOCK_RETRY);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn is_stale(lock: &Path) -> bool {
    std::fs::metadata(lock)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.elapsed().ok())
        .map(|age| age > STALE_LOCK)
        .unwrap_or(false)
}
