//! Session manager - one transfer session per playlist
//!
//! The map from playlist id to live session is the only shared state. All
//! check-and-insert and stop-and-remove sequences go through a `DashMap`
//! entry, so operations on one id are serialized while different ids never
//! contend on a global lock. Engine calls never run while an entry is held.

use crate::error::{Error, Result};
use crate::layout::Layout;
use bridge::{PieceStrategy, PlaylistEntity, StatusSnapshot};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use engine::{EngineProgress, ProgressCallback, SessionHandle, TransferEngine};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What a start request did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    /// A session already existed; it was left as is
    AlreadyActive,
    /// No engine in this process; a serving process picks the playlist up
    /// on its next policy pass
    Deferred,
}

struct ActiveSession {
    handle: Arc<dyn SessionHandle>,
    strategy: PieceStrategy,
    /// Distinguishes this session from a later one under the same id
    generation: u64,
    /// `None` until the engine reports for the first time
    progress: Arc<RwLock<Option<EngineProgress>>>,
}

pub struct SessionManager {
    engine: Option<Arc<dyn TransferEngine>>,
    layout: Layout,
    sessions: Arc<DashMap<String, ActiveSession>>,
    next_generation: AtomicU64,
}

impl SessionManager {
    pub fn new(engine: Arc<dyn TransferEngine>, layout: Layout) -> Self {
        Self::with_engine(Some(engine), layout)
    }

    /// A manager that never runs sessions, for one-shot processes sharing
    /// the store with a long-running one
    pub fn detached(layout: Layout) -> Self {
        Self::with_engine(None, layout)
    }

    fn with_engine(engine: Option<Arc<dyn TransferEngine>>, layout: Layout) -> Self {
        Self {
            engine,
            layout,
            sessions: Arc::new(DashMap::new()),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Seed with rarest-first ordering. Must be called inside a tokio runtime.
    pub fn start_seeding(&self, playlist: &PlaylistEntity) -> Result<StartOutcome> {
        self.start(playlist, PieceStrategy::RarestFirst)
    }

    /// Download in playback order. Must be called inside a tokio runtime.
    pub fn start_streaming(&self, playlist: &PlaylistEntity) -> Result<StartOutcome> {
        self.start(playlist, PieceStrategy::Sequential)
    }

    fn start(&self, playlist: &PlaylistEntity, strategy: PieceStrategy) -> Result<StartOutcome> {
        let Some(engine) = &self.engine else {
            debug!("No engine here, deferring '{}'", playlist.name);
            return Ok(StartOutcome::Deferred);
        };
        if self.sessions.contains_key(&playlist.id) {
            info!("Playlist '{}' is already active", playlist.name);
            return Ok(StartOutcome::AlreadyActive);
        }

        let engine_start_error = |reason: String| {
            warn!("Failed to start session for '{}': {}", playlist.name, reason);
            Error::EngineStart {
                playlist: playlist.id.clone(),
                reason,
            }
        };

        let descriptor = playlist
            .bundle_ref
            .as_ref()
            .ok_or_else(|| engine_start_error("no bundle attached".to_string()))?;
        let content_root = self.layout.staging_dir(playlist);

        // Built outside the map. A handle does nothing until started, so one
        // that loses the insert below is dropped as is.
        let handle = engine
            .build_session(descriptor, &content_root, strategy)
            .map_err(|e| engine_start_error(e.to_string()))?;

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let progress = Arc::new(RwLock::new(None));
        match self.sessions.entry(playlist.id.clone()) {
            Entry::Occupied(_) => {
                info!("Playlist '{}' is already active", playlist.name);
                return Ok(StartOutcome::AlreadyActive);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(ActiveSession {
                    handle: handle.clone(),
                    strategy,
                    generation,
                    progress: progress.clone(),
                });
            }
        }

        info!(
            "Starting to {} playlist: {}",
            if strategy == PieceStrategy::Sequential { "stream" } else { "seed" },
            playlist.name
        );

        let on_progress: ProgressCallback = Arc::new(move |p: EngineProgress| {
            *progress.write() = Some(p);
        });
        let sessions = self.sessions.clone();
        let id = playlist.id.clone();
        let name = playlist.name.clone();
        tokio::spawn(async move {
            match handle.start(on_progress).await {
                Ok(()) => debug!("Session for '{}' ended", name),
                Err(e) => {
                    warn!("Session for '{}' failed: {}", name, e);
                    // Only drop the entry if it still belongs to this session
                    if let Some((_, dead)) = sessions.remove_if(&id, |_, s| s.generation == generation) {
                        dead.handle.stop();
                    }
                }
            }
        });

        Ok(StartOutcome::Started)
    }

    /// Stop and forget the session for `playlist_id`, if any
    pub fn stop(&self, playlist_id: &str) {
        if let Entry::Occupied(entry) = self.sessions.entry(playlist_id.to_string()) {
            // Signal before removal; the entry lock keeps a new start out
            // until the old handle is gone from the map.
            entry.get().handle.stop();
            entry.remove();
            info!("Stopped session for playlist {}", playlist_id);
        }
    }

    /// Stop every session; used on shutdown
    pub fn stop_all(&self) {
        for id in self.active_ids() {
            self.stop(&id);
        }
    }

    pub fn status_of(&self, playlist_id: &str) -> StatusSnapshot {
        let progress = match self.sessions.get(playlist_id) {
            None => return StatusSnapshot::stopped(),
            Some(session) => *session.progress.read(),
        };
        match progress {
            None => StatusSnapshot::initializing(),
            Some(p) => StatusSnapshot::from_counters(p.pieces_total, p.pieces_complete, p.peers, p.download_rate),
        }
    }

    pub fn is_active(&self, playlist_id: &str) -> bool {
        self.sessions.contains_key(playlist_id)
    }

    pub fn strategy_of(&self, playlist_id: &str) -> Option<PieceStrategy> {
        self.sessions.get(playlist_id).map(|s| s.strategy)
    }

    pub fn active_ids(&self) -> Vec<String> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }
}
