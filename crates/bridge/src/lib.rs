//! Bridge types shared between the engine, the playlist manager and the UI
//!
//! Everything here is plain data: serializable, cheap to clone and free of
//! any runtime handles.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default artist assigned to freshly imported source files
pub const UNKNOWN_ARTIST: &str = "Unknown Artist";
/// Default album assigned to freshly imported source files
pub const UNKNOWN_ALBUM: &str = "Unknown Album";

/// Piece selection strategy handed to the transfer engine
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PieceStrategy {
    /// Ascending piece index, so playback can start before the transfer ends
    Sequential,
    /// Least available pieces first, for swarm health
    RarestFirst,
}

/// A single audio file within a playlist
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct TrackEntity {
    pub title: String,
    /// Original source location for the creator, staged location for a leecher
    pub file_path: PathBuf,
    pub duration_seconds: u64,
    pub size_bytes: u64,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub cover_image_path: Option<PathBuf>,
}

impl TrackEntity {
    pub fn new(title: impl Into<String>, file_path: impl Into<PathBuf>) -> Self {
        Self {
            title: title.into(),
            file_path: file_path.into(),
            artist: Some(UNKNOWN_ARTIST.to_string()),
            album: Some(UNKNOWN_ALBUM.to_string()),
            ..Default::default()
        }
    }
}

/// A user-curated playlist and everything needed to share it
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PlaylistEntity {
    pub id: String,
    pub name: String,
    pub description: String,
    pub author: Option<String>,
    /// Playback order
    pub tracks: Vec<TrackEntity>,
    /// Location of the bundle descriptor, set once by `attach_bundle`
    pub bundle_ref: Option<PathBuf>,
    /// Hex info hash of the bundle descriptor
    pub bundle_fingerprint: Option<String>,
    pub cover_image_path: Option<PathBuf>,
    pub last_played_at: DateTime<Utc>,
    pub permanently_seeded: bool,
}

impl PlaylistEntity {
    /// Create a playlist with a fresh id, last played now
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self::created_at(name, description, Utc::now())
    }

    pub fn created_at(
        name: impl Into<String>,
        description: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            description: description.into(),
            author: None,
            tracks: Vec::new(),
            bundle_ref: None,
            bundle_fingerprint: None,
            cover_image_path: None,
            last_played_at: now,
            permanently_seeded: false,
        }
    }

    /// Attach the built bundle. Returns `false` and leaves the playlist
    /// untouched if a bundle is already attached.
    pub fn attach_bundle(&mut self, path: impl Into<PathBuf>, fingerprint: impl Into<String>) -> bool {
        if self.bundle_ref.is_some() {
            return false;
        }
        self.bundle_ref = Some(path.into());
        self.bundle_fingerprint = Some(fingerprint.into());
        true
    }

    /// Resolved path of the first track, used to guess whether content is local
    pub fn first_track_path(&self) -> Option<&PathBuf> {
        self.tracks.first().map(|t| &t.file_path)
    }
}

/// Lifecycle of a transfer session
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferState {
    #[default]
    Stopped,
    Initializing,
    Downloading,
    Seeding,
}

impl TransferState {
    /// A session is seeding once every piece is present. An empty piece set
    /// never counts as complete.
    pub fn from_pieces(total: u32, complete: u32) -> Self {
        if total > 0 && complete == total {
            TransferState::Seeding
        } else {
            TransferState::Downloading
        }
    }

    pub fn is_active(&self) -> bool {
        *self != TransferState::Stopped
    }
}

/// Point-in-time view of a playlist's transfer
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Default)]
pub struct StatusSnapshot {
    pub state: TransferState,
    /// 0.0 to 1.0
    pub progress: f64,
    pub peers: u32,
    pub download_rate: u64, // bytes per second
}

impl StatusSnapshot {
    pub fn stopped() -> Self {
        Self::default()
    }

    pub fn initializing() -> Self {
        Self {
            state: TransferState::Initializing,
            ..Default::default()
        }
    }

    /// Derive a snapshot from raw engine counters
    pub fn from_counters(total: u32, complete: u32, peers: u32, download_rate: u64) -> Self {
        let progress = if total > 0 {
            f64::from(complete.min(total)) / f64::from(total)
        } else {
            0.0
        };
        Self {
            state: TransferState::from_pieces(total, complete),
            progress,
            peers,
            download_rate,
        }
    }
}

/// Playlist name paired with its status, as listed by status views
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PlaylistStatus {
    pub id: String,
    pub name: String,
    pub status: StatusSnapshot,
}
