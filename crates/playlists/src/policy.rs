//! Time-windowed retention policy
//!
//! The single place that reconciles desired against actual seeding state.
//! Other start/stop paths are transient; the next pass may reverse them.

use crate::session::{SessionManager, StartOutcome};
use bridge::PlaylistEntity;
use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

pub const RETENTION_WINDOW_DAYS: i64 = 3;

pub fn retention_window() -> Duration {
    Duration::days(RETENTION_WINDOW_DAYS)
}

/// Whether `playlist` should be seeding at `now`
pub fn should_seed(playlist: &PlaylistEntity, now: DateTime<Utc>) -> bool {
    playlist.permanently_seeded || now - playlist.last_played_at < retention_window()
}

/// Playlist ids acted on by one pass
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PolicyReport {
    pub started: Vec<String>,
    pub stopped: Vec<String>,
    pub failed: Vec<String>,
}

impl PolicyReport {
    pub fn is_empty(&self) -> bool {
        self.started.is_empty() && self.stopped.is_empty() && self.failed.is_empty()
    }
}

pub struct SeedingPolicy<'a> {
    sessions: &'a SessionManager,
}

impl<'a> SeedingPolicy<'a> {
    pub fn new(sessions: &'a SessionManager) -> Self {
        Self { sessions }
    }

    pub fn enforce(&self, playlists: &[PlaylistEntity], now: DateTime<Utc>) -> PolicyReport {
        let mut report = PolicyReport::default();

        for playlist in playlists {
            let wanted = should_seed(playlist, now);
            let seeding = self.sessions.status_of(&playlist.id).state.is_active();

            if wanted && !seeding {
                info!(
                    "Policy: seeding '{}' (last played {}, permanent: {})",
                    playlist.name, playlist.last_played_at, playlist.permanently_seeded
                );
                match self.sessions.start_seeding(playlist) {
                    Ok(StartOutcome::Deferred) => {}
                    Ok(_) => report.started.push(playlist.id.clone()),
                    Err(e) => {
                        warn!("Policy: could not seed '{}': {}", playlist.name, e);
                        report.failed.push(playlist.id.clone());
                    }
                }
            } else if !wanted && seeding {
                info!(
                    "Policy: stopping '{}' (last played {}, permanent: {})",
                    playlist.name, playlist.last_played_at, playlist.permanently_seeded
                );
                self.sessions.stop(&playlist.id);
                report.stopped.push(playlist.id.clone());
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::Layout;
    use crate::session::testing::{bundled_playlist, FakeEngine};
    use std::sync::Arc;

    fn sessions() -> (Arc<FakeEngine>, SessionManager) {
        let engine = Arc::new(FakeEngine::default());
        let manager = SessionManager::new(engine.clone(), Layout::new("/data"));
        (engine, manager)
    }

    fn played(name: &str, days_ago: i64, now: DateTime<Utc>) -> PlaylistEntity {
        let mut p = bundled_playlist(name);
        p.last_played_at = now - Duration::days(days_ago);
        p
    }

    #[test]
    fn test_should_seed_window() {
        let now = Utc::now();
        assert!(should_seed(&played("a", 2, now), now));
        assert!(!should_seed(&played("b", 3, now), now));
        let mut permanent = played("c", 30, now);
        permanent.permanently_seeded = true;
        assert!(should_seed(&permanent, now));
    }

    #[tokio::test]
    async fn test_stale_playlist_is_stopped() {
        let (engine, manager) = sessions();
        let now = Utc::now();
        let stale = played("Stale", 4, now);
        manager.start_seeding(&stale).unwrap();

        let report = SeedingPolicy::new(&manager).enforce(&[stale.clone()], now);
        assert_eq!(report.stopped, vec![stale.id.clone()]);
        assert!(!manager.is_active(&stale.id));
        assert_eq!(engine.live(), 0);
    }

    #[tokio::test]
    async fn test_permanent_playlist_keeps_seeding() {
        let (_engine, manager) = sessions();
        let now = Utc::now();
        let mut kept = played("Kept", 4, now);
        kept.permanently_seeded = true;
        manager.start_seeding(&kept).unwrap();

        let report = SeedingPolicy::new(&manager).enforce(&[kept.clone()], now);
        assert!(report.is_empty());
        assert!(manager.is_active(&kept.id));
    }

    #[tokio::test]
    async fn test_recent_playlist_is_started_once() {
        let (engine, manager) = sessions();
        let now = Utc::now();
        let recent = played("Recent", 1, now);
        let stale = played("Stale", 10, now);
        let all = [recent.clone(), stale.clone()];

        let policy = SeedingPolicy::new(&manager);
        let report = policy.enforce(&all, now);
        assert_eq!(report.started, vec![recent.id.clone()]);
        assert!(!manager.is_active(&stale.id));

        assert!(policy.enforce(&all, now).is_empty());
        assert_eq!(engine.built().len(), 1);
    }

    #[tokio::test]
    async fn test_start_failure_does_not_abort_pass() {
        let (_engine, manager) = sessions();
        let now = Utc::now();
        let unbuilt = PlaylistEntity::created_at("Unbuilt", "", now);
        let ok = played("Ok", 0, now);

        let report = SeedingPolicy::new(&manager).enforce(&[unbuilt.clone(), ok.clone()], now);
        assert_eq!(report.failed, vec![unbuilt.id]);
        assert_eq!(report.started, vec![ok.id]);
    }
}
