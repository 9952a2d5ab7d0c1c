//! Disk-backed transfer sessions
//!
//! A session watches its content root, verifies pieces as they appear and
//! keeps the bundle advertised on the DHT until it is stopped.
//!
//! There is no peer wire protocol here: pieces only ever arrive through the
//! filesystem. An imported bundle stays `Downloading` until its files are
//! placed under the content root by something else.

use crate::bundle::BundleDescriptor;
use crate::dht::DhtAnnouncer;
use crate::pieces::PieceTracker;
use crate::{EngineError, EngineProgress, ProgressCallback, SessionHandle, TransferEngine};
use bridge::PieceStrategy;
use futures::future::{BoxFuture, FutureExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

/// Lazily created, shared by every session of one engine
type SharedDht = Arc<OnceLock<Option<Arc<DhtAnnouncer>>>>;

#[derive(Debug, Clone)]
pub struct DiskEngineOptions {
    /// How often missing pieces are re-checked on disk
    pub rescan_interval: Duration,
    /// How often the bundle is re-announced and peers re-counted
    pub dht_interval: Duration,
    pub dht_enabled: bool,
    pub listen_port: u16,
}

impl Default for DiskEngineOptions {
    fn default() -> Self {
        Self {
            rescan_interval: Duration::from_secs(2),
            dht_interval: Duration::from_secs(300),
            dht_enabled: true,
            listen_port: 6881,
        }
    }
}

pub struct DiskEngine {
    options: DiskEngineOptions,
    dht: SharedDht,
}

impl DiskEngine {
    pub fn new(options: DiskEngineOptions) -> Self {
        Self {
            options,
            dht: Arc::new(OnceLock::new()),
        }
    }
}

impl TransferEngine for DiskEngine {
    fn build_session(
        &self,
        descriptor: &Path,
        content_root: &Path,
        strategy: PieceStrategy,
    ) -> Result<Arc<dyn SessionHandle>, EngineError> {
        let descriptor = Arc::new(BundleDescriptor::read(descriptor)?);
        debug!(
            "Built {:?} session for {} ({} pieces)",
            strategy,
            descriptor.name,
            descriptor.num_pieces()
        );
        let (stop_tx, _) = watch::channel(false);
        Ok(Arc::new(DiskSession {
            pieces: Mutex::new(PieceTracker::new(
                descriptor.clone(),
                content_root.to_path_buf(),
                strategy,
            )),
            descriptor,
            content_root: content_root.to_path_buf(),
            options: self.options.clone(),
            dht: self.dht.clone(),
            peers: AtomicU32::new(0),
            stop_tx,
        }))
    }
}

pub struct DiskSession {
    descriptor: Arc<BundleDescriptor>,
    content_root: PathBuf,
    pieces: Mutex<PieceTracker>,
    options: DiskEngineOptions,
    dht: SharedDht,
    peers: AtomicU32,
    stop_tx: watch::Sender<bool>,
}

impl SessionHandle for DiskSession {
    fn start(self: Arc<Self>, on_progress: ProgressCallback) -> BoxFuture<'static, Result<(), EngineError>> {
        async move { self.run(on_progress).await }.boxed()
    }

    fn stop(&self) {
        self.stop_tx.send_replace(true);
    }
}

impl DiskSession {
    async fn run(self: Arc<Self>, on_progress: ProgressCallback) -> Result<(), EngineError> {
        let mut stop_rx = self.stop_tx.subscribe();
        if *stop_rx.borrow() {
            return Ok(());
        }

        tokio::fs::create_dir_all(&self.content_root).await?;
        info!("Session started for: {}", self.descriptor.name);

        if self.options.dht_enabled {
            let session = self.clone();
            tokio::spawn(async move { session.dht_loop().await });
        }

        let mut last: Option<EngineProgress> = None;
        let mut last_scan = Instant::now();

        loop {
            let gained = self.scan().await?;
            let elapsed = last_scan.elapsed().as_secs_f64().max(0.001);
            last_scan = Instant::now();

            let progress = {
                let pieces = self.pieces.lock().await;
                EngineProgress {
                    pieces_total: pieces.total(),
                    pieces_complete: pieces.complete(),
                    peers: self.peers.load(Ordering::Relaxed),
                    download_rate: (gained as f64 / elapsed) as u64,
                }
            };

            if last != Some(progress) {
                let complete = progress.pieces_total > 0 && progress.pieces_complete == progress.pieces_total;
                if complete && last.map(|p| p.pieces_complete) != Some(progress.pieces_complete) {
                    info!("Content complete: {}", self.descriptor.name);
                }
                on_progress(progress);
                last = Some(progress);
            }

            tokio::select! {
                _ = stop_rx.changed() => break,
                _ = tokio::time::sleep(self.options.rescan_interval) => {}
            }
        }

        info!("Session stopped for: {}", self.descriptor.name);
        Ok(())
    }

    /// Verify missing pieces in strategy order; returns newly verified bytes
    async fn scan(&self) -> Result<u64, EngineError> {
        let mut pieces = self.pieces.lock().await;
        let mut gained = 0u64;
        for index in pieces.missing_in_order() {
            if *self.stop_tx.borrow() {
                break;
            }
            match pieces.verify_piece(index).await {
                Ok(true) => {
                    pieces.mark_verified(index);
                    gained += self.descriptor.piece_size(index);
                }
                Ok(false) => {
                    // Sequential acquisition cannot get past a hole
                    if pieces.strategy() == PieceStrategy::Sequential {
                        break;
                    }
                }
                Err(e) => {
                    warn!("Failed to read piece {} of {}: {}", index, self.descriptor.name, e);
                    break;
                }
            }
        }
        Ok(gained)
    }

    /// Re-announce the bundle and refresh the peer count until stopped
    async fn dht_loop(self: Arc<Self>) {
        let mut stop_rx = self.stop_tx.subscribe();
        let mut interval = tokio::time::interval(self.options.dht_interval);
        let name = &self.descriptor.name;

        loop {
            tokio::select! {
                _ = stop_rx.changed() => break,
                _ = interval.tick() => {}
            }

            let cell = self.dht.clone();
            let info_hash = self.descriptor.info_hash;
            let port = self.options.listen_port;
            let round = tokio::task::spawn_blocking(move || {
                let dht = cell.get_or_init(|| match DhtAnnouncer::new(port) {
                    Ok(dht) => Some(Arc::new(dht)),
                    Err(e) => {
                        warn!("DHT unavailable: {}", e);
                        None
                    }
                });
                dht.as_ref().map(|dht| dht.sight(info_hash))
            });

            match round.await {
                Ok(Some(Ok(sighting))) => {
                    let before = self.peers.swap(sighting.peers as u32, Ordering::Relaxed);
                    if before != sighting.peers as u32 {
                        info!("DHT: {} peers in swarm for {}", sighting.peers, name);
                    }
                    if !sighting.announced {
                        debug!("DHT: {} not announced this round", name);
                    }
                }
                Ok(Some(Err(e))) => warn!("DHT round for {} failed: {}", name, e),
                Ok(None) => break,
                Err(e) => warn!("DHT task for {} failed: {}", name, e),
            }
        }
    }
}
