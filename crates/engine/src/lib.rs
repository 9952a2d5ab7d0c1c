//! Transfer engine for playlist bundles
//!
//! The playlist manager only talks to the [`TransferEngine`] and
//! [`SessionHandle`] traits. [`DiskEngine`] is the shipped implementation:
//! it verifies the content root against the descriptor, reports piece
//! progress and advertises the bundle on the DHT.

use bridge::PieceStrategy;
use futures::future::BoxFuture;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

pub mod bencode;
pub mod bundle;
pub mod dht;
pub mod disk;
pub mod pieces;

pub use bundle::{BundleDescriptor, BundleError};
pub use disk::{DiskEngine, DiskEngineOptions};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Invalid bundle descriptor: {0}")]
    Descriptor(#[from] BundleError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Engine unavailable: {0}")]
    Unavailable(String),
}

/// Live counters reported by a running session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EngineProgress {
    pub pieces_total: u32,
    pub pieces_complete: u32,
    pub peers: u32,
    pub download_rate: u64, // bytes per second
}

/// Invoked by a session each time its counters change
pub type ProgressCallback = Arc<dyn Fn(EngineProgress) + Send + Sync>;

/// Factory for transfer sessions
pub trait TransferEngine: Send + Sync {
    /// Prepare a session for the bundle at `descriptor`, storing content in
    /// `content_root`. Must be cheap: no network activity before `start`.
    fn build_session(
        &self,
        descriptor: &Path,
        content_root: &Path,
        strategy: PieceStrategy,
    ) -> Result<Arc<dyn SessionHandle>, EngineError>;
}

/// One running transfer
pub trait SessionHandle: Send + Sync {
    /// Run the session until it is stopped. The returned future is meant to
    /// be spawned; `on_progress` fires on every piece-count change.
    fn start(self: Arc<Self>, on_progress: ProgressCallback) -> BoxFuture<'static, Result<(), EngineError>>;

    /// Ask the session to end. Idempotent and never blocks.
    fn stop(&self);
}
