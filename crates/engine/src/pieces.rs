//! Piece bookkeeping for a bundle
//!
//! Tracks which pieces are verified on disk and decides in which order the
//! missing ones should be acquired.

use crate::bundle::BundleDescriptor;
use bitvec::prelude::*;
use bridge::PieceStrategy;
use rand::seq::SliceRandom;
use sha1::{Digest, Sha1};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};
use tracing::debug;

pub struct PieceTracker {
    descriptor: Arc<BundleDescriptor>,
    content_root: PathBuf,
    strategy: PieceStrategy,
    have: BitVec<u8, Msb0>,
}

impl PieceTracker {
    pub fn new(descriptor: Arc<BundleDescriptor>, content_root: PathBuf, strategy: PieceStrategy) -> Self {
        let num_pieces = descriptor.num_pieces();
        Self {
            descriptor,
            content_root,
            strategy,
            have: bitvec![u8, Msb0; 0; num_pieces],
        }
    }

    pub fn strategy(&self) -> PieceStrategy {
        self.strategy
    }

    pub fn total(&self) -> u32 {
        self.have.len() as u32
    }

    pub fn complete(&self) -> u32 {
        self.have.count_ones() as u32
    }

    /// Missing pieces in acquisition order
    pub fn missing_in_order(&self) -> Vec<usize> {
        let mut missing: Vec<usize> = self.have.iter_zeros().collect();
        // Without peer availability every piece is equally rare, so seeders
        // spread their scans instead of all starting at piece 0
        if self.strategy == PieceStrategy::RarestFirst {
            missing.shuffle(&mut rand::thread_rng());
        }
        missing
    }

    pub fn mark_verified(&mut self, index: usize) {
        if index < self.have.len() {
            self.have.set(index, true);
        }
    }

    /// Bytes of one piece, or `None` if any part of it is not on disk yet
    async fn read_piece(&self, index: usize) -> std::io::Result<Option<Vec<u8>>> {
        let desc = &self.descriptor;
        let start = index as u64 * desc.piece_length;
        let size = desc.piece_size(index);
        let end = start + size;
        let mut data = vec![0u8; size as usize];

        for file in &desc.files {
            let file_end = file.offset + file.length;
            if file.offset >= end || file_end <= start {
                continue;
            }
            let from = start.max(file.offset);
            let to = end.min(file_end);
            let path = self.content_root.join(&file.path);

            let mut f = match File::open(&path).await {
                Ok(f) => f,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(e),
            };
            if f.metadata().await?.len() < to - file.offset {
                return Ok(None);
            }
            f.seek(SeekFrom::Start(from - file.offset)).await?;
            let slice = &mut data[(from - start) as usize..(to - start) as usize];
            f.read_exact(slice).await?;
        }

        Ok(Some(data))
    }

    /// Hash-check one piece against the descriptor
    pub async fn verify_piece(&self, index: usize) -> std::io::Result<bool> {
        let Some(data) = self.read_piece(index).await? else {
            return Ok(false);
        };
        let hash: [u8; 20] = Sha1::digest(&data).into();
        let ok = hash == self.descriptor.pieces[index];
        if !ok {
            debug!("Piece {} hash mismatch", index);
        }
        Ok(ok)
    }
}
