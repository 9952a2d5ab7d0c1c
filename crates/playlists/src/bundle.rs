use crate::error::{Error, Result};
use crate::layout::Layout;
use bridge::PlaylistEntity;
use engine::bundle::create_descriptor;
use engine::BundleDescriptor;
use std::path::{Path, PathBuf};
use tracing::info;

/// Result of a successful build
#[derive(Debug, Clone, PartialEq)]
pub struct BuiltBundle {
    pub path: PathBuf,
    pub fingerprint: String,
}

/// Hashes a staged content root into a bundle descriptor
#[derive(Debug, Clone)]
pub struct BundleBuilder {
    layout: Layout,
    announce: Vec<String>,
    piece_length: u64,
}

impl BundleBuilder {
    pub fn new(layout: Layout, announce: Vec<String>, piece_length: u64) -> Self {
        Self {
            layout,
            announce,
            piece_length,
        }
    }

    /// Hash `staging_dir` on a blocking thread and write the descriptor to
    /// the playlist's fixed bundle location.
    pub async fn build(&self, playlist: &PlaylistEntity, staging_dir: &Path) -> Result<BuiltBundle> {
        let dir = staging_dir.to_path_buf();
        let announce = self.announce.clone();
        let piece_length = self.piece_length;

        let bytes = tokio::task::spawn_blocking(move || create_descriptor(&dir, &announce, piece_length))
            .await
            .map_err(|e| Error::BundleBuild(format!("hashing task failed: {}", e)))??;

        let descriptor = BundleDescriptor::from_bytes(&bytes)?;
        let path = self.layout.bundle_path(&playlist.id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|e| Error::BundleBuild(format!("writing {}: {}", path.display(), e)))?;

        info!(
            "Built bundle {} for '{}' ({} files, {} pieces)",
            descriptor.fingerprint(),
            playlist.name,
            descriptor.files.len(),
            descriptor.num_pieces()
        );
        Ok(BuiltBundle {
            path,
            fingerprint: descriptor.fingerprint(),
        })
    }
}
