use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to stage {source_path}: {reason}")]
    StagingIo { source_path: PathBuf, reason: std::io::Error },
    #[error("No stageable content in {0}")]
    EmptyContent(PathBuf),
    #[error("Failed to build bundle: {0}")]
    BundleBuild(String),
    #[error("Failed to start session for {playlist}: {reason}")]
    EngineStart { playlist: String, reason: String },
    #[error("Malformed sidecar {path}: {reason}")]
    SidecarParse { path: PathBuf, reason: serde_json::Error },
    #[error("Playlist not found: {0}")]
    PlaylistNotFound(String),
    #[error("Store error: {0}")]
    Store(String),
    #[error("Config error: {0}")]
    Config(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<engine::BundleError> for Error {
    fn from(e: engine::BundleError) -> Self {
        match e {
            engine::BundleError::EmptyContent(dir) => Error::EmptyContent(dir),
            other => Error::BundleBuild(other.to_string()),
        }
    }
}
