//! Error types for the daemon crate.

use thiserror::Error;

/// Errors raised while assembling or operating the engine.
#[derive(Error, Debug)]
pub enum EngineError {
    /// A configuration or parameter was rejected.
    #[error(transparent)]
    Core(#[from] wot_core::CoreError),

    /// The graph layer failed.
    #[error(transparent)]
    Graph(#[from] wot_graph::GraphError),

    /// A download-layer operation failed.
    #[error(transparent)]
    Download(#[from] wot_downloader::DownloadError),

    /// Filesystem trouble with the data directory or the sidecar file.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for [`EngineError`].
pub type Result<T> = std::result::Result<T, EngineError>;
