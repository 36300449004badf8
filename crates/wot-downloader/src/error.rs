//! Error types for the downloader crate.

use thiserror::Error;

/// Errors raised by downloaders and the transport boundary.
#[derive(Error, Debug)]
pub enum DownloadError {
    /// The transport failed. The fast downloader retries these forever;
    /// the slow downloader discards the hint and moves on.
    #[error("transport failure: {0}")]
    TransportFailure(String),

    /// A downloaded payload could not be decoded into an identity file.
    #[error("identity file parse failure: {0}")]
    ParseFailure(String),

    /// Shutdown was requested; the operation unwound cleanly. Never
    /// surfaced to the user.
    #[error("interrupted by shutdown")]
    Interrupted,

    /// A graph operation performed on behalf of a download failed.
    #[error(transparent)]
    Graph(#[from] wot_graph::GraphError),
}

/// Result type alias for [`DownloadError`].
pub type Result<T> = std::result::Result<T, DownloadError>;
