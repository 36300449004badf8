//! # wot-downloader
//!
//! Downloads identities from the anonymizing network, split into two
//! complementary strategies:
//!
//! - The [`FastDownloader`] holds continuous subscriptions for the own
//!   identities and their direct trustees, so the trust lists that matter
//!   most are always fresh.
//! - The [`SlowDownloader`] works through the edition-hint priority
//!   queue with a handful of one-shot fetches, covering the rest of the
//!   trust graph outward by rank.
//!
//! The [`DownloaderController`] routes committed graph events to the
//! right side and keeps start/abort transitions serialised. The network
//! itself sits behind the [`NetworkClient`] trait; payload decoding
//! behind [`IdentityFileCodec`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod client;
pub mod controller;
pub mod error;
pub mod fast;
pub mod slow;
#[cfg(test)]
pub(crate) mod testutil;

pub use client::{
    DownloadHandler, IdentityFileCodec, IdentityFileData, NetworkClient, SubscriptionId,
    SubscriptionSink, TrustListEntry,
};
pub use controller::DownloaderController;
pub use error::{DownloadError, Result};
pub use fast::FastDownloader;
pub use slow::SlowDownloader;
