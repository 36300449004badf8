//! The transport and codec boundaries.
//!
//! The engine never talks to the network directly: it drives a
//! [`NetworkClient`] (the anonymizing transport) and decodes payloads
//! through an [`IdentityFileCodec`]. Both are supplied by the embedding
//! application; tests use in-process fakes.

use serde::{Deserialize, Serialize};
use wot_core::{IdentityId, InsertKey, RequestKey};

use crate::error::Result;

/// Opaque handle of a continuous subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Receives subscription events. Called on a transport-owned thread; the
/// transport guarantees no further calls after a successful unsubscribe.
pub trait SubscriptionSink: Send + Sync {
    /// A new edition of the subscribed identity was fetched.
    fn on_edition(&self, edition: u64, payload: Vec<u8>);
}

/// The anonymizing transport.
pub trait NetworkClient: Send + Sync {
    /// Subscribe to continuous updates of the identity behind `key`.
    ///
    /// # Errors
    ///
    /// Transport failures are reported as
    /// [`DownloadError::TransportFailure`](crate::DownloadError::TransportFailure);
    /// the caller is expected to retry.
    fn subscribe(&self, key: &RequestKey, sink: Box<dyn SubscriptionSink>)
        -> Result<SubscriptionId>;

    /// Cancel a subscription. No events are delivered after this returns.
    fn unsubscribe(&self, id: SubscriptionId);

    /// Fetch one edition. Blocks the calling worker thread; the edition
    /// to fetch is the one embedded in `key`.
    fn fetch(&self, key: &RequestKey) -> Result<Vec<u8>>;

    /// Insert one edition under the given insert key.
    fn insert(&self, key: &InsertKey, payload: &[u8]) -> Result<()>;
}

/// One entry of a published trust list.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustListEntry {
    /// The trustee's request URI; its embedded edition doubles as the
    /// publisher's edition hint for the trustee.
    pub trustee_uri: RequestKey,
    /// Trust value in `[-100, +100]`, validated during ingestion.
    pub value: i16,
    /// Free-text comment, at most 256 characters after validation.
    pub comment: String,
}

/// Parsed content of one identity file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityFileData {
    /// The publishing identity.
    pub id: IdentityId,
    /// The edition this file was published at.
    pub edition: u64,
    /// The publisher's nickname.
    pub nickname: Option<String>,
    /// Whether the publisher claims to publish a trust list.
    pub publishes_trust_list: bool,
    /// The publisher's contexts.
    pub contexts: Vec<String>,
    /// The publisher's properties.
    pub properties: Vec<(String, String)>,
    /// The published trust list.
    pub trust_list: Vec<TrustListEntry>,
}

/// Encodes and decodes identity files. The on-wire format (a signed XML
/// document) is owned by the embedding application; unknown attributes
/// must be tolerated there, and the size limits of the data model are
/// enforced during ingestion, not here.
pub trait IdentityFileCodec: Send + Sync {
    /// Decode a fetched payload.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::ParseFailure`](crate::DownloadError::ParseFailure)
    /// for undecodable payloads; the affected edition is then skipped.
    fn decode(&self, payload: &[u8]) -> Result<IdentityFileData>;

    /// Encode an identity file for insertion.
    fn encode(&self, data: &IdentityFileData) -> Result<Vec<u8>>;
}

/// Consumes terminal download outcomes. Implemented by the engine; the
/// implementation must finish all bookkeeping (graph updates, hint
/// deletion) before returning, because the calling worker frees its
/// request slot afterwards.
pub trait DownloadHandler: Send + Sync {
    /// A payload for `subject` at `edition` was downloaded.
    fn on_downloaded(&self, subject: IdentityId, edition: u64, payload: Vec<u8>);

    /// A one-shot fetch for a hint failed terminally (not found or
    /// transport error). The hint must not be retried.
    fn on_download_failed(&self, source: IdentityId, subject: IdentityId, edition: u64);
}
