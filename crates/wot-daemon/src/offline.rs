//! A transport that is never connected.
//!
//! Lets the daemon run against a local database without a network: every
//! operation fails with a transport error, which the downloaders already
//! handle (the fast side retries with backoff, the slow side discards the
//! hint). Useful for inspection, migration, and tests.

use wot_core::{InsertKey, RequestKey};
use wot_downloader::{
    DownloadError, IdentityFileCodec, IdentityFileData, NetworkClient, Result, SubscriptionId,
    SubscriptionSink,
};

/// The disconnected transport.
pub struct OfflineNetworkClient;

/// A codec for the disconnected daemon; nothing is ever downloaded, so
/// nothing is ever decoded.
pub struct OfflineCodec;

impl IdentityFileCodec for OfflineCodec {
    fn decode(&self, _payload: &[u8]) -> Result<IdentityFileData> {
        Err(DownloadError::ParseFailure("offline codec".into()))
    }

    fn encode(&self, _data: &IdentityFileData) -> Result<Vec<u8>> {
        Err(DownloadError::ParseFailure("offline codec".into()))
    }
}

impl NetworkClient for OfflineNetworkClient {
    fn subscribe(
        &self,
        _key: &RequestKey,
        _sink: Box<dyn SubscriptionSink>,
    ) -> Result<SubscriptionId> {
        Err(DownloadError::TransportFailure("offline".into()))
    }

    fn unsubscribe(&self, _id: SubscriptionId) {}

    fn fetch(&self, _key: &RequestKey) -> Result<Vec<u8>> {
        Err(DownloadError::TransportFailure("offline".into()))
    }

    fn insert(&self, _key: &InsertKey, _payload: &[u8]) -> Result<()> {
        Err(DownloadError::TransportFailure("offline".into()))
    }
}
