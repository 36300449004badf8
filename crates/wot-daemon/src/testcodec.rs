//! A JSON codec for tests. The production format is a signed XML document
//! owned by the embedding application.

use wot_downloader::{DownloadError, IdentityFileCodec, IdentityFileData, Result};

pub(crate) struct JsonCodec;

impl IdentityFileCodec for JsonCodec {
    fn decode(&self, payload: &[u8]) -> Result<IdentityFileData> {
        serde_json::from_slice(payload).map_err(|e| DownloadError::ParseFailure(e.to_string()))
    }

    fn encode(&self, data: &IdentityFileData) -> Result<Vec<u8>> {
        serde_json::to_vec(data).map_err(|e| DownloadError::ParseFailure(e.to_string()))
    }
}
