//! Identity identifiers.
//!
//! An [`IdentityId`] is the URL-safe base64 encoding of the 32-byte routing
//! hash of an identity's public key. The encoded form is always exactly 43
//! characters and carries no padding, so it can be embedded in keys, index
//! entries, and log lines without escaping.

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Length of the encoded form: 32 bytes of routing hash in unpadded base64.
pub const ID_LENGTH: usize = 43;

/// Number of raw bytes in an identity id.
pub const ID_BYTES: usize = 32;

/// A unique identifier for an identity.
///
/// Ids order like their raw bytes, which matches the ordering of their
/// base64 form only incidentally; all persisted orderings in this engine
/// are defined over the encoded string where it matters.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IdentityId([u8; ID_BYTES]);

impl IdentityId {
    /// Wrap raw routing-hash bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; ID_BYTES]) -> Self {
        IdentityId(bytes)
    }

    /// The raw routing-hash bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; ID_BYTES] {
        &self.0
    }

    /// Encode as the canonical 43-character string.
    #[must_use]
    pub fn encode(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.0)
    }

    /// Parse the canonical 43-character form.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidParameter`] if the input has the wrong
    /// length, contains characters outside the URL-safe base64 alphabet, or
    /// does not decode to exactly 32 bytes.
    pub fn decode(s: &str) -> Result<Self> {
        if s.len() != ID_LENGTH {
            return Err(CoreError::invalid(format!(
                "identity id must be {} characters, got {}",
                ID_LENGTH,
                s.len()
            )));
        }
        let bytes = URL_SAFE_NO_PAD
            .decode(s)
            .map_err(|e| CoreError::invalid(format!("identity id is not valid base64: {e}")))?;
        let bytes: [u8; ID_BYTES] = bytes
            .try_into()
            .map_err(|_| CoreError::invalid("identity id does not decode to 32 bytes"))?;
        Ok(IdentityId(bytes))
    }
}

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl fmt::Debug for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdentityId({})", self.encode())
    }
}

impl FromStr for IdentityId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        IdentityId::decode(s)
    }
}
