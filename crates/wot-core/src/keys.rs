//! Content-address keys.
//!
//! Every identity publishes its document under an updateable key. The
//! *request* key is public and sufficient to fetch; the *insert* key
//! additionally carries the private material needed to publish and is only
//! ever held for own identities. Both embed an advisory edition number.
//!
//! The edition inside a key received from the outside is never trusted:
//! it only seeds the edition-hint machinery. Treating it as authoritative
//! would let a malicious peer pin another identity to an edition that is
//! never inserted, blocking its download forever.
//!
//! Key strings look like:
//!
//! ```text
//! wot:req@<43-char id>/<edition>
//! wot:ins@<43-char id>:<43-char secret>/<edition>
//! ```

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::id::IdentityId;

const REQUEST_PREFIX: &str = "wot:req@";
const INSERT_PREFIX: &str = "wot:ins@";

/// Public fetch key of an identity document.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestKey {
    id: IdentityId,
    edition: u64,
}

impl RequestKey {
    /// Build a request key for the given identity and advisory edition.
    #[must_use]
    pub fn new(id: IdentityId, edition: u64) -> Self {
        RequestKey { id, edition }
    }

    /// The identity this key belongs to.
    #[must_use]
    pub fn id(&self) -> IdentityId {
        self.id
    }

    /// The advisory edition embedded in the key.
    #[must_use]
    pub fn suggested_edition(&self) -> u64 {
        self.edition
    }

    /// The same key pointing at a different edition.
    #[must_use]
    pub fn with_edition(&self, edition: u64) -> Self {
        RequestKey { id: self.id, edition }
    }

    /// Parse a request-key string.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::MalformedUrl`] if the string is not a request
    /// key. An insert key is rejected here: code that only needs to fetch
    /// must never be handed private key material by accident.
    pub fn parse(s: &str) -> Result<Self> {
        let rest = s.strip_prefix(REQUEST_PREFIX).ok_or_else(|| {
            if s.starts_with(INSERT_PREFIX) {
                CoreError::malformed("expected a request key, got an insert key")
            } else {
                CoreError::malformed(format!("not a request key: {s:?}"))
            }
        })?;
        let (id_part, edition_part) = rest
            .split_once('/')
            .ok_or_else(|| CoreError::malformed("request key is missing the edition part"))?;
        let id = IdentityId::decode(id_part)
            .map_err(|e| CoreError::malformed(format!("bad identity id in request key: {e}")))?;
        let edition = parse_edition(edition_part)?;
        Ok(RequestKey { id, edition })
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{REQUEST_PREFIX}{}/{}", self.id, self.edition)
    }
}

impl fmt::Debug for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RequestKey({self})")
    }
}

impl FromStr for RequestKey {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        RequestKey::parse(s)
    }
}

/// Private insert key of an own identity document.
///
/// The secret half never appears in `Display` output so it cannot leak
/// through logs.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsertKey {
    id: IdentityId,
    secret: [u8; 32],
    edition: u64,
}

impl InsertKey {
    /// Build an insert key from its parts.
    #[must_use]
    pub fn new(id: IdentityId, secret: [u8; 32], edition: u64) -> Self {
        InsertKey { id, secret, edition }
    }

    /// The identity this key belongs to.
    #[must_use]
    pub fn id(&self) -> IdentityId {
        self.id
    }

    /// The advisory edition embedded in the key.
    #[must_use]
    pub fn suggested_edition(&self) -> u64 {
        self.edition
    }

    /// Derive the public request key for the same identity.
    #[must_use]
    pub fn derive_request_key(&self) -> RequestKey {
        RequestKey::new(self.id, self.edition)
    }

    /// Whether this insert key and the given request key belong to the
    /// same identity.
    #[must_use]
    pub fn matches(&self, request: &RequestKey) -> bool {
        self.id == request.id
    }

    /// Parse an insert-key string.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::MalformedUrl`] if the string is not an insert
    /// key, including when a request key is supplied instead.
    pub fn parse(s: &str) -> Result<Self> {
        let rest = s.strip_prefix(INSERT_PREFIX).ok_or_else(|| {
            if s.starts_with(REQUEST_PREFIX) {
                CoreError::malformed("expected an insert key, got a request key")
            } else {
                CoreError::malformed(format!("not an insert key: {s:?}"))
            }
        })?;
        let (key_part, edition_part) = rest
            .split_once('/')
            .ok_or_else(|| CoreError::malformed("insert key is missing the edition part"))?;
        let (id_part, secret_part) = key_part
            .split_once(':')
            .ok_or_else(|| CoreError::malformed("insert key is missing the secret part"))?;
        let id = IdentityId::decode(id_part)
            .map_err(|e| CoreError::malformed(format!("bad identity id in insert key: {e}")))?;
        let secret_bytes = URL_SAFE_NO_PAD
            .decode(secret_part)
            .map_err(|e| CoreError::malformed(format!("bad secret in insert key: {e}")))?;
        let secret: [u8; 32] = secret_bytes
            .try_into()
            .map_err(|_| CoreError::malformed("insert key secret must be 32 bytes"))?;
        let edition = parse_edition(edition_part)?;
        Ok(InsertKey { id, secret, edition })
    }
}

impl fmt::Display for InsertKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{INSERT_PREFIX}{}:{}/{}",
            self.id,
            URL_SAFE_NO_PAD.encode(self.secret),
            self.edition
        )
    }
}

impl fmt::Debug for InsertKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InsertKey({}:[REDACTED]/{})", self.id, self.edition)
    }
}

impl FromStr for InsertKey {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        InsertKey::parse(s)
    }
}

fn parse_edition(s: &str) -> Result<u64> {
    if s.starts_with('-') {
        return Err(CoreError::malformed(format!("negative edition: {s}")));
    }
    s.parse::<u64>()
        .map_err(|e| CoreError::malformed(format!("bad edition {s:?}: {e}")))
}
