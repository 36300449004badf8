//! Trust records.

use serde::{Deserialize, Serialize};
use wot_core::limits::MAX_COMMENT_LEN;
use wot_core::{CoreError, IdentityId, TrustValue};

use crate::error::Result;

/// Key of a trust edge: `(truster, trustee)`. At most one trust exists per
/// pair.
pub type TrustKey = (IdentityId, IdentityId);

/// A directed, signed trust edge.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trust {
    truster: IdentityId,
    trustee: IdentityId,
    value: TrustValue,
    comment: String,
    truster_trust_list_edition: i64,
}

impl Trust {
    /// Create a trust edge.
    ///
    /// # Errors
    ///
    /// Fails if the comment exceeds 256 characters. The value is already
    /// range-checked by [`TrustValue`].
    pub fn new(
        truster: IdentityId,
        trustee: IdentityId,
        value: TrustValue,
        comment: &str,
        truster_trust_list_edition: i64,
    ) -> Result<Self> {
        if comment.chars().count() > MAX_COMMENT_LEN {
            return Err(CoreError::invalid(format!(
                "trust comment exceeds {MAX_COMMENT_LEN} characters"
            ))
            .into());
        }
        Ok(Trust {
            truster,
            trustee,
            value,
            comment: comment.to_string(),
            truster_trust_list_edition,
        })
    }

    /// The identity that asserts this trust.
    #[must_use]
    pub fn truster(&self) -> IdentityId {
        self.truster
    }

    /// The identity this trust is about.
    #[must_use]
    pub fn trustee(&self) -> IdentityId {
        self.trustee
    }

    /// The signed rating.
    #[must_use]
    pub fn value(&self) -> TrustValue {
        self.value
    }

    /// The free-text explanation of the rating.
    #[must_use]
    pub fn comment(&self) -> &str {
        &self.comment
    }

    /// The truster's trust-list edition at which this trust was observed.
    #[must_use]
    pub fn truster_trust_list_edition(&self) -> i64 {
        self.truster_trust_list_edition
    }

    /// The `(truster, trustee)` key of this edge.
    #[must_use]
    pub fn key(&self) -> TrustKey {
        (self.truster, self.trustee)
    }

    /// Replace value and comment, keeping the endpoints.
    pub(crate) fn update(
        &mut self,
        value: TrustValue,
        comment: &str,
        truster_trust_list_edition: i64,
    ) -> Result<()> {
        if comment.chars().count() > MAX_COMMENT_LEN {
            return Err(CoreError::invalid(format!(
                "trust comment exceeds {MAX_COMMENT_LEN} characters"
            ))
            .into());
        }
        self.value = value;
        self.comment = comment.to_string();
        self.truster_trust_list_edition = truster_trust_list_edition;
        Ok(())
    }
}
