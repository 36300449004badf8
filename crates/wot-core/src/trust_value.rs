//! Trust values.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Lowest allowed trust value.
pub const MIN_TRUST: i8 = -100;

/// Highest allowed trust value.
pub const MAX_TRUST: i8 = 100;

/// A signed trust rating in `[-100, +100]`.
///
/// Values above zero confer rank (and therefore capacity) on the trustee;
/// values of zero and below do not. A zero value reads as "known, neither
/// trusted nor distrusted" and still keeps the trustee downloadable.
///
/// Validation happens during construction and deserialization, so an
/// out-of-range value can never enter the engine from the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TrustValue(i8);

impl TrustValue {
    /// Create a new trust value, validating the range.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidParameter`] if `value` is outside
    /// `[-100, +100]`.
    pub fn new(value: i16) -> Result<Self> {
        if value < i16::from(MIN_TRUST) || value > i16::from(MAX_TRUST) {
            return Err(CoreError::invalid(format!(
                "trust value {value} out of range [{MIN_TRUST}, {MAX_TRUST}]"
            )));
        }
        Ok(TrustValue(value as i8))
    }

    /// The raw value.
    #[must_use]
    pub const fn value(&self) -> i8 {
        self.0
    }

    /// Whether this trust confers rank on the trustee.
    #[must_use]
    pub const fn is_positive(&self) -> bool {
        self.0 > 0
    }

    /// Whether this trust expresses distrust (zero does not).
    #[must_use]
    pub const fn is_negative(&self) -> bool {
        self.0 < 0
    }
}

impl fmt::Display for TrustValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:+}", self.0)
    }
}

impl Serialize for TrustValue {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.0.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for TrustValue {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = i8::deserialize(deserializer)?;
        TrustValue::new(i16::from(value)).map_err(serde::de::Error::custom)
    }
}
