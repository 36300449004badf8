//! Nickname validation.
//!
//! Nicknames are human-readable labels attached to identities. They are
//! never unique: the id remains the only identifier, and user interfaces
//! disambiguate equal nicknames by appending `@` and a prefix of the id.
//! That is why `@` itself is rejected inside a nickname.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

pub use crate::limits::MAX_NICKNAME_LEN;

/// A validated nickname (1 to 50 Unicode letters or digits).
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Nickname(String);

impl Nickname {
    /// Create a new validated nickname.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidParameter`] if the nickname is empty,
    /// longer than [`MAX_NICKNAME_LEN`] characters, contains `@`, or
    /// contains any character that is not a Unicode letter or digit.
    pub fn new(nickname: &str) -> Result<Self> {
        Self::validate(nickname)?;
        Ok(Nickname(nickname.to_string()))
    }

    /// Validate a nickname string without constructing a [`Nickname`].
    pub fn validate(nickname: &str) -> Result<()> {
        let len = nickname.chars().count();

        if len == 0 {
            return Err(CoreError::invalid("nickname must not be empty"));
        }
        if len > MAX_NICKNAME_LEN {
            return Err(CoreError::invalid(format!(
                "nickname too long: maximum {MAX_NICKNAME_LEN} characters, got {len}"
            )));
        }

        for c in nickname.chars() {
            if c == '@' {
                return Err(CoreError::invalid(
                    "nickname must not contain '@', it is reserved for disambiguation",
                ));
            }
            if !c.is_alphanumeric() {
                return Err(CoreError::invalid(format!(
                    "nickname contains invalid character {c:?}, only letters and digits are allowed"
                )));
            }
        }

        Ok(())
    }

    /// The nickname as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Nickname {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Nickname {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Nickname({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_names() {
        assert!(Nickname::new("alice").is_ok());
        assert!(Nickname::new("Bob42").is_ok());
        assert!(Nickname::new("a").is_ok());
    }

    #[test]
    fn accepts_unicode_letters() {
        assert!(Nickname::new("Grüße").is_ok());
        assert!(Nickname::new("статья").is_ok());
        assert!(Nickname::new("日本語").is_ok());
    }

    #[test]
    fn rejects_empty() {
        assert!(Nickname::new("").is_err());
    }

    #[test]
    fn rejects_at_sign() {
        assert!(Nickname::new("alice@home").is_err());
        assert!(Nickname::new("@").is_err());
    }

    #[test]
    fn rejects_punctuation_and_whitespace() {
        assert!(Nickname::new("alice bob").is_err());
        assert!(Nickname::new("alice_bob").is_err());
        assert!(Nickname::new("alice-bob").is_err());
        assert!(Nickname::new("alice!").is_err());
    }

    #[test]
    fn length_limit_counts_characters_not_bytes() {
        // 50 two-byte characters are fine even though that is 100 bytes.
        let fifty = "ü".repeat(MAX_NICKNAME_LEN);
        assert!(Nickname::new(&fifty).is_ok());

        let fifty_one = "ü".repeat(MAX_NICKNAME_LEN + 1);
        assert!(Nickname::new(&fifty_one).is_err());
    }
}
