//! Size limits enforced on identity data at the validation boundary.
//!
//! These bounds apply both to locally created objects and to everything
//! parsed out of downloaded identity files, so a malicious publisher cannot
//! grow the database without bound.

/// Maximum nickname length in characters.
pub const MAX_NICKNAME_LEN: usize = 50;

/// Maximum trust comment length in characters.
pub const MAX_COMMENT_LEN: usize = 256;

/// Maximum number of contexts per identity.
pub const MAX_CONTEXTS: usize = 32;

/// Maximum length of a single context string in characters.
pub const MAX_CONTEXT_LEN: usize = 32;

/// Maximum length of a property name in characters.
pub const MAX_PROPERTY_NAME_LEN: usize = 256;

/// Maximum length of a property value in characters.
pub const MAX_PROPERTY_VALUE_LEN: usize = 10_000;
