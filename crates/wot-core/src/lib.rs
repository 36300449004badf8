//! # wot-core
//!
//! Core types for the web-of-trust engine.
//!
//! This crate provides the fundamental building blocks shared by the graph
//! store, the score engine, and the downloaders:
//!
//! - **Identity ids**: 43-character URL-safe base64 routing-key hashes
//! - **Nicknames**: validated human-readable names
//! - **Trust values**: signed ratings in `[-100, +100]`
//! - **Ranks and capacities**: the tabulated rank → capacity function
//! - **Keys**: request/insert content addresses with advisory editions
//! - **Time**: UTC instants and day-rounding for edition hints
//! - **Configuration**: engine settings with a validating builder

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod id;
pub mod keys;
pub mod limits;
pub mod nickname;
pub mod rank;
pub mod time;
pub mod trust_value;

pub use config::{WotConfig, WotConfigBuilder};
pub use error::{CoreError, Result};
pub use id::{IdentityId, ID_LENGTH};
pub use keys::{InsertKey, RequestKey};
pub use nickname::{Nickname, MAX_NICKNAME_LEN};
pub use rank::{capacity_for_rank, Rank, CAPACITIES};
pub use trust_value::{TrustValue, MAX_TRUST, MIN_TRUST};
