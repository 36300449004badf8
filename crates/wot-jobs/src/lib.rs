//! # wot-jobs
//!
//! Delayed background jobs.
//!
//! A [`DelayedBackgroundJob`] runs a closure on its own worker thread,
//! some delay after being triggered. Triggers arriving while a run is
//! already pending are coalesced into it; triggers arriving during a run
//! schedule exactly one follow-up run. A trigger may shorten a pending
//! delay but never lengthen it.
//!
//! This is the execution primitive behind everything periodic in the
//! engine: score verification, store defragmentation, and the download
//! schedulers' batching.
//!
//! The [`BackgroundJobFactory`] tracks the jobs it created with an
//! explicit lifecycle: jobs register on creation and deregister when they
//! terminate, so `terminate_all` never keeps dead jobs alive and the
//! registry cannot grow without bound.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod factory;
pub mod job;

pub use factory::BackgroundJobFactory;
pub use job::{DelayedBackgroundJob, JobContext, JobState};
