//! Request coalescing for expensive asynchronous operations.
//!
//! A [`Batcher`] makes sure that calls with the same key, made concurrently or within a
//! configurable window, invoke the underlying operation only once. Every caller observes the
//! same [`Outcome`]: the same value behind an [`Arc`](std::sync::Arc), or the same failure.
//!
//! Keys are normalized into a [`CacheKey`], the canonical JSON encoding of a sequence of
//! values. See [`Batcher`] for how long entries are kept.

#![warn(missing_docs)]

#[macro_use]
#[allow(missing_docs)]
pub mod metrics;

mod batcher;
#[allow(missing_docs)]
pub mod config;
mod error;
mod key;
#[allow(missing_docs)]
pub mod logging;
mod outcome;
mod utils;

pub use batcher::Batcher;
pub use config::Config;
pub use error::{CallError, KeyError};
pub use key::{CacheKey, CacheKeyBuilder};
pub use outcome::{CallResult, Outcome};
