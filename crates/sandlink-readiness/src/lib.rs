//! Readiness and polling primitives
//!
//! - [`Readiness`] runs an evaluation function in the background and exposes
//!   the latest readiness value, a bounded queue of warnings and at most one
//!   fatal error.
//! - [`Until`] polls a predicate until it completes or a timeout elapses.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use sandlink_readiness::{Evaluation, Readiness};
//!
//! # async fn example() {
//! let readiness = Readiness::spawn(Duration::from_secs(1), || async {
//!     Evaluation::ready()
//! });
//! while !readiness.is_ready() {
//!     tokio::time::sleep(Duration::from_millis(100)).await;
//! }
//! readiness.stop().await;
//! # }
//! ```

#![deny(unsafe_code)]

pub mod ready;
pub mod until;

pub use ready::{BoxError, Evaluation, Readiness, WARNING_BUFFER};
pub use until::{Check, Until, UntilError};
