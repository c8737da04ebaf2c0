//! Remote control-plane API used by the sandbox manager
//!
//! [`SandboxApi`] is the contract: apply a sandbox, watch the sandboxes
//! that reference this machine, and follow a single sandbox.
//! [`HttpSandboxApi`] implements it over HTTP with newline-delimited JSON
//! watch streams.

pub mod client;
pub mod error;
pub mod watch;

pub use client::{AppliedSandbox, HttpSandboxApi, SandboxApi};
pub use error::{ApiError, Result};
pub use watch::{SandboxEvent, SandboxStream, WatchCode, WatchError, WatchEvent, WatchStream};
