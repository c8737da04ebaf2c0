//! sandlink core types
//!
//! Shared configuration, sandbox data model, health records and error
//! handling used by the sandlink daemons and CLI.

pub mod config;
pub mod error;
pub mod health;
pub mod identity;
pub mod paths;
pub mod sandbox;

pub use config::*;
pub use error::*;
pub use health::ServiceHealth;
pub use identity::machine_id;
pub use paths::StatePaths;
pub use sandbox::*;
