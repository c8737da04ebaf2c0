//! sandlink observability - structured logging
//!
//! # Quick Start
//!
//! ```no_run
//! use sandlink_observability::{init_logging, LoggingConfig};
//!
//! let _guard = init_logging(&LoggingConfig::default()).expect("failed to init logging");
//! tracing::info!("daemon started");
//! ```

pub mod config;
pub mod error;
pub mod logging;

pub use config::*;
pub use error::{ObservabilityError, Result};
pub use logging::{init_logging, LogGuard};
