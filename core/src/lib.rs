//! Stagecraft Core - Foundational Types
//!
//! Error taxonomy, configuration, build events and logging setup shared by
//! the stagecraft build engine.

pub mod config;
pub mod error;
pub mod event;
pub mod log;

// Re-export commonly used types
pub use config::{EngineConfig, FetchConfig, SchedulerConfig};
pub use error::{BuildError, ErrorPhase, Result};
pub use event::{BuildEvent, EventEmitter};
pub use log::{init_tracing, LogConfig, LogFormat, LogLevel};

/// Stagecraft version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
