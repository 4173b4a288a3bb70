//! Logging initialisation for Conduit
//!
//! Installs a global `tracing` subscriber configured from
//! [`conduit_config::LoggingConfig`]. Records emitted through the `log`
//! facade (as the resilience crate does) are bridged into the same
//! subscriber.

pub mod init;

pub use conduit_config::domains::logging::{LogFormat, LogLevel};
pub use conduit_config::LoggingConfig;
pub use init::{build_env_filter, init_logging_from_config, init_simple_tracing};
