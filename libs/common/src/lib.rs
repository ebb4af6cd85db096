//! Gateway basic library
//!
//! Provides functions shared by all services:
//! - logging initialisation and runtime level control
//! - graceful shutdown signal handling

pub mod logging;
pub mod shutdown;

pub use logging::{get_log_level, init_with_config, set_log_level, LogConfig};
pub use shutdown::{run_with_watchdog, wait_for_shutdown, ShutdownSignal};
