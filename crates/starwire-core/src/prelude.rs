/*!
 * Prelude module for starwire core.
 *
 * This module re-exports commonly used types and functions from the core
 * crate to make them easier to import.
 */

// Re-export error types
pub use crate::error::{Error, Result};

// Re-export config types
pub use crate::config::{Config, ConfigBuilder, SharedConfig};

// Re-export timer types
pub use crate::timer::{Deadline, DeadlineStep, Scheduler, TimerId};

// Re-export utility functions
pub use crate::utils::{run_blocking, spawn_and_log, with_timeout};

// Re-export logging macros
pub use tracing::{debug, error, info, trace, warn};

// Re-export core initialization
pub use crate::init;
