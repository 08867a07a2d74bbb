/*!
 * starwire Engine
 *
 * This crate hosts starwire devices in a driver process: a single-task
 * reactor that runs their timers and worker results, a router for snoop
 * subscriptions between them, and the newline-delimited JSON transport
 * that connects the process to a client.
 */

#![warn(missing_docs)]

// Re-export core types
pub use starwire_core::prelude;

pub mod error;
pub mod reactor;
pub mod router;
pub mod transport;

// Re-export main types for convenience
pub use error::{Error, Result};
pub use reactor::{DeviceHandle, Reactor};
pub use router::SnoopRouter;
pub use transport::{serve, serve_stdio, LineReader, LineWriter};

/// starwire engine crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the engine
pub fn init() -> Result<()> {
    tracing::info!("starwire engine {} initialized", VERSION);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
