/*!
 * starwire Devices
 *
 * This crate provides the device side of the starwire protocol: typed
 * property vectors, the wire records that carry them, connection plugins
 * for serial and TCP hardware, the device core that drives the connection
 * lifecycle, snooping on peers, and per-device configuration persistence.
 */

#![warn(missing_docs)]

// Re-export core types
pub use starwire_core::prelude;

pub mod connection;
pub mod device;
pub mod devices;
pub mod discovery;
pub mod error;
pub mod property;
pub mod protocol;
pub mod snoop;
pub mod store;

// Re-export the types drivers use most
pub use device::{Device, DeviceCore, Driver, DriverContext, DriverInfo, JobResult};
pub use error::{DeviceError, Result};
pub use property::{Property, PropertyBuilder, PropertyState, PropertyValues, Registry};
pub use protocol::Message;
pub use snoop::{SnoopEvent, SnoopKey};

/// starwire devices crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the device system
pub fn init() -> std::result::Result<(), starwire_core::error::Error> {
    tracing::info!("starwire devices {} initialized", VERSION);
    Ok(())
}
