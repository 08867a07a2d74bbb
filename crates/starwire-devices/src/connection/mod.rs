/*!
 * Connection plugins.
 *
 * A connection plugin owns the transport to the hardware (a serial port, a
 * TCP socket) together with the operator-facing properties that configure
 * it. The device core selects one active plugin, asks it to connect, and
 * hands the opened port to the driver's handshake.
 */
use std::io::{Read, Write};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::property::{Property, Registry};

pub mod io;
pub mod serial;
pub mod tcp;

pub use serial::{BaudRate, PortOpener, SerialConnection};
pub use tcp::TcpConnection;

/// Lifecycle of a plugin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Not connected and not trying
    Idle,
    /// Opening the transport
    Connecting,
    /// Transport open, driver handshake running
    Handshaking,
    /// Handshake succeeded
    Connected,
    /// Last attempt failed
    Failed,
}

/// An open byte stream to the hardware
///
/// Reads must be bounded. A read with nothing to deliver returns `TimedOut`
/// or `WouldBlock` once the timeout given when the port was opened passes,
/// never blocking for good. Serial ports get it from the opener and TCP
/// streams from `set_read_timeout`.
pub trait PortIo: Read + Write + Send {
    /// Drop any unread input
    fn discard_input(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl PortIo for std::net::TcpStream {}

/// Driver-side check that the right hardware answers on a port
///
/// Called with `None` when the device runs in simulation.
///
/// The handshake runs inline on the device's task, so an async connect
/// timeout cannot cut it short. Wait for replies with [`io::read_until`] or
/// [`io::transact`], whose deadline bounds the whole exchange.
pub trait Handshake: Send {
    /// Talk to the hardware, returning an error if it does not respond
    fn handshake(&mut self, port: Option<&mut dyn PortIo>) -> Result<()>;
}

/// A pluggable transport
#[async_trait]
pub trait Connection: Send {
    /// Stable identifier, used as the element name in `CONNECTION_MODE`
    fn name(&self) -> &str;

    /// Display label
    fn label(&self) -> &str;

    /// The plugin's own properties, defined while it is the active plugin
    fn properties(&self, device: &str) -> Result<Vec<Property>>;

    /// Open the transport and run the handshake
    ///
    /// Reads its settings from `registry`. Returns the names of the
    /// properties it changed, which the device publishes and saves.
    async fn connect(
        &mut self,
        registry: &mut Registry,
        handshake: &mut dyn Handshake,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>>;

    /// Close the transport
    fn disconnect(&mut self) -> Result<()>;

    /// Current lifecycle state
    fn state(&self) -> ConnectionState;

    /// The open port, while connected
    fn port(&mut self) -> Option<&mut dyn PortIo>;

    /// Whether the plugin holds an open, handshaken transport
    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }
}
