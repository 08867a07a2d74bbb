/*!
 * Error types for the starwire engine crate.
 */
use thiserror::Error;

/// Error type for starwire engine operations
#[derive(Error, Debug)]
pub enum Error {
    /// The line transport failed or was closed
    #[error("Transport error: {0}")]
    Transport(String),

    /// The reactor cannot continue
    #[error("Reactor error: {0}")]
    Reactor(String),

    /// No device with that name is hosted here
    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    /// A device with that name is already hosted here
    #[error("Device already exists: {0}")]
    DuplicateDevice(String),

    /// Device error
    #[error("Device error: {0}")]
    Device(#[from] starwire_devices::DeviceError),

    /// Core error
    #[error("Core error: {0}")]
    Core(#[from] starwire_core::error::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Other error
    #[error("Other error: {0}")]
    Other(String),
}

/// Result type for starwire engine operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a new transport error
    pub fn transport<S: AsRef<str>>(msg: S) -> Self {
        Error::Transport(msg.as_ref().to_string())
    }

    /// Create a new reactor error
    pub fn reactor<S: AsRef<str>>(msg: S) -> Self {
        Error::Reactor(msg.as_ref().to_string())
    }

    /// Create a new other error
    pub fn other<S: AsRef<str>>(msg: S) -> Self {
        Error::Other(msg.as_ref().to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}
