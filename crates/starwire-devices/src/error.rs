/*!
 * Error types for device, property and connection operations.
 */
use thiserror::Error;

use starwire_core::error::Error as CoreError;

/// Error type for device operations
#[derive(Error, Debug)]
pub enum DeviceError {
    /// A switch update would violate the vector's rule
    #[error("Invalid state transition for {0}: {1}")]
    InvalidStateTransition(String, String),

    /// A number falls outside its element's bounds
    #[error("Value out of range for {property}.{element}: {value} not in [{min}, {max}]")]
    OutOfRange {
        /// Property name
        property: String,
        /// Element name
        element: String,
        /// Rejected value
        value: f64,
        /// Lower bound
        min: f64,
        /// Upper bound
        max: f64,
    },

    /// The property is not registered on the device
    #[error("Unknown property: {0}")]
    UnknownProperty(String),

    /// The property has no element with that name
    #[error("Unknown element {1} in property {0}")]
    UnknownElement(String, String),

    /// A property with that name is already registered
    #[error("Property already defined: {0}")]
    DuplicateProperty(String),

    /// Supplied values do not match the vector's element kind
    #[error("Type mismatch for property {0}: expected {1}, got {2}")]
    TypeMismatch(String, String, String),

    /// The vector's permission forbids the operation
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// A property definition breaks a model invariant
    #[error("Invalid property definition: {0}")]
    InvalidDefinition(String),

    /// The serial port is held by another process
    #[error("Port busy: {0}")]
    PortBusy(String),

    /// The port opened but the peer did not answer as expected
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    /// Auto-search found no port that answered
    #[error("No candidate ports: {0}")]
    NoCandidatePorts(String),

    /// The transport could not be opened
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// An established connection went away
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// The device is not connected
    #[error("Device not connected")]
    NotConnected,

    /// An incoming wire record could not be understood
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// The operation was cancelled
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Timeout error
    #[error("Timeout: {0}")]
    Timeout(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Other error
    #[error("Other error: {0}")]
    Other(String),

    /// Core error
    #[error("Core error: {0}")]
    Core(#[from] CoreError),
}

/// Result type for device operations
pub type Result<T> = std::result::Result<T, DeviceError>;

impl DeviceError {
    /// Create a new malformed message error
    pub fn malformed<S: AsRef<str>>(msg: S) -> Self {
        DeviceError::MalformedMessage(msg.as_ref().to_string())
    }

    /// Create a new handshake error
    pub fn handshake<S: AsRef<str>>(msg: S) -> Self {
        DeviceError::HandshakeFailed(msg.as_ref().to_string())
    }

    /// Create a new connection error
    pub fn connection<S: AsRef<str>>(msg: S) -> Self {
        DeviceError::ConnectionFailed(msg.as_ref().to_string())
    }

    /// Create a new other error
    pub fn other<S: AsRef<str>>(msg: S) -> Self {
        DeviceError::Other(msg.as_ref().to_string())
    }

    /// Whether the error means the hardware link is gone
    ///
    /// Driver hooks returning one of these force a Disconnected transition.
    pub fn is_link_failure(&self) -> bool {
        match self {
            DeviceError::ConnectionLost(_) => true,
            DeviceError::Io(e) => !matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for DeviceError {
    fn from(err: serde_json::Error) -> Self {
        DeviceError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_failure_classification() {
        let lost = DeviceError::ConnectionLost("unplugged".to_string());
        assert!(lost.is_link_failure());

        let broken = DeviceError::Io(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone"));
        assert!(broken.is_link_failure());

        let slow = DeviceError::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, "slow"));
        assert!(!slow.is_link_failure());

        assert!(!DeviceError::UnknownProperty("X".to_string()).is_link_failure());
    }

    #[test]
    fn test_out_of_range_message() {
        let err = DeviceError::OutOfRange {
            property: "FOCUS".to_string(),
            element: "POS".to_string(),
            value: 110.0,
            min: 0.0,
            max: 100.0,
        };
        assert_eq!(
            err.to_string(),
            "Value out of range for FOCUS.POS: 110 not in [0, 100]"
        );
    }
}
