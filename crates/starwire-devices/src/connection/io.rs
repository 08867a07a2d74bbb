/*!
 * Command/response helpers for drivers talking ASCII over a port.
 */
use std::io::ErrorKind;
use std::time::{Duration, Instant};

use tracing::trace;

use super::PortIo;
use crate::error::{DeviceError, Result};

/// Write a command, appending `terminator`
pub fn write_command(port: &mut dyn PortIo, command: &str, terminator: &str) -> Result<()> {
    trace!("TX: '{}{}'", command, terminator.escape_default());
    port.write_all(command.as_bytes())?;
    port.write_all(terminator.as_bytes())?;
    port.flush()?;
    Ok(())
}

/// Read until `terminator` arrives or `timeout` passes
///
/// The terminator is stripped from the returned text. Read timeouts from the
/// port itself are retried until the overall deadline; any other I/O error is
/// returned as is so the caller can treat it as a lost link.
pub fn read_until(port: &mut dyn PortIo, terminator: u8, timeout: Duration) -> Result<String> {
    let start = Instant::now();
    let mut response = Vec::new();
    let mut byte = [0u8; 1];

    while start.elapsed() < timeout {
        match port.read(&mut byte) {
            Ok(0) => {
                return Err(DeviceError::ConnectionLost("port closed by peer".to_string()));
            }
            Ok(_) if byte[0] == terminator => {
                let text = String::from_utf8_lossy(&response).to_string();
                trace!("RX: '{}'", text.escape_default());
                return Ok(text);
            }
            Ok(_) => response.push(byte[0]),
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
                continue;
            }
            Err(e) => return Err(e.into()),
        }
    }

    Err(DeviceError::Timeout(format!(
        "no terminator after {} ms ({} bytes read)",
        timeout.as_millis(),
        response.len()
    )))
}

/// Send a command and read one terminated response
pub fn transact(
    port: &mut dyn PortIo,
    command: &str,
    terminator: &str,
    response_terminator: u8,
    timeout: Duration,
) -> Result<String> {
    port.discard_input()?;
    write_command(port, command, terminator)?;
    read_until(port, response_terminator, timeout)
}

#[cfg(test)]
pub(crate) mod mock {
    //! In-memory port for tests.
    use std::collections::VecDeque;
    use std::io::{self, Read, Write};
    use std::sync::{Arc, Mutex};

    use super::PortIo;

    /// Scripted port: replies to each complete command line with a canned answer
    #[derive(Debug, Clone, Default)]
    pub struct ScriptedPort {
        pub input: Arc<Mutex<VecDeque<u8>>>,
        pub written: Arc<Mutex<Vec<u8>>>,
        pub fail_reads: bool,
    }

    impl ScriptedPort {
        pub fn with_input(bytes: &[u8]) -> Self {
            let port = Self::default();
            port.input.lock().unwrap().extend(bytes.iter().copied());
            port
        }
    }

    impl Read for ScriptedPort {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.fail_reads {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "unplugged"));
            }
            let mut input = self.input.lock().unwrap();
            match input.pop_front() {
                Some(b) if !buf.is_empty() => {
                    buf[0] = b;
                    Ok(1)
                }
                _ => Err(io::Error::new(io::ErrorKind::TimedOut, "no data")),
            }
        }
    }

    impl Write for ScriptedPort {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl PortIo for ScriptedPort {}
}

#[cfg(test)]
mod tests {
    use super::mock::ScriptedPort;
    use super::*;

    #[test]
    fn test_transact() {
        let mut port = ScriptedPort::with_input(b"*A00000#");
        let reply = transact(&mut port, ">P000", "\r", b'#', Duration::from_millis(100)).unwrap();
        assert_eq!(reply, "*A00000");
        assert_eq!(port.written.lock().unwrap().as_slice(), b">P000\r");
    }

    #[test]
    fn test_read_until_times_out() {
        let mut port = ScriptedPort::with_input(b"partial");
        let err = read_until(&mut port, b'#', Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, DeviceError::Timeout(_)));
    }

    #[test]
    fn test_broken_port_is_a_link_failure() {
        let mut port = ScriptedPort {
            fail_reads: true,
            ..Default::default()
        };
        let err = read_until(&mut port, b'#', Duration::from_millis(20)).unwrap_err();
        assert!(err.is_link_failure());
    }
}
