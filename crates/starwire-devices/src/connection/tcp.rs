/*!
 * TCP connection plugin.
 */
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use starwire_core::config::TcpConfig;
use starwire_core::utils::run_blocking;

use super::{Connection, ConnectionState, Handshake, PortIo};
use crate::error::{DeviceError, Result};
use crate::property::{Property, PropertyBuilder, Registry, TextElement};

/// Address property
pub const ADDRESS_PROPERTY: &str = "DEVICE_ADDRESS";
/// Host element
pub const HOST_ELEMENT: &str = "ADDRESS";
/// Port element
pub const PORT_ELEMENT: &str = "PORT";

/// TCP connection plugin
#[derive(Debug)]
pub struct TcpConnection {
    config: TcpConfig,
    state: ConnectionState,
    stream: Option<TcpStream>,
}

impl TcpConnection {
    /// Create a plugin with the given defaults
    pub fn new(config: TcpConfig) -> Self {
        Self {
            config,
            state: ConnectionState::Idle,
            stream: None,
        }
    }

    fn endpoint(&self, registry: &Registry) -> Result<(String, u16)> {
        let property = registry.get(ADDRESS_PROPERTY);
        let host = property
            .and_then(|p| p.text(HOST_ELEMENT))
            .map(str::to_string)
            .unwrap_or_else(|| self.config.default_host.clone());
        let port = match property.and_then(|p| p.text(PORT_ELEMENT)) {
            Some(text) => text
                .trim()
                .parse::<u16>()
                .map_err(|_| DeviceError::connection(format!("Invalid TCP port '{}'", text)))?,
            None => self.config.default_port,
        };
        if host.trim().is_empty() {
            return Err(DeviceError::connection("No host configured"));
        }
        Ok((host.trim().to_string(), port))
    }
}

fn open_stream(host: &str, port: u16, timeout: Duration) -> Result<TcpStream> {
    let addr = (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| DeviceError::connection(format!("{} did not resolve", host)))?;
    let stream = TcpStream::connect_timeout(&addr, timeout)
        .map_err(|e| DeviceError::connection(format!("{}:{}: {}", host, port, e)))?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

#[async_trait]
impl Connection for TcpConnection {
    fn name(&self) -> &str {
        "CONNECTION_TCP"
    }

    fn label(&self) -> &str {
        "Network"
    }

    fn properties(&self, device: &str) -> Result<Vec<Property>> {
        let address = PropertyBuilder::new(device, ADDRESS_PROPERTY)
            .label("Server")
            .group("Connection")
            .timeout(60.0)
            .persist()
            .texts(vec![
                TextElement::new(HOST_ELEMENT, "Address", self.config.default_host.clone()),
                TextElement::new(PORT_ELEMENT, "Port", self.config.default_port.to_string()),
            ])
            .build()?;
        Ok(vec![address])
    }

    async fn connect(
        &mut self,
        registry: &mut Registry,
        handshake: &mut dyn Handshake,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>> {
        if cancel.is_cancelled() {
            return Err(DeviceError::Cancelled("connect cancelled".to_string()));
        }

        let (host, port) = self.endpoint(registry)?;
        info!("Connecting to {}:{}", host, port);
        self.state = ConnectionState::Connecting;

        let timeout = Duration::from_millis(self.config.timeout_ms);
        let target = host.clone();
        let opened = run_blocking("tcp-connect", move || open_stream(&target, port, timeout)).await?;
        let mut stream = match opened {
            Ok(stream) => stream,
            Err(e) => {
                self.state = ConnectionState::Failed;
                return Err(e);
            }
        };

        self.state = ConnectionState::Handshaking;
        if let Err(e) = handshake.handshake(Some(&mut stream)) {
            self.state = ConnectionState::Failed;
            return Err(e);
        }

        debug!("Connected to {}:{}", host, port);
        self.stream = Some(stream);
        self.state = ConnectionState::Connected;
        Ok(Vec::new())
    }

    fn disconnect(&mut self) -> Result<()> {
        if let Some(stream) = self.stream.take() {
            // The socket closes on drop either way
            if let Err(e) = stream.shutdown(std::net::Shutdown::Both) {
                warn!("Shutting down the TCP stream failed: {}", e);
            }
        }
        self.state = ConnectionState::Idle;
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        self.state
    }

    fn port(&mut self) -> Option<&mut dyn PortIo> {
        match self.stream.as_mut() {
            Some(stream) => Some(stream),
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::net::TcpListener;

    use super::*;
    use crate::connection::serial::mock::PingHandshake;
    use crate::property::{PropertyState, PropertyValues};

    fn registry_for(plugin: &TcpConnection, port: u16) -> Registry {
        let mut registry = Registry::new();
        for property in plugin.properties("Weather").unwrap() {
            registry.insert(property).unwrap();
        }
        registry
            .require_mut(ADDRESS_PROPERTY)
            .unwrap()
            .update_values(
                &PropertyValues::Text(vec![
                    (HOST_ELEMENT.to_string(), "127.0.0.1".to_string()),
                    (PORT_ELEMENT.to_string(), port.to_string()),
                ]),
                PropertyState::Idle,
            )
            .unwrap();
        registry
    }

    #[tokio::test]
    async fn test_connects_and_handshakes() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = std::thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            socket.write_all(b"OK#").unwrap();
            std::thread::sleep(Duration::from_millis(50));
        });

        let mut plugin = TcpConnection::new(TcpConfig::default());
        let mut registry = registry_for(&plugin, port);
        let mut handshake = PingHandshake::default();
        handshake.timeout = Duration::from_millis(500);

        plugin
            .connect(&mut registry, &mut handshake, &CancellationToken::new())
            .await
            .unwrap();
        assert!(plugin.is_connected());
        assert_eq!(handshake.calls, 1);

        plugin.disconnect().unwrap();
        assert_eq!(plugin.state(), ConnectionState::Idle);
        assert!(plugin.port().is_none());
        server.join().unwrap();
    }

    #[tokio::test]
    async fn test_silent_peer_handshake_gives_up() {
        // Never accepted, but the kernel still completes the connect
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut plugin = TcpConnection::new(TcpConfig {
            timeout_ms: 100,
            ..TcpConfig::default()
        });
        let mut registry = registry_for(&plugin, port);
        let mut handshake = PingHandshake::default();
        handshake.timeout = Duration::from_millis(50);

        let started = std::time::Instant::now();
        let err = plugin
            .connect(&mut registry, &mut handshake, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, DeviceError::HandshakeFailed(_)));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(plugin.state(), ConnectionState::Failed);
        assert!(!plugin.is_connected());
        drop(listener);
    }

    #[tokio::test]
    async fn test_refused_connection_fails() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let mut plugin = TcpConnection::new(TcpConfig::default());
        let mut registry = registry_for(&plugin, port);
        let err = plugin
            .connect(&mut registry, &mut PingHandshake::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DeviceError::ConnectionFailed(_)));
        assert_eq!(plugin.state(), ConnectionState::Failed);
    }

    #[test]
    fn test_invalid_port_text() {
        let plugin = TcpConnection::new(TcpConfig::default());
        let mut registry = registry_for(&plugin, 1);
        registry
            .require_mut(ADDRESS_PROPERTY)
            .unwrap()
            .update_values(
                &PropertyValues::Text(vec![(PORT_ELEMENT.to_string(), "http".to_string())]),
                PropertyState::Idle,
            )
            .unwrap();
        assert!(plugin.endpoint(&registry).is_err());
    }
}
