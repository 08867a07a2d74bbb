/*!
 * Serial connection plugin.
 *
 * Opens the configured port at the configured baud rate and runs the
 * driver's handshake. When that fails and auto-search is enabled, the other
 * plausible ports on the host are tried in random order with a randomized
 * pause between attempts, and the first one that answers is written back to
 * the port property so it is saved with the device configuration.
 */
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use starwire_core::config::SerialConfig;
use starwire_core::utils::run_blocking;

use super::{Connection, ConnectionState, Handshake, PortIo};
use crate::discovery;
use crate::error::{DeviceError, Result};
use crate::property::{
    Property, PropertyBuilder, PropertyState, PropertyValues, Registry, SwitchElement, SwitchRule,
    SwitchState, TextElement,
};

/// Port path property
pub const PORT_PROPERTY: &str = "DEVICE_PORT";
/// Port path element
pub const PORT_ELEMENT: &str = "PORT";
/// Baud rate property
pub const BAUD_PROPERTY: &str = "DEVICE_BAUD_RATE";
/// Auto-search toggle property
pub const AUTO_SEARCH_PROPERTY: &str = "DEVICE_AUTO_SEARCH";
/// Auto-search enabled element
pub const AUTO_SEARCH_ENABLED: &str = "INDI_ENABLED";
/// Auto-search disabled element
pub const AUTO_SEARCH_DISABLED: &str = "INDI_DISABLED";

const GROUP: &str = "Connection";

/// Supported baud rates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BaudRate {
    /// 9600 baud
    B9600,
    /// 19200 baud
    B19200,
    /// 38400 baud
    B38400,
    /// 57600 baud
    B57600,
    /// 115200 baud
    B115200,
    /// 230400 baud
    B230400,
}

impl BaudRate {
    /// All rates, slowest first
    pub const ALL: [BaudRate; 6] = [
        BaudRate::B9600,
        BaudRate::B19200,
        BaudRate::B38400,
        BaudRate::B57600,
        BaudRate::B115200,
        BaudRate::B230400,
    ];

    /// Bits per second
    pub fn bps(&self) -> u32 {
        match self {
            BaudRate::B9600 => 9600,
            BaudRate::B19200 => 19200,
            BaudRate::B38400 => 38400,
            BaudRate::B57600 => 57600,
            BaudRate::B115200 => 115200,
            BaudRate::B230400 => 230400,
        }
    }

    /// Rate for a bits-per-second value
    pub fn from_bps(bps: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|b| b.bps() == bps)
    }

    /// Element name in the baud rate property
    pub fn element(&self) -> String {
        self.bps().to_string()
    }

    fn from_element(name: &str) -> Option<Self> {
        name.parse().ok().and_then(Self::from_bps)
    }
}

/// Access to the host's serial ports
///
/// Split out so auto-search can run against a fake set of ports.
pub trait PortOpener: Send + Sync {
    /// Names of all serial ports on the host
    fn available_ports(&self) -> Result<Vec<String>>;

    /// Open `path` at `baud` with `timeout` applied to reads and writes
    ///
    /// Must fail with `PortBusy` when another process holds the port.
    fn open(&self, path: &str, baud: u32, timeout: Duration) -> Result<Box<dyn PortIo>>;
}

/// The host's real serial ports
#[cfg(feature = "serial")]
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemPorts;

#[cfg(feature = "serial")]
impl PortOpener for SystemPorts {
    fn available_ports(&self) -> Result<Vec<String>> {
        discovery::system_ports()
    }

    fn open(&self, path: &str, baud: u32, timeout: Duration) -> Result<Box<dyn PortIo>> {
        let port = serialport::new(path, baud)
            .timeout(timeout)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .open()
            .map_err(|e| open_error(path, e))?;
        Ok(Box::new(port))
    }
}

#[cfg(feature = "serial")]
fn open_error(path: &str, err: serialport::Error) -> DeviceError {
    let text = err.to_string();
    if text.to_lowercase().contains("busy") || text.contains("os error 16") {
        DeviceError::PortBusy(path.to_string())
    } else {
        DeviceError::connection(format!("Failed to open {}: {}", path, text))
    }
}

#[cfg(feature = "serial")]
impl PortIo for Box<dyn serialport::SerialPort> {
    fn discard_input(&mut self) -> std::io::Result<()> {
        self.clear(serialport::ClearBuffer::Input)
            .map_err(std::io::Error::from)
    }
}

struct Settings {
    path: String,
    baud: BaudRate,
    auto_search: bool,
}

/// Sleep a random time in `[min_ms, max_ms]`, returning early with
/// `Cancelled` if the token fires
async fn backoff(min_ms: u64, max_ms: u64, cancel: &CancellationToken) -> Result<()> {
    let delay = Duration::from_millis(rand::thread_rng().gen_range(min_ms..=max_ms.max(min_ms)));
    debug!("Backing off {} ms before the next port", delay.as_millis());
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(DeviceError::Cancelled("port auto-search cancelled".to_string())),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

/// Serial connection plugin
pub struct SerialConnection {
    opener: Arc<dyn PortOpener>,
    config: SerialConfig,
    state: ConnectionState,
    port: Option<Box<dyn PortIo>>,
    active_port: Option<String>,
}

impl SerialConnection {
    /// Create a plugin over the given port opener
    pub fn new(opener: Arc<dyn PortOpener>, config: SerialConfig) -> Self {
        Self {
            opener,
            config,
            state: ConnectionState::Idle,
            port: None,
            active_port: None,
        }
    }

    /// Create a plugin over the host's serial ports
    #[cfg(feature = "serial")]
    pub fn system(config: SerialConfig) -> Self {
        Self::new(Arc::new(SystemPorts), config)
    }

    /// Port currently open
    pub fn active_port(&self) -> Option<&str> {
        self.active_port.as_deref()
    }

    fn default_baud(&self) -> BaudRate {
        BaudRate::from_bps(self.config.default_baud).unwrap_or(BaudRate::B9600)
    }

    fn io_timeout(&self) -> Duration {
        self.config.io_timeout()
    }

    fn settings(&self, registry: &Registry) -> Settings {
        let path = registry
            .get(PORT_PROPERTY)
            .and_then(|p| p.text(PORT_ELEMENT))
            .map(str::to_string)
            .unwrap_or_else(|| self.config.default_port.clone());
        let baud = registry
            .get(BAUD_PROPERTY)
            .and_then(|p| p.first_on())
            .and_then(BaudRate::from_element)
            .unwrap_or_else(|| self.default_baud());
        let auto_search = registry
            .get(AUTO_SEARCH_PROPERTY)
            .and_then(|p| p.switch(AUTO_SEARCH_ENABLED))
            .map(|s| s == SwitchState::On)
            .unwrap_or(self.config.auto_search);
        Settings {
            path,
            baud,
            auto_search,
        }
    }

    async fn try_port(&mut self, path: &str, baud: BaudRate, handshake: &mut dyn Handshake) -> Result<()> {
        self.state = ConnectionState::Connecting;
        debug!("Opening {} at {} baud", path, baud.bps());

        let opener = Arc::clone(&self.opener);
        let target = path.to_string();
        let timeout = self.io_timeout();
        let opened = run_blocking("serial-open", move || opener.open(&target, baud.bps(), timeout)).await?;
        let mut port = match opened {
            Ok(port) => port,
            Err(e) => {
                self.state = ConnectionState::Failed;
                return Err(e);
            }
        };

        // Runs inline; every read on `port` gives up after `timeout`
        self.state = ConnectionState::Handshaking;
        if let Err(e) = handshake.handshake(Some(port.as_mut())) {
            self.state = ConnectionState::Failed;
            return Err(match e {
                DeviceError::HandshakeFailed(_) => e,
                other => DeviceError::handshake(format!("{}: {}", path, other)),
            });
        }

        self.port = Some(port);
        self.active_port = Some(path.to_string());
        self.state = ConnectionState::Connected;
        Ok(())
    }

    async fn auto_search(
        &mut self,
        registry: &mut Registry,
        settings: &Settings,
        handshake: &mut dyn Handshake,
        cancel: &CancellationToken,
        first: DeviceError,
    ) -> Result<Vec<String>> {
        let available = match self.opener.available_ports() {
            Ok(ports) => ports,
            Err(e) => {
                debug!("Port enumeration failed: {}", e);
                return Err(first);
            }
        };

        let mut candidates = discovery::candidate_ports(&available, &self.config.candidate_filters, &settings.path);
        if candidates.is_empty() {
            return Err(first);
        }
        candidates.shuffle(&mut rand::thread_rng());

        info!(
            "Connection on {} failed, searching {} other port(s)",
            settings.path,
            candidates.len()
        );

        let tried = candidates.len();
        for candidate in candidates {
            backoff(self.config.backoff_min_ms, self.config.backoff_max_ms, cancel).await?;
            if cancel.is_cancelled() {
                return Err(DeviceError::Cancelled("port auto-search cancelled".to_string()));
            }

            match self.try_port(&candidate, settings.baud, handshake).await {
                Ok(()) => {
                    info!("Found device on {} at {} baud", candidate, settings.baud.bps());
                    self.record_selection(registry, &candidate, settings.baud)?;
                    return Ok(vec![PORT_PROPERTY.to_string(), BAUD_PROPERTY.to_string()]);
                }
                Err(DeviceError::PortBusy(port)) => debug!("{} is busy, skipping", port),
                Err(e) => debug!("No device on {}: {}", candidate, e),
            }
        }

        Err(DeviceError::NoCandidatePorts(format!(
            "no device answered on any of {} port(s)",
            tried
        )))
    }

    fn record_selection(&self, registry: &mut Registry, path: &str, baud: BaudRate) -> Result<()> {
        if let Some(property) = registry.get_mut(PORT_PROPERTY) {
            property.update_values(
                &PropertyValues::Text(vec![(PORT_ELEMENT.to_string(), path.to_string())]),
                PropertyState::Ok,
            )?;
        }
        if let Some(property) = registry.get_mut(BAUD_PROPERTY) {
            property.update_values(
                &PropertyValues::Switch(vec![(baud.element(), SwitchState::On)]),
                PropertyState::Ok,
            )?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for SerialConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialConnection")
            .field("state", &self.state)
            .field("active_port", &self.active_port)
            .finish()
    }
}

#[async_trait]
impl Connection for SerialConnection {
    fn name(&self) -> &str {
        "CONNECTION_SERIAL"
    }

    fn label(&self) -> &str {
        "Serial"
    }

    fn properties(&self, device: &str) -> Result<Vec<Property>> {
        let default_baud = self.default_baud();

        let port = PropertyBuilder::new(device, PORT_PROPERTY)
            .label("Ports")
            .group(GROUP)
            .timeout(60.0)
            .persist()
            .texts(vec![TextElement::new(PORT_ELEMENT, "Port", self.config.default_port.clone())])
            .build()?;

        let baud = PropertyBuilder::new(device, BAUD_PROPERTY)
            .label("Baud Rate")
            .group(GROUP)
            .timeout(60.0)
            .persist()
            .switches(
                SwitchRule::OneOfMany,
                BaudRate::ALL
                    .iter()
                    .map(|b| SwitchElement::new(b.element(), b.element(), SwitchState::from(*b == default_baud)))
                    .collect(),
            )
            .build()?;

        let auto_search = PropertyBuilder::new(device, AUTO_SEARCH_PROPERTY)
            .label("Auto Search")
            .group(GROUP)
            .persist()
            .switches(
                SwitchRule::OneOfMany,
                vec![
                    SwitchElement::new(AUTO_SEARCH_ENABLED, "Enabled", SwitchState::from(self.config.auto_search)),
                    SwitchElement::new(AUTO_SEARCH_DISABLED, "Disabled", SwitchState::from(!self.config.auto_search)),
                ],
            )
            .build()?;

        Ok(vec![port, baud, auto_search])
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

        let settings = self.settings(registry);
        info!("Connecting to {} at {} baud", settings.path, settings.baud.bps());

        let first = match self.try_port(&settings.path, settings.baud, handshake).await {
            Ok(()) => return Ok(Vec::new()),
            Err(e) => e,
        };
        warn!("Failed to connect on {}: {}", settings.path, first);

        if !settings.auto_search {
            return Err(first);
        }

        let result = self.auto_search(registry, &settings, handshake, cancel, first).await;
        if result.is_err() {
            self.state = ConnectionState::Failed;
        }
        result
    }

    fn disconnect(&mut self) -> Result<()> {
        if let Some(port) = self.active_port.take() {
            debug!("Closing {}", port);
        }
        self.port = None;
        self.state = ConnectionState::Idle;
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        self.state
    }

    fn port(&mut self) -> Option<&mut dyn PortIo> {
        match self.port.as_mut() {
            Some(port) => {
                let port: &mut dyn PortIo = port.as_mut();
                Some(port)
            }
            None => None,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::mock::{MockPorts, PingHandshake};
    use super::*;

    fn registry_for(plugin: &SerialConnection, port: &str) -> Registry {
        let mut registry = Registry::new();
        for property in plugin.properties("Dome").unwrap() {
            registry.insert(property).unwrap();
        }
        registry
            .require_mut(PORT_PROPERTY)
            .unwrap()
            .update_values(
                &PropertyValues::Text(vec![(PORT_ELEMENT.to_string(), port.to_string())]),
                PropertyState::Idle,
            )
            .unwrap();
        registry
    }

    fn five_ports() -> Arc<MockPorts> {
        Arc::new(MockPorts::new(
            &["/dev/ttyUSB0", "/dev/ttyUSB1", "/dev/ttyUSB2", "/dev/ttyUSB3", "/dev/ttyUSB4"],
            &["/dev/ttyUSB3"],
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_configured_port_connects_directly() {
        let ports = five_ports();
        let mut plugin = SerialConnection::new(ports.clone(), SerialConfig::default());
        let mut registry = registry_for(&plugin, "/dev/ttyUSB3");

        let changed = plugin
            .connect(&mut registry, &mut PingHandshake::default(), &CancellationToken::new())
            .await
            .unwrap();

        assert!(changed.is_empty());
        assert!(plugin.is_connected());
        assert!(plugin.port().is_some());
        assert_eq!(ports.opened(), vec!["/dev/ttyUSB3"]);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_auto_search_finds_the_answering_port() {
        let ports = five_ports();
        let mut plugin = SerialConnection::new(ports.clone(), SerialConfig::default());
        let mut registry = registry_for(&plugin, "/dev/ttyUSB9");
        registry
            .require_mut(BAUD_PROPERTY)
            .unwrap()
            .update_values(
                &PropertyValues::Switch(vec![("115200".to_string(), SwitchState::On)]),
                PropertyState::Idle,
            )
            .unwrap();

        let changed = plugin
            .connect(&mut registry, &mut PingHandshake::default(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(changed, vec![PORT_PROPERTY.to_string(), BAUD_PROPERTY.to_string()]);
        assert_eq!(plugin.active_port(), Some("/dev/ttyUSB3"));
        assert_eq!(
            registry.get(PORT_PROPERTY).unwrap().text(PORT_ELEMENT),
            Some("/dev/ttyUSB3")
        );
        assert_eq!(registry.get(BAUD_PROPERTY).unwrap().first_on(), Some("115200"));

        let opened = ports.opened();
        assert_eq!(opened[0], "/dev/ttyUSB9");
        assert_eq!(opened.last().map(String::as_str), Some("/dev/ttyUSB3"));
        assert_eq!(opened.iter().filter(|p| *p == "/dev/ttyUSB3").count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_search_leaves_configuration_unchanged() {
        let ports = Arc::new(MockPorts::new(&["/dev/ttyUSB0", "/dev/ttyUSB1", "/dev/ttyUSB2"], &[]));
        let mut plugin = SerialConnection::new(ports.clone(), SerialConfig::default());
        let mut registry = registry_for(&plugin, "/dev/ttyUSB0");

        let err = plugin
            .connect(&mut registry, &mut PingHandshake::default(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, DeviceError::NoCandidatePorts(_)));
        assert_eq!(plugin.state(), ConnectionState::Failed);
        assert_eq!(
            registry.get(PORT_PROPERTY).unwrap().text(PORT_ELEMENT),
            Some("/dev/ttyUSB0")
        );
        assert_eq!(ports.opened().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_search_disabled_returns_first_error() {
        let ports = five_ports();
        let mut plugin = SerialConnection::new(ports.clone(), SerialConfig::default());
        let mut registry = registry_for(&plugin, "/dev/ttyUSB0");
        registry
            .require_mut(AUTO_SEARCH_PROPERTY)
            .unwrap()
            .update_values(
                &PropertyValues::Switch(vec![(AUTO_SEARCH_DISABLED.to_string(), SwitchState::On)]),
                PropertyState::Idle,
            )
            .unwrap();

        let err = plugin
            .connect(&mut registry, &mut PingHandshake::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DeviceError::HandshakeFailed(_)));
        assert_eq!(ports.opened(), vec!["/dev/ttyUSB0"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_port_is_not_retried() {
        let mut mock = MockPorts::new(&["/dev/ttyUSB0", "/dev/ttyUSB1"], &["/dev/ttyUSB1"]);
        mock.busy.insert("/dev/ttyUSB0".to_string());
        let ports = Arc::new(mock);
        let mut plugin = SerialConnection::new(ports.clone(), SerialConfig::default());
        let mut registry = registry_for(&plugin, "/dev/ttyUSB0");

        plugin
            .connect(&mut registry, &mut PingHandshake::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(ports.opened(), vec!["/dev/ttyUSB0", "/dev/ttyUSB1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_port_handshake_gives_up() {
        let ports = Arc::new(MockPorts::new(&["/dev/ttyUSB0"], &[]));
        let config = SerialConfig {
            io_timeout_ms: 250,
            auto_search: false,
            ..SerialConfig::default()
        };
        let mut plugin = SerialConnection::new(ports.clone(), config);
        let mut registry = registry_for(&plugin, "/dev/ttyUSB0");
        let mut handshake = PingHandshake {
            timeout: Duration::from_millis(50),
            ..Default::default()
        };

        let started = std::time::Instant::now();
        let err = plugin
            .connect(&mut registry, &mut handshake, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, DeviceError::HandshakeFailed(_)));
        assert!(err.to_string().contains("no terminator"));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(handshake.calls, 1);
        assert_eq!(*ports.timeouts.lock().unwrap(), vec![Duration::from_millis(250)]);
        assert_eq!(plugin.state(), ConnectionState::Failed);
        assert!(plugin.port().is_none());
    }

    struct CancellingHandshake {
        token: CancellationToken,
    }

    impl Handshake for CancellingHandshake {
        fn handshake(&mut self, _port: Option<&mut dyn PortIo>) -> Result<()> {
            self.token.cancel();
            Err(DeviceError::handshake("no reply"))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_search_before_next_port() {
        let ports = five_ports();
        let mut plugin = SerialConnection::new(ports.clone(), SerialConfig::default());
        let mut registry = registry_for(&plugin, "/dev/ttyUSB0");
        let token = CancellationToken::new();
        let mut handshake = CancellingHandshake { token: token.clone() };

        let err = plugin.connect(&mut registry, &mut handshake, &token).await.unwrap_err();

        assert!(matches!(err, DeviceError::Cancelled(_)));
        assert_eq!(ports.opened(), vec!["/dev/ttyUSB0"]);
        assert_eq!(
            registry.get(PORT_PROPERTY).unwrap().text(PORT_ELEMENT),
            Some("/dev/ttyUSB0")
        );
    }

    #[test]
    fn test_baud_rates() {
        assert_eq!(BaudRate::from_bps(57600), Some(BaudRate::B57600));
        assert_eq!(BaudRate::from_bps(1200), None);
        assert_eq!(BaudRate::from_element("230400"), Some(BaudRate::B230400));
    }
}
