/*!
 * Device core and driver hooks.
 *
 * A [`Device`] pairs a [`DeviceCore`] (property registry, outbox, timers,
 * connection plugins, snoop subscriptions) with a [`Driver`] supplying the
 * instrument-specific behavior. All mutation happens on the caller's task:
 * the reactor hands the device one message, timer batch or worker result at
 * a time and collects the resulting wire records from the outbox.
 */
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use starwire_core::config::{Config, SharedConfig};
use starwire_core::timer::{Scheduler, TimerId};
use starwire_core::utils::{spawn_and_log, with_timeout};

use crate::connection::{Connection, Handshake, PortIo};
use crate::error::{DeviceError, Result};
use crate::property::{
    BlobValue, NumberElement, Property, PropertyBuilder, PropertyState, PropertyValues, Registry,
    SwitchElement, SwitchRule, SwitchState, TextElement,
};
use crate::protocol::Message;
use crate::snoop::{SnoopBus, SnoopEvent, SnoopKey};
use crate::store::{ConfigStore, DeviceRecord, FileConfigStore, MemoryConfigStore, SharedConfigStore};

/// Connection switch
pub const CONNECTION: &str = "CONNECTION";
/// Connect element
pub const CONNECT: &str = "CONNECT";
/// Disconnect element
pub const DISCONNECT: &str = "DISCONNECT";
/// Driver description
pub const DRIVER_INFO: &str = "DRIVER_INFO";
/// Debug toggle
pub const DEBUG: &str = "DEBUG";
/// Simulation toggle
pub const SIMULATION: &str = "SIMULATION";
/// Configuration actions
pub const CONFIG_PROCESS: &str = "CONFIG_PROCESS";
/// Load configuration element
pub const CONFIG_LOAD: &str = "CONFIG_LOAD";
/// Save configuration element
pub const CONFIG_SAVE: &str = "CONFIG_SAVE";
/// Purge configuration element
pub const CONFIG_PURGE: &str = "CONFIG_PURGE";
/// Polling period
pub const POLLING_PERIOD: &str = "POLLING_PERIOD";
/// Polling period element, in milliseconds
pub const PERIOD_MS: &str = "PERIOD_MS";
/// Active connection plugin selector
pub const CONNECTION_MODE: &str = "CONNECTION_MODE";
/// Enable element of toggles
pub const ENABLE: &str = "ENABLE";
/// Disable element of toggles
pub const DISABLE: &str = "DISABLE";

const MAIN_GROUP: &str = "Main Control";
const INFO_GROUP: &str = "General Info";
const OPTIONS_GROUP: &str = "Options";
const CONNECTION_GROUP: &str = "Connection";

/// Result of a blocking job, delivered back to the reactor
#[derive(Debug)]
pub struct JobResult {
    /// Device that submitted the job
    pub device: String,
    /// Tag the driver gave the job
    pub tag: String,
    /// What the job returned
    pub result: Result<Value>,
}

/// Per-process state shared by every device
///
/// Replaces process-wide globals: configuration, the configuration store and
/// the queue carrying worker results back to the reactor.
#[derive(Clone)]
pub struct DriverContext {
    config: SharedConfig,
    store: SharedConfigStore,
    jobs: mpsc::Sender<JobResult>,
}

impl DriverContext {
    /// Create a context; the receiver yields finished worker jobs
    pub fn new(config: SharedConfig, store: SharedConfigStore) -> (Self, mpsc::Receiver<JobResult>) {
        let (jobs, results) = mpsc::channel(config.get().driver.worker_queue.max(1));
        (
            Self {
                config,
                store,
                jobs,
            },
            results,
        )
    }

    /// Create a context storing device records under the configured directory
    pub fn from_config(config: Config) -> (Self, mpsc::Receiver<JobResult>) {
        let store = Arc::new(FileConfigStore::new(config.config_dir()));
        Self::new(SharedConfig::new(config), store)
    }

    /// Create a context with default configuration and an in-memory store
    pub fn in_memory() -> (Self, mpsc::Receiver<JobResult>) {
        Self::new(SharedConfig::default(), Arc::new(MemoryConfigStore::new()))
    }

    /// Process configuration
    pub fn config(&self) -> &Config {
        self.config.get()
    }

    /// Configuration store
    pub fn store(&self) -> &dyn ConfigStore {
        self.store.as_ref()
    }
}

/// Static description of a driver, published as `DRIVER_INFO`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverInfo {
    /// Driver name
    pub name: String,
    /// Executable name
    pub exec: String,
    /// Driver version
    pub version: String,
    /// Interface kinds implemented, e.g. "dome" or "weather"
    pub interface: String,
}

/// State every device has, independent of the instrument
pub struct DeviceCore {
    name: String,
    context: DriverContext,
    registry: Registry,
    outbox: Vec<Message>,
    timers: Scheduler<&'static str>,
    connections: Vec<Box<dyn Connection>>,
    active: usize,
    snoop: SnoopBus,
    connected: bool,
    simulation: bool,
    debug: bool,
    cancel: CancellationToken,
}

impl Debug for DeviceCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceCore")
            .field("name", &self.name)
            .field("properties", &self.registry.names())
            .field("timers", &self.timers.len())
            .field("connected", &self.connected)
            .field("simulation", &self.simulation)
            .finish()
    }
}

impl DeviceCore {
    /// Create the core of a device named `name`
    pub fn new<S: Into<String>>(name: S, context: DriverContext) -> Self {
        Self {
            name: name.into(),
            context,
            registry: Registry::new(),
            outbox: Vec::new(),
            timers: Scheduler::new(),
            connections: Vec::new(),
            active: 0,
            snoop: SnoopBus::new(),
            connected: false,
            simulation: false,
            debug: false,
            cancel: CancellationToken::new(),
        }
    }

    /// Device name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Process configuration
    pub fn config(&self) -> &Config {
        self.context.config()
    }

    /// Whether the hardware link is up
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Whether the device runs without hardware
    pub fn is_simulation(&self) -> bool {
        self.simulation
    }

    /// Whether debug session messages are enabled
    pub fn is_debug(&self) -> bool {
        self.debug
    }

    /// Registered properties
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Look up a property
    pub fn property(&self, name: &str) -> Option<&Property> {
        self.registry.get(name)
    }

    /// Register a property and publish its definition
    pub fn define(&mut self, mut property: Property) -> Result<()> {
        if property.device() != self.name {
            return Err(DeviceError::InvalidDefinition(format!(
                "{} belongs to {}, not {}",
                property.name(),
                property.device(),
                self.name
            )));
        }
        if property.name() == CONNECTION {
            property.set_persistent(false);
        }
        let message = Message::define(&property);
        self.registry.insert(property)?;
        self.outbox.push(message);
        Ok(())
    }

    /// Unregister a property and publish its deletion
    pub fn delete(&mut self, name: &str) -> Result<()> {
        self.registry.remove(name)?;
        self.outbox
            .push(Message::delete(self.name.clone(), Some(name.to_string()), None));
        Ok(())
    }

    /// Unregister a property if it is registered
    pub fn delete_if_defined(&mut self, name: &str) -> Result<()> {
        if self.registry.contains(name) {
            self.delete(name)?;
        }
        Ok(())
    }

    /// Change values from the driver side and publish the result
    pub fn update(&mut self, name: &str, values: &PropertyValues, state: PropertyState) -> Result<()> {
        self.registry.require_mut(name)?.update_values(values, state)?;
        self.publish(name, None)
    }

    /// Apply a client request to a property without publishing
    pub fn apply(&mut self, name: &str, values: &PropertyValues, state: PropertyState) -> Result<()> {
        self.registry.require_mut(name)?.apply_values(values, state)
    }

    /// Set a property's state and publish it
    pub fn set_state(&mut self, name: &str, state: PropertyState, message: Option<String>) -> Result<()> {
        self.registry.require_mut(name)?.set_state(state);
        self.publish(name, message)
    }

    /// Publish the current values of a property
    pub fn publish(&mut self, name: &str, message: Option<String>) -> Result<()> {
        let property = self.registry.require(name)?;
        self.outbox.push(Message::update(property, message));
        Ok(())
    }

    /// Send a session message to observers
    pub fn message<S: AsRef<str>>(&mut self, text: S) {
        info!(device = %self.name, "{}", text.as_ref());
        self.outbox
            .push(Message::session(self.name.clone(), text.as_ref()));
    }

    /// Send a session message only when debugging is enabled
    pub fn debug_message<S: AsRef<str>>(&mut self, text: S) {
        debug!(device = %self.name, "{}", text.as_ref());
        if self.debug {
            self.outbox
                .push(Message::session(self.name.clone(), text.as_ref()));
        }
    }

    /// Arm a one-shot timer delivered to [`Driver::timer_hit`]
    pub fn set_timer(&mut self, delay: Duration, tag: &'static str) -> TimerId {
        self.timers.set_timer(delay, tag)
    }

    /// Cancel a timer; a no-op for timers that fired or were cancelled
    pub fn remove_timer(&mut self, id: TimerId) -> bool {
        self.timers.remove_timer(id)
    }

    /// Earliest pending timer deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// Number of pending timers
    pub fn pending_timers(&self) -> usize {
        self.timers.len()
    }

    /// Current polling period
    pub fn polling_period(&self) -> Duration {
        self.registry
            .get(POLLING_PERIOD)
            .and_then(|p| p.number(PERIOD_MS))
            .map(|ms| Duration::from_millis(ms as u64))
            .unwrap_or_else(|| self.config().driver.polling_period())
    }

    /// The open hardware port; `None` when disconnected or simulating
    pub fn port(&mut self) -> Option<&mut dyn PortIo> {
        if !self.connected || self.simulation {
            return None;
        }
        self.connections.get_mut(self.active)?.port()
    }

    /// Register a connection plugin; the first one registered is active
    pub fn add_connection(&mut self, connection: Box<dyn Connection>) {
        self.connections.push(connection);
    }

    /// The active connection plugin
    pub fn active_connection(&self) -> Option<&dyn Connection> {
        self.connections.get(self.active).map(|c| c.as_ref())
    }

    /// Token cancelling an in-progress connect
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Watch a peer's property
    ///
    /// Announces the subscription to the transport the first time the pair
    /// is watched.
    pub fn snoop<D: Into<String>, P: Into<String>>(&mut self, device: D, property: P) {
        let key = SnoopKey::new(device, property);
        if self.snoop.subscribe(key.clone()) {
            debug!("{} snooping {}.{}", self.name, key.device, key.property);
            self.outbox.push(Message::GetProperties {
                device: Some(key.device),
                name: Some(key.property),
                snoop: true,
            });
        }
    }

    /// Subscriptions of this device
    pub fn snoop_subscriptions(&self) -> Vec<SnoopKey> {
        let mut keys: Vec<SnoopKey> = self.snoop.subscriptions().cloned().collect();
        keys.sort();
        keys
    }

    /// Run a blocking job on the worker pool
    ///
    /// The result comes back through [`Driver::job_done`]. Jobs must not touch
    /// device state; they receive only what they capture.
    pub fn spawn_job<F>(&self, tag: &str, job: F)
    where
        F: FnOnce() -> Result<Value> + Send + 'static,
    {
        let sender = self.context.jobs.clone();
        let device = self.name.clone();
        let tag = tag.to_string();
        let task = format!("{}:{}", device, tag);
        spawn_and_log(&task, async move {
            let result = match tokio::task::spawn_blocking(job).await {
                Ok(result) => result,
                Err(e) => Err(DeviceError::other(format!("job panicked: {}", e))),
            };
            sender.send(JobResult { device, tag, result }).await
        });
    }

    /// Save every persistent property
    pub fn save_config(&mut self) -> Result<()> {
        let record: DeviceRecord = self
            .registry
            .iter()
            .filter(|p| p.is_persistent())
            .map(|p| (p.name().to_string(), p.values()))
            .collect();
        self.context.store().save(&self.name, &record)?;
        debug!("Saved {} properties for {}", record.len(), self.name);
        Ok(())
    }

    /// Save one property, keeping the rest of the saved record
    pub fn save_property(&mut self, name: &str) -> Result<()> {
        let values = self.registry.require(name)?.values();
        self.context.store().save_property(&self.name, name, values)
    }

    /// Forget the saved record
    pub fn purge_config(&mut self) -> Result<()> {
        self.context.store().purge(&self.name)
    }

    /// Saved values for the given registered, persistent properties
    fn saved_values(&self, names: &[String]) -> Result<Vec<(String, PropertyValues)>> {
        let record = match self.context.store().load(&self.name)? {
            Some(record) => record,
            None => return Ok(Vec::new()),
        };
        Ok(names
            .iter()
            .filter(|n| n.as_str() != CONNECTION)
            .filter(|n| self.registry.get(n).map_or(false, |p| p.is_persistent()))
            .filter_map(|n| record.get(n).map(|v| (n.clone(), v.clone())))
            .collect())
    }

    /// Take the records produced so far
    pub fn drain(&mut self) -> Vec<Message> {
        std::mem::take(&mut self.outbox)
    }

    fn set_connection_switch(&mut self, connected: bool, state: PropertyState, message: Option<String>) -> Result<()> {
        let on = if connected { CONNECT } else { DISCONNECT };
        self.registry
            .require_mut(CONNECTION)?
            .update_values(&PropertyValues::Switch(vec![(on.to_string(), SwitchState::On)]), state)?;
        self.publish(CONNECTION, message)
    }
}

/// Instrument-specific behavior
///
/// Every hook has a default so drivers implement only what they need. The
/// `new_*` hooks return `Ok(true)` when they handled (and published) the
/// request; `Ok(false)` lets the core apply the values generically with
/// state Ok. An error leaves the values untouched and is surfaced to
/// observers as an Alert.
pub trait Driver: Handshake {
    /// Static driver description
    fn driver_info(&self) -> DriverInfo;

    /// Define the properties that exist whether or not hardware is connected
    fn init_properties(&mut self, _core: &mut DeviceCore) -> Result<()> {
        Ok(())
    }

    /// Define or delete hardware-dependent properties after the connection
    /// state changed; check [`DeviceCore::is_connected`]
    fn update_properties(&mut self, _core: &mut DeviceCore) -> Result<()> {
        Ok(())
    }

    /// Driver-side teardown before the transport closes
    fn disconnect(&mut self, _core: &mut DeviceCore) -> Result<()> {
        Ok(())
    }

    /// Client switch request
    fn new_switch(&mut self, _core: &mut DeviceCore, _name: &str, _values: &[(String, SwitchState)]) -> Result<bool> {
        Ok(false)
    }

    /// Client number request
    fn new_number(&mut self, _core: &mut DeviceCore, _name: &str, _values: &[(String, f64)]) -> Result<bool> {
        Ok(false)
    }

    /// Client text request
    fn new_text(&mut self, _core: &mut DeviceCore, _name: &str, _values: &[(String, String)]) -> Result<bool> {
        Ok(false)
    }

    /// Client blob request
    fn new_blob(&mut self, _core: &mut DeviceCore, _name: &str, _values: &[BlobValue]) -> Result<bool> {
        Ok(false)
    }

    /// A watched peer property changed
    fn snoop(&mut self, _core: &mut DeviceCore, _event: &SnoopEvent) -> Result<()> {
        Ok(())
    }

    /// A timer armed with [`DeviceCore::set_timer`] fired
    fn timer_hit(&mut self, _core: &mut DeviceCore, _tag: &'static str) -> Result<()> {
        Ok(())
    }

    /// A job started with [`DeviceCore::spawn_job`] finished
    fn job_done(&mut self, _core: &mut DeviceCore, _tag: &str, _result: Result<Value>) -> Result<()> {
        Ok(())
    }
}

/// A device: core state plus its driver
pub struct Device<D: Driver> {
    core: DeviceCore,
    driver: D,
    started: bool,
}

impl<D: Driver + Debug> Debug for Device<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("core", &self.core)
            .field("driver", &self.driver)
            .finish()
    }
}

impl<D: Driver> Device<D> {
    /// Create a device named `name`
    pub fn new<S: Into<String>>(name: S, driver: D, context: DriverContext) -> Self {
        Self {
            core: DeviceCore::new(name, context),
            driver,
            started: false,
        }
    }

    /// Register a connection plugin
    pub fn with_connection<C: Connection + 'static>(mut self, connection: C) -> Self {
        self.core.add_connection(Box::new(connection));
        self
    }

    /// Device name
    pub fn name(&self) -> &str {
        self.core.name()
    }

    /// Core state
    pub fn core(&self) -> &DeviceCore {
        &self.core
    }

    /// Core state, mutable
    pub fn core_mut(&mut self) -> &mut DeviceCore {
        &mut self.core
    }

    /// The driver
    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// The driver, mutable
    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    /// Take the records produced so far
    pub fn drain(&mut self) -> Vec<Message> {
        self.core.drain()
    }

    /// Define the standard and driver properties and replay the saved
    /// configuration
    pub fn start(&mut self) -> Result<()> {
        if self.started {
            return Ok(());
        }
        let _span = starwire_core::logging::device_span(self.core.name()).entered();

        for property in self.standard_properties()? {
            self.core.define(property)?;
        }
        self.define_connection_properties()?;
        self.driver.init_properties(&mut self.core)?;
        self.started = true;

        let replayed = self.load_config()?;
        info!("{} started, {} saved properties replayed", self.core.name(), replayed);
        Ok(())
    }

    /// Replay saved values into every matching property
    ///
    /// Returns how many properties were replayed; a missing record is not an
    /// error.
    pub fn load_config(&mut self) -> Result<usize> {
        let names = self.core.registry.names();
        self.replay(&names)
    }

    fn replay(&mut self, names: &[String]) -> Result<usize> {
        let saved = self.core.saved_values(names)?;
        let count = saved.len();
        for (name, values) in saved {
            debug!("Replaying saved {}", name);
            self.request(&name, &values)?;
        }
        Ok(count)
    }

    /// Single entry point for wire records addressed to or watched by this device
    pub async fn handle(&mut self, message: &Message) -> Result<()> {
        match message {
            Message::NewProperty { device, name, values } if device == self.core.name() => {
                self.handle_new(name, values).await
            }
            Message::GetProperties { device, name, .. }
                if device.as_deref().map_or(true, |d| d == self.core.name()) =>
            {
                self.define_all(name.as_deref())
            }
            Message::UpdateProperty(_) | Message::DefineProperty { .. } | Message::DeleteProperty { .. }
                if message.device() != Some(self.core.name()) =>
            {
                self.handle_snoop(message)
            }
            _ => Ok(()),
        }
    }

    /// Re-publish definitions, optionally of a single property
    pub fn define_all(&mut self, name: Option<&str>) -> Result<()> {
        let definitions: Vec<Message> = self
            .core
            .registry
            .iter()
            .filter(|p| name.map_or(true, |n| p.name() == n))
            .map(Message::define)
            .collect();
        self.core.outbox.extend(definitions);
        Ok(())
    }

    /// Handle a client request to change a property
    ///
    /// Validation failures are surfaced as an Alert update with the prior
    /// values and do not make this call fail; an unknown property does.
    pub async fn handle_new(&mut self, name: &str, values: &PropertyValues) -> Result<()> {
        if name == CONNECTION {
            return self.handle_connection(values).await;
        }
        self.request(name, values)
    }

    async fn handle_connection(&mut self, values: &PropertyValues) -> Result<()> {
        let mut requested = self.core.registry.require(CONNECTION)?.clone();
        if let Err(e) = requested.apply_values(values, PropertyState::Ok) {
            return self.surface(CONNECTION, e);
        }
        let want_connected = requested.switch(CONNECT) == Some(SwitchState::On);

        if want_connected == self.core.connected {
            debug!("{}: connection already in requested state", self.core.name());
            let state = self.core.registry.require(CONNECTION)?.state();
            return self.core.set_connection_switch(self.core.connected, state, None);
        }

        let result = if want_connected {
            self.connect().await
        } else {
            self.disconnect()
        };
        if let Err(e) = result {
            debug!("{}: connection change failed: {}", self.core.name(), e);
        }
        Ok(())
    }

    /// Connect to the hardware through the active plugin
    ///
    /// On failure the device stays disconnected and CONNECTION goes Alert.
    pub async fn connect(&mut self) -> Result<()> {
        if self.core.connected {
            return Ok(());
        }
        self.core.registry.require_mut(CONNECTION)?.set_state(PropertyState::Busy);
        self.core.publish(CONNECTION, Some("Connecting".to_string()))?;

        let before = self.core.registry.names();
        let span = starwire_core::logging::operation_span("connect", self.core.name());
        let result = self.open_link().instrument(span).await;

        let changed = match result {
            Ok(changed) => changed,
            Err(e) => {
                warn!("{}: connect failed: {}", self.core.name(), e);
                self.core.set_connection_switch(false, PropertyState::Alert, Some(e.to_string()))?;
                self.core.message(format!("Failed to connect: {}", e));
                return Err(e);
            }
        };

        self.core.connected = true;
        self.core.set_connection_switch(true, PropertyState::Ok, None)?;
        self.core.message(format!("{} is online", self.core.name()));

        for name in &changed {
            self.core.publish(name, None)?;
            if let Err(e) = self.core.save_property(name) {
                warn!("Failed to save {}: {}", name, e);
            }
        }

        if let Err(e) = self.driver.update_properties(&mut self.core) {
            warn!("{}: update_properties failed: {}", self.core.name(), e);
            self.core.message(format!("Failed to initialize hardware properties: {}", e));
        }

        let defined: Vec<String> = self
            .core
            .registry
            .names()
            .into_iter()
            .filter(|n| !before.contains(n))
            .collect();
        if let Err(e) = self.replay(&defined) {
            warn!("{}: configuration replay failed: {}", self.core.name(), e);
        }
        Ok(())
    }

    async fn open_link(&mut self) -> Result<Vec<String>> {
        if self.core.simulation {
            info!("{}: connecting in simulation", self.core.name());
            return self.driver.handshake(None).map(|_| Vec::new());
        }

        if self.core.cancel.is_cancelled() {
            self.core.cancel = CancellationToken::new();
        }
        let cancel = self.core.cancel.clone();
        let timeout = self.core.config().driver.connect_timeout();
        let core = &mut self.core;
        let connection = core
            .connections
            .get_mut(core.active)
            .ok_or_else(|| DeviceError::connection("no connection plugin registered"))?;

        let connect = connection.connect(&mut core.registry, &mut self.driver, &cancel);
        let attempt = with_timeout(timeout, async { Ok(connect.await) }).await;
        match attempt {
            Ok(result) => result,
            Err(_) => {
                let mut reason = format!("connect did not finish within {} ms", timeout.as_millis());
                if let Err(e) = connection.disconnect() {
                    warn!("{}: releasing the connection failed: {}", core.name(), e);
                    reason.push_str(&format!(", and releasing the connection failed: {}", e));
                }
                Err(DeviceError::Timeout(reason))
            }
        }
    }

    /// Disconnect from the hardware
    ///
    /// If the driver or the plugin fails to let go, the device stays
    /// connected and CONNECTION goes Alert.
    pub fn disconnect(&mut self) -> Result<()> {
        if !self.core.connected {
            return Ok(());
        }

        let result = self.driver.disconnect(&mut self.core).and_then(|_| {
            if self.core.simulation {
                return Ok(());
            }
            match self.core.connections.get_mut(self.core.active) {
                Some(connection) => connection.disconnect(),
                None => Ok(()),
            }
        });
        if let Err(e) = result {
            warn!("{}: disconnect failed: {}", self.core.name(), e);
            self.core.set_connection_switch(true, PropertyState::Alert, Some(e.to_string()))?;
            return Err(e);
        }

        self.go_offline(PropertyState::Idle, None)?;
        self.core.message(format!("{} is offline", self.core.name()));
        Ok(())
    }

    fn go_offline(&mut self, state: PropertyState, message: Option<String>) -> Result<()> {
        self.core.connected = false;
        self.core.timers.clear();
        self.core.set_connection_switch(false, state, message)?;
        if let Err(e) = self.driver.update_properties(&mut self.core) {
            warn!("{}: update_properties failed: {}", self.core.name(), e);
        }
        Ok(())
    }

    /// The hardware link went away under a running operation
    pub fn connection_lost(&mut self, reason: &DeviceError) -> Result<()> {
        if !self.core.connected {
            return Ok(());
        }
        warn!("{}: connection lost: {}", self.core.name(), reason);
        let mut message = reason.to_string();
        if let Some(connection) = self.core.connections.get_mut(self.core.active) {
            if let Err(e) = connection.disconnect() {
                warn!("{}: releasing the connection failed: {}", self.core.name, e);
                message.push_str(&format!("; releasing the connection failed: {}", e));
            }
        }
        self.core.message(format!("Connection lost: {}", message));
        self.go_offline(PropertyState::Alert, Some(message))?;
        Ok(())
    }

    /// Apply a request through the standard handlers or the driver
    fn request(&mut self, name: &str, values: &PropertyValues) -> Result<()> {
        if !self.core.registry.contains(name) {
            return Err(DeviceError::UnknownProperty(name.to_string()));
        }
        match self.dispatch(name, values) {
            Ok(()) => Ok(()),
            Err(e) => self.surface(name, e),
        }
    }

    fn dispatch(&mut self, name: &str, values: &PropertyValues) -> Result<()> {
        match name {
            DEBUG => {
                self.core.apply(name, values, PropertyState::Ok)?;
                self.core.debug = self.toggle_enabled(DEBUG);
                self.core.publish(name, None)
            }
            SIMULATION => {
                if self.core.connected {
                    return Err(DeviceError::InvalidStateTransition(
                        SIMULATION.to_string(),
                        "disconnect before changing simulation".to_string(),
                    ));
                }
                self.core.apply(name, values, PropertyState::Ok)?;
                self.core.simulation = self.toggle_enabled(SIMULATION);
                self.core.publish(name, None)?;
                let mode = if self.core.simulation { "enabled" } else { "disabled" };
                self.core.message(format!("Simulation {}", mode));
                Ok(())
            }
            CONFIG_PROCESS => self.config_process(values),
            CONNECTION_MODE => self.select_connection(values),
            _ => self.driver_request(name, values),
        }
    }

    fn driver_request(&mut self, name: &str, values: &PropertyValues) -> Result<()> {
        let handled = match values {
            PropertyValues::Switch(v) => self.driver.new_switch(&mut self.core, name, v)?,
            PropertyValues::Number(v) => self.driver.new_number(&mut self.core, name, v)?,
            PropertyValues::Text(v) => self.driver.new_text(&mut self.core, name, v)?,
            PropertyValues::Blob(v) => self.driver.new_blob(&mut self.core, name, v)?,
            PropertyValues::Light(_) => false,
        };
        if !handled {
            self.core.apply(name, values, PropertyState::Ok)?;
            self.core.publish(name, None)?;
        }
        Ok(())
    }

    fn toggle_enabled(&self, name: &str) -> bool {
        self.core
            .registry
            .get(name)
            .and_then(|p| p.switch(ENABLE))
            .map_or(false, |s| s == SwitchState::On)
    }

    fn config_process(&mut self, values: &PropertyValues) -> Result<()> {
        let action = values
            .switched_on()
            .map(str::to_string)
            .ok_or_else(|| DeviceError::InvalidStateTransition(CONFIG_PROCESS.to_string(), "no action requested".to_string()))?;
        self.core.apply(CONFIG_PROCESS, values, PropertyState::Busy)?;

        let outcome = match action.as_str() {
            CONFIG_LOAD => self.load_config().map(|n| format!("Loaded {} saved properties", n)),
            CONFIG_SAVE => self.core.save_config().map(|_| "Configuration saved".to_string()),
            CONFIG_PURGE => self.core.purge_config().map(|_| "Configuration purged".to_string()),
            other => Err(DeviceError::UnknownElement(CONFIG_PROCESS.to_string(), other.to_string())),
        };

        let off = PropertyValues::Switch(vec![(action.clone(), SwitchState::Off)]);
        match outcome {
            Ok(text) => {
                self.core.update(CONFIG_PROCESS, &off, PropertyState::Ok)?;
                self.core.message(text);
                Ok(())
            }
            Err(e) => {
                self.core.registry.require_mut(CONFIG_PROCESS)?.update_values(&off, PropertyState::Alert)?;
                Err(e)
            }
        }
    }

    fn select_connection(&mut self, values: &PropertyValues) -> Result<()> {
        if self.core.connected {
            return Err(DeviceError::InvalidStateTransition(
                CONNECTION_MODE.to_string(),
                "disconnect before changing the connection mode".to_string(),
            ));
        }
        self.core.apply(CONNECTION_MODE, values, PropertyState::Ok)?;
        let selected = self
            .core
            .registry
            .get(CONNECTION_MODE)
            .and_then(|p| p.first_on())
            .and_then(|on| self.core.connections.iter().position(|c| c.name() == on));

        if let Some(index) = selected {
            if index != self.core.active {
                self.delete_connection_properties()?;
                self.core.active = index;
                self.define_connection_properties()?;
                let names: Vec<String> = self.connection_property_names()?;
                self.replay(&names)?;
            }
        }
        self.core.publish(CONNECTION_MODE, None)
    }

    fn connection_property_names(&self) -> Result<Vec<String>> {
        match self.core.connections.get(self.core.active) {
            Some(connection) => Ok(connection
                .properties(self.core.name())?
                .iter()
                .map(|p| p.name().to_string())
                .collect()),
            None => Ok(Vec::new()),
        }
    }

    fn define_connection_properties(&mut self) -> Result<()> {
        let properties = match self.core.connections.get(self.core.active) {
            Some(connection) => connection.properties(self.core.name())?,
            None => return Ok(()),
        };
        for property in properties {
            self.core.define(property)?;
        }
        Ok(())
    }

    fn delete_connection_properties(&mut self) -> Result<()> {
        for name in self.connection_property_names()? {
            self.core.delete_if_defined(&name)?;
        }
        Ok(())
    }

    /// Report a failed request: keep the values, go Alert, explain why
    fn surface(&mut self, name: &str, error: DeviceError) -> Result<()> {
        if error.is_link_failure() {
            return self.connection_lost(&error);
        }
        warn!("{}: {} rejected: {}", self.core.name(), name, error);
        match self.core.registry.get_mut(name) {
            Some(property) => {
                property.set_state(PropertyState::Alert);
                self.core.publish(name, Some(error.to_string()))
            }
            None => Err(error),
        }
    }

    /// Deliver a peer's record to the driver if it is watched
    pub fn handle_snoop(&mut self, message: &Message) -> Result<()> {
        for event in self.core.snoop.accept(message) {
            if let Err(e) = self.driver.snoop(&mut self.core, &event) {
                self.hook_failed("snoop", e)?;
            }
        }
        Ok(())
    }

    /// Fire every timer due at `now`
    pub fn fire_timers(&mut self, now: Instant) -> Result<usize> {
        let due = self.core.timers.take_due(now);
        let count = due.len();
        for (id, tag) in due {
            debug!("{}: {} fired ({})", self.core.name(), id, tag);
            if let Err(e) = self.driver.timer_hit(&mut self.core, tag) {
                self.hook_failed(tag, e)?;
            }
        }
        Ok(count)
    }

    /// Deliver a finished worker job to the driver
    pub fn job_done(&mut self, job: JobResult) -> Result<()> {
        if let Err(e) = self.driver.job_done(&mut self.core, &job.tag, job.result) {
            self.hook_failed(&job.tag, e)?;
        }
        Ok(())
    }

    fn hook_failed(&mut self, what: &str, error: DeviceError) -> Result<()> {
        if error.is_link_failure() {
            return self.connection_lost(&error);
        }
        warn!("{}: {} failed: {}", self.core.name(), what, error);
        self.core.message(format!("{} failed: {}", what, error));
        Ok(())
    }

    /// Stop the device: cancel connects and timers, disconnect, delete
    /// everything
    pub fn shutdown(&mut self) -> Result<()> {
        self.core.cancel.cancel();
        self.core.timers.clear();
        if self.core.connected {
            if let Err(e) = self.disconnect() {
                warn!("{}: disconnect during shutdown failed: {}", self.core.name(), e);
            }
        }
        self.core.registry = Registry::new();
        self.core.snoop.clear();
        self.core
            .outbox
            .push(Message::delete(self.core.name.clone(), None, None));
        self.started = false;
        Ok(())
    }

    fn standard_properties(&self) -> Result<Vec<Property>> {
        let device = self.core.name();
        let info = self.driver.driver_info();
        let config = self.core.config();
        let mut properties = vec![
            PropertyBuilder::new(device, CONNECTION)
                .label("Connection")
                .group(MAIN_GROUP)
                .timeout(60.0)
                .switches(
                    SwitchRule::AtMostOne,
                    vec![
                        SwitchElement::new(CONNECT, "Connect", SwitchState::Off),
                        SwitchElement::new(DISCONNECT, "Disconnect", SwitchState::On),
                    ],
                )
                .build()?,
            PropertyBuilder::new(device, DRIVER_INFO)
                .label("Driver Info")
                .group(INFO_GROUP)
                .permission(crate::property::Permission::ReadOnly)
                .texts(vec![
                    TextElement::new("DRIVER_NAME", "Name", info.name),
                    TextElement::new("DRIVER_EXEC", "Exec", info.exec),
                    TextElement::new("DRIVER_VERSION", "Version", info.version),
                    TextElement::new("DRIVER_INTERFACE", "Interface", info.interface),
                ])
                .build()?,
            toggle(device, DEBUG, "Debug", false)?,
            toggle(device, SIMULATION, "Simulation", false)?,
            PropertyBuilder::new(device, CONFIG_PROCESS)
                .label("Configuration")
                .group(OPTIONS_GROUP)
                .switches(
                    SwitchRule::AtMostOne,
                    vec![
                        SwitchElement::new(CONFIG_LOAD, "Load", SwitchState::Off),
                        SwitchElement::new(CONFIG_SAVE, "Save", SwitchState::Off),
                        SwitchElement::new(CONFIG_PURGE, "Purge", SwitchState::Off),
                    ],
                )
                .build()?,
            PropertyBuilder::new(device, POLLING_PERIOD)
                .label("Polling")
                .group(OPTIONS_GROUP)
                .persist()
                .numbers(vec![NumberElement::new(
                    PERIOD_MS,
                    "Period (ms)",
                    (config.driver.polling_period_ms as f64).clamp(10.0, 600_000.0),
                    10.0,
                    600_000.0,
                    10.0,
                )
                .with_format("%.f")])
                .build()?,
        ];

        if self.core.connections.len() > 1 {
            properties.push(
                PropertyBuilder::new(device, CONNECTION_MODE)
                    .label("Connection Mode")
                    .group(CONNECTION_GROUP)
                    .persist()
                    .switches(
                        SwitchRule::OneOfMany,
                        self.core
                            .connections
                            .iter()
                            .enumerate()
                            .map(|(i, c)| SwitchElement::new(c.name(), c.label(), SwitchState::from(i == self.core.active)))
                            .collect(),
                    )
                    .build()?,
            );
        }
        Ok(properties)
    }
}

fn toggle(device: &str, name: &str, label: &str, enabled: bool) -> Result<Property> {
    let builder = PropertyBuilder::new(device, name).label(label).group(OPTIONS_GROUP);
    let builder = if name == SIMULATION { builder.persist() } else { builder };
    builder
        .switches(
            SwitchRule::OneOfMany,
            vec![
                SwitchElement::new(ENABLE, "Enable", SwitchState::from(enabled)),
                SwitchElement::new(DISABLE, "Disable", SwitchState::from(!enabled)),
            ],
        )
        .build()
}

#[cfg(test)]
pub(crate) mod mock {
    //! Test drivers and connection plugins.
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::connection::ConnectionState;

    /// Call counters shared with the test body
    #[derive(Debug, Default)]
    pub struct Calls {
        pub connects: AtomicUsize,
        pub disconnects: AtomicUsize,
    }

    impl Calls {
        pub fn connects(&self) -> usize {
            self.connects.load(Ordering::SeqCst)
        }

        pub fn disconnects(&self) -> usize {
            self.disconnects.load(Ordering::SeqCst)
        }
    }

    /// Plugin that always succeeds unless told otherwise: `fail` refuses
    /// connects, `hang` never finishes them, `fail_disconnect` refuses to
    /// let go
    #[derive(Debug)]
    pub struct MockConnection {
        pub calls: Arc<Calls>,
        pub fail: bool,
        pub hang: bool,
        pub fail_disconnect: bool,
        pub state: ConnectionState,
    }

    impl MockConnection {
        pub fn new(calls: Arc<Calls>) -> Self {
            Self {
                calls,
                fail: false,
                hang: false,
                fail_disconnect: false,
                state: ConnectionState::Idle,
            }
        }
    }

    #[async_trait]
    impl Connection for MockConnection {
        fn name(&self) -> &str {
            "CONNECTION_MOCK"
        }

        fn label(&self) -> &str {
            "Mock"
        }

        fn properties(&self, device: &str) -> Result<Vec<Property>> {
            Ok(vec![PropertyBuilder::new(device, "MOCK_ADDRESS")
                .group(CONNECTION_GROUP)
                .persist()
                .texts(vec![TextElement::new("ADDRESS", "Address", "mock://0")])
                .build()?])
        }

        async fn connect(
            &mut self,
            _registry: &mut Registry,
            handshake: &mut dyn Handshake,
            _cancel: &CancellationToken,
        ) -> Result<Vec<String>> {
            self.calls.connects.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                self.state = ConnectionState::Failed;
                return Err(DeviceError::connection("mock refused"));
            }
            if self.hang {
                self.state = ConnectionState::Connecting;
                std::future::pending::<()>().await;
            }
            handshake.handshake(None)?;
            self.state = ConnectionState::Connected;
            Ok(Vec::new())
        }

        fn disconnect(&mut self) -> Result<()> {
            self.calls.disconnects.fetch_add(1, Ordering::SeqCst);
            if self.fail_disconnect {
                return Err(DeviceError::Io(std::io::Error::new(
                    std::io::ErrorKind::PermissionDenied,
                    "port still held",
                )));
            }
            self.state = ConnectionState::Idle;
            Ok(())
        }

        fn state(&self) -> ConnectionState {
            self.state
        }

        fn port(&mut self) -> Option<&mut dyn PortIo> {
            None
        }
    }

    /// Focuser-like driver with one hardware-dependent number and a poll timer
    #[derive(Debug, Default)]
    pub struct FocuserDriver {
        pub polls: usize,
        pub fail_poll_with: Option<std::io::ErrorKind>,
        pub snooped: Vec<SnoopEvent>,
        pub jobs: Vec<(String, bool)>,
    }

    impl Handshake for FocuserDriver {
        fn handshake(&mut self, _port: Option<&mut dyn PortIo>) -> Result<()> {
            Ok(())
        }
    }

    impl Driver for FocuserDriver {
        fn driver_info(&self) -> DriverInfo {
            DriverInfo {
                name: "Mock Focuser".to_string(),
                exec: "starwire-focuser".to_string(),
                version: "1.0".to_string(),
                interface: "focuser".to_string(),
            }
        }

        fn init_properties(&mut self, core: &mut DeviceCore) -> Result<()> {
            core.define(
                PropertyBuilder::new(core.name(), "FOCUS_SPEED")
                    .persist()
                    .numbers(vec![NumberElement::new("SPEED", "Speed", 1.0, 0.0, 10.0, 1.0)])
                    .build()?,
            )
        }

        fn update_properties(&mut self, core: &mut DeviceCore) -> Result<()> {
            if core.is_connected() {
                core.define(
                    PropertyBuilder::new(core.name(), "ABS_FOCUS_POSITION")
                        .persist()
                        .numbers(vec![NumberElement::new("POSITION", "Position", 0.0, 0.0, 100.0, 1.0)])
                        .build()?,
                )?;
                core.set_timer(core.polling_period(), "poll");
            } else {
                core.delete_if_defined("ABS_FOCUS_POSITION")?;
            }
            Ok(())
        }

        fn new_number(&mut self, core: &mut DeviceCore, name: &str, values: &[(String, f64)]) -> Result<bool> {
            if name != "ABS_FOCUS_POSITION" {
                return Ok(false);
            }
            core.apply(name, &PropertyValues::Number(values.to_vec()), PropertyState::Busy)?;
            core.publish(name, Some("moving".to_string()))?;
            Ok(true)
        }

        fn snoop(&mut self, _core: &mut DeviceCore, event: &SnoopEvent) -> Result<()> {
            self.snooped.push(event.clone());
            Ok(())
        }

        fn timer_hit(&mut self, core: &mut DeviceCore, tag: &'static str) -> Result<()> {
            self.polls += 1;
            if let Some(kind) = self.fail_poll_with {
                return Err(std::io::Error::new(kind, "read failed").into());
            }
            core.set_timer(core.polling_period(), tag);
            Ok(())
        }

        fn job_done(&mut self, _core: &mut DeviceCore, tag: &str, result: Result<Value>) -> Result<()> {
            self.jobs.push((tag.to_string(), result.is_ok()));
            Ok(())
        }
    }
}
