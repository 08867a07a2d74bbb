/*!
 * Single-task reactor hosting devices.
 *
 * The reactor owns every device of the process and is the only task that
 * touches them. It waits on three sources at once: inbound wire records,
 * the earliest timer deadline of any device, and results of worker jobs.
 * After each event it collects what the devices published, delivers records
 * to hosted devices that snoop on them, and forwards everything outbound.
 */
use std::collections::VecDeque;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use starwire_devices::{Device, DeviceError, Driver, JobResult, Message, SnoopKey};

use crate::error::{Error, Result};
use crate::router::SnoopRouter;

/// Object-safe view of a device, so one reactor can host different drivers
#[async_trait]
pub trait DeviceHandle: Send {
    /// Device name
    fn name(&self) -> &str;

    /// Define properties and replay the saved configuration
    fn start(&mut self) -> starwire_devices::Result<()>;

    /// Handle one wire record
    async fn handle(&mut self, message: &Message) -> starwire_devices::Result<()>;

    /// Fire timers due at `now`
    fn fire_timers(&mut self, now: Instant) -> starwire_devices::Result<usize>;

    /// Earliest pending timer
    fn next_deadline(&self) -> Option<Instant>;

    /// Deliver a finished worker job
    fn job_done(&mut self, job: JobResult) -> starwire_devices::Result<()>;

    /// Take published records
    fn drain(&mut self) -> Vec<Message>;

    /// Disconnect and delete everything
    fn shutdown(&mut self) -> starwire_devices::Result<()>;
}

#[async_trait]
impl<D: Driver + 'static> DeviceHandle for Device<D> {
    fn name(&self) -> &str {
        Device::name(self)
    }

    fn start(&mut self) -> starwire_devices::Result<()> {
        Device::start(self)
    }

    async fn handle(&mut self, message: &Message) -> starwire_devices::Result<()> {
        Device::handle(self, message).await
    }

    fn fire_timers(&mut self, now: Instant) -> starwire_devices::Result<usize> {
        Device::fire_timers(self, now)
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.core().next_deadline()
    }

    fn job_done(&mut self, job: JobResult) -> starwire_devices::Result<()> {
        Device::job_done(self, job)
    }

    fn drain(&mut self) -> Vec<Message> {
        Device::drain(self)
    }

    fn shutdown(&mut self) -> starwire_devices::Result<()> {
        Device::shutdown(self)
    }
}

/// Event loop for the devices of one process
pub struct Reactor {
    devices: Vec<Box<dyn DeviceHandle>>,
    router: SnoopRouter,
    jobs: mpsc::Receiver<JobResult>,
    outbound: mpsc::Sender<Message>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("devices", &self.device_names())
            .field("router", &self.router)
            .finish()
    }
}

impl Reactor {
    /// Create a reactor
    ///
    /// `jobs` is the receiver returned with the devices' `DriverContext`;
    /// every record the devices publish is sent to `outbound`.
    pub fn new(jobs: mpsc::Receiver<JobResult>, outbound: mpsc::Sender<Message>) -> Self {
        Self {
            devices: Vec::new(),
            router: SnoopRouter::new(),
            jobs,
            outbound,
            shutdown: CancellationToken::new(),
        }
    }

    /// Token that stops [`Reactor::run`]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Names of the hosted devices
    pub fn device_names(&self) -> Vec<String> {
        self.devices.iter().map(|d| d.name().to_string()).collect()
    }

    /// Snoop subscriptions known to the transport
    pub fn router(&self) -> &SnoopRouter {
        &self.router
    }

    fn index_of(&self, name: &str) -> Option<usize> {
        self.devices.iter().position(|d| d.name() == name)
    }

    /// Host and start a device
    pub async fn add_device<H: DeviceHandle + 'static>(&mut self, mut device: H) -> Result<()> {
        if self.index_of(device.name()).is_some() {
            return Err(Error::DuplicateDevice(device.name().to_string()));
        }
        device.start()?;
        info!("Hosting device {}", device.name());
        self.devices.push(Box::new(device));
        self.flush().await
    }

    /// Shut a device down and stop hosting it
    ///
    /// Its deletion records are still routed, and its own snoop
    /// subscriptions are torn down.
    pub async fn remove_device(&mut self, name: &str) -> Result<()> {
        let index = self
            .index_of(name)
            .ok_or_else(|| Error::UnknownDevice(name.to_string()))?;
        self.devices[index].shutdown()?;
        self.flush().await?;

        self.devices.remove(index);
        let removed = self.router.remove_subscriber(name);
        info!("Removed device {} ({} subscriptions dropped)", name, removed);
        Ok(())
    }

    /// Handle one inbound record
    pub async fn dispatch(&mut self, message: Message) -> Result<()> {
        let targets = match &message {
            Message::NewProperty { device, .. } => match self.index_of(device) {
                Some(index) => vec![index],
                None => {
                    debug!("No device {} here, ignoring request", device);
                    Vec::new()
                }
            },
            Message::GetProperties { device, .. } => match device {
                Some(name) => self.index_of(name).into_iter().collect(),
                None => (0..self.devices.len()).collect(),
            },
            Message::DefineProperty { .. } | Message::UpdateProperty(_) | Message::DeleteProperty { .. } => {
                self.snoop_targets(None, &message)
            }
            Message::Message { .. } => Vec::new(),
        };

        for index in targets {
            self.deliver(index, &message).await;
        }
        self.flush().await
    }

    /// Fire every timer due at `now`
    pub async fn fire_timers(&mut self, now: Instant) -> Result<()> {
        for device in self.devices.iter_mut() {
            if let Err(e) = device.fire_timers(now) {
                warn!("{}: timer handling failed: {}", device.name(), e);
            }
        }
        self.flush().await
    }

    /// Deliver a finished worker job to the device that started it
    pub async fn job_done(&mut self, job: JobResult) -> Result<()> {
        match self.index_of(&job.device) {
            Some(index) => {
                let name = job.device.clone();
                if let Err(e) = self.devices[index].job_done(job) {
                    warn!("{}: job result handling failed: {}", name, e);
                }
            }
            None => debug!("Dropping job result for departed device {}", job.device),
        }
        self.flush().await
    }

    /// Earliest timer deadline of any device
    pub fn next_deadline(&self) -> Option<Instant> {
        self.devices.iter().filter_map(|d| d.next_deadline()).min()
    }

    /// Run until the inbound channel closes or shutdown is requested, then
    /// shut every device down
    pub async fn run(mut self, mut inbound: mpsc::Receiver<Message>) -> Result<()> {
        let shutdown = self.shutdown.clone();
        info!("Reactor running {} device(s)", self.devices.len());

        let result = loop {
            let deadline = self.next_deadline();
            let step = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break Ok(()),
                message = inbound.recv() => match message {
                    Some(message) => self.dispatch(message).await,
                    None => {
                        info!("Inbound closed");
                        break Ok(());
                    }
                },
                Some(job) = self.jobs.recv() => self.job_done(job).await,
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.fire_timers(Instant::now()).await
                }
            };
            if let Err(e) = step {
                break Err(e);
            }
        };

        for name in self.device_names() {
            if let Err(e) = self.remove_device(&name).await {
                warn!("Failed to shut {} down: {}", name, e);
            }
        }
        info!("Reactor stopped");
        result
    }

    async fn deliver(&mut self, index: usize, message: &Message) {
        let device = &mut self.devices[index];
        match device.handle(message).await {
            Ok(()) => {}
            Err(DeviceError::UnknownProperty(name)) => {
                debug!("{} has no property {}", device.name(), name);
            }
            Err(e) => warn!("{} failed to handle record: {}", device.name(), e),
        }
    }

    /// Hosted devices that should see `message`, never its origin
    fn snoop_targets(&self, origin: Option<usize>, message: &Message) -> Vec<usize> {
        let device = match message.device() {
            Some(device) => device,
            None => return Vec::new(),
        };
        let subscribers = match message.property_name() {
            Some(property) => self.router.subscribers(device, property),
            None => self.router.subscribers_of_device(device),
        };
        subscribers
            .iter()
            .filter_map(|name| self.index_of(name))
            .filter(|index| Some(*index) != origin)
            .collect()
    }

    /// Route what the devices published until nothing new comes out
    async fn flush(&mut self) -> Result<()> {
        let mut pending: VecDeque<(usize, Message)> = VecDeque::new();
        for (index, device) in self.devices.iter_mut().enumerate() {
            pending.extend(device.drain().into_iter().map(|m| (index, m)));
        }

        while let Some((origin, message)) = pending.pop_front() {
            let targets = match &message {
                Message::GetProperties {
                    device: Some(peer),
                    name,
                    snoop: true,
                } => {
                    if let Some(property) = name {
                        let subscriber = self.devices[origin].name().to_string();
                        self.router.subscribe(subscriber, SnoopKey::new(peer.clone(), property.clone()));
                    }
                    self.index_of(peer).filter(|i| *i != origin).into_iter().collect()
                }
                Message::DefineProperty { .. } | Message::UpdateProperty(_) | Message::DeleteProperty { .. } => {
                    self.snoop_targets(Some(origin), &message)
                }
                _ => Vec::new(),
            };

            for index in targets {
                self.deliver(index, &message).await;
                pending.extend(self.devices[index].drain().into_iter().map(|m| (index, m)));
            }

            self.outbound
                .send(message)
                .await
                .map_err(|_| Error::transport("outbound channel closed"))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use starwire_devices::device::{DriverContext, CONNECT, CONNECTION, ENABLE, SIMULATION};
    use starwire_devices::devices::dome::{Dome, DOME_SHUTTER, SHUTTER_CLOSE, SHUTTER_OPEN};
    use starwire_devices::devices::rain_detector::{RainDetector, RAIN_ALERT, RAIN_LEVEL, RAIN_RATE, SIM_RAIN_RATE};
    use starwire_devices::property::{PropertyState, PropertyValues, SwitchState};
    use starwire_devices::protocol::PropertyUpdate;

    fn on(element: &str) -> PropertyValues {
        PropertyValues::Switch(vec![(element.to_string(), SwitchState::On)])
    }

    fn request(device: &str, name: &str, values: PropertyValues) -> Message {
        Message::NewProperty {
            device: device.to_string(),
            name: name.to_string(),
            values,
        }
    }

    fn collect(rx: &mut mpsc::Receiver<Message>) -> Vec<Message> {
        let mut out = Vec::new();
        while let Ok(message) = rx.try_recv() {
            out.push(message);
        }
        out
    }

    fn updates<'a>(messages: &'a [Message], device: &str, name: &str) -> Vec<&'a PropertyUpdate> {
        messages
            .iter()
            .filter_map(|m| match m {
                Message::UpdateProperty(u) if u.device == device && u.name == name => Some(u),
                _ => None,
            })
            .collect()
    }

    /// Advance the paused clock by `span`, firing timers at each deadline
    async fn run_for(reactor: &mut Reactor, span: Duration) {
        let end = Instant::now() + span;
        while let Some(next) = reactor.next_deadline().filter(|next| *next <= end) {
            tokio::time::advance(next.saturating_duration_since(Instant::now())).await;
            reactor.fire_timers(Instant::now()).await.unwrap();
        }
        tokio::time::advance(end.saturating_duration_since(Instant::now())).await;
    }

    async fn observatory() -> (Reactor, mpsc::Receiver<Message>) {
        let (context, jobs) = DriverContext::in_memory();
        let (tx, rx) = mpsc::channel(4096);
        let mut reactor = Reactor::new(jobs, tx);

        reactor
            .add_device(Device::new("RainDetector", RainDetector::default(), context.clone()))
            .await
            .unwrap();
        reactor
            .add_device(Device::new(
                "Dome",
                Dome::new("RainDetector").with_travel(Duration::from_millis(500)),
                context,
            ))
            .await
            .unwrap();

        for device in ["RainDetector", "Dome"] {
            reactor.dispatch(request(device, SIMULATION, on(ENABLE))).await.unwrap();
            reactor.dispatch(request(device, CONNECTION, on(CONNECT))).await.unwrap();
        }
        (reactor, rx)
    }

    #[tokio::test]
    async fn test_duplicate_and_unknown_devices() {
        let (context, jobs) = DriverContext::in_memory();
        let (tx, _rx) = mpsc::channel(1024);
        let mut reactor = Reactor::new(jobs, tx);
        reactor
            .add_device(Device::new("Dome", Dome::new("RainDetector"), context.clone()))
            .await
            .unwrap();
        let err = reactor
            .add_device(Device::new("Dome", Dome::new("RainDetector"), context))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateDevice(_)));
        assert!(matches!(
            reactor.remove_device("Mount").await,
            Err(Error::UnknownDevice(_))
        ));
        reactor.dispatch(request("Mount", CONNECTION, on(CONNECT))).await.unwrap();
    }

    #[tokio::test]
    async fn test_subscription_reaches_the_router() {
        let (reactor, mut rx) = observatory().await;
        assert_eq!(reactor.router().subscribers("RainDetector", RAIN_ALERT), vec!["Dome"]);
        let messages = collect(&mut rx);
        assert!(messages
            .iter()
            .any(|m| matches!(m, Message::GetProperties { snoop: true, .. })));
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_rain_closes_the_dome() {
        let (mut reactor, mut rx) = observatory().await;

        reactor.dispatch(request("Dome", DOME_SHUTTER, on(SHUTTER_OPEN))).await.unwrap();
        run_for(&mut reactor, Duration::from_millis(501)).await;
        let messages = collect(&mut rx);
        let shutter = updates(&messages, "Dome", DOME_SHUTTER);
        let last = shutter.last().unwrap();
        assert_eq!(last.state, PropertyState::Ok);
        assert_eq!(last.values.switched_on(), Some(SHUTTER_OPEN));

        reactor
            .dispatch(request(
                "RainDetector",
                SIM_RAIN_RATE,
                PropertyValues::Number(vec![(RAIN_RATE.to_string(), 25.0)]),
            ))
            .await
            .unwrap();
        run_for(&mut reactor, Duration::from_millis(500)).await;

        let messages = collect(&mut rx);
        let alert = updates(&messages, "RainDetector", RAIN_ALERT);
        assert_eq!(alert.last().unwrap().state, PropertyState::Alert);
        let shutter = updates(&messages, "Dome", DOME_SHUTTER);
        let closing = shutter.last().unwrap();
        assert_eq!(closing.state, PropertyState::Busy);
        assert_eq!(closing.values.switched_on(), Some(SHUTTER_CLOSE));

        run_for(&mut reactor, Duration::from_millis(501)).await;
        let messages = collect(&mut rx);
        let closed = updates(&messages, "Dome", DOME_SHUTTER);
        let closed = closed.last().unwrap();
        assert_eq!(closed.state, PropertyState::Ok);
        assert_eq!(closed.values.switched_on(), Some(SHUTTER_CLOSE));
    }

    #[tokio::test]
    async fn test_removed_peer_is_reported_and_subscriber_torn_down() {
        let (mut reactor, mut rx) = observatory().await;
        collect(&mut rx);

        reactor.remove_device("Dome").await.unwrap();
        assert!(reactor.router().is_empty());
        assert_eq!(reactor.device_names(), vec!["RainDetector"]);

        let messages = collect(&mut rx);
        assert!(matches!(
            messages.last(),
            Some(Message::DeleteProperty { device, name: None, .. }) if device == "Dome"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_loop_polls_and_stops() {
        let (reactor, mut rx) = observatory().await;
        collect(&mut rx);
        let shutdown = reactor.shutdown_token();
        let (inbound_tx, inbound_rx) = mpsc::channel(16);
        let task = tokio::spawn(reactor.run(inbound_rx));

        let level = loop {
            match rx.recv().await {
                Some(Message::UpdateProperty(u)) if u.name == RAIN_LEVEL => break u,
                Some(_) => continue,
                None => panic!("reactor stopped early"),
            }
        };
        assert_eq!(level.values.number(RAIN_RATE), Some(0.0));

        inbound_tx
            .send(Message::GetProperties {
                device: Some("Dome".to_string()),
                name: Some(DOME_SHUTTER.to_string()),
                snoop: false,
            })
            .await
            .unwrap();
        loop {
            match rx.recv().await {
                Some(Message::DefineProperty { property, .. }) if property.name() == DOME_SHUTTER => break,
                Some(_) => continue,
                None => panic!("reactor stopped early"),
            }
        }

        shutdown.cancel();
        task.await.unwrap().unwrap();
        let rest = collect(&mut rx);
        assert!(rest
            .iter()
            .any(|m| matches!(m, Message::DeleteProperty { device, name: None, .. } if device == "RainDetector")));
    }
}
