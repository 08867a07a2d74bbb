/*!
 * Dome driver with rain protection.
 *
 * Drives a dome shutter and watches a rain detector's `RainAlert` light.
 * When the light goes Alert the shutter closes on its own; a later
 * non-Alert reading is only logged, reopening stays an operator decision.
 *
 * Wire commands (ASCII, `#` terminated): `V#` answers `DOME<version>#`,
 * `O#` and `C#` start opening and closing and answer `1#`.
 *
 * Shutter travel is tracked as a [`Deadline`]: each timer hit asks for the
 * next step, so the waits shrink as the end nears and the last few
 * milliseconds are spun away.
 */
use std::time::Duration;

use tracing::{debug, info, warn};

use starwire_core::timer::{spin_for, Deadline, DeadlineStep, TimerId};
use tokio::time::Instant;

use crate::connection::io::transact;
use crate::connection::{Handshake, PortIo};
use crate::device::{DeviceCore, Driver, DriverInfo};
use crate::devices::rain_detector::{RAIN_ALERT, RAIN_LIGHT};
use crate::error::{DeviceError, Result};
use crate::property::{PropertyBuilder, PropertyState, PropertyValues, SwitchElement, SwitchRule, SwitchState};
use crate::snoop::SnoopEvent;

/// Shutter switch
pub const DOME_SHUTTER: &str = "DOME_SHUTTER";
/// Open element
pub const SHUTTER_OPEN: &str = "SHUTTER_OPEN";
/// Close element
pub const SHUTTER_CLOSE: &str = "SHUTTER_CLOSE";

const SHUTTER_DONE: &str = "shutter";

/// Dome driver
#[derive(Debug)]
pub struct Dome {
    rain_device: String,
    travel: Duration,
    io_timeout: Duration,
    motion: Option<(TimerId, Deadline)>,
    raining: bool,
}

impl Dome {
    /// Create a driver protected by the rain detector named `rain_device`
    pub fn new<S: Into<String>>(rain_device: S) -> Self {
        Self {
            rain_device: rain_device.into(),
            travel: Duration::from_secs(5),
            io_timeout: Duration::from_secs(2),
            motion: None,
            raining: false,
        }
    }

    /// Set how long the shutter takes to move
    pub fn with_travel(mut self, travel: Duration) -> Self {
        self.travel = travel;
        self
    }

    /// Whether the last rain reading was an alert
    pub fn is_raining(&self) -> bool {
        self.raining
    }

    /// Whether the shutter is closed and at rest
    pub fn is_closed(core: &DeviceCore) -> bool {
        core.property(DOME_SHUTTER)
            .map_or(false, |p| p.first_on() == Some(SHUTTER_CLOSE) && p.state() == PropertyState::Ok)
    }

    fn stop_motion(&mut self, core: &mut DeviceCore) {
        if let Some((id, _)) = self.motion.take() {
            core.remove_timer(id);
        }
    }

    /// Arm the timer for the next step towards `deadline`
    fn arm(&mut self, core: &mut DeviceCore, deadline: Deadline) {
        let wait = match deadline.next_step(Instant::now(), core.polling_period()) {
            DeadlineStep::WaitFor(wait) => wait,
            DeadlineStep::Spin(_) | DeadlineStep::Done => Duration::ZERO,
        };
        self.motion = Some((core.set_timer(wait, SHUTTER_DONE), deadline));
    }

    fn move_shutter(&mut self, core: &mut DeviceCore, target: &str) -> Result<()> {
        self.stop_motion(core);

        let command = if target == SHUTTER_OPEN { "O" } else { "C" };
        let timeout = self.io_timeout;
        if let Some(port) = core.port() {
            let answer = transact(port, command, "#", b'#', timeout)?;
            if answer.trim() != "1" {
                return Err(DeviceError::other(format!("Dome refused {}: '{}'", target, answer)));
            }
        }

        core.update(
            DOME_SHUTTER,
            &PropertyValues::Switch(vec![(target.to_string(), SwitchState::On)]),
            PropertyState::Busy,
        )?;
        core.debug_message(format!("Shutter moving, {} ms to go", self.travel.as_millis()));
        self.arm(core, Deadline::after(self.travel));
        Ok(())
    }

    fn rain_changed(&mut self, core: &mut DeviceCore, alert: bool) -> Result<()> {
        let was_raining = self.raining;
        self.raining = alert;

        if !alert {
            if was_raining {
                info!("Rain alert cleared on {}", self.rain_device);
                core.message("Rain has stopped, it is safe to reopen the shutter");
            }
            return Ok(());
        }

        if !core.is_connected() {
            warn!("Rain alert while {} is offline, cannot close", core.name());
            return Ok(());
        }
        let closing = core
            .property(DOME_SHUTTER)
            .map_or(false, |p| p.first_on() == Some(SHUTTER_CLOSE));
        if closing {
            debug!("Rain alert, shutter already closed or closing");
            return Ok(());
        }

        core.message("Rain alert, closing the shutter");
        self.move_shutter(core, SHUTTER_CLOSE)
    }
}

impl Handshake for Dome {
    fn handshake(&mut self, port: Option<&mut dyn PortIo>) -> Result<()> {
        let port = match port {
            Some(port) => port,
            None => return Ok(()),
        };
        let answer = transact(port, "V", "#", b'#', self.io_timeout)?;
        if !answer.starts_with("DOME") {
            return Err(DeviceError::handshake(format!("Unexpected answer '{}'", answer)));
        }
        Ok(())
    }
}

impl Driver for Dome {
    fn driver_info(&self) -> DriverInfo {
        DriverInfo {
            name: "Dome".to_string(),
            exec: "starwire-dome".to_string(),
            version: crate::VERSION.to_string(),
            interface: "dome".to_string(),
        }
    }

    fn init_properties(&mut self, core: &mut DeviceCore) -> Result<()> {
        core.snoop(self.rain_device.clone(), RAIN_ALERT);
        Ok(())
    }

    fn update_properties(&mut self, core: &mut DeviceCore) -> Result<()> {
        if !core.is_connected() {
            self.motion = None;
            return core.delete_if_defined(DOME_SHUTTER);
        }
        core.define(
            PropertyBuilder::new(core.name(), DOME_SHUTTER)
                .label("Shutter")
                .group("Main Control")
                .timeout(self.travel.as_secs_f64() * 2.0)
                .switches(
                    SwitchRule::OneOfMany,
                    vec![
                        SwitchElement::new(SHUTTER_OPEN, "Open", SwitchState::Off),
                        SwitchElement::new(SHUTTER_CLOSE, "Close", SwitchState::On),
                    ],
                )
                .state(PropertyState::Ok)
                .build()?,
        )?;
        if self.raining {
            core.message("Rain alert is active, keep the shutter closed");
        }
        Ok(())
    }

    fn disconnect(&mut self, core: &mut DeviceCore) -> Result<()> {
        self.stop_motion(core);
        Ok(())
    }

    fn new_switch(&mut self, core: &mut DeviceCore, name: &str, values: &[(String, SwitchState)]) -> Result<bool> {
        if name != DOME_SHUTTER {
            return Ok(false);
        }
        let target = PropertyValues::Switch(values.to_vec())
            .switched_on()
            .map(str::to_string)
            .ok_or_else(|| DeviceError::InvalidStateTransition(name.to_string(), "no direction requested".to_string()))?;
        if target == SHUTTER_OPEN && self.raining {
            return Err(DeviceError::InvalidStateTransition(
                name.to_string(),
                "rain alert is active".to_string(),
            ));
        }
        // Validate against the vector before moving anything
        core.property(name)
            .cloned()
            .ok_or_else(|| DeviceError::UnknownProperty(name.to_string()))?
            .apply_switch_states(values, PropertyState::Busy)?;

        self.move_shutter(core, &target)?;
        Ok(true)
    }

    fn snoop(&mut self, core: &mut DeviceCore, event: &SnoopEvent) -> Result<()> {
        match event {
            SnoopEvent::Updated { property, state, values, .. } if property == RAIN_ALERT => {
                let alert = *state == PropertyState::Alert || values.light(RAIN_LIGHT) == Some(PropertyState::Alert);
                self.rain_changed(core, alert)
            }
            SnoopEvent::Deleted { device, property } => {
                warn!("{}.{} went away, rain protection is inactive", device, property);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn timer_hit(&mut self, core: &mut DeviceCore, tag: &'static str) -> Result<()> {
        if tag != SHUTTER_DONE {
            return Ok(());
        }
        let deadline = match self.motion.take() {
            Some((_, deadline)) => deadline,
            None => return Ok(()),
        };
        match deadline.next_step(Instant::now(), core.polling_period()) {
            DeadlineStep::WaitFor(_) => {
                self.arm(core, deadline);
                return Ok(());
            }
            DeadlineStep::Spin(residual) => spin_for(residual),
            DeadlineStep::Done => {}
        }
        if !core.registry().contains(DOME_SHUTTER) {
            return Ok(());
        }
        core.set_state(DOME_SHUTTER, PropertyState::Ok, None)?;
        let position = if Self::is_closed(core) { "closed" } else { "open" };
        core.message(format!("Shutter is {}", position));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::Instant;

    use super::*;
    use crate::device::{Device, DriverContext, CONNECTION, CONNECT, ENABLE, SIMULATION};
    use crate::property::{LightElement, Property};
    use crate::protocol::Message;

    fn on(element: &str) -> PropertyValues {
        PropertyValues::Switch(vec![(element.to_string(), SwitchState::On)])
    }

    fn rain_light(state: PropertyState, revision_bumps: usize) -> Property {
        let mut p = PropertyBuilder::new("RainDetector", RAIN_ALERT)
            .lights(vec![LightElement::new(RAIN_LIGHT, "Rain", PropertyState::Idle)])
            .build()
            .unwrap();
        for _ in 0..revision_bumps {
            p.update_values(&PropertyValues::Light(vec![(RAIN_LIGHT.to_string(), state)]), state)
                .unwrap();
        }
        p
    }

    async fn online_dome() -> Device<Dome> {
        let (context, _jobs) = DriverContext::in_memory();
        let driver = Dome::new("RainDetector").with_travel(Duration::from_millis(500));
        let mut device = Device::new("Dome", driver, context);
        device.start().unwrap();
        device.handle_new(SIMULATION, &on(ENABLE)).await.unwrap();
        device.handle_new(CONNECTION, &on(CONNECT)).await.unwrap();
        device.drain();
        device
    }

    /// Let the clock run until no timer is left
    async fn settle(device: &mut Device<Dome>) {
        while let Some(next) = device.core().next_deadline() {
            tokio::time::advance(next.saturating_duration_since(Instant::now())).await;
            device.fire_timers(Instant::now()).unwrap();
        }
    }

    #[tokio::test]
    async fn test_subscribes_to_rain_alert() {
        let (context, _jobs) = DriverContext::in_memory();
        let mut device = Device::new("Dome", Dome::new("RainDetector"), context);
        device.start().unwrap();
        let keys = device.core().snoop_subscriptions();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].device, "RainDetector");
        assert_eq!(keys[0].property, RAIN_ALERT);
    }

    #[tokio::test(start_paused = true)]
    async fn test_operator_opens_and_closes() {
        let mut device = online_dome().await;
        assert!(Dome::is_closed(device.core()));

        device.handle_new(DOME_SHUTTER, &on(SHUTTER_OPEN)).await.unwrap();
        let shutter = device.core().property(DOME_SHUTTER).unwrap();
        assert_eq!(shutter.state(), PropertyState::Busy);
        assert_eq!(shutter.first_on(), Some(SHUTTER_OPEN));

        settle(&mut device).await;
        let shutter = device.core().property(DOME_SHUTTER).unwrap();
        assert_eq!(shutter.state(), PropertyState::Ok);
        assert_eq!(shutter.first_on(), Some(SHUTTER_OPEN));
    }

    #[tokio::test(start_paused = true)]
    async fn test_travel_waits_shrink_towards_the_end() {
        let mut device = online_dome().await;
        let start = Instant::now();
        device.handle_new(DOME_SHUTTER, &on(SHUTTER_OPEN)).await.unwrap();

        let first = device.core().next_deadline().unwrap() - start;
        assert!(first < Duration::from_millis(500));
        assert!(first >= Duration::from_millis(400));

        tokio::time::advance(first).await;
        assert_eq!(device.fire_timers(Instant::now()).unwrap(), 1);
        let shutter = device.core().property(DOME_SHUTTER).unwrap();
        assert_eq!(shutter.state(), PropertyState::Busy);
        assert_eq!(device.core().pending_timers(), 1);

        let second = device.core().next_deadline().unwrap() - Instant::now();
        assert!(second < first);
        assert!(second < Duration::from_millis(100));

        let mut hits = 1;
        while let Some(next) = device.core().next_deadline() {
            tokio::time::advance(next.saturating_duration_since(Instant::now())).await;
            hits += device.fire_timers(Instant::now()).unwrap();
        }
        assert!(hits >= 2);
        assert!(Instant::now() - start <= Duration::from_millis(500));
        let shutter = device.core().property(DOME_SHUTTER).unwrap();
        assert_eq!(shutter.state(), PropertyState::Ok);
        assert_eq!(shutter.first_on(), Some(SHUTTER_OPEN));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rain_alert_closes_shutter_without_command() {
        let mut device = online_dome().await;
        device.handle_new(DOME_SHUTTER, &on(SHUTTER_OPEN)).await.unwrap();
        settle(&mut device).await;
        device.drain();

        device
            .handle(&Message::update(&rain_light(PropertyState::Alert, 1), None))
            .await
            .unwrap();
        assert!(device.driver().is_raining());
        let shutter = device.core().property(DOME_SHUTTER).unwrap();
        assert_eq!(shutter.state(), PropertyState::Busy);
        assert_eq!(shutter.first_on(), Some(SHUTTER_CLOSE));

        settle(&mut device).await;
        assert!(Dome::is_closed(device.core()));

        // Reopening is refused while the alert holds
        device.handle_new(DOME_SHUTTER, &on(SHUTTER_OPEN)).await.unwrap();
        let shutter = device.core().property(DOME_SHUTTER).unwrap();
        assert_eq!(shutter.state(), PropertyState::Alert);
        assert_eq!(shutter.first_on(), Some(SHUTTER_CLOSE));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleared_alert_only_logs() {
        let mut device = online_dome().await;
        device.handle_new(DOME_SHUTTER, &on(SHUTTER_OPEN)).await.unwrap();
        settle(&mut device).await;
        device
            .handle(&Message::update(&rain_light(PropertyState::Alert, 1), None))
            .await
            .unwrap();
        settle(&mut device).await;
        device.drain();

        device
            .handle(&Message::update(&rain_light(PropertyState::Ok, 2), None))
            .await
            .unwrap();
        assert!(!device.driver().is_raining());
        assert!(Dome::is_closed(device.core()));
        assert_eq!(device.core().pending_timers(), 0);
        let messages = device.drain();
        assert!(messages.iter().any(|m| matches!(m, Message::Message { message, .. } if message.contains("safe to reopen"))));
        assert!(!messages.iter().any(|m| matches!(m, Message::UpdateProperty(u) if u.name == DOME_SHUTTER)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_alert_is_ignored() {
        let mut device = online_dome().await;
        device.handle_new(DOME_SHUTTER, &on(SHUTTER_OPEN)).await.unwrap();
        settle(&mut device).await;

        let alert = Message::update(&rain_light(PropertyState::Alert, 1), None);
        device.handle(&alert).await.unwrap();
        device.drain();
        device.handle(&alert).await.unwrap();
        assert!(device.drain().is_empty());
        assert_eq!(device.core().pending_timers(), 1);
    }
}
