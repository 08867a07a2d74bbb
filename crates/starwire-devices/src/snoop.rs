/*!
 * Subscriber side of the snoop bus.
 *
 * A device records which `(peer device, property)` pairs it watches. The
 * transport forwards every update of a watched pair; this module filters
 * what arrives down to the events the driver should see, dropping records
 * for pairs nobody asked for and records already delivered.
 */
use std::collections::{HashMap, HashSet};

use tracing::trace;

use crate::property::{PropertyState, PropertyValues};
use crate::protocol::{Message, PropertyUpdate};

/// A watched `(peer device, property)` pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SnoopKey {
    /// Peer device
    pub device: String,
    /// Property on the peer
    pub property: String,
}

impl SnoopKey {
    /// Create a key
    pub fn new<D: Into<String>, P: Into<String>>(device: D, property: P) -> Self {
        Self {
            device: device.into(),
            property: property.into(),
        }
    }
}

/// What a driver sees of a peer's property
#[derive(Debug, Clone, PartialEq)]
pub enum SnoopEvent {
    /// The peer defined or updated the property
    Updated {
        /// Peer device
        device: String,
        /// Property name
        property: String,
        /// New state
        state: PropertyState,
        /// Element values
        values: PropertyValues,
    },
    /// The peer deleted the property
    Deleted {
        /// Peer device
        device: String,
        /// Property name
        property: String,
    },
}

impl SnoopEvent {
    /// Peer device
    pub fn device(&self) -> &str {
        match self {
            SnoopEvent::Updated { device, .. } | SnoopEvent::Deleted { device, .. } => device,
        }
    }

    /// Property name
    pub fn property(&self) -> &str {
        match self {
            SnoopEvent::Updated { property, .. } | SnoopEvent::Deleted { property, .. } => property,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Seen {
    Revision(u64),
    Content(PropertyState, PropertyValues),
}

/// Subscriptions of one device and the last delivery per pair
#[derive(Debug, Default)]
pub struct SnoopBus {
    subscriptions: HashSet<SnoopKey>,
    last_seen: HashMap<SnoopKey, Seen>,
}

impl SnoopBus {
    /// Create an empty bus
    pub fn new() -> Self {
        Self::default()
    }

    /// Watch a pair; returns false if it was already watched
    pub fn subscribe(&mut self, key: SnoopKey) -> bool {
        self.subscriptions.insert(key)
    }

    /// Whether a pair is watched
    pub fn is_subscribed(&self, device: &str, property: &str) -> bool {
        self.subscriptions
            .iter()
            .any(|k| k.device == device && k.property == property)
    }

    /// All watched pairs
    pub fn subscriptions(&self) -> impl Iterator<Item = &SnoopKey> {
        self.subscriptions.iter()
    }

    /// Drop all subscriptions
    pub fn clear(&mut self) {
        self.subscriptions.clear();
        self.last_seen.clear();
    }

    /// Filter an incoming record down to events for the driver
    ///
    /// Records about pairs that are not watched and repeated deliveries of
    /// an update already seen yield nothing. Deleting a whole peer device
    /// yields one deletion per watched pair of that device.
    pub fn accept(&mut self, message: &Message) -> Vec<SnoopEvent> {
        match message {
            Message::UpdateProperty(update) => self.accept_update(update).into_iter().collect(),
            Message::DefineProperty { property, .. } => self
                .accept_update(&PropertyUpdate {
                    device: property.device().to_string(),
                    name: property.name().to_string(),
                    state: property.state(),
                    revision: None,
                    values: property.values(),
                    message: None,
                    timestamp: chrono::Utc::now(),
                })
                .into_iter()
                .collect(),
            Message::DeleteProperty { device, name, .. } => {
                let mut keys: Vec<SnoopKey> = self
                    .subscriptions
                    .iter()
                    .filter(|k| &k.device == device && name.as_ref().map_or(true, |n| &k.property == n))
                    .cloned()
                    .collect();
                keys.sort();
                keys.into_iter()
                    .map(|key| {
                        self.last_seen.remove(&key);
                        SnoopEvent::Deleted {
                            device: key.device,
                            property: key.property,
                        }
                    })
                    .collect()
            }
            _ => Vec::new(),
        }
    }

    fn accept_update(&mut self, update: &PropertyUpdate) -> Option<SnoopEvent> {
        let key = SnoopKey::new(update.device.clone(), update.name.clone());
        if !self.subscriptions.contains(&key) {
            return None;
        }

        let seen = match update.revision {
            Some(revision) => Seen::Revision(revision),
            None => Seen::Content(update.state, update.values.clone()),
        };
        if self.last_seen.get(&key) == Some(&seen) {
            trace!("Dropping repeated update of {}.{}", update.device, update.name);
            return None;
        }

        self.last_seen.insert(key, seen);
        Some(SnoopEvent::Updated {
            device: update.device.clone(),
            property: update.name.clone(),
            state: update.state,
            values: update.values.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::property::{LightElement, PropertyBuilder};

    fn status(state: PropertyState) -> crate::property::Property {
        let mut p = PropertyBuilder::new("PeerA", "Status")
            .lights(vec![LightElement::new("STATUS", "Status", PropertyState::Idle)])
            .build()
            .unwrap();
        p.update_values(
            &PropertyValues::Light(vec![("STATUS".to_string(), state)]),
            state,
        )
        .unwrap();
        p
    }

    #[test]
    fn test_single_dispatch_and_duplicate_is_noop() {
        let mut bus = SnoopBus::new();
        assert!(bus.subscribe(SnoopKey::new("PeerA", "Status")));
        assert!(!bus.subscribe(SnoopKey::new("PeerA", "Status")));

        let update = Message::update(&status(PropertyState::Alert), None);
        let events = bus.accept(&update);
        assert_eq!(events.len(), 1);
        match &events[0] {
            SnoopEvent::Updated { state, values, .. } => {
                assert_eq!(*state, PropertyState::Alert);
                assert_eq!(values.light("STATUS"), Some(PropertyState::Alert));
            }
            _ => panic!("expected update"),
        }

        assert!(bus.accept(&update).is_empty());
    }

    #[test]
    fn test_unwatched_pairs_are_ignored() {
        let mut bus = SnoopBus::new();
        bus.subscribe(SnoopKey::new("PeerB", "Status"));
        assert!(bus.accept(&Message::update(&status(PropertyState::Ok), None)).is_empty());
        assert!(bus.accept(&Message::session("PeerA", "hello")).is_empty());
    }

    #[test]
    fn test_updates_without_revision_compare_content() {
        let mut bus = SnoopBus::new();
        bus.subscribe(SnoopKey::new("PeerA", "Status"));

        let mut update = PropertyUpdate::from_property(&status(PropertyState::Ok), None);
        update.revision = None;
        let msg = Message::UpdateProperty(update.clone());
        assert_eq!(bus.accept(&msg).len(), 1);
        assert!(bus.accept(&msg).is_empty());

        update.state = PropertyState::Alert;
        assert_eq!(bus.accept(&Message::UpdateProperty(update)).len(), 1);
    }

    #[test]
    fn test_delete_is_forwarded() {
        let mut bus = SnoopBus::new();
        bus.subscribe(SnoopKey::new("PeerA", "Status"));
        bus.accept(&Message::update(&status(PropertyState::Ok), None));

        let events = bus.accept(&Message::delete("PeerA", Some("Status".to_string()), None));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].property(), "Status");

        // After deletion the same revision counts as new again
        assert_eq!(bus.accept(&Message::update(&status(PropertyState::Ok), None)).len(), 1);
    }

    #[test]
    fn test_whole_device_delete_reports_each_pair() {
        let mut bus = SnoopBus::new();
        bus.subscribe(SnoopKey::new("PeerA", "Status"));
        bus.subscribe(SnoopKey::new("PeerA", "Temperature"));
        bus.subscribe(SnoopKey::new("PeerB", "Status"));

        let events = bus.accept(&Message::delete("PeerA", None, None));
        let names: Vec<&str> = events.iter().map(|e| e.property()).collect();
        assert_eq!(names, vec!["Status", "Temperature"]);
    }
}
