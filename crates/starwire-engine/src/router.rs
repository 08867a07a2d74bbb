/*!
 * Transport side of snooping.
 *
 * Devices announce interest in a peer's property with a `getProperties`
 * record carrying the snoop flag. The router remembers who asked, and the
 * reactor consults it to decide which hosted devices see each published
 * record.
 */
use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use starwire_devices::SnoopKey;

/// Subscription table: watched pair to subscribing device names
#[derive(Debug, Default)]
pub struct SnoopRouter {
    routes: BTreeMap<SnoopKey, BTreeSet<String>>,
}

impl SnoopRouter {
    /// Create an empty router
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `subscriber` watches `key`; false if it already did
    pub fn subscribe<S: Into<String>>(&mut self, subscriber: S, key: SnoopKey) -> bool {
        let subscriber = subscriber.into();
        debug!("{} subscribes to {}.{}", subscriber, key.device, key.property);
        self.routes.entry(key).or_default().insert(subscriber)
    }

    /// Drop every subscription held by a device that went away
    pub fn remove_subscriber(&mut self, subscriber: &str) -> usize {
        let mut removed = 0;
        for subscribers in self.routes.values_mut() {
            if subscribers.remove(subscriber) {
                removed += 1;
            }
        }
        self.routes.retain(|_, subscribers| !subscribers.is_empty());
        removed
    }

    /// Devices watching one property of `device`
    pub fn subscribers(&self, device: &str, property: &str) -> Vec<String> {
        self.routes
            .get(&SnoopKey::new(device, property))
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Devices watching any property of `device`
    pub fn subscribers_of_device(&self, device: &str) -> Vec<String> {
        let all: BTreeSet<&String> = self
            .routes
            .iter()
            .filter(|(key, _)| key.device == device)
            .flat_map(|(_, subscribers)| subscribers.iter())
            .collect();
        all.into_iter().cloned().collect()
    }

    /// Number of watched pairs
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether nothing is watched
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
