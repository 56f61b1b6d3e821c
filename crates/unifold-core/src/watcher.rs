// ── Device watcher ──
//
// Debug aid: traffic touching a watched device id is logged at warn level
// so it stands out without turning on debug logging globally.

use std::collections::HashSet;

use tracing::warn;

use crate::store::DeviceMap;

#[derive(Debug, Clone, Default)]
pub struct DeviceWatcher {
    watched: HashSet<String>,
}

impl DeviceWatcher {
    pub fn new(ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            watched: ids.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_watched(&self, device_id: &str) -> bool {
        self.watched.contains(device_id)
    }

    /// Log the message built by `message` if `device_id` is watched. The
    /// closure only runs for watched ids. The device name is looked up in
    /// `master` when present.
    pub fn report(
        &self,
        master: &DeviceMap,
        device_id: &str,
        message: impl FnOnce() -> String,
    ) -> bool {
        if !self.is_watched(device_id) {
            return false;
        }
        let name = master.get(device_id).map(|r| r.name()).unwrap_or_default();
        let message = message();
        warn!(device_id, device_name = %name, "watched device: {message}");
        true
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    #[test]
    fn only_watched_devices_are_reported() {
        let watcher = DeviceWatcher::new(["dev1"]);
        let master = DeviceMap::new("master", None);
        assert!(watcher.report(&master, "dev1", || "hello".into()));
        assert!(!watcher.report(&master, "dev2", || "hello".into()));
    }

    #[test]
    fn unwatched_traffic_never_builds_the_message() {
        let watcher = DeviceWatcher::new(["dev1"]);
        let master = DeviceMap::new("master", None);
        let built = Cell::new(0);
        let message = || {
            built.set(built.get() + 1);
            String::from("payload")
        };

        watcher.report(&master, "dev2", message);
        assert_eq!(built.get(), 0);
        watcher.report(&master, "dev1", message);
        assert_eq!(built.get(), 1);
    }
}
