// ── Map registry ──
//
// The set of maps that take part in cross-map propagation. Owned by the
// hub and rebuilt once per refresh cycle: cleared before the merge, then
// repopulated with the maps that survive the cycle.

use std::sync::{Arc, RwLock, Weak};

use tracing::debug;

use super::map::DeviceMap;
use crate::model::DeviceUpdate;
use crate::sync::{read, write};

#[derive(Debug, Default)]
pub(crate) struct RegistryShared {
    maps: RwLock<Vec<DeviceMap>>,
}

/// Registered device maps. Clones share the same registry.
#[derive(Debug, Clone, Default)]
pub struct MapRegistry {
    shared: Arc<RegistryShared>,
}

impl MapRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_shared(shared: Arc<RegistryShared>) -> Self {
        Self { shared }
    }

    /// Register `map`. Registering the same map twice is a no-op.
    pub fn register(&self, map: &DeviceMap) {
        let mut maps = write(&self.shared.maps);
        if maps.iter().any(|m| m.ptr_eq(map)) {
            return;
        }
        map.set_registry(Arc::downgrade(&self.shared));
        maps.push(map.clone());
    }

    pub fn unregister(&self, map: &DeviceMap) {
        let me = Arc::downgrade(&self.shared);
        write(&self.shared.maps).retain(|m| {
            if m.ptr_eq(map) {
                m.release_registry(&me);
                false
            } else {
                true
            }
        });
    }

    pub fn clear_all(&self) {
        let me: Weak<RegistryShared> = Arc::downgrade(&self.shared);
        let maps = std::mem::take(&mut *write(&self.shared.maps));
        for map in &maps {
            map.release_registry(&me);
        }
    }

    pub fn is_registered(&self, map: &DeviceMap) -> bool {
        read(&self.shared.maps).iter().any(|m| m.ptr_eq(map))
    }

    pub fn len(&self) -> usize {
        read(&self.shared.maps).len()
    }

    pub fn is_empty(&self) -> bool {
        read(&self.shared.maps).is_empty()
    }

    /// Push one field write to every registered map holding `device_id`.
    ///
    /// Each target is written with a plain assignment, so propagation never
    /// fans out a second time. Returns how many records changed.
    pub fn propagate(&self, device_id: &str, update: &DeviceUpdate) -> usize {
        if !update.is_synced() {
            return 0;
        }
        let maps = read(&self.shared.maps).clone();
        maps.iter()
            .filter(|map| map.set_field(device_id, update))
            .count()
    }

    /// Re-apply every synced field of every record in `master`, so all
    /// other registered maps converge to the merged values.
    pub fn realign(&self, master: &DeviceMap) {
        let records = master.records();
        for record in &records {
            record.realign();
        }
        debug!(devices = records.len(), maps = self.len(), "realigned device maps");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::{DeviceField, DeviceRecord, StrategyEntry};
    use pretty_assertions::assert_eq;

    fn map_with(label: &str, id: &str) -> DeviceMap {
        DeviceMap::from_records(label, None, [Arc::new(DeviceRecord::new(id))])
    }

    #[test]
    fn register_is_idempotent() {
        let registry = MapRegistry::new();
        let map = map_with("a", "dev1");
        registry.register(&map);
        registry.register(&map);
        assert_eq!(registry.len(), 1);

        registry.unregister(&map);
        assert!(registry.is_empty());
        assert!(map.registry().is_none());
    }

    #[test]
    fn writes_reach_every_registered_map() {
        let registry = MapRegistry::new();
        let a = map_with("a", "dev1");
        let b = map_with("b", "dev1");
        let c = map_with("c", "dev1");
        registry.register(&a);
        registry.register(&b);

        a.get("dev1").unwrap().set_status_value("switch", serde_json::json!(true));

        assert_eq!(
            b.get("dev1").unwrap().status_value("switch"),
            Some(serde_json::json!(true))
        );
        // Not registered, not touched.
        assert_eq!(c.get("dev1").unwrap().status_value("switch"), None);
    }

    #[test]
    fn strategy_writes_propagate_and_invalidate_targets() {
        let registry = MapRegistry::new();
        let a = map_with("a", "dev1");
        let b = map_with("b", "dev1");
        registry.register(&a);
        registry.register(&b);

        let target = b.get("dev1").unwrap();
        a.get("dev1").unwrap().insert_strategy_entry(7, StrategyEntry::new("temp"));

        assert_eq!(target.strategy_version(), 1);
        assert_eq!(target.id_for("temp"), Some(7));
    }

    #[test]
    fn bookkeeping_writes_stay_local() {
        let registry = MapRegistry::new();
        let a = map_with("a", "dev1");
        let b = map_with("b", "dev1");
        registry.register(&a);
        registry.register(&b);

        a.get("dev1").unwrap().set(DeviceUpdate::Source("cloud".into()));
        assert_eq!(b.get("dev1").unwrap().source(), "");
    }

    #[test]
    fn realign_converges_every_synced_field() {
        let registry = MapRegistry::new();
        let master = map_with("master", "dev1");
        let other = map_with("other", "dev1");

        // Diverge while unregistered.
        let merged = master.get("dev1").unwrap();
        merged.set(DeviceUpdate::Name("Heater".into()));
        merged.set(DeviceUpdate::Online(true));
        merged.insert_strategy_entry(1, StrategyEntry::new("switch"));

        registry.register(&master);
        registry.register(&other);
        registry.realign(&master);

        let copy = other.get("dev1").unwrap();
        for field in DeviceField::synced() {
            assert_eq!(copy.get(field), merged.get(field), "{field} diverged");
        }
    }

    #[test]
    fn clear_all_detaches_maps() {
        let registry = MapRegistry::new();
        let a = map_with("a", "dev1");
        let b = map_with("b", "dev1");
        registry.register(&a);
        registry.register(&b);
        registry.clear_all();

        a.get("dev1").unwrap().set(DeviceUpdate::Name("x".into()));
        assert_eq!(b.get("dev1").unwrap().name(), "");
        assert!(a.registry().is_none());
    }
}
