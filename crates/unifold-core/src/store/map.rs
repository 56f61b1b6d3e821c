// ── Device map ──
//
// A labelled collection of device records keyed by device id. Used both
// as a source's private snapshot and as the merged master view. Cheap to
// clone: clones share the same storage.

use std::fmt;
use std::sync::{Arc, RwLock, Weak};

use dashmap::DashMap;

use super::registry::{MapRegistry, RegistryShared};
use crate::model::{DeviceRecord, DeviceUpdate};
use crate::sync::{read, write};

pub(crate) struct MapShared {
    label: String,
    priority: Option<i32>,
    records: DashMap<String, Arc<DeviceRecord>>,
    registry: RwLock<Weak<RegistryShared>>,
}

impl MapShared {
    /// The registry this map is currently registered with.
    pub(crate) fn registry(&self) -> Option<MapRegistry> {
        read(&self.registry).upgrade().map(MapRegistry::from_shared)
    }
}

impl fmt::Debug for MapShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MapShared")
            .field("label", &self.label)
            .field("priority", &self.priority)
            .field("len", &self.records.len())
            .finish_non_exhaustive()
    }
}

/// Records keyed by device id, tagged with an optional source priority.
#[derive(Debug, Clone)]
pub struct DeviceMap {
    shared: Arc<MapShared>,
}

impl DeviceMap {
    pub fn new(label: impl Into<String>, priority: Option<i32>) -> Self {
        Self {
            shared: Arc::new(MapShared {
                label: label.into(),
                priority,
                records: DashMap::new(),
                registry: RwLock::new(Weak::new()),
            }),
        }
    }

    /// Build a map and take ownership of every record.
    pub fn from_records(
        label: impl Into<String>,
        priority: Option<i32>,
        records: impl IntoIterator<Item = Arc<DeviceRecord>>,
    ) -> Self {
        let map = Self::new(label, priority);
        for record in records {
            map.insert(record);
        }
        map
    }

    pub(crate) fn from_shared(shared: Arc<MapShared>) -> Self {
        Self { shared }
    }

    pub fn label(&self) -> &str {
        &self.shared.label
    }

    pub fn priority(&self) -> Option<i32> {
        self.shared.priority
    }

    /// Whether both handles point at the same map.
    pub fn ptr_eq(&self, other: &DeviceMap) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// The registry this map currently participates in, if any.
    pub fn registry(&self) -> Option<MapRegistry> {
        self.shared.registry()
    }

    pub(crate) fn set_registry(&self, registry: Weak<RegistryShared>) {
        *write(&self.shared.registry) = registry;
    }

    pub(crate) fn release_registry(&self, registry: &Weak<RegistryShared>) {
        let mut current = write(&self.shared.registry);
        if Weak::ptr_eq(&current, registry) {
            *current = Weak::new();
        }
    }

    // ── Records ──────────────────────────────────────────────────────

    /// Insert a record and make this map its owner. Returns the record it replaced.
    pub fn insert(&self, record: Arc<DeviceRecord>) -> Option<Arc<DeviceRecord>> {
        let me = Arc::downgrade(&self.shared);
        let previous = self
            .shared
            .records
            .insert(record.id().to_owned(), Arc::clone(&record));
        if let Some(old) = &previous {
            if !Arc::ptr_eq(old, &record) {
                old.release_owner(&me);
            }
        }
        record.set_owner(me);
        previous
    }

    pub fn get(&self, device_id: &str) -> Option<Arc<DeviceRecord>> {
        self.shared
            .records
            .get(device_id)
            .map(|r| Arc::clone(r.value()))
    }

    pub fn contains(&self, device_id: &str) -> bool {
        self.shared.records.contains_key(device_id)
    }

    pub fn remove(&self, device_id: &str) -> Option<Arc<DeviceRecord>> {
        let (_, record) = self.shared.records.remove(device_id)?;
        record.release_owner(&Arc::downgrade(&self.shared));
        Some(record)
    }

    pub fn clear(&self) {
        let me = Arc::downgrade(&self.shared);
        for record in self.records() {
            record.release_owner(&me);
        }
        self.shared.records.clear();
    }

    pub fn len(&self) -> usize {
        self.shared.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.records.is_empty()
    }

    /// Device ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.shared.records.iter().map(|r| r.key().clone()).collect();
        ids.sort_unstable();
        ids
    }

    /// Snapshot of every record, sorted by device id.
    pub fn records(&self) -> Vec<Arc<DeviceRecord>> {
        let mut records: Vec<Arc<DeviceRecord>> = self
            .shared
            .records
            .iter()
            .map(|r| Arc::clone(r.value()))
            .collect();
        records.sort_by(|a, b| a.id().cmp(b.id()));
        records
    }

    /// Plain write used by propagation: applies `update` to the record
    /// holding `device_id` only if the field is synced and the value differs.
    /// Never re-triggers propagation.
    pub(crate) fn set_field(&self, device_id: &str, update: &DeviceUpdate) -> bool {
        if !update.is_synced() {
            return false;
        }
        self.get(device_id)
            .is_some_and(|record| record.assign_if_changed(update))
    }
}
