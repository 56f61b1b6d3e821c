// ── Unified device record ──
//
// One physical device as seen by one source, or the merged truth held by
// the master map. All fields are private; every write goes through
// `DeviceRecord::set`, which mirrors the value to the origin record (if
// any) and broadcasts it to every registered map holding the same id.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock, Weak};

use serde_json::Value;
use tracing::debug;

use super::descriptor::{Capability, StatusMap, StatusRange, StrategyEntry, StrategyTable};
use super::field::{DeviceField, DeviceUpdate};
use crate::store::map::{DeviceMap, MapShared};
use crate::store::registry::MapRegistry;
use crate::sync::{lock, read, write};

/// Plain data behind a record's lock.
#[derive(Debug, Clone, Default)]
pub(crate) struct DeviceState {
    pub name: String,
    pub category: String,
    pub product_id: String,
    pub product_name: String,
    pub online: bool,
    pub online_states: BTreeMap<String, bool>,
    pub status: StatusMap,
    pub capabilities: BTreeMap<String, Capability>,
    pub status_ranges: BTreeMap<String, StatusRange>,
    pub local_strategy: StrategyTable,
    pub force_compatibility: bool,
    pub preferences: BTreeMap<String, Value>,
    pub source: String,
    pub source_priority: Option<i32>,
    /// Bumped on every write to `local_strategy`.
    pub strategy_version: u64,
}

/// Derived code <-> numeric id lookups, valid for one strategy version.
#[derive(Debug, Default)]
struct StrategyCache {
    version: Option<u64>,
    code_to_id: HashMap<String, u32>,
    id_to_code: HashMap<u32, String>,
}

impl StrategyCache {
    fn rebuild(&mut self, table: &StrategyTable, version: u64) {
        self.code_to_id.clear();
        self.id_to_code.clear();
        for (&id, entry) in table {
            let Some(code) = entry.canonical() else {
                continue;
            };
            self.id_to_code.insert(id, code.to_owned());
            self.code_to_id.insert(code.to_owned(), id);
            for alias in &entry.aliases {
                self.code_to_id.insert(alias.clone(), id);
            }
        }
        self.version = Some(version);
    }
}

/// One device's state from one source, or the merged view.
#[derive(Debug)]
pub struct DeviceRecord {
    id: String,
    state: RwLock<DeviceState>,
    cache: Mutex<StrategyCache>,
    owner: RwLock<Weak<MapShared>>,
    origin: RwLock<Option<Weak<DeviceRecord>>>,
}

impl DeviceRecord {
    /// Create an empty record for `id`.
    pub fn new(id: impl Into<String>) -> Self {
        Self::with_state(id.into(), DeviceState::default())
    }

    pub(crate) fn with_state(id: String, state: DeviceState) -> Self {
        Self {
            id,
            state: RwLock::new(state),
            cache: Mutex::new(StrategyCache::default()),
            owner: RwLock::new(Weak::new()),
            origin: RwLock::new(None),
        }
    }

    /// Copy `origin` into a new record tagged with another source.
    ///
    /// With `keep_synced`, the new record holds a weak back-reference and
    /// mirrors every synced write to `origin` whenever the values differ.
    pub fn derive_from(
        origin: &Arc<DeviceRecord>,
        source: impl Into<String>,
        source_priority: Option<i32>,
        keep_synced: bool,
    ) -> Arc<DeviceRecord> {
        let mut state = read(&origin.state).clone();
        state.source = source.into();
        state.source_priority = source_priority;
        let record = Self::with_state(origin.id.clone(), state);
        if keep_synced {
            *write(&record.origin) = Some(Arc::downgrade(origin));
        }
        Arc::new(record)
    }

    // ── Identity & bookkeeping ───────────────────────────────────────

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn source(&self) -> String {
        read(&self.state).source.clone()
    }

    pub fn source_priority(&self) -> Option<i32> {
        read(&self.state).source_priority
    }

    /// The map this record was last inserted into, if it still exists.
    pub fn owner(&self) -> Option<DeviceMap> {
        read(&self.owner).upgrade().map(DeviceMap::from_shared)
    }

    pub(crate) fn set_owner(&self, owner: Weak<MapShared>) {
        *write(&self.owner) = owner;
    }

    /// Drop the owner link if it still points at `map`.
    pub(crate) fn release_owner(&self, map: &Weak<MapShared>) {
        let mut owner = write(&self.owner);
        if Weak::ptr_eq(&owner, map) {
            *owner = Weak::new();
        }
    }

    /// The record this one mirrors its writes to.
    pub fn origin(&self) -> Option<Arc<DeviceRecord>> {
        read(&self.origin).as_ref().and_then(Weak::upgrade)
    }

    pub fn strategy_version(&self) -> u64 {
        read(&self.state).strategy_version
    }

    /// Strategy version the lookup cache was built for, `None` before the first build.
    pub fn cache_version(&self) -> Option<u64> {
        lock(&self.cache).version
    }

    // ── Field reads ──────────────────────────────────────────────────

    pub fn name(&self) -> String {
        read(&self.state).name.clone()
    }

    pub fn category(&self) -> String {
        read(&self.state).category.clone()
    }

    pub fn online(&self) -> bool {
        read(&self.state).online
    }

    pub fn online_states(&self) -> BTreeMap<String, bool> {
        read(&self.state).online_states.clone()
    }

    pub fn status(&self) -> StatusMap {
        read(&self.state).status.clone()
    }

    pub fn status_value(&self, code: &str) -> Option<Value> {
        read(&self.state).status.get(code).cloned()
    }

    pub fn capabilities(&self) -> BTreeMap<String, Capability> {
        read(&self.state).capabilities.clone()
    }

    pub fn status_ranges(&self) -> BTreeMap<String, StatusRange> {
        read(&self.state).status_ranges.clone()
    }

    pub fn local_strategy(&self) -> StrategyTable {
        read(&self.state).local_strategy.clone()
    }

    pub fn force_compatibility(&self) -> bool {
        read(&self.state).force_compatibility
    }

    pub fn preferences(&self) -> BTreeMap<String, Value> {
        read(&self.state).preferences.clone()
    }

    pub fn preference(&self, key: &str) -> Option<Value> {
        read(&self.state).preferences.get(key).cloned()
    }

    pub(crate) fn state(&self) -> DeviceState {
        read(&self.state).clone()
    }

    /// Current value of a settable field; `None` for bookkeeping-only fields.
    pub fn get(&self, field: DeviceField) -> Option<DeviceUpdate> {
        let s = read(&self.state);
        let update = match field {
            DeviceField::Name => DeviceUpdate::Name(s.name.clone()),
            DeviceField::Category => DeviceUpdate::Category(s.category.clone()),
            DeviceField::ProductId => DeviceUpdate::ProductId(s.product_id.clone()),
            DeviceField::ProductName => DeviceUpdate::ProductName(s.product_name.clone()),
            DeviceField::Online => DeviceUpdate::Online(s.online),
            DeviceField::OnlineStates => DeviceUpdate::OnlineStates(s.online_states.clone()),
            DeviceField::Status => DeviceUpdate::Status(s.status.clone()),
            DeviceField::Capabilities => DeviceUpdate::Capabilities(s.capabilities.clone()),
            DeviceField::StatusRanges => DeviceUpdate::StatusRanges(s.status_ranges.clone()),
            DeviceField::LocalStrategy => DeviceUpdate::LocalStrategy(s.local_strategy.clone()),
            DeviceField::ForceCompatibility => {
                DeviceUpdate::ForceCompatibility(s.force_compatibility)
            }
            DeviceField::Preferences => DeviceUpdate::Preferences(s.preferences.clone()),
            DeviceField::Source => DeviceUpdate::Source(s.source.clone()),
            DeviceField::SourcePriority => DeviceUpdate::SourcePriority(s.source_priority),
            DeviceField::Id
            | DeviceField::Owner
            | DeviceField::Origin
            | DeviceField::CodeToId
            | DeviceField::IdToCode
            | DeviceField::StrategyVersion
            | DeviceField::CacheVersion => return None,
        };
        Some(update)
    }

    // ── Field writes ─────────────────────────────────────────────────

    /// Write one field.
    ///
    /// Synced fields are then mirrored to the origin record when its value
    /// differs, and broadcast to every registered map holding this id.
    /// The broadcast fires even when the value did not change; realignment
    /// relies on that.
    pub fn set(&self, update: DeviceUpdate) {
        self.assign(update.clone());
        if !update.is_synced() {
            return;
        }

        if let Some(origin) = self.origin() {
            if origin.get(update.field()).as_ref() != Some(&update) {
                origin.set(update.clone());
            }
        }

        if let Some(registry) = self.registry() {
            registry.propagate(&self.id, &update);
        }
    }

    /// `set`, skipped entirely when the value is already current.
    pub fn set_if_changed(&self, update: DeviceUpdate) -> bool {
        if self.get(update.field()).as_ref() == Some(&update) {
            return false;
        }
        self.set(update);
        true
    }

    /// Plain assignment: no mirroring, no propagation.
    pub(crate) fn assign(&self, update: DeviceUpdate) {
        let mut s = write(&self.state);
        match update {
            DeviceUpdate::Name(v) => s.name = v,
            DeviceUpdate::Category(v) => s.category = v,
            DeviceUpdate::ProductId(v) => s.product_id = v,
            DeviceUpdate::ProductName(v) => s.product_name = v,
            DeviceUpdate::Online(v) => s.online = v,
            DeviceUpdate::OnlineStates(v) => s.online_states = v,
            DeviceUpdate::Status(v) => s.status = v,
            DeviceUpdate::Capabilities(v) => s.capabilities = v,
            DeviceUpdate::StatusRanges(v) => s.status_ranges = v,
            DeviceUpdate::LocalStrategy(v) => {
                s.local_strategy = v;
                s.strategy_version += 1;
            }
            DeviceUpdate::ForceCompatibility(v) => s.force_compatibility = v,
            DeviceUpdate::Preferences(v) => s.preferences = v,
            DeviceUpdate::Source(v) => s.source = v,
            DeviceUpdate::SourcePriority(v) => s.source_priority = v,
        }
    }

    /// Plain assignment if the value differs. Used by propagation.
    pub(crate) fn assign_if_changed(&self, update: &DeviceUpdate) -> bool {
        if self.get(update.field()).as_ref() == Some(update) {
            return false;
        }
        self.assign(update.clone());
        true
    }

    /// Re-set every synced field to its current value so the registry
    /// pushes this record's values into every other registered map.
    pub fn realign(&self) {
        for field in DeviceField::synced() {
            if let Some(update) = self.get(field) {
                self.set(update);
            }
        }
    }

    fn registry(&self) -> Option<MapRegistry> {
        read(&self.owner).upgrade().and_then(|map| map.registry())
    }

    // ── Collection helpers (all routed through `set`) ────────────────

    pub fn set_status_value(&self, code: impl Into<String>, value: Value) {
        let mut status = self.status();
        status.insert(code.into(), value);
        self.set(DeviceUpdate::Status(status));
    }

    pub fn remove_status(&self, code: &str) -> Option<Value> {
        let mut status = self.status();
        let removed = status.remove(code);
        if removed.is_some() {
            self.set(DeviceUpdate::Status(status));
        }
        removed
    }

    pub fn set_online_state(&self, source: impl Into<String>, online: bool) {
        let mut states = self.online_states();
        states.insert(source.into(), online);
        self.set(DeviceUpdate::OnlineStates(states));
    }

    pub fn set_preference(&self, key: impl Into<String>, value: Value) {
        let mut prefs = self.preferences();
        prefs.insert(key.into(), value);
        self.set(DeviceUpdate::Preferences(prefs));
    }

    // ── Strategy table wrappers ──────────────────────────────────────
    //
    // Each one bumps the strategy version through `set`, which leaves the
    // lookup cache stale until the next read.

    pub fn insert_strategy_entry(&self, id: u32, entry: StrategyEntry) -> Option<StrategyEntry> {
        let mut table = self.local_strategy();
        let previous = table.insert(id, entry);
        self.set(DeviceUpdate::LocalStrategy(table));
        previous
    }

    pub fn remove_strategy_entry(&self, id: u32) -> Option<StrategyEntry> {
        let mut table = self.local_strategy();
        let removed = table.remove(&id);
        self.set(DeviceUpdate::LocalStrategy(table));
        removed
    }

    pub fn clear_strategy(&self) {
        self.set(DeviceUpdate::LocalStrategy(StrategyTable::new()));
    }

    /// Edit one entry in place. Returns `false` if `id` has no entry.
    pub fn update_strategy_entry(&self, id: u32, edit: impl FnOnce(&mut StrategyEntry)) -> bool {
        let mut table = self.local_strategy();
        let Some(entry) = table.get_mut(&id) else {
            return false;
        };
        edit(entry);
        self.set(DeviceUpdate::LocalStrategy(table));
        true
    }

    // ── Identifier resolution ────────────────────────────────────────

    fn with_cache<R>(&self, lookup: impl FnOnce(&StrategyCache) -> R) -> R {
        let mut cache = lock(&self.cache);
        {
            let state = read(&self.state);
            if cache.version != Some(state.strategy_version) {
                cache.rebuild(&state.local_strategy, state.strategy_version);
                debug!(
                    device_id = %self.id,
                    version = state.strategy_version,
                    "rebuilt strategy lookup cache"
                );
            }
        }
        lookup(&cache)
    }

    /// Numeric id for a canonical or alias code.
    pub fn id_for(&self, code: &str) -> Option<u32> {
        self.with_cache(|c| c.code_to_id.get(code).copied())
    }

    /// Canonical code for a numeric id.
    pub fn code_for(&self, id: u32) -> Option<String> {
        self.with_cache(|c| c.id_to_code.get(&id).cloned())
    }

    /// Like [`id_for`](Self::id_for), preferring a non-zero id carried by
    /// the status range of `code`.
    pub fn resolve_id(&self, code: &str) -> Option<u32> {
        let from_range = read(&self.state)
            .status_ranges
            .get(code)
            .map(|r| r.dp_id)
            .filter(|&id| id != 0);
        from_range.or_else(|| self.id_for(code))
    }

    /// Alias code -> canonical code, across the whole strategy table.
    pub fn all_status_code_aliases(&self) -> BTreeMap<String, String> {
        let state = read(&self.state);
        let mut aliases = BTreeMap::new();
        for entry in state.local_strategy.values() {
            if let Some(code) = entry.canonical() {
                for alias in &entry.aliases {
                    aliases.insert(alias.clone(), code.to_owned());
                }
            }
        }
        aliases
    }

    /// Rename status code `orig` to `new` everywhere it appears.
    ///
    /// In the strategy table the old canonical code becomes an alias of the
    /// new one, and the first key of the entry's `status_format` is renamed.
    pub fn replace_status_code(&self, orig: &str, new: &str) {
        let mut ranges = self.status_ranges();
        if let Some(mut range) = ranges.remove(orig) {
            new.clone_into(&mut range.code);
            ranges.insert(new.to_owned(), range);
            self.set(DeviceUpdate::StatusRanges(ranges));
        }

        let mut caps = self.capabilities();
        if let Some(mut cap) = caps.remove(orig) {
            new.clone_into(&mut cap.code);
            caps.insert(new.to_owned(), cap);
            self.set(DeviceUpdate::Capabilities(caps));
        }

        let mut status = self.status();
        if let Some(value) = status.remove(orig) {
            status.insert(new.to_owned(), value);
            self.set(DeviceUpdate::Status(status));
        }

        let target = self
            .local_strategy()
            .into_iter()
            .find(|(_, entry)| entry.canonical() == Some(orig))
            .map(|(id, _)| id);
        if let Some(id) = target {
            self.update_strategy_entry(id, |entry| {
                entry.status_code = Some(new.to_owned());
                entry.aliases.retain(|a| a != new);
                if !entry.aliases.iter().any(|a| a == orig) {
                    entry.aliases.push(orig.to_owned());
                }
                if let Some(item) = entry.config_item.as_mut() {
                    item.status_format = item
                        .status_format
                        .as_deref()
                        .map(|format| rename_first_key(format, new));
                }
            });
        }
    }
}

/// Rename the first key of a JSON object string, keeping it first and the
/// other keys in their written order. Unparseable input is kept.
fn rename_first_key(format: &str, new_key: &str) -> String {
    let Ok(Value::Object(map)) = serde_json::from_str::<Value>(format) else {
        return format.to_owned();
    };
    let mut entries = map.into_iter();
    let Some((_, first)) = entries.next() else {
        return format.to_owned();
    };
    let mut renamed = serde_json::Map::new();
    renamed.insert(new_key.to_owned(), first);
    for (key, value) in entries {
        if key != new_key {
            renamed.insert(key, value);
        }
    }
    Value::Object(renamed).to_string()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::descriptor::ConfigItem;
    use serde_json::json;

    fn thermostat() -> DeviceRecord {
        let record = DeviceRecord::new("dev1");
        record.insert_strategy_entry(7, StrategyEntry::new("temp").with_alias("temperature"));
        record.insert_strategy_entry(1, StrategyEntry::new("switch"));
        record
    }

    #[test]
    fn strategy_writes_invalidate_without_rebuilding() {
        let record = thermostat();
        assert_eq!(record.strategy_version(), 2);
        assert_eq!(record.cache_version(), None);

        assert_eq!(record.id_for("temperature"), Some(7));
        assert_eq!(record.cache_version(), Some(2));

        record.insert_strategy_entry(9, StrategyEntry::new("humidity"));
        record.remove_strategy_entry(1);
        assert_eq!(record.strategy_version(), 4);
        assert_eq!(record.cache_version(), Some(2));
    }

    #[test]
    fn lookups_follow_latest_strategy_contents() {
        let record = thermostat();
        assert_eq!(record.code_for(1).as_deref(), Some("switch"));

        record.remove_strategy_entry(1);
        assert_eq!(record.code_for(1), None);

        record.update_strategy_entry(7, |e| e.aliases.push("t".into()));
        assert_eq!(record.id_for("t"), Some(7));

        record.clear_strategy();
        assert_eq!(record.id_for("temp"), None);
    }

    #[test]
    fn code_for_returns_canonical_code() {
        let record = thermostat();
        assert_eq!(record.code_for(7).as_deref(), Some("temp"));
        assert_eq!(record.id_for("temp"), Some(7));
    }

    #[test]
    fn resolve_id_prefers_status_range() {
        let record = thermostat();
        let mut ranges = BTreeMap::new();
        ranges.insert(
            "temp".to_owned(),
            StatusRange {
                code: "temp".into(),
                dp_id: 12,
                ..Default::default()
            },
        );
        record.set(DeviceUpdate::StatusRanges(ranges));
        assert_eq!(record.resolve_id("temp"), Some(12));
        assert_eq!(record.resolve_id("switch"), Some(1));
    }

    #[test]
    fn writes_mirror_to_origin() {
        let origin = Arc::new(DeviceRecord::new("dev1"));
        let derived = DeviceRecord::derive_from(&origin, "local", Some(10), true);

        derived.set(DeviceUpdate::Name("Kitchen".into()));
        assert_eq!(origin.name(), "Kitchen");

        derived.set(DeviceUpdate::Source("elsewhere".into()));
        assert_eq!(origin.source(), "");
    }

    #[test]
    fn derived_without_sync_is_independent() {
        let origin = Arc::new(DeviceRecord::new("dev1"));
        let derived = DeviceRecord::derive_from(&origin, "local", None, false);
        derived.set(DeviceUpdate::Online(true));
        assert!(!origin.online());
        assert!(derived.origin().is_none());
    }

    #[test]
    fn bookkeeping_fields_have_no_settable_value() {
        let record = DeviceRecord::new("dev1");
        assert!(record.get(DeviceField::CodeToId).is_none());
        assert!(record.get(DeviceField::Id).is_none());
    }

    #[test]
    fn first_key_rename_follows_written_order() {
        assert_eq!(
            rename_first_key(r#"{"zeta":"$","alpha":1}"#, "new"),
            r#"{"new":"$","alpha":1}"#
        );
        assert_eq!(
            rename_first_key(r#"{"zeta":"$","new":1}"#, "new"),
            r#"{"new":"$"}"#
        );
        assert_eq!(rename_first_key("{}", "new"), "{}");
        assert_eq!(rename_first_key("not json", "new"), "not json");
    }

    #[test]
    fn replace_status_code_demotes_old_code_to_alias() {
        let record = DeviceRecord::new("dev1");
        record.insert_strategy_entry(
            3,
            StrategyEntry {
                status_code: Some("va_temperature".into()),
                aliases: vec!["temp_current".into()],
                config_item: Some(ConfigItem {
                    status_format: Some(r#"{"va_temperature":"$"}"#.into()),
                    ..Default::default()
                }),
            },
        );
        record.set_status_value("va_temperature", json!(215));

        record.replace_status_code("va_temperature", "temp_current");

        let entry = record.local_strategy().remove(&3).unwrap();
        assert_eq!(entry.canonical(), Some("temp_current"));
        assert_eq!(entry.aliases, vec!["va_temperature".to_owned()]);
        assert_eq!(
            entry.config_item.unwrap().status_format.as_deref(),
            Some(r#"{"temp_current":"$"}"#)
        );
        assert_eq!(record.status_value("temp_current"), Some(json!(215)));
        assert_eq!(record.code_for(3).as_deref(), Some("temp_current"));
        assert_eq!(
            record.all_status_code_aliases().get("va_temperature").map(String::as_str),
            Some("temp_current")
        );
    }
}
