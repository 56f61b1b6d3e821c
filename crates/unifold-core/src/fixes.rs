// ── Post-merge correction pass ──
//
// Value-shape fixes applied to each merged record. The steps are order
// dependent: entries created late in one run feed ids into early steps of
// the next, so the hub runs the pass twice. A third run changes nothing.

use std::collections::{BTreeMap, HashMap};

use serde_json::Value;
use tracing::debug;

use crate::model::{
    ConfigItem, DeviceRecord, DeviceUpdate, StatusRange, StrategyEntry, StrategyTable,
};

/// Run every correction step once. Returns `true` if the record changed.
pub fn apply_fixes(record: &DeviceRecord) -> bool {
    let state = record.state();
    let mut ranges = state.status_ranges;
    let mut caps = state.capabilities;
    let mut status = state.status;
    let mut strategy = state.local_strategy;

    // (a) zero ids on ranges and capabilities, from the strategy table
    let ids = code_index(&strategy);
    for range in ranges.values_mut().filter(|r| r.dp_id == 0) {
        if let Some(&id) = ids.get(range.code.as_str()) {
            range.dp_id = id;
        }
    }
    for cap in caps.values_mut().filter(|c| c.dp_id == 0) {
        if let Some(&id) = ids.get(cap.code.as_str()) {
            cap.dp_id = id;
        }
    }

    // (b) alias-keyed values move to their canonical code
    let aliases = alias_index(&strategy);
    let renames: Vec<(String, String)> = status
        .keys()
        .filter_map(|code| aliases.get(code).map(|canon| (code.clone(), canon.clone())))
        .collect();
    for (alias, canonical) in renames {
        if let Some(value) = status.remove(&alias) {
            status.entry(canonical).or_insert(value);
        }
    }

    // (c) reported codes without a range borrow the capability's shape
    for code in status.keys() {
        if !ranges.contains_key(code) {
            if let Some(cap) = caps.get(code) {
                ranges.insert(code.clone(), StatusRange::from(cap));
            }
        }
    }

    // (d) ranges carrying an id the table lacks get an entry
    for range in ranges.values().filter(|r| r.dp_id != 0) {
        strategy.entry(range.dp_id).or_insert_with(|| StrategyEntry {
            status_code: Some(range.code.clone()),
            aliases: Vec::new(),
            config_item: Some(ConfigItem {
                status_format: Some(status_format(&range.code)),
                value_type: range.kind.clone(),
                value_desc: Some(range.values.clone()),
            }),
        });
    }

    // (e) value shapes by range type
    for (code, value) in &mut status {
        let kind = ranges.get(code).and_then(|r| r.kind.as_deref());
        if let Some(coerced) = coerce(kind, value) {
            *value = coerced;
        }
    }

    let updates = [
        DeviceUpdate::StatusRanges(ranges),
        DeviceUpdate::Capabilities(caps),
        DeviceUpdate::Status(status),
        DeviceUpdate::LocalStrategy(strategy),
    ];
    let mut changed = false;
    for update in updates {
        changed |= record.set_if_changed(update);
    }
    if changed {
        debug!(device_id = %record.id(), "applied corrections");
    }
    changed
}

/// `{"<code>":"$"}`
fn status_format(code: &str) -> String {
    let mut format = serde_json::Map::new();
    format.insert(code.to_owned(), Value::from("$"));
    Value::Object(format).to_string()
}

fn code_index(table: &StrategyTable) -> HashMap<&str, u32> {
    let mut index = HashMap::new();
    for (&id, entry) in table {
        if let Some(code) = entry.canonical() {
            index.insert(code, id);
            for alias in &entry.aliases {
                index.insert(alias.as_str(), id);
            }
        }
    }
    index
}

fn alias_index(table: &StrategyTable) -> BTreeMap<String, String> {
    let mut index = BTreeMap::new();
    for entry in table.values() {
        if let Some(code) = entry.canonical() {
            for alias in entry.aliases.iter().filter(|a| a.as_str() != code) {
                index.insert(alias.clone(), code.to_owned());
            }
        }
    }
    index
}

fn coerce(kind: Option<&str>, value: &Value) -> Option<Value> {
    let Value::String(raw) = value else {
        return None;
    };
    match kind? {
        "Boolean" | "bool" => match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "1" => Some(Value::Bool(true)),
            "false" | "0" => Some(Value::Bool(false)),
            _ => None,
        },
        "Integer" | "value" => raw.trim().parse::<i64>().ok().map(Value::from),
        _ => None,
    }
}
