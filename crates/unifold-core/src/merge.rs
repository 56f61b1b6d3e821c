// ── Device merger ──
//
// Folds every per-source record of a device into the master record, one
// pair at a time in source order. The record with the higher source
// priority wins each field; a missing priority loses to any set one and
// ties keep the accumulated value. Collections are unioned with the
// winner taking precedence on shared keys.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::model::record::DeviceState;
use crate::model::{DeviceRecord, DeviceUpdate, StrategyTable};
use crate::store::DeviceMap;

/// Merge every record sharing an id with a master record into it.
///
/// `sources` are visited in order; the master record itself is skipped if
/// one of the source maps shares it.
pub fn merge_all(master: &DeviceMap, sources: &[DeviceMap]) {
    let mut merged = 0usize;
    for record in master.records() {
        let peers: Vec<Arc<DeviceRecord>> = sources
            .iter()
            .filter_map(|map| map.get(record.id()))
            .filter(|peer| !Arc::ptr_eq(peer, &record))
            .collect();
        if peers.is_empty() {
            continue;
        }

        let mut fold = FoldState::start(&record);
        for peer in &peers {
            fold = merge_pair(&record, fold, peer);
        }
        merged += 1;
        debug!(
            device_id = %record.id(),
            contributors = peers.len() + 1,
            effective_priority = ?fold.priority,
            frozen = fold.locked || fold.frozen_at.is_some(),
            "merged device"
        );
    }
    debug!(merged, total = master.len(), "device merge complete");
}

/// Running state of one device's fold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FoldState {
    /// Highest priority merged so far.
    pub priority: Option<i32>,
    /// The accumulator itself carried `force_compatibility` before the fold.
    pub locked: bool,
    /// Priority of the highest-ranked peer carrying `force_compatibility`.
    pub frozen_at: Option<Option<i32>>,
}

impl FoldState {
    /// Fold state for `acc` before any peer is merged into it.
    pub fn start(acc: &DeviceRecord) -> Self {
        Self {
            priority: acc.source_priority(),
            locked: acc.force_compatibility(),
            frozen_at: None,
        }
    }

    /// Functional fields stay put if the accumulator was frozen to begin
    /// with, if `next` wins while frozen, or if a frozen peer ranks at
    /// least as high as `next`.
    fn freezes(self, next_priority: Option<i32>, next_wins: bool, next_frozen: bool) -> bool {
        self.locked
            || (next_wins && next_frozen)
            || self.frozen_at.is_some_and(|at| at >= next_priority)
    }
}

/// Merge `next` into `acc` and return the fold state after the merge.
pub fn merge_pair(acc: &DeviceRecord, fold: FoldState, next: &DeviceRecord) -> FoldState {
    let next_priority = next.source_priority();
    let next_wins = next_priority > fold.priority;

    let current = acc.state();
    let other = next.state();
    let (winner, loser) = if next_wins {
        (&other, &current)
    } else {
        (&current, &other)
    };

    let mut updates = vec![
        DeviceUpdate::Name(prefer_non_empty(&winner.name, &loser.name)),
        DeviceUpdate::Category(prefer_non_empty(&winner.category, &loser.category)),
        DeviceUpdate::ProductId(prefer_non_empty(&winner.product_id, &loser.product_id)),
        DeviceUpdate::ProductName(prefer_non_empty(&winner.product_name, &loser.product_name)),
        DeviceUpdate::Online(winner.online),
        DeviceUpdate::OnlineStates(union(&winner.online_states, &loser.online_states)),
        DeviceUpdate::Status(union(&winner.status, &loser.status)),
        DeviceUpdate::Preferences(merge_preferences(&winner.preferences, &loser.preferences)),
        DeviceUpdate::ForceCompatibility(current.force_compatibility || other.force_compatibility),
    ];

    if !fold.freezes(next_priority, next_wins, other.force_compatibility) {
        updates.extend(functional_updates(winner, loser));
    }

    for update in updates {
        acc.set_if_changed(update);
    }

    FoldState {
        priority: fold.priority.max(next_priority),
        locked: fold.locked,
        frozen_at: if other.force_compatibility {
            fold.frozen_at.max(Some(next_priority))
        } else {
            fold.frozen_at
        },
    }
}

fn functional_updates(winner: &DeviceState, loser: &DeviceState) -> [DeviceUpdate; 3] {
    [
        DeviceUpdate::Capabilities(union(&winner.capabilities, &loser.capabilities)),
        DeviceUpdate::StatusRanges(union(&winner.status_ranges, &loser.status_ranges)),
        DeviceUpdate::LocalStrategy(merge_strategy(&winner.local_strategy, &loser.local_strategy)),
    ]
}

fn prefer_non_empty(winner: &str, loser: &str) -> String {
    if winner.is_empty() { loser } else { winner }.to_owned()
}

fn union<K: Ord + Clone, V: Clone>(winner: &BTreeMap<K, V>, loser: &BTreeMap<K, V>) -> BTreeMap<K, V> {
    let mut out = loser.clone();
    out.extend(winner.iter().map(|(k, v)| (k.clone(), v.clone())));
    out
}

/// Union of two strategy tables. Shared ids keep the winner's entry with
/// the aliases of both.
fn merge_strategy(winner: &StrategyTable, loser: &StrategyTable) -> StrategyTable {
    let mut out = loser.clone();
    for (&id, entry) in winner {
        let mut entry = entry.clone();
        if let Some(previous) = out.get(&id) {
            if entry.canonical().is_none() {
                entry.status_code.clone_from(&previous.status_code);
            }
            if entry.config_item.is_none() {
                entry.config_item.clone_from(&previous.config_item);
            }
            for alias in &previous.aliases {
                if !entry.answers_to(alias) {
                    entry.aliases.push(alias.clone());
                }
            }
        }
        out.insert(id, entry);
    }
    out
}

fn merge_preferences(
    winner: &BTreeMap<String, Value>,
    loser: &BTreeMap<String, Value>,
) -> BTreeMap<String, Value> {
    let mut out = loser.clone();
    for (key, value) in winner {
        let merged = match out.get(key) {
            Some(previous) => smart_merge(value, previous),
            None => value.clone(),
        };
        out.insert(key.clone(), merged);
    }
    out
}

/// Merge two JSON values: objects key-wise, arrays as an ordered union,
/// anything else taken from `winner`.
pub fn smart_merge(winner: &Value, loser: &Value) -> Value {
    match (winner, loser) {
        (Value::Object(w), Value::Object(l)) => {
            let mut out = l.clone();
            for (key, value) in w {
                let merged = match out.get(key) {
                    Some(previous) => smart_merge(value, previous),
                    None => value.clone(),
                };
                out.insert(key.clone(), merged);
            }
            Value::Object(out)
        }
        (Value::Array(w), Value::Array(l)) => {
            let mut out = l.clone();
            for item in w {
                if !out.contains(item) {
                    out.push(item.clone());
                }
            }
            Value::Array(out)
        }
        (Value::Null, other) => other.clone(),
        (value, _) => value.clone(),
    }
}
