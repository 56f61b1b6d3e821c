// ── Inbound event router ──
//
// Buffers inbound messages until the first refresh cycle has built the
// master map, then routes each one: find the device id, normalize the
// payload shape, hand status reports to the aggregator, and forward the
// message to the adapter that owns its source.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use indexmap::IndexMap;
use serde_json::Value;
use strum::Display;
use tracing::{debug, info, warn};

use crate::error::CoreError;
use crate::source::{SourceAdapter, StatusAggregator};
use crate::store::DeviceMap;
use crate::sync::lock;
use crate::watcher::DeviceWatcher;

/// Protocol marker for "device reported new state".
pub const PROTOCOL_DEVICE_REPORT: i64 = 4;
/// Protocol marker for miscellaneous business events.
pub const PROTOCOL_OTHER: i64 = 20;

pub(crate) type SourceTable = IndexMap<String, Arc<dyn SourceAdapter>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum RouterPhase {
    Buffering,
    Live,
}

/// What happened to one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Queued until the router goes live.
    Buffered,
    /// Delivered to the owning adapter.
    Forwarded,
    /// Routed, but no adapter is registered under the source tag.
    NoAdapter,
    /// No device id could be found.
    Dropped,
}

/// A message held back while the router is buffering.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingMessage {
    pub source: String,
    pub payload: Value,
}

/// One status item after code / numeric id resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedStatus {
    pub code: Option<String>,
    pub dp_id: Option<u32>,
    pub value: Value,
}

#[derive(Debug)]
struct RouterState {
    phase: RouterPhase,
    pending: VecDeque<PendingMessage>,
}

pub struct EventRouter {
    state: Mutex<RouterState>,
    master: DeviceMap,
    sources: Arc<SourceTable>,
    aggregator: Option<Arc<dyn StatusAggregator>>,
    watcher: DeviceWatcher,
}

impl std::fmt::Debug for EventRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRouter")
            .field("phase", &self.phase())
            .field("pending", &self.pending_len())
            .field("sources", &self.sources.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl EventRouter {
    pub(crate) fn new(
        master: DeviceMap,
        sources: Arc<SourceTable>,
        aggregator: Option<Arc<dyn StatusAggregator>>,
        watcher: DeviceWatcher,
    ) -> Self {
        Self {
            state: Mutex::new(RouterState {
                phase: RouterPhase::Buffering,
                pending: VecDeque::new(),
            }),
            master,
            sources,
            aggregator,
            watcher,
        }
    }

    pub fn phase(&self) -> RouterPhase {
        lock(&self.state).phase
    }

    pub fn pending_len(&self) -> usize {
        lock(&self.state).pending.len()
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Hold back messages until the next [`go_live`](Self::go_live).
    pub fn begin_buffering(&self) {
        lock(&self.state).phase = RouterPhase::Buffering;
    }

    /// Replay every held message in arrival order, then route live.
    ///
    /// Messages arriving during the replay are queued behind it, so nothing
    /// overtakes an older message. Returns how many were replayed.
    pub fn go_live(&self) -> usize {
        let mut replayed = 0;
        loop {
            let batch: Vec<PendingMessage> = {
                let mut state = lock(&self.state);
                if state.pending.is_empty() {
                    state.phase = RouterPhase::Live;
                    break;
                }
                state.pending.drain(..).collect()
            };
            for message in batch {
                self.route(&message.source, message.payload);
                replayed += 1;
            }
        }
        info!(replayed, "event router live");
        replayed
    }

    // ── Routing ──────────────────────────────────────────────────────

    pub fn on_message(&self, source: &str, payload: Value) -> Dispatch {
        {
            let mut state = lock(&self.state);
            if state.phase == RouterPhase::Buffering {
                state.pending.push_back(PendingMessage {
                    source: source.to_owned(),
                    payload,
                });
                return Dispatch::Buffered;
            }
        }
        self.route(source, payload)
    }

    fn route(&self, source: &str, payload: Value) -> Dispatch {
        let Some(device_id) = extract_device_id(&payload) else {
            warn!(source, "no device id in message, dropping");
            return Dispatch::Dropped;
        };

        let message = normalize(payload);
        self.watcher.report(&self.master, &device_id, || {
            format!("on_message ({source}): {message}")
        });

        if let Some(status) = status_list(&message) {
            self.watcher
                .report(&self.master, &device_id, || format!("status report ({source})"));
            if let Some(aggregator) = &self.aggregator {
                aggregator.register_status_list(&device_id, source, status);
            }
        }

        match self.sources.get(source) {
            Some(adapter) => {
                adapter.on_message(&message);
                Dispatch::Forwarded
            }
            None => {
                debug!(source, device_id = %device_id, "no adapter for source");
                Dispatch::NoAdapter
            }
        }
    }

    // ── Status resolution ────────────────────────────────────────────

    /// Fill in the missing half of a status item's code / numeric id pair.
    ///
    /// A code reached through a numeric id is always the canonical one. When
    /// neither half is present, numeric keys of the item are tried in order
    /// and the first id the device knows is taken with its value.
    pub fn resolve_status_item(
        &self,
        device_id: &str,
        item: &Value,
        require_code: bool,
        require_id: bool,
    ) -> Result<ResolvedStatus, CoreError> {
        let value = item.get("value").cloned().unwrap_or(Value::Null);
        let Some(record) = self.master.get(device_id) else {
            if require_code || require_id {
                return Err(CoreError::DeviceNotFound {
                    identifier: device_id.to_owned(),
                });
            }
            return Ok(ResolvedStatus {
                code: None,
                dp_id: None,
                value,
            });
        };

        let mut resolved = ResolvedStatus {
            code: item.get("code").and_then(Value::as_str).map(str::to_owned),
            dp_id: item
                .get("dpId")
                .and_then(Value::as_u64)
                .and_then(|id| u32::try_from(id).ok()),
            value,
        };

        if resolved.code.is_none() {
            resolved.code = resolved.dp_id.and_then(|id| record.code_for(id));
        } else if resolved.dp_id.is_none() {
            resolved.dp_id = resolved.code.as_deref().and_then(|c| record.resolve_id(c));
        }
        if let Some(id) = resolved.dp_id {
            if let Some(canonical) = record.code_for(id) {
                resolved.code = Some(canonical);
            }
        }

        if resolved.code.is_none() && resolved.dp_id.is_none() {
            if let Some(fields) = item.as_object() {
                let hit = fields.iter().find_map(|(key, value)| {
                    let id = key.parse::<u32>().ok()?;
                    record.code_for(id).map(|code| (code, id, value.clone()))
                });
                if let Some((code, id, value)) = hit {
                    resolved = ResolvedStatus {
                        code: Some(code),
                        dp_id: Some(id),
                        value,
                    };
                }
            }
        }

        let missing = match (&resolved.code, resolved.dp_id) {
            (None, _) if require_code => Some("code"),
            (_, None) if require_id => Some("dpId"),
            _ => None,
        };
        if let Some(missing) = missing {
            return Err(CoreError::Unresolved {
                device_id: device_id.to_owned(),
                missing: missing.to_owned(),
            });
        }

        self.watcher.report(&self.master, device_id, || {
            format!("resolved {:?} -> {:?}", resolved.code, resolved.dp_id)
        });
        Ok(resolved)
    }

    /// Resolve every item independently. Rejected items are logged and left out.
    pub fn resolve_status_list(
        &self,
        device_id: &str,
        items: &[Value],
        require_code: bool,
        require_id: bool,
    ) -> Vec<Value> {
        items
            .iter()
            .filter_map(|item| {
                match self.resolve_status_item(device_id, item, require_code, require_id) {
                    Ok(resolved) => Some(resolved_item(item, resolved)),
                    Err(e) => {
                        warn!(device_id, error = %e, "dropping status item");
                        None
                    }
                }
            })
            .collect()
    }
}

fn resolved_item(item: &Value, resolved: ResolvedStatus) -> Value {
    let mut out = item.as_object().cloned().unwrap_or_default();
    out.insert(
        "code".into(),
        resolved.code.map_or(Value::Null, Value::String),
    );
    out.insert(
        "dpId".into(),
        resolved.dp_id.map_or(Value::Null, Value::from),
    );
    out.insert("value".into(), resolved.value);
    Value::Object(out)
}

// ── Payload shape helpers ──────────────────────────────────────────

fn protocol(payload: &Value) -> i64 {
    payload
        .get("protocol")
        .and_then(Value::as_i64)
        .unwrap_or(0)
}

fn non_empty_str(value: Option<&Value>) -> Option<&str> {
    value.and_then(Value::as_str).filter(|s| !s.is_empty())
}

/// Device id from `data.devId`, or from `data.bizData.devId` on
/// [`PROTOCOL_OTHER`] messages.
pub fn extract_device_id(payload: &Value) -> Option<String> {
    let data = payload.get("data")?;
    if let Some(id) = non_empty_str(data.get("devId")) {
        return Some(id.to_owned());
    }
    if protocol(payload) == PROTOCOL_OTHER {
        let nested = data.get("bizData").and_then(|biz| biz.get("devId"));
        return non_empty_str(nested).map(str::to_owned);
    }
    None
}

/// Lift `data.bizData.devId` to `data.devId` on [`PROTOCOL_OTHER`]
/// messages whose direct field is missing or empty. Everything else passes through.
pub fn normalize(mut payload: Value) -> Value {
    if protocol(&payload) != PROTOCOL_OTHER {
        return payload;
    }
    let Some(data) = payload.get_mut("data").and_then(Value::as_object_mut) else {
        return payload;
    };
    if non_empty_str(data.get("devId")).is_some() {
        return payload;
    }
    let nested = non_empty_str(data.get("bizData").and_then(|biz| biz.get("devId")))
        .map(str::to_owned);
    if let Some(id) = nested {
        data.insert("devId".into(), Value::String(id));
    }
    payload
}

/// The status list of a [`PROTOCOL_DEVICE_REPORT`] message.
pub fn status_list(payload: &Value) -> Option<&[Value]> {
    if protocol(payload) != PROTOCOL_DEVICE_REPORT {
        return None;
    }
    payload
        .get("data")?
        .get("status")?
        .as_array()
        .map(Vec::as_slice)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::{DeviceRecord, StrategyEntry};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn router_with_thermostat() -> EventRouter {
        let record = DeviceRecord::new("dev1");
        record.insert_strategy_entry(7, StrategyEntry::new("temp").with_alias("temperature"));
        let master = DeviceMap::from_records("master", None, [Arc::new(record)]);
        EventRouter::new(
            master,
            Arc::new(SourceTable::new()),
            None,
            DeviceWatcher::default(),
        )
    }

    #[test]
    fn nested_device_id_is_found_and_lifted() {
        let payload = json!({ "protocol": PROTOCOL_OTHER, "data": { "bizData": { "devId": "dev1" } } });
        assert_eq!(extract_device_id(&payload).as_deref(), Some("dev1"));

        let normalized = normalize(payload);
        assert_eq!(normalized["data"]["devId"], json!("dev1"));
    }

    #[test]
    fn empty_direct_id_gives_way_to_nested_one() {
        let payload = json!({
            "protocol": PROTOCOL_OTHER,
            "data": { "devId": "", "bizData": { "devId": "dev1" } }
        });
        assert_eq!(extract_device_id(&payload).as_deref(), Some("dev1"));
        assert_eq!(normalize(payload)["data"]["devId"], json!("dev1"));
    }

    #[test]
    fn nested_id_only_counts_for_other_protocol() {
        let payload = json!({ "protocol": PROTOCOL_DEVICE_REPORT, "data": { "bizData": { "devId": "dev1" } } });
        assert_eq!(extract_device_id(&payload), None);
        assert_eq!(normalize(payload.clone()), payload);
    }

    #[test]
    fn status_list_requires_device_report() {
        let report = json!({ "protocol": 4, "data": { "devId": "d", "status": [{ "code": "a" }] } });
        assert_eq!(status_list(&report).map(<[Value]>::len), Some(1));
        let other = json!({ "protocol": 20, "data": { "devId": "d", "status": [] } });
        assert!(status_list(&other).is_none());
    }

    #[test]
    fn id_only_item_resolves_to_canonical_code() {
        let router = router_with_thermostat();
        let resolved = router
            .resolve_status_item("dev1", &json!({ "dpId": 7, "value": 21 }), true, true)
            .unwrap();
        assert_eq!(resolved.code.as_deref(), Some("temp"));
        assert_eq!(resolved.dp_id, Some(7));
        assert_eq!(resolved.value, json!(21));
    }

    #[test]
    fn alias_code_is_canonicalized() {
        let router = router_with_thermostat();
        let resolved = router
            .resolve_status_item("dev1", &json!({ "code": "temperature", "value": 19 }), true, true)
            .unwrap();
        assert_eq!(resolved.code.as_deref(), Some("temp"));
        assert_eq!(resolved.dp_id, Some(7));
    }

    #[test]
    fn numeric_keys_are_scanned_as_last_resort() {
        let router = router_with_thermostat();
        let resolved = router
            .resolve_status_item("dev1", &json!({ "t": 1, "3": false, "7": 23 }), true, true)
            .unwrap();
        assert_eq!(resolved.code.as_deref(), Some("temp"));
        assert_eq!(resolved.value, json!(23));
    }

    #[test]
    fn numeric_keys_follow_payload_order() {
        let record = DeviceRecord::new("dev1");
        record.insert_strategy_entry(7, StrategyEntry::new("temp"));
        record.insert_strategy_entry(10, StrategyEntry::new("hum"));
        let router = EventRouter::new(
            DeviceMap::from_records("master", None, [Arc::new(record)]),
            Arc::new(SourceTable::new()),
            None,
            DeviceWatcher::default(),
        );

        let item: Value = serde_json::from_str(r#"{"7": 23, "10": 55}"#).unwrap();
        let resolved = router.resolve_status_item("dev1", &item, true, true).unwrap();
        assert_eq!(resolved.code.as_deref(), Some("temp"));
        assert_eq!(resolved.dp_id, Some(7));
        assert_eq!(resolved.value, json!(23));
    }

    #[test]
    fn required_flags_decide_rejection() {
        let router = router_with_thermostat();
        let item = json!({ "code": "unknown", "value": 1 });

        let err = router.resolve_status_item("dev1", &item, true, true).unwrap_err();
        assert!(matches!(err, CoreError::Unresolved { ref missing, .. } if missing == "dpId"));

        let resolved = router.resolve_status_item("dev1", &item, true, false).unwrap();
        assert_eq!(resolved.code.as_deref(), Some("unknown"));
        assert_eq!(resolved.dp_id, None);
    }

    #[test]
    fn unknown_device_fails_only_when_something_is_required() {
        let router = router_with_thermostat();
        let item = json!({ "dpId": 7, "value": 1 });
        assert!(router.resolve_status_item("ghost", &item, true, false).is_err());
        let passthrough = router.resolve_status_item("ghost", &item, false, false).unwrap();
        assert_eq!(passthrough.code, None);
        assert_eq!(passthrough.value, json!(1));
    }

    #[test]
    fn list_resolution_drops_rejected_items() {
        let router = router_with_thermostat();
        let items = [
            json!({ "dpId": 7, "value": 20 }),
            json!({ "code": "temperature", "value": 21 }),
            json!({ "code": "nope", "value": 0 }),
        ];
        let resolved = router.resolve_status_list("dev1", &items, true, true);
        assert_eq!(
            resolved,
            vec![
                json!({ "code": "temp", "dpId": 7, "value": 20 }),
                json!({ "code": "temp", "dpId": 7, "value": 21 }),
            ]
        );
    }

    #[test]
    fn buffered_messages_replay_in_order() {
        let router = router_with_thermostat();
        assert_eq!(
            router.on_message("cloud", json!({ "data": { "devId": "dev1" } })),
            Dispatch::Buffered
        );
        assert_eq!(router.pending_len(), 1);

        assert_eq!(router.go_live(), 1);
        assert_eq!(router.phase(), RouterPhase::Live);
        assert_eq!(router.pending_len(), 0);
        assert_eq!(
            router.on_message("cloud", json!({ "data": { "devId": "dev1" } })),
            Dispatch::NoAdapter
        );
        assert_eq!(router.on_message("cloud", json!({ "data": {} })), Dispatch::Dropped);
    }
}
