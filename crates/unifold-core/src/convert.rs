// ── Raw-to-unified record conversion ──
//
// Sources hand over loosely shaped device records where any field may be
// missing. `RawDevice` captures that shape with every field optional;
// `DeviceRecord::from_raw` fills defined defaults.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::Value;

use crate::error::CoreError;
use crate::model::record::DeviceState;
use crate::model::{Capability, DeviceRecord, StatusRange, StrategyEntry};

// ── Helpers ────────────────────────────────────────────────────────

/// Range constraints arrive either as a JSON string or as an inline object.
fn values_to_string(values: Option<Value>) -> String {
    match values {
        Some(Value::String(s)) if !s.is_empty() => s,
        Some(Value::Null | Value::String(_)) | None => "{}".into(),
        Some(other) => other.to_string(),
    }
}

// ── Raw shapes ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawCapability {
    pub code: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub desc: Option<String>,
    pub name: Option<String>,
    pub values: Option<Value>,
    #[serde(alias = "dpId")]
    pub dp_id: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawStatusRange {
    pub code: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub values: Option<Value>,
    #[serde(alias = "dpId")]
    pub dp_id: Option<u32>,
}

/// A device record as a source reports it.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawDevice {
    pub id: Option<String>,
    pub name: Option<String>,
    pub category: Option<String>,
    pub product_id: Option<String>,
    pub product_name: Option<String>,
    pub online: Option<bool>,
    pub status: Option<BTreeMap<String, Value>>,
    #[serde(alias = "function")]
    pub capabilities: Option<BTreeMap<String, RawCapability>>,
    #[serde(alias = "status_range")]
    pub status_ranges: Option<BTreeMap<String, RawStatusRange>>,
    pub local_strategy: Option<BTreeMap<u32, StrategyEntry>>,
    pub force_compatibility: Option<bool>,
    pub preferences: Option<BTreeMap<String, Value>>,
}

impl RawCapability {
    fn into_capability(self, key: &str) -> Capability {
        Capability {
            code: self.code.unwrap_or_else(|| key.to_owned()),
            kind: self.kind,
            desc: self.desc.unwrap_or_default(),
            name: self.name.unwrap_or_default(),
            values: values_to_string(self.values),
            dp_id: self.dp_id.unwrap_or(0),
        }
    }
}

impl RawStatusRange {
    fn into_status_range(self, key: &str) -> StatusRange {
        StatusRange {
            code: self.code.unwrap_or_else(|| key.to_owned()),
            kind: self.kind,
            values: values_to_string(self.values),
            dp_id: self.dp_id.unwrap_or(0),
        }
    }
}

impl DeviceRecord {
    /// Build a record from a source's raw shape, tagged with `source`.
    pub fn from_raw(
        raw: RawDevice,
        source: impl Into<String>,
        source_priority: Option<i32>,
    ) -> Result<DeviceRecord, CoreError> {
        let id = raw
            .id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| CoreError::MalformedPayload {
                message: "device record without id".into(),
            })?;

        let capabilities = raw
            .capabilities
            .unwrap_or_default()
            .into_iter()
            .map(|(code, cap)| {
                let cap = cap.into_capability(&code);
                (code, cap)
            })
            .collect();
        let status_ranges = raw
            .status_ranges
            .unwrap_or_default()
            .into_iter()
            .map(|(code, range)| {
                let range = range.into_status_range(&code);
                (code, range)
            })
            .collect();

        let mut state = DeviceState {
            name: raw.name.unwrap_or_default(),
            category: raw.category.unwrap_or_default(),
            product_id: raw.product_id.unwrap_or_default(),
            product_name: raw.product_name.unwrap_or_default(),
            online: raw.online.unwrap_or(false),
            online_states: BTreeMap::new(),
            status: raw.status.unwrap_or_default(),
            capabilities,
            status_ranges,
            local_strategy: raw.local_strategy.unwrap_or_default(),
            force_compatibility: raw.force_compatibility.unwrap_or(false),
            preferences: raw.preferences.unwrap_or_default(),
            source: source.into(),
            source_priority,
            strategy_version: 0,
        };
        if !state.source.is_empty() {
            state.online_states.insert(state.source.clone(), state.online);
        }
        Ok(DeviceRecord::with_state(id, state))
    }
}
