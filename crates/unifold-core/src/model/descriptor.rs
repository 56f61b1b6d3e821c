// ── Capability, status-range and strategy descriptors ──

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Current status values keyed by status code.
pub type StatusMap = BTreeMap<String, serde_json::Value>;

/// Strategy table keyed by numeric id.
pub type StrategyTable = BTreeMap<u32, StrategyEntry>;

/// A writable function a device exposes (value type and range).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Capability {
    pub code: String,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub desc: String,
    pub name: String,
    /// JSON-encoded value constraints, `"{}"` when unknown.
    pub values: String,
    /// Numeric id, `0` when unknown.
    pub dp_id: u32,
}

impl Default for Capability {
    fn default() -> Self {
        Self {
            code: String::new(),
            kind: None,
            desc: String::new(),
            name: String::new(),
            values: "{}".into(),
            dp_id: 0,
        }
    }
}

/// Value range of a reported status code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusRange {
    pub code: String,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub values: String,
    pub dp_id: u32,
}

impl Default for StatusRange {
    fn default() -> Self {
        Self {
            code: String::new(),
            kind: None,
            values: "{}".into(),
            dp_id: 0,
        }
    }
}

impl From<&Capability> for StatusRange {
    fn from(cap: &Capability) -> Self {
        Self {
            code: cap.code.clone(),
            kind: cap.kind.clone(),
            values: cap.values.clone(),
            dp_id: cap.dp_id,
        }
    }
}

/// Formatting metadata attached to a strategy entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigItem {
    /// JSON object whose first key is the status code, e.g. `{"switch":"$"}`.
    #[serde(default)]
    pub status_format: Option<String>,
    #[serde(default)]
    pub value_type: Option<String>,
    #[serde(default)]
    pub value_desc: Option<String>,
}

/// One numeric id's entry in the strategy table.
///
/// The schema is flat on purpose: entries are replaced as a whole through
/// [`DeviceRecord`](super::DeviceRecord) so the lookup cache sees every change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyEntry {
    #[serde(default)]
    pub status_code: Option<String>,
    #[serde(default, rename = "status_code_alias")]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub config_item: Option<ConfigItem>,
}

impl StrategyEntry {
    pub fn new(status_code: impl Into<String>) -> Self {
        Self {
            status_code: Some(status_code.into()),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        let alias = alias.into();
        if !self.aliases.contains(&alias) {
            self.aliases.push(alias);
        }
        self
    }

    /// Canonical code, ignoring empty strings.
    pub fn canonical(&self) -> Option<&str> {
        self.status_code.as_deref().filter(|c| !c.is_empty())
    }

    /// Whether `code` is the canonical code or one of the aliases.
    pub fn answers_to(&self, code: &str) -> bool {
        self.canonical() == Some(code) || self.aliases.iter().any(|a| a == code)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn strategy_entry_parses_vendor_shape() {
        let entry: StrategyEntry = serde_json::from_value(serde_json::json!({
            "status_code": "temp",
            "status_code_alias": ["temperature"],
            "config_item": { "statusFormat": "{\"temp\":\"$\"}", "valueType": "Integer" }
        }))
        .unwrap();

        assert_eq!(entry.canonical(), Some("temp"));
        assert!(entry.answers_to("temperature"));
        assert_eq!(
            entry.config_item.unwrap().value_type.as_deref(),
            Some("Integer")
        );
    }

    #[test]
    fn empty_canonical_code_is_ignored() {
        let entry = StrategyEntry {
            status_code: Some(String::new()),
            ..Default::default()
        };
        assert_eq!(entry.canonical(), None);
    }

    #[test]
    fn with_alias_does_not_duplicate() {
        let entry = StrategyEntry::new("a").with_alias("b").with_alias("b");
        assert_eq!(entry.aliases, vec!["b".to_owned()]);
    }
}
