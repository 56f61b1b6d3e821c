// ── Hub configuration ──
//
// Runtime settings for a `DeviceHub`. Built by the host (or by
// `unifold-config` from a TOML file); this crate never reads disk.

use serde::{Deserialize, Serialize};

/// Settings for one [`DeviceHub`](crate::DeviceHub).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Cap on sources refreshed at once. `None` refreshes all together.
    pub max_concurrency: Option<usize>,
    /// How many times the correction pass runs over each merged record.
    pub correction_passes: usize,
    /// Devices whose traffic is logged at warn level.
    pub watched_devices: Vec<String>,
    /// Reject status items whose code cannot be resolved.
    pub require_code: bool,
    /// Reject status items whose numeric id cannot be resolved.
    pub require_id: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            max_concurrency: None,
            correction_passes: 2,
            watched_devices: Vec::new(),
            require_code: true,
            require_id: true,
        }
    }
}
