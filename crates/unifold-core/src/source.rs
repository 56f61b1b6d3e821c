// ── Source adapter seams ──
//
// What the hub needs from each account or gateway, and from the external
// multi-source status aggregator.

use std::sync::Arc;

use serde_json::Value;

use crate::error::SourceError;
use crate::model::{DeviceRecord, DeviceUpdate};
use crate::store::DeviceMap;

/// One account or gateway producing its own device records and events.
///
/// `refresh` runs on a worker thread alongside the other sources and must
/// only touch this adapter's own maps.
pub trait SourceAdapter: Send + Sync {
    /// Unique source tag, used to route messages and tag records.
    fn name(&self) -> &str;

    /// Repopulate this adapter's device maps.
    fn refresh(&self) -> Result<(), SourceError>;

    /// Every map this adapter maintains, in priority-independent order.
    fn available_device_maps(&self) -> Vec<DeviceMap>;

    /// Bring a freshly refreshed record into unified shape.
    ///
    /// The default tags untagged records with this source's name and the
    /// map's priority, and keeps the record in place.
    fn to_unified_record(
        &self,
        record: Arc<DeviceRecord>,
        priority: Option<i32>,
    ) -> Arc<DeviceRecord> {
        if record.source().is_empty() {
            record.set(DeviceUpdate::Source(self.name().to_owned()));
        }
        if record.source_priority().is_none() && priority.is_some() {
            record.set(DeviceUpdate::SourcePriority(priority));
        }
        record
    }

    /// A routed, normalized inbound message addressed to this source.
    fn on_message(&self, payload: &Value);

    /// Release whatever the adapter holds. Called once on shutdown.
    fn unload(&self) {}
}

/// External collector of per-source status reports.
pub trait StatusAggregator: Send + Sync {
    fn register_status_list(&self, device_id: &str, source: &str, status: &[Value]);
}
