// ── Domain model ──
//
// The unified device record and the descriptor types it carries.

pub mod descriptor;
pub mod field;
pub mod record;

pub use descriptor::{Capability, ConfigItem, StatusMap, StatusRange, StrategyEntry, StrategyTable};
pub use field::{DeviceField, DeviceUpdate, EXCLUDED_FROM_SYNC};
pub use record::DeviceRecord;
