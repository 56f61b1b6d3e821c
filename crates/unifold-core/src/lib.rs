//! Multi-source device state unification.
//!
//! Several independent sources (cloud accounts, local gateways) report
//! the same physical devices. This crate folds those reports into one
//! merged record per device and keeps every view of a device in step:
//!
//! - **[`DeviceHub`]** — Orchestrates the refresh cycle:
//!   [`refresh_all()`](DeviceHub::refresh_all) refreshes every
//!   [`SourceAdapter`] in parallel through the [`JobRunner`], rebuilds the
//!   master map, merges duplicates, runs the correction pass, realigns all
//!   registered maps and releases buffered messages.
//!
//! - **[`DeviceRecord`]** — One device as seen by one source. Fields are
//!   only written through [`DeviceRecord::set`], which mirrors the write to
//!   an origin record and broadcasts it to every registered map holding the
//!   same device id. The code <-> numeric id lookups are rebuilt lazily when
//!   the strategy table has changed since the last read.
//!
//! - **[`DeviceMap`] / [`MapRegistry`]** — Device maps keyed by id, and the
//!   set of maps taking part in cross-map propagation.
//!
//! - **[`EventRouter`]** — Buffers inbound messages until the first cycle
//!   completes, then extracts device ids, normalizes payloads, reports
//!   status lists to a [`StatusAggregator`] and forwards to the owning
//!   source. Also resolves raw status items to canonical code / id pairs.

pub mod config;
pub mod convert;
pub mod error;
pub mod fixes;
pub mod hub;
pub mod merge;
pub mod model;
pub mod router;
pub mod runner;
pub mod source;
pub mod store;
pub mod watcher;

mod sync;

// ── Primary re-exports ──────────────────────────────────────────────
pub use config::HubConfig;
pub use convert::{RawCapability, RawDevice, RawStatusRange};
pub use error::{CoreError, SourceError};
pub use hub::{DeviceHub, HubBuilder};
pub use router::{
    Dispatch, EventRouter, PROTOCOL_DEVICE_REPORT, PROTOCOL_OTHER, PendingMessage,
    ResolvedStatus, RouterPhase,
};
pub use runner::JobRunner;
pub use source::{SourceAdapter, StatusAggregator};
pub use store::{DeviceMap, MapRegistry};
pub use watcher::DeviceWatcher;

pub use model::{
    Capability, ConfigItem, DeviceField, DeviceRecord, DeviceUpdate, EXCLUDED_FROM_SYNC,
    StatusMap, StatusRange, StrategyEntry, StrategyTable,
};
